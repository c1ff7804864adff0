//! Link Table patching: rewriting a chunk edge's destination.
//!
//! Reference: `spec.md` "4.4 Link Table & Patching";
//! `btCodeChunk.cpp`'s `releaseAndRetranslate` direct/indirect
//! rebind arms.
//!
//! Open question resolved here (see `DESIGN.md`): the original
//! stores an indirect edge's destination in a data cell embedded
//! in/near the branching chunk's host code, loaded by hand-written
//! host code this crate does not generate. Since the generator here
//! is a black box this crate never emits code for, an indirect edge's
//! "data cell" is modeled as `Link`'s own `to_host_addr` field, which
//! is already an `AtomicUsize` with the required release/acquire
//! discipline — a real code generator would simply emit a load from
//! that field's address instead of an adjacent literal.

use tcg_core::{CacheError, Chunk, ChunkId, Link};

/// Rebind one edge to a new destination chunk/address.
///
/// - Direct edges: patch the 4-byte relative displacement embedded at
///   `link.from_patch_site`, computed as
///   `dest_host - from_patch_site - 4` (`spec.md` 4.4), within a
///   `write_region` scope on the *source* chunk (whose host code
///   contains the patch site).
/// - Indirect edges: an atomic 64-bit store, satisfied by
///   `Link::rebind`'s `Ordering::Release` store.
pub fn rebind(
    link: &Link,
    from_chunk: &Chunk,
    to_chunk: ChunkId,
    dest_host: usize,
) -> Result<(), CacheError> {
    if link.direct {
        let region = from_chunk.region();
        let base = region.addr();
        let site_off = link
            .from_patch_site
            .checked_sub(base)
            .filter(|&off| off + 4 <= region.capacity())
            .ok_or_else(|| {
                CacheError::invariant(format!(
                    "link patch site {:#x} outside source chunk {:#x}..{:#x}",
                    link.from_patch_site,
                    base,
                    base + region.capacity()
                ))
            })?;
        let disp = (dest_host as i64) - (link.from_patch_site as i64) - 4;
        let disp = disp as i32;
        region
            .write_region(site_off, 4, |buf| {
                buf.copy_from_slice(&disp.to_le_bytes());
            })
            .map_err(CacheError::Allocator)?;
    }
    link.rebind(to_chunk, dest_host);
    Ok(())
}
