//! Invalidation & Retranslation Engine.
//!
//! Reference: `spec.md` "4.5 Invalidation & Retranslation Engine";
//! `btCodeChunk.cpp`'s `invalidateStartingAt` and
//! `releaseAndRetranslate`.

use std::sync::Arc;

use tcg_backend::ExecutableMemoryAllocator;
use tcg_core::constants::{GUARD_BYTES, TRAP_FILL};
use tcg_core::{CacheError, Chunk, CodeGenerator};

use crate::eip_map::EipHostMap;
use crate::linker;
use crate::publish;
use crate::registry::ChunkRegistry;

/// Partial invalidation inside a still-valid chunk: the guest wrote
/// into the middle of its own code region. Overwrites host bytes from
/// a computed safe point onward with the trap byte so any subsequent
/// attempt to execute them faults into the retranslate path, without
/// touching the EIP->host map (those slots still point at now-trapped
/// bytes, which is fine: executing them is exactly what should fault).
///
/// `current_guest_pc`, if `Some` and inside this chunk, protects the
/// instruction currently executing (and the one after it is safe to
/// keep — see `spec.md` S5/S6): clobbering starts at the instruction
/// *after* the one containing the current PC, never at or before it.
/// If the current PC is on the chunk's last instruction, this is a
/// complete no-op.
pub fn invalidate_from(
    chunk: &Chunk,
    guest_a: u32,
    current_guest_pc: Option<u32>,
) -> Result<(), CacheError> {
    let Some((start_guest, mut start_host_off, _)) = chunk.eip_to_instruction_start(guest_a)
    else {
        return Ok(()); // guest_a not covered by this chunk: nothing to do
    };

    if let Some(pc) = current_guest_pc {
        let chunk_end = chunk.guest_addr + chunk.guest_len;
        if pc >= start_guest && pc < chunk_end {
            let (cur_guest, _, cur_idx) = chunk
                .eip_to_instruction_start(pc)
                .expect("current pc within [start_guest, chunk_end) must resolve");
            if cur_idx == chunk.n() - 1 {
                return Ok(()); // current instruction is the last: nothing to clobber
            }
            let next_guest = cur_guest + chunk.guest_ilen(cur_idx) as u32;
            let (_, nh, _) = chunk
                .eip_to_instruction_start(next_guest)
                .expect("instruction boundary must resolve to itself");
            start_host_off = nh;
        }
    }

    let remaining = chunk.host_len() - start_host_off as usize;
    chunk
        .region()
        .write_region(start_host_off as usize, remaining, |buf| {
            buf.fill(TRAP_FILL);
        })
        .map_err(CacheError::Allocator)?;
    tracing::debug!(
        guest_addr = chunk.guest_addr,
        from_offset = start_host_off,
        remaining,
        "partial invalidate"
    );
    Ok(())
}

/// Full replacement: detach the chunk, retranslate its guest range
/// from scratch, rebind every inbound edge whose target still exists
/// in the new chunk, publish the new chunk, then free the old one.
///
/// Ordering (`spec.md` 4.5): the EIP->host map entries for the old
/// chunk are cleared in step 1, before any link is rebound in step 3
/// — so no concurrent executor doing a fresh EIP lookup can still be
/// routed to the chunk about to be freed once a single link has been
/// rebound. The new chunk's host bytes are already valid and
/// executable by the time edges are rebound to it (`Chunk::new`
/// leaves the region R+X), even though it is not yet registered —
/// only direct EIP lookups (not already-rebound branches) need the
/// registry/map entries, and those still see the old chunk's
/// retranslate-trampoline slots until `make_live` runs in step 4.
pub fn release_and_retranslate(
    chunk: Arc<Chunk>,
    generator: &mut dyn CodeGenerator,
    allocator: &ExecutableMemoryAllocator,
    map: &EipHostMap,
    registry: &ChunkRegistry,
) -> Result<Arc<Chunk>, CacheError> {
    publish::detach(&chunk, map, registry);

    let generated = generator.generate(chunk.guest_addr);
    let region = allocator.allocate(generated.host_buf.len() + GUARD_BYTES)?;
    let new_chunk = Arc::new(Chunk::new(
        tcg_core::next_chunk_id(),
        region,
        &generated,
        true, // produced by a retranslation path
    )?);

    let inbound: Vec<_> = std::mem::take(&mut *chunk.links_in.lock().unwrap());
    for link in inbound {
        let Some((_, host_off, _)) = new_chunk.eip_to_instruction_start(link.to_guest_addr)
        else {
            continue; // target no longer covered by the new chunk: edge is dropped
        };
        let dest_host = new_chunk.host_addr() + host_off as usize;
        let Some(from_chunk) = registry.find_by_id(link.from_chunk) else {
            continue; // source chunk was itself released concurrently
        };
        linker::rebind(&link, &from_chunk, new_chunk.id, dest_host)?;
        new_chunk.links_in.lock().unwrap().push(link);
    }

    publish::make_live(new_chunk.clone(), map, registry)?;

    tracing::debug!(guest_addr = chunk.guest_addr, "chunk retranslated");
    // `chunk`'s ExecutableRegion frees on drop here — equivalent to
    // `internalDealloc()`, deliberately not routed through `release`
    // (already detached, already deregistered).
    drop(chunk);

    Ok(new_chunk)
}
