//! Publishing and detaching chunks: the operations that cross the
//! boundary between a self-contained `Chunk` and the process-wide
//! EIP->host map and chunk registry.
//!
//! Reference: `spec.md` "4.2 Chunk" (`make_live`, `detach`,
//! `release`); `btCodeChunk.cpp`'s `makeLive`/`detachFromHost`/
//! `release`.

use std::sync::Arc;

use tcg_core::{CacheError, Chunk};

use crate::eip_map::EipHostMap;
use crate::registry::ChunkRegistry;

/// Publish a chunk: install its EIP->host map entries (one per
/// instruction start; per `spec.md` the mapping is per-instruction-
/// start, middle bytes stay empty) and register it, then flush the
/// instruction cache over its whole host range.
///
/// Writing a slot that is already non-empty is a fatal invariant
/// violation (`spec.md` "7. ERROR HANDLING DESIGN").
pub fn make_live(
    chunk: Arc<Chunk>,
    map: &EipHostMap,
    registry: &ChunkRegistry,
) -> Result<(), CacheError> {
    for i in 0..chunk.n() {
        let guest_start = chunk.guest_instr_start(i);
        let host_start = chunk.host_addr() + chunk.host_instr_offset(i) as usize;
        map.set_host(guest_start, host_start)
            .map_err(CacheError::invariant)?;
    }
    registry.insert(chunk.clone())?;
    chunk.region().clear_icache_range(0, chunk.host_len());
    tracing::debug!(
        guest_addr = chunk.guest_addr,
        host_addr = chunk.host_addr(),
        n = chunk.n(),
        "chunk published"
    );
    Ok(())
}

/// Reverse of `make_live`: point every covered guest instruction's
/// slot at the retranslate trampoline (or leave a stale, already-freed
/// page table row alone) and remove the chunk from the registry.
/// Edges are untouched — the invalidation engine handles those.
pub fn detach(chunk: &Chunk, map: &EipHostMap, registry: &ChunkRegistry) {
    for i in 0..chunk.n() {
        map.set_retranslate(chunk.guest_instr_start(i));
    }
    registry.remove(chunk);
    tracing::debug!(guest_addr = chunk.guest_addr, "chunk detached");
}

/// `detach` followed by dropping the chunk. Freeing its executable
/// memory happens automatically when the last `Arc<Chunk>` (this
/// one) is dropped, via `ExecutableRegion`'s `Drop` impl — matching
/// `BtCodeChunk::release`'s `detachFromHost` + `internalDealloc`
/// pairing.
pub fn release(chunk: Arc<Chunk>, map: &EipHostMap, registry: &ChunkRegistry) {
    detach(&chunk, map, registry);
    drop(chunk);
}
