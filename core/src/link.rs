//! Cross-chunk edges: the "chunk linker" in this subsystem's name.
//!
//! Reference: `spec.md` "3. DATA MODEL" (Link), "4.4 Link Table &
//! Patching", `btCodeChunk.cpp`'s `BtCodeChunkLink` (via
//! `addLinkFrom`/`releaseAndRetranslate`).

use std::sync::atomic::{AtomicUsize, Ordering};

/// Opaque identity for a live chunk.
///
/// The design notes call for edges to reference chunks by id rather
/// than by raw pointer or `shared_from_this()`-style self-reference,
/// so that an edge can outlive the chunk it currently points at
/// across a retranslation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub u64);

/// An edge of the inter-chunk graph: a patch site in one chunk's host
/// code that branches to a guest target, whose current host
/// materialization may move across retranslations.
#[derive(Debug)]
pub struct Link {
    /// Chunk containing the branch instruction being patched.
    pub from_chunk: ChunkId,
    /// Host address inside `from_chunk` where the branch operand
    /// lives: a relative-immediate instruction for `direct` edges, or
    /// an indirection cell for indirect edges.
    pub from_patch_site: usize,
    /// Chunk this edge currently targets (may change across
    /// retranslation of the target).
    to_chunk: AtomicUsize,
    /// Guest address this edge targets. Immutable: retranslating the
    /// target chunk preserves the guest address, only the host
    /// materialization moves.
    pub to_guest_addr: u32,
    /// Current host destination. Updated atomically on rebind so a
    /// concurrent indirect-jump loader never tears the value.
    to_host_addr: AtomicUsize,
    /// `true` if `from_patch_site` holds a 32-bit relative
    /// displacement patched directly into the instruction stream;
    /// `false` if it is an indirection cell loaded at runtime.
    pub direct: bool,
}

impl Link {
    pub fn new(
        from_chunk: ChunkId,
        from_patch_site: usize,
        to_chunk: ChunkId,
        to_guest_addr: u32,
        to_host_addr: usize,
        direct: bool,
    ) -> Self {
        Self {
            from_chunk,
            from_patch_site,
            to_chunk: AtomicUsize::new(to_chunk.0 as usize),
            to_guest_addr,
            to_host_addr: AtomicUsize::new(to_host_addr),
            direct,
        }
    }

    pub fn to_host_addr(&self) -> usize {
        self.to_host_addr.load(Ordering::Acquire)
    }

    pub fn to_chunk(&self) -> ChunkId {
        ChunkId(self.to_chunk.load(Ordering::Acquire) as u64)
    }

    /// Rebind this edge's host-side bookkeeping to a new destination
    /// chunk/address. Does not patch the code/cell at
    /// `from_patch_site` — the caller (the invalidation engine) does
    /// that under the appropriate write scope, since only it knows
    /// whether a 4-byte relative patch or a 64-bit atomic store is
    /// required.
    pub fn rebind(&self, to_chunk: ChunkId, to_host_addr: usize) {
        self.to_host_addr.store(to_host_addr, Ordering::Release);
        self.to_chunk.store(to_chunk.0 as usize, Ordering::Release);
    }
}
