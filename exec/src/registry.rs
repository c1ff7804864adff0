//! Chunk Registry: per-process catalog of all live chunks.
//!
//! Reference: `spec.md` "3. DATA MODEL" (Chunk Registry); used by the
//! signal/fault handler (`resolve_fault`) and by the invalidation
//! engine to find chunks covering a guest range.
//!
//! The original (`Memory::addCodeChunk`/`removeCodeChunk`/
//! `getCodeChunkContainingHostAddress`) leaves the data structure
//! unconstrained. This implementation keys two `BTreeMap`s — one by
//! guest start address, one by host start address — which gives O(log n)
//! point lookups and bounded-scan overlap queries given invariant 2
//! (no two live chunks share a guest byte, so neighboring entries
//! cannot mask each other).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tcg_core::{CacheError, Chunk, ChunkId};

struct Inner {
    by_guest: BTreeMap<u32, Arc<Chunk>>,
    by_host: BTreeMap<usize, Arc<Chunk>>,
    by_id: HashMap<ChunkId, Arc<Chunk>>,
}

pub struct ChunkRegistry {
    inner: Mutex<Inner>,
}

impl Default for ChunkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_guest: BTreeMap::new(),
                by_host: BTreeMap::new(),
                by_id: HashMap::new(),
            }),
        }
    }

    /// Register a newly-published chunk.
    ///
    /// Enforces invariant 2 (`spec.md` "3. DATA MODEL"): rejects a
    /// chunk whose guest range overlaps an already-registered chunk.
    pub fn insert(&self, chunk: Arc<Chunk>) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((_, neighbor)) = inner.by_guest.range(..=chunk.guest_addr).next_back() {
            if neighbor.contains_eip(chunk.guest_addr, 1) {
                return Err(CacheError::invariant(format!(
                    "chunk at {:#x} overlaps live chunk at {:#x}",
                    chunk.guest_addr, neighbor.guest_addr
                )));
            }
        }
        if let Some((_, neighbor)) = inner
            .by_guest
            .range(..chunk.guest_addr + chunk.guest_len)
            .next_back()
        {
            if neighbor.guest_addr >= chunk.guest_addr {
                return Err(CacheError::invariant(format!(
                    "chunk at {:#x} overlaps live chunk at {:#x}",
                    chunk.guest_addr, neighbor.guest_addr
                )));
            }
        }
        inner.by_guest.insert(chunk.guest_addr, chunk.clone());
        inner.by_host.insert(chunk.host_addr(), chunk.clone());
        inner.by_id.insert(chunk.id, chunk);
        Ok(())
    }

    /// Remove a chunk. Idempotent: removing a chunk not present is a
    /// no-op, matching `spec.md`'s "stale detach" tolerance.
    pub fn remove(&self, chunk: &Chunk) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_guest.remove(&chunk.guest_addr);
        inner.by_host.remove(&chunk.host_addr());
        inner.by_id.remove(&chunk.id);
    }

    /// Reverse mapping used during signal handling and link-back
    /// resolution: which chunk, if any, owns the host code containing
    /// `host_addr`.
    pub fn find_by_host_addr(&self, host_addr: usize) -> Option<Arc<Chunk>> {
        let inner = self.inner.lock().unwrap();
        let (_, chunk) = inner.by_host.range(..=host_addr).next_back()?;
        if host_addr < chunk.host_addr() + chunk.host_cap() {
            Some(chunk.clone())
        } else {
            None
        }
    }

    pub fn find_by_guest_addr(&self, guest_addr: u32) -> Option<Arc<Chunk>> {
        let inner = self.inner.lock().unwrap();
        let (_, chunk) = inner.by_guest.range(..=guest_addr).next_back()?;
        if chunk.contains_eip(guest_addr, 1) {
            Some(chunk.clone())
        } else {
            None
        }
    }

    pub fn find_by_id(&self, id: ChunkId) -> Option<Arc<Chunk>> {
        self.inner.lock().unwrap().by_id.get(&id).cloned()
    }

    /// All live chunks overlapping `[guest_addr, guest_addr+len)`.
    pub fn chunks_overlapping(&self, guest_addr: u32, len: u32) -> Vec<Arc<Chunk>> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        let start = inner
            .by_guest
            .range(..=guest_addr)
            .next_back()
            .map(|(k, _)| *k)
            .unwrap_or(guest_addr);
        for (_, chunk) in inner.by_guest.range(start..) {
            if chunk.guest_addr >= guest_addr + len {
                break;
            }
            if chunk.contains_eip(guest_addr, len) {
                out.push(chunk.clone());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
