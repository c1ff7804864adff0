//! `Chunk`: one contiguous translated region, covering one contiguous
//! guest region.
//!
//! Reference: `spec.md` "3. DATA MODEL" (Chunk) and "4.2 Chunk";
//! `btCodeChunk.cpp`'s `BtCodeChunk` class.
//!
//! `Chunk` owns its geometry (the guest<->host instruction-length
//! tables) and its executable memory, and knows how to translate
//! between guest and host addresses within itself. It does not know
//! about the EIP->host map or the chunk registry — publishing
//! (`make_live`), detaching, and linking against other chunks are
//! orchestrated by `tcg-exec`, which is the layer that owns those
//! process-wide structures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tcg_backend::ExecutableRegion;

use crate::constants::{GUARD_BYTES, MAX_GUEST_OP_LEN, TRAP_FILL};
use crate::error::CacheError;
use crate::generator::GeneratedCode;
use crate::link::{ChunkId, Link};

static NEXT_CHUNK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh, process-wide-unique chunk id.
pub fn next_chunk_id() -> ChunkId {
    ChunkId(NEXT_CHUNK_ID.fetch_add(1, Ordering::Relaxed))
}

/// One contiguous translation unit: a guest interval mapped to a host
/// interval, both partitioned into the same `n` instructions.
pub struct Chunk {
    pub id: ChunkId,

    pub guest_addr: u32,
    pub guest_len: u32,

    region: ExecutableRegion,
    host_len: usize,

    /// Length in guest bytes of each instruction. `sum == guest_len`.
    guest_ilen: Vec<u8>,
    /// Length in host bytes of each instruction. `sum == host_len`.
    host_ilen: Vec<u32>,

    /// Edges leaving this chunk (this chunk's host code branches
    /// into another chunk's guest target).
    pub links_out: Mutex<Vec<Arc<Link>>>,
    /// Edges entering this chunk (another chunk's host code branches
    /// to a guest target covered by this chunk).
    pub links_in: Mutex<Vec<Arc<Link>>>,

    /// Produced by a self-modifying-code retranslation path, rather
    /// than the initial translation of a never-before-seen region.
    /// Influences eviction policy when the allocator is under
    /// pressure (dynamic chunks are evicted first).
    pub dynamic: bool,
}

impl Chunk {
    /// Build a new chunk from generator output, copying the emitted
    /// host code into freshly-allocated executable memory.
    ///
    /// Mirrors `BtCodeChunk::BtCodeChunk`: allocate `host_len + 4`
    /// guard bytes, fill the whole capacity with the trap byte, copy
    /// the emitted code in, then derive the per-instruction length
    /// tables from the two offset arrays the generator provided.
    pub fn new(
        id: ChunkId,
        region: ExecutableRegion,
        gen: &GeneratedCode,
        dynamic: bool,
    ) -> Result<Self, CacheError> {
        let n = gen.n();
        let host_len = gen.host_buf.len();
        if region.capacity() < host_len + GUARD_BYTES {
            return Err(CacheError::invariant(format!(
                "executable region too small: capacity {} < host_len {} + guard {}",
                region.capacity(),
                host_len,
                GUARD_BYTES
            )));
        }

        region.write_region(0, region.capacity(), |mem| {
            mem.fill(TRAP_FILL);
            mem[..host_len].copy_from_slice(&gen.host_buf);
        })?;

        let mut guest_ilen = Vec::with_capacity(n);
        let mut host_ilen = Vec::with_capacity(n);
        for i in 0..n {
            let (glen, hlen) = if i + 1 < n {
                (
                    gen.guest_instr_addr[i + 1] - gen.guest_instr_addr[i],
                    gen.host_instr_off[i + 1] - gen.host_instr_off[i],
                )
            } else {
                (
                    gen.guest_len - (gen.guest_instr_addr[i] - gen.guest_addr),
                    host_len as u32 - gen.host_instr_off[i],
                )
            };
            if glen as usize > MAX_GUEST_OP_LEN {
                return Err(CacheError::invariant(format!(
                    "guest instruction {i} length {glen} exceeds MAX_GUEST_OP_LEN"
                )));
            }
            guest_ilen.push(glen as u8);
            host_ilen.push(hlen);
        }

        Ok(Self {
            id,
            guest_addr: gen.guest_addr,
            guest_len: gen.guest_len,
            region,
            host_len,
            guest_ilen,
            host_ilen,
            links_out: Mutex::new(Vec::new()),
            links_in: Mutex::new(Vec::new()),
            dynamic,
        })
    }

    pub fn n(&self) -> usize {
        self.guest_ilen.len()
    }

    pub fn host_addr(&self) -> usize {
        self.region.addr()
    }

    pub fn host_len(&self) -> usize {
        self.host_len
    }

    pub fn host_cap(&self) -> usize {
        self.region.capacity()
    }

    pub fn region(&self) -> &ExecutableRegion {
        &self.region
    }

    pub fn guest_ilen(&self, i: usize) -> u8 {
        self.guest_ilen[i]
    }

    pub fn host_ilen(&self, i: usize) -> u32 {
        self.host_ilen[i]
    }

    /// Guest address of instruction `i`'s first byte.
    pub fn guest_instr_start(&self, i: usize) -> u32 {
        self.guest_addr + self.guest_ilen[..i].iter().map(|&l| l as u32).sum::<u32>()
    }

    /// Offset (from `host_addr()`) of instruction `i`'s first byte.
    pub fn host_instr_offset(&self, i: usize) -> u32 {
        self.host_ilen[..i].iter().sum()
    }

    /// Overlap test against `[guest_addr, guest_addr+guest_len)`.
    ///
    /// Mirrors `BtCodeChunk::containsEip(eip, len)`: true if the
    /// range begins in this chunk, ends in this chunk, or spans it
    /// entirely.
    pub fn contains_eip(&self, eip: u32, len: u32) -> bool {
        let begins = self.contains_addr(eip);
        let ends = len > 0 && self.contains_addr(eip + len - 1);
        let spans = eip < self.guest_addr
            && eip.saturating_add(len) > self.guest_addr + self.guest_len;
        begins || ends || spans
    }

    fn contains_addr(&self, a: u32) -> bool {
        a >= self.guest_addr && a < self.guest_addr + self.guest_len
    }

    /// If `guest_a` falls inside this chunk, return the start of the
    /// instruction containing it, that instruction's host start
    /// offset, and its index.
    ///
    /// Mirrors `BtCodeChunk::getStartOfInstructionByEip`.
    pub fn eip_to_instruction_start(&self, guest_a: u32) -> Option<(u32, u32, usize)> {
        if !self.contains_addr(guest_a) {
            return None;
        }
        let mut guest_cursor = self.guest_addr;
        let mut host_cursor = 0u32;
        for i in 0..self.n() {
            let glen = self.guest_ilen[i] as u32;
            if guest_a >= guest_cursor && guest_a < guest_cursor + glen {
                return Some((guest_cursor, host_cursor, i));
            }
            guest_cursor += glen;
            host_cursor += self.host_ilen[i];
        }
        None
    }

    /// Mirror of `eip_to_instruction_start` for host addresses:
    /// if the absolute host address `host_a` falls inside this
    /// chunk's emitted code, return the guest start, host start
    /// offset, and index of the instruction containing it.
    ///
    /// Mirrors `BtCodeChunk::getEipThatContainsHostAddress`.
    pub fn host_to_eip(&self, host_a: usize) -> Option<(u32, u32, usize)> {
        let base = self.host_addr();
        if host_a < base || host_a >= base + self.host_len {
            return None;
        }
        let rel = (host_a - base) as u32;
        let mut guest_cursor = self.guest_addr;
        let mut host_cursor = 0u32;
        for i in 0..self.n() {
            let hlen = self.host_ilen[i];
            if rel >= host_cursor && rel < host_cursor + hlen {
                return Some((guest_cursor, host_cursor, i));
            }
            guest_cursor += self.guest_ilen[i] as u32;
            host_cursor += hlen;
        }
        None
    }
}

/// Append a new edge from `from`'s host code to a guest target
/// covered by `to`. Does not patch the branch site — the caller does
/// that while holding whatever write scope is appropriate.
///
/// Mirrors `BtCodeChunk::addLinkFrom`: rejects a chunk linking to
/// itself as a fatal invariant violation.
pub fn add_link(
    from: &Chunk,
    to: &Chunk,
    from_patch_site: usize,
    to_guest_addr: u32,
    to_host_addr: usize,
    direct: bool,
) -> Result<Arc<Link>, CacheError> {
    if from.id == to.id {
        return Err(CacheError::invariant(
            "a chunk cannot link to itself (addLinkFrom self-loop)",
        ));
    }
    let link = Arc::new(Link::new(
        from.id,
        from_patch_site,
        to.id,
        to_guest_addr,
        to_host_addr,
        direct,
    ));
    from.links_out.lock().unwrap().push(link.clone());
    to.links_in.lock().unwrap().push(link.clone());
    Ok(link)
}
