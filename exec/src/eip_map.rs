//! EIP->host map: per-process mapping from any guest code byte
//! address to the host address where that byte's translated
//! instruction begins.
//!
//! Reference: `spec.md` "3. DATA MODEL" (EIP->Host Map), "4.3 EIP->Host Map";
//! `btCodeChunk.cpp`'s `makeLive`/`detachFromHost`, which branch on
//! `KSystem::useLargeAddressSpace` between a flat array and
//! `eipToHostInstructionPages`, a two-level page table.
//!
//! Policy: per-instruction-start mapping only — middle bytes of a
//! multi-byte instruction are left empty. `spec.md` "4.2 Chunk" notes
//! this as the mandated choice between the two policies the original
//! exhibits in its two backends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tcg_core::constants::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

/// Sentinel stored in a slot that has been detached (its chunk is no
/// longer live) but whose guest address is still backed by mapped
/// guest memory: execution from here should fall into the
/// retranslate trampoline rather than treating the slot as untouched.
///
/// Real host addresses returned by the executable memory allocator
/// are page-aligned and therefore always `>= PAGE_SIZE`- safely
/// distinguishable from this sentinel and from 0 ("empty").
const RETRANSLATE_SENTINEL: usize = 1;

/// What a map slot currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapEntry {
    /// Never written, or the backing page table row was freed
    /// because the guest unmapped the page.
    Empty,
    /// Detached: jump to the retranslate trampoline instead.
    Retranslate,
    /// Live: the host address where this guest instruction's
    /// translation begins.
    Host(usize),
}

impl MapEntry {
    fn encode(self) -> usize {
        match self {
            MapEntry::Empty => 0,
            MapEntry::Retranslate => RETRANSLATE_SENTINEL,
            MapEntry::Host(addr) => addr,
        }
    }

    fn decode(raw: usize) -> Self {
        match raw {
            0 => MapEntry::Empty,
            RETRANSLATE_SENTINEL => MapEntry::Retranslate,
            addr => MapEntry::Host(addr),
        }
    }
}

/// Backend selection for [`EipHostMap`].
pub enum MapBackend {
    /// Single array spanning `[base, base + span)`, indexed directly.
    /// Chosen "when sufficient virtual address space is available"
    /// (`spec.md` 4.3) — production deployments span the full 32-bit
    /// guest code space; `span` is a constructor parameter so tests
    /// can exercise the same code path over a much smaller window.
    Flat { base: u32, span: u32 },
    /// Two-level page table: a top-level array of page slots, each
    /// lazily allocated as a `PAGE_SIZE`-entry row on first write.
    Paged,
}

enum Inner {
    Flat { base: u32, entries: Vec<AtomicUsize> },
    Paged { pages: Vec<Mutex<Option<Box<[AtomicUsize]>>>> },
}

/// Per-process guest-address -> host-address map.
pub struct EipHostMap {
    inner: Inner,
}

impl EipHostMap {
    pub fn new(backend: MapBackend) -> Self {
        let inner = match backend {
            MapBackend::Flat { base, span } => {
                let mut entries = Vec::with_capacity(span as usize);
                entries.resize_with(span as usize, || AtomicUsize::new(0));
                Inner::Flat { base, entries }
            }
            MapBackend::Paged => {
                let num_pages = (u32::MAX as usize >> PAGE_SHIFT) + 1;
                let mut pages = Vec::with_capacity(num_pages);
                pages.resize_with(num_pages, || Mutex::new(None));
                Inner::Paged { pages }
            }
        };
        Self { inner }
    }

    /// Small paged map sized for the full 32-bit guest code space.
    pub fn new_paged() -> Self {
        Self::new(MapBackend::Paged)
    }

    fn slot(&self, guest_a: u32) -> Option<&AtomicUsize> {
        match &self.inner {
            Inner::Flat { base, entries } => {
                let idx = guest_a.checked_sub(*base)? as usize;
                entries.get(idx)
            }
            Inner::Paged { .. } => None, // paged lookups go through with_page below
        }
    }

    /// Read the current entry for `guest_a`.
    pub fn get(&self, guest_a: u32) -> MapEntry {
        match &self.inner {
            Inner::Flat { .. } => self
                .slot(guest_a)
                .map(|s| MapEntry::decode(s.load(Ordering::Acquire)))
                .unwrap_or(MapEntry::Empty),
            Inner::Paged { pages } => {
                let page = (guest_a >> PAGE_SHIFT) as usize;
                let offset = (guest_a & PAGE_MASK) as usize;
                let row = pages[page].lock().unwrap();
                match row.as_ref() {
                    Some(row) => MapEntry::decode(row[offset].load(Ordering::Acquire)),
                    None => MapEntry::Empty,
                }
            }
        }
    }

    /// Install a host address for `guest_a`. Fails (fatal invariant
    /// violation, per `spec.md` 4.2 `make_live`) if the slot is
    /// already non-empty — a guest byte must never be double-mapped.
    pub fn set_host(&self, guest_a: u32, host_addr: usize) -> Result<(), String> {
        self.set_raw(guest_a, MapEntry::Host(host_addr), true, true)
    }

    /// Detach: point the slot at the retranslate trampoline. If the
    /// page-table row backing this address has already been freed
    /// (the guest unmapped the page), this is a silent no-op per
    /// `spec.md` "7. ERROR HANDLING DESIGN" ("Stale detach") — it must
    /// never allocate a fresh row just to store the sentinel into it.
    pub fn set_retranslate(&self, guest_a: u32) {
        let _ = self.set_raw(guest_a, MapEntry::Retranslate, false, false);
    }

    /// Used only by tests exercising invariant 7 (make_live then
    /// detach restores prior state "modulo the null vs
    /// trampoline-sentinel choice").
    pub fn clear(&self, guest_a: u32) {
        let _ = self.set_raw(guest_a, MapEntry::Empty, false, false);
    }

    /// `allocate_if_missing` controls whether a missing paged row is
    /// lazily allocated (true only for `set_host`, the one live-write
    /// path); `set_retranslate`/`clear` pass `false` so a stale write
    /// against an unmapped/freed page always no-ops, regardless of
    /// which sentinel value it would have written.
    fn set_raw(
        &self,
        guest_a: u32,
        entry: MapEntry,
        reject_overwrite: bool,
        allocate_if_missing: bool,
    ) -> Result<(), String> {
        match &self.inner {
            Inner::Flat { .. } => {
                let Some(slot) = self.slot(guest_a) else {
                    return Ok(()); // outside flat span: treat as stale/no-op
                };
                if reject_overwrite {
                    let prev = slot.load(Ordering::Acquire);
                    if prev != 0 {
                        return Err(format!(
                            "guest address {guest_a:#x} already mapped (double-map)"
                        ));
                    }
                }
                slot.store(entry.encode(), Ordering::Release);
                Ok(())
            }
            Inner::Paged { pages } => {
                let page = (guest_a >> PAGE_SHIFT) as usize;
                let offset = (guest_a & PAGE_MASK) as usize;
                let mut row = pages[page].lock().unwrap();
                let row = match row.as_mut() {
                    Some(r) => r,
                    None => {
                        if !allocate_if_missing {
                            return Ok(()); // stale write against an unmapped page: no-op
                        }
                        let mut v = Vec::with_capacity(PAGE_SIZE);
                        v.resize_with(PAGE_SIZE, || AtomicUsize::new(0));
                        *row = Some(v.into_boxed_slice());
                        row.as_mut().unwrap()
                    }
                };
                if reject_overwrite {
                    let prev = row[offset].load(Ordering::Acquire);
                    if prev != 0 {
                        return Err(format!(
                            "guest address {guest_a:#x} already mapped (double-map)"
                        ));
                    }
                }
                row[offset].store(entry.encode(), Ordering::Release);
                Ok(())
            }
        }
    }

    /// Free a page-table row entirely, simulating the guest unmapping
    /// a page. Only meaningful for the paged backend; a no-op for the
    /// flat backend (which has no per-page rows to free).
    pub fn free_page(&self, guest_page_addr: u32) {
        if let Inner::Paged { pages } = &self.inner {
            let page = (guest_page_addr >> PAGE_SHIFT) as usize;
            *pages[page].lock().unwrap() = None;
        }
    }
}
