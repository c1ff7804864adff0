//! Executable memory allocator: suballocates W^X host pages and
//! provides the scoped write-enable primitive every host-code
//! mutation goes through.
//!
//! Reference: `spec.md` "4.1 Executable Memory Allocator";
//! `btCodeChunk.cpp`'s `allocateExcutableMemory` /
//! `freeExcutableMemory` / `Platform::writeCodeToMemory`. The
//! teacher's `tcg-backend::code_buffer::CodeBuffer` is the mmap/
//! mprotect mechanism this is generalized from — that type manages
//! one growing bump-allocated buffer shared by every translation
//! block; this allocator instead hands each chunk its own
//! independently freeable mapping, because the spec requires chunks
//! to be released individually (retranslation frees exactly one old
//! chunk's memory, not the whole arena).

use std::io;
use std::ptr;
use std::sync::Arc;

use crate::icache::ClearInstructionCache;

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up_to_page(n: usize, page: usize) -> usize {
    (n + page - 1) & !(page - 1)
}

/// Hands out independently-freeable W^X regions.
///
/// Backend is "per-mutation mprotect flip": each region starts life
/// mapped read-write, and `write_region` flips it to read-execute on
/// every exit path. A "pre-faulted RWX pool" backend would also
/// satisfy the same contract; this one is what the teacher's
/// `CodeBuffer` already does, generalized to per-chunk granularity.
#[derive(Clone)]
pub struct ExecutableMemoryAllocator {
    icache: Arc<dyn ClearInstructionCache>,
}

impl ExecutableMemoryAllocator {
    pub fn new(icache: Arc<dyn ClearInstructionCache>) -> Self {
        Self { icache }
    }

    /// Allocate a region of at least `min_bytes`, rounded up to a
    /// whole number of host pages. Returned region is mapped
    /// read-write; callers must call `execute_protect` (or exit a
    /// `write_region` scope) before jumping into it.
    pub fn allocate(&self, min_bytes: usize) -> io::Result<ExecutableRegion> {
        let page = page_size();
        let capacity = round_up_to_page(min_bytes.max(1), page);

        // SAFETY: anonymous, non-file-backed mapping; ptr is checked
        // for MAP_FAILED below before use.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(ExecutableRegion {
            ptr: ptr as *mut u8,
            capacity,
            icache: self.icache.clone(),
        })
    }
}

/// One independently-owned, independently-freeable W^X mapping.
///
/// `Drop` unmaps it, matching `freeExcutableMemory`'s pairing with
/// `allocateExcutableMemory` — a `Chunk` that is released simply lets
/// its `ExecutableRegion` drop.
pub struct ExecutableRegion {
    ptr: *mut u8,
    capacity: usize,
    icache: Arc<dyn ClearInstructionCache>,
}

// SAFETY: the region is exclusively owned by whichever Chunk holds
// it; shared byte-level reads (disassembly, fault resolution) go
// through `as_slice`/`ptr_at`, which are safe given the mapping is
// never remapped for its lifetime.
unsafe impl Send for ExecutableRegion {}
unsafe impl Sync for ExecutableRegion {}

impl ExecutableRegion {
    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *const u8 {
        assert!(offset <= self.capacity, "offset outside region");
        // SAFETY: offset <= capacity, within the mapping.
        unsafe { self.ptr.add(offset) }
    }

    /// Read-only view of the whole region. Safe to call regardless of
    /// current protection: reads are valid whether the mapping is
    /// currently R+W or R+X.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr..ptr+capacity is the whole live mapping.
        unsafe { std::slice::from_raw_parts(self.ptr, self.capacity) }
    }

    pub fn execute_protect(&self) -> io::Result<()> {
        self.mprotect(libc::PROT_READ | libc::PROT_EXEC)
    }

    /// Explicitly flush the instruction cache over `[offset, offset+len)`
    /// without changing protection. Used by publication steps that
    /// want to re-assert cache coherence after bookkeeping, distinct
    /// from the flush `write_region` already does on scope exit.
    pub fn clear_icache_range(&self, offset: usize, len: usize) {
        self.icache.clear(self.addr() + offset, len);
    }

    fn mprotect(&self, prot: libc::c_int) -> io::Result<()> {
        // SAFETY: self.ptr/self.capacity describe the live mapping
        // owned exclusively by this region.
        let ret = unsafe {
            libc::mprotect(self.ptr as *mut libc::c_void, self.capacity, prot)
        };
        if ret != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Scoped write access: makes `[offset, offset+len)` writable,
    /// runs `f` with a mutable view of that range, restores R+X, and
    /// clears the instruction cache over the written range.
    ///
    /// The restore runs even if `f` panics, via the `WriteGuard`'s
    /// `Drop` impl — the scope's write permission is never leaked on
    /// an unwinding exit.
    pub fn write_region<R>(
        &self,
        offset: usize,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> io::Result<R> {
        assert!(
            offset + len <= self.capacity,
            "write_region range outside owned allocation"
        );
        self.mprotect(libc::PROT_READ | libc::PROT_WRITE)?;
        let _guard = WriteGuard { region: self, offset, len };
        // SAFETY: protection was just flipped to PROT_WRITE above,
        // and this region is exclusively owned.
        let slice =
            unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), len) };
        Ok(f(slice))
    }
}

/// Restores R+X and flushes the instruction cache when a
/// `write_region` scope ends, on every exit path including unwinds.
struct WriteGuard<'a> {
    region: &'a ExecutableRegion,
    offset: usize,
    len: usize,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.region.execute_protect() {
            tracing::error!(error = %e, "failed to restore execute protection");
        }
        self.region.icache.clear(self.region.addr() + self.offset, self.len);
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/capacity describe a mapping this region
        // exclusively owns and has not yet unmapped.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.capacity);
        }
    }
}
