//! Instruction-cache invalidation, injected as a host-architecture
//! capability rather than hard-coded.
//!
//! Reference: `spec.md` "9. DESIGN NOTES" — "Dynamic dispatch for
//! `clear_instruction_cache`"; `btCodeChunk.cpp`'s
//! `clearInstructionCache` (a no-op on x86).

/// Clears the host instruction cache over a range of freshly-written
/// or freshly-invalidated code.
///
/// x86/x86-64 hosts have coherent instruction and data caches, so
/// this is a no-op there. Hosts with weaker coherence (e.g. ARM) need
/// an OS call (`__builtin___clear_cache`, `cacheflush(2)`) over the
/// affected range; this trait is the injection point for that.
pub trait ClearInstructionCache: Send + Sync {
    fn clear(&self, addr: usize, len: usize);
}

/// The x86_64 implementation: instruction fetch is coherent with
/// stores, so nothing needs to happen here.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIcache;

impl ClearInstructionCache for NoopIcache {
    fn clear(&self, _addr: usize, _len: usize) {}
}
