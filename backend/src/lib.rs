//! Executable memory management for the translated-code cache.
//!
//! This is component 1 of `spec.md`'s system overview, the
//! "Executable Memory Allocator": suballocates W^X pages and provides
//! the scoped write-enable primitive every host-code emission and
//! patch goes through. Everything above this layer (instruction
//! decoding, register allocation, host code emission) is out of
//! scope — the generator is a black box, see `tcg_core::generator`.

pub mod exec_mem;
pub mod icache;

pub use exec_mem::{ExecutableMemoryAllocator, ExecutableRegion};
pub use icache::{ClearInstructionCache, NoopIcache};
