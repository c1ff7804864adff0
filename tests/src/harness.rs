//! Shared scaffolding for scenario and property tests: builds chunks
//! from a scripted [`FakeGenerator`] through the real allocator, so
//! tests exercise actual `mmap`/`mprotect` host memory rather than a
//! mock.

use std::sync::Arc;

use tcg_backend::{ExecutableMemoryAllocator, NoopIcache};
use tcg_core::testing::{FakeGenerator, ScriptedInsn};
use tcg_core::{next_chunk_id, Chunk, CodeGenerator};

pub fn allocator() -> ExecutableMemoryAllocator {
    ExecutableMemoryAllocator::new(Arc::new(NoopIcache))
}

/// Script and build one chunk directly (bypassing `Cache`), for tests
/// that need to inspect the chunk before it is published.
pub fn build_chunk(
    alloc: &ExecutableMemoryAllocator,
    guest_addr: u32,
    insns: Vec<ScriptedInsn>,
    dynamic: bool,
) -> Arc<Chunk> {
    let mut gen = FakeGenerator::new();
    gen.script(guest_addr, insns);
    let generated = gen.generate(guest_addr);
    let region = alloc
        .allocate(generated.host_buf.len() + tcg_core::constants::GUARD_BYTES)
        .expect("allocate");
    Arc::new(Chunk::new(next_chunk_id(), region, &generated, dynamic).expect("construct chunk"))
}

/// The S1/S2 fixture: three guest instructions at `0x1000` (2 bytes),
/// `0x1002` (3 bytes), `0x1005` (1 byte), emitting 10, 12, 4 host
/// bytes respectively.
pub fn s1_insns() -> Vec<ScriptedInsn> {
    vec![
        ScriptedInsn::new(2, 10),
        ScriptedInsn::new(3, 12),
        ScriptedInsn::new(1, 4),
    ]
}
