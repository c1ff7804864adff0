//! End-to-end scenario tests S1-S6.

use tcg_core::testing::{FakeGenerator, ScriptedInsn};
use tcg_core::{add_link, constants::TRAP_FILL};
use tcg_exec::{registry::ChunkRegistry, Cache, CacheConfig, EipHostMap, MapBackend, MapEntry};

use crate::harness::{self, s1_insns};

fn flat_cache() -> Cache {
    Cache::new(CacheConfig {
        map_backend: MapBackend::Flat {
            base: 0,
            span: 0x10000,
        },
    })
}

/// S1: basic publish. Three instructions at 0x1000/0x1002/0x1005,
/// host emission 10/12/4 bytes.
#[test]
fn s1_basic_publish() {
    let cache = flat_cache();
    let mut gen = FakeGenerator::new();
    gen.script(0x1000, s1_insns());

    let chunk = cache.translate_and_publish(&mut gen, 0x1000).unwrap();
    let h = chunk.host_addr();

    assert_eq!(cache.map().get(0x1000), MapEntry::Host(h));
    assert_eq!(cache.map().get(0x1002), MapEntry::Host(h + 10));
    assert_eq!(cache.map().get(0x1005), MapEntry::Host(h + 22));

    let (start, host_off, idx) = chunk.eip_to_instruction_start(0x1003).unwrap();
    assert_eq!((start, host_off, idx), (0x1002, 10, 1));
}

/// S2: guard fill. Host emission is 26 bytes; the region's capacity
/// is rounded up to a whole page, and every byte past the 26 emitted
/// bytes (guard bytes plus unused page tail) is `0xCE`.
#[test]
fn s2_guard_fill() {
    let alloc = harness::allocator();
    let chunk = harness::build_chunk(&alloc, 0x1000, s1_insns(), false);
    assert_eq!(chunk.host_len(), 26);
    let bytes = chunk.region().as_slice();
    assert!(bytes[26..chunk.host_cap()].iter().all(|&b| b == TRAP_FILL));
}

/// S3: direct link rebind. Chunk A's host code ends in a direct jump
/// whose patch site is 4 bytes starting at offset 5; it targets guest
/// `0x1000`, originally translated in chunk B. After
/// `release_and_retranslate(B) -> B'`, the 4-byte value at the patch
/// site equals `H_B' - (H_A+5) - 4`.
#[test]
fn s3_direct_link_rebind() {
    let cache = flat_cache();

    let mut gen_a = FakeGenerator::new();
    gen_a.script(0x2000, vec![ScriptedInsn::new(5, 12)]);
    let a = cache.translate_and_publish(&mut gen_a, 0x2000).unwrap();

    let mut gen_b = FakeGenerator::new();
    gen_b.script(0x1000, s1_insns());
    let b = cache.translate_and_publish(&mut gen_b, 0x1000).unwrap();

    let patch_site = a.host_addr() + 5;
    add_link(&a, &b, patch_site, 0x1000, b.host_addr(), true).unwrap();

    let mut gen_b2 = FakeGenerator::new();
    gen_b2.script(0x1000, vec![ScriptedInsn::new(6, 20)]);
    let b2 = cache.release_and_retranslate(b, &mut gen_b2).unwrap();

    let disp_bytes: [u8; 4] = a.region().as_slice()[5..9].try_into().unwrap();
    let disp = i32::from_le_bytes(disp_bytes);
    let expected = (b2.host_addr() as i64) - (patch_site as i64) - 4;
    assert_eq!(disp as i64, expected);
}

/// S4: indirect link rebind. Same setup, but the edge is indirect: the
/// rebound destination is recorded in the `Link`'s own atomic cell
/// rather than patched into A's code.
#[test]
fn s4_indirect_link_rebind() {
    let cache = flat_cache();

    let mut gen_a = FakeGenerator::new();
    gen_a.script(0x2000, vec![ScriptedInsn::new(5, 12)]);
    let a = cache.translate_and_publish(&mut gen_a, 0x2000).unwrap();

    let mut gen_b = FakeGenerator::new();
    gen_b.script(0x1000, s1_insns());
    let b = cache.translate_and_publish(&mut gen_b, 0x1000).unwrap();

    add_link(&a, &b, a.host_addr() + 5, 0x1000, b.host_addr(), false).unwrap();

    let mut gen_b2 = FakeGenerator::new();
    gen_b2.script(0x1000, vec![ScriptedInsn::new(6, 20)]);
    let b2 = cache.release_and_retranslate(b, &mut gen_b2).unwrap();

    let links_in = b2.links_in.lock().unwrap();
    assert_eq!(links_in.len(), 1);
    assert_eq!(links_in[0].to_host_addr(), b2.host_addr());
}

/// S5: partial invalidate at a safe point. Current EIP `0x1002` is the
/// start of instruction 1 of 3; `invalidate_from(0x1001)` must not
/// clobber instruction 1's host bytes, only instruction 2 onward.
#[test]
fn s5_partial_invalidate_safe_point() {
    let alloc = harness::allocator();
    let chunk = harness::build_chunk(&alloc, 0x1000, s1_insns(), false);

    tcg_exec::invalidate::invalidate_from(&chunk, 0x1001, Some(0x1002)).unwrap();

    let bytes = chunk.region().as_slice();
    assert!(bytes[0..22].iter().all(|&b| b == 0x90), "instructions 0-1 preserved");
    assert!(bytes[22..26].iter().all(|&b| b == TRAP_FILL), "instruction 2 clobbered");
}

/// S6: partial invalidate at the tail. Current EIP `0x1005` is the
/// last instruction; `invalidate_from` is a full no-op on host memory.
#[test]
fn s6_partial_invalidate_at_tail_is_noop() {
    let alloc = harness::allocator();
    let chunk = harness::build_chunk(&alloc, 0x1000, s1_insns(), false);

    tcg_exec::invalidate::invalidate_from(&chunk, 0x1001, Some(0x1005)).unwrap();

    let bytes = chunk.region().as_slice();
    assert!(bytes[0..26].iter().all(|&b| b == 0x90), "nothing clobbered");
}

/// Invariant 7: `make_live` then `detach` restores the map to its
/// pre-publish state modulo the null-vs-trampoline-sentinel choice.
#[test]
fn make_live_then_detach_restores_map() {
    let map = EipHostMap::new(MapBackend::Flat {
        base: 0,
        span: 0x10000,
    });
    let registry = ChunkRegistry::new();
    let alloc = harness::allocator();
    let chunk = harness::build_chunk(&alloc, 0x1000, s1_insns(), false);

    for a in [0x1000u32, 0x1002, 0x1005] {
        assert_eq!(map.get(a), MapEntry::Empty);
    }

    tcg_exec::publish::make_live(chunk.clone(), &map, &registry).unwrap();
    for a in [0x1000u32, 0x1002, 0x1005] {
        assert!(matches!(map.get(a), MapEntry::Host(_)));
    }

    tcg_exec::publish::detach(&chunk, &map, &registry);
    for a in [0x1000u32, 0x1002, 0x1005] {
        assert_eq!(map.get(a), MapEntry::Retranslate);
    }
    assert!(registry.is_empty());
}

/// Invariant 2: the registry rejects a second chunk whose guest range
/// overlaps an already-registered chunk.
#[test]
fn registry_rejects_overlapping_chunk() {
    let registry = ChunkRegistry::new();
    let alloc = harness::allocator();
    let a = harness::build_chunk(&alloc, 0x1000, s1_insns(), false);
    let b = harness::build_chunk(&alloc, 0x1002, vec![ScriptedInsn::new(2, 4)], false);

    registry.insert(a).unwrap();
    assert!(registry.insert(b).is_err());
}

/// `resolve_fault` recovers the guest instruction start from a host
/// program counter inside a published chunk.
#[test]
fn resolve_fault_recovers_guest_pc() {
    let cache = flat_cache();
    let mut gen = FakeGenerator::new();
    gen.script(0x1000, s1_insns());
    let chunk = cache.translate_and_publish(&mut gen, 0x1000).unwrap();

    let fault_host_pc = chunk.host_addr() + 11; // inside instruction 1 (offset 10..22)
    assert_eq!(cache.resolve_fault(fault_host_pc), Some(0x1002));
}

/// `invalidate_range` with no dispatcher (nothing currently executing
/// the overlapped chunk) fully detaches and releases the chunk.
#[test]
fn invalidate_range_without_dispatcher_releases_chunk() {
    let cache = flat_cache();
    let mut gen = FakeGenerator::new();
    gen.script(0x1000, s1_insns());
    cache.translate_and_publish(&mut gen, 0x1000).unwrap();
    assert_eq!(cache.registry().len(), 1);

    cache.invalidate_range(0x1002, 1, None).unwrap();

    assert!(cache.registry().is_empty());
    assert_eq!(cache.map().get(0x1000), MapEntry::Retranslate);
}
