//! Property-based tests for invariants 1, 2, 3, 6, 7 from `spec.md`
//! "8. TESTABLE PROPERTIES", over randomly generated instruction
//! tables and guest addresses.

use proptest::prelude::*;

use tcg_core::testing::ScriptedInsn;
use tcg_exec::{registry::ChunkRegistry, EipHostMap, MapBackend, MapEntry};

use crate::harness;

/// `(guest_len, host_len)` pairs, guest_len bounded by
/// `MAX_GUEST_OP_LEN` and host_len kept small so test chunks stay tiny.
fn insn_table() -> impl Strategy<Value = Vec<(u32, u32)>> {
    proptest::collection::vec((1u32..=15, 1u32..=20), 1..8)
}

proptest! {
    /// Invariant 1: per-instruction length tables sum to the chunk's
    /// total guest/host lengths.
    #[test]
    fn invariant1_length_tables_sum_correctly(table in insn_table()) {
        let alloc = harness::allocator();
        let insns: Vec<ScriptedInsn> = table.iter().map(|&(g, h)| ScriptedInsn::new(g, h)).collect();
        let expected_guest_len: u32 = table.iter().map(|&(g, _)| g).sum();
        let expected_host_len: u32 = table.iter().map(|&(_, h)| h).sum();

        let chunk = harness::build_chunk(&alloc, 0x1000, insns, false);

        let guest_sum: u32 = (0..chunk.n()).map(|i| chunk.guest_ilen(i) as u32).sum();
        let host_sum: u32 = (0..chunk.n()).map(|i| chunk.host_ilen(i)).sum();
        prop_assert_eq!(guest_sum, expected_guest_len);
        prop_assert_eq!(chunk.guest_len, expected_guest_len);
        prop_assert_eq!(host_sum, expected_host_len);
        prop_assert_eq!(chunk.host_len() as u32, expected_host_len);
    }

    /// Invariant 3: at the start of every instruction, looking up its
    /// guest address in the EIP->host map returns exactly
    /// `host_addr + prefix_sum(host_ilen)`.
    #[test]
    fn invariant3_lookup_matches_instruction_start(table in insn_table()) {
        let alloc = harness::allocator();
        let insns: Vec<ScriptedInsn> = table.iter().map(|&(g, h)| ScriptedInsn::new(g, h)).collect();
        let chunk = harness::build_chunk(&alloc, 0x1000, insns, false);

        let map = EipHostMap::new(MapBackend::Flat { base: 0, span: 0x10000 });
        let registry = ChunkRegistry::new();
        tcg_exec::publish::make_live(chunk.clone(), &map, &registry).unwrap();

        for i in 0..chunk.n() {
            let guest_start = chunk.guest_instr_start(i);
            let expected = chunk.host_addr() + chunk.host_instr_offset(i) as usize;
            prop_assert_eq!(map.get(guest_start), MapEntry::Host(expected));
        }
    }

    /// Invariant 6: `host_to_eip(lookup(a))` recovers the start of the
    /// instruction containing any guest byte `a` inside the chunk,
    /// including mid-instruction bytes.
    #[test]
    fn invariant6_host_to_eip_roundtrip(table in insn_table()) {
        let alloc = harness::allocator();
        let insns: Vec<ScriptedInsn> = table.iter().map(|&(g, h)| ScriptedInsn::new(g, h)).collect();
        let chunk = harness::build_chunk(&alloc, 0x1000, insns, false);

        for i in 0..chunk.n() {
            let guest_start = chunk.guest_instr_start(i);
            let host_off = chunk.host_instr_offset(i);
            // Probe a byte in the middle of this instruction, not just its start.
            let guest_mid = guest_start + (chunk.guest_ilen(i) as u32 - 1);
            let (resolved_guest_start, resolved_host_off, resolved_idx) =
                chunk.eip_to_instruction_start(guest_mid).unwrap();
            prop_assert_eq!(resolved_guest_start, guest_start);
            prop_assert_eq!(resolved_host_off, host_off);
            prop_assert_eq!(resolved_idx, i);

            let host_addr = chunk.host_addr() + host_off as usize;
            let (back_guest_start, back_host_off, back_idx) =
                chunk.host_to_eip(host_addr).unwrap();
            prop_assert_eq!(back_guest_start, guest_start);
            prop_assert_eq!(back_host_off, host_off);
            prop_assert_eq!(back_idx, i);
        }
    }

    /// Invariant 7: `make_live` then `detach` leaves every covered
    /// guest address pointing at the retranslate sentinel rather than
    /// a stale host address, for arbitrary instruction tables.
    #[test]
    fn invariant7_make_live_detach_roundtrip(table in insn_table()) {
        let alloc = harness::allocator();
        let insns: Vec<ScriptedInsn> = table.iter().map(|&(g, h)| ScriptedInsn::new(g, h)).collect();
        let chunk = harness::build_chunk(&alloc, 0x1000, insns, false);
        let n = chunk.n();

        let map = EipHostMap::new(MapBackend::Flat { base: 0, span: 0x10000 });
        let registry = ChunkRegistry::new();

        tcg_exec::publish::make_live(chunk.clone(), &map, &registry).unwrap();
        tcg_exec::publish::detach(&chunk, &map, &registry);

        for i in 0..n {
            let guest_start = chunk.guest_instr_start(i);
            prop_assert_eq!(map.get(guest_start), MapEntry::Retranslate);
        }
        prop_assert!(registry.is_empty());
    }

    /// Invariant 2: two chunks whose guest ranges are disjoint always
    /// both register successfully; built from the same kind of random
    /// instruction tables used above, placed far enough apart to never
    /// overlap.
    #[test]
    fn invariant2_disjoint_chunks_coexist(
        table_a in insn_table(),
        table_b in insn_table(),
    ) {
        let alloc = harness::allocator();
        let insns_a: Vec<ScriptedInsn> = table_a.iter().map(|&(g, h)| ScriptedInsn::new(g, h)).collect();
        let insns_b: Vec<ScriptedInsn> = table_b.iter().map(|&(g, h)| ScriptedInsn::new(g, h)).collect();

        let a = harness::build_chunk(&alloc, 0x1000, insns_a, false);
        // 15 * 8 = 120 is the largest possible guest_len for an 8-entry table.
        let b = harness::build_chunk(&alloc, 0x1000 + 1000, insns_b, false);

        let registry = ChunkRegistry::new();
        registry.insert(a).unwrap();
        prop_assert!(registry.insert(b).is_ok());
    }
}
