//! Deterministic fake generator used by the cache's own tests and by
//! `tcg-tests`.
//!
//! Real instruction decoding and host code emission are out of scope
//! for this crate (see `spec.md` "1. PURPOSE & SCOPE"); this stands
//! in for the generator collaborator with hand-specified instruction
//! tables, analogous to how the teacher's integration tests script a
//! `GuestCpu` rather than running a real ISA decoder end to end.

use std::collections::HashMap;

use crate::generator::{CodeGenerator, GeneratedCode};

/// A scripted instruction: `(guest_len, host_len, host_bytes)`. The
/// generator concatenates `host_bytes` across all instructions of a
/// scripted chunk; if `host_bytes` is shorter than `host_len` it is
/// padded with `0x90` (NOP on x86), which is a harmless filler byte
/// for tests that only check offsets and lengths.
#[derive(Debug, Clone)]
pub struct ScriptedInsn {
    pub guest_len: u32,
    pub host_len: u32,
    pub host_bytes: Vec<u8>,
}

impl ScriptedInsn {
    pub fn new(guest_len: u32, host_len: u32) -> Self {
        Self { guest_len, host_len, host_bytes: Vec::new() }
    }

    pub fn with_bytes(guest_len: u32, host_bytes: Vec<u8>) -> Self {
        let host_len = host_bytes.len() as u32;
        Self { guest_len, host_len, host_bytes }
    }
}

/// A generator whose output for each guest address is whatever the
/// test scripted in advance via [`FakeGenerator::script`].
#[derive(Default)]
pub struct FakeGenerator {
    scripts: HashMap<u32, Vec<ScriptedInsn>>,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the chunk generated when translation starts at
    /// `guest_addr`.
    pub fn script(&mut self, guest_addr: u32, insns: Vec<ScriptedInsn>) -> &mut Self {
        self.scripts.insert(guest_addr, insns);
        self
    }
}

impl CodeGenerator for FakeGenerator {
    fn generate(&mut self, guest_addr: u32) -> GeneratedCode {
        let insns = self.scripts.get(&guest_addr).unwrap_or_else(|| {
            panic!("FakeGenerator: no script registered for guest_addr {guest_addr:#x}")
        });

        let mut guest_instr_addr = Vec::with_capacity(insns.len());
        let mut host_instr_off = Vec::with_capacity(insns.len());
        let mut host_buf = Vec::new();
        let mut guest_cursor = guest_addr;

        for insn in insns {
            guest_instr_addr.push(guest_cursor);
            host_instr_off.push(host_buf.len() as u32);
            let mut bytes = insn.host_bytes.clone();
            bytes.resize(insn.host_len as usize, 0x90);
            host_buf.extend_from_slice(&bytes);
            guest_cursor += insn.guest_len;
        }

        GeneratedCode {
            guest_len: guest_cursor - guest_addr,
            guest_addr,
            guest_instr_addr,
            host_instr_off,
            host_buf,
        }
    }
}
