//! Shared sizing constants for the translated-code cache.
//!
//! Reference: `~/boxedwine/source/emulation/cpu/binaryTranslation/btCodeChunk.cpp`
//! (`K_MAX_X86_OP_LEN`, `K_PAGE_SHIFT`, `K_PAGE_SIZE`).

/// Longest possible x86 instruction encoding, in bytes.
pub const MAX_GUEST_OP_LEN: usize = 15;

/// Guard bytes appended after a chunk's emitted host code, filled
/// with `TRAP_FILL` so execution that overruns a chunk traps instead
/// of running into whatever memory follows.
pub const GUARD_BYTES: usize = 4;

/// Byte written into unused/guard/invalidated host code ranges.
/// `0xCE` is `INTO` on x86 — an invalid opcode in protected mode that
/// reliably traps.
pub const TRAP_FILL: u8 = 0xCE;

/// Page size used by the two-level paged EIP->host map, matching the
/// guest's page granularity (not necessarily the host's).
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u32 = (PAGE_SIZE - 1) as u32;

/// Number of pages in a 32-bit guest linear address space.
pub const NUM_PAGES: usize = 1 << (32 - PAGE_SHIFT);
