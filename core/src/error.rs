//! Error taxonomy for the translated-code cache.
//!
//! Mirrors the original's `kpanic()` calls in `btCodeChunk.cpp`: most
//! failure modes here are invariant violations with no recovery path,
//! not conditions an embedder is expected to handle.

use thiserror::Error;

/// Errors surfaced by the cache and chunk linker.
///
/// `Allocator` is the only variant an embedder can reasonably recover
/// from (evict dynamic chunks and retry). Every `InvariantViolation`
/// is fatal: callers should log it and abort, never keep running with
/// a cache that might have a double-mapped guest byte or a dangling
/// link. See `spec.md` "7. ERROR HANDLING DESIGN".
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("executable memory allocation failed: {0}")]
    Allocator(#[from] std::io::Error),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl CacheError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}

/// Log and abort on a fatal invariant violation.
///
/// The cache's public API still returns `Result` so call sites read
/// naturally, but per the error taxonomy there is no recovery for
/// this variant — this helper is the one sanctioned way to turn it
/// into a process abort with a diagnostic.
pub fn abort_on_invariant_violation(err: &CacheError) -> ! {
    tracing::error!(error = %err, "fatal cache invariant violation");
    panic!("translated-code cache invariant violation: {err}");
}
