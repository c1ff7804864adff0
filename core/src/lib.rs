//! Data model for the translated-code cache: `Chunk`, `Link`, the
//! generator boundary, and the error taxonomy.
//!
//! Reference: `~/boxedwine/source/emulation/cpu/binaryTranslation/btCodeChunk.cpp`.
//! Owning structures (the EIP->host map, the chunk registry, the
//! invalidation engine) live in `tcg-exec`, which depends on this
//! crate plus `tcg-backend`.

pub mod chunk;
pub mod constants;
pub mod error;
pub mod generator;
pub mod link;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use chunk::{add_link, next_chunk_id, Chunk};
pub use error::{abort_on_invariant_violation, CacheError};
pub use generator::{CodeGenerator, GeneratedCode};
pub use link::{ChunkId, Link};
