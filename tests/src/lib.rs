//! Integration tests for the translated-code cache and chunk linker,
//! exercising `tcg-core`, `tcg-backend`, and `tcg-exec` together the
//! way a real embedder would: through `tcg_exec::Cache` and the
//! scripted `FakeGenerator` test double.

pub mod harness;

#[cfg(test)]
mod properties;
#[cfg(test)]
mod scenarios;
