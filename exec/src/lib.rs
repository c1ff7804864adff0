//! Translated-code cache & chunk linker: the public surface tying the
//! EIP->host map, chunk registry, link table, and invalidation engine
//! together behind three operations.
//!
//! Reference: `spec.md` "6. EXTERNAL INTERFACES"; `btCodeChunk.cpp`'s
//! `KMemory::translate`/`invalidateCodePages`/fault-handling entry
//! points, which this crate's `Cache` generalizes.

pub mod eip_map;
pub mod invalidate;
pub mod linker;
pub mod publish;
pub mod registry;

use std::sync::Arc;

use tcg_backend::{ClearInstructionCache, ExecutableMemoryAllocator, NoopIcache};
use tcg_core::constants::GUARD_BYTES;
use tcg_core::{abort_on_invariant_violation, next_chunk_id, CacheError, Chunk, CodeGenerator};

pub use eip_map::{EipHostMap, MapBackend, MapEntry};
pub use registry::ChunkRegistry;

/// `spec.md` "7. ERROR HANDLING DESIGN": an invariant violation is
/// fatal and has no recovery path, so every `Cache` method that can
/// surface one aborts with a diagnostic instead of letting the caller
/// ignore the error and keep running against a corrupted cache.
/// `CacheError::Allocator` passes through unchanged — it is the one
/// variant an embedder can recover from.
fn escalate(err: CacheError) -> CacheError {
    if matches!(err, CacheError::InvariantViolation(_)) {
        abort_on_invariant_violation(&err);
    }
    err
}

/// Tunables for a `Cache` instance.
///
/// Passed to `Cache::new` rather than read from the environment or a
/// config file: per `spec.md` "6. EXTERNAL INTERFACES" this subsystem
/// has no CLI and no persisted state, so there is nothing to parse at
/// startup beyond what the embedder supplies.
pub struct CacheConfig {
    /// EIP->host map backend. `MapBackend::Paged` is the usual choice
    /// for a full 32-bit guest code space; `MapBackend::Flat` suits a
    /// smaller, known guest range (and tests).
    pub map_backend: MapBackend,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            map_backend: MapBackend::Paged,
        }
    }
}

/// Minimal shape of the CPU dispatch loop this crate treats as an
/// external collaborator (`spec.md` "6. EXTERNAL INTERFACES").
/// `invalidate_from`'s "don't clobber the currently executing
/// instruction" rule is the only consumer.
pub trait GuestDispatcher {
    /// Linear guest address (EIP plus code-segment base) the
    /// dispatcher is currently executing, if it is currently inside
    /// translated code at all.
    fn current_guest_pc(&self) -> Option<u32>;
}

/// `Cache` bundles every process-wide structure the translated-code
/// cache needs: the executable memory allocator, the EIP->host map,
/// and the chunk registry. One `Cache` per guest process.
pub struct Cache {
    allocator: ExecutableMemoryAllocator,
    map: EipHostMap,
    registry: ChunkRegistry,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_icache(config, Arc::new(NoopIcache))
    }

    pub fn with_icache(config: CacheConfig, icache: Arc<dyn ClearInstructionCache>) -> Self {
        Self {
            allocator: ExecutableMemoryAllocator::new(icache),
            map: EipHostMap::new(config.map_backend),
            registry: ChunkRegistry::new(),
        }
    }

    pub fn map(&self) -> &EipHostMap {
        &self.map
    }

    pub fn registry(&self) -> &ChunkRegistry {
        &self.registry
    }

    /// Translate `guest_a` via `generator` and publish the result.
    ///
    /// Mirrors the original's "miss in the EIP->host map" path: invoke
    /// the generator, allocate executable memory sized to its output
    /// plus guard bytes, build the chunk, and publish it (`spec.md`
    /// "4.2 Chunk" `make_live`).
    pub fn translate_and_publish(
        &self,
        generator: &mut dyn CodeGenerator,
        guest_a: u32,
    ) -> Result<Arc<Chunk>, CacheError> {
        let generated = generator.generate(guest_a);
        let region = self
            .allocator
            .allocate(generated.host_buf.len() + GUARD_BYTES)
            .map_err(CacheError::Allocator)?;
        let chunk = Arc::new(Chunk::new(next_chunk_id(), region, &generated, false).map_err(escalate)?);
        publish::make_live(chunk.clone(), &self.map, &self.registry).map_err(escalate)?;
        tracing::debug!(guest_addr = guest_a, "translated and published chunk");
        Ok(chunk)
    }

    /// React to a write into `[guest_a, guest_a+len)`: invalidate every
    /// live chunk the range overlaps.
    ///
    /// Policy (`spec.md` "4.5 Invalidation & Retranslation Engine"):
    /// partial invalidation (`invalidate_from`) is used when a
    /// `dispatcher` is supplied and currently executing inside the
    /// overlapped chunk, so the currently-running instruction is never
    /// clobbered out from under itself; otherwise the whole chunk is
    /// detached and its memory released, since nothing is executing it
    /// that a partial trap-fill would need to protect.
    pub fn invalidate_range(
        &self,
        guest_a: u32,
        len: u32,
        dispatcher: Option<&dyn GuestDispatcher>,
    ) -> Result<(), CacheError> {
        let current_pc = dispatcher.and_then(|d| d.current_guest_pc());
        for chunk in self.registry.chunks_overlapping(guest_a, len) {
            match current_pc {
                Some(pc) if chunk.contains_eip(pc, 1) => {
                    invalidate::invalidate_from(&chunk, guest_a, Some(pc)).map_err(escalate)?;
                }
                _ => {
                    publish::release(chunk, &self.map, &self.registry);
                }
            }
        }
        Ok(())
    }

    /// Reverse-lookup a faulting host program counter back to the
    /// guest address whose translation it falls inside, if any.
    ///
    /// Mirrors `BtCodeChunk::getEipThatContainsHostAddress` used by the
    /// original's SIGSEGV handler to recover a guest PC for a host
    /// fault address.
    pub fn resolve_fault(&self, host_pc: usize) -> Option<u32> {
        let chunk = self.registry.find_by_host_addr(host_pc)?;
        let (guest_start, _, _) = chunk.host_to_eip(host_pc)?;
        Some(guest_start)
    }

    /// Retranslate a chunk in place (self-modifying-code recovery
    /// path), rebinding every inbound edge to the replacement.
    /// `spec.md` "4.5 Invalidation & Retranslation Engine" (B).
    pub fn release_and_retranslate(
        &self,
        chunk: Arc<Chunk>,
        generator: &mut dyn CodeGenerator,
    ) -> Result<Arc<Chunk>, CacheError> {
        invalidate::release_and_retranslate(
            chunk,
            generator,
            &self.allocator,
            &self.map,
            &self.registry,
        )
        .map_err(escalate)
    }
}
