//! Chunk cache: an LRU cache of optimized script artifacts keyed by SHA-256.
//!
//! The key covers the chunk name, the raw source, and the optimizer
//! configuration — equal inputs yield the same artifact, and changing any
//! optimizer flag changes the key. The stored artifact is the optimized
//! source plus its metadata; it is immutable and shared read-only (`Arc<str>`)
//! across interpreter instances, each of which compiles it on use. Binary
//! chunk dumps are deliberately not cached: the VM's safe mode refuses to
//! load them, and source artifacts are safe to share across security levels.
//!
//! # Thread safety
//!
//! The inner LRU sits behind a mutex; the cache is shared across executions
//! via the engine. Each engine owns its own cache — there is no process-wide
//! state.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::config::OptimizerConfig;

/// A 32-byte SHA-256 digest used as a cache key.
pub type ChunkKey = [u8; 32];

/// Computes the cache key for `(name, source, optimizer config)`.
///
/// The three inputs are length-prefixed into the hash so no two distinct
/// triples can collide by concatenation.
pub fn chunk_key(name: &str, source: &str, optimizer: &OptimizerConfig) -> ChunkKey {
    let mut hasher = Sha256::new();
    hasher.update((name.len() as u64).to_le_bytes());
    hasher.update(name.as_bytes());
    hasher.update((source.len() as u64).to_le_bytes());
    hasher.update(source.as_bytes());
    hasher.update([optimizer.fingerprint()]);
    hasher.finalize().into()
}

/// Compile- and optimize-time facts recorded with an artifact.
#[derive(Debug, Clone, Default)]
pub struct ChunkMetadata {
    pub original_size: usize,
    pub optimized_size: usize,
    pub optimize_duration: Duration,
    /// Duration of the first compile of this artifact, filled in after the
    /// miss that created it.
    pub compile_duration: Option<Duration>,
    /// Optimizer transforms that changed the source.
    pub fired_transforms: Vec<&'static str>,
    /// Static-analysis notes (unused locals, unreachable code).
    pub warnings: Vec<String>,
}

/// An immutable optimized chunk, cheap to clone and share.
#[derive(Debug, Clone)]
pub struct ChunkArtifact {
    pub source: Arc<str>,
    pub metadata: ChunkMetadata,
}

/// Bounded LRU mapping [`ChunkKey`] → [`ChunkArtifact`].
pub struct ChunkCache {
    inner: Mutex<LruCache<ChunkKey, ChunkArtifact>>,
    capacity: usize,
}

impl ChunkCache {
    /// Creates a cache holding at most `capacity` artifacts. A capacity of 0
    /// is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            capacity: capacity.max(1),
        }
    }

    /// Returns the artifact for `key`, promoting it to most-recently-used.
    pub fn get(&self, key: &ChunkKey) -> Option<ChunkArtifact> {
        self.inner.lock().get(key).cloned()
    }

    /// Inserts `key` → `artifact`, evicting the least-recently-used entry at
    /// capacity.
    pub fn put(&self, key: ChunkKey, artifact: ChunkArtifact) {
        self.inner.lock().put(key, artifact);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Removes all entries and their metadata. Capacity is unchanged.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
