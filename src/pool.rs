// ABOUTME: Process-wide reusable factory of fixed-size byte chunks for the zero-copy buffer layer
// ABOUTME: Provides borrow/return semantics with atomic refcounts and leak accounting on abandonment

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Default chunk payload size.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("chunk already disposed")]
    ObjectDisposed,
}

/// Lifecycle state of a pooled chunk slab.
///
/// `NEW` only exists transiently during construction; once a slab is handed
/// out by [`ChunkPool::borrow`] it is always `USED` or `RETURNED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkState {
    New = 0,
    Used = 1,
    Returned = 2,
    Disposed = 3,
}

impl ChunkState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChunkState::New,
            1 => ChunkState::Used,
            2 => ChunkState::Returned,
            _ => ChunkState::Disposed,
        }
    }
}

/// Opaque identity of the pool a chunk was borrowed from.
///
/// `offer_chunk` rejects chunks whose pool identity doesn't match the
/// buffer's own pool; this is the value compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u64);

/// Identity of a single chunk slab, used as the key into the pool's
/// bookkeeping map, which tracks each borrowed chunk's pool identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId(u64);

struct Slab {
    data: Box<[u8]>,
    state: AtomicU8,
    refcount: AtomicUsize,
    id: ChunkId,
}

impl Slab {
    fn new(id: ChunkId, size: usize) -> Self {
        Slab {
            data: vec![0u8; size].into_boxed_slice(),
            state: AtomicU8::new(ChunkState::New as u8),
            refcount: AtomicUsize::new(0),
            id,
        }
    }

    fn state(&self) -> ChunkState {
        ChunkState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// A chunk borrowed from a [`ChunkPool`].
///
/// Owns a fixed-size byte array plus a back-reference to its pool. A chunk
/// constructed by [`PooledChunk::wrap_foreign`] has no pool and never
/// participates in pooling.
///
/// Dropping a `PooledChunk` that is still in [`ChunkState::Used`] without
/// having been explicitly returned is treated as an abandonment and
/// logged. There's no GC finalizer in Rust, but `Drop` gives the same
/// observable guarantee for reclaiming the slab.
pub struct PooledChunk {
    slab: Arc<Slab>,
    pool: Option<Arc<PoolInner>>,
}

impl std::fmt::Debug for PooledChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledChunk")
            .field("id", &self.slab.id)
            .field("state", &self.slab.state())
            .field("refcount", &self.refcount())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl PooledChunk {
    /// Wraps a foreign byte array that never participates in pooling.
    pub fn wrap_foreign(data: Vec<u8>) -> Self {
        let slab = Arc::new(Slab {
            data: data.into_boxed_slice(),
            state: AtomicU8::new(ChunkState::Used as u8),
            refcount: AtomicUsize::new(1),
            id: ChunkId(0),
        });
        PooledChunk { slab, pool: None }
    }

    pub fn id(&self) -> ChunkId {
        self.slab.id
    }

    pub fn pool_id(&self) -> Option<PoolId> {
        self.pool.as_ref().map(|p| p.id)
    }

    pub fn state(&self) -> ChunkState {
        self.slab.state()
    }

    pub fn capacity(&self) -> usize {
        self.slab.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.slab.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safe: PooledChunk handles are not shared across threads while
        // mutably borrowed; the pool only clones the Arc for shared read
        // access after a chunk is appended to a buffer (see buffer.rs).
        Arc::get_mut(&mut self.slab)
            .map(|s| &mut *s.data)
            .unwrap_or(&mut [])
    }

    pub fn refcount(&self) -> usize {
        self.slab.refcount.load(Ordering::Acquire)
    }

    /// Increments the reference count. Called exactly once per
    /// enqueue-into-a-buffer operation.
    pub fn retain(&self) {
        self.slab.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the reference count and returns the chunk to its pool
    /// (or disposes it, for foreign chunks) when it reaches zero. Called
    /// exactly once per drain/flush/dispose traversal step.
    pub fn release(&self) {
        let prev = self.slab.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev != 1 {
            return;
        }
        if let Some(pool) = &self.pool {
            pool.return_slab(&self.slab);
        }
    }

    /// Explicit, fallible return-to-pool used by callers that want the
    /// pool-contract error instead of the silent refcount-driven release.
    pub fn return_to_pool(&self) -> Result<(), PoolError> {
        match &self.pool {
            None => Ok(()),
            Some(pool) => pool.return_slab_checked(&self.slab),
        }
    }
}

impl Clone for PooledChunk {
    fn clone(&self) -> Self {
        PooledChunk {
            slab: Arc::clone(&self.slab),
            pool: self.pool.clone(),
        }
    }
}

impl Drop for PooledChunk {
    fn drop(&mut self) {
        // Only the last live handle matters for leak accounting: if other
        // clones still exist the Arc simply decrements.
        if Arc::strong_count(&self.slab) != 1 {
            return;
        }
        if let Some(pool) = &self.pool {
            if self.slab.state() == ChunkState::Used {
                pool.note_abandoned(self.slab.id);
            }
        }
    }
}

struct PoolInner {
    id: PoolId,
    chunk_size: usize,
    free: Mutex<Vec<Arc<Slab>>>,
    total_allocated: AtomicUsize,
    next_chunk_id: AtomicU64,
    // Tracks which live (non-pooled-free) chunks belong to this pool.
    // Entries are removed when a chunk returns to the free list or is
    // reclaimed as abandoned.
    live: DashMap<ChunkId, ()>,
}

impl PoolInner {
    fn alloc_slab(&self) -> Arc<Slab> {
        let id = ChunkId(self.next_chunk_id.fetch_add(1, Ordering::Relaxed));
        self.total_allocated.fetch_add(1, Ordering::AcqRel);
        self.live.insert(id, ());
        Arc::new(Slab::new(id, self.chunk_size))
    }

    fn return_slab(&self, slab: &Arc<Slab>) {
        let _ = self.return_slab_checked(slab);
    }

    fn return_slab_checked(&self, slab: &Arc<Slab>) -> Result<(), PoolError> {
        let current = slab.state();
        match current {
            ChunkState::Disposed => Ok(()),
            ChunkState::Returned => Err(PoolError::ObjectDisposed),
            ChunkState::New | ChunkState::Used => {
                slab.state.store(ChunkState::Returned as u8, Ordering::Release);
                slab.refcount.store(0, Ordering::Release);
                self.live.remove(&slab.id);
                self.free.lock().push(Arc::clone(slab));
                Ok(())
            }
        }
    }

    fn note_abandoned(&self, id: ChunkId) {
        if self.live.remove(&id).is_some() {
            self.total_allocated.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(chunk_id = id.0, "pooled chunk abandoned without return");
        }
    }
}

/// A process-wide (or explicitly scoped) pool of reusable byte chunks.
///
/// Rather than a hidden global, callers construct a `ChunkPool` explicitly
/// and pass it to [`crate::buffer::ChunkedBuffer`] / channel construction.
/// A lazily-initialized process-wide default is still provided via
/// [`ChunkPool::default_pool`] for convenience, with its lifecycle pinned
/// to the process (see that function's docs).
#[derive(Clone)]
pub struct ChunkPool {
    inner: Arc<PoolInner>,
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

impl ChunkPool {
    pub fn new(chunk_size: usize) -> Self {
        let id = PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed));
        ChunkPool {
            inner: Arc::new(PoolInner {
                id,
                chunk_size,
                free: Mutex::new(Vec::new()),
                total_allocated: AtomicUsize::new(0),
                next_chunk_id: AtomicU64::new(1),
                live: DashMap::new(),
            }),
        }
    }

    pub fn with_default_chunk_size() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }

    pub fn id(&self) -> PoolId {
        self.inner.id
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Borrows a chunk: reuses a returned slab if one is free, otherwise
    /// allocates a new one. The returned handle is in state `Used` with a
    /// refcount reset to zero.
    pub fn borrow(&self) -> PooledChunk {
        let reused = self.inner.free.lock().pop();
        let slab = match reused {
            Some(slab) => {
                slab.state.store(ChunkState::Used as u8, Ordering::Release);
                slab.refcount.store(0, Ordering::Release);
                self.inner.live.insert(slab.id, ());
                slab
            }
            None => {
                let slab = self.inner.alloc_slab();
                slab.state.store(ChunkState::Used as u8, Ordering::Release);
                slab
            }
        };
        PooledChunk {
            slab,
            pool: Some(Arc::clone(&self.inner)),
        }
    }

    /// Explicit return, exposing the pool's error contract directly
    /// (return-on-RETURNED is an error; return-on-DISPOSED is a no-op).
    pub fn return_chunk(&self, chunk: &PooledChunk) -> Result<(), PoolError> {
        if chunk.pool_id() != Some(self.id()) {
            return Err(PoolError::InvalidArgument("chunk belongs to a different pool"));
        }
        self.inner.return_slab_checked(&chunk.slab)
    }

    pub fn total_allocated(&self) -> usize {
        self.inner.total_allocated.load(Ordering::Acquire)
    }

    pub fn in_pool(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Process-wide lazily-initialized default pool. Lives for the
    /// duration of the process; there is no way to tear it down early.
    pub fn default_pool() -> Self {
        static DEFAULT: std::sync::OnceLock<ChunkPool> = std::sync::OnceLock::new();
        DEFAULT
            .get_or_init(|| ChunkPool::new(DEFAULT_CHUNK_SIZE))
            .clone()
    }
}

impl PartialEq for ChunkPool {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}
