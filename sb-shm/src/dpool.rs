use std::sync::Arc;

use parking_lot::Mutex;
use sb_core::PipelineError;

use crate::shm::{PageRun, Shm};

/// After this many `free` calls, the pool is considered fragmented enough
/// that a session should be duplicated into a fresh pool rather than kept
/// alive here — spec §9 open question #2, matching the original
/// `dpool_is_fragmented` threshold of 256 free counts exactly.
pub const FRAGMENTATION_THRESHOLD: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    offset: usize,
    len: usize,
}

struct Chunk {
    run: PageRun,
    capacity: usize,
    used: usize,
    free: Vec<ByteRange>,
}

impl Chunk {
    fn new(run: PageRun, capacity: usize) -> Self {
        Self {
            run,
            capacity,
            used: 0,
            free: vec![ByteRange {
                offset: 0,
                len: capacity,
            }],
        }
    }

    fn allocate(&mut self, size: usize) -> Option<ByteRange> {
        let idx = self.free.iter().position(|r| r.len >= size)?;
        let slot = self.free[idx];
        let taken = ByteRange {
            offset: slot.offset,
            len: size,
        };
        if slot.len == size {
            self.free.remove(idx);
        } else {
            self.free[idx] = ByteRange {
                offset: slot.offset + size,
                len: slot.len - size,
            };
        }
        self.used += size;
        Some(taken)
    }

    fn free_range(&mut self, range: ByteRange) {
        self.used -= range.len;
        let pos = self
            .free
            .iter()
            .position(|r| r.offset > range.offset)
            .unwrap_or(self.free.len());
        self.free.insert(pos, range);

        if pos + 1 < self.free.len() {
            let next = self.free[pos + 1];
            if self.free[pos].offset + self.free[pos].len == next.offset {
                self.free[pos].len += next.len;
                self.free.remove(pos + 1);
            }
        }
        if pos > 0 {
            let prev = self.free[pos - 1];
            if prev.offset + prev.len == self.free[pos].offset {
                self.free[pos - 1].len += self.free[pos].len;
                self.free.remove(pos);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.used == 0
    }
}

/// Opaque handle to a `DPool` allocation.
#[derive(Debug, Clone, Copy)]
pub struct DAlloc {
    chunk_id: usize,
    range: ByteRange,
}

/// A small sub-allocator carved out of one or more [`Shm`] pages, grounded
/// on the original `dpool`/`dpool_chunk`: allocations larger than a single
/// chunk are rejected (the original never spans an allocation across
/// chunks either), chunks are requested from `Shm` lazily, and an empty
/// non-first chunk is returned to `Shm` immediately.
pub struct DPool {
    shm: Arc<Shm>,
    chunk_pages: usize,
    chunks: Mutex<Vec<Chunk>>,
    free_counter: Mutex<u32>,
}

impl DPool {
    /// Allocate a pool's first chunk from `shm`. Returns `None` if `shm` has
    /// no room, mirroring `dpool_new`'s ability to fail (the session
    /// manager retries via `Purge` on this, exactly as `session_new_unsafe`
    /// does for the original `dpool_new`).
    pub fn try_new(shm: Arc<Shm>) -> Option<Self> {
        let chunk_pages = 1;
        let run = shm.allocate(chunk_pages)?;
        let capacity = shm.page_size() * chunk_pages;
        Some(Self {
            shm,
            chunk_pages,
            chunks: Mutex::new(vec![Chunk::new(run, capacity)]),
            free_counter: Mutex::new(0),
        })
    }

    pub fn is_fragmented(&self) -> bool {
        *self.free_counter.lock() >= FRAGMENTATION_THRESHOLD
    }

    /// Approximate total bytes currently allocated across all chunks —
    /// used as one input to the session manager's purge score.
    pub fn total_used(&self) -> usize {
        self.chunks.lock().iter().map(|c| c.used).sum()
    }

    pub fn allocate(&self, size: usize) -> Result<DAlloc, PipelineError> {
        let mut chunks = self.chunks.lock();
        let chunk_capacity = chunks[0].capacity;
        if size > chunk_capacity {
            return Err(PipelineError::Resource(format!(
                "allocation of {size} bytes exceeds chunk capacity {chunk_capacity}"
            )));
        }

        for (id, chunk) in chunks.iter_mut().enumerate() {
            if let Some(range) = chunk.allocate(size) {
                return Ok(DAlloc {
                    chunk_id: id,
                    range,
                });
            }
        }

        let run = self.shm.allocate(self.chunk_pages).ok_or_else(|| {
            tracing::warn!(chunks = chunks.len(), size, "dpool growth failed, shm exhausted");
            PipelineError::Oom("shm exhausted while growing a pool".into())
        })?;
        let mut chunk = Chunk::new(run, chunk_capacity);
        let range = chunk.allocate(size).expect("fresh chunk fits the request");
        chunks.push(chunk);
        Ok(DAlloc {
            chunk_id: chunks.len() - 1,
            range,
        })
    }

    pub fn free(&self, alloc: DAlloc) {
        let mut counter = self.free_counter.lock();
        *counter += 1;
        if *counter == FRAGMENTATION_THRESHOLD {
            tracing::debug!(free_count = *counter, "dpool crossed fragmentation threshold");
        }
        drop(counter);

        let mut chunks = self.chunks.lock();
        chunks[alloc.chunk_id].free_range(alloc.range);

        if alloc.chunk_id != 0 && chunks[alloc.chunk_id].is_empty() {
            let chunk = chunks.remove(alloc.chunk_id);
            self.shm.free(chunk.run);
        }
    }

    pub fn with_bytes<R>(&self, alloc: DAlloc, f: impl FnOnce(&[u8]) -> R) -> R {
        let chunks = self.chunks.lock();
        let run = chunks[alloc.chunk_id].run;
        drop(chunks);
        self.shm
            .with_slice(run, |buf| f(&buf[alloc.range.offset..alloc.range.offset + alloc.range.len]))
    }

    pub fn with_bytes_mut<R>(&self, alloc: DAlloc, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let chunks = self.chunks.lock();
        let run = chunks[alloc.chunk_id].run;
        drop(chunks);
        self.shm.with_slice_mut(run, |buf| {
            f(&mut buf[alloc.range.offset..alloc.range.offset + alloc.range.len])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_write_read_roundtrip() {
        let shm = Arc::new(Shm::new(256, 8));
        let pool = DPool::try_new(shm).unwrap();
        let alloc = pool.allocate(16).unwrap();
        pool.with_bytes_mut(alloc, |buf| buf[..5].copy_from_slice(b"hello"));
        pool.with_bytes(alloc, |buf| assert_eq!(&buf[..5], b"hello"));
    }

    #[test]
    fn test_allocation_larger_than_chunk_errors() {
        let shm = Arc::new(Shm::new(64, 8));
        let pool = DPool::try_new(shm).unwrap();
        assert!(pool.allocate(1024).is_err());
    }

    #[test]
    fn test_grows_beyond_first_chunk_and_reclaims_empty_chunk() {
        let shm = Arc::new(Shm::new(64, 8));
        let pool = DPool::try_new(shm.clone()).unwrap();
        let a = pool.allocate(64).unwrap();
        let b = pool.allocate(32).unwrap();
        assert_eq!(pool.chunks.lock().len(), 2);

        pool.free(b);
        assert_eq!(pool.chunks.lock().len(), 1, "empty non-first chunk is returned to shm");
        pool.free(a);
    }

    #[test]
    fn test_is_fragmented_after_threshold_frees() {
        let shm = Arc::new(Shm::new(4096, 8));
        let pool = DPool::try_new(shm).unwrap();
        for _ in 0..FRAGMENTATION_THRESHOLD {
            let a = pool.allocate(8).unwrap();
            pool.free(a);
        }
        assert!(pool.is_fragmented());
    }
}
