//! Aligned data buffers and chunked IOVs.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use tagio::IoRegion;

use crate::pool::{Pool, PoolItem};
use crate::random;

/// Required alignment of data chunks.
pub const ALIGNMENT: usize = 4096;

/// Number of chunks needed to carry `data_size` bytes.
#[inline]
pub fn chunk_count(data_size: u64, chunk_size: usize) -> usize {
    ((data_size + chunk_size as u64 - 1) / chunk_size as u64) as usize
}

/// A single aligned region of fixed capacity with a logical size.
///
/// The allocation never moves, so regions handed to the transport stay
/// valid while the buffer is alive.
pub struct Buffer {
    ptr: NonNull<u8>,
    capacity: usize,
    size: usize,
}

impl PoolItem for Buffer {
    fn alloc(size: usize) -> Self {
        Buffer::new(size)
    }
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        let layout = Layout::from_size_align(capacity, ALIGNMENT).expect("bad chunk layout");
        // Safety: layout has non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        let ptr = match NonNull::new(ptr) {
            Some(p) => p,
            None => alloc::handle_alloc_error(layout),
        };
        Self {
            ptr,
            capacity,
            size: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Set the logical size; must not exceed the capacity.
    #[inline]
    pub fn resize(&mut self, size: usize) {
        assert!(size <= self.capacity);
        self.size = size;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: ptr covers `capacity >= size` initialized-on-write
        // bytes; readers only see bytes the transport or fill wrote.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: same as as_slice, exclusive via &mut.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    /// Region over the logical size, for posting to the transport.
    ///
    /// # Safety
    /// The buffer must stay alive, unmoved and untouched until the
    /// posted operation completes.
    #[inline]
    pub unsafe fn region(&self) -> IoRegion {
        IoRegion::new(self.ptr.as_ptr(), self.size)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, ALIGNMENT).unwrap();
        // Safety: allocated in new() with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

/// An ordered sequence of chunks backing one payload.
///
/// Owns its chunks from `init` until `release`, which returns the
/// chunks to the chunk pool; the IOV object itself then goes back to
/// the IOV pool.
pub struct BufferIov {
    data_size: u64,
    iov: Vec<Buffer>,
}

impl PoolItem for BufferIov {
    fn alloc(max_chunks: usize) -> Self {
        Self {
            data_size: 0,
            iov: Vec::with_capacity(max_chunks),
        }
    }
}

impl BufferIov {
    /// Number of chunks.
    #[inline]
    pub fn size(&self) -> usize {
        self.iov.len()
    }

    /// Total payload size in bytes.
    #[inline]
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Acquire `ceil(data_size / chunk_size)` chunks, each resized to
    /// the portion it carries (last one may be shorter). When `fill` is
    /// set the chunks are filled from the RNG seeded with `sn`.
    pub fn init(&mut self, data_size: u64, chunk_pool: &mut Pool<Buffer>, sn: u32, fill: bool) {
        assert!(self.iov.is_empty());
        assert!(data_size > 0);

        self.data_size = data_size;
        let count = chunk_count(data_size, chunk_pool.item_size());
        let mut remaining = data_size as usize;
        for _ in 0..count {
            let mut chunk = chunk_pool.get();
            let take = chunk.capacity().min(remaining);
            chunk.resize(take);
            remaining -= take;
            self.iov.push(chunk);
        }
        assert_eq!(remaining, 0);

        if fill {
            let mut seed = sn;
            for chunk in &mut self.iov {
                random::fill(&mut seed, chunk.as_mut_slice());
            }
        }
    }

    /// Verify the payload against the RNG sequence seeded with `sn`.
    /// Returns the byte offset of the first mismatch, `None` on a full
    /// match.
    pub fn validate(&self, sn: u32) -> Option<usize> {
        assert!(!self.iov.is_empty());
        let mut seed = sn;
        let mut offset = 0;
        for chunk in &self.iov {
            let pos = random::validate(&mut seed, chunk.as_slice());
            offset += pos;
            if pos < chunk.len() {
                return Some(offset);
            }
        }
        None
    }

    /// Return the chunks to their pool and clear the IOV.
    pub fn release(&mut self, chunk_pool: &mut Pool<Buffer>) {
        while let Some(chunk) = self.iov.pop() {
            chunk_pool.put(chunk);
        }
        self.data_size = 0;
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Buffer> {
        self.iov.iter()
    }
}

impl std::ops::Index<usize> for BufferIov {
    type Output = Buffer;

    #[inline]
    fn index(&self, i: usize) -> &Buffer {
        &self.iov[i]
    }
}

impl std::ops::IndexMut<usize> for BufferIov {
    #[inline]
    fn index_mut(&mut self, i: usize) -> &mut Buffer {
        &mut self.iov[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(1, 4096), 1);
        assert_eq!(chunk_count(4096, 4096), 1);
        assert_eq!(chunk_count(4097, 4096), 2);
        assert_eq!(chunk_count(10_000, 4096), 3);
    }

    #[test]
    fn test_buffer_alignment_and_resize() {
        let mut buf = Buffer::new(4096);
        assert_eq!(buf.as_slice().as_ptr() as usize % ALIGNMENT, 0);
        assert_eq!(buf.len(), 0);
        buf.resize(100);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.capacity(), 4096);
    }

    #[test]
    #[should_panic]
    fn test_buffer_resize_over_capacity() {
        let mut buf = Buffer::new(64);
        buf.resize(65);
    }

    #[test]
    fn test_iov_chunking() {
        let mut chunks: Pool<Buffer> = Pool::new(4096, "data chunks");
        let mut iov = BufferIov::alloc(4);

        iov.init(10_000, &mut chunks, 1, false);
        assert_eq!(iov.size(), 3);
        assert_eq!(iov[0].len(), 4096);
        assert_eq!(iov[1].len(), 4096);
        assert_eq!(iov[2].len(), 1808);
        assert_eq!(iov.data_size(), 10_000);

        iov.release(&mut chunks);
        assert_eq!(iov.size(), 0);
    }

    #[test]
    fn test_iov_release_restores_pool() {
        let mut chunks: Pool<Buffer> = Pool::new(1024, "data chunks");
        let mut iov = BufferIov::alloc(8);

        iov.init(5000, &mut chunks, 3, false);
        let allocated = chunks.allocated();
        iov.release(&mut chunks);

        // Re-acquiring the same shape must not grow the pool.
        iov.init(5000, &mut chunks, 4, false);
        assert_eq!(chunks.allocated(), allocated);
        iov.release(&mut chunks);
    }

    #[test]
    fn test_iov_fill_validate() {
        let mut chunks: Pool<Buffer> = Pool::new(512, "data chunks");
        let mut iov = BufferIov::alloc(8);

        iov.init(2000, &mut chunks, 77, true);
        assert_eq!(iov.validate(77), None);
        // A different seed must not validate.
        assert!(iov.validate(78).is_some());
        iov.release(&mut chunks);
    }

    #[test]
    fn test_iov_validate_offset_spans_chunks() {
        let mut chunks: Pool<Buffer> = Pool::new(256, "data chunks");
        let mut iov = BufferIov::alloc(8);

        iov.init(1000, &mut chunks, 5, true);
        // Corrupt a byte in the third chunk.
        let err_at = 2 * 256 + 40;
        iov[2].as_mut_slice()[40] ^= 0xff;
        let pos = iov.validate(5).expect("corruption must be detected");
        // Mismatch is reported at word granularity within the chunk.
        assert_eq!(pos / 8, err_at / 8);
        iov.release(&mut chunks);
    }
}
