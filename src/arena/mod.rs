//! Variable-length chunk allocator backing the shared tables.
//!
//! Tables keep a small fixed record per key and place the variable part of
//! the record (dataset payload, query text) in an arena chunk. A chunk is
//! addressed by a relocatable [`Handle`], never by a pointer, so the segment
//! may grow and move without invalidating anything stored in the tables.
//!
//! # Segment Layout
//!
//! ```text
//! 0                                                          len
//! +--------+-----------+--------+--------------+--------+------+
//! | chunk  | free      | chunk  | chunk        | free   | ...  |
//! +--------+-----------+--------+--------------+--------+------+
//! ```
//!
//! - Chunks are aligned to [`ALIGNMENT`] bytes
//! - Free regions are kept in an offset-ordered map and coalesced on free
//! - Allocation is first-fit; when nothing fits the segment doubles, up to
//!   its configured maximum
//! - New chunks are zero-filled
//!
//! The arena synchronizes internally and can be called while a table holds
//! its own exclusive lock. Chunks are never resized in place: callers that
//! need more room allocate a new chunk, copy, and free the old one.

pub mod segment;

pub use segment::SegmentRegistry;

use crate::error::Result;
use crate::Error;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};

pub const ALIGNMENT: usize = 8;

/// Relocatable reference to an arena chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    pub const INVALID: Handle = Handle(0);

    pub(crate) fn from_offset(offset: usize) -> Self {
        Handle(offset as u64 + 1)
    }

    fn offset(&self) -> Option<usize> {
        self.0.checked_sub(1).map(|o| o as usize)
    }

    pub fn is_valid(&self) -> bool {
        *self != Handle::INVALID
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Contract every chunk allocator offers to the shared tables.
pub trait ChunkAllocator: Send + Sync {
    /// Allocates a zero-filled chunk of exactly `size` bytes.
    fn allocate(&self, size: usize) -> Result<Handle>;

    /// Returns a chunk to the allocator. Freeing twice is an error.
    fn free(&self, handle: Handle) -> Result<()>;

    /// Maps a handle to its bytes. The allocator stays locked while the
    /// guard lives, so keep it short.
    fn resolve(&self, handle: Handle) -> Result<MappedMutexGuard<'_, [u8]>>;
}

struct Segment {
    bytes: Vec<u8>,
    /// offset -> length of each free region
    free: BTreeMap<usize, usize>,
    /// offset -> (reserved length, requested size) of each live chunk
    used: HashMap<usize, (usize, usize)>,
}

impl Segment {
    fn new(size: usize) -> Self {
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(0, size);
        }
        Self {
            bytes: vec![0u8; size],
            free,
            used: HashMap::new(),
        }
    }

    fn find_fit(&self, len: usize) -> Option<usize> {
        self.free
            .iter()
            .find(|(_, &free_len)| free_len >= len)
            .map(|(&offset, _)| offset)
    }

    fn take(&mut self, offset: usize, len: usize) {
        let free_len = self.free.remove(&offset).unwrap_or(0);
        if free_len > len {
            self.free.insert(offset + len, free_len - len);
        }
    }

    fn release(&mut self, mut offset: usize, mut len: usize) {
        // Merge with the following region
        if let Some(next_len) = self.free.remove(&(offset + len)) {
            len += next_len;
        }

        // Merge with the preceding region
        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                offset = prev;
                len += prev_len;
            }
        }

        self.free.insert(offset, len);
    }

    fn grow(&mut self, new_size: usize) {
        let old_size = self.bytes.len();
        self.bytes.resize(new_size, 0);
        self.release(old_size, new_size - old_size);
    }
}

/// Growable arena segment.
pub struct Arena {
    name: String,
    max_size: usize,
    segment: Mutex<Segment>,
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let segment = self.segment.lock();
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("size", &segment.bytes.len())
            .field("chunks", &segment.used.len())
            .finish()
    }
}

impl Arena {
    pub fn new(name: impl Into<String>, initial_size: usize, max_size: usize) -> Self {
        let initial = align_up(initial_size.min(max_size));
        Self {
            name: name.into(),
            max_size,
            segment: Mutex::new(Segment::new(initial)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current segment size in bytes.
    pub fn size(&self) -> usize {
        self.segment.lock().bytes.len()
    }

    /// Number of live chunks.
    pub fn chunk_count(&self) -> usize {
        self.segment.lock().used.len()
    }

    /// Bytes reserved by live chunks, including alignment padding.
    pub fn allocated_bytes(&self) -> usize {
        self.segment.lock().used.values().map(|(len, _)| len).sum()
    }

    fn locate(segment: &Segment, handle: Handle) -> Result<(usize, usize, usize)> {
        let offset = handle.offset().ok_or(Error::InvalidHandle(handle.raw()))?;
        let (reserved, requested) = segment
            .used
            .get(&offset)
            .copied()
            .ok_or(Error::InvalidHandle(handle.raw()))?;
        Ok((offset, reserved, requested))
    }
}

impl ChunkAllocator for Arena {
    fn allocate(&self, size: usize) -> Result<Handle> {
        let len = align_up(size.max(1));
        let mut segment = self.segment.lock();

        let offset = match segment.find_fit(len) {
            Some(offset) => offset,
            None => {
                let current = segment.bytes.len();
                // Room already free at the tail counts towards the request
                let tail_free = segment
                    .free
                    .iter()
                    .next_back()
                    .filter(|(&o, &l)| o + l == current)
                    .map_or(0, |(_, &l)| l);
                let needed = current + len - tail_free;
                let new_size = align_up(needed.max(current * 2)).min(self.max_size);

                if new_size < needed {
                    return Err(Error::OutOfMemory {
                        requested: size,
                        capacity: self.max_size,
                    });
                }

                tracing::debug!(
                    arena = %self.name,
                    from = current,
                    to = new_size,
                    "Growing arena segment"
                );
                segment.grow(new_size);
                segment.find_fit(len).ok_or(Error::OutOfMemory {
                    requested: size,
                    capacity: self.max_size,
                })?
            }
        };

        segment.take(offset, len);
        segment.bytes[offset..offset + len].fill(0);
        segment.used.insert(offset, (len, size));

        Ok(Handle::from_offset(offset))
    }

    fn free(&self, handle: Handle) -> Result<()> {
        let mut segment = self.segment.lock();
        let (offset, reserved, _) = Self::locate(&segment, handle)?;
        segment.used.remove(&offset);
        segment.release(offset, reserved);
        Ok(())
    }

    fn resolve(&self, handle: Handle) -> Result<MappedMutexGuard<'_, [u8]>> {
        let segment = self.segment.lock();
        let (offset, _, requested) = Self::locate(&segment, handle)?;
        Ok(MutexGuard::map(segment, |s| {
            &mut s.bytes[offset..offset + requested]
        }))
    }
}

fn align_up(size: usize) -> usize {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_resolve_free() {
        let arena = Arena::new("test", 256, 4096);

        let handle = arena.allocate(13).unwrap();
        assert!(handle.is_valid());
        {
            let mut chunk = arena.resolve(handle).unwrap();
            assert_eq!(chunk.len(), 13);
            assert!(chunk.iter().all(|b| *b == 0));
            chunk.copy_from_slice(b"hello, arena!");
        }
        assert_eq!(&*arena.resolve(handle).unwrap(), b"hello, arena!");
        assert_eq!(arena.chunk_count(), 1);
        assert_eq!(arena.allocated_bytes(), 16);

        arena.free(handle).unwrap();
        assert_eq!(arena.chunk_count(), 0);
        assert!(arena.resolve(handle).is_err());
    }

    #[test]
    fn test_double_free_is_rejected() {
        let arena = Arena::new("test", 64, 64);
        let handle = arena.allocate(8).unwrap();
        arena.free(handle).unwrap();
        match arena.free(handle) {
            Err(Error::InvalidHandle(_)) => {}
            other => panic!("Expected InvalidHandle, got {:?}", other),
        }
        assert!(arena.free(Handle::INVALID).is_err());
    }

    #[test]
    fn test_segment_grows_and_keeps_contents() {
        let arena = Arena::new("test", 32, 1024);

        let first = arena.allocate(24).unwrap();
        arena.resolve(first).unwrap().fill(0xAB);

        let second = arena.allocate(100).unwrap();
        assert!(arena.size() >= 128);

        assert!(arena.resolve(first).unwrap().iter().all(|b| *b == 0xAB));
        assert_eq!(arena.resolve(second).unwrap().len(), 100);
    }

    #[test]
    fn test_out_of_memory() {
        let arena = Arena::new("test", 32, 64);
        arena.allocate(40).unwrap();
        match arena.allocate(40) {
            Err(Error::OutOfMemory { requested, capacity }) => {
                assert_eq!(requested, 40);
                assert_eq!(capacity, 64);
            }
            other => panic!("Expected OutOfMemory, got {:?}", other),
        }
    }

    #[test]
    fn test_free_regions_coalesce() {
        let arena = Arena::new("test", 96, 96);

        let a = arena.allocate(32).unwrap();
        let b = arena.allocate(32).unwrap();
        let c = arena.allocate(32).unwrap();

        arena.free(a).unwrap();
        arena.free(c).unwrap();
        arena.free(b).unwrap();

        // Only a single contiguous region can satisfy this request
        let whole = arena.allocate(96).unwrap();
        assert_eq!(arena.resolve(whole).unwrap().len(), 96);
    }

    #[test]
    fn test_reused_chunk_is_zeroed() {
        let arena = Arena::new("test", 64, 64);
        let a = arena.allocate(16).unwrap();
        arena.resolve(a).unwrap().fill(0xFF);
        arena.free(a).unwrap();

        let b = arena.allocate(16).unwrap();
        assert!(arena.resolve(b).unwrap().iter().all(|x| *x == 0));
    }
}
