//! Memory framework adapter
//!
//! The driver never allocates device memory itself. A [`MemoryProvider`]
//! hands out [`MemoryRegion`]s, each described by its physical segments and
//! backed by provider-specific storage. A region frees its memory when
//! dropped, so every owner releases exactly what it holds.

use crate::error::{NpuError, Result};
use npu_chip::mmu::page_align;
use std::fmt;

/// One physically contiguous piece of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Physical start address
    pub phys: u64,
    /// Length in bytes
    pub len: usize,
}

/// Placement requested for an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// A single physically contiguous segment
    Contiguous,
    /// Any number of page-aligned segments
    Scattered,
}

/// Opaque handle to memory exported by another subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForeignHandle(pub u64);

/// Byte access to the memory behind a region's segments
pub trait RegionStorage: Send + Sync {
    /// Copy `buf.len()` bytes starting at physical address `phys`. The range
    /// lies within one segment of the owning region.
    fn read(&self, phys: u64, buf: &mut [u8]);

    /// Copy `data` to physical address `phys`. The range lies within one
    /// segment of the owning region.
    fn write(&self, phys: u64, data: &[u8]);
}

/// Source of device-visible memory
pub trait MemoryProvider: Send + Sync + fmt::Debug {
    /// Allocate at least `size` bytes, rounded up to the page size
    ///
    /// # Errors
    ///
    /// Returns error if the memory cannot be provided.
    fn allocate(&self, size: usize, kind: MemoryKind) -> Result<MemoryRegion>;

    /// Map memory exported by another subsystem
    ///
    /// # Errors
    ///
    /// Returns error if the handle is unknown or no longer backed.
    fn import(&self, handle: ForeignHandle) -> Result<MemoryRegion>;
}

/// Exclusively owned device memory
pub struct MemoryRegion {
    segments: Vec<Segment>,
    size: usize,
    storage: Box<dyn RegionStorage>,
}

impl MemoryRegion {
    /// Region over `segments`, accessed through `storage`
    pub fn new(segments: Vec<Segment>, storage: Box<dyn RegionStorage>) -> Self {
        let size = segments.iter().map(|s| s.len).sum();
        Self {
            segments,
            size,
            storage,
        }
    }

    /// Total size in bytes
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Physical segments in address order of the region
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// True if the region is a single segment
    pub fn is_contiguous(&self) -> bool {
        self.segments.len() == 1
    }

    /// Physical address of the first byte
    pub fn phys_base(&self) -> Option<u64> {
        self.segments.first().map(|s| s.phys)
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(NpuError::usage(format!(
                "access of {len} bytes at offset {offset} exceeds region of {} bytes",
                self.size
            ))),
        }
    }

    /// Walk the segment pieces covering `[offset, offset + len)`
    fn for_each_piece(&self, offset: usize, len: usize, mut f: impl FnMut(u64, usize, usize)) {
        let mut seg_start = 0usize;
        let mut done = 0usize;
        for seg in &self.segments {
            if done == len {
                break;
            }
            let seg_end = seg_start + seg.len;
            let pos = offset + done;
            if pos < seg_end {
                let inner = pos - seg_start;
                let n = (seg.len - inner).min(len - done);
                f(seg.phys + inner as u64, done, n);
                done += n;
            }
            seg_start = seg_end;
        }
    }

    /// Read `buf.len()` bytes at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the region.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        let storage = &self.storage;
        self.for_each_piece(offset, buf.len(), |phys, at, n| {
            storage.read(phys, &mut buf[at..at + n]);
        });
        Ok(())
    }

    /// Read `len` bytes at `offset` into a new vector
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the region.
    pub fn read_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out)?;
        Ok(out)
    }

    /// Write `data` at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the region.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let storage = &self.storage;
        self.for_each_piece(offset, data.len(), |phys, at, n| {
            storage.write(phys, &data[at..at + n]);
        });
        Ok(())
    }

    /// Zero the whole region
    ///
    /// # Errors
    ///
    /// Returns error only if the storage rejects the write.
    pub fn clear(&self) -> Result<()> {
        self.write(0, &vec![0u8; self.size])
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("size", &self.size)
            .field("segments", &self.segments.len())
            .finish_non_exhaustive()
    }
}

/// Page-align an allocation request
///
/// # Errors
///
/// Returns error for a zero or overflowing size.
pub fn aligned_size(size: usize) -> Result<usize> {
    if size == 0 {
        return Err(NpuError::usage("zero-sized allocation"));
    }
    page_align(size).ok_or_else(|| NpuError::resource(format!("allocation of {size} bytes overflows")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Byte-addressed storage keyed by physical address
    #[derive(Default)]
    struct FlatStorage(Arc<Mutex<HashMap<u64, u8>>>);

    impl RegionStorage for FlatStorage {
        fn read(&self, phys: u64, buf: &mut [u8]) {
            let bytes = self.0.lock();
            for (i, b) in buf.iter_mut().enumerate() {
                *b = bytes.get(&(phys + i as u64)).copied().unwrap_or(0);
            }
        }

        fn write(&self, phys: u64, data: &[u8]) {
            let mut bytes = self.0.lock();
            for (i, b) in data.iter().enumerate() {
                bytes.insert(phys + i as u64, *b);
            }
        }
    }

    fn two_segment_region() -> (MemoryRegion, Arc<Mutex<HashMap<u64, u8>>>) {
        let storage = FlatStorage::default();
        let bytes = Arc::clone(&storage.0);
        let region = MemoryRegion::new(
            vec![
                Segment { phys: 0x1000, len: 8 },
                Segment { phys: 0x9000, len: 8 },
            ],
            Box::new(storage),
        );
        (region, bytes)
    }

    #[test]
    fn test_write_spans_segments() {
        let (region, bytes) = two_segment_region();
        assert_eq!(region.size(), 16);
        assert!(!region.is_contiguous());

        region.write(6, &[1, 2, 3, 4]).unwrap();
        let bytes = bytes.lock();
        assert_eq!(bytes.get(&0x1006), Some(&1));
        assert_eq!(bytes.get(&0x1007), Some(&2));
        assert_eq!(bytes.get(&0x9000), Some(&3));
        assert_eq!(bytes.get(&0x9001), Some(&4));
    }

    #[test]
    fn test_read_back_and_bounds() {
        let (region, _) = two_segment_region();
        region.write(0, &[9; 16]).unwrap();
        assert_eq!(region.read_vec(4, 8).unwrap(), vec![9; 8]);
        assert!(region.read_vec(10, 7).is_err());
        assert!(region.write(usize::MAX, &[1]).is_err());
    }

    #[test]
    fn test_aligned_size() {
        assert_eq!(aligned_size(1).unwrap(), 4096);
        assert!(matches!(aligned_size(0), Err(NpuError::Usage { .. })));
        assert!(matches!(aligned_size(usize::MAX), Err(NpuError::Resource { .. })));
    }
}
