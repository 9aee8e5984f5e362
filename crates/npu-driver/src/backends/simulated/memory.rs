// SPDX-License-Identifier: AGPL-3.0-only

//! Frame-backed system memory
//!
//! Every page is a heap frame keyed by a fake physical address. Scattered
//! allocations are split into fragments separated by an unmapped guard page,
//! so region-list code sees real scatter-gather layouts. Frames are
//! reference counted: an imported foreign buffer keeps its pages alive after
//! the exporter drops its own region.

use crate::error::{NpuError, Result};
use crate::memory::{aligned_size, ForeignHandle, MemoryKind, MemoryProvider, MemoryRegion, RegionStorage, Segment};
use npu_chip::mmu::PAGE_SIZE;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// First fake physical address handed out
pub const PHYS_BASE: u64 = 0x8000_0000;

const PAGE: u64 = PAGE_SIZE as u64;

struct Frame {
    bytes: Box<[u8]>,
    refs: usize,
}

#[derive(Default)]
struct Frames {
    pages: HashMap<u64, Frame>,
    exports: HashMap<u64, Vec<Segment>>,
    next_phys: u64,
    next_export: u64,
    allocations: u64,
}

impl Frames {
    fn release(&mut self, pages: &[u64]) {
        for page in pages {
            if let Some(frame) = self.pages.get_mut(page) {
                frame.refs -= 1;
                if frame.refs == 0 {
                    self.pages.remove(page);
                }
            }
        }
    }

    fn retain(&mut self, pages: &[u64]) -> bool {
        if !pages.iter().all(|p| self.pages.contains_key(p)) {
            return false;
        }
        for page in pages {
            if let Some(frame) = self.pages.get_mut(page) {
                frame.refs += 1;
            }
        }
        true
    }

    /// Walk the frames covering `[phys, phys + len)`
    fn for_each_frame(
        &mut self,
        phys: u64,
        len: usize,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> bool {
        let mut done = 0usize;
        while done < len {
            let addr = phys + done as u64;
            let page = addr - addr % PAGE;
            let inner = (addr - page) as usize;
            let n = (PAGE_SIZE - inner).min(len - done);
            let Some(frame) = self.pages.get_mut(&page) else {
                return false;
            };
            f(&mut frame.bytes[inner..inner + n], done);
            done += n;
        }
        true
    }
}

fn pages_of(segments: &[Segment]) -> Vec<u64> {
    segments
        .iter()
        .flat_map(|s| (0..s.len as u64 / PAGE).map(move |i| s.phys + i * PAGE))
        .collect()
}

/// Storage of one region over the shared frame pool
struct FrameStorage {
    frames: Arc<Mutex<Frames>>,
    pages: Vec<u64>,
}

impl RegionStorage for FrameStorage {
    fn read(&self, phys: u64, buf: &mut [u8]) {
        let mut frames = self.frames.lock();
        frames.for_each_frame(phys, buf.len(), |src, at| {
            buf[at..at + src.len()].copy_from_slice(src);
        });
    }

    fn write(&self, phys: u64, data: &[u8]) {
        let mut frames = self.frames.lock();
        frames.for_each_frame(phys, data.len(), |dst, at| {
            dst.copy_from_slice(&data[at..at + dst.len()]);
        });
    }
}

impl Drop for FrameStorage {
    fn drop(&mut self) {
        self.frames.lock().release(&self.pages);
    }
}

/// Simulated system memory
pub struct SystemMemory {
    frames: Arc<Mutex<Frames>>,
    capacity: usize,
    fragment_pages: usize,
}

impl fmt::Debug for SystemMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemMemory")
            .field("capacity", &self.capacity)
            .field("fragment_pages", &self.fragment_pages)
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}

impl SystemMemory {
    /// Memory of `capacity` bytes whose scattered allocations are split
    /// every `fragment_pages` pages (0: never split)
    pub fn new(capacity: usize, fragment_pages: usize) -> Self {
        Self {
            frames: Arc::new(Mutex::new(Frames {
                next_phys: PHYS_BASE,
                next_export: 1,
                ..Frames::default()
            })),
            capacity,
            fragment_pages,
        }
    }

    /// Bytes currently backed by frames
    pub fn live_bytes(&self) -> usize {
        self.frames.lock().pages.len() * PAGE_SIZE
    }

    /// Allocations served so far
    pub fn allocations(&self) -> u64 {
        self.frames.lock().allocations
    }

    fn region(&self, segments: Vec<Segment>) -> MemoryRegion {
        let pages = pages_of(&segments);
        MemoryRegion::new(
            segments,
            Box::new(FrameStorage {
                frames: Arc::clone(&self.frames),
                pages,
            }),
        )
    }

    /// True if every byte of `[phys, phys + len)` is backed
    pub fn contains(&self, phys: u64, len: usize) -> bool {
        let Some(end) = phys.checked_add(len as u64) else {
            return false;
        };
        let frames = self.frames.lock();
        let mut page = phys - phys % PAGE;
        while page < end {
            if !frames.pages.contains_key(&page) {
                return false;
            }
            page += PAGE;
        }
        true
    }

    /// Copy `data` to physical address `phys`
    ///
    /// # Errors
    ///
    /// Returns error if part of the range is not backed.
    pub fn write_phys(&self, phys: u64, data: &[u8]) -> Result<()> {
        let mut frames = self.frames.lock();
        if frames.for_each_frame(phys, data.len(), |dst, at| {
            dst.copy_from_slice(&data[at..at + dst.len()]);
        }) {
            Ok(())
        } else {
            Err(NpuError::usage(format!("physical write at {phys:#x} hits unbacked memory")))
        }
    }

    /// Copy `len` bytes from physical address `phys`
    ///
    /// # Errors
    ///
    /// Returns error if part of the range is not backed.
    pub fn read_phys(&self, phys: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        let mut frames = self.frames.lock();
        if frames.for_each_frame(phys, len, |src, at| {
            out[at..at + src.len()].copy_from_slice(src);
        }) {
            Ok(out)
        } else {
            Err(NpuError::usage(format!("physical read at {phys:#x} hits unbacked memory")))
        }
    }

    /// Allocate a buffer on behalf of another subsystem and export it.
    /// The returned region is the exporter's mapping.
    ///
    /// # Errors
    ///
    /// Returns error if the memory cannot be allocated.
    pub fn export(&self, size: usize) -> Result<(ForeignHandle, MemoryRegion)> {
        let region = self.allocate(size, MemoryKind::Scattered)?;
        let mut frames = self.frames.lock();
        let id = frames.next_export;
        frames.next_export += 1;
        frames.exports.insert(id, region.segments().to_vec());
        debug!("Exported {} B as foreign handle {}", region.size(), id);
        Ok((ForeignHandle(id), region))
    }
}

impl MemoryProvider for SystemMemory {
    fn allocate(&self, size: usize, kind: MemoryKind) -> Result<MemoryRegion> {
        let size = aligned_size(size)?;
        let page_count = size / PAGE_SIZE;

        let segments = {
            let mut frames = self.frames.lock();
            let live = frames.pages.len() * PAGE_SIZE;
            if live + size > self.capacity {
                warn!(
                    "Out of memory: {} B requested, {} of {} B in use",
                    size, live, self.capacity
                );
                return Err(NpuError::resource(format!(
                    "out of memory allocating {size} bytes"
                )));
            }

            let chunk = match kind {
                MemoryKind::Scattered if self.fragment_pages > 0 => self.fragment_pages,
                _ => page_count,
            };
            let mut segments = Vec::new();
            let mut left = page_count;
            while left > 0 {
                let n = chunk.min(left);
                let phys = frames.next_phys;
                for i in 0..n as u64 {
                    frames.pages.insert(
                        phys + i * PAGE,
                        Frame {
                            bytes: vec![0u8; PAGE_SIZE].into_boxed_slice(),
                            refs: 1,
                        },
                    );
                }
                // guard page between fragments
                frames.next_phys = phys + (n as u64 + 1) * PAGE;
                segments.push(Segment {
                    phys,
                    len: n * PAGE_SIZE,
                });
                left -= n;
            }
            frames.allocations += 1;
            segments
        };

        Ok(self.region(segments))
    }

    fn import(&self, handle: ForeignHandle) -> Result<MemoryRegion> {
        let segments = {
            let mut frames = self.frames.lock();
            let segments = frames
                .exports
                .get(&handle.0)
                .cloned()
                .ok_or_else(|| NpuError::not_found("foreign buffer", handle.0))?;
            if !frames.retain(&pages_of(&segments)) {
                frames.exports.remove(&handle.0);
                return Err(NpuError::not_found("foreign buffer", handle.0));
            }
            segments
        };
        Ok(self.region(segments))
    }
}
