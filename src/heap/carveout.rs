//! Carveout heap: physically-contiguous allocations from one linearly-mapped
//! region.
//!
//! The region is mapped read-write for its whole lifetime, so every page has
//! a linear address (lowmem-modeled) and allocations support the
//! physical-address query (the region offset stands in for the physical
//! address). Allocation is first-fit over a coalescing free-range list.

use super::{Allocation, Heap, HeapId, HeapType};
use crate::error::{Error, Result};
use crate::flags::BufferFlags;
use crate::sg::{PageFrame, SgSegment, SgTable, PAGE_SIZE};
use crate::usermap::UserMapping;
use rustix::fd::OwnedFd;
use rustix::fs::MemfdFlags;
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

/// Physically-contiguous heap over one linearly-mapped memfd region.
pub struct CarveoutHeap {
    id: HeapId,
    name: String,
    fd: Arc<OwnedFd>,
    base: NonNull<u8>,
    size: usize,
    ranges: Mutex<RangeAllocator>,
}

// SAFETY: base is a stable mapping for the heap's lifetime; concurrent
// access to allocated ranges is the callers' concern, as with any heap.
unsafe impl Send for CarveoutHeap {}
unsafe impl Sync for CarveoutHeap {}

/// Heap-private allocation state: byte offset of the contiguous range.
struct CarveoutAllocation {
    offset: usize,
}

impl CarveoutHeap {
    /// Create a carveout heap of `size` bytes (rounded up to whole pages).
    pub fn new(id: HeapId, name: &str, size: usize) -> Result<Arc<Self>> {
        let size = crate::sg::page_align(size.max(PAGE_SIZE));
        let fd = rustix::fs::memfd_create(format!("ionpool-{name}"), MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;
        let base = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| Error::InvalidArgument("mmap returned null".into()))?;
        Ok(Arc::new(Self {
            id,
            name: name.to_owned(),
            fd: Arc::new(fd),
            base,
            size,
            ranges: Mutex::new(RangeAllocator::new(size)),
        }))
    }

    /// Bytes currently unallocated.
    pub fn free_bytes(&self) -> usize {
        self.ranges.lock().unwrap().free_bytes()
    }

    /// Total region size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    fn offset_of(&self, allocation: &Allocation) -> usize {
        allocation
            .state::<CarveoutAllocation>()
            .map(|s| s.offset)
            .unwrap_or(0)
    }

    fn linear_at(&self, offset: usize) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }
}

impl Drop for CarveoutHeap {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.size);
        }
    }
}

impl Heap for CarveoutHeap {
    fn id(&self) -> HeapId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn heap_type(&self) -> HeapType {
        HeapType::Carveout
    }

    fn allocate(&self, len: usize, align: usize, flags: BufferFlags) -> Result<Allocation> {
        let align = align.max(PAGE_SIZE);
        if !align.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "alignment {align} is not a power of two"
            )));
        }
        let offset = self
            .ranges
            .lock()
            .unwrap()
            .allocate(len, align)
            .ok_or(Error::OutOfMemory)?;
        if !flags.contains(BufferFlags::NOZEROED) {
            let span =
                unsafe { std::slice::from_raw_parts_mut(self.linear_at(offset).as_ptr(), len) };
            span.fill(0);
        }
        Ok(Allocation::new(self.id, len, CarveoutAllocation { offset }))
    }

    fn free(&self, allocation: Allocation) {
        let offset = self.offset_of(&allocation);
        self.ranges.lock().unwrap().free(offset, allocation.len());
    }

    fn map_dma(&self, allocation: &Allocation) -> Result<SgTable> {
        let offset = self.offset_of(allocation);
        let mut table = SgTable::new();
        table.push(SgSegment {
            frame: PageFrame::with_linear(
                Arc::clone(&self.fd),
                offset as u64,
                self.linear_at(offset),
            ),
            offset: 0,
            len: allocation.len() as u32,
        });
        Ok(table)
    }

    fn map_kernel(&self, allocation: &Allocation) -> Result<NonNull<u8>> {
        // The region is permanently mapped; a kernel mapping is just the
        // linear address of the range.
        Ok(self.linear_at(self.offset_of(allocation)))
    }

    fn map_user(&self, _allocation: &Allocation, mapping: &UserMapping) -> Result<()> {
        mapping.install_all();
        Ok(())
    }

    fn phys(&self, allocation: &Allocation) -> Result<(u64, usize)> {
        Ok((self.offset_of(allocation) as u64, allocation.len()))
    }
}

/// First-fit allocator over free byte ranges, coalescing on free.
struct RangeAllocator {
    /// Free ranges as (offset, len), sorted by offset, non-adjacent.
    free: Vec<(usize, usize)>,
    free_bytes: usize,
}

impl RangeAllocator {
    fn new(size: usize) -> Self {
        Self {
            free: vec![(0, size)],
            free_bytes: size,
        }
    }

    fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    fn allocate(&mut self, len: usize, align: usize) -> Option<usize> {
        for i in 0..self.free.len() {
            let (start, range_len) = self.free[i];
            let aligned = (start + align - 1) & !(align - 1);
            let pad = aligned - start;
            if pad + len > range_len {
                continue;
            }
            // Claim [aligned, aligned + len); return the head padding and
            // the tail remainder to the free list.
            self.free.remove(i);
            if pad > 0 {
                self.free.insert(i, (start, pad));
            }
            let tail = range_len - pad - len;
            if tail > 0 {
                let at = if pad > 0 { i + 1 } else { i };
                self.free.insert(at, (aligned + len, tail));
            }
            self.free_bytes -= len;
            return Some(aligned);
        }
        None
    }

    fn free(&mut self, offset: usize, len: usize) {
        let at = self
            .free
            .partition_point(|&(start, _)| start < offset);
        self.free.insert(at, (offset, len));
        self.free_bytes += len;
        // Coalesce with the following range, then the preceding one.
        if at + 1 < self.free.len() && offset + len == self.free[at + 1].0 {
            self.free[at].1 += self.free[at + 1].1;
            self.free.remove(at + 1);
        }
        if at > 0 && self.free[at - 1].0 + self.free[at - 1].1 == offset {
            self.free[at - 1].1 += self.free[at].1;
            self.free.remove(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_allocation_and_phys() {
        let heap = CarveoutHeap::new(1, "carveout", 16 * PAGE_SIZE).unwrap();
        let allocation = heap
            .allocate(4 * PAGE_SIZE, 0, BufferFlags::empty())
            .unwrap();

        let (phys, len) = heap.phys(&allocation).unwrap();
        assert_eq!(len, 4 * PAGE_SIZE);

        let table = heap.map_dma(&allocation).unwrap();
        assert_eq!(table.segments().len(), 1);
        assert_eq!(table.segments()[0].frame.offset(), phys);
        assert!(table.segments()[0].frame.linear().is_some());

        heap.free(allocation);
        assert_eq!(heap.free_bytes(), 16 * PAGE_SIZE);
    }

    #[test]
    fn test_first_fit_coalescing() {
        let mut ranges = RangeAllocator::new(10 * PAGE_SIZE);
        let a = ranges.allocate(2 * PAGE_SIZE, PAGE_SIZE).unwrap();
        let b = ranges.allocate(3 * PAGE_SIZE, PAGE_SIZE).unwrap();
        let c = ranges.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!((a, b, c), (0, 2 * PAGE_SIZE, 5 * PAGE_SIZE));

        // Free a and b out of order; they must merge into one range.
        ranges.free(b, 3 * PAGE_SIZE);
        ranges.free(a, 2 * PAGE_SIZE);
        assert_eq!(ranges.free_bytes(), 9 * PAGE_SIZE);
        // A 5-page request only fits if [0, 5 pages) coalesced.
        assert_eq!(ranges.allocate(5 * PAGE_SIZE, PAGE_SIZE), Some(0));
    }

    #[test]
    fn test_alignment_honored() {
        let heap = CarveoutHeap::new(1, "carveout", 64 * PAGE_SIZE).unwrap();
        let small = heap.allocate(PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        let aligned = heap
            .allocate(PAGE_SIZE, 16 * PAGE_SIZE, BufferFlags::empty())
            .unwrap();
        let (phys, _) = heap.phys(&aligned).unwrap();
        assert_eq!(phys as usize % (16 * PAGE_SIZE), 0);
        heap.free(small);
        heap.free(aligned);
    }

    #[test]
    fn test_exhaustion() {
        let heap = CarveoutHeap::new(1, "carveout", 4 * PAGE_SIZE).unwrap();
        let held = heap
            .allocate(4 * PAGE_SIZE, 0, BufferFlags::empty())
            .unwrap();
        assert!(matches!(
            heap.allocate(PAGE_SIZE, 0, BufferFlags::empty()),
            Err(Error::OutOfMemory)
        ));
        heap.free(held);
    }

    #[test]
    fn test_zeroed_on_allocation() {
        let heap = CarveoutHeap::new(1, "carveout", 8 * PAGE_SIZE).unwrap();
        let a = heap.allocate(PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        let vaddr = heap.map_kernel(&a).unwrap();
        unsafe { *vaddr.as_ptr() = 0x5A };
        heap.free(a);

        let b = heap.allocate(PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        let vaddr = heap.map_kernel(&b).unwrap();
        assert_eq!(unsafe { *vaddr.as_ptr() }, 0);
        heap.free(b);
    }
}
