//! System heap: a page pool over a single memfd region.
//!
//! One fd backs the whole pool; allocations claim whatever page frames are
//! free and hand them back as a (generally scattered) scatter-gather list.
//! Pool pages carry no persistent linear mapping — CPU access goes through
//! `map_kernel`, a user mapping, or the device's sync windows. The heap
//! opts into deferred free.

use super::{Allocation, DeferredFreeQueue, FrameBitmap, Heap, HeapId, HeapType};
use crate::error::{Error, Result};
use crate::flags::BufferFlags;
use crate::sg::{PageFrame, SgSegment, SgTable, PAGE_SIZE};
use crate::usermap::UserMapping;
use rustix::fd::OwnedFd;
use rustix::fs::{FallocateFlags, MemfdFlags};
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;
use std::sync::Arc;

/// Page-pool heap over one memfd region.
pub struct SystemHeap {
    id: HeapId,
    name: String,
    fd: Arc<OwnedFd>,
    frames: FrameBitmap,
    deferred: DeferredFreeQueue,
}

/// Heap-private allocation state: the claimed frame indices, ascending.
struct SystemAllocation {
    frames: Vec<usize>,
}

impl SystemHeap {
    /// Create a system heap with `pool_bytes` of backing store (rounded up
    /// to whole pages).
    pub fn new(id: HeapId, name: &str, pool_bytes: usize) -> Result<Arc<Self>> {
        let pool_bytes = crate::sg::page_align(pool_bytes.max(PAGE_SIZE));
        let fd = rustix::fs::memfd_create(format!("ionpool-{name}"), MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, pool_bytes as u64)?;
        Ok(Arc::new(Self {
            id,
            name: name.to_owned(),
            fd: Arc::new(fd),
            frames: FrameBitmap::new(pool_bytes / PAGE_SIZE),
            deferred: DeferredFreeQueue::new(),
        }))
    }

    /// Snapshot of currently free pool pages.
    pub fn free_pages(&self) -> usize {
        self.frames.count_free()
    }

    /// Total pool pages.
    pub fn total_pages(&self) -> usize {
        self.frames.capacity()
    }

    fn allocation_frames<'a>(&self, allocation: &'a Allocation) -> &'a [usize] {
        // An allocation handed to this heap always carries our state.
        allocation
            .state::<SystemAllocation>()
            .map(|s| s.frames.as_slice())
            .unwrap_or(&[])
    }

    /// Return a frame's backing range to the kernel, zeroing it in the
    /// process.
    fn punch_frame(&self, frame: usize) -> Result<()> {
        rustix::fs::fallocate(
            &*self.fd,
            FallocateFlags::PUNCH_HOLE | FallocateFlags::KEEP_SIZE,
            (frame * PAGE_SIZE) as u64,
            PAGE_SIZE as u64,
        )?;
        Ok(())
    }
}

impl Heap for SystemHeap {
    fn id(&self) -> HeapId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn heap_type(&self) -> HeapType {
        HeapType::System
    }

    fn allocate(&self, len: usize, _align: usize, flags: BufferFlags) -> Result<Allocation> {
        let pages = len / PAGE_SIZE;
        let frames = self.frames.acquire_many(pages).ok_or(Error::OutOfMemory)?;
        if !flags.contains(BufferFlags::NOZEROED) {
            for &frame in &frames {
                if let Err(err) = self.punch_frame(frame) {
                    for &claimed in &frames {
                        self.frames.release(claimed);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Allocation::new(self.id, len, SystemAllocation { frames }))
    }

    fn free(&self, allocation: Allocation) {
        if let Some(state) = allocation.state::<SystemAllocation>() {
            for &frame in &state.frames {
                self.frames.release(frame);
            }
        }
    }

    fn map_dma(&self, allocation: &Allocation) -> Result<SgTable> {
        let frames = self.allocation_frames(allocation);
        let mut table = SgTable::new();
        // Coalesce runs of adjacent frames into single segments.
        let mut run_start = 0usize;
        while run_start < frames.len() {
            let mut run_end = run_start + 1;
            while run_end < frames.len() && frames[run_end] == frames[run_end - 1] + 1 {
                run_end += 1;
            }
            table.push(SgSegment {
                frame: PageFrame::unmapped(
                    Arc::clone(&self.fd),
                    (frames[run_start] * PAGE_SIZE) as u64,
                ),
                offset: 0,
                len: ((run_end - run_start) * PAGE_SIZE) as u32,
            });
            run_start = run_end;
        }
        Ok(table)
    }

    fn map_kernel(&self, allocation: &Allocation) -> Result<NonNull<u8>> {
        let frames = self.allocation_frames(allocation);
        let len = allocation.len();
        // Reserve a contiguous range, then alias each pool page into it.
        let base = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::empty(),
                MapFlags::PRIVATE,
            )?
        };
        for (i, &frame) in frames.iter().enumerate() {
            let at = unsafe { base.cast::<u8>().add(i * PAGE_SIZE) };
            let mapped = unsafe {
                rustix::mm::mmap(
                    at.cast(),
                    PAGE_SIZE,
                    ProtFlags::READ | ProtFlags::WRITE,
                    MapFlags::SHARED | MapFlags::FIXED,
                    &*self.fd,
                    (frame * PAGE_SIZE) as u64,
                )
            };
            if let Err(err) = mapped {
                unsafe {
                    let _ = rustix::mm::munmap(base, len);
                }
                return Err(err.into());
            }
        }
        NonNull::new(base.cast())
            .ok_or_else(|| Error::InvalidArgument("mmap returned null".into()))
    }

    fn unmap_kernel(&self, allocation: &Allocation, vaddr: NonNull<u8>) {
        unsafe {
            let _ = rustix::mm::munmap(vaddr.as_ptr().cast(), allocation.len());
        }
    }

    fn map_user(&self, _allocation: &Allocation, mapping: &UserMapping) -> Result<()> {
        mapping.install_all();
        Ok(())
    }

    fn deferred_free(&self) -> Option<&DeferredFreeQueue> {
        Some(&self.deferred)
    }

    fn fault_mapped(&self, flags: BufferFlags) -> bool {
        flags.fault_mapped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::drain_deferred;

    #[test]
    fn test_allocate_claims_pages() {
        let heap = SystemHeap::new(0, "system", 16 * PAGE_SIZE).unwrap();
        assert_eq!(heap.free_pages(), 16);

        let allocation = heap
            .allocate(3 * PAGE_SIZE, 0, BufferFlags::empty())
            .unwrap();
        assert_eq!(heap.free_pages(), 13);
        assert_eq!(allocation.len(), 3 * PAGE_SIZE);

        heap.free(allocation);
        assert_eq!(heap.free_pages(), 16);
    }

    #[test]
    fn test_allocate_exhaustion() {
        let heap = SystemHeap::new(0, "tiny", 2 * PAGE_SIZE).unwrap();
        let held = heap.allocate(2 * PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        assert!(matches!(
            heap.allocate(PAGE_SIZE, 0, BufferFlags::empty()),
            Err(Error::OutOfMemory)
        ));
        heap.free(held);
    }

    #[test]
    fn test_map_dma_coalesces_adjacent_frames() {
        let heap = SystemHeap::new(0, "system", 8 * PAGE_SIZE).unwrap();
        let allocation = heap
            .allocate(4 * PAGE_SIZE, 0, BufferFlags::empty())
            .unwrap();
        let table = heap.map_dma(&allocation).unwrap();
        // A fresh pool hands out adjacent frames: expect one coalesced run.
        assert_eq!(table.segments().len(), 1);
        assert_eq!(table.len(), 4 * PAGE_SIZE);
        assert_eq!(table.page_count(), 4);
        heap.free(allocation);
    }

    #[test]
    fn test_map_dma_scattered_after_fragmentation() {
        let heap = SystemHeap::new(0, "system", 8 * PAGE_SIZE).unwrap();
        let a = heap.allocate(PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        let b = heap.allocate(PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        let c = heap.allocate(PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        // Free the middle page to leave a hole at frame 1.
        heap.free(b);
        let scattered = heap.allocate(2 * PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        let table = heap.map_dma(&scattered).unwrap();
        assert_eq!(table.segments().len(), 2);
        heap.free(a);
        heap.free(c);
        heap.free(scattered);
    }

    #[test]
    fn test_map_kernel_roundtrip() {
        let heap = SystemHeap::new(0, "system", 8 * PAGE_SIZE).unwrap();
        let allocation = heap
            .allocate(2 * PAGE_SIZE, 0, BufferFlags::empty())
            .unwrap();

        let vaddr = heap.map_kernel(&allocation).unwrap();
        let span =
            unsafe { std::slice::from_raw_parts_mut(vaddr.as_ptr(), allocation.len()) };
        span[0] = 0xAB;
        span[PAGE_SIZE] = 0xCD;

        // A second, independent mapping must alias the same pages.
        let again = heap.map_kernel(&allocation).unwrap();
        let alias = unsafe { std::slice::from_raw_parts(again.as_ptr(), allocation.len()) };
        assert_eq!(alias[0], 0xAB);
        assert_eq!(alias[PAGE_SIZE], 0xCD);

        heap.unmap_kernel(&allocation, again);
        heap.unmap_kernel(&allocation, vaddr);
        heap.free(allocation);
    }

    #[test]
    fn test_allocation_zeroed_unless_flagged() {
        let heap = SystemHeap::new(0, "system", 4 * PAGE_SIZE).unwrap();
        // Dirty a page, free it, then reallocate without NOZEROED.
        let first = heap.allocate(PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        let vaddr = heap.map_kernel(&first).unwrap();
        unsafe { *vaddr.as_ptr() = 0xFF };
        heap.unmap_kernel(&first, vaddr);
        heap.free(first);

        let second = heap.allocate(PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        let vaddr = heap.map_kernel(&second).unwrap();
        assert_eq!(unsafe { *vaddr.as_ptr() }, 0);
        heap.unmap_kernel(&second, vaddr);
        heap.free(second);
    }

    #[test]
    fn test_deferred_queue_drain() {
        let heap = SystemHeap::new(0, "system", 4 * PAGE_SIZE).unwrap();
        let allocation = heap.allocate(PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        heap.deferred_free().unwrap().push(allocation);
        // The frame is still claimed until the queue drains.
        assert_eq!(heap.free_pages(), 3);
        assert_eq!(drain_deferred(&*heap, usize::MAX), 1);
        assert_eq!(heap.free_pages(), 4);
    }
}
