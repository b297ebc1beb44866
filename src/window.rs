//! Bounded pool of reusable virtual-address windows for bulk sync/zero.
//!
//! Cache maintenance over a scatter-gather list of unmapped (highmem-model)
//! pages needs a temporary mapping. Rather than mapping arbitrarily large
//! lists, the device owns a small fixed set of 1-MiB windows: pages are
//! aliased into the current window until it fills, the filled span is
//! processed (sync callback, optional zero) and torn back down, and the
//! window is reused for the next span. Window acquisition blocks when all
//! windows are busy — this is the single backpressure point; no more than
//! the pool's capacity of windows is ever mapped, regardless of list size.

use crate::error::{Error, Result};
use crate::sg::{PageFrame, SgTable, PAGE_SIZE};
use crate::usermap::Direction;
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;
use std::sync::{Condvar, Mutex};

/// Size of one sync window.
pub const WINDOW_SIZE: usize = 1 << 20;

/// Pages per window.
pub const WINDOW_PAGES: usize = WINDOW_SIZE / PAGE_SIZE;

/// Default number of windows per device.
pub const DEFAULT_WINDOW_COUNT: usize = 4;

/// Fixed pool of reusable 1-MiB mapping windows.
pub struct WindowPool {
    bases: Vec<NonNull<u8>>,
    free: Mutex<Vec<usize>>,
    available: Condvar,
}

// SAFETY: window reservations are per-pool and a window is only touched by
// the thread holding its guard.
unsafe impl Send for WindowPool {}
unsafe impl Sync for WindowPool {}

impl WindowPool {
    /// Reserve `count` windows of address space.
    pub fn new(count: usize) -> Result<Self> {
        let count = count.max(1);
        let mut bases = Vec::with_capacity(count);
        for _ in 0..count {
            let base = unsafe {
                rustix::mm::mmap_anonymous(
                    std::ptr::null_mut(),
                    WINDOW_SIZE,
                    ProtFlags::empty(),
                    MapFlags::PRIVATE,
                )?
            };
            match NonNull::new(base.cast::<u8>()) {
                Some(base) => bases.push(base),
                None => return Err(Error::InvalidArgument("mmap returned null".into())),
            }
        }
        let free = (0..count).collect();
        Ok(Self {
            bases,
            free: Mutex::new(free),
            available: Condvar::new(),
        })
    }

    /// Number of windows in the pool.
    pub fn capacity(&self) -> usize {
        self.bases.len()
    }

    /// Snapshot of currently free windows.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Acquire a window, blocking until one is free.
    pub fn acquire(&self) -> WindowGuard<'_> {
        let mut free = self.free.lock().unwrap();
        let index = loop {
            if let Some(index) = free.pop() {
                break index;
            }
            free = self.available.wait(free).unwrap();
        };
        crate::observability::record_windows_available(free.len());
        WindowGuard {
            pool: self,
            index,
            mapped_pages: 0,
        }
    }
}

impl Drop for WindowPool {
    fn drop(&mut self) {
        for base in &self.bases {
            unsafe {
                let _ = rustix::mm::munmap(base.as_ptr().cast(), WINDOW_SIZE);
            }
        }
    }
}

/// RAII hold on one window. Dropping the guard tears down any mapped span
/// and returns the window to the pool.
pub struct WindowGuard<'pool> {
    pool: &'pool WindowPool,
    index: usize,
    mapped_pages: usize,
}

impl WindowGuard<'_> {
    fn base(&self) -> *mut u8 {
        self.pool.bases[self.index].as_ptr()
    }

    /// Alias `frame` into the next free slot of the window.
    fn map_next(&mut self, frame: &PageFrame) -> Result<()> {
        debug_assert!(self.mapped_pages < WINDOW_PAGES);
        let at = unsafe { self.base().add(self.mapped_pages * PAGE_SIZE) };
        unsafe {
            rustix::mm::mmap(
                at.cast(),
                PAGE_SIZE,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED | MapFlags::FIXED,
                &**frame.fd(),
                frame.offset(),
            )?;
        }
        self.mapped_pages += 1;
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.mapped_pages == WINDOW_PAGES
    }

    /// The currently mapped span.
    fn span_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base(), self.mapped_pages * PAGE_SIZE) }
    }

    /// Tear the mapped span back down to an address-space reservation,
    /// clearing its page-table entries.
    fn reset(&mut self) {
        if self.mapped_pages == 0 {
            return;
        }
        unsafe {
            let _ = rustix::mm::mmap_anonymous(
                self.base().cast(),
                self.mapped_pages * PAGE_SIZE,
                ProtFlags::empty(),
                MapFlags::PRIVATE | MapFlags::FIXED,
            );
        }
        self.mapped_pages = 0;
    }
}

impl Drop for WindowGuard<'_> {
    fn drop(&mut self) {
        self.reset();
        let mut free = self.pool.free.lock().unwrap();
        free.push(self.index);
        crate::observability::record_windows_available(free.len());
        drop(free);
        self.pool.available.notify_one();
    }
}

/// Options for a bulk sync pass.
#[derive(Default)]
pub struct SyncOps<'a> {
    /// Zero every covered byte. Only valid for page-aligned lists.
    pub zero: bool,
    /// Cache-maintenance callback invoked over each processed span.
    pub sync: Option<&'a (dyn Fn(&mut [u8], Direction) + Sync)>,
}

fn apply(span: &mut [u8], direction: Direction, ops: &SyncOps<'_>) {
    if ops.zero {
        span.fill(0);
    }
    if let Some(sync) = ops.sync {
        sync(span, direction);
    }
}

/// Temporarily map a single page for the sub-page fallback path.
fn kmap_page(frame: &PageFrame) -> Result<NonNull<u8>> {
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            PAGE_SIZE,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            &**frame.fd(),
            frame.offset(),
        )?
    };
    NonNull::new(ptr.cast()).ok_or_else(|| Error::InvalidArgument("mmap returned null".into()))
}

fn kunmap_page(ptr: NonNull<u8>) {
    unsafe {
        let _ = rustix::mm::munmap(ptr.as_ptr().cast(), PAGE_SIZE);
    }
}

/// Run a bulk sync/zero pass over `sg` using one window from `pool`.
///
/// Pages with a linear address are processed in place; unmapped pages are
/// batched through the window. Sub-page spans fall back to a per-page
/// temporary mapping and must not be combined with `zero`.
pub fn device_sync(
    pool: &WindowPool,
    sg: &SgTable,
    direction: Direction,
    ops: &SyncOps<'_>,
) -> Result<()> {
    if ops.zero && !sg.is_page_aligned() {
        return Err(Error::InvalidArgument(
            "zeroing an unaligned scatter-gather list is not supported".into(),
        ));
    }

    let mut guard = pool.acquire();
    for seg in sg.segments() {
        if seg.is_page_aligned() {
            let pages = seg.len as usize / PAGE_SIZE;
            let first = seg.frame.advance(seg.offset as usize / PAGE_SIZE);
            for i in 0..pages {
                let frame = first.advance(i);
                if let Some(linear) = frame.linear() {
                    let span =
                        unsafe { std::slice::from_raw_parts_mut(linear.as_ptr(), PAGE_SIZE) };
                    apply(span, direction, ops);
                } else {
                    guard.map_next(&frame)?;
                    if guard.is_full() {
                        apply(guard.span_mut(), direction, ops);
                        guard.reset();
                    }
                }
            }
        } else {
            // Sub-page span: slower per-page fallback.
            let mut pos = seg.offset as usize;
            let mut remaining = seg.len as usize;
            while remaining > 0 {
                let in_page = pos % PAGE_SIZE;
                let chunk = (PAGE_SIZE - in_page).min(remaining);
                let frame = seg.frame.advance(pos / PAGE_SIZE);
                if let Some(linear) = frame.linear() {
                    let span = unsafe {
                        std::slice::from_raw_parts_mut(linear.as_ptr().add(in_page), chunk)
                    };
                    apply(span, direction, ops);
                } else {
                    let mapped = kmap_page(&frame)?;
                    let span = unsafe {
                        std::slice::from_raw_parts_mut(mapped.as_ptr().add(in_page), chunk)
                    };
                    apply(span, direction, ops);
                    kunmap_page(mapped);
                }
                pos += chunk;
                remaining -= chunk;
            }
        }
    }
    if guard.mapped_pages > 0 {
        apply(guard.span_mut(), direction, ops);
        guard.reset();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sg::SgSegment;
    use rustix::fd::OwnedFd;
    use rustix::fs::MemfdFlags;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn backing(pages: usize) -> Arc<OwnedFd> {
        let fd = rustix::fs::memfd_create("ionpool-window-test", MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, (pages * PAGE_SIZE) as u64).unwrap();
        Arc::new(fd)
    }

    fn sg_over(fd: &Arc<OwnedFd>, pages: usize) -> SgTable {
        let mut table = SgTable::new();
        table.push(SgSegment {
            frame: PageFrame::unmapped(Arc::clone(fd), 0),
            offset: 0,
            len: (pages * PAGE_SIZE) as u32,
        });
        table
    }

    #[test]
    fn test_zero_through_window() {
        let pool = WindowPool::new(1).unwrap();
        let fd = backing(4);

        // Dirty the backing store directly first.
        let probe = kmap_page(&PageFrame::unmapped(Arc::clone(&fd), 0)).unwrap();
        unsafe { *probe.as_ptr() = 0x7E };
        kunmap_page(probe);

        let sg = sg_over(&fd, 4);
        device_sync(
            &pool,
            &sg,
            Direction::ToDevice,
            &SyncOps {
                zero: true,
                sync: None,
            },
        )
        .unwrap();

        let probe = kmap_page(&PageFrame::unmapped(Arc::clone(&fd), 0)).unwrap();
        assert_eq!(unsafe { *probe.as_ptr() }, 0);
        kunmap_page(probe);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_sync_callback_covers_every_byte() {
        let pool = WindowPool::new(2).unwrap();
        // More pages than one window holds, to force span turnover.
        let pages = WINDOW_PAGES + 3;
        let fd = backing(pages);
        let sg = sg_over(&fd, pages);

        let seen = AtomicUsize::new(0);
        device_sync(
            &pool,
            &sg,
            Direction::Bidirectional,
            &SyncOps {
                zero: false,
                sync: Some(&|span, _| {
                    seen.fetch_add(span.len(), Ordering::Relaxed);
                }),
            },
        )
        .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), pages * PAGE_SIZE);
    }

    #[test]
    fn test_unaligned_zero_rejected() {
        let pool = WindowPool::new(1).unwrap();
        let fd = backing(1);
        let mut sg = SgTable::new();
        sg.push(SgSegment {
            frame: PageFrame::unmapped(fd, 0),
            offset: 128,
            len: 512,
        });
        let result = device_sync(
            &pool,
            &sg,
            Direction::ToDevice,
            &SyncOps {
                zero: true,
                sync: None,
            },
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_unaligned_sync_uses_page_fallback() {
        let pool = WindowPool::new(1).unwrap();
        let fd = backing(2);
        let mut sg = SgTable::new();
        // Span crossing a page boundary, unaligned on both ends.
        sg.push(SgSegment {
            frame: PageFrame::unmapped(fd, 0),
            offset: (PAGE_SIZE - 100) as u32,
            len: 300,
        });
        let seen = AtomicUsize::new(0);
        device_sync(
            &pool,
            &sg,
            Direction::FromDevice,
            &SyncOps {
                zero: false,
                sync: Some(&|span, _| {
                    seen.fetch_add(span.len(), Ordering::Relaxed);
                }),
            },
        )
        .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 300);
    }

    #[test]
    fn test_window_pool_bounded_under_contention() {
        let pool = Arc::new(WindowPool::new(2).unwrap());
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut workers = vec![];
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            workers.push(thread::spawn(move || {
                for _ in 0..20 {
                    let _guard = pool.acquire();
                    let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(std::time::Duration::from_micros(50));
                    in_use.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }
}
