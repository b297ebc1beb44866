//! The canonical allocation unit and its lifecycle.
//!
//! A [`Buffer`] owns one heap allocation plus every piece of mutable mapping
//! state attached to it: the nested kernel mapping, registered user
//! mappings, the per-page dirty array for fault-driven buffers, and the IOVA
//! mapping cache. Buffers are shared-ownership objects (`Arc`): handles and
//! sharing objects hold strong references, the device registry holds a weak
//! one, and teardown runs when the last strong reference drops — returning
//! the backing storage to the heap directly or through its deferred-free
//! queue.

use crate::device::Device;
use crate::error::{Error, Result};
use crate::flags::BufferFlags;
use crate::heap::{drain_deferred, Allocation, Heap};
use crate::iovmm::{DmaDevice, IovaRecord, RegionId};
use crate::sg::{PageFrame, SgTable};
use crate::usermap::{Direction, PageState, UserMapping};
use crate::window::{device_sync, SyncOps};
use smallvec::SmallVec;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Device-wide unique buffer identifier.
pub type BufferId = u64;

/// Identity of the task that touched a buffer, for leak attribution.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    /// Process id.
    pub pid: u32,
    /// Thread id.
    pub tid: u32,
    /// Process command name.
    pub comm: String,
}

impl TaskInfo {
    /// Capture the calling task's identity.
    pub fn current() -> Self {
        let comm = std::fs::read_to_string("/proc/self/comm")
            .map(|s| s.trim().to_owned())
            .unwrap_or_default();
        Self {
            pid: std::process::id(),
            tid: rustix::thread::gettid().as_raw_nonzero().get() as u32,
            comm,
        }
    }
}

/// Mapping state guarded by the per-buffer lock.
struct BufferState {
    kmap_count: usize,
    vaddr: Option<NonNull<u8>>,
    /// Per-page cache state; present only for fault-driven buffers.
    page_states: Option<Vec<PageState>>,
    /// Registered user mappings (vma list), pruned as they drop.
    mappings: Vec<(u64, Weak<UserMapping>)>,
    /// Cached device IOVA mappings.
    iova: SmallVec<[IovaRecord; 2]>,
}

/// The canonical allocation unit.
pub struct Buffer {
    id: BufferId,
    device: Arc<Device>,
    heap: Arc<dyn Heap>,
    len: usize,
    flags: BufferFlags,
    /// Taken at teardown; always `Some` while the buffer is live.
    allocation: Option<Allocation>,
    sg: SgTable,
    pages: Vec<PageFrame>,
    fault_mapped: bool,
    allocator_task: TaskInfo,
    /// Identity of the task that released the last handle, recorded so an
    /// orphaned buffer (alive only through a sharing object) stays
    /// attributable. Kept separate from the allocator's identity.
    last_releaser: Mutex<Option<TaskInfo>>,
    handle_count: AtomicUsize,
    state: Mutex<BufferState>,
}

// SAFETY: the raw kernel-mapping address is only dereferenced by callers of
// kmap, which serialize through the per-buffer lock for setup/teardown.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Allocate a buffer from `heap` and register it with `device`.
    ///
    /// Zero lengths are rejected up front. A failed allocation on a heap
    /// with deferred free drains the pending queue once and retries exactly
    /// once before giving up.
    pub(crate) fn create(
        device: &Arc<Device>,
        heap: &Arc<dyn Heap>,
        len: usize,
        align: usize,
        flags: BufferFlags,
    ) -> Result<Arc<Buffer>> {
        if len == 0 {
            return Err(Error::InvalidArgument("zero-length allocation".into()));
        }
        let len = crate::sg::page_align(len);

        let allocation = match heap.allocate(len, align, flags) {
            Ok(allocation) => allocation,
            Err(err) => {
                if heap.deferred_free().is_none() {
                    return Err(err);
                }
                drain_deferred(&**heap, usize::MAX);
                heap.allocate(len, align, flags)?
            }
        };

        let sg = match heap.map_dma(&allocation) {
            Ok(sg) => sg,
            Err(err) => {
                heap.free(allocation);
                return Err(err);
            }
        };
        let fault_mapped = heap.fault_mapped(flags);
        let pages = sg.pages();
        let page_states = fault_mapped.then(|| vec![PageState::Clean; pages.len()]);

        let buffer = Arc::new(Self {
            id: BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            device: Arc::clone(device),
            heap: Arc::clone(heap),
            len,
            flags,
            allocation: Some(allocation),
            sg,
            pages,
            fault_mapped,
            allocator_task: TaskInfo::current(),
            last_releaser: Mutex::new(None),
            handle_count: AtomicUsize::new(0),
            state: Mutex::new(BufferState {
                kmap_count: 0,
                vaddr: None,
                page_states,
                mappings: Vec::new(),
                iova: SmallVec::new(),
            }),
        });
        device.register_buffer(&buffer);
        crate::observability::record_buffer_allocated(len);
        tracing::debug!(
            buffer = buffer.id,
            heap = heap.name(),
            len,
            "allocated buffer"
        );
        Ok(buffer)
    }

    /// Device-wide unique id.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Page-aligned byte length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the buffer covers no bytes (never the case for live buffers).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocation flags.
    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    /// The owning heap.
    pub fn heap(&self) -> &Arc<dyn Heap> {
        &self.heap
    }

    /// The owning device.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// The buffer's scatter-gather description.
    pub fn sg(&self) -> &SgTable {
        &self.sg
    }

    /// Number of backing pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// True if user mappings are built page-by-page on fault.
    pub fn fault_mapped(&self) -> bool {
        self.fault_mapped
    }

    /// Identity of the allocating task.
    pub fn allocator_task(&self) -> &TaskInfo {
        &self.allocator_task
    }

    /// Identity of the task that released the last handle, if the buffer
    /// has ever been orphaned.
    pub fn last_releaser(&self) -> Option<TaskInfo> {
        self.last_releaser.lock().unwrap().clone()
    }

    /// Number of live handles referencing this buffer.
    pub fn handle_count(&self) -> usize {
        self.handle_count.load(Ordering::Acquire)
    }

    pub(crate) fn handle_get(&self) {
        self.handle_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn handle_put(&self) {
        let previous = self.handle_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "handle count underflow");
        if previous == 1 {
            *self.last_releaser.lock().unwrap() = Some(TaskInfo::current());
            tracing::debug!(buffer = self.id, "buffer orphaned, no live handles");
        }
    }

    /// Map the whole buffer linearly, bumping the nested map count.
    pub fn kmap(&self) -> Result<NonNull<u8>> {
        let mut state = self.state.lock().unwrap();
        let vaddr = match state.vaddr {
            Some(vaddr) => vaddr,
            None => {
                let Some(allocation) = self.allocation.as_ref() else {
                    return Err(Error::InvalidArgument("buffer is being torn down".into()));
                };
                let vaddr = self.heap.map_kernel(allocation)?;
                state.vaddr = Some(vaddr);
                vaddr
            }
        };
        state.kmap_count += 1;
        Ok(vaddr)
    }

    /// Drop one nested kernel-mapping reference; the heap mapping is torn
    /// down when the count returns to zero.
    pub fn kunmap(&self) {
        let mut state = self.state.lock().unwrap();
        if state.kmap_count == 0 {
            tracing::warn!(buffer = self.id, "unbalanced kunmap");
            return;
        }
        state.kmap_count -= 1;
        if state.kmap_count == 0 {
            if let (Some(vaddr), Some(allocation)) = (state.vaddr.take(), self.allocation.as_ref())
            {
                self.heap.unmap_kernel(allocation, vaddr);
            }
        }
    }

    /// Current nested kernel-map count.
    pub fn kmap_count(&self) -> usize {
        self.state.lock().unwrap().kmap_count
    }

    /// Register a user mapping over `page_count` pages starting at
    /// `page_offset`. Range validation is the caller's responsibility.
    pub(crate) fn register_mapping(
        self: &Arc<Self>,
        page_offset: usize,
        page_count: usize,
    ) -> Arc<UserMapping> {
        let mapping = Arc::new(UserMapping::new(
            Arc::downgrade(self),
            page_offset,
            page_count,
        ));
        self.state
            .lock()
            .unwrap()
            .mappings
            .push((mapping.id(), Arc::downgrade(&mapping)));
        mapping
    }

    /// Eagerly install every page of `mapping` via the heap, for buffers
    /// that do not use the fault path.
    pub(crate) fn map_user(&self, mapping: &UserMapping) -> Result<()> {
        let Some(allocation) = self.allocation.as_ref() else {
            return Err(Error::InvalidArgument("buffer is being torn down".into()));
        };
        self.heap.map_user(allocation, mapping)
    }

    pub(crate) fn unregister_mapping(&self, id: u64) {
        self.state
            .lock()
            .unwrap()
            .mappings
            .retain(|(mapping_id, _)| *mapping_id != id);
    }

    /// Number of registered user mappings.
    pub fn mapping_count(&self) -> usize {
        self.state.lock().unwrap().mappings.len()
    }

    pub(crate) fn mark_page_dirty(&self, page: usize) {
        let mut state = self.state.lock().unwrap();
        if let Some(states) = state.page_states.as_mut() {
            if let Some(slot) = states.get_mut(page) {
                *slot = PageState::Dirty;
            }
        }
    }

    /// Dirty state of one page; `None` if the buffer has no dirty tracking.
    pub fn page_dirty(&self, page: usize) -> Option<bool> {
        let state = self.state.lock().unwrap();
        state
            .page_states
            .as_ref()
            .and_then(|states| states.get(page).map(|s| *s == PageState::Dirty))
    }

    /// Flush CPU-cached data toward a device consumer.
    ///
    /// No-op for non-cached buffers or coherent direction. Dirty pages (all
    /// pages, for cached buffers without per-page tracking) are flushed
    /// through the device's window pool and marked clean, and every
    /// registered user mapping over them is zapped so the next CPU access
    /// re-faults.
    pub fn sync_for_device(&self, direction: Direction) -> Result<()> {
        if !self.flags.is_cached() || direction == Direction::None {
            return Ok(());
        }

        let (dirty, mappings) = {
            let mut state = self.state.lock().unwrap();
            let dirty: Vec<usize> = match state.page_states.as_mut() {
                Some(states) => {
                    let dirty: Vec<usize> = states
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| **s == PageState::Dirty)
                        .map(|(i, _)| i)
                        .collect();
                    for &page in &dirty {
                        states[page] = PageState::Clean;
                    }
                    dirty
                }
                None => (0..self.pages.len()).collect(),
            };
            let mappings: Vec<Arc<UserMapping>> = state
                .mappings
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect();
            (dirty, mappings)
        };
        if dirty.is_empty() {
            return Ok(());
        }

        // Zap outside the buffer lock; mappings serialize on their own state.
        for mapping in &mappings {
            mapping.zap(&dirty);
        }

        let subset = SgTable::from_page_subset(&self.pages, &dirty);
        let heap = Arc::clone(&self.heap);
        device_sync(
            self.device.window_pool(),
            &subset,
            direction,
            &SyncOps {
                zero: false,
                sync: Some(&move |span, dir| heap.sync_span(span, dir)),
            },
        )
    }

    /// Map this buffer for DMA by `dma`, returning the I/O virtual address.
    ///
    /// Repeat maps of the same (device, region) pair bump the cached
    /// record's count. A device without an IOMMU falls back to the heap's
    /// physical address.
    pub fn iovmm_map(&self, dma: &DmaDevice, region: RegionId) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state
            .iova
            .iter_mut()
            .find(|r| r.device == dma.id() && r.region == region)
        {
            record.map_count += 1;
            return Ok(record.iova);
        }

        let (iova, iovmm) = match dma.iovmm() {
            Some(iovmm) => (iovmm.map(&self.sg, region)?, Some(Arc::clone(iovmm))),
            None => {
                let Some(allocation) = self.allocation.as_ref() else {
                    return Err(Error::InvalidArgument("buffer is being torn down".into()));
                };
                let (phys, _) = self.heap.phys(allocation)?;
                (phys, None)
            }
        };

        // The new record supersedes older ones for this device; reclaim any
        // that already drained to zero.
        let device_id = dma.id();
        let mut stale: Vec<IovaRecord> = Vec::new();
        state.iova.retain(|r| {
            if r.device == device_id && r.map_count == 0 {
                stale.push(IovaRecord {
                    device: r.device,
                    region: r.region,
                    iova: r.iova,
                    map_count: 0,
                    iovmm: r.iovmm.take(),
                });
                false
            } else {
                true
            }
        });
        state.iova.push(IovaRecord {
            device: device_id,
            region,
            iova,
            map_count: 1,
            iovmm,
        });
        drop(state);
        for record in stale {
            record.release();
        }
        Ok(iova)
    }

    /// Drop one mapping reference for (device, region). The record is only
    /// torn down once its count is zero and a different mapping for the
    /// same device has superseded it.
    pub fn iovmm_unmap(&self, dma: &DmaDevice, region: RegionId) {
        let mut state = self.state.lock().unwrap();
        let Some(pos) = state
            .iova
            .iter()
            .position(|r| r.device == dma.id() && r.region == region)
        else {
            tracing::warn!(buffer = self.id, device = dma.name(), "unmap of unmapped IOVA");
            return;
        };
        let current = state
            .iova
            .iter()
            .rposition(|r| r.device == dma.id())
            .unwrap_or(pos);
        if state.iova[pos].map_count > 0 {
            state.iova[pos].map_count -= 1;
        }
        if state.iova[pos].map_count == 0 && pos != current {
            let record = state.iova.remove(pos);
            drop(state);
            record.release();
        }
    }

    /// Number of cached IOVA records.
    pub fn iova_record_count(&self) -> usize {
        self.state.lock().unwrap().iova.len()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        if state.kmap_count > 0 {
            tracing::warn!(
                buffer = self.id,
                count = state.kmap_count,
                "buffer dropped with live kernel mapping"
            );
            if let (Some(vaddr), Some(allocation)) = (state.vaddr.take(), self.allocation.as_ref())
            {
                self.heap.unmap_kernel(allocation, vaddr);
            }
        }
        for record in state.iova.drain(..) {
            record.release();
        }
        if let Some(allocation) = self.allocation.take() {
            self.heap.unmap_dma(&allocation);
            if let Some(queue) = self.heap.deferred_free() {
                queue.push(allocation);
                crate::observability::record_deferred_pending(queue.len());
            } else {
                self.heap.free(allocation);
            }
        }
        self.device.unregister_buffer(self.id);
        crate::observability::record_buffer_freed(self.len);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("heap", &self.heap.name())
            .field("len", &self.len)
            .field("flags", &self.flags)
            .field("handles", &self.handle_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{CarveoutHeap, SystemHeap};
    use crate::iovmm::LinearIoVmm;
    use crate::sg::PAGE_SIZE;

    fn device_with_system_heap(pool_pages: usize) -> (Arc<Device>, Arc<dyn Heap>) {
        let device = Device::new().unwrap();
        let heap: Arc<dyn Heap> =
            SystemHeap::new(0, "system", pool_pages * PAGE_SIZE).unwrap();
        device.add_heap(Arc::clone(&heap));
        (device, heap)
    }

    #[test]
    fn test_zero_length_rejected() {
        let (device, heap) = device_with_system_heap(4);
        let result = Buffer::create(&device, &heap, 0, 0, BufferFlags::empty());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn test_length_rounded_to_page() {
        let (device, heap) = device_with_system_heap(4);
        let buffer = Buffer::create(&device, &heap, 100, 0, BufferFlags::empty()).unwrap();
        assert_eq!(buffer.len(), PAGE_SIZE);
        assert_eq!(buffer.page_count(), 1);
    }

    #[test]
    fn test_registry_reachability_follows_lifetime() {
        let (device, heap) = device_with_system_heap(4);
        let buffer = Buffer::create(&device, &heap, PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        let id = buffer.id();
        assert!(device.lookup_buffer(id).is_some());
        drop(buffer);
        assert!(device.lookup_buffer(id).is_none());
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn test_deferred_free_retry_once() {
        // Pool of 2 pages: the first buffer exhausts it, its teardown goes
        // to the deferred queue, and the next allocation must succeed only
        // via the drain-then-retry step.
        let (device, heap) = device_with_system_heap(2);
        let first =
            Buffer::create(&device, &heap, 2 * PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        drop(first);
        assert_eq!(heap.deferred_free().unwrap().len(), 1);

        let second =
            Buffer::create(&device, &heap, 2 * PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        assert_eq!(heap.deferred_free().unwrap().len(), 0);
        drop(second);
    }

    #[test]
    fn test_kmap_nesting() {
        let (device, heap) = device_with_system_heap(4);
        let buffer =
            Buffer::create(&device, &heap, 2 * PAGE_SIZE, 0, BufferFlags::empty()).unwrap();

        let a = buffer.kmap().unwrap();
        let b = buffer.kmap().unwrap();
        assert_eq!(a, b, "nested kmap returns the same mapping");
        assert_eq!(buffer.kmap_count(), 2);

        buffer.kunmap();
        assert_eq!(buffer.kmap_count(), 1);
        buffer.kunmap();
        assert_eq!(buffer.kmap_count(), 0);
    }

    #[test]
    fn test_dirty_bit_roundtrip_with_zap() {
        let (device, heap) = device_with_system_heap(8);
        let flags = BufferFlags::CACHED | BufferFlags::CACHED_NEEDS_SYNC;
        let buffer = Buffer::create(&device, &heap, 4 * PAGE_SIZE, 0, flags).unwrap();
        assert!(buffer.fault_mapped());

        let mapping = buffer.register_mapping(0, 4);
        mapping.fault(1).unwrap();
        assert_eq!(buffer.page_dirty(1), Some(true));
        assert!(mapping.is_present(1));

        buffer.sync_for_device(Direction::ToDevice).unwrap();
        assert_eq!(buffer.page_dirty(1), Some(false));
        assert!(!mapping.is_present(1), "sync must zap covered mappings");
    }

    #[test]
    fn test_sync_noop_for_uncached() {
        let (device, heap) = device_with_system_heap(4);
        let buffer = Buffer::create(&device, &heap, PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        buffer.sync_for_device(Direction::ToDevice).unwrap();
        assert_eq!(buffer.page_dirty(0), None);
    }

    #[test]
    fn test_iovmm_map_count_and_lazy_reclaim() {
        let (device, heap) = device_with_system_heap(8);
        let buffer =
            Buffer::create(&device, &heap, 2 * PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        let iovmm = LinearIoVmm::new();
        let dma = DmaDevice::new("decoder", Some(iovmm.clone() as Arc<dyn crate::iovmm::IoVmm>));

        let a = buffer.iovmm_map(&dma, 0).unwrap();
        let again = buffer.iovmm_map(&dma, 0).unwrap();
        assert_eq!(a, again, "repeat map of the same region reuses the IOVA");
        assert_eq!(buffer.iova_record_count(), 1);

        // Drain the count to zero: the record stays cached (not superseded).
        buffer.iovmm_unmap(&dma, 0);
        buffer.iovmm_unmap(&dma, 0);
        assert_eq!(buffer.iova_record_count(), 1);
        assert_eq!(iovmm.live_mappings(), 1);

        // A different region supersedes it; the stale record is reclaimed.
        let b = buffer.iovmm_map(&dma, 1).unwrap();
        assert_ne!(a, b);
        assert_eq!(buffer.iova_record_count(), 1);
        assert_eq!(iovmm.live_mappings(), 1);

        drop(buffer);
        assert_eq!(iovmm.live_mappings(), 0, "teardown unmaps everything");
    }

    #[test]
    fn test_iovmm_remap_of_earlier_live_region() {
        // A device alternating between two regions: re-mapping the first
        // region while it is still live must reuse its record, not stack a
        // duplicate mapping.
        let (device, heap) = device_with_system_heap(8);
        let buffer =
            Buffer::create(&device, &heap, 2 * PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        let iovmm = LinearIoVmm::new();
        let dma = DmaDevice::new("decoder", Some(iovmm.clone() as Arc<dyn crate::iovmm::IoVmm>));

        let r0 = buffer.iovmm_map(&dma, 0).unwrap();
        let r1 = buffer.iovmm_map(&dma, 1).unwrap();
        let r0_again = buffer.iovmm_map(&dma, 0).unwrap();
        assert_eq!(r0, r0_again, "re-map of a live region reuses its IOVA");
        assert_ne!(r0, r1);
        assert_eq!(buffer.iova_record_count(), 2);
        assert_eq!(iovmm.live_mappings(), 2);

        // Drain region 0; region 1 is the device's current mapping, so the
        // stale record is torn down immediately.
        buffer.iovmm_unmap(&dma, 0);
        buffer.iovmm_unmap(&dma, 0);
        assert_eq!(buffer.iova_record_count(), 1);
        assert_eq!(iovmm.live_mappings(), 1);

        buffer.iovmm_unmap(&dma, 1);
        drop(buffer);
        assert_eq!(iovmm.live_mappings(), 0);
    }

    #[test]
    fn test_iovmm_phys_fallback_without_iommu() {
        let device = Device::new().unwrap();
        let heap: Arc<dyn Heap> = CarveoutHeap::new(1, "carveout", 8 * PAGE_SIZE).unwrap();
        device.add_heap(Arc::clone(&heap));
        let buffer =
            Buffer::create(&device, &heap, 2 * PAGE_SIZE, 0, BufferFlags::empty()).unwrap();

        let dma = DmaDevice::new("scaler", None);
        let iova = buffer.iovmm_map(&dma, 0).unwrap();
        let (phys, _) = heap.phys(buffer_allocation(&buffer)).unwrap();
        assert_eq!(iova, phys);
        buffer.iovmm_unmap(&dma, 0);
    }

    #[test]
    fn test_iovmm_fallback_requires_phys() {
        let (device, heap) = device_with_system_heap(4);
        let buffer = Buffer::create(&device, &heap, PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        let dma = DmaDevice::new("no-iommu", None);
        // The system heap has no physical-address capability.
        assert!(matches!(
            buffer.iovmm_map(&dma, 0),
            Err(Error::Unsupported("phys"))
        ));
    }

    #[test]
    fn test_last_releaser_recorded_on_orphan() {
        let (device, heap) = device_with_system_heap(4);
        let buffer = Buffer::create(&device, &heap, PAGE_SIZE, 0, BufferFlags::empty()).unwrap();
        assert!(buffer.last_releaser().is_none());

        buffer.handle_get();
        buffer.handle_put();
        let releaser = buffer.last_releaser().unwrap();
        assert_eq!(releaser.pid, std::process::id());
        // The allocator identity is preserved separately.
        assert_eq!(buffer.allocator_task().pid, std::process::id());
    }

    fn buffer_allocation(buffer: &Buffer) -> &Allocation {
        buffer.allocation.as_ref().unwrap()
    }
}
