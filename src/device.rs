//! The allocator instance: heap registry, live-object tracking, windows.
//!
//! A [`Device`] is an injectable allocator instance, never a process-wide
//! singleton; tests and embedders construct as many as they need. It owns
//! the heap list (walked in priority order on allocation), weak registries
//! of every live buffer and client for accounting, and the bounded pool of
//! sync windows all of its buffers flush through.

use crate::buffer::{Buffer, BufferId};
use crate::client::ClientShared;
use crate::error::{Error, Result};
use crate::flags::BufferFlags;
use crate::heap::{heap_mask, Heap};
use crate::window::{WindowPool, DEFAULT_WINDOW_COUNT};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

static DEVICE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// An allocator instance.
pub struct Device {
    id: u64,
    /// Heaps in allocation-priority order: carveouts first, then system,
    /// ties broken by id.
    heaps: RwLock<Vec<Arc<dyn Heap>>>,
    buffers: Mutex<BTreeMap<BufferId, Weak<Buffer>>>,
    clients: Mutex<BTreeMap<u64, Weak<ClientShared>>>,
    windows: WindowPool,
}

impl Device {
    /// Create a device with the default number of sync windows and no heaps.
    pub fn new() -> Result<Arc<Device>> {
        Self::with_windows(DEFAULT_WINDOW_COUNT)
    }

    /// Create a device with an explicit sync-window count.
    pub fn with_windows(windows: usize) -> Result<Arc<Device>> {
        let device = Arc::new(Device {
            id: DEVICE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            heaps: RwLock::new(Vec::new()),
            buffers: Mutex::new(BTreeMap::new()),
            clients: Mutex::new(BTreeMap::new()),
            windows: WindowPool::new(windows)?,
        });
        crate::observability::record_windows_available(windows);
        tracing::debug!(device = device.id, windows, "created device");
        Ok(device)
    }

    /// Unique device id. Sharing objects carry it so an import can reject
    /// buffers from a foreign allocator.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Register a heap. Heaps may be added at any point; the list is kept
    /// sorted so carveout heaps are tried before system heaps.
    pub fn add_heap(&self, heap: Arc<dyn Heap>) {
        let mut heaps = self.heaps.write().unwrap();
        tracing::info!(
            device = self.id,
            heap = heap.name(),
            id = heap.id(),
            kind = ?heap.heap_type(),
            "registered heap"
        );
        heaps.push(heap);
        heaps.sort_by_key(|h| (h.heap_type(), h.id()));
    }

    /// Number of registered heaps.
    pub fn heap_count(&self) -> usize {
        self.heaps.read().unwrap().len()
    }

    /// Look up a heap by id.
    pub fn heap(&self, id: u32) -> Option<Arc<dyn Heap>> {
        self.heaps
            .read()
            .unwrap()
            .iter()
            .find(|h| h.id() == id)
            .cloned()
    }

    /// Allocate a buffer from the first heap in `heap_mask` (in priority
    /// order) that can satisfy the request.
    ///
    /// A heap failure falls through to the next candidate. Whether the mask
    /// selects no heap or every selected heap fails, the result is the
    /// no-matching-heap condition; the underlying heap errors are logged.
    pub fn allocate(
        self: &Arc<Self>,
        len: usize,
        align: usize,
        mask: u32,
        flags: BufferFlags,
    ) -> Result<Arc<Buffer>> {
        if len == 0 {
            return Err(Error::InvalidArgument("zero-length allocation".into()));
        }
        let heaps: Vec<Arc<dyn Heap>> = self
            .heaps
            .read()
            .unwrap()
            .iter()
            .filter(|h| mask & heap_mask(h.id()) != 0)
            .cloned()
            .collect();

        let mut last_err = None;
        for heap in &heaps {
            match Buffer::create(self, heap, len, align, flags) {
                Ok(buffer) => return Ok(buffer),
                Err(err) => {
                    tracing::debug!(
                        device = self.id,
                        heap = heap.name(),
                        len,
                        %err,
                        "heap could not satisfy allocation"
                    );
                    last_err = Some(err);
                }
            }
        }
        if let Some(err) = last_err {
            tracing::warn!(device = self.id, len, mask, %err, "every matching heap failed");
        }
        Err(Error::NoMatchingHeap)
    }

    /// Warm the selected heaps for an expected allocation pattern. Purely a
    /// hint; heaps without a preload capability ignore it.
    pub fn preload(&self, mask: u32, flags: BufferFlags, lengths: &[usize]) {
        for heap in self.heaps.read().unwrap().iter() {
            if mask & heap_mask(heap.id()) != 0 {
                heap.preload(flags, lengths);
            }
        }
    }

    /// The shared pool of sync windows.
    pub fn window_pool(&self) -> &WindowPool {
        &self.windows
    }

    pub(crate) fn register_buffer(&self, buffer: &Arc<Buffer>) {
        self.buffers
            .lock()
            .unwrap()
            .insert(buffer.id(), Arc::downgrade(buffer));
    }

    pub(crate) fn unregister_buffer(&self, id: BufferId) {
        self.buffers.lock().unwrap().remove(&id);
    }

    pub(crate) fn register_client(&self, client: &Arc<ClientShared>) {
        self.clients
            .lock()
            .unwrap()
            .insert(client.client_id(), Arc::downgrade(client));
    }

    pub(crate) fn unregister_client(&self, id: u64) {
        self.clients.lock().unwrap().remove(&id);
    }

    /// Look up a live buffer by id.
    pub fn lookup_buffer(&self, id: BufferId) -> Option<Arc<Buffer>> {
        self.buffers.lock().unwrap().get(&id)?.upgrade()
    }

    /// Number of live buffers.
    pub fn live_buffer_count(&self) -> usize {
        self.buffers
            .lock()
            .unwrap()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Snapshot of every live buffer.
    pub fn live_buffers(&self) -> Vec<Arc<Buffer>> {
        self.buffers
            .lock()
            .unwrap()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Live buffers with no handle referencing them: alive only through
    /// sharing objects or raw references. The prime leak suspects.
    pub fn orphaned_buffers(&self) -> Vec<Arc<Buffer>> {
        self.live_buffers()
            .into_iter()
            .filter(|buffer| buffer.handle_count() == 0)
            .collect()
    }

    /// Total bytes held by live buffers.
    pub fn total_live_bytes(&self) -> usize {
        self.live_buffers().iter().map(|b| b.len()).sum()
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Human-readable accounting report: per-client usage, then every
    /// orphaned buffer with the task that allocated it and the task that
    /// dropped its last handle.
    pub fn debug_report(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        let _ = writeln!(out, "{:>16} {:>6} {:>8} {:>12}", "client", "pid", "handles", "bytes");
        let clients: Vec<Arc<ClientShared>> = self
            .clients
            .lock()
            .unwrap()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for client in clients {
            let (name, pid, handles, bytes) = client.summary();
            let _ = writeln!(out, "{name:>16} {pid:>6} {handles:>8} {bytes:>12}");
        }

        let orphans = self.orphaned_buffers();
        if !orphans.is_empty() {
            let _ = writeln!(out, "orphaned buffers:");
            for buffer in orphans {
                let alloc = buffer.allocator_task();
                let released = buffer
                    .last_releaser()
                    .map(|t| format!("{}({})", t.comm, t.pid))
                    .unwrap_or_else(|| "-".into());
                let _ = writeln!(
                    out,
                    "  buffer {} {:>12} bytes alloc={}({}) released-by={}",
                    buffer.id(),
                    buffer.len(),
                    alloc.comm,
                    alloc.pid,
                    released
                );
            }
        }
        let _ = writeln!(out, "total {:>12} bytes in {} buffers", self.total_live_bytes(), self.live_buffer_count());
        out
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("heaps", &self.heap_count())
            .field("buffers", &self.live_buffer_count())
            .field("clients", &self.client_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{CarveoutHeap, HeapType, SystemHeap};
    use crate::sg::PAGE_SIZE;

    fn system_heap(id: u32, pages: usize) -> Arc<dyn Heap> {
        SystemHeap::new(id, "system", pages * PAGE_SIZE).unwrap()
    }

    #[test]
    fn test_no_matching_heap() {
        let device = Device::new().unwrap();
        device.add_heap(system_heap(0, 4));
        // Mask selects only heap id 5, which does not exist.
        let result = device.allocate(PAGE_SIZE, 0, heap_mask(5), BufferFlags::empty());
        assert!(matches!(result, Err(Error::NoMatchingHeap)));
    }

    #[test]
    fn test_heap_walk_priority_order() {
        let device = Device::new().unwrap();
        device.add_heap(system_heap(0, 16));
        let carveout = CarveoutHeap::new(1, "carveout", 16 * PAGE_SIZE).unwrap();
        device.add_heap(carveout);

        // Registration order was system-first, but carveout heaps take
        // priority in the walk.
        let buffer = device
            .allocate(PAGE_SIZE, 0, crate::heap::HEAP_MASK_ALL, BufferFlags::empty())
            .unwrap();
        assert_eq!(buffer.heap().heap_type(), HeapType::Carveout);
    }

    #[test]
    fn test_heap_failure_falls_through() {
        let device = Device::new().unwrap();
        // Carveout too small for the request; system heap can serve it.
        let carveout = CarveoutHeap::new(0, "carveout", PAGE_SIZE).unwrap();
        device.add_heap(carveout);
        device.add_heap(system_heap(1, 16));

        let buffer = device
            .allocate(4 * PAGE_SIZE, 0, crate::heap::HEAP_MASK_ALL, BufferFlags::empty())
            .unwrap();
        assert_eq!(buffer.heap().heap_type(), HeapType::System);
    }

    #[test]
    fn test_all_matching_heaps_failing_yields_no_matching_heap() {
        let device = Device::new().unwrap();
        device.add_heap(system_heap(0, 2));
        let carveout = CarveoutHeap::new(1, "carveout", 2 * PAGE_SIZE).unwrap();
        device.add_heap(carveout);
        // Both heaps exist but neither can serve the request; the caller
        // sees the same condition as an empty mask, not a heap's own error.
        let result = device.allocate(
            64 * PAGE_SIZE,
            0,
            crate::heap::HEAP_MASK_ALL,
            BufferFlags::empty(),
        );
        assert!(matches!(result, Err(Error::NoMatchingHeap)));
    }

    #[test]
    fn test_devices_are_independent() {
        let a = Device::new().unwrap();
        let b = Device::new().unwrap();
        assert_ne!(a.id(), b.id());
        a.add_heap(system_heap(0, 4));
        assert_eq!(a.heap_count(), 1);
        assert_eq!(b.heap_count(), 0);

        let buffer = a
            .allocate(PAGE_SIZE, 0, crate::heap::HEAP_MASK_ALL, BufferFlags::empty())
            .unwrap();
        assert_eq!(a.live_buffer_count(), 1);
        assert_eq!(b.live_buffer_count(), 0);
        drop(buffer);
    }

    #[test]
    fn test_debug_report_lists_orphans() {
        let device = Device::new().unwrap();
        device.add_heap(system_heap(0, 4));
        let buffer = device
            .allocate(PAGE_SIZE, 0, crate::heap::HEAP_MASK_ALL, BufferFlags::empty())
            .unwrap();
        // No handle ever referenced it, so it reports as orphaned.
        let report = device.debug_report();
        assert!(report.contains("orphaned buffers"));
        assert!(report.contains(&format!("buffer {}", buffer.id())));
    }
}
