//! Heap backends: the pluggable allocator contract consumed by the buffer
//! registry.
//!
//! A heap satisfies a capability set: allocate/free are mandatory, as is the
//! DMA (scatter-gather) mapping pair; kernel mapping, eager user mapping, and
//! physical-address queries are optional. Callers probe capabilities by
//! calling them — an absent capability reports [`Error::Unsupported`].
//!
//! Two backends ship with the crate:
//!
//! - [`SystemHeap`]: a page pool over one memfd region, returning scattered
//!   page lists. Pages carry no persistent mapping (highmem-modeled). Opts
//!   into deferred free.
//! - [`CarveoutHeap`]: a first-fit range allocator over one linearly-mapped
//!   region; allocations are contiguous and support physical-address queries.

mod bitmap;
mod carveout;
mod system;

pub use bitmap::FrameBitmap;
pub use carveout::CarveoutHeap;
pub use system::SystemHeap;

use crate::error::{Error, Result};
use crate::flags::BufferFlags;
use crate::sg::SgTable;
use crate::usermap::{Direction, UserMapping};
use std::any::Any;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Mutex;

/// Identifier of a heap, unique per device. Doubles as the bit position in
/// allocation heap masks.
pub type HeapId = u32;

/// Heap mask selecting every heap.
pub const HEAP_MASK_ALL: u32 = u32::MAX;

/// Build the heap-mask bit for a heap id.
#[inline]
pub fn heap_mask(id: HeapId) -> u32 {
    1 << id
}

/// Broad classification of a heap, used to order the device's heap list.
/// Lower values are tried first during allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HeapType {
    /// Physically-contiguous carveout region.
    Carveout,
    /// General page-pool heap.
    System,
}

/// Opaque per-heap backing-storage token.
///
/// Produced by [`Heap::allocate`] and eventually returned to the same heap
/// via [`Heap::free`] (possibly after sitting on a deferred-free queue).
/// The private state is only meaningful to the owning heap.
pub struct Allocation {
    heap: HeapId,
    len: usize,
    state: Box<dyn Any + Send + Sync>,
}

impl Allocation {
    /// Wrap heap-private state into an allocation token.
    pub fn new(heap: HeapId, len: usize, state: impl Any + Send + Sync) -> Self {
        Self {
            heap,
            len,
            state: Box::new(state),
        }
    }

    /// Id of the heap that produced this allocation.
    pub fn heap(&self) -> HeapId {
        self.heap
    }

    /// Byte length of the allocation (page-aligned).
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the allocation covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Downcast the heap-private state.
    pub fn state<T: 'static>(&self) -> Option<&T> {
        self.state.downcast_ref()
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("heap", &self.heap)
            .field("len", &self.len)
            .finish()
    }
}

/// Explicit two-phase reclamation queue for heaps that defer frees.
///
/// Buffer teardown pushes the allocation token here instead of freeing it
/// inline; the queue is drained either explicitly or synchronously when an
/// allocation on the owning heap fails (drain-then-retry-once).
#[derive(Default)]
pub struct DeferredFreeQueue {
    pending: Mutex<VecDeque<Allocation>>,
}

impl DeferredFreeQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an allocation for later reclamation.
    pub fn push(&self, allocation: Allocation) {
        self.pending.lock().unwrap().push_back(allocation);
    }

    /// Take up to `max` pending allocations off the queue.
    pub fn take(&self, max: usize) -> Vec<Allocation> {
        let mut pending = self.pending.lock().unwrap();
        let n = max.min(pending.len());
        pending.drain(..n).collect()
    }

    /// Number of allocations awaiting reclamation.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drain up to `max` deferred frees from `heap`, returning how many
/// allocations were reclaimed. A no-op for heaps without deferred free.
pub fn drain_deferred(heap: &dyn Heap, max: usize) -> usize {
    let Some(queue) = heap.deferred_free() else {
        return 0;
    };
    let batch = queue.take(max);
    let drained = batch.len();
    for allocation in batch {
        heap.free(allocation);
    }
    if drained > 0 {
        tracing::debug!(heap = heap.name(), drained, "drained deferred frees");
        crate::observability::record_deferred_pending(queue.len());
    }
    drained
}

/// The heap capability contract.
///
/// `allocate`, `free`, and the DMA mapping pair are required; the remaining
/// operations have defaults that report the capability as absent.
pub trait Heap: Send + Sync {
    /// This heap's device-unique id.
    fn id(&self) -> HeapId;

    /// Display name for diagnostics.
    fn name(&self) -> &str;

    /// Classification used for allocation ordering.
    fn heap_type(&self) -> HeapType;

    /// Allocate backing storage for `len` bytes (page-aligned by the caller)
    /// with the given alignment and flags.
    fn allocate(&self, len: usize, align: usize, flags: BufferFlags) -> Result<Allocation>;

    /// Release backing storage. Must tolerate allocations that sat on a
    /// deferred-free queue after the owning buffer was torn down.
    fn free(&self, allocation: Allocation);

    /// Describe the allocation's backing pages as a scatter-gather table.
    fn map_dma(&self, allocation: &Allocation) -> Result<SgTable>;

    /// Inverse of [`Heap::map_dma`].
    fn unmap_dma(&self, allocation: &Allocation) {
        let _ = allocation;
    }

    /// Build a persistent linear mapping of the whole allocation.
    fn map_kernel(&self, allocation: &Allocation) -> Result<NonNull<u8>> {
        let _ = allocation;
        Err(Error::Unsupported("map_kernel"))
    }

    /// Tear down a mapping produced by [`Heap::map_kernel`].
    fn unmap_kernel(&self, allocation: &Allocation, vaddr: NonNull<u8>) {
        let _ = (allocation, vaddr);
    }

    /// Eagerly install every page of the allocation into a user mapping.
    /// Heaps without this capability rely on fault-driven mapping instead.
    fn map_user(&self, allocation: &Allocation, mapping: &UserMapping) -> Result<()> {
        let _ = (allocation, mapping);
        Err(Error::Unsupported("map_user"))
    }

    /// Physical address and length of a physically-contiguous allocation.
    fn phys(&self, allocation: &Allocation) -> Result<(u64, usize)> {
        let _ = allocation;
        Err(Error::Unsupported("phys"))
    }

    /// Bulk-preallocation hint. Heaps may warm internal pools; the default
    /// ignores the hint.
    fn preload(&self, flags: BufferFlags, lengths: &[usize]) {
        let _ = (flags, lengths);
    }

    /// The heap's deferred-free queue, if it opts into deferred reclamation.
    fn deferred_free(&self) -> Option<&DeferredFreeQueue> {
        None
    }

    /// True if buffers with `flags` from this heap must be user-mapped
    /// page-by-page on fault, with dirty tracking.
    fn fault_mapped(&self, flags: BufferFlags) -> bool {
        let _ = flags;
        false
    }

    /// Cache-maintenance hook invoked over each mapped span during a sync.
    /// The default is a no-op (coherent backing store).
    fn sync_span(&self, span: &mut [u8], direction: Direction) {
        let _ = (span, direction);
    }
}
