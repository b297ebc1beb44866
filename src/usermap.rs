//! Lazy user mappings and per-page dirty tracking.
//!
//! A [`UserMapping`] models one vma: a page range of a buffer mapped into an
//! address space. For fault-driven buffers no page is present up front; each
//! access fault installs one page and marks it dirty. A device sync flushes
//! dirty pages and zaps every registered mapping over them, so the next CPU
//! access re-faults instead of silently reusing a mapping whose cache state
//! is unknown.

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Weak};

static MAPPING_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// DMA transfer direction for cache maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// CPU writes, device reads: flush CPU caches before device access.
    ToDevice,
    /// Device writes, CPU reads: invalidate CPU caches after device access.
    FromDevice,
    /// Both directions.
    Bidirectional,
    /// Coherent access; no maintenance required.
    None,
}

/// Cache state of one backing page of a fault-driven buffer.
///
/// An explicit tagged state per page, kept in an array parallel to the
/// buffer's page list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Page caches are in sync with the backing store.
    Clean,
    /// CPU wrote the page since its last flush toward a device.
    Dirty,
}

/// One registered user mapping (vma model) of a buffer page range.
///
/// The mapping tracks per-page presence: a present page is installed in the
/// "process page table"; an absent page re-faults on next access. The
/// mapping holds only a weak buffer reference — a vma never keeps its buffer
/// alive.
pub struct UserMapping {
    id: u64,
    buffer: Weak<Buffer>,
    page_offset: usize,
    page_count: usize,
    present: Mutex<Vec<bool>>,
}

impl UserMapping {
    pub(crate) fn new(buffer: Weak<Buffer>, page_offset: usize, page_count: usize) -> Self {
        Self {
            id: MAPPING_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            buffer,
            page_offset,
            page_count,
            present: Mutex::new(vec![false; page_count]),
        }
    }

    /// Unique id of this mapping.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// First buffer page covered by this mapping.
    pub fn page_offset(&self) -> usize {
        self.page_offset
    }

    /// Number of pages covered.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Handle an access fault on page `index` (relative to this mapping):
    /// install the page and mark it dirty in the buffer's page-state array.
    ///
    /// The caller owns the faulting side's serialization; this only touches
    /// its own presence state and the buffer's dirty bits.
    pub fn fault(&self, index: usize) -> Result<()> {
        if index >= self.page_count {
            return Err(Error::InvalidArgument(format!(
                "fault index {} outside mapping of {} pages",
                index, self.page_count
            )));
        }
        self.present.lock().unwrap()[index] = true;
        if let Some(buffer) = self.buffer.upgrade() {
            buffer.mark_page_dirty(self.page_offset + index);
        }
        Ok(())
    }

    /// True if page `index` is currently installed.
    pub fn is_present(&self, index: usize) -> bool {
        self.present
            .lock()
            .unwrap()
            .get(index)
            .copied()
            .unwrap_or(false)
    }

    /// Install every page eagerly. Used by heaps with a direct user-mapping
    /// capability instead of the fault path.
    pub(crate) fn install_all(&self) {
        self.present.lock().unwrap().fill(true);
    }

    /// Remove the given buffer-page range from this mapping so the next
    /// access re-faults. Pages outside this mapping are ignored.
    pub(crate) fn zap(&self, buffer_pages: &[usize]) {
        let mut present = self.present.lock().unwrap();
        for &page in buffer_pages {
            if let Some(index) = page.checked_sub(self.page_offset) {
                if index < self.page_count {
                    present[index] = false;
                }
            }
        }
    }

    /// Number of currently installed pages.
    pub fn present_count(&self) -> usize {
        self.present.lock().unwrap().iter().filter(|p| **p).count()
    }
}

impl Drop for UserMapping {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.upgrade() {
            buffer.unregister_mapping(self.id);
        }
    }
}

impl std::fmt::Debug for UserMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserMapping")
            .field("id", &self.id)
            .field("page_offset", &self.page_offset)
            .field("page_count", &self.page_count)
            .field("present", &self.present_count())
            .finish()
    }
}
