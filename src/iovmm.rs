//! IOVA mapping cache: per-buffer device mappings behind an IOMMU.
//!
//! A DMA-capable consumer is modeled as a [`DmaDevice`] that may sit behind
//! an IOMMU ([`IoVmm`] implementation). Buffers cache one mapping record per
//! (device, region) pair with a map count; repeat maps of the same region
//! bump the count, and a stale mapping is only torn down once its count is
//! zero *and* a different mapping for the same device has superseded it —
//! repeated maps of one region never churn through unmap/remap.
//!
//! A device without an IOMMU falls back to the buffer's raw physical
//! address; that soft fallback is distinct from IOVA-space exhaustion,
//! which is a hard error from the backend.

use crate::error::{Error, Result};
use crate::sg::SgTable;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static DMA_DEVICE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier of an IOVA region within a device's address space.
pub type RegionId = u32;

/// An IOMMU backend mapping scatter-gather lists into device address space.
pub trait IoVmm: Send + Sync {
    /// Map `sg` into the given region, returning the I/O virtual address.
    fn map(&self, sg: &SgTable, region: RegionId) -> Result<u64>;

    /// Tear down a mapping previously returned by [`IoVmm::map`].
    fn unmap(&self, iova: u64, region: RegionId);
}

/// A DMA-capable device, optionally behind an IOMMU.
pub struct DmaDevice {
    id: u64,
    name: String,
    iovmm: Option<Arc<dyn IoVmm>>,
}

impl DmaDevice {
    /// Create a device. `iovmm: None` models a device with no IOMMU; IOVA
    /// requests for it fall back to physical addresses.
    pub fn new(name: &str, iovmm: Option<Arc<dyn IoVmm>>) -> Arc<Self> {
        Arc::new(Self {
            id: DMA_DEVICE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            name: name.to_owned(),
            iovmm,
        })
    }

    /// Unique device id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn iovmm(&self) -> Option<&Arc<dyn IoVmm>> {
        self.iovmm.as_ref()
    }
}

impl std::fmt::Debug for DmaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("iommu", &self.iovmm.is_some())
            .finish()
    }
}

/// One cached mapping of a buffer into a device's IOVA space.
pub(crate) struct IovaRecord {
    pub(crate) device: u64,
    pub(crate) region: RegionId,
    pub(crate) iova: u64,
    pub(crate) map_count: usize,
    /// Backend that produced the mapping; `None` for the physical-address
    /// fallback, which has nothing to unmap.
    pub(crate) iovmm: Option<Arc<dyn IoVmm>>,
}

impl IovaRecord {
    pub(crate) fn release(self) {
        if let Some(iovmm) = self.iovmm {
            iovmm.unmap(self.iova, self.region);
        }
    }
}

/// Software IOVA allocator: a bump allocator with live-map accounting.
///
/// Suitable as a stand-in IOMMU for tests and single-process deployments.
#[derive(Default)]
pub struct LinearIoVmm {
    inner: Mutex<LinearState>,
}

#[derive(Default)]
struct LinearState {
    next: u64,
    live: BTreeMap<u64, usize>,
}

impl LinearIoVmm {
    /// Create an empty allocator.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of currently live mappings.
    pub fn live_mappings(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }
}

impl IoVmm for LinearIoVmm {
    fn map(&self, sg: &SgTable, _region: RegionId) -> Result<u64> {
        let len = sg.len();
        if len == 0 {
            return Err(Error::InvalidArgument("empty scatter-gather list".into()));
        }
        let mut state = self.inner.lock().unwrap();
        // IOVA space starts above zero so an address of 0 never appears.
        let iova = 0x1000_0000 + state.next;
        state.next += crate::sg::page_align(len) as u64;
        state.live.insert(iova, len);
        Ok(iova)
    }

    fn unmap(&self, iova: u64, _region: RegionId) {
        if self.inner.lock().unwrap().live.remove(&iova).is_none() {
            tracing::warn!(iova, "unmap of unknown IOVA");
        }
    }
}
