//! # ionpool
//!
//! A graphics-memory buffer allocator with heap-backed buffers, per-client
//! handles, and cross-client sharing.
//!
//! Buffers come from pluggable heaps (system pool or carveout region), are
//! referenced through per-client handles, and cross client boundaries via
//! sharing objects. Cache maintenance for non-coherent consumers runs
//! through a bounded pool of sync windows, with per-page dirty tracking for
//! fault-mapped buffers and a cached IOVA map per DMA consumer.
//!
//! ## Features
//!
//! - **Pluggable heaps**: system (memfd-backed page pool) and carveout
//!   (first-fit over one linear region), walked in priority order
//! - **Reference-counted lifecycle**: buffers, handles, and sharing objects
//!   each with their own count; deferred free with drain-on-pressure
//! - **Sharing bridge**: export/import with per-client de-duplication and
//!   foreign-allocator rejection
//! - **Lazy user mappings**: fault-driven page install, dirty tracking, and
//!   zap-on-sync for cached buffers
//! - **IOVA cache**: per-(device, region) map counts with lazy reclamation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ionpool::prelude::*;
//!
//! let device = Device::new()?;
//! device.add_heap(SystemHeap::new(0, "system", 64 << 20)?);
//!
//! let client = Client::new(&device, "camera");
//! let handle = client.alloc(1 << 20, 0, HEAP_MASK_ALL, BufferFlags::CACHED)?;
//!
//! let shared = client.share(&handle)?;
//! shared.sync_for_device(Direction::ToDevice)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod client;
pub mod device;
pub mod error;
pub mod flags;
pub mod handle;
pub mod heap;
pub mod iovmm;
pub mod observability;
pub mod sg;
pub mod share;
pub mod usermap;
pub mod window;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{Buffer, BufferId, TaskInfo};
    pub use crate::client::Client;
    pub use crate::device::Device;
    pub use crate::error::{Error, Result};
    pub use crate::flags::BufferFlags;
    pub use crate::heap::{CarveoutHeap, Heap, HeapType, SystemHeap, HEAP_MASK_ALL};
    pub use crate::handle::{Handle, HandleId};
    pub use crate::iovmm::{DmaDevice, IoVmm, LinearIoVmm};
    pub use crate::share::SharedBuffer;
    pub use crate::usermap::Direction;
}

pub use error::{Error, Result};
