//! Cross-client sharing objects.
//!
//! A [`SharedBuffer`] is the export side of the sharing bridge: it owns a
//! strong buffer reference of its own, records which device exported it so
//! imports can reject foreign buffers, and carries the attachment list for
//! DMA consumers plus the CPU-access protocol. Clones share one underlying
//! object, so passing it between threads models passing a file description
//! between processes.

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::iovmm::DmaDevice;
use crate::sg::{page_align, SgTable, PAGE_SIZE};
use crate::usermap::{Direction, UserMapping};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

/// One DMA consumer attached to a shared buffer.
struct Attachment {
    device: u64,
    direction: Direction,
}

struct SharedInner {
    buffer: Arc<Buffer>,
    device_id: u64,
    attachments: Mutex<Vec<Attachment>>,
}

/// An exported buffer reference that crosses client boundaries.
#[derive(Clone)]
pub struct SharedBuffer {
    inner: Arc<SharedInner>,
}

impl SharedBuffer {
    pub(crate) fn new(buffer: Arc<Buffer>, device_id: u64) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                buffer,
                device_id,
                attachments: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The referenced buffer.
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.inner.buffer
    }

    /// Id of the device that exported this buffer.
    pub fn device_id(&self) -> u64 {
        self.inner.device_id
    }

    /// Attach a DMA consumer and hand it the buffer's scatter-gather
    /// description, flushing CPU caches toward the device first.
    pub fn map_attachment(&self, dma: &DmaDevice, direction: Direction) -> Result<SgTable> {
        self.inner.buffer.sync_for_device(direction)?;
        self.inner.attachments.lock().unwrap().push(Attachment {
            device: dma.id(),
            direction,
        });
        tracing::debug!(
            buffer = self.inner.buffer.id(),
            device = dma.name(),
            "attached DMA consumer"
        );
        Ok(self.inner.buffer.sg().clone())
    }

    /// Detach one attachment of `dma`. Unknown detaches are logged, not
    /// errors.
    pub fn unmap_attachment(&self, dma: &DmaDevice) {
        let mut attachments = self.inner.attachments.lock().unwrap();
        match attachments.iter().rposition(|a| a.device == dma.id()) {
            Some(pos) => {
                attachments.remove(pos);
            }
            None => tracing::warn!(
                buffer = self.inner.buffer.id(),
                device = dma.name(),
                "detach without a matching attachment"
            ),
        }
    }

    /// Number of live attachments.
    pub fn attachment_count(&self) -> usize {
        self.inner.attachments.lock().unwrap().len()
    }

    /// Map a byte range of the buffer into user space.
    ///
    /// `offset` must be page-aligned and the range must lie inside the
    /// buffer. Buffers allocated without zeroing refuse user mappings
    /// outright. Fault-driven buffers return an empty mapping whose pages
    /// install on access; others are installed eagerly by the heap.
    pub fn mmap(&self, offset: usize, len: usize) -> Result<Arc<UserMapping>> {
        let buffer = &self.inner.buffer;
        if buffer.flags().mmap_forbidden() {
            return Err(Error::InvalidArgument(
                "buffer with unzeroed contents cannot be user-mapped".into(),
            ));
        }
        if len == 0 || offset % PAGE_SIZE != 0 || offset.checked_add(len).is_none() {
            return Err(Error::InvalidArgument("bad mapping range".into()));
        }
        if offset + len > buffer.len() {
            return Err(Error::InvalidArgument(format!(
                "mapping of {len} bytes at {offset} exceeds buffer of {} bytes",
                buffer.len()
            )));
        }

        let page_offset = offset / PAGE_SIZE;
        let page_count = page_align(len) / PAGE_SIZE;
        let mapping = buffer.register_mapping(page_offset, page_count);
        if !buffer.fault_mapped() {
            match buffer.map_user(&mapping) {
                Ok(()) => {}
                Err(Error::Unsupported(_)) => {
                    return Err(Error::InvalidArgument(
                        "heap does not support user mapping".into(),
                    ));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(mapping)
    }

    /// Begin a CPU access window: returns a linear mapping of the buffer,
    /// holding one kernel-map reference until the matching
    /// [`SharedBuffer::end_cpu_access`].
    pub fn begin_cpu_access(&self, _direction: Direction) -> Result<NonNull<u8>> {
        self.inner.buffer.kmap()
    }

    /// End a CPU access window: flush toward the device for the given
    /// direction, then drop the kernel-map reference.
    pub fn end_cpu_access(&self, direction: Direction) -> Result<()> {
        let result = self.inner.buffer.sync_for_device(direction);
        self.inner.buffer.kunmap();
        result
    }

    /// Flush CPU-cached contents toward a device consumer.
    pub fn sync_for_device(&self, direction: Direction) -> Result<()> {
        self.inner.buffer.sync_for_device(direction)
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("buffer", &self.inner.buffer.id())
            .field("device", &self.inner.device_id)
            .field("attachments", &self.attachment_count())
            .finish()
    }
}
