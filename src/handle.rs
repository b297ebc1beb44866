//! Per-client capability tokens referencing buffers.
//!
//! A [`Handle`] is an RAII guard over a shared core: the core's strong
//! count is the handle reference count. Import de-duplication hands out
//! additional guards over the same core; the core itself is destroyed —
//! releasing its buffer reference and its client registration — when the
//! last guard drops.

use crate::buffer::Buffer;
use crate::client::ClientShared;
use crate::error::Result;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, Weak};

/// Client-unique handle identifier.
pub type HandleId = u32;

/// Shared state behind one or more [`Handle`] guards.
pub(crate) struct HandleCore {
    pub(crate) id: HandleId,
    pub(crate) buffer: Arc<Buffer>,
    pub(crate) client: Weak<ClientShared>,
    /// Nested kernel mappings taken through this handle, unwound at drop.
    kmap_count: Mutex<usize>,
}

impl HandleCore {
    pub(crate) fn new(id: HandleId, buffer: Arc<Buffer>, client: Weak<ClientShared>) -> Self {
        buffer.handle_get();
        Self {
            id,
            buffer,
            client,
            kmap_count: Mutex::new(0),
        }
    }

    pub(crate) fn kmap(&self) -> Result<NonNull<u8>> {
        let vaddr = self.buffer.kmap()?;
        *self.kmap_count.lock().unwrap() += 1;
        Ok(vaddr)
    }

    pub(crate) fn kunmap(&self) {
        let mut count = self.kmap_count.lock().unwrap();
        if *count == 0 {
            tracing::warn!(handle = self.id, "unbalanced kernel unmap through handle");
            return;
        }
        *count -= 1;
        self.buffer.kunmap();
    }
}

impl Drop for HandleCore {
    fn drop(&mut self) {
        // Unwind kernel mappings leaked through this handle before the
        // buffer reference goes away.
        let count = *self.kmap_count.get_mut().unwrap();
        if count > 0 {
            tracing::warn!(
                handle = self.id,
                count,
                "handle destroyed with live kernel mappings"
            );
            for _ in 0..count {
                self.buffer.kunmap();
            }
        }
        if let Some(client) = self.client.upgrade() {
            client.remove_handle(self.id, self.buffer.id());
        }
        self.buffer.handle_put();
    }
}

/// An owned reference to a buffer capability within one client.
///
/// Dropping the guard releases one handle reference; the underlying
/// capability is destroyed when the last reference drops.
pub struct Handle {
    pub(crate) core: Arc<HandleCore>,
}

impl Handle {
    pub(crate) fn new(core: Arc<HandleCore>) -> Self {
        Self { core }
    }

    /// Client-unique id of this handle.
    pub fn id(&self) -> HandleId {
        self.core.id
    }

    /// The referenced buffer.
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.core.buffer
    }

    /// Current handle reference count.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.core)
    }

    /// Take an additional reference to the same capability.
    pub fn clone_ref(&self) -> Handle {
        Handle {
            core: Arc::clone(&self.core),
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.core.id)
            .field("buffer", &self.core.buffer.id())
            .field("refs", &self.ref_count())
            .finish()
    }
}
