//! Per-owner handle registries.
//!
//! A [`Client`] is one logical owner's view of the allocator: it holds the
//! id space for that owner's handles, serializes every handle operation
//! under its own lock, and de-duplicates imports so one buffer never gets
//! two distinct handles within the same client. Handle validation against
//! the client is the sole authorization check in front of every operation
//! that takes a caller-supplied handle.

use crate::buffer::{Buffer, BufferId, TaskInfo};
use crate::error::{Error, Result};
use crate::flags::BufferFlags;
use crate::handle::{Handle, HandleCore, HandleId};
use crate::share::SharedBuffer;
use crate::device::Device;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Handle bookkeeping guarded by the per-client lock.
struct ClientState {
    handles: BTreeMap<HandleId, Weak<HandleCore>>,
    by_buffer: BTreeMap<BufferId, HandleId>,
    next_id: HandleId,
}

/// Client state shared with handle cores through weak backrefs.
pub(crate) struct ClientShared {
    id: u64,
    name: String,
    task: TaskInfo,
    device: Arc<Device>,
    state: Mutex<ClientState>,
}

impl ClientShared {
    /// Called from handle-core teardown: drop the registration entries if
    /// they still describe the dying core.
    pub(crate) fn remove_handle(&self, id: HandleId, buffer: BufferId) {
        let mut state = self.state.lock().unwrap();
        let dead = state
            .handles
            .get(&id)
            .is_some_and(|weak| weak.strong_count() == 0);
        if dead {
            state.handles.remove(&id);
            if state.by_buffer.get(&buffer) == Some(&id) {
                state.by_buffer.remove(&buffer);
            }
        }
    }

    pub(crate) fn client_id(&self) -> u64 {
        self.id
    }

    /// Accounting snapshot for the device report: name, owning pid, live
    /// handle count, total referenced bytes.
    pub(crate) fn summary(&self) -> (String, u32, usize, usize) {
        let state = self.state.lock().unwrap();
        let live: Vec<_> = state.handles.values().filter_map(Weak::upgrade).collect();
        let bytes = live.iter().map(|core| core.buffer.len()).sum();
        (self.name.clone(), self.task.pid, live.len(), bytes)
    }

    fn add_handle_locked(
        self: &Arc<Self>,
        state: &mut ClientState,
        buffer: Arc<Buffer>,
    ) -> Handle {
        let id = loop {
            let candidate = state.next_id;
            state.next_id = state.next_id.wrapping_add(1).max(1);
            if !state.handles.contains_key(&candidate) {
                break candidate;
            }
        };
        let buffer_id = buffer.id();
        let core = Arc::new(HandleCore::new(id, buffer, Arc::downgrade(self)));
        state.handles.insert(id, Arc::downgrade(&core));
        state.by_buffer.insert(buffer_id, id);
        Handle::new(core)
    }
}

/// One logical owner (process or subsystem) of allocator handles.
///
/// Dropping the client invalidates every registration: outstanding handle
/// guards stay usable as buffer references but no longer validate, and
/// their buffer references are released as the guards drop.
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// Create a client against `device` with a display name. The calling
    /// task's identity is captured for accounting.
    pub fn new(device: &Arc<Device>, name: &str) -> Client {
        let shared = Arc::new(ClientShared {
            id: CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            name: name.to_owned(),
            task: TaskInfo::current(),
            device: Arc::clone(device),
            state: Mutex::new(ClientState {
                handles: BTreeMap::new(),
                by_buffer: BTreeMap::new(),
                next_id: 1,
            }),
        });
        device.register_client(&shared);
        tracing::debug!(client = %shared.name, id = shared.id, "created client");
        Client { shared }
    }

    /// Device-wide unique client id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Identity of the creating task.
    pub fn task(&self) -> &TaskInfo {
        &self.shared.task
    }

    /// The device this client allocates from.
    pub fn device(&self) -> &Arc<Device> {
        &self.shared.device
    }

    /// Allocate a buffer from the first heap in `heap_mask` that can
    /// satisfy the request, and wrap it in a fresh handle.
    pub fn alloc(
        &self,
        len: usize,
        align: usize,
        heap_mask: u32,
        flags: BufferFlags,
    ) -> Result<Handle> {
        let buffer = self.shared.device.allocate(len, align, heap_mask, flags)?;
        let mut state = self.shared.state.lock().unwrap();
        Ok(self.shared.add_handle_locked(&mut state, buffer))
    }

    /// True iff `handle` is currently registered with this client. Every
    /// handle-consuming operation checks this before touching the buffer.
    pub fn validate(&self, handle: &Handle) -> bool {
        let state = self.shared.state.lock().unwrap();
        state
            .handles
            .get(&handle.id())
            .is_some_and(|weak| weak.as_ptr() == Arc::as_ptr(&handle.core))
    }

    /// Release one handle reference. An invalid handle is logged and the
    /// reference still dropped; the call never panics.
    pub fn free(&self, handle: Handle) {
        if !self.validate(&handle) {
            tracing::warn!(
                client = %self.shared.name,
                handle = handle.id(),
                "free of a handle not registered with this client"
            );
        }
        drop(handle);
    }

    /// Export a handle's buffer as a sharing object holding its own buffer
    /// reference.
    pub fn share(&self, handle: &Handle) -> Result<SharedBuffer> {
        if !self.validate(handle) {
            return Err(Error::InvalidHandle);
        }
        Ok(SharedBuffer::new(
            Arc::clone(handle.buffer()),
            self.shared.device.id(),
        ))
    }

    /// Import a sharing object, returning a handle to its buffer.
    ///
    /// Rejects objects exported by a different device. If this client
    /// already holds a handle for the buffer, a new reference to that same
    /// handle is returned instead of a duplicate.
    pub fn import(&self, shared: &SharedBuffer) -> Result<Handle> {
        if shared.device_id() != self.shared.device.id() {
            return Err(Error::InvalidArgument(
                "buffer was exported by a different allocator".into(),
            ));
        }
        let mut state = self.shared.state.lock().unwrap();
        if let Some(&existing) = state.by_buffer.get(&shared.buffer().id()) {
            if let Some(core) = state.handles.get(&existing).and_then(Weak::upgrade) {
                return Ok(Handle::new(core));
            }
        }
        Ok(self
            .shared
            .add_handle_locked(&mut state, Arc::clone(shared.buffer())))
    }

    /// Find this client's handle for `buffer`, if one exists.
    pub fn lookup_by_buffer(&self, buffer: &Arc<Buffer>) -> Option<Handle> {
        let state = self.shared.state.lock().unwrap();
        let id = state.by_buffer.get(&buffer.id())?;
        let core = state.handles.get(id)?.upgrade()?;
        Some(Handle::new(core))
    }

    /// Map a handle's buffer linearly. Fails with the invalid-handle
    /// condition if the handle does not validate.
    pub fn map_kernel(&self, handle: &Handle) -> Result<NonNull<u8>> {
        if !self.validate(handle) {
            return Err(Error::InvalidHandle);
        }
        handle.core.kmap()
    }

    /// Undo one [`Client::map_kernel`] call.
    pub fn unmap_kernel(&self, handle: &Handle) -> Result<()> {
        if !self.validate(handle) {
            return Err(Error::InvalidHandle);
        }
        handle.core.kunmap();
        Ok(())
    }

    /// Number of live handles registered with this client.
    pub fn handle_count(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state
            .handles
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Total bytes referenced by this client's live handles.
    pub fn total_size(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state
            .handles
            .values()
            .filter_map(Weak::upgrade)
            .map(|core| core.buffer.len())
            .sum()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.handles.clear();
            state.by_buffer.clear();
        }
        self.shared.device.unregister_client(self.shared.id);
        tracing::debug!(client = %self.shared.name, "destroyed client");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("handles", &self.handle_count())
            .finish()
    }
}
