//! Device registry: handle id allocation and open/close/ioctl dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::NetsmbConfig;
use crate::error::{NetsmbError, Result};
use crate::handle::DeviceHandle;
use crate::ioctl::{AccessClass, CommandEnv, IoctlReply, IoctlRequest};
use crate::lock_order::{LockLevel, OrderedRwLock};
use crate::notifier::NotifierRegistration;
use crate::session::SessionManager;
use crate::transport::{PathConverter, ProcessTable, SmbTransport, Utf16PathConverter};

/// Reserved id: opening it allocates a fresh handle and always reports busy.
pub const NETSMB_BOOTSTRAP_ID: u32 = 0;

struct Slots {
    handles: Vec<Option<Arc<DeviceHandle>>>,
    /// Highest published id.
    high_water: u32,
}

impl Slots {
    fn new(max_handles: u32) -> Self {
        Self {
            handles: vec![None; max_handles as usize + 1],
            high_water: 0,
        }
    }

    fn get(&self, id: u32) -> Option<&Arc<DeviceHandle>> {
        self.handles.get(id as usize).and_then(|slot| slot.as_ref())
    }

    fn free_id(&self) -> Option<u32> {
        (1..self.handles.len() as u32).find(|id| self.handles[*id as usize].is_none())
    }

    fn remove(&mut self, id: u32) {
        if let Some(slot) = self.handles.get_mut(id as usize) {
            *slot = None;
        }
        while self.high_water > 0 && self.handles[self.high_water as usize].is_none() {
            self.high_water -= 1;
        }
    }

    fn published(&self) -> impl Iterator<Item = &Arc<DeviceHandle>> {
        self.handles[..=self.high_water as usize]
            .iter()
            .filter_map(|slot| slot.as_ref())
    }
}

/// Process-wide registry of device handles.
pub struct DeviceRegistry {
    slots: OrderedRwLock<Slots>,
    max_handles: u32,
    unloading: AtomicBool,
    manager: Arc<SessionManager>,
    notifier: NotifierRegistration,
    converter: Arc<dyn PathConverter>,
}

impl DeviceRegistry {
    pub fn new(
        config: NetsmbConfig,
        transport: Arc<dyn SmbTransport>,
        processes: Arc<dyn ProcessTable>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "device registry loaded: {} handle ids, notifier {:?}",
            config.max_handles, config.notifier_process_name
        );
        Ok(Self {
            slots: OrderedRwLock::new(LockLevel::Registry, Slots::new(config.max_handles)),
            max_handles: config.max_handles,
            unloading: AtomicBool::new(false),
            manager: Arc::new(SessionManager::new(transport, config.multichannel)),
            notifier: NotifierRegistration::new(&config.notifier_process_name, processes),
            converter: Arc::new(Utf16PathConverter),
        })
    }

    pub fn with_converter(mut self, converter: Arc<dyn PathConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn max_handles(&self) -> u32 {
        self.max_handles
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn notifier(&self) -> &NotifierRegistration {
        &self.notifier
    }

    pub fn handle(&self, id: u32) -> Option<Arc<DeviceHandle>> {
        self.slots.read().get(id).cloned()
    }

    pub fn open_count(&self) -> usize {
        self.slots.read().published().filter(|h| h.is_open()).count()
    }

    /// Publishes a closed handle under the lowest unused id.
    pub fn allocate(&self) -> Result<u32> {
        let mut slots = self.slots.write();
        if self.unloading.load(Ordering::SeqCst) {
            return Err(NetsmbError::HandleBusy {
                id: NETSMB_BOOTSTRAP_ID,
            });
        }
        let id = slots.free_id().ok_or(NetsmbError::HandleIdsExhausted {
            max: self.max_handles,
        })?;
        slots.handles[id as usize] = Some(Arc::new(DeviceHandle::new(id)));
        slots.high_water = slots.high_water.max(id);
        debug!("handle {} allocated", id);
        Ok(id)
    }

    /// Opens `id`. The bootstrap id allocates a new handle and reports busy.
    pub fn open(&self, id: u32) -> Result<()> {
        if id == NETSMB_BOOTSTRAP_ID {
            let allocated = self.allocate()?;
            debug!("bootstrap open published handle {}", allocated);
            return Err(NetsmbError::HandleBusy { id });
        }
        let slots = self.slots.read();
        if self.unloading.load(Ordering::SeqCst) {
            return Err(NetsmbError::HandleBusy { id });
        }
        let handle = slots.get(id).ok_or(NetsmbError::HandleInvalid { id })?;
        if !handle.mark_open() {
            return Err(NetsmbError::HandleBusy { id });
        }
        info!("handle {} opened", id);
        Ok(())
    }

    /// Unpublished ids are invalid; published but closed ones are gone.
    fn open_handle(slots: &Slots, id: u32) -> Result<Arc<DeviceHandle>> {
        let handle = slots.get(id).ok_or(NetsmbError::HandleInvalid { id })?;
        if !handle.is_open() {
            return Err(NetsmbError::HandleGone { id });
        }
        Ok(Arc::clone(handle))
    }

    /// Releases the handle's share and session and unpublishes it. Waits for
    /// every in-flight ioctl on the handle.
    pub fn close(&self, id: u32) -> Result<()> {
        let mut slots = self.slots.write();
        let handle = Self::open_handle(&slots, id)?;
        {
            let mut state = handle.state.write();
            state.release();
            handle.mark_closed();
        }
        slots.remove(id);
        info!("handle {} closed", id);
        Ok(())
    }

    /// Runs one command on an open handle.
    ///
    /// The registry lock is held only across the lookup and the handle lock
    /// acquisition; blocking work runs under the handle lock alone.
    pub fn ioctl(&self, id: u32, request: IoctlRequest) -> Result<IoctlReply> {
        let slots = self.slots.read();
        let handle = Self::open_handle(&slots, id)?;
        request.check_version()?;
        debug!("handle {}: {}", id, request.name());

        let env = CommandEnv {
            manager: &self.manager,
            converter: self.converter.as_ref(),
            ctx: handle.call_context(),
        };
        match request.access_class() {
            AccessClass::Exclusive => {
                let mut state = handle.state.write_arc();
                drop(slots);
                env.execute_exclusive(&mut state, request)
            }
            AccessClass::Shared => {
                let state = handle.state.read_arc();
                drop(slots);
                env.execute_shared(&state, request)
            }
            AccessClass::Unlocked => {
                drop(slots);
                self.execute_unlocked(&handle, request)
            }
        }
    }

    fn execute_unlocked(&self, handle: &DeviceHandle, request: IoctlRequest) -> Result<IoctlReply> {
        match request {
            IoctlRequest::CancelSession => {
                handle.request_cancel();
                Ok(IoctlReply::Done)
            }
            IoctlRequest::UpdateNotifierPid(payload) => {
                self.notifier.register(payload.pid)?;
                Ok(IoctlReply::Done)
            }
            IoctlRequest::GetNotifierPid(_) => Ok(IoctlReply::NotifierPid(self.notifier.query())),
            IoctlRequest::NotifierUpdateInterfaces(payload) => {
                self.manager.notify_interfaces_changed(&payload.update)?;
                Ok(IoctlReply::Done)
            }
            other => Err(NetsmbError::InvalidArgument {
                msg: format!("{} needs the handle lock", other.name()),
            }),
        }
    }

    /// Tears the registry down. Fails while any handle is open; afterwards
    /// every open reports busy.
    pub fn unload(&self) -> Result<()> {
        let mut slots = self.slots.write();
        if let Some(open) = slots.published().find(|h| h.is_open()) {
            warn!("unload refused: handle {} still open", open.id());
            return Err(NetsmbError::HandleBusy { id: open.id() });
        }
        self.unloading.store(true, Ordering::SeqCst);
        let dropped = slots.published().count();
        for slot in slots.handles.iter_mut() {
            *slot = None;
        }
        slots.high_water = 0;
        drop(slots);
        self.notifier.clear();
        info!("device registry unloaded ({} idle handles dropped)", dropped);
        Ok(())
    }

    pub fn is_unloading(&self) -> bool {
        self.unloading.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("max_handles", &self.max_handles)
            .field("unloading", &self.is_unloading())
            .finish_non_exhaustive()
    }
}
