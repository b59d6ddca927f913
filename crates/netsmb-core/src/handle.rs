//! Per-open device handle.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{NetsmbError, Result};
use crate::lock_order::{LockLevel, OrderedRwLock};
use crate::session::{Session, SessionRef, Share, ShareRef};
use crate::transport::CallContext;

/// Handle flag word, readable without the handle lock.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleFlags(pub u32);

impl HandleFlags {
    pub const OPEN: HandleFlags = HandleFlags(0x1);
    pub const CANCEL_REQUESTED: HandleFlags = HandleFlags(0x2);

    pub fn contains(&self, other: HandleFlags) -> bool {
        (self.0 & other.0) != 0
    }
}

/// Bindings guarded by the handle lock.
///
/// The share is declared first and released first: a share never outlives
/// the session reference it was bound under.
#[derive(Debug, Default)]
pub struct HandleState {
    share: Option<ShareRef>,
    session: Option<SessionRef>,
}

impl HandleState {
    pub fn session(&self) -> Option<&SessionRef> {
        self.session.as_ref()
    }

    pub fn share(&self) -> Option<&ShareRef> {
        self.share.as_ref()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn has_share(&self) -> bool {
        self.share.is_some()
    }

    /// Bound session or [`NetsmbError::NotConnected`].
    pub fn require_session(&self) -> Result<&SessionRef> {
        self.session.as_ref().ok_or(NetsmbError::NotConnected)
    }

    /// Bound share or [`NetsmbError::NotConnected`].
    pub fn require_share(&self) -> Result<&ShareRef> {
        self.share.as_ref().ok_or(NetsmbError::NotConnected)
    }

    /// Fails with [`NetsmbError::AlreadyConnected`] if anything is bound.
    pub fn require_unbound(&self) -> Result<()> {
        if self.session.is_some() || self.share.is_some() {
            return Err(NetsmbError::AlreadyConnected);
        }
        Ok(())
    }

    pub fn bind_session(&mut self, session: SessionRef) -> Result<()> {
        self.require_unbound()?;
        self.session = Some(session);
        Ok(())
    }

    pub fn bind_share(&mut self, share: ShareRef) -> Result<()> {
        let session = self.require_session()?;
        if session.id() != share.session_id() {
            return Err(NetsmbError::InvalidArgument {
                msg: "share belongs to another session".to_string(),
            });
        }
        if self.share.is_some() {
            return Err(NetsmbError::AlreadyConnected);
        }
        self.share = Some(share);
        Ok(())
    }

    pub fn take_share(&mut self) -> Option<ShareRef> {
        self.share.take()
    }

    /// Releases the share, then the session.
    pub fn release(&mut self) {
        drop(self.share.take());
        drop(self.session.take());
    }
}

impl Drop for HandleState {
    fn drop(&mut self) {
        self.release();
    }
}

/// One open instance of the device.
pub struct DeviceHandle {
    id: u32,
    flags: Arc<AtomicU32>,
    pub(crate) state: OrderedRwLock<HandleState>,
}

impl DeviceHandle {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            flags: Arc::new(AtomicU32::new(0)),
            state: OrderedRwLock::new(LockLevel::Handle, HandleState::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn flags(&self) -> HandleFlags {
        HandleFlags(self.flags.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.flags().contains(HandleFlags::OPEN)
    }

    /// Sets Open; false if it was already set.
    pub fn mark_open(&self) -> bool {
        let prev = self.flags.fetch_or(HandleFlags::OPEN.0, Ordering::AcqRel);
        prev & HandleFlags::OPEN.0 == 0
    }

    pub fn mark_closed(&self) {
        self.flags.store(0, Ordering::Release);
    }

    /// Lock-free; observed by blocking calls through their [`CallContext`].
    pub fn request_cancel(&self) {
        self.flags
            .fetch_or(HandleFlags::CANCEL_REQUESTED.0, Ordering::AcqRel);
        debug!("handle {}: cancel requested", self.id);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.flags().contains(HandleFlags::CANCEL_REQUESTED)
    }

    pub fn call_context(&self) -> CallContext {
        CallContext::new(self.id, Arc::clone(&self.flags))
    }

    pub fn bound_session(&self) -> Option<Arc<Session>> {
        self.state.read().session().map(|s| Arc::clone(s.session()))
    }

    pub fn bound_share(&self) -> Option<Arc<Share>> {
        self.state.read().share().map(|s| Arc::clone(s.share()))
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id)
            .field("flags", &self.flags())
            .finish()
    }
}
