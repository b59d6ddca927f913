//! Registration of the single interface-change notifier process.

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{NetsmbError, Result};
use crate::lock_order::{LockLevel, OrderedMutex};
use crate::transport::ProcessTable;

/// The registered notifier pid, if any.
///
/// A holder whose process no longer carries the expected name is stale: a
/// new registration replaces it and a query clears it.
pub struct NotifierRegistration {
    holder: OrderedMutex<Option<u32>>,
    expected_name: String,
    processes: Arc<dyn ProcessTable>,
}

impl NotifierRegistration {
    pub fn new(expected_name: &str, processes: Arc<dyn ProcessTable>) -> Self {
        Self {
            holder: OrderedMutex::new(LockLevel::Notifier, None),
            expected_name: expected_name.to_string(),
            processes,
        }
    }

    pub fn expected_name(&self) -> &str {
        &self.expected_name
    }

    fn is_live(&self, pid: u32) -> bool {
        self.processes
            .process_name(pid)
            .map(|name| name == self.expected_name)
            .unwrap_or(false)
    }

    pub fn register(&self, pid: u32) -> Result<()> {
        let mut holder = self.holder.lock();
        if let Some(current) = *holder {
            if self.is_live(current) {
                return Err(NetsmbError::NotifierAlreadyRegistered { pid: current });
            }
            warn!("notifier pid {} is stale, replaced by {}", current, pid);
        }
        *holder = Some(pid);
        info!("notifier registered: pid {}", pid);
        Ok(())
    }

    /// Current live holder; a stale registration is cleared here.
    pub fn query(&self) -> Option<u32> {
        let mut holder = self.holder.lock();
        let current = (*holder)?;
        if self.is_live(current) {
            return Some(current);
        }
        warn!("notifier pid {} no longer running as {}", current, self.expected_name);
        *holder = None;
        None
    }

    pub fn clear(&self) {
        if let Some(pid) = self.holder.lock().take() {
            info!("notifier pid {} unregistered", pid);
        }
    }
}

impl std::fmt::Debug for NotifierRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierRegistration")
            .field("expected_name", &self.expected_name)
            .finish_non_exhaustive()
    }
}
