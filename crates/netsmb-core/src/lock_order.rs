//! Global lock order for the control plane.
//!
//! Every lock in the crate is an [`OrderedRwLock`] or [`OrderedMutex`] tagged
//! with a [`LockLevel`]. A thread may only acquire a lock whose level is
//! strictly greater than every level it already holds. Debug builds track the
//! levels held by each thread and panic on the first inversion; release builds
//! compile the tracking away.
//!
//! The outer-to-inner hand-off (take outer, take inner, drop outer) is allowed:
//! guards can be released in any order, only acquisition is checked.

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, MutexGuard, RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Lock levels, lowest first. Never acquire a level at or below one already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    /// Device registry slot table.
    Registry,
    /// Per-handle state (bound Session/Share).
    Handle,
    /// Process-wide list of live sessions.
    SessionList,
    /// Per-session channels, shares and auth state.
    Session,
    /// Per-channel flag word.
    ChannelFlags,
    /// Per-session interface table.
    InterfaceTable,
    /// Per-session identity strings.
    SessionStrings,
    /// Notifier singleton registration.
    Notifier,
}

#[cfg(debug_assertions)]
mod tracking {
    use super::LockLevel;
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<LockLevel>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn acquire(level: LockLevel) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(highest) = held.iter().max() {
                assert!(
                    *highest < level,
                    "lock order violation: acquiring {:?} while holding {:?}",
                    level,
                    highest
                );
            }
            held.push(level);
        });
    }

    pub(super) fn release(level: LockLevel) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|l| *l == level) {
                held.remove(pos);
            }
        });
    }

    pub(super) fn held() -> Vec<LockLevel> {
        HELD.with(|held| held.borrow().clone())
    }
}

#[cfg(not(debug_assertions))]
mod tracking {
    use super::LockLevel;

    #[inline(always)]
    pub(super) fn acquire(_level: LockLevel) {}

    #[inline(always)]
    pub(super) fn release(_level: LockLevel) {}

    pub(super) fn held() -> Vec<LockLevel> {
        Vec::new()
    }
}

/// Levels currently held by the calling thread (always empty in release builds).
pub fn held_levels() -> Vec<LockLevel> {
    tracking::held()
}

/// Guard wrapper that records the release of its level on drop.
pub struct OrderedGuard<G> {
    guard: G,
    level: LockLevel,
}

impl<G> OrderedGuard<G> {
    pub fn level(&self) -> LockLevel {
        self.level
    }
}

impl<G: Deref> Deref for OrderedGuard<G> {
    type Target = G::Target;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<G: DerefMut> DerefMut for OrderedGuard<G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<G> Drop for OrderedGuard<G> {
    fn drop(&mut self) {
        tracking::release(self.level);
    }
}

/// Owned shared guard usable across a hand-off.
pub type ArcReadGuard<T> = OrderedGuard<ArcRwLockReadGuard<RawRwLock, T>>;
/// Owned exclusive guard usable across a hand-off.
pub type ArcWriteGuard<T> = OrderedGuard<ArcRwLockWriteGuard<RawRwLock, T>>;

/// Reader/writer lock tagged with a [`LockLevel`].
pub struct OrderedRwLock<T> {
    level: LockLevel,
    inner: Arc<RwLock<T>>,
}

impl<T> OrderedRwLock<T> {
    pub fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Arc::new(RwLock::new(value)),
        }
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    pub fn read(&self) -> OrderedGuard<RwLockReadGuard<'_, T>> {
        tracking::acquire(self.level);
        OrderedGuard {
            guard: self.inner.read(),
            level: self.level,
        }
    }

    pub fn write(&self) -> OrderedGuard<RwLockWriteGuard<'_, T>> {
        tracking::acquire(self.level);
        OrderedGuard {
            guard: self.inner.write(),
            level: self.level,
        }
    }

    /// Shared guard that does not borrow `self`; it keeps the lock alive on its own.
    pub fn read_arc(&self) -> ArcReadGuard<T> {
        tracking::acquire(self.level);
        OrderedGuard {
            guard: self.inner.read_arc(),
            level: self.level,
        }
    }

    /// Exclusive guard that does not borrow `self`.
    pub fn write_arc(&self) -> ArcWriteGuard<T> {
        tracking::acquire(self.level);
        OrderedGuard {
            guard: self.inner.write_arc(),
            level: self.level,
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for OrderedRwLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedRwLock")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

/// Mutex tagged with a [`LockLevel`].
pub struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> OrderedGuard<MutexGuard<'_, T>> {
        tracking::acquire(self.level);
        OrderedGuard {
            guard: self.inner.lock(),
            level: self.level,
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}
