//! Channels: the network connections that carry a session.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::error::{NetsmbError, Result};
use crate::interface::{AddressFamily, NicAddress};
use crate::lock_order::{LockLevel, OrderedMutex};

/// Fixed slot count of a channel property reply.
pub const MAX_CHANNEL_SLOTS: usize = 32;

const STATE_CREATED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_RECONNECTING: u8 = 3;
const STATE_SHUTTING_DOWN: u8 = 4;
const STATE_GONE: u8 = 5;

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    #[default]
    Created,
    Connecting,
    Running,
    Reconnecting,
    ShuttingDown,
    Gone,
}

impl From<u8> for ChannelState {
    fn from(raw: u8) -> Self {
        match raw {
            STATE_CREATED => ChannelState::Created,
            STATE_CONNECTING => ChannelState::Connecting,
            STATE_RUNNING => ChannelState::Running,
            STATE_RECONNECTING => ChannelState::Reconnecting,
            STATE_SHUTTING_DOWN => ChannelState::ShuttingDown,
            _ => ChannelState::Gone,
        }
    }
}

impl From<ChannelState> for u8 {
    fn from(state: ChannelState) -> Self {
        match state {
            ChannelState::Created => STATE_CREATED,
            ChannelState::Connecting => STATE_CONNECTING,
            ChannelState::Running => STATE_RUNNING,
            ChannelState::Reconnecting => STATE_RECONNECTING,
            ChannelState::ShuttingDown => STATE_SHUTTING_DOWN,
            ChannelState::Gone => STATE_GONE,
        }
    }
}

impl ChannelState {
    /// Whether `self -> to` is an edge of the channel state machine.
    pub fn can_transition(self, to: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, to),
            (Created, Connecting)
                | (Created, ShuttingDown)
                | (Connecting, Running)
                | (Connecting, ShuttingDown)
                | (Running, Reconnecting)
                | (Running, ShuttingDown)
                | (Reconnecting, Running)
                | (Reconnecting, ShuttingDown)
                | (ShuttingDown, Gone)
        )
    }
}

/// Channel flag word.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFlags(pub u32);

impl ChannelFlags {
    /// Shutdown has begun; the channel must not carry new requests.
    pub const SHUTTING_DOWN: ChannelFlags = ChannelFlags(0x01);
    /// Alternate channel whose interface may have gone dark.
    pub const INACTIVE: ChannelFlags = ChannelFlags(0x02);
    /// Runs over RDMA.
    pub const RDMA: ChannelFlags = ChannelFlags(0x04);
    /// Bound to an RSS sub-channel of the server interface.
    pub const RSS: ChannelFlags = ChannelFlags(0x08);
    /// Alternate (non-main) channel.
    pub const ALTERNATE: ChannelFlags = ChannelFlags(0x10);

    pub fn contains(&self, other: ChannelFlags) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn insert(&mut self, other: ChannelFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ChannelFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for ChannelFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        ChannelFlags(self.0 | rhs.0)
    }
}

/// Zero-filled when a slot is not reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelProperties {
    pub id: u32,
    pub flags: u32,
    pub state: ChannelState,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Seconds since the epoch.
    pub setup_time: u64,
    pub local_nic_index: u64,
    pub remote_nic_index: u64,
    pub peer: Option<NicAddress>,
}

/// One network connection of a session.
pub struct Channel {
    id: u32,
    main: bool,
    state: AtomicU8,
    flags: OrderedMutex<ChannelFlags>,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    local_nic: Option<u64>,
    remote_nic: Option<u64>,
    peer: SocketAddr,
    setup_time: SystemTime,
}

impl Channel {
    pub fn new_main(id: u32, peer: SocketAddr) -> Self {
        Self::build(id, true, peer, None, None, ChannelFlags::default())
    }

    pub fn new_alternate(
        id: u32,
        peer: SocketAddr,
        local_nic: u64,
        remote_nic: u64,
        flags: ChannelFlags,
    ) -> Self {
        Self::build(
            id,
            false,
            peer,
            Some(local_nic),
            Some(remote_nic),
            flags | ChannelFlags::ALTERNATE,
        )
    }

    fn build(
        id: u32,
        main: bool,
        peer: SocketAddr,
        local_nic: Option<u64>,
        remote_nic: Option<u64>,
        flags: ChannelFlags,
    ) -> Self {
        Self {
            id,
            main,
            state: AtomicU8::new(STATE_CREATED),
            flags: OrderedMutex::new(LockLevel::ChannelFlags, flags),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            local_nic,
            remote_nic,
            peer,
            setup_time: SystemTime::now(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_main(&self) -> bool {
        self.main
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_nic(&self) -> Option<u64> {
        self.local_nic
    }

    pub fn remote_nic(&self) -> Option<u64> {
        self.remote_nic
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn flags(&self) -> ChannelFlags {
        *self.flags.lock()
    }

    pub fn set_flag(&self, flag: ChannelFlags) {
        self.flags.lock().insert(flag);
    }

    pub fn clear_flag(&self, flag: ChannelFlags) {
        self.flags.lock().remove(flag);
    }

    /// Moves the state machine along one edge.
    pub fn transition(&self, to: ChannelState) -> Result<ChannelState> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let from = ChannelState::from(current);
            if !from.can_transition(to) {
                return Err(NetsmbError::InvalidArgument {
                    msg: format!("channel {}: illegal transition {:?} -> {:?}", self.id, from, to),
                });
            }
            match self.state.compare_exchange(
                current,
                u8::from(to),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    debug!("channel {}: {:?} -> {:?}", self.id, from, to);
                    return Ok(from);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Created -> Connecting -> Running.
    pub fn mark_connected(&self) -> Result<()> {
        self.transition(ChannelState::Connecting)?;
        self.transition(ChannelState::Running)?;
        info!(
            "channel {} running ({}) peer {}",
            self.id,
            if self.main { "main" } else { "alternate" },
            self.peer
        );
        Ok(())
    }

    pub fn begin_reconnect(&self) -> Result<()> {
        self.transition(ChannelState::Reconnecting).map(|_| ())
    }

    pub fn finish_reconnect(&self) -> Result<()> {
        self.transition(ChannelState::Running).map(|_| ())
    }

    /// Flags the channel and enters ShuttingDown. Idempotent once shutting down.
    pub fn begin_shutdown(&self) -> Result<()> {
        self.set_flag(ChannelFlags::SHUTTING_DOWN);
        match self.state() {
            ChannelState::ShuttingDown | ChannelState::Gone => Ok(()),
            _ => self.transition(ChannelState::ShuttingDown).map(|_| ()),
        }
    }

    pub fn mark_gone(&self) -> Result<()> {
        self.transition(ChannelState::Gone).map(|_| ())
    }

    /// Running and not flagged for shutdown.
    pub fn is_usable(&self) -> bool {
        self.state() == ChannelState::Running && !self.flags().contains(ChannelFlags::SHUTTING_DOWN)
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(self.state(), ChannelState::ShuttingDown | ChannelState::Gone)
            || self.flags().contains(ChannelFlags::SHUTTING_DOWN)
    }

    pub fn record_io(&self, rx: u64, tx: u64) {
        self.rx_bytes.fetch_add(rx, Ordering::Relaxed);
        self.tx_bytes.fetch_add(tx, Ordering::Relaxed);
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn properties(&self) -> ChannelProperties {
        let flags = self.flags();
        ChannelProperties {
            id: self.id,
            flags: flags.0,
            state: self.state(),
            rx_bytes: self.rx_bytes(),
            tx_bytes: self.tx_bytes(),
            setup_time: self
                .setup_time
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            local_nic_index: self.local_nic.unwrap_or(0),
            remote_nic_index: self.remote_nic.unwrap_or(0),
            peer: Some(NicAddress {
                family: AddressFamily::of(&self.peer.ip()),
                addr: self.peer.ip(),
                port: self.peer.port(),
            }),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("main", &self.main)
            .field("state", &self.state())
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.9:445".parse().unwrap()
    }

    #[test]
    fn test_state_u8_roundtrip() {
        for state in [
            ChannelState::Created,
            ChannelState::Connecting,
            ChannelState::Running,
            ChannelState::Reconnecting,
            ChannelState::ShuttingDown,
            ChannelState::Gone,
        ] {
            assert_eq!(ChannelState::from(u8::from(state)), state);
        }
    }

    #[test]
    fn test_main_channel_lifecycle() {
        let ch = Channel::new_main(0, peer());
        assert_eq!(ch.state(), ChannelState::Created);
        assert!(!ch.is_usable());

        ch.mark_connected().unwrap();
        assert!(ch.is_usable());
        assert!(ch.is_main());

        ch.begin_shutdown().unwrap();
        assert_eq!(ch.state(), ChannelState::ShuttingDown);
        assert!(!ch.is_usable());
        ch.mark_gone().unwrap();
        assert_eq!(ch.state(), ChannelState::Gone);
    }

    #[test]
    fn test_reconnect_path() {
        let ch = Channel::new_main(0, peer());
        ch.mark_connected().unwrap();
        ch.begin_reconnect().unwrap();
        assert_eq!(ch.state(), ChannelState::Reconnecting);
        assert!(!ch.is_usable());
        ch.finish_reconnect().unwrap();
        assert!(ch.is_usable());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let ch = Channel::new_main(0, peer());
        assert!(ch.transition(ChannelState::Running).is_err());
        assert!(ch.mark_gone().is_err());
        ch.mark_connected().unwrap();
        assert!(ch.transition(ChannelState::Connecting).is_err());
    }

    #[test]
    fn test_shutdown_flag_makes_unusable() {
        let ch = Channel::new_alternate(1, peer(), 2, 3, ChannelFlags::default());
        ch.mark_connected().unwrap();
        ch.set_flag(ChannelFlags::SHUTTING_DOWN);
        assert_eq!(ch.state(), ChannelState::Running);
        assert!(!ch.is_usable());
        assert!(ch.is_shutting_down());
    }

    #[test]
    fn test_begin_shutdown_idempotent() {
        let ch = Channel::new_main(0, peer());
        ch.mark_connected().unwrap();
        ch.begin_shutdown().unwrap();
        ch.begin_shutdown().unwrap();
        assert_eq!(ch.state(), ChannelState::ShuttingDown);
    }

    #[test]
    fn test_alternate_properties() {
        let ch = Channel::new_alternate(2, peer(), 4, 7, ChannelFlags::RSS);
        ch.mark_connected().unwrap();
        ch.record_io(100, 50);
        let props = ch.properties();
        assert_eq!(props.id, 2);
        assert_eq!(props.state, ChannelState::Running);
        assert_eq!(props.rx_bytes, 100);
        assert_eq!(props.tx_bytes, 50);
        assert_eq!(props.local_nic_index, 4);
        assert_eq!(props.remote_nic_index, 7);
        assert!(ChannelFlags(props.flags).contains(ChannelFlags::RSS));
        assert!(ChannelFlags(props.flags).contains(ChannelFlags::ALTERNATE));
        let peer = props.peer.unwrap();
        assert_eq!(peer.family, AddressFamily::Inet);
        assert_eq!(peer.port, 445);
    }

    #[test]
    fn test_default_properties_zero_filled() {
        let props = ChannelProperties::default();
        assert_eq!(props.id, 0);
        assert_eq!(props.rx_bytes, 0);
        assert!(props.peer.is_none());
    }
}
