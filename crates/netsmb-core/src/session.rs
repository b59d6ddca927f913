//! Sessions, shares and the session manager.
//!
//! A [`Session`] is shared by every handle that negotiated compatible
//! parameters. Handles own it through a [`SessionRef`]; the reference count
//! lives in the manager's session list and is only touched under the
//! session-list lock, so find-or-create and the final release cannot race.
//! Shares are counted the same way under their session's lock.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{Channel, ChannelProperties, MAX_CHANNEL_SLOTS};
use crate::config::MultichannelConfig;
use crate::error::{NetsmbError, Result};
use crate::interface::{InterfaceTable, NicEntry, NicInfo, NicSelector};
use crate::lock_order::{LockLevel, OrderedMutex, OrderedRwLock};
use crate::transport::{CallContext, NegotiateArgs, SetupArgs, SmbTransport};

/// Server capability: DFS.
pub const SMB2_GLOBAL_CAP_DFS: u32 = 0x0000_0001;
/// Server capability: leasing.
pub const SMB2_GLOBAL_CAP_LEASING: u32 = 0x0000_0002;
/// Server capability: large MTU.
pub const SMB2_GLOBAL_CAP_LARGE_MTU: u32 = 0x0000_0004;
/// Server capability: multichannel.
pub const SMB2_GLOBAL_CAP_MULTI_CHANNEL: u32 = 0x0000_0008;
/// Server capability: encryption.
pub const SMB2_GLOBAL_CAP_ENCRYPTION: u32 = 0x0000_0040;

/// Session flag word.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFlags(pub u32);

impl SessionFlags {
    /// Authenticated as guest.
    pub const GUEST: SessionFlags = SessionFlags(0x01);
    /// Anonymous (null) session.
    pub const ANONYMOUS: SessionFlags = SessionFlags(0x02);
    /// Signing negotiated.
    pub const SIGNING: SessionFlags = SessionFlags(0x04);
    /// Alternate channels may be established.
    pub const MULTICHANNEL: SessionFlags = SessionFlags(0x08);
    /// Never shared with another handle.
    pub const PRIVATE: SessionFlags = SessionFlags(0x10);
    /// Encryption negotiated.
    pub const ENCRYPTED: SessionFlags = SessionFlags(0x20);

    pub fn contains(&self, other: SessionFlags) -> bool {
        (self.0 & other.0) != 0
    }
}

impl std::ops::BitOr for SessionFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        SessionFlags(self.0 | rhs.0)
    }
}

/// Parameters a handle negotiates with; also the sharing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    pub server_name: String,
    /// Resolved server address.
    pub server_addr: SocketAddr,
    pub user: String,
    pub domain: String,
    pub dialects: u32,
    pub signing_required: bool,
    pub private: bool,
    /// Client interfaces known at negotiate time.
    pub client_nics: Vec<NicEntry>,
}

impl SessionParams {
    pub fn new(server_name: &str, server_addr: SocketAddr) -> Self {
        Self {
            server_name: server_name.to_string(),
            server_addr,
            user: String::new(),
            domain: String::new(),
            dialects: 0,
            signing_required: false,
            private: false,
            client_nics: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: &str, domain: &str) -> Self {
        self.user = user.to_string();
        self.domain = domain.to_string();
        self
    }

    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    pub fn with_client_nic(mut self, nic: NicEntry) -> Self {
        self.client_nics.push(nic);
        self
    }

    /// How an existing session with `self` parameters can serve `wanted`.
    pub fn match_kind(&self, wanted: &SessionParams) -> Option<MatchKind> {
        if self.private || wanted.private {
            return None;
        }
        if self.server_addr.port() != wanted.server_addr.port()
            || !self.user.eq_ignore_ascii_case(&wanted.user)
            || !self.domain.eq_ignore_ascii_case(&wanted.domain)
            || self.dialects != wanted.dialects
            || self.signing_required != wanted.signing_required
        {
            return None;
        }
        if self.server_name.eq_ignore_ascii_case(&wanted.server_name) {
            Some(MatchKind::ByName)
        } else if self.server_addr.ip() == wanted.server_addr.ip() {
            Some(MatchKind::ByAddress)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    ByName,
    ByAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentity {
    pub uid: u32,
    pub account: String,
    pub domain: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthPrincipals {
    pub client_principal: String,
    pub server_principal: String,
}

/// Outcome of a negotiate, fresh or shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateResult {
    pub session_id: u64,
    pub capabilities: u32,
    pub session_flags: u32,
    pub dialect: u16,
    pub continuation_token: Vec<u8>,
    pub shared: bool,
    /// Server address of the existing session, echoed when it was found by
    /// address rather than by name.
    pub original_server_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupResult {
    pub guest: bool,
    pub continuation_token: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProperties {
    pub session_id: u64,
    pub server_name: String,
    pub server_addr: SocketAddr,
    pub capabilities: u32,
    pub flags: u32,
    pub dialect: u16,
    pub native_os: String,
    pub native_lanman: String,
    pub model_info: Option<String>,
    pub reconnect_count: u32,
    pub usable_channels: u32,
    /// Bytes on channels still attached.
    pub active_rx_bytes: u64,
    pub active_tx_bytes: u64,
    /// Running totals of channels already removed.
    pub gone_rx_bytes: u64,
    pub gone_tx_bytes: u64,
    pub has_network_identity: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareProperties {
    pub name: String,
    pub tree_id: u32,
    pub share_type: u8,
    pub share_flags: u32,
    pub maximal_access: u32,
    pub ref_count: u32,
}

/// Slots of a channel property query; see [`Session::query_channel_properties`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPropertiesReply {
    pub count: u32,
    pub slots: Vec<ChannelProperties>,
}

/// A bound share (tree connect).
#[derive(Debug)]
pub struct Share {
    name: String,
    tree_id: u32,
    share_type: u8,
    share_flags: u32,
    maximal_access: u32,
    refs: AtomicUsize,
}

impl Share {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tree_id(&self) -> u32 {
        self.tree_id
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn properties(&self) -> ShareProperties {
        ShareProperties {
            name: self.name.clone(),
            tree_id: self.tree_id,
            share_type: self.share_type,
            share_flags: self.share_flags,
            maximal_access: self.maximal_access,
            ref_count: self.ref_count() as u32,
        }
    }
}

/// Mutable session state guarded by the session lock.
#[derive(Debug, Default)]
pub(crate) struct SessionInner {
    pub(crate) channels: Vec<Arc<Channel>>,
    pub(crate) shares: Vec<Arc<Share>>,
    pub(crate) network_identity: Option<NetworkIdentity>,
    pub(crate) principals: Option<AuthPrincipals>,
    /// Alternate channel echoed by the previous interface notification.
    pub(crate) last_echoed: Option<u32>,
}

pub struct Session {
    id: u64,
    params: SessionParams,
    capabilities: u32,
    dialect: u16,
    flags: AtomicU32,
    pub(crate) inner: OrderedRwLock<SessionInner>,
    pub(crate) interfaces: OrderedMutex<InterfaceTable>,
    native_os: OrderedMutex<String>,
    native_lanman: OrderedMutex<String>,
    model_info: OrderedMutex<Option<String>>,
    gone_rx: AtomicU64,
    gone_tx: AtomicU64,
    reconnects: AtomicU32,
    next_channel_id: AtomicU32,
    /// Handle references; changed only under the session-list lock.
    refs: AtomicUsize,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn dialect(&self) -> u16 {
        self.dialect
    }

    pub fn flags(&self) -> SessionFlags {
        SessionFlags(self.flags.load(Ordering::SeqCst))
    }

    fn set_flag(&self, flag: SessionFlags) {
        self.flags.fetch_or(flag.0, Ordering::SeqCst);
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn is_multichannel(&self) -> bool {
        self.flags().contains(SessionFlags::MULTICHANNEL)
    }

    pub fn native_os(&self) -> String {
        self.native_os.lock().clone()
    }

    pub fn model_info(&self) -> Option<String> {
        self.model_info.lock().clone()
    }

    pub(crate) fn next_channel_id(&self) -> u32 {
        self.next_channel_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn channel_count(&self) -> usize {
        self.inner.read().channels.len()
    }

    pub fn usable_channel_count(&self) -> usize {
        self.inner
            .read()
            .channels
            .iter()
            .filter(|c| c.is_usable())
            .count()
    }

    pub fn channel(&self, id: u32) -> Option<Arc<Channel>> {
        self.inner.read().channels.iter().find(|c| c.id() == id).cloned()
    }

    pub fn main_channel(&self) -> Option<Arc<Channel>> {
        self.inner.read().channels.iter().find(|c| c.is_main()).cloned()
    }

    pub fn gone_bytes(&self) -> (u64, u64) {
        (
            self.gone_rx.load(Ordering::SeqCst),
            self.gone_tx.load(Ordering::SeqCst),
        )
    }

    /// Shuts down an alternate channel and folds its counters into the
    /// gone-channel totals. The main channel is only removed at teardown.
    pub(crate) fn retire_channel(
        &self,
        inner: &mut SessionInner,
        channel_id: u32,
        transport: &dyn SmbTransport,
    ) -> Result<()> {
        let pos = inner
            .channels
            .iter()
            .position(|c| c.id() == channel_id)
            .ok_or_else(|| NetsmbError::InvalidArgument {
                msg: format!("session {}: no channel {}", self.id, channel_id),
            })?;
        if inner.channels[pos].is_main() {
            return Err(NetsmbError::InvalidArgument {
                msg: format!("session {}: main channel cannot be retired", self.id),
            });
        }
        let channel = inner.channels.remove(pos);
        self.fold_and_shutdown(&channel, transport);
        Ok(())
    }

    fn fold_and_shutdown(&self, channel: &Channel, transport: &dyn SmbTransport) {
        if let Err(e) = channel.begin_shutdown() {
            warn!("session {}: {}", self.id, e);
        }
        transport.shutdown_channel(self.id, channel.id());
        self.gone_rx.fetch_add(channel.rx_bytes(), Ordering::SeqCst);
        self.gone_tx.fetch_add(channel.tx_bytes(), Ordering::SeqCst);
        if let Err(e) = channel.mark_gone() {
            warn!("session {}: {}", self.id, e);
        }
        debug!("session {}: channel {} gone", self.id, channel.id());
    }

    /// Final teardown once the last reference is gone.
    fn teardown(&self, transport: &dyn SmbTransport) {
        let channels = std::mem::take(&mut self.inner.write().channels);
        for channel in &channels {
            self.fold_and_shutdown(channel, transport);
        }
        transport.close_session(self.id);
        info!("session {} destroyed ({} channels)", self.id, channels.len());
    }

    pub fn begin_channel_reconnect(&self, channel_id: u32) -> Result<()> {
        let channel = self.channel(channel_id).ok_or(NetsmbError::NotConnected)?;
        channel.begin_reconnect()?;
        warn!("session {}: channel {} reconnecting", self.id, channel_id);
        Ok(())
    }

    pub fn finish_channel_reconnect(&self, channel_id: u32) -> Result<()> {
        let channel = self.channel(channel_id).ok_or(NetsmbError::NotConnected)?;
        channel.finish_reconnect()?;
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        info!("session {}: channel {} reconnected", self.id, channel_id);
        Ok(())
    }

    /// Walks up to [`MAX_CHANNEL_SLOTS`] channels. Usable channels fill their
    /// slot; others stay zeroed. `count` is the number of slots visited.
    pub fn query_channel_properties(&self) -> ChannelPropertiesReply {
        let inner = self.inner.read();
        let mut slots = vec![ChannelProperties::default(); MAX_CHANNEL_SLOTS];
        let visited = inner.channels.len().min(MAX_CHANNEL_SLOTS);
        for (slot, channel) in slots.iter_mut().zip(inner.channels.iter()) {
            if channel.is_usable() {
                *slot = channel.properties();
            }
        }
        ChannelPropertiesReply {
            count: visited as u32,
            slots,
        }
    }

    /// Merges a client interface snapshot; takes only the table lock.
    pub fn update_client_interfaces(&self, snapshot: Vec<NicEntry>) -> Result<()> {
        self.interfaces.lock().merge_client(snapshot).map(|_| ())
    }

    pub fn query_nic_info(&self, selector: NicSelector) -> Vec<NicInfo> {
        self.interfaces.lock().query_nic_info(selector)
    }

    pub fn set_network_identity(&self, identity: NetworkIdentity) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.network_identity.is_some() {
            return Err(NetsmbError::IdentityAlreadySet);
        }
        debug!("session {}: network identity uid {}", self.id, identity.uid);
        inner.network_identity = Some(identity);
        Ok(())
    }

    pub fn principals(&self) -> Option<AuthPrincipals> {
        self.inner.read().principals.clone()
    }

    pub fn properties(&self) -> SessionProperties {
        let (usable, rx, tx, has_identity) = {
            let inner = self.inner.read();
            let usable = inner.channels.iter().filter(|c| c.is_usable()).count();
            let rx = inner.channels.iter().map(|c| c.rx_bytes()).sum();
            let tx = inner.channels.iter().map(|c| c.tx_bytes()).sum();
            (usable, rx, tx, inner.network_identity.is_some())
        };
        let (gone_rx, gone_tx) = self.gone_bytes();
        let native_os = self.native_os.lock().clone();
        let native_lanman = self.native_lanman.lock().clone();
        let model_info = self.model_info.lock().clone();
        SessionProperties {
            session_id: self.id,
            server_name: self.params.server_name.clone(),
            server_addr: self.params.server_addr,
            capabilities: self.capabilities,
            flags: self.flags().0,
            dialect: self.dialect,
            native_os,
            native_lanman,
            model_info,
            reconnect_count: self.reconnect_count(),
            usable_channels: usable as u32,
            active_rx_bytes: rx,
            active_tx_bytes: tx,
            gone_rx_bytes: gone_rx,
            gone_tx_bytes: gone_tx,
            has_network_identity: has_identity,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("server", &self.params.server_name)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// One handle's reference to a session. Dropping it releases the reference.
pub struct SessionRef {
    session: Arc<Session>,
    manager: Arc<SessionManager>,
}

impl SessionRef {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl std::ops::Deref for SessionRef {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionRef {
    fn drop(&mut self) {
        self.manager.release(&self.session);
    }
}

impl std::fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionRef").field(&self.session.id).finish()
    }
}

/// One handle's reference to a share. Dropping it releases the reference and
/// disconnects the tree when it was the last one.
pub struct ShareRef {
    share: Arc<Share>,
    session: Arc<Session>,
    transport: Arc<dyn SmbTransport>,
}

impl ShareRef {
    pub fn share(&self) -> &Arc<Share> {
        &self.share
    }

    pub fn session_id(&self) -> u64 {
        self.session.id
    }
}

impl std::ops::Deref for ShareRef {
    type Target = Share;

    fn deref(&self) -> &Share {
        &self.share
    }
}

impl Drop for ShareRef {
    fn drop(&mut self) {
        let last = {
            let mut inner = self.session.inner.write();
            let prev = self.share.refs.load(Ordering::SeqCst);
            if prev == 0 {
                warn!("share {} released with zero references", self.share.name);
                return;
            }
            self.share.refs.store(prev - 1, Ordering::SeqCst);
            if prev == 1 {
                inner.shares.retain(|s| !Arc::ptr_eq(s, &self.share));
            }
            prev == 1
        };
        if last {
            if let Err(e) = self
                .transport
                .tree_disconnect(self.session.id, self.share.tree_id)
            {
                warn!(
                    "session {}: tree disconnect of {} failed: {}",
                    self.session.id, self.share.name, e.reason
                );
            }
            info!("session {}: share {} released", self.session.id, self.share.name);
        }
    }
}

impl std::fmt::Debug for ShareRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ShareRef").field(&self.share.name).finish()
    }
}

/// Finds, creates and destroys sessions; owns the process-wide session list.
pub struct SessionManager {
    pub(crate) sessions: OrderedRwLock<Vec<Arc<Session>>>,
    next_session_id: AtomicU64,
    client_guid: Uuid,
    pub(crate) transport: Arc<dyn SmbTransport>,
    pub(crate) config: MultichannelConfig,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn SmbTransport>, config: MultichannelConfig) -> Self {
        let client_guid = Uuid::new_v4();
        info!("session manager created, client guid {}", client_guid);
        Self {
            sessions: OrderedRwLock::new(LockLevel::SessionList, Vec::new()),
            next_session_id: AtomicU64::new(1),
            client_guid,
            transport,
            config,
        }
    }

    pub fn client_guid(&self) -> Uuid {
        self.client_guid
    }

    pub fn transport(&self) -> &Arc<dyn SmbTransport> {
        &self.transport
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().clone()
    }

    /// Binds a compatible live session or negotiates a new one.
    pub fn negotiate(
        self: &Arc<Self>,
        ctx: &CallContext,
        params: SessionParams,
    ) -> Result<(SessionRef, NegotiateResult)> {
        ctx.check_cancelled()?;

        if let Some(found) = self.find_compatible(&params) {
            return Ok(found);
        }

        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let args = NegotiateArgs {
            server_name: params.server_name.clone(),
            server_addr: params.server_addr,
            client_guid: self.client_guid,
            dialects: params.dialects,
            signing_required: params.signing_required,
        };
        let outcome = self.transport.negotiate(ctx, id, &args)?;

        let mut flags = SessionFlags(outcome.session_flags);
        if params.private {
            flags = flags | SessionFlags::PRIVATE;
        }
        if self.config.enabled && outcome.capabilities & SMB2_GLOBAL_CAP_MULTI_CHANNEL != 0 {
            flags = flags | SessionFlags::MULTICHANNEL;
        }

        let mut table = InterfaceTable::new();
        table.replace(params.client_nics.clone(), outcome.server_nics.clone())?;

        let main = Arc::new(Channel::new_main(
            0,
            outcome.main_peer.unwrap_or(params.server_addr),
        ));
        main.mark_connected()?;

        let session = Arc::new(Session {
            id,
            params,
            capabilities: outcome.capabilities,
            dialect: outcome.dialect,
            flags: AtomicU32::new(flags.0),
            inner: OrderedRwLock::new(
                LockLevel::Session,
                SessionInner {
                    channels: vec![main],
                    ..Default::default()
                },
            ),
            interfaces: OrderedMutex::new(LockLevel::InterfaceTable, table),
            native_os: OrderedMutex::new(LockLevel::SessionStrings, outcome.native_os),
            native_lanman: OrderedMutex::new(LockLevel::SessionStrings, outcome.native_lanman),
            model_info: OrderedMutex::new(LockLevel::SessionStrings, outcome.model_info),
            gone_rx: AtomicU64::new(0),
            gone_tx: AtomicU64::new(0),
            reconnects: AtomicU32::new(0),
            next_channel_id: AtomicU32::new(1),
            refs: AtomicUsize::new(1),
        });

        self.sessions.write().push(Arc::clone(&session));
        info!(
            "session {} negotiated with {} ({}), dialect {:#06x}, flags {:#x}",
            id, session.params.server_name, session.params.server_addr, session.dialect, flags.0
        );

        let result = NegotiateResult {
            session_id: id,
            capabilities: session.capabilities,
            session_flags: flags.0,
            dialect: session.dialect,
            continuation_token: outcome.continuation_token,
            shared: false,
            original_server_addr: None,
        };
        Ok((
            SessionRef {
                session,
                manager: Arc::clone(self),
            },
            result,
        ))
    }

    fn find_compatible(
        self: &Arc<Self>,
        params: &SessionParams,
    ) -> Option<(SessionRef, NegotiateResult)> {
        let sessions = self.sessions.write();
        for session in sessions.iter() {
            if self.transport.is_fatal(session.id) {
                continue;
            }
            let Some(kind) = session.params.match_kind(params) else {
                continue;
            };
            session.refs.fetch_add(1, Ordering::SeqCst);
            debug!(
                "session {} shared ({:?}), refs {}",
                session.id,
                kind,
                session.ref_count()
            );
            let result = NegotiateResult {
                session_id: session.id,
                capabilities: session.capabilities,
                session_flags: session.flags().0,
                dialect: session.dialect,
                continuation_token: Vec::new(),
                shared: true,
                original_server_addr: (kind == MatchKind::ByAddress)
                    .then_some(session.params.server_addr),
            };
            return Some((
                SessionRef {
                    session: Arc::clone(session),
                    manager: Arc::clone(self),
                },
                result,
            ));
        }
        None
    }

    fn release(&self, session: &Arc<Session>) {
        let destroy = {
            let mut sessions = self.sessions.write();
            let prev = session.refs.load(Ordering::SeqCst);
            if prev == 0 {
                warn!("session {} released with zero references", session.id);
                return;
            }
            session.refs.store(prev - 1, Ordering::SeqCst);
            if prev == 1 {
                sessions.retain(|s| !Arc::ptr_eq(s, session));
            }
            prev == 1
        };
        if destroy {
            session.teardown(self.transport.as_ref());
        } else {
            debug!("session {} released, refs {}", session.id, session.ref_count());
        }
    }

    /// Credential exchange on a bound session.
    pub fn session_setup(
        &self,
        ctx: &CallContext,
        session: &SessionRef,
        args: &SetupArgs,
    ) -> Result<SetupResult> {
        ctx.check_cancelled()?;
        let outcome = self.transport.session_setup(ctx, session.id, args)?;
        {
            let mut inner = session.inner.write();
            inner.principals = Some(AuthPrincipals {
                client_principal: outcome.client_principal,
                server_principal: outcome.server_principal,
            });
        }
        if outcome.guest {
            session.set_flag(SessionFlags::GUEST);
        }
        info!(
            "session {}: setup complete for {}{}",
            session.id,
            args.user,
            if outcome.guest { " (guest)" } else { "" }
        );
        Ok(SetupResult {
            guest: outcome.guest,
            continuation_token: outcome.continuation_token,
        })
    }

    /// Binds a share, reusing one already connected on the session.
    pub fn tree_connect(
        &self,
        ctx: &CallContext,
        session: &SessionRef,
        share_name: &str,
    ) -> Result<ShareRef> {
        ctx.check_cancelled()?;
        if share_name.is_empty() {
            return Err(NetsmbError::InvalidArgument {
                msg: "empty share name".to_string(),
            });
        }
        if let Some(share) = Self::acquire_existing_share(session, share_name) {
            return Ok(self.share_ref(session, share));
        }

        let outcome = self.transport.tree_connect(ctx, session.id, share_name)?;
        let share = {
            let mut inner = session.inner.write();
            let raced = inner
                .shares
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(share_name))
                .cloned();
            if let Some(existing) = raced {
                existing.refs.fetch_add(1, Ordering::SeqCst);
                drop(inner);
                if let Err(e) = self.transport.tree_disconnect(session.id, outcome.tree_id) {
                    warn!("session {}: duplicate tree disconnect failed: {}", session.id, e.reason);
                }
                existing
            } else {
                let share = Arc::new(Share {
                    name: share_name.to_string(),
                    tree_id: outcome.tree_id,
                    share_type: outcome.share_type,
                    share_flags: outcome.share_flags,
                    maximal_access: outcome.maximal_access,
                    refs: AtomicUsize::new(1),
                });
                inner.shares.push(Arc::clone(&share));
                info!(
                    "session {}: tree connected {} (tid {})",
                    session.id, share_name, outcome.tree_id
                );
                share
            }
        };
        Ok(self.share_ref(session, share))
    }

    fn acquire_existing_share(session: &Session, share_name: &str) -> Option<Arc<Share>> {
        let inner = session.inner.write();
        let share = inner
            .shares
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(share_name))
            .cloned()?;
        share.refs.fetch_add(1, Ordering::SeqCst);
        debug!(
            "session {}: share {} reused, refs {}",
            session.id,
            share_name,
            share.ref_count()
        );
        Some(share)
    }

    fn share_ref(&self, session: &SessionRef, share: Arc<Share>) -> ShareRef {
        ShareRef {
            share,
            session: Arc::clone(session.session()),
            transport: Arc::clone(&self.transport),
        }
    }
}
