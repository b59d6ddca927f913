//! Command surface: payload types, access classes and per-command execution.
//!
//! Every versioned payload carries a `version` tag that is checked before the
//! handle lock is taken, so a mismatch never touches handle, session or reply
//! state.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use crate::error::{NetsmbError, Result};
use crate::handle::HandleState;
use crate::interface::{NicEntry, NicInfo, NicSelector};
use crate::multichannel::InterfaceUpdate;
use crate::session::{
    ChannelPropertiesReply, NetworkIdentity, SessionManager, SessionParams, SessionProperties,
    ShareProperties, ShareRef,
};
use crate::transport::{
    CallContext, DirectoryState, OpenState, PathConverter, SetupArgs, WireError, WireReply,
    WireRequest,
};

/// Version of regular command payloads.
pub const NETSMB_IOC_VERSION: u32 = 1;
/// Version of the multichannel and NIC property queries.
pub const NETSMB_MC_QUERY_VERSION: u32 = 2;

/// Convert a local path to its network form.
pub const CONVERT_TO_NETWORK: u32 = 0x1;
/// Convert a network path to its local form.
pub const CONVERT_FROM_NETWORK: u32 = 0x2;

/// A payload with a version tag.
pub trait Versioned {
    const VERSION: u32;

    fn version(&self) -> u32;

    fn check_version(&self) -> Result<()> {
        if self.version() != Self::VERSION {
            return Err(NetsmbError::VersionMismatch {
                expected: Self::VERSION,
                found: self.version(),
            });
        }
        Ok(())
    }
}

macro_rules! versioned {
    ($($ty:ty => $version:expr),* $(,)?) => {
        $(
            impl Versioned for $ty {
                const VERSION: u32 = $version;

                fn version(&self) -> u32 {
                    self.version
                }
            }
        )*
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiateIoc {
    pub version: u32,
    pub server_name: String,
    pub server_addr: SocketAddr,
    pub user: String,
    pub domain: String,
    pub dialects: u32,
    pub signing_required: bool,
    pub private: bool,
    pub client_nics: Vec<NicEntry>,
}

impl NegotiateIoc {
    pub fn new(server_name: &str, server_addr: SocketAddr) -> Self {
        Self {
            version: NETSMB_IOC_VERSION,
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

    fn into_params(self) -> SessionParams {
        SessionParams {
            server_name: self.server_name,
            server_addr: self.server_addr,
            user: self.user,
            domain: self.domain,
            dialects: self.dialects,
            signing_required: self.signing_required,
            private: self.private,
            client_nics: self.client_nics,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiateReply {
    pub session_id: u64,
    pub capabilities: u32,
    pub session_flags: u32,
    pub dialect: u16,
    pub continuation_token: Vec<u8>,
    pub shared: bool,
    /// Set when the session was shared by address rather than by name.
    pub original_server_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfacesIoc {
    pub version: u32,
    pub client_nics: Vec<NicEntry>,
}

impl InterfacesIoc {
    pub fn new(client_nics: Vec<NicEntry>) -> Self {
        Self {
            version: NETSMB_IOC_VERSION,
            client_nics,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierPidIoc {
    pub version: u32,
    pub pid: u32,
}

impl NotifierPidIoc {
    pub fn new(pid: u32) -> Self {
        Self {
            version: NETSMB_IOC_VERSION,
            pid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierUpdateIoc {
    pub version: u32,
    pub update: InterfaceUpdate,
}

impl NotifierUpdateIoc {
    pub fn new(update: InterfaceUpdate) -> Self {
        Self {
            version: NETSMB_IOC_VERSION,
            update,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentityIoc {
    pub version: u32,
    pub identity: NetworkIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSetupIoc {
    pub version: u32,
    pub user: String,
    pub domain: String,
    pub token: Vec<u8>,
}

impl SessionSetupIoc {
    pub fn new(user: &str, domain: &str, token: Vec<u8>) -> Self {
        Self {
            version: NETSMB_IOC_VERSION,
            user: user.to_string(),
            domain: domain.to_string(),
            token,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSetupReply {
    pub guest: bool,
    pub continuation_token: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertPathIoc {
    pub version: u32,
    /// Exactly one of [`CONVERT_TO_NETWORK`] and [`CONVERT_FROM_NETWORK`].
    pub direction: u32,
    pub input: Vec<u8>,
    pub max_output: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConnectIoc {
    pub version: u32,
    pub share_name: String,
}

impl TreeConnectIoc {
    pub fn new(share_name: &str) -> Self {
        Self {
            version: NETSMB_IOC_VERSION,
            share_name: share_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfoIoc {
    pub version: u32,
    pub client_capacity: u32,
    pub server_capacity: u32,
}

/// Principal names. A `*_size` field always holds the required size; the
/// matching buffer stays empty when the caller's capacity is smaller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfoReply {
    pub client_principal: Vec<u8>,
    pub client_size: u32,
    pub server_principal: Vec<u8>,
    pub server_size: u32,
}

/// Version-only payload of the property queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryIoc {
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct McQueryIoc {
    pub version: u32,
}

impl McQueryIoc {
    pub fn new() -> Self {
        Self {
            version: NETSMB_MC_QUERY_VERSION,
        }
    }
}

impl Default for McQueryIoc {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicInfoIoc {
    pub version: u32,
    pub selector: NicSelector,
}

impl NicInfoIoc {
    pub fn new(selector: NicSelector) -> Self {
        Self {
            version: NETSMB_MC_QUERY_VERSION,
            selector,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicInfoReply {
    /// Entries actually emitted.
    pub count: u32,
    pub entries: Vec<NicInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleRequestIoc {
    pub version: u32,
    pub command: u8,
    pub params: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trans2Ioc {
    pub version: u32,
    pub setup: Vec<u16>,
    pub name: String,
    pub params: Vec<u8>,
    pub data: Vec<u8>,
    pub max_param_count: u32,
    pub max_data_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadIoc {
    pub version: u32,
    pub fid: u64,
    pub offset: u64,
    pub len: u32,
}

impl ReadIoc {
    pub fn new(fid: u64, offset: u64, len: u32) -> Self {
        Self {
            version: NETSMB_IOC_VERSION,
            fid,
            offset,
            len,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteIoc {
    pub version: u32,
    pub fid: u64,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl WriteIoc {
    pub fn new(fid: u64, offset: u64, data: Vec<u8>) -> Self {
        Self {
            version: NETSMB_IOC_VERSION,
            fid,
            offset,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsctlIoc {
    pub version: u32,
    pub fid: u64,
    pub ctl_code: u32,
    pub input: Vec<u8>,
    pub max_output: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateIoc {
    pub version: u32,
    pub path: String,
    pub desired_access: u32,
    pub disposition: u32,
    pub options: u32,
}

impl CreateIoc {
    pub fn new(path: &str, desired_access: u32, disposition: u32, options: u32) -> Self {
        Self {
            version: NETSMB_IOC_VERSION,
            path: path.to_string(),
            desired_access,
            disposition,
            options,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseIoc {
    pub version: u32,
    pub fid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDirIoc {
    pub version: u32,
    pub dir: DirectoryState,
    pub pattern: String,
    pub max_entries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDirIoc {
    pub version: u32,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DfsReferralIoc {
    pub version: u32,
    pub path: String,
    pub max_output: u32,
}

versioned! {
    NegotiateIoc => NETSMB_IOC_VERSION,
    InterfacesIoc => NETSMB_IOC_VERSION,
    NotifierPidIoc => NETSMB_IOC_VERSION,
    NotifierUpdateIoc => NETSMB_IOC_VERSION,
    NetworkIdentityIoc => NETSMB_IOC_VERSION,
    SessionSetupIoc => NETSMB_IOC_VERSION,
    ConvertPathIoc => NETSMB_IOC_VERSION,
    TreeConnectIoc => NETSMB_IOC_VERSION,
    AuthInfoIoc => NETSMB_IOC_VERSION,
    QueryIoc => NETSMB_IOC_VERSION,
    McQueryIoc => NETSMB_MC_QUERY_VERSION,
    NicInfoIoc => NETSMB_MC_QUERY_VERSION,
    SimpleRequestIoc => NETSMB_IOC_VERSION,
    Trans2Ioc => NETSMB_IOC_VERSION,
    ReadIoc => NETSMB_IOC_VERSION,
    WriteIoc => NETSMB_IOC_VERSION,
    FsctlIoc => NETSMB_IOC_VERSION,
    CreateIoc => NETSMB_IOC_VERSION,
    CloseIoc => NETSMB_IOC_VERSION,
    QueryDirIoc => NETSMB_IOC_VERSION,
    CheckDirIoc => NETSMB_IOC_VERSION,
    DfsReferralIoc => NETSMB_IOC_VERSION,
}

/// Reply of a request-shaped command. `status` is the wire-level outcome;
/// the call itself succeeded whenever one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataReply {
    pub status: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trans2Reply {
    pub status: u32,
    pub params: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReply {
    pub status: u32,
    pub written: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateReply {
    pub status: u32,
    pub open: Option<OpenState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDirReply {
    pub status: u32,
    pub entries: Vec<u8>,
    pub next: DirectoryState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: u32,
}

/// One command with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoctlRequest {
    Negotiate(NegotiateIoc),
    UpdateClientInterfaces(InterfacesIoc),
    UpdateNotifierPid(NotifierPidIoc),
    GetNotifierPid(QueryIoc),
    NotifierUpdateInterfaces(NotifierUpdateIoc),
    NetworkIdentity(NetworkIdentityIoc),
    SessionSetup(SessionSetupIoc),
    ConvertPath(ConvertPathIoc),
    TreeConnect(TreeConnectIoc),
    TreeDisconnect,
    AuthInfo(AuthInfoIoc),
    MultichannelProperties(McQueryIoc),
    NicInfo(NicInfoIoc),
    SessionProperties(QueryIoc),
    ShareProperties(QueryIoc),
    SessionState,
    CancelSession,
    Request(SimpleRequestIoc),
    T2Request(Trans2Ioc),
    Read(ReadIoc),
    Write(WriteIoc),
    Fsctl(FsctlIoc),
    Create(CreateIoc),
    Close(CloseIoc),
    QueryDir(QueryDirIoc),
    CheckDir(CheckDirIoc),
    GetDfsReferral(DfsReferralIoc),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoctlReply {
    Done,
    Negotiate(NegotiateReply),
    NotifierPid(Option<u32>),
    SessionSetup(SessionSetupReply),
    ConvertPath(Vec<u8>),
    TreeConnect(ShareProperties),
    AuthInfo(AuthInfoReply),
    MultichannelProperties(ChannelPropertiesReply),
    NicInfo(NicInfoReply),
    SessionProperties(SessionProperties),
    ShareProperties(ShareProperties),
    SessionState { connected: bool },
    Data(DataReply),
    Trans2(Trans2Reply),
    Write(WriteReply),
    Create(CreateReply),
    QueryDir(QueryDirReply),
    Status(StatusReply),
}

/// How a command locks its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessClass {
    /// Handle lock held exclusively for the whole call.
    Exclusive,
    /// Handle lock held shared; concurrent with other shared calls.
    Shared,
    /// Registry lookup only; never waits on the handle lock.
    Unlocked,
}

impl IoctlRequest {
    pub fn name(&self) -> &'static str {
        match self {
            IoctlRequest::Negotiate(_) => "negotiate",
            IoctlRequest::UpdateClientInterfaces(_) => "update_client_interfaces",
            IoctlRequest::UpdateNotifierPid(_) => "update_notifier_pid",
            IoctlRequest::GetNotifierPid(_) => "get_notifier_pid",
            IoctlRequest::NotifierUpdateInterfaces(_) => "notifier_update_interfaces",
            IoctlRequest::NetworkIdentity(_) => "network_identity",
            IoctlRequest::SessionSetup(_) => "session_setup",
            IoctlRequest::ConvertPath(_) => "convert_path",
            IoctlRequest::TreeConnect(_) => "tree_connect",
            IoctlRequest::TreeDisconnect => "tree_disconnect",
            IoctlRequest::AuthInfo(_) => "auth_info",
            IoctlRequest::MultichannelProperties(_) => "multichannel_properties",
            IoctlRequest::NicInfo(_) => "nic_info",
            IoctlRequest::SessionProperties(_) => "session_properties",
            IoctlRequest::ShareProperties(_) => "share_properties",
            IoctlRequest::SessionState => "session_state",
            IoctlRequest::CancelSession => "cancel_session",
            IoctlRequest::Request(_) => "request",
            IoctlRequest::T2Request(_) => "t2_request",
            IoctlRequest::Read(_) => "read",
            IoctlRequest::Write(_) => "write",
            IoctlRequest::Fsctl(_) => "fsctl",
            IoctlRequest::Create(_) => "create",
            IoctlRequest::Close(_) => "close",
            IoctlRequest::QueryDir(_) => "query_dir",
            IoctlRequest::CheckDir(_) => "check_dir",
            IoctlRequest::GetDfsReferral(_) => "get_dfs_referral",
        }
    }

    pub fn access_class(&self) -> AccessClass {
        match self {
            IoctlRequest::Negotiate(_)
            | IoctlRequest::TreeConnect(_)
            | IoctlRequest::TreeDisconnect => AccessClass::Exclusive,
            IoctlRequest::UpdateNotifierPid(_)
            | IoctlRequest::GetNotifierPid(_)
            | IoctlRequest::NotifierUpdateInterfaces(_)
            | IoctlRequest::CancelSession => AccessClass::Unlocked,
            _ => AccessClass::Shared,
        }
    }

    /// Checks the payload version tag, if the command has a payload.
    pub fn check_version(&self) -> Result<()> {
        match self {
            IoctlRequest::Negotiate(p) => p.check_version(),
            IoctlRequest::UpdateClientInterfaces(p) => p.check_version(),
            IoctlRequest::UpdateNotifierPid(p) => p.check_version(),
            IoctlRequest::GetNotifierPid(p) => p.check_version(),
            IoctlRequest::NotifierUpdateInterfaces(p) => p.check_version(),
            IoctlRequest::NetworkIdentity(p) => p.check_version(),
            IoctlRequest::SessionSetup(p) => p.check_version(),
            IoctlRequest::ConvertPath(p) => p.check_version(),
            IoctlRequest::TreeConnect(p) => p.check_version(),
            IoctlRequest::AuthInfo(p) => p.check_version(),
            IoctlRequest::MultichannelProperties(p) => p.check_version(),
            IoctlRequest::NicInfo(p) => p.check_version(),
            IoctlRequest::SessionProperties(p) | IoctlRequest::ShareProperties(p) => {
                p.check_version()
            }
            IoctlRequest::Request(p) => p.check_version(),
            IoctlRequest::T2Request(p) => p.check_version(),
            IoctlRequest::Read(p) => p.check_version(),
            IoctlRequest::Write(p) => p.check_version(),
            IoctlRequest::Fsctl(p) => p.check_version(),
            IoctlRequest::Create(p) => p.check_version(),
            IoctlRequest::Close(p) => p.check_version(),
            IoctlRequest::QueryDir(p) => p.check_version(),
            IoctlRequest::CheckDir(p) => p.check_version(),
            IoctlRequest::GetDfsReferral(p) => p.check_version(),
            IoctlRequest::TreeDisconnect
            | IoctlRequest::SessionState
            | IoctlRequest::CancelSession => Ok(()),
        }
    }
}

/// Copies `data` out to a caller buffer of `capacity` bytes.
pub fn copy_out(data: Vec<u8>, capacity: u32) -> Result<Vec<u8>> {
    if data.len() > capacity as usize {
        return Err(NetsmbError::CopyFault {
            reason: format!("{} bytes do not fit in {}", data.len(), capacity),
        });
    }
    Ok(data)
}

fn sized_principal(name: &str, capacity: u32) -> (Vec<u8>, u32) {
    let bytes = name.as_bytes();
    let required = bytes.len() as u32;
    if required > capacity {
        (Vec::new(), required)
    } else {
        (bytes.to_vec(), required)
    }
}

fn unexpected(command: &str) -> NetsmbError {
    NetsmbError::Transport {
        reason: format!("unexpected reply to {}", command),
    }
}

/// Collaborators a handle-bound command runs against.
pub(crate) struct CommandEnv<'a> {
    pub(crate) manager: &'a Arc<SessionManager>,
    pub(crate) converter: &'a dyn PathConverter,
    pub(crate) ctx: CallContext,
}

impl CommandEnv<'_> {
    /// Sends a request on the bound share. A wire status is returned as
    /// `Err(status)` inside `Ok`; a failure without one fails the call.
    fn forward(
        &self,
        share: &ShareRef,
        request: &WireRequest,
    ) -> Result<std::result::Result<WireReply, u32>> {
        match self
            .manager
            .transport()
            .request(&self.ctx, share.session_id(), share.tree_id(), request)
        {
            Ok(reply) => Ok(Ok(reply)),
            Err(WireError {
                status: Some(status),
                reason,
            }) => {
                debug!(
                    "handle {}: share {} status {:#010x}: {}",
                    self.ctx.handle_id(),
                    share.name(),
                    status,
                    reason
                );
                Ok(Err(status))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Runs a command holding the handle lock exclusively.
    pub(crate) fn execute_exclusive(
        &self,
        state: &mut HandleState,
        request: IoctlRequest,
    ) -> Result<IoctlReply> {
        match request {
            IoctlRequest::Negotiate(payload) => {
                state.require_unbound()?;
                let (session, result) = self.manager.negotiate(&self.ctx, payload.into_params())?;
                state.bind_session(session)?;
                Ok(IoctlReply::Negotiate(NegotiateReply {
                    session_id: result.session_id,
                    capabilities: result.capabilities,
                    session_flags: result.session_flags,
                    dialect: result.dialect,
                    continuation_token: result.continuation_token,
                    shared: result.shared,
                    original_server_addr: result.original_server_addr,
                }))
            }
            IoctlRequest::TreeConnect(payload) => {
                let session = state.require_session()?;
                if state.has_share() {
                    return Err(NetsmbError::AlreadyConnected);
                }
                let share = self
                    .manager
                    .tree_connect(&self.ctx, session, &payload.share_name)?;
                let properties = share.properties();
                state.bind_share(share)?;
                Ok(IoctlReply::TreeConnect(properties))
            }
            IoctlRequest::TreeDisconnect => {
                let share = state.take_share().ok_or(NetsmbError::NotConnected)?;
                drop(share);
                Ok(IoctlReply::Done)
            }
            other => Err(NetsmbError::InvalidArgument {
                msg: format!("{} is not an exclusive command", other.name()),
            }),
        }
    }

    /// Runs a command holding the handle lock shared.
    pub(crate) fn execute_shared(
        &self,
        state: &HandleState,
        request: IoctlRequest,
    ) -> Result<IoctlReply> {
        match request {
            IoctlRequest::UpdateClientInterfaces(payload) => {
                state.require_session()?.update_client_interfaces(payload.client_nics)?;
                Ok(IoctlReply::Done)
            }
            IoctlRequest::NetworkIdentity(payload) => {
                state.require_session()?.set_network_identity(payload.identity)?;
                Ok(IoctlReply::Done)
            }
            IoctlRequest::SessionSetup(payload) => {
                let session = state.require_session()?;
                if state.has_share() {
                    return Err(NetsmbError::AlreadyConnected);
                }
                let args = SetupArgs {
                    user: payload.user,
                    domain: payload.domain,
                    token: payload.token,
                };
                let result = self.manager.session_setup(&self.ctx, session, &args)?;
                Ok(IoctlReply::SessionSetup(SessionSetupReply {
                    guest: result.guest,
                    continuation_token: result.continuation_token,
                }))
            }
            IoctlRequest::ConvertPath(payload) => {
                state.require_session()?;
                let converted = match payload.direction {
                    CONVERT_TO_NETWORK => {
                        let path = String::from_utf8(payload.input).map_err(|e| {
                            NetsmbError::InvalidArgument {
                                msg: format!("local path is not utf-8: {}", e),
                            }
                        })?;
                        self.converter.to_network(&path)?
                    }
                    CONVERT_FROM_NETWORK => self
                        .converter
                        .from_network(&payload.input)?
                        .into_bytes(),
                    flags => {
                        return Err(NetsmbError::InvalidArgument {
                            msg: format!("convert path needs exactly one direction, got {:#x}", flags),
                        })
                    }
                };
                Ok(IoctlReply::ConvertPath(copy_out(converted, payload.max_output)?))
            }
            IoctlRequest::AuthInfo(payload) => {
                let principals = state.require_session()?.principals().unwrap_or_default();
                let (client_principal, client_size) =
                    sized_principal(&principals.client_principal, payload.client_capacity);
                let (server_principal, server_size) =
                    sized_principal(&principals.server_principal, payload.server_capacity);
                Ok(IoctlReply::AuthInfo(AuthInfoReply {
                    client_principal,
                    client_size,
                    server_principal,
                    server_size,
                }))
            }
            IoctlRequest::MultichannelProperties(_) => Ok(IoctlReply::MultichannelProperties(
                state.require_session()?.query_channel_properties(),
            )),
            IoctlRequest::NicInfo(payload) => {
                let entries = state.require_session()?.query_nic_info(payload.selector);
                Ok(IoctlReply::NicInfo(NicInfoReply {
                    count: entries.len() as u32,
                    entries,
                }))
            }
            IoctlRequest::SessionProperties(_) => Ok(IoctlReply::SessionProperties(
                state.require_session()?.properties(),
            )),
            IoctlRequest::ShareProperties(_) => Ok(IoctlReply::ShareProperties(
                state.require_share()?.properties(),
            )),
            IoctlRequest::SessionState => {
                let connected = state
                    .session()
                    .map(|s| !self.manager.transport().is_fatal(s.id()))
                    .unwrap_or(false);
                Ok(IoctlReply::SessionState { connected })
            }
            request => self.execute_forwarded(state, request),
        }
    }

    fn execute_forwarded(&self, state: &HandleState, request: IoctlRequest) -> Result<IoctlReply> {
        let name = request.name();
        let share = state.require_share()?;
        match request {
            IoctlRequest::Request(p) => {
                let wire = WireRequest::Simple {
                    command: p.command,
                    params: p.params,
                    data: p.data,
                };
                match self.forward(share, &wire)? {
                    Ok(WireReply::Data(data)) => Ok(IoctlReply::Data(DataReply { status: 0, data })),
                    Ok(WireReply::Done) => Ok(IoctlReply::Data(DataReply {
                        status: 0,
                        data: Vec::new(),
                    })),
                    Ok(_) => Err(unexpected(name)),
                    Err(status) => Ok(IoctlReply::Data(DataReply {
                        status,
                        data: Vec::new(),
                    })),
                }
            }
            IoctlRequest::T2Request(p) => {
                let wire = WireRequest::Trans2 {
                    setup: p.setup,
                    name: p.name,
                    params: p.params,
                    data: p.data,
                    max_param_count: p.max_param_count,
                    max_data_count: p.max_data_count,
                };
                match self.forward(share, &wire)? {
                    Ok(WireReply::Trans2 { params, data }) => Ok(IoctlReply::Trans2(Trans2Reply {
                        status: 0,
                        params,
                        data,
                    })),
                    Ok(_) => Err(unexpected(name)),
                    Err(status) => Ok(IoctlReply::Trans2(Trans2Reply {
                        status,
                        params: Vec::new(),
                        data: Vec::new(),
                    })),
                }
            }
            IoctlRequest::Read(p) => {
                let wire = WireRequest::Read {
                    fid: p.fid,
                    offset: p.offset,
                    len: p.len,
                };
                match self.forward(share, &wire)? {
                    Ok(WireReply::Data(data)) => {
                        let data = copy_out(data, p.len)?;
                        self.account_io(state, data.len() as u64, 0);
                        Ok(IoctlReply::Data(DataReply { status: 0, data }))
                    }
                    Ok(_) => Err(unexpected(name)),
                    Err(status) => Ok(IoctlReply::Data(DataReply {
                        status,
                        data: Vec::new(),
                    })),
                }
            }
            IoctlRequest::Write(p) => {
                let len = p.data.len() as u64;
                let wire = WireRequest::Write {
                    fid: p.fid,
                    offset: p.offset,
                    data: p.data,
                };
                match self.forward(share, &wire)? {
                    Ok(WireReply::Written(written)) => {
                        self.account_io(state, 0, len.min(written as u64));
                        Ok(IoctlReply::Write(WriteReply { status: 0, written }))
                    }
                    Ok(_) => Err(unexpected(name)),
                    Err(status) => Ok(IoctlReply::Write(WriteReply { status, written: 0 })),
                }
            }
            IoctlRequest::Fsctl(p) => {
                let wire = WireRequest::Fsctl {
                    fid: p.fid,
                    ctl_code: p.ctl_code,
                    input: p.input,
                    max_output: p.max_output,
                };
                match self.forward(share, &wire)? {
                    Ok(WireReply::Data(data)) => Ok(IoctlReply::Data(DataReply {
                        status: 0,
                        data: copy_out(data, p.max_output)?,
                    })),
                    Ok(_) => Err(unexpected(name)),
                    Err(status) => Ok(IoctlReply::Data(DataReply {
                        status,
                        data: Vec::new(),
                    })),
                }
            }
            IoctlRequest::Create(p) => {
                let wire = WireRequest::Create {
                    path: self.converter.to_network(&p.path)?,
                    desired_access: p.desired_access,
                    disposition: p.disposition,
                    options: p.options,
                };
                match self.forward(share, &wire)? {
                    Ok(WireReply::Opened(open)) => Ok(IoctlReply::Create(CreateReply {
                        status: 0,
                        open: Some(open),
                    })),
                    Ok(_) => Err(unexpected(name)),
                    Err(status) => Ok(IoctlReply::Create(CreateReply { status, open: None })),
                }
            }
            IoctlRequest::Close(p) => {
                let status = match self.forward(share, &WireRequest::Close { fid: p.fid })? {
                    Ok(_) => 0,
                    Err(status) => status,
                };
                Ok(IoctlReply::Status(StatusReply { status }))
            }
            IoctlRequest::QueryDir(p) => {
                let wire = WireRequest::QueryDir {
                    dir: p.dir,
                    pattern: p.pattern,
                    max_entries: p.max_entries,
                };
                match self.forward(share, &wire)? {
                    Ok(WireReply::DirEntries { entries, next }) => {
                        Ok(IoctlReply::QueryDir(QueryDirReply {
                            status: 0,
                            entries,
                            next,
                        }))
                    }
                    Ok(_) => Err(unexpected(name)),
                    Err(status) => Ok(IoctlReply::QueryDir(QueryDirReply {
                        status,
                        entries: Vec::new(),
                        next: p.dir,
                    })),
                }
            }
            IoctlRequest::CheckDir(p) => {
                let wire = WireRequest::CheckDir {
                    path: self.converter.to_network(&p.path)?,
                };
                let status = match self.forward(share, &wire)? {
                    Ok(_) => 0,
                    Err(status) => status,
                };
                Ok(IoctlReply::Status(StatusReply { status }))
            }
            IoctlRequest::GetDfsReferral(p) => {
                let wire = WireRequest::GetDfsReferral {
                    path: p.path,
                    max_output: p.max_output,
                };
                match self.forward(share, &wire)? {
                    Ok(WireReply::Data(data)) => Ok(IoctlReply::Data(DataReply {
                        status: 0,
                        data: copy_out(data, p.max_output)?,
                    })),
                    Ok(_) => Err(unexpected(name)),
                    Err(status) => Ok(IoctlReply::Data(DataReply {
                        status,
                        data: Vec::new(),
                    })),
                }
            }
            other => Err(NetsmbError::InvalidArgument {
                msg: format!("{} is not a shared command", other.name()),
            }),
        }
    }

    fn account_io(&self, state: &HandleState, rx: u64, tx: u64) {
        if let Some(main) = state.session().and_then(|s| s.main_channel()) {
            main.record_io(rx, tx);
        }
    }
}
