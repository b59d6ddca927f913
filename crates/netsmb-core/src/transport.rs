//! Seams to the collaborators the control plane drives but does not implement:
//! the SMB wire protocol, path charset conversion and the host process table.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{NetsmbError, Result};
use crate::handle::HandleFlags;
use crate::interface::NicEntry;

/// Per-call context handed to every blocking collaborator call.
///
/// Blocking implementations poll [`CallContext::is_cancelled`] at their own
/// safe points; nothing preempts them.
#[derive(Debug, Clone)]
pub struct CallContext {
    handle_id: u32,
    flags: Option<Arc<AtomicU32>>,
}

impl CallContext {
    pub fn new(handle_id: u32, flags: Arc<AtomicU32>) -> Self {
        Self {
            handle_id,
            flags: Some(flags),
        }
    }

    /// Context for calls not issued on behalf of a handle (notifier walk).
    pub fn detached() -> Self {
        Self {
            handle_id: 0,
            flags: None,
        }
    }

    pub fn handle_id(&self) -> u32 {
        self.handle_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags
            .as_ref()
            .map(|f| HandleFlags(f.load(Ordering::Acquire)).contains(HandleFlags::CANCEL_REQUESTED))
            .unwrap_or(false)
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(NetsmbError::Cancelled);
        }
        Ok(())
    }
}

/// Failure reported by the wire layer.
///
/// `status` is the NT status when the server answered; `None` means the
/// exchange never produced one (connection dropped, timeout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError {
    pub status: Option<u32>,
    pub reason: String,
}

impl WireError {
    pub fn status(status: u32) -> Self {
        Self {
            status: Some(status),
            reason: format!("status {:#010x}", status),
        }
    }

    pub fn transport(reason: &str) -> Self {
        Self {
            status: None,
            reason: reason.to_string(),
        }
    }
}

impl From<WireError> for NetsmbError {
    fn from(err: WireError) -> Self {
        match err.status {
            Some(status) => NetsmbError::Protocol { status },
            None => NetsmbError::Transport { reason: err.reason },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateArgs {
    pub server_name: String,
    pub server_addr: SocketAddr,
    pub client_guid: Uuid,
    pub dialects: u32,
    pub signing_required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiateOutcome {
    pub capabilities: u32,
    pub session_flags: u32,
    pub dialect: u16,
    pub continuation_token: Vec<u8>,
    /// Peer address of the main channel.
    pub main_peer: Option<SocketAddr>,
    pub server_nics: Vec<NicEntry>,
    pub native_os: String,
    pub native_lanman: String,
    pub model_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupArgs {
    pub user: String,
    pub domain: String,
    pub token: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupOutcome {
    pub guest: bool,
    pub continuation_token: Vec<u8>,
    pub client_principal: String,
    pub server_principal: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeConnectOutcome {
    pub tree_id: u32,
    pub share_type: u8,
    pub share_flags: u32,
    pub maximal_access: u32,
}

/// Interface pair an alternate channel should be brought up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub local_index: u64,
    pub remote_index: u64,
    pub local_addr: IpAddr,
    pub remote_addr: SocketAddr,
    /// Both interfaces advertise RDMA.
    pub rdma: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEstablished {
    pub peer: SocketAddr,
    /// The transport brought the channel up over RDMA.
    pub rdma: bool,
}

/// Cursor of an open directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryState {
    pub fid: u64,
    pub resume_key: u64,
    pub entries_returned: u64,
    pub eof: bool,
}

/// State of an open regular file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub fid: u64,
    pub size: u64,
    pub oplock_level: u8,
}

/// What a create opened; the node kind decides which state is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenState {
    Directory(DirectoryState),
    File(FileState),
}

impl OpenState {
    pub fn fid(&self) -> u64 {
        match self {
            OpenState::Directory(d) => d.fid,
            OpenState::File(f) => f.fid,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, OpenState::Directory(_))
    }
}

/// Request forwarded to a bound share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireRequest {
    Simple {
        command: u8,
        params: Vec<u8>,
        data: Vec<u8>,
    },
    Trans2 {
        setup: Vec<u16>,
        name: String,
        params: Vec<u8>,
        data: Vec<u8>,
        max_param_count: u32,
        max_data_count: u32,
    },
    Read {
        fid: u64,
        offset: u64,
        len: u32,
    },
    Write {
        fid: u64,
        offset: u64,
        data: Vec<u8>,
    },
    Fsctl {
        fid: u64,
        ctl_code: u32,
        input: Vec<u8>,
        max_output: u32,
    },
    Create {
        path: Vec<u8>,
        desired_access: u32,
        disposition: u32,
        options: u32,
    },
    Close {
        fid: u64,
    },
    QueryDir {
        dir: DirectoryState,
        pattern: String,
        max_entries: u32,
    },
    CheckDir {
        path: Vec<u8>,
    },
    GetDfsReferral {
        path: String,
        max_output: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireReply {
    Data(Vec<u8>),
    Trans2 { params: Vec<u8>, data: Vec<u8> },
    Written(u32),
    Opened(OpenState),
    DirEntries { entries: Vec<u8>, next: DirectoryState },
    Done,
}

/// SMB wire protocol layer. Every method may block on the network.
pub trait SmbTransport: Send + Sync {
    fn negotiate(
        &self,
        ctx: &CallContext,
        session_id: u64,
        args: &NegotiateArgs,
    ) -> std::result::Result<NegotiateOutcome, WireError>;

    fn session_setup(
        &self,
        ctx: &CallContext,
        session_id: u64,
        args: &SetupArgs,
    ) -> std::result::Result<SetupOutcome, WireError>;

    fn tree_connect(
        &self,
        ctx: &CallContext,
        session_id: u64,
        share_name: &str,
    ) -> std::result::Result<TreeConnectOutcome, WireError>;

    fn tree_disconnect(&self, session_id: u64, tree_id: u32) -> std::result::Result<(), WireError>;

    fn connect_channel(
        &self,
        session_id: u64,
        target: &ChannelTarget,
    ) -> std::result::Result<ChannelEstablished, WireError>;

    /// Echo/keepalive on one channel.
    fn echo(&self, session_id: u64, channel_id: u32) -> std::result::Result<(), WireError>;

    fn shutdown_channel(&self, session_id: u64, channel_id: u32);

    fn request(
        &self,
        ctx: &CallContext,
        session_id: u64,
        tree_id: u32,
        req: &WireRequest,
    ) -> std::result::Result<WireReply, WireError>;

    /// True once the session's transport hit an unrecoverable error.
    fn is_fatal(&self, session_id: u64) -> bool;

    /// Logoff and drop all transport state of a destroyed session.
    fn close_session(&self, session_id: u64);
}

/// Path representation converter.
pub trait PathConverter: Send + Sync {
    fn to_network(&self, path: &str) -> Result<Vec<u8>>;
    fn from_network(&self, bytes: &[u8]) -> Result<String>;
}

/// UTF-16LE with backslash separators on the wire.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf16PathConverter;

impl PathConverter for Utf16PathConverter {
    fn to_network(&self, path: &str) -> Result<Vec<u8>> {
        Ok(path
            .chars()
            .map(|c| if c == '/' { '\\' } else { c })
            .collect::<String>()
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect())
    }

    fn from_network(&self, bytes: &[u8]) -> Result<String> {
        if bytes.len() % 2 != 0 {
            return Err(NetsmbError::InvalidArgument {
                msg: "odd-length UTF-16 path".to_string(),
            });
        }
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let s = String::from_utf16(&units).map_err(|e| NetsmbError::InvalidArgument {
            msg: e.to_string(),
        })?;
        Ok(s.replace('\\', "/"))
    }
}

/// Host process lookup used to validate the notifier registration.
pub trait ProcessTable: Send + Sync {
    /// Name of the live process `pid`, or `None` if it no longer exists.
    fn process_name(&self, pid: u32) -> Option<String>;
}

/// Reads `/proc/<pid>/comm`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsProcessTable;

impl ProcessTable for ProcfsProcessTable {
    fn process_name(&self, pid: u32) -> Option<String> {
        std::fs::read_to_string(format!("/proc/{}/comm", pid))
            .ok()
            .map(|s| s.trim_end().to_string())
    }
}
