//! Error types for the netsmb control plane.
//!
//! Every variant is recoverable at the handle level. Protocol-level outcomes of
//! request-shaped calls travel in the reply payload; only infrastructural
//! failures surface here.

use thiserror::Error;

/// Control-plane error returned by registry, handle and session operations.
#[derive(Debug, Error)]
pub enum NetsmbError {
    /// Payload version tag does not match the command's current version.
    #[error("payload version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version the command expects.
        expected: u32,
        /// Version carried by the payload.
        found: u32,
    },

    /// A Session or Share is already bound where absence is required.
    #[error("already connected")]
    AlreadyConnected,

    /// A Session or Share is missing where presence is required.
    #[error("not connected")]
    NotConnected,

    /// The handle id is outside the valid range or not open.
    #[error("invalid handle: {id}")]
    HandleInvalid {
        /// Offending handle id.
        id: u32,
    },

    /// The handle was closed while the caller still referred to it.
    #[error("handle gone: {id}")]
    HandleGone {
        /// Offending handle id.
        id: u32,
    },

    /// Reopen of an in-use id, the bootstrap id, or the registry is unloading.
    #[error("handle busy: {id}")]
    HandleBusy {
        /// Offending handle id.
        id: u32,
    },

    /// Every handle id is published.
    #[error("handle table full: all {max} ids in use")]
    HandleIdsExhausted {
        /// Size of the handle id space.
        max: u32,
    },

    /// An allocation was refused.
    #[error("resource exhausted: {what}")]
    ResourceExhausted {
        /// Which resource ran out.
        what: String,
    },

    /// A live, correctly-named notifier is already registered.
    #[error("notifier already registered: pid {pid}")]
    NotifierAlreadyRegistered {
        /// Pid of the current holder.
        pid: u32,
    },

    /// The session network identity can only be set once.
    #[error("network identity already set")]
    IdentityAlreadySet,

    /// Malformed argument in an otherwise well-versioned payload.
    #[error("invalid argument: {msg}")]
    InvalidArgument {
        /// Description of the problem.
        msg: String,
    },

    /// Opaque status surfaced by the wire protocol layer.
    #[error("protocol error: status {status:#010x}")]
    Protocol {
        /// NT status reported by the server.
        status: u32,
    },

    /// Transport failure with no protocol status attached.
    #[error("transport error: {reason}")]
    Transport {
        /// Failure details.
        reason: String,
    },

    /// Data could not be moved across the caller boundary.
    #[error("copy fault: {reason}")]
    CopyFault {
        /// Failure details.
        reason: String,
    },

    /// The handle's CancelRequested flag was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration rejected by validation.
    #[error("invalid configuration: {reason}")]
    Config {
        /// Failure details.
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetsmbError>;

impl NetsmbError {
    /// Maps the error to the errno the device boundary reports.
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            NetsmbError::VersionMismatch { .. } => EINVAL,
            NetsmbError::AlreadyConnected => EISCONN,
            NetsmbError::NotConnected => ENOTCONN,
            NetsmbError::HandleInvalid { .. } => EBADF,
            NetsmbError::HandleGone { .. } => EBADF,
            NetsmbError::HandleBusy { .. } => EBUSY,
            NetsmbError::HandleIdsExhausted { .. } => ENFILE,
            NetsmbError::ResourceExhausted { .. } => ENOMEM,
            NetsmbError::NotifierAlreadyRegistered { .. } => EEXIST,
            NetsmbError::IdentityAlreadySet => EEXIST,
            NetsmbError::InvalidArgument { .. } => EINVAL,
            NetsmbError::Protocol { .. } => EIO,
            NetsmbError::Transport { .. } => EIO,
            NetsmbError::CopyFault { .. } => EFAULT,
            NetsmbError::Cancelled => EINTR,
            NetsmbError::Config { .. } => EINVAL,
            NetsmbError::Io(e) => e.raw_os_error().unwrap_or(EIO),
        }
    }
}
