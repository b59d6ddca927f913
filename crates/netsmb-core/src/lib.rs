#![warn(missing_docs)]

//! netsmb-core: control plane of an SMB network filesystem client.
//!
//! Device handles, the sessions and shares they bind, multichannel
//! establishment across client/server interfaces, and the notifier process
//! that reports interface changes.

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod handle;
pub mod interface;
pub mod ioctl;
pub mod lock_order;
pub mod multichannel;
pub mod notifier;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::{MultichannelConfig, NetsmbConfig};
pub use device::DeviceAdapter;
pub use error::{NetsmbError, Result};
pub use handle::{DeviceHandle, HandleFlags};
pub use interface::{InterfaceTable, NicEntry, NicSelector, NIC_INDEX_RSS_MARKER};
pub use ioctl::{IoctlReply, IoctlRequest};
pub use multichannel::InterfaceUpdate;
pub use registry::{DeviceRegistry, NETSMB_BOOTSTRAP_ID};
pub use session::{Session, SessionManager, SessionRef, ShareRef};
pub use transport::{CallContext, PathConverter, ProcessTable, SmbTransport, WireError};
