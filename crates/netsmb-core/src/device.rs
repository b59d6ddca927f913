//! Device boundary: numbered commands with bincode payloads.
//!
//! Callers on the far side of the device hand over a command code and a
//! byte payload; the adapter decodes it into an [`IoctlRequest`], runs it on
//! the registry and encodes the [`IoctlReply`]. Layout concerns stay here.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::error::{NetsmbError, Result};
use crate::ioctl::{IoctlReply, IoctlRequest};
use crate::registry::DeviceRegistry;

pub const NETSMB_CMD_NEGOTIATE: u32 = 0x01;
pub const NETSMB_CMD_SESSION_SETUP: u32 = 0x02;
pub const NETSMB_CMD_TREE_CONNECT: u32 = 0x03;
pub const NETSMB_CMD_TREE_DISCONNECT: u32 = 0x04;
pub const NETSMB_CMD_UPDATE_CLIENT_INTERFACES: u32 = 0x05;
pub const NETSMB_CMD_UPDATE_NOTIFIER_PID: u32 = 0x06;
pub const NETSMB_CMD_GET_NOTIFIER_PID: u32 = 0x07;
pub const NETSMB_CMD_NOTIFIER_UPDATE_INTERFACES: u32 = 0x08;
pub const NETSMB_CMD_NETWORK_IDENTITY: u32 = 0x09;
pub const NETSMB_CMD_CONVERT_PATH: u32 = 0x0a;
pub const NETSMB_CMD_AUTH_INFO: u32 = 0x0b;
pub const NETSMB_CMD_MULTICHANNEL_PROPERTIES: u32 = 0x0c;
pub const NETSMB_CMD_NIC_INFO: u32 = 0x0d;
pub const NETSMB_CMD_SESSION_PROPERTIES: u32 = 0x0e;
pub const NETSMB_CMD_SHARE_PROPERTIES: u32 = 0x0f;
pub const NETSMB_CMD_SESSION_STATE: u32 = 0x10;
pub const NETSMB_CMD_CANCEL_SESSION: u32 = 0x11;
pub const NETSMB_CMD_REQUEST: u32 = 0x20;
pub const NETSMB_CMD_T2_REQUEST: u32 = 0x21;
pub const NETSMB_CMD_READ: u32 = 0x22;
pub const NETSMB_CMD_WRITE: u32 = 0x23;
pub const NETSMB_CMD_FSCTL: u32 = 0x24;
pub const NETSMB_CMD_CREATE: u32 = 0x30;
pub const NETSMB_CMD_CLOSE: u32 = 0x31;
pub const NETSMB_CMD_QUERY_DIR: u32 = 0x32;
pub const NETSMB_CMD_CHECK_DIR: u32 = 0x33;
pub const NETSMB_CMD_GET_DFS_REFERRAL: u32 = 0x34;

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| NetsmbError::CopyFault {
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| NetsmbError::CopyFault {
        reason: e.to_string(),
    })
}

/// Decodes the payload of command `code`.
pub fn decode_request(code: u32, payload: &[u8]) -> Result<IoctlRequest> {
    let request = match code {
        NETSMB_CMD_NEGOTIATE => IoctlRequest::Negotiate(decode(payload)?),
        NETSMB_CMD_SESSION_SETUP => IoctlRequest::SessionSetup(decode(payload)?),
        NETSMB_CMD_TREE_CONNECT => IoctlRequest::TreeConnect(decode(payload)?),
        NETSMB_CMD_TREE_DISCONNECT => IoctlRequest::TreeDisconnect,
        NETSMB_CMD_UPDATE_CLIENT_INTERFACES => IoctlRequest::UpdateClientInterfaces(decode(payload)?),
        NETSMB_CMD_UPDATE_NOTIFIER_PID => IoctlRequest::UpdateNotifierPid(decode(payload)?),
        NETSMB_CMD_GET_NOTIFIER_PID => IoctlRequest::GetNotifierPid(decode(payload)?),
        NETSMB_CMD_NOTIFIER_UPDATE_INTERFACES => {
            IoctlRequest::NotifierUpdateInterfaces(decode(payload)?)
        }
        NETSMB_CMD_NETWORK_IDENTITY => IoctlRequest::NetworkIdentity(decode(payload)?),
        NETSMB_CMD_CONVERT_PATH => IoctlRequest::ConvertPath(decode(payload)?),
        NETSMB_CMD_AUTH_INFO => IoctlRequest::AuthInfo(decode(payload)?),
        NETSMB_CMD_MULTICHANNEL_PROPERTIES => IoctlRequest::MultichannelProperties(decode(payload)?),
        NETSMB_CMD_NIC_INFO => IoctlRequest::NicInfo(decode(payload)?),
        NETSMB_CMD_SESSION_PROPERTIES => IoctlRequest::SessionProperties(decode(payload)?),
        NETSMB_CMD_SHARE_PROPERTIES => IoctlRequest::ShareProperties(decode(payload)?),
        NETSMB_CMD_SESSION_STATE => IoctlRequest::SessionState,
        NETSMB_CMD_CANCEL_SESSION => IoctlRequest::CancelSession,
        NETSMB_CMD_REQUEST => IoctlRequest::Request(decode(payload)?),
        NETSMB_CMD_T2_REQUEST => IoctlRequest::T2Request(decode(payload)?),
        NETSMB_CMD_READ => IoctlRequest::Read(decode(payload)?),
        NETSMB_CMD_WRITE => IoctlRequest::Write(decode(payload)?),
        NETSMB_CMD_FSCTL => IoctlRequest::Fsctl(decode(payload)?),
        NETSMB_CMD_CREATE => IoctlRequest::Create(decode(payload)?),
        NETSMB_CMD_CLOSE => IoctlRequest::Close(decode(payload)?),
        NETSMB_CMD_QUERY_DIR => IoctlRequest::QueryDir(decode(payload)?),
        NETSMB_CMD_CHECK_DIR => IoctlRequest::CheckDir(decode(payload)?),
        NETSMB_CMD_GET_DFS_REFERRAL => IoctlRequest::GetDfsReferral(decode(payload)?),
        other => {
            return Err(NetsmbError::InvalidArgument {
                msg: format!("unknown command {:#x}", other),
            })
        }
    };
    Ok(request)
}

/// Command code and payload bytes for `request`.
pub fn encode_request(request: &IoctlRequest) -> Result<(u32, Vec<u8>)> {
    let encoded = match request {
        IoctlRequest::Negotiate(p) => (NETSMB_CMD_NEGOTIATE, encode(p)?),
        IoctlRequest::SessionSetup(p) => (NETSMB_CMD_SESSION_SETUP, encode(p)?),
        IoctlRequest::TreeConnect(p) => (NETSMB_CMD_TREE_CONNECT, encode(p)?),
        IoctlRequest::TreeDisconnect => (NETSMB_CMD_TREE_DISCONNECT, Vec::new()),
        IoctlRequest::UpdateClientInterfaces(p) => (NETSMB_CMD_UPDATE_CLIENT_INTERFACES, encode(p)?),
        IoctlRequest::UpdateNotifierPid(p) => (NETSMB_CMD_UPDATE_NOTIFIER_PID, encode(p)?),
        IoctlRequest::GetNotifierPid(p) => (NETSMB_CMD_GET_NOTIFIER_PID, encode(p)?),
        IoctlRequest::NotifierUpdateInterfaces(p) => {
            (NETSMB_CMD_NOTIFIER_UPDATE_INTERFACES, encode(p)?)
        }
        IoctlRequest::NetworkIdentity(p) => (NETSMB_CMD_NETWORK_IDENTITY, encode(p)?),
        IoctlRequest::ConvertPath(p) => (NETSMB_CMD_CONVERT_PATH, encode(p)?),
        IoctlRequest::AuthInfo(p) => (NETSMB_CMD_AUTH_INFO, encode(p)?),
        IoctlRequest::MultichannelProperties(p) => (NETSMB_CMD_MULTICHANNEL_PROPERTIES, encode(p)?),
        IoctlRequest::NicInfo(p) => (NETSMB_CMD_NIC_INFO, encode(p)?),
        IoctlRequest::SessionProperties(p) => (NETSMB_CMD_SESSION_PROPERTIES, encode(p)?),
        IoctlRequest::ShareProperties(p) => (NETSMB_CMD_SHARE_PROPERTIES, encode(p)?),
        IoctlRequest::SessionState => (NETSMB_CMD_SESSION_STATE, Vec::new()),
        IoctlRequest::CancelSession => (NETSMB_CMD_CANCEL_SESSION, Vec::new()),
        IoctlRequest::Request(p) => (NETSMB_CMD_REQUEST, encode(p)?),
        IoctlRequest::T2Request(p) => (NETSMB_CMD_T2_REQUEST, encode(p)?),
        IoctlRequest::Read(p) => (NETSMB_CMD_READ, encode(p)?),
        IoctlRequest::Write(p) => (NETSMB_CMD_WRITE, encode(p)?),
        IoctlRequest::Fsctl(p) => (NETSMB_CMD_FSCTL, encode(p)?),
        IoctlRequest::Create(p) => (NETSMB_CMD_CREATE, encode(p)?),
        IoctlRequest::Close(p) => (NETSMB_CMD_CLOSE, encode(p)?),
        IoctlRequest::QueryDir(p) => (NETSMB_CMD_QUERY_DIR, encode(p)?),
        IoctlRequest::CheckDir(p) => (NETSMB_CMD_CHECK_DIR, encode(p)?),
        IoctlRequest::GetDfsReferral(p) => (NETSMB_CMD_GET_DFS_REFERRAL, encode(p)?),
    };
    Ok(encoded)
}

pub fn encode_reply(reply: &IoctlReply) -> Result<Vec<u8>> {
    encode(reply)
}

pub fn decode_reply(bytes: &[u8]) -> Result<IoctlReply> {
    decode(bytes)
}

/// Byte-level front end of a [`DeviceRegistry`].
#[derive(Debug, Clone)]
pub struct DeviceAdapter {
    registry: Arc<DeviceRegistry>,
}

impl DeviceAdapter {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn open(&self, id: u32) -> std::result::Result<(), i32> {
        self.registry.open(id).map_err(|e| e.to_errno())
    }

    pub fn close(&self, id: u32) -> std::result::Result<(), i32> {
        self.registry.close(id).map_err(|e| e.to_errno())
    }

    /// Runs a raw command; failures come back as errno values.
    pub fn ioctl(&self, id: u32, code: u32, payload: &[u8]) -> std::result::Result<Vec<u8>, i32> {
        self.dispatch(id, code, payload).map_err(|e| {
            debug!("handle {}: command {:#x} failed: {}", id, code, e);
            e.to_errno()
        })
    }

    fn dispatch(&self, id: u32, code: u32, payload: &[u8]) -> Result<Vec<u8>> {
        let request = decode_request(code, payload)?;
        let reply = self.registry.ioctl(id, request)?;
        encode_reply(&reply)
    }
}
