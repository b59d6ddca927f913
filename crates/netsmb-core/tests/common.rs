//! Common test utilities: a scriptable wire transport and process table.

#![allow(dead_code)]

use netsmb_core::interface::NicEntry;
use netsmb_core::ioctl::{NegotiateIoc, NegotiateReply, TreeConnectIoc};
use netsmb_core::session::{Session, SMB2_GLOBAL_CAP_MULTI_CHANNEL};
use netsmb_core::transport::{
    CallContext, ChannelEstablished, ChannelTarget, DirectoryState, FileState, NegotiateArgs,
    NegotiateOutcome, OpenState, SetupArgs, SetupOutcome, TreeConnectOutcome, WireReply,
    WireRequest,
};
use netsmb_core::{
    DeviceRegistry, IoctlReply, IoctlRequest, MultichannelConfig, NetsmbConfig, NetsmbError,
    ProcessTable, SmbTransport, WireError,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

pub const NOTIFIER_NAME: &str = "notifier-proc";

pub fn sa(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Blocks one read until released.
struct ReadGate {
    entered: Sender<()>,
    release: Receiver<()>,
}

/// Wire transport double with per-call counters and scripted failures.
pub struct MockTransport {
    pub negotiates: AtomicUsize,
    pub setups: AtomicUsize,
    pub tree_connects: AtomicUsize,
    pub tree_disconnects: AtomicUsize,
    pub channel_connects: AtomicUsize,
    pub channel_shutdowns: AtomicUsize,
    pub session_closes: AtomicUsize,
    pub requests: AtomicUsize,
    capabilities: AtomicU32,
    guest: AtomicBool,
    server_nics: Mutex<Vec<NicEntry>>,
    fatal: Mutex<HashSet<u64>>,
    echo_failures: Mutex<HashSet<u32>>,
    refused_pairs: Mutex<HashSet<(u64, u64)>>,
    refused_sessions: Mutex<HashSet<u64>>,
    echoed: Mutex<Vec<(u64, u32)>>,
    request_failure: Mutex<Option<WireError>>,
    read_gate: Mutex<Option<ReadGate>>,
    next_tree_id: AtomicU32,
    principals: Mutex<(String, String)>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            negotiates: AtomicUsize::new(0),
            setups: AtomicUsize::new(0),
            tree_connects: AtomicUsize::new(0),
            tree_disconnects: AtomicUsize::new(0),
            channel_connects: AtomicUsize::new(0),
            channel_shutdowns: AtomicUsize::new(0),
            session_closes: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            capabilities: AtomicU32::new(SMB2_GLOBAL_CAP_MULTI_CHANNEL),
            guest: AtomicBool::new(false),
            server_nics: Mutex::new(Vec::new()),
            fatal: Mutex::new(HashSet::new()),
            echo_failures: Mutex::new(HashSet::new()),
            refused_pairs: Mutex::new(HashSet::new()),
            refused_sessions: Mutex::new(HashSet::new()),
            echoed: Mutex::new(Vec::new()),
            request_failure: Mutex::new(None),
            read_gate: Mutex::new(None),
            next_tree_id: AtomicU32::new(100),
            principals: Mutex::new(("alice@CORP".to_string(), "cifs/fs.corp".to_string())),
        }
    }
}

impl MockTransport {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn set_capabilities(&self, caps: u32) {
        self.capabilities.store(caps, Ordering::SeqCst);
    }

    pub fn set_guest(&self, guest: bool) {
        self.guest.store(guest, Ordering::SeqCst);
    }

    pub fn set_server_nics(&self, nics: Vec<NicEntry>) {
        *self.server_nics.lock().unwrap() = nics;
    }

    pub fn set_fatal(&self, session_id: u64) {
        self.fatal.lock().unwrap().insert(session_id);
    }

    pub fn fail_echo(&self, channel_id: u32) {
        self.echo_failures.lock().unwrap().insert(channel_id);
    }

    pub fn refuse_pair(&self, local: u64, remote: u64) {
        self.refused_pairs.lock().unwrap().insert((local, remote));
    }

    pub fn refuse_session_channels(&self, session_id: u64) {
        self.refused_sessions.lock().unwrap().insert(session_id);
    }

    pub fn echoed(&self) -> Vec<(u64, u32)> {
        self.echoed.lock().unwrap().clone()
    }

    pub fn fail_requests(&self, failure: Option<WireError>) {
        *self.request_failure.lock().unwrap() = failure;
    }

    /// The next read blocks after signalling `entered` until `release` fires.
    pub fn gate_next_read(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.read_gate.lock().unwrap() = Some(ReadGate {
            entered: entered_tx,
            release: release_rx,
        });
        (entered_rx, release_tx)
    }
}

impl SmbTransport for MockTransport {
    fn negotiate(
        &self,
        ctx: &CallContext,
        _session_id: u64,
        args: &NegotiateArgs,
    ) -> Result<NegotiateOutcome, WireError> {
        self.negotiates.fetch_add(1, Ordering::SeqCst);
        if ctx.is_cancelled() {
            return Err(WireError::transport("cancelled"));
        }
        Ok(NegotiateOutcome {
            capabilities: self.capabilities.load(Ordering::SeqCst),
            session_flags: 0,
            dialect: 0x0311,
            continuation_token: vec![0xAA, 0xBB],
            main_peer: Some(args.server_addr),
            server_nics: self.server_nics.lock().unwrap().clone(),
            native_os: "Windows Server".to_string(),
            native_lanman: "SMB".to_string(),
            model_info: Some("mock".to_string()),
        })
    }

    fn session_setup(
        &self,
        _ctx: &CallContext,
        _session_id: u64,
        args: &SetupArgs,
    ) -> Result<SetupOutcome, WireError> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        if args.token.is_empty() {
            return Err(WireError::status(0xC000_006D));
        }
        let (client, server) = self.principals.lock().unwrap().clone();
        Ok(SetupOutcome {
            guest: self.guest.load(Ordering::SeqCst),
            continuation_token: Vec::new(),
            client_principal: client,
            server_principal: server,
        })
    }

    fn tree_connect(
        &self,
        _ctx: &CallContext,
        _session_id: u64,
        share: &str,
    ) -> Result<TreeConnectOutcome, WireError> {
        self.tree_connects.fetch_add(1, Ordering::SeqCst);
        if share.eq_ignore_ascii_case("missing") {
            return Err(WireError::status(0xC000_00CC));
        }
        Ok(TreeConnectOutcome {
            tree_id: self.next_tree_id.fetch_add(1, Ordering::SeqCst),
            share_type: 1,
            share_flags: 0,
            maximal_access: 0x001F_01FF,
        })
    }

    fn tree_disconnect(&self, _session_id: u64, _tree_id: u32) -> Result<(), WireError> {
        self.tree_disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn connect_channel(
        &self,
        session_id: u64,
        target: &ChannelTarget,
    ) -> Result<ChannelEstablished, WireError> {
        self.channel_connects.fetch_add(1, Ordering::SeqCst);
        if self.refused_sessions.lock().unwrap().contains(&session_id)
            || self
                .refused_pairs
                .lock()
                .unwrap()
                .contains(&(target.local_index, target.remote_index))
        {
            return Err(WireError::transport("connection refused"));
        }
        Ok(ChannelEstablished {
            peer: target.remote_addr,
            rdma: target.rdma,
        })
    }

    fn echo(&self, session_id: u64, channel_id: u32) -> Result<(), WireError> {
        self.echoed.lock().unwrap().push((session_id, channel_id));
        if self.echo_failures.lock().unwrap().contains(&channel_id) {
            return Err(WireError::transport("echo timed out"));
        }
        Ok(())
    }

    fn shutdown_channel(&self, _session_id: u64, _channel_id: u32) {
        self.channel_shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    fn request(
        &self,
        _ctx: &CallContext,
        _session_id: u64,
        _tree_id: u32,
        request: &WireRequest,
    ) -> Result<WireReply, WireError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.request_failure.lock().unwrap().clone() {
            return Err(failure);
        }
        match request {
            WireRequest::Read { len, .. } => {
                let gate = self.read_gate.lock().unwrap().take();
                if let Some(gate) = gate {
                    gate.entered.send(()).unwrap();
                    gate.release.recv().unwrap();
                }
                Ok(WireReply::Data(vec![0x5A; *len as usize]))
            }
            WireRequest::Write { data, .. } => Ok(WireReply::Written(data.len() as u32)),
            WireRequest::Create { options, .. } => {
                let open = if options & 0x1 != 0 {
                    OpenState::Directory(DirectoryState {
                        fid: 11,
                        ..Default::default()
                    })
                } else {
                    OpenState::File(FileState {
                        fid: 12,
                        size: 4096,
                        oplock_level: 1,
                    })
                };
                Ok(WireReply::Opened(open))
            }
            WireRequest::QueryDir { dir, .. } => Ok(WireReply::DirEntries {
                entries: b"a\0b\0".to_vec(),
                next: DirectoryState {
                    resume_key: dir.resume_key + 2,
                    entries_returned: dir.entries_returned + 2,
                    eof: true,
                    ..*dir
                },
            }),
            WireRequest::Trans2 { .. } => Ok(WireReply::Trans2 {
                params: vec![1],
                data: vec![2, 3],
            }),
            WireRequest::Close { .. } | WireRequest::CheckDir { .. } => Ok(WireReply::Done),
            _ => Ok(WireReply::Data(vec![0xEE; 8])),
        }
    }

    fn is_fatal(&self, session_id: u64) -> bool {
        self.fatal.lock().unwrap().contains(&session_id)
    }

    fn close_session(&self, _session_id: u64) {
        self.session_closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Process table keyed by pid.
#[derive(Default)]
pub struct FakeProcesses {
    names: Mutex<HashMap<u32, String>>,
}

impl FakeProcesses {
    pub fn set(&self, pid: u32, name: &str) {
        self.names.lock().unwrap().insert(pid, name.to_string());
    }

    pub fn kill(&self, pid: u32) {
        self.names.lock().unwrap().remove(&pid);
    }
}

impl ProcessTable for FakeProcesses {
    fn process_name(&self, pid: u32) -> Option<String> {
        self.names.lock().unwrap().get(&pid).cloned()
    }
}

/// Registry wired to fresh doubles.
pub struct TestRig {
    pub registry: Arc<DeviceRegistry>,
    pub transport: Arc<MockTransport>,
    pub processes: Arc<FakeProcesses>,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_multichannel(MultichannelConfig::default())
    }

    pub fn with_multichannel(multichannel: MultichannelConfig) -> Self {
        let transport = Arc::new(MockTransport::default());
        let processes = Arc::new(FakeProcesses::default());
        let config = NetsmbConfig::default()
            .with_max_handles(64)
            .with_notifier_process_name(NOTIFIER_NAME)
            .with_multichannel(multichannel);
        let registry = DeviceRegistry::new(config, transport.clone(), processes.clone()).unwrap();
        Self {
            registry: Arc::new(registry),
            transport,
            processes,
        }
    }

    /// Allocates and opens a handle.
    pub fn open(&self) -> u32 {
        let id = self.registry.allocate().unwrap();
        self.registry.open(id).unwrap();
        id
    }

    pub fn negotiate_with(&self, id: u32, payload: NegotiateIoc) -> Result<NegotiateReply, NetsmbError> {
        match self.registry.ioctl(id, IoctlRequest::Negotiate(payload))? {
            IoctlReply::Negotiate(reply) => Ok(reply),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    pub fn negotiate(&self, id: u32, server: &str, addr: &str) -> NegotiateReply {
        self.negotiate_with(id, NegotiateIoc::new(server, sa(addr)).with_user("alice", "CORP"))
            .unwrap()
    }

    pub fn tree_connect(&self, id: u32, share: &str) -> Result<IoctlReply, NetsmbError> {
        self.registry
            .ioctl(id, IoctlRequest::TreeConnect(TreeConnectIoc::new(share)))
    }

    /// Open handle with a session to `fs.corp` and the `data` share bound.
    pub fn connected(&self) -> u32 {
        let id = self.open();
        self.negotiate(id, "fs.corp", "10.0.0.1:445");
        self.tree_connect(id, "data").unwrap();
        id
    }

    pub fn session(&self, id: u32) -> Arc<Session> {
        self.registry.handle(id).unwrap().bound_session().unwrap()
    }
}
