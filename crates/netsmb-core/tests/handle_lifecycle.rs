//! Handle lifecycle, session/share binding and dispatch locking.

mod common;

use common::{sa, MockTransport, TestRig};
use netsmb_core::device::{encode_request, NETSMB_CMD_SESSION_PROPERTIES};
use netsmb_core::ioctl::{
    AuthInfoIoc, ConvertPathIoc, CreateIoc, DataReply, NegotiateIoc, NetworkIdentityIoc,
    QueryDirIoc, QueryIoc, ReadIoc, SessionSetupIoc, WriteIoc, CONVERT_FROM_NETWORK,
    CONVERT_TO_NETWORK, NETSMB_IOC_VERSION,
};
use netsmb_core::session::NetworkIdentity;
use netsmb_core::transport::{DirectoryState, OpenState};
use netsmb_core::{DeviceAdapter, IoctlReply, IoctlRequest, NetsmbError, WireError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn query() -> QueryIoc {
    QueryIoc {
        version: NETSMB_IOC_VERSION,
    }
}

#[test]
fn test_bootstrap_open_then_open_new_id() {
    let rig = TestRig::new();
    let reg = &rig.registry;

    assert!(matches!(reg.open(0), Err(NetsmbError::HandleBusy { id: 0 })));
    reg.open(1).unwrap();
    assert!(reg.handle(1).unwrap().is_open());
    assert!(matches!(reg.open(1), Err(NetsmbError::HandleBusy { id: 1 })));

    assert!(matches!(reg.open(0), Err(NetsmbError::HandleBusy { .. })));
    reg.open(2).unwrap();
    assert_eq!(reg.open_count(), 2);
}

#[test]
fn test_negotiate_version_mismatch_leaves_handle_unbound() {
    let rig = TestRig::new();
    let id = rig.open();
    let mut payload = NegotiateIoc::new("fs.corp", sa("10.0.0.1:445"));
    payload.version = NETSMB_IOC_VERSION + 1;

    let res = rig.negotiate_with(id, payload);
    assert!(matches!(res, Err(NetsmbError::VersionMismatch { .. })));
    assert!(rig.registry.handle(id).unwrap().bound_session().is_none());
    assert_eq!(MockTransport::count(&rig.transport.negotiates), 0);
}

#[test]
fn test_tree_connect_without_session() {
    let rig = TestRig::new();
    let id = rig.open();
    assert!(matches!(rig.tree_connect(id, "data"), Err(NetsmbError::NotConnected)));
    assert_eq!(MockTransport::count(&rig.transport.tree_connects), 0);
}

#[test]
fn test_negotiate_twice_already_connected() {
    let rig = TestRig::new();
    let id = rig.open();
    rig.negotiate(id, "fs.corp", "10.0.0.1:445");
    let res = rig.negotiate_with(id, NegotiateIoc::new("fs.corp", sa("10.0.0.1:445")));
    assert!(matches!(res, Err(NetsmbError::AlreadyConnected)));
    assert_eq!(MockTransport::count(&rig.transport.negotiates), 1);
}

#[test]
fn test_negotiate_reply_fields() {
    let rig = TestRig::new();
    let id = rig.open();
    let reply = rig.negotiate(id, "fs.corp", "10.0.0.1:445");
    assert!(!reply.shared);
    assert_eq!(reply.dialect, 0x0311);
    assert_eq!(reply.continuation_token, vec![0xAA, 0xBB]);
    assert!(reply.original_server_addr.is_none());
}

#[test]
fn test_sessions_shared_and_released_once() {
    let rig = TestRig::new();
    let a = rig.open();
    let b = rig.open();
    let first = rig.negotiate(a, "fs.corp", "10.0.0.1:445");
    let second = rig.negotiate(b, "FS.CORP", "10.0.0.1:445");

    assert_eq!(first.session_id, second.session_id);
    assert!(second.shared);
    assert!(second.original_server_addr.is_none());
    assert_eq!(MockTransport::count(&rig.transport.negotiates), 1);
    let manager = rig.registry.session_manager();
    assert_eq!(manager.session_count(), 1);
    assert_eq!(rig.session(a).ref_count(), 2);

    rig.registry.close(a).unwrap();
    assert_eq!(manager.session_count(), 1);
    assert_eq!(rig.session(b).ref_count(), 1);
    assert_eq!(MockTransport::count(&rig.transport.session_closes), 0);

    rig.registry.close(b).unwrap();
    assert_eq!(manager.session_count(), 0);
    assert_eq!(MockTransport::count(&rig.transport.session_closes), 1);
}

#[test]
fn test_shared_by_address_echoes_original() {
    let rig = TestRig::new();
    let a = rig.open();
    let b = rig.open();
    rig.negotiate(a, "fs.corp", "10.0.0.1:445");
    let reply = rig.negotiate(b, "10.0.0.1", "10.0.0.1:445");
    assert!(reply.shared);
    assert_eq!(reply.original_server_addr, Some(sa("10.0.0.1:445")));
}

#[test]
fn test_private_session_not_shared() {
    let rig = TestRig::new();
    let a = rig.open();
    let b = rig.open();
    rig.negotiate(a, "fs.corp", "10.0.0.1:445");
    let reply = rig
        .negotiate_with(
            b,
            NegotiateIoc::new("fs.corp", sa("10.0.0.1:445"))
                .with_user("alice", "CORP")
                .with_private(true),
        )
        .unwrap();
    assert!(!reply.shared);
    assert_eq!(rig.registry.session_manager().session_count(), 2);
}

#[test]
fn test_fatal_session_not_reused() {
    let rig = TestRig::new();
    let a = rig.open();
    let b = rig.open();
    let first = rig.negotiate(a, "fs.corp", "10.0.0.1:445");
    rig.transport.set_fatal(first.session_id);
    let second = rig.negotiate(b, "fs.corp", "10.0.0.1:445");
    assert_ne!(first.session_id, second.session_id);
}

#[test]
fn test_share_reused_and_disconnected_on_last_release() {
    let rig = TestRig::new();
    let a = rig.connected();
    let b = rig.open();
    rig.negotiate(b, "fs.corp", "10.0.0.1:445");
    rig.tree_connect(b, "DATA").unwrap();

    assert_eq!(MockTransport::count(&rig.transport.tree_connects), 1);
    let share = rig.registry.handle(a).unwrap().bound_share().unwrap();
    assert_eq!(share.ref_count(), 2);

    rig.registry.close(a).unwrap();
    assert_eq!(share.ref_count(), 1);
    assert_eq!(MockTransport::count(&rig.transport.tree_disconnects), 0);

    rig.registry.close(b).unwrap();
    assert_eq!(share.ref_count(), 0);
    assert_eq!(MockTransport::count(&rig.transport.tree_disconnects), 1);
    assert_eq!(MockTransport::count(&rig.transport.session_closes), 1);
}

#[test]
fn test_tree_connect_twice_and_disconnect() {
    let rig = TestRig::new();
    let id = rig.connected();
    assert!(matches!(rig.tree_connect(id, "other"), Err(NetsmbError::AlreadyConnected)));

    match rig.registry.ioctl(id, IoctlRequest::ShareProperties(query())).unwrap() {
        IoctlReply::ShareProperties(props) => {
            assert_eq!(props.name, "data");
            assert_eq!(props.ref_count, 1);
        }
        other => panic!("unexpected {:?}", other),
    }

    rig.registry.ioctl(id, IoctlRequest::TreeDisconnect).unwrap();
    assert_eq!(MockTransport::count(&rig.transport.tree_disconnects), 1);
    assert!(matches!(
        rig.registry.ioctl(id, IoctlRequest::TreeDisconnect),
        Err(NetsmbError::NotConnected)
    ));
    assert!(matches!(
        rig.registry.ioctl(id, IoctlRequest::ShareProperties(query())),
        Err(NetsmbError::NotConnected)
    ));
    assert!(rig.registry.handle(id).unwrap().bound_session().is_some());
}

#[test]
fn test_tree_connect_protocol_failure_binds_nothing() {
    let rig = TestRig::new();
    let id = rig.open();
    rig.negotiate(id, "fs.corp", "10.0.0.1:445");
    let res = rig.tree_connect(id, "missing");
    assert!(matches!(res, Err(NetsmbError::Protocol { status: 0xC000_00CC })));
    assert!(rig.registry.handle(id).unwrap().bound_share().is_none());
}

#[test]
fn test_session_setup_preconditions_and_guest() {
    let rig = TestRig::new();
    let id = rig.open();
    let setup = || IoctlRequest::SessionSetup(SessionSetupIoc::new("alice", "CORP", vec![1, 2]));

    assert!(matches!(rig.registry.ioctl(id, setup()), Err(NetsmbError::NotConnected)));

    rig.negotiate(id, "fs.corp", "10.0.0.1:445");
    rig.transport.set_guest(true);
    match rig.registry.ioctl(id, setup()).unwrap() {
        IoctlReply::SessionSetup(reply) => assert!(reply.guest),
        other => panic!("unexpected {:?}", other),
    }
    assert!(rig
        .session(id)
        .flags()
        .contains(netsmb_core::session::SessionFlags::GUEST));

    rig.tree_connect(id, "data").unwrap();
    assert!(matches!(rig.registry.ioctl(id, setup()), Err(NetsmbError::AlreadyConnected)));
}

#[test]
fn test_session_setup_rejected_credentials() {
    let rig = TestRig::new();
    let id = rig.open();
    rig.negotiate(id, "fs.corp", "10.0.0.1:445");
    let res = rig.registry.ioctl(
        id,
        IoctlRequest::SessionSetup(SessionSetupIoc::new("alice", "CORP", Vec::new())),
    );
    assert!(matches!(res, Err(NetsmbError::Protocol { status: 0xC000_006D })));
}

#[test]
fn test_auth_info_sizes() {
    let rig = TestRig::new();
    let id = rig.open();
    rig.negotiate(id, "fs.corp", "10.0.0.1:445");
    rig.registry
        .ioctl(
            id,
            IoctlRequest::SessionSetup(SessionSetupIoc::new("alice", "CORP", vec![1])),
        )
        .unwrap();

    let ask = |client_capacity, server_capacity| {
        match rig
            .registry
            .ioctl(
                id,
                IoctlRequest::AuthInfo(AuthInfoIoc {
                    version: NETSMB_IOC_VERSION,
                    client_capacity,
                    server_capacity,
                }),
            )
            .unwrap()
        {
            IoctlReply::AuthInfo(reply) => reply,
            other => panic!("unexpected {:?}", other),
        }
    };

    let full = ask(64, 64);
    assert_eq!(full.client_principal, b"alice@CORP".to_vec());
    assert_eq!(full.client_size, 10);
    assert_eq!(full.server_principal, b"cifs/fs.corp".to_vec());

    let short = ask(4, 64);
    assert!(short.client_principal.is_empty());
    assert_eq!(short.client_size, 10);
    assert_eq!(short.server_size, 12);
}

#[test]
fn test_network_identity_set_once() {
    let rig = TestRig::new();
    let id = rig.open();
    rig.negotiate(id, "fs.corp", "10.0.0.1:445");
    let identity = || {
        IoctlRequest::NetworkIdentity(NetworkIdentityIoc {
            version: NETSMB_IOC_VERSION,
            identity: NetworkIdentity {
                uid: 501,
                account: "alice".to_string(),
                domain: "CORP".to_string(),
            },
        })
    };
    rig.registry.ioctl(id, identity()).unwrap();
    assert!(matches!(
        rig.registry.ioctl(id, identity()),
        Err(NetsmbError::IdentityAlreadySet)
    ));
}

#[test]
fn test_convert_path_one_direction() {
    let rig = TestRig::new();
    let id = rig.open();
    rig.negotiate(id, "fs.corp", "10.0.0.1:445");
    let convert = |direction, input: &[u8], max_output| {
        rig.registry.ioctl(
            id,
            IoctlRequest::ConvertPath(ConvertPathIoc {
                version: NETSMB_IOC_VERSION,
                direction,
                input: input.to_vec(),
                max_output,
            }),
        )
    };

    let network = match convert(CONVERT_TO_NETWORK, b"a/b", 64).unwrap() {
        IoctlReply::ConvertPath(bytes) => bytes,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(network, vec![b'a', 0, b'\\', 0, b'b', 0]);
    match convert(CONVERT_FROM_NETWORK, &network, 64).unwrap() {
        IoctlReply::ConvertPath(bytes) => assert_eq!(bytes, b"a/b".to_vec()),
        other => panic!("unexpected {:?}", other),
    }

    assert!(matches!(
        convert(CONVERT_TO_NETWORK | CONVERT_FROM_NETWORK, b"a", 64),
        Err(NetsmbError::InvalidArgument { .. })
    ));
    assert!(matches!(convert(0, b"a", 64), Err(NetsmbError::InvalidArgument { .. })));
    assert!(matches!(
        convert(CONVERT_TO_NETWORK, b"abc", 2),
        Err(NetsmbError::CopyFault { .. })
    ));
}

#[test]
fn test_request_status_carried_in_payload() {
    let rig = TestRig::new();
    let id = rig.connected();

    rig.transport.fail_requests(Some(WireError::status(0xC000_000F)));
    let reply = rig
        .registry
        .ioctl(id, IoctlRequest::Read(ReadIoc::new(12, 0, 16)))
        .unwrap();
    assert_eq!(
        reply,
        IoctlReply::Data(DataReply {
            status: 0xC000_000F,
            data: Vec::new(),
        })
    );

    rig.transport.fail_requests(Some(WireError::transport("reset by peer")));
    let res = rig.registry.ioctl(id, IoctlRequest::Read(ReadIoc::new(12, 0, 16)));
    assert!(matches!(res, Err(NetsmbError::Transport { .. })));
}

#[test]
fn test_forwarded_commands_need_share() {
    let rig = TestRig::new();
    let id = rig.open();
    rig.negotiate(id, "fs.corp", "10.0.0.1:445");
    let res = rig.registry.ioctl(id, IoctlRequest::Read(ReadIoc::new(1, 0, 4)));
    assert!(matches!(res, Err(NetsmbError::NotConnected)));
    assert_eq!(MockTransport::count(&rig.transport.requests), 0);
}

#[test]
fn test_read_write_counted_on_main_channel() {
    let rig = TestRig::new();
    let id = rig.connected();
    rig.registry
        .ioctl(id, IoctlRequest::Read(ReadIoc::new(12, 0, 100)))
        .unwrap();
    match rig
        .registry
        .ioctl(id, IoctlRequest::Write(WriteIoc::new(12, 0, vec![1; 40])))
        .unwrap()
    {
        IoctlReply::Write(reply) => assert_eq!((reply.status, reply.written), (0, 40)),
        other => panic!("unexpected {:?}", other),
    }
    let main = rig.session(id).main_channel().unwrap();
    assert_eq!((main.rx_bytes(), main.tx_bytes()), (100, 40));
}

#[test]
fn test_create_reports_tagged_open_state() {
    let rig = TestRig::new();
    let id = rig.connected();
    match rig
        .registry
        .ioctl(id, IoctlRequest::Create(CreateIoc::new("dir", 1, 1, 0x1)))
        .unwrap()
    {
        IoctlReply::Create(reply) => {
            let open = reply.open.unwrap();
            assert!(open.is_directory());
            assert_eq!(open.fid(), 11);
        }
        other => panic!("unexpected {:?}", other),
    }
    match rig
        .registry
        .ioctl(id, IoctlRequest::Create(CreateIoc::new("file.txt", 1, 1, 0)))
        .unwrap()
    {
        IoctlReply::Create(reply) => {
            assert!(matches!(reply.open, Some(OpenState::File(f)) if f.size == 4096));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_query_dir_advances_cursor() {
    let rig = TestRig::new();
    let id = rig.connected();
    let dir = DirectoryState {
        fid: 11,
        ..Default::default()
    };
    match rig
        .registry
        .ioctl(
            id,
            IoctlRequest::QueryDir(QueryDirIoc {
                version: NETSMB_IOC_VERSION,
                dir,
                pattern: "*".to_string(),
                max_entries: 10,
            }),
        )
        .unwrap()
    {
        IoctlReply::QueryDir(reply) => {
            assert_eq!(reply.status, 0);
            assert_eq!(reply.next.fid, 11);
            assert_eq!(reply.next.entries_returned, 2);
            assert!(reply.next.eof);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_cancel_stops_negotiate() {
    let rig = TestRig::new();
    let id = rig.open();
    rig.registry.ioctl(id, IoctlRequest::CancelSession).unwrap();
    let res = rig.negotiate_with(id, NegotiateIoc::new("fs.corp", sa("10.0.0.1:445")));
    assert!(matches!(res, Err(NetsmbError::Cancelled)));
    assert_eq!(MockTransport::count(&rig.transport.negotiates), 0);
}

#[test]
fn test_session_state_follows_transport() {
    let rig = TestRig::new();
    let id = rig.open();
    let reply = rig.negotiate(id, "fs.corp", "10.0.0.1:445");
    assert_eq!(
        rig.registry.ioctl(id, IoctlRequest::SessionState).unwrap(),
        IoctlReply::SessionState { connected: true }
    );
    rig.transport.set_fatal(reply.session_id);
    assert_eq!(
        rig.registry.ioctl(id, IoctlRequest::SessionState).unwrap(),
        IoctlReply::SessionState { connected: false }
    );
}

#[test]
fn test_session_properties_after_negotiate() {
    let rig = TestRig::new();
    let id = rig.open();
    let reply = rig.negotiate(id, "fs.corp", "10.0.0.1:445");

    let props = match rig
        .registry
        .ioctl(id, IoctlRequest::SessionProperties(query()))
        .unwrap()
    {
        IoctlReply::SessionProperties(props) => props,
        other => panic!("unexpected reply {:?}", other),
    };
    assert_eq!(props.session_id, reply.session_id);
    assert_eq!(props.server_name, "fs.corp");
    assert_eq!(props.native_os, "Windows Server");
    assert_eq!(props.native_lanman, "SMB");
    assert_eq!(props.model_info.as_deref(), Some("mock"));
    assert_eq!(props.usable_channels, 1);
    assert_eq!(props.reconnect_count, 0);
}

#[test]
fn test_close_waits_for_inflight_read() {
    let rig = TestRig::new();
    let id = rig.connected();
    let handle = rig.registry.handle(id).unwrap();
    let (entered, release) = rig.transport.gate_next_read();

    let reader = {
        let registry = Arc::clone(&rig.registry);
        thread::spawn(move || registry.ioctl(id, IoctlRequest::Read(ReadIoc::new(12, 0, 32))))
    };
    entered.recv().unwrap();

    let closed = Arc::new(AtomicBool::new(false));
    let closer = {
        let registry = Arc::clone(&rig.registry);
        let closed = Arc::clone(&closed);
        thread::spawn(move || {
            let res = registry.close(id);
            closed.store(true, Ordering::SeqCst);
            res
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!closed.load(Ordering::SeqCst));
    assert!(handle.is_open());

    release.send(()).unwrap();
    let read = reader.join().unwrap().unwrap();
    assert!(matches!(read, IoctlReply::Data(DataReply { status: 0, .. })));
    closer.join().unwrap().unwrap();

    assert!(closed.load(Ordering::SeqCst));
    assert!(!handle.is_open());
    assert!(rig.registry.handle(id).is_none());
    assert_eq!(MockTransport::count(&rig.transport.tree_disconnects), 1);
    assert_eq!(MockTransport::count(&rig.transport.session_closes), 1);
    assert_eq!(rig.registry.session_manager().session_count(), 0);
}

#[test]
fn test_shared_ioctls_run_concurrently() {
    let rig = TestRig::new();
    let id = rig.connected();
    let (entered, release) = rig.transport.gate_next_read();

    let blocked = {
        let registry = Arc::clone(&rig.registry);
        thread::spawn(move || registry.ioctl(id, IoctlRequest::Read(ReadIoc::new(12, 0, 8))))
    };
    entered.recv().unwrap();

    // the gate is spent, so this read goes straight through
    let reply = rig
        .registry
        .ioctl(id, IoctlRequest::Read(ReadIoc::new(12, 8, 8)))
        .unwrap();
    assert!(matches!(reply, IoctlReply::Data(DataReply { status: 0, .. })));
    let props = rig
        .registry
        .ioctl(id, IoctlRequest::SessionProperties(query()))
        .unwrap();
    assert!(matches!(props, IoctlReply::SessionProperties(_)));

    release.send(()).unwrap();
    blocked.join().unwrap().unwrap();
}

#[test]
fn test_other_handles_not_blocked_by_slow_read() {
    let rig = TestRig::new();
    let slow = rig.connected();
    let (entered, release) = rig.transport.gate_next_read();
    let reader = {
        let registry = Arc::clone(&rig.registry);
        thread::spawn(move || registry.ioctl(slow, IoctlRequest::Read(ReadIoc::new(12, 0, 8))))
    };
    entered.recv().unwrap();

    let other = rig.open();
    rig.negotiate(other, "other.corp", "10.0.0.2:445");
    rig.registry.close(other).unwrap();

    release.send(()).unwrap();
    reader.join().unwrap().unwrap();
}

#[test]
fn test_unload_lifecycle() {
    let rig = TestRig::new();
    let id = rig.connected();
    assert!(matches!(rig.registry.unload(), Err(NetsmbError::HandleBusy { .. })));
    rig.registry.close(id).unwrap();
    rig.registry.unload().unwrap();
    assert!(matches!(rig.registry.open(0), Err(NetsmbError::HandleBusy { .. })));
}

#[test]
fn test_device_adapter_reports_errno() {
    let rig = TestRig::new();
    let adapter = DeviceAdapter::new(Arc::clone(&rig.registry));
    assert_eq!(adapter.open(0), Err(libc::EBUSY));
    adapter.open(1).unwrap();

    let (code, mut bytes) = encode_request(&IoctlRequest::SessionProperties(query())).unwrap();
    assert_eq!(code, NETSMB_CMD_SESSION_PROPERTIES);
    assert_eq!(adapter.ioctl(1, code, &bytes), Err(libc::ENOTCONN));

    bytes[0] = 9;
    assert_eq!(adapter.ioctl(1, code, &bytes), Err(libc::EINVAL));
    assert_eq!(adapter.ioctl(1, code, &[]), Err(libc::EFAULT));
    adapter.close(1).unwrap();
    assert_eq!(adapter.close(1), Err(libc::EBADF));
}

#[test]
fn test_full_handle_table_reports_enfile() {
    let rig = TestRig::new();
    let adapter = DeviceAdapter::new(Arc::clone(&rig.registry));
    for _ in 0..64 {
        assert_eq!(adapter.open(0), Err(libc::EBUSY));
    }
    assert_eq!(adapter.open(0), Err(libc::ENFILE));

    adapter.open(5).unwrap();
    adapter.close(5).unwrap();
    assert_eq!(adapter.open(0), Err(libc::EBUSY));
}
