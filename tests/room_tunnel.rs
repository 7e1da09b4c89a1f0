//! Two engine instances in one process meeting through a local rendezvous
//! server, with socket pairs standing in for TUN descriptors.

use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::time::{Duration, Instant};

use terracotta_core::signaling::{RendezvousServer, Role, ServerConfig};
use terracotta_core::{EngineError, InstanceState, NetworkInstance};

/// Run a rendezvous server on its own runtime thread.
fn start_rendezvous() -> SocketAddr {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let server = RendezvousServer::bind(
                "127.0.0.1:0".parse().unwrap(),
                "127.0.0.1:0".parse().unwrap(),
                ServerConfig::default(),
            )
            .await
            .unwrap();
            tx.send(server.local_addr()).unwrap();
            let _ = server.run().await;
        });
    });
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

fn engine_config(server: SocketAddr, name: &str) -> String {
    format!(
        r#"
        instance_name = "{name}"

        [rendezvous]
        server = "{server}"
        timeout_ms = 3000

        [network]
        listen = "127.0.0.1:0"
        packet_info = false

        [keepalive]
        interval_ms = 200
        timeout_ms = 2000
        "#
    )
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet[20..].copy_from_slice(payload);
    packet
}

#[test]
fn test_create_join_and_deliver_packet() {
    let server = start_rendezvous();

    let host = NetworkInstance::new();
    let joiner = NetworkInstance::new();
    host.run(&engine_config(server, "host")).unwrap();
    joiner.run(&engine_config(server, "joiner")).unwrap();

    let (host_app, host_tun) = UnixDatagram::pair().unwrap();
    let (joiner_app, joiner_tun) = UnixDatagram::pair().unwrap();
    host.set_tun_fd(host_tun.as_raw_fd()).unwrap();
    joiner.set_tun_fd(joiner_tun.as_raw_fd()).unwrap();

    let code = host.create_room("lan party").unwrap();
    assert!(code.starts_with("U/"));
    joiner.join_room(&code.to_lowercase()).unwrap();

    let joined = joiner.session_snapshot().unwrap();
    assert_eq!(joined.code, code);
    assert_eq!(joined.role, Role::Joiner);
    assert_eq!(joined.name.as_deref(), Some("lan party"));
    assert_eq!(joined.peers.len(), 1);
    let host_ip = joined.peers[0].virtual_ip.unwrap();
    let joiner_ip = joined.virtual_ip.unwrap();
    assert_eq!(host_ip, Ipv4Addr::new(10, 144, 144, 1));
    assert_eq!(joiner_ip, Ipv4Addr::new(10, 144, 144, 2));

    wait_for("host to see the joiner", || {
        host.session_snapshot()
            .map(|s| s.peers.len() == 1 && s.peers[0].virtual_ip == Some(joiner_ip))
            .unwrap_or(false)
    });
    assert_eq!(host.session_snapshot().unwrap().role, Role::Host);

    let info: serde_json::Value = serde_json::from_str(&host.running_info().unwrap()).unwrap();
    assert_eq!(info["state"], "running");
    assert_eq!(info["tun_attached"], true);
    assert_eq!(info["room"]["code"], code.as_str());

    // Paths settle asynchronously; resend until one copy gets through.
    let packet = ipv4_packet(host_ip, joiner_ip, b"hello over the room");
    joiner_app
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let mut buf = [0u8; 2048];
    let deadline = Instant::now() + Duration::from_secs(5);
    let received = loop {
        assert!(Instant::now() < deadline, "packet never arrived");
        host_app.send(&packet).unwrap();
        if let Ok(n) = joiner_app.recv(&mut buf) {
            break buf[..n].to_vec();
        }
    };
    assert_eq!(received, packet);

    let stats = joiner.stats().unwrap();
    assert!(stats.packets_written >= 1);
    assert!(host.stats().unwrap().tun_packets_read >= 1);

    // The host leaving closes the room for everyone.
    host.stop().unwrap();
    assert_eq!(host.state(), InstanceState::Stopped);
    wait_for("joiner to drop the closed room", || {
        joiner.session_snapshot().is_none()
    });
    assert!(joiner.latest_error().unwrap().contains("expired"));
    assert_eq!(joiner.state(), InstanceState::Running);

    // The code of the closed room now answers "expired".
    let err = joiner.join_room(&code).unwrap_err();
    assert!(matches!(err, EngineError::RoomExpired(_)), "{:?}", err);

    joiner.stop().unwrap();
    assert_eq!(joiner.state(), InstanceState::Stopped);
}

#[test]
fn test_join_unknown_room() {
    let server = start_rendezvous();
    let instance = NetworkInstance::new();
    instance.run(&engine_config(server, "lonely")).unwrap();

    let err = instance.join_room("U/0000-0000-0000-0000").unwrap_err();
    assert!(matches!(err, EngineError::RoomNotFound(_)));
    assert_eq!(err.code(), -7);
    assert!(instance.session_snapshot().is_none());
    assert!(instance.latest_error().unwrap().contains("not found"));

    instance.stop().unwrap();
}

#[test]
fn test_create_again_replaces_room() {
    let server = start_rendezvous();
    let instance = NetworkInstance::new();
    instance.run(&engine_config(server, "mover")).unwrap();

    let first = instance.create_room("first").unwrap();
    let second = instance.create_room("second").unwrap();
    assert_ne!(first, second);
    let snapshot = instance.session_snapshot().unwrap();
    assert_eq!(snapshot.code, second);
    assert_eq!(snapshot.name.as_deref(), Some("second"));

    // Leaving the first room closed it.
    let other = NetworkInstance::new();
    other.run(&engine_config(server, "late")).unwrap();
    let err = other.join_room(&first).unwrap_err();
    assert!(matches!(err, EngineError::RoomExpired(_)), "{:?}", err);

    let err = instance.create_room("  ").unwrap_err();
    assert!(matches!(err, EngineError::NameRejected(_)));

    other.stop().unwrap();
    instance.stop().unwrap();
}
