//! UDP packet transport.
//!
//! One socket carries everything: data frames to peers (direct or through
//! the relay), keepalives, hole-punch frames and relay registration. The
//! transport outlives sessions; the instance swaps the current session in
//! and out of the shared [`SessionSlot`].

pub mod frame;

use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{EngineError, EngineResult};
use crate::session::{PeerHandle, PeerPath, Route, Session};
use frame::{FrameHeader, FrameKind, RELAY_ID};

/// Largest datagram we accept. Comfortably above any configurable MTU plus
/// the frame header.
const MAX_DATAGRAM: usize = 9216;

/// Data-plane counters.
///
/// These atomic counters replace per-packet logging on the hot paths.
#[derive(Debug, Default)]
pub struct TunnelStats {
    /// Packets read from the TUN descriptor.
    pub tun_packets_read: AtomicU64,
    /// Data frames sent to peers (one per destination).
    pub packets_sent: AtomicU64,
    /// Outbound packets fanned out to every peer.
    pub packets_broadcast: AtomicU64,
    /// Outbound packets dropped with nobody to send them to.
    pub packets_no_route: AtomicU64,
    /// Data frames accepted from room members.
    pub packets_received: AtomicU64,
    /// Packets written to the TUN descriptor.
    pub packets_written: AtomicU64,
    /// Frames dropped: malformed, unknown sender, or inbound queue full.
    pub packets_dropped: AtomicU64,
}

/// Plain copy of [`TunnelStats`] for reporting.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tun_packets_read: u64,
    pub packets_sent: u64,
    pub packets_broadcast: u64,
    pub packets_no_route: u64,
    pub packets_received: u64,
    pub packets_written: u64,
    pub packets_dropped: u64,
}

impl TunnelStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tun_packets_read: self.tun_packets_read.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_broadcast: self.packets_broadcast.load(Ordering::Relaxed),
            packets_no_route: self.packets_no_route.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_written: self.packets_written.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
        }
    }
}

/// The session currently attached to the transport, if any.
#[derive(Debug, Clone, Default)]
pub struct SessionSlot(Arc<RwLock<Option<Arc<Session>>>>);

impl SessionSlot {
    pub fn get(&self) -> Option<Arc<Session>> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, session: Option<Arc<Session>>) -> Option<Arc<Session>> {
        let mut slot = self.0.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, session)
    }
}

/// Timing knobs of the transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub inbound_queue: usize,
}

/// Receiving end of the inbound data channel. Shared so a bridge restarted
/// on a new descriptor picks up where the previous one stopped.
pub type InboundReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Bytes>>>;

pub struct PacketTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    slot: SessionSlot,
    stats: Arc<TunnelStats>,
    inbound_rx: InboundReceiver,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    runtime: Handle,
}

impl PacketTransport {
    /// Bind the socket and spawn the receive and keepalive loops on the
    /// current runtime.
    pub async fn bind(listen: SocketAddr, config: TransportConfig) -> EngineResult<Arc<Self>> {
        let socket = UdpSocket::bind(listen)
            .await
            .map_err(|e| EngineError::InitFailure(format!("bind {}: {}", listen, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| EngineError::InitFailure(e.to_string()))?;
        log::info!("Packet transport bound to {}", local_addr);

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let transport = Arc::new(Self {
            socket: Arc::new(socket),
            local_addr,
            slot: SessionSlot::default(),
            stats: Arc::new(TunnelStats::default()),
            inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            runtime: Handle::current(),
        });

        let recv_task = tokio::spawn(run_receive_loop(
            transport.clone(),
            inbound_tx,
            shutdown_rx.clone(),
        ));
        let keepalive_task = tokio::spawn(run_keepalive_loop(
            transport.clone(),
            config,
            shutdown_rx,
        ));
        transport
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([recv_task, keepalive_task]);

        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<TunnelStats> {
        self.stats.clone()
    }

    pub fn inbound(&self) -> InboundReceiver {
        self.inbound_rx.clone()
    }

    /// Attach a session and start reaching its members in the background.
    /// Returns the session it replaced.
    pub fn attach_session(self: &Arc<Self>, session: Arc<Session>) -> Option<Arc<Session>> {
        let previous = self.slot.replace(Some(session.clone()));
        let transport = self.clone();
        self.runtime.spawn(async move {
            transport.register(&session).await;
            transport.punch(&session).await;
        });
        previous
    }

    pub fn detach_session(&self) -> Option<Arc<Session>> {
        self.slot.replace(None)
    }

    /// Addresses at which peers may reach this socket directly.
    pub fn candidates(&self) -> Vec<SocketAddr> {
        let port = self.local_addr.port();
        if !self.local_addr.ip().is_unspecified() {
            return vec![self.local_addr];
        }
        match get_if_addrs::get_if_addrs() {
            Ok(ifaces) => ifaces
                .into_iter()
                .filter(|iface| !iface.is_loopback())
                .filter_map(|iface| match iface.ip() {
                    IpAddr::V4(v4) => Some(SocketAddr::new(IpAddr::V4(v4), port)),
                    IpAddr::V6(_) => None,
                })
                .collect(),
            Err(e) => {
                log::warn!("Failed to enumerate interfaces: {}", e);
                Vec::new()
            }
        }
    }

    /// Route one packet read from the TUN descriptor and send it.
    pub async fn send_packet(&self, packet: &[u8]) {
        let Some(session) = self.slot.get() else {
            self.stats.packets_no_route.fetch_add(1, Ordering::Relaxed);
            return;
        };

        match session.route_outbound(packet) {
            Route::Unicast(handle) => {
                self.send_frame(&session, FrameKind::Data, handle, packet).await;
            }
            Route::Broadcast(handles) => {
                self.stats.packets_broadcast.fetch_add(1, Ordering::Relaxed);
                for handle in handles {
                    self.send_frame(&session, FrameKind::Data, handle, packet).await;
                }
            }
            Route::Drop => {
                self.stats.packets_no_route.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn send_frame(
        &self,
        session: &Session,
        kind: FrameKind,
        peer: PeerHandle,
        payload: &[u8],
    ) {
        let target = match peer.path {
            PeerPath::Direct(addr) => addr,
            PeerPath::Relay => session.relay_addr(),
        };
        let datagram = FrameHeader::new(kind, session.local_id(), peer.peer_id).encode(payload);
        match self.socket.send_to(&datagram, target).await {
            Ok(_) => {
                if kind == FrameKind::Data {
                    self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => log::debug!("send {:?} to peer {} via {}: {}", kind, peer.peer_id, target, e),
        }
    }

    /// Tell the relay where this member is reachable.
    async fn register(&self, session: &Session) {
        let datagram = FrameHeader::new(FrameKind::Register, session.local_id(), RELAY_ID)
            .encode(session.room_code().as_bytes());
        if let Err(e) = self.socket.send_to(&datagram, session.relay_addr()).await {
            log::debug!("relay register via {}: {}", session.relay_addr(), e);
        }
    }

    /// Punch every candidate of peers still behind the relay.
    async fn punch(&self, session: &Session) {
        for (peer_id, candidates) in session.punch_targets() {
            let datagram =
                FrameHeader::new(FrameKind::Punch, session.local_id(), peer_id).encode(&[]);
            for addr in candidates {
                if let Err(e) = self.socket.send_to(&datagram, addr).await {
                    log::debug!("punch peer {} at {}: {}", peer_id, addr, e);
                }
            }
        }
    }

    /// Stop both loops and drop the session.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.slot.replace(None);
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }

    async fn handle_datagram(
        &self,
        datagram: &[u8],
        from: SocketAddr,
        inbound_tx: &mpsc::Sender<Bytes>,
    ) {
        let (header, payload) = match FrameHeader::decode(datagram) {
            Ok(parts) => parts,
            Err(e) => {
                log::debug!("Ignoring datagram from {}: {}", from, e);
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let Some(session) = self.slot.get() else {
            return;
        };
        if header.dst != session.local_id() {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let via_relay = from == session.relay_addr();
        let direct_from = if via_relay { None } else { Some(from) };
        if !session.touch(header.src, direct_from) {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let reply_to = PeerHandle {
            peer_id: header.src,
            path: match direct_from {
                Some(addr) => PeerPath::Direct(addr),
                None => PeerPath::Relay,
            },
        };

        match header.kind {
            FrameKind::Data => {
                if !session.learn_inbound(header.src, payload) {
                    self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
                if inbound_tx.try_send(Bytes::copy_from_slice(payload)).is_err() {
                    self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            FrameKind::Keepalive => {
                self.send_frame(&session, FrameKind::KeepaliveAck, reply_to, &[]).await;
            }
            FrameKind::Punch => {
                self.send_frame(&session, FrameKind::PunchAck, reply_to, &[]).await;
            }
            FrameKind::KeepaliveAck | FrameKind::PunchAck => {}
            FrameKind::Register => {
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Drop for PacketTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_receive_loop(
    transport: Arc<PacketTransport>,
    inbound_tx: mpsc::Sender<Bytes>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let socket = transport.socket.clone();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, from)) => transport.handle_datagram(&buf[..n], from, &inbound_tx).await,
                    // ICMP errors surface here on some platforms; the socket
                    // itself is fine.
                    Err(e) => log::debug!("UDP receive error: {}", e),
                }
            }
        }
    }
    log::debug!("Receive loop stopped");
}

async fn run_keepalive_loop(
    transport: Arc<PacketTransport>,
    config: TransportConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.keepalive_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(session) = transport.slot.get() else {
                    continue;
                };
                for peer_id in session.expire_stale(config.keepalive_timeout) {
                    log::info!(
                        "Peer {} lost (no traffic for {:?})",
                        peer_id,
                        config.keepalive_timeout
                    );
                }
                transport.register(&session).await;
                for handle in session.handles() {
                    transport.send_frame(&session, FrameKind::Keepalive, handle, &[]).await;
                }
                transport.punch(&session).await;
            }
        }
    }
    log::debug!("Keepalive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ipv4_packet;
    use crate::session::{PeerInfo, Role, SessionParams};
    use std::net::Ipv4Addr;

    fn test_config() -> TransportConfig {
        TransportConfig {
            keepalive_interval: Duration::from_millis(50),
            keepalive_timeout: Duration::from_millis(500),
            inbound_queue: 16,
        }
    }

    fn session_for(
        local: u64,
        ip: [u8; 4],
        peer: u64,
        peer_ip: [u8; 4],
        relay: SocketAddr,
    ) -> Arc<Session> {
        let session = Session::new(
            SessionParams {
                room_code: "U/TEST-TEST-TEST-TEST".into(),
                room_name: None,
                role: if local == 1 { Role::Host } else { Role::Joiner },
                local_id: local,
                virtual_ip: Some(Ipv4Addr::from(ip)),
                subnet: Some("10.144.144.0/24".parse().unwrap()),
                relay_addr: relay,
            },
            vec![],
        );
        session.upsert_peer(PeerInfo {
            peer_id: peer,
            role: Role::Joiner,
            virtual_ip: Some(Ipv4Addr::from(peer_ip)),
            candidates: vec![],
        });
        Arc::new(session)
    }

    #[tokio::test]
    async fn test_candidates_for_specific_bind() {
        let transport = PacketTransport::bind("127.0.0.1:0".parse().unwrap(), test_config())
            .await
            .unwrap();
        assert_eq!(transport.candidates(), vec![transport.local_addr()]);
        transport.shutdown();
    }

    #[tokio::test]
    async fn test_direct_delivery_between_transports() {
        let a = PacketTransport::bind("127.0.0.1:0".parse().unwrap(), test_config())
            .await
            .unwrap();
        let b = PacketTransport::bind("127.0.0.1:0".parse().unwrap(), test_config())
            .await
            .unwrap();

        // Point the "relay" of each side at the other so frames arrive
        // without a real relay in between.
        let sa = session_for(1, [10, 144, 144, 1], 2, [10, 144, 144, 2], b.local_addr());
        let sb = session_for(2, [10, 144, 144, 2], 1, [10, 144, 144, 1], a.local_addr());
        a.attach_session(sa.clone());
        b.attach_session(sb.clone());

        let packet = ipv4_packet(
            Ipv4Addr::new(10, 144, 144, 1),
            Ipv4Addr::new(10, 144, 144, 2),
            b"hello over udp",
        );
        a.send_packet(&packet).await;

        let inbound = b.inbound();
        let received = tokio::time::timeout(Duration::from_secs(2), async {
            inbound.lock().await.recv().await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&received[..], &packet[..]);
        assert_eq!(b.stats().snapshot().packets_received, 1);
        assert_eq!(a.stats().snapshot().packets_sent, 1);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_sender_is_dropped() {
        let a = PacketTransport::bind("127.0.0.1:0".parse().unwrap(), test_config())
            .await
            .unwrap();
        let relay = "127.0.0.1:9".parse().unwrap();
        let session = session_for(1, [10, 144, 144, 1], 2, [10, 144, 144, 2], relay);
        a.attach_session(session);

        let stranger = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let datagram = FrameHeader::new(FrameKind::Data, 77, 1).encode(&ipv4_packet(
            Ipv4Addr::new(10, 144, 144, 9),
            Ipv4Addr::new(10, 144, 144, 1),
            b"x",
        ));
        stranger.send_to(&datagram, a.local_addr()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = a.stats().snapshot();
        assert_eq!(stats.packets_received, 0);
        assert!(stats.packets_dropped >= 1);
        a.shutdown();
    }

    #[tokio::test]
    async fn test_send_without_session_counts_no_route() {
        let a = PacketTransport::bind("127.0.0.1:0".parse().unwrap(), test_config())
            .await
            .unwrap();
        a.send_packet(&[0x45; 20]).await;
        assert_eq!(a.stats().snapshot().packets_no_route, 1);
        a.shutdown();
    }
}
