//! Room membership and virtual-IP routing.
//!
//! A [`Session`] is created by a successful create/join and lives until the
//! room is left. The peer set is an ordered map behind a `RwLock`; the
//! routing table is a `DashMap` so the data-plane pumps never contend with
//! control-plane updates for long.

use dashmap::DashMap;
use ipnet::Ipv4Net;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::packet;
pub use crate::signaling::protocol::{PeerId, PeerInfo, Role};

/// How frames currently reach a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPath {
    /// Hole-punched; frames go straight to this address.
    Direct(SocketAddr),
    /// Frames go through the rendezvous relay.
    Relay,
}

impl fmt::Display for PeerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerPath::Direct(addr) => write!(f, "direct {}", addr),
            PeerPath::Relay => write!(f, "relay"),
        }
    }
}

/// A peer id with the path to use for it right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHandle {
    pub peer_id: PeerId,
    pub path: PeerPath,
}

/// Outcome of routing one outbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Unicast(PeerHandle),
    Broadcast(Vec<PeerHandle>),
    /// Not an IP packet, or nobody to send it to.
    Drop,
}

#[derive(Debug)]
struct PeerEntry {
    role: Role,
    virtual_ip: Option<Ipv4Addr>,
    candidates: Vec<SocketAddr>,
    path: PeerPath,
    alive: bool,
    last_seen: Instant,
}

impl PeerEntry {
    fn handle(&self, peer_id: PeerId) -> PeerHandle {
        PeerHandle {
            peer_id,
            path: self.path,
        }
    }
}

/// Parameters fixed when the room is entered.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub room_code: String,
    pub room_name: Option<String>,
    pub role: Role,
    pub local_id: PeerId,
    pub virtual_ip: Option<Ipv4Addr>,
    pub subnet: Option<Ipv4Net>,
    /// UDP relay of the rendezvous service.
    pub relay_addr: SocketAddr,
}

/// Membership in one room.
#[derive(Debug)]
pub struct Session {
    params: SessionParams,
    peers: RwLock<BTreeMap<PeerId, PeerEntry>>,
    routes: DashMap<IpAddr, PeerId>,
}

/// Serializable view of a peer, used in running info.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub role: Role,
    pub virtual_ip: Option<Ipv4Addr>,
    pub path: String,
    pub alive: bool,
    pub last_seen_ms: u64,
}

/// Serializable view of a session, used in running info.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub code: String,
    pub name: Option<String>,
    pub role: Role,
    pub peer_id: PeerId,
    pub virtual_ip: Option<Ipv4Addr>,
    pub peers: Vec<PeerSnapshot>,
}

impl Session {
    /// Create a session seeded with the members already in the room.
    pub fn new(params: SessionParams, peers: Vec<PeerInfo>) -> Self {
        let session = Self {
            params,
            peers: RwLock::new(BTreeMap::new()),
            routes: DashMap::new(),
        };
        for peer in peers {
            session.upsert_peer(peer);
        }
        session
    }

    pub fn room_code(&self) -> &str {
        &self.params.room_code
    }

    pub fn local_id(&self) -> PeerId {
        self.params.local_id
    }

    pub fn virtual_ip(&self) -> Option<Ipv4Addr> {
        self.params.virtual_ip
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.params.relay_addr
    }

    /// Add a peer, or refresh what the rendezvous service knows about it.
    /// Path and liveness of a known peer are kept.
    pub fn upsert_peer(&self, info: PeerInfo) {
        if info.peer_id == self.params.local_id {
            return;
        }
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get_mut(&info.peer_id) {
            Some(entry) => {
                if entry.virtual_ip != info.virtual_ip {
                    if let Some(old) = entry.virtual_ip {
                        self.routes
                            .remove_if(&IpAddr::V4(old), |_, id| *id == info.peer_id);
                    }
                }
                entry.role = info.role;
                entry.virtual_ip = info.virtual_ip;
                entry.candidates = info.candidates;
            }
            None => {
                peers.insert(
                    info.peer_id,
                    PeerEntry {
                        role: info.role,
                        virtual_ip: info.virtual_ip,
                        candidates: info.candidates,
                        path: PeerPath::Relay,
                        alive: true,
                        last_seen: Instant::now(),
                    },
                );
            }
        }
        if let Some(ip) = info.virtual_ip {
            self.routes.insert(IpAddr::V4(ip), info.peer_id);
        }
    }

    /// Remove a peer and every route pointing at it.
    pub fn remove_peer(&self, peer_id: PeerId) -> bool {
        let removed = self
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&peer_id)
            .is_some();
        self.routes.retain(|_, id| *id != peer_id);
        removed
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Record that `peer_id` was heard from. `direct_from` is the sender
    /// address when the frame did not come through the relay.
    ///
    /// Returns false for unknown peers.
    pub fn touch(&self, peer_id: PeerId, direct_from: Option<SocketAddr>) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = peers.get_mut(&peer_id) else {
            return false;
        };
        entry.last_seen = Instant::now();
        if !entry.alive {
            entry.alive = true;
            if let Some(ip) = entry.virtual_ip {
                self.routes.insert(IpAddr::V4(ip), peer_id);
            }
            log::info!("Peer {} is reachable again", peer_id);
        }
        if let Some(addr) = direct_from {
            if entry.path != PeerPath::Direct(addr) {
                log::info!("Peer {} reachable directly at {}", peer_id, addr);
                entry.path = PeerPath::Direct(addr);
            }
        }
        true
    }

    /// Refresh the route for the source address of an inbound data packet.
    ///
    /// Returns false when the sender is not a member of the room.
    pub fn learn_inbound(&self, peer_id: PeerId, packet: &[u8]) -> bool {
        if !self.contains(peer_id) {
            return false;
        }
        if let Some(src) = packet::source_ip(packet) {
            if self.params.virtual_ip.map(IpAddr::V4) != Some(src) {
                self.routes.insert(src, peer_id);
            }
        }
        true
    }

    /// Decide where an outbound packet goes.
    pub fn route_outbound(&self, packet: &[u8]) -> Route {
        let Some(dest) = packet::dest_ip(packet) else {
            return Route::Drop;
        };

        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());

        if !packet::is_broadcast_like(dest, self.params.subnet) {
            if let Some(peer_id) = self.routes.get(&dest).map(|r| *r) {
                if let Some(entry) = peers.get(&peer_id).filter(|e| e.alive) {
                    return Route::Unicast(entry.handle(peer_id));
                }
            }
        }

        let alive: Vec<PeerHandle> = peers
            .iter()
            .filter(|(_, e)| e.alive)
            .map(|(id, e)| e.handle(*id))
            .collect();
        if alive.is_empty() {
            Route::Drop
        } else {
            Route::Broadcast(alive)
        }
    }

    /// Mark peers not heard from within `timeout` as lost. Their routes are
    /// removed and their path falls back to the relay.
    pub fn expire_stale(&self, timeout: Duration) -> Vec<PeerId> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let mut lost = Vec::new();
        for (id, entry) in peers.iter_mut() {
            if entry.alive && entry.last_seen.elapsed() > timeout {
                entry.alive = false;
                entry.path = PeerPath::Relay;
                lost.push(*id);
            }
        }
        drop(peers);
        for id in &lost {
            self.routes.retain(|_, peer| peer != id);
        }
        lost
    }

    /// Every member, alive or not.
    pub fn handles(&self) -> Vec<PeerHandle> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, e)| e.handle(*id))
            .collect()
    }

    /// Candidates of peers that are still reached through the relay.
    pub fn punch_targets(&self) -> Vec<(PeerId, Vec<SocketAddr>)> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, e)| e.path == PeerPath::Relay && !e.candidates.is_empty())
            .map(|(id, e)| (*id, e.candidates.clone()))
            .collect()
    }

    pub fn route_for(&self, ip: IpAddr) -> Option<PeerId> {
        self.routes.get(&ip).map(|r| *r)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        SessionSnapshot {
            code: self.params.room_code.clone(),
            name: self.params.room_name.clone(),
            role: self.params.role,
            peer_id: self.params.local_id,
            virtual_ip: self.params.virtual_ip,
            peers: peers
                .iter()
                .map(|(id, e)| PeerSnapshot {
                    peer_id: *id,
                    role: e.role,
                    virtual_ip: e.virtual_ip,
                    path: e.path.to_string(),
                    alive: e.alive,
                    last_seen_ms: e.last_seen.elapsed().as_millis() as u64,
                })
                .collect(),
        }
    }
}
