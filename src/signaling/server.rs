//! Rendezvous server.
//!
//! Keeps the room registry, hands out room codes and virtual IPs, tells
//! members about each other, and relays frames between members of the same
//! room until they reach each other directly.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use ipnet::Ipv4Net;
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, RwLock};

use super::framing::{read_message, write_message};
use super::protocol::*;
use crate::config::DEFAULT_ROOM_NETWORK;
use crate::transport::frame::{FrameHeader, FrameKind, RELAY_ID};

/// Room code alphabet: digits and upper-case letters without I and O.
const CODE_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKLMNPQRSTUVWXYZ";
const CODE_GROUPS: usize = 4;
const CODE_GROUP_LEN: usize = 4;

/// Per-connection notification queue depth.
const NOTIFY_QUEUE: usize = 64;

/// Largest relayed datagram.
const MAX_RELAY_DATAGRAM: usize = 9216;

/// Server tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Rooms older than this are expired on the next join attempt.
    pub room_ttl: Duration,
    /// How long the code of a closed room keeps answering "expired"
    /// instead of "not found".
    pub tombstone_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            room_ttl: Duration::from_secs(24 * 60 * 60),
            tombstone_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Generate a room code such as `U/7K3D-QX9A-M2PL-HT4R`.
pub fn generate_room_code<R: Rng>(rng: &mut R) -> String {
    let mut code = String::with_capacity(2 + CODE_GROUPS * (CODE_GROUP_LEN + 1));
    code.push_str("U/");
    for group in 0..CODE_GROUPS {
        if group > 0 {
            code.push('-');
        }
        for _ in 0..CODE_GROUP_LEN {
            let idx = rng.gen_range(0..CODE_ALPHABET.len());
            code.push(CODE_ALPHABET[idx] as char);
        }
    }
    code
}

/// IP address pool of one room. The host gets the first usable address,
/// joiners the following ones; released addresses are reused first.
#[derive(Debug)]
struct IpPool {
    network: Ipv4Net,
    host_ip: Ipv4Addr,
    next_ip: u32,
    max_ip: u32,
    released: Vec<Ipv4Addr>,
}

impl IpPool {
    fn new(network: Ipv4Net) -> Self {
        let net_addr: u32 = network.network().into();
        let broadcast: u32 = network.broadcast().into();

        Self {
            network,
            host_ip: Ipv4Addr::from(net_addr + 1),
            next_ip: net_addr + 2,
            max_ip: broadcast - 1, // Exclude broadcast address
            released: Vec::new(),
        }
    }

    fn host_ip(&self) -> Ipv4Addr {
        self.host_ip
    }

    fn allocate(&mut self) -> Option<Ipv4Addr> {
        if let Some(ip) = self.released.pop() {
            return Some(ip);
        }
        if self.next_ip > self.max_ip {
            return None; // Pool exhausted
        }
        let ip = Ipv4Addr::from(self.next_ip);
        self.next_ip += 1;
        Some(ip)
    }

    fn release(&mut self, ip: Ipv4Addr) {
        if ip != self.host_ip && self.network.contains(&ip) && !self.released.contains(&ip) {
            self.released.push(ip);
        }
    }
}

struct Member {
    info: PeerInfo,
    /// Address the relay observed in the member's last `Register`.
    reflexive: Option<SocketAddr>,
    /// The reflexive address is not one the member reported itself.
    reflexive_appended: bool,
    tx: mpsc::Sender<JsonRpcNotification>,
}

struct Room {
    name: String,
    host: PeerId,
    created_at: Instant,
    pool: IpPool,
    members: BTreeMap<PeerId, Member>,
}

impl Room {
    /// Queue a notification for every member except `except`.
    fn notify_others(&self, except: PeerId, notification: &JsonRpcNotification) {
        for (id, member) in &self.members {
            if *id == except {
                continue;
            }
            if let Err(e) = member.tx.try_send(notification.clone()) {
                warn!("Dropping '{}' for peer {}: {}", notification.method, id, e);
            }
        }
    }
}

struct ServerState {
    rooms: HashMap<String, Room>,
    /// Codes of closed rooms and when they closed.
    tombstones: HashMap<String, Instant>,
    /// Peer id → room code, for every current member.
    members: HashMap<PeerId, String>,
    next_peer_id: PeerId,
}

impl ServerState {
    fn new() -> Self {
        Self {
            rooms: HashMap::new(),
            tombstones: HashMap::new(),
            members: HashMap::new(),
            // 0 is the relay
            next_peer_id: 1,
        }
    }

    fn allocate_peer_id(&mut self) -> PeerId {
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        id
    }

    fn prune_tombstones(&mut self, ttl: Duration) {
        self.tombstones.retain(|_, closed_at| closed_at.elapsed() < ttl);
    }

    fn unique_code(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let code = generate_room_code(&mut rng);
            if !self.rooms.contains_key(&code) && !self.tombstones.contains_key(&code) {
                return code;
            }
        }
    }

    /// Close a room: every remaining member gets `room_closed`, the code is
    /// tombstoned.
    fn close_room(&mut self, code: &str, reason: &str) {
        let Some(room) = self.rooms.remove(code) else {
            return;
        };
        match JsonRpcNotification::new(
            NOTIFY_ROOM_CLOSED,
            RoomClosedParams {
                room_code: code.to_string(),
                reason: reason.to_string(),
            },
        ) {
            Ok(notification) => room.notify_others(RELAY_ID, &notification),
            Err(e) => error!("Failed to encode room_closed: {}", e),
        }
        for id in room.members.keys() {
            self.members.remove(id);
        }
        self.tombstones.insert(code.to_string(), Instant::now());
        info!("Room {} ('{}') closed: {}", code, room.name, reason);
    }

    /// Remove a member from its room. A leaving host closes the room.
    fn leave(&mut self, peer_id: PeerId) {
        let Some(code) = self.members.remove(&peer_id) else {
            return;
        };
        let Some(room) = self.rooms.get_mut(&code) else {
            return;
        };
        if room.host == peer_id {
            room.members.remove(&peer_id);
            self.close_room(&code, "host left");
            return;
        }
        if let Some(member) = room.members.remove(&peer_id) {
            if let Some(ip) = member.info.virtual_ip {
                room.pool.release(ip);
            }
            match JsonRpcNotification::new(NOTIFY_PEER_LEFT, PeerLeftParams { peer_id }) {
                Ok(notification) => room.notify_others(peer_id, &notification),
                Err(e) => error!("Failed to encode peer_left: {}", e),
            }
            info!("Peer {} left room {}", peer_id, code);
        }
    }
}

/// Rendezvous server bound to its TCP and UDP sockets.
pub struct RendezvousServer {
    listener: TcpListener,
    relay: Arc<UdpSocket>,
    state: Arc<RwLock<ServerState>>,
    config: Arc<ServerConfig>,
}

impl RendezvousServer {
    pub async fn bind(
        bind: SocketAddr,
        relay_bind: SocketAddr,
        config: ServerConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("Failed to bind rendezvous endpoint {}", bind))?;
        let relay = UdpSocket::bind(relay_bind)
            .await
            .with_context(|| format!("Failed to bind relay {}", relay_bind))?;
        Ok(Self {
            listener,
            relay: Arc::new(relay),
            state: Arc::new(RwLock::new(ServerState::new())),
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    /// Serve until the task is dropped.
    pub async fn run(self) -> Result<()> {
        info!(
            "Rendezvous server listening on {} (relay {})",
            self.local_addr(),
            self.relay_addr()
        );

        let relay_port = self.relay_addr().port();
        tokio::spawn(run_relay(self.relay.clone(), self.state.clone()));

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("Client connected from {}", peer_addr);
                    let state = self.state.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        let served =
                            handle_client(stream, peer_addr, relay_port, state, config).await;
                        if let Err(e) = served {
                            debug!("Client {} disconnected: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Per-connection context.
struct Connection {
    peer_addr: SocketAddr,
    relay_port: u16,
    peer_id: Option<PeerId>,
    tx: mpsc::Sender<JsonRpcNotification>,
}

/// Handle a single client connection
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    relay_port: u16,
    state: Arc<RwLock<ServerState>>,
    config: Arc<ServerConfig>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<JsonRpcNotification>(NOTIFY_QUEUE);

    // A dedicated reader keeps partially read frames safe from select!.
    let (req_tx, mut req_rx) = mpsc::channel::<Result<JsonRpcRequest>>(NOTIFY_QUEUE);
    let reader_task = tokio::spawn(async move {
        loop {
            let msg = read_message::<_, JsonRpcRequest>(&mut reader).await;
            let failed = msg.is_err();
            if req_tx.send(msg).await.is_err() || failed {
                break;
            }
        }
    });

    let mut conn = Connection {
        peer_addr,
        relay_port,
        peer_id: None,
        tx,
    };
    let mut loop_error: Option<anyhow::Error> = None;

    loop {
        tokio::select! {
            request = req_rx.recv() => {
                let request = match request {
                    Some(Ok(request)) => request,
                    Some(Err(e)) => {
                        loop_error = Some(anyhow!("Read error: {}", e));
                        break;
                    }
                    None => break,
                };
                let response = handle_request(&request, &mut conn, &state, &config).await;
                if let Some(id) = request.id {
                    let resp = match response {
                        Ok(result) => JsonRpcResponse::success(id, result),
                        Err(error) => JsonRpcResponse::error(id, error),
                    };
                    if let Err(e) = write_message(&mut writer, &resp).await {
                        loop_error = Some(anyhow!("Write error: {}", e));
                        break;
                    }
                }
            }
            Some(notification) = rx.recv() => {
                if let Err(e) = write_message(&mut writer, &notification).await {
                    loop_error = Some(anyhow!("Write error: {}", e));
                    break;
                }
            }
        }
    }

    reader_task.abort();

    // Cleanup: a dropped connection leaves its room
    if let Some(peer_id) = conn.peer_id {
        state.write().await.leave(peer_id);
    }

    match loop_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    request: &JsonRpcRequest,
) -> Result<T, JsonRpcError> {
    serde_json::from_value(
        request
            .params
            .clone()
            .ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?,
    )
    .map_err(|e| JsonRpcError::invalid_params(e.to_string()))
}

fn to_result<T: serde::Serialize>(value: T) -> Result<serde_json::Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(e.to_string()))
}

/// Handle a JSON-RPC request and return result or error
async fn handle_request(
    request: &JsonRpcRequest,
    conn: &mut Connection,
    state: &RwLock<ServerState>,
    config: &ServerConfig,
) -> Result<serde_json::Value, JsonRpcError> {
    match request.method.as_str() {
        METHOD_CREATE_ROOM => handle_create_room(request, conn, state, config).await,
        METHOD_JOIN_ROOM => handle_join_room(request, conn, state, config).await,
        METHOD_PING => handle_ping(request),
        METHOD_LEAVE_ROOM => {
            if let Some(peer_id) = conn.peer_id.take() {
                state.write().await.leave(peer_id);
            }
            Ok(serde_json::Value::Null)
        }
        _ => Err(JsonRpcError::method_not_found(&request.method)),
    }
}

/// Reject a second membership on one connection while the first is live.
fn ensure_not_member(conn: &Connection, state: &ServerState) -> Result<(), JsonRpcError> {
    if let Some(code) = conn.peer_id.and_then(|id| state.members.get(&id)) {
        return Err(JsonRpcError::already_in_room(code));
    }
    Ok(())
}

async fn handle_create_room(
    request: &JsonRpcRequest,
    conn: &mut Connection,
    state: &RwLock<ServerState>,
    config: &ServerConfig,
) -> Result<serde_json::Value, JsonRpcError> {
    let params: CreateRoomParams = parse_params(request)?;
    validate_room_name(&params.name).map_err(JsonRpcError::name_rejected)?;

    let network = match params.network {
        Some(network) => network.trunc(),
        None => DEFAULT_ROOM_NETWORK
            .parse::<Ipv4Net>()
            .map_err(|e| JsonRpcError::internal_error(e.to_string()))?,
    };
    if network.prefix_len() > 30 {
        return Err(JsonRpcError::invalid_params(format!(
            "network {} has no room for peers",
            network
        )));
    }

    let mut state = state.write().await;
    ensure_not_member(conn, &state)?;
    state.prune_tombstones(config.tombstone_ttl);

    let code = state.unique_code();
    let peer_id = state.allocate_peer_id();
    let pool = IpPool::new(network);
    let host_ip = pool.host_ip();

    let mut members = BTreeMap::new();
    members.insert(
        peer_id,
        Member {
            info: PeerInfo {
                peer_id,
                role: Role::Host,
                virtual_ip: Some(host_ip),
                candidates: params.candidates,
            },
            reflexive: None,
            reflexive_appended: false,
            tx: conn.tx.clone(),
        },
    );
    state.rooms.insert(
        code.clone(),
        Room {
            name: params.name.clone(),
            host: peer_id,
            created_at: Instant::now(),
            pool,
            members,
        },
    );
    state.members.insert(peer_id, code.clone());
    conn.peer_id = Some(peer_id);

    info!(
        "Room {} ('{}') created by {} as peer {} on {}",
        code, params.name, conn.peer_addr, peer_id, network
    );

    to_result(CreateRoomResult {
        room_code: code,
        peer_id,
        virtual_ip: Some(host_ip),
        network: Some(network),
        relay_port: conn.relay_port,
    })
}

async fn handle_join_room(
    request: &JsonRpcRequest,
    conn: &mut Connection,
    state: &RwLock<ServerState>,
    config: &ServerConfig,
) -> Result<serde_json::Value, JsonRpcError> {
    let params: JoinRoomParams = parse_params(request)?;
    let code = normalize_room_code(&params.room_code);

    let mut state = state.write().await;
    ensure_not_member(conn, &state)?;
    state.prune_tombstones(config.tombstone_ttl);

    let expired = match state.rooms.get(&code) {
        Some(room) => room.created_at.elapsed() > config.room_ttl,
        None if state.tombstones.contains_key(&code) => {
            return Err(JsonRpcError::room_expired(&code));
        }
        None => return Err(JsonRpcError::room_not_found(&code)),
    };
    if expired {
        state.close_room(&code, "room expired");
        return Err(JsonRpcError::room_expired(&code));
    }

    let peer_id = state.allocate_peer_id();
    let room = state
        .rooms
        .get_mut(&code)
        .ok_or_else(|| JsonRpcError::room_not_found(&code))?;
    let virtual_ip = room
        .pool
        .allocate()
        .ok_or_else(|| JsonRpcError::invalid_request(format!("Room {} is full", code)))?;

    let peers: Vec<PeerInfo> = room.members.values().map(|m| m.info.clone()).collect();
    let info = PeerInfo {
        peer_id,
        role: Role::Joiner,
        virtual_ip: Some(virtual_ip),
        candidates: params.candidates,
    };
    match JsonRpcNotification::new(NOTIFY_PEER_JOINED, &info) {
        Ok(notification) => room.notify_others(peer_id, &notification),
        Err(e) => error!("Failed to encode peer_joined: {}", e),
    }
    room.members.insert(
        peer_id,
        Member {
            info,
            reflexive: None,
            reflexive_appended: false,
            tx: conn.tx.clone(),
        },
    );
    let room_name = room.name.clone();
    let network = room.pool.network;

    state.members.insert(peer_id, code.clone());
    conn.peer_id = Some(peer_id);

    info!(
        "Peer {} ({}) joined room {} as {}",
        peer_id, conn.peer_addr, code, virtual_ip
    );

    to_result(JoinRoomResult {
        room_code: code,
        room_name,
        peer_id,
        virtual_ip: Some(virtual_ip),
        network: Some(network),
        relay_port: conn.relay_port,
        peers,
    })
}

fn handle_ping(request: &JsonRpcRequest) -> Result<serde_json::Value, JsonRpcError> {
    let params: PingParams = parse_params(request)?;
    let server_ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    to_result(PingResult {
        seq: params.seq,
        client_ts: params.timestamp,
        server_ts,
    })
}

/// UDP relay loop.
async fn run_relay(socket: Arc<UdpSocket>, state: Arc<RwLock<ServerState>>) {
    let mut buf = vec![0u8; MAX_RELAY_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("Relay receive error: {}", e);
                continue;
            }
        };
        let datagram = &buf[..n];
        let (header, payload) = match FrameHeader::decode(datagram) {
            Ok(parts) => parts,
            Err(e) => {
                debug!("Relay ignoring datagram from {}: {}", from, e);
                continue;
            }
        };

        if header.kind == FrameKind::Register {
            handle_register(&state, header.src, payload, from).await;
            continue;
        }
        if header.dst == RELAY_ID {
            continue;
        }

        let target = {
            let state = state.read().await;
            relay_target(&state, header.src, header.dst, from)
        };
        if let Some(target) = target {
            if let Err(e) = socket.send_to(datagram, target).await {
                debug!("Relay send to {} failed: {}", target, e);
            }
        }
    }
}

/// Where to forward a frame from `src` (seen at `from`) to `dst`, if both
/// are registered members of the same room.
fn relay_target(
    state: &ServerState,
    src: PeerId,
    dst: PeerId,
    from: SocketAddr,
) -> Option<SocketAddr> {
    let code = state.members.get(&src)?;
    if state.members.get(&dst)? != code {
        return None;
    }
    let room = state.rooms.get(code)?;
    if room.members.get(&src)?.reflexive != Some(from) {
        return None;
    }
    room.members.get(&dst)?.reflexive
}

async fn handle_register(
    state: &RwLock<ServerState>,
    peer_id: PeerId,
    payload: &[u8],
    from: SocketAddr,
) {
    let Ok(room_code) = std::str::from_utf8(payload) else {
        return;
    };
    let mut state = state.write().await;
    if state.members.get(&peer_id).map(String::as_str) != Some(room_code) {
        debug!("Relay: register from non-member {} at {}", peer_id, from);
        return;
    }
    let Some(room) = state.rooms.get_mut(room_code) else {
        return;
    };
    let Some(member) = room.members.get_mut(&peer_id) else {
        return;
    };
    if member.reflexive == Some(from) {
        return;
    }

    // A NAT rebinding replaces the observed address instead of adding to it.
    if let Some(stale) = member.reflexive.replace(from) {
        if member.reflexive_appended {
            member.info.candidates.retain(|c| *c != stale);
        }
    }
    member.reflexive_appended = !member.info.candidates.contains(&from);
    if member.reflexive_appended {
        member.info.candidates.push(from);
    }
    info!("Peer {} registered with relay from {}", peer_id, from);

    let info = member.info.clone();
    match JsonRpcNotification::new(NOTIFY_PEER_UPDATED, &info) {
        Ok(notification) => room.notify_others(peer_id, &notification),
        Err(e) => error!("Failed to encode peer_updated: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_room_code_format() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let code = generate_room_code(&mut rng);
            assert_eq!(code.len(), 21);
            assert!(code.starts_with("U/"));
            let groups: Vec<&str> = code[2..].split('-').collect();
            assert_eq!(groups.len(), 4);
            for group in groups {
                assert_eq!(group.len(), 4);
                assert!(group.bytes().all(|b| CODE_ALPHABET.contains(&b)));
            }
            assert!(!code[2..].contains('I') && !code[2..].contains('O'));
        }
    }

    #[test]
    fn test_ip_pool() {
        let mut pool = IpPool::new("10.144.144.0/30".parse().unwrap());
        assert_eq!(pool.host_ip(), Ipv4Addr::new(10, 144, 144, 1));
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 144, 144, 2)));
        assert_eq!(pool.allocate(), None);

        pool.release(Ipv4Addr::new(10, 144, 144, 2));
        // Host address and foreign addresses are never pooled
        pool.release(Ipv4Addr::new(10, 144, 144, 1));
        pool.release(Ipv4Addr::new(192, 168, 0, 2));
        assert_eq!(pool.allocate(), Some(Ipv4Addr::new(10, 144, 144, 2)));
        assert_eq!(pool.allocate(), None);
    }

    fn add_room(state: &mut ServerState, code: &str, host: PeerId, joiner: PeerId) {
        let (tx, _rx) = mpsc::channel(4);
        let mut members = BTreeMap::new();
        for (id, role) in [(host, Role::Host), (joiner, Role::Joiner)] {
            members.insert(
                id,
                Member {
                    info: PeerInfo {
                        peer_id: id,
                        role,
                        virtual_ip: None,
                        candidates: vec![],
                    },
                    reflexive: Some(SocketAddr::from(([127, 0, 0, 1], 1000 + id as u16))),
                    reflexive_appended: false,
                    tx: tx.clone(),
                },
            );
            state.members.insert(id, code.to_string());
        }
        state.rooms.insert(
            code.to_string(),
            Room {
                name: "lan".into(),
                host,
                created_at: Instant::now(),
                pool: IpPool::new("10.0.0.0/24".parse().unwrap()),
                members,
            },
        );
    }

    #[test]
    fn test_relay_only_within_room() {
        let mut state = ServerState::new();
        add_room(&mut state, "U/AAAA-AAAA-AAAA-AAAA", 1, 2);
        add_room(&mut state, "U/BBBB-BBBB-BBBB-BBBB", 3, 4);

        let from1 = SocketAddr::from(([127, 0, 0, 1], 1001));
        assert_eq!(
            relay_target(&state, 1, 2, from1),
            Some(SocketAddr::from(([127, 0, 0, 1], 1002)))
        );
        // Other room
        assert_eq!(relay_target(&state, 1, 3, from1), None);
        // Spoofed source address
        assert_eq!(
            relay_target(&state, 1, 2, SocketAddr::from(([127, 0, 0, 1], 9))),
            None
        );
    }

    #[test]
    fn test_host_leave_closes_room() {
        let mut state = ServerState::new();
        add_room(&mut state, "U/AAAA-AAAA-AAAA-AAAA", 1, 2);

        state.leave(1);
        assert!(state.rooms.is_empty());
        assert!(state.members.is_empty());
        assert!(state.tombstones.contains_key("U/AAAA-AAAA-AAAA-AAAA"));
    }

    #[test]
    fn test_joiner_leave_keeps_room() {
        let mut state = ServerState::new();
        add_room(&mut state, "U/AAAA-AAAA-AAAA-AAAA", 1, 2);

        state.leave(2);
        let room = state.rooms.get("U/AAAA-AAAA-AAAA-AAAA").unwrap();
        assert_eq!(room.members.len(), 1);
        assert!(!state.members.contains_key(&2));
    }

    #[tokio::test]
    async fn test_register_replaces_observed_address() {
        let code = "U/AAAA-AAAA-AAAA-AAAA";
        let reported = SocketAddr::from(([192, 168, 1, 20], 4000));
        let mut state = ServerState::new();
        add_room(&mut state, code, 1, 2);
        {
            let joiner = state.rooms.get_mut(code).unwrap().members.get_mut(&2).unwrap();
            joiner.reflexive = None;
            joiner.info.candidates = vec![reported];
        }
        let state = RwLock::new(state);
        let candidates = |state: &ServerState| {
            state.rooms[code].members[&2].info.candidates.clone()
        };

        let first = SocketAddr::from(([203, 0, 113, 5], 40000));
        let second = SocketAddr::from(([203, 0, 113, 5], 40001));
        handle_register(&state, 2, code.as_bytes(), first).await;
        assert_eq!(candidates(&*state.read().await), vec![reported, first]);

        handle_register(&state, 2, code.as_bytes(), second).await;
        assert_eq!(candidates(&*state.read().await), vec![reported, second]);
        assert_eq!(state.read().await.rooms[code].members[&2].reflexive, Some(second));

        // An observed address the member reported itself is kept on rebinding.
        handle_register(&state, 2, code.as_bytes(), reported).await;
        handle_register(&state, 2, code.as_bytes(), first).await;
        assert_eq!(candidates(&*state.read().await), vec![reported, first]);
    }

    #[tokio::test]
    async fn test_closed_room_answers_expired() {
        let server = RendezvousServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            ServerConfig::default(),
        )
        .await
        .unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run());

        let mut host = TcpStream::connect(addr).await.unwrap();
        let create = JsonRpcRequest::new(
            METHOD_CREATE_ROOM,
            CreateRoomParams {
                name: "lan".into(),
                network: None,
                candidates: vec![],
            },
            1,
        )
        .unwrap();
        write_message(&mut host, &create).await.unwrap();
        let resp: JsonRpcResponse = read_message(&mut host).await.unwrap();
        let created: CreateRoomResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(created.virtual_ip, Some(Ipv4Addr::new(10, 144, 144, 1)));
        drop(host);

        // The disconnect is processed asynchronously; a join that still
        // succeeds is closed right after and the next attempt sees the
        // tombstone.
        let mut joiner = TcpStream::connect(addr).await.unwrap();
        let mut code = 0;
        for attempt in 0..50u64 {
            let join = JsonRpcRequest::new(
                METHOD_JOIN_ROOM,
                JoinRoomParams {
                    room_code: created.room_code.clone(),
                    candidates: vec![],
                },
                attempt + 1,
            )
            .unwrap();
            write_message(&mut joiner, &join).await.unwrap();
            let resp = loop {
                let msg: serde_json::Value = read_message(&mut joiner).await.unwrap();
                if msg.get("method").is_none() {
                    break serde_json::from_value::<JsonRpcResponse>(msg).unwrap();
                }
            };
            if let Some(error) = resp.error {
                code = error.code;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(code, ERROR_ROOM_EXPIRED);
    }
}
