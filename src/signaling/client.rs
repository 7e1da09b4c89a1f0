//! Rendezvous client.
//!
//! Create and join are one-shot request/response exchanges bounded by the
//! configured timeout. The TCP connection then stays open for the life of
//! the membership: a monitor task keeps it alive with pings, applies
//! membership notifications to the session and says goodbye on stop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use ipnet::Ipv4Net;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::framing::{read_message, write_message};
use super::protocol::*;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::session::{Session, SessionParams};

/// Maximum backoff multiplier (caps exponential growth)
const BACKOFF_MAX_MULTIPLIER: u64 = 1024;

/// How long a stopping monitor may spend saying goodbye.
const LEAVE_GRACE: Duration = Duration::from_secs(1);

/// Pings in a row the server may leave unanswered before the connection
/// counts as lost.
const MAX_UNANSWERED_PINGS: u32 = 3;

/// Retry an async operation with exponential backoff.
///
/// The delay starts at `base_delay_ms` and doubles after every failed
/// attempt. Errors that are not retriable end the loop at once; otherwise
/// the error of the last attempt is returned.
async fn retry_with_backoff<T, F, Fut>(
    operation: F,
    max_attempts: u32,
    base_delay_ms: u64,
    operation_name: &str,
) -> EngineResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retriable() => return Err(e),
            Err(e) if attempt + 1 >= max_attempts => {
                warn!(
                    "Giving up on {} after {} attempts: {}",
                    operation_name, max_attempts, e
                );
                return Err(e);
            }
            Err(e) => {
                let multiplier = 1u64
                    .checked_shl(attempt)
                    .unwrap_or(BACKOFF_MAX_MULTIPLIER)
                    .min(BACKOFF_MAX_MULTIPLIER);
                let delay_ms = base_delay_ms.saturating_mul(multiplier);
                warn!(
                    "Failed to {} (attempt {}/{}): {}. Next attempt in {}ms...",
                    operation_name,
                    attempt + 1,
                    max_attempts,
                    e,
                    delay_ms
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
        }
    }
}

fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn transport_error(err: anyhow::Error) -> EngineError {
    EngineError::Transport(format!("{:#}", err))
}

/// Map a server error object to the engine taxonomy.
fn map_rpc_error(error: JsonRpcError) -> EngineError {
    match error.code {
        ERROR_NAME_REJECTED => EngineError::NameRejected(error.message),
        ERROR_ROOM_NOT_FOUND => EngineError::RoomNotFound(error.message),
        ERROR_ROOM_EXPIRED => EngineError::RoomExpired(error.message),
        code => EngineError::Transport(format!("server error {}: {}", code, error.message)),
    }
}

/// Events the monitor task reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// A peer joined, left, or changed its candidates.
    MembershipChanged,
    /// The host left or the server closed the room.
    RoomClosed(String),
    /// The rendezvous connection broke. The session itself is kept.
    ConnectionLost(String),
}

pub type EventHandler = Arc<dyn Fn(SignalingEvent) + Send + Sync>;

/// Outcome of a successful create or join.
pub struct RoomEntry {
    pub params: SessionParams,
    pub peers: Vec<PeerInfo>,
    pub connection: RendezvousConnection,
}

/// Rendezvous client settings, taken from the engine configuration.
#[derive(Debug, Clone)]
pub struct RendezvousClient {
    server: String,
    timeout: Duration,
    max_attempts: u32,
    base_delay_ms: u64,
}

impl RendezvousClient {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            server: config.rendezvous.server.trim().to_string(),
            timeout: config.rendezvous_timeout(),
            max_attempts: config.rendezvous.max_attempts,
            base_delay_ms: config.rendezvous.base_delay_ms,
        }
    }

    /// Create a room and become its host.
    pub async fn create_room(
        &self,
        name: &str,
        network: Ipv4Net,
        candidates: Vec<SocketAddr>,
    ) -> EngineResult<RoomEntry> {
        validate_room_name(name).map_err(EngineError::NameRejected)?;
        let params = CreateRoomParams {
            name: name.to_string(),
            network: Some(network),
            candidates,
        };

        let attempt = || self.create_once(&params, network);
        self.bounded(
            "create room",
            retry_with_backoff(attempt, self.max_attempts, self.base_delay_ms, "create room"),
        )
        .await
    }

    async fn create_once(
        &self,
        params: &CreateRoomParams,
        network: Ipv4Net,
    ) -> EngineResult<RoomEntry> {
        let mut connection = self.connect().await?;
        let result: CreateRoomResult = connection.call(METHOD_CREATE_ROOM, params).await?;
        let relay_addr = connection.relay_addr(result.relay_port)?;
        info!(
            "Created room {} as peer {} ({:?})",
            result.room_code, result.peer_id, result.virtual_ip
        );
        Ok(RoomEntry {
            params: SessionParams {
                room_code: result.room_code,
                room_name: Some(params.name.clone()),
                role: Role::Host,
                local_id: result.peer_id,
                virtual_ip: result.virtual_ip,
                subnet: result.network.or(Some(network)),
                relay_addr,
            },
            peers: Vec::new(),
            connection,
        })
    }

    /// Join an existing room.
    pub async fn join_room(
        &self,
        code: &str,
        candidates: Vec<SocketAddr>,
    ) -> EngineResult<RoomEntry> {
        let room_code = normalize_room_code(code);
        if room_code.is_empty() {
            return Err(EngineError::RoomNotFound("empty room code".to_string()));
        }
        let params = JoinRoomParams {
            room_code,
            candidates,
        };

        let attempt = || self.join_once(&params);
        self.bounded(
            "join room",
            retry_with_backoff(attempt, self.max_attempts, self.base_delay_ms, "join room"),
        )
        .await
    }

    async fn join_once(&self, params: &JoinRoomParams) -> EngineResult<RoomEntry> {
        let mut connection = self.connect().await?;
        let result: JoinRoomResult = connection.call(METHOD_JOIN_ROOM, params).await?;
        let relay_addr = connection.relay_addr(result.relay_port)?;
        info!(
            "Joined room {} ('{}') as peer {} ({:?}), {} member(s) present",
            result.room_code,
            result.room_name,
            result.peer_id,
            result.virtual_ip,
            result.peers.len()
        );
        Ok(RoomEntry {
            params: SessionParams {
                room_code: result.room_code,
                room_name: Some(result.room_name),
                role: Role::Joiner,
                local_id: result.peer_id,
                virtual_ip: result.virtual_ip,
                subnet: result.network,
                relay_addr,
            },
            peers: result.peers,
            connection,
        })
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> EngineResult<T>
    where
        F: std::future::Future<Output = EngineResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(format!(
                "{} did not complete within {}ms",
                what,
                self.timeout.as_millis()
            ))),
        }
    }

    async fn connect(&self) -> EngineResult<RendezvousConnection> {
        let stream = TcpStream::connect(self.server.as_str())
            .await
            .map_err(|e| EngineError::Transport(format!("connect {}: {}", self.server, e)))?;
        let _ = stream.set_nodelay(true);
        debug!("Connected to rendezvous server {}", self.server);
        Ok(RendezvousConnection::new(stream))
    }
}

/// An open connection to the rendezvous server.
pub struct RendezvousConnection {
    stream: TcpStream,
    next_id: u64,
}

impl RendezvousConnection {
    fn new(stream: TcpStream) -> Self {
        Self { stream, next_id: 1 }
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// The relay lives on the same host as the rendezvous endpoint.
    fn relay_addr(&self, relay_port: u16) -> EngineResult<SocketAddr> {
        let peer = self.stream.peer_addr()?;
        Ok(SocketAddr::new(peer.ip(), relay_port))
    }

    /// Send one request and wait for its response.
    async fn call<P, R>(&mut self, method: &str, params: P) -> EngineResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_request_id();
        let request = JsonRpcRequest::new(method, params, id)
            .map_err(|e| EngineError::Fatal(format!("encode {}: {}", method, e)))?;
        write_message(&mut self.stream, &request)
            .await
            .map_err(transport_error)?;

        loop {
            let msg: serde_json::Value = read_message(&mut self.stream)
                .await
                .map_err(transport_error)?;
            if let Some(notification) = msg.get("method").and_then(|m| m.as_str()) {
                debug!("Ignoring '{}' while waiting for {}", notification, method);
                continue;
            }
            let response: JsonRpcResponse = serde_json::from_value(msg)
                .map_err(|e| EngineError::Transport(format!("malformed response: {}", e)))?;
            if response.id != id {
                debug!("Ignoring response {} while waiting for {}", response.id, id);
                continue;
            }
            if let Some(error) = response.error {
                return Err(map_rpc_error(error));
            }
            let result = response
                .result
                .ok_or_else(|| EngineError::Transport(format!("{} returned no result", method)))?;
            return serde_json::from_value(result).map_err(|e| {
                EngineError::Transport(format!("malformed {} result: {}", method, e))
            });
        }
    }

    /// Hand the connection to a background task that keeps `session` in
    /// sync with the server.
    pub fn spawn_monitor(
        self,
        session: Arc<Session>,
        keepalive: Duration,
        on_event: EventHandler,
    ) -> SignalingHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_monitor(self, session, keepalive, on_event, stop_rx));
        SignalingHandle { stop_tx, task }
    }
}

/// Handle on a running monitor task.
pub struct SignalingHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SignalingHandle {
    /// Leave the room (best effort) and stop the monitor.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let abort = self.task.abort_handle();
        if tokio::time::timeout(LEAVE_GRACE, self.task).await.is_err() {
            abort.abort();
        }
    }
}

async fn run_monitor(
    connection: RendezvousConnection,
    session: Arc<Session>,
    keepalive: Duration,
    on_event: EventHandler,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut next_id = connection.next_id;
    let (mut reader, mut writer) = connection.stream.into_split();

    // Reads run in their own task: a partially read frame must never be
    // dropped by a select! branch losing the race.
    let (msg_tx, mut msg_rx) = mpsc::channel::<Result<serde_json::Value>>(32);
    let reader_task = tokio::spawn(async move {
        loop {
            let msg = read_message::<_, serde_json::Value>(&mut reader).await;
            let failed = msg.is_err();
            if msg_tx.send(msg).await.is_err() || failed {
                break;
            }
        }
    });

    let mut ticker = tokio::time::interval(keepalive);
    ticker.tick().await;
    let mut seq = 0u32;
    let mut unanswered = 0u32;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                let leave = JsonRpcNotification::new(
                    METHOD_LEAVE_ROOM,
                    LeaveRoomParams { room_code: session.room_code().to_string() },
                );
                if let Ok(leave) = leave {
                    if let Err(e) = write_message(&mut writer, &leave).await {
                        debug!("leave_room not delivered: {}", e);
                    }
                }
                info!("Left room {}", session.room_code());
                break;
            }
            _ = ticker.tick() => {
                if unanswered >= MAX_UNANSWERED_PINGS {
                    warn!("Rendezvous server stopped answering pings");
                    on_event(SignalingEvent::ConnectionLost(format!(
                        "no reply to {} pings",
                        unanswered
                    )));
                    break;
                }
                seq = seq.wrapping_add(1);
                let ping = JsonRpcRequest::new(
                    METHOD_PING,
                    PingParams { seq, timestamp: current_time_ms() },
                    next_id,
                );
                next_id += 1;
                let sent = match ping {
                    Ok(ping) => write_message(&mut writer, &ping).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    warn!("Rendezvous keepalive failed: {}", e);
                    on_event(SignalingEvent::ConnectionLost(format!("{:#}", e)));
                    break;
                }
                unanswered += 1;
            }
            msg = msg_rx.recv() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("Rendezvous connection lost: {}", e);
                        on_event(SignalingEvent::ConnectionLost(format!("{:#}", e)));
                        break;
                    }
                    None => {
                        on_event(SignalingEvent::ConnectionLost("reader stopped".to_string()));
                        break;
                    }
                };
                if msg.get("method").is_none() {
                    unanswered = 0;
                }
                if let Some(event) = apply_notification(&session, msg) {
                    let closed = matches!(event, SignalingEvent::RoomClosed(_));
                    on_event(event);
                    if closed {
                        break;
                    }
                }
            }
        }
    }

    reader_task.abort();
}

/// Apply one server message to the session. Responses (pongs) yield
/// nothing.
fn apply_notification(session: &Session, msg: serde_json::Value) -> Option<SignalingEvent> {
    let method = msg.get("method").and_then(|m| m.as_str())?.to_string();
    let params = msg.get("params").cloned().unwrap_or_default();

    match method.as_str() {
        NOTIFY_PEER_JOINED | NOTIFY_PEER_UPDATED => {
            match serde_json::from_value::<PeerInfo>(params) {
                Ok(peer) => {
                    debug!("{}: peer {} ({:?})", method, peer.peer_id, peer.virtual_ip);
                    if method == NOTIFY_PEER_JOINED {
                        info!("Peer {} joined room {}", peer.peer_id, session.room_code());
                    }
                    session.upsert_peer(peer);
                    Some(SignalingEvent::MembershipChanged)
                }
                Err(e) => {
                    warn!("Malformed {} notification: {}", method, e);
                    None
                }
            }
        }
        NOTIFY_PEER_LEFT => match serde_json::from_value::<PeerLeftParams>(params) {
            Ok(left) => {
                info!("Peer {} left room {}", left.peer_id, session.room_code());
                session.remove_peer(left.peer_id);
                Some(SignalingEvent::MembershipChanged)
            }
            Err(e) => {
                warn!("Malformed {} notification: {}", method, e);
                None
            }
        },
        NOTIFY_ROOM_CLOSED => {
            let reason = serde_json::from_value::<RoomClosedParams>(params)
                .map(|p| p.reason)
                .unwrap_or_else(|_| "room closed".to_string());
            info!("Room {} closed: {}", session.room_code(), reason);
            Some(SignalingEvent::RoomClosed(reason))
        }
        other => {
            debug!("Ignoring notification '{}'", other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::server::{RendezvousServer, ServerConfig};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    fn config_for(server: SocketAddr, timeout_ms: u64) -> EngineConfig {
        EngineConfig::from_toml_str(&format!(
            r#"
            [rendezvous]
            server = "{}"
            timeout_ms = {}
            max_attempts = 2
            base_delay_ms = 10
            "#,
            server, timeout_ms
        ))
        .unwrap()
    }

    async fn start_server() -> SocketAddr {
        let server = RendezvousServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            ServerConfig::default(),
        )
        .await
        .unwrap();
        let addr = server.local_addr();
        tokio::spawn(async move { server.run().await });
        addr
    }

    #[tokio::test]
    async fn test_retry_with_backoff_succeeds_after_failures() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();
        let result = retry_with_backoff(
            move || {
                let counter = counter.clone();
                async move {
                    let mut n = counter.lock().unwrap();
                    *n += 1;
                    if *n < 3 {
                        Err(EngineError::Transport("not yet".into()))
                    } else {
                        Ok(*n)
                    }
                }
            },
            5,
            1,
            "test op",
        )
        .await
        .unwrap();
        assert_eq!(result, 3);
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_gives_up() {
        let err = retry_with_backoff(
            || async { Err::<(), _>(EngineError::Transport("boom".into())) },
            2,
            1,
            "test op",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Transport(ref msg) if msg == "boom"));
    }

    #[tokio::test]
    async fn test_retry_stops_on_final_answer() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();
        let err = retry_with_backoff(
            move || {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Err::<(), _>(EngineError::RoomNotFound("U/X".into()))
                }
            },
            5,
            1,
            "test op",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::RoomNotFound(_)));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_and_join() {
        let addr = start_server().await;
        let client = RendezvousClient::new(&config_for(addr, 5_000));

        let host = client
            .create_room("Friday LAN", "10.144.144.0/24".parse().unwrap(), vec![])
            .await
            .unwrap();
        assert!(host.params.room_code.starts_with("U/"));
        assert_eq!(host.params.role, Role::Host);
        assert_eq!(host.params.virtual_ip, Some("10.144.144.1".parse().unwrap()));
        assert_eq!(host.params.relay_addr.ip(), addr.ip());

        let lower = host.params.room_code.to_lowercase();
        let joiner = client.join_room(&lower, vec![]).await.unwrap();
        assert_eq!(joiner.params.role, Role::Joiner);
        assert_eq!(joiner.params.room_name.as_deref(), Some("Friday LAN"));
        assert_eq!(joiner.params.virtual_ip, Some("10.144.144.2".parse().unwrap()));
        assert_eq!(joiner.peers.len(), 1);
        assert_eq!(joiner.peers[0].peer_id, host.params.local_id);
    }

    #[tokio::test]
    async fn test_join_unknown_room() {
        let addr = start_server().await;
        let client = RendezvousClient::new(&config_for(addr, 5_000));
        let err = client
            .join_room("U/0000-0000-0000-0000", vec![])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn test_invalid_name_is_rejected_locally() {
        // Nothing listens here; a local rejection never connects
        let client = RendezvousClient::new(&config_for("127.0.0.1:1".parse().unwrap(), 5_000));
        let err = client
            .create_room("", "10.144.144.0/24".parse().unwrap(), vec![])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::NameRejected(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RendezvousClient::new(&config_for(addr, 5_000));
        let err = client
            .create_room("lan", "10.144.144.0/24".parse().unwrap(), vec![])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Transport(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = RendezvousClient::new(&config_for(addr, 200));
        let err = client.join_room("U/AAAA-AAAA-AAAA-AAAA", vec![]).await.err().unwrap();
        assert!(matches!(err, EngineError::Timeout(_)), "{:?}", err);
    }

    fn collect_events() -> (Arc<Mutex<Vec<SignalingEvent>>>, EventHandler) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (events, Arc::new(move |event| sink.lock().unwrap().push(event)))
    }

    #[tokio::test]
    async fn test_monitor_detects_unanswered_pings() {
        // Accepts and holds connections but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let session = Arc::new(Session::new(
            SessionParams {
                room_code: "U/AAAA-AAAA-AAAA-AAAA".into(),
                room_name: None,
                role: Role::Joiner,
                local_id: 2,
                virtual_ip: None,
                subnet: None,
                relay_addr: addr,
            },
            vec![],
        ));
        let (events, on_event) = collect_events();
        let monitor = RendezvousConnection::new(stream).spawn_monitor(
            session,
            Duration::from_millis(20),
            on_event,
        );

        tokio::time::timeout(Duration::from_secs(2), async {
            while events.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 1, "{:?}", events);
        assert!(
            matches!(&events[0], SignalingEvent::ConnectionLost(reason) if reason.contains("ping")),
            "{:?}",
            events
        );
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_monitor_survives_answered_pings() {
        let addr = start_server().await;
        let client = RendezvousClient::new(&config_for(addr, 5_000));
        let host = client
            .create_room("lan", "10.144.144.0/24".parse().unwrap(), vec![])
            .await
            .unwrap();
        let session = Arc::new(Session::new(host.params.clone(), host.peers));
        let (events, on_event) = collect_events();
        let monitor = host
            .connection
            .spawn_monitor(session, Duration::from_millis(20), on_event);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(events.lock().unwrap().is_empty());
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_monitor_applies_membership() {
        let addr = start_server().await;
        let client = RendezvousClient::new(&config_for(addr, 5_000));

        let host = client
            .create_room("lan", "10.144.144.0/24".parse().unwrap(), vec![])
            .await
            .unwrap();
        let session = Arc::new(Session::new(host.params.clone(), host.peers));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let monitor = host.connection.spawn_monitor(
            session.clone(),
            Duration::from_secs(5),
            Arc::new(move |event| sink.lock().unwrap().push(event)),
        );

        let joiner = client.join_room(&host.params.room_code, vec![]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while session.peer_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            session.route_for("10.144.144.2".parse().unwrap()),
            Some(joiner.params.local_id)
        );

        // Joiner disconnects: peer_left
        drop(joiner);
        tokio::time::timeout(Duration::from_secs(2), async {
            while session.peer_count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .all(|e| *e == SignalingEvent::MembershipChanged));

        monitor.stop().await;
    }
}
