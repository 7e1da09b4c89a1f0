//! JSON-RPC 2.0 protocol types for the rendezvous service.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

/// JSON-RPC version string
pub const JSONRPC_VERSION: &str = "2.0";

/// Identifier the rendezvous server assigns to every room member.
/// `0` is reserved for the relay itself.
pub type PeerId = u64;

// Client → server requests
pub const METHOD_CREATE_ROOM: &str = "create_room";
pub const METHOD_JOIN_ROOM: &str = "join_room";
pub const METHOD_PING: &str = "ping";
// Client → server notification
pub const METHOD_LEAVE_ROOM: &str = "leave_room";
// Server → client notifications
pub const NOTIFY_PEER_JOINED: &str = "peer_joined";
pub const NOTIFY_PEER_UPDATED: &str = "peer_updated";
pub const NOTIFY_PEER_LEFT: &str = "peer_left";
pub const NOTIFY_ROOM_CLOSED: &str = "room_closed";

// Application error codes
pub const ERROR_NAME_REJECTED: i32 = -32010;
pub const ERROR_ROOM_NOT_FOUND: i32 = -32011;
pub const ERROR_ROOM_EXPIRED: i32 = -32012;
pub const ERROR_ALREADY_IN_ROOM: i32 = -32013;

/// Longest accepted room name, in characters.
pub const MAX_ROOM_NAME_CHARS: usize = 64;

/// Check a room name before it is sent or accepted.
pub fn validate_room_name(name: &str) -> Result<(), String> {
    let chars = name.chars().count();
    if chars == 0 || name.trim().is_empty() {
        return Err("room name is empty".to_string());
    }
    if chars > MAX_ROOM_NAME_CHARS {
        return Err(format!(
            "room name has {} characters (max {})",
            chars, MAX_ROOM_NAME_CHARS
        ));
    }
    if name.chars().any(char::is_control) {
        return Err("room name contains control characters".to_string());
    }
    Ok(())
}

/// Canonical form of a user-typed room code: trimmed and upper-cased.
pub fn normalize_room_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// JSON-RPC request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

/// JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: u64,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// JSON-RPC notification (no id, no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcError {
    fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::with_code(-32600, msg)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::with_code(-32601, format!("Method not found: {}", method))
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::with_code(-32602, msg)
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::with_code(-32603, msg)
    }

    pub fn name_rejected(msg: impl Into<String>) -> Self {
        Self::with_code(ERROR_NAME_REJECTED, msg)
    }

    pub fn room_not_found(code: &str) -> Self {
        Self::with_code(ERROR_ROOM_NOT_FOUND, format!("Room not found: {}", code))
    }

    pub fn room_expired(code: &str) -> Self {
        Self::with_code(ERROR_ROOM_EXPIRED, format!("Room expired: {}", code))
    }

    pub fn already_in_room(code: &str) -> Self {
        Self::with_code(
            ERROR_ALREADY_IN_ROOM,
            format!("Connection is already a member of {}", code),
        )
    }
}

impl JsonRpcRequest {
    pub fn new(
        method: impl Into<String>,
        params: impl Serialize,
        id: u64,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(serde_json::to_value(params)?),
            id: Some(id),
        })
    }
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: u64, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: impl Serialize) -> serde_json::Result<Self> {
        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(serde_json::to_value(params)?),
        })
    }
}

// ============================================================================
// Method-specific parameter and result types
// ============================================================================

/// Local role in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Joiner,
}

/// What a member learns about another member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<Ipv4Addr>,
    /// UDP addresses at which the member may be reachable directly.
    #[serde(default)]
    pub candidates: Vec<SocketAddr>,
}

/// Parameters for "create_room"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Ipv4Net>,
    #[serde(default)]
    pub candidates: Vec<SocketAddr>,
}

/// Result for "create_room"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomResult {
    pub room_code: String,
    pub peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Ipv4Net>,
    /// UDP port of the relay on the rendezvous host.
    pub relay_port: u16,
}

/// Parameters for "join_room"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoomParams {
    pub room_code: String,
    #[serde(default)]
    pub candidates: Vec<SocketAddr>,
}

/// Result for "join_room"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoomResult {
    pub room_code: String,
    pub room_name: String,
    pub peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Ipv4Net>,
    pub relay_port: u16,
    /// Members already in the room, host first.
    pub peers: Vec<PeerInfo>,
}

/// Parameters for "ping"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingParams {
    pub seq: u32,
    pub timestamp: u64,
}

/// Result for "ping" (pong)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub seq: u32,
    pub client_ts: u64,
    pub server_ts: u64,
}

/// Parameters for "leave_room"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRoomParams {
    pub room_code: String,
}

/// Parameters for "peer_left"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLeftParams {
    pub peer_id: PeerId,
}

/// Parameters for "room_closed"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomClosedParams {
    pub room_code: String,
    pub reason: String,
}
