//! Rendezvous signaling: room creation, joining and membership updates.
//!
//! # Protocol
//!
//! Messages are framed with a 4-byte big-endian length prefix followed by
//! JSON-RPC 2.0 content.
//!
//! ## Methods (client → server)
//!
//! - `create_room` - Open a room and become its host
//! - `join_room` - Enter a room by code
//! - `ping` - Keep the connection alive
//! - `leave_room` - Notification; leave the current room
//!
//! ## Notifications (server → client)
//!
//! - `peer_joined`, `peer_updated`, `peer_left` - Membership changes
//! - `room_closed` - The host left or the room expired

pub mod client;
pub mod framing;
pub mod protocol;
pub mod server;

// Re-export commonly used types
pub use client::{RendezvousClient, RoomEntry, SignalingEvent, SignalingHandle};
pub use protocol::{PeerId, PeerInfo, Role};
pub use server::{RendezvousServer, ServerConfig};
