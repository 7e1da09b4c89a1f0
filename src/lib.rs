//! terracotta-core library
//!
//! Peer-to-peer virtual LAN engine: rooms negotiated through a rendezvous
//! server, IP packets carried over UDP (direct or relayed) and bridged to a
//! host-owned TUN descriptor. Hosts drive it through the C ABI in [`ffi`].

pub mod bridge;
pub mod config;
pub mod device;
pub mod error;
pub mod ffi;
pub mod instance;
pub mod logger;
pub mod packet;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use instance::{InstanceState, NetworkInstance};
