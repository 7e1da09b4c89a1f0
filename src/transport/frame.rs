//! Datagram framing shared by peers and the relay.
//!
//! Wire format (big-endian):
//! ```text
//! ┌───────────┬─────────┬──────┬───────────┬───────────┬─────────────┐
//! │ magic u16 │ ver u8  │ kind │  src u64  │  dst u64  │ payload ... │
//! │  0x5443   │   1     │  u8  │  peer id  │  peer id  │             │
//! └───────────┴─────────┴──────┴───────────┴───────────┴─────────────┘
//! ```
//! `dst == 0` addresses the relay itself.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::signaling::protocol::PeerId;

pub const MAGIC: u16 = 0x5443;
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 20;

/// Destination id of frames meant for the relay.
pub const RELAY_ID: PeerId = 0;

/// Frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// One IP packet read from a TUN descriptor.
    Data = 1,
    Keepalive = 2,
    KeepaliveAck = 3,
    /// Hole-punch frame sent to a peer candidate.
    Punch = 4,
    PunchAck = 5,
    /// Relay registration; payload is the room code.
    Register = 6,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::Keepalive),
            3 => Ok(FrameKind::KeepaliveAck),
            4 => Ok(FrameKind::Punch),
            5 => Ok(FrameKind::PunchAck),
            6 => Ok(FrameKind::Register),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Bad frame magic: {0:#06x}")]
    BadMagic(u16),

    #[error("Unsupported frame version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown frame kind: {0}")]
    UnknownKind(u8),
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub src: PeerId,
    pub dst: PeerId,
}

impl FrameHeader {
    pub fn new(kind: FrameKind, src: PeerId, dst: PeerId) -> Self {
        Self { kind, src, dst }
    }

    /// Append the header to `buf`.
    pub fn put(&self, buf: &mut BytesMut) {
        buf.put_u16(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u64(self.src);
        buf.put_u64(self.dst);
    }

    /// Encode header and payload into one datagram.
    pub fn encode(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        self.put(&mut buf);
        buf.extend_from_slice(payload);
        buf.freeze()
    }

    /// Split a datagram into header and payload.
    pub fn decode(datagram: &[u8]) -> Result<(FrameHeader, &[u8]), FrameError> {
        if datagram.len() < HEADER_LEN {
            return Err(FrameError::TooShort(datagram.len()));
        }
        let magic = u16::from_be_bytes([datagram[0], datagram[1]]);
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        if datagram[2] != VERSION {
            return Err(FrameError::UnsupportedVersion(datagram[2]));
        }
        let kind = FrameKind::try_from(datagram[3])?;
        let src = read_u64(&datagram[4..12]);
        let dst = read_u64(&datagram[12..20]);
        Ok((FrameHeader { kind, src, dst }, &datagram[HEADER_LEN..]))
    }
}

#[inline]
fn read_u64(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    u64::from_be_bytes(arr)
}
