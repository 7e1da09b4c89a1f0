//! IP header inspection for routing decisions.
//!
//! Only the fixed part of the header is read. Lengths are validated once up
//! front, then addresses are read with slice-to-array conversions.

use ipnet::Ipv4Net;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Minimum IPv4 header size (20 bytes, no options).
const IPV4_MIN_HEADER: usize = 20;

/// Minimum IPv6 header size (40 bytes fixed).
const IPV6_MIN_HEADER: usize = 40;

const IP_VERSION_4: u8 = 4;
const IP_VERSION_6: u8 = 6;

/// Extract the source address of an IPv4 or IPv6 packet.
#[inline]
pub fn source_ip(packet: &[u8]) -> Option<IpAddr> {
    match ip_version(packet)? {
        IP_VERSION_4 => Some(IpAddr::V4(read_ipv4_addr(packet, 12)?)),
        _ => Some(IpAddr::V6(read_ipv6_addr(packet, 8)?)),
    }
}

/// Extract the destination address of an IPv4 or IPv6 packet.
#[inline]
pub fn dest_ip(packet: &[u8]) -> Option<IpAddr> {
    match ip_version(packet)? {
        IP_VERSION_4 => Some(IpAddr::V4(read_ipv4_addr(packet, 16)?)),
        _ => Some(IpAddr::V6(read_ipv6_addr(packet, 24)?)),
    }
}

/// Returns true for destinations that every room member should see:
/// multicast, limited broadcast and the directed broadcast of `subnet`.
pub fn is_broadcast_like(dest: IpAddr, subnet: Option<Ipv4Net>) -> bool {
    match dest {
        IpAddr::V4(v4) => {
            v4.is_multicast()
                || v4 == Ipv4Addr::BROADCAST
                || subnet.map_or(false, |net| net.broadcast() == v4)
        }
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

/// Version nibble of a packet long enough to carry its fixed header.
#[inline]
fn ip_version(packet: &[u8]) -> Option<u8> {
    let len = packet.len();
    if len < IPV4_MIN_HEADER {
        return None;
    }
    match packet[0] >> 4 {
        IP_VERSION_4 => Some(IP_VERSION_4),
        IP_VERSION_6 if len >= IPV6_MIN_HEADER => Some(IP_VERSION_6),
        _ => None,
    }
}

#[inline(always)]
fn read_ipv4_addr(packet: &[u8], offset: usize) -> Option<Ipv4Addr> {
    let bytes: [u8; 4] = packet.get(offset..offset + 4)?.try_into().ok()?;
    Some(Ipv4Addr::from(bytes))
}

#[inline(always)]
fn read_ipv6_addr(packet: &[u8], offset: usize) -> Option<Ipv6Addr> {
    let bytes: [u8; 16] = packet.get(offset..offset + 16)?.try_into().ok()?;
    Some(Ipv6Addr::from(bytes))
}

/// Build a minimal IPv4 packet (header plus payload) for tests.
#[cfg(test)]
pub(crate) fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = IPV4_MIN_HEADER + payload.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet[IPV4_MIN_HEADER..].copy_from_slice(payload);
    packet
}
