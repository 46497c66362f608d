//! Matching keys and the outstanding-probe table.
//!
//! The matching key is exactly the set of header fields an ICMP error quotes
//! verbatim from the offending packet: addresses, IP protocol, the IPv4
//! identification (UDP probes only; see below), and the first 8 bytes of the
//! transport header. The runtime indexes in-flight probes by this key and
//! pairs each sniffed reply with the oldest matching probe.
//!
//! Normalization rules, applied identically on the send and receive side so
//! both produce the same key:
//! - `ip_id` participates only for IPv4 UDP probes. ICMP echo replies and
//!   TCP responses quote nothing, so the id cannot be recovered from them.
//! - `flow_label` is recorded as zero. Transport-level raw sends leave the
//!   IPv6 flow label to the kernel, so v6 matching rests on the addresses
//!   and the transport head.

use anyhow::{Result, anyhow};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv6Addr};

use crate::packet::Packet;
use crate::packet::layers::{
    ICMPV4_ECHO_REQUEST, ICMPV6_ECHO_REQUEST, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP,
};
use pnet::packet::ipv4::Ipv4Packet;

/// Header fields quoted verbatim by ICMP errors; the probe/reply pairing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub ip_id: u16,
    pub flow_label: u32,
    pub transport_head: [u8; 8],
}

impl MatchKey {
    /// Key of a probe about to be sent.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        let src = packet.src_addr()?;
        let dst = packet.dst_addr()?;
        let transport_head = packet.transport_head()?;
        let protocol = match packet.transport_name() {
            Some("udp") => IPPROTO_UDP,
            Some("tcp") => IPPROTO_TCP,
            Some("icmpv4") => IPPROTO_ICMP,
            Some("icmpv6") => IPPROTO_ICMPV6,
            other => return Err(anyhow!("packet has no matchable transport layer: {other:?}")),
        };
        let ip_id = if src.is_ipv4() && protocol == IPPROTO_UDP {
            match packet.get_field("id")? {
                crate::packet::FieldValue::U16(v) => v,
                _ => 0,
            }
        } else {
            0
        };
        Ok(Self { src, dst, protocol, ip_id, flow_label: 0, transport_head })
    }

    /// Key recovered from the quoted IPv4 packet inside an ICMP error.
    ///
    /// `inner` starts at the quoted IP header and must include at least the
    /// header plus 8 bytes of transport.
    pub fn from_quote_v4(inner: &[u8]) -> Option<Self> {
        let ip = Ipv4Packet::new(inner)?;
        let header_len = usize::from(ip.get_header_length()) * 4;
        if inner.len() < header_len + 8 {
            return None;
        }
        let protocol = ip.get_next_level_protocol().0;
        let mut transport_head = [0u8; 8];
        transport_head.copy_from_slice(&inner[header_len..header_len + 8]);
        let ip_id = if protocol == IPPROTO_UDP { ip.get_identification() } else { 0 };
        Some(Self {
            src: IpAddr::V4(ip.get_source()),
            dst: IpAddr::V4(ip.get_destination()),
            protocol,
            ip_id,
            flow_label: 0,
            transport_head,
        })
    }

    /// Key recovered from the quoted IPv6 packet inside an ICMPv6 error.
    pub fn from_quote_v6(inner: &[u8]) -> Option<Self> {
        const IPV6_HEADER_LEN: usize = 40;
        if inner.len() < IPV6_HEADER_LEN + 8 {
            return None;
        }
        let protocol = inner[6];
        let src: [u8; 16] = inner[8..24].try_into().ok()?;
        let dst: [u8; 16] = inner[24..40].try_into().ok()?;
        let mut transport_head = [0u8; 8];
        transport_head.copy_from_slice(&inner[IPV6_HEADER_LEN..IPV6_HEADER_LEN + 8]);
        Some(Self {
            src: IpAddr::V6(Ipv6Addr::from(src)),
            dst: IpAddr::V6(Ipv6Addr::from(dst)),
            protocol,
            ip_id: 0,
            flow_label: 0,
            transport_head,
        })
    }

    /// Key reconstructed from an echo reply, which quotes nothing.
    ///
    /// The probe skeleton puts the flow identifier in both the ICMP
    /// identifier and (via the compensator) the checksum, so the original
    /// transport head is fully recoverable from the reply's id and sequence.
    pub fn from_echo_reply(local: IpAddr, responder: IpAddr, identifier: u16, sequence: u16) -> Self {
        let (protocol, echo_type) = if responder.is_ipv6() {
            (IPPROTO_ICMPV6, ICMPV6_ECHO_REQUEST)
        } else {
            (IPPROTO_ICMP, ICMPV4_ECHO_REQUEST)
        };
        let mut transport_head = [0u8; 8];
        transport_head[0] = echo_type;
        transport_head[2..4].copy_from_slice(&identifier.to_be_bytes()); // checksum == flow == id
        transport_head[4..6].copy_from_slice(&identifier.to_be_bytes());
        transport_head[6..8].copy_from_slice(&sequence.to_be_bytes());
        Self { src: local, dst: responder, protocol, ip_id: 0, flow_label: 0, transport_head }
    }

    /// Key reconstructed from a TCP RST / SYN-ACK sent by the destination.
    ///
    /// The response acknowledges ISN+1; the ISN carries (flow, seq), and the
    /// checksum equals the flow, so the original head can be rebuilt.
    pub fn from_tcp_reply(local: IpAddr, responder: IpAddr, segment: &[u8]) -> Option<Self> {
        if segment.len() < 20 {
            return None;
        }
        let their_src = u16::from_be_bytes([segment[0], segment[1]]);
        let their_dst = u16::from_be_bytes([segment[2], segment[3]]);
        let ack = u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]);
        let flags = segment[13];
        if flags & 0x10 == 0 || ack == 0 {
            // No acknowledgement to lead back to our ISN
            return None;
        }
        let isn = ack.wrapping_sub(1);
        let mut transport_head = [0u8; 8];
        transport_head[0..2].copy_from_slice(&their_dst.to_be_bytes()); // our src port
        transport_head[2..4].copy_from_slice(&their_src.to_be_bytes()); // our dst port
        transport_head[4..8].copy_from_slice(&isn.to_be_bytes());
        Some(Self {
            src: local,
            dst: responder,
            protocol: IPPROTO_TCP,
            ip_id: 0,
            flow_label: 0,
            transport_head,
        })
    }
}

/// In-flight probes indexed by matching key.
///
/// Identical keys are only possible with identical flow identifiers; the
/// queue makes the oldest probe win, per the collision policy, and the
/// caller emits a diagnostic when a collision is recorded.
#[derive(Default)]
pub struct OutstandingTable {
    map: HashMap<MatchKey, VecDeque<u64>>,
    len: usize,
}

impl OutstandingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sent probe. Returns `true` if the key collided with a
    /// probe already outstanding.
    pub fn insert(&mut self, key: MatchKey, probe_id: u64) -> bool {
        let queue = self.map.entry(key).or_default();
        let collision = !queue.is_empty();
        queue.push_back(probe_id);
        self.len += 1;
        collision
    }

    /// Pair a reply key with the oldest matching probe.
    pub fn take(&mut self, key: &MatchKey) -> Option<u64> {
        let (id, emptied) = {
            let queue = self.map.get_mut(key)?;
            let id = queue.pop_front()?;
            (id, queue.is_empty())
        };
        if emptied {
            self.map.remove(key);
        }
        self.len -= 1;
        Some(id)
    }

    /// Drop a specific probe (timeout fired before any reply).
    pub fn remove(&mut self, key: &MatchKey, probe_id: u64) {
        let mut emptied = false;
        if let Some(queue) = self.map.get_mut(key) {
            if let Some(pos) = queue.iter().position(|&id| id == probe_id) {
                queue.remove(pos);
                self.len -= 1;
            }
            emptied = queue.is_empty();
        }
        if emptied {
            self.map.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.len = 0;
    }
}
