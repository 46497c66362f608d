//! Probe and reply model.
//!
//! A probe wraps one assembled packet with its timestamps, matching key, and
//! the owning algorithm's context. Replies are classified ICMP (or TCP)
//! responses paired back to their probe through the matching key.

pub mod matching;

pub use matching::{MatchKey, OutstandingTable};

use anyhow::{Result, bail};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::config::TransportProtocol;
use crate::packet::{FieldValue, Packet};

/// Caller context carried by every probe and echoed back in outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeMeta {
    pub ttl: u8,
    pub flow_id: u16,
    pub seq: u16,
}

/// A probe owned by the runtime while in flight.
///
/// Once sent, the packet bytes are frozen until the probe is handed back to
/// its algorithm as a reply or timeout.
pub struct Probe {
    pub packet: Packet,
    pub key: MatchKey,
    pub meta: ProbeMeta,
    pub send_time: Option<Instant>,
}

impl Probe {
    pub fn new(packet: Packet, meta: ProbeMeta) -> Result<Self> {
        let key = MatchKey::from_packet(&packet)?;
        Ok(Self { packet, key, meta, send_time: None })
    }
}

/// Classification of a received response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// ICMP Time Exceeded: a router on the path revealed itself
    TimeExceeded,
    /// ICMP port unreachable: the UDP destination was reached
    DestUnreachablePort,
    /// Echo reply: the ICMP destination was reached
    EchoReply,
    /// TCP RST or SYN-ACK: the TCP destination was reached
    TcpReply,
    /// Anything else worth delivering (type, code)
    Other(u8, u8),
}

impl ReplyKind {
    /// Whether this reply means the destination host answered.
    pub fn destination_reached(&self) -> bool {
        matches!(self, ReplyKind::DestUnreachablePort | ReplyKind::EchoReply | ReplyKind::TcpReply)
    }
}

/// A parsed response carrying the responding hop and receive timestamp.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Source address of the response (= the responding hop)
    pub from: IpAddr,
    pub kind: ReplyKind,
    pub recv_time: Instant,
    /// Matching key recovered from the quoted packet
    pub key: MatchKey,
}

impl Reply {
    /// Round-trip time against the paired probe. Strictly positive for any
    /// probe that was actually sent before the reply arrived.
    pub fn rtt(&self, probe: &Probe) -> Option<Duration> {
        probe.send_time.map(|sent| self.recv_time.saturating_duration_since(sent))
    }
}

/// Immutable description of the probes an algorithm instance emits; cloned
/// into a concrete packet per (ttl, flow, seq).
#[derive(Debug, Clone)]
pub struct ProbeSkeleton {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub transport: TransportProtocol,
    pub src_port: u16,
    pub dst_port: u16,
}

impl ProbeSkeleton {
    pub fn is_ipv6(&self) -> bool {
        self.dst.is_ipv6()
    }

    fn stack(&self) -> Result<[&'static str; 2]> {
        let ip = if self.is_ipv6() { "ipv6" } else { "ipv4" };
        let transport = match (self.transport, self.is_ipv6()) {
            (TransportProtocol::Udp, _) => "udp",
            (TransportProtocol::Tcp, _) => "tcp",
            (TransportProtocol::Icmp, false) => "icmpv4",
            (TransportProtocol::Icmp, true) => "icmpv6",
        };
        if self.src.is_ipv6() != self.dst.is_ipv6() {
            bail!("source and destination address families differ");
        }
        Ok([ip, transport])
    }

    /// Assemble one probe packet. The flow identifier ends up in the
    /// transport checksum via the payload compensator; `ip_id` disambiguates
    /// same-flow UDP probes in the matching key.
    pub fn build(&self, ttl: u8, flow_id: u16, seq: u16, ip_id: u16) -> Result<Packet> {
        let mut packet = Packet::new();
        packet.set_protocols(&self.stack()?)?;
        match (self.src, self.dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                packet.set_field("src_ip", FieldValue::V4(s))?;
                packet.set_field("dst_ip", FieldValue::V4(d))?;
                packet.set_field("id", FieldValue::U16(ip_id))?;
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                packet.set_field("src_ip", FieldValue::V6(s))?;
                packet.set_field("dst_ip", FieldValue::V6(d))?;
            }
            _ => bail!("source and destination address families differ"),
        }
        packet.set_field("ttl", FieldValue::U8(ttl))?;
        match self.transport {
            TransportProtocol::Udp => {
                packet.set_field("src_port", FieldValue::U16(self.src_port))?;
                packet.set_field("dst_port", FieldValue::U16(self.dst_port))?;
            }
            TransportProtocol::Tcp => {
                packet.set_field("src_port", FieldValue::U16(self.src_port))?;
                packet.set_field("dst_port", FieldValue::U16(self.dst_port))?;
                // The ISN carries (flow, seq) so a RST's acknowledgement
                // number leads back to the probe.
                let isn = (u32::from(flow_id) << 16) | u32::from(seq);
                packet.set_field("seq_num", FieldValue::U32(isn))?;
            }
            TransportProtocol::Icmp => {
                packet.set_field("identifier", FieldValue::U16(flow_id))?;
                packet.set_field("sequence", FieldValue::U16(seq))?;
            }
        }
        packet.payload_resize(2);
        packet.finalize()?;
        packet.set_flow_id(flow_id)?;
        Ok(packet)
    }
}
