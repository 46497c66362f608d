//! Seams between the probing runtime and the wire.
//!
//! The event loop drives a [`ProbeSink`] and a [`ReplySource`]; production
//! wires them to raw sockets, tests to the deterministic simulator. Nothing
//! above this module knows which is in play.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::config::TransportProtocol;

/// One fully-assembled probe ready for the wire.
pub struct WireProbe<'a> {
    /// Complete packet bytes, IP header included
    pub bytes: &'a [u8],
    pub dst: IpAddr,
    /// Hop limit, for senders that cannot ship their own IP header (IPv6)
    pub ttl: u8,
    pub transport: TransportProtocol,
}

/// Where probe packets go. `send` reports bytes written; partial writes are
/// the caller's problem (it retries, then fails the probe).
pub trait ProbeSink: Send {
    fn send(&mut self, probe: &WireProbe<'_>) -> std::io::Result<usize>;
}

/// Framing of a sniffed datagram, which differs per family and socket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffFrame {
    /// IPv4 raw socket: outer IP header included
    V4Packet,
    /// IPv6 ICMP socket: kernel strips the IPv6 header
    V6Icmp,
    /// IPv6 TCP socket: segment only
    V6Tcp,
}

/// A raw inbound datagram with its receive timestamp.
pub struct Sniffed {
    pub data: Vec<u8>,
    pub from: IpAddr,
    pub frame: SniffFrame,
    pub at: Instant,
}

/// Where replies come from. Blocks up to `timeout`; `None` means nothing
/// arrived. Runs on the sniffer thread, never on the event loop.
pub trait ReplySource: Send {
    fn recv(&mut self, timeout: Duration) -> anyhow::Result<Option<Sniffed>>;
}
