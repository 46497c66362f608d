//! Deterministic in-process network simulator.
//!
//! Implements the same sink/source seams as the raw sockets, so the whole
//! engine (assembler, sniffer parse, matching, algorithms) runs unchanged
//! against a scripted topology. Routers hash the probe's flow fields to
//! pick among parallel next-hops, reply with byte-exact ICMP errors quoting
//! the offending header, and deliveries arrive after a per-hop delay on the
//! simulated clock (realized as real sleeps in the source).
//!
//! IPv4 only; the v6 paths are covered by unit tests on the parsers.

use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::net::{ProbeSink, ReplySource, SniffFrame, Sniffed, WireProbe};
use crate::packet::checksum::{finish, sum_bytes};
use crate::packet::layers::{IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};

/// A layered test topology: `layers[t - 1]` holds the routers answering at
/// TTL t, `None` being a silent one. A row with several routers is a
/// per-flow load balancer; flows hash across it. The destination sits one
/// hop past the last layer.
#[derive(Debug, Clone)]
pub struct SimTopology {
    pub layers: Vec<Vec<Option<Ipv4Addr>>>,
    pub destination: Ipv4Addr,
    pub link_delay: Duration,
}

impl SimTopology {
    /// A straight chain of responsive routers ending at `destination`.
    pub fn chain(hops: &[Ipv4Addr], destination: Ipv4Addr) -> Self {
        Self {
            layers: hops.iter().map(|&h| vec![Some(h)]).collect(),
            destination,
            link_delay: Duration::from_millis(2),
        }
    }

    fn depth(&self) -> usize {
        self.layers.len() + 1
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Delivery {
    at: Instant,
    seq: u64,
    from: IpAddr,
    data: Vec<u8>,
}

struct Shared {
    topo: SimTopology,
    local: Ipv4Addr,
    queue: Mutex<(BinaryHeap<Reverse<Delivery>>, u64)>,
    arrived: Condvar,
}

/// Handle to a simulated network; hand its sink and source to the loop.
#[derive(Clone)]
pub struct SimNet {
    shared: Arc<Shared>,
}

/// Probe fields the simulated routers care about.
struct ParsedProbe<'a> {
    header: &'a [u8],
    transport: &'a [u8],
    protocol: u8,
    ttl: u8,
    src: Ipv4Addr,
}

fn parse_probe(bytes: &[u8]) -> Option<ParsedProbe<'_>> {
    if bytes.len() < 20 || bytes[0] >> 4 != 4 {
        return None;
    }
    let header_len = usize::from(bytes[0] & 0x0F) * 4;
    if bytes.len() < header_len + 8 {
        return None;
    }
    Some(ParsedProbe {
        header: &bytes[..header_len],
        transport: &bytes[header_len..],
        protocol: bytes[9],
        ttl: bytes[8],
        src: Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]),
    })
}

/// The per-flow hash a load-balancing router applies: addresses, protocol,
/// and the first four shorts of the transport header (ports + length or
/// sequence + checksum for UDP; the checksum is the covert flow carrier).
fn flow_hash(probe: &ParsedProbe<'_>) -> u32 {
    let mut hash = u32::from(probe.protocol);
    hash = hash.wrapping_add(sum_bytes(&probe.header[12..20]));
    hash = hash.wrapping_add(sum_bytes(&probe.transport[..8]));
    hash
}

fn outer_v4(from: Ipv4Addr, to: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 20 + payload.len()];
    packet[0] = 0x45;
    let total_len = packet.len() as u16;
    packet[2..4].copy_from_slice(&total_len.to_be_bytes());
    packet[8] = 64;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&from.octets());
    packet[16..20].copy_from_slice(&to.octets());
    let cksum = finish(sum_bytes(&packet[..20]));
    packet[10..12].copy_from_slice(&cksum.to_be_bytes());
    packet[20..].copy_from_slice(payload);
    packet
}

fn icmp_error(icmp_type: u8, code: u8, quote: &[u8]) -> Vec<u8> {
    let mut icmp = vec![0u8; 8 + quote.len()];
    icmp[0] = icmp_type;
    icmp[1] = code;
    icmp[8..].copy_from_slice(quote);
    let cksum = finish(sum_bytes(&icmp));
    icmp[2..4].copy_from_slice(&cksum.to_be_bytes());
    icmp
}

impl SimNet {
    pub fn new(topo: SimTopology, local: Ipv4Addr) -> Self {
        Self {
            shared: Arc::new(Shared {
                topo,
                local,
                queue: Mutex::new((BinaryHeap::new(), 0)),
                arrived: Condvar::new(),
            }),
        }
    }

    pub fn local_addr(&self) -> IpAddr {
        IpAddr::V4(self.shared.local)
    }

    pub fn sink(&self) -> Box<dyn ProbeSink> {
        Box::new(SimSink { shared: self.shared.clone() })
    }

    pub fn source(&self) -> Box<dyn ReplySource> {
        Box::new(SimSource { shared: self.shared.clone() })
    }
}

struct SimSink {
    shared: Arc<Shared>,
}

impl SimSink {
    fn deliver(&self, from: Ipv4Addr, data: Vec<u8>, hops: usize) {
        let delay = self.shared.topo.link_delay * (hops as u32);
        let mut queue = self.shared.queue.lock();
        let seq = queue.1;
        queue.1 += 1;
        queue.0.push(Reverse(Delivery {
            at: Instant::now() + delay,
            seq,
            from: IpAddr::V4(from),
            data,
        }));
        self.shared.arrived.notify_one();
    }

    fn destination_reply(&self, probe: &ParsedProbe<'_>) {
        let topo = &self.shared.topo;
        let dest = topo.destination;
        let hops = topo.depth();
        match probe.protocol {
            IPPROTO_UDP => {
                // Closed port: destination unreachable, code 3
                let mut quote = probe.header.to_vec();
                quote.extend_from_slice(&probe.transport[..8]);
                let icmp = icmp_error(3, 3, &quote);
                self.deliver(dest, outer_v4(dest, probe.src, IPPROTO_ICMP, &icmp), hops);
            }
            IPPROTO_ICMP => {
                if probe.transport[0] != 8 {
                    return;
                }
                let mut echo = vec![0u8; 8];
                echo[4..8].copy_from_slice(&probe.transport[4..8]); // id + seq
                let cksum = finish(sum_bytes(&echo));
                echo[2..4].copy_from_slice(&cksum.to_be_bytes());
                self.deliver(dest, outer_v4(dest, probe.src, IPPROTO_ICMP, &echo), hops);
            }
            IPPROTO_TCP => {
                // RST+ACK acknowledging ISN+1
                let isn = u32::from_be_bytes(probe.transport[4..8].try_into().unwrap());
                let mut segment = vec![0u8; 20];
                segment[0..2].copy_from_slice(&probe.transport[2..4]); // their src = our dst port
                segment[2..4].copy_from_slice(&probe.transport[0..2]);
                segment[8..12].copy_from_slice(&isn.wrapping_add(1).to_be_bytes());
                segment[12] = 0x50;
                segment[13] = 0x14; // RST|ACK
                self.deliver(dest, outer_v4(dest, probe.src, IPPROTO_TCP, &segment), hops);
            }
            _ => {}
        }
    }
}

impl ProbeSink for SimSink {
    fn send(&mut self, probe: &WireProbe<'_>) -> std::io::Result<usize> {
        let Some(parsed) = parse_probe(probe.bytes) else {
            return Err(std::io::Error::other("simulator only routes IPv4 probes"));
        };
        let topo = &self.shared.topo;
        let ttl = usize::from(parsed.ttl);
        if ttl == 0 {
            return Err(std::io::Error::other("ttl zero never leaves the host"));
        }
        if ttl <= topo.layers.len() {
            let row = &topo.layers[ttl - 1];
            let idx = flow_hash(&parsed) as usize % row.len();
            if let Some(router) = row[idx] {
                let mut quote = parsed.header.to_vec();
                quote.extend_from_slice(&parsed.transport[..8]);
                let icmp = icmp_error(11, 0, &quote);
                self.deliver(router, outer_v4(router, parsed.src, IPPROTO_ICMP, &icmp), ttl);
            }
            // Silent router: the probe vanishes
        } else {
            self.destination_reply(&parsed);
        }
        Ok(probe.bytes.len())
    }
}

struct SimSource {
    shared: Arc<Shared>,
}

impl ReplySource for SimSource {
    fn recv(&mut self, timeout: Duration) -> anyhow::Result<Option<Sniffed>> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        loop {
            let now = Instant::now();
            if let Some(Reverse(head)) = queue.0.peek() {
                if head.at <= now {
                    let Reverse(delivery) = queue.0.pop().unwrap();
                    return Ok(Some(Sniffed {
                        data: delivery.data,
                        from: delivery.from,
                        frame: SniffFrame::V4Packet,
                        at: Instant::now(),
                    }));
                }
                let wake = head.at.min(deadline);
                if self.shared.arrived.wait_until(&mut queue, wake).timed_out() && wake >= deadline {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
            } else {
                if now >= deadline {
                    return Ok(None);
                }
                let _ = self.shared.arrived.wait_until(&mut queue, deadline);
            }
        }
    }
}
