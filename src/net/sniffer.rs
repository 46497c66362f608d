//! The sniffer thread: drain raw datagrams, classify, extract candidate
//! matching keys, and hand them to the event loop over a channel.
//!
//! Matching against the outstanding table happens in the loop, not here;
//! the thread only parses. Runs blocking I/O on a dedicated OS thread and
//! polls the cancellation token between receives.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::transport::{ReplySource, SniffFrame, Sniffed};
use crate::packet::layers::{IPPROTO_ICMP, IPPROTO_TCP};
use crate::probe::{MatchKey, ReplyKind};

const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_TIME_EXCEEDED: u8 = 3;
const ICMPV6_ECHO_REPLY: u8 = 129;
const ICMPV6_PORT_UNREACHABLE_CODE: u8 = 4;

/// A parsed response ready for pairing in the event loop.
#[derive(Debug, Clone)]
pub struct ReplyCandidate {
    pub from: IpAddr,
    pub kind: ReplyKind,
    pub key: MatchKey,
    pub recv_time: Instant,
}

/// Spawn the sniffer on a dedicated thread, feeding `tx`.
pub fn spawn_sniffer(
    mut source: Box<dyn ReplySource>,
    local: IpAddr,
    tx: UnboundedSender<ReplyCandidate>,
    cancel: CancellationToken,
    debug: bool,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match source.recv(Duration::from_millis(100)) {
                Ok(Some(sniffed)) => {
                    if let Some(candidate) = parse_sniffed(&sniffed, local) {
                        if tx.send(candidate).is_err() {
                            break; // loop went away
                        }
                    } else if debug {
                        eprintln!(
                            "sniffer: dropped unmatched datagram from {} ({} bytes)",
                            sniffed.from,
                            sniffed.data.len()
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    if debug {
                        eprintln!("sniffer: receive error: {e}");
                    }
                }
            }
        }
    })
}

/// Parse one raw datagram into a reply candidate.
pub fn parse_sniffed(sniffed: &Sniffed, local: IpAddr) -> Option<ReplyCandidate> {
    match sniffed.frame {
        SniffFrame::V4Packet => parse_v4(&sniffed.data, local, sniffed.at),
        SniffFrame::V6Icmp => parse_v6_icmp(&sniffed.data, sniffed.from, local, sniffed.at),
        SniffFrame::V6Tcp => {
            let key = MatchKey::from_tcp_reply(local, sniffed.from, &sniffed.data)?;
            Some(ReplyCandidate {
                from: sniffed.from,
                kind: ReplyKind::TcpReply,
                key,
                recv_time: sniffed.at,
            })
        }
    }
}

fn parse_v4(data: &[u8], local: IpAddr, at: Instant) -> Option<ReplyCandidate> {
    let outer = Ipv4Packet::new(data)?;
    let header_len = usize::from(outer.get_header_length()) * 4;
    if data.len() < header_len + 8 {
        return None;
    }
    let responder = IpAddr::V4(outer.get_source());
    let upper = &data[header_len..];

    match outer.get_next_level_protocol().0 {
        IPPROTO_ICMP => parse_v4_icmp(upper, responder, local, at),
        IPPROTO_TCP => {
            let key = MatchKey::from_tcp_reply(local, responder, upper)?;
            Some(ReplyCandidate { from: responder, kind: ReplyKind::TcpReply, key, recv_time: at })
        }
        _ => None,
    }
}

fn parse_v4_icmp(icmp_data: &[u8], responder: IpAddr, local: IpAddr, at: Instant) -> Option<ReplyCandidate> {
    let icmp = IcmpPacket::new(icmp_data)?;
    let icmp_type = icmp.get_icmp_type();
    let code = icmp.get_icmp_code().0;

    if icmp_type == IcmpTypes::EchoReply {
        if icmp_data.len() < 8 {
            return None;
        }
        let identifier = u16::from_be_bytes([icmp_data[4], icmp_data[5]]);
        let sequence = u16::from_be_bytes([icmp_data[6], icmp_data[7]]);
        let key = MatchKey::from_echo_reply(local, responder, identifier, sequence);
        return Some(ReplyCandidate { from: responder, kind: ReplyKind::EchoReply, key, recv_time: at });
    }

    let kind = if icmp_type == IcmpTypes::TimeExceeded {
        ReplyKind::TimeExceeded
    } else if icmp_type == IcmpTypes::DestinationUnreachable {
        if code == 3 { ReplyKind::DestUnreachablePort } else { ReplyKind::Other(icmp_type.0, code) }
    } else {
        return None;
    };

    // ICMP error: 8-byte header, then the quoted offender
    let key = MatchKey::from_quote_v4(icmp_data.get(8..)?)?;
    Some(ReplyCandidate { from: responder, kind, key, recv_time: at })
}

fn parse_v6_icmp(icmp_data: &[u8], responder: IpAddr, local: IpAddr, at: Instant) -> Option<ReplyCandidate> {
    if icmp_data.len() < 8 {
        return None;
    }
    let icmp_type = icmp_data[0];
    let code = icmp_data[1];

    if icmp_type == ICMPV6_ECHO_REPLY {
        let identifier = u16::from_be_bytes([icmp_data[4], icmp_data[5]]);
        let sequence = u16::from_be_bytes([icmp_data[6], icmp_data[7]]);
        let key = MatchKey::from_echo_reply(local, responder, identifier, sequence);
        return Some(ReplyCandidate { from: responder, kind: ReplyKind::EchoReply, key, recv_time: at });
    }

    let kind = match icmp_type {
        ICMPV6_TIME_EXCEEDED => ReplyKind::TimeExceeded,
        ICMPV6_DEST_UNREACHABLE if code == ICMPV6_PORT_UNREACHABLE_CODE => ReplyKind::DestUnreachablePort,
        ICMPV6_DEST_UNREACHABLE => ReplyKind::Other(icmp_type, code),
        _ => return None,
    };

    let key = MatchKey::from_quote_v6(icmp_data.get(8..)?)?;
    Some(ReplyCandidate { from: responder, kind, key, recv_time: at })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportProtocol;
    use crate::packet::checksum::{finish, sum_bytes};
    use crate::probe::ProbeSkeleton;
    use std::net::Ipv4Addr;

    fn local() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))
    }

    fn dst() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))
    }

    /// Minimal outer IPv4 header around an ICMP message.
    fn wrap_outer(from: Ipv4Addr, to: Ipv4Addr, icmp: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; 20 + icmp.len()];
        packet[0] = 0x45;
        let total = packet.len() as u16;
        packet[2..4].copy_from_slice(&total.to_be_bytes());
        packet[8] = 64;
        packet[9] = IPPROTO_ICMP;
        packet[12..16].copy_from_slice(&from.octets());
        packet[16..20].copy_from_slice(&to.octets());
        let cksum = finish(sum_bytes(&packet[..20]));
        packet[10..12].copy_from_slice(&cksum.to_be_bytes());
        packet[20..].copy_from_slice(icmp);
        packet
    }

    fn time_exceeded_for(probe_bytes: &[u8], router: Ipv4Addr) -> Vec<u8> {
        let quote_len = 28.min(probe_bytes.len());
        let mut icmp = vec![0u8; 8 + quote_len];
        icmp[0] = 11;
        icmp[8..8 + quote_len].copy_from_slice(&probe_bytes[..quote_len]);
        let cksum = finish(sum_bytes(&icmp));
        icmp[2..4].copy_from_slice(&cksum.to_be_bytes());
        wrap_outer(router, Ipv4Addr::new(192, 0, 2, 1), &icmp)
    }

    #[test]
    fn time_exceeded_recovers_probe_key() {
        let skeleton = ProbeSkeleton {
            src: local(),
            dst: dst(),
            transport: TransportProtocol::Udp,
            src_port: 33456,
            dst_port: 33457,
        };
        let probe = skeleton.build(3, 0x4242, 1, 55).unwrap();
        let sent_key = MatchKey::from_packet(&probe).unwrap();

        let router = Ipv4Addr::new(10, 0, 0, 3);
        let datagram = time_exceeded_for(probe.bytes(), router);
        let sniffed = Sniffed {
            data: datagram,
            from: IpAddr::V4(router),
            frame: SniffFrame::V4Packet,
            at: Instant::now(),
        };

        let candidate = parse_sniffed(&sniffed, local()).unwrap();
        assert_eq!(candidate.kind, ReplyKind::TimeExceeded);
        assert_eq!(candidate.from, IpAddr::V4(router));
        assert_eq!(candidate.key, sent_key);
    }

    #[test]
    fn port_unreachable_classified_as_destination() {
        let skeleton = ProbeSkeleton {
            src: local(),
            dst: dst(),
            transport: TransportProtocol::Udp,
            src_port: 33456,
            dst_port: 33457,
        };
        let probe = skeleton.build(5, 0x0101, 0, 9).unwrap();

        let mut icmp = vec![0u8; 8 + 28];
        icmp[0] = 3; // destination unreachable
        icmp[1] = 3; // port
        icmp[8..36].copy_from_slice(&probe.bytes()[..28]);
        let datagram = wrap_outer(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(192, 0, 2, 1), &icmp);
        let sniffed = Sniffed {
            data: datagram,
            from: dst(),
            frame: SniffFrame::V4Packet,
            at: Instant::now(),
        };

        let candidate = parse_sniffed(&sniffed, local()).unwrap();
        assert_eq!(candidate.kind, ReplyKind::DestUnreachablePort);
        assert!(candidate.kind.destination_reached());
    }

    #[test]
    fn echo_reply_matches_icmp_probe() {
        let skeleton = ProbeSkeleton {
            src: local(),
            dst: dst(),
            transport: TransportProtocol::Icmp,
            src_port: 0,
            dst_port: 0,
        };
        let probe = skeleton.build(4, 0x0BEE, 7, 0).unwrap();
        let sent_key = MatchKey::from_packet(&probe).unwrap();

        let mut icmp = vec![0u8; 10];
        icmp[0] = 0; // echo reply
        icmp[4..6].copy_from_slice(&0x0BEEu16.to_be_bytes());
        icmp[6..8].copy_from_slice(&7u16.to_be_bytes());
        let datagram = wrap_outer(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(192, 0, 2, 1), &icmp);
        let sniffed = Sniffed {
            data: datagram,
            from: dst(),
            frame: SniffFrame::V4Packet,
            at: Instant::now(),
        };

        let candidate = parse_sniffed(&sniffed, local()).unwrap();
        assert_eq!(candidate.kind, ReplyKind::EchoReply);
        assert_eq!(candidate.key, sent_key);
    }

    #[test]
    fn garbage_is_dropped() {
        let sniffed = Sniffed {
            data: vec![0x45, 0x00, 0x00],
            from: dst(),
            frame: SniffFrame::V4Packet,
            at: Instant::now(),
        };
        assert!(parse_sniffed(&sniffed, local()).is_none());
    }
}
