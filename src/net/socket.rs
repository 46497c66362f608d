//! Raw sockets for probing and sniffing, via socket2.
//!
//! The send path ships the assembler's bytes verbatim: IPv4 uses
//! `IP_HDRINCL`, IPv6 sends from the transport header up and sets the hop
//! limit per probe. The receive path is one raw ICMP socket per family,
//! plus a raw TCP socket when tracerouting over TCP.

use anyhow::{Context, Result, anyhow};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use super::transport::{ProbeSink, ReplySource, SniffFrame, Sniffed, WireProbe};
use crate::config::TransportProtocol;

const IPV6_HEADER_LEN: usize = 40;
const RECV_POLL: Duration = Duration::from_millis(50);

fn raw_socket(ipv6: bool, protocol: Protocol) -> Result<Socket> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::RAW, Some(protocol))?;
    socket.set_nonblocking(false)?;
    Ok(socket)
}

fn transport_protocol(transport: TransportProtocol, ipv6: bool) -> Protocol {
    match (transport, ipv6) {
        (TransportProtocol::Udp, _) => Protocol::UDP,
        (TransportProtocol::Tcp, _) => Protocol::TCP,
        (TransportProtocol::Icmp, false) => Protocol::ICMPV4,
        (TransportProtocol::Icmp, true) => Protocol::ICMPV6,
    }
}

/// Sender backed by one raw socket per transport.
pub struct RawProbeSink {
    socket: Socket,
    ipv6: bool,
}

impl RawProbeSink {
    pub fn new(ipv6: bool, transport: TransportProtocol) -> Result<Self> {
        let socket = raw_socket(ipv6, transport_protocol(transport, ipv6))
            .context("creating raw send socket")?;
        if !ipv6 {
            // The assembler builds the full IPv4 header
            socket.set_header_included_v4(true).context("enabling IP_HDRINCL")?;
        }
        Ok(Self { socket, ipv6 })
    }
}

impl ProbeSink for RawProbeSink {
    fn send(&mut self, probe: &WireProbe<'_>) -> std::io::Result<usize> {
        let addr = SockAddr::from(SocketAddr::new(probe.dst, 0));
        if self.ipv6 {
            // Kernel owns the IPv6 header; hop limit goes through a sockopt
            self.socket.set_unicast_hops_v6(u32::from(probe.ttl))?;
            let payload = &probe.bytes[IPV6_HEADER_LEN..];
            self.socket.send_to(payload, &addr).map(|n| n + IPV6_HEADER_LEN)
        } else {
            self.socket.send_to(probe.bytes, &addr)
        }
    }
}

/// Sniffer sockets: ICMP always, TCP when the probes are TCP.
pub struct RawReplySource {
    icmp: Socket,
    tcp: Option<Socket>,
    ipv6: bool,
    buf: [u8; 1500],
}

impl RawReplySource {
    pub fn new(ipv6: bool, want_tcp: bool) -> Result<Self> {
        let icmp = raw_socket(ipv6, if ipv6 { Protocol::ICMPV6 } else { Protocol::ICMPV4 })
            .context("creating raw ICMP sniffer socket")?;
        icmp.set_recv_buffer_size(1024 * 1024)?;
        icmp.set_read_timeout(Some(RECV_POLL))?;
        let tcp = if want_tcp {
            let socket = raw_socket(ipv6, Protocol::TCP).context("creating raw TCP sniffer socket")?;
            socket.set_nonblocking(true)?;
            Some(socket)
        } else {
            None
        };
        Ok(Self { icmp, tcp, ipv6, buf: [0u8; 1500] })
    }

    fn recv_one(socket: &Socket, buf: &mut [u8]) -> std::io::Result<(usize, IpAddr)> {
        let uninit: &mut [MaybeUninit<u8>] = unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len())
        };
        let (len, addr) = socket.recv_from(uninit)?;
        let ip = addr
            .as_socket()
            .map(|s| s.ip())
            .ok_or_else(|| std::io::Error::other("sender address is not an inet address"))?;
        Ok((len, ip))
    }

    fn frame(&self, tcp: bool) -> SniffFrame {
        match (self.ipv6, tcp) {
            (false, _) => SniffFrame::V4Packet,
            (true, false) => SniffFrame::V6Icmp,
            (true, true) => SniffFrame::V6Tcp,
        }
    }
}

impl ReplySource for RawReplySource {
    fn recv(&mut self, timeout: Duration) -> Result<Option<Sniffed>> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::recv_one(&self.icmp, &mut self.buf) {
                Ok((len, from)) => {
                    return Ok(Some(Sniffed {
                        data: self.buf[..len].to_vec(),
                        from,
                        frame: self.frame(false),
                        at: Instant::now(),
                    }));
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(tcp) = &self.tcp {
                match Self::recv_one(tcp, &mut self.buf) {
                    Ok((len, from)) => {
                        return Ok(Some(Sniffed {
                            data: self.buf[..len].to_vec(),
                            from,
                            frame: self.frame(true),
                            at: Instant::now(),
                        }));
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }
}

/// Verify raw-socket privileges up front so the failure is a clear
/// diagnostic instead of a mid-trace send error.
pub fn check_permissions(ipv6: bool, transport: TransportProtocol) -> Result<()> {
    let send = RawProbeSink::new(ipv6, transport);
    let sniff = RawReplySource::new(ipv6, transport == TransportProtocol::Tcp);
    if send.is_ok() && sniff.is_ok() {
        return Ok(());
    }
    let binary = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "paristrace".to_string());
    Err(anyhow!(
        "raw sockets require administrative privilege.\n\n\
         Fix options:\n\
         \u{2022} Run with sudo: sudo paristrace <destination>\n\
         \u{2022} Add capability: sudo setcap cap_net_raw+ep {binary}"
    ))
}

/// Local source address the kernel would pick to reach `target`.
///
/// Connects a throwaway UDP socket (no packets are sent) and reads the
/// chosen address back through getsockname.
pub fn detect_source_ip(target: IpAddr) -> Result<IpAddr> {
    let domain = if target.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.connect(&SockAddr::from(SocketAddr::new(target, 53)))?;
    let local = socket.local_addr()?;
    let local_addr: SocketAddr = local
        .as_socket()
        .ok_or_else(|| anyhow!("failed to read local socket address"))?;
    Ok(local_addr.ip())
}
