//! Default textual report: one line per TTL with addresses and per-probe
//! round-trip times, stars for unresponsive probes, progressive link lines
//! for MDA, and the lattice after termination.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::engine::event::{AlgorithmEvent, Event, MdaEvent, TerminationOutcome, TraceStatus, TracerouteEvent};
use crate::lattice::Lattice;

/// One probe's contribution to a TTL line, in arrival order.
#[derive(Debug, Clone)]
pub struct HopProbe {
    pub addr: Option<IpAddr>,
    pub rtt: Option<Duration>,
    pub flow_id: u16,
}

/// Accumulates events into the per-TTL map the textual report prints from.
pub struct Report {
    pub started_at: DateTime<Utc>,
    replies_by_ttl: BTreeMap<u8, Vec<HopProbe>>,
    pub status: Option<TraceStatus>,
    pub lattice: Option<Lattice>,
}

impl Report {
    pub fn new() -> Self {
        Self { started_at: Utc::now(), replies_by_ttl: BTreeMap::new(), status: None, lattice: None }
    }

    pub fn probes_at(&self, ttl: u8) -> &[HopProbe] {
        self.replies_by_ttl.get(&ttl).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn max_ttl_seen(&self) -> Option<u8> {
        self.replies_by_ttl.keys().next_back().copied()
    }

    fn push(&mut self, ttl: u8, probe: HopProbe) {
        self.replies_by_ttl.entry(ttl).or_default().push(probe);
    }

    /// Fold one event in; returns lines ready to print, if this event
    /// completed something worth showing.
    pub fn record(&mut self, event: &Event) -> Vec<String> {
        match event {
            Event::Algorithm { event: AlgorithmEvent::Traceroute(ev), .. } => match ev {
                TracerouteEvent::ProbeReply { probe, from, rtt, .. } => {
                    self.push(
                        probe.ttl,
                        HopProbe { addr: Some(*from), rtt: Some(*rtt), flow_id: probe.flow_id },
                    );
                    Vec::new()
                }
                TracerouteEvent::ProbeTimeout { probe } => {
                    self.push(probe.ttl, HopProbe { addr: None, rtt: None, flow_id: probe.flow_id });
                    Vec::new()
                }
                TracerouteEvent::TtlCompleted { ttl } => vec![self.ttl_line(*ttl)],
                TracerouteEvent::DestinationReached { .. } => Vec::new(),
            },
            Event::Algorithm { event: AlgorithmEvent::Mda(ev), .. } => match ev {
                MdaEvent::ProbeReply { probe, from, rtt, .. } => {
                    self.push(
                        probe.ttl,
                        HopProbe { addr: Some(*from), rtt: Some(*rtt), flow_id: probe.flow_id },
                    );
                    Vec::new()
                }
                MdaEvent::ProbeTimeout { probe } => {
                    self.push(probe.ttl, HopProbe { addr: None, rtt: None, flow_id: probe.flow_id });
                    Vec::new()
                }
                MdaEvent::NewLink { from, to, .. } => {
                    vec![format!("{} -> {}", fmt_addr(*from), fmt_addr(*to))]
                }
            },
            Event::AlgorithmTerminated { outcome, .. } => {
                match outcome {
                    TerminationOutcome::Traceroute { status } => self.status = Some(*status),
                    TerminationOutcome::Mda { status, lattice } => {
                        self.status = Some(*status);
                        self.lattice = Some(lattice.clone());
                    }
                }
                Vec::new()
            }
        }
    }

    /// Classic traceroute line: the address is printed when it changes,
    /// each probe contributes an RTT or a star, arrival order preserved.
    fn ttl_line(&self, ttl: u8) -> String {
        let mut line = format!("{ttl:>2} ");
        let mut last_addr: Option<IpAddr> = None;
        for probe in self.probes_at(ttl) {
            match (probe.addr, probe.rtt) {
                (Some(addr), rtt) => {
                    if last_addr != Some(addr) {
                        line.push_str(&format!("  {addr}"));
                        last_addr = Some(addr);
                    }
                    if let Some(rtt) = rtt {
                        line.push_str(&format!("  {:.3} ms", rtt.as_secs_f64() * 1000.0));
                    }
                }
                (None, _) => line.push_str("  *"),
            }
        }
        line
    }

    /// Final lattice section for MDA runs.
    pub fn lattice_lines(&self) -> Vec<String> {
        let Some(lattice) = &self.lattice else { return Vec::new() };
        let mut out = Vec::new();
        out.push("Lattice:".to_string());
        let mut buf = Vec::new();
        if lattice.dump(&mut buf).is_ok() {
            out.extend(String::from_utf8_lossy(&buf).lines().map(str::to_string));
        }
        out
    }
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}

fn fmt_addr(addr: Option<IpAddr>) -> String {
    match addr {
        Some(a) => a.to_string(),
        None => "*".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeMeta, ReplyKind};
    use std::net::Ipv4Addr;

    fn reply_event(ttl: u8, seq: u16, last: u8, ms: u64) -> Event {
        Event::Algorithm {
            instance: 0,
            event: AlgorithmEvent::Traceroute(TracerouteEvent::ProbeReply {
                probe: ProbeMeta { ttl, flow_id: 1, seq },
                from: IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)),
                kind: ReplyKind::TimeExceeded,
                rtt: Duration::from_millis(ms),
            }),
        }
    }

    #[test]
    fn ttl_line_groups_rtts_under_address() {
        let mut report = Report::new();
        report.record(&reply_event(1, 0, 1, 5));
        report.record(&reply_event(1, 1, 1, 6));
        report.record(&reply_event(1, 2, 1, 7));
        let lines = report.record(&Event::Algorithm {
            instance: 0,
            event: AlgorithmEvent::Traceroute(TracerouteEvent::TtlCompleted { ttl: 1 }),
        });
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert!(line.starts_with(" 1"));
        assert_eq!(line.matches("10.0.0.1").count(), 1, "address printed once: {line}");
        assert_eq!(line.matches("ms").count(), 3);
    }

    #[test]
    fn timeouts_render_as_stars() {
        let mut report = Report::new();
        for seq in 0..3 {
            report.record(&Event::Algorithm {
                instance: 0,
                event: AlgorithmEvent::Traceroute(TracerouteEvent::ProbeTimeout {
                    probe: ProbeMeta { ttl: 3, flow_id: 1, seq },
                }),
            });
        }
        let lines = report.record(&Event::Algorithm {
            instance: 0,
            event: AlgorithmEvent::Traceroute(TracerouteEvent::TtlCompleted { ttl: 3 }),
        });
        assert_eq!(lines[0].matches('*').count(), 3);
    }

    #[test]
    fn mixed_responders_print_both_addresses() {
        let mut report = Report::new();
        report.record(&reply_event(2, 0, 1, 5));
        report.record(&reply_event(2, 1, 2, 6));
        let lines = report.record(&Event::Algorithm {
            instance: 0,
            event: AlgorithmEvent::Traceroute(TracerouteEvent::TtlCompleted { ttl: 2 }),
        });
        assert!(lines[0].contains("10.0.0.1"));
        assert!(lines[0].contains("10.0.0.2"));
    }

    #[test]
    fn termination_captures_lattice() {
        let mut report = Report::new();
        let mut lattice = Lattice::new();
        lattice.link(1, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))), None, 9);
        report.record(&Event::AlgorithmTerminated {
            instance: 0,
            outcome: TerminationOutcome::Mda {
                status: TraceStatus::HopLimitExhausted,
                lattice,
            },
        });
        let lines = report.lattice_lines();
        assert_eq!(lines[0], "Lattice:");
        assert!(lines.iter().any(|l| l.contains("10.0.0.1 -> *")));
    }
}
