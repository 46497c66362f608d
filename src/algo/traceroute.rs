//! Paris traceroute.
//!
//! Every probe of a trace carries the same flow identifier, so each one
//! takes a single deterministic path through per-flow load balancers and
//! classic traceroute's phantom branches never appear. Levels advance one
//! TTL at a time: send `num_probes`, wait until each has a reply or
//! timeout, classify, move on or stop.

use anyhow::Result;
use std::net::IpAddr;

use super::flow::{icmp_flow_id, paris_flow_id};
use crate::config::{TracerouteOptions, TransportProtocol};
use crate::engine::event::{AlgorithmEvent, ProbeOutcome, TerminationOutcome, TraceStatus, TracerouteEvent};
use crate::engine::instance::{AlgoCtx, Algorithm};
use crate::probe::ProbeSkeleton;

pub struct ParisTraceroute {
    opts: TracerouteOptions,
    dst: IpAddr,
    flow_id: u16,
    ttl: u8,
    /// Outcomes still expected for the current TTL
    pending: usize,
    dest_reached: bool,
    seq: u16,
}

impl ParisTraceroute {
    pub fn new(opts: TracerouteOptions, skeleton: &ProbeSkeleton) -> Self {
        let flow_id = match opts.transport {
            TransportProtocol::Udp | TransportProtocol::Tcp => {
                paris_flow_id(opts.src_port, opts.dst_port)
            }
            TransportProtocol::Icmp => icmp_flow_id(),
        };
        let ttl = opts.min_ttl;
        Self { opts, dst: skeleton.dst, flow_id, ttl, pending: 0, dest_reached: false, seq: 0 }
    }

    fn send_level(&mut self, ctx: &mut AlgoCtx<'_>) {
        self.pending = self.opts.num_probes;
        for _ in 0..self.opts.num_probes {
            ctx.send_probe(self.ttl, self.flow_id, self.seq);
            self.seq = self.seq.wrapping_add(1);
        }
    }

    fn complete_level(&mut self, ctx: &mut AlgoCtx<'_>) {
        ctx.emit(AlgorithmEvent::Traceroute(TracerouteEvent::TtlCompleted { ttl: self.ttl }));
        if self.dest_reached {
            ctx.emit(AlgorithmEvent::Traceroute(TracerouteEvent::DestinationReached {
                ttl: self.ttl,
            }));
            ctx.terminate(TerminationOutcome::Traceroute {
                status: TraceStatus::DestinationReached { ttl: self.ttl },
            });
        } else if self.ttl >= self.opts.max_ttl {
            ctx.terminate(TerminationOutcome::Traceroute { status: TraceStatus::HopLimitExhausted });
        } else {
            self.ttl += 1;
            self.send_level(ctx);
        }
    }
}

impl Algorithm for ParisTraceroute {
    fn start(&mut self, ctx: &mut AlgoCtx<'_>) -> Result<()> {
        self.send_level(ctx);
        Ok(())
    }

    fn on_outcome(&mut self, outcome: ProbeOutcome, ctx: &mut AlgoCtx<'_>) -> Result<()> {
        match outcome {
            ProbeOutcome::Reply { probe, from, kind, rtt } => {
                if from == self.dst || kind.destination_reached() {
                    self.dest_reached = true;
                }
                ctx.emit(AlgorithmEvent::Traceroute(TracerouteEvent::ProbeReply {
                    probe,
                    from,
                    kind,
                    rtt,
                }));
            }
            ProbeOutcome::Timeout { probe } | ProbeOutcome::SendFailed { probe } => {
                ctx.emit(AlgorithmEvent::Traceroute(TracerouteEvent::ProbeTimeout { probe }));
            }
        }
        self.pending = self.pending.saturating_sub(1);
        if self.pending == 0 {
            self.complete_level(ctx);
        }
        Ok(())
    }
}
