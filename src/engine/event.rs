//! Event types flowing from the algorithms up to the user handler, and the
//! probe outcomes flowing from the runtime down to the algorithms.

use std::net::IpAddr;
use std::time::Duration;

use crate::lattice::Lattice;
use crate::probe::{ProbeMeta, ReplyKind};

pub type InstanceId = usize;

/// Outcome of one probe, delivered to its owning algorithm. Every sent
/// probe produces exactly one of these.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Reply { probe: ProbeMeta, from: IpAddr, kind: ReplyKind, rtt: Duration },
    Timeout { probe: ProbeMeta },
    /// The send failed after retries; counts toward the probe budget
    SendFailed { probe: ProbeMeta },
}

/// Paris traceroute progress events, emitted in arrival order.
#[derive(Debug, Clone)]
pub enum TracerouteEvent {
    ProbeReply { probe: ProbeMeta, from: IpAddr, kind: ReplyKind, rtt: Duration },
    ProbeTimeout { probe: ProbeMeta },
    /// All probes for this TTL have been resolved
    TtlCompleted { ttl: u8 },
    DestinationReached { ttl: u8 },
}

/// MDA progress events.
#[derive(Debug, Clone)]
pub enum MdaEvent {
    ProbeReply { probe: ProbeMeta, from: IpAddr, kind: ReplyKind, rtt: Duration },
    ProbeTimeout { probe: ProbeMeta },
    /// A lattice edge was inserted for the first time; `from` sits at
    /// `ttl`, `to` at `ttl`+1, `None` is the star sentinel
    NewLink { ttl: u8, from: Option<IpAddr>, to: Option<IpAddr>, flow_id: u16 },
}

/// Algorithm-specific event, wrapped for dispatch.
#[derive(Debug, Clone)]
pub enum AlgorithmEvent {
    Traceroute(TracerouteEvent),
    Mda(MdaEvent),
}

/// How an instance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStatus {
    DestinationReached { ttl: u8 },
    HopLimitExhausted,
}

/// Final result carried by the termination event. The lattice moves out of
/// the MDA instance here; the handler clones what it wants to keep.
#[derive(Debug, Clone)]
pub enum TerminationOutcome {
    Traceroute { status: TraceStatus },
    Mda { status: TraceStatus, lattice: Lattice },
}

/// What the user handler receives.
#[derive(Debug, Clone)]
pub enum Event {
    Algorithm { instance: InstanceId, event: AlgorithmEvent },
    AlgorithmTerminated { instance: InstanceId, outcome: TerminationOutcome },
}
