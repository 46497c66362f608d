//! Algorithm host: the registry of known algorithms, per-instance state,
//! and the context through which running algorithms reach the shared
//! probing runtime.

use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::event::{AlgorithmEvent, ProbeOutcome, TerminationOutcome};
use crate::algo::{mda::Mda, traceroute::ParisTraceroute};
use crate::config::AlgorithmOptions;
use crate::net::{PacedSender, QueuedSend, TimerWheel};
use crate::probe::{OutstandingTable, Probe, ProbeMeta, ProbeSkeleton};

/// Registry key for the known algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmKind {
    ParisTraceroute,
    Mda,
}

impl AlgorithmKind {
    pub fn of(options: &AlgorithmOptions) -> Self {
        match options {
            AlgorithmOptions::ParisTraceroute(_) => AlgorithmKind::ParisTraceroute,
            AlgorithmOptions::Mda(_) => AlgorithmKind::Mda,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmKind::ParisTraceroute => "paris-traceroute",
            AlgorithmKind::Mda => "mda",
        }
    }
}

/// A running algorithm. Called inline from the event loop; must never
/// block. Probes go out through the context, events come back through it.
pub trait Algorithm: Send {
    fn start(&mut self, ctx: &mut AlgoCtx<'_>) -> Result<()>;
    fn on_outcome(&mut self, outcome: ProbeOutcome, ctx: &mut AlgoCtx<'_>) -> Result<()>;
}

/// Construct an algorithm instance for the given options.
pub fn instantiate(options: &AlgorithmOptions, skeleton: &ProbeSkeleton) -> Box<dyn Algorithm> {
    match options {
        AlgorithmOptions::ParisTraceroute(opts) => {
            Box::new(ParisTraceroute::new(opts.clone(), skeleton))
        }
        AlgorithmOptions::Mda(opts) => Box::new(Mda::new(opts.clone(), skeleton)),
    }
}

/// Tracking record for one in-flight probe. The probe owns its frozen
/// packet until the outcome is delivered and the record dropped.
pub(crate) struct InFlight {
    pub instance: usize,
    pub meta: ProbeMeta,
    /// Absent when assembly failed and only the synthetic timeout remains
    pub probe: Option<Probe>,
}

/// Runtime shared by all instances on one loop: the paced sender, timer
/// wheel, and the outstanding-probe index.
pub(crate) struct Runtime {
    pub sender: PacedSender,
    pub timers: TimerWheel,
    pub outstanding: OutstandingTable,
    pub in_flight: HashMap<u64, InFlight>,
    pub next_probe_id: u64,
    pub next_ip_id: u16,
    pub debug: bool,
}

impl Runtime {
    pub fn new(sender: PacedSender, ip_id_seed: u16, debug: bool) -> Self {
        Self {
            sender,
            timers: TimerWheel::new(),
            outstanding: OutstandingTable::new(),
            in_flight: HashMap::new(),
            next_probe_id: 0,
            next_ip_id: ip_id_seed,
            debug,
        }
    }
}

/// Mutable per-instance bookkeeping owned by the loop.
pub struct InstanceState {
    pub id: usize,
    pub skeleton: ProbeSkeleton,
    pub per_probe_timeout: Duration,
    pub max_outstanding: usize,
    /// Probes on the wire without an outcome yet
    pub sent_unresolved: usize,
    pub out_events: VecDeque<AlgorithmEvent>,
    pub terminated: Option<TerminationOutcome>,
    pub termination_delivered: bool,
    pub stopped: bool,
    pub removed: bool,
}

impl InstanceState {
    pub fn new(
        id: usize,
        skeleton: ProbeSkeleton,
        per_probe_timeout: Duration,
        max_outstanding: usize,
    ) -> Self {
        Self {
            id,
            skeleton,
            per_probe_timeout,
            max_outstanding,
            sent_unresolved: 0,
            out_events: VecDeque::new(),
            terminated: None,
            termination_delivered: false,
            stopped: false,
            removed: false,
        }
    }
}

/// What an algorithm sees of the loop while it runs.
pub struct AlgoCtx<'a> {
    pub(crate) rt: &'a mut Runtime,
    pub(crate) state: &'a mut InstanceState,
}

impl AlgoCtx<'_> {
    /// Queue one probe for transmission.
    ///
    /// Assembly failures are fatal to the probe, not the algorithm: the
    /// probe is abandoned but its timeout is scheduled as usual, so the
    /// per-TTL budget still resolves.
    pub fn send_probe(&mut self, ttl: u8, flow_id: u16, seq: u16) {
        let meta = ProbeMeta { ttl, flow_id, seq };
        let probe_id = self.rt.next_probe_id;
        self.rt.next_probe_id += 1;
        let ip_id = self.rt.next_ip_id;
        self.rt.next_ip_id = self.rt.next_ip_id.wrapping_add(1);

        let built = self
            .state
            .skeleton
            .build(ttl, flow_id, seq, ip_id)
            .and_then(|packet| Probe::new(packet, meta));
        match built {
            Ok(probe) => {
                self.rt.sender.enqueue(QueuedSend {
                    probe_id,
                    instance: self.state.id,
                    bytes: probe.packet.bytes().to_vec(),
                    dst: self.state.skeleton.dst,
                    ttl,
                    transport: self.state.skeleton.transport,
                });
                self.rt.in_flight.insert(
                    probe_id,
                    InFlight { instance: self.state.id, meta, probe: Some(probe) },
                );
            }
            Err(e) => self.abandon(probe_id, meta, &e),
        }
    }

    fn abandon(&mut self, probe_id: u64, meta: ProbeMeta, error: &anyhow::Error) {
        if self.rt.debug {
            eprintln!(
                "probe assembly failed (ttl {} flow {}): {error}",
                meta.ttl, meta.flow_id
            );
        }
        self.rt.in_flight.insert(probe_id, InFlight { instance: self.state.id, meta, probe: None });
        self.rt.timers.arm(Instant::now() + self.state.per_probe_timeout, probe_id);
    }

    /// Push an event to the user handler (delivered this loop iteration).
    pub fn emit(&mut self, event: AlgorithmEvent) {
        self.state.out_events.push_back(event);
    }

    /// Mark this instance finished; the loop delivers the termination event
    /// after the remaining queued events.
    pub fn terminate(&mut self, outcome: TerminationOutcome) {
        if self.state.terminated.is_none() {
            self.state.terminated = Some(outcome);
        }
    }
}
