//! Single-threaded cooperative event loop.
//!
//! One iteration: wait on sniffed replies, the earliest timer or pacing
//! deadline, and control messages; then drain ready replies, fire due
//! timeouts, flush algorithm events to the user handler, apply control
//! messages, and pump the paced sender. Within an iteration all replies are
//! delivered before any timeouts, and timeouts before the higher-level
//! events derived from them.
//!
//! The sniffer runs blocking I/O on its own OS thread and feeds the loop
//! over a channel; everything else happens inline on the loop task.

pub mod event;
pub mod instance;

pub use event::{
    AlgorithmEvent, Event, InstanceId, MdaEvent, ProbeOutcome, TerminationOutcome, TraceStatus,
    TracerouteEvent,
};
pub use instance::{AlgoCtx, Algorithm, AlgorithmKind, InstanceState};

use anyhow::{Context, Result, anyhow};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::config::{AlgorithmOptions, NetworkOptions};
use crate::net::{
    PacedSender, ProbeSink, ReplyCandidate, ReplySource, SendOutcome, spawn_sniffer,
};
use crate::probe::{ProbeSkeleton, Reply};
use instance::{Runtime, instantiate};

/// Handler invoked inline from the loop for every user-visible event. It
/// borrows the event for the duration of the call and must not block.
pub type EventHandler = Box<dyn FnMut(&LoopHandle, &Event) + Send>;

/// Control messages processed at the end of each iteration.
pub enum ControlMsg {
    Terminate,
    Stop(InstanceId),
    Remove(InstanceId),
}

/// Cloneable handle for terminating the loop or managing instances from
/// the event handler or other tasks.
#[derive(Clone)]
pub struct LoopHandle {
    cancel: CancellationToken,
    control: UnboundedSender<ControlMsg>,
}

impl LoopHandle {
    /// Request termination; the current iteration finishes first.
    pub fn terminate(&self) {
        let _ = self.control.send(ControlMsg::Terminate);
        self.cancel.cancel();
    }

    pub fn stop_instance(&self, id: InstanceId) {
        let _ = self.control.send(ControlMsg::Stop(id));
    }

    pub fn remove_instance(&self, id: InstanceId) {
        let _ = self.control.send(ControlMsg::Remove(id));
    }
}

struct InstanceSlot {
    algorithm: Box<dyn Algorithm>,
    state: InstanceState,
}

/// The probing event loop shared by all algorithm instances.
pub struct PtLoop {
    runtime: Runtime,
    instances: Vec<InstanceSlot>,
    handler: EventHandler,
    handle: LoopHandle,
    control_rx: UnboundedReceiver<ControlMsg>,
    reply_rx: UnboundedReceiver<ReplyCandidate>,
    pending_replies: Vec<ReplyCandidate>,
    pending_control: Vec<ControlMsg>,
    sniffer: Option<std::thread::JoinHandle<()>>,
    local: IpAddr,
}

impl PtLoop {
    /// Create a loop over the given transport seams. `local` is the source
    /// address probes will claim; the sniffer thread starts immediately.
    pub fn new(
        sink: Box<dyn ProbeSink>,
        source: Box<dyn ReplySource>,
        local: IpAddr,
        network: &NetworkOptions,
        handler: EventHandler,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let sniffer = spawn_sniffer(source, local, reply_tx, cancel.clone(), network.debug);
        let sender = PacedSender::new(sink, network.min_inter_send);
        Self {
            runtime: Runtime::new(sender, rand::random::<u16>(), network.debug),
            instances: Vec::new(),
            handler,
            handle: LoopHandle { cancel, control: control_tx },
            control_rx,
            reply_rx,
            pending_replies: Vec::new(),
            pending_control: Vec::new(),
            sniffer: Some(sniffer),
            local,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> IpAddr {
        self.local
    }

    /// Register an algorithm instance; probing starts when the loop runs.
    pub fn add_instance(&mut self, options: &AlgorithmOptions, dst: IpAddr) -> Result<InstanceId> {
        options.validate().map_err(|e| anyhow!("invalid configuration: {e}"))?;
        if self.local.is_ipv6() != dst.is_ipv6() {
            return Err(anyhow!("invalid configuration: destination family differs from source"));
        }
        let traceroute = options.traceroute();
        let skeleton = ProbeSkeleton {
            src: self.local,
            dst,
            transport: traceroute.transport,
            src_port: traceroute.src_port,
            dst_port: traceroute.dst_port,
        };
        let algorithm = instantiate(options, &skeleton);
        let id = self.instances.len();
        let state = InstanceState::new(
            id,
            skeleton,
            traceroute.per_probe_timeout,
            traceroute.max_outstanding,
        );
        self.instances.push(InstanceSlot { algorithm, state });
        Ok(id)
    }

    /// Run until terminated. Consumes the loop; outstanding probes are
    /// freed and instances stopped in reverse insertion order on exit.
    pub async fn run(mut self) -> Result<()> {
        for i in 0..self.instances.len() {
            self.dispatch_start(i).context("starting algorithm instance")?;
        }
        self.drain_instance_events();
        let result = self.main_loop().await;
        self.teardown();
        result
    }

    async fn main_loop(&mut self) -> Result<()> {
        loop {
            if self.handle.cancel.is_cancelled() {
                return Ok(());
            }
            if !self.instances.is_empty() && self.instances.iter().all(|s| s.state.removed) {
                return Ok(());
            }
            self.pump_sender()?;

            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                _ = self.handle.cancel.cancelled() => {}
                candidate = self.reply_rx.recv() => {
                    if let Some(c) = candidate {
                        self.pending_replies.push(c);
                    }
                }
                msg = self.control_rx.recv() => {
                    if let Some(m) = msg {
                        self.pending_control.push(m);
                    }
                }
                _ = wait_until(deadline) => {}
            }

            self.drain_replies()?;
            self.fire_timers()?;
            self.drain_instance_events();
            self.apply_control();
            self.pump_sender()?;
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let instances = &self.instances;
        let pacing = self.runtime.sender.next_deadline(|i| {
            instances
                .get(i)
                .map(|s| !s.state.stopped && s.state.sent_unresolved < s.state.max_outstanding)
                .unwrap_or(false)
        });
        match (self.runtime.timers.next_deadline(), pacing) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn dispatch_start(&mut self, i: usize) -> Result<()> {
        let slot = &mut self.instances[i];
        if slot.state.stopped {
            return Ok(());
        }
        let InstanceSlot { algorithm, state } = slot;
        let mut ctx = AlgoCtx { rt: &mut self.runtime, state };
        algorithm.start(&mut ctx)
    }

    fn dispatch_outcome(&mut self, i: usize, outcome: ProbeOutcome) -> Result<()> {
        let Some(slot) = self.instances.get_mut(i) else { return Ok(()) };
        if slot.state.stopped || slot.state.terminated.is_some() {
            return Ok(());
        }
        let InstanceSlot { algorithm, state } = slot;
        let mut ctx = AlgoCtx { rt: &mut self.runtime, state };
        algorithm.on_outcome(outcome, &mut ctx)
    }

    fn drain_replies(&mut self) -> Result<()> {
        while let Ok(c) = self.reply_rx.try_recv() {
            self.pending_replies.push(c);
        }
        let candidates = std::mem::take(&mut self.pending_replies);
        for c in candidates {
            self.handle_candidate(c)?;
        }
        Ok(())
    }

    fn handle_candidate(&mut self, c: ReplyCandidate) -> Result<()> {
        let Some(probe_id) = self.runtime.outstanding.take(&c.key) else {
            if self.runtime.debug {
                eprintln!("loop: dropping unmatched reply from {}", c.from);
            }
            return Ok(());
        };
        let Some(entry) = self.runtime.in_flight.remove(&probe_id) else {
            return Ok(());
        };
        let reply = Reply { from: c.from, kind: c.kind, recv_time: c.recv_time, key: c.key };
        let i = entry.instance;
        let mut rtt = Duration::ZERO;
        if let Some(probe) = &entry.probe {
            rtt = reply.rtt(probe).unwrap_or_default();
            if probe.send_time.is_some()
                && let Some(slot) = self.instances.get_mut(i)
            {
                slot.state.sent_unresolved = slot.state.sent_unresolved.saturating_sub(1);
            }
        }
        self.dispatch_outcome(
            i,
            ProbeOutcome::Reply { probe: entry.meta, from: reply.from, kind: reply.kind, rtt },
        )
    }

    fn fire_timers(&mut self) -> Result<()> {
        let due = self.runtime.timers.pop_due(Instant::now());
        for probe_id in due {
            // Entries already matched by a reply are gone from the table
            let Some(entry) = self.runtime.in_flight.remove(&probe_id) else { continue };
            let i = entry.instance;
            if let Some(probe) = &entry.probe {
                self.runtime.outstanding.remove(&probe.key, probe_id);
                if probe.send_time.is_some()
                    && let Some(slot) = self.instances.get_mut(i)
                {
                    slot.state.sent_unresolved = slot.state.sent_unresolved.saturating_sub(1);
                }
            }
            self.dispatch_outcome(i, ProbeOutcome::Timeout { probe: entry.meta })?;
        }
        Ok(())
    }

    fn drain_instance_events(&mut self) {
        for i in 0..self.instances.len() {
            if self.instances[i].state.removed {
                continue;
            }
            while let Some(inner) = self.instances[i].state.out_events.pop_front() {
                let event = Event::Algorithm { instance: i, event: inner };
                (self.handler)(&self.handle, &event);
            }
            let due = {
                let state = &self.instances[i].state;
                state.terminated.is_some() && !state.termination_delivered
            };
            if due {
                let outcome = self.instances[i].state.terminated.take().unwrap();
                self.instances[i].state.termination_delivered = true;
                let event = Event::AlgorithmTerminated { instance: i, outcome };
                (self.handler)(&self.handle, &event);
            }
        }
    }

    fn apply_control(&mut self) {
        let mut messages = std::mem::take(&mut self.pending_control);
        while let Ok(msg) = self.control_rx.try_recv() {
            messages.push(msg);
        }
        for msg in messages {
            match msg {
                ControlMsg::Terminate => self.handle.cancel.cancel(),
                ControlMsg::Stop(id) => self.stop_instance_inner(id),
                ControlMsg::Remove(id) => {
                    self.stop_instance_inner(id);
                    if let Some(slot) = self.instances.get_mut(id) {
                        slot.state.removed = true;
                        slot.state.out_events.clear();
                    }
                }
            }
        }
    }

    fn stop_instance_inner(&mut self, id: usize) {
        let Some(slot) = self.instances.get_mut(id) else { return };
        if slot.state.stopped {
            return;
        }
        slot.state.stopped = true;
        slot.state.sent_unresolved = 0;
        self.runtime.sender.purge_instance(id);
        // Free this instance's outstanding probes; stale timers fire on
        // entries that no longer exist and are ignored.
        let stale: Vec<u64> = self
            .runtime
            .in_flight
            .iter()
            .filter(|(_, e)| e.instance == id)
            .map(|(probe_id, _)| *probe_id)
            .collect();
        for probe_id in stale {
            if let Some(entry) = self.runtime.in_flight.remove(&probe_id)
                && let Some(probe) = entry.probe
            {
                self.runtime.outstanding.remove(&probe.key, probe_id);
            }
        }
    }

    fn pump_sender(&mut self) -> Result<()> {
        let now = Instant::now();
        let outcomes = {
            let instances = &self.instances;
            self.runtime.sender.pump(now, |i| {
                instances
                    .get(i)
                    .map(|s| !s.state.stopped && s.state.sent_unresolved < s.state.max_outstanding)
                    .unwrap_or(false)
            })
        };
        for outcome in outcomes {
            match outcome {
                SendOutcome::Sent { probe_id, at } => {
                    let Some(entry) = self.runtime.in_flight.get_mut(&probe_id) else { continue };
                    let i = entry.instance;
                    let flow = entry.meta.flow_id;
                    let probe = entry.probe.as_mut().expect("queued probes own their packet");
                    probe.send_time = Some(at);
                    let key = probe.key;
                    if self.runtime.outstanding.insert(key, probe_id) && self.runtime.debug {
                        eprintln!("loop: matching-key collision on flow {flow}, oldest probe wins");
                    }
                    if let Some(slot) = self.instances.get_mut(i) {
                        let timeout = slot.state.per_probe_timeout;
                        slot.state.sent_unresolved += 1;
                        self.runtime.timers.arm(at + timeout, probe_id);
                    }
                }
                SendOutcome::Failed { probe_id, error } => {
                    let Some(entry) = self.runtime.in_flight.remove(&probe_id) else { continue };
                    if self.runtime.debug {
                        eprintln!(
                            "loop: send failed for ttl {} flow {}: {error}",
                            entry.meta.ttl, entry.meta.flow_id
                        );
                    }
                    self.dispatch_outcome(entry.instance, ProbeOutcome::SendFailed { probe: entry.meta })?;
                }
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        for i in (0..self.instances.len()).rev() {
            self.stop_instance_inner(i);
        }
        self.runtime.sender.clear();
        self.runtime.timers.clear();
        self.runtime.outstanding.clear();
        self.runtime.in_flight.clear();
        self.handle.cancel.cancel();
        if let Some(sniffer) = self.sniffer.take() {
            let _ = sniffer.join();
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending::<()>().await,
    }
}
