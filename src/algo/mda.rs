//! Multipath detection.
//!
//! MDA varies the flow identifier per probe to enumerate every parallel
//! next-hop of each discovered interface, stopping per interface once
//! enough distinct flows have confirmed the known next-hop set (see
//! [`super::stopping`]). Levels advance one TTL at a time; re-using a flow
//! across consecutive TTLs is what welds the lattice together, so probing
//! an interface prefers flows already known to traverse it and only then
//! draws fresh identifiers, classifying them at the previous TTL first.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;

use super::flow::FlowPool;
use super::stopping::stopping_threshold;
use crate::config::MdaOptions;
use crate::engine::event::{AlgorithmEvent, MdaEvent, ProbeOutcome, TerminationOutcome, TraceStatus};
use crate::engine::instance::{AlgoCtx, Algorithm};
use crate::lattice::Lattice;
use crate::probe::ProbeSkeleton;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowState {
    Pending,
    Hop(IpAddr),
    Star,
}

pub struct Mda {
    opts: MdaOptions,
    src: IpAddr,
    dst: IpAddr,
    lattice: Lattice,
    /// TTL currently being probed; interfaces at `level - 1` are resolved
    level: u8,
    /// Per-TTL flow outcomes
    flows: BTreeMap<u8, HashMap<u16, FlowState>>,
    /// Every identifier drawn so far, in draw order
    all_flows: Vec<u16>,
    pool: FlowPool,
    seq: u16,
    dest_ttl: Option<u8>,
    pool_dry: bool,
    done: bool,
}

impl Mda {
    pub fn new(opts: MdaOptions, skeleton: &ProbeSkeleton) -> Self {
        let reserved = [opts.traceroute.src_port, opts.traceroute.dst_port];
        let pool = FlowPool::new(opts.flow_min, opts.flow_max, reserved);
        let level = opts.traceroute.min_ttl;
        Self {
            opts,
            src: skeleton.src,
            dst: skeleton.dst,
            lattice: Lattice::new(),
            level,
            flows: BTreeMap::new(),
            all_flows: Vec::new(),
            pool,
            seq: 0,
            dest_ttl: None,
            pool_dry: false,
            done: false,
        }
    }

    fn root_ttl(&self) -> u8 {
        self.opts.traceroute.min_ttl - 1
    }

    /// Where `flow` was observed at `ttl`: `Some(Some(addr))` for a reply,
    /// `Some(None)` for a star, `None` while pending or unprobed. The root
    /// level resolves to the source for every flow.
    fn resolution(&self, ttl: u8, flow: u16) -> Option<Option<IpAddr>> {
        if ttl == self.root_ttl() {
            return Some(Some(self.src));
        }
        match self.flows.get(&ttl).and_then(|m| m.get(&flow)) {
            Some(FlowState::Hop(addr)) => Some(Some(*addr)),
            Some(FlowState::Star) => Some(None),
            _ => None,
        }
    }

    fn interfaces_at(&self, ttl: u8) -> Vec<Option<IpAddr>> {
        if ttl == self.root_ttl() {
            vec![Some(self.src)]
        } else {
            self.lattice.nodes_at(ttl).iter().map(|n| n.addr).collect()
        }
    }

    /// (distinct next-hops, confirmed flows, pending flows) for probing
    /// `iface` (at `level - 1`) toward the current level.
    fn iface_stats(&self, prev: u8, iface: Option<IpAddr>) -> (usize, usize, usize) {
        let level_map = self.flows.get(&self.level);
        let mut next_hops = HashSet::new();
        let mut confirmed = 0;
        let mut pending = 0;
        for &flow in &self.all_flows {
            if self.resolution(prev, flow) != Some(iface) {
                continue;
            }
            match level_map.and_then(|m| m.get(&flow)) {
                Some(FlowState::Hop(addr)) => {
                    next_hops.insert(*addr);
                    confirmed += 1;
                }
                Some(FlowState::Star) => confirmed += 1,
                Some(FlowState::Pending) => pending += 1,
                None => {}
            }
        }
        (next_hops.len(), confirmed, pending)
    }

    fn flows_through(&self, prev: u8, iface: Option<IpAddr>) -> usize {
        self.all_flows.iter().filter(|&&f| self.resolution(prev, f) == Some(iface)).count()
    }

    fn iface_needed(&self, prev: u8, iface: Option<IpAddr>, next_hops: usize) -> usize {
        let num_probes = self.opts.traceroute.num_probes;
        if iface.is_none() {
            // A star cannot attract new flows: a timeout at the previous
            // TTL identifies no interface. Probe the flows it has.
            return num_probes.min(self.flows_through(prev, None)).max(1);
        }
        stopping_threshold(next_hops, self.opts.confidence).max(num_probes)
    }

    fn iface_resolved(&self, prev: u8, iface: Option<IpAddr>) -> bool {
        if self.pool_dry {
            return true;
        }
        let (n, confirmed, _) = self.iface_stats(prev, iface);
        n >= self.opts.max_branch || confirmed >= self.iface_needed(prev, iface, n)
    }

    fn iface_deficit(&self, prev: u8, iface: Option<IpAddr>) -> usize {
        let (n, confirmed, pending) = self.iface_stats(prev, iface);
        self.iface_needed(prev, iface, n).saturating_sub(confirmed + pending)
    }

    fn draw(&mut self) -> Option<u16> {
        match self.pool.draw() {
            Some(flow) => {
                self.all_flows.push(flow);
                Some(flow)
            }
            None => {
                self.pool_dry = true;
                None
            }
        }
    }

    fn probe_at(&mut self, ttl: u8, flow: u16, ctx: &mut AlgoCtx<'_>) {
        self.flows.entry(ttl).or_default().insert(flow, FlowState::Pending);
        ctx.send_probe(ttl, flow, self.seq);
        self.seq = self.seq.wrapping_add(1);
    }

    fn fill_deficit(&mut self, prev: u8, iface: Option<IpAddr>, deficit: usize, ctx: &mut AlgoCtx<'_>) {
        // Prefer flows already classified through this interface
        let candidates: Vec<u16> = self
            .all_flows
            .iter()
            .copied()
            .filter(|&f| self.resolution(prev, f) == Some(iface))
            .filter(|f| !self.flows.get(&self.level).is_some_and(|m| m.contains_key(f)))
            .take(deficit)
            .collect();
        let mut remaining = deficit - candidates.len();
        for flow in candidates {
            self.probe_at(self.level, flow, ctx);
        }
        if remaining == 0 {
            return;
        }
        if prev == self.root_ttl() {
            // Every flow passes through the source; probe the level directly
            while remaining > 0 {
                let Some(flow) = self.draw() else { return };
                self.probe_at(self.level, flow, ctx);
                remaining -= 1;
            }
        } else if iface.is_some() {
            // Fresh flows must be classified at the previous TTL first; cap
            // by the classification probes already in flight
            let unclassified = self
                .flows
                .get(&prev)
                .map_or(0, |m| m.values().filter(|s| matches!(s, FlowState::Pending)).count());
            let mut to_send = remaining.saturating_sub(unclassified);
            while to_send > 0 {
                let Some(flow) = self.draw() else { return };
                self.probe_at(prev, flow, ctx);
                to_send -= 1;
            }
        }
    }

    fn emit_link(
        &mut self,
        ttl: u8,
        from: Option<IpAddr>,
        to: Option<IpAddr>,
        flow: u16,
        ctx: &mut AlgoCtx<'_>,
    ) {
        if self.lattice.link(ttl, from, to, flow) {
            ctx.emit(AlgorithmEvent::Mda(MdaEvent::NewLink { ttl, from, to, flow_id: flow }));
        }
    }

    fn record_reply(&mut self, ttl: u8, flow: u16, from: IpAddr, ctx: &mut AlgoCtx<'_>) {
        self.flows.entry(ttl).or_default().insert(flow, FlowState::Hop(from));
        self.lattice.insert(ttl, Some(from), Some(flow));

        // Backward edge: the interface this flow crossed one hop earlier
        let prev = ttl - 1;
        if let Some(prev_addr) = self.resolution(prev, flow) {
            let prev_exists = prev == self.root_ttl()
                || prev_addr.is_some()
                || self.lattice.node(prev, None).is_some();
            if prev_exists {
                if prev == self.root_ttl() {
                    self.lattice.insert(prev, Some(self.src), Some(flow));
                }
                self.emit_link(prev, prev_addr, Some(from), flow, ctx);
            }
        }

        // Forward edge, for classification replies arriving after the flow
        // was already resolved one hop deeper
        let next = ttl + 1;
        if let Some(next_addr) = self.resolution(next, flow) {
            let next_exists = next_addr.is_some() || self.lattice.node(next, None).is_some();
            if next_exists {
                self.emit_link(ttl, Some(from), next_addr, flow, ctx);
            }
        }
    }

    fn record_star(&mut self, ttl: u8, flow: u16) {
        self.flows.entry(ttl).or_default().insert(flow, FlowState::Star);
    }

    /// Close out the current level: a star node is inserted only when no
    /// flow produced a reply at this TTL, and the timed-out flows link
    /// their predecessors through it.
    fn finalize_level(&mut self, ctx: &mut AlgoCtx<'_>) {
        let level = self.level;
        let Some(map) = self.flows.get(&level) else { return };
        let any_reply = map.values().any(|s| matches!(s, FlowState::Hop(_)));
        if any_reply {
            return;
        }
        let star_flows: Vec<u16> = self
            .all_flows
            .iter()
            .copied()
            .filter(|f| matches!(map.get(f), Some(FlowState::Star)))
            .collect();
        if star_flows.is_empty() {
            return;
        }
        self.lattice.insert(level, None, None);
        for flow in star_flows {
            if let Some(prev_addr) = self.resolution(level - 1, flow) {
                let prev = level - 1;
                let prev_exists = prev == self.root_ttl()
                    || prev_addr.is_some()
                    || self.lattice.node(prev, None).is_some();
                if prev_exists {
                    if prev == self.root_ttl() {
                        self.lattice.insert(prev, Some(self.src), Some(flow));
                    }
                    self.emit_link(prev, prev_addr, None, flow, ctx);
                }
            }
        }
    }

    fn finish(&mut self, ctx: &mut AlgoCtx<'_>) {
        if self.done {
            return;
        }
        self.done = true;
        let status = match self.dest_ttl {
            Some(ttl) => TraceStatus::DestinationReached { ttl },
            None => TraceStatus::HopLimitExhausted,
        };
        let lattice = std::mem::take(&mut self.lattice);
        ctx.terminate(TerminationOutcome::Mda { status, lattice });
    }

    /// The pump: send whatever the stopping rule still requires, advance
    /// levels whose interfaces are all resolved, and terminate when the
    /// frontier is empty or the hop limit is hit.
    fn schedule(&mut self, ctx: &mut AlgoCtx<'_>) {
        if self.done {
            return;
        }
        loop {
            if self.level > self.opts.traceroute.max_ttl {
                self.finish(ctx);
                return;
            }
            let prev = self.level - 1;
            let frontier: Vec<Option<IpAddr>> = self
                .interfaces_at(prev)
                .into_iter()
                .filter(|iface| *iface != Some(self.dst))
                .collect();
            if frontier.is_empty() {
                // Every branch ended at the destination
                self.finish(ctx);
                return;
            }
            let mut all_resolved = true;
            for iface in frontier {
                if self.iface_resolved(prev, iface) {
                    continue;
                }
                all_resolved = false;
                let deficit = self.iface_deficit(prev, iface);
                if deficit > 0 {
                    self.fill_deficit(prev, iface, deficit, ctx);
                }
            }
            if !all_resolved {
                if self.pool_dry {
                    // No identifiers left to make progress with; every
                    // interface now reads as resolved, so wind down
                    continue;
                }
                return;
            }
            self.finalize_level(ctx);
            self.level += 1;
        }
    }
}

impl Algorithm for Mda {
    fn start(&mut self, ctx: &mut AlgoCtx<'_>) -> Result<()> {
        self.lattice.insert(self.root_ttl(), Some(self.src), None);
        self.schedule(ctx);
        Ok(())
    }

    fn on_outcome(&mut self, outcome: ProbeOutcome, ctx: &mut AlgoCtx<'_>) -> Result<()> {
        if self.done {
            return Ok(());
        }
        match outcome {
            ProbeOutcome::Reply { probe, from, kind, rtt } => {
                if from == self.dst || kind.destination_reached() {
                    self.dest_ttl = Some(match self.dest_ttl {
                        Some(t) => t.min(probe.ttl),
                        None => probe.ttl,
                    });
                }
                ctx.emit(AlgorithmEvent::Mda(MdaEvent::ProbeReply { probe, from, kind, rtt }));
                self.record_reply(probe.ttl, probe.flow_id, from, ctx);
            }
            ProbeOutcome::Timeout { probe } | ProbeOutcome::SendFailed { probe } => {
                ctx.emit(AlgorithmEvent::Mda(MdaEvent::ProbeTimeout { probe }));
                self.record_star(probe.ttl, probe.flow_id);
            }
        }
        self.schedule(ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TracerouteOptions, TransportProtocol};
    use crate::engine::instance::{InstanceState, Runtime};
    use crate::net::{PacedSender, ProbeSink, WireProbe};
    use crate::probe::{ProbeMeta, ReplyKind};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    struct NullSink;
    impl ProbeSink for NullSink {
        fn send(&mut self, probe: &WireProbe<'_>) -> std::io::Result<usize> {
            Ok(probe.bytes.len())
        }
    }

    fn harness() -> (Runtime, InstanceState) {
        let skeleton = ProbeSkeleton {
            src: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)),
            transport: TransportProtocol::Udp,
            src_port: 33456,
            dst_port: 33457,
        };
        let runtime = Runtime::new(PacedSender::new(Box::new(NullSink), Duration::ZERO), 1, false);
        let state = InstanceState::new(0, skeleton, Duration::from_secs(1), 64);
        (runtime, state)
    }

    fn opts() -> MdaOptions {
        MdaOptions {
            traceroute: TracerouteOptions { max_ttl: 4, ..TracerouteOptions::default() },
            ..MdaOptions::default()
        }
    }

    /// Pull the (ttl, flow) pairs queued in the runtime and clear them.
    fn drain_probes(rt: &mut Runtime) -> Vec<(u8, u16)> {
        let mut sent: Vec<(u8, u16)> = rt.in_flight.values().map(|e| (e.meta.ttl, e.meta.flow_id)).collect();
        sent.sort();
        rt.in_flight.clear();
        rt.sender.clear();
        sent
    }

    fn reply(ttl: u8, flow: u16, from: [u8; 4]) -> ProbeOutcome {
        ProbeOutcome::Reply {
            probe: ProbeMeta { ttl, flow_id: flow, seq: 0 },
            from: IpAddr::V4(Ipv4Addr::from(from)),
            kind: ReplyKind::TimeExceeded,
            rtt: Duration::from_millis(3),
        }
    }

    #[test]
    fn start_probes_first_level_with_distinct_flows() {
        let (mut rt, mut state) = harness();
        let mut mda = Mda::new(opts(), &state.skeleton);
        mda.start(&mut AlgoCtx { rt: &mut rt, state: &mut state }).unwrap();

        let sent = drain_probes(&mut rt);
        assert_eq!(sent.len(), 3, "initial level sends num_probes");
        assert!(sent.iter().all(|(ttl, _)| *ttl == 1));
        let flows: HashSet<u16> = sent.iter().map(|(_, f)| *f).collect();
        assert_eq!(flows.len(), 3, "flows are pairwise distinct");
    }

    #[test]
    fn single_next_hop_needs_six_confirming_flows() {
        let (mut rt, mut state) = harness();
        let mut mda = Mda::new(opts(), &state.skeleton);
        mda.start(&mut AlgoCtx { rt: &mut rt, state: &mut state }).unwrap();

        // Answer every TTL-1 probe from one router until the stopping rule
        // is satisfied; k(1, 0.05) = 6
        let mut answered = HashSet::new();
        for _ in 0..10 {
            let sent = drain_probes(&mut rt);
            let mut progressed = false;
            for (ttl, flow) in sent {
                if ttl == 1 && answered.insert(flow) {
                    let mut ctx = AlgoCtx { rt: &mut rt, state: &mut state };
                    mda.on_outcome(reply(1, flow, [10, 0, 0, 1]), &mut ctx).unwrap();
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        assert_eq!(answered.len(), 6, "k(1) confirming flows before the level closes");
        assert!(mda.level >= 2, "level advanced after resolution");
    }

    #[test]
    fn all_timeouts_insert_a_star_with_edges_through_it() {
        let (mut rt, mut state) = harness();
        let mut mda = Mda::new(opts(), &state.skeleton);
        mda.start(&mut AlgoCtx { rt: &mut rt, state: &mut state }).unwrap();

        // TTL 1 answers with a single router (6 flows), TTL 2 never answers
        loop {
            let sent = drain_probes(&mut rt);
            if sent.is_empty() {
                break;
            }
            for (ttl, flow) in sent {
                let mut ctx = AlgoCtx { rt: &mut rt, state: &mut state };
                match ttl {
                    1 => mda.on_outcome(reply(1, flow, [10, 0, 0, 1]), &mut ctx).unwrap(),
                    2 => mda
                        .on_outcome(
                            ProbeOutcome::Timeout { probe: ProbeMeta { ttl, flow_id: flow, seq: 0 } },
                            &mut ctx,
                        )
                        .unwrap(),
                    _ => break,
                }
            }
            if mda.level > 2 {
                break;
            }
        }

        let star = mda.lattice.node(2, None);
        assert!(star.is_some(), "star node inserted at the silent TTL");
        let r1 = mda.lattice.node(1, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))).unwrap();
        assert!(r1.edges.iter().any(|e| e.to.is_none()), "edge into the star");
    }

    #[test]
    fn destination_frontier_terminates_without_deeper_probes() {
        let (mut rt, mut state) = harness();
        let mut mda = Mda::new(opts(), &state.skeleton);
        mda.start(&mut AlgoCtx { rt: &mut rt, state: &mut state }).unwrap();

        // The destination answers at TTL 1 for every flow
        loop {
            let sent = drain_probes(&mut rt);
            if sent.is_empty() {
                break;
            }
            for (_, flow) in sent {
                let mut ctx = AlgoCtx { rt: &mut rt, state: &mut state };
                let outcome = ProbeOutcome::Reply {
                    probe: ProbeMeta { ttl: 1, flow_id: flow, seq: 0 },
                    from: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)),
                    kind: ReplyKind::DestUnreachablePort,
                    rtt: Duration::from_millis(2),
                };
                mda.on_outcome(outcome, &mut ctx).unwrap();
            }
        }
        assert!(state.terminated.is_some(), "mda finished");
        assert!(
            matches!(
                state.terminated,
                Some(TerminationOutcome::Mda {
                    status: TraceStatus::DestinationReached { ttl: 1 },
                    ..
                })
            ),
            "destination recorded at ttl 1"
        );
        assert!(drain_probes(&mut rt).is_empty(), "no probes past the destination");
    }
}
