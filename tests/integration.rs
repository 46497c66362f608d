//! End-to-end scenarios: the full loop (assembler, sender, sniffer parse,
//! matching, algorithms) driven against the deterministic network
//! simulator. No raw sockets or privileges required.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use paristrace::config::{
    AlgorithmOptions, MdaOptions, NetworkOptions, TracerouteOptions, TransportProtocol,
};
use paristrace::engine::{
    AlgorithmEvent, Event, LoopHandle, MdaEvent, PtLoop, TerminationOutcome, TraceStatus,
    TracerouteEvent,
};
use paristrace::lattice::Lattice;
use paristrace::sim::{SimNet, SimTopology};

const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

fn ip(a: u8, b: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, a, b)
}

fn fast_opts() -> TracerouteOptions {
    TracerouteOptions {
        per_probe_timeout: Duration::from_millis(250),
        ..TracerouteOptions::default()
    }
}

struct TraceRun {
    events: Vec<Event>,
    outcome: TerminationOutcome,
}

impl TraceRun {
    fn replies_at(&self, ttl: u8) -> Vec<(IpAddr, Duration, u16)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Algorithm {
                    event: AlgorithmEvent::Traceroute(TracerouteEvent::ProbeReply { probe, from, rtt, .. }),
                    ..
                }
                | Event::Algorithm {
                    event: AlgorithmEvent::Mda(MdaEvent::ProbeReply { probe, from, rtt, .. }),
                    ..
                } if probe.ttl == ttl => Some((*from, *rtt, probe.flow_id)),
                _ => None,
            })
            .collect()
    }

    fn timeouts_at(&self, ttl: u8) -> usize {
        self.events
            .iter()
            .filter(|e| {
                matches!(e, Event::Algorithm {
                    event: AlgorithmEvent::Traceroute(TracerouteEvent::ProbeTimeout { probe }),
                    ..
                } if probe.ttl == ttl) || matches!(e, Event::Algorithm {
                    event: AlgorithmEvent::Mda(MdaEvent::ProbeTimeout { probe }),
                    ..
                } if probe.ttl == ttl)
            })
            .count()
    }

    fn links(&self) -> Vec<(u8, Option<IpAddr>, Option<IpAddr>)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Algorithm {
                    event: AlgorithmEvent::Mda(MdaEvent::NewLink { ttl, from, to, .. }),
                    ..
                } => Some((*ttl, *from, *to)),
                _ => None,
            })
            .collect()
    }

    fn lattice(&self) -> &Lattice {
        match &self.outcome {
            TerminationOutcome::Mda { lattice, .. } => lattice,
            other => panic!("expected an mda outcome, got {other:?}"),
        }
    }
}

async fn run_trace(
    topo: SimTopology,
    options: AlgorithmOptions,
    network: NetworkOptions,
    destination: Ipv4Addr,
) -> TraceRun {
    let net = SimNet::new(topo, LOCAL);
    let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let handler = Box::new(move |handle: &LoopHandle, event: &Event| {
        sink_events.lock().push(event.clone());
        if matches!(event, Event::AlgorithmTerminated { .. }) {
            handle.terminate();
        }
    });

    let mut pt_loop = PtLoop::new(net.sink(), net.source(), net.local_addr(), &network, handler);
    pt_loop.add_instance(&options, IpAddr::V4(destination)).unwrap();

    tokio::time::timeout(Duration::from_secs(60), pt_loop.run())
        .await
        .expect("trace did not terminate in time")
        .expect("loop error");

    let events = events.lock().clone();
    let outcome = events
        .iter()
        .find_map(|e| match e {
            Event::AlgorithmTerminated { outcome, .. } => Some(outcome.clone()),
            _ => None,
        })
        .expect("termination event missing");
    TraceRun { events, outcome }
}

/// Scenario 1: straight path of 5 hops, UDP defaults. Every TTL yields
/// three replies, TTL 5 is the destination, and the trace terminates.
#[tokio::test(flavor = "multi_thread")]
async fn straight_path_five_hops() {
    let dest = ip(0, 5);
    let topo = SimTopology::chain(&[ip(0, 1), ip(0, 2), ip(0, 3), ip(0, 4)], dest);
    let run = run_trace(
        topo,
        AlgorithmOptions::ParisTraceroute(fast_opts()),
        NetworkOptions::default(),
        dest,
    )
    .await;

    for ttl in 1..=5u8 {
        let replies = run.replies_at(ttl);
        assert_eq!(replies.len(), 3, "ttl {ttl} reply count");
        assert_eq!(run.timeouts_at(ttl), 0, "ttl {ttl} timeouts");
        let expected: IpAddr = if ttl == 5 { dest.into() } else { ip(0, ttl).into() };
        assert!(replies.iter().all(|(from, _, _)| *from == expected), "ttl {ttl} responder");
        // RTT is recv - send and strictly positive
        assert!(replies.iter().all(|(_, rtt, _)| *rtt > Duration::ZERO));
    }
    assert!(run.replies_at(6).is_empty(), "no probes past the destination");
    assert!(matches!(
        run.outcome,
        TerminationOutcome::Traceroute { status: TraceStatus::DestinationReached { ttl: 5 } }
    ));
}

/// Paris invariant: all probes of a trace carry the same flow identifier.
#[tokio::test(flavor = "multi_thread")]
async fn paris_probes_share_one_flow() {
    let dest = ip(0, 5);
    let topo = SimTopology::chain(&[ip(0, 1), ip(0, 2)], dest);
    let run = run_trace(
        topo,
        AlgorithmOptions::ParisTraceroute(fast_opts()),
        NetworkOptions::default(),
        dest,
    )
    .await;

    let flows: HashSet<u16> = (1..=3)
        .flat_map(|ttl| run.replies_at(ttl))
        .map(|(_, _, flow)| flow)
        .collect();
    assert_eq!(flows.len(), 1, "paris keeps the flow identifier constant");
}

/// Scenario 2 (paris): a silent hop at TTL 3 yields three timeouts there
/// and replies everywhere else.
#[tokio::test(flavor = "multi_thread")]
async fn silent_hop_times_out() {
    let dest = ip(0, 5);
    let topo = SimTopology {
        layers: vec![
            vec![Some(ip(0, 1))],
            vec![Some(ip(0, 2))],
            vec![None],
            vec![Some(ip(0, 4))],
        ],
        destination: dest,
        link_delay: Duration::from_millis(2),
    };
    let run = run_trace(
        topo,
        AlgorithmOptions::ParisTraceroute(fast_opts()),
        NetworkOptions::default(),
        dest,
    )
    .await;

    assert_eq!(run.timeouts_at(3), 3);
    assert!(run.replies_at(3).is_empty());
    for ttl in [1u8, 2, 4, 5] {
        assert_eq!(run.replies_at(ttl).len(), 3, "ttl {ttl}");
    }
    assert!(matches!(
        run.outcome,
        TerminationOutcome::Traceroute { status: TraceStatus::DestinationReached { ttl: 5 } }
    ));
}

/// Scenario 2 (mda): the lattice inserts a star at the silent TTL with
/// edges through it.
#[tokio::test(flavor = "multi_thread")]
async fn mda_star_with_edges_through_it() {
    let dest = ip(0, 5);
    let topo = SimTopology {
        layers: vec![
            vec![Some(ip(0, 1))],
            vec![Some(ip(0, 2))],
            vec![None],
            vec![Some(ip(0, 4))],
        ],
        destination: dest,
        link_delay: Duration::from_millis(2),
    };
    let run = run_trace(
        topo,
        AlgorithmOptions::Mda(MdaOptions { traceroute: fast_opts(), ..MdaOptions::default() }),
        NetworkOptions::default(),
        dest,
    )
    .await;

    assert_eq!(run.timeouts_at(3), 3, "the silent hop absorbs num_probes flows");
    let lattice = run.lattice();
    let star = lattice.node(3, None).expect("star node at ttl 3");
    assert!(star.edges.iter().any(|e| e.to == Some(ip(0, 4).into())), "edge out of the star");
    let r2 = lattice.node(2, Some(ip(0, 2).into())).expect("ttl 2 node");
    assert!(r2.edges.iter().any(|e| e.to.is_none()), "edge into the star");
}

/// Scenario 3: a per-flow load balancer at TTL 2 splits into two next-hops
/// that merge again at TTL 4. MDA finds both links and probes at least
/// k(2, 0.05) = 11 flows from the TTL-2 interface.
#[tokio::test(flavor = "multi_thread")]
async fn mda_discovers_parallel_paths() {
    let dest = ip(0, 9);
    let a = ip(3, 1);
    let b = ip(3, 2);
    let topo = SimTopology {
        layers: vec![
            vec![Some(ip(0, 1))],
            vec![Some(ip(0, 2))],
            vec![Some(a), Some(b)],
            vec![Some(ip(0, 4))],
        ],
        destination: dest,
        link_delay: Duration::from_millis(2),
    };
    let run = run_trace(
        topo,
        AlgorithmOptions::Mda(MdaOptions { traceroute: fast_opts(), ..MdaOptions::default() }),
        NetworkOptions::default(),
        dest,
    )
    .await;

    let links = run.links();
    let r2: Option<IpAddr> = Some(ip(0, 2).into());
    assert!(links.contains(&(2, r2, Some(a.into()))), "link to first next-hop: {links:?}");
    assert!(links.contains(&(2, r2, Some(b.into()))), "link to second next-hop: {links:?}");

    // Distinct flows observed at TTL 3 witness the stopping rule
    let flows_at_3: HashSet<u16> = run.replies_at(3).iter().map(|(_, _, f)| *f).collect();
    assert!(flows_at_3.len() >= 11, "probed {} flows from the TTL-2 interface", flows_at_3.len());

    // Both parallel hops feed the merge point
    let lattice = run.lattice();
    for hop in [a, b] {
        let node = lattice.node(3, Some(hop.into())).expect("parallel hop in lattice");
        assert!(node.edges.iter().any(|e| e.to == Some(ip(0, 4).into())), "merge edge from {hop}");
    }
}

/// Scenario 4: paris in the load-balanced topology sees exactly one of the
/// two parallel hops, consistently, on all three probes.
#[tokio::test(flavor = "multi_thread")]
async fn paris_sees_single_consistent_path() {
    let dest = ip(0, 9);
    let a = ip(3, 1);
    let b = ip(3, 2);
    let topo = SimTopology {
        layers: vec![
            vec![Some(ip(0, 1))],
            vec![Some(ip(0, 2))],
            vec![Some(a), Some(b)],
            vec![Some(ip(0, 4))],
        ],
        destination: dest,
        link_delay: Duration::from_millis(2),
    };
    let run = run_trace(
        topo,
        AlgorithmOptions::ParisTraceroute(fast_opts()),
        NetworkOptions::default(),
        dest,
    )
    .await;

    let replies = run.replies_at(3);
    assert_eq!(replies.len(), 3);
    let hops: HashSet<IpAddr> = replies.iter().map(|(from, _, _)| *from).collect();
    assert_eq!(hops.len(), 1, "paris must not see phantom branches: {hops:?}");
    assert!(hops.iter().all(|h| *h == IpAddr::from(a) || *h == IpAddr::from(b)));
}

/// Scenario 5: the destination answers port-unreachable at TTL 2; the
/// algorithm terminates and no TTL-3 probes are issued.
#[tokio::test(flavor = "multi_thread")]
async fn destination_at_ttl_two_stops_probing() {
    let dest = ip(0, 9);
    let topo = SimTopology::chain(&[ip(0, 1)], dest);
    let run = run_trace(
        topo,
        AlgorithmOptions::ParisTraceroute(fast_opts()),
        NetworkOptions::default(),
        dest,
    )
    .await;

    assert!(matches!(
        run.outcome,
        TerminationOutcome::Traceroute { status: TraceStatus::DestinationReached { ttl: 2 } }
    ));
    assert_eq!(run.replies_at(2).len(), 3);
    assert!(run.replies_at(3).is_empty(), "no probes past the destination");
    assert_eq!(run.timeouts_at(3), 0);
}

/// Boundary: max_ttl = 1 emits results only for TTL 1 and exhausts.
#[tokio::test(flavor = "multi_thread")]
async fn hop_limit_one() {
    let dest = ip(0, 5);
    let topo = SimTopology::chain(&[ip(0, 1), ip(0, 2)], dest);
    let opts = TracerouteOptions { max_ttl: 1, ..fast_opts() };
    let run = run_trace(
        topo,
        AlgorithmOptions::ParisTraceroute(opts),
        NetworkOptions::default(),
        dest,
    )
    .await;

    assert_eq!(run.replies_at(1).len(), 3);
    assert!(run.replies_at(2).is_empty());
    assert!(matches!(
        run.outcome,
        TerminationOutcome::Traceroute { status: TraceStatus::HopLimitExhausted }
    ));
}

/// Boundary: num_probes = 1 emits exactly one event per TTL.
#[tokio::test(flavor = "multi_thread")]
async fn single_probe_per_ttl() {
    let dest = ip(0, 5);
    let topo = SimTopology::chain(&[ip(0, 1), ip(0, 2)], dest);
    let opts = TracerouteOptions { num_probes: 1, max_outstanding: 8, ..fast_opts() };
    let run = run_trace(
        topo,
        AlgorithmOptions::ParisTraceroute(opts),
        NetworkOptions::default(),
        dest,
    )
    .await;

    for ttl in 1..=3u8 {
        assert_eq!(run.replies_at(ttl).len() + run.timeouts_at(ttl), 1, "ttl {ttl}");
    }
}

/// Scenario 6: pacing. With a 100 ms minimum inter-send interval and 30
/// probes, the whole send schedule spans at least 2.9 seconds.
#[tokio::test(flavor = "multi_thread")]
async fn pacing_spreads_sends() {
    let dest = ip(0, 10);
    let hops: Vec<Ipv4Addr> = (1..=9).map(|i| ip(0, i)).collect();
    let topo = SimTopology::chain(&hops, dest);
    let network = NetworkOptions { min_inter_send: Duration::from_millis(100), debug: false };

    let started = Instant::now();
    let run = run_trace(topo, AlgorithmOptions::ParisTraceroute(fast_opts()), network, dest).await;
    let elapsed = started.elapsed();

    let total: usize = (1..=10u8).map(|ttl| run.replies_at(ttl).len() + run.timeouts_at(ttl)).sum();
    assert_eq!(total, 30, "ten levels of three probes each");
    assert!(
        elapsed >= Duration::from_millis(2900),
        "30 paced probes must span >= 2.9s, took {elapsed:?}"
    );
}

/// ICMP tracerouting end to end: echo replies classify as destination
/// reached.
#[tokio::test(flavor = "multi_thread")]
async fn icmp_trace_reaches_destination() {
    let dest = ip(0, 5);
    let topo = SimTopology::chain(&[ip(0, 1), ip(0, 2)], dest);
    let opts = TracerouteOptions { transport: TransportProtocol::Icmp, src_port: 0, dst_port: 0, ..fast_opts() };
    let run = run_trace(
        topo,
        AlgorithmOptions::ParisTraceroute(opts),
        NetworkOptions::default(),
        dest,
    )
    .await;

    assert!(matches!(
        run.outcome,
        TerminationOutcome::Traceroute { status: TraceStatus::DestinationReached { ttl: 3 } }
    ));
    assert_eq!(run.replies_at(3).len(), 3);
}

/// TCP tracerouting end to end: the destination's RST pairs back to the
/// probe through the acknowledgement number.
#[tokio::test(flavor = "multi_thread")]
async fn tcp_trace_reaches_destination() {
    let dest = ip(0, 5);
    let topo = SimTopology::chain(&[ip(0, 1)], dest);
    let opts = TracerouteOptions {
        transport: TransportProtocol::Tcp,
        src_port: 16449,
        dst_port: 16963,
        ..fast_opts()
    };
    let run = run_trace(
        topo,
        AlgorithmOptions::ParisTraceroute(opts),
        NetworkOptions::default(),
        dest,
    )
    .await;

    assert!(matches!(
        run.outcome,
        TerminationOutcome::Traceroute { status: TraceStatus::DestinationReached { ttl: 2 } }
    ));
}

/// Every sent probe resolves to exactly one reply or timeout, even with a
/// lossy hop in the path.
#[tokio::test(flavor = "multi_thread")]
async fn one_outcome_per_probe() {
    let dest = ip(0, 5);
    let topo = SimTopology {
        layers: vec![vec![Some(ip(0, 1))], vec![None], vec![Some(ip(0, 3))]],
        destination: dest,
        link_delay: Duration::from_millis(2),
    };
    let run = run_trace(
        topo,
        AlgorithmOptions::ParisTraceroute(fast_opts()),
        NetworkOptions::default(),
        dest,
    )
    .await;

    for ttl in 1..=4u8 {
        assert_eq!(
            run.replies_at(ttl).len() + run.timeouts_at(ttl),
            3,
            "ttl {ttl} must resolve every probe exactly once"
        );
    }
}
