use anyhow::{Context, Result, bail};
use clap::Parser;
use parking_lot::Mutex;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;

use paristrace::config::{Config, IpFamily, TransportProtocol};
use paristrace::engine::{AlgorithmKind, Event, PtLoop};
use paristrace::net::{RawProbeSink, RawReplySource, check_permissions, detect_source_ip};
use paristrace::report::Report;

mod cli;
use cli::Args;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match args.to_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("E: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&args, config).await {
        eprintln!("E: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: &Args, config: Config) -> Result<()> {
    let destination = resolve_destination(&args.destination, config.family)
        .with_context(|| format!("cannot resolve destination {}", args.destination))?;

    let transport = config.algorithm.traceroute().transport;
    check_permissions(destination.is_ipv6(), transport)?;
    let local = detect_source_ip(destination).context("cannot determine source address")?;

    let sink = Box::new(RawProbeSink::new(destination.is_ipv6(), transport)?);
    let source = Box::new(RawReplySource::new(
        destination.is_ipv6(),
        transport == TransportProtocol::Tcp,
    )?);

    let kind = AlgorithmKind::of(&config.algorithm);
    let report = Arc::new(Mutex::new(Report::new()));
    let handler_report = report.clone();
    let handler = Box::new(move |handle: &paristrace::engine::LoopHandle, event: &Event| {
        for line in handler_report.lock().record(event) {
            println!("{line}");
        }
        if let Event::AlgorithmTerminated { instance, .. } = event {
            handle.stop_instance(*instance);
            handle.remove_instance(*instance);
            handle.terminate();
        }
    });

    let mut pt_loop = PtLoop::new(sink, source, local, &config.network, handler);
    pt_loop.add_instance(&config.algorithm, destination)?;

    println!(
        "{} to {} ({}), {} hops max, {} bytes packets",
        kind.name(),
        args.destination,
        destination,
        config.algorithm.traceroute().max_ttl,
        probe_size(destination, transport),
    );

    let handle = pt_loop.handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.terminate();
    });

    pt_loop.run().await.context("main loop interrupted")?;

    for line in report.lock().lattice_lines() {
        println!("{line}");
    }
    Ok(())
}

/// On-the-wire probe size: IP header + transport header + the two-byte
/// flow compensator.
fn probe_size(destination: IpAddr, transport: TransportProtocol) -> usize {
    let ip = if destination.is_ipv6() { 40 } else { 20 };
    let upper = match transport {
        TransportProtocol::Udp => 8,
        TransportProtocol::Tcp => 20,
        TransportProtocol::Icmp => 8,
    };
    ip + upper + 2
}

fn resolve_destination(destination: &str, family: IpFamily) -> Result<IpAddr> {
    let wanted = |ip: &IpAddr| match family {
        IpFamily::Auto => true,
        IpFamily::V4 => ip.is_ipv4(),
        IpFamily::V6 => ip.is_ipv6(),
    };

    if let Ok(ip) = destination.parse::<IpAddr>() {
        if !wanted(&ip) {
            bail!("address family does not match the requested ip version");
        }
        return Ok(ip);
    }

    let addrs: Vec<IpAddr> = format!("{destination}:0")
        .to_socket_addrs()?
        .map(|s| s.ip())
        .filter(|ip| wanted(ip))
        .collect();
    // Prefer IPv4 when the family is unconstrained
    if family == IpFamily::Auto
        && let Some(v4) = addrs.iter().find(|ip| ip.is_ipv4())
    {
        return Ok(*v4);
    }
    addrs.into_iter().next().context("no address found for destination")
}
