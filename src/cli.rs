use clap::Parser;

use paristrace::config::{
    AlgorithmOptions, Config, IpFamily, MdaOptions, NetworkOptions, TCP_DEFAULT_DST_PORT,
    TCP_DEFAULT_SRC_PORT, TCP_DST_PORT_USING_T, TracerouteOptions, TransportProtocol,
    UDP_DEFAULT_DST_PORT, UDP_DEFAULT_SRC_PORT, UDP_DST_PORT_USING_U, parse_inter_send,
};

/// Print the IP-level path toward a destination host, with multipath
/// (MDA) discovery of load-balanced routes
#[derive(Parser, Debug, Clone)]
#[command(name = "paristrace")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Destination host (IP address or hostname)
    #[arg(required = true)]
    pub destination: String,

    /// Use IPv4
    #[arg(short = '4')]
    pub ipv4: bool,

    /// Use IPv6
    #[arg(short = '6')]
    pub ipv6: bool,

    /// Traceroute algorithm (paris-traceroute, mda)
    #[arg(short = 'a', long = "algorithm", default_value = "paris-traceroute")]
    pub algorithm: String,

    /// Probe transport (udp, tcp, icmp); -I/-T/-U take precedence
    #[arg(short = 'P', long = "protocol", default_value = "udp")]
    pub protocol: String,

    /// Use ICMP for tracerouting
    #[arg(short = 'I', long = "icmp")]
    pub icmp: bool,

    /// Use TCP for tracerouting (destination port defaults to 80)
    #[arg(short = 'T', long = "tcp")]
    pub tcp: bool,

    /// Use UDP for tracerouting (destination port defaults to 53)
    #[arg(short = 'U', long = "udp")]
    pub udp: bool,

    /// Destination port
    #[arg(short = 'p', long = "dst-port")]
    pub dst_port: Option<u16>,

    /// Source port
    #[arg(short = 's', long = "src-port")]
    pub src_port: Option<u16>,

    /// Maximum TTL (hops)
    #[arg(short = 'm', long = "max-ttl", default_value = "30")]
    pub max_ttl: u8,

    /// Probes per TTL
    #[arg(short = 'q', long = "num-probes", default_value = "3")]
    pub num_probes: usize,

    /// Per-probe timeout in seconds
    #[arg(short = 'w', long = "wait", default_value = "5.0")]
    pub wait: f64,

    /// Minimal interval between probes; values above 10 are milliseconds,
    /// otherwise seconds (floats allowed)
    #[arg(short = 'z', long = "send-wait", default_value = "0")]
    pub send_wait: f64,

    /// MDA: probability bound on missing a parallel next-hop
    #[arg(long = "confidence")]
    pub confidence: Option<f64>,

    /// MDA: cap on parallel next-hops per interface
    #[arg(long = "max-branch")]
    pub max_branch: Option<usize>,

    /// Print probing diagnostics on stderr
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,
}

impl Args {
    fn explicit_transports(&self) -> usize {
        usize::from(self.icmp) + usize::from(self.tcp) + usize::from(self.udp)
    }

    /// The effective transport: explicit flags win over --protocol.
    fn transport(&self) -> Result<TransportProtocol, String> {
        if self.icmp {
            return Ok(TransportProtocol::Icmp);
        }
        if self.tcp {
            return Ok(TransportProtocol::Tcp);
        }
        if self.udp {
            return Ok(TransportProtocol::Udp);
        }
        match self.protocol.to_lowercase().as_str() {
            "udp" => Ok(TransportProtocol::Udp),
            "tcp" => Ok(TransportProtocol::Tcp),
            "icmp" => Ok(TransportProtocol::Icmp),
            other => Err(format!("unknown protocol: {other}. Use udp, tcp, or icmp")),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ipv4 && self.ipv6 {
            return Err("cannot set both ip versions".into());
        }
        if self.explicit_transports() > 1 {
            return Err("cannot use simultaneously icmp, tcp and udp tracerouting".into());
        }
        let transport = self.transport()?;
        if transport == TransportProtocol::Icmp && (self.src_port.is_some() || self.dst_port.is_some()) {
            return Err("cannot use --src-port or --dst-port when using icmp tracerouting".into());
        }
        match self.algorithm.as_str() {
            "paris-traceroute" | "mda" => {}
            other => return Err(format!("unknown algorithm: {other}")),
        }
        if self.algorithm != "mda" && (self.confidence.is_some() || self.max_branch.is_some()) {
            return Err("cannot pass options related to MDA when using another algorithm".into());
        }
        if self.wait <= 0.0 {
            return Err("per-probe timeout must be positive".into());
        }
        if self.send_wait < 0.0 {
            return Err("send interval cannot be negative".into());
        }
        Ok(())
    }

    /// Build the configuration record handed to the loop. Validation
    /// errors here are `CONFIG_INVALID`: report and exit before probing.
    pub fn to_config(&self) -> Result<Config, String> {
        self.validate()?;
        let transport = self.transport()?;

        let (src_port, dst_port) = match transport {
            TransportProtocol::Udp => (
                self.src_port.unwrap_or(UDP_DEFAULT_SRC_PORT),
                self.dst_port
                    .unwrap_or(if self.udp { UDP_DST_PORT_USING_U } else { UDP_DEFAULT_DST_PORT }),
            ),
            TransportProtocol::Tcp => (
                self.src_port.unwrap_or(TCP_DEFAULT_SRC_PORT),
                self.dst_port
                    .unwrap_or(if self.tcp { TCP_DST_PORT_USING_T } else { TCP_DEFAULT_DST_PORT }),
            ),
            TransportProtocol::Icmp => (0, 0),
        };

        let traceroute = TracerouteOptions {
            transport,
            src_port,
            dst_port,
            min_ttl: 1,
            max_ttl: self.max_ttl,
            num_probes: self.num_probes,
            per_probe_timeout: std::time::Duration::from_secs_f64(self.wait),
            max_outstanding: 8 * self.num_probes.max(1),
        };

        let algorithm = match self.algorithm.as_str() {
            "mda" => {
                let defaults = MdaOptions::default();
                AlgorithmOptions::Mda(MdaOptions {
                    traceroute,
                    confidence: self.confidence.unwrap_or(defaults.confidence),
                    max_branch: self.max_branch.unwrap_or(defaults.max_branch),
                    flow_min: defaults.flow_min,
                    flow_max: defaults.flow_max,
                })
            }
            _ => AlgorithmOptions::ParisTraceroute(traceroute),
        };

        let family = if self.ipv4 {
            IpFamily::V4
        } else if self.ipv6 {
            IpFamily::V6
        } else {
            IpFamily::Auto
        };

        let config = Config {
            family,
            algorithm,
            network: NetworkOptions {
                min_inter_send: parse_inter_send(self.send_wait),
                debug: self.debug,
            },
        };
        config.algorithm.validate()?;
        Ok(config)
    }
}
