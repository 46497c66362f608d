use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Port defaults, matching modern traceroute for linux
pub const UDP_DEFAULT_SRC_PORT: u16 = 33456;
pub const UDP_DEFAULT_DST_PORT: u16 = 33457;
/// `-U` targets DNS unless a destination port is given explicitly
pub const UDP_DST_PORT_USING_U: u16 = 53;
pub const TCP_DEFAULT_SRC_PORT: u16 = 16449;
pub const TCP_DEFAULT_DST_PORT: u16 = 16963;
/// `-T` targets HTTP unless a destination port is given explicitly
pub const TCP_DST_PORT_USING_T: u16 = 80;

/// Address family selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpFamily {
    /// Guess from the destination address
    #[default]
    Auto,
    V4,
    V6,
}

/// Probe transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportProtocol {
    #[default]
    Udp,
    Tcp,
    Icmp,
}

/// Options shared by every tracerouting algorithm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerouteOptions {
    pub transport: TransportProtocol,
    pub src_port: u16,
    pub dst_port: u16,
    pub min_ttl: u8,
    pub max_ttl: u8,
    /// Probes per TTL (paris); minimum per interface (mda)
    pub num_probes: usize,
    #[serde(with = "duration_serde")]
    pub per_probe_timeout: Duration,
    /// Cap on unresolved sent probes; probes past it wait in the pacing ring
    pub max_outstanding: usize,
}

impl Default for TracerouteOptions {
    fn default() -> Self {
        let num_probes = 3;
        Self {
            transport: TransportProtocol::Udp,
            src_port: UDP_DEFAULT_SRC_PORT,
            dst_port: UDP_DEFAULT_DST_PORT,
            min_ttl: 1,
            max_ttl: 30,
            num_probes,
            per_probe_timeout: Duration::from_secs(5),
            max_outstanding: 8 * num_probes,
        }
    }
}

impl TracerouteOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_ttl == 0 {
            return Err("min TTL must be at least 1".into());
        }
        if self.max_ttl < self.min_ttl {
            return Err("max TTL must be >= min TTL".into());
        }
        if self.num_probes == 0 {
            return Err("num probes must be at least 1".into());
        }
        if self.per_probe_timeout.is_zero() {
            return Err("per-probe timeout must be positive".into());
        }
        if self.max_outstanding == 0 {
            return Err("max outstanding must be at least 1".into());
        }
        Ok(())
    }
}

/// Options for the multipath detection algorithm; embeds the traceroute
/// options it generalizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdaOptions {
    pub traceroute: TracerouteOptions,
    /// Probability bound on missing a parallel next-hop (alpha)
    pub confidence: f64,
    /// Cap on parallel next-hops enumerated per interface
    pub max_branch: usize,
    /// Flow identifier pool bounds, inclusive
    pub flow_min: u16,
    pub flow_max: u16,
}

impl Default for MdaOptions {
    fn default() -> Self {
        Self {
            traceroute: TracerouteOptions::default(),
            confidence: 0.05,
            max_branch: 16,
            flow_min: 1,
            flow_max: 0xFFFE,
        }
    }
}

impl MdaOptions {
    pub fn validate(&self) -> Result<(), String> {
        self.traceroute.validate()?;
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err("mda confidence must be strictly between 0 and 1".into());
        }
        if self.max_branch == 0 {
            return Err("mda max branch must be at least 1".into());
        }
        if self.flow_min == 0 || self.flow_min > self.flow_max {
            return Err("flow identifier range is empty or includes the reserved zero".into());
        }
        Ok(())
    }
}

/// Per-instance algorithm choice with its options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AlgorithmOptions {
    ParisTraceroute(TracerouteOptions),
    Mda(MdaOptions),
}

impl AlgorithmOptions {
    /// The embedded traceroute options, whichever the variant.
    pub fn traceroute(&self) -> &TracerouteOptions {
        match self {
            AlgorithmOptions::ParisTraceroute(t) => t,
            AlgorithmOptions::Mda(m) => &m.traceroute,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            AlgorithmOptions::ParisTraceroute(t) => t.validate(),
            AlgorithmOptions::Mda(m) => m.validate(),
        }
    }
}

/// Loop-wide network options shared by all instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkOptions {
    /// Minimum interval between any two sends, across all instances
    #[serde(with = "duration_serde")]
    pub min_inter_send: Duration,
    /// Diagnostics on stderr (unmatched replies, collisions, send errors)
    pub debug: bool,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self { min_inter_send: Duration::ZERO, debug: false }
    }
}

/// Complete configuration handed to the loop at creation; there is no
/// process-wide mutable option state.
#[derive(Debug, Clone)]
pub struct Config {
    pub family: IpFamily,
    pub algorithm: AlgorithmOptions,
    pub network: NetworkOptions,
}

/// Interpret the `-z WAIT` value: more than 10 means milliseconds,
/// otherwise seconds (floats allowed).
pub fn parse_inter_send(value: f64) -> Duration {
    if value > 10.0 {
        Duration::from_secs_f64(value / 1000.0)
    } else {
        Duration::from_secs_f64(value.max(0.0))
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
