pub mod flow;
pub mod mda;
pub mod stopping;
pub mod traceroute;

pub use flow::{FlowPool, icmp_flow_id, paris_flow_id};
pub use mda::Mda;
pub use stopping::stopping_threshold;
pub use traceroute::ParisTraceroute;
