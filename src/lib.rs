//! Paris traceroute and multipath (MDA) route discovery.
//!
//! The core is an event loop ([`engine::PtLoop`]) driving raw-socket (or
//! simulated) probing for one or more algorithm instances. Probes are
//! assembled byte-exactly by [`packet`], with the transport checksum used
//! as the flow identifier; replies are paired to probes by the matching
//! key in [`probe`]; [`algo`] holds the two algorithms and the MDA
//! stopping rule; [`lattice`] is the multipath result container.

pub mod algo;
pub mod config;
pub mod engine;
pub mod lattice;
pub mod net;
pub mod packet;
pub mod probe;
pub mod report;
pub mod sim;
