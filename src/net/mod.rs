pub mod sender;
pub mod sniffer;
pub mod socket;
pub mod timer;
pub mod transport;

pub use sender::{PacedSender, QueuedSend, SendOutcome};
pub use sniffer::{ReplyCandidate, spawn_sniffer};
pub use socket::{RawProbeSink, RawReplySource, check_permissions, detect_source_ip};
pub use timer::TimerWheel;
pub use transport::{ProbeSink, ReplySource, SniffFrame, Sniffed, WireProbe};
