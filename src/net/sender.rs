//! Paced probe transmission.
//!
//! All probes from all instances funnel through one sender, which enforces
//! the global minimum inter-send interval and the per-instance bound on
//! unresolved probes. Deferred probes wait in a FIFO ring; the event loop
//! asks for the next wake-up deadline and pumps the ring when it passes.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use super::transport::{ProbeSink, WireProbe};
use crate::config::TransportProtocol;

const SEND_ATTEMPTS: usize = 3;

/// A probe waiting in the pacing ring.
pub struct QueuedSend {
    pub probe_id: u64,
    pub instance: usize,
    pub bytes: Vec<u8>,
    pub dst: IpAddr,
    pub ttl: u8,
    pub transport: TransportProtocol,
}

/// What happened to a pumped probe.
pub enum SendOutcome {
    Sent { probe_id: u64, at: Instant },
    Failed { probe_id: u64, error: String },
}

pub struct PacedSender {
    sink: Box<dyn ProbeSink>,
    min_interval: Duration,
    next_allowed: Option<Instant>,
    ring: VecDeque<QueuedSend>,
}

impl PacedSender {
    pub fn new(sink: Box<dyn ProbeSink>, min_interval: Duration) -> Self {
        Self { sink, min_interval, next_allowed: None, ring: VecDeque::new() }
    }

    pub fn enqueue(&mut self, probe: QueuedSend) {
        self.ring.push_back(probe);
    }

    pub fn is_idle(&self) -> bool {
        self.ring.is_empty()
    }

    /// When the loop should wake to send the ring head, or `None` if the
    /// ring is empty or the head is blocked on its instance's outstanding
    /// bound (an outcome event will unblock it).
    pub fn next_deadline(&self, can_send: impl Fn(usize) -> bool) -> Option<Instant> {
        let head = self.ring.front()?;
        if !can_send(head.instance) {
            return None;
        }
        Some(self.next_allowed.unwrap_or_else(Instant::now))
    }

    /// Send every ring-head probe whose pacing slot has arrived and whose
    /// instance is under its outstanding bound.
    pub fn pump(&mut self, now: Instant, can_send: impl Fn(usize) -> bool) -> Vec<SendOutcome> {
        let mut outcomes = Vec::new();
        while let Some(head) = self.ring.front() {
            if !can_send(head.instance) {
                break;
            }
            if let Some(at) = self.next_allowed
                && at > now
            {
                break;
            }
            let probe = self.ring.pop_front().unwrap();
            let sent_at = Instant::now();
            outcomes.push(self.transmit(probe, sent_at));
            if !self.min_interval.is_zero() {
                self.next_allowed = Some(sent_at + self.min_interval);
            }
        }
        outcomes
    }

    fn transmit(&mut self, probe: QueuedSend, at: Instant) -> SendOutcome {
        let wire = WireProbe {
            bytes: &probe.bytes,
            dst: probe.dst,
            ttl: probe.ttl,
            transport: probe.transport,
        };
        let mut last_error = String::new();
        for _ in 0..SEND_ATTEMPTS {
            match self.sink.send(&wire) {
                Ok(n) if n == probe.bytes.len() => {
                    return SendOutcome::Sent { probe_id: probe.probe_id, at };
                }
                Ok(n) => {
                    last_error = format!("partial write ({n} of {} bytes)", probe.bytes.len());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
        }
        SendOutcome::Failed { probe_id: probe.probe_id, error: last_error }
    }

    /// Drop queued probes belonging to a stopped instance so they cannot
    /// block the ring head.
    pub fn purge_instance(&mut self, instance: usize) {
        self.ring.retain(|q| q.instance != instance);
    }

    /// Drop everything still queued (loop teardown).
    pub fn clear(&mut self) {
        self.ring.clear();
    }
}
