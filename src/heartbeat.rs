//! Liveness and membership verification.
//!
//! A transport can report itself open while the server has silently dropped
//! this client from its rooms. The heartbeat asks the server which rooms it
//! holds for us and compares the answer with the topic set.

use std::time::Duration;

use tokio::time::timeout;

use crate::channel::Channel;
use crate::topics::TopicSet;

/// Result of a single ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Probe {
    /// Reply arrived in time and reported exactly the expected rooms
    Alive,
    /// Reply arrived in time with a different room list
    Mismatch { reported: Vec<String> },
    /// No reply within the heartbeat timeout
    TimedOut,
    /// The ping could not be sent or the reply was malformed
    Failed(String),
}

impl Probe {
    pub(crate) fn is_alive(&self) -> bool {
        matches!(self, Self::Alive)
    }
}

/// Ping the channel and judge its membership report against `topics`.
///
/// A missing reply is treated exactly like a negative one.
pub(crate) async fn probe<C: Channel + ?Sized>(
    channel: &C,
    topics: &TopicSet,
    deadline: Duration,
) -> Probe {
    match timeout(deadline, channel.ping_topics()).await {
        Ok(Ok(reply)) if topics.matches(&reply.topics) => Probe::Alive,
        Ok(Ok(reply)) => Probe::Mismatch {
            reported: reply.topics,
        },
        Ok(Err(e)) => Probe::Failed(e.to_string()),
        Err(_) => Probe::TimedOut,
    }
}

/// What the monitor concluded after recording a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Healthy,
    Degraded { failures: u32 },
    /// Threshold reached; the counter has already been reset
    Escalate,
}

/// Consecutive heartbeat failure counter.
#[derive(Debug)]
pub(crate) struct HeartbeatMonitor {
    failures: u32,
    max_failures: u32,
    in_flight: bool,
}

impl HeartbeatMonitor {
    pub(crate) fn new(max_failures: u32) -> Self {
        Self {
            failures: 0,
            max_failures,
            in_flight: false,
        }
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub(crate) fn ping_sent(&mut self) {
        self.in_flight = true;
    }

    pub(crate) fn record(&mut self, probe: &Probe) -> Verdict {
        self.in_flight = false;
        if probe.is_alive() {
            self.failures = 0;
            return Verdict::Healthy;
        }

        // Increment, compare and reset against the same counter in one step
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.max_failures {
            self.failures = 0;
            Verdict::Escalate
        } else {
            Verdict::Degraded {
                failures: self.failures,
            }
        }
    }

    /// Forget failures and any outstanding ping, e.g. after a new connection.
    pub(crate) fn reset(&mut self) {
        self.failures = 0;
        self.in_flight = false;
    }
}
