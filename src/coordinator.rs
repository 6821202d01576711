//! Reconnection state machine.
//!
//! [`Coordinator`] holds the single authoritative connection phase together
//! with the retry and heartbeat counters. It never sleeps and never touches
//! the channel: every input returns an [`Action`] for the supervisor task to
//! carry out (arm a timer, start a refresh, send a ping). Keeping the machine
//! synchronous means each transition, including increment-then-compare on
//! the counters, happens in one step that nothing else can interleave with.

use std::time::Duration;

use tokio::time::timeout;

use crate::Result;
use crate::backoff::BackoffPolicy;
use crate::channel::{Channel, ChannelError, Generation};
use crate::config::Config;
use crate::heartbeat::{HeartbeatMonitor, Probe, Verdict};

/// Connection status observed by consumers.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected; a retry may be pending
    Disconnected,
    /// A connect-and-join cycle is in flight
    Connecting,
    /// Joined to every topic
    Connected,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Point-in-time view of a manager.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub state: ConnectionState,
    /// Consecutive failed retries since the last successful join
    pub retry_count: u32,
    /// Consecutive failed heartbeats on the current connection
    pub heartbeat_failures: u32,
    /// Retries ran out; nothing more happens without [`retry`](crate::manager::ConnectionManager::retry)
    pub exhausted: bool,
    /// The manager was torn down; the snapshot is final
    pub torn_down: bool,
}

impl Snapshot {
    pub(crate) fn initial(state: ConnectionState) -> Self {
        Self {
            state,
            retry_count: 0,
            heartbeat_failures: 0,
            exhausted: false,
            torn_down: false,
        }
    }
}

/// What started a refresh. Only retries scheduled by backoff count against the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Initial,
    Retry,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Attempt {
    id: u64,
    origin: Origin,
    /// Newest generation reported lost while this attempt was in flight
    lost: Option<Generation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Disconnected with nothing scheduled
    Idle,
    /// Disconnected, waiting for the backoff timer
    Backoff,
    Connecting(Attempt),
    Connected(Generation),
    /// Disconnected after running out of retries
    Exhausted,
    Closed,
}

/// Side effect requested by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    None,
    /// Arm the backoff timer
    Wait(Duration),
    /// Cancel any backoff timer and run a refresh tagged with this attempt id
    Refresh(u64),
    /// Ping the connection of this generation
    Ping(Generation),
}

#[derive(Debug)]
pub(crate) struct Coordinator {
    phase: Phase,
    retry_count: u32,
    max_retries: u32,
    backoff: BackoffPolicy,
    heartbeat: HeartbeatMonitor,
    last_attempt: u64,
}

impl Coordinator {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            phase: Phase::Idle,
            retry_count: 0,
            max_retries: config.reconnect.max_retries,
            backoff: config.reconnect.backoff,
            heartbeat: HeartbeatMonitor::new(config.heartbeat.max_failures),
            last_attempt: 0,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match self.phase {
            Phase::Connecting(_) => ConnectionState::Connecting,
            Phase::Connected(_) => ConnectionState::Connected,
            Phase::Idle | Phase::Backoff | Phase::Exhausted | Phase::Closed => {
                ConnectionState::Disconnected
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state(),
            retry_count: self.retry_count,
            heartbeat_failures: self.heartbeat.failures(),
            exhausted: self.phase == Phase::Exhausted,
            torn_down: self.phase == Phase::Closed,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Connected(_))
    }

    /// The creation-time refresh.
    pub(crate) fn start(&mut self) -> Action {
        match self.phase {
            Phase::Idle => self.begin_refresh(Origin::Initial),
            _ => Action::None,
        }
    }

    fn begin_refresh(&mut self, origin: Origin) -> Action {
        self.last_attempt += 1;
        self.phase = Phase::Connecting(Attempt {
            id: self.last_attempt,
            origin,
            lost: None,
        });
        self.heartbeat.reset();
        Action::Refresh(self.last_attempt)
    }

    /// Schedule the next retry unless one is already pending or in flight.
    pub(crate) fn reconnect(&mut self) -> Action {
        match self.phase {
            Phase::Idle | Phase::Connected(_) => {}
            Phase::Backoff | Phase::Connecting(_) | Phase::Exhausted | Phase::Closed => {
                return Action::None;
            }
        }

        self.heartbeat.reset();
        if self.retry_count >= self.max_retries {
            #[cfg(feature = "tracing")]
            tracing::error!(
                retries = self.retry_count,
                "Reconnection attempts exhausted, giving up"
            );
            self.phase = Phase::Exhausted;
            return Action::None;
        }

        let delay = self.backoff.delay(self.retry_count);
        #[cfg(feature = "tracing")]
        tracing::info!(
            attempt = self.retry_count + 1,
            delay_ms = delay.as_millis(),
            "Scheduling reconnection"
        );
        self.phase = Phase::Backoff;
        Action::Wait(delay)
    }

    pub(crate) fn backoff_elapsed(&mut self) -> Action {
        match self.phase {
            Phase::Backoff => self.begin_refresh(Origin::Retry),
            _ => Action::None,
        }
    }

    /// Apply the outcome of refresh `attempt`. Outcomes of superseded attempts are ignored.
    pub(crate) fn refresh_finished(&mut self, attempt: u64, outcome: Result<Generation>) -> Action {
        let Phase::Connecting(current) = self.phase else {
            return Action::None;
        };
        if current.id != attempt {
            return Action::None;
        }

        // The transport may drop between the join acknowledgement and this outcome
        let outcome = match outcome {
            Ok(generation) if current.lost.is_some_and(|lost| lost >= generation) => {
                Err(ChannelError::ConnectionClosed.into())
            }
            other => other,
        };

        match outcome {
            Ok(generation) => {
                #[cfg(feature = "tracing")]
                tracing::info!(%generation, "Connected and joined all topics");
                self.phase = Phase::Connected(generation);
                self.retry_count = 0;
                self.heartbeat.reset();
                Action::None
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, retries = self.retry_count, "Connection refresh failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                self.phase = Phase::Idle;
                if current.origin == Origin::Retry {
                    self.retry_count = self.retry_count.saturating_add(1);
                }
                self.reconnect()
            }
        }
    }

    /// The transport reported a drop or error for `generation`.
    pub(crate) fn channel_lost(&mut self, generation: Generation) -> Action {
        if let Phase::Connecting(attempt) = &mut self.phase {
            attempt.lost = attempt.lost.max(Some(generation));
            return Action::None;
        }

        match self.phase {
            Phase::Connected(current) if current == generation => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%generation, "Connection lost");
                self.phase = Phase::Idle;
                self.reconnect()
            }
            _ => Action::None,
        }
    }

    pub(crate) fn heartbeat_tick(&mut self) -> Action {
        match self.phase {
            Phase::Connected(generation) => {
                if self.heartbeat.in_flight() {
                    return Action::None;
                }
                self.heartbeat.ping_sent();
                Action::Ping(generation)
            }
            Phase::Closed => Action::None,
            _ => self.reconnect(),
        }
    }

    /// Record a ping result for `generation`, escalating to a reconnect at the threshold.
    pub(crate) fn heartbeat_finished(&mut self, generation: Generation, probe: &Probe) -> Action {
        match self.phase {
            Phase::Connected(current) if current == generation => {}
            _ => return Action::None,
        }

        match self.heartbeat.record(probe) {
            Verdict::Healthy => Action::None,
            Verdict::Degraded { failures } => {
                #[cfg(feature = "tracing")]
                tracing::warn!(?probe, failures, "Heartbeat failed");
                #[cfg(not(feature = "tracing"))]
                let _ = failures;
                Action::None
            }
            Verdict::Escalate => {
                #[cfg(feature = "tracing")]
                tracing::warn!(?probe, "Heartbeat failure threshold reached, reconnecting");
                self.phase = Phase::Idle;
                self.reconnect()
            }
        }
    }

    /// Consumer-initiated retry; also the only way out of the exhausted state.
    pub(crate) fn retry(&mut self) -> Action {
        match self.phase {
            Phase::Idle | Phase::Backoff | Phase::Exhausted => {
                self.retry_count = 0;
                self.begin_refresh(Origin::Manual)
            }
            Phase::Connecting(_) | Phase::Connected(_) | Phase::Closed => Action::None,
        }
    }

    pub(crate) fn close(&mut self) {
        self.phase = Phase::Closed;
        self.heartbeat.reset();
    }
}

/// One connect-and-join cycle: tear down, re-open, join `topics`.
///
/// Succeeds with the new connection's generation only when the join is
/// acknowledged with `ok: true`. Any other outcome, including a missing or
/// malformed acknowledgement, is an error.
pub(crate) async fn refresh_connection<C: Channel + ?Sized>(
    channel: &C,
    topics: &[String],
    request_timeout: Duration,
) -> Result<Generation> {
    if let Err(e) = channel.disconnect().await {
        #[cfg(feature = "tracing")]
        tracing::debug!(error = %e, "Ignoring error while closing previous connection");
        #[cfg(not(feature = "tracing"))]
        let _ = &e;
    }

    let generation = timeout(request_timeout, channel.connect()).await??;
    let ack = timeout(request_timeout, channel.join_topics(topics)).await??;

    if ack.ok {
        Ok(generation)
    } else {
        Err(ChannelError::JoinRejected(
            ack.error
                .unwrap_or_else(|| "server did not accept the topics".to_owned()),
        )
        .into())
    }
}
