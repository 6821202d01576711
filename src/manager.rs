#![expect(
    clippy::module_name_repetitions,
    reason = "ConnectionManager is the public name consumers know"
)]

//! The connection manager façade.
//!
//! A [`ConnectionManager`] owns one [`Channel`] and one [`TopicSet`] for its
//! whole life. Creating it attaches the event handlers and starts a
//! supervisor task that performs the initial join, runs the heartbeat and
//! drives reconnection. All state transitions happen on that single task,
//! one input at a time, so timers, transport signals and refresh outcomes
//! can never interleave halfway through a transition.
//!
//! Dropping the manager tears it down. Teardown is synchronous from the
//! caller's point of view: the published status becomes final at once and
//! no later refresh, heartbeat or timer can change it. Releasing the
//! channel (detaching handlers, closing the connection) finishes on the
//! supervisor task; [`ConnectionManager::shutdown`] waits for it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::Stream;
use futures::future::{BoxFuture, FutureExt as _};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::Result;
use crate::channel::{Channel, ChannelEvent, Generation};
use crate::config::Config;
use crate::coordinator::{
    Action, ConnectionState, Coordinator, Snapshot, refresh_connection,
};
use crate::heartbeat::{Probe, probe};
use crate::registry::{EventRegistry, Listeners};
use crate::topics::TopicSet;

/// Keeps a [`Channel`] joined to a [`TopicSet`] and recovers it when it fails.
///
/// # Example
///
/// ```ignore
/// let channel = Arc::new(WebSocketChannel::for_namespace(&base, "division/42")?);
/// let registry = EventRegistry::new()
///     .on("matchLoaded", |payload| println!("{payload}"))?;
///
/// let manager = ConnectionManager::new(
///     channel,
///     TopicSet::new(["field", "pit-admin"]),
///     registry,
///     Config::default(),
/// )?;
///
/// let mut status = Box::pin(manager.status_stream());
/// while let Some(state) = status.next().await {
///     println!("{state}");
/// }
/// ```
#[derive(Debug)]
pub struct ConnectionManager<C: Channel> {
    // Declared first so dropping the manager tears down before anything else goes
    guard: TeardownGuard,
    id: Uuid,
    channel: Arc<C>,
    topics: TopicSet,
    snapshot_rx: watch::Receiver<Snapshot>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl<C: Channel> ConnectionManager<C> {
    /// Create a manager and start joining `topics`.
    ///
    /// The handlers in `registry` are attached to the channel here, once, and
    /// stay attached across every reconnection until teardown. Must be called
    /// from within a Tokio runtime.
    pub fn new(
        channel: Arc<C>,
        topics: TopicSet,
        registry: EventRegistry,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;

        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let listeners = registry.attach(channel.subscribe(), token.clone());
        let initial = if channel.is_connected() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        };

        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::initial(initial));
        let snapshot_tx = Arc::new(snapshot_tx);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let mut ticker = interval_at(
            Instant::now() + config.heartbeat.interval,
            config.heartbeat.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let supervisor = Supervisor {
            channel: Arc::clone(&channel),
            topics: topics.clone(),
            coordinator: Coordinator::new(&config),
            listeners,
            snapshot: Arc::clone(&snapshot_tx),
            commands: command_rx,
            token: token.clone(),
            ticker,
            request_timeout: config.request_timeout,
            heartbeat_timeout: config.heartbeat.timeout,
            refresh: None,
            ping: None,
            backoff: None,
        };

        #[cfg(feature = "tracing")]
        let task = {
            use tracing::Instrument as _;

            tracing::debug!(manager = %id, %topics, "Starting connection manager");
            tokio::spawn(
                supervisor
                    .run()
                    .instrument(tracing::debug_span!("roomlink", manager = %id)),
            )
        };
        #[cfg(not(feature = "tracing"))]
        let task = tokio::spawn(supervisor.run());

        Ok(Self {
            guard: TeardownGuard {
                fired: AtomicBool::new(false),
                token,
                snapshot: snapshot_tx,
            },
            id,
            channel,
            topics,
            snapshot_rx,
            commands,
            task,
        })
    }

    /// Current connection state.
    #[must_use]
    pub fn status(&self) -> ConnectionState {
        self.snapshot_rx.borrow().state
    }

    /// Current state together with the retry and heartbeat counters.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        *self.snapshot_rx.borrow()
    }

    /// A watch receiver over [`Snapshot`]s, for consumers that already select on channels.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_rx.clone()
    }

    /// Stream of connection state changes, starting with the current state.
    ///
    /// Consecutive duplicates are skipped. The stream ends after teardown.
    pub fn status_stream(&self) -> impl Stream<Item = ConnectionState> + Send + use<C> {
        let mut rx = self.snapshot_rx.clone();

        async_stream::stream! {
            let mut last = None;
            loop {
                let snapshot = *rx.borrow_and_update();
                if last != Some(snapshot.state) {
                    last = Some(snapshot.state);
                    yield snapshot.state;
                }
                if snapshot.torn_down || rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Reset the retry budget and refresh now.
    ///
    /// Takes effect while disconnected, including after retries ran out, or
    /// while waiting on a backoff timer. Returns `false` once torn down.
    pub fn retry(&self) -> bool {
        !self.is_torn_down() && self.commands.send(Command::Retry).is_ok()
    }

    /// Stop all activity and release the channel. Returns `false` if already torn down.
    ///
    /// Timers and in-flight attempts are cancelled and no further event
    /// handler is started once this returns. A handler already running on
    /// another thread finishes. The channel is detached and closed shortly
    /// after on the supervisor task; [`shutdown`](Self::shutdown) waits for that.
    pub fn teardown(&self) -> bool {
        self.guard.fire()
    }

    /// Tear down and wait until the channel has been released.
    pub async fn shutdown(self) {
        let Self { guard, task, .. } = self;
        guard.fire();

        if let Err(e) = task.await {
            #[cfg(feature = "tracing")]
            tracing::error!("Supervisor task failed: {e}");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.guard.fired.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    #[must_use]
    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    /// Identifier attached to this manager's log events.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Fires teardown when dropped.
///
/// Marks the published snapshot final before cancelling the supervisor, so
/// nothing the supervisor is still finishing can overwrite it.
#[derive(Debug)]
struct TeardownGuard {
    fired: AtomicBool,
    token: CancellationToken,
    snapshot: Arc<watch::Sender<Snapshot>>,
}

impl TeardownGuard {
    fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Tearing down connection manager");
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = ConnectionState::Disconnected;
            snapshot.heartbeat_failures = 0;
            snapshot.torn_down = true;
        });
        self.token.cancel();
        true
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.fire();
    }
}

#[derive(Debug)]
enum Command {
    Retry,
}

/// One input to the supervisor.
enum Wake {
    Shutdown,
    Signal(ChannelEvent),
    ChannelGone,
    Retry,
    Refreshed(u64, Result<Generation>),
    Probed(Generation, Probe),
    BackoffElapsed,
    Tick,
}

/// Owns the coordinator and every timer and in-flight operation.
///
/// Pending operations live in the slots below and are dropped, not merely
/// ignored, when the supervisor exits.
struct Supervisor<C: Channel> {
    channel: Arc<C>,
    topics: TopicSet,
    coordinator: Coordinator,
    listeners: Listeners,
    snapshot: Arc<watch::Sender<Snapshot>>,
    commands: mpsc::UnboundedReceiver<Command>,
    token: CancellationToken,
    ticker: Interval,
    request_timeout: Duration,
    heartbeat_timeout: Duration,
    refresh: Option<BoxFuture<'static, (u64, Result<Generation>)>>,
    ping: Option<BoxFuture<'static, (Generation, Probe)>>,
    backoff: Option<Pin<Box<Sleep>>>,
}

impl<C: Channel> Supervisor<C> {
    async fn run(mut self) {
        let action = self.coordinator.start();
        self.apply(action);

        loop {
            // Cancellation is checked first so that nothing queued behind it runs after teardown
            let wake = tokio::select! {
                biased;

                () = self.token.cancelled() => Wake::Shutdown,
                signal = self.listeners.next_signal(), if self.listeners.is_attached() => {
                    match signal {
                        Some(signal) => Wake::Signal(signal),
                        None if self.token.is_cancelled() => Wake::Shutdown,
                        None => Wake::ChannelGone,
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Retry) => Wake::Retry,
                    None => Wake::Shutdown,
                },
                (attempt, outcome) = poll_slot(&mut self.refresh) => Wake::Refreshed(attempt, outcome),
                (generation, probe) = poll_slot(&mut self.ping) => Wake::Probed(generation, probe),
                () = poll_slot(&mut self.backoff) => Wake::BackoffElapsed,
                _ = self.ticker.tick() => Wake::Tick,
            };

            let action = match wake {
                Wake::Shutdown => break,
                Wake::Signal(signal) => self.on_signal(signal),
                Wake::ChannelGone => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Channel event stream closed");
                    self.listeners.detach();
                    Action::None
                }
                Wake::Retry => {
                    #[cfg(feature = "tracing")]
                    tracing::info!("Retry requested");
                    self.coordinator.retry()
                }
                Wake::Refreshed(attempt, outcome) => {
                    self.coordinator.refresh_finished(attempt, outcome)
                }
                Wake::Probed(generation, probe) => {
                    self.coordinator.heartbeat_finished(generation, &probe)
                }
                Wake::BackoffElapsed => self.coordinator.backoff_elapsed(),
                Wake::Tick => self.coordinator.heartbeat_tick(),
            };
            self.apply(action);
        }

        self.release().await;
    }

    fn on_signal(&mut self, signal: ChannelEvent) -> Action {
        match signal {
            ChannelEvent::Disconnected { generation } => self.coordinator.channel_lost(generation),
            ChannelEvent::ConnectError { generation, reason } => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%generation, %reason, "Channel reported an error");
                #[cfg(not(feature = "tracing"))]
                let _ = &reason;
                self.coordinator.channel_lost(generation)
            }
            other => {
                #[cfg(feature = "tracing")]
                tracing::trace!(?other, "Ignoring channel signal");
                #[cfg(not(feature = "tracing"))]
                let _ = &other;
                Action::None
            }
        }
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::None => {}
            Action::Wait(delay) => self.backoff = Some(Box::pin(sleep(delay))),
            Action::Refresh(attempt) => {
                self.backoff = None;
                let channel = Arc::clone(&self.channel);
                let topics = self.topics.to_vec();
                let limit = self.request_timeout;
                self.refresh = Some(
                    async move {
                        let outcome = refresh_connection(channel.as_ref(), &topics, limit).await;
                        (attempt, outcome)
                    }
                    .boxed(),
                );
            }
            Action::Ping(generation) => {
                let channel = Arc::clone(&self.channel);
                let topics = self.topics.clone();
                let deadline = self.heartbeat_timeout;
                self.ping = Some(
                    async move { (generation, probe(channel.as_ref(), &topics, deadline).await) }
                        .boxed(),
                );
            }
        }

        if !self.coordinator.is_connected() {
            self.ping = None;
        }
        self.publish();
    }

    /// Publish the coordinator's snapshot unless teardown already made the published one final.
    fn publish(&self) {
        let next = self.coordinator.snapshot();
        let mut became_connected = false;

        let changed = self.snapshot.send_if_modified(|current| {
            if current.torn_down || *current == next {
                return false;
            }
            became_connected = next.state.is_connected() && !current.state.is_connected();
            *current = next;
            true
        });

        if changed {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                state = %next.state,
                retry_count = next.retry_count,
                heartbeat_failures = next.heartbeat_failures,
                exhausted = next.exhausted,
                "Connection state updated"
            );
        }
        if became_connected {
            self.listeners.connected();
        }
    }

    async fn release(mut self) {
        self.coordinator.close();
        self.refresh = None;
        self.ping = None;
        self.backoff = None;
        self.listeners.detach();

        if let Err(e) = self.channel.disconnect().await {
            #[cfg(feature = "tracing")]
            tracing::warn!("Unable to close channel during teardown: {e}");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Connection manager released");
    }
}

/// Await the future in `slot`, clearing the slot when it completes. Pends forever on an empty slot.
async fn poll_slot<F: Future + Unpin>(slot: &mut Option<F>) -> F::Output {
    match slot.as_mut() {
        Some(pending) => {
            let output = pending.await;
            *slot = None;
            output
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_slot_never_completes() {
        let mut slot: Option<Pin<Box<Sleep>>> = None;

        let raced = tokio::time::timeout(Duration::from_millis(5), poll_slot(&mut slot)).await;
        assert!(raced.is_err(), "empty slot must pend");
    }

    #[tokio::test(start_paused = true)]
    async fn filled_slot_completes_and_clears() {
        let mut slot = Some(Box::pin(sleep(Duration::from_millis(10))));

        poll_slot(&mut slot).await;
        assert!(slot.is_none(), "slot must be cleared after completion");
    }

    #[test]
    fn guard_fires_once() {
        let (tx, rx) = watch::channel(Snapshot::initial(ConnectionState::Connecting));
        let guard = TeardownGuard {
            fired: AtomicBool::new(false),
            token: CancellationToken::new(),
            snapshot: Arc::new(tx),
        };

        assert!(guard.fire(), "first fire tears down");
        assert!(!guard.fire(), "second fire is a no-op");
        assert!(guard.token.is_cancelled(), "token must be cancelled");

        let snapshot = *rx.borrow();
        assert!(snapshot.torn_down, "snapshot must be final");
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
    }
}
