#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use roomlink::Result;
use roomlink::channel::{Channel, ChannelError, ChannelEvent, Generation, JoinAck, PingReply};
use serde_json::{Value, json};
use tokio::sync::{broadcast, oneshot};

pub const TOPICS: [&str; 3] = ["field", "pit-admin", "judging"];

/// How the scripted server answers a join request.
#[derive(Debug, Clone)]
pub enum JoinMode {
    Accept,
    /// Acknowledges, then the transport drops before the caller sees the acknowledgement
    AcceptThenDrop,
    Reject(String),
    /// Acknowledgement without the `ok` field
    Malformed,
    /// Never answers
    Hang,
}

/// How the scripted server answers a ping.
#[derive(Debug, Clone)]
pub enum PingMode {
    /// Report exactly the topics last joined
    Echo,
    Reply(Vec<String>),
    Hang,
    Fail,
}

#[derive(Debug)]
struct State {
    generation: Generation,
    connected: bool,
    refuse_connect: bool,
    join: JoinMode,
    ping: PingMode,
    joined: Vec<String>,
}

/// In-memory [`Channel`] with scriptable answers and call counters.
#[derive(Debug)]
pub struct MockChannel {
    events: broadcast::Sender<ChannelEvent>,
    state: Mutex<State>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    joins: AtomicUsize,
    pings: AtomicUsize,
}

impl MockChannel {
    /// A channel that starts closed and accepts every connect and join.
    #[must_use]
    pub fn new() -> Self {
        Self::with_connected(false)
    }

    /// A channel whose transport already reports itself open.
    #[must_use]
    pub fn open() -> Self {
        Self::with_connected(true)
    }

    fn with_connected(connected: bool) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            state: Mutex::new(State {
                generation: Generation::default(),
                connected,
                refuse_connect: false,
                join: JoinMode::Accept,
                ping: PingMode::Echo,
                joined: Vec::new(),
            }),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            joins: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
        }
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_connect = refuse;
    }

    pub fn set_join(&self, mode: JoinMode) {
        self.state.lock().unwrap().join = mode;
    }

    pub fn set_ping(&self, mode: PingMode) {
        self.state.lock().unwrap().ping = mode;
    }

    /// The transport drops on its own, as a server restart would.
    pub fn drop_connection(&self) {
        let generation = self.close();
        drop(self.events.send(ChannelEvent::Disconnected { generation }));
    }

    /// The transport fails while open.
    pub fn fail_connection(&self, reason: &str) {
        let generation = self.close();
        drop(self.events.send(ChannelEvent::ConnectError {
            generation,
            reason: reason.to_owned(),
        }));
    }

    /// Raise a signal for an arbitrary generation, e.g. a stale one.
    pub fn signal(&self, event: ChannelEvent) {
        drop(self.events.send(event));
    }

    /// Push a named application event from the server.
    pub fn push(&self, event: &str, payload: Value) {
        drop(self.events.send(ChannelEvent::Message {
            event: event.to_owned(),
            payload,
        }));
    }

    fn close(&self) -> Generation {
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        state.generation
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.state.lock().unwrap().generation
    }

    #[must_use]
    pub fn joined(&self) -> Vec<String> {
        self.state.lock().unwrap().joined.clone()
    }

    #[must_use]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions to the event stream.
    #[must_use]
    pub fn listeners(&self) -> usize {
        self.events.receiver_count()
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn connect(&self) -> Result<Generation> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (generation, refused) = {
            let mut state = self.state.lock().unwrap();
            state.generation = state.generation.next();
            state.connected = !state.refuse_connect;
            (state.generation, state.refuse_connect)
        };

        if refused {
            drop(self.events.send(ChannelEvent::ConnectError {
                generation,
                reason: "connection refused".to_owned(),
            }));
            return Err(ChannelError::ConnectFailed("connection refused".to_owned()).into());
        }

        drop(self.events.send(ChannelEvent::Connected { generation }));
        Ok(generation)
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);

        let closed = {
            let mut state = self.state.lock().unwrap();
            let was_connected = state.connected;
            state.connected = false;
            was_connected.then_some(state.generation)
        };

        if let Some(generation) = closed {
            drop(self.events.send(ChannelEvent::Disconnected { generation }));
        }
        Ok(())
    }

    async fn join_topics(&self, topics: &[String]) -> Result<JoinAck> {
        self.joins.fetch_add(1, Ordering::SeqCst);

        let mode = self.state.lock().unwrap().join.clone();
        match mode {
            JoinMode::Accept => {
                self.state.lock().unwrap().joined = topics.to_vec();
                Ok(JoinAck::accepted())
            }
            JoinMode::AcceptThenDrop => {
                let generation = {
                    let mut state = self.state.lock().unwrap();
                    state.joined = topics.to_vec();
                    state.connected = false;
                    state.generation
                };
                let (ack_tx, ack_rx) = oneshot::channel();
                let events = self.events.clone();
                tokio::spawn(async move {
                    drop(ack_tx.send(JoinAck::accepted()));
                    drop(events.send(ChannelEvent::Disconnected { generation }));
                });
                Ok(ack_rx.await.unwrap())
            }
            JoinMode::Reject(reason) => Ok(JoinAck::rejected(reason)),
            JoinMode::Malformed => {
                Err(serde_json::from_value::<JoinAck>(json!({})).unwrap_err().into())
            }
            JoinMode::Hang => std::future::pending().await,
        }
    }

    async fn ping_topics(&self) -> Result<PingReply> {
        self.pings.fetch_add(1, Ordering::SeqCst);

        let (mode, joined, connected) = {
            let state = self.state.lock().unwrap();
            (state.ping.clone(), state.joined.clone(), state.connected)
        };
        if !connected {
            return Err(ChannelError::NotConnected.into());
        }

        match mode {
            PingMode::Echo => Ok(PingReply::new(joined)),
            PingMode::Reply(topics) => Ok(PingReply::new(topics)),
            PingMode::Hang => std::future::pending().await,
            PingMode::Fail => Err(ChannelError::ConnectionClosed.into()),
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

/// Let the supervisor process everything that is ready, advancing paused time slightly.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init(),
    );
}
