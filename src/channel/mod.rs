//! The duplex channel seam.
//!
//! A [`Channel`] is the transport the manager keeps alive: it opens and
//! closes a connection, answers join and ping requests, and broadcasts
//! lifecycle signals and named application events to any number of
//! subscribers. The manager owns exactly one channel; tests substitute an
//! in-memory implementation.
//!
//! # Contract
//!
//! - Every successful [`Channel::connect`] starts a new [`Generation`].
//! - Lifecycle signals carry the generation they refer to. Signals caused by a
//!   `connect` or `disconnect` call are broadcast before that call returns.
//! - `disconnect` on a closed channel is a no-op.
//! - The broadcast stream survives reconnects: a receiver obtained once keeps
//!   receiving events across any number of `connect`/`disconnect` cycles.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::Result;
use crate::serde_helpers::decode_payload;

pub mod error;
#[cfg(feature = "ws")]
pub mod websocket;

#[expect(
    clippy::module_name_repetitions,
    reason = "ChannelError includes module name for clarity when used outside this module"
)]
pub use error::ChannelError;
#[cfg(feature = "ws")]
pub use websocket::WebSocketChannel;

/// Identifies one physical connection of a [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(u64);

impl Generation {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Signals and messages broadcast by a [`Channel`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The transport finished opening
    Connected { generation: Generation },
    /// The transport closed, by either side
    Disconnected { generation: Generation },
    /// The transport failed while opening or while open
    ConnectError {
        generation: Generation,
        reason: String,
    },
    /// A named application event pushed by the server
    Message { event: String, payload: Value },
}

impl ChannelEvent {
    /// The generation a lifecycle signal refers to; `None` for messages.
    #[must_use]
    pub fn generation(&self) -> Option<Generation> {
        match self {
            Self::Connected { generation }
            | Self::Disconnected { generation }
            | Self::ConnectError { generation, .. } => Some(*generation),
            Self::Message { .. } => None,
        }
    }
}

/// Reply to a join request. A payload without `ok` is a protocol violation.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JoinAck {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl JoinAck {
    /// Decode an acknowledgement payload received from the peer.
    pub fn from_payload(payload: Value) -> Result<Self> {
        decode_payload(payload)
    }

    #[must_use]
    pub fn accepted() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    #[must_use]
    pub fn rejected<S: Into<String>>(reason: S) -> Self {
        Self {
            ok: false,
            error: Some(reason.into()),
        }
    }
}

/// Reply to a ping: the rooms the server currently has this client in.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PingReply {
    pub topics: Vec<String>,
}

impl PingReply {
    /// Decode a ping reply payload received from the peer.
    pub fn from_payload(payload: Value) -> Result<Self> {
        decode_payload(payload)
    }

    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }
}

/// Duplex, event-based transport used by the manager.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Open the transport, replacing any previous connection.
    async fn connect(&self) -> Result<Generation>;

    /// Close the transport.
    async fn disconnect(&self) -> Result<()>;

    /// Ask the server to put this client in exactly `topics`.
    ///
    /// Implementations may wait indefinitely; callers bound the wait.
    async fn join_topics(&self, topics: &[String]) -> Result<JoinAck>;

    /// Ask the server which rooms this client currently belongs to.
    ///
    /// Implementations may wait indefinitely; callers bound the wait.
    async fn ping_topics(&self) -> Result<PingReply>;

    /// Whether the transport currently reports itself open.
    fn is_connected(&self) -> bool;

    /// Receive lifecycle signals and application events.
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
}
