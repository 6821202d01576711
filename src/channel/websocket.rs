//! WebSocket implementation of [`Channel`].
//!
//! **Feature flag:** `ws`
//!
//! Frames are JSON text messages:
//!
//! - request: `{"id": 7, "event": "joinTopics", "data": {"topics": ["field"]}}`
//! - acknowledgement: `{"ack": 7, "data": {"ok": true}}`
//! - server event: `{"event": "matchLoaded", "data": {...}}`
//!
//! Fire-and-forget emits omit `id` and are never acknowledged.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt as _, StreamExt as _};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Channel, ChannelError, ChannelEvent, Generation, JoinAck, PingReply};
use crate::Result;
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broadcast channel capacity for incoming events.
const BROADCAST_CAPACITY: usize = 1024;

const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the close handshake during a requested disconnect.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) const JOIN_EVENT: &str = "joinTopics";
pub(crate) const PING_EVENT: &str = "pingTopics";

#[derive(Serialize)]
struct OutboundFrame<'frame> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    event: &'frame str,
    data: &'frame Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InboundFrame {
    Ack {
        ack: u64,
        #[serde(default)]
        data: Value,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

type PendingAcks = Arc<DashMap<u64, oneshot::Sender<Value>>>;

/// One open WebSocket connection.
struct Session {
    generation: Generation,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingAcks,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Session {
    fn is_open(&self) -> bool {
        !self.task.is_finished() && !self.outgoing.is_closed()
    }
}

/// A [`Channel`] over a single WebSocket endpoint.
///
/// # Example
///
/// ```rust, no_run
/// use roomlink::channel::WebSocketChannel;
///
/// # fn example() -> roomlink::Result<()> {
/// let channel = WebSocketChannel::for_namespace("wss://lems.example.org/ws", "division/42")?;
/// assert_eq!(channel.endpoint().path(), "/ws/division/42");
/// # Ok(())
/// # }
/// ```
pub struct WebSocketChannel {
    endpoint: Url,
    ack_timeout: Duration,
    events: broadcast::Sender<ChannelEvent>,
    session: Mutex<Option<Session>>,
    last_generation: AtomicU64,
    next_request_id: AtomicU64,
}

impl WebSocketChannel {
    /// Create a channel for `endpoint`. Nothing is opened until [`Channel::connect`].
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported scheme {:?}, expected ws or wss",
                endpoint.scheme()
            )));
        }
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);

        Ok(Self {
            endpoint,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            events,
            session: Mutex::new(None),
            last_generation: AtomicU64::new(0),
            next_request_id: AtomicU64::new(1),
        })
    }

    /// Create a channel for a namespace below `base`, e.g. `division/42`.
    pub fn for_namespace(base: &str, namespace: &str) -> Result<Self> {
        let mut channel = Self::new(base)?;
        channel
            .endpoint
            .path_segments_mut()
            .map_err(|()| Error::validation(format!("{base} cannot be a base URL")))?
            .pop_if_empty()
            .extend(namespace.split('/').filter(|segment| !segment.is_empty()));
        Ok(channel)
    }

    /// How long [`Self::request`] waits for an acknowledgement.
    #[must_use]
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Send an application event without waiting for an acknowledgement.
    pub fn emit(&self, event: &str, data: &Value) -> Result<()> {
        let text = serde_json::to_string(&OutboundFrame {
            id: None,
            event,
            data,
        })?;
        let outgoing = self.with_session(|session| session.outgoing.clone())?;
        outgoing
            .send(Message::Text(text.into()))
            .map_err(|_e| ChannelError::ConnectionClosed)?;
        Ok(())
    }

    /// Send an application event and wait for its acknowledgement payload.
    pub async fn request(&self, event: &str, data: &Value) -> Result<Value> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let text = serde_json::to_string(&OutboundFrame {
            id: Some(id),
            event,
            data,
        })?;

        let (ack_tx, ack_rx) = oneshot::channel();
        let (outgoing, pending) = self.with_session(|session| {
            (session.outgoing.clone(), Arc::clone(&session.pending))
        })?;
        pending.insert(id, ack_tx);

        if outgoing.send(Message::Text(text.into())).is_err() {
            pending.remove(&id);
            return Err(ChannelError::ConnectionClosed.into());
        }

        match timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(ChannelError::ConnectionClosed.into()),
            Err(elapsed) => {
                pending.remove(&id);
                Err(elapsed.into())
            }
        }
    }

    fn with_session<T, F: FnOnce(&Session) -> T>(&self, f: F) -> Result<T> {
        // A poisoned lock still holds a consistent Option<Session>
        let guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(session) if session.is_open() => Ok(f(session)),
            _ => Err(ChannelError::NotConnected.into()),
        }
    }

    fn take_session(&self) -> Option<Session> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn close_session(&self, session: Session) {
        let Session {
            generation,
            token,
            mut task,
            ..
        } = session;

        token.cancel();
        if timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
            #[cfg(feature = "tracing")]
            tracing::debug!(%generation, "Close handshake timed out, aborting session task");
            task.abort();
        }

        _ = self.events.send(ChannelEvent::Disconnected { generation });
    }

    /// Drive one connection until it closes or is cancelled.
    async fn run_session(
        ws_stream: WsStream,
        generation: Generation,
        mut outgoing_rx: mpsc::UnboundedReceiver<Message>,
        events: broadcast::Sender<ChannelEvent>,
        pending: PendingAcks,
        token: CancellationToken,
    ) {
        let (mut write, mut read) = ws_stream.split();

        // Requested closes are reported by the caller, so they end without a signal
        let ended = loop {
            tokio::select! {
                biased;

                () = token.cancelled() => {
                    _ = write.send(Message::Close(None)).await;
                    break None;
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_text(text.as_str(), &events, &pending);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(%generation, "WebSocket closed by peer");
                            break Some(ChannelEvent::Disconnected { generation });
                        }
                        Some(Err(e)) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(%generation, error = %e, "WebSocket transport error");
                            break Some(ChannelEvent::ConnectError {
                                generation,
                                reason: e.to_string(),
                            });
                        }
                        Some(Ok(_)) => {
                            // Binary frames and control frames are not part of the protocol
                        }
                    }
                }

                Some(message) = outgoing_rx.recv() => {
                    if let Err(e) = write.send(message).await {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(%generation, error = %e, "Unable to write WebSocket frame");
                        break Some(ChannelEvent::ConnectError {
                            generation,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        };

        // The session reads as closed and outstanding requests observe ConnectionClosed
        // before anyone hears about it
        outgoing_rx.close();
        pending.clear();
        if let Some(signal) = ended {
            _ = events.send(signal);
        }
    }

    fn handle_text(
        text: &str,
        events: &broadcast::Sender<ChannelEvent>,
        pending: &PendingAcks,
    ) {
        match serde_json::from_str::<InboundFrame>(text) {
            Ok(InboundFrame::Ack { ack, data }) => {
                if let Some((_, waiter)) = pending.remove(&ack) {
                    _ = waiter.send(data);
                } else {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(ack, "Acknowledgement for unknown or expired request");
                }
            }
            Ok(InboundFrame::Event { event, data }) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(%event, "Received channel event");
                _ = events.send(ChannelEvent::Message {
                    event,
                    payload: data,
                });
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, error = %e, "Failed to parse WebSocket frame");
                #[cfg(not(feature = "tracing"))]
                let _ = (&text, &e);
            }
        }
    }
}

impl fmt::Debug for WebSocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketChannel")
            .field("endpoint", &self.endpoint.as_str())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        if let Some(session) = self.take_session() {
            session.token.cancel();
        }
    }
}

#[async_trait]
impl Channel for WebSocketChannel {
    async fn connect(&self) -> Result<Generation> {
        if let Some(stale) = self.take_session() {
            self.close_session(stale).await;
        }

        let generation =
            Generation::new(self.last_generation.fetch_add(1, Ordering::AcqRel)).next();

        let ws_stream = match connect_async(self.endpoint.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(endpoint = %self.endpoint, %generation, error = %e, "Unable to connect");
                _ = self.events.send(ChannelEvent::ConnectError {
                    generation,
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let pending: PendingAcks = Arc::new(DashMap::new());
        let token = CancellationToken::new();

        let task = tokio::spawn(Self::run_session(
            ws_stream,
            generation,
            outgoing_rx,
            self.events.clone(),
            Arc::clone(&pending),
            token.clone(),
        ));

        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(Session {
            generation,
            outgoing,
            pending,
            token,
            task,
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.endpoint, %generation, "WebSocket connected");
        _ = self.events.send(ChannelEvent::Connected { generation });

        Ok(generation)
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(session) = self.take_session() {
            self.close_session(session).await;
        }
        Ok(())
    }

    async fn join_topics(&self, topics: &[String]) -> Result<JoinAck> {
        let payload = self.request(JOIN_EVENT, &json!({ "topics": topics })).await?;
        JoinAck::from_payload(payload)
    }

    async fn ping_topics(&self) -> Result<PingReply> {
        let payload = self.request(PING_EVENT, &json!({})).await?;
        PingReply::from_payload(payload)
    }

    fn is_connected(&self) -> bool {
        self.with_session(|_| ()).is_ok()
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    #[test]
    fn namespace_is_appended_to_path() {
        let channel = WebSocketChannel::for_namespace("ws://localhost:3333/", "/division/7/").unwrap();
        assert_eq!(channel.endpoint().as_str(), "ws://localhost:3333/division/7");

        let nested = WebSocketChannel::for_namespace("wss://lems.example.org/ws", "division/7").unwrap();
        assert_eq!(nested.endpoint().path(), "/ws/division/7");
    }

    #[test]
    fn rejects_http_scheme() {
        let err = WebSocketChannel::new("https://lems.example.org").err().unwrap();
        assert_eq!(err.kind(), Kind::Validation);
    }

    #[test]
    fn emit_requires_connection() {
        let channel = WebSocketChannel::new("ws://localhost:1").unwrap();

        assert!(!channel.is_connected());
        let err = channel.emit("noop", &Value::Null).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChannelError>(),
            Some(ChannelError::NotConnected)
        ));
    }

    #[test]
    fn frames_round_trip_shapes() {
        let data = json!({ "topics": ["field"] });
        let request = serde_json::to_value(OutboundFrame {
            id: Some(3),
            event: JOIN_EVENT,
            data: &data,
        })
        .unwrap();
        assert_eq!(request, json!({ "id": 3, "event": "joinTopics", "data": { "topics": ["field"] } }));

        let emit = serde_json::to_value(OutboundFrame {
            id: None,
            event: "matchLoaded",
            data: &Value::Null,
        })
        .unwrap();
        assert_eq!(emit, json!({ "event": "matchLoaded", "data": null }));

        let ack: InboundFrame = serde_json::from_str(r#"{"ack": 3, "data": {"ok": true}}"#).unwrap();
        assert!(matches!(ack, InboundFrame::Ack { ack: 3, .. }));

        let frame: InboundFrame = serde_json::from_str(r#"{"event": "teamRegistered"}"#).unwrap();
        assert!(matches!(&frame, InboundFrame::Event { event, data: Value::Null } if event == "teamRegistered"));
    }

    #[tokio::test]
    async fn unknown_ack_is_ignored_and_events_are_broadcast() {
        let (events, mut rx) = broadcast::channel(8);
        let pending: PendingAcks = Arc::new(DashMap::new());
        let (tx, ack_rx) = oneshot::channel();
        pending.insert(1, tx);

        WebSocketChannel::handle_text(r#"{"ack": 9, "data": 1}"#, &events, &pending);
        WebSocketChannel::handle_text(r#"{"ack": 1, "data": {"ok": true}}"#, &events, &pending);
        WebSocketChannel::handle_text(r#"{"event": "matchStarted", "data": {"number": 4}}"#, &events, &pending);
        WebSocketChannel::handle_text("not json", &events, &pending);

        assert_eq!(ack_rx.await.unwrap(), json!({ "ok": true }));
        assert!(pending.is_empty());
        assert_eq!(
            rx.recv().await.unwrap(),
            ChannelEvent::Message {
                event: "matchStarted".to_owned(),
                payload: json!({ "number": 4 }),
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
