//! Named event handlers that outlive reconnections.
//!
//! Handlers are collected in an [`EventRegistry`] before the manager exists
//! and attached exactly once when it is created. The attachment is a single
//! subscription to the channel's broadcast stream, which keeps flowing across
//! reconnects, so no handler is ever registered twice and events arriving
//! between two connections are not dropped by re-registration. Detachment
//! happens once, at teardown or when the attachment is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::channel::ChannelEvent;
use crate::error::Error;

/// Handler for a named application event.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callback invoked each time the manager reaches `Connected`.
pub type ConnectHook = Arc<dyn Fn() + Send + Sync>;

/// Event name to handler bindings, at most one handler per name.
///
/// # Example
///
/// ```
/// use roomlink::registry::EventRegistry;
///
/// # fn main() -> roomlink::Result<()> {
/// let registry = EventRegistry::new()
///     .on("matchLoaded", |payload| println!("loaded {payload}"))?
///     .on("matchStarted", |payload| println!("started {payload}"))?
///     .on_connect(|| println!("live"));
///
/// assert_eq!(registry.len(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct EventRegistry {
    handlers: HashMap<String, Handler>,
    on_connect: Option<ConnectHook>,
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `event`, consuming and returning the registry.
    pub fn on<F>(mut self, event: &str, handler: F) -> Result<Self>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(event, handler)?;
        Ok(self)
    }

    /// Bind `handler` to `event`. Fails if `event` already has a handler.
    pub fn register<F>(&mut self, event: &str, handler: F) -> Result<()>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if event.is_empty() {
            return Err(Error::validation("event name cannot be empty"));
        }
        if self.handlers.contains_key(event) {
            return Err(Error::validation(format!(
                "a handler for {event:?} is already registered"
            )));
        }
        self.handlers.insert(event.to_owned(), Arc::new(handler));
        Ok(())
    }

    /// Remove the handler bound to `event`, returning whether one existed.
    pub fn unregister(&mut self, event: &str) -> bool {
        self.handlers.remove(event).is_some()
    }

    /// Set the callback run whenever the connection becomes live.
    #[must_use]
    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn contains(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Subscribe the handlers to a channel's event stream.
    ///
    /// No handler is started once `token` is cancelled.
    pub(crate) fn attach(
        self,
        events: broadcast::Receiver<ChannelEvent>,
        token: CancellationToken,
    ) -> Listeners {
        Listeners {
            handlers: self.handlers,
            on_connect: self.on_connect,
            events: Some(events),
            token,
        }
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut events: Vec<&String> = self.handlers.keys().collect();
        events.sort();
        f.debug_struct("EventRegistry")
            .field("events", &events)
            .field("on_connect", &self.on_connect.is_some())
            .finish()
    }
}

/// Handlers attached to a live channel subscription.
///
/// Application messages are dispatched to their handlers as they are read;
/// lifecycle signals are handed back to the caller.
pub(crate) struct Listeners {
    handlers: HashMap<String, Handler>,
    on_connect: Option<ConnectHook>,
    events: Option<broadcast::Receiver<ChannelEvent>>,
    token: CancellationToken,
}

impl Listeners {
    /// Dispatch messages until a lifecycle signal arrives.
    ///
    /// Returns `None` once detached, cancelled, or when the channel is gone.
    /// A handler that is already running when the token is cancelled finishes.
    pub(crate) async fn next_signal(&mut self) -> Option<ChannelEvent> {
        let events = self.events.as_mut()?;

        loop {
            match events.recv().await {
                Ok(ChannelEvent::Message { event, payload }) => {
                    if self.token.is_cancelled() {
                        return None;
                    }
                    if let Some(handler) = self.handlers.get(&event) {
                        handler(&payload);
                    } else {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(%event, "No handler registered for event");
                    }
                }
                Ok(signal) => return Some(signal),
                Err(RecvError::Lagged(count)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Event listeners lagged, missed {count} events");
                    #[cfg(not(feature = "tracing"))]
                    let _ = count;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub(crate) fn connected(&self) {
        if let Some(hook) = &self.on_connect {
            hook();
        }
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.events.is_some()
    }

    /// Drop the subscription. Returns `false` if it was already detached.
    pub(crate) fn detach(&mut self) -> bool {
        if self.events.take().is_none() {
            return false;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(handlers = self.handlers.len(), "Detaching event listeners");
        self.handlers.clear();
        self.on_connect = None;
        true
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        self.detach();
    }
}
