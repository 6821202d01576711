#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

use crate::error::{Error, Kind};

/// Channel error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum ChannelError {
    /// Error connecting to or communicating with the WebSocket server
    #[cfg(feature = "ws")]
    Connection(tokio_tungstenite::tungstenite::Error),
    /// The transport could not be opened
    ConnectFailed(String),
    /// An operation needs an open connection and there is none
    NotConnected,
    /// The connection closed while a request was outstanding
    ConnectionClosed,
    /// The server answered a join request negatively
    JoinRejected(String),
}

impl ChannelError {
    fn kind(&self) -> Kind {
        match self {
            Self::JoinRejected(_) => Kind::Protocol,
            _ => Kind::Transport,
        }
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "ws")]
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::ConnectFailed(reason) => write!(f, "Unable to open channel: {reason}"),
            Self::NotConnected => write!(f, "Channel is not connected"),
            Self::ConnectionClosed => write!(f, "Channel closed"),
            Self::JoinRejected(reason) => write!(f, "Join rejected: {reason}"),
        }
    }
}

impl StdError for ChannelError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            #[cfg(feature = "ws")]
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<ChannelError> for Error {
    fn from(e: ChannelError) -> Self {
        Error::with_source(e.kind(), e)
    }
}

#[cfg(feature = "ws")]
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::with_source(Kind::Transport, ChannelError::Connection(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_is_protocol_error() {
        let error: Error = ChannelError::JoinRejected("unknown room".to_owned()).into();

        assert_eq!(error.kind(), Kind::Protocol);
        assert_eq!(error.to_string(), "Protocol: Join rejected: unknown room");
        assert!(matches!(
            error.downcast_ref::<ChannelError>(),
            Some(ChannelError::JoinRejected(_))
        ));
    }

    #[test]
    fn closed_is_transport_error() {
        let error: Error = ChannelError::ConnectionClosed.into();

        assert_eq!(error.kind(), Kind::Transport);
    }
}
