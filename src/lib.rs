#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod backoff;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub(crate) mod heartbeat;
pub mod manager;
pub mod registry;
pub(crate) mod serde_helpers;
pub mod topics;

use crate::error::Error;

pub use crate::channel::Channel;
pub use crate::config::Config;
pub use crate::coordinator::{ConnectionState, Snapshot};
pub use crate::manager::ConnectionManager;
pub use crate::registry::EventRegistry;
pub use crate::topics::TopicSet;

pub type Result<T> = std::result::Result<T, Error>;
