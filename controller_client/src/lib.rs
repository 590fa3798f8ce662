//! Client side of the controller command channel.
//!
//! [`ControllerClient`] keeps one WebSocket to the controller process, matches
//! replies to commands, tracks plugin status and fans broadcasts out to subscribers.

mod actor;
mod backoff;
mod client;
pub mod config;
mod dispatcher;
mod error;
mod fanout;
mod router;
mod state;
pub mod transport;

pub use client::ControllerClient;
pub use config::{ClientConfig, CorrelationMode, OfflinePolicy, ReconnectPolicy};
pub use controller_protocol as protocol;
pub use error::{CommandError, ConfigError, TransportError};
pub use fanout::{Notification, Subscription, SubscriptionFilter};
pub use state::ConnectionState;
