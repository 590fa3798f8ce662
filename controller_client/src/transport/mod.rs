//! The only code that touches a socket.

use crate::error::TransportError;
use async_trait::async_trait;
use url::Url;

#[cfg(test)]
pub(crate) mod memory;
mod ws;

pub use ws::WsConnector;

/// Opens links to the controller. One call per connect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Url) -> Result<Box<dyn Link>, TransportError>;
}

/// An open, message-oriented channel carrying JSON text frames.
#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text frame. `None` once the peer has closed. Must be cancel-safe.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}
