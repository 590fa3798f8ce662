use controller_protocol::{CodecError, PluginState};
use std::time::Duration;
use thiserror::Error;

/// Why a single command did not produce a result. Delivered only to the caller that issued it.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("not connected to the controller")]
    NotConnected,
    #[error("connection to the controller was lost before a reply arrived")]
    ConnectionLost,
    #[error("no reply from the controller within {0:?}")]
    Timeout(Duration),
    #[error("plugin {plugin_id} is {state}")]
    PluginUnavailable {
        plugin_id: String,
        state: PluginState,
    },
    #[error("controller error: {0}")]
    Remote(String),
    #[error("could not encode command: {0}")]
    Encode(#[from] CodecError),
    #[error("controller client is shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("link closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid controller url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("controller url must use ws:// or wss://, got {0:?}")]
    UnsupportedScheme(String),
}
