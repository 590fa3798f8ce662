//! In-process connector for actor tests. Each accepted connection hands a [`Peer`]
//! to the test, which plays the controller.

use super::{Connector, Link};
use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

#[derive(Default)]
struct Behaviour {
    refuse: bool,
    delay: Duration,
    attempts: Vec<Instant>,
}

#[derive(Clone)]
pub(crate) struct MemoryConnector {
    behaviour: Arc<Mutex<Behaviour>>,
    peers: mpsc::UnboundedSender<Peer>,
}

impl MemoryConnector {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Peer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                behaviour: Arc::default(),
                peers,
            },
            rx,
        )
    }

    pub(crate) fn refuse(&self, refuse: bool) {
        self.behaviour.lock().unwrap().refuse = refuse;
    }

    /// How long each connect takes before it resolves.
    pub(crate) fn set_delay(&self, delay: Duration) {
        self.behaviour.lock().unwrap().delay = delay;
    }

    /// When each connect attempt started.
    pub(crate) fn attempts(&self) -> Vec<Instant> {
        self.behaviour.lock().unwrap().attempts.clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _endpoint: &Url) -> Result<Box<dyn Link>, TransportError> {
        let delay = {
            let mut b = self.behaviour.lock().unwrap();
            b.attempts.push(Instant::now());
            b.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.behaviour.lock().unwrap().refuse {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "memory connector refused",
            )));
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let _ = self.peers.send(Peer {
            to_client: Some(to_client),
            from_client,
        });
        Ok(Box::new(MemoryLink { incoming, outgoing }))
    }
}

struct MemoryLink {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outgoing.send(text).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.incoming.close();
    }
}

/// The controller's end of one memory link.
pub(crate) struct Peer {
    to_client: Option<mpsc::UnboundedSender<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl Peer {
    pub(crate) fn push(&self, text: impl Into<String>) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(text.into());
        }
    }

    pub(crate) fn push_json(&self, value: Value) {
        self.push(value.to_string());
    }

    /// Next frame the client sent, parsed. `None` once the client side is gone.
    pub(crate) async fn next_sent(&mut self) -> Option<Value> {
        let text = self.from_client.recv().await?;
        Some(serde_json::from_str(&text).unwrap())
    }

    pub(crate) fn try_next_sent(&mut self) -> Option<Value> {
        let text = self.from_client.try_recv().ok()?;
        Some(serde_json::from_str(&text).unwrap())
    }

    /// Abrupt close from the controller side.
    pub(crate) fn hang_up(&mut self) {
        self.to_client = None;
    }
}
