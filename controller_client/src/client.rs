use crate::actor::{Actor, Request};
use crate::config::ClientConfig;
use crate::dispatcher::CommandRequest;
use crate::error::CommandError;
use crate::fanout::{Fanout, Notification, Subscription, SubscriptionFilter};
use crate::state::ConnectionState;
use crate::transport::{Connector, WsConnector};
use controller_protocol::{CommandReply, PluginState, PluginStatusMap, ServerMessage};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Handle to the controller command channel. Clones share one connection.
#[derive(Clone)]
pub struct ControllerClient {
    inner: Arc<Inner>,
}

struct Inner {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    status: watch::Receiver<Arc<PluginStatusMap>>,
    fanout: Arc<Fanout>,
    command_timeout: Duration,
    ids: CorrelationIds,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl ControllerClient {
    /// Starts the connection task on the current tokio runtime. Does not connect yet.
    pub fn spawn(config: ClientConfig) -> Self {
        Self::spawn_with_connector(config, WsConnector)
    }

    pub fn spawn_with_connector(config: ClientConfig, connector: impl Connector) -> Self {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (status_tx, status) = watch::channel(Arc::new(PluginStatusMap::new()));
        let fanout = Fanout::new();
        let command_timeout = config.command_timeout;

        let actor = Actor::new(
            config,
            Arc::new(connector),
            state_tx,
            status_tx,
            Arc::clone(&fanout),
        );
        let handle = tokio::spawn(actor.run(requests_rx));

        Self {
            inner: Arc::new(Inner {
                requests,
                state,
                status,
                fanout,
                command_timeout,
                ids: CorrelationIds::new(),
                actor: Mutex::new(Some(handle)),
            }),
        }
    }

    /// Starts connecting unless a connection is already up or being attempted.
    pub fn connect(&self) -> Result<(), CommandError> {
        self.request(Request::Connect)
    }

    pub fn disconnect(&self) -> Result<(), CommandError> {
        self.request(Request::Disconnect)
    }

    fn request(&self, req: Request) -> Result<(), CommandError> {
        self.inner
            .requests
            .send(req)
            .map_err(|_| CommandError::Closed)
    }

    pub async fn send_command(
        &self,
        plugin_id: impl Into<String>,
        action: impl Into<String>,
        params: Option<Value>,
    ) -> Result<Value, CommandError> {
        self.send_command_with_timeout(plugin_id, action, params, self.inner.command_timeout)
            .await
    }

    /// Resolves exactly once. Dropping the future cancels the command.
    pub async fn send_command_with_timeout(
        &self,
        plugin_id: impl Into<String>,
        action: impl Into<String>,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, CommandError> {
        let correlation_id = self.inner.ids.next();
        let (reply, rx) = oneshot::channel();
        self.request(Request::Command(CommandRequest {
            correlation_id: correlation_id.clone(),
            plugin_id: plugin_id.into(),
            action: action.into(),
            params,
            reply,
        }))?;

        let mut guard = CancelOnDrop {
            requests: &self.inner.requests,
            correlation_id: Some(correlation_id),
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                guard.disarm();
                result
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(CommandError::Closed)
            }
            Err(_) => Err(CommandError::Timeout(timeout)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    /// Waits until the connection reaches `target`. Fails once the client is shut down.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), CommandError> {
        let mut rx = self.inner.state.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| CommandError::Closed)
    }

    /// Latest status snapshot. Never a partial update.
    pub fn plugin_status(&self) -> Arc<PluginStatusMap> {
        self.inner.status.borrow().clone()
    }

    pub fn plugin_state(&self, plugin_id: &str) -> Option<PluginState> {
        self.inner.status.borrow().get(plugin_id).copied()
    }

    pub fn subscribe<F>(&self, filter: SubscriptionFilter, callback: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner.fanout.subscribe(filter, Arc::new(callback))
    }

    /// Subscription that forwards into a channel, for async consumers.
    pub fn subscribe_channel(
        &self,
        filter: SubscriptionFilter,
    ) -> (Subscription, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.subscribe(filter, move |n| {
            let _ = tx.send(n.clone());
        });
        (sub, rx)
    }

    pub fn last_message(&self) -> Option<Arc<ServerMessage>> {
        self.inner.fanout.last_message()
    }

    pub fn last_response(&self, plugin_id: &str) -> Option<CommandReply> {
        self.inner.fanout.last_response(plugin_id)
    }

    /// Stops the connection task for every clone and waits for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.inner.requests.send(Request::Shutdown);
        let handle = self
            .inner
            .actor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for ControllerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerClient")
            .field("state", &self.state())
            .finish()
    }
}

struct CancelOnDrop<'a> {
    requests: &'a mpsc::UnboundedSender<Request>,
    correlation_id: Option<String>,
}

impl CancelOnDrop<'_> {
    fn disarm(&mut self) {
        self.correlation_id = None;
    }
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(correlation_id) = self.correlation_id.take() {
            let _ = self.requests.send(Request::Cancel { correlation_id });
        }
    }
}

/// `<random prefix>-<counter>`: unique per client, and unlikely to collide across
/// clients talking to the same controller.
struct CorrelationIds {
    prefix: String,
    next: AtomicU64,
}

impl CorrelationIds {
    fn new() -> Self {
        Self {
            prefix: format!("{:08x}", rand::random::<u32>()),
            next: AtomicU64::new(1),
        }
    }

    fn next(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}
