use crate::backoff::Backoff;
use crate::config::{ClientConfig, OfflinePolicy};
use crate::dispatcher::{CommandRequest, Dispatcher};
use crate::error::{CommandError, TransportError};
use crate::fanout::{Fanout, Notification};
use crate::router;
use crate::state::{ConnectionState, Transition};
use crate::transport::{Connector, Link};
use controller_protocol::{decode_server_message, encode_client_message, PluginStatusMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub(crate) enum Request {
    Connect,
    Disconnect,
    Command(CommandRequest),
    Cancel { correlation_id: String },
    Shutdown,
}

struct LinkAttempt {
    generation: u64,
    result: Result<Box<dyn Link>, TransportError>,
}

/// Owns the link, the connection state machine and the pending table. Everything
/// here runs on one task, so none of it needs a lock.
pub(crate) struct Actor {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    status_tx: watch::Sender<Arc<PluginStatusMap>>,
    fanout: Arc<Fanout>,
    dispatcher: Dispatcher,
    backoff: Backoff,
    link: Option<Box<dyn Link>>,
    /// Whether a caller currently wants a connection.
    desired: bool,
    generation: u64,
    retry_at: Option<Instant>,
    attempts_tx: mpsc::UnboundedSender<LinkAttempt>,
    attempts_rx: mpsc::UnboundedReceiver<LinkAttempt>,
}

impl Actor {
    pub(crate) fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        state_tx: watch::Sender<ConnectionState>,
        status_tx: watch::Sender<Arc<PluginStatusMap>>,
        fanout: Arc<Fanout>,
    ) -> Self {
        let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
        Self {
            dispatcher: Dispatcher::new(config.correlation, config.stale_reply_window),
            backoff: Backoff::new(config.reconnect),
            config,
            connector,
            state: ConnectionState::Disconnected,
            state_tx,
            status_tx,
            fanout,
            link: None,
            desired: false,
            generation: 0,
            retry_at: None,
            attempts_tx,
            attempts_rx,
        }
    }

    pub(crate) async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        loop {
            let housekeeping = self.dispatcher.next_deadline();
            tokio::select! {
                req = requests.recv() => match req {
                    Some(Request::Shutdown) | None => break,
                    Some(req) => self.handle(req).await,
                },
                Some(attempt) = self.attempts_rx.recv() => self.on_attempt(attempt).await,
                frame = next_frame(&mut self.link) => match frame {
                    Some(Ok(text)) => self.on_text(&text),
                    Some(Err(err)) => {
                        warn!(%err, "controller link failed");
                        self.on_link_lost();
                    }
                    None => {
                        info!("controller closed the connection");
                        self.on_link_lost();
                    }
                },
                _ = wait_until(self.retry_at) => {
                    self.retry_at = None;
                    if self.apply(Transition::RetryDue) {
                        self.begin_attempt();
                    }
                }
                _ = wait_until(housekeeping) => self.dispatcher.expire(Instant::now()),
            }
            self.flush().await;
        }
        self.teardown().await;
    }

    async fn handle(&mut self, req: Request) {
        match req {
            Request::Connect => self.connect(),
            Request::Disconnect => self.disconnect().await,
            Request::Command(cmd) => self.submit(cmd),
            Request::Cancel { correlation_id } => {
                self.dispatcher.cancel(&correlation_id, Instant::now())
            }
            Request::Shutdown => {}
        }
    }

    /// Moves the state machine. Leaving `connected` fails every accepted command
    /// before anyone hears about the new state.
    fn apply(&mut self, event: Transition) -> bool {
        let Some(next) = self.state.next(event) else {
            debug!(state = %self.state, ?event, "ignoring transition");
            return false;
        };
        let prev = std::mem::replace(&mut self.state, next);
        info!(from = %prev, to = %next, ?event, "controller connection state changed");

        if prev == ConnectionState::Connected {
            let failed = self.dispatcher.fail_in_flight();
            if failed > 0 {
                warn!(failed, "failing commands that lost their connection");
            }
        }
        if next == ConnectionState::Failed || (next == ConnectionState::Disconnected && !self.desired)
        {
            self.dispatcher.fail_offline();
        }

        self.state_tx.send_replace(next);
        self.fanout.deliver(Notification::Connection(next));
        true
    }

    fn connect(&mut self) {
        self.desired = true;
        if self.apply(Transition::Connect) {
            self.backoff.reset();
            self.retry_at = None;
            self.begin_attempt();
        }
    }

    fn begin_attempt(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let endpoint = self.config.endpoint.clone();
        let timeout = self.config.connect_timeout;
        let attempts = self.attempts_tx.clone();
        debug!(generation, %endpoint, "connect attempt");

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.connect(&endpoint)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::ConnectTimeout(timeout)),
            };
            let _ = attempts.send(LinkAttempt { generation, result });
        });
    }

    async fn on_attempt(&mut self, attempt: LinkAttempt) {
        if attempt.generation != self.generation || self.state != ConnectionState::Connecting {
            debug!(generation = attempt.generation, "discarding stale connect attempt");
            if let Ok(mut link) = attempt.result {
                link.close().await;
            }
            return;
        }

        match attempt.result {
            Ok(link) => {
                self.link = Some(link);
                self.backoff.reset();
                self.apply(Transition::Opened);
                self.dispatcher.release_offline(Instant::now());
            }
            Err(err) => {
                warn!(%err, endpoint = %self.config.endpoint, "connect attempt failed");
                self.apply(Transition::AttemptFailed);
                self.retry_or_fail();
            }
        }
    }

    fn retry_or_fail(&mut self) {
        if !self.desired {
            return;
        }
        match self.backoff.next_delay() {
            Some(delay) => {
                info!(
                    delay_ms = delay.as_millis() as u64,
                    attempt = self.backoff.attempts(),
                    "reconnecting to controller"
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            None => {
                warn!(
                    attempts = self.backoff.attempts(),
                    "giving up on the controller, reconnect budget spent"
                );
                self.desired = false;
                self.apply(Transition::RetriesExhausted);
            }
        }
    }

    fn on_link_lost(&mut self) {
        self.link = None;
        if self.apply(Transition::Closed) {
            self.retry_or_fail();
        }
    }

    async fn disconnect(&mut self) {
        self.desired = false;
        self.retry_at = None;
        self.generation += 1;
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        if !self.apply(Transition::Disconnect) {
            self.dispatcher.fail_offline();
        }
    }

    fn submit(&mut self, req: CommandRequest) {
        if self.config.short_circuit_unavailable {
            let known = self.status_tx.borrow().get(&req.plugin_id).copied();
            if let Some(state) = known.filter(|s| !s.is_available()) {
                debug!(plugin_id = %req.plugin_id, %state, "short-circuiting command");
                let plugin_id = req.plugin_id.clone();
                req.reject(CommandError::PluginUnavailable { plugin_id, state });
                return;
            }
        }

        if self.state.is_connected() {
            self.dispatcher.submit(req, Instant::now());
            return;
        }
        match self.config.offline {
            OfflinePolicy::Queue { max_depth } if self.desired => {
                if let Err(req) = self.dispatcher.queue_offline(req, max_depth) {
                    warn!(max_depth, "offline queue full, rejecting command");
                    req.reject(CommandError::NotConnected);
                }
            }
            _ => req.reject(CommandError::NotConnected),
        }
    }

    fn on_text(&mut self, text: &str) {
        match decode_server_message(text) {
            Ok(msg) => router::route(
                msg,
                &mut self.dispatcher,
                &self.fanout,
                &self.status_tx,
                Instant::now(),
            ),
            Err(err) => warn!(%err, len = text.len(), "skipping undecodable controller frame"),
        }
    }

    /// Writes every envelope the dispatcher registered since the last pass.
    async fn flush(&mut self) {
        for msg in self.dispatcher.take_outbox() {
            let text = match encode_client_message(&msg) {
                Ok(text) => text,
                Err(err) => {
                    self.dispatcher
                        .reject(msg.correlation_id(), err.into(), Instant::now());
                    continue;
                }
            };
            let Some(link) = self.link.as_mut() else {
                self.dispatcher.reject(
                    msg.correlation_id(),
                    CommandError::ConnectionLost,
                    Instant::now(),
                );
                continue;
            };
            if let Err(err) = link.send(text).await {
                warn!(%err, "write to controller failed");
                self.on_link_lost();
                return;
            }
        }
    }

    async fn teardown(&mut self) {
        info!("controller client shutting down");
        self.desired = false;
        self.retry_at = None;
        self.generation += 1;
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.apply(Transition::Disconnect);
        self.dispatcher.fail_in_flight();
        self.dispatcher.fail_offline();
    }
}

async fn next_frame(link: &mut Option<Box<dyn Link>>) -> Option<Result<String, TransportError>> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
