use crate::config::CorrelationMode;
use crate::error::CommandError;
use controller_protocol::{ClientMessage, CommandEnvelope};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

pub(crate) type CommandResult = Result<Value, CommandError>;

/// A command on its way from a caller to the actor.
pub(crate) struct CommandRequest {
    pub(crate) correlation_id: String,
    pub(crate) plugin_id: String,
    pub(crate) action: String,
    pub(crate) params: Option<Value>,
    pub(crate) reply: oneshot::Sender<CommandResult>,
}

impl CommandRequest {
    fn key(&self) -> CommandKey {
        CommandKey {
            plugin_id: self.plugin_id.clone(),
            action: self.action.clone(),
        }
    }

    pub(crate) fn reject(self, err: CommandError) {
        let _ = self.reply.send(Err(err));
    }
}

struct PendingCommand {
    plugin_id: String,
    action: String,
    issued_at: Instant,
    reply: oneshot::Sender<CommandResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CommandKey {
    plugin_id: String,
    action: String,
}

enum KeySlot {
    InFlight(String),
    /// Cancelled while in flight; a late uncorrelated reply must not reach the next command.
    Tombstone {
        correlation_id: String,
        until: Instant,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Settled,
    /// Late reply for a cancelled command, swallowed.
    Dropped,
    Unmatched,
}

/// Pending-call table. Every registered command is settled, failed or cancelled exactly once.
pub(crate) struct Dispatcher {
    correlation: CorrelationMode,
    stale_reply_window: Duration,
    pending: HashMap<String, PendingCommand>,
    slots: HashMap<CommandKey, KeySlot>,
    waiting: HashMap<CommandKey, VecDeque<CommandRequest>>,
    offline: VecDeque<CommandRequest>,
    outbox: Vec<ClientMessage>,
}

impl Dispatcher {
    pub(crate) fn new(correlation: CorrelationMode, stale_reply_window: Duration) -> Self {
        Self {
            correlation,
            stale_reply_window,
            pending: HashMap::new(),
            slots: HashMap::new(),
            waiting: HashMap::new(),
            offline: VecDeque::new(),
            outbox: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn waiting_len(&self) -> usize {
        self.waiting.values().map(VecDeque::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn offline_len(&self) -> usize {
        self.offline.len()
    }

    /// Envelopes registered since the last call, in issue order.
    pub(crate) fn take_outbox(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn submit(&mut self, req: CommandRequest, now: Instant) {
        if req.reply.is_closed() {
            return;
        }
        if self.correlation == CorrelationMode::ByName {
            let key = req.key();
            if self.slots.contains_key(&key) {
                debug!(
                    correlation_id = %req.correlation_id,
                    plugin_id = %req.plugin_id,
                    action = %req.action,
                    "holding command until the previous one with the same name settles"
                );
                self.waiting.entry(key).or_default().push_back(req);
                return;
            }
            self.slots
                .insert(key, KeySlot::InFlight(req.correlation_id.clone()));
        }
        self.register(req, now);
    }

    fn register(&mut self, req: CommandRequest, now: Instant) {
        let CommandRequest {
            correlation_id,
            plugin_id,
            action,
            params,
            reply,
        } = req;
        debug_assert!(
            !self.pending.contains_key(&correlation_id),
            "correlation id {correlation_id} issued twice"
        );

        // Registered before the envelope can leave, so a fast reply always finds it.
        self.outbox.push(ClientMessage::Command(CommandEnvelope {
            plugin_id: plugin_id.clone(),
            action: action.clone(),
            params,
            correlation_id: correlation_id.clone(),
        }));
        self.pending.insert(
            correlation_id,
            PendingCommand {
                plugin_id,
                action,
                issued_at: now,
                reply,
            },
        );
    }

    pub(crate) fn settle(
        &mut self,
        correlation_id: &str,
        outcome: Result<Value, String>,
        now: Instant,
    ) -> Settlement {
        if self.finish(correlation_id, outcome.map_err(CommandError::Remote), now) {
            return Settlement::Settled;
        }
        if let Some(key) = self.tombstoned_key(correlation_id) {
            self.release(&key, now);
            return Settlement::Dropped;
        }
        Settlement::Unmatched
    }

    /// Name-based match for replies that carry no correlation id.
    pub(crate) fn settle_by_name(
        &mut self,
        plugin_id: &str,
        action: &str,
        outcome: Result<Value, String>,
        now: Instant,
    ) -> Settlement {
        if self.correlation != CorrelationMode::ByName {
            return Settlement::Unmatched;
        }
        let key = CommandKey {
            plugin_id: plugin_id.to_string(),
            action: action.to_string(),
        };
        match self.slots.get(&key) {
            Some(KeySlot::InFlight(id)) => {
                let id = id.clone();
                self.settle(&id, outcome, now)
            }
            Some(KeySlot::Tombstone { correlation_id, .. }) => {
                debug!(%correlation_id, plugin_id, action, "dropping late reply for a cancelled command");
                self.release(&key, now);
                Settlement::Dropped
            }
            None => Settlement::Unmatched,
        }
    }

    /// Fails one registered command, e.g. when its envelope could not be encoded.
    pub(crate) fn reject(&mut self, correlation_id: &str, err: CommandError, now: Instant) {
        self.finish(correlation_id, Err(err), now);
    }

    fn finish(&mut self, correlation_id: &str, result: CommandResult, now: Instant) -> bool {
        let Some(cmd) = self.pending.remove(correlation_id) else {
            return false;
        };
        debug!(
            correlation_id,
            plugin_id = %cmd.plugin_id,
            action = %cmd.action,
            elapsed_ms = now.saturating_duration_since(cmd.issued_at).as_millis() as u64,
            ok = result.is_ok(),
            "command settled"
        );
        let key = CommandKey {
            plugin_id: cmd.plugin_id,
            action: cmd.action,
        };
        let _ = cmd.reply.send(result);
        if matches!(self.slots.get(&key), Some(KeySlot::InFlight(id)) if id == correlation_id) {
            self.release(&key, now);
        }
        true
    }

    /// Forgets a command whose caller gave up (timeout or dropped future).
    pub(crate) fn cancel(&mut self, correlation_id: &str, now: Instant) {
        if let Some(cmd) = self.pending.remove(correlation_id) {
            debug!(correlation_id, plugin_id = %cmd.plugin_id, action = %cmd.action, "command cancelled");
            let key = CommandKey {
                plugin_id: cmd.plugin_id,
                action: cmd.action,
            };
            if matches!(self.slots.get(&key), Some(KeySlot::InFlight(id)) if id == correlation_id) {
                self.slots.insert(
                    key,
                    KeySlot::Tombstone {
                        correlation_id: correlation_id.to_string(),
                        until: now + self.stale_reply_window,
                    },
                );
            }
            return;
        }

        for queue in self.waiting.values_mut() {
            queue.retain(|req| req.correlation_id != correlation_id);
        }
        self.waiting.retain(|_, queue| !queue.is_empty());
        self.offline
            .retain(|req| req.correlation_id != correlation_id);
    }

    /// Earliest tombstone expiry, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter_map(|slot| match slot {
                KeySlot::Tombstone { until, .. } => Some(*until),
                KeySlot::InFlight(_) => None,
            })
            .min()
    }

    pub(crate) fn expire(&mut self, now: Instant) {
        let due: Vec<CommandKey> = self
            .slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                KeySlot::Tombstone { until, .. } if *until <= now => Some(key.clone()),
                _ => None,
            })
            .collect();
        for key in due {
            self.release(&key, now);
        }
    }

    fn tombstoned_key(&self, correlation_id: &str) -> Option<CommandKey> {
        self.slots.iter().find_map(|(key, slot)| match slot {
            KeySlot::Tombstone {
                correlation_id: id, ..
            } if id == correlation_id => Some(key.clone()),
            _ => None,
        })
    }

    fn release(&mut self, key: &CommandKey, now: Instant) {
        self.slots.remove(key);
        let next = loop {
            let Some(queue) = self.waiting.get_mut(key) else {
                break None;
            };
            match queue.pop_front() {
                Some(req) if req.reply.is_closed() => continue,
                other => break other,
            }
        };
        if self.waiting.get(key).is_some_and(VecDeque::is_empty) {
            self.waiting.remove(key);
        }
        if let Some(req) = next {
            self.submit(req, now);
        }
    }

    /// Fails everything that was accepted for the lost channel. Returns how many were failed.
    pub(crate) fn fail_in_flight(&mut self) -> usize {
        let mut failed = 0;
        for (_, cmd) in self.pending.drain() {
            let _ = cmd.reply.send(Err(CommandError::ConnectionLost));
            failed += 1;
        }
        for (_, queue) in self.waiting.drain() {
            for req in queue {
                req.reject(CommandError::ConnectionLost);
                failed += 1;
            }
        }
        self.slots.clear();
        self.outbox.clear();
        failed
    }

    pub(crate) fn queue_offline(
        &mut self,
        req: CommandRequest,
        max_depth: usize,
    ) -> Result<(), CommandRequest> {
        self.offline.retain(|queued| !queued.reply.is_closed());
        if self.offline.len() >= max_depth {
            return Err(req);
        }
        self.offline.push_back(req);
        Ok(())
    }

    pub(crate) fn release_offline(&mut self, now: Instant) {
        for req in std::mem::take(&mut self.offline) {
            self.submit(req, now);
        }
    }

    pub(crate) fn fail_offline(&mut self) {
        for req in self.offline.drain(..) {
            req.reject(CommandError::NotConnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::oneshot::error::TryRecvError;

    fn request(id: &str, plugin: &str, action: &str) -> (CommandRequest, oneshot::Receiver<CommandResult>) {
        let (tx, rx) = oneshot::channel();
        (
            CommandRequest {
                correlation_id: id.into(),
                plugin_id: plugin.into(),
                action: action.into(),
                params: None,
                reply: tx,
            },
            rx,
        )
    }

    fn sent_ids(d: &mut Dispatcher) -> Vec<String> {
        d.take_outbox()
            .iter()
            .map(|m| m.correlation_id().to_string())
            .collect()
    }

    #[tokio::test]
    async fn settles_by_correlation_id_in_any_order() {
        let mut d = Dispatcher::new(CorrelationMode::Strict, Duration::from_secs(1));
        let now = Instant::now();
        let (a, mut rx_a) = request("1", "p", "a");
        let (b, mut rx_b) = request("2", "p", "a");
        d.submit(a, now);
        d.submit(b, now);
        assert_eq!(sent_ids(&mut d), vec!["1", "2"]);

        assert_eq!(d.settle("2", Ok(json!("second")), now), Settlement::Settled);
        assert_eq!(d.settle("1", Err("nope".into()), now), Settlement::Settled);

        assert_eq!(rx_b.try_recv().unwrap().unwrap(), json!("second"));
        assert!(matches!(rx_a.try_recv().unwrap(), Err(CommandError::Remote(msg)) if msg == "nope"));
        assert_eq!(d.pending_len(), 0);
    }

    #[tokio::test]
    async fn second_settle_for_the_same_id_is_a_miss() {
        let mut d = Dispatcher::new(CorrelationMode::Strict, Duration::from_secs(1));
        let now = Instant::now();
        let (a, _rx) = request("1", "p", "a");
        d.submit(a, now);
        assert_eq!(d.settle("1", Ok(json!(1)), now), Settlement::Settled);
        assert_eq!(d.settle("1", Ok(json!(2)), now), Settlement::Unmatched);
    }

    #[tokio::test]
    async fn strict_mode_ignores_name_matching() {
        let mut d = Dispatcher::new(CorrelationMode::Strict, Duration::from_secs(1));
        let now = Instant::now();
        let (a, mut rx) = request("1", "p", "a");
        d.submit(a, now);
        assert_eq!(d.settle_by_name("p", "a", Ok(json!(1)), now), Settlement::Unmatched);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn by_name_serialises_commands_with_the_same_key() {
        let mut d = Dispatcher::new(CorrelationMode::ByName, Duration::from_secs(1));
        let now = Instant::now();
        let (a, mut rx_a) = request("1", "p", "a");
        let (b, mut rx_b) = request("2", "p", "a");
        let (c, _rx_c) = request("3", "p", "other");
        d.submit(a, now);
        d.submit(b, now);
        d.submit(c, now);
        assert_eq!(sent_ids(&mut d), vec!["1", "3"]);
        assert_eq!(d.waiting_len(), 1);

        assert_eq!(d.settle_by_name("p", "a", Ok(json!("first")), now), Settlement::Settled);
        assert_eq!(rx_a.try_recv().unwrap().unwrap(), json!("first"));
        assert_eq!(sent_ids(&mut d), vec!["2"]);

        assert_eq!(d.settle_by_name("p", "a", Ok(json!("second")), now), Settlement::Settled);
        assert_eq!(rx_b.try_recv().unwrap().unwrap(), json!("second"));
        assert_eq!(d.waiting_len(), 0);
    }

    #[tokio::test]
    async fn cancelled_in_flight_key_swallows_its_late_reply() {
        let mut d = Dispatcher::new(CorrelationMode::ByName, Duration::from_secs(5));
        let now = Instant::now();
        let (a, _rx_a) = request("1", "p", "a");
        let (b, mut rx_b) = request("2", "p", "a");
        d.submit(a, now);
        d.submit(b, now);
        sent_ids(&mut d);

        d.cancel("1", now);
        assert_eq!(d.pending_len(), 0);
        assert!(d.take_outbox().is_empty(), "key stays blocked by the tombstone");

        assert_eq!(d.settle_by_name("p", "a", Ok(json!("stale")), now), Settlement::Dropped);
        assert_eq!(sent_ids(&mut d), vec!["2"]);
        assert!(matches!(rx_b.try_recv(), Err(TryRecvError::Empty)));

        assert_eq!(d.settle_by_name("p", "a", Ok(json!("fresh")), now), Settlement::Settled);
        assert_eq!(rx_b.try_recv().unwrap().unwrap(), json!("fresh"));
    }

    #[tokio::test]
    async fn tombstones_expire() {
        let mut d = Dispatcher::new(CorrelationMode::ByName, Duration::from_millis(200));
        let now = Instant::now();
        let (a, _rx_a) = request("1", "p", "a");
        let (b, _rx_b) = request("2", "p", "a");
        d.submit(a, now);
        d.submit(b, now);
        sent_ids(&mut d);
        d.cancel("1", now);

        assert_eq!(d.next_deadline(), Some(now + Duration::from_millis(200)));
        d.expire(now + Duration::from_millis(100));
        assert!(d.take_outbox().is_empty());
        d.expire(now + Duration::from_millis(200));
        assert_eq!(sent_ids(&mut d), vec!["2"]);
        assert_eq!(d.next_deadline(), None);
    }

    #[tokio::test]
    async fn cancel_removes_queued_commands_too() {
        let mut d = Dispatcher::new(CorrelationMode::ByName, Duration::from_secs(1));
        let now = Instant::now();
        let (a, _rx_a) = request("1", "p", "a");
        let (b, _rx_b) = request("2", "p", "a");
        let (c, _rx_c) = request("3", "q", "a");
        d.submit(a, now);
        d.submit(b, now);
        assert!(d.queue_offline(c, 4).is_ok());
        d.cancel("2", now);
        d.cancel("3", now);
        assert_eq!(d.waiting_len(), 0);
        assert_eq!(d.offline_len(), 0);
        assert_eq!(d.pending_len(), 1);
    }

    #[tokio::test]
    async fn connection_loss_fails_every_accepted_command() {
        let mut d = Dispatcher::new(CorrelationMode::ByName, Duration::from_secs(1));
        let now = Instant::now();
        let mut receivers = Vec::new();
        for (id, action) in [("1", "a"), ("2", "a"), ("3", "b")] {
            let (req, rx) = request(id, "p", action);
            d.submit(req, now);
            receivers.push(rx);
        }
        assert_eq!(d.fail_in_flight(), 3);
        for mut rx in receivers {
            assert!(matches!(rx.try_recv().unwrap(), Err(CommandError::ConnectionLost)));
        }
        assert_eq!(d.pending_len(), 0);
        assert_eq!(d.waiting_len(), 0);
        assert!(d.take_outbox().is_empty());
    }

    #[tokio::test]
    async fn offline_queue_is_bounded_and_released_in_order() {
        let mut d = Dispatcher::new(CorrelationMode::Strict, Duration::from_secs(1));
        let now = Instant::now();
        let (a, _rx_a) = request("1", "p", "a");
        let (b, _rx_b) = request("2", "p", "b");
        let (c, _rx_c) = request("3", "p", "c");
        assert!(d.queue_offline(a, 2).is_ok());
        assert!(d.queue_offline(b, 2).is_ok());
        let overflow = d.queue_offline(c, 2).err().expect("queue is full");
        assert_eq!(overflow.correlation_id, "3");

        d.release_offline(now);
        assert_eq!(sent_ids(&mut d), vec!["1", "2"]);
        assert_eq!(d.pending_len(), 2);
    }

    #[tokio::test]
    async fn abandoned_requests_are_never_sent() {
        let mut d = Dispatcher::new(CorrelationMode::Strict, Duration::from_secs(1));
        let (a, rx) = request("1", "p", "a");
        drop(rx);
        d.submit(a, Instant::now());
        assert!(d.take_outbox().is_empty());
        assert_eq!(d.pending_len(), 0);
    }
}
