use crate::state::ConnectionState;
use controller_protocol::{CommandReply, PluginEvent, PluginStatusMap, ServerMessage};
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::warn;

/// What a subscriber is told about.
#[derive(Debug, Clone)]
pub enum Notification {
    Connection(ConnectionState),
    Status(Arc<PluginStatusMap>),
    Event(Arc<PluginEvent>),
}

/// Interest filter for [`Notification`]s. Plugin and action narrowing applies to events only.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    connection: bool,
    status: bool,
    events: bool,
    plugins: BTreeSet<String>,
    actions: BTreeSet<String>,
}

impl SubscriptionFilter {
    pub fn everything() -> Self {
        Self {
            connection: true,
            status: true,
            events: true,
            ..Self::default()
        }
    }

    pub fn events() -> Self {
        Self {
            events: true,
            ..Self::default()
        }
    }

    pub fn connection() -> Self {
        Self {
            connection: true,
            ..Self::default()
        }
    }

    pub fn status() -> Self {
        Self {
            status: true,
            ..Self::default()
        }
    }

    pub fn with_connection(mut self) -> Self {
        self.connection = true;
        self
    }

    pub fn with_status(mut self) -> Self {
        self.status = true;
        self
    }

    pub fn plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.events = true;
        self.plugins.insert(plugin_id.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.events = true;
        self.actions.insert(action.into());
        self
    }

    pub fn matches(&self, notification: &Notification) -> bool {
        match notification {
            Notification::Connection(_) => self.connection,
            Notification::Status(_) => self.status,
            Notification::Event(event) => {
                self.events
                    && (self.plugins.is_empty()
                        || event
                            .plugin_id
                            .as_ref()
                            .is_some_and(|id| self.plugins.contains(id)))
                    && (self.actions.is_empty()
                        || event
                            .action
                            .as_ref()
                            .is_some_and(|a| self.actions.contains(a)))
            }
        }
    }
}

type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

struct Subscriber {
    id: u64,
    filter: SubscriptionFilter,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<Subscriber>,
    last_message: Option<Arc<ServerMessage>>,
    last_responses: HashMap<String, CommandReply>,
}

/// Subscriber registry plus the passive "last seen" slots.
#[derive(Default)]
pub(crate) struct Fanout {
    registry: Mutex<Registry>,
}

impl Fanout {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn subscribe(
        self: &Arc<Self>,
        filter: SubscriptionFilter,
        callback: Callback,
    ) -> Subscription {
        let mut reg = self.registry();
        reg.next_id += 1;
        let id = reg.next_id;
        reg.subscribers.push(Subscriber {
            id,
            filter,
            callback,
        });
        Subscription {
            id,
            fanout: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.registry().subscribers.retain(|s| s.id != id);
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.registry().subscribers.len()
    }

    /// Calls every matching subscriber in registration order. The registry lock is
    /// released around each call so callbacks may subscribe or unsubscribe; a
    /// subscriber removed earlier in the same delivery is skipped.
    pub(crate) fn deliver(&self, notification: Notification) {
        let targets: Vec<(u64, Callback)> = self
            .registry()
            .subscribers
            .iter()
            .filter(|s| s.filter.matches(&notification))
            .map(|s| (s.id, Arc::clone(&s.callback)))
            .collect();

        for (id, callback) in targets {
            if !self.registry().subscribers.iter().any(|s| s.id == id) {
                continue;
            }
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&notification))).is_err() {
                warn!("subscriber panicked while handling a controller notification");
            }
        }
    }

    pub(crate) fn record_message(&self, message: Arc<ServerMessage>) {
        self.registry().last_message = Some(message);
    }

    /// Replies that name no plugin have no slot to land in.
    pub(crate) fn record_response(&self, reply: CommandReply) {
        if let Some(plugin_id) = reply.plugin_id.clone() {
            self.registry().last_responses.insert(plugin_id, reply);
        }
    }

    pub(crate) fn last_message(&self) -> Option<Arc<ServerMessage>> {
        self.registry().last_message.clone()
    }

    pub(crate) fn last_response(&self, plugin_id: &str) -> Option<CommandReply> {
        self.registry().last_responses.get(plugin_id).cloned()
    }
}

/// Registration handle. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    id: u64,
    fanout: Weak<Fanout>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
