use crate::dispatcher::{Dispatcher, Settlement};
use crate::fanout::{Fanout, Notification};
use controller_protocol::{CommandReply, PluginEvent, PluginStatusMap, ServerMessage};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Routes one decoded inbound message. Anything that settles a pending command,
/// status snapshots included, never reaches subscribers.
pub(crate) fn route(
    msg: ServerMessage,
    dispatcher: &mut Dispatcher,
    fanout: &Fanout,
    status: &watch::Sender<Arc<PluginStatusMap>>,
    now: Instant,
) {
    match msg {
        ServerMessage::Reply(reply) => route_reply(reply, dispatcher, fanout, now),
        ServerMessage::Status(snapshot) => {
            if let Some(correlation_id) = snapshot.correlation_id.as_deref() {
                let settled = dispatcher.settle(correlation_id, snapshot.outcome(), now);
                if matches!(settled, Settlement::Settled) {
                    debug!(correlation_id, "status snapshot answered a command");
                    return;
                }
            }
            let map = Arc::new(snapshot.to_map());
            debug!(plugins = map.len(), "plugin status snapshot");
            status.send_replace(Arc::clone(&map));
            fanout.record_message(Arc::new(ServerMessage::Status(snapshot)));
            fanout.deliver(Notification::Status(map));
        }
        ServerMessage::Event(event) => broadcast(event, fanout),
    }
}

fn route_reply(reply: CommandReply, dispatcher: &mut Dispatcher, fanout: &Fanout, now: Instant) {
    if let Some(correlation_id) = reply.correlation_id.as_deref() {
        match dispatcher.settle(correlation_id, reply.outcome(), now) {
            Settlement::Settled => fanout.record_response(reply),
            Settlement::Dropped | Settlement::Unmatched => {
                debug!(
                    correlation_id,
                    plugin_id = ?reply.plugin_id,
                    "dropping reply with no pending command"
                );
            }
        }
        return;
    }

    let settlement = match (reply.plugin_id.as_deref(), reply.action.as_deref()) {
        (Some(plugin_id), Some(action)) => {
            dispatcher.settle_by_name(plugin_id, action, reply.outcome(), now)
        }
        _ => Settlement::Unmatched,
    };
    match settlement {
        Settlement::Settled => fanout.record_response(reply),
        Settlement::Dropped => {}
        Settlement::Unmatched => broadcast(PluginEvent::from(reply), fanout),
    }
}

fn broadcast(event: PluginEvent, fanout: &Fanout) {
    let event = Arc::new(event);
    fanout.record_message(Arc::new(ServerMessage::Event((*event).clone())));
    fanout.deliver(Notification::Event(event));
}
