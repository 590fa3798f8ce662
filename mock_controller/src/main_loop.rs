use crate::protocol::{InboundMsg, OutboundMsg};
use crate::registry::PluginRegistry;
use controller_protocol::{
    ClientMessage, CommandEnvelope, CommandReply, PluginEvent, PluginState, ServerMessage,
};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde_json::{json, Value};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct MainLoopOptions {
    /// Off imitates a legacy controller that replies by name only.
    pub echo_correlation: bool,
}

impl Default for MainLoopOptions {
    fn default() -> Self {
        Self {
            echo_correlation: true,
        }
    }
}

pub struct MainLoop {
    inbound_rx: Receiver<InboundMsg>,
    outbound_tx: Sender<OutboundMsg>,
    options: MainLoopOptions,
    client_connected: bool,
}

impl MainLoop {
    pub fn new(inbound_rx: Receiver<InboundMsg>, outbound_tx: Sender<OutboundMsg>) -> Self {
        Self::with_options(inbound_rx, outbound_tx, MainLoopOptions::default())
    }

    pub fn with_options(
        inbound_rx: Receiver<InboundMsg>,
        outbound_tx: Sender<OutboundMsg>,
        options: MainLoopOptions,
    ) -> Self {
        Self {
            inbound_rx,
            outbound_tx,
            options,
            client_connected: false,
        }
    }

    pub fn client_connected(&self) -> bool {
        self.client_connected
    }

    /// Drains everything the network thread queued and answers it, in arrival order.
    pub fn tick(&mut self, registry: &mut PluginRegistry) {
        loop {
            match self.inbound_rx.try_recv() {
                Ok(InboundMsg::ClientConnected { socket_addr }) => {
                    debug!(%socket_addr, "greeting client with a status snapshot");
                    self.client_connected = true;
                    self.send(ServerMessage::Status(registry.snapshot()));
                }
                Ok(InboundMsg::ClientDisconnected) => self.client_connected = false,
                Ok(InboundMsg::Command {
                    cmd: ClientMessage::Command(cmd),
                }) => self.execute(registry, cmd),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn execute(&mut self, registry: &mut PluginRegistry, cmd: CommandEnvelope) {
        let CommandEnvelope {
            plugin_id,
            action,
            params,
            correlation_id,
        } = cmd;
        let correlation_id = self.options.echo_correlation.then_some(correlation_id);
        debug!(%plugin_id, %action, "command");

        if registry.get(&plugin_id).is_none() {
            self.send(ServerMessage::Reply(CommandReply::failed(
                plugin_id.clone(),
                action,
                correlation_id,
                format!("unknown plugin: {plugin_id}"),
            )));
            return;
        }

        let verb = action.clone();
        match verb.as_str() {
            "start" | "stop" => {
                let (state, kind) = if verb == "start" {
                    (PluginState::Running, "plugin_started")
                } else {
                    (PluginState::Stopped, "plugin_stopped")
                };
                let previous = registry.set(&plugin_id, state);
                info!(%plugin_id, ?previous, %state, "plugin state changed");
                self.send(ServerMessage::Reply(CommandReply::ok(
                    plugin_id.clone(),
                    action,
                    correlation_id,
                    json!({ "status": state.as_str() }),
                )));
                self.send(ServerMessage::Status(registry.snapshot()));
                self.send(ServerMessage::Event(PluginEvent::new(kind, Some(plugin_id))));
            }
            "echo" => {
                self.send(ServerMessage::Reply(CommandReply::ok(
                    plugin_id,
                    action,
                    correlation_id,
                    params.unwrap_or(Value::Null),
                )));
            }
            "fail" => {
                let message = params
                    .as_ref()
                    .and_then(|p| p.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("requested failure")
                    .to_string();
                self.send(ServerMessage::Reply(CommandReply::failed(
                    plugin_id,
                    action,
                    correlation_id,
                    message,
                )));
            }
            "silent" => {}
            other => {
                let error = format!("unknown action: {other}");
                self.send(ServerMessage::Reply(CommandReply::failed(
                    plugin_id,
                    action,
                    correlation_id,
                    error,
                )));
            }
        }
    }

    fn send(&mut self, msg: ServerMessage) {
        // Best effort: nothing to do if the network thread is backed up.
        let _ = self.outbound_tx.try_send(OutboundMsg::Send { msg });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{INBOUND_CAP, OUTBOUND_CAP};
    use crossbeam_channel::bounded;

    struct Rig {
        in_tx: Sender<InboundMsg>,
        out_rx: Receiver<OutboundMsg>,
        main_loop: MainLoop,
        registry: PluginRegistry,
    }

    impl Rig {
        fn new(options: MainLoopOptions) -> Self {
            let (in_tx, in_rx) = bounded(INBOUND_CAP);
            let (out_tx, out_rx) = bounded(OUTBOUND_CAP);
            Self {
                in_tx,
                out_rx,
                main_loop: MainLoop::with_options(in_rx, out_tx, options),
                registry: PluginRegistry::new()
                    .with_plugin("kicad", PluginState::Stopped)
                    .with_plugin("n8n", PluginState::Running),
            }
        }

        fn command(&mut self, plugin: &str, action: &str, params: Option<Value>) -> Vec<ServerMessage> {
            self.in_tx
                .send(InboundMsg::Command {
                    cmd: ClientMessage::Command(CommandEnvelope {
                        plugin_id: plugin.into(),
                        action: action.into(),
                        params,
                        correlation_id: "c-1".into(),
                    }),
                })
                .unwrap();
            self.main_loop.tick(&mut self.registry);
            self.out_rx
                .try_iter()
                .map(|OutboundMsg::Send { msg }| msg)
                .collect()
        }
    }

    #[test]
    fn new_client_gets_a_snapshot() {
        let mut rig = Rig::new(MainLoopOptions::default());
        rig.in_tx
            .send(InboundMsg::ClientConnected {
                socket_addr: "127.0.0.1:1".parse().unwrap(),
            })
            .unwrap();
        rig.main_loop.tick(&mut rig.registry);
        assert!(rig.main_loop.client_connected());
        let Ok(OutboundMsg::Send {
            msg: ServerMessage::Status(snapshot),
        }) = rig.out_rx.try_recv()
        else {
            panic!("expected a status snapshot");
        };
        assert_eq!(snapshot.plugins.len(), 2);
    }

    #[test]
    fn start_replies_then_broadcasts_status_and_event() {
        let mut rig = Rig::new(MainLoopOptions::default());
        let out = rig.command("kicad", "start", None);
        assert_eq!(out.len(), 3);
        let ServerMessage::Reply(reply) = &out[0] else {
            panic!("expected reply first");
        };
        assert_eq!(reply.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(reply.outcome(), Ok(json!({ "status": "running" })));
        assert!(matches!(&out[1], ServerMessage::Status(s) if s.to_map()["kicad"] == PluginState::Running));
        assert!(matches!(&out[2], ServerMessage::Event(e) if e.kind == "plugin_started"));
        assert_eq!(rig.registry.get("kicad"), Some(PluginState::Running));
    }

    #[test]
    fn echo_fail_silent_and_unknowns() {
        let mut rig = Rig::new(MainLoopOptions::default());

        let out = rig.command("n8n", "echo", Some(json!({ "x": 1 })));
        assert!(matches!(&out[..], [ServerMessage::Reply(r)] if r.outcome() == Ok(json!({ "x": 1 }))));

        let out = rig.command("n8n", "fail", Some(json!({ "message": "nope" })));
        assert!(matches!(&out[..], [ServerMessage::Reply(r)] if r.outcome() == Err("nope".into())));

        assert!(rig.command("n8n", "silent", None).is_empty());

        let out = rig.command("ghost", "echo", None);
        assert!(matches!(&out[..], [ServerMessage::Reply(r)] if r.error.as_deref() == Some("unknown plugin: ghost")));

        let out = rig.command("n8n", "dance", None);
        assert!(matches!(&out[..], [ServerMessage::Reply(r)] if r.error.as_deref() == Some("unknown action: dance")));
    }

    #[test]
    fn legacy_mode_drops_the_correlation_id() {
        let mut rig = Rig::new(MainLoopOptions {
            echo_correlation: false,
        });
        let out = rig.command("n8n", "echo", None);
        let [ServerMessage::Reply(reply)] = &out[..] else {
            panic!("expected one reply");
        };
        assert_eq!(reply.correlation_id, None);
        assert_eq!(reply.action.as_deref(), Some("echo"));
    }
}
