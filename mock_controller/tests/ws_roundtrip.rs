use controller_protocol::{
    decode_server_message, encode_client_message, ClientMessage, CommandEnvelope, PluginState,
    ServerMessage,
};
use crossbeam_channel::bounded;
use mock_controller::{MainLoop, MainLoopOptions, NetworkThread, PluginRegistry};
use serde_json::json;
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tungstenite::Message;

type Ws = tungstenite::WebSocket<TcpStream>;

struct Harness {
    net: NetworkThread,
    main_loop: MainLoop,
    registry: PluginRegistry,
}

impl Harness {
    fn new(options: MainLoopOptions) -> Self {
        let (in_tx, in_rx) = bounded(mock_controller::INBOUND_CAP);
        let (out_tx, out_rx) = bounded(mock_controller::OUTBOUND_CAP);
        let net = NetworkThread::spawn_with_addr("127.0.0.1:0", in_tx, out_rx).expect("spawn net");
        Self {
            net,
            main_loop: MainLoop::with_options(in_rx, out_tx, options),
            registry: PluginRegistry::new()
                .with_plugin("kicad", PluginState::Stopped)
                .with_plugin("n8n", PluginState::Running),
        }
    }

    fn connect(&self) -> Ws {
        let addr = self.net.listen_addr();
        let stream = TcpStream::connect(addr).expect("tcp connect");
        let _ = stream.set_write_timeout(Some(Duration::from_millis(200)));
        let (ws, _) = tungstenite::client(format!("ws://{addr}"), stream).expect("ws connect");
        let _ = ws.get_ref().set_read_timeout(Some(Duration::from_millis(50)));
        ws
    }

    /// Ticks the main loop until the client sees one message.
    fn next(&mut self, ws: &mut Ws) -> ServerMessage {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            self.main_loop.tick(&mut self.registry);
            match ws.read() {
                Ok(Message::Text(s)) => return decode_server_message(&s).expect("valid server json"),
                Ok(_) => {}
                Err(tungstenite::Error::Io(e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => panic!("ws read failed: {e:?}"),
            }
            if Instant::now() >= deadline {
                panic!("timeout waiting for server message");
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

fn send(ws: &mut Ws, plugin: &str, action: &str, id: &str) {
    let cmd = ClientMessage::Command(CommandEnvelope {
        plugin_id: plugin.into(),
        action: action.into(),
        params: Some(json!({ "x": 1 })),
        correlation_id: id.into(),
    });
    ws.send(Message::Text(encode_client_message(&cmd).unwrap()))
        .unwrap();
}

#[test]
fn snapshot_on_connect_then_command_replies() {
    let mut h = Harness::new(MainLoopOptions::default());
    let mut ws = h.connect();

    let ServerMessage::Status(snapshot) = h.next(&mut ws) else {
        panic!("expected status snapshot first");
    };
    assert_eq!(snapshot.to_map().get("n8n"), Some(&PluginState::Running));

    send(&mut ws, "n8n", "echo", "c-1");
    let ServerMessage::Reply(reply) = h.next(&mut ws) else {
        panic!("expected reply");
    };
    assert_eq!(reply.correlation_id.as_deref(), Some("c-1"));
    assert_eq!(reply.outcome(), Ok(json!({ "x": 1 })));

    send(&mut ws, "kicad", "start", "c-2");
    assert!(matches!(h.next(&mut ws), ServerMessage::Reply(r) if r.correlation_id.as_deref() == Some("c-2")));
    assert!(matches!(h.next(&mut ws), ServerMessage::Status(s) if s.to_map()["kicad"] == PluginState::Running));
    assert!(matches!(h.next(&mut ws), ServerMessage::Event(e) if e.kind == "plugin_started"));

    h.net.shutdown();
}

#[test]
fn legacy_replies_carry_no_correlation_id() {
    let mut h = Harness::new(MainLoopOptions {
        echo_correlation: false,
    });
    let mut ws = h.connect();
    let _ = h.next(&mut ws);

    send(&mut ws, "n8n", "fail", "c-1");
    let ServerMessage::Reply(reply) = h.next(&mut ws) else {
        panic!("expected reply");
    };
    assert_eq!(reply.correlation_id, None);
    assert_eq!(reply.action.as_deref(), Some("fail"));
    assert_eq!(reply.outcome(), Err("requested failure".to_string()));

    h.net.shutdown();
}

#[test]
fn malformed_frames_get_an_error_event() {
    let mut h = Harness::new(MainLoopOptions::default());
    let mut ws = h.connect();
    let _ = h.next(&mut ws);

    ws.send(Message::Text("{\"type\":\"nonsense\"}".into())).unwrap();
    let ServerMessage::Event(event) = h.next(&mut ws) else {
        panic!("expected an error event");
    };
    assert_eq!(event.kind, "controller_error");

    h.net.shutdown();
}
