use crate::protocol::{InboundMsg, OutboundMsg};
use controller_protocol::{decode_client_message, encode_server_message, PluginEvent, ServerMessage};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde_json::Value;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message;

struct ActiveClient {
    ws: tungstenite::WebSocket<TcpStream>,
    socket_addr: SocketAddr,
}

/// WebSocket side of the mock controller: one std thread, one client at a time.
pub struct NetworkThread {
    listen_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkThread {
    /// Binds `addr` (port 0 picks a free one) and starts serving.
    pub fn spawn_with_addr(
        addr: &str,
        in_tx: Sender<InboundMsg>,
        out_rx: Receiver<OutboundMsg>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let listen_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = Arc::clone(&shutdown);
        let join_handle = thread::Builder::new()
            .name("mock-controller-net".into())
            .spawn(move || run_server(listener, in_tx, out_rx, shutdown_for_thread))?;

        info!(%listen_addr, "mock controller listening");
        Ok(Self {
            listen_addr,
            shutdown,
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Ok(mut h) = self.join_handle.lock() {
            if let Some(h) = h.take() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for NetworkThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_server(
    listener: TcpListener,
    in_tx: Sender<InboundMsg>,
    out_rx: Receiver<OutboundMsg>,
    shutdown: Arc<AtomicBool>,
) {
    let mut active: Option<ActiveClient> = None;

    while !shutdown.load(Ordering::Relaxed) {
        // Accept new connections; the newest client wins.
        loop {
            match listener.accept() {
                Ok((stream, socket_addr)) => {
                    let Some(ws) = handshake(stream, socket_addr) else {
                        continue;
                    };

                    if let Some(mut prev) = active.take() {
                        info!(addr = %prev.socket_addr, "replacing previous client");
                        let _ = prev.ws.close(None);
                        let _ = in_tx.try_send(InboundMsg::ClientDisconnected);
                    }

                    if in_tx
                        .try_send(InboundMsg::ClientConnected { socket_addr })
                        .is_err()
                    {
                        let mut ws = ws;
                        let _ = send_server_message(&mut ws, &error_event("server busy"));
                        let _ = ws.close(None);
                        continue;
                    }

                    info!(addr = %socket_addr, "client connected");
                    active = Some(ActiveClient { ws, socket_addr });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }

        if let Some(client) = active.as_mut() {
            let mut lost = false;
            loop {
                match out_rx.try_recv() {
                    Ok(OutboundMsg::Send { msg }) => {
                        if send_server_message(&mut client.ws, &msg).is_err() {
                            lost = true;
                            break;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }
            if lost {
                let _ = client.ws.close(None);
                drop_client(&mut active, &in_tx);
                continue;
            }
        }

        // At most one inbound frame per pass; the read timeout keeps the loop moving.
        if let Some(client) = active.as_mut() {
            match client.ws.read() {
                Ok(msg) => {
                    if handle_inbound(&in_tx, client, msg).is_err() {
                        let _ = client.ws.close(None);
                        drop_client(&mut active, &in_tx);
                    }
                }
                Err(tungstenite::Error::Io(e))
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => {
                    debug!(error = %e, "client read ended");
                    drop_client(&mut active, &in_tx);
                }
            }
        } else {
            thread::sleep(Duration::from_millis(10));
        }
    }

    if let Some(mut client) = active {
        let _ = client.ws.close(None);
        let _ = client.ws.flush();
    }
}

fn handshake(stream: TcpStream, socket_addr: SocketAddr) -> Option<tungstenite::WebSocket<TcpStream>> {
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_nodelay(true);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(200)));

    let ws = match tungstenite::accept(stream) {
        Ok(ws) => ws,
        Err(e) => {
            warn!(addr = %socket_addr, error = %e, "websocket handshake failed");
            return None;
        }
    };
    let _ = ws
        .get_ref()
        .set_read_timeout(Some(Duration::from_millis(20)));
    Some(ws)
}

fn drop_client(active: &mut Option<ActiveClient>, in_tx: &Sender<InboundMsg>) {
    if let Some(client) = active.take() {
        info!(addr = %client.socket_addr, "client disconnected");
    }
    let _ = in_tx.try_send(InboundMsg::ClientDisconnected);
}

fn handle_inbound(
    in_tx: &Sender<InboundMsg>,
    client: &mut ActiveClient,
    msg: Message,
) -> Result<(), ()> {
    let text = match msg {
        Message::Text(s) => s,
        Message::Binary(_) => return Ok(()),
        Message::Ping(payload) => {
            let _ = client.ws.send(Message::Pong(payload));
            return Ok(());
        }
        Message::Pong(_) => return Ok(()),
        Message::Close(_) => return Err(()),
        Message::Frame(_) => return Ok(()),
    };

    let cmd = match decode_client_message(&text) {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, "rejecting malformed client frame");
            let _ = send_server_message(&mut client.ws, &error_event("invalid command"));
            return Ok(());
        }
    };

    if in_tx.try_send(InboundMsg::Command { cmd }).is_err() {
        let _ = send_server_message(&mut client.ws, &error_event("server busy"));
    }

    Ok(())
}

fn error_event(message: &str) -> ServerMessage {
    ServerMessage::Event(
        PluginEvent::new("controller_error", None)
            .with_field("message", Value::String(message.to_string())),
    )
}

fn send_server_message(
    ws: &mut tungstenite::WebSocket<TcpStream>,
    msg: &ServerMessage,
) -> Result<(), ()> {
    let payload = encode_server_message(msg).map_err(|_| ())?;
    ws.send(Message::Text(payload)).map_err(|_| ())
}
