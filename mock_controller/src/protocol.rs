use controller_protocol::{ClientMessage, ServerMessage};
use std::net::SocketAddr;

pub const INBOUND_CAP: usize = 256;
pub const OUTBOUND_CAP: usize = 256;

pub enum InboundMsg {
    ClientConnected { socket_addr: SocketAddr },
    ClientDisconnected,
    Command { cmd: ClientMessage },
}

pub enum OutboundMsg {
    Send { msg: ServerMessage },
}
