//! A stand-in controller process for tests and local development.

mod main_loop;
mod net;
mod protocol;
mod registry;

pub use crate::main_loop::{MainLoop, MainLoopOptions};
pub use crate::net::NetworkThread;
pub use crate::protocol::{InboundMsg, OutboundMsg, INBOUND_CAP, OUTBOUND_CAP};
pub use crate::registry::PluginRegistry;

use crossbeam_channel::bounded;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const TICK: Duration = Duration::from_millis(5);

/// Network thread plus a thread ticking the main loop.
pub struct MockController {
    net: NetworkThread,
    stop: Arc<AtomicBool>,
    ticker: Option<JoinHandle<PluginRegistry>>,
}

impl MockController {
    pub fn spawn(addr: &str, registry: PluginRegistry, options: MainLoopOptions) -> io::Result<Self> {
        let (in_tx, in_rx) = bounded(INBOUND_CAP);
        let (out_tx, out_rx) = bounded(OUTBOUND_CAP);
        let net = NetworkThread::spawn_with_addr(addr, in_tx, out_rx)?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let ticker = thread::Builder::new()
            .name("mock-controller-main".into())
            .spawn(move || {
                let mut registry = registry;
                let mut main_loop = MainLoop::with_options(in_rx, out_tx, options);
                while !stop_for_thread.load(Ordering::Relaxed) {
                    main_loop.tick(&mut registry);
                    thread::sleep(TICK);
                }
                registry
            })?;

        Ok(Self {
            net,
            stop,
            ticker: Some(ticker),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.net.listen_addr()
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.listen_addr())
    }

    /// Stops both threads and hands back the final plugin states.
    pub fn shutdown(mut self) -> Option<PluginRegistry> {
        self.stop_threads()
    }

    fn stop_threads(&mut self) -> Option<PluginRegistry> {
        self.stop.store(true, Ordering::Relaxed);
        let registry = self.ticker.take().and_then(|h| h.join().ok());
        self.net.shutdown();
        registry
    }
}

impl Drop for MockController {
    fn drop(&mut self) {
        self.stop_threads();
    }
}
