use anyhow::{anyhow, Context};
use clap::Parser;
use mock_controller::{MainLoopOptions, MockController, PluginRegistry};
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mock_controller", about = "Stand-in controller speaking the plugin command protocol")]
struct Args {
    /// Listen address; port 0 picks a free one.
    #[arg(long, default_value = "127.0.0.1:0")]
    addr: String,

    /// Write the bound address here once listening.
    #[arg(long)]
    addr_file: Option<PathBuf>,

    /// Exit after this many milliseconds.
    #[arg(long)]
    run_for_ms: Option<u64>,

    /// Reply without echoing correlation ids.
    #[arg(long)]
    legacy: bool,

    /// Initial plugins, `id=state,...`.
    #[arg(long, default_value = "kicad=running,n8n=stopped,freecad=active")]
    plugins: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let registry = PluginRegistry::parse(&args.plugins).map_err(|e| anyhow!(e))?;
    let options = MainLoopOptions {
        echo_correlation: !args.legacy,
    };

    let controller = MockController::spawn(&args.addr, registry, options)
        .with_context(|| format!("bind {}", args.addr))?;

    if let Some(path) = &args.addr_file {
        fs::write(path, controller.listen_addr().to_string())
            .with_context(|| format!("write {}", path.display()))?;
    }
    println!("mock_controller listening on {}", controller.url());

    let run_for = args.run_for_ms.map(Duration::from_millis);
    let start = Instant::now();
    loop {
        thread::sleep(Duration::from_millis(50));
        if run_for.is_some_and(|max| start.elapsed() >= max) {
            break;
        }
    }

    if let Some(registry) = controller.shutdown() {
        for plugin in registry.snapshot().plugins {
            tracing::info!(plugin = %plugin.id, state = %plugin.status, "final plugin state");
        }
    }
    Ok(())
}
