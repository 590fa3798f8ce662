use anyhow::{anyhow, Context};
use clap::Parser;
use controller_client::config::parse_endpoint;
use controller_client::protocol::PluginStatusMap;
use controller_client::{
    ClientConfig, CommandError, ConnectionState, ControllerClient, Notification,
    SubscriptionFilter,
};
use serde_json::Value;
use std::process::ExitCode;
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "controller_cli", about = "Send commands to the plugin controller")]
struct Args {
    /// Controller endpoint; defaults to CONTROLLER_URL or ws://127.0.0.1:8765.
    #[arg(long)]
    url: Option<String>,

    #[arg(long, requires = "action")]
    plugin: Option<String>,

    #[arg(long, requires = "plugin")]
    action: Option<String>,

    /// Command parameters as JSON.
    #[arg(long, value_name = "JSON", requires = "action")]
    params: Option<String>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print the plugin status table after connecting.
    #[arg(long, default_value_t = false)]
    status: bool,

    /// Print notifications for this many seconds.
    #[arg(long, value_name = "SECS")]
    watch_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut cfg = ClientConfig::from_env()?;
    if let Some(url) = args.url.as_deref() {
        cfg.endpoint = parse_endpoint(url)?;
    }
    if let Some(ms) = args.timeout_ms {
        cfg.command_timeout = Duration::from_millis(ms);
    }
    let params = args.params.as_deref().map(parse_params).transpose()?;

    let connect_timeout = cfg.connect_timeout;
    let endpoint = cfg.endpoint.clone();
    let client = ControllerClient::spawn(cfg);
    let (_status_sub, mut status_rx) = client.subscribe_channel(SubscriptionFilter::status());
    let (_watch_sub, mut watch_rx) = client.subscribe_channel(SubscriptionFilter::everything());

    client.connect()?;
    tokio::time::timeout(
        connect_timeout * 2,
        client.wait_for_state(ConnectionState::Connected),
    )
    .await
    .map_err(|_| anyhow!("could not connect to {endpoint}"))??;
    eprintln!("connected to {endpoint}");

    if args.status {
        // The controller greets new clients with a snapshot; give it a moment.
        let _ = tokio::time::timeout(Duration::from_secs(1), status_rx.recv()).await;
        print_status(&client.plugin_status());
    }

    let mut exit = ExitCode::SUCCESS;
    if let (Some(plugin), Some(action)) = (args.plugin.as_deref(), args.action.as_deref()) {
        match client.send_command(plugin, action, params).await {
            Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
            Err(CommandError::Remote(msg)) => {
                eprintln!("{plugin}/{action} failed: {msg}");
                exit = ExitCode::from(1);
            }
            Err(err) => return Err(err).with_context(|| format!("{plugin}/{action}")),
        }
    }

    if let Some(secs) = args.watch_secs {
        let deadline = Instant::now() + Duration::from_secs(secs);
        while let Ok(Some(note)) = tokio::time::timeout_at(deadline, watch_rx.recv()).await {
            println!("{}", describe(&note));
        }
    }

    client.shutdown().await;
    Ok(exit)
}

fn parse_params(raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--params is not valid JSON: {raw}"))
}

fn print_status(status: &PluginStatusMap) {
    if status.is_empty() {
        println!("(no plugins reported)");
        return;
    }
    let width = status.keys().map(String::len).max().unwrap_or(0);
    for (id, state) in status {
        println!("{id:<width$}  {state}");
    }
}

fn describe(note: &Notification) -> String {
    match note {
        Notification::Connection(state) => format!("connection  {state}"),
        Notification::Status(map) => {
            let plugins: Vec<String> = map.iter().map(|(id, s)| format!("{id}={s}")).collect();
            format!("status      {}", plugins.join(","))
        }
        Notification::Event(event) => format!(
            "event       {} {}",
            event.kind,
            Value::Object(event.body.clone())
        ),
    }
}
