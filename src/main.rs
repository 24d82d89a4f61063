use anyhow::Result;
use clap::Parser;
use scriptpilot::config::Config;
use scriptpilot::server;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// JSON-scripted browser automation runtime.
#[derive(Debug, Parser)]
#[command(name = "scriptpilot", version, about)]
struct Args {
    /// Path to a TOML config file (default: ~/.scriptpilot/config.toml).
    #[arg(long, env = "SCRIPTPILOT_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP port override.
    #[arg(long, env = "PORT")]
    http_port: Option<u16>,

    /// WebSocket port override.
    #[arg(long, env = "WSSPORT")]
    ws_port: Option<u16>,

    /// Default per-task time budget in milliseconds.
    #[arg(long, env = "TIMEOUT")]
    timeout_ms: Option<u64>,

    /// Launch locally booted browsers with a visible window.
    #[arg(long)]
    headed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("scriptpilot=info,warn")),
        )
        .init();

    let mut config = Config::load(args.config)?;
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(port) = args.ws_port {
        config.ws_port = port;
    }
    if let Some(ms) = args.timeout_ms {
        config.request_timeout_ms = ms;
    }
    if args.headed {
        config.headless = false;
    }

    server::run(config).await
}
