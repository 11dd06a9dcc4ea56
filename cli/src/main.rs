//! anyclaude binary: protocol-translating reverse proxy for the Anthropic
//! Messages API.
//!
//! `anyclaude --mode=local` starts the proxy; `--check-setup` verifies the
//! configured backend answers `/v1/models`; `--test-model` runs one tiny
//! completion round-trip. Exit codes: 0 success, 1 config/dependency error.

mod setup;

use clap::Parser;
use config::Mode;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "anyclaude")]
#[command(about = "anyclaude: Anthropic Messages proxy over local, cloud, or cluster backends")]
struct Args {
    /// Backend mode: anthropic | local | openrouter | mlx-cluster
    /// (default: ANYCLAUDE_MODE, then the config file, then anthropic)
    #[arg(long, value_name = "MODE")]
    mode: Option<String>,

    /// Listen address (default 127.0.0.1:8787)
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Config file path (default ~/.anyclaude/config.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verify the configured backend is reachable, then exit
    #[arg(long)]
    check_setup: bool,

    /// Send one tiny completion through the configured backend, then exit
    #[arg(long)]
    test_model: bool,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args = Args::parse();

    let cli_mode: Option<Mode> = match args.mode.as_deref().map(str::parse).transpose() {
        Ok(m) => m,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    let config = match config::resolve(cli_mode, args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    init_tracing(config.debug);

    if args.check_setup {
        return setup::check_setup(&config).await;
    }
    if args.test_model {
        return setup::test_model(&config).await;
    }

    let services = serve::build_services(config);
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    let signal_services = services.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining");
        signal_services.shutdown();
        signal_token.cancel();
    });

    match serve::run_serve(args.listen.as_deref(), services, shutdown).await {
        Ok(()) => 0,
        Err(e) => {
            error!("server error: {e}");
            1
        }
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
