// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # XMRX Node
//!
//! Entry point for the `xmrx-node` binary. Parses CLI arguments, loads the
//! protocol configuration, initializes logging and metrics, starts the
//! three-party sandbox, and serves the HTTP API.
//!
//! - `run`     start the sandbox and API
//! - `config`  print the effective protocol configuration
//! - `version` print build version information

mod api;
mod cli;
mod logging;
mod metrics;
mod sim;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

use xmrx_protocol::config::{ProtocolConfig, ATOMIC_UNITS_PER_XMR, PROTOCOL_VERSION};

use cli::{Commands, XmrxNodeCli};
use metrics::NodeMetrics;
use sim::Sandbox;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = XmrxNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Config(args) => print_config(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Reads a JSON config file over the defaults. Missing fields keep their
/// default values.
fn load_config(path: Option<&Path>) -> Result<ProtocolConfig> {
    let Some(path) = path else {
        return Ok(ProtocolConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn apply_overrides(config: &mut ProtocolConfig, args: &cli::RunArgs) {
    if let Some(limit) = args.step_time_limit_ms {
        config.step_time_limit_ms = limit;
    }
    if let Some(confirmations) = args.unlock_confirmations {
        config.unlock_confirmations = confirmations;
    }
}

/// Starts the sandbox, the API server and the metrics endpoint, and runs
/// until SIGINT or SIGTERM.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(&args.log_level, args.log_format.into());

    let mut config = load_config(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        data_dir = ?args.data_dir,
        unlock_confirmations = config.unlock_confirmations,
        "starting xmrx-node"
    );

    if let Some(dir) = &args.data_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data directory: {}", dir.display()))?;
    }

    // --- Sandbox ---
    let fund = args
        .fund_xmr
        .checked_mul(ATOMIC_UNITS_PER_XMR)
        .context("fund amount overflows")?;
    let sandbox = Sandbox::start(
        config,
        args.data_dir.as_deref(),
        fund,
        Some(Duration::from_millis(args.block_interval_ms)),
    )
    .await
    .context("failed to start sandbox")?;

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new());
    let (stop_recorders, recorders_stopped) = watch::channel(false);
    let recorders: Vec<_> = sandbox
        .parties()
        .into_iter()
        .map(|party| {
            tokio::spawn(Arc::clone(&node_metrics).record_events(
                party.name,
                party.runtime.trades().subscribe(),
                party.runtime.disputes().subscribe(),
                recorders_stopped.clone(),
            ))
        })
        .collect();

    // --- API server ---
    let app_state = api::AppState {
        version: format!("{} (protocol {})", env!("CARGO_PKG_VERSION"), PROTOCOL_VERSION),
        sandbox: Arc::clone(&sandbox),
        metrics: Arc::clone(&node_metrics),
    };
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping trades");
        }
    }

    sandbox.shutdown().await;
    let _ = stop_recorders.send(true);
    for recorder in recorders {
        let _ = recorder.await;
    }
    tracing::info!("xmrx-node stopped");
    Ok(())
}

fn print_config(args: cli::ConfigArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let json = serde_json::to_string_pretty(&config).context("failed to render config")?;
    println!("{json}");
    Ok(())
}

fn print_version() {
    println!("xmrx-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol  {}", PROTOCOL_VERSION);
    println!("rustc     {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_path_gives_defaults() {
        assert_eq!(load_config(None).unwrap(), ProtocolConfig::default());
    }

    #[test]
    fn partial_config_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xmrx.json");
        std::fs::write(&path, r#"{ "unlock_confirmations": 4, "max_message_resends": 9 }"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.unlock_confirmations, 4);
        assert_eq!(config.max_message_resends, 9);
        assert_eq!(config.maker_fee_bps, ProtocolConfig::default().maker_fee_bps);
    }

    #[test]
    fn malformed_config_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ nope").unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));
    }

    #[test]
    fn cli_overrides_win() {
        let cli = XmrxNodeCli::try_parse_from([
            "xmrx-node",
            "run",
            "--step-time-limit-ms",
            "500",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let mut config = ProtocolConfig::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.step_time_limit_ms, 500);
        assert_eq!(config.unlock_confirmations, ProtocolConfig::default().unlock_confirmations);
    }
}
