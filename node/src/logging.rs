//! Log setup for the node.
//!
//! Every settlement event the protocol crate emits (trade transitions,
//! payout checks, dispute traffic) is a structured `tracing` event keyed by
//! `trade_id`. This module only decides where those go: stderr, as colored
//! text for an operator at a terminal or as JSON lines for a collector.
//!
//! Filtering reads `XMRX_LOG` first, then `RUST_LOG`, then `--log-level`.
//! `XMRX_LOG` exists so a node can be tuned without touching the filter of
//! other Rust tools sharing the environment:
//!
//! ```text
//! XMRX_LOG=info,xmrx_protocol::trade=debug,xmrx_protocol::dispute=trace
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::LogFormatArg;

/// Node-specific filter variable, checked before `RUST_LOG`.
pub const LOG_ENV: &str = "XMRX_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Picks the filter directives: the first non-empty of `XMRX_LOG`,
/// `RUST_LOG` and the CLI level.
fn directives(node_env: Option<String>, rust_env: Option<String>, default_level: &str) -> String {
    [node_env, rust_env]
        .into_iter()
        .flatten()
        .find(|d| !d.trim().is_empty())
        .unwrap_or_else(|| default_level.to_string())
}

/// Installs the global subscriber. Must run once, before the runtime
/// starts; a second call panics.
pub fn init_logging(default_level: &str, format: LogFormat) {
    let chosen = directives(
        std::env::var(LOG_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        default_level,
    );
    let (filter, rejected) = match EnvFilter::try_new(&chosen) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new(default_level), Some(e.to_string())),
    };

    // Exactly one of the two layers is present.
    let pretty = (format == LogFormat::Pretty).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(true)
            .with_line_number(true)
    });
    let json = (format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(false)
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .init();

    match rejected {
        Some(error) => tracing::warn!(directives = %chosen, %error, "bad log filter, using --log-level"),
        None => tracing::debug!(directives = %chosen, ?format, "logging ready"),
    }
}
