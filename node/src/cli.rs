//! # CLI Interface
//!
//! Command-line arguments for `xmrx-node`, via `clap` derive. Three
//! subcommands: `run`, `config` and `version`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// XMRX settlement node.
///
/// Runs a maker, a taker and an arbitrator in one process over an
/// in-memory network and a simulated Monero chain, and serves an HTTP API
/// to drive and inspect their trades.
#[derive(Parser, Debug)]
#[command(
    name = "xmrx-node",
    about = "XMRX settlement node with a local three-party sandbox",
    version,
    propagate_version = true
)]
pub struct XmrxNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the sandbox and serve the API.
    Run(RunArgs),
    /// Print the effective protocol configuration as JSON and exit.
    Config(ConfigArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Protocol configuration file (JSON). Missing fields take their
    /// defaults.
    #[arg(long, short = 'c', env = "XMRX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for the parties' sled stores. Without it, state lives in
    /// memory and is gone on exit.
    #[arg(long, short = 'd', env = "XMRX_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Port for the HTTP API.
    #[arg(long, env = "XMRX_API_PORT", default_value_t = 9841)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "XMRX_METRICS_PORT", default_value_t = 9842)]
    pub metrics_port: u16,

    /// Milliseconds between simulated blocks.
    #[arg(long, env = "XMRX_BLOCK_INTERVAL_MS", default_value_t = 1_000)]
    pub block_interval_ms: u64,

    /// Whole XMR credited to the maker and the taker at startup.
    #[arg(long, env = "XMRX_FUND_XMR", default_value_t = 100)]
    pub fund_xmr: u64,

    /// Overrides `step_time_limit_ms` from the config file.
    #[arg(long, env = "XMRX_STEP_TIME_LIMIT_MS")]
    pub step_time_limit_ms: Option<u64>,

    /// Overrides `unlock_confirmations` from the config file.
    #[arg(long, env = "XMRX_UNLOCK_CONFIRMATIONS")]
    pub unlock_confirmations: Option<u64>,

    /// Default log filter when neither `XMRX_LOG` nor `RUST_LOG` is set.
    #[arg(long, env = "XMRX_LOG", default_value = "xmrx_node=info,xmrx_protocol=info")]
    pub log_level: String,

    #[arg(long, value_enum, env = "XMRX_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormatArg,
}

/// Arguments for the `config` subcommand.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Configuration file to merge over the defaults before printing.
    #[arg(long, short = 'c', env = "XMRX_CONFIG")]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        XmrxNodeCli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = XmrxNodeCli::try_parse_from(["xmrx-node", "run"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.api_port, 9841);
        assert_eq!(args.log_format, LogFormatArg::Pretty);
        assert!(args.data_dir.is_none());
    }

    #[test]
    fn run_overrides() {
        let cli = XmrxNodeCli::try_parse_from([
            "xmrx-node",
            "run",
            "--log-format",
            "json",
            "--unlock-confirmations",
            "3",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.log_format, LogFormatArg::Json);
        assert_eq!(args.unlock_confirmations, Some(3));
    }
}
