//! CLI argument parsing using clap.
//!
//! Thin consumer of the core library: research commands run against a
//! JSON data file or deterministic synthetic data. Live trading embeds the
//! library with a venue gateway and is not wired here.

mod commands;
mod config;

pub use commands::{run_backtest_command, run_sweep_command, run_walk_forward_command};
pub use config::{BacktestCliConfig, CliConfigError};

use clap::{Parser, Subcommand};

/// basisfarm - delta-neutral funding-rate harvester
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Set the verbosity level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub verbose: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay a backtest over historical funding data
    Backtest {
        /// Symbols to trade (comma-separated, e.g. "BTCUSDT,ETHUSDT")
        #[arg(long, default_value = "BTCUSDT")]
        symbols: String,
        /// Path to a persisted store JSON file
        #[arg(long)]
        data: Option<String>,
        /// Generate deterministic synthetic data instead of loading a file
        #[arg(long, default_value_t = false)]
        synthetic: bool,
        /// Days of history to replay
        #[arg(long, default_value_t = 30)]
        days: u32,
        /// Initial capital in USD
        #[arg(long, default_value_t = 10000.0)]
        initial_capital: f64,
        /// Output directory for results JSON
        #[arg(long, default_value = "backtest_results")]
        output_dir: String,
        /// Run each symbol separately and compare
        #[arg(long, default_value_t = false)]
        per_symbol: bool,
    },

    /// Grid-search engine parameters over a backtest range
    Sweep {
        #[arg(long, default_value = "BTCUSDT")]
        symbols: String,
        #[arg(long)]
        data: Option<String>,
        #[arg(long, default_value_t = false)]
        synthetic: bool,
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long, default_value_t = 10000.0)]
        initial_capital: f64,
        #[arg(long, default_value = "backtest_results")]
        output_dir: String,
        /// Confidence thresholds to try (comma-separated)
        #[arg(long, default_value = "0.3,0.5,0.7")]
        confidence_grid: String,
        /// EMA windows to try (comma-separated, 3-9)
        #[arg(long, default_value = "3,5,7")]
        ema_grid: String,
        /// Keep full detail for the best N runs
        #[arg(long, default_value_t = 3)]
        keep_best: usize,
    },

    /// Walk-forward validation with per-fold re-optimization
    WalkForward {
        #[arg(long, default_value = "BTCUSDT")]
        symbols: String,
        #[arg(long)]
        data: Option<String>,
        #[arg(long, default_value_t = false)]
        synthetic: bool,
        #[arg(long, default_value_t = 90)]
        days: u32,
        #[arg(long, default_value_t = 10000.0)]
        initial_capital: f64,
        /// Train window length in days
        #[arg(long, default_value_t = 21)]
        train_days: u32,
        /// Test window length in days
        #[arg(long, default_value_t = 7)]
        test_days: u32,
        #[arg(long, default_value = "0.3,0.5,0.7")]
        confidence_grid: String,
    },
}
