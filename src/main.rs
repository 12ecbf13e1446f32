use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use basisfarm::cli::{
    run_backtest_command, run_sweep_command, run_walk_forward_command, BacktestCliConfig, Cli,
    Commands,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.verbose.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Commands::Backtest {
            symbols,
            data,
            synthetic,
            days,
            initial_capital,
            output_dir,
            per_symbol,
        } => {
            match BacktestCliConfig::new(
                &symbols,
                days,
                data,
                synthetic,
                initial_capital,
                &output_dir,
            ) {
                Ok(config) => run_backtest_command(config, per_symbol).await,
                Err(e) => Err(e.into()),
            }
        }

        Commands::Sweep {
            symbols,
            data,
            synthetic,
            days,
            initial_capital,
            output_dir,
            confidence_grid,
            ema_grid,
            keep_best,
        } => {
            match BacktestCliConfig::new(
                &symbols,
                days,
                data,
                synthetic,
                initial_capital,
                &output_dir,
            ) {
                Ok(config) => {
                    run_sweep_command(config, &confidence_grid, &ema_grid, keep_best).await
                }
                Err(e) => Err(e.into()),
            }
        }

        Commands::WalkForward {
            symbols,
            data,
            synthetic,
            days,
            initial_capital,
            train_days,
            test_days,
            confidence_grid,
        } => {
            match BacktestCliConfig::new(
                &symbols,
                days,
                data,
                synthetic,
                initial_capital,
                "backtest_results",
            ) {
                Ok(config) => {
                    run_walk_forward_command(config, train_days, test_days, &confidence_grid).await
                }
                Err(e) => Err(e.into()),
            }
        }
    };

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        std::process::exit(1);
    }
}
