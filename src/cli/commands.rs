//! Research command handlers.
//!
//! Each handler assembles a store, runs the replay machinery, logs a
//! summary, and writes a results JSON for CI consumption.

use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use tracing::{error, info, warn};

use super::config::{parse_decimal_grid, parse_usize_grid, BacktestCliConfig};
use crate::backtest::{
    run_sweep, run_walk_forward, ParamGrid, RankBy, ReplayEngine, SweepConfig, WalkForwardConfig,
};

const HOUR: i64 = 3_600_000;

#[derive(Debug, Serialize)]
struct BacktestOutput {
    symbols: Vec<String>,
    days: u32,
    ticks: usize,
    initial_capital: String,
    final_capital: String,
    net_profit: String,
    return_pct: String,
    sharpe: f64,
    max_drawdown_pct: f64,
    total_trades: u32,
    win_rate_pct: f64,
    total_funding: String,
    total_fees: String,
    gap_flagged: bool,
}

/// Run the `backtest` subcommand.
pub async fn run_backtest_command(
    config: BacktestCliConfig,
    per_symbol: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("--- Running Backtest ---");
    let store = config.build_store()?;
    let engine = ReplayEngine::new(store);
    let bt_config = config.to_backtest_config();

    if per_symbol {
        let cancel = AtomicBool::new(false);
        let report = engine.run_multi_symbol(&bt_config, &cancel).await;
        info!(
            completed = report.completed,
            failed = report.failed,
            total_net_profit = %report.total_net_profit,
            "--- Multi-Symbol Results ---"
        );
        for entry in &report.results {
            match &entry.outcome {
                Ok(run) => info!(
                    symbol = %entry.symbol,
                    net_profit = %run.metrics.net_profit,
                    trades = run.metrics.total_trades,
                    gap_flagged = run.gap_flagged,
                    "Symbol complete"
                ),
                Err(reason) => warn!(symbol = %entry.symbol, reason = %reason, "Symbol failed"),
            }
        }
        return Ok(());
    }

    let run = engine.run(&bt_config).await?;
    let metrics = &run.metrics;

    info!("--- Backtest Results ---");
    info!("Initial Capital: ${}", metrics.initial_equity);
    info!("Final Capital:   ${}", metrics.final_equity);
    info!("Net Profit:      ${}", metrics.net_profit);
    info!("Return:          {}%", metrics.return_pct);
    info!("Sharpe:          {:.3}", metrics.sharpe);
    info!("Max Drawdown:    {:.2}%", metrics.max_drawdown_pct);
    info!("Total Trades:    {}", metrics.total_trades);
    info!("Win Rate:        {:.1}%", metrics.win_rate * 100.0);
    info!("Funding Earned:  ${}", metrics.total_funding);
    info!("Fees Paid:       ${}", metrics.total_fees);
    if run.gap_flagged {
        warn!(gaps = ?run.gaps, "Funding data had gaps; results are partial");
    }
    info!("------------------------");

    let output = BacktestOutput {
        symbols: run.symbols.clone(),
        days: config.days,
        ticks: run.ticks,
        initial_capital: metrics.initial_equity.to_string(),
        final_capital: metrics.final_equity.to_string(),
        net_profit: metrics.net_profit.to_string(),
        return_pct: metrics.return_pct.to_string(),
        sharpe: metrics.sharpe,
        max_drawdown_pct: metrics.max_drawdown_pct,
        total_trades: metrics.total_trades,
        win_rate_pct: metrics.win_rate * 100.0,
        total_funding: metrics.total_funding.to_string(),
        total_fees: metrics.total_fees.to_string(),
        gap_flagged: run.gap_flagged,
    };
    write_output(&config.output_dir, "results.json", &output)?;
    Ok(())
}

/// Run the `sweep` subcommand.
pub async fn run_sweep_command(
    config: BacktestCliConfig,
    confidence_grid: &str,
    ema_grid: &str,
    keep_best: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("--- Running Parameter Sweep ---");
    let store = config.build_store()?;
    let engine = ReplayEngine::new(store);

    let grid = ParamGrid {
        min_entry_confidence: parse_decimal_grid(confidence_grid)?,
        ema_window: parse_usize_grid(ema_grid)?,
        ..ParamGrid::default()
    };
    let sweep_config = SweepConfig {
        base: config.to_backtest_config(),
        grid,
        keep_best,
        rank_by: RankBy::Sharpe,
    };

    let cancel = AtomicBool::new(false);
    let result = run_sweep(&engine, &sweep_config, &cancel).await;

    info!("--- Sweep Results (best first) ---");
    for entry in result.entries.iter().take(10) {
        match entry.metrics() {
            Some(metrics) => info!(
                confidence = %entry.params.min_entry_confidence,
                ema_window = entry.params.ema_window,
                sharpe = metrics.sharpe,
                net_profit = %metrics.net_profit,
                trades = metrics.total_trades,
                "Combination"
            ),
            None => error!(params = ?entry.params, "Combination failed"),
        }
    }

    if let Some(best) = result.best() {
        let summary = SweepOutput {
            combinations: result.entries.len(),
            best_params: best.params.clone(),
            best_sharpe: best.metrics().map(|m| m.sharpe).unwrap_or(0.0),
            best_net_profit: best
                .metrics()
                .map(|m| m.net_profit.to_string())
                .unwrap_or_default(),
        };
        write_output(&config.output_dir, "sweep.json", &summary)?;
    } else {
        warn!("No sweep combination completed successfully");
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct SweepOutput {
    combinations: usize,
    best_params: crate::backtest::ParamSet,
    best_sharpe: f64,
    best_net_profit: String,
}

/// Run the `walk-forward` subcommand.
pub async fn run_walk_forward_command(
    config: BacktestCliConfig,
    train_days: u32,
    test_days: u32,
    confidence_grid: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("--- Running Walk-Forward Validation ---");
    let store = config.build_store()?;
    let engine = ReplayEngine::new(store);

    let grid = ParamGrid {
        min_entry_confidence: parse_decimal_grid(confidence_grid)?,
        ..ParamGrid::default()
    };
    let wf_config = WalkForwardConfig::new(
        config.to_backtest_config(),
        grid,
        i64::from(train_days) * 24 * HOUR,
        i64::from(test_days) * 24 * HOUR,
    );

    let cancel = AtomicBool::new(false);
    let report = run_walk_forward(&engine, &wf_config, &cancel).await?;

    info!("--- Walk-Forward Results ---");
    for fold in &report.folds {
        match &fold.test_outcome {
            Ok(metrics) => info!(
                fold = fold.fold,
                confidence = %fold.best_params.min_entry_confidence,
                test_net_profit = %metrics.net_profit,
                param_shift = fold.param_shift,
                unstable = fold.unstable,
                "Fold"
            ),
            Err(reason) => error!(fold = fold.fold, reason = %reason, "Fold test failed"),
        }
    }
    info!(
        folds = report.folds.len(),
        unstable = report.unstable,
        total_test_net_profit = %report.total_test_net_profit,
        "Walk-forward summary"
    );
    if report.unstable {
        warn!("Optimal parameters are unstable across folds - likely overfit");
    }
    Ok(())
}

fn write_output<T: Serialize>(
    output_dir: &str,
    filename: &str,
    value: &T,
) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(output_dir)?;
    let path = Path::new(output_dir).join(filename);
    let mut file = File::create(&path)?;
    let json = serde_json::to_string_pretty(value)?;
    file.write_all(json.as_bytes())?;
    info!(path = %path.display(), "Results written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_backtest_command_with_synthetic_data() {
        let config = BacktestCliConfig {
            symbols: vec!["BTCUSDT".to_string()],
            days: 10,
            data: None,
            synthetic: true,
            initial_capital: dec!(10000),
            output_dir: std::env::temp_dir()
                .join("basisfarm_cli_test")
                .to_string_lossy()
                .to_string(),
        };
        run_backtest_command(config, false).await.unwrap();
    }

    #[test]
    fn test_decimal_grid_roundtrip() {
        let grid = parse_decimal_grid("0.25,0.75").unwrap();
        assert_eq!(grid.iter().copied().sum::<Decimal>(), dec!(1));
    }
}
