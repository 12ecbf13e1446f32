//! Walk-forward validation.
//!
//! Rolling (train, test) folds over the backtest range: parameters are
//! optimized on each train window, only the test-window performance is
//! recorded, and folds whose optimum shifts sharply from the previous
//! fold's are flagged unstable — the classic overfit tell.

use rust_decimal::Decimal;
use std::sync::atomic::AtomicBool;
use tracing::{info, warn};

use super::sweep::{run_sweep, ParamGrid, ParamSet, RankBy, SweepConfig};
use super::{BacktestConfig, BacktestError, ReplayEngine, RunMetrics};

#[derive(Debug, Clone)]
pub struct WalkForwardConfig {
    /// Full range; fold windows are carved out of it.
    pub base: BacktestConfig,
    pub grid: ParamGrid,
    pub train_ms: i64,
    pub test_ms: i64,
    pub rank_by: RankBy,
    /// A fold is unstable when any optimal parameter shifts by more than
    /// this fraction versus the previous fold.
    pub max_param_shift: f64,
}

impl WalkForwardConfig {
    pub fn new(base: BacktestConfig, grid: ParamGrid, train_ms: i64, test_ms: i64) -> Self {
        Self {
            base,
            grid,
            train_ms,
            test_ms,
            rank_by: RankBy::Sharpe,
            max_param_shift: 0.5,
        }
    }
}

#[derive(Debug)]
pub struct FoldResult {
    pub fold: usize,
    pub train_range: (i64, i64),
    pub test_range: (i64, i64),
    pub best_params: ParamSet,
    pub train_metrics: RunMetrics,
    /// Out-of-sample performance — the only number that counts.
    pub test_outcome: Result<RunMetrics, String>,
    /// Parameter shift versus the previous fold's optimum.
    pub param_shift: f64,
    pub unstable: bool,
}

#[derive(Debug)]
pub struct WalkForwardReport {
    pub folds: Vec<FoldResult>,
    /// True when any adjacent fold pair exceeded the shift threshold.
    pub unstable: bool,
    pub total_test_net_profit: Decimal,
}

/// Run walk-forward validation. Folds advance by the test window; a fold
/// whose train sweep produces no valid run is an error entry, not an abort.
pub async fn run_walk_forward(
    engine: &ReplayEngine,
    config: &WalkForwardConfig,
    cancel: &AtomicBool,
) -> Result<WalkForwardReport, BacktestError> {
    let mut folds = Vec::new();
    let mut previous_best: Option<ParamSet> = None;
    let mut fold_index = 0;
    let mut train_start = config.base.start_ms;

    while train_start + config.train_ms + config.test_ms <= config.base.end_ms {
        let train_end = train_start + config.train_ms;
        let test_end = train_end + config.test_ms;

        // Ranges are inclusive; the boundary settlement belongs to the test
        // window only.
        let train_base = BacktestConfig {
            start_ms: train_start,
            end_ms: train_end - 1,
            ..config.base.clone()
        };
        let sweep = run_sweep(
            engine,
            &SweepConfig {
                base: train_base,
                grid: config.grid.clone(),
                keep_best: 1,
                rank_by: config.rank_by,
            },
            cancel,
        )
        .await;

        let best = sweep.best().and_then(|b| {
            b.metrics().map(|m| (b.params.clone(), m.clone()))
        });
        let Some((best_params, train_metrics)) = best else {
            warn!(
                fold = fold_index,
                train_start, train_end, "No valid train run in fold; skipping"
            );
            train_start += config.test_ms;
            fold_index += 1;
            continue;
        };

        let mut test_config = BacktestConfig {
            start_ms: train_end,
            end_ms: test_end - 1,
            ..config.base.clone()
        };
        best_params.apply(&mut test_config);
        let test_outcome = engine
            .run_cancellable(&test_config, cancel)
            .await
            .map(|run| run.metrics)
            .map_err(|e| e.to_string());

        let param_shift = previous_best
            .as_ref()
            .map(|prev| best_params.max_shift_fraction(prev))
            .unwrap_or(0.0);
        let unstable = param_shift > config.max_param_shift;
        if unstable {
            warn!(
                fold = fold_index,
                shift = param_shift,
                threshold = config.max_param_shift,
                "Optimal parameters shifted sharply between folds"
            );
        }

        folds.push(FoldResult {
            fold: fold_index,
            train_range: (train_start, train_end),
            test_range: (train_end, test_end),
            best_params: best_params.clone(),
            train_metrics,
            test_outcome,
            param_shift,
            unstable,
        });

        previous_best = Some(best_params);
        train_start += config.test_ms;
        fold_index += 1;
    }

    let unstable = folds.iter().any(|f| f.unstable);
    let total_test_net_profit = folds
        .iter()
        .filter_map(|f| f.test_outcome.as_ref().ok())
        .map(|m| m.net_profit)
        .sum();

    info!(
        folds = folds.len(),
        unstable,
        total_test_net_profit = %total_test_net_profit,
        "Walk-forward validation complete"
    );

    Ok(WalkForwardReport {
        folds,
        unstable,
        total_test_net_profit,
    })
}
