//! Grid-search parameter sweep.
//!
//! One independent backtest per parameter combination over a fixed
//! six-dimension grid. Full trade/equity detail is retained only for the
//! best-N runs to bound memory; aggregate metrics survive for every
//! combination, and discarding detail cannot change them.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use tracing::{info, warn};

use super::{BacktestConfig, BacktestRun, ReplayEngine, RunMetrics};

/// Value lists per tunable dimension. An empty list pins the dimension to
/// the base config's value.
#[derive(Debug, Clone, Default)]
pub struct ParamGrid {
    pub min_entry_confidence: Vec<Decimal>,
    pub min_annualized_yield: Vec<Decimal>,
    pub ema_window: Vec<usize>,
    pub min_persistence: Vec<u32>,
    pub base_notional: Vec<Decimal>,
    pub max_multiplier: Vec<Decimal>,
}

impl ParamGrid {
    /// Cartesian product of all dimensions against the base config.
    pub fn combinations(&self, base: &BacktestConfig) -> Vec<ParamSet> {
        let confidences = or_base(&self.min_entry_confidence, base.engine.min_entry_confidence);
        let yields = or_base(&self.min_annualized_yield, base.engine.min_annualized_yield);
        let windows = or_base(&self.ema_window, base.engine.signal.ema_window);
        let persistences = or_base(&self.min_persistence, base.engine.min_persistence);
        let notionals = or_base(&self.base_notional, base.engine.sizer.base_notional);
        let multipliers = or_base(&self.max_multiplier, base.engine.sizer.max_multiplier);

        let mut combos = Vec::new();
        for &confidence in &confidences {
            for &min_yield in &yields {
                for &window in &windows {
                    for &persistence in &persistences {
                        for &notional in &notionals {
                            for &multiplier in &multipliers {
                                combos.push(ParamSet {
                                    min_entry_confidence: confidence,
                                    min_annualized_yield: min_yield,
                                    ema_window: window,
                                    min_persistence: persistence,
                                    base_notional: notional,
                                    max_multiplier: multiplier,
                                });
                            }
                        }
                    }
                }
            }
        }
        combos
    }

    /// How many dimensions actually vary.
    pub fn active_dimensions(&self) -> usize {
        usize::from(self.min_entry_confidence.len() > 1)
            + usize::from(self.min_annualized_yield.len() > 1)
            + usize::from(self.ema_window.len() > 1)
            + usize::from(self.min_persistence.len() > 1)
            + usize::from(self.base_notional.len() > 1)
            + usize::from(self.max_multiplier.len() > 1)
    }
}

fn or_base<T: Copy>(values: &[T], base: T) -> Vec<T> {
    if values.is_empty() {
        vec![base]
    } else {
        values.to_vec()
    }
}

/// One point of the grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSet {
    pub min_entry_confidence: Decimal,
    pub min_annualized_yield: Decimal,
    pub ema_window: usize,
    pub min_persistence: u32,
    pub base_notional: Decimal,
    pub max_multiplier: Decimal,
}

impl ParamSet {
    pub fn apply(&self, config: &mut BacktestConfig) {
        config.engine.min_entry_confidence = self.min_entry_confidence;
        config.engine.min_annualized_yield = self.min_annualized_yield;
        config.engine.signal.ema_window = self.ema_window;
        config.engine.min_persistence = self.min_persistence;
        config.engine.sizer.base_notional = self.base_notional;
        config.engine.sizer.max_multiplier = self.max_multiplier;
    }

    /// Largest relative shift across dimensions versus `other`. Drives the
    /// walk-forward instability flag.
    pub fn max_shift_fraction(&self, other: &ParamSet) -> f64 {
        [
            relative_shift(self.min_entry_confidence, other.min_entry_confidence),
            relative_shift(self.min_annualized_yield, other.min_annualized_yield),
            relative_shift(
                Decimal::from(self.ema_window as u32),
                Decimal::from(other.ema_window as u32),
            ),
            relative_shift(
                Decimal::from(self.min_persistence),
                Decimal::from(other.min_persistence),
            ),
            relative_shift(self.base_notional, other.base_notional),
            relative_shift(self.max_multiplier, other.max_multiplier),
        ]
        .into_iter()
        .fold(0.0, f64::max)
    }
}

fn relative_shift(a: Decimal, b: Decimal) -> f64 {
    let denom = a.abs().max(b.abs());
    if denom.is_zero() {
        return 0.0;
    }
    ((a - b).abs() / denom).to_f64().unwrap_or(0.0)
}

/// Metric runs are ranked by, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankBy {
    Sharpe,
    NetProfit,
}

impl RankBy {
    fn key(&self, metrics: &RunMetrics) -> f64 {
        match self {
            Self::Sharpe => metrics.sharpe,
            Self::NetProfit => metrics.net_profit.to_f64().unwrap_or(f64::MIN),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub base: BacktestConfig,
    pub grid: ParamGrid,
    /// Runs beyond the best-N are compacted to metrics only.
    pub keep_best: usize,
    pub rank_by: RankBy,
}

/// One combination's result. A failed run keeps its parameters and the
/// error string; the rest of the sweep is unaffected.
#[derive(Debug)]
pub struct SweepEntry {
    pub params: ParamSet,
    pub outcome: Result<BacktestRun, String>,
}

impl SweepEntry {
    pub fn metrics(&self) -> Option<&RunMetrics> {
        self.outcome.as_ref().ok().map(|run| &run.metrics)
    }
}

#[derive(Debug)]
pub struct SweepResult {
    /// Best first; failed entries sort last.
    pub entries: Vec<SweepEntry>,
    pub rank_by: RankBy,
}

impl SweepResult {
    pub fn best(&self) -> Option<&SweepEntry> {
        self.entries.first().filter(|e| e.outcome.is_ok())
    }
}

/// Run the whole grid sequentially. Per-combination failures are isolated;
/// cancellation is honored between simulated periods via the shared flag.
pub async fn run_sweep(
    engine: &ReplayEngine,
    config: &SweepConfig,
    cancel: &AtomicBool,
) -> SweepResult {
    let combos = config.grid.combinations(&config.base);
    info!(
        combinations = combos.len(),
        dimensions = config.grid.active_dimensions(),
        keep_best = config.keep_best,
        "Parameter sweep started"
    );

    let mut entries: Vec<SweepEntry> = Vec::with_capacity(combos.len());
    for params in combos {
        let mut run_config = config.base.clone();
        params.apply(&mut run_config);
        let outcome = engine
            .run_cancellable(&run_config, cancel)
            .await
            .map_err(|e| e.to_string());
        if let Err(reason) = &outcome {
            warn!(params = ?params, reason = %reason, "Sweep combination failed");
        }
        entries.push(SweepEntry { params, outcome });
    }

    // Rank best-first; failures last.
    entries.sort_by(|a, b| {
        match (a.metrics(), b.metrics()) {
            (Some(ma), Some(mb)) => config
                .rank_by
                .key(mb)
                .partial_cmp(&config.rank_by.key(ma))
                .unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
    });

    // Discard detail beyond the best-N. Aggregate metrics are untouched.
    for entry in entries.iter_mut().skip(config.keep_best.max(1)) {
        if let Ok(run) = entry.outcome.as_mut() {
            run.compact();
        }
    }

    SweepResult {
        entries,
        rank_by: config.rank_by,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_config() -> BacktestConfig {
        BacktestConfig::new(vec!["BTCUSDT".to_string()], 0, 1)
    }

    #[test]
    fn test_empty_grid_yields_single_base_combination() {
        let grid = ParamGrid::default();
        let combos = grid.combinations(&base_config());
        assert_eq!(combos.len(), 1);
        assert_eq!(grid.active_dimensions(), 0);
    }

    #[test]
    fn test_cartesian_product_size() {
        let grid = ParamGrid {
            min_entry_confidence: vec![dec!(0.4), dec!(0.6)],
            ema_window: vec![3, 5, 7],
            min_persistence: vec![1, 2],
            ..ParamGrid::default()
        };
        assert_eq!(grid.combinations(&base_config()).len(), 12);
        assert_eq!(grid.active_dimensions(), 3);
    }

    #[test]
    fn test_param_apply() {
        let params = ParamSet {
            min_entry_confidence: dec!(0.7),
            min_annualized_yield: dec!(0.2),
            ema_window: 7,
            min_persistence: 4,
            base_notional: dec!(2500),
            max_multiplier: dec!(2),
        };
        let mut config = base_config();
        params.apply(&mut config);
        assert_eq!(config.engine.min_entry_confidence, dec!(0.7));
        assert_eq!(config.engine.signal.ema_window, 7);
        assert_eq!(config.engine.sizer.base_notional, dec!(2500));
    }

    #[test]
    fn test_shift_fraction() {
        let a = ParamSet {
            min_entry_confidence: dec!(0.5),
            min_annualized_yield: dec!(0.1),
            ema_window: 5,
            min_persistence: 2,
            base_notional: dec!(1000),
            max_multiplier: dec!(3),
        };
        let mut b = a.clone();
        assert_eq!(a.max_shift_fraction(&b), 0.0);

        // Halving the confidence threshold is a 50% shift.
        b.min_entry_confidence = dec!(0.25);
        assert!((a.max_shift_fraction(&b) - 0.5).abs() < 1e-9);
    }
}
