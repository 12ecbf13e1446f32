//! Backtest / Replay Engine
//!
//! Drives the *same* orchestrator as live trading, one decision cycle per
//! historical settlement instant, against a store view pinned to the replay
//! clock. Look-ahead prevention is structural: the backtest executor and
//! market provider are constructed from the `as_of` view and nothing else,
//! so decision code cannot reach data the simulated moment had not
//! published.

pub mod metrics;
pub mod sweep;
pub mod walkforward;

pub use metrics::{EquityPoint, RunMetrics};
pub use sweep::{run_sweep, ParamGrid, ParamSet, RankBy, SweepConfig, SweepEntry, SweepResult};
pub use walkforward::{run_walk_forward, FoldResult, WalkForwardConfig, WalkForwardReport};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::book::Trade;
use crate::engine::{CycleError, EngineConfig, Orchestrator, ReplayMarketData};
use crate::executor::{BacktestExecutor, CostModel, Executor};
use crate::store::{Gap, HistoricalStore};
use crate::types::ExchangeConstraints;

use metrics::compute_metrics;

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("no settlement data for {symbols:?} in [{start_ms}, {end_ms}]")]
    NoData {
        symbols: Vec<String>,
        start_ms: i64,
        end_ms: i64,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("cycle failed at tick {tick_ms}: {source}")]
    Cycle {
        tick_ms: i64,
        #[source]
        source: CycleError,
    },

    #[error("end-of-run close failed for {symbol}: {reason}")]
    FinalClose { symbol: String, reason: String },
}

/// One backtest's full configuration: the engine parameters plus the
/// replay range and simulation costs.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub symbols: Vec<String>,
    pub start_ms: i64,
    pub end_ms: i64,
    pub initial_balance: Decimal,
    pub engine: EngineConfig,
    pub costs: CostModel,
    pub constraints: ExchangeConstraints,
}

impl BacktestConfig {
    pub fn new(symbols: Vec<String>, start_ms: i64, end_ms: i64) -> Self {
        Self {
            symbols,
            start_ms,
            end_ms,
            initial_balance: dec!(10000),
            engine: EngineConfig::default(),
            costs: CostModel::default(),
            constraints: ExchangeConstraints::default(),
        }
    }
}

/// Immutable result of one replay. Detail (equity curve, trades) can be
/// compacted away to bound sweep memory; metrics always survive.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestRun {
    pub run_id: String,
    pub symbols: Vec<String>,
    pub start_ms: i64,
    pub end_ms: i64,
    pub ticks: usize,
    pub metrics: RunMetrics,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Trade>,
    /// Funding-series holes per symbol, surfaced rather than interpolated.
    pub gaps: HashMap<String, Vec<Gap>>,
    pub gap_flagged: bool,
    pub compacted: bool,
}

impl BacktestRun {
    /// Drop trade/equity detail, keeping aggregate metrics. Used for
    /// non-best sweep runs; by construction it cannot change `metrics`.
    pub fn compact(&mut self) {
        self.equity_curve = Vec::new();
        self.trades = Vec::new();
        self.compacted = true;
    }
}

/// Replays historical data through the orchestrator.
#[derive(Clone)]
pub struct ReplayEngine {
    store: Arc<HistoricalStore>,
}

impl ReplayEngine {
    pub fn new(store: Arc<HistoricalStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<HistoricalStore> {
        &self.store
    }

    /// Run a backtest to completion.
    pub async fn run(&self, config: &BacktestConfig) -> Result<BacktestRun, BacktestError> {
        let never = AtomicBool::new(false);
        self.run_cancellable(config, &never).await
    }

    /// Run with cooperative cancellation, checked once per simulated
    /// period, never mid-cycle.
    pub async fn run_cancellable(
        &self,
        config: &BacktestConfig,
        cancel: &AtomicBool,
    ) -> Result<BacktestRun, BacktestError> {
        let ticks =
            self.store
                .settlement_ticks(&config.symbols, config.start_ms, config.end_ms);
        if ticks.is_empty() {
            return Err(BacktestError::NoData {
                symbols: config.symbols.clone(),
                start_ms: config.start_ms,
                end_ms: config.end_ms,
            });
        }

        let mut gaps: HashMap<String, Vec<Gap>> = HashMap::new();
        for symbol in &config.symbols {
            let series = self
                .store
                .query_funding(symbol, config.start_ms, config.end_ms);
            if series.has_gaps() {
                warn!(
                    symbol = %symbol,
                    missing_periods = series.missing_periods(),
                    "Funding series has gaps in backtest range"
                );
                gaps.insert(symbol.clone(), series.gaps);
            }
        }
        let gap_flagged = !gaps.is_empty();

        let executor = Arc::new(BacktestExecutor::new(
            &self.store,
            config.start_ms,
            config.initial_balance,
            config.costs,
            config.constraints.clone(),
        ));
        let market = Arc::new(ReplayMarketData::new(executor.view().clone()));
        let engine_config = EngineConfig {
            symbols: config.symbols.clone(),
            ..config.engine.clone()
        };
        let orchestrator = Orchestrator::new(
            engine_config,
            market,
            Arc::clone(&executor) as Arc<dyn Executor>,
            Arc::new(executor.replay_clock()),
        );

        info!(
            symbols = ?config.symbols,
            ticks = ticks.len(),
            start_ms = config.start_ms,
            end_ms = config.end_ms,
            "Backtest started"
        );

        let mut curve = Vec::with_capacity(ticks.len() + 1);
        for tick in &ticks {
            if cancel.load(Ordering::SeqCst) {
                return Err(BacktestError::Cancelled);
            }
            executor.advance_clock(*tick);
            let report = orchestrator
                .run_cycle()
                .await
                .map_err(|e| BacktestError::Cycle {
                    tick_ms: *tick,
                    source: e,
                })?;
            curve.push(EquityPoint {
                timestamp_ms: *tick,
                equity: report.equity,
            });
        }

        // Flatten anything still open so the final equity is realized.
        let end_tick = *ticks.last().expect("ticks non-empty");
        let book = orchestrator.book();
        let mut book = book.lock().await;
        for symbol in book.symbols() {
            let fill = executor
                .close(&symbol)
                .await
                .map_err(|e| BacktestError::FinalClose {
                    symbol: symbol.clone(),
                    reason: e.to_string(),
                })?;
            book.close_with_fills(&symbol, &fill.spot, &fill.perp, "end of backtest", end_tick)
                .map_err(|e| BacktestError::FinalClose {
                    symbol: symbol.clone(),
                    reason: e.to_string(),
                })?;
        }
        let final_state = executor
            .account_state()
            .await
            .map_err(|e| BacktestError::FinalClose {
                symbol: "*".to_string(),
                reason: e.to_string(),
            })?;
        curve.push(EquityPoint {
            timestamp_ms: end_tick,
            equity: final_state.equity,
        });

        let trades = book.trades().to_vec();
        drop(book);

        let metrics = compute_metrics(config.initial_balance, &curve, &trades);
        info!(
            net_profit = %metrics.net_profit,
            trades = metrics.total_trades,
            sharpe = metrics.sharpe,
            "Backtest complete"
        );

        Ok(BacktestRun {
            run_id: Uuid::new_v4().to_string(),
            symbols: config.symbols.clone(),
            start_ms: config.start_ms,
            end_ms: config.end_ms,
            ticks: ticks.len(),
            metrics,
            equity_curve: curve,
            trades,
            gaps,
            gap_flagged,
            compacted: false,
        })
    }

    /// Run the identical configuration across symbols sequentially,
    /// isolating per-symbol failures: one symbol's bad data produces an
    /// error entry, not an aborted comparison.
    pub async fn run_multi_symbol(
        &self,
        config: &BacktestConfig,
        cancel: &AtomicBool,
    ) -> MultiSymbolReport {
        let mut results = Vec::with_capacity(config.symbols.len());
        for symbol in &config.symbols {
            if cancel.load(Ordering::SeqCst) {
                results.push(SymbolRunResult {
                    symbol: symbol.clone(),
                    outcome: Err("cancelled".to_string()),
                });
                continue;
            }
            let single = BacktestConfig {
                symbols: vec![symbol.clone()],
                ..config.clone()
            };
            let outcome = self
                .run_cancellable(&single, cancel)
                .await
                .map_err(|e| e.to_string());
            results.push(SymbolRunResult {
                symbol: symbol.clone(),
                outcome,
            });
        }

        let completed = results.iter().filter(|r| r.outcome.is_ok()).count();
        let total_net_profit = results
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok())
            .map(|run| run.metrics.net_profit)
            .sum();
        MultiSymbolReport {
            completed,
            failed: results.len() - completed,
            total_net_profit,
            results,
        }
    }
}

/// Per-symbol entry in a multi-symbol comparison.
#[derive(Debug)]
pub struct SymbolRunResult {
    pub symbol: String,
    pub outcome: Result<BacktestRun, String>,
}

#[derive(Debug)]
pub struct MultiSymbolReport {
    pub results: Vec<SymbolRunResult>,
    pub completed: usize,
    pub failed: usize,
    pub total_net_profit: Decimal,
}
