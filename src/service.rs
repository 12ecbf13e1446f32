//! Dashboard/API boundary.
//!
//! The core is a library; this is the surface the (excluded) web layer
//! consumes: read-only snapshots of scores, positions, and PnL, plus
//! non-blocking commands. Backtests and sweeps run in isolated worker
//! tasks with their own executor and store-view instances — they never
//! share mutable state with the live book — and results are retrieved
//! asynchronously by an opaque run id valid for the process lifetime.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backtest::{
    run_sweep, run_walk_forward, BacktestConfig, BacktestError, BacktestRun, MultiSymbolReport,
    ReplayEngine, SweepConfig, SweepResult, WalkForwardConfig, WalkForwardReport,
};
use crate::engine::book::{Position, Trade};
use crate::engine::{BookReconciler, Orchestrator, ReconcilerConfig};
use crate::executor::Executor;
use crate::signal::OpportunityScore;
use crate::store::HistoricalStore;

/// Lifecycle of a submitted run.
#[derive(Debug, Clone)]
pub enum RunStatus {
    Running { cancel: Arc<AtomicBool> },
    Completed(Arc<RunOutput>),
    Failed(String),
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running { .. })
    }
}

#[derive(Debug)]
pub enum RunOutput {
    Backtest(BacktestRun),
    Sweep(SweepResult),
    WalkForward(WalkForwardReport),
    MultiSymbol(MultiSymbolReport),
}

/// Open-position and realized-PnL summary for the dashboard.
#[derive(Debug, Clone)]
pub struct PnlSummary {
    pub realized_pnl: Decimal,
    pub unrealized_funding: Decimal,
    pub open_positions: usize,
    pub closed_trades: usize,
}

pub struct TradingService {
    replay: ReplayEngine,
    orchestrator: Option<Arc<Orchestrator>>,
    live_executor: Option<Arc<dyn Executor>>,
    reconciler_config: ReconcilerConfig,
    runs: Arc<DashMap<Uuid, RunStatus>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl TradingService {
    /// Research-only service: backtests and sweeps, no live loop.
    pub fn research_only(store: Arc<HistoricalStore>) -> Self {
        Self {
            replay: ReplayEngine::new(store),
            orchestrator: None,
            live_executor: None,
            reconciler_config: ReconcilerConfig::default(),
            runs: Arc::new(DashMap::new()),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Full service around a live (or paper) orchestrator.
    pub fn with_orchestrator(
        store: Arc<HistoricalStore>,
        orchestrator: Arc<Orchestrator>,
        executor: Arc<dyn Executor>,
        reconciler_config: ReconcilerConfig,
    ) -> Self {
        Self {
            replay: ReplayEngine::new(store),
            orchestrator: Some(orchestrator),
            live_executor: Some(executor),
            reconciler_config,
            runs: Arc::new(DashMap::new()),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Start the live loop and the periodic reconciliation task.
    pub fn start(&self) -> bool {
        let Some(orchestrator) = self.orchestrator.clone() else {
            warn!("start() called on a research-only service");
            return false;
        };
        let Some(executor) = self.live_executor.clone() else {
            return false;
        };

        let reconciler = Arc::new(BookReconciler::new(
            orchestrator.book(),
            executor,
            self.reconciler_config.clone(),
            orchestrator.reconcile_flag(),
        ));
        let stop = orchestrator.emergency_stop();

        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        tasks.push(reconciler.spawn(stop));
        tasks.push(tokio::spawn(async move {
            orchestrator.run().await;
        }));
        info!("Trading service started");
        true
    }

    /// Graceful stop: the current cycle finishes, no new one starts.
    pub fn stop(&self) {
        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.emergency_stop().trigger();
            info!("Stop requested");
        }
    }

    /// Emergency stop: identical mechanics — in-flight executor calls
    /// complete, nothing new starts — surfaced loudly.
    pub fn emergency_stop(&self) {
        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.emergency_stop().trigger();
        }
        // Backtest workers observe cancellation at their next period.
        for entry in self.runs.iter() {
            if let RunStatus::Running { cancel } = entry.value() {
                cancel.store(true, Ordering::SeqCst);
            }
        }
        warn!("EMERGENCY STOP: live loop halting, runs cancelled");
    }

    pub fn submit_backtest(&self, config: BacktestConfig) -> Uuid {
        let replay = self.replay.clone();
        self.spawn_run(move |cancel| async move {
            replay
                .run_cancellable(&config, &cancel)
                .await
                .map(RunOutput::Backtest)
        })
    }

    pub fn submit_sweep(&self, config: SweepConfig) -> Uuid {
        let replay = self.replay.clone();
        self.spawn_run(move |cancel| async move {
            Ok(RunOutput::Sweep(run_sweep(&replay, &config, &cancel).await))
        })
    }

    pub fn submit_walk_forward(&self, config: WalkForwardConfig) -> Uuid {
        let replay = self.replay.clone();
        self.spawn_run(move |cancel| async move {
            run_walk_forward(&replay, &config, &cancel)
                .await
                .map(RunOutput::WalkForward)
        })
    }

    pub fn submit_multi_symbol(&self, config: BacktestConfig) -> Uuid {
        let replay = self.replay.clone();
        self.spawn_run(move |cancel| async move {
            Ok(RunOutput::MultiSymbol(
                replay.run_multi_symbol(&config, &cancel).await,
            ))
        })
    }

    fn spawn_run<F, Fut>(&self, job: F) -> Uuid
    where
        F: FnOnce(Arc<AtomicBool>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<RunOutput, BacktestError>> + Send + 'static,
    {
        let run_id = Uuid::new_v4();
        let cancel = Arc::new(AtomicBool::new(false));
        self.runs.insert(
            run_id,
            RunStatus::Running {
                cancel: Arc::clone(&cancel),
            },
        );

        let runs = Arc::clone(&self.runs);
        let handle = tokio::spawn(async move {
            let status = match job(Arc::clone(&cancel)).await {
                Ok(output) => RunStatus::Completed(Arc::new(output)),
                Err(BacktestError::Cancelled) => RunStatus::Cancelled,
                Err(e) => RunStatus::Failed(e.to_string()),
            };
            runs.insert(run_id, status);
        });
        self.tasks.lock().expect("tasks lock poisoned").push(handle);
        info!(run_id = %run_id, "Run submitted");
        run_id
    }

    pub fn run_status(&self, run_id: &Uuid) -> Option<RunStatus> {
        self.runs.get(run_id).map(|entry| entry.value().clone())
    }

    /// Request cancellation; the worker observes it at its next simulated
    /// period. Returns false for unknown or already-terminal runs.
    pub fn cancel_run(&self, run_id: &Uuid) -> bool {
        match self.runs.get(run_id).map(|e| e.value().clone()) {
            Some(RunStatus::Running { cancel }) => {
                cancel.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Latest opportunity scores, including rejection reasons.
    pub fn scores(&self) -> Vec<OpportunityScore> {
        self.orchestrator
            .as_ref()
            .map(|o| o.scores())
            .unwrap_or_default()
    }

    pub async fn positions(&self) -> Vec<Position> {
        match &self.orchestrator {
            None => Vec::new(),
            Some(orchestrator) => {
                let book = orchestrator.book();
                let book = book.lock().await;
                book.positions().cloned().collect()
            }
        }
    }

    pub async fn trades(&self) -> Vec<Trade> {
        match &self.orchestrator {
            None => Vec::new(),
            Some(orchestrator) => {
                let book = orchestrator.book();
                let book = book.lock().await;
                book.trades().to_vec()
            }
        }
    }

    pub async fn pnl_summary(&self) -> PnlSummary {
        match &self.orchestrator {
            None => PnlSummary {
                realized_pnl: Decimal::ZERO,
                unrealized_funding: Decimal::ZERO,
                open_positions: 0,
                closed_trades: 0,
            },
            Some(orchestrator) => {
                let book = orchestrator.book();
                let book = book.lock().await;
                PnlSummary {
                    realized_pnl: book.realized_pnl(),
                    unrealized_funding: book.unrealized_funding(),
                    open_positions: book.len(),
                    closed_trades: book.trades().len(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FundingObservation, PriceKline};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    const HOUR: i64 = 3_600_000;

    fn seeded_store() -> Arc<HistoricalStore> {
        let store = Arc::new(HistoricalStore::new());
        for i in 1..=20 {
            store.put_funding(FundingObservation {
                symbol: "BTCUSDT".to_string(),
                timestamp_ms: i * 8 * HOUR,
                settled_rate: Some(dec!(0.0003)),
                predicted_rate: Some(dec!(0.0003)),
                interval_hours: 8,
                volume_24h: dec!(5000000),
            });
            for symbol in ["BTCUSDT".to_string(), crate::store::perp_symbol("BTCUSDT")] {
                store.put_kline(PriceKline {
                    symbol,
                    interval_minutes: 480,
                    open_time_ms: (i - 1) * 8 * HOUR,
                    open: dec!(100),
                    high: dec!(100),
                    low: dec!(100),
                    close: dec!(100),
                    volume: dec!(10),
                });
            }
        }
        store
    }

    #[tokio::test]
    async fn test_submit_backtest_completes_asynchronously() {
        let service = TradingService::research_only(seeded_store());
        let config = BacktestConfig::new(vec!["BTCUSDT".to_string()], 0, 200 * HOUR);
        let run_id = service.submit_backtest(config);

        // Submission never blocks on the run itself.
        let mut status = service.run_status(&run_id).unwrap();
        for _ in 0..100 {
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = service.run_status(&run_id).unwrap();
        }
        match status {
            RunStatus::Completed(output) => match output.as_ref() {
                RunOutput::Backtest(run) => assert!(run.ticks > 0),
                other => panic!("expected backtest output, got {other:?}"),
            },
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_run_id() {
        let service = TradingService::research_only(seeded_store());
        assert!(service.run_status(&Uuid::new_v4()).is_none());
        assert!(!service.cancel_run(&Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_research_only_snapshots_empty() {
        let service = TradingService::research_only(seeded_store());
        assert!(service.scores().is_empty());
        assert!(service.positions().await.is_empty());
        assert_eq!(service.pnl_summary().await.open_positions, 0);
        assert!(!service.start());
    }
}
