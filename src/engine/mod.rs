//! Orchestrator
//!
//! The stateful control loop. One decision cycle walks
//! SCANNING → ANALYZING → DECIDING → EXECUTING → MONITORING and either runs
//! to completion or surfaces a classified [`CycleError`]; the outer loop
//! then reconciles the book against the executor's authoritative account
//! view before recovering.
//!
//! # Concurrency
//!
//! A cycle holds the book's async lock for its whole duration, so two
//! cycles can never overlap on one book; a slow cycle delays the next tick.
//! The emergency stop is checked at every state transition — it prevents
//! new executor calls but never abandons one in flight.

pub mod book;
mod market;
mod reconciler;

pub use market::{LiveMarketData, MarketDataError, MarketDataProvider, ReplayMarketData};
pub use reconciler::{BookReconciler, ReconcileOutcome, ReconcilerConfig};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::executor::{Executor, ExecutorError};
use crate::logging::{LogThrottle, TracingRecorder, TradeRecorder};
use crate::resilience::CircuitBreaker;
use crate::risk::{Decision, DriftAction, PositionSizer, RiskManager, SizerConfig};
use crate::signal::{score_symbol, OpportunityScore, SignalConfig};
use crate::types::{Clock, OrderPairRequest, PairConvention};

use book::PositionBook;

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initializing,
    Scanning,
    Analyzing,
    Deciding,
    Executing,
    Monitoring,
    Error,
    Recovering,
    Idle,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initializing => "INITIALIZING",
            Self::Scanning => "SCANNING",
            Self::Analyzing => "ANALYZING",
            Self::Deciding => "DECIDING",
            Self::Executing => "EXECUTING",
            Self::Monitoring => "MONITORING",
            Self::Error => "ERROR",
            Self::Recovering => "RECOVERING",
            Self::Idle => "IDLE",
        };
        f.write_str(name)
    }
}

/// Cycle failures, classified per the error taxonomy rather than propagated
/// raw.
#[derive(Debug, Error)]
pub enum CycleError {
    /// Venue timeout / rate limit; retried by the next cycle.
    #[error("transient: {0}")]
    Transient(String),

    /// Book disagrees with the executor's account; reconcile, don't crash.
    #[error("state mismatch: {0}")]
    StateMismatch(String),

    /// Delta drift, asymmetric fills, failed unwinds.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Auth/balance class failures; opens halt, closes continue.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Emergency stop observed at a state transition.
    #[error("emergency stop")]
    EmergencyStop,
}

impl CycleError {
    fn from_executor(e: &ExecutorError) -> Self {
        if e.is_invariant_violation() {
            Self::Invariant(e.to_string())
        } else if e.is_fatal() {
            Self::Fatal(e.to_string())
        } else {
            Self::Transient(e.to_string())
        }
    }
}

/// Global stop signal. Checked at every state transition; in-flight
/// executor calls always finish first.
#[derive(Debug, Clone, Default)]
pub struct EmergencyStop {
    flag: Arc<AtomicBool>,
}

impl EmergencyStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        warn!("EMERGENCY STOP triggered");
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub symbols: Vec<String>,
    /// Live scheduling tick. A slow cycle delays the next tick.
    pub tick_interval: Duration,
    /// Funding periods pulled for scoring.
    pub history_periods: usize,
    pub signal: SignalConfig,
    pub risk: crate::risk::RiskConfig,
    pub sizer: SizerConfig,
    /// Entry gates, checked in this order after scoring.
    pub min_entry_confidence: Decimal,
    pub min_persistence: u32,
    pub min_annualized_yield: Decimal,
    /// Close positions whose decision-time yield falls below this.
    pub exit_annualized_yield: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            tick_interval: Duration::from_secs(60),
            history_periods: 64,
            signal: SignalConfig::default(),
            risk: crate::risk::RiskConfig::default(),
            sizer: SizerConfig::default(),
            min_entry_confidence: dec!(0.6),
            min_persistence: 2,
            min_annualized_yield: dec!(0.05),
            exit_annualized_yield: Decimal::ZERO,
        }
    }
}

/// What one cycle did, for logging and the dashboard snapshot.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub tick_ms: i64,
    pub opened: Vec<String>,
    pub closed: Vec<String>,
    /// (symbol, human-readable reason) for every candidate passed over.
    pub rejections: Vec<(String, String)>,
    pub funding_accrued: Decimal,
    pub equity: Decimal,
}

pub struct Orchestrator {
    config: EngineConfig,
    market: Arc<dyn MarketDataProvider>,
    executor: Arc<dyn Executor>,
    risk: RiskManager,
    sizer: PositionSizer,
    book: Arc<Mutex<PositionBook>>,
    breaker: Arc<CircuitBreaker>,
    stop: EmergencyStop,
    clock: Arc<dyn Clock>,
    state: RwLock<EngineState>,
    scores: RwLock<HashMap<String, OpportunityScore>>,
    /// Set on fatal failures: opens halt, closes keep going.
    opens_halted: AtomicBool,
    /// Raised by the periodic reconciler task; forces an ERROR transition
    /// at the next cycle boundary.
    reconcile_requested: Arc<AtomicBool>,
    recorder: Arc<dyn TradeRecorder>,
    /// Margin breaches fire every cycle while present; throttle the noise.
    margin_log: std::sync::Mutex<LogThrottle>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        market: Arc<dyn MarketDataProvider>,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let risk = RiskManager::new(config.risk.clone());
        let sizer = PositionSizer::new(config.sizer.clone());
        Self {
            config,
            market,
            executor,
            risk,
            sizer,
            book: Arc::new(Mutex::new(PositionBook::new())),
            breaker: Arc::new(CircuitBreaker::with_defaults()),
            stop: EmergencyStop::new(),
            clock,
            state: RwLock::new(EngineState::Initializing),
            scores: RwLock::new(HashMap::new()),
            opens_halted: AtomicBool::new(false),
            reconcile_requested: Arc::new(AtomicBool::new(false)),
            recorder: Arc::new(TracingRecorder),
            margin_log: std::sync::Mutex::new(LogThrottle::new(Duration::from_secs(60))),
        }
    }

    /// Swap in a different trade sink (tests, dashboard buffering).
    pub fn with_recorder(mut self, recorder: Arc<dyn TradeRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Shared flag the reconciler task raises on book/account mismatch.
    pub fn reconcile_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reconcile_requested)
    }

    pub fn emergency_stop(&self) -> EmergencyStop {
        self.stop.clone()
    }

    pub fn state(&self) -> EngineState {
        *self.state.read().expect("state lock poisoned")
    }

    /// Latest scores, for the dashboard layer.
    pub fn scores(&self) -> Vec<OpportunityScore> {
        let scores = self.scores.read().expect("scores lock poisoned");
        let mut list: Vec<OpportunityScore> = scores.values().cloned().collect();
        list.sort_by(|a, b| b.confidence.cmp(&a.confidence));
        list
    }

    /// Shared handle to the book, for the reconciler task and snapshots.
    pub fn book(&self) -> Arc<Mutex<PositionBook>> {
        Arc::clone(&self.book)
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    fn transition(&self, to: EngineState) -> Result<(), CycleError> {
        if self.stop.is_triggered() && to != EngineState::Idle {
            return Err(CycleError::EmergencyStop);
        }
        let mut state = self.state.write().expect("state lock poisoned");
        debug!(from = %*state, to = %to, "State transition");
        *state = to;
        Ok(())
    }

    /// Run decision cycles on the configured tick until stopped.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            symbols = ?self.config.symbols,
            tick_secs = self.config.tick_interval.as_secs(),
            "Orchestrator started"
        );

        loop {
            ticker.tick().await;
            if self.stop.is_triggered() {
                let _ = self.transition(EngineState::Idle);
                info!("Orchestrator halted by emergency stop");
                return;
            }

            match self.run_cycle().await {
                Ok(report) => {
                    debug!(
                        tick_ms = report.tick_ms,
                        opened = report.opened.len(),
                        closed = report.closed.len(),
                        equity = %report.equity,
                        "Cycle complete"
                    );
                }
                Err(CycleError::EmergencyStop) => {
                    let _ = self.transition(EngineState::Idle);
                    info!("Orchestrator halted by emergency stop");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Cycle failed, reconciling");
                    let _ = self.transition(EngineState::Error);
                    if let Err(re) = self.reconcile().await {
                        error!(error = %re, "Reconciliation failed; retrying next tick");
                    }
                    if matches!(e, CycleError::Fatal(_)) {
                        self.opens_halted.store(true, Ordering::SeqCst);
                        warn!("Fatal error: new opens halted, closes continue");
                    }
                    let _ = self.transition(EngineState::Recovering);
                }
            }
        }
    }

    /// One full decision cycle. Exclusive on the book for its duration.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        if self.reconcile_requested.swap(false, Ordering::SeqCst) {
            return Err(CycleError::StateMismatch(
                "periodic reconciliation found book/account drift".to_string(),
            ));
        }
        let mut book = self.book.lock().await;
        let now = self.clock.now_ms();
        let mut report = CycleReport {
            tick_ms: now,
            ..CycleReport::default()
        };

        // SCANNING
        self.transition(EngineState::Scanning)?;
        let snapshots = self
            .market
            .market_state(&self.config.symbols)
            .await
            .map_err(|e| match e {
                MarketDataError::Exchange(ex) if ex.is_retryable() => {
                    CycleError::Transient(ex.to_string())
                }
                MarketDataError::Exchange(ex) if ex.is_fatal() => {
                    CycleError::Fatal(ex.to_string())
                }
                other => CycleError::Transient(other.to_string()),
            })?;

        // ANALYZING
        self.transition(EngineState::Analyzing)?;
        let mut scores: HashMap<String, OpportunityScore> = HashMap::new();
        for symbol in &self.config.symbols {
            let Some(snapshot) = snapshots.get(symbol) else {
                debug!(symbol = %symbol, "No market data this cycle");
                continue;
            };
            let history = self
                .market
                .funding_history(symbol, self.config.history_periods);
            let basis = self
                .market
                .basis_history(symbol, self.config.signal.zscore_window + 1);
            let score = score_symbol(snapshot, &history, &basis, &self.config.signal);
            scores.insert(symbol.clone(), score);
        }

        // DECIDING
        self.transition(EngineState::Deciding)?;
        let account = self
            .executor
            .account_state()
            .await
            .map_err(|e| CycleError::from_executor(&e))?;

        let mut planned_closes: Vec<(String, String)> = Vec::new();
        for symbol in book.symbols() {
            let Some(position) = book.position(&symbol) else {
                continue;
            };
            let Some(score) = scores.get(&position.symbol) else {
                continue;
            };
            if score.annualized_yield < self.config.exit_annualized_yield {
                let reason = format!(
                    "annualized yield {} below exit threshold {}",
                    score.annualized_yield, self.config.exit_annualized_yield
                );
                match self.risk.validate_close(&position.symbol, &book) {
                    Decision::Accept => planned_closes.push((position.symbol.clone(), reason)),
                    Decision::Reject { reason: r } => {
                        debug!(symbol = %position.symbol, reason = %r, "Close deferred")
                    }
                }
            }
        }

        let mut planned_opens: Vec<(OrderPairRequest, String)> = Vec::new();
        let mut candidates: Vec<&OpportunityScore> = scores
            .values()
            .filter(|s| book.position(&s.symbol).is_none() && s.rejection.is_none())
            .collect();
        // Highest conviction first; symbol tie-break keeps runs replayable.
        candidates.sort_by(|a, b| {
            b.confidence
                .cmp(&a.confidence)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        let mut planned_notional = Decimal::ZERO;
        for score in candidates {
            let symbol = score.symbol.clone();
            if let Some(reason) = self.entry_gate_rejection(score) {
                report.rejections.push((symbol, reason));
                continue;
            }
            let snapshot = &snapshots[&score.symbol];
            let quantity = self.sizer.size(
                score.confidence,
                score.annualized_yield,
                book.total_entry_notional() + planned_notional,
                account.available_balance - planned_notional,
                snapshot.spot_price,
                &self.executor.constraints(&score.symbol),
                self.risk.config(),
            );
            if quantity.is_zero() {
                report.rejections.push((
                    symbol,
                    "sized to zero: below venue minimum or exposure caps".to_string(),
                ));
                continue;
            }
            let request = OrderPairRequest {
                symbol: symbol.clone(),
                target_notional_usd: quantity * snapshot.spot_price,
                convention: PairConvention::LongSpotShortPerp,
            };
            match self.risk.validate_open(&request, &book, &account) {
                Decision::Accept => {
                    planned_notional += request.target_notional_usd;
                    let reason = format!(
                        "confidence {} yield {} persistence {}",
                        score.confidence, score.annualized_yield, score.persistence_periods
                    );
                    planned_opens.push((request, reason));
                }
                Decision::Reject { reason } => report.rejections.push((symbol, reason)),
            }
        }

        // Publish scores (with rejection reasons folded in) for the
        // dashboard before executing.
        for (symbol, reason) in &report.rejections {
            if let Some(score) = scores.get_mut(symbol) {
                score.rejection = Some(reason.clone());
            }
        }
        *self.scores.write().expect("scores lock poisoned") = scores;

        // EXECUTING - sequential, closes before opens, never concurrent
        // across symbols so exposure accounting stays consistent.
        self.transition(EngineState::Executing)?;
        for (symbol, reason) in planned_closes {
            book.lock(&symbol).map_err(|e| CycleError::StateMismatch(e.to_string()))?;
            let result = self.executor.close(&symbol).await;
            self.record_breaker(&result);
            match result {
                Ok(fill) => {
                    book.unlock(&symbol);
                    let trade = book
                        .close_with_fills(&symbol, &fill.spot, &fill.perp, &reason, fill.timestamp_ms)
                        .map_err(|e| CycleError::StateMismatch(e.to_string()))?;
                    info!(
                        symbol = %symbol,
                        net_pnl = %trade.net_pnl,
                        funding = %trade.total_funding(),
                        reason = %reason,
                        "Position closed"
                    );
                    self.recorder.record(&trade);
                    report.closed.push(symbol);
                }
                Err(e) if e.is_invariant_violation() => {
                    book.unlock(&symbol);
                    return Err(CycleError::Invariant(e.to_string()));
                }
                Err(e) => {
                    book.unlock(&symbol);
                    warn!(symbol = %symbol, error = %e, "Close failed, will retry next cycle");
                    if e.is_fatal() {
                        self.opens_halted.store(true, Ordering::SeqCst);
                    }
                }
            }
        }

        for (request, reason) in planned_opens {
            if self.stop.is_triggered() {
                break;
            }
            if !self.breaker.allows_open() {
                report
                    .rejections
                    .push((request.symbol.clone(), "circuit breaker open".to_string()));
                continue;
            }
            let result = self.executor.open(&request).await;
            self.record_breaker(&result);
            match result {
                Ok(fill) => {
                    let symbol = request.symbol.clone();
                    let position = book
                        .open_from_fills(&symbol, &fill.spot, &fill.perp, &reason, fill.timestamp_ms)
                        .map_err(|e| CycleError::StateMismatch(e.to_string()))?;
                    info!(
                        symbol = %symbol,
                        quantity = %fill.quantity(),
                        notional = %position.entry_notional(),
                        "Position opened"
                    );
                    report.opened.push(symbol);
                }
                Err(e) if e.is_invariant_violation() => {
                    return Err(CycleError::Invariant(e.to_string()));
                }
                Err(e) => {
                    if e.is_fatal() {
                        self.opens_halted.store(true, Ordering::SeqCst);
                    }
                    report.rejections.push((request.symbol.clone(), e.to_string()));
                }
            }
        }

        // MONITORING
        self.transition(EngineState::Monitoring)?;
        report.funding_accrued = self.accrue_funding(&mut book).await?;
        self.enforce_drift(&mut book, &mut report).await?;

        let account = self
            .executor
            .account_state()
            .await
            .map_err(|e| CycleError::from_executor(&e))?;
        if account.margin_ratio < self.risk.config().margin_floor {
            let mut throttle = self.margin_log.lock().expect("margin log lock poisoned");
            if throttle.should_log() {
                error!(
                    margin_ratio = %account.margin_ratio,
                    floor = %self.risk.config().margin_floor,
                    suppressed = throttle.take_suppressed(),
                    "Margin ratio below safety floor"
                );
            }
        }
        report.equity = account.equity;

        Ok(report)
    }

    /// Entry gates before sizing, cheapest first. Returns the reason the
    /// candidate fails, if any.
    fn entry_gate_rejection(&self, score: &OpportunityScore) -> Option<String> {
        if self.opens_halted.load(Ordering::SeqCst) {
            return Some("opens halted after fatal error".to_string());
        }
        if score.raw_rate <= Decimal::ZERO {
            return Some(format!("negative carry: rate {}", score.raw_rate));
        }
        if score.confidence < self.config.min_entry_confidence {
            return Some(format!(
                "confidence {} below minimum {}",
                score.confidence, self.config.min_entry_confidence
            ));
        }
        if score.persistence_periods < self.config.min_persistence {
            return Some(format!(
                "persistence {} below minimum {}",
                score.persistence_periods, self.config.min_persistence
            ));
        }
        if score.annualized_yield < self.config.min_annualized_yield {
            return Some(format!(
                "annualized yield {} below minimum {}",
                score.annualized_yield, self.config.min_annualized_yield
            ));
        }
        None
    }

    fn record_breaker<T>(&self, result: &Result<T, ExecutorError>) {
        match result {
            Ok(_) => self.breaker.record_success(),
            Err(e) if e.is_retryable() => self.breaker.record_retryable_failure(),
            Err(_) => {}
        }
    }

    /// Credit settled funding to every open position.
    async fn accrue_funding(&self, book: &mut PositionBook) -> Result<Decimal, CycleError> {
        let mut total = Decimal::ZERO;
        let symbols = book.symbols();
        for symbol in symbols {
            let Some(position) = book.position(&symbol) else {
                continue;
            };
            let notional = position.perp_entry_notional();
            let events = self.market.funding_events(&symbol, position.last_funding_ms);
            for event in events {
                // Short perp receives positive funding, pays negative.
                let amount = event.rate * notional;
                self.executor
                    .apply_funding(&symbol, amount)
                    .await
                    .map_err(|e| CycleError::from_executor(&e))?;
                book.accrue_funding(&symbol, event.timestamp_ms, amount)
                    .map_err(|e| CycleError::StateMismatch(e.to_string()))?;
                total += amount;
                debug!(
                    symbol = %symbol,
                    rate = %event.rate,
                    amount = %amount,
                    "Funding accrued"
                );
            }
        }
        Ok(total)
    }

    /// Delta-drift check on every open position; breaches are remediated
    /// immediately, never logged-and-ignored.
    async fn enforce_drift(
        &self,
        book: &mut PositionBook,
        report: &mut CycleReport,
    ) -> Result<(), CycleError> {
        let symbols = book.symbols();
        for symbol in symbols {
            let Some(position) = book.position(&symbol) else {
                continue;
            };
            let Some(breach) = self.risk.check_delta_drift(position) else {
                continue;
            };
            match self.risk.drift_action(position, &breach) {
                DriftAction::Rebalance { perp_adjustment } => {
                    error!(
                        symbol = %symbol,
                        drift = %breach.drift,
                        adjustment = %perp_adjustment,
                        "Drift breach: rebalancing perp leg"
                    );
                    let fill = self
                        .executor
                        .rebalance(&symbol, perp_adjustment)
                        .await
                        .map_err(|e| CycleError::Invariant(e.to_string()))?;
                    book.apply_rebalance(&symbol, &fill)
                        .map_err(|e| CycleError::StateMismatch(e.to_string()))?;
                }
                DriftAction::ForceClose => {
                    error!(
                        symbol = %symbol,
                        drift = %breach.drift,
                        "Drift breach beyond rebalance limit: forcing close"
                    );
                    let fill = self
                        .executor
                        .close(&symbol)
                        .await
                        .map_err(|e| CycleError::Invariant(e.to_string()))?;
                    let trade = book
                        .close_with_fills(
                            &symbol,
                            &fill.spot,
                            &fill.perp,
                            "forced close: delta drift breach",
                            fill.timestamp_ms,
                        )
                        .map_err(|e| CycleError::StateMismatch(e.to_string()))?;
                    self.recorder.record(&trade);
                    report.closed.push(symbol);
                }
            }
        }
        Ok(())
    }

    /// Reconcile the book against the executor's authoritative account:
    /// the account wins.
    pub async fn reconcile(&self) -> Result<(), CycleError> {
        let mut book = self.book.lock().await;
        let account = self
            .executor
            .account_state()
            .await
            .map_err(|e| CycleError::from_executor(&e))?;

        let symbols = book.symbols();
        for symbol in symbols {
            let Some(position) = book.position(&symbol) else {
                continue;
            };
            let authoritative = account.positions.get(&symbol);
            match authoritative {
                None => {
                    error!(
                        symbol = %symbol,
                        local_qty = %position.spot_qty,
                        "Reconcile: executor reports no position; dropping local entry"
                    );
                    let synthetic = crate::exchange::LegFill {
                        order_id: crate::types::OrderId::new(format!("reconcile-{symbol}")),
                        leg: crate::types::Leg::Spot,
                        side: crate::types::OrderSide::Sell,
                        quantity: position.spot_qty,
                        price: position.spot_entry_price,
                        fee: Decimal::ZERO,
                        timestamp_ms: self.clock.now_ms(),
                    };
                    let perp_synthetic = crate::exchange::LegFill {
                        leg: crate::types::Leg::Perp,
                        side: crate::types::OrderSide::Buy,
                        price: position.perp_entry_price,
                        quantity: position.perp_qty.abs(),
                        ..synthetic.clone()
                    };
                    book.close_with_fills(
                        &symbol,
                        &synthetic,
                        &perp_synthetic,
                        "reconciled away: executor reports flat",
                        self.clock.now_ms(),
                    )
                    .map_err(|e| CycleError::StateMismatch(e.to_string()))?;
                }
                Some(acct) => {
                    let spot_drift = (acct.spot_qty - position.spot_qty).abs();
                    let perp_drift = (acct.perp_qty - position.perp_qty).abs();
                    if spot_drift > Decimal::ZERO || perp_drift > Decimal::ZERO {
                        warn!(
                            symbol = %symbol,
                            local_spot = %position.spot_qty,
                            exchange_spot = %acct.spot_qty,
                            local_perp = %position.perp_qty,
                            exchange_perp = %acct.perp_qty,
                            "Reconcile: quantity drift detected; adopting executor state"
                        );
                        book.adopt_quantities(&symbol, acct.spot_qty, acct.perp_qty)
                            .map_err(|e| CycleError::StateMismatch(e.to_string()))?;
                    }
                }
            }
        }
        info!("Reconciliation complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{BacktestExecutor, CostModel};
    use crate::store::{FundingObservation, HistoricalStore, PriceKline};
    use crate::types::{ExchangeConstraints, SystemClock};

    const HOUR: i64 = 3_600_000;

    fn seed_store(store: &Arc<HistoricalStore>, periods: i64, rate: Decimal) {
        for i in 1..=periods {
            store.put_funding(FundingObservation {
                symbol: "BTCUSDT".to_string(),
                timestamp_ms: i * 8 * HOUR,
                settled_rate: Some(rate),
                predicted_rate: Some(rate),
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
    }

    fn replay_engine(
        store: &Arc<HistoricalStore>,
        start_ms: i64,
        config: EngineConfig,
    ) -> (Orchestrator, Arc<BacktestExecutor>) {
        let executor = Arc::new(BacktestExecutor::new(
            store,
            start_ms,
            dec!(10000),
            CostModel::zero_slippage(dec!(10)),
            ExchangeConstraints::default(),
        ));
        let market = Arc::new(ReplayMarketData::new(executor.view().clone()));
        let orchestrator = Orchestrator::new(
            config,
            market,
            executor.clone() as Arc<dyn Executor>,
            Arc::new(executor.replay_clock()),
        );
        (orchestrator, executor)
    }

    fn permissive_config() -> EngineConfig {
        EngineConfig {
            symbols: vec!["BTCUSDT".to_string()],
            min_entry_confidence: Decimal::ZERO,
            min_persistence: 0,
            min_annualized_yield: Decimal::ZERO,
            exit_annualized_yield: dec!(-100),
            signal: SignalConfig {
                min_history: 2,
                ..SignalConfig::default()
            },
            sizer: SizerConfig {
                base_notional: dec!(1000),
                max_multiplier: Decimal::ONE,
                ..SizerConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_cycle_opens_position_on_positive_carry() {
        let store = Arc::new(HistoricalStore::new());
        seed_store(&store, 10, dec!(0.0005));
        let (orchestrator, executor) = replay_engine(&store, 4 * 8 * HOUR, permissive_config());

        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.opened, vec!["BTCUSDT".to_string()]);

        let book = orchestrator.book();
        let book = book.lock().await;
        let position = book.position("BTCUSDT").unwrap();
        assert_eq!(position.spot_qty, dec!(10));
        assert_eq!(position.perp_qty, dec!(-10));
        drop(book);

        let account = executor.account_state().await.unwrap();
        assert_eq!(account.positions["BTCUSDT"].spot_qty, dec!(10));
    }

    #[tokio::test]
    async fn test_negative_carry_is_rejected_with_reason() {
        let store = Arc::new(HistoricalStore::new());
        seed_store(&store, 10, dec!(-0.0005));
        let (orchestrator, _executor) = replay_engine(&store, 4 * 8 * HOUR, permissive_config());

        let report = orchestrator.run_cycle().await.unwrap();
        assert!(report.opened.is_empty());
        let (symbol, reason) = &report.rejections[0];
        assert_eq!(symbol, "BTCUSDT");
        assert!(reason.contains("negative carry"));

        // The published score carries the same reason for the dashboard.
        let scores = orchestrator.scores();
        assert_eq!(scores[0].rejection.as_deref(), Some(reason.as_str()));
    }

    #[tokio::test]
    async fn test_emergency_stop_blocks_cycle() {
        let store = Arc::new(HistoricalStore::new());
        seed_store(&store, 10, dec!(0.0005));
        let (orchestrator, _executor) = replay_engine(&store, 4 * 8 * HOUR, permissive_config());

        orchestrator.emergency_stop().trigger();
        let result = orchestrator.run_cycle().await;
        assert!(matches!(result, Err(CycleError::EmergencyStop)));
        assert!(orchestrator.book().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_funding_accrues_on_later_ticks() {
        let store = Arc::new(HistoricalStore::new());
        seed_store(&store, 10, dec!(0.0005));
        let (orchestrator, executor) = replay_engine(&store, 4 * 8 * HOUR, permissive_config());

        orchestrator.run_cycle().await.unwrap();
        executor.advance_clock(5 * 8 * HOUR);
        let report = orchestrator.run_cycle().await.unwrap();

        // 0.0005 rate on ~1000 perp notional.
        assert_eq!(report.funding_accrued, dec!(0.5));
        let book = orchestrator.book();
        let book = book.lock().await;
        assert_eq!(
            book.position("BTCUSDT").unwrap().accumulated_funding,
            dec!(0.5)
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(EngineState::Scanning.to_string(), "SCANNING");
        assert_eq!(EngineState::Recovering.to_string(), "RECOVERING");
    }

    #[tokio::test]
    async fn test_system_clock_is_wall_time() {
        let clock = SystemClock;
        assert!(clock.now_ms() > 1_600_000_000_000);
    }
}
