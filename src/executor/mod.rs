//! Executor abstraction.
//!
//! One capability interface, three implementations selected at construction
//! time: [`LiveExecutor`] talks to the venue, [`PaperExecutor`] simulates
//! fills at last-known prices, [`BacktestExecutor`] fills from a
//! time-bounded store view at the replay clock. The orchestrator holds an
//! `Arc<dyn Executor>` and never inspects which one it has.
//!
//! # Contract
//!
//! `open` either produces two matched fills within a bounded timeout or
//! leaves zero legs standing and returns an explicit failure. A one-leg
//! partial state is resolved *inside* the executor (compensating close of
//! the filled leg) before the call returns; callers never observe a
//! half-open pair.

mod backtest;
mod live;
mod paper;
mod sim;

pub use backtest::{BacktestExecutor, ReplayClockHandle};
pub use live::{LiveExecutor, LiveExecutorConfig};
pub use paper::PaperExecutor;
pub use sim::{CostModel, SimulatedAccount};

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::exchange::{AccountState, ExchangeError, LegFill};
use crate::types::{ExchangeConstraints, Leg, OrderId, OrderPairRequest};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("pair rejected: {0}")]
    Rejected(String),

    #[error("both legs failed: spot: {spot}, perp: {perp}")]
    BothLegsFailed { spot: String, perp: String },

    /// One leg filled, the other failed; the filled leg was unwound before
    /// returning. Zero legs remain.
    #[error("{filled_leg} leg filled then unwound: {reason}")]
    PartialResolved { filled_leg: Leg, reason: String },

    /// One leg filled, the other failed, and the compensating unwind also
    /// failed. Exposure is live; the orchestrator must reconcile.
    #[error("CRITICAL: compensating close of {leg} leg failed: {reason}")]
    CompensationFailed { leg: Leg, reason: String },

    /// A close left one leg standing after retries.
    #[error("CRITICAL: close incomplete, {leg} leg still open: {reason}")]
    CloseIncomplete { leg: Leg, reason: String },

    #[error("no position to close for {0}")]
    UnknownPosition(String),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl ExecutorError {
    /// Whether this failure should feed the circuit breaker.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Exchange(e) => e.is_retryable(),
            Self::PartialResolved { .. } => true,
            _ => false,
        }
    }

    /// Invariant-violation class failures: exposure may be live.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::CompensationFailed { .. } | Self::CloseIncomplete { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Exchange(e) if e.is_fatal())
    }
}

/// A matched dual-leg fill. Both legs always refer to the same base
/// quantity.
#[derive(Debug, Clone)]
pub struct FillResult {
    pub symbol: String,
    pub spot: LegFill,
    pub perp: LegFill,
    pub timestamp_ms: i64,
}

impl FillResult {
    pub fn quantity(&self) -> Decimal {
        self.spot.quantity
    }

    pub fn total_fees(&self) -> Decimal {
        self.spot.fee + self.perp.fee
    }
}

/// Execution capability consumed by the orchestrator.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Open a delta-neutral pair: buy spot, sell perp, matched notional.
    async fn open(&self, request: &OrderPairRequest) -> Result<FillResult, ExecutorError>;

    /// Close the full pair for `symbol`: sell spot, buy back perp.
    async fn close(&self, symbol: &str) -> Result<FillResult, ExecutorError>;

    async fn cancel(&self, order_id: &OrderId) -> Result<(), ExecutorError>;

    /// Single perp-leg adjustment used only for drift remediation.
    async fn rebalance(
        &self,
        symbol: &str,
        perp_adjustment: Decimal,
    ) -> Result<LegFill, ExecutorError>;

    /// Settle a funding payment against the account. The live venue credits
    /// funding itself, so the default is a no-op; the simulated executors
    /// move cash here.
    async fn apply_funding(&self, _symbol: &str, _amount: Decimal) -> Result<(), ExecutorError> {
        Ok(())
    }

    /// The authoritative account view this executor reconciles against.
    async fn account_state(&self) -> Result<AccountState, ExecutorError>;

    fn constraints(&self, symbol: &str) -> ExchangeConstraints;
}
