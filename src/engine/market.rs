//! Market data seam between the orchestrator and its data sources.
//!
//! The orchestrator scans through this trait only. Live, it is backed by
//! the venue gateway plus the historical store; in replay, by an `AsOfView`
//! pinned to the backtest clock. Either way the decision path downstream is
//! identical.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::exchange::{ExchangeError, ExchangeGateway};
use crate::store::{AsOfView, FundingEvent, HistoricalStore, VisibleObservation};
use crate::types::{Clock, MarketSnapshot};

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("market data unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Current snapshots for the tracked symbols. Symbols without data are
    /// simply absent from the map.
    async fn market_state(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, MarketSnapshot>, MarketDataError>;

    /// Visible funding history for scoring, oldest first.
    fn funding_history(&self, symbol: &str, max_periods: usize) -> Vec<VisibleObservation>;

    /// Visible basis series for the z-score, oldest first.
    fn basis_history(&self, symbol: &str, max_points: usize) -> Vec<Decimal>;

    /// Settled funding payments after `after_ms`, for accrual.
    fn funding_events(&self, symbol: &str, after_ms: i64) -> Vec<FundingEvent>;
}

/// Live provider: snapshots from the venue, history from the store (which
/// the collector layer outside this crate keeps fed). History reads go
/// through an `as_of(now)` view so live and replay share the same masking
/// path.
pub struct LiveMarketData {
    gateway: Arc<dyn ExchangeGateway>,
    store: Arc<HistoricalStore>,
    clock: Arc<dyn Clock>,
}

impl LiveMarketData {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<HistoricalStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gateway,
            store,
            clock,
        }
    }

    fn view(&self) -> AsOfView {
        self.store.as_of(self.clock.now_ms())
    }
}

#[async_trait]
impl MarketDataProvider for LiveMarketData {
    async fn market_state(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, MarketSnapshot>, MarketDataError> {
        Ok(self.gateway.get_market_state(symbols).await?)
    }

    fn funding_history(&self, symbol: &str, max_periods: usize) -> Vec<VisibleObservation> {
        self.view().funding_history(symbol, max_periods)
    }

    fn basis_history(&self, symbol: &str, max_points: usize) -> Vec<Decimal> {
        self.view().basis_history(symbol, max_points)
    }

    fn funding_events(&self, symbol: &str, after_ms: i64) -> Vec<FundingEvent> {
        self.view().funding_events(symbol, after_ms)
    }
}

/// Replay provider: everything comes from one clock-following view. There
/// is no way to reach the unrestricted store through this type.
pub struct ReplayMarketData {
    view: AsOfView,
}

impl ReplayMarketData {
    pub(crate) fn new(view: AsOfView) -> Self {
        Self { view }
    }
}

#[async_trait]
impl MarketDataProvider for ReplayMarketData {
    async fn market_state(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, MarketSnapshot>, MarketDataError> {
        Ok(symbols
            .iter()
            .filter_map(|symbol| self.view.snapshot(symbol).map(|s| (symbol.clone(), s)))
            .collect())
    }

    fn funding_history(&self, symbol: &str, max_periods: usize) -> Vec<VisibleObservation> {
        self.view.funding_history(symbol, max_periods)
    }

    fn basis_history(&self, symbol: &str, max_points: usize) -> Vec<Decimal> {
        self.view.basis_history(symbol, max_points)
    }

    fn funding_events(&self, symbol: &str, after_ms: i64) -> Vec<FundingEvent> {
        self.view.funding_events(symbol, after_ms)
    }
}
