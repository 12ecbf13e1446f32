//! Backtest executor: fills from a time-bounded store view.
//!
//! All prices come from the `AsOfView` pinned to the replay clock, with the
//! same slippage/fee model as the paper executor. `advance_clock` is
//! crate-private and only the replay engine holds the executor, so callers
//! outside the backtest driver cannot move simulated time.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::collections::HashMap;

use super::sim::{CostModel, SimulatedAccount};
use super::{Executor, ExecutorError, FillResult};
use crate::exchange::{AccountState, LegFill};
use crate::risk::round_to_step;
use crate::store::{perp_symbol, AsOfView, HistoricalStore};
use crate::types::{Clock, ExchangeConstraints, Leg, OrderId, OrderPairRequest, OrderSide};

/// Read-only view of the replay clock. Cannot advance time.
#[derive(Debug, Clone)]
pub struct ReplayClockHandle {
    clock: Arc<AtomicI64>,
}

impl Clock for ReplayClockHandle {
    fn now_ms(&self) -> i64 {
        self.clock.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct BacktestExecutor {
    view: AsOfView,
    clock: Arc<AtomicI64>,
    account: Mutex<SimulatedAccount>,
    costs: CostModel,
    constraints: ExchangeConstraints,
}

impl BacktestExecutor {
    pub(crate) fn new(
        store: &Arc<HistoricalStore>,
        start_ms: i64,
        initial_balance: Decimal,
        costs: CostModel,
        constraints: ExchangeConstraints,
    ) -> Self {
        let clock = Arc::new(AtomicI64::new(start_ms));
        Self {
            view: store.as_of_clock(Arc::clone(&clock)),
            clock,
            account: Mutex::new(SimulatedAccount::new(initial_balance)),
            costs,
            constraints,
        }
    }

    /// Advance simulated time. Only the replay engine calls this.
    pub(crate) fn advance_clock(&self, timestamp_ms: i64) {
        self.clock.store(timestamp_ms, Ordering::Release);
    }

    /// Read-only clock following the replay clock, for the orchestrator.
    pub fn replay_clock(&self) -> ReplayClockHandle {
        ReplayClockHandle {
            clock: Arc::clone(&self.clock),
        }
    }

    pub(crate) fn view(&self) -> &AsOfView {
        &self.view
    }

    fn now_ms(&self) -> i64 {
        self.clock.load(Ordering::Acquire)
    }

    fn marks(&self, symbol: &str) -> Result<(Decimal, Decimal), ExecutorError> {
        let spot = self.view.mark_price(symbol).ok_or_else(|| {
            ExecutorError::Rejected(format!("no spot kline visible for {symbol}"))
        })?;
        let perp = self.view.mark_price(&perp_symbol(symbol)).ok_or_else(|| {
            ExecutorError::Rejected(format!("no perp kline visible for {symbol}"))
        })?;
        Ok((spot, perp))
    }

    fn price_map(&self) -> HashMap<String, (Decimal, Decimal)> {
        let account = self.account.lock().expect("account lock poisoned");
        account
            .symbols()
            .into_iter()
            .filter_map(|symbol| {
                let spot = self.view.mark_price(&symbol)?;
                let perp = self.view.mark_price(&perp_symbol(&symbol))?;
                Some((symbol, (spot, perp)))
            })
            .collect()
    }
}

#[async_trait]
impl Executor for BacktestExecutor {
    async fn open(&self, request: &OrderPairRequest) -> Result<FillResult, ExecutorError> {
        let (spot_mark, perp_mark) = self.marks(&request.symbol)?;
        let quantity = {
            if spot_mark <= Decimal::ZERO {
                Decimal::ZERO
            } else {
                round_to_step(request.target_notional_usd / spot_mark, self.constraints.lot_step)
            }
        };
        if quantity < self.constraints.min_qty
            || quantity * spot_mark < self.constraints.min_notional
        {
            return Err(ExecutorError::Rejected(format!(
                "target notional {} rounds below venue minimum for {}",
                request.target_notional_usd, request.symbol
            )));
        }

        let ts = self.now_ms();
        let spot = self
            .costs
            .simulate_leg(Leg::Spot, OrderSide::Buy, quantity, spot_mark, ts, "bt");
        let perp = self
            .costs
            .simulate_leg(Leg::Perp, OrderSide::Sell, quantity, perp_mark, ts, "bt");

        let mut account = self.account.lock().expect("account lock poisoned");
        if account.has_position(&request.symbol) {
            return Err(ExecutorError::Rejected(format!(
                "position already open for {}",
                request.symbol
            )));
        }
        account.apply_open(&request.symbol, &spot, &perp);

        Ok(FillResult {
            symbol: request.symbol.clone(),
            spot,
            perp,
            timestamp_ms: ts,
        })
    }

    async fn close(&self, symbol: &str) -> Result<FillResult, ExecutorError> {
        let quantity = {
            let account = self.account.lock().expect("account lock poisoned");
            account.position_quantity(symbol)
        };
        if quantity.is_zero() {
            return Err(ExecutorError::UnknownPosition(symbol.to_string()));
        }

        let (spot_mark, perp_mark) = self.marks(symbol)?;
        let ts = self.now_ms();
        let spot = self
            .costs
            .simulate_leg(Leg::Spot, OrderSide::Sell, quantity, spot_mark, ts, "bt");
        let perp = self
            .costs
            .simulate_leg(Leg::Perp, OrderSide::Buy, quantity, perp_mark, ts, "bt");

        let mut account = self.account.lock().expect("account lock poisoned");
        account.apply_close(symbol, &spot, &perp);

        Ok(FillResult {
            symbol: symbol.to_string(),
            spot,
            perp,
            timestamp_ms: ts,
        })
    }

    async fn cancel(&self, _order_id: &OrderId) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn rebalance(
        &self,
        symbol: &str,
        perp_adjustment: Decimal,
    ) -> Result<LegFill, ExecutorError> {
        let (_, perp_mark) = self.marks(symbol)?;
        let side = if perp_adjustment < Decimal::ZERO {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let fill = self.costs.simulate_leg(
            Leg::Perp,
            side,
            perp_adjustment.abs(),
            perp_mark,
            self.now_ms(),
            "bt-rebalance",
        );
        let mut account = self.account.lock().expect("account lock poisoned");
        account.apply_rebalance(symbol, &fill);
        Ok(fill)
    }

    async fn apply_funding(&self, _symbol: &str, amount: Decimal) -> Result<(), ExecutorError> {
        let mut account = self.account.lock().expect("account lock poisoned");
        account.credit_funding(amount);
        Ok(())
    }

    async fn account_state(&self) -> Result<AccountState, ExecutorError> {
        let prices = self.price_map();
        let account = self.account.lock().expect("account lock poisoned");
        Ok(account.account_state(&prices))
    }

    fn constraints(&self, _symbol: &str) -> ExchangeConstraints {
        self.constraints.clone()
    }
}
