//! Paper executor: live market data, simulated fills.
//!
//! Fills happen at the venue's last-known prices plus the fixed slippage
//! model. Both legs fill atomically by construction, so the partial-fill
//! failure mode cannot occur here; its tests live against the live
//! executor's gateway stubs.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

use super::sim::{CostModel, SimulatedAccount};
use super::{Executor, ExecutorError, FillResult};
use crate::exchange::{AccountState, ExchangeGateway, LegFill};
use crate::risk::round_to_step;
use crate::types::{ExchangeConstraints, Leg, OrderId, OrderPairRequest, OrderSide};

pub struct PaperExecutor {
    gateway: Arc<dyn ExchangeGateway>,
    account: Mutex<SimulatedAccount>,
    costs: CostModel,
}

impl PaperExecutor {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        initial_balance: Decimal,
        costs: CostModel,
    ) -> Self {
        Self {
            gateway,
            account: Mutex::new(SimulatedAccount::new(initial_balance)),
            costs,
        }
    }

    fn derive_quantity(
        &self,
        notional: Decimal,
        spot_price: Decimal,
        constraints: &ExchangeConstraints,
    ) -> Decimal {
        if spot_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let quantity = round_to_step(notional / spot_price, constraints.lot_step);
        if quantity < constraints.min_qty || quantity * spot_price < constraints.min_notional {
            Decimal::ZERO
        } else {
            quantity
        }
    }
}

#[async_trait]
impl Executor for PaperExecutor {
    async fn open(&self, request: &OrderPairRequest) -> Result<FillResult, ExecutorError> {
        let market = self
            .gateway
            .get_market_state(std::slice::from_ref(&request.symbol))
            .await?;
        let snapshot = market
            .get(&request.symbol)
            .ok_or_else(|| ExecutorError::Rejected(format!("no market data for {}", request.symbol)))?;

        let constraints = self.gateway.constraints(&request.symbol);
        let quantity =
            self.derive_quantity(request.target_notional_usd, snapshot.spot_price, &constraints);
        if quantity.is_zero() {
            return Err(ExecutorError::Rejected(format!(
                "target notional {} rounds below venue minimum for {}",
                request.target_notional_usd, request.symbol
            )));
        }

        let ts = snapshot.timestamp_ms;
        let spot =
            self.costs
                .simulate_leg(Leg::Spot, OrderSide::Buy, quantity, snapshot.spot_price, ts, "paper");
        let perp =
            self.costs
                .simulate_leg(Leg::Perp, OrderSide::Sell, quantity, snapshot.perp_price, ts, "paper");

        let mut account = self.account.lock().expect("account lock poisoned");
        if account.has_position(&request.symbol) {
            return Err(ExecutorError::Rejected(format!(
                "position already open for {}",
                request.symbol
            )));
        }
        account.apply_open(&request.symbol, &spot, &perp);
        info!(
            symbol = %request.symbol,
            quantity = %quantity,
            spot_price = %spot.price,
            perp_price = %perp.price,
            "Paper pair opened"
        );

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

        let market = self
            .gateway
            .get_market_state(&[symbol.to_string()])
            .await?;
        let snapshot = market
            .get(symbol)
            .ok_or_else(|| ExecutorError::Rejected(format!("no market data for {symbol}")))?;

        let ts = snapshot.timestamp_ms;
        let spot =
            self.costs
                .simulate_leg(Leg::Spot, OrderSide::Sell, quantity, snapshot.spot_price, ts, "paper");
        let perp =
            self.costs
                .simulate_leg(Leg::Perp, OrderSide::Buy, quantity, snapshot.perp_price, ts, "paper");

        let mut account = self.account.lock().expect("account lock poisoned");
        account.apply_close(symbol, &spot, &perp);
        info!(symbol = symbol, quantity = %quantity, "Paper pair closed");

        Ok(FillResult {
            symbol: symbol.to_string(),
            spot,
            perp,
            timestamp_ms: ts,
        })
    }

    async fn cancel(&self, _order_id: &OrderId) -> Result<(), ExecutorError> {
        // Simulated fills are immediate; there is never a resting order.
        Ok(())
    }

    async fn rebalance(
        &self,
        symbol: &str,
        perp_adjustment: Decimal,
    ) -> Result<LegFill, ExecutorError> {
        let market = self
            .gateway
            .get_market_state(&[symbol.to_string()])
            .await?;
        let snapshot = market
            .get(symbol)
            .ok_or_else(|| ExecutorError::Rejected(format!("no market data for {symbol}")))?;

        let side = if perp_adjustment < Decimal::ZERO {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let fill = self.costs.simulate_leg(
            Leg::Perp,
            side,
            perp_adjustment.abs(),
            snapshot.perp_price,
            snapshot.timestamp_ms,
            "paper-rebalance",
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
        let symbols: Vec<String> = {
            let account = self.account.lock().expect("account lock poisoned");
            account.symbols()
        };
        let mut prices = HashMap::new();
        if !symbols.is_empty() {
            let market = self.gateway.get_market_state(&symbols).await?;
            for (symbol, snapshot) in market {
                prices.insert(symbol, (snapshot.spot_price, snapshot.perp_price));
            }
        }
        let account = self.account.lock().expect("account lock poisoned");
        Ok(account.account_state(&prices))
    }

    fn constraints(&self, symbol: &str) -> ExchangeConstraints {
        self.gateway.constraints(symbol)
    }
}
