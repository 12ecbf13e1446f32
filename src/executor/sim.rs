//! Shared fill-simulation pieces for the paper and backtest executors.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

use crate::exchange::{AccountPosition, AccountState, LegFill};
use crate::types::{Leg, OrderId, OrderSide};

const BPS: Decimal = dec!(10000);

/// Taker fee and fixed slippage, both in basis points per leg.
#[derive(Debug, Clone, Copy)]
pub struct CostModel {
    pub fee_bps: Decimal,
    pub slippage_bps: Decimal,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            fee_bps: dec!(10),     // 0.10% per leg
            slippage_bps: dec!(5), // 0.05% per leg
        }
    }
}

impl CostModel {
    pub fn zero_slippage(fee_bps: Decimal) -> Self {
        Self {
            fee_bps,
            slippage_bps: Decimal::ZERO,
        }
    }

    /// Price actually paid/received: slippage always works against us.
    pub fn fill_price(&self, mark: Decimal, side: OrderSide) -> Decimal {
        let slip = mark * self.slippage_bps / BPS;
        match side {
            OrderSide::Buy => mark + slip,
            OrderSide::Sell => mark - slip,
        }
    }

    pub fn fee(&self, notional: Decimal) -> Decimal {
        notional * self.fee_bps / BPS
    }

    /// Build a simulated leg fill at `mark`.
    pub fn simulate_leg(
        &self,
        leg: Leg,
        side: OrderSide,
        quantity: Decimal,
        mark: Decimal,
        timestamp_ms: i64,
        order_tag: &str,
    ) -> LegFill {
        let price = self.fill_price(mark, side);
        LegFill {
            order_id: OrderId::new(format!("{order_tag}-{leg}-{timestamp_ms}")),
            leg,
            side,
            quantity,
            price,
            fee: self.fee(quantity * price),
            timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SimPosition {
    spot_qty: Decimal,
    perp_qty: Decimal,
    spot_entry: Decimal,
    perp_entry: Decimal,
}

/// Cash-and-positions ledger behind the simulated executors. Spot purchases
/// consume cash; the short perp leg settles its PnL into cash at close, as
/// do funding payments.
#[derive(Debug, Clone)]
pub struct SimulatedAccount {
    cash: Decimal,
    positions: HashMap<String, SimPosition>,
}

impl SimulatedAccount {
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            cash: initial_balance,
            positions: HashMap::new(),
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    pub fn position_quantity(&self, symbol: &str) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| p.spot_qty)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn apply_open(&mut self, symbol: &str, spot: &LegFill, perp: &LegFill) {
        self.cash -= spot.notional() + spot.fee + perp.fee;
        self.positions.insert(
            symbol.to_string(),
            SimPosition {
                spot_qty: spot.quantity,
                perp_qty: -perp.quantity,
                spot_entry: spot.price,
                perp_entry: perp.price,
            },
        );
    }

    pub fn apply_close(&mut self, symbol: &str, spot: &LegFill, perp: &LegFill) {
        if let Some(position) = self.positions.remove(symbol) {
            let perp_pnl = (position.perp_entry - perp.price) * position.perp_qty.abs();
            self.cash += spot.notional() + perp_pnl - spot.fee - perp.fee;
        }
    }

    pub fn apply_rebalance(&mut self, symbol: &str, fill: &LegFill) {
        if let Some(position) = self.positions.get_mut(symbol) {
            match fill.side {
                OrderSide::Sell => position.perp_qty -= fill.quantity,
                OrderSide::Buy => position.perp_qty += fill.quantity,
            }
            self.cash -= fill.fee;
        }
    }

    pub fn credit_funding(&mut self, amount: Decimal) {
        self.cash += amount;
    }

    /// Mark-to-market equity given `(spot, perp)` prices per held symbol.
    /// Symbols missing a price are valued at entry.
    pub fn equity(&self, prices: &HashMap<String, (Decimal, Decimal)>) -> Decimal {
        let mut equity = self.cash;
        for (symbol, position) in &self.positions {
            let (spot_price, perp_price) = prices
                .get(symbol)
                .copied()
                .unwrap_or((position.spot_entry, position.perp_entry));
            equity += position.spot_qty * spot_price;
            equity += (position.perp_entry - perp_price) * position.perp_qty.abs();
        }
        equity
    }

    pub fn account_state(&self, prices: &HashMap<String, (Decimal, Decimal)>) -> AccountState {
        let equity = self.equity(prices);
        let perp_notional: Decimal = self
            .positions
            .iter()
            .map(|(symbol, p)| {
                let perp_price = prices
                    .get(symbol)
                    .map(|(_, perp)| *perp)
                    .unwrap_or(p.perp_entry);
                p.perp_qty.abs() * perp_price
            })
            .sum();
        let margin_ratio = if perp_notional.is_zero() {
            dec!(100)
        } else {
            equity / perp_notional
        };
        AccountState {
            equity,
            available_balance: self.cash,
            margin_ratio,
            positions: self
                .positions
                .iter()
                .map(|(symbol, p)| {
                    (
                        symbol.clone(),
                        AccountPosition {
                            spot_qty: p.spot_qty,
                            perp_qty: p.perp_qty,
                        },
                    )
                })
                .collect(),
        }
    }
}
