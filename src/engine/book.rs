//! Position book and trade ledger.
//!
//! The book is owned exclusively by one orchestrator instance and mutated
//! only inside its decision cycle. Backtest workers construct their own
//! books; nothing here is shared between live and replay paths.

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::exchange::LegFill;

#[derive(Debug, Error, PartialEq)]
pub enum BookError {
    #[error("position already open for {0}")]
    AlreadyOpen(String),

    #[error("no open position for {0}")]
    NotFound(String),

    #[error("position for {0} is locked by an in-flight operation")]
    Locked(String),
}

/// One funding settlement credited (or debited) to an open position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FundingPayment {
    pub timestamp_ms: i64,
    pub amount: Decimal,
}

/// An open delta-neutral pair: long spot hedged by short perp.
///
/// Invariant: after a successful open, `|spot_qty + perp_qty| / spot_qty`
/// stays within the configured drift tolerance; the risk manager checks it
/// after every fill and a breach triggers remediation, never tolerance.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    /// Long spot quantity, positive.
    pub spot_qty: Decimal,
    /// Short perp quantity, negative.
    pub perp_qty: Decimal,
    pub spot_entry_price: Decimal,
    pub perp_entry_price: Decimal,
    pub opened_at_ms: i64,
    pub entry_fee: Decimal,
    pub accumulated_funding: Decimal,
    pub accumulated_fees: Decimal,
    /// Settlement instant of the last funding accrual applied.
    pub last_funding_ms: i64,
    /// Set while a close or rebalance is in flight.
    pub locked: bool,
    pub entry_reason: String,
    funding_payments: Vec<FundingPayment>,
}

impl Position {
    /// Net base-quantity exposure; zero when perfectly hedged.
    pub fn net_quantity(&self) -> Decimal {
        self.spot_qty + self.perp_qty
    }

    /// `|spot + perp| / |spot|` — the delta-neutrality drift measure.
    pub fn delta_drift(&self) -> Decimal {
        if self.spot_qty.is_zero() {
            return Decimal::ZERO;
        }
        (self.net_quantity() / self.spot_qty).abs()
    }

    /// Entry notional of the spot leg.
    pub fn entry_notional(&self) -> Decimal {
        self.spot_qty * self.spot_entry_price
    }

    pub fn perp_entry_notional(&self) -> Decimal {
        self.perp_qty.abs() * self.perp_entry_price
    }

    pub fn funding_payments(&self) -> &[FundingPayment] {
        &self.funding_payments
    }
}

/// Closed-trade ledger entry. Immutable once created; the ledger is
/// append-only and never edited in place.
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub trade_id: String,
    pub symbol: String,
    pub entry_time_ms: i64,
    pub exit_time_ms: i64,
    pub spot_entry_price: Decimal,
    pub perp_entry_price: Decimal,
    pub spot_exit_price: Decimal,
    pub perp_exit_price: Decimal,
    pub quantity: Decimal,
    pub entry_fee: Decimal,
    pub exit_fee: Decimal,
    pub funding_payments: Vec<FundingPayment>,
    pub net_pnl: Decimal,
    pub holding_periods: u32,
    pub entry_reason: String,
    pub exit_reason: String,
}

impl Trade {
    pub fn total_funding(&self) -> Decimal {
        self.funding_payments.iter().map(|p| p.amount).sum()
    }
}

/// All open positions plus the realized-trade ledger.
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: std::collections::HashMap<String, Position>,
    ledger: Vec<Trade>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.positions.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Sum of spot-leg entry notionals across all open positions.
    pub fn total_entry_notional(&self) -> Decimal {
        self.positions.values().map(|p| p.entry_notional()).sum()
    }

    pub fn symbol_notional(&self, symbol: &str) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| p.entry_notional())
            .unwrap_or(Decimal::ZERO)
    }

    /// Create a position from a matched pair of entry fills.
    pub fn open_from_fills(
        &mut self,
        symbol: &str,
        spot: &LegFill,
        perp: &LegFill,
        entry_reason: &str,
        opened_at_ms: i64,
    ) -> Result<&Position, BookError> {
        if self.positions.contains_key(symbol) {
            return Err(BookError::AlreadyOpen(symbol.to_string()));
        }
        let position = Position {
            symbol: symbol.to_string(),
            spot_qty: spot.quantity,
            perp_qty: -perp.quantity,
            spot_entry_price: spot.price,
            perp_entry_price: perp.price,
            opened_at_ms,
            entry_fee: spot.fee + perp.fee,
            accumulated_funding: Decimal::ZERO,
            accumulated_fees: spot.fee + perp.fee,
            last_funding_ms: opened_at_ms,
            locked: false,
            entry_reason: entry_reason.to_string(),
            funding_payments: Vec::new(),
        };
        self.positions.insert(symbol.to_string(), position);
        Ok(&self.positions[symbol])
    }

    /// Retire a position against a matched pair of exit fills, appending the
    /// realized trade to the ledger.
    pub fn close_with_fills(
        &mut self,
        symbol: &str,
        spot_exit: &LegFill,
        perp_exit: &LegFill,
        exit_reason: &str,
        closed_at_ms: i64,
    ) -> Result<Trade, BookError> {
        let position = self
            .positions
            .remove(symbol)
            .ok_or_else(|| BookError::NotFound(symbol.to_string()))?;

        let quantity = position.spot_qty;
        let exit_fee = spot_exit.fee + perp_exit.fee;
        let price_pnl = (spot_exit.price - position.spot_entry_price) * quantity
            + (position.perp_entry_price - perp_exit.price) * position.perp_qty.abs();
        let funding = position.accumulated_funding;
        // accumulated_fees covers entry plus any rebalance fills.
        let net_pnl = price_pnl + funding - position.accumulated_fees - exit_fee;

        let trade = Trade {
            trade_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            entry_time_ms: position.opened_at_ms,
            exit_time_ms: closed_at_ms,
            spot_entry_price: position.spot_entry_price,
            perp_entry_price: position.perp_entry_price,
            spot_exit_price: spot_exit.price,
            perp_exit_price: perp_exit.price,
            quantity,
            entry_fee: position.entry_fee,
            exit_fee,
            holding_periods: position.funding_payments.len() as u32,
            funding_payments: position.funding_payments,
            net_pnl,
            entry_reason: position.entry_reason,
            exit_reason: exit_reason.to_string(),
        };
        self.ledger.push(trade.clone());
        Ok(trade)
    }

    /// Credit a funding settlement to an open position.
    pub fn accrue_funding(
        &mut self,
        symbol: &str,
        timestamp_ms: i64,
        amount: Decimal,
    ) -> Result<(), BookError> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| BookError::NotFound(symbol.to_string()))?;
        position.accumulated_funding += amount;
        position.last_funding_ms = timestamp_ms;
        position.funding_payments.push(FundingPayment {
            timestamp_ms,
            amount,
        });
        Ok(())
    }

    /// Apply a perp-leg rebalance fill to restore neutrality.
    pub fn apply_rebalance(&mut self, symbol: &str, fill: &LegFill) -> Result<(), BookError> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| BookError::NotFound(symbol.to_string()))?;
        match fill.side {
            crate::types::OrderSide::Sell => position.perp_qty -= fill.quantity,
            crate::types::OrderSide::Buy => position.perp_qty += fill.quantity,
        }
        position.accumulated_fees += fill.fee;
        Ok(())
    }

    /// Overwrite leg quantities with the executor's authoritative numbers
    /// during reconciliation.
    pub fn adopt_quantities(
        &mut self,
        symbol: &str,
        spot_qty: Decimal,
        perp_qty: Decimal,
    ) -> Result<(), BookError> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| BookError::NotFound(symbol.to_string()))?;
        position.spot_qty = spot_qty;
        position.perp_qty = perp_qty;
        Ok(())
    }

    pub fn lock(&mut self, symbol: &str) -> Result<(), BookError> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| BookError::NotFound(symbol.to_string()))?;
        if position.locked {
            return Err(BookError::Locked(symbol.to_string()));
        }
        position.locked = true;
        Ok(())
    }

    pub fn unlock(&mut self, symbol: &str) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.locked = false;
        }
    }

    pub fn trades(&self) -> &[Trade] {
        &self.ledger
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.ledger.iter().map(|t| t.net_pnl).sum()
    }

    pub fn unrealized_funding(&self) -> Decimal {
        self.positions
            .values()
            .map(|p| p.accumulated_funding)
            .sum()
    }
}
