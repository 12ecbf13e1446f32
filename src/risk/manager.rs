//! Open/close validation and delta-drift enforcement.
//!
//! `validate_open` runs its checks in a fixed order and short-circuits on
//! the first failure: per-symbol exposure cap, total portfolio cap, margin
//! stress projection, position count. The portfolio cap is independent of
//! the per-symbol cap — correlated symbols must not slip past limits by
//! looking diversified.
//!
//! Every rejection carries a human-readable reason as part of the returned
//! `Decision`; the dashboard layer renders these to the operator.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::error;

use crate::engine::book::{Position, PositionBook};
use crate::exchange::AccountState;
use crate::types::OrderPairRequest;

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Max spot-leg notional per symbol, quote currency.
    pub max_symbol_notional: Decimal,
    /// Max summed spot-leg notional across all open positions.
    pub max_portfolio_notional: Decimal,
    /// Reject opens that would project the margin ratio below this floor.
    pub margin_floor: Decimal,
    /// Adverse price move applied in the margin projection.
    pub stress_move: Decimal,
    pub max_positions: usize,
    /// Delta drift tolerance: `|spot + perp| / spot`.
    pub max_delta_drift: Decimal,
    /// Breaches at or below this drift are rebalanced; larger ones force a
    /// close.
    pub rebalance_drift_limit: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_symbol_notional: dec!(10000),
            max_portfolio_notional: dec!(50000),
            margin_floor: dec!(0.15),
            stress_move: dec!(0.10),
            max_positions: 10,
            max_delta_drift: dec!(0.05),
            rebalance_drift_limit: dec!(0.10),
        }
    }
}

impl RiskConfig {
    /// Tight limits for paper sessions.
    pub fn paper_trading() -> Self {
        Self {
            max_symbol_notional: dec!(1000),
            max_portfolio_notional: dec!(3000),
            max_positions: 3,
            ..Self::default()
        }
    }
}

/// Outcome of a risk check. Rejections always explain themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Accept,
    Reject { reason: String },
}

impl Decision {
    fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Accept => None,
            Self::Reject { reason } => Some(reason),
        }
    }
}

/// A delta-neutrality violation observed on an open position.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftBreach {
    pub symbol: String,
    pub drift: Decimal,
    pub limit: Decimal,
}

/// Remediation for a drift breach. Never "log and carry on".
#[derive(Debug, Clone, PartialEq)]
pub enum DriftAction {
    /// Trim or extend the perp leg by this signed base quantity
    /// (negative: sell more perp, positive: buy some back).
    Rebalance { perp_adjustment: Decimal },
    ForceClose,
}

#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Validate a proposed open. Checks run in order and stop at the first
    /// failure.
    pub fn validate_open(
        &self,
        request: &OrderPairRequest,
        book: &PositionBook,
        account: &AccountState,
    ) -> Decision {
        let notional = request.target_notional_usd;

        // (a) per-symbol exposure cap
        let symbol_exposure = book.symbol_notional(&request.symbol);
        if symbol_exposure + notional > self.config.max_symbol_notional {
            return Decision::reject(format!(
                "symbol exposure cap: {} + {} exceeds {} for {}",
                symbol_exposure, notional, self.config.max_symbol_notional, request.symbol
            ));
        }

        // (b) total portfolio cap, independent of (a)
        let portfolio_exposure = book.total_entry_notional();
        if portfolio_exposure + notional > self.config.max_portfolio_notional {
            return Decision::reject(format!(
                "portfolio exposure cap: {} + {} exceeds {}",
                portfolio_exposure, notional, self.config.max_portfolio_notional
            ));
        }

        // (c) margin-health projection under a stress move
        let projected = self.projected_margin_ratio(notional, account);
        if projected < self.config.margin_floor {
            return Decision::reject(format!(
                "margin projection: ratio {:.4} under {}% stress is below floor {}",
                projected,
                self.config.stress_move * dec!(100),
                self.config.margin_floor
            ));
        }

        // (d) max simultaneous positions
        if book.len() >= self.config.max_positions {
            return Decision::reject(format!(
                "position count cap: {} open, limit {}",
                book.len(),
                self.config.max_positions
            ));
        }

        Decision::Accept
    }

    /// Closes only require the position to exist and not be mid-operation.
    pub fn validate_close(&self, symbol: &str, book: &PositionBook) -> Decision {
        match book.position(symbol) {
            None => Decision::reject(format!("no open position for {symbol}")),
            Some(p) if p.locked => {
                Decision::reject(format!("position {symbol} locked by in-flight operation"))
            }
            Some(_) => Decision::Accept,
        }
    }

    /// Called after every fill event, live or backtest.
    pub fn check_delta_drift(&self, position: &Position) -> Option<DriftBreach> {
        let drift = position.delta_drift();
        if drift > self.config.max_delta_drift {
            error!(
                symbol = %position.symbol,
                drift = %drift,
                limit = %self.config.max_delta_drift,
                "INVARIANT VIOLATION: delta drift exceeds tolerance"
            );
            Some(DriftBreach {
                symbol: position.symbol.clone(),
                drift,
                limit: self.config.max_delta_drift,
            })
        } else {
            None
        }
    }

    /// Pick the remediation for a confirmed breach.
    pub fn drift_action(&self, position: &Position, breach: &DriftBreach) -> DriftAction {
        if breach.drift <= self.config.rebalance_drift_limit {
            // Restore perp = -spot.
            DriftAction::Rebalance {
                perp_adjustment: -position.spot_qty - position.perp_qty,
            }
        } else {
            DriftAction::ForceClose
        }
    }

    /// Margin ratio after adding `notional` of perp exposure and applying a
    /// stress move against it. Current perp notional is inferred from the
    /// account's own ratio.
    fn projected_margin_ratio(&self, notional: Decimal, account: &AccountState) -> Decimal {
        if account.equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let current_perp_notional = if account.margin_ratio > Decimal::ZERO {
            account.equity / account.margin_ratio
        } else {
            Decimal::ZERO
        };
        let stressed_equity = account.equity - self.config.stress_move * notional;
        let total_notional = current_perp_notional + notional;
        if total_notional <= Decimal::ZERO {
            return Decimal::MAX;
        }
        stressed_equity / total_notional
    }
}
