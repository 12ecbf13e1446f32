//! Common Types Module
//!
//! Shared types used across the codebase to avoid circular dependencies.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that unwinds this one.
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// The two legs of a funding-harvest pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Leg {
    Spot,
    Perp,
}

impl std::fmt::Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Leg::Spot => write!(f, "spot"),
            Leg::Perp => write!(f, "perp"),
        }
    }
}

/// Side convention for an order pair. The only convention this system trades
/// is long spot hedged by an equal short perp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairConvention {
    LongSpotShortPerp,
}

/// The unit the risk manager and executors operate on. A pair is never split
/// into independent legs at this boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPairRequest {
    /// Logical asset symbol (e.g., "BTCUSDT").
    pub symbol: String,
    /// Target notional for each leg, in quote currency.
    pub target_notional_usd: Decimal,
    pub convention: PairConvention,
}

/// Type-safe order identifier (exchange-assigned).
///
/// Newtype wrapper so order ids cannot be mixed with other strings
/// at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(String);

impl OrderId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let s: String = id.into();
        debug_assert!(!s.is_empty(), "OrderId cannot be empty");
        Self(s)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A single point-in-time view of one symbol's market: both legs' prices,
/// the funding state, and liquidity.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub spot_price: Decimal,
    pub perp_price: Decimal,
    /// Most recently settled funding rate (per settlement period, as a fraction).
    pub funding_rate: Decimal,
    /// Predicted rate for the period currently accruing, when the venue
    /// publishes one.
    pub predicted_rate: Option<Decimal>,
    /// Settlement interval of the current period.
    pub interval_hours: u32,
    pub volume_24h: Decimal,
    pub timestamp_ms: i64,
}

impl MarketSnapshot {
    /// Basis of perp over spot as a fraction of the spot price.
    pub fn basis(&self) -> Decimal {
        if self.spot_price.is_zero() {
            Decimal::ZERO
        } else {
            (self.perp_price - self.spot_price) / self.spot_price
        }
    }

    /// The rate a decision made *now* is allowed to act on: the predicted
    /// rate when published, otherwise the last settled one.
    pub fn decision_rate(&self) -> Decimal {
        self.predicted_rate.unwrap_or(self.funding_rate)
    }
}

/// Lot and minimum constraints a venue imposes on order quantities.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeConstraints {
    /// Quantity step; executable quantities are integer multiples of this.
    pub lot_step: Decimal,
    /// Smallest executable quantity.
    pub min_qty: Decimal,
    /// Smallest executable notional per leg, in quote currency.
    pub min_notional: Decimal,
}

impl Default for ExchangeConstraints {
    fn default() -> Self {
        Self {
            lot_step: Decimal::new(1, 3),      // 0.001
            min_qty: Decimal::new(1, 3),       // 0.001
            min_notional: Decimal::new(10, 0), // $10
        }
    }
}

/// Time abstraction so the identical decision path runs on wall-clock time
/// live and on the replay clock in backtests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> i64;

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.now_ms()).unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_snapshot_basis() {
        let snap = MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            spot_price: dec!(100),
            perp_price: dec!(101),
            funding_rate: dec!(0.0001),
            predicted_rate: None,
            interval_hours: 8,
            volume_24h: dec!(1000000),
            timestamp_ms: 0,
        };
        assert_eq!(snap.basis(), dec!(0.01));
        assert_eq!(snap.decision_rate(), dec!(0.0001));
    }

    #[test]
    fn test_decision_rate_prefers_predicted() {
        let snap = MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            spot_price: dec!(100),
            perp_price: dec!(100),
            funding_rate: dec!(-0.0005),
            predicted_rate: Some(dec!(0.0003)),
            interval_hours: 8,
            volume_24h: dec!(1000000),
            timestamp_ms: 0,
        };
        assert_eq!(snap.decision_rate(), dec!(0.0003));
    }
}
