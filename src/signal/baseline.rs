//! Raw-rate-threshold baseline scorer.
//!
//! The composite score in the parent module has to beat this on
//! out-of-sample data or it does not ship. Both scorers are exposed so the
//! comparison can run offline against the same history.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::types::MarketSnapshot;

/// Binary baseline: trade iff the decision rate clears a fixed threshold.
#[derive(Debug, Clone)]
pub struct RawRateBaseline {
    pub threshold: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct BaselineScore {
    pub symbol: String,
    pub raw_rate: Decimal,
    /// 1 when the rate clears the threshold, else 0 — the baseline has no
    /// notion of partial confidence.
    pub confidence: Decimal,
}

impl RawRateBaseline {
    pub fn new(threshold: Decimal) -> Self {
        Self { threshold }
    }

    pub fn score_symbol(&self, snapshot: &MarketSnapshot) -> BaselineScore {
        let raw_rate = snapshot.decision_rate();
        let confidence = if raw_rate >= self.threshold {
            Decimal::ONE
        } else {
            Decimal::ZERO
        };
        BaselineScore {
            symbol: snapshot.symbol.clone(),
            raw_rate,
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(rate: Decimal) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            spot_price: dec!(100),
            perp_price: dec!(100),
            funding_rate: rate,
            predicted_rate: Some(rate),
            interval_hours: 8,
            volume_24h: dec!(1000000),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_baseline_threshold() {
        let baseline = RawRateBaseline::new(dec!(0.0002));
        assert_eq!(
            baseline.score_symbol(&snapshot(dec!(0.0003))).confidence,
            Decimal::ONE
        );
        assert_eq!(
            baseline.score_symbol(&snapshot(dec!(0.0001))).confidence,
            Decimal::ZERO
        );
    }
}
