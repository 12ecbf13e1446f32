//! Conviction-scaled position sizing.
//!
//! Linear-bounded scaling, deliberately not Kelly:
//!
//! ```text
//! target = base_notional * clamp(confidence * yield / baseline_yield, 1, max_multiplier)
//! ```
//!
//! then re-clamped by the risk manager's per-symbol and portfolio caps and
//! by the available balance, then rounded down to the venue's lot step.
//! Both legs trade the same base quantity, so their notionals match by
//! construction; asymmetric leg sizing is an invariant violation, not an
//! optimization. Targets that round below the venue minimum size to zero:
//! "do not open".

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::RiskConfig;
use crate::types::ExchangeConstraints;

#[derive(Debug, Clone)]
pub struct SizerConfig {
    /// Notional per leg at multiplier 1, quote currency.
    pub base_notional: Decimal,
    /// Annualized yield at which conviction scaling starts to bite.
    pub baseline_yield: Decimal,
    pub max_multiplier: Decimal,
}

impl Default for SizerConfig {
    fn default() -> Self {
        Self {
            base_notional: dec!(1000),
            baseline_yield: dec!(0.10),
            max_multiplier: dec!(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: SizerConfig,
}

impl PositionSizer {
    pub fn new(config: SizerConfig) -> Self {
        Self { config }
    }

    /// Compute the executable base quantity for both legs. Deterministic;
    /// returns zero when the clamped target cannot meet the venue minimums.
    #[allow(clippy::too_many_arguments)]
    pub fn size(
        &self,
        confidence: Decimal,
        annualized_yield: Decimal,
        current_exposure: Decimal,
        available_balance: Decimal,
        spot_price: Decimal,
        constraints: &ExchangeConstraints,
        caps: &RiskConfig,
    ) -> Decimal {
        if spot_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let conviction = if self.config.baseline_yield > Decimal::ZERO {
            confidence * annualized_yield / self.config.baseline_yield
        } else {
            confidence
        };
        let multiplier = conviction.max(Decimal::ONE).min(self.config.max_multiplier);
        let mut notional = self.config.base_notional * multiplier;

        // Hard caps from the risk manager, then cash.
        notional = notional
            .min(caps.max_symbol_notional)
            .min(caps.max_portfolio_notional - current_exposure)
            .min(available_balance);
        if notional <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let quantity = round_to_step(notional / spot_price, constraints.lot_step);
        if quantity < constraints.min_qty || quantity * spot_price < constraints.min_notional {
            return Decimal::ZERO;
        }
        quantity
    }
}

/// Round down to an integer multiple of `step`.
pub fn round_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    (quantity / step).floor() * step
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer() -> PositionSizer {
        PositionSizer::new(SizerConfig::default())
    }

    fn constraints() -> ExchangeConstraints {
        ExchangeConstraints {
            lot_step: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(10),
        }
    }

    #[test]
    fn test_base_size_at_low_conviction() {
        // clamp(conf * yield/baseline, 1, max) floors at 1x.
        let qty = sizer().size(
            dec!(0.1),
            dec!(0.05),
            Decimal::ZERO,
            dec!(100000),
            dec!(100),
            &constraints(),
            &RiskConfig::default(),
        );
        assert_eq!(qty, dec!(10)); // 1000 / 100
    }

    #[test]
    fn test_conviction_scales_up_to_cap() {
        // conf 1.0, yield 5x baseline -> multiplier clamped at 3.
        let qty = sizer().size(
            dec!(1),
            dec!(0.50),
            Decimal::ZERO,
            dec!(100000),
            dec!(100),
            &constraints(),
            &RiskConfig::default(),
        );
        assert_eq!(qty, dec!(30)); // 3000 / 100
    }

    #[test]
    fn test_deterministic() {
        let a = sizer().size(
            dec!(0.7),
            dec!(0.2),
            dec!(500),
            dec!(5000),
            dec!(123.45),
            &constraints(),
            &RiskConfig::default(),
        );
        let b = sizer().size(
            dec!(0.7),
            dec!(0.2),
            dec!(500),
            dec!(5000),
            dec!(123.45),
            &constraints(),
            &RiskConfig::default(),
        );
        assert_eq!(a, b);
        // Result is an exact multiple of the lot step.
        assert_eq!(a % dec!(0.001), Decimal::ZERO);
    }

    #[test]
    fn test_portfolio_headroom_clamps() {
        let caps = RiskConfig {
            max_portfolio_notional: dec!(1200),
            ..RiskConfig::default()
        };
        let qty = sizer().size(
            dec!(1),
            dec!(0.50),
            dec!(1000), // only 200 of headroom left
            dec!(100000),
            dec!(100),
            &constraints(),
            &caps,
        );
        assert_eq!(qty, dec!(2)); // 200 / 100
    }

    #[test]
    fn test_returns_zero_below_minimum() {
        let tight = ExchangeConstraints {
            lot_step: dec!(1),
            min_qty: dec!(1),
            min_notional: dec!(10),
        };
        // Target rounds to 0 lots at 2000/lot.
        let qty = sizer().size(
            dec!(0.5),
            dec!(0.05),
            Decimal::ZERO,
            dec!(100000),
            dec!(2000),
            &tight,
            &RiskConfig::default(),
        );
        assert_eq!(qty, Decimal::ZERO);
    }

    #[test]
    fn test_zero_when_no_balance() {
        let qty = sizer().size(
            dec!(1),
            dec!(0.5),
            Decimal::ZERO,
            Decimal::ZERO,
            dec!(100),
            &constraints(),
            &RiskConfig::default(),
        );
        assert_eq!(qty, Decimal::ZERO);
    }

    #[test]
    fn test_round_to_step() {
        assert_eq!(round_to_step(dec!(10.0009), dec!(0.001)), dec!(10));
        assert_eq!(round_to_step(dec!(0.12345), dec!(0.01)), dec!(0.12));
        assert_eq!(round_to_step(dec!(5), Decimal::ZERO), dec!(5));
    }
}
