//! Property-based tests for the financial invariants.
//!
//! These use proptest to verify the delta-neutrality invariant and sizing
//! arithmetic across many random inputs, catching edge cases that unit
//! tests might miss.

use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use basisfarm::engine::book::PositionBook;
use basisfarm::exchange::LegFill;
use basisfarm::risk::{
    round_to_step, DriftAction, PositionSizer, RiskConfig, RiskManager, SizerConfig,
};
use basisfarm::types::{ExchangeConstraints, Leg, OrderId, OrderSide};

fn leg_fill(leg: Leg, side: OrderSide, quantity: Decimal, price: Decimal) -> LegFill {
    LegFill {
        order_id: OrderId::new("prop"),
        leg,
        side,
        quantity,
        price,
        fee: Decimal::ZERO,
        timestamp_ms: 0,
    }
}

/// Open a matched pair in a fresh book.
fn open_pair(qty: Decimal, spot_price: Decimal, perp_price: Decimal) -> PositionBook {
    let mut book = PositionBook::new();
    book.open_from_fills(
        "BTCUSDT",
        &leg_fill(Leg::Spot, OrderSide::Buy, qty, spot_price),
        &leg_fill(Leg::Perp, OrderSide::Sell, qty, perp_price),
        "entry",
        0,
    )
    .expect("fresh book");
    book
}

proptest! {
    /// A successful open always produces a perfectly hedged pair: the
    /// delta-drift invariant holds immediately after every open.
    #[test]
    fn delta_neutral_after_any_open(
        qty_milli in 1i64..1_000_000i64,
        spot_cents in 100i64..10_000_000i64,
        basis_bps in -50i64..50i64,
    ) {
        let qty = Decimal::new(qty_milli, 3);
        let spot = Decimal::new(spot_cents, 2);
        let perp = spot * (Decimal::ONE + Decimal::new(basis_bps, 4));

        let book = open_pair(qty, spot, perp);
        let position = book.position("BTCUSDT").unwrap();

        prop_assert_eq!(position.net_quantity(), Decimal::ZERO);
        prop_assert!(position.delta_drift() <= RiskConfig::default().max_delta_drift);
    }

    /// After any single-leg perturbation, applying the risk manager's
    /// remediation (rebalance or forced close) restores the invariant:
    /// the position is either gone or back inside tolerance.
    #[test]
    fn drift_remediation_restores_invariant(
        qty_milli in 1_000i64..1_000_000i64,
        perturb_pct in -50i64..50i64,
    ) {
        let qty = Decimal::new(qty_milli, 3);
        let mut book = open_pair(qty, dec!(100), dec!(100));
        let risk = RiskManager::new(RiskConfig::default());

        // Perturb the perp leg by up to +/-50% of the pair size.
        let delta = qty * Decimal::new(perturb_pct, 2);
        if !delta.is_zero() {
            let (side, amount) = if delta > Decimal::ZERO {
                (OrderSide::Buy, delta)
            } else {
                (OrderSide::Sell, -delta)
            };
            book.apply_rebalance(
                "BTCUSDT",
                &leg_fill(Leg::Perp, side, amount, dec!(100)),
            )
            .unwrap();
        }

        let position = book.position("BTCUSDT").unwrap();
        if let Some(breach) = risk.check_delta_drift(position) {
            match risk.drift_action(position, &breach) {
                DriftAction::Rebalance { perp_adjustment } => {
                    let (side, amount) = if perp_adjustment < Decimal::ZERO {
                        (OrderSide::Sell, -perp_adjustment)
                    } else {
                        (OrderSide::Buy, perp_adjustment)
                    };
                    book.apply_rebalance(
                        "BTCUSDT",
                        &leg_fill(Leg::Perp, side, amount, dec!(100)),
                    )
                    .unwrap();
                }
                DriftAction::ForceClose => {
                    let perp_qty = book.position("BTCUSDT").unwrap().perp_qty.abs();
                    book.close_with_fills(
                        "BTCUSDT",
                        &leg_fill(Leg::Spot, OrderSide::Sell, qty, dec!(100)),
                        &leg_fill(Leg::Perp, OrderSide::Buy, perp_qty, dec!(100)),
                        "forced close",
                        1,
                    )
                    .unwrap();
                }
            }
        }

        // Invariant after remediation: flat, or hedged within tolerance.
        match book.position("BTCUSDT") {
            None => {}
            Some(position) => prop_assert!(
                position.delta_drift() <= RiskConfig::default().max_delta_drift,
                "drift {} after remediation",
                position.delta_drift()
            ),
        }
    }

    /// Sizing is deterministic and always lands exactly on the lot grid.
    #[test]
    fn sizing_respects_lot_constraints(
        confidence_pct in 0i64..=100i64,
        yield_bps in 0i64..=5000i64,
        exposure in 0i64..=40_000i64,
        balance in 0i64..=100_000i64,
        price_cents in 100i64..=5_000_000i64,
    ) {
        let sizer = PositionSizer::new(SizerConfig::default());
        let constraints = ExchangeConstraints {
            lot_step: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(10),
        };
        let caps = RiskConfig::default();

        let confidence = Decimal::new(confidence_pct, 2);
        let annual_yield = Decimal::new(yield_bps, 4);
        let exposure = Decimal::from(exposure);
        let balance = Decimal::from(balance);
        let price = Decimal::new(price_cents, 2);

        let a = sizer.size(confidence, annual_yield, exposure, balance, price, &constraints, &caps);
        let b = sizer.size(confidence, annual_yield, exposure, balance, price, &constraints, &caps);
        prop_assert_eq!(a, b, "sizing must be deterministic");

        // Either zero ("do not open") or an exact multiple of the lot step
        // at or above every venue minimum.
        if a.is_zero() {
            return Ok(());
        }
        prop_assert_eq!(a % constraints.lot_step, Decimal::ZERO);
        prop_assert!(a >= constraints.min_qty);
        prop_assert!(a * price >= constraints.min_notional);
        // Never exceeds the per-symbol cap or the available balance.
        prop_assert!(a * price <= caps.max_symbol_notional);
        prop_assert!(a * price <= balance);
    }

    /// Rounding down to a step never rounds up and stays on the grid.
    #[test]
    fn round_to_step_properties(
        value_micro in 0i64..1_000_000_000i64,
        step_milli in 1i64..10_000i64,
    ) {
        let value = Decimal::new(value_micro, 6);
        let step = Decimal::new(step_milli, 3);
        let rounded = round_to_step(value, step);

        prop_assert!(rounded <= value);
        prop_assert!(value - rounded < step);
        prop_assert_eq!(rounded % step, Decimal::ZERO);
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_forced_close_on_large_drift() {
        let mut book = open_pair(dec!(10), dec!(100), dec!(100));
        let risk = RiskManager::new(RiskConfig::default());

        // Buy back 30% of the hedge: way past the rebalance limit.
        book.apply_rebalance(
            "BTCUSDT",
            &leg_fill(Leg::Perp, OrderSide::Buy, dec!(3), dec!(100)),
        )
        .unwrap();

        let position = book.position("BTCUSDT").unwrap();
        let breach = risk.check_delta_drift(position).unwrap();
        assert_eq!(risk.drift_action(position, &breach), DriftAction::ForceClose);
    }

    #[test]
    fn test_sizer_zero_is_do_not_open() {
        let sizer = PositionSizer::new(SizerConfig {
            base_notional: dec!(5),
            ..SizerConfig::default()
        });
        let qty = sizer.size(
            dec!(1),
            dec!(0.1),
            Decimal::ZERO,
            dec!(100000),
            dec!(100),
            &ExchangeConstraints::default(),
            &RiskConfig::default(),
        );
        // $5 of target cannot satisfy the $10 venue minimum.
        assert_eq!(qty, Decimal::ZERO);
    }
}
