//! Signal Engine
//!
//! Pure scoring: the last N funding periods for a symbol in, one
//! `OpportunityScore` out. No I/O, no clocks, no suspension points.
//!
//! Funding rates mean-revert on their settlement cadence, so trend detection
//! uses a short-window (3-9 period) EMA slope. Long-window moving averages
//! and RSI-style oscillators are deliberately absent; they model trending
//! price series, not an 8h-mean-reverting rate.
//!
//! The composite confidence is a weighted sum of four components, each
//! normalized to [0, 1]:
//!
//! - trend: 0.5 for a flat EMA slope, pushed toward 1 when the rate is
//!   rising and toward 0 when it is falling, scaled by slope magnitude
//! - persistence: consecutive periods beyond the threshold, saturating at
//!   `persistence_saturation`
//! - basis: rolling z-score of (perp-spot)/spot mapped from [-3, 3]
//! - volume: 24h volume against its own rolling average, capped at 2x
//!
//! The weighted sum is clamped to [0, 1]. A trivial raw-rate-threshold
//! baseline lives in [`baseline`] and every score carries enough raw inputs
//! that the two can be compared offline.

pub mod baseline;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::store::VisibleObservation;
use crate::types::MarketSnapshot;

const HOURS_PER_YEAR: i64 = 8_760;

/// Direction of the short-window EMA slope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrendDirection {
    Rising,
    Falling,
    Stable,
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rising => write!(f, "rising"),
            Self::Falling => write!(f, "falling"),
            Self::Stable => write!(f, "stable"),
        }
    }
}

/// Relative weights of the four confidence components. Must sum to 1.
#[derive(Debug, Clone, Copy)]
pub struct SignalWeights {
    pub trend: Decimal,
    pub persistence: Decimal,
    pub basis: Decimal,
    pub volume: Decimal,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            trend: dec!(0.35),
            persistence: dec!(0.30),
            basis: dec!(0.20),
            volume: dec!(0.15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// EMA window for trend detection, 3..=9 periods.
    pub ema_window: usize,
    /// Rates beyond this magnitude count toward persistence.
    pub persistence_threshold: Decimal,
    /// Persistence runs at or beyond this length score 1.0.
    pub persistence_saturation: u32,
    /// Rolling window for the basis z-score.
    pub zscore_window: usize,
    /// Minimum settled periods required before a score is meaningful.
    pub min_history: usize,
    /// EMA slopes within this band count as Stable.
    pub stable_slope_epsilon: Decimal,
    pub weights: SignalWeights,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            ema_window: 5,
            persistence_threshold: dec!(0.0001),
            persistence_saturation: 6,
            zscore_window: 30,
            min_history: 6,
            stable_slope_epsilon: dec!(0.00001),
            weights: SignalWeights::default(),
        }
    }
}

impl SignalConfig {
    /// Clamp the EMA window into the supported 3..=9 band.
    pub fn normalized(mut self) -> Self {
        self.ema_window = self.ema_window.clamp(3, 9);
        self
    }
}

/// Per-symbol, per-cycle opportunity assessment. Recomputed every cycle and
/// replaced wholesale, never mutated in place — except for `rejection`,
/// which the deciding stage fills in so the dashboard layer can show the
/// operator why a candidate was passed over.
#[derive(Debug, Clone, Serialize)]
pub struct OpportunityScore {
    pub symbol: String,
    /// Rate the decision acts on: predicted where published, else settled.
    pub raw_rate: Decimal,
    pub trend: TrendDirection,
    /// Magnitude of the EMA slope, normalized to [0, 1].
    pub trend_strength: Decimal,
    /// Consecutive trailing periods beyond the threshold, same sign as
    /// `raw_rate`.
    pub persistence_periods: u32,
    pub basis_zscore: f64,
    /// 24h volume over its rolling average.
    pub volume_ratio: Decimal,
    /// Composite confidence in [0, 1].
    pub confidence: Decimal,
    /// `raw_rate` compounded to a simple annualized yield.
    pub annualized_yield: Decimal,
    /// Why this symbol was not traded this cycle, when it wasn't.
    pub rejection: Option<String>,
    pub timestamp_ms: i64,
}

impl OpportunityScore {
    fn rejected(symbol: &str, timestamp_ms: i64, reason: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            raw_rate: Decimal::ZERO,
            trend: TrendDirection::Stable,
            trend_strength: Decimal::ZERO,
            persistence_periods: 0,
            basis_zscore: 0.0,
            volume_ratio: Decimal::ZERO,
            confidence: Decimal::ZERO,
            annualized_yield: Decimal::ZERO,
            rejection: Some(reason),
            timestamp_ms,
        }
    }
}

/// Simple (non-compounded) annualization of a per-period rate.
pub fn annualized_yield(rate: Decimal, interval_hours: u32) -> Decimal {
    if interval_hours == 0 {
        return Decimal::ZERO;
    }
    rate * Decimal::from(HOURS_PER_YEAR / i64::from(interval_hours))
}

/// Score one symbol from its visible history. Pure.
pub fn score_symbol(
    snapshot: &MarketSnapshot,
    history: &[VisibleObservation],
    basis_history: &[Decimal],
    config: &SignalConfig,
) -> OpportunityScore {
    let settled: Vec<Decimal> = history.iter().filter_map(|o| o.settled_rate).collect();

    if settled.len() < config.min_history {
        return OpportunityScore::rejected(
            &snapshot.symbol,
            snapshot.timestamp_ms,
            format!(
                "insufficient history: {} settled periods, need {}",
                settled.len(),
                config.min_history
            ),
        );
    }

    let raw_rate = snapshot.decision_rate();

    let (trend, trend_strength) = ema_trend(&settled, config);
    let persistence_periods = persistence_run(&settled, raw_rate, config.persistence_threshold);
    let basis_zscore = rolling_zscore(basis_history, config.zscore_window).unwrap_or(0.0);
    let volume_ratio = volume_ratio(snapshot.volume_24h, history);

    let trend_component = match trend {
        TrendDirection::Rising => dec!(0.5) + dec!(0.5) * trend_strength,
        TrendDirection::Stable => dec!(0.5),
        TrendDirection::Falling => dec!(0.5) - dec!(0.5) * trend_strength,
    };
    let persistence_component = clamp01(
        Decimal::from(persistence_periods) / Decimal::from(config.persistence_saturation.max(1)),
    );
    let basis_component = clamp01(
        (Decimal::from_f64_retain(basis_zscore.clamp(-3.0, 3.0)).unwrap_or(Decimal::ZERO)
            + dec!(3))
            / dec!(6),
    );
    let volume_component = clamp01(volume_ratio.min(dec!(2)) / dec!(2));

    let w = &config.weights;
    let confidence = clamp01(
        w.trend * trend_component
            + w.persistence * persistence_component
            + w.basis * basis_component
            + w.volume * volume_component,
    );

    OpportunityScore {
        symbol: snapshot.symbol.clone(),
        raw_rate,
        trend,
        trend_strength,
        persistence_periods,
        basis_zscore,
        volume_ratio,
        confidence,
        annualized_yield: annualized_yield(raw_rate, snapshot.interval_hours),
        rejection: None,
        timestamp_ms: snapshot.timestamp_ms,
    }
}

/// EMA over the settled series plus the slope direction of its last step.
fn ema_trend(settled: &[Decimal], config: &SignalConfig) -> (TrendDirection, Decimal) {
    let window = config.ema_window.clamp(3, 9);
    if settled.len() < 2 {
        return (TrendDirection::Stable, Decimal::ZERO);
    }

    let alpha = dec!(2) / Decimal::from(window as u32 + 1);
    let mut ema = settled[0];
    let mut prev_ema = ema;
    for rate in &settled[1..] {
        prev_ema = ema;
        ema = alpha * rate + (Decimal::ONE - alpha) * ema;
    }

    let slope = ema - prev_ema;
    let direction = if slope > config.stable_slope_epsilon {
        TrendDirection::Rising
    } else if slope < -config.stable_slope_epsilon {
        TrendDirection::Falling
    } else {
        TrendDirection::Stable
    };

    // Slope magnitude measured against the persistence threshold scale.
    let strength = if config.persistence_threshold.is_zero() {
        Decimal::ZERO
    } else {
        clamp01(slope.abs() / config.persistence_threshold)
    };
    (direction, strength)
}

/// Trailing run of settled periods beyond the threshold on `raw_rate`'s side.
fn persistence_run(settled: &[Decimal], raw_rate: Decimal, threshold: Decimal) -> u32 {
    let positive = raw_rate >= Decimal::ZERO;
    settled
        .iter()
        .rev()
        .take_while(|r| {
            if positive {
                **r >= threshold
            } else {
                **r <= -threshold
            }
        })
        .count() as u32
}

/// Z-score of the last point against the rolling window before it.
/// f64 is fine here: this is a dimensionless statistic, not money.
fn rolling_zscore(series: &[Decimal], window: usize) -> Option<f64> {
    if series.len() < 3 {
        return None;
    }
    let tail: Vec<f64> = series
        .iter()
        .rev()
        .take(window.max(3))
        .filter_map(|d| d.to_f64())
        .collect();
    let current = *tail.first()?;
    let history = &tail[1..];
    if history.len() < 2 {
        return None;
    }

    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    let variance = history.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 || !std_dev.is_finite() {
        return Some(0.0);
    }
    let z = (current - mean) / std_dev;
    z.is_finite().then_some(z)
}

fn volume_ratio(current: Decimal, history: &[VisibleObservation]) -> Decimal {
    let volumes: Vec<Decimal> = history
        .iter()
        .map(|o| o.volume_24h)
        .filter(|v| !v.is_zero())
        .collect();
    if volumes.is_empty() {
        return Decimal::ONE;
    }
    let mean = volumes.iter().copied().sum::<Decimal>() / Decimal::from(volumes.len() as u32);
    if mean.is_zero() {
        Decimal::ONE
    } else {
        current / mean
    }
}

fn clamp01(value: Decimal) -> Decimal {
    value.max(Decimal::ZERO).min(Decimal::ONE)
}
