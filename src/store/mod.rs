//! Historical Data Store
//!
//! Append-mostly time-series storage for funding-rate observations and price
//! klines, keyed by (symbol, timestamp).
//!
//! # Architecture
//!
//! - `put_*` is idempotent: a duplicate (symbol, timestamp) key is a no-op.
//! - `query_funding` returns a timestamp-ordered series with gaps surfaced
//!   explicitly, never interpolated.
//! - `as_of(ts)` returns a view that masks everything a decision made at
//!   `ts` could not have seen. Views are the only access path handed to the
//!   replay machinery; they cannot be widened by callers.
//!
//! # Visibility
//!
//! An observation's `timestamp_ms` is its settlement instant: the record's
//! `predicted_rate` is visible from the start of the accruing period
//! (`timestamp_ms - interval`), its `settled_rate` only from `timestamp_ms`.
//! A kline is visible once its bar has closed.

mod persistence;

pub use persistence::{StoreError, StoreSnapshot};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::types::MarketSnapshot;

const MS_PER_HOUR: i64 = 3_600_000;

/// Tolerance when deciding whether the next settlement arrived on schedule.
const GAP_TOLERANCE_MS: i64 = 60_000;

/// Perp klines are stored under the logical symbol plus this suffix; spot
/// klines under the logical symbol itself.
pub fn perp_symbol(symbol: &str) -> String {
    format!("{symbol}.P")
}

/// One funding settlement record. Immutable once stored. The settlement
/// interval is carried per record because venues change cadence over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingObservation {
    pub symbol: String,
    /// Settlement instant (ms, UTC). The period this record covers is
    /// `(timestamp_ms - interval, timestamp_ms]`.
    pub timestamp_ms: i64,
    /// Rate fixed at settlement. `None` while the period is still accruing.
    pub settled_rate: Option<Decimal>,
    /// Rate the venue predicted before settlement, when published.
    pub predicted_rate: Option<Decimal>,
    pub interval_hours: u32,
    pub volume_24h: Decimal,
}

impl FundingObservation {
    pub fn interval_ms(&self) -> i64 {
        i64::from(self.interval_hours) * MS_PER_HOUR
    }

    /// Start of the period this record covers.
    pub fn period_start_ms(&self) -> i64 {
        self.timestamp_ms - self.interval_ms()
    }
}

/// OHLCV bar. Immutable once stored; used for fill simulation and slippage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceKline {
    pub symbol: String,
    /// Bar length in minutes.
    pub interval_minutes: u32,
    pub open_time_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl PriceKline {
    pub fn close_time_ms(&self) -> i64 {
        self.open_time_ms + i64::from(self.interval_minutes) * 60_000
    }
}

/// A hole in a funding series: settlements that should exist but do not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub from_ms: i64,
    pub to_ms: i64,
    pub missing_periods: u32,
}

/// Ordered query result; gaps are reported, never filled in.
#[derive(Debug, Clone)]
pub struct FundingSeries {
    pub records: Vec<FundingObservation>,
    pub gaps: Vec<Gap>,
}

impl FundingSeries {
    pub fn has_gaps(&self) -> bool {
        !self.gaps.is_empty()
    }

    pub fn missing_periods(&self) -> u32 {
        self.gaps.iter().map(|g| g.missing_periods).sum()
    }
}

/// An observation as visible at some cutoff: the settled rate is masked
/// while the period it belongs to has not settled yet.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleObservation {
    pub timestamp_ms: i64,
    pub predicted_rate: Option<Decimal>,
    pub settled_rate: Option<Decimal>,
    pub interval_hours: u32,
    pub volume_24h: Decimal,
}

/// A settled funding payment event, used for accrual.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FundingEvent {
    pub timestamp_ms: i64,
    pub rate: Decimal,
    pub interval_hours: u32,
}

/// In-memory time-series store, internally synchronized so it can be shared
/// behind an `Arc` between the collector, the live engine, and backtest
/// workers.
#[derive(Debug, Default)]
pub struct HistoricalStore {
    funding: RwLock<HashMap<String, BTreeMap<i64, FundingObservation>>>,
    klines: RwLock<HashMap<String, BTreeMap<i64, PriceKline>>>,
}

impl HistoricalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one observation. Returns `false` when the (symbol, timestamp)
    /// key already exists; the stored record is left untouched.
    pub fn put_funding(&self, obs: FundingObservation) -> bool {
        let mut funding = self.funding.write().expect("funding lock poisoned");
        let series = funding.entry(obs.symbol.clone()).or_default();
        if series.contains_key(&obs.timestamp_ms) {
            debug!(
                symbol = %obs.symbol,
                timestamp_ms = obs.timestamp_ms,
                "Duplicate funding observation ignored"
            );
            return false;
        }
        series.insert(obs.timestamp_ms, obs);
        true
    }

    /// Append a batch; returns how many records were new.
    pub fn put_funding_batch(&self, batch: impl IntoIterator<Item = FundingObservation>) -> usize {
        batch.into_iter().filter(|o| self.put_funding(o.clone())).count()
    }

    /// Append one kline. Idempotent on (symbol, open_time).
    pub fn put_kline(&self, kline: PriceKline) -> bool {
        let mut klines = self.klines.write().expect("kline lock poisoned");
        let series = klines.entry(kline.symbol.clone()).or_default();
        if series.contains_key(&kline.open_time_ms) {
            return false;
        }
        series.insert(kline.open_time_ms, kline);
        true
    }

    pub fn put_kline_batch(&self, batch: impl IntoIterator<Item = PriceKline>) -> usize {
        batch.into_iter().filter(|k| self.put_kline(k.clone())).count()
    }

    /// Ordered funding records in `[since, until]` with gap accounting.
    pub fn query_funding(&self, symbol: &str, since_ms: i64, until_ms: i64) -> FundingSeries {
        let funding = self.funding.read().expect("funding lock poisoned");
        let records: Vec<FundingObservation> = funding
            .get(symbol)
            .map(|series| {
                series
                    .range(since_ms..=until_ms)
                    .map(|(_, obs)| obs.clone())
                    .collect()
            })
            .unwrap_or_default();
        let gaps = detect_gaps(&records);
        FundingSeries { records, gaps }
    }

    /// All settlement instants across `symbols` in `[since, until]`,
    /// deduplicated and ascending. These are the replay engine's ticks.
    pub fn settlement_ticks(&self, symbols: &[String], since_ms: i64, until_ms: i64) -> Vec<i64> {
        let funding = self.funding.read().expect("funding lock poisoned");
        let mut ticks = BTreeSet::new();
        for symbol in symbols {
            if let Some(series) = funding.get(symbol) {
                for ts in series.range(since_ms..=until_ms).map(|(ts, _)| *ts) {
                    ticks.insert(ts);
                }
            }
        }
        ticks.into_iter().collect()
    }

    pub fn symbols(&self) -> Vec<String> {
        let funding = self.funding.read().expect("funding lock poisoned");
        let mut symbols: Vec<String> = funding.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// A visibility-restricted view pinned to `cutoff_ms`. Crate-private:
    /// views are only handed out by the live provider and the replay engine.
    pub(crate) fn as_of(self: &Arc<Self>, cutoff_ms: i64) -> AsOfView {
        AsOfView {
            store: Arc::clone(self),
            cutoff: Cutoff::Fixed(cutoff_ms),
        }
    }

    /// A view whose cutoff follows a replay clock owned by the caller.
    pub(crate) fn as_of_clock(self: &Arc<Self>, clock: Arc<AtomicI64>) -> AsOfView {
        AsOfView {
            store: Arc::clone(self),
            cutoff: Cutoff::Clock(clock),
        }
    }
}

fn detect_gaps(records: &[FundingObservation]) -> Vec<Gap> {
    let mut gaps = Vec::new();
    for pair in records.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let expected = prev.timestamp_ms + prev.interval_ms();
        if next.timestamp_ms > expected + GAP_TOLERANCE_MS {
            let span = next.timestamp_ms - expected;
            let missing = (span + prev.interval_ms() - 1) / prev.interval_ms();
            gaps.push(Gap {
                from_ms: expected,
                to_ms: next.timestamp_ms,
                missing_periods: missing as u32,
            });
        }
    }
    gaps
}

#[derive(Clone)]
enum Cutoff {
    Fixed(i64),
    Clock(Arc<AtomicI64>),
}

impl std::fmt::Debug for Cutoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cutoff::Fixed(ts) => write!(f, "Fixed({ts})"),
            Cutoff::Clock(c) => write!(f, "Clock({})", c.load(Ordering::Acquire)),
        }
    }
}

/// Time-bounded store view. Everything reachable through it was visible at
/// the cutoff; there is no API to move the cutoff from the outside.
#[derive(Debug, Clone)]
pub struct AsOfView {
    store: Arc<HistoricalStore>,
    cutoff: Cutoff,
}

impl AsOfView {
    pub fn now_ms(&self) -> i64 {
        match &self.cutoff {
            Cutoff::Fixed(ts) => *ts,
            Cutoff::Clock(clock) => clock.load(Ordering::Acquire),
        }
    }

    /// Up to `max_periods` most recent observations with at least one field
    /// visible, ascending, settled rates masked where not yet knowable.
    pub fn funding_history(&self, symbol: &str, max_periods: usize) -> Vec<VisibleObservation> {
        let cutoff = self.now_ms();
        let funding = self.store.funding.read().expect("funding lock poisoned");
        let Some(series) = funding.get(symbol) else {
            return Vec::new();
        };
        let mut visible: Vec<VisibleObservation> = series
            .values()
            .rev()
            .filter(|obs| obs.period_start_ms() <= cutoff)
            .take(max_periods)
            .map(|obs| VisibleObservation {
                timestamp_ms: obs.timestamp_ms,
                predicted_rate: obs.predicted_rate,
                settled_rate: if obs.timestamp_ms <= cutoff {
                    obs.settled_rate
                } else {
                    None
                },
                interval_hours: obs.interval_hours,
                volume_24h: obs.volume_24h,
            })
            .collect();
        visible.reverse();
        visible
    }

    /// Settled funding payments with `after_ms < timestamp <= cutoff`.
    pub fn funding_events(&self, symbol: &str, after_ms: i64) -> Vec<FundingEvent> {
        let cutoff = self.now_ms();
        let funding = self.store.funding.read().expect("funding lock poisoned");
        let Some(series) = funding.get(symbol) else {
            return Vec::new();
        };
        series
            .range((after_ms + 1)..=cutoff)
            .filter_map(|(_, obs)| {
                obs.settled_rate.map(|rate| FundingEvent {
                    timestamp_ms: obs.timestamp_ms,
                    rate,
                    interval_hours: obs.interval_hours,
                })
            })
            .collect()
    }

    /// Close of the latest bar that had closed by the cutoff.
    pub fn mark_price(&self, kline_symbol: &str) -> Option<Decimal> {
        let cutoff = self.now_ms();
        let klines = self.store.klines.read().expect("kline lock poisoned");
        let series = klines.get(kline_symbol)?;
        series
            .values()
            .rev()
            .find(|k| k.close_time_ms() <= cutoff)
            .map(|k| k.close)
    }

    /// Basis series over matching closed spot/perp bars, oldest first.
    pub fn basis_history(&self, symbol: &str, max_points: usize) -> Vec<Decimal> {
        let cutoff = self.now_ms();
        let perp_sym = perp_symbol(symbol);
        let klines = self.store.klines.read().expect("kline lock poisoned");
        let (Some(spot), Some(perp)) = (klines.get(symbol), klines.get(&perp_sym)) else {
            return Vec::new();
        };
        let mut basis: Vec<Decimal> = spot
            .values()
            .rev()
            .filter(|k| k.close_time_ms() <= cutoff && !k.close.is_zero())
            .filter_map(|s| {
                perp.get(&s.open_time_ms)
                    .map(|p| (p.close - s.close) / s.close)
            })
            .take(max_points)
            .collect();
        basis.reverse();
        basis
    }

    /// Market snapshot a decision at the cutoff is entitled to: last settled
    /// rate, the currently-accruing period's prediction, closed-bar prices.
    pub fn snapshot(&self, symbol: &str) -> Option<MarketSnapshot> {
        let cutoff = self.now_ms();
        let history = self.funding_history(symbol, 2);
        let newest = history.last()?;

        // The newest visible record either settled already (its prediction is
        // stale) or is still accruing (its prediction is live).
        let (settled, predicted, interval_hours, volume) = if newest.timestamp_ms <= cutoff {
            (newest.settled_rate, None, newest.interval_hours, newest.volume_24h)
        } else {
            let prior_settled = history
                .iter()
                .rev()
                .find(|o| o.timestamp_ms <= cutoff)
                .and_then(|o| o.settled_rate);
            (prior_settled, newest.predicted_rate, newest.interval_hours, newest.volume_24h)
        };

        let spot_price = self.mark_price(symbol)?;
        let perp_price = self.mark_price(&perp_symbol(symbol))?;

        Some(MarketSnapshot {
            symbol: symbol.to_string(),
            spot_price,
            perp_price,
            funding_rate: settled.unwrap_or(Decimal::ZERO),
            predicted_rate: predicted,
            interval_hours,
            volume_24h: volume,
            timestamp_ms: cutoff,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn obs(symbol: &str, ts: i64, settled: Decimal, predicted: Decimal) -> FundingObservation {
        FundingObservation {
            symbol: symbol.to_string(),
            timestamp_ms: ts,
            settled_rate: Some(settled),
            predicted_rate: Some(predicted),
            interval_hours: 8,
            volume_24h: dec!(5000000),
        }
    }

    const HOUR: i64 = 3_600_000;

    #[test]
    fn test_put_is_idempotent() {
        let store = HistoricalStore::new();
        let o = obs("BTCUSDT", 8 * HOUR, dec!(0.0001), dec!(0.0001));
        assert!(store.put_funding(o.clone()));
        assert!(!store.put_funding(o));

        let series = store.query_funding("BTCUSDT", 0, 100 * HOUR);
        assert_eq!(series.records.len(), 1);
    }

    #[test]
    fn test_query_ordering_and_gaps() {
        let store = HistoricalStore::new();
        // 8h cadence with two missing settlements between 16h and 40h.
        for ts in [8 * HOUR, 16 * HOUR, 40 * HOUR, 48 * HOUR] {
            store.put_funding(obs("BTCUSDT", ts, dec!(0.0001), dec!(0.0001)));
        }
        let series = store.query_funding("BTCUSDT", 0, 50 * HOUR);
        assert_eq!(series.records.len(), 4);
        assert!(series
            .records
            .windows(2)
            .all(|w| w[0].timestamp_ms < w[1].timestamp_ms));
        assert_eq!(series.gaps.len(), 1);
        assert_eq!(series.gaps[0].from_ms, 24 * HOUR);
        assert_eq!(series.gaps[0].to_ms, 40 * HOUR);
        assert_eq!(series.missing_periods(), 2);
    }

    #[test]
    fn test_as_of_masks_unsettled_rate() {
        let store = Arc::new(HistoricalStore::new());
        store.put_funding(obs("BTCUSDT", 16 * HOUR, dec!(-0.0005), dec!(0.0003)));

        // Mid-period: prediction visible, settlement not.
        let view = store.as_of(12 * HOUR);
        let history = view.funding_history("BTCUSDT", 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].predicted_rate, Some(dec!(0.0003)));
        assert_eq!(history[0].settled_rate, None);

        // After settlement both are visible.
        let view = store.as_of(16 * HOUR);
        let history = view.funding_history("BTCUSDT", 10);
        assert_eq!(history[0].settled_rate, Some(dec!(-0.0005)));
    }

    #[test]
    fn test_as_of_hides_future_records() {
        let store = Arc::new(HistoricalStore::new());
        store.put_funding(obs("BTCUSDT", 8 * HOUR, dec!(0.0001), dec!(0.0001)));
        store.put_funding(obs("BTCUSDT", 16 * HOUR, dec!(0.0002), dec!(0.0002)));
        store.put_funding(obs("BTCUSDT", 24 * HOUR, dec!(0.0004), dec!(0.0004)));

        let view = store.as_of(9 * HOUR);
        let history = view.funding_history("BTCUSDT", 10);
        // The 24h record's period has not even started at 9h.
        assert_eq!(history.len(), 2);
        assert_eq!(history.last().unwrap().timestamp_ms, 16 * HOUR);
    }

    #[test]
    fn test_funding_events_window() {
        let store = Arc::new(HistoricalStore::new());
        for (i, ts) in [8 * HOUR, 16 * HOUR, 24 * HOUR].iter().enumerate() {
            store.put_funding(obs(
                "BTCUSDT",
                *ts,
                Decimal::new(i as i64 + 1, 4),
                dec!(0),
            ));
        }
        let view = store.as_of(24 * HOUR);
        let events = view.funding_events("BTCUSDT", 8 * HOUR);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp_ms, 16 * HOUR);
        assert_eq!(events[1].rate, dec!(0.0003));
    }

    #[test]
    fn test_mark_price_uses_closed_bars_only() {
        let store = Arc::new(HistoricalStore::new());
        store.put_kline(PriceKline {
            symbol: "BTCUSDT".to_string(),
            interval_minutes: 480,
            open_time_ms: 0,
            open: dec!(100),
            high: dec!(105),
            low: dec!(99),
            close: dec!(101),
            volume: dec!(10),
        });
        store.put_kline(PriceKline {
            symbol: "BTCUSDT".to_string(),
            interval_minutes: 480,
            open_time_ms: 8 * HOUR,
            open: dec!(101),
            high: dec!(110),
            low: dec!(100),
            close: dec!(108),
            volume: dec!(10),
        });

        // Second bar has not closed at 12h.
        let view = store.as_of(12 * HOUR);
        assert_eq!(view.mark_price("BTCUSDT"), Some(dec!(101)));

        let view = store.as_of(16 * HOUR);
        assert_eq!(view.mark_price("BTCUSDT"), Some(dec!(108)));
    }

    #[test]
    fn test_settlement_ticks_union() {
        let store = HistoricalStore::new();
        store.put_funding(obs("BTCUSDT", 8 * HOUR, dec!(0.0001), dec!(0.0001)));
        store.put_funding(obs("ETHUSDT", 8 * HOUR, dec!(0.0001), dec!(0.0001)));
        store.put_funding(obs("ETHUSDT", 16 * HOUR, dec!(0.0001), dec!(0.0001)));

        let ticks = store.settlement_ticks(
            &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            0,
            24 * HOUR,
        );
        assert_eq!(ticks, vec![8 * HOUR, 16 * HOUR]);
    }
}
