//! CLI configuration assembly and synthetic data generation.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::backtest::BacktestConfig;
use crate::store::{perp_symbol, FundingObservation, HistoricalStore, PriceKline, StoreError};

const HOUR: i64 = 3_600_000;
const PERIOD_MS: i64 = 8 * HOUR;

#[derive(Debug, Error)]
pub enum CliConfigError {
    #[error("no data source: pass --data <file> or --synthetic")]
    NoDataSource,

    #[error("invalid grid value '{0}'")]
    InvalidGridValue(String),

    #[error("invalid initial capital {0}")]
    InvalidCapital(f64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Assembled inputs shared by the research commands.
#[derive(Debug, Clone)]
pub struct BacktestCliConfig {
    pub symbols: Vec<String>,
    pub days: u32,
    pub data: Option<String>,
    pub synthetic: bool,
    pub initial_capital: Decimal,
    pub output_dir: String,
}

impl BacktestCliConfig {
    pub fn new(
        symbols: &str,
        days: u32,
        data: Option<String>,
        synthetic: bool,
        initial_capital: f64,
        output_dir: &str,
    ) -> Result<Self, CliConfigError> {
        let initial = Decimal::from_f64(initial_capital)
            .filter(|c| *c > Decimal::ZERO)
            .ok_or(CliConfigError::InvalidCapital(initial_capital))?;
        Ok(Self {
            symbols: symbols
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            days,
            data,
            synthetic,
            initial_capital: initial,
            output_dir: output_dir.to_string(),
        })
    }

    /// Load the store from disk or generate synthetic history.
    pub fn build_store(&self) -> Result<Arc<HistoricalStore>, CliConfigError> {
        let store = Arc::new(HistoricalStore::new());
        if let Some(path) = &self.data {
            store.load(path)?;
            info!(path = %path, symbols = ?store.symbols(), "Historical data loaded");
        } else if self.synthetic {
            for symbol in &self.symbols {
                generate_synthetic_history(&store, symbol, self.days);
            }
            info!(days = self.days, symbols = ?self.symbols, "Synthetic data generated");
        } else {
            return Err(CliConfigError::NoDataSource);
        }
        Ok(store)
    }

    /// Core backtest config spanning the requested days.
    pub fn to_backtest_config(&self) -> BacktestConfig {
        let end_ms = i64::from(self.days) * 24 * HOUR + PERIOD_MS;
        BacktestConfig {
            initial_balance: self.initial_capital,
            ..BacktestConfig::new(self.symbols.clone(), 0, end_ms)
        }
    }
}

/// Parse a comma-separated decimal list for grid dimensions.
pub fn parse_decimal_grid(raw: &str) -> Result<Vec<Decimal>, CliConfigError> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Decimal>()
                .map_err(|_| CliConfigError::InvalidGridValue(s.to_string()))
        })
        .collect()
}

pub fn parse_usize_grid(raw: &str) -> Result<Vec<usize>, CliConfigError> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| CliConfigError::InvalidGridValue(s.to_string()))
        })
        .collect()
}

/// Deterministic synthetic history: funding rates oscillating around a
/// positive mean and a gently drifting price with a small positive basis.
/// Seeded by the symbol so different symbols get different paths.
///
/// f64 is fine here: synthetic generation is test/CI tooling, the values
/// are converted to `Decimal` once and stored as such.
pub fn generate_synthetic_history(store: &HistoricalStore, symbol: &str, days: u32) {
    let periods = i64::from(days) * 3; // 8h settlements
    let seed: u64 = symbol.bytes().map(u64::from).sum();
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).max(1);
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        ((state >> 33) as f64) / (u32::MAX as f64) - 0.5
    };

    let mut price = 100.0 + (seed % 400) as f64;
    for i in 1..=periods {
        let ts = i * PERIOD_MS;

        // Rate oscillates in roughly [-0.01%, +0.05%].
        let rate = 0.0002 + 0.0003 * next();
        let rate = Decimal::from_f64(rate).unwrap_or(dec!(0.0001)).round_dp(8);
        store.put_funding(FundingObservation {
            symbol: symbol.to_string(),
            timestamp_ms: ts,
            settled_rate: Some(rate),
            predicted_rate: Some(rate),
            interval_hours: 8,
            volume_24h: dec!(5000000),
        });

        price *= 1.0 + 0.004 * next();
        price = price.max(1.0);
        let spot = Decimal::from_f64(price).unwrap_or(dec!(100)).round_dp(4);
        let basis = 1.0 + 0.0004 + 0.0002 * next();
        let perp = Decimal::from_f64(price * basis).unwrap_or(spot).round_dp(4);

        for (kline_symbol, close) in [(symbol.to_string(), spot), (perp_symbol(symbol), perp)] {
            store.put_kline(PriceKline {
                symbol: kline_symbol,
                interval_minutes: 480,
                open_time_ms: ts - PERIOD_MS,
                open: close,
                high: close,
                low: close,
                close,
                volume: dec!(1000),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_list_parsing() {
        let config = BacktestCliConfig::new(
            "BTCUSDT, ETHUSDT",
            7,
            None,
            true,
            10000.0,
            "out",
        )
        .unwrap();
        assert_eq!(config.symbols, vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[test]
    fn test_rejects_missing_data_source() {
        let config =
            BacktestCliConfig::new("BTCUSDT", 7, None, false, 10000.0, "out").unwrap();
        assert!(matches!(
            config.build_store(),
            Err(CliConfigError::NoDataSource)
        ));
    }

    #[test]
    fn test_rejects_bad_capital() {
        assert!(BacktestCliConfig::new("BTCUSDT", 7, None, true, -5.0, "out").is_err());
    }

    #[test]
    fn test_synthetic_history_is_deterministic() {
        let a = HistoricalStore::new();
        let b = HistoricalStore::new();
        generate_synthetic_history(&a, "BTCUSDT", 5);
        generate_synthetic_history(&b, "BTCUSDT", 5);

        let series_a = a.query_funding("BTCUSDT", 0, i64::MAX);
        let series_b = b.query_funding("BTCUSDT", 0, i64::MAX);
        assert_eq!(series_a.records, series_b.records);
        assert_eq!(series_a.records.len(), 15);
        assert!(!series_a.has_gaps());
    }

    #[test]
    fn test_grid_parsing() {
        assert_eq!(
            parse_decimal_grid("0.3, 0.5").unwrap(),
            vec![dec!(0.3), dec!(0.5)]
        );
        assert!(parse_decimal_grid("0.3,zzz").is_err());
        assert_eq!(parse_usize_grid("3,5,7").unwrap(), vec![3, 5, 7]);
    }
}
