//! Store persistence with atomic file writes.
//!
//! Monetary and rate fields round-trip as exact-decimal text via serde,
//! never binary floats.
//!
//! # Safety
//! - Write to temp, fsync, rename: a crash leaves either the old file or the
//!   new file, never a partial one.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use super::{FundingObservation, HistoricalStore, PriceKline};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// On-disk layout: one JSON document with both record kinds.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub funding: Vec<FundingObservation>,
    pub klines: Vec<PriceKline>,
}

impl HistoricalStore {
    /// Persist all records atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        let snapshot = self.to_snapshot();
        let json = serde_json::to_string(&snapshot)?;

        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;

        info!(
            path = %path.display(),
            funding = snapshot.funding.len(),
            klines = snapshot.klines.len(),
            "Store persisted"
        );
        Ok(())
    }

    /// Load records from disk, merging idempotently into this store.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let data = fs::read_to_string(path.as_ref())?;
        let snapshot: StoreSnapshot = serde_json::from_str(&data)?;
        let funding = self.put_funding_batch(snapshot.funding);
        let klines = self.put_kline_batch(snapshot.klines);
        info!(
            path = %path.as_ref().display(),
            funding,
            klines,
            "Store loaded"
        );
        Ok(())
    }

    fn to_snapshot(&self) -> StoreSnapshot {
        let funding = self.funding.read().expect("funding lock poisoned");
        let klines = self.klines.read().expect("kline lock poisoned");
        StoreSnapshot {
            funding: funding
                .values()
                .flat_map(|series| series.values().cloned())
                .collect(),
            klines: klines
                .values()
                .flat_map(|series| series.values().cloned())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = std::env::temp_dir().join("basisfarm_store_test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("store.json");

        let store = HistoricalStore::new();
        store.put_funding(FundingObservation {
            symbol: "BTCUSDT".to_string(),
            timestamp_ms: 28_800_000,
            settled_rate: Some(dec!(0.000123456789)),
            predicted_rate: Some(dec!(0.0001)),
            interval_hours: 8,
            volume_24h: dec!(12345678.90),
        });
        store.save(&path).unwrap();

        // Rates must round-trip as decimal text, bit-exact.
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"0.000123456789\""));

        let restored = HistoricalStore::new();
        restored.load(&path).unwrap();
        let series = restored.query_funding("BTCUSDT", 0, 100_000_000);
        assert_eq!(series.records.len(), 1);
        assert_eq!(series.records[0].settled_rate, Some(dec!(0.000123456789)));

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_is_idempotent() {
        let dir = std::env::temp_dir().join("basisfarm_store_test_idem");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("store.json");

        let store = HistoricalStore::new();
        store.put_funding(FundingObservation {
            symbol: "ETHUSDT".to_string(),
            timestamp_ms: 28_800_000,
            settled_rate: Some(dec!(0.0002)),
            predicted_rate: None,
            interval_hours: 8,
            volume_24h: dec!(100),
        });
        store.save(&path).unwrap();

        store.load(&path).unwrap();
        let series = store.query_funding("ETHUSDT", 0, 100_000_000);
        assert_eq!(series.records.len(), 1);

        fs::remove_file(&path).ok();
    }
}
