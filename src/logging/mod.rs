//! Trade recording and log throttling.
//!
//! The ledger itself lives in the position book; recorders are pluggable
//! sinks the orchestrator notifies as trades close. The tracing sink is the
//! default; the in-memory sink exists for tests and the dashboard layer.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

use crate::engine::book::Trade;

/// Sink for closed trades.
pub trait TradeRecorder: Send + Sync {
    fn record(&self, trade: &Trade);
}

/// Structured-log sink; always safe to leave on.
#[derive(Debug, Default)]
pub struct TracingRecorder;

impl TradeRecorder for TracingRecorder {
    fn record(&self, trade: &Trade) {
        info!(
            trade_id = %trade.trade_id,
            symbol = %trade.symbol,
            quantity = %trade.quantity,
            net_pnl = %trade.net_pnl,
            funding = %trade.total_funding(),
            holding_periods = trade.holding_periods,
            entry_reason = %trade.entry_reason,
            exit_reason = %trade.exit_reason,
            "Trade recorded"
        );
    }
}

/// Buffering sink for tests and snapshots.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    trades: Mutex<Vec<Trade>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.trades.lock().expect("recorder lock poisoned").clone()
    }
}

impl TradeRecorder for MemoryRecorder {
    fn record(&self, trade: &Trade) {
        self.trades
            .lock()
            .expect("recorder lock poisoned")
            .push(trade.clone());
    }
}

/// A lightweight rate limiter for logging to prevent log storms.
///
/// Returns true at most once per interval; suppressed calls are counted so
/// the next emitted line can say how many were dropped.
#[derive(Debug)]
pub struct LogThrottle {
    last_log_time: Option<Instant>,
    suppressed_count: u64,
    interval: Duration,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_log_time: None,
            suppressed_count: 0,
            interval,
        }
    }

    /// Whether a log should be emitted now.
    pub fn should_log(&mut self) -> bool {
        let now = Instant::now();
        match self.last_log_time {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed_count += 1;
                false
            }
            _ => {
                self.last_log_time = Some(now);
                true
            }
        }
    }

    /// Suppressed count since the last emitted log; resets the counter.
    pub fn take_suppressed(&mut self) -> u64 {
        std::mem::take(&mut self.suppressed_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::book::PositionBook;
    use crate::exchange::LegFill;
    use crate::types::{Leg, OrderId, OrderSide};
    use rust_decimal_macros::dec;

    #[test]
    fn test_log_throttle_suppresses_within_interval() {
        let mut throttle = LogThrottle::new(Duration::from_millis(100));

        assert!(throttle.should_log());
        assert!(!throttle.should_log());
        assert!(!throttle.should_log());
        assert_eq!(throttle.take_suppressed(), 2);
        assert_eq!(throttle.take_suppressed(), 0);

        std::thread::sleep(Duration::from_millis(110));
        assert!(throttle.should_log());
    }

    #[test]
    fn test_memory_recorder_buffers_trades() {
        let mut book = PositionBook::new();
        let fill = |leg, side| LegFill {
            order_id: OrderId::new("rec"),
            leg,
            side,
            quantity: dec!(1),
            price: dec!(100),
            fee: dec!(0.1),
            timestamp_ms: 0,
        };
        book.open_from_fills(
            "BTCUSDT",
            &fill(Leg::Spot, OrderSide::Buy),
            &fill(Leg::Perp, OrderSide::Sell),
            "entry",
            0,
        )
        .unwrap();
        let trade = book
            .close_with_fills(
                "BTCUSDT",
                &fill(Leg::Spot, OrderSide::Sell),
                &fill(Leg::Perp, OrderSide::Buy),
                "exit",
                1,
            )
            .unwrap();

        let recorder = MemoryRecorder::new();
        recorder.record(&trade);
        let trades = recorder.trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].symbol, "BTCUSDT");
    }
}
