//! Periodic book-vs-executor reconciliation.
//!
//! A background task compares the orchestrator's local book against the
//! executor's authoritative account state every `interval`. A mismatch sets
//! the orchestrator's reconcile flag, which forces an ERROR transition (and
//! a corrective reconcile) at the start of the next cycle.

use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::book::PositionBook;
use super::EmergencyStop;
use crate::executor::{Executor, ExecutorError};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Quantity differences at or below this are noise, not drift.
    pub tolerance: Decimal,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            tolerance: Decimal::new(1, 4), // 0.0001
        }
    }
}

/// One symbol's comparison result.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Clean {
        symbol: String,
    },
    Mismatch {
        symbol: String,
        local_spot: Decimal,
        exchange_spot: Decimal,
        local_perp: Decimal,
        exchange_perp: Decimal,
    },
    /// The executor reports exposure the book does not know about.
    Untracked {
        symbol: String,
        spot_qty: Decimal,
        perp_qty: Decimal,
    },
}

pub struct BookReconciler {
    book: Arc<Mutex<PositionBook>>,
    executor: Arc<dyn Executor>,
    config: ReconcilerConfig,
    /// Raised on mismatch; drained by the orchestrator at cycle start.
    reconcile_flag: Arc<AtomicBool>,
}

impl BookReconciler {
    pub fn new(
        book: Arc<Mutex<PositionBook>>,
        executor: Arc<dyn Executor>,
        config: ReconcilerConfig,
        reconcile_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            book,
            executor,
            config,
            reconcile_flag,
        }
    }

    /// Compare once. Sets the reconcile flag when anything is off.
    pub async fn check_once(&self) -> Result<Vec<ReconcileOutcome>, ExecutorError> {
        let account = self.executor.account_state().await?;
        let book = self.book.lock().await;

        let mut outcomes = Vec::new();
        for position in book.positions() {
            let authoritative = account.positions.get(&position.symbol);
            let (exchange_spot, exchange_perp) = authoritative
                .map(|p| (p.spot_qty, p.perp_qty))
                .unwrap_or((Decimal::ZERO, Decimal::ZERO));
            let spot_drift = (exchange_spot - position.spot_qty).abs();
            let perp_drift = (exchange_perp - position.perp_qty).abs();

            if spot_drift > self.config.tolerance || perp_drift > self.config.tolerance {
                outcomes.push(ReconcileOutcome::Mismatch {
                    symbol: position.symbol.clone(),
                    local_spot: position.spot_qty,
                    exchange_spot,
                    local_perp: position.perp_qty,
                    exchange_perp,
                });
            } else {
                outcomes.push(ReconcileOutcome::Clean {
                    symbol: position.symbol.clone(),
                });
            }
        }

        for (symbol, acct) in &account.positions {
            if book.position(symbol).is_none()
                && (acct.spot_qty.abs() > self.config.tolerance
                    || acct.perp_qty.abs() > self.config.tolerance)
            {
                outcomes.push(ReconcileOutcome::Untracked {
                    symbol: symbol.clone(),
                    spot_qty: acct.spot_qty,
                    perp_qty: acct.perp_qty,
                });
            }
        }
        drop(book);

        let dirty = outcomes
            .iter()
            .any(|o| !matches!(o, ReconcileOutcome::Clean { .. }));
        if dirty {
            error!(
                outcomes = ?outcomes,
                "Book disagrees with executor account; flagging for reconciliation"
            );
            self.reconcile_flag.store(true, Ordering::SeqCst);
        } else {
            debug!(positions = outcomes.len(), "Reconciliation check clean");
        }
        Ok(outcomes)
    }

    /// Run periodic checks until the stop signal fires.
    pub fn spawn(self: Arc<Self>, stop: EmergencyStop) -> tokio::task::JoinHandle<()> {
        let interval = self.config.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "Reconciler task started");
            loop {
                ticker.tick().await;
                if stop.is_triggered() {
                    info!("Reconciler task stopping");
                    return;
                }
                if let Err(e) = self.check_once().await {
                    error!(error = %e, "Reconciliation check failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{AccountPosition, AccountState, LegFill};
    use crate::executor::{ExecutorError, FillResult};
    use crate::types::{ExchangeConstraints, Leg, OrderId, OrderPairRequest, OrderSide};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Executor stub exposing a settable account state.
    struct StubExecutor {
        account: StdMutex<AccountState>,
    }

    impl StubExecutor {
        fn new() -> Self {
            Self {
                account: StdMutex::new(AccountState {
                    equity: dec!(10000),
                    available_balance: dec!(10000),
                    margin_ratio: dec!(100),
                    positions: HashMap::new(),
                }),
            }
        }

        fn set_position(&self, symbol: &str, spot: Decimal, perp: Decimal) {
            self.account.lock().unwrap().positions.insert(
                symbol.to_string(),
                AccountPosition {
                    spot_qty: spot,
                    perp_qty: perp,
                },
            );
        }
    }

    #[async_trait]
    impl Executor for StubExecutor {
        async fn open(&self, _request: &OrderPairRequest) -> Result<FillResult, ExecutorError> {
            unimplemented!("not used in reconciler tests")
        }

        async fn close(&self, _symbol: &str) -> Result<FillResult, ExecutorError> {
            unimplemented!("not used in reconciler tests")
        }

        async fn cancel(&self, _order_id: &OrderId) -> Result<(), ExecutorError> {
            Ok(())
        }

        async fn rebalance(
            &self,
            _symbol: &str,
            _perp_adjustment: Decimal,
        ) -> Result<LegFill, ExecutorError> {
            unimplemented!("not used in reconciler tests")
        }

        async fn account_state(&self) -> Result<AccountState, ExecutorError> {
            Ok(self.account.lock().unwrap().clone())
        }

        fn constraints(&self, _symbol: &str) -> ExchangeConstraints {
            ExchangeConstraints::default()
        }
    }

    fn leg(leg: Leg, side: OrderSide, qty: Decimal) -> LegFill {
        LegFill {
            order_id: OrderId::new("r"),
            leg,
            side,
            quantity: qty,
            price: dec!(100),
            fee: Decimal::ZERO,
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_clean_when_book_matches_account() {
        let executor = Arc::new(StubExecutor::new());
        executor.set_position("BTCUSDT", dec!(10), dec!(-10));

        let book = Arc::new(Mutex::new(PositionBook::new()));
        book.lock().await
            .open_from_fills(
                "BTCUSDT",
                &leg(Leg::Spot, OrderSide::Buy, dec!(10)),
                &leg(Leg::Perp, OrderSide::Sell, dec!(10)),
                "entry",
                0,
            )
            .unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        let reconciler = BookReconciler::new(
            book,
            executor,
            ReconcilerConfig::default(),
            Arc::clone(&flag),
        );
        let outcomes = reconciler.check_once().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], ReconcileOutcome::Clean { .. }));
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_mismatch_raises_flag() {
        let executor = Arc::new(StubExecutor::new());
        executor.set_position("BTCUSDT", dec!(7), dec!(-10));

        let book = Arc::new(Mutex::new(PositionBook::new()));
        book.lock().await
            .open_from_fills(
                "BTCUSDT",
                &leg(Leg::Spot, OrderSide::Buy, dec!(10)),
                &leg(Leg::Perp, OrderSide::Sell, dec!(10)),
                "entry",
                0,
            )
            .unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        let reconciler = BookReconciler::new(
            book,
            executor,
            ReconcilerConfig::default(),
            Arc::clone(&flag),
        );
        let outcomes = reconciler.check_once().await.unwrap();
        assert!(matches!(outcomes[0], ReconcileOutcome::Mismatch { .. }));
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_untracked_exposure_detected() {
        let executor = Arc::new(StubExecutor::new());
        executor.set_position("ETHUSDT", dec!(3), dec!(-3));

        let book = Arc::new(Mutex::new(PositionBook::new()));
        let flag = Arc::new(AtomicBool::new(false));
        let reconciler = BookReconciler::new(
            book,
            executor,
            ReconcilerConfig::default(),
            Arc::clone(&flag),
        );
        let outcomes = reconciler.check_once().await.unwrap();
        assert!(matches!(outcomes[0], ReconcileOutcome::Untracked { .. }));
        assert!(flag.load(Ordering::SeqCst));
    }
}
