//! Exchange Abstraction Layer
//!
//! Exchange-agnostic boundary consumed by the executor implementations.
//! Concrete venue clients (REST/WebSocket plumbing, auth) live outside this
//! crate and implement [`ExchangeGateway`]; everything inside the crate is
//! written against the trait.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::types::{ExchangeConstraints, Leg, MarketSnapshot, OrderId, OrderSide};

/// Failures at the venue boundary.
///
/// The retryable/fatal split drives both the retry helper and the circuit
/// breaker: only retryable failures count toward tripping the breaker.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by venue: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("order rejected: {0}")]
    InvalidOrder(String),

    #[error("{0}")]
    Other(String),
}

impl ExchangeError {
    /// Transient failures worth retrying and counting toward the breaker.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimited(_) | Self::Network(_)
        )
    }

    /// Failures that must halt new opens and surface to the operator.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::InsufficientBalance(_))
    }
}

/// One leg's fill as reported by the venue.
#[derive(Debug, Clone, PartialEq)]
pub struct LegFill {
    pub order_id: OrderId,
    pub leg: Leg,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub timestamp_ms: i64,
}

impl LegFill {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// Direction of a pair placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairSide {
    /// Buy spot, sell perp.
    Open,
    /// Sell spot, buy perp.
    Close,
}

/// Outcome of a pair placement at the venue boundary. The venue cannot
/// guarantee atomicity across two markets, so a partial outcome is
/// representable here — and must be resolved by the executor before anything
/// above it sees the result.
#[derive(Debug, Clone)]
pub enum PairPlacement {
    Filled { spot: LegFill, perp: LegFill },
    SpotOnly { spot: LegFill, perp_error: ExchangeError },
    PerpOnly { perp: LegFill, spot_error: ExchangeError },
}

/// Per-symbol positions as the venue reports them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountPosition {
    pub spot_qty: Decimal,
    pub perp_qty: Decimal,
}

/// Authoritative account view.
#[derive(Debug, Clone)]
pub struct AccountState {
    pub equity: Decimal,
    pub available_balance: Decimal,
    /// Equity over total perp notional; large when no perp exposure exists.
    pub margin_ratio: Decimal,
    pub positions: HashMap<String, AccountPosition>,
}

/// The venue boundary. Implementations live outside the core.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn get_market_state(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, MarketSnapshot>, ExchangeError>;

    /// Submit both legs of a pair. May return a partial outcome; callers
    /// above the executor never see one.
    async fn place_order_pair(
        &self,
        symbol: &str,
        side: PairSide,
        quantity: Decimal,
    ) -> Result<PairPlacement, ExchangeError>;

    /// Single-leg order, used only for compensating unwinds and drift
    /// rebalancing — never for opening exposure.
    async fn place_leg_order(
        &self,
        symbol: &str,
        leg: Leg,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<LegFill, ExchangeError>;

    async fn get_account_state(&self) -> Result<AccountState, ExchangeError>;

    async fn cancel_order(&self, order_id: &OrderId) -> Result<(), ExchangeError>;

    fn constraints(&self, symbol: &str) -> ExchangeConstraints;
}

/// Bounded retry with exponential backoff and jitter for retryable venue
/// failures. Fatal errors escalate immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let base = self.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let jitter = rand::thread_rng().gen_range(-0.1..=0.1) * capped;
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Run `op` until it succeeds, exhausts attempts, or fails non-retryably.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable exchange failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_error_classification() {
        assert!(ExchangeError::Timeout("t".into()).is_retryable());
        assert!(ExchangeError::RateLimited("r".into()).is_retryable());
        assert!(!ExchangeError::Auth("a".into()).is_retryable());
        assert!(ExchangeError::Auth("a".into()).is_fatal());
        assert!(ExchangeError::InsufficientBalance("b".into()).is_fatal());
        assert!(!ExchangeError::Timeout("t".into()).is_fatal());
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let result = with_retry(&policy, "test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ExchangeError::Timeout("slow".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_fatal() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<(), _> = with_retry(&policy, "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::Auth("bad key".into())) }
        })
        .await;
        assert!(matches!(result, Err(ExchangeError::Auth(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
