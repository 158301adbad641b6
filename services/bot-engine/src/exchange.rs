//! Exchange contracts consumed by reconcile and the order processor
//!
//! Venue-specific parsing lives behind these traits. The engine only ever sees
//! the normalized types below and the closed [`ExchangeErrorKind`] taxonomy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{OrderSide, OrderStatus, OrderType};

/// Classification of every failure an exchange adapter may report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeErrorKind {
    RateLimit,
    Timeout,
    ExchangeUnavailable,
    Auth,
    BadRequest,
    DuplicateOrder,
    Unknown,
}

impl ExchangeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeErrorKind::RateLimit => "RATE_LIMIT",
            ExchangeErrorKind::Timeout => "TIMEOUT",
            ExchangeErrorKind::ExchangeUnavailable => "EXCHANGE_UNAVAILABLE",
            ExchangeErrorKind::Auth => "AUTH",
            ExchangeErrorKind::BadRequest => "BAD_REQUEST",
            ExchangeErrorKind::DuplicateOrder => "DUPLICATE_ORDER",
            ExchangeErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Transport-level failures worth another attempt.
    /// DUPLICATE_ORDER is not retryable: the intent already exists remotely.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeErrorKind::RateLimit
                | ExchangeErrorKind::Timeout
                | ExchangeErrorKind::ExchangeUnavailable
        )
    }
}

impl std::fmt::Display for ExchangeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed exchange failure; adapters never leak raw transport errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExchangeError {
    #[error("RATE_LIMIT: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("TIMEOUT: {0}")]
    Timeout(String),

    #[error("EXCHANGE_UNAVAILABLE: {0}")]
    Unavailable(String),

    #[error("AUTH: {0}")]
    Auth(String),

    #[error("BAD_REQUEST: {0}")]
    BadRequest(String),

    #[error("DUPLICATE_ORDER: {0}")]
    DuplicateOrder(String),

    #[error("UNKNOWN: {0}")]
    Unknown(String),
}

impl ExchangeError {
    pub fn kind(&self) -> ExchangeErrorKind {
        match self {
            ExchangeError::RateLimit { .. } => ExchangeErrorKind::RateLimit,
            ExchangeError::Timeout(_) => ExchangeErrorKind::Timeout,
            ExchangeError::Unavailable(_) => ExchangeErrorKind::ExchangeUnavailable,
            ExchangeError::Auth(_) => ExchangeErrorKind::Auth,
            ExchangeError::BadRequest(_) => ExchangeErrorKind::BadRequest,
            ExchangeError::DuplicateOrder(_) => ExchangeErrorKind::DuplicateOrder,
            ExchangeError::Unknown(_) => ExchangeErrorKind::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Server-provided back-off hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExchangeError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Order placement request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub client_order_id: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Decimal,
    pub amount: Decimal,
}

/// Exchange acknowledgement of an accepted order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Order as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOrder {
    pub exchange_order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Decimal,
    pub amount: Decimal,
    pub filled_amount: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
}

/// Fill as reported by the exchange. `client_order_id` may be missing or wrong
/// on some venues; reconcile resolves it against local orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTrade {
    pub trade_id: String,
    pub exchange_order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub fee: Decimal,
    pub fee_currency: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Trading rules for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketInfo {
    pub symbol: String,
    pub min_amount: Decimal,
    pub min_notional: Decimal,
    /// Decimal places allowed in prices
    pub price_precision: u32,
    /// Decimal places allowed in amounts
    pub amount_precision: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub symbol: String,
    pub base_free: Decimal,
    pub quote_free: Decimal,
}

/// Order execution surface of an exchange account
#[async_trait]
pub trait ExchangeExecutor: Send + Sync {
    /// Venue name; part of the unique keys for orders and trades
    fn name(&self) -> &str;

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<RemoteOrder>, ExchangeError>;

    async fn fetch_my_trades(&self, symbol: &str) -> Result<Vec<RemoteTrade>, ExchangeError>;

    async fn create_order(&self, request: &OrderRequest) -> Result<PlacedOrder, ExchangeError>;

    async fn cancel_order(&self, exchange_order_id: &str, symbol: &str) -> Result<(), ExchangeError>;

    /// Look up one order by exchange id, open or closed. Reconcile uses the
    /// answer as evidence before closing an order that left the open list.
    async fn fetch_order(&self, exchange_order_id: &str, symbol: &str) -> Result<RemoteOrder, ExchangeError>;
}

/// Read-only market data used for gating and base-price resolution
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn get_market_info(&self, symbol: &str) -> Result<MarketInfo, ExchangeError>;

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    async fn get_balance(&self, symbol: &str) -> Result<Balance, ExchangeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ExchangeErrorKind::RateLimit.is_retryable());
        assert!(ExchangeErrorKind::Timeout.is_retryable());
        assert!(ExchangeErrorKind::ExchangeUnavailable.is_retryable());
        assert!(!ExchangeErrorKind::Auth.is_retryable());
        assert!(!ExchangeErrorKind::BadRequest.is_retryable());
        assert!(!ExchangeErrorKind::DuplicateOrder.is_retryable());
        assert!(!ExchangeErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn test_error_display_carries_code() {
        let err = ExchangeError::RateLimit {
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.kind(), ExchangeErrorKind::RateLimit);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert!(err.to_string().starts_with("RATE_LIMIT"));
        assert_eq!(ExchangeError::Timeout("x".into()).retry_after(), None);
    }
}
