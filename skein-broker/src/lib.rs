//! Exchange-agnostic traits used by the rest of the workspace.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use skein_core::{
    ClientOrderId, MarginMode, OrdType, OrderId, PosSide, Price, Quantity, Side, Symbol,
};

pub mod limiter;

pub use limiter::RateLimiter;

/// Convenience alias for exchange client results.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Common error type returned by exchange client implementations.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Transport-level failures (socket resets, DNS, timeouts on the wire).
    #[error("transport error: {0}")]
    Transport(String),
    /// Authentication failed or credentials are missing; not retryable.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The request parameters are invalid for the target venue.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Serialization or payload parsing failures.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The venue accepted the request but rejected it with a business error.
    #[error("exchange rejection: {0}")]
    Rejection(String),
    /// A deadline elapsed before the operation completed.
    #[error("timed out: {0}")]
    Timeout(String),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

impl ExchangeError {
    /// Whether a retry with the same request can reasonably succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// Parameters for a regular (market/limit) order submission.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderSubmission {
    pub cloid: ClientOrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub pos_side: PosSide,
    pub ord_type: OrdType,
    pub sz: Quantity,
    pub px: Option<Price>,
    pub margin_mode: MarginMode,
    pub reduce_only: bool,
    pub tag: Option<String>,
}

/// Which guard a conditional order implements.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgoKind {
    StopLoss,
    TakeProfit,
}

/// Conditional (stop-loss / take-profit) order placed separately from the
/// entry order and cancellable independently.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AlgoSubmission {
    pub cloid: ClientOrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub pos_side: PosSide,
    pub kind: AlgoKind,
    pub trigger_px: Price,
    pub sz: Quantity,
}

/// Trading surface the reconciler and the intent layer depend on.
///
/// Implementations must be safe for concurrent use and idempotent with
/// respect to client-assigned order ids.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Submit an order and return the venue-assigned order id.
    async fn submit_order(&self, request: OrderSubmission) -> ExchangeResult<OrderId>;

    /// Cancel a resting order by venue id.
    async fn cancel_order(&self, symbol: &str, oid: &str) -> ExchangeResult<()>;

    /// Place a conditional order; returns the client-assigned algo id.
    async fn place_algo(&self, request: AlgoSubmission) -> ExchangeResult<ClientOrderId>;

    /// Cancel a conditional order by its client-assigned id.
    async fn cancel_algo(&self, symbol: &str, algo_cloid: &str) -> ExchangeResult<()>;

    /// Set the account leverage for a symbol.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(ExchangeError::Transport("reset".into()).is_retryable());
        assert!(ExchangeError::Timeout("connect".into()).is_retryable());
        assert!(!ExchangeError::Auth("bad key".into()).is_retryable());
        assert!(!ExchangeError::Rejection("51000".into()).is_retryable());
    }
}
