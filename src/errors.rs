//! Typed errors for the hub core and their HTTP mapping.
//!
//! Managers return `HubError`; axum handlers convert it into the JSON error
//! bodies the API contract promises. The resolution pipeline is the only
//! caller that deliberately catches settlement errors and continues.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("{0}")]
    Validation(String),

    #[error("market {id} is {status}, expected {expected}")]
    IllegalMarketState {
        id: String,
        status: String,
        expected: String,
    },

    #[error("game {0} is not active")]
    GameNotActive(String),

    #[error("a market already exists for game {game_id} category {category_id}")]
    MarketExists {
        game_id: String,
        category_id: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("session {session_id} version regression: {attempted} <= {current}")]
    SessionVersionRegression {
        session_id: String,
        current: i64,
        attempted: i64,
    },

    #[error("withdrawals are locked while markets or positions are open")]
    WithdrawalsLocked,

    #[error("insufficient LP shares: requested {requested}, held {held}")]
    InsufficientShares { requested: f64, held: f64 },

    #[error("P2P orders require a binary market, got {0} outcomes")]
    UnsupportedMarket(usize),

    #[error("price infeasible: {0}")]
    PriceInfeasible(String),

    #[error("settlement service request timed out")]
    Timeout,

    #[error("settlement service is not connected")]
    NotConnected,

    #[error("settlement service rejected the request: {0}")]
    RemoteRpcError(String),

    #[error("faucet request failed: {0}")]
    Faucet(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HubError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HubError::Validation(_)
            | HubError::IllegalMarketState { .. }
            | HubError::GameNotActive(_)
            | HubError::MarketExists { .. }
            | HubError::InsufficientShares { .. }
            | HubError::UnsupportedMarket(_)
            | HubError::PriceInfeasible(_) => StatusCode::BAD_REQUEST,
            HubError::WithdrawalsLocked => StatusCode::FORBIDDEN,
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::SessionVersionRegression { .. }
            | HubError::Timeout
            | HubError::NotConnected
            | HubError::RemoteRpcError(_)
            | HubError::Faucet(_)
            | HubError::Database(_)
            | HubError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for the settlement-service failures the resolution pipeline
    /// swallows and logs instead of propagating.
    pub fn is_settlement_failure(&self) -> bool {
        matches!(
            self,
            HubError::Timeout | HubError::NotConnected | HubError::RemoteRpcError(_)
        )
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_api_contract() {
        assert_eq!(
            HubError::Validation("missing field".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            HubError::WithdrawalsLocked.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            HubError::NotFound("market".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HubError::Timeout.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn settlement_failures_are_classified_for_the_pipeline() {
        assert!(HubError::Timeout.is_settlement_failure());
        assert!(HubError::NotConnected.is_settlement_failure());
        assert!(HubError::RemoteRpcError("boom".into()).is_settlement_failure());
        assert!(!HubError::WithdrawalsLocked.is_settlement_failure());
    }
}
