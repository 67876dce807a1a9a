//! Versioned session-data blobs mirrored into each settlement-service
//! session. Opaque to the service; the hub stamps V1 at intent, V2 at
//! acceptance, V3 at resolution. UTF-8 JSON with a top-level `v`
//! discriminator and a `mode` tag.

use serde::{Deserialize, Serialize};

use crate::errors::{HubError, HubResult};
use crate::models::PositionMode;

/// Outcome tag recorded in V3 blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BetResult {
    Win,
    Loss,
    Refund,
}

/// Intent, as recorded when the user opens a session for a bet or order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDataV1 {
    pub v: u8,
    pub mode: PositionMode,
    pub market_id: String,
    pub outcome_index: i64,
    pub amount: f64,
}

/// Hub acceptance: executed prices, shares, and the fee withheld at
/// resolution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDataV2 {
    pub v: u8,
    pub mode: PositionMode,
    pub market_id: String,
    pub outcome_index: i64,
    pub amount: f64,
    pub shares: f64,
    pub prices: Vec<f64>,
    pub fee: f64,
}

/// Resolution: final result, payout, and profit for the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDataV3 {
    pub v: u8,
    pub mode: PositionMode,
    pub market_id: String,
    pub result: BetResult,
    pub payout: f64,
    pub profit: f64,
}

impl SessionDataV1 {
    pub fn new(mode: PositionMode, market_id: &str, outcome_index: i64, amount: f64) -> Self {
        Self {
            v: 1,
            mode,
            market_id: market_id.to_string(),
            outcome_index,
            amount,
        }
    }
}

impl SessionDataV2 {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: PositionMode,
        market_id: &str,
        outcome_index: i64,
        amount: f64,
        shares: f64,
        prices: Vec<f64>,
        fee: f64,
    ) -> Self {
        Self {
            v: 2,
            mode,
            market_id: market_id.to_string(),
            outcome_index,
            amount,
            shares,
            prices,
            fee,
        }
    }
}

impl SessionDataV3 {
    pub fn win(mode: PositionMode, market_id: &str, payout: f64, profit: f64) -> Self {
        Self {
            v: 3,
            mode,
            market_id: market_id.to_string(),
            result: BetResult::Win,
            payout,
            profit,
        }
    }

    pub fn loss(mode: PositionMode, market_id: &str, loss: f64) -> Self {
        Self {
            v: 3,
            mode,
            market_id: market_id.to_string(),
            result: BetResult::Loss,
            payout: 0.0,
            profit: -loss,
        }
    }

    pub fn refund(mode: PositionMode, market_id: &str, amount: f64) -> Self {
        Self {
            v: 3,
            mode,
            market_id: market_id.to_string(),
            result: BetResult::Refund,
            payout: amount,
            profit: 0.0,
        }
    }
}

pub fn encode<T: Serialize>(blob: &T) -> String {
    serde_json::to_string(blob).expect("session blobs are plain serializable structs")
}

/// Read the `v` discriminator without committing to a shape.
pub fn version_of(raw: &str) -> HubResult<u8> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| HubError::Validation(format!("malformed session data: {e}")))?;
    value
        .get("v")
        .and_then(|v| v.as_u64())
        .map(|v| v as u8)
        .ok_or_else(|| HubError::Validation("session data missing v discriminator".into()))
}
