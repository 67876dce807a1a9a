//! Domain model: rows and status enums shared by the managers.
//!
//! Status enums store as their string form and parse back on read, so the
//! database stays readable and the Rust side stays exhaustive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::errors::HubError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    Scheduled,
    Active,
    Completed,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::Scheduled => "SCHEDULED",
            GameStatus::Active => "ACTIVE",
            GameStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, HubError> {
        match s {
            "SCHEDULED" => Ok(GameStatus::Scheduled),
            "ACTIVE" => Ok(GameStatus::Active),
            "COMPLETED" => Ok(GameStatus::Completed),
            other => Err(HubError::Validation(format!("unknown game status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketStatus {
    Pending,
    Open,
    Closed,
    Resolved,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Pending => "PENDING",
            MarketStatus::Open => "OPEN",
            MarketStatus::Closed => "CLOSED",
            MarketStatus::Resolved => "RESOLVED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, HubError> {
        match s {
            "PENDING" => Ok(MarketStatus::Pending),
            "OPEN" => Ok(MarketStatus::Open),
            "CLOSED" => Ok(MarketStatus::Closed),
            "RESOLVED" => Ok(MarketStatus::Resolved),
            other => Err(HubError::Validation(format!(
                "unknown market status: {other}"
            ))),
        }
    }

    /// Legal transitions: PENDING → OPEN → CLOSED → RESOLVED, nothing else.
    pub fn can_transition_to(&self, next: MarketStatus) -> bool {
        matches!(
            (self, next),
            (MarketStatus::Pending, MarketStatus::Open)
                | (MarketStatus::Open, MarketStatus::Closed)
                | (MarketStatus::Closed, MarketStatus::Resolved)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Settling,
    Settled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Settling => "settling",
            SessionStatus::Settled => "settled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, HubError> {
        match s {
            "open" => Ok(SessionStatus::Open),
            "settling" => Ok(SessionStatus::Settling),
            "settled" => Ok(SessionStatus::Settled),
            other => Err(HubError::Validation(format!(
                "unknown session status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionMode {
    Lmsr,
    P2p,
}

impl PositionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionMode::Lmsr => "lmsr",
            PositionMode::P2p => "p2p",
        }
    }

    pub fn parse(s: &str) -> Result<Self, HubError> {
        match s {
            "lmsr" => Ok(PositionMode::Lmsr),
            "p2p" => Ok(PositionMode::P2p),
            other => Err(HubError::Validation(format!(
                "unknown position mode: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
    Settled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "OPEN",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Settled => "SETTLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, HubError> {
        match s {
            "OPEN" => Ok(OrderStatus::Open),
            "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            "EXPIRED" => Ok(OrderStatus::Expired),
            "SETTLED" => Ok(OrderStatus::Settled),
            other => Err(HubError::Validation(format!("unknown order status: {other}"))),
        }
    }

    /// Orders still eligible for matching or cancellation.
    pub fn is_restable(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LpEventKind {
    Deposit,
    Withdrawal,
}

impl LpEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LpEventKind::Deposit => "DEPOSIT",
            LpEventKind::Withdrawal => "WITHDRAWAL",
        }
    }

    pub fn parse(s: &str) -> Result<Self, HubError> {
        match s {
            "DEPOSIT" => Ok(LpEventKind::Deposit),
            "WITHDRAWAL" => Ok(LpEventKind::Withdrawal),
            other => Err(HubError::Validation(format!(
                "unknown LP event kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sport {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: String,
    pub sport_id: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketCategory {
    pub id: String,
    pub sport_id: String,
    /// Ordered outcome labels; defines the dimensionality of every market
    /// created under this category.
    pub outcomes: Vec<String>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub id: String,
    pub sport_id: String,
    pub home_team_id: String,
    pub away_team_id: String,
    pub status: GameStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Market {
    pub id: String,
    pub game_id: String,
    pub category_id: String,
    pub status: MarketStatus,
    /// Non-null iff status is RESOLVED.
    pub resolved_outcome: Option<i64>,
    /// One non-negative real per outcome, indexed like the category labels.
    pub quantities: Vec<f64>,
    pub liquidity_b: f64,
    /// Sum of accepted bet amounts.
    pub volume: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub address: String,
    pub market_id: String,
    pub outcome_index: i64,
    pub shares: f64,
    pub cost_paid: f64,
    pub fee_paid: f64,
    pub app_session_id: String,
    pub app_session_version: i64,
    pub session_status: SessionStatus,
    pub mode: PositionMode,
    pub session_data: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct P2pOrder {
    pub id: String,
    pub market_id: String,
    pub user_address: String,
    pub outcome_index: i64,
    /// Max cost per share, strictly inside (0, 1).
    pub mcps: f64,
    pub amount: f64,
    pub filled_amount: f64,
    pub unfilled_amount: f64,
    pub max_shares: f64,
    pub filled_shares: f64,
    pub unfilled_shares: f64,
    pub app_session_id: String,
    pub app_session_version: i64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct P2pFill {
    pub id: String,
    pub market_id: String,
    pub taker_order_id: String,
    pub maker_order_id: String,
    pub shares: f64,
    pub price: f64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LpShare {
    pub address: String,
    pub shares: f64,
    pub total_deposited: f64,
    pub total_withdrawn: f64,
    pub first_deposit_at: DateTime<Utc>,
    pub last_action_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LpEvent {
    pub id: String,
    pub address: String,
    pub kind: LpEventKind,
    pub amount: f64,
    pub shares: f64,
    pub share_price: f64,
    pub pool_value_before: f64,
    pub pool_value_after: f64,
    pub created_at: DateTime<Utc>,
}

// Row mapping. Quantities and outcome labels are JSON array columns.

pub fn quantities_from_json(raw: &str) -> Result<Vec<f64>, HubError> {
    serde_json::from_str(raw)
        .map_err(|e| HubError::Validation(format!("corrupt quantities column: {e}")))
}

pub fn labels_from_json(raw: &str) -> Result<Vec<String>, HubError> {
    serde_json::from_str(raw)
        .map_err(|e| HubError::Validation(format!("corrupt outcomes column: {e}")))
}

impl Market {
    pub fn from_row(row: &SqliteRow) -> Result<Self, HubError> {
        let status: String = row.get("status");
        let quantities: String = row.get("quantities");
        Ok(Market {
            id: row.get("id"),
            game_id: row.get("game_id"),
            category_id: row.get("category_id"),
            status: MarketStatus::parse(&status)?,
            resolved_outcome: row.get("resolved_outcome"),
            quantities: quantities_from_json(&quantities)?,
            liquidity_b: row.get("liquidity_b"),
            volume: row.get("volume"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

impl Game {
    pub fn from_row(row: &SqliteRow) -> Result<Self, HubError> {
        let status: String = row.get("status");
        Ok(Game {
            id: row.get("id"),
            sport_id: row.get("sport_id"),
            home_team_id: row.get("home_team_id"),
            away_team_id: row.get("away_team_id"),
            status: GameStatus::parse(&status)?,
            created_at: row.get("created_at"),
        })
    }
}

impl MarketCategory {
    pub fn from_row(row: &SqliteRow) -> Result<Self, HubError> {
        let outcomes: String = row.get("outcomes");
        Ok(MarketCategory {
            id: row.get("id"),
            sport_id: row.get("sport_id"),
            outcomes: labels_from_json(&outcomes)?,
            description: row.get("description"),
        })
    }
}

impl Position {
    pub fn from_row(row: &SqliteRow) -> Result<Self, HubError> {
        let session_status: String = row.get("session_status");
        let mode: String = row.get("mode");
        Ok(Position {
            id: row.get("id"),
            address: row.get("address"),
            market_id: row.get("market_id"),
            outcome_index: row.get("outcome_index"),
            shares: row.get("shares"),
            cost_paid: row.get("cost_paid"),
            fee_paid: row.get("fee_paid"),
            app_session_id: row.get("app_session_id"),
            app_session_version: row.get("app_session_version"),
            session_status: SessionStatus::parse(&session_status)?,
            mode: PositionMode::parse(&mode)?,
            session_data: row.get("session_data"),
            created_at: row.get("created_at"),
        })
    }
}

impl P2pOrder {
    pub fn from_row(row: &SqliteRow) -> Result<Self, HubError> {
        let status: String = row.get("status");
        Ok(P2pOrder {
            id: row.get("id"),
            market_id: row.get("market_id"),
            user_address: row.get("user_address"),
            outcome_index: row.get("outcome_index"),
            mcps: row.get("mcps"),
            amount: row.get("amount"),
            filled_amount: row.get("filled_amount"),
            unfilled_amount: row.get("unfilled_amount"),
            max_shares: row.get("max_shares"),
            filled_shares: row.get("filled_shares"),
            unfilled_shares: row.get("unfilled_shares"),
            app_session_id: row.get("app_session_id"),
            app_session_version: row.get("app_session_version"),
            status: OrderStatus::parse(&status)?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    /// Cost attributable to the filled portion, at the order's own mcps.
    pub fn filled_cost(&self) -> f64 {
        self.filled_amount
    }
}

impl P2pFill {
    pub fn from_row(row: &SqliteRow) -> Result<Self, HubError> {
        Ok(P2pFill {
            id: row.get("id"),
            market_id: row.get("market_id"),
            taker_order_id: row.get("taker_order_id"),
            maker_order_id: row.get("maker_order_id"),
            shares: row.get("shares"),
            price: row.get("price"),
            cost: row.get("cost"),
            created_at: row.get("created_at"),
        })
    }
}

impl LpShare {
    pub fn from_row(row: &SqliteRow) -> Result<Self, HubError> {
        Ok(LpShare {
            address: row.get("address"),
            shares: row.get("shares"),
            total_deposited: row.get("total_deposited"),
            total_withdrawn: row.get("total_withdrawn"),
            first_deposit_at: row.get("first_deposit_at"),
            last_action_at: row.get("last_action_at"),
        })
    }
}

impl LpEvent {
    pub fn from_row(row: &SqliteRow) -> Result<Self, HubError> {
        let kind: String = row.get("kind");
        Ok(LpEvent {
            id: row.get("id"),
            address: row.get("address"),
            kind: LpEventKind::parse(&kind)?,
            amount: row.get("amount"),
            shares: row.get("shares"),
            share_price: row.get("share_price"),
            pool_value_before: row.get("pool_value_before"),
            pool_value_after: row.get("pool_value_after"),
            created_at: row.get("created_at"),
        })
    }
}
