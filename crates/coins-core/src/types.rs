//! ============================================================================
//! Core Types for the Points Ledger
//! ============================================================================
//! Read-side projections handed to the front ends, and the outcome wrapper
//! returned by every mutating operation. Serialized to JSON by the callers.
//! ============================================================================

use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{ServiceListing, ServiceOrder, Transaction, TxKind};
use crate::error::CoinsError;

/// Balance card for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceView {
    pub current: u64,
    pub total_earned: u64,
    pub total_spent: u64,
    /// 1-based leaderboard position
    pub rank: usize,
}

/// One line of an account's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub kind: TxKind,
    pub amount: u64,
    pub description: String,
    /// "YYYY-MM-DD HH:MM" in UTC
    pub date: String,
}

impl From<&Transaction> for HistoryEntry {
    fn from(tx: &Transaction) -> Self {
        Self {
            kind: tx.kind,
            amount: tx.amount,
            description: tx.description.clone(),
            date: format_minute(tx.created_at),
        }
    }
}

fn format_minute(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub name: String,
    pub points: u64,
}

/// Spend total for one calendar day (UTC)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySpend {
    pub date: NaiveDate,
    pub total: u64,
}

/// Status of a listing as seen by a particular viewer. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Open,
    ClaimedByViewer,
    ClaimedByOther,
    /// Viewer is the provider and an executor is working on it
    AwaitingProviderConfirmation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingView {
    pub listing: ServiceListing,
    pub provider_name: String,
    pub status: ListingStatus,
    /// Present once the listing is claimed; the provider confirms this order
    pub order_id: Option<String>,
}

/// A provider's own listing with its order summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderListing {
    pub listing: ServiceListing,
    pub order: Option<ServiceOrder>,
    pub orders: usize,
    pub earnings: u64,
}

/// Result of a mutating operation: the typed result plus a message for the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
    pub error: Option<CoinsError>,
}

impl<T> Outcome<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error: None,
        }
    }

    /// Failed outcome. Fatal errors lose their details; log them before calling this.
    pub fn err(error: CoinsError) -> Self {
        Self {
            success: false,
            message: error.user_message(),
            data: None,
            error: Some(error.redacted()),
        }
    }

    pub fn into_result(self) -> Result<T, CoinsError> {
        match (self.data, self.error) {
            (Some(data), None) => Ok(data),
            (_, Some(error)) => Err(error),
            (None, None) => Err(CoinsError::Internal("outcome carries no data".into())),
        }
    }
}
