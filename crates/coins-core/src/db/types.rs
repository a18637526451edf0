//! ============================================================================
//! Database Types - Serializable records for redb storage
//! ============================================================================
//! One record type per persisted entity. Records are bincode-encoded, so no
//! serde attribute here may skip fields conditionally.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A ledger participant. Created lazily on first contact, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    /// Identifier supplied by the front end (chat user id)
    pub external_id: String,
    pub display_name: String,
    pub role: Role,
    /// Creation order, used as the leaderboard tie-breaker
    pub seq: u64,
    pub created_at: i64,
}

impl Account {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Admin,
}

/// Point balance, 1:1 with an account. Only the ledger writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: String,
    pub current_points: u64,
    pub total_earned: u64,
    pub total_spent: u64,
}

impl Balance {
    pub fn empty(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            current_points: 0,
            total_earned: 0,
            total_spent: 0,
        }
    }
}

/// Append-only ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub account_id: String,
    pub kind: TxKind,
    pub amount: u64,
    pub description: String,
    pub related: Option<RelatedEntity>,
    pub seq: u64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Earn,
    Spend,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Earn => "earn",
            TxKind::Spend => "spend",
        }
    }
}

/// Order a transaction was recorded for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelatedEntity {
    MerchOrder(String),
    ServiceOrder(String),
}

/// A purchasable item with finite stock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
    pub price_points: u64,
    pub stock_quantity: u32,
    pub description: String,
    pub seq: u64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerchOrder {
    pub id: String,
    pub item_id: String,
    pub buyer_account_id: String,
    pub quantity: u32,
    pub total_points: u64,
    pub status: MerchOrderStatus,
    pub created_at: i64,
}

/// Paid is terminal; there is no cancellation flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MerchOrderStatus {
    Paid,
}

/// A published offer to perform a service for points
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceListing {
    pub id: String,
    pub provider_account_id: String,
    pub name: String,
    pub price_points: u64,
    pub description: String,
    /// Cleared once the claimed work is confirmed
    pub active: bool,
    pub seq: u64,
    pub created_at: i64,
}

/// Assignment of one listing to one executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOrder {
    pub id: String,
    pub listing_id: String,
    pub executor_account_id: String,
    pub status: ServiceOrderStatus,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceOrderStatus {
    Assigned,
    Completed,
}

impl ServiceOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceOrderStatus::Assigned => "assigned",
            ServiceOrderStatus::Completed => "completed",
        }
    }
}

/// Record counts for the admin tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbStats {
    pub accounts: usize,
    pub transactions: usize,
    pub catalog_items: usize,
    pub merch_orders: usize,
    pub listings: usize,
    pub service_orders: BTreeMap<String, usize>,
    /// Sum of every account's current points, wider than a single balance
    pub points_in_circulation: u128,
}

/// Full dump of every table, for export
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub accounts: Vec<Account>,
    pub balances: Vec<Balance>,
    pub transactions: Vec<Transaction>,
    pub catalog: Vec<CatalogItem>,
    pub merch_orders: Vec<MerchOrder>,
    pub listings: Vec<ServiceListing>,
    pub service_orders: Vec<ServiceOrder>,
}
