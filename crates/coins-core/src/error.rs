//! ============================================================================
//! Error Types - Business-rule failures and store faults
//! ============================================================================
//! Business-rule failures are ordinary results the front end renders for the
//! user. Store and internal faults are fatal: logged, then shown generically.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity kinds that can be missing from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Account,
    CatalogItem,
    Listing,
    ServiceOrder,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Account => "Account",
            Entity::CatalogItem => "Item",
            Entity::Listing => "Listing",
            Entity::ServiceOrder => "Order",
        };
        f.write_str(name)
    }
}

/// Error types for the ledger engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CoinsError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: String },

    #[error("Out of stock: requested {requested}, {available} left")]
    OutOfStock { requested: u32, available: u32 },

    #[error("Insufficient points: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("Listing already claimed: {0}")]
    AlreadyClaimed(String),

    #[error("Cannot claim your own listing")]
    SelfClaim,

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Order already completed: {0}")]
    AlreadyCompleted(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoinsError {
    pub fn not_found(entity: Entity, id: impl Into<String>) -> Self {
        CoinsError::NotFound { entity, id: id.into() }
    }

    /// Store and internal faults, as opposed to business-rule rejections
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoinsError::StoreUnavailable(_) | CoinsError::Internal(_))
    }

    /// Same variant with store and internal details stripped, for sending to front ends
    pub fn redacted(self) -> Self {
        match self {
            CoinsError::StoreUnavailable(_) => CoinsError::StoreUnavailable(String::new()),
            CoinsError::Internal(_) => CoinsError::Internal(String::new()),
            other => other,
        }
    }

    /// Message safe to show an end user. Fatal errors never leak internals.
    pub fn user_message(&self) -> String {
        match self {
            CoinsError::NotFound { entity, .. } => format!("{} not found", entity),
            CoinsError::OutOfStock { .. } => "Item is out of stock".to_string(),
            CoinsError::InsufficientFunds { needed, available } => {
                format!("Not enough points: need {}, you have {}", needed, available)
            }
            CoinsError::AlreadyClaimed(_) => "This task has already been taken".to_string(),
            CoinsError::SelfClaim => "You cannot take your own task".to_string(),
            CoinsError::NotAuthorized(_) => "You are not allowed to do that".to_string(),
            CoinsError::AlreadyCompleted(_) => "This task is already completed".to_string(),
            CoinsError::InvalidInput(reason) => format!("Invalid data: {}", reason),
            CoinsError::StoreUnavailable(_) | CoinsError::Internal(_) => {
                "Internal error, please try again later".to_string()
            }
        }
    }
}

impl From<redb::DatabaseError> for CoinsError {
    fn from(e: redb::DatabaseError) -> Self {
        CoinsError::StoreUnavailable(e.to_string())
    }
}

impl From<redb::TransactionError> for CoinsError {
    fn from(e: redb::TransactionError) -> Self {
        CoinsError::StoreUnavailable(e.to_string())
    }
}

impl From<redb::TableError> for CoinsError {
    fn from(e: redb::TableError) -> Self {
        CoinsError::StoreUnavailable(e.to_string())
    }
}

impl From<redb::StorageError> for CoinsError {
    fn from(e: redb::StorageError) -> Self {
        CoinsError::StoreUnavailable(e.to_string())
    }
}

impl From<redb::CommitError> for CoinsError {
    fn from(e: redb::CommitError) -> Self {
        CoinsError::StoreUnavailable(e.to_string())
    }
}

impl From<bincode::Error> for CoinsError {
    fn from(e: bincode::Error) -> Self {
        CoinsError::Internal(format!("record encoding: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, CoinsError>;
