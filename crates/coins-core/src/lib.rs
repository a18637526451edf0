//! ============================================================================
//! COINS-CORE: Campus points ledger engine
//! ============================================================================
//! Transaction engine behind the chat-bot and the web mini-app:
//! - Accounts keyed by the front end's external id
//! - Append-only ledger with maintained balances
//! - Merch catalog with finite stock
//! - Peer service exchange with claim and paid confirmation
//! - Leaderboard and spend statistics
//! ============================================================================

pub mod accounts;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod exchange;
pub mod ledger;
pub mod service;
pub mod stats;
pub mod types;

// Re-export main types for convenience
pub use types::*;
pub use accounts::AccountStore;
pub use catalog::Catalog;
pub use config::CoinsConfig;
pub use db::{
    Account, Balance, CatalogItem, CoinsDb, DbStats, MerchOrder, MerchOrderStatus, RelatedEntity,
    Role, ServiceListing, ServiceOrder, ServiceOrderStatus, StoreSnapshot, Transaction, TxKind,
};
pub use error::{CoinsError, Entity, Result};
pub use exchange::Exchange;
pub use ledger::{Ledger, ReconcileIssue};
pub use service::CoinsService;
pub use stats::Leaderboard;
