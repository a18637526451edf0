//! ============================================================================
//! CoinsService - Synchronous facade for the chat-bot and web front ends
//! ============================================================================
//! Front ends speak in external ids and untrusted integers. This layer
//! validates inputs, resolves accounts, and turns every mutation into an
//! `Outcome` carrying a message for the user. Rejections are logged at warn,
//! store faults at error.
//! ============================================================================

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::accounts::{self, AccountStore};
use crate::catalog::Catalog;
use crate::config::CoinsConfig;
use crate::db::{
    Account, CatalogItem, CoinsDb, DbStats, MerchOrder, Role, ServiceListing, ServiceOrder,
    Transaction, TxKind,
};
use crate::error::{CoinsError, Entity, Result};
use crate::exchange::Exchange;
use crate::ledger::{self, Ledger, ReconcileIssue};
use crate::stats::{self, Leaderboard};
use crate::types::{
    BalanceView, DailySpend, HistoryEntry, LeaderboardEntry, ListingView, Outcome, ProviderListing,
};

/// Description used for grants given without a reason
const DEFAULT_GRANT_REASON: &str = "Points granted by admin";

/// Shared handle over every ledger component. Cheap to clone across handlers.
#[derive(Clone)]
pub struct CoinsService {
    db: Arc<CoinsDb>,
    config: Arc<CoinsConfig>,
    accounts: Arc<AccountStore>,
    ledger: Arc<Ledger>,
    catalog: Arc<Catalog>,
    exchange: Arc<Exchange>,
    leaderboard: Arc<Leaderboard>,
}

impl CoinsService {
    pub fn new(db: Arc<CoinsDb>, config: CoinsConfig) -> Self {
        let config = Arc::new(config);
        Self {
            accounts: Arc::new(AccountStore::new(db.clone(), config.clone())),
            ledger: Arc::new(Ledger::new(db.clone())),
            catalog: Arc::new(Catalog::new(db.clone(), config.clone())),
            exchange: Arc::new(Exchange::new(db.clone(), config.clone())),
            leaderboard: Arc::new(Leaderboard::new(db.clone())),
            db,
            config,
        }
    }

    /// Open the store named by the config (or the default location)
    pub fn open(config: CoinsConfig) -> Result<Self> {
        let db = CoinsDb::open(config.db_path.as_deref())?;
        Ok(Self::new(Arc::new(db), config))
    }

    pub fn config(&self) -> &CoinsConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<CoinsDb> {
        &self.db
    }

    // ========================================================================
    // Accounts & balances
    // ========================================================================

    pub fn get_or_create_account(&self, external_id: &str, display_name: &str) -> Outcome<Account> {
        let result = self.accounts.get_or_create(external_id, display_name);
        self.outcome("register", external_id, result, |account| {
            format!("Welcome, {}", account.display_name)
        })
    }

    /// Balance and rank from one consistent snapshot
    pub fn get_balance(&self, external_id: &str) -> Result<BalanceView> {
        let result = self.db.read(|txn| {
            let account = accounts::require_in(txn, external_id)?;
            let balance = ledger::balance_in(txn, &account.id)?;
            let rank = stats::rank_in(txn, &account.id)?;
            Ok(BalanceView {
                current: balance.current_points,
                total_earned: balance.total_earned,
                total_spent: balance.total_spent,
                rank,
            })
        });
        self.logged("balance", result)
    }

    /// Newest first. Unknown accounts have an empty history.
    pub fn get_history(&self, external_id: &str, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        let limit = limit.unwrap_or(self.config.history_limit);
        let result = self.accounts.find_by_external_id(external_id).and_then(|account| match account {
            Some(account) => self.ledger.history(&account.id, limit),
            None => Ok(Vec::new()),
        });
        self.logged("history", result)
            .map(|history| history.iter().map(HistoryEntry::from).collect())
    }

    pub fn get_leaderboard(&self, limit: Option<usize>) -> Result<Vec<LeaderboardEntry>> {
        let result = self
            .leaderboard
            .top_n(limit.unwrap_or(self.config.leaderboard_limit));
        self.logged("leaderboard", result)
    }

    pub fn get_spend_chart(&self, external_id: &str, days: u32) -> Result<Vec<DailySpend>> {
        let result = self
            .require_account(external_id)
            .and_then(|account| self.leaderboard.daily_spend(&account.id, days));
        self.logged("spend chart", result)
    }

    /// Make an account an admin, creating it if needed
    pub fn promote(&self, external_id: &str, display_name: &str) -> Outcome<Account> {
        let result = self.accounts.set_role(external_id, display_name, Role::Admin);
        if result.is_ok() {
            info!("Promoted {} to admin", external_id);
        }
        self.outcome("promote", external_id, result, |account| {
            format!("{} ({}) is now an admin", account.display_name, account.external_id)
        })
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    pub fn list_catalog(&self) -> Result<Vec<CatalogItem>> {
        self.logged("catalog", self.catalog.list())
    }

    pub fn purchase_item(&self, external_id: &str, item_id: &str, quantity: i64) -> Outcome<MerchOrder> {
        let result = quantity_from(quantity, "quantity")
            .and_then(|quantity| self.catalog.purchase(external_id, item_id, quantity));
        self.outcome("purchase", external_id, result, |order| {
            format!(
                "Purchase complete: x{} for {} points",
                order.quantity, order.total_points
            )
        })
    }

    pub fn admin_add_catalog_item(
        &self,
        actor_external_id: &str,
        name: &str,
        price: i64,
        stock: i64,
        description: &str,
    ) -> Outcome<CatalogItem> {
        let result = self.require_admin(actor_external_id).and_then(|_| {
            let price = points_from(price, "price")?;
            let stock = stock_from(stock)?;
            self.catalog.add_item(name, price, stock, description)
        });
        self.outcome("add catalog item", actor_external_id, result, |item| {
            format!("Added {} ({} points, {} in stock)", item.name, item.price_points, item.stock_quantity)
        })
    }

    // ========================================================================
    // Exchange
    // ========================================================================

    pub fn list_listings(&self, viewer_external_id: &str) -> Result<Vec<ListingView>> {
        self.logged("listings", self.exchange.list_open(viewer_external_id))
    }

    pub fn my_listings(&self, external_id: &str) -> Result<Vec<ProviderListing>> {
        self.logged("my listings", self.exchange.my_listings(external_id))
    }

    pub fn publish_listing(
        &self,
        external_id: &str,
        name: &str,
        price: i64,
        description: &str,
    ) -> Outcome<ServiceListing> {
        let result = points_from(price, "price")
            .and_then(|price| self.exchange.publish(external_id, name, price, description));
        self.outcome("publish listing", external_id, result, |listing| {
            format!("Published {} for {} points", listing.name, listing.price_points)
        })
    }

    pub fn claim_listing(&self, external_id: &str, listing_id: &str) -> Outcome<ServiceOrder> {
        let result = self.exchange.claim(listing_id, external_id);
        self.outcome("claim listing", external_id, result, |_| {
            "Task taken. The provider confirms once the work is done".to_string()
        })
    }

    pub fn confirm_completion(&self, external_id: &str, order_id: &str) -> Outcome<ServiceOrder> {
        let result = self.exchange.confirm_completion(order_id, external_id);
        self.outcome("confirm completion", external_id, result, |_| {
            "Completion confirmed, points transferred".to_string()
        })
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Credit points to an existing account. Only admins may grant.
    pub fn admin_grant_points(
        &self,
        actor_external_id: &str,
        target_external_id: &str,
        amount: i64,
        reason: &str,
    ) -> Outcome<Transaction> {
        let result = points_from(amount, "amount").and_then(|amount| {
            let description = match reason.trim() {
                "" => DEFAULT_GRANT_REASON,
                reason => reason,
            };
            self.db.write(|txn| {
                let actor = accounts::find_in(txn, actor_external_id)?;
                self.check_admin(actor_external_id, actor.as_ref())?;
                let target = accounts::require_in(txn, target_external_id)?;
                ledger::record_in(txn, &target.id, TxKind::Earn, amount, description, None)
            })
        });
        if let Ok(tx) = &result {
            info!("{} granted {} points to {}", actor_external_id, tx.amount, target_external_id);
        }
        self.outcome("grant points", actor_external_id, result, |tx| {
            format!("Granted {} points to {}", tx.amount, target_external_id)
        })
    }

    /// Accounts whose stored balance disagrees with their transactions
    pub fn reconcile(&self) -> Result<Vec<ReconcileIssue>> {
        self.logged("reconcile", self.ledger.reconcile())
    }

    pub fn stats(&self) -> Result<DbStats> {
        self.logged("stats", self.db.stats())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn require_account(&self, external_id: &str) -> Result<Account> {
        self.accounts
            .find_by_external_id(external_id)?
            .ok_or_else(|| CoinsError::not_found(Entity::Account, external_id))
    }

    fn require_admin(&self, external_id: &str) -> Result<()> {
        let account = self.accounts.find_by_external_id(external_id)?;
        self.check_admin(external_id, account.as_ref())
    }

    /// Admin by stored role or by configured id
    fn check_admin(&self, external_id: &str, account: Option<&Account>) -> Result<()> {
        let stored_admin = account.map(Account::is_admin).unwrap_or(false);
        if stored_admin || self.config.is_admin_id(external_id) {
            Ok(())
        } else {
            Err(CoinsError::NotAuthorized(format!("{} is not an admin", external_id)))
        }
    }

    /// Log store faults from read-side operations; business errors pass through quietly
    fn logged<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("{} failed: {}", operation, e);
            }
        }
        result
    }

    fn outcome<T>(
        &self,
        operation: &str,
        actor: &str,
        result: Result<T>,
        message: impl FnOnce(&T) -> String,
    ) -> Outcome<T> {
        match result {
            Ok(data) => {
                let message = message(&data);
                Outcome::ok(data, message)
            }
            Err(e) if e.is_fatal() => {
                error!("{} by {} failed: {}", operation, actor, e);
                Outcome::err(e)
            }
            Err(e) => {
                warn!("{} by {} rejected: {}", operation, actor, e);
                Outcome::err(e)
            }
        }
    }
}

fn points_from(value: i64, field: &str) -> Result<u64> {
    if value <= 0 {
        return Err(CoinsError::InvalidInput(format!("{} must be positive", field)));
    }
    Ok(value as u64)
}

fn quantity_from(value: i64, field: &str) -> Result<u32> {
    if value <= 0 {
        return Err(CoinsError::InvalidInput(format!("{} must be positive", field)));
    }
    u32::try_from(value).map_err(|_| CoinsError::InvalidInput(format!("{} is too large", field)))
}

fn stock_from(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| CoinsError::InvalidInput("stock must be between 0 and 4294967295".into()))
}
