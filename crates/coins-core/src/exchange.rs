//! ============================================================================
//! Exchange - Peer service listings, claims and paid completion
//! ============================================================================
//! A listing is claimed by inserting into the `listing_claims` index, which
//! holds at most one order per listing; two simultaneous claims serialize on
//! the writer lock and the second finds the slot taken.
//!
//! Payment is not escrowed at claim time. The provider's balance is checked and
//! moved only when they confirm completion, so a provider who spent their
//! points after a claim cannot confirm until they earn more.
//! ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::accounts;
use crate::config::CoinsConfig;
use crate::db::{
    self, Account, CoinsDb, Reader, RelatedEntity, ServiceListing, ServiceOrder, ServiceOrderStatus,
    ACCOUNTS, LISTINGS, LISTING_CLAIMS, SERVICE_ORDERS,
};
use crate::error::{CoinsError, Entity, Result};
use crate::ledger;
use crate::types::{ListingStatus, ListingView, ProviderListing};

const LISTING_SEQ: &str = "listings";

pub struct Exchange {
    db: Arc<CoinsDb>,
    config: Arc<CoinsConfig>,
}

impl Exchange {
    pub fn new(db: Arc<CoinsDb>, config: Arc<CoinsConfig>) -> Self {
        Self { db, config }
    }

    /// Publish a listing. Identical names and prices are allowed.
    pub fn publish(
        &self,
        provider_external_id: &str,
        name: &str,
        price_points: u64,
        description: &str,
    ) -> Result<ServiceListing> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoinsError::InvalidInput("service name must not be empty".into()));
        }
        if price_points == 0 {
            return Err(CoinsError::InvalidInput("price must be positive".into()));
        }

        let listing = self.db.write(|txn| {
            let provider = accounts::get_or_create_in(txn, &self.config, provider_external_id, "")?;
            let listing = ServiceListing {
                id: db::new_id(),
                provider_account_id: provider.id,
                name: name.to_string(),
                price_points,
                description: description.trim().to_string(),
                active: true,
                seq: db::next_seq(txn, LISTING_SEQ)?,
                created_at: db::now(),
            };
            db::store(txn, LISTINGS, &listing.id, &listing)?;
            Ok(listing)
        })?;

        info!("{} published listing {} ({} points)", provider_external_id, listing.id, price_points);
        Ok(listing)
    }

    /// Active listings, newest first, each with its status relative to the viewer
    pub fn list_open(&self, viewer_external_id: &str) -> Result<Vec<ListingView>> {
        self.db.read(|txn| {
            let viewer = accounts::find_in(txn, viewer_external_id)?;
            let viewer_id = viewer.as_ref().map(|a| a.id.as_str());
            let names = display_names(txn)?;

            let mut listings: Vec<ServiceListing> = txn.load_all(LISTINGS)?;
            listings.retain(|l| l.active);
            listings.sort_by(|a, b| b.seq.cmp(&a.seq));

            let mut views = Vec::with_capacity(listings.len());
            for listing in listings {
                let order = claim_for(txn, &listing.id)?;
                let status = match &order {
                    None => ListingStatus::Open,
                    Some(order) if order.status == ServiceOrderStatus::Completed => continue,
                    Some(_) if viewer_id == Some(listing.provider_account_id.as_str()) => {
                        ListingStatus::AwaitingProviderConfirmation
                    }
                    Some(order) if viewer_id == Some(order.executor_account_id.as_str()) => {
                        ListingStatus::ClaimedByViewer
                    }
                    Some(_) => ListingStatus::ClaimedByOther,
                };
                let provider_name = names
                    .get(&listing.provider_account_id)
                    .cloned()
                    .unwrap_or_default();
                views.push(ListingView {
                    listing,
                    provider_name,
                    status,
                    order_id: order.map(|o| o.id),
                });
            }
            Ok(views)
        })
    }

    /// Claim a listing for the executor. Exactly one claim per listing succeeds.
    pub fn claim(&self, listing_id: &str, executor_external_id: &str) -> Result<ServiceOrder> {
        let order = self.db.write(|txn| {
            let listing: ServiceListing = txn
                .load(LISTINGS, listing_id)?
                .ok_or_else(|| CoinsError::not_found(Entity::Listing, listing_id))?;
            let executor = accounts::get_or_create_in(txn, &self.config, executor_external_id, "")?;
            if executor.id == listing.provider_account_id {
                return Err(CoinsError::SelfClaim);
            }

            let order = ServiceOrder {
                id: db::new_id(),
                listing_id: listing.id.clone(),
                executor_account_id: executor.id,
                status: ServiceOrderStatus::Assigned,
                created_at: db::now(),
                completed_at: None,
            };
            if !db::index_unique(txn, LISTING_CLAIMS, &listing.id, &order.id)? {
                return Err(CoinsError::AlreadyClaimed(listing.id));
            }
            db::store(txn, SERVICE_ORDERS, &order.id, &order)?;
            Ok(order)
        })?;

        info!("{} claimed listing {} (order {})", executor_external_id, listing_id, order.id);
        Ok(order)
    }

    /// Provider confirms the work; the listing price moves from provider to executor.
    pub fn confirm_completion(&self, order_id: &str, confirmer_external_id: &str) -> Result<ServiceOrder> {
        let (order, price) = self.db.write(|txn| {
            let mut order: ServiceOrder = txn
                .load(SERVICE_ORDERS, order_id)?
                .ok_or_else(|| CoinsError::not_found(Entity::ServiceOrder, order_id))?;
            let mut listing: ServiceListing = txn
                .load(LISTINGS, &order.listing_id)?
                .ok_or_else(|| CoinsError::not_found(Entity::Listing, &order.listing_id))?;
            let confirmer = accounts::get_or_create_in(txn, &self.config, confirmer_external_id, "")?;

            if confirmer.id != listing.provider_account_id {
                return Err(CoinsError::NotAuthorized(
                    "only the provider can confirm completion".into(),
                ));
            }
            if order.status == ServiceOrderStatus::Completed {
                return Err(CoinsError::AlreadyCompleted(order.id));
            }

            let provider_balance = ledger::balance_in(txn, &listing.provider_account_id)?;
            if provider_balance.current_points < listing.price_points {
                return Err(CoinsError::InsufficientFunds {
                    needed: listing.price_points,
                    available: provider_balance.current_points,
                });
            }

            order.status = ServiceOrderStatus::Completed;
            order.completed_at = Some(db::now());
            db::store(txn, SERVICE_ORDERS, &order.id, &order)?;

            listing.active = false;
            db::store(txn, LISTINGS, &listing.id, &listing)?;

            ledger::transfer_in(
                txn,
                &listing.provider_account_id,
                &order.executor_account_id,
                listing.price_points,
                (
                    &format!("Paid for service: {}", listing.name),
                    &format!("Completed service: {}", listing.name),
                ),
                Some(RelatedEntity::ServiceOrder(order.id.clone())),
            )?;
            Ok((order, listing.price_points))
        })?;

        info!("Order {} completed, {} points paid to executor", order.id, price);
        Ok(order)
    }

    /// Every listing the provider published, newest first
    pub fn my_listings(&self, provider_external_id: &str) -> Result<Vec<ProviderListing>> {
        self.db.read(|txn| {
            let provider = match accounts::find_in(txn, provider_external_id)? {
                Some(account) => account,
                None => return Ok(Vec::new()),
            };

            let mut listings: Vec<ServiceListing> = txn.load_all(LISTINGS)?;
            listings.retain(|l| l.provider_account_id == provider.id);
            listings.sort_by(|a, b| b.seq.cmp(&a.seq));

            let mut summaries = Vec::with_capacity(listings.len());
            for listing in listings {
                let order = claim_for(txn, &listing.id)?;
                let earnings = match &order {
                    Some(o) if o.status == ServiceOrderStatus::Completed => listing.price_points,
                    _ => 0,
                };
                summaries.push(ProviderListing {
                    orders: usize::from(order.is_some()),
                    earnings,
                    order,
                    listing,
                });
            }
            Ok(summaries)
        })
    }

    pub fn order(&self, order_id: &str) -> Result<ServiceOrder> {
        self.db.read(|txn| {
            txn.load(SERVICE_ORDERS, order_id)?
                .ok_or_else(|| CoinsError::not_found(Entity::ServiceOrder, order_id))
        })
    }
}

fn claim_for<R: Reader>(txn: &R, listing_id: &str) -> Result<Option<ServiceOrder>> {
    match txn.lookup(LISTING_CLAIMS, listing_id)? {
        Some(order_id) => {
            let order = txn.load(SERVICE_ORDERS, &order_id)?.ok_or_else(|| {
                CoinsError::Internal(format!("claim on {} references missing order {}", listing_id, order_id))
            })?;
            Ok(Some(order))
        }
        None => Ok(None),
    }
}

fn display_names<R: Reader>(txn: &R) -> Result<HashMap<String, String>> {
    let accounts: Vec<Account> = txn.load_all(ACCOUNTS)?;
    Ok(accounts.into_iter().map(|a| (a.id, a.display_name)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStore;
    use crate::db::TxKind;
    use crate::ledger::Ledger;

    struct Fixture {
        accounts: AccountStore,
        ledger: Ledger,
        exchange: Exchange,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(CoinsDb::in_memory().unwrap());
        let config = Arc::new(CoinsConfig::default());
        Fixture {
            accounts: AccountStore::new(db.clone(), config.clone()),
            ledger: Ledger::new(db.clone()),
            exchange: Exchange::new(db, config),
        }
    }

    fn funded(f: &Fixture, external_id: &str, points: u64) -> String {
        let account = f.accounts.get_or_create(external_id, external_id).unwrap();
        f.ledger.record(&account.id, TxKind::Earn, points, "seed", None).unwrap();
        account.id
    }

    #[test]
    fn test_publish_auto_creates_provider() {
        let f = fixture();
        let listing = f.exchange.publish("new-user", "Tutoring", 100, "").unwrap();
        let provider = f.accounts.find_by_external_id("new-user").unwrap().unwrap();
        assert_eq!(listing.provider_account_id, provider.id);
        assert!(listing.active);
    }

    #[test]
    fn test_publish_validates_input() {
        let f = fixture();
        assert!(matches!(f.exchange.publish("p", "", 10, ""), Err(CoinsError::InvalidInput(_))));
        assert!(matches!(f.exchange.publish("p", "Notes", 0, ""), Err(CoinsError::InvalidInput(_))));
    }

    #[test]
    fn test_duplicate_listings_allowed() {
        let f = fixture();
        let a = f.exchange.publish("p", "Notes", 50, "").unwrap();
        let b = f.exchange.publish("p", "Notes", 50, "").unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(f.exchange.list_open("p").unwrap().len(), 2);
    }

    #[test]
    fn test_claim_unknown_listing() {
        let f = fixture();
        let err = f.exchange.claim("missing", "x").unwrap_err();
        assert!(matches!(err, CoinsError::NotFound { entity: Entity::Listing, .. }));
    }

    #[test]
    fn test_second_claim_by_other_executor_rejected() {
        let f = fixture();
        let listing = f.exchange.publish("p", "Notes", 50, "").unwrap();
        f.exchange.claim(&listing.id, "e1").unwrap();
        let err = f.exchange.claim(&listing.id, "e2").unwrap_err();
        assert_eq!(err, CoinsError::AlreadyClaimed(listing.id));
    }

    #[test]
    fn test_listing_status_per_viewer() {
        let f = fixture();
        f.accounts.get_or_create("p", "Provider").unwrap();
        let claimed = f.exchange.publish("p", "Claimed", 50, "").unwrap();
        let open = f.exchange.publish("p", "Open", 50, "").unwrap();
        let order = f.exchange.claim(&claimed.id, "e").unwrap();

        let status_for = |viewer: &str, listing_id: &str| {
            f.exchange
                .list_open(viewer)
                .unwrap()
                .into_iter()
                .find(|v| v.listing.id == listing_id)
                .map(|v| v.status)
                .unwrap()
        };

        assert_eq!(status_for("p", &claimed.id), ListingStatus::AwaitingProviderConfirmation);
        assert_eq!(status_for("e", &claimed.id), ListingStatus::ClaimedByViewer);
        assert_eq!(status_for("other", &claimed.id), ListingStatus::ClaimedByOther);
        assert_eq!(status_for("other", &open.id), ListingStatus::Open);
        assert_eq!(status_for("p", &open.id), ListingStatus::Open);

        let views = f.exchange.list_open("p").unwrap();
        assert_eq!(views[0].listing.id, open.id);
        assert_eq!(views[1].order_id.as_deref(), Some(order.id.as_str()));
        assert_eq!(views[1].provider_name, "Provider");
    }

    #[test]
    fn test_completed_listing_leaves_open_list() {
        let f = fixture();
        funded(&f, "p", 100);
        let listing = f.exchange.publish("p", "Notes", 50, "").unwrap();
        let order = f.exchange.claim(&listing.id, "e").unwrap();
        f.exchange.confirm_completion(&order.id, "p").unwrap();

        assert!(f.exchange.list_open("e").unwrap().is_empty());
    }

    #[test]
    fn test_only_provider_confirms() {
        let f = fixture();
        funded(&f, "p", 100);
        let listing = f.exchange.publish("p", "Notes", 50, "").unwrap();
        let order = f.exchange.claim(&listing.id, "e").unwrap();

        let err = f.exchange.confirm_completion(&order.id, "e").unwrap_err();
        assert!(matches!(err, CoinsError::NotAuthorized(_)));
        assert_eq!(f.exchange.order(&order.id).unwrap().status, ServiceOrderStatus::Assigned);
    }

    #[test]
    fn test_confirm_unknown_order() {
        let f = fixture();
        let err = f.exchange.confirm_completion("missing", "p").unwrap_err();
        assert!(matches!(err, CoinsError::NotFound { entity: Entity::ServiceOrder, .. }));
    }

    #[test]
    fn test_provider_without_points_cannot_confirm() {
        let f = fixture();
        let provider = funded(&f, "p", 40);
        let listing = f.exchange.publish("p", "Notes", 50, "").unwrap();
        let order = f.exchange.claim(&listing.id, "e").unwrap();

        let err = f.exchange.confirm_completion(&order.id, "p").unwrap_err();
        assert_eq!(err, CoinsError::InsufficientFunds { needed: 50, available: 40 });

        assert_eq!(f.exchange.order(&order.id).unwrap().status, ServiceOrderStatus::Assigned);
        assert_eq!(f.ledger.balance(&provider).unwrap().current_points, 40);

        // Confirmation succeeds once the provider can pay
        f.ledger.record(&provider, TxKind::Earn, 10, "top up", None).unwrap();
        let done = f.exchange.confirm_completion(&order.id, "p").unwrap();
        assert_eq!(done.status, ServiceOrderStatus::Completed);
        assert_eq!(f.ledger.balance(&provider).unwrap().current_points, 0);
    }

    #[test]
    fn test_payment_transactions_reference_order() {
        let f = fixture();
        let provider = funded(&f, "p", 100);
        let listing = f.exchange.publish("p", "Notes", 60, "").unwrap();
        let order = f.exchange.claim(&listing.id, "e").unwrap();
        f.exchange.confirm_completion(&order.id, "p").unwrap();

        let executor = f.accounts.find_by_external_id("e").unwrap().unwrap();
        let paid = &f.ledger.history(&provider, 1).unwrap()[0];
        let earned = &f.ledger.history(&executor.id, 1).unwrap()[0];
        assert_eq!(paid.description, "Paid for service: Notes");
        assert_eq!(earned.description, "Completed service: Notes");
        assert_eq!(earned.amount, 60);
        assert_eq!(paid.related, Some(RelatedEntity::ServiceOrder(order.id.clone())));
        assert_eq!(earned.related, Some(RelatedEntity::ServiceOrder(order.id)));
    }

    #[test]
    fn test_my_listings_summary() {
        let f = fixture();
        funded(&f, "p", 500);
        let done = f.exchange.publish("p", "Essay review", 120, "").unwrap();
        let pending = f.exchange.publish("p", "Lab help", 80, "").unwrap();
        f.exchange.publish("p", "Fresh", 30, "").unwrap();

        let order = f.exchange.claim(&done.id, "e").unwrap();
        f.exchange.confirm_completion(&order.id, "p").unwrap();
        f.exchange.claim(&pending.id, "e").unwrap();

        let mine = f.exchange.my_listings("p").unwrap();
        assert_eq!(mine.len(), 3);
        let by_name = |name: &str| mine.iter().find(|l| l.listing.name == name).unwrap();
        assert_eq!(by_name("Essay review").earnings, 120);
        assert_eq!(by_name("Essay review").orders, 1);
        assert_eq!(by_name("Lab help").earnings, 0);
        assert_eq!(
            by_name("Lab help").order.as_ref().map(|o| o.status),
            Some(ServiceOrderStatus::Assigned)
        );
        assert_eq!(by_name("Fresh").orders, 0);

        assert!(f.exchange.my_listings("nobody").unwrap().is_empty());
    }
}
