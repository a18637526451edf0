//! ============================================================================
//! Catalog - Finite-stock merchandise bought with points
//! ============================================================================
//! A purchase reads the item row, then the buyer's balance, then writes the
//! stock decrement, the spend and the order in one unit of work.
//! ============================================================================

use std::sync::Arc;
use tracing::info;

use crate::accounts;
use crate::config::CoinsConfig;
use crate::db::{
    self, CatalogItem, CoinsDb, MerchOrder, MerchOrderStatus, Reader, RelatedEntity, TxKind,
    CATALOG, MERCH_ORDERS,
};
use crate::error::{CoinsError, Entity, Result};
use crate::ledger;

const ITEM_SEQ: &str = "catalog";

pub struct Catalog {
    db: Arc<CoinsDb>,
    config: Arc<CoinsConfig>,
}

impl Catalog {
    pub fn new(db: Arc<CoinsDb>, config: Arc<CoinsConfig>) -> Self {
        Self { db, config }
    }

    /// Items in stock, newest first
    pub fn list(&self) -> Result<Vec<CatalogItem>> {
        let mut items: Vec<CatalogItem> = self.db.read(|txn| txn.load_all(CATALOG))?;
        items.retain(|item| item.stock_quantity > 0);
        items.sort_by(|a, b| b.seq.cmp(&a.seq));
        Ok(items)
    }

    pub fn get(&self, item_id: &str) -> Result<CatalogItem> {
        self.db.read(|txn| {
            txn.load(CATALOG, item_id)?
                .ok_or_else(|| CoinsError::not_found(Entity::CatalogItem, item_id))
        })
    }

    pub fn add_item(
        &self,
        name: &str,
        price_points: u64,
        stock_quantity: u32,
        description: &str,
    ) -> Result<CatalogItem> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoinsError::InvalidInput("item name must not be empty".into()));
        }
        if price_points == 0 {
            return Err(CoinsError::InvalidInput("price must be positive".into()));
        }

        let item = self.db.write(|txn| {
            let item = CatalogItem {
                id: db::new_id(),
                name: name.to_string(),
                price_points,
                stock_quantity,
                description: description.trim().to_string(),
                seq: db::next_seq(txn, ITEM_SEQ)?,
                created_at: db::now(),
            };
            db::store(txn, CATALOG, &item.id, &item)?;
            Ok(item)
        })?;

        info!("Added catalog item {} ({} points, stock {})", item.name, price_points, stock_quantity);
        Ok(item)
    }

    /// Buy `quantity` units of an item. Stock, points and the order commit together or not at all.
    pub fn purchase(&self, buyer_external_id: &str, item_id: &str, quantity: u32) -> Result<MerchOrder> {
        if quantity == 0 {
            return Err(CoinsError::InvalidInput("quantity must be positive".into()));
        }

        let (order, item_name) = self.db.write(|txn| {
            let mut item: CatalogItem = txn
                .load(CATALOG, item_id)?
                .ok_or_else(|| CoinsError::not_found(Entity::CatalogItem, item_id))?;
            let buyer = accounts::get_or_create_in(txn, &self.config, buyer_external_id, "")?;
            let balance = ledger::balance_in(txn, &buyer.id)?;

            if item.stock_quantity < quantity {
                return Err(CoinsError::OutOfStock {
                    requested: quantity,
                    available: item.stock_quantity,
                });
            }

            let total = item
                .price_points
                .checked_mul(u64::from(quantity))
                .ok_or_else(|| CoinsError::InvalidInput("order total is too large".into()))?;
            if balance.current_points < total {
                return Err(CoinsError::InsufficientFunds {
                    needed: total,
                    available: balance.current_points,
                });
            }

            item.stock_quantity -= quantity;
            db::store(txn, CATALOG, &item.id, &item)?;

            let order = MerchOrder {
                id: db::new_id(),
                item_id: item.id.clone(),
                buyer_account_id: buyer.id.clone(),
                quantity,
                total_points: total,
                status: MerchOrderStatus::Paid,
                created_at: db::now(),
            };
            ledger::record_in(
                txn,
                &buyer.id,
                TxKind::Spend,
                total,
                &format!("Bought {} x{}", item.name, quantity),
                Some(RelatedEntity::MerchOrder(order.id.clone())),
            )?;
            db::store(txn, MERCH_ORDERS, &order.id, &order)?;

            Ok((order, item.name))
        })?;

        info!(
            "Order {}: {} bought {} x{} for {} points",
            order.id, buyer_external_id, item_name, quantity, order.total_points
        );
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStore;
    use crate::ledger::Ledger;

    struct Fixture {
        db: Arc<CoinsDb>,
        accounts: AccountStore,
        ledger: Ledger,
        catalog: Catalog,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(CoinsDb::in_memory().unwrap());
        let config = Arc::new(CoinsConfig::default());
        Fixture {
            accounts: AccountStore::new(db.clone(), config.clone()),
            ledger: Ledger::new(db.clone()),
            catalog: Catalog::new(db.clone(), config),
            db,
        }
    }

    fn funded(f: &Fixture, external_id: &str, points: u64) -> String {
        let account = f.accounts.get_or_create(external_id, external_id).unwrap();
        f.ledger.record(&account.id, TxKind::Earn, points, "seed", None).unwrap();
        account.id
    }

    #[test]
    fn test_list_hides_sold_out_and_orders_newest_first() {
        let f = fixture();
        f.catalog.add_item("Hoodie", 300, 2, "").unwrap();
        f.catalog.add_item("Sticker", 10, 0, "").unwrap();
        f.catalog.add_item("Mug", 120, 5, "").unwrap();

        let names: Vec<String> = f.catalog.list().unwrap().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["Mug", "Hoodie"]);
    }

    #[test]
    fn test_add_item_validates_input() {
        let f = fixture();
        assert!(matches!(f.catalog.add_item(" ", 10, 1, ""), Err(CoinsError::InvalidInput(_))));
        assert!(matches!(f.catalog.add_item("Pen", 0, 1, ""), Err(CoinsError::InvalidInput(_))));
    }

    #[test]
    fn test_purchase_multiple_units() {
        let f = fixture();
        let buyer = funded(&f, "1", 1000);
        let item = f.catalog.add_item("Cap", 150, 5, "").unwrap();

        let order = f.catalog.purchase("1", &item.id, 3).unwrap();
        assert_eq!(order.total_points, 450);
        assert_eq!(order.quantity, 3);
        assert_eq!(order.status, MerchOrderStatus::Paid);

        assert_eq!(f.catalog.get(&item.id).unwrap().stock_quantity, 2);
        assert_eq!(f.ledger.balance(&buyer).unwrap().current_points, 550);

        let spend = &f.ledger.history(&buyer, 1).unwrap()[0];
        assert_eq!(spend.kind, TxKind::Spend);
        assert_eq!(spend.description, "Bought Cap x3");
        assert_eq!(spend.related, Some(RelatedEntity::MerchOrder(order.id)));
    }

    #[test]
    fn test_purchase_more_than_stock() {
        let f = fixture();
        funded(&f, "1", 1000);
        let item = f.catalog.add_item("Cap", 10, 2, "").unwrap();

        let err = f.catalog.purchase("1", &item.id, 3).unwrap_err();
        assert_eq!(err, CoinsError::OutOfStock { requested: 3, available: 2 });
        assert_eq!(f.catalog.get(&item.id).unwrap().stock_quantity, 2);
    }

    #[test]
    fn test_out_of_stock_checked_before_funds() {
        let f = fixture();
        let item = f.catalog.add_item("Cap", 10, 0, "").unwrap();
        let err = f.catalog.purchase("broke", &item.id, 1).unwrap_err();
        assert!(matches!(err, CoinsError::OutOfStock { .. }));
    }

    #[test]
    fn test_unknown_item() {
        let f = fixture();
        funded(&f, "1", 100);
        let err = f.catalog.purchase("1", "no-such-item", 1).unwrap_err();
        assert!(matches!(err, CoinsError::NotFound { entity: Entity::CatalogItem, .. }));
    }

    #[test]
    fn test_zero_quantity_rejected() {
        let f = fixture();
        let item = f.catalog.add_item("Cap", 10, 2, "").unwrap();
        let err = f.catalog.purchase("1", &item.id, 0).unwrap_err();
        assert!(matches!(err, CoinsError::InvalidInput(_)));
    }

    #[test]
    fn test_failed_purchase_by_new_buyer_creates_nothing() {
        let f = fixture();
        let item = f.catalog.add_item("Cap", 10, 2, "").unwrap();

        let err = f.catalog.purchase("stranger", &item.id, 1).unwrap_err();
        assert!(matches!(err, CoinsError::InsufficientFunds { needed: 10, available: 0 }));

        let stats = f.db.stats().unwrap();
        assert_eq!(stats.accounts, 0);
        assert_eq!(stats.merch_orders, 0);
        assert_eq!(stats.transactions, 0);
    }
}
