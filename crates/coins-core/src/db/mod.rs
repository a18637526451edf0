// ============================================================================
// CoinsDb - Embedded Ledger Store (redb)
// ============================================================================
// Persistent storage for accounts, balances, transactions, the catalog and
// the service exchange. Default path: ~/.student-coins/coins.redb
//
// Every mutation runs inside one write transaction (`CoinsDb::write`). redb
// admits one writer at a time, so a write transaction holds exclusive access
// to every row it touches until it commits or aborts.
// ============================================================================

pub mod types;

pub use types::{
    Account, Balance, CatalogItem, DbStats, MerchOrder, MerchOrderStatus, RelatedEntity, Role,
    ServiceListing, ServiceOrder, ServiceOrderStatus, StoreSnapshot, Transaction, TxKind,
};

use redb::{backends::InMemoryBackend, Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{CoinsError, Result};

pub(crate) type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;
pub(crate) type IndexTable = TableDefinition<'static, &'static str, &'static str>;

// Entity tables, keyed by record id
pub(crate) const ACCOUNTS: RecordTable = TableDefinition::new("accounts");
pub(crate) const BALANCES: RecordTable = TableDefinition::new("balances");
pub(crate) const TRANSACTIONS: RecordTable = TableDefinition::new("transactions");
pub(crate) const CATALOG: RecordTable = TableDefinition::new("catalog");
pub(crate) const MERCH_ORDERS: RecordTable = TableDefinition::new("merch_orders");
pub(crate) const LISTINGS: RecordTable = TableDefinition::new("listings");
pub(crate) const SERVICE_ORDERS: RecordTable = TableDefinition::new("service_orders");

// Index tables
/// external_id -> account_id (unique)
pub(crate) const ACCOUNT_INDEX: IndexTable = TableDefinition::new("account_index");
/// "{account_id}/{seq:020}" -> transaction_id
pub(crate) const ACCOUNT_TRANSACTIONS: IndexTable = TableDefinition::new("account_transactions");
/// listing_id -> service_order_id, at most one per listing
pub(crate) const LISTING_CLAIMS: IndexTable = TableDefinition::new("listing_claims");

const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Embedded database for the points ledger
pub struct CoinsDb {
    db: Database,
    path: Option<PathBuf>,
}

impl CoinsDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses ~/.student-coins/coins.redb
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let db_path = match path {
            Some(p) => p.to_path_buf(),
            None => default_path()?,
        };

        info!("Opening ledger store at: {}", db_path.display());
        let db = Database::create(&db_path)?;
        Self::init(db, Some(db_path))
    }

    /// Store that lives only as long as the handle, for tests and dry runs
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::init(db, None)
    }

    fn init(db: Database, path: Option<PathBuf>) -> Result<Self> {
        // Ensure tables exist by doing a write transaction
        let write_txn = db.begin_write()?;
        {
            for table in [
                ACCOUNTS,
                BALANCES,
                TRANSACTIONS,
                CATALOG,
                MERCH_ORDERS,
                LISTINGS,
                SERVICE_ORDERS,
            ] {
                write_txn.open_table(table)?;
            }
            for index in [ACCOUNT_INDEX, ACCOUNT_TRANSACTIONS, LISTING_CLAIMS] {
                write_txn.open_table(index)?;
            }
            write_txn.open_table(COUNTERS)?;
        }
        write_txn.commit()?;

        info!("Ledger store ready");
        Ok(Self { db, path })
    }

    /// Database file path, None for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `op` as one atomic unit of work: commit on Ok, abort on Err.
    pub fn write<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&WriteTransaction) -> Result<T>,
    {
        let txn = self.db.begin_write()?;
        match op(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    warn!("Failed to abort write transaction: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    /// Run `op` against a consistent read snapshot
    pub fn read<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&ReadTransaction) -> Result<T>,
    {
        let txn = self.db.begin_read()?;
        op(&txn)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<DbStats> {
        self.read(|txn| {
            let balances: Vec<Balance> = txn.load_all(BALANCES)?;
            let orders: Vec<ServiceOrder> = txn.load_all(SERVICE_ORDERS)?;

            let mut service_orders = std::collections::BTreeMap::new();
            for order in &orders {
                *service_orders
                    .entry(order.status.as_str().to_string())
                    .or_insert(0usize) += 1;
            }

            Ok(DbStats {
                accounts: txn.count(ACCOUNTS)?,
                transactions: txn.count(TRANSACTIONS)?,
                catalog_items: txn.count(CATALOG)?,
                merch_orders: txn.count(MERCH_ORDERS)?,
                listings: txn.count(LISTINGS)?,
                service_orders,
                points_in_circulation: balances.iter().map(|b| u128::from(b.current_points)).sum(),
            })
        })
    }

    /// Every record in every entity table
    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        self.read(|txn| {
            Ok(StoreSnapshot {
                accounts: txn.load_all(ACCOUNTS)?,
                balances: txn.load_all(BALANCES)?,
                transactions: txn.load_all(TRANSACTIONS)?,
                catalog: txn.load_all(CATALOG)?,
                merch_orders: txn.load_all(MERCH_ORDERS)?,
                listings: txn.load_all(LISTINGS)?,
                service_orders: txn.load_all(SERVICE_ORDERS)?,
            })
        })
    }
}

fn default_path() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CoinsError::StoreUnavailable("Cannot determine home directory".into()))?;
    let dir = home.join(".student-coins");
    std::fs::create_dir_all(&dir).map_err(|e| {
        CoinsError::StoreUnavailable(format!("Failed to create {}: {}", dir.display(), e))
    })?;
    Ok(dir.join("coins.redb"))
}

// ============================================================================
// Record Access
// ============================================================================

/// Typed reads shared by read snapshots and write transactions
pub(crate) trait Reader {
    fn load<T: DeserializeOwned>(&self, table: RecordTable, key: &str) -> Result<Option<T>>;
    fn load_all<T: DeserializeOwned>(&self, table: RecordTable) -> Result<Vec<T>>;
    fn count(&self, table: RecordTable) -> Result<usize>;
    fn lookup(&self, index: IndexTable, key: &str) -> Result<Option<String>>;
    fn lookup_prefix(&self, index: IndexTable, prefix: &str) -> Result<Vec<String>>;
}

impl Reader for ReadTransaction {
    fn load<T: DeserializeOwned>(&self, table: RecordTable, key: &str) -> Result<Option<T>> {
        load_from(&self.open_table(table)?, key)
    }

    fn load_all<T: DeserializeOwned>(&self, table: RecordTable) -> Result<Vec<T>> {
        load_all_from(&self.open_table(table)?)
    }

    fn count(&self, table: RecordTable) -> Result<usize> {
        count_in(&self.open_table(table)?)
    }

    fn lookup(&self, index: IndexTable, key: &str) -> Result<Option<String>> {
        lookup_in(&self.open_table(index)?, key)
    }

    fn lookup_prefix(&self, index: IndexTable, prefix: &str) -> Result<Vec<String>> {
        lookup_prefix_in(&self.open_table(index)?, prefix)
    }
}

impl Reader for WriteTransaction {
    fn load<T: DeserializeOwned>(&self, table: RecordTable, key: &str) -> Result<Option<T>> {
        load_from(&self.open_table(table)?, key)
    }

    fn load_all<T: DeserializeOwned>(&self, table: RecordTable) -> Result<Vec<T>> {
        load_all_from(&self.open_table(table)?)
    }

    fn count(&self, table: RecordTable) -> Result<usize> {
        count_in(&self.open_table(table)?)
    }

    fn lookup(&self, index: IndexTable, key: &str) -> Result<Option<String>> {
        lookup_in(&self.open_table(index)?, key)
    }

    fn lookup_prefix(&self, index: IndexTable, prefix: &str) -> Result<Vec<String>> {
        lookup_prefix_in(&self.open_table(index)?, prefix)
    }
}

fn load_from<T, R>(table: &T, key: &str) -> Result<Option<R>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
    R: DeserializeOwned,
{
    match table.get(key)? {
        Some(value) => Ok(Some(bincode::deserialize(value.value())?)),
        None => Ok(None),
    }
}

fn load_all_from<T, R>(table: &T) -> Result<Vec<R>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
    R: DeserializeOwned,
{
    let mut results = Vec::new();
    for entry in table.range::<&str>(..)? {
        let (_key, value) = entry?;
        results.push(bincode::deserialize(value.value())?);
    }
    Ok(results)
}

fn count_in<T>(table: &T) -> Result<usize>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    Ok(table.range::<&str>(..)?.count())
}

fn lookup_in<T>(table: &T, key: &str) -> Result<Option<String>>
where
    T: ReadableTable<&'static str, &'static str>,
{
    Ok(table.get(key)?.map(|value| value.value().to_string()))
}

fn lookup_prefix_in<T>(table: &T, prefix: &str) -> Result<Vec<String>>
where
    T: ReadableTable<&'static str, &'static str>,
{
    let mut results = Vec::new();
    for entry in table.range::<&str>(prefix..)? {
        let (key, value) = entry?;
        if !key.value().starts_with(prefix) {
            break;
        }
        results.push(value.value().to_string());
    }
    Ok(results)
}

/// Insert or overwrite a record
pub(crate) fn store<T: Serialize>(
    txn: &WriteTransaction,
    table: RecordTable,
    key: &str,
    record: &T,
) -> Result<()> {
    let value = bincode::serialize(record)?;
    let mut table = txn.open_table(table)?;
    table.insert(key, value.as_slice())?;
    debug!("Stored record {}", key);
    Ok(())
}

/// Insert an index entry. Returns false, leaving the entry untouched, if the
/// key is already taken.
pub(crate) fn index_unique(
    txn: &WriteTransaction,
    index: IndexTable,
    key: &str,
    value: &str,
) -> Result<bool> {
    let mut table = txn.open_table(index)?;
    if table.get(key)?.is_some() {
        return Ok(false);
    }
    table.insert(key, value)?;
    Ok(true)
}

/// Next value of a named monotonically increasing sequence, starting at 1
pub(crate) fn next_seq(txn: &WriteTransaction, counter: &str) -> Result<u64> {
    let mut table = txn.open_table(COUNTERS)?;
    let next = match table.get(counter)? {
        Some(current) => current.value() + 1,
        None => 1,
    };
    table.insert(counter, next)?;
    Ok(next)
}

/// Key of an account's history entry; zero-padded so keys sort by sequence
pub(crate) fn history_key(account_id: &str, seq: u64) -> String {
    format!("{}/{:020}", account_id, seq)
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
