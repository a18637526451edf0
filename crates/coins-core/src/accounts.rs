//! ============================================================================
//! Account Store - Participant identity and lazy creation
//! ============================================================================
//! Accounts are keyed internally by a UUID and looked up by the front end's
//! external id through a unique index. Creation pairs the account with an
//! empty balance in the same write transaction.
//! ============================================================================

use redb::WriteTransaction;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::CoinsConfig;
use crate::db::{self, Account, Balance, CoinsDb, Reader, Role, TxKind, ACCOUNTS, ACCOUNT_INDEX, BALANCES};
use crate::error::{CoinsError, Entity, Result};
use crate::ledger;

const ACCOUNT_SEQ: &str = "accounts";

/// Description of the grant recorded for new accounts when a starting balance is configured
pub const WELCOME_BONUS: &str = "Welcome bonus";

pub struct AccountStore {
    db: Arc<CoinsDb>,
    config: Arc<CoinsConfig>,
}

impl AccountStore {
    pub fn new(db: Arc<CoinsDb>, config: Arc<CoinsConfig>) -> Self {
        Self { db, config }
    }

    /// Return the account for `external_id`, creating it (and its balance) if absent
    pub fn get_or_create(&self, external_id: &str, display_name: &str) -> Result<Account> {
        validate_external_id(external_id)?;

        // Fast path without taking the writer lock
        if let Some(account) = self.find_by_external_id(external_id)? {
            return Ok(account);
        }

        self.db
            .write(|txn| get_or_create_in(txn, &self.config, external_id, display_name))
    }

    pub fn find_by_external_id(&self, external_id: &str) -> Result<Option<Account>> {
        self.db.read(|txn| find_in(txn, external_id))
    }

    pub fn is_admin(&self, account: &Account) -> bool {
        account.is_admin()
    }

    /// Change an account's role, creating the account if needed
    pub fn set_role(&self, external_id: &str, display_name: &str, role: Role) -> Result<Account> {
        validate_external_id(external_id)?;
        self.db.write(|txn| {
            let mut account = get_or_create_in(txn, &self.config, external_id, display_name)?;
            if account.role != role {
                account.role = role;
                db::store(txn, ACCOUNTS, &account.id, &account)?;
                info!("Account {} is now {:?}", external_id, role);
            }
            Ok(account)
        })
    }

    /// All accounts in creation order
    pub fn list(&self) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self.db.read(|txn| txn.load_all(ACCOUNTS))?;
        accounts.sort_by_key(|a| a.seq);
        Ok(accounts)
    }
}

fn validate_external_id(external_id: &str) -> Result<()> {
    if external_id.trim().is_empty() {
        return Err(CoinsError::InvalidInput("external id must not be empty".into()));
    }
    Ok(())
}

pub(crate) fn find_in<R: Reader>(txn: &R, external_id: &str) -> Result<Option<Account>> {
    match txn.lookup(ACCOUNT_INDEX, external_id)? {
        Some(account_id) => Ok(Some(by_id_in(txn, &account_id)?)),
        None => Ok(None),
    }
}

/// Account for an external id that must already exist
pub(crate) fn require_in<R: Reader>(txn: &R, external_id: &str) -> Result<Account> {
    find_in(txn, external_id)?.ok_or_else(|| CoinsError::not_found(Entity::Account, external_id))
}

pub(crate) fn by_id_in<R: Reader>(txn: &R, account_id: &str) -> Result<Account> {
    txn.load(ACCOUNTS, account_id)?
        .ok_or_else(|| CoinsError::not_found(Entity::Account, account_id))
}

/// Lookup-then-insert inside the caller's unit of work. A lost race on the
/// unique index is resolved by re-reading the winner's account.
pub(crate) fn get_or_create_in(
    txn: &WriteTransaction,
    config: &CoinsConfig,
    external_id: &str,
    display_name: &str,
) -> Result<Account> {
    if let Some(account) = find_in(txn, external_id)? {
        return Ok(account);
    }

    let display_name = match display_name.trim() {
        "" => external_id.to_string(),
        name => name.to_string(),
    };
    let role = if config.is_admin_id(external_id) {
        Role::Admin
    } else {
        Role::Member
    };
    let account = Account {
        id: db::new_id(),
        external_id: external_id.to_string(),
        display_name,
        role,
        seq: db::next_seq(txn, ACCOUNT_SEQ)?,
        created_at: db::now(),
    };

    if !db::index_unique(txn, ACCOUNT_INDEX, external_id, &account.id)? {
        debug!("Account for {} created concurrently, re-reading", external_id);
        return require_in(txn, external_id);
    }
    db::store(txn, ACCOUNTS, &account.id, &account)?;
    db::store(txn, BALANCES, &account.id, &Balance::empty(&account.id))?;

    if config.starting_points > 0 {
        ledger::record_in(txn, &account.id, TxKind::Earn, config.starting_points, WELCOME_BONUS, None)?;
    }

    info!("Created account {} for {} ({:?})", account.id, external_id, account.role);
    Ok(account)
}
