//! ============================================================================
//! Ledger - Append-only point movements and balance maintenance
//! ============================================================================
//! `record_in` / `transfer_in` operate inside the caller's unit of work so a
//! purchase or a service payment commits stock, orders and points together.
//! Callers check balance sufficiency before recording a spend; the ledger only
//! refuses to drive a balance below zero.
//! ============================================================================

use redb::WriteTransaction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::db::{
    self, Account, Balance, CoinsDb, Reader, RelatedEntity, Transaction, TxKind, ACCOUNTS,
    ACCOUNT_TRANSACTIONS, BALANCES, TRANSACTIONS,
};
use crate::error::{CoinsError, Result};

const TRANSACTION_SEQ: &str = "transactions";

/// Ledger operations that run as their own unit of work
pub struct Ledger {
    db: Arc<CoinsDb>,
}

/// An account whose stored balance disagrees with a replay of its transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileIssue {
    pub account_id: String,
    pub external_id: String,
    pub stored: Balance,
    pub replayed_points: i128,
    pub replayed_earned: u128,
    pub replayed_spent: u128,
    /// Running balance dropped below zero at some point in the replay
    pub went_negative: bool,
}

impl Ledger {
    pub fn new(db: Arc<CoinsDb>) -> Self {
        Self { db }
    }

    pub fn record(
        &self,
        account_id: &str,
        kind: TxKind,
        amount: u64,
        description: &str,
        related: Option<RelatedEntity>,
    ) -> Result<Transaction> {
        self.db
            .write(|txn| record_in(txn, account_id, kind, amount, description, related))
    }

    /// Move points between two accounts. `descriptions` is (spend side, earn side).
    pub fn transfer(
        &self,
        from_account_id: &str,
        to_account_id: &str,
        amount: u64,
        descriptions: (&str, &str),
    ) -> Result<(Transaction, Transaction)> {
        self.db.write(|txn| {
            transfer_in(txn, from_account_id, to_account_id, amount, descriptions, None)
        })
    }

    pub fn balance(&self, account_id: &str) -> Result<Balance> {
        self.db.read(|txn| balance_in(txn, account_id))
    }

    /// Most recent transactions first
    pub fn history(&self, account_id: &str, limit: usize) -> Result<Vec<Transaction>> {
        self.db.read(|txn| history_in(txn, account_id, limit))
    }

    /// Replay every account's transactions and compare against stored balances
    pub fn reconcile(&self) -> Result<Vec<ReconcileIssue>> {
        let (accounts, balances, transactions) = self.db.read(|txn| {
            let accounts: Vec<Account> = txn.load_all(ACCOUNTS)?;
            let balances: Vec<Balance> = txn.load_all(BALANCES)?;
            let transactions: Vec<Transaction> = txn.load_all(TRANSACTIONS)?;
            Ok((accounts, balances, transactions))
        })?;

        let mut by_account: HashMap<&str, Vec<&Transaction>> = HashMap::new();
        for tx in &transactions {
            by_account.entry(tx.account_id.as_str()).or_default().push(tx);
        }
        let balances: HashMap<&str, &Balance> = balances
            .iter()
            .map(|b| (b.account_id.as_str(), b))
            .collect();

        let mut issues = Vec::new();
        for account in &accounts {
            let stored = balances
                .get(account.id.as_str())
                .map(|b| (*b).clone())
                .unwrap_or_else(|| Balance::empty(&account.id));

            let mut entries = by_account.remove(account.id.as_str()).unwrap_or_default();
            entries.sort_by_key(|tx| tx.seq);

            let mut running: i128 = 0;
            let mut earned: u128 = 0;
            let mut spent: u128 = 0;
            let mut went_negative = false;
            for tx in entries {
                match tx.kind {
                    TxKind::Earn => {
                        running += i128::from(tx.amount);
                        earned += u128::from(tx.amount);
                    }
                    TxKind::Spend => {
                        running -= i128::from(tx.amount);
                        spent += u128::from(tx.amount);
                    }
                }
                went_negative |= running < 0;
            }

            let consistent = !went_negative
                && running == i128::from(stored.current_points)
                && earned == u128::from(stored.total_earned)
                && spent == u128::from(stored.total_spent)
                && earned - spent == u128::from(stored.current_points);
            if !consistent {
                issues.push(ReconcileIssue {
                    account_id: account.id.clone(),
                    external_id: account.external_id.clone(),
                    stored,
                    replayed_points: running,
                    replayed_earned: earned,
                    replayed_spent: spent,
                    went_negative,
                });
            }
        }

        if !issues.is_empty() {
            error!("Reconciliation found {} inconsistent accounts", issues.len());
        }
        Ok(issues)
    }
}

pub(crate) fn balance_in<R: Reader>(txn: &R, account_id: &str) -> Result<Balance> {
    txn.load(BALANCES, account_id)?
        .ok_or_else(|| CoinsError::Internal(format!("account {} has no balance row", account_id)))
}

pub(crate) fn history_in<R: Reader>(txn: &R, account_id: &str, limit: usize) -> Result<Vec<Transaction>> {
    let ids = txn.lookup_prefix(ACCOUNT_TRANSACTIONS, &format!("{}/", account_id))?;
    let mut history = Vec::with_capacity(limit.min(ids.len()));
    for id in ids.iter().rev().take(limit) {
        let tx: Transaction = txn
            .load(TRANSACTIONS, id)?
            .ok_or_else(|| CoinsError::Internal(format!("history references missing transaction {}", id)))?;
        history.push(tx);
    }
    Ok(history)
}

/// Append a transaction and adjust the balance in the caller's unit of work
pub(crate) fn record_in(
    txn: &WriteTransaction,
    account_id: &str,
    kind: TxKind,
    amount: u64,
    description: &str,
    related: Option<RelatedEntity>,
) -> Result<Transaction> {
    record_at(txn, account_id, kind, amount, description, related, db::now())
}

pub(crate) fn record_at(
    txn: &WriteTransaction,
    account_id: &str,
    kind: TxKind,
    amount: u64,
    description: &str,
    related: Option<RelatedEntity>,
    created_at: i64,
) -> Result<Transaction> {
    if amount == 0 {
        return Err(CoinsError::InvalidInput("amount must be positive".into()));
    }

    let mut balance = balance_in(txn, account_id)?;
    match kind {
        TxKind::Earn => {
            let overflow = || CoinsError::InvalidInput(format!("amount {} exceeds the balance limit", amount));
            balance.current_points = balance.current_points.checked_add(amount).ok_or_else(overflow)?;
            balance.total_earned = balance.total_earned.checked_add(amount).ok_or_else(overflow)?;
        }
        TxKind::Spend => {
            balance.current_points = match balance.current_points.checked_sub(amount) {
                Some(points) => points,
                None => {
                    error!(
                        "Ledger contract violation: spend of {} on {} with only {} points",
                        amount, account_id, balance.current_points
                    );
                    return Err(CoinsError::InsufficientFunds {
                        needed: amount,
                        available: balance.current_points,
                    });
                }
            };
            balance.total_spent = balance.total_spent.checked_add(amount).ok_or_else(|| {
                CoinsError::Internal(format!("total spent overflow on {}", account_id))
            })?;
        }
    }

    let seq = db::next_seq(txn, TRANSACTION_SEQ)?;
    let tx = Transaction {
        id: db::new_id(),
        account_id: account_id.to_string(),
        kind,
        amount,
        description: description.to_string(),
        related,
        seq,
        created_at,
    };

    db::store(txn, TRANSACTIONS, &tx.id, &tx)?;
    db::store(txn, BALANCES, account_id, &balance)?;
    {
        let mut index = txn.open_table(ACCOUNT_TRANSACTIONS)?;
        index.insert(db::history_key(account_id, seq).as_str(), tx.id.as_str())?;
    }

    debug!("Recorded {} {} for {} ({})", kind.as_str(), amount, account_id, description);
    Ok(tx)
}

/// Spend on the source, earn on the destination, same unit of work
pub(crate) fn transfer_in(
    txn: &WriteTransaction,
    from_account_id: &str,
    to_account_id: &str,
    amount: u64,
    descriptions: (&str, &str),
    related: Option<RelatedEntity>,
) -> Result<(Transaction, Transaction)> {
    if from_account_id == to_account_id {
        return Err(CoinsError::InvalidInput("cannot transfer to the same account".into()));
    }
    let spend = record_in(txn, from_account_id, TxKind::Spend, amount, descriptions.0, related.clone())?;
    let earn = record_in(txn, to_account_id, TxKind::Earn, amount, descriptions.1, related)?;
    Ok((spend, earn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStore;
    use crate::config::CoinsConfig;

    fn setup() -> (Arc<CoinsDb>, AccountStore, Ledger) {
        let db = Arc::new(CoinsDb::in_memory().unwrap());
        let accounts = AccountStore::new(db.clone(), Arc::new(CoinsConfig::default()));
        let ledger = Ledger::new(db.clone());
        (db, accounts, ledger)
    }

    #[test]
    fn test_earn_then_spend_updates_totals() {
        let (_db, accounts, ledger) = setup();
        let acc = accounts.get_or_create("1", "Ann").unwrap();

        ledger.record(&acc.id, TxKind::Earn, 300, "Hackathon", None).unwrap();
        ledger.record(&acc.id, TxKind::Spend, 120, "Mug", None).unwrap();

        let balance = ledger.balance(&acc.id).unwrap();
        assert_eq!(balance.current_points, 180);
        assert_eq!(balance.total_earned, 300);
        assert_eq!(balance.total_spent, 120);
    }

    #[test]
    fn test_zero_amount_rejected() {
        let (_db, accounts, ledger) = setup();
        let acc = accounts.get_or_create("1", "Ann").unwrap();
        let err = ledger.record(&acc.id, TxKind::Earn, 0, "nothing", None).unwrap_err();
        assert!(matches!(err, CoinsError::InvalidInput(_)));
        assert!(ledger.history(&acc.id, 10).unwrap().is_empty());
    }

    #[test]
    fn test_overspend_is_refused_and_rolled_back() {
        let (_db, accounts, ledger) = setup();
        let acc = accounts.get_or_create("1", "Ann").unwrap();
        ledger.record(&acc.id, TxKind::Earn, 50, "seed", None).unwrap();

        let err = ledger.record(&acc.id, TxKind::Spend, 80, "too much", None).unwrap_err();
        assert_eq!(err, CoinsError::InsufficientFunds { needed: 80, available: 50 });

        assert_eq!(ledger.balance(&acc.id).unwrap().current_points, 50);
        assert_eq!(ledger.history(&acc.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_transfer_moves_points_atomically() {
        let (_db, accounts, ledger) = setup();
        let a = accounts.get_or_create("a", "A").unwrap();
        let b = accounts.get_or_create("b", "B").unwrap();
        ledger.record(&a.id, TxKind::Earn, 200, "seed", None).unwrap();

        let (spend, earn) = ledger.transfer(&a.id, &b.id, 150, ("paid", "received")).unwrap();
        assert_eq!(spend.kind, TxKind::Spend);
        assert_eq!(earn.kind, TxKind::Earn);
        assert_eq!(ledger.balance(&a.id).unwrap().current_points, 50);
        assert_eq!(ledger.balance(&b.id).unwrap().current_points, 150);
    }

    #[test]
    fn test_failed_transfer_leaves_both_sides_untouched() {
        let (_db, accounts, ledger) = setup();
        let a = accounts.get_or_create("a", "A").unwrap();
        let b = accounts.get_or_create("b", "B").unwrap();
        ledger.record(&a.id, TxKind::Earn, 10, "seed", None).unwrap();

        assert!(ledger.transfer(&a.id, &b.id, 150, ("paid", "received")).is_err());
        assert_eq!(ledger.balance(&a.id).unwrap().current_points, 10);
        assert_eq!(ledger.balance(&b.id).unwrap().current_points, 0);
        assert!(ledger.history(&b.id, 10).unwrap().is_empty());
    }

    #[test]
    fn test_self_transfer_rejected() {
        let (_db, accounts, ledger) = setup();
        let a = accounts.get_or_create("a", "A").unwrap();
        let err = ledger.transfer(&a.id, &a.id, 1, ("x", "y")).unwrap_err();
        assert!(matches!(err, CoinsError::InvalidInput(_)));
    }

    #[test]
    fn test_history_newest_first_with_limit() {
        let (_db, accounts, ledger) = setup();
        let acc = accounts.get_or_create("1", "Ann").unwrap();
        for (i, amount) in [10u64, 20, 30].iter().enumerate() {
            ledger
                .record(&acc.id, TxKind::Earn, *amount, &format!("grant {}", i), None)
                .unwrap();
        }

        let history = ledger.history(&acc.id, 2).unwrap();
        let amounts: Vec<u64> = history.iter().map(|t| t.amount).collect();
        assert_eq!(amounts, vec![30, 20]);
    }

    #[test]
    fn test_earn_past_u64_limit_rejected() {
        let (_db, accounts, ledger) = setup();
        let acc = accounts.get_or_create("1", "Ann").unwrap();
        ledger.record(&acc.id, TxKind::Earn, u64::MAX, "jackpot", None).unwrap();

        let err = ledger.record(&acc.id, TxKind::Earn, 1, "one more", None).unwrap_err();
        assert!(matches!(err, CoinsError::InvalidInput(_)));
        assert_eq!(ledger.balance(&acc.id).unwrap().current_points, u64::MAX);
        assert_eq!(ledger.history(&acc.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_total_earned_limit_keeps_balance_identity() {
        let (_db, accounts, ledger) = setup();
        let a = accounts.get_or_create("a", "A").unwrap();
        let b = accounts.get_or_create("b", "B").unwrap();
        ledger.record(&a.id, TxKind::Earn, u64::MAX, "seed", None).unwrap();
        ledger.transfer(&a.id, &b.id, u64::MAX, ("paid", "received")).unwrap();

        // Current points are zero but total earned is at its limit
        let err = ledger.record(&a.id, TxKind::Earn, 10, "refill", None).unwrap_err();
        assert!(matches!(err, CoinsError::InvalidInput(_)));

        let balance = ledger.balance(&a.id).unwrap();
        assert_eq!(balance.current_points, 0);
        assert_eq!(balance.total_earned - balance.total_spent, balance.current_points);
        assert!(ledger.reconcile().unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_replays_beyond_u64() {
        let (db, accounts, ledger) = setup();
        let a = accounts.get_or_create("a", "A").unwrap();
        let b = accounts.get_or_create("b", "B").unwrap();
        ledger.record(&a.id, TxKind::Earn, u64::MAX, "seed", None).unwrap();
        ledger.transfer(&a.id, &b.id, u64::MAX, ("paid", "received")).unwrap();

        // A second earn that the balance row never saw pushes the replay past u64
        db.write(|txn| {
            let tx = Transaction {
                id: "forged".into(),
                account_id: a.id.clone(),
                kind: TxKind::Earn,
                amount: 10,
                description: "forged".into(),
                related: None,
                seq: 1_000,
                created_at: 0,
            };
            db::store(txn, TRANSACTIONS, &tx.id, &tx)
        })
        .unwrap();

        let issues = ledger.reconcile().unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].account_id, a.id);
        assert_eq!(issues[0].replayed_earned, u128::from(u64::MAX) + 10);
        assert_eq!(issues[0].replayed_points, 10);
    }

    #[test]
    fn test_reconcile_clean_ledger() {
        let (_db, accounts, ledger) = setup();
        let a = accounts.get_or_create("a", "A").unwrap();
        let b = accounts.get_or_create("b", "B").unwrap();
        ledger.record(&a.id, TxKind::Earn, 100, "seed", None).unwrap();
        ledger.transfer(&a.id, &b.id, 40, ("x", "y")).unwrap();

        assert!(ledger.reconcile().unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_detects_tampered_balance() {
        let (db, accounts, ledger) = setup();
        let a = accounts.get_or_create("a", "A").unwrap();
        ledger.record(&a.id, TxKind::Earn, 100, "seed", None).unwrap();

        db.write(|txn| {
            let mut balance = balance_in(txn, &a.id)?;
            balance.current_points = 999;
            db::store(txn, BALANCES, &a.id, &balance)
        })
        .unwrap();

        let issues = ledger.reconcile().unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].external_id, "a");
        assert_eq!(issues[0].replayed_points, 100);
        assert_eq!(issues[0].stored.current_points, 999);
    }
}
