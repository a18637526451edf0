//! ============================================================================
//! Leaderboard & Spend Statistics
//! ============================================================================
//! Read-only aggregation over accounts and the ledger. Ranking is by current
//! points, descending; ties go to the older account.
//! ============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::db::{Account, Balance, CoinsDb, Reader, TxKind, ACCOUNTS, BALANCES};
use crate::error::{CoinsError, Entity, Result};
use crate::ledger;
use crate::types::{DailySpend, LeaderboardEntry};

pub struct Leaderboard {
    db: Arc<CoinsDb>,
}

impl Leaderboard {
    pub fn new(db: Arc<CoinsDb>) -> Self {
        Self { db }
    }

    pub fn top_n(&self, n: usize) -> Result<Vec<LeaderboardEntry>> {
        let ranked = self.db.read(|txn| ranked_in(txn))?;
        Ok(ranked
            .into_iter()
            .take(n)
            .enumerate()
            .map(|(i, (account, points))| LeaderboardEntry {
                rank: i + 1,
                name: account.display_name,
                points,
            })
            .collect())
    }

    /// 1-based leaderboard position of an account
    pub fn rank_of(&self, account_id: &str) -> Result<usize> {
        self.db.read(|txn| rank_in(txn, account_id))
    }

    /// Spend totals per UTC day over the last `days` days (today included), oldest first.
    /// Days without spending are absent.
    pub fn daily_spend(&self, account_id: &str, days: u32) -> Result<Vec<DailySpend>> {
        self.daily_spend_at(account_id, days, Utc::now().date_naive())
    }

    pub(crate) fn daily_spend_at(
        &self,
        account_id: &str,
        days: u32,
        today: NaiveDate,
    ) -> Result<Vec<DailySpend>> {
        if days == 0 {
            return Err(CoinsError::InvalidInput("days must be positive".into()));
        }
        let first_day = today
            .checked_sub_days(chrono::Days::new(u64::from(days - 1)))
            .unwrap_or(NaiveDate::MIN);

        let history = self
            .db
            .read(|txn| ledger::history_in(txn, account_id, usize::MAX))?;

        let mut totals: BTreeMap<NaiveDate, u64> = BTreeMap::new();
        for tx in history.iter().filter(|tx| tx.kind == TxKind::Spend) {
            let day = match DateTime::<Utc>::from_timestamp(tx.created_at, 0) {
                Some(dt) => dt.date_naive(),
                None => continue,
            };
            if day < first_day || day > today {
                continue;
            }
            let total = totals.entry(day).or_insert(0);
            *total = total.saturating_add(tx.amount);
        }

        Ok(totals
            .into_iter()
            .map(|(date, total)| DailySpend { date, total })
            .collect())
    }
}

pub(crate) fn rank_in<R: Reader>(txn: &R, account_id: &str) -> Result<usize> {
    ranked_in(txn)?
        .iter()
        .position(|(account, _)| account.id == account_id)
        .map(|i| i + 1)
        .ok_or_else(|| CoinsError::not_found(Entity::Account, account_id))
}

/// Every account with its current points, in leaderboard order
fn ranked_in<R: Reader>(txn: &R) -> Result<Vec<(Account, u64)>> {
    let accounts: Vec<Account> = txn.load_all(ACCOUNTS)?;
    let balances: Vec<Balance> = txn.load_all(BALANCES)?;
    let points: HashMap<String, u64> = balances
        .into_iter()
        .map(|b| (b.account_id, b.current_points))
        .collect();

    let mut ranked: Vec<(Account, u64)> = accounts
        .into_iter()
        .map(|account| {
            let current = points.get(&account.id).copied().unwrap_or(0);
            (account, current)
        })
        .collect();
    ranked.sort_by(|(a, a_points), (b, b_points)| {
        b_points.cmp(a_points).then(a.seq.cmp(&b.seq))
    });
    Ok(ranked)
}
