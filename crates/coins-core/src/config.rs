//! ============================================================================
//! Ledger Configuration
//! ============================================================================
//! Read from environment variables. Binaries load `.env` first with dotenvy.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{CoinsError, Result};

/// Default number of history entries returned when the caller gives no limit
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Default leaderboard length
pub const DEFAULT_LEADERBOARD_LIMIT: usize = 10;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinsConfig {
    /// Store file, None for the default location
    pub db_path: Option<PathBuf>,
    /// Points granted to every new account
    pub starting_points: u64,
    /// External ids that are admins from their first contact
    pub admin_ids: Vec<String>,
    pub history_limit: usize,
    pub leaderboard_limit: usize,
}

impl Default for CoinsConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            starting_points: 0,
            admin_ids: Vec::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            leaderboard_limit: DEFAULT_LEADERBOARD_LIMIT,
        }
    }
}

impl CoinsConfig {
    /// Build from COINS_* environment variables, defaults for anything unset
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let admin_ids = lookup("COINS_ADMIN_IDS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            db_path: lookup("COINS_DB_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            starting_points: parse_var(&lookup, "COINS_STARTING_POINTS")?
                .unwrap_or(defaults.starting_points),
            admin_ids,
            history_limit: parse_var(&lookup, "COINS_HISTORY_LIMIT")?
                .unwrap_or(defaults.history_limit),
            leaderboard_limit: parse_var(&lookup, "COINS_LEADERBOARD_LIMIT")?
                .unwrap_or(defaults.leaderboard_limit),
        })
    }

    pub fn is_admin_id(&self, external_id: &str) -> bool {
        self.admin_ids.iter().any(|id| id == external_id)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CoinsError::InvalidInput(format!("{} is not a valid number: {:?}", key, raw))),
        None => Ok(None),
    }
}
