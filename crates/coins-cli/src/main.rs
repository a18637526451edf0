// ============================================================================
// coins-admin - operator tool for the campus points ledger
// ============================================================================
// Usage:
//   coins-admin stats                               Show store statistics
//   coins-admin verify                              Check balances against the log
//   coins-admin export --format json                Export the full store as JSON
//   coins-admin leaderboard [--limit N]             Top accounts by points
//   coins-admin balance <ID>                        Balance card for an account
//   coins-admin history <ID> [--limit N]            Recent transactions
//   coins-admin chart <ID> [--days N]               Daily spend totals
//   coins-admin catalog                             Items in stock
//   coins-admin listings [--viewer ID]              Open service listings
//   coins-admin my-listings <ID>                    A provider's listings
//   coins-admin promote <ID> [--name NAME]          Grant the admin role
//   coins-admin grant --admin ID <TARGET> <AMOUNT> --reason TEXT
//   coins-admin add-item --admin ID --name N --price P --stock S
// ============================================================================

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use coins_core::{CoinsConfig, CoinsService, ListingStatus, Outcome};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Campus points ledger administration tool
#[derive(Parser)]
#[command(name = "coins-admin", version, about = "Inspect and administer the student coins ledger")]
struct Cli {
    /// Path to the database file (default: $COINS_DB_PATH or ~/.student-coins/coins.redb)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store statistics (accounts, orders, points in circulation)
    Stats,

    /// Replay every account's transactions and report mismatched balances
    Verify,

    /// Export full store contents
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Show the top accounts by current points
    Leaderboard {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show an account's balance and rank
    Balance { external_id: String },

    /// Show an account's recent transactions, newest first
    History {
        external_id: String,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show an account's spending per day
    Chart {
        external_id: String,

        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// List catalog items in stock
    Catalog,

    /// List open service listings
    Listings {
        /// Show claim status relative to this account
        #[arg(long, default_value = "")]
        viewer: String,
    },

    /// List everything a provider has published
    MyListings { external_id: String },

    /// Give an account the admin role, creating it if needed
    Promote {
        external_id: String,

        #[arg(long, default_value = "")]
        name: String,
    },

    /// Credit points to an account
    Grant {
        /// Acting admin's external id
        #[arg(long)]
        admin: String,

        target: String,

        amount: i64,

        #[arg(long, default_value = "")]
        reason: String,
    },

    /// Add an item to the merch catalog
    AddItem {
        /// Acting admin's external id
        #[arg(long)]
        admin: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        price: i64,

        #[arg(long)]
        stock: i64,

        #[arg(long, default_value = "")]
        description: String,
    },
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("coins_core=info,coins_admin=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = CoinsConfig::from_env()?;
    if cli.db_path.is_some() {
        config.db_path = cli.db_path;
    }
    debug!("Configuration: {:?}", config);
    let svc = CoinsService::open(config)?;

    match cli.command {
        Commands::Stats => cmd_stats(&svc),
        Commands::Verify => cmd_verify(&svc),
        Commands::Export { format } => cmd_export(&svc, &format),
        Commands::Leaderboard { limit } => cmd_leaderboard(&svc, limit),
        Commands::Balance { external_id } => cmd_balance(&svc, &external_id),
        Commands::History { external_id, limit } => cmd_history(&svc, &external_id, limit),
        Commands::Chart { external_id, days } => cmd_chart(&svc, &external_id, days),
        Commands::Catalog => cmd_catalog(&svc),
        Commands::Listings { viewer } => cmd_listings(&svc, &viewer),
        Commands::MyListings { external_id } => cmd_my_listings(&svc, &external_id),
        Commands::Promote { external_id, name } => report(svc.promote(&external_id, &name)),
        Commands::Grant {
            admin,
            target,
            amount,
            reason,
        } => report(svc.admin_grant_points(&admin, &target, amount, &reason)),
        Commands::AddItem {
            admin,
            name,
            price,
            stock,
            description,
        } => report(svc.admin_add_catalog_item(&admin, &name, price, stock, &description)),
    }
}

/// Print the outcome message; a rejected operation exits non-zero
fn report<T>(outcome: Outcome<T>) -> Result<()> {
    if outcome.success {
        println!("{}", outcome.message);
        Ok(())
    } else {
        match outcome.error {
            Some(e) if !e.is_fatal() => anyhow::bail!("{} ({})", outcome.message, e),
            _ => anyhow::bail!("{}", outcome.message),
        }
    }
}

fn cmd_stats(svc: &CoinsService) -> Result<()> {
    let stats = svc.stats()?;

    println!("=== Student Coins Ledger Stats ===");
    match svc.db().path() {
        Some(path) => println!("Database: {}", path.display()),
        None => println!("Database: (in memory)"),
    }
    println!();
    println!("Accounts:       {}", stats.accounts);
    println!("Transactions:   {}", stats.transactions);
    println!("Catalog items:  {}", stats.catalog_items);
    println!("Merch orders:   {}", stats.merch_orders);
    println!("Listings:       {}", stats.listings);
    println!("Service orders:");
    for (status, count) in &stats.service_orders {
        println!("  {:12} {}", status, count);
    }
    println!("Points in circulation: {}", stats.points_in_circulation);

    Ok(())
}

fn cmd_verify(svc: &CoinsService) -> Result<()> {
    let issues = svc.reconcile()?;
    if issues.is_empty() {
        println!("All balances match the transaction log.");
        return Ok(());
    }

    println!(
        "{:<20}  {:>10}  {:>10}  {:>10}  {}",
        "ACCOUNT", "STORED", "REPLAYED", "EARNED", "NEGATIVE"
    );
    println!("{}", "-".repeat(70));
    for issue in &issues {
        println!(
            "{:<20}  {:>10}  {:>10}  {:>10}  {}",
            issue.external_id,
            issue.stored.current_points,
            issue.replayed_points,
            issue.replayed_earned,
            if issue.went_negative { "yes" } else { "no" }
        );
    }
    anyhow::bail!("{} accounts are inconsistent", issues.len())
}

fn cmd_export(svc: &CoinsService, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let stats = svc.stats()?;
    let snapshot = svc.db().snapshot()?;

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": stats,
        "accounts": snapshot.accounts,
        "balances": snapshot.balances,
        "transactions": snapshot.transactions,
        "catalog": snapshot.catalog,
        "merch_orders": snapshot.merch_orders,
        "listings": snapshot.listings,
        "service_orders": snapshot.service_orders,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

fn cmd_leaderboard(svc: &CoinsService, limit: Option<usize>) -> Result<()> {
    let entries = svc.get_leaderboard(limit)?;
    if entries.is_empty() {
        println!("No accounts yet.");
        return Ok(());
    }

    for entry in &entries {
        println!("{:>3}. {:<30} {:>8}", entry.rank, entry.name, entry.points);
    }
    Ok(())
}

fn cmd_balance(svc: &CoinsService, external_id: &str) -> Result<()> {
    let view = svc.get_balance(external_id)?;
    println!("Balance:  {}", view.current);
    println!("Earned:   {}", view.total_earned);
    println!("Spent:    {}", view.total_spent);
    println!("Rank:     #{}", view.rank);
    Ok(())
}

fn cmd_history(svc: &CoinsService, external_id: &str, limit: Option<usize>) -> Result<()> {
    let entries = svc.get_history(external_id, limit)?;
    if entries.is_empty() {
        println!("No transactions found.");
        return Ok(());
    }

    println!("{:<16}  {:<5}  {:>8}  {}", "DATE", "KIND", "AMOUNT", "DESCRIPTION");
    println!("{}", "-".repeat(70));
    for entry in &entries {
        println!(
            "{:<16}  {:<5}  {:>8}  {}",
            entry.date,
            entry.kind.as_str(),
            entry.amount,
            entry.description
        );
    }
    Ok(())
}

fn cmd_chart(svc: &CoinsService, external_id: &str, days: u32) -> Result<()> {
    let chart = svc.get_spend_chart(external_id, days)?;
    if chart.is_empty() {
        println!("No spending in the last {} days.", days);
        return Ok(());
    }
    for day in &chart {
        println!("{}  {:>8}", day.date, day.total);
    }
    Ok(())
}

fn cmd_catalog(svc: &CoinsService) -> Result<()> {
    let items = svc.list_catalog()?;
    if items.is_empty() {
        println!("Catalog is empty.");
        return Ok(());
    }

    println!("{:<36}  {:<24}  {:>8}  {:>6}", "ITEM ID", "NAME", "PRICE", "STOCK");
    println!("{}", "-".repeat(82));
    for item in &items {
        println!(
            "{:<36}  {:<24}  {:>8}  {:>6}",
            item.id,
            item.name.chars().take(24).collect::<String>(),
            item.price_points,
            item.stock_quantity
        );
    }
    Ok(())
}

fn status_label(status: ListingStatus) -> &'static str {
    match status {
        ListingStatus::Open => "open",
        ListingStatus::ClaimedByViewer => "yours",
        ListingStatus::ClaimedByOther => "taken",
        ListingStatus::AwaitingProviderConfirmation => "awaiting",
    }
}

fn cmd_listings(svc: &CoinsService, viewer: &str) -> Result<()> {
    let views = svc.list_listings(viewer)?;
    if views.is_empty() {
        println!("No open listings.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<9}  {:>6}  {:<20}  {}",
        "LISTING ID", "STATUS", "PRICE", "PROVIDER", "NAME"
    );
    println!("{}", "-".repeat(100));
    for view in &views {
        println!(
            "{:<36}  {:<9}  {:>6}  {:<20}  {}",
            view.listing.id,
            status_label(view.status),
            view.listing.price_points,
            view.provider_name.chars().take(20).collect::<String>(),
            view.listing.name
        );
    }
    Ok(())
}

fn cmd_my_listings(svc: &CoinsService, external_id: &str) -> Result<()> {
    let listings = svc.my_listings(external_id)?;
    if listings.is_empty() {
        println!("No listings published.");
        return Ok(());
    }

    for entry in &listings {
        let state = match &entry.order {
            Some(order) => match order.completed_at {
                Some(ts) => format!("completed {}", format_timestamp(ts)),
                None => format!("claimed {}", format_timestamp(order.created_at)),
            },
            None if entry.listing.active => "open".to_string(),
            None => "closed".to_string(),
        };
        println!(
            "{}  {} ({} points) - {}, earned {}",
            entry.listing.id, entry.listing.name, entry.listing.price_points, state, entry.earnings
        );
    }
    Ok(())
}
