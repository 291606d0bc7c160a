//! Anchor Keeper
//!
//! Keeps leveraged anchor positions (and their sub-account mirrors)
//! converged on per-position margin targets, takes profit on winners
//! under two independent rules, auto-opens missing mirrors of losing
//! primary positions, and tracks profit extremes per holding period.

mod api;
mod bot;
mod db;
mod engine;
mod errors;
mod margin;
mod models;
mod server;

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{PositionProvider, SnapshotClient};
use crate::bot::{BotConfig, KeeperBot};
use crate::db::Database;
use crate::engine::KeeperConfig;
use crate::margin::{classify, target_margin};

/// Anchor keeper CLI.
#[derive(Parser)]
#[command(name = "anchorkeeper")]
#[command(about = "Keep leveraged anchor positions on their margin targets", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./anchor_keeper.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON config file; defaults apply for omitted fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the keeper loops and ops API
    Run {
        /// Log orders instead of dispatching them
        #[arg(long)]
        dry_run: bool,

        /// Ops API bind address
        #[arg(long, default_value = "127.0.0.1:8787")]
        api_addr: String,

        /// Disable the ops API
        #[arg(long)]
        no_api: bool,
    },

    /// One-shot margin deviation report over sub-account positions
    Scan,

    /// Show persisted keeper state
    Status,

    /// Show the effective configuration
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Configuration is constructed once; changes apply on restart only.
    let mut config = match &cli.config {
        Some(path) => KeeperConfig::from_file(path)?,
        None => KeeperConfig::default(),
    };
    if let Ok(url) = std::env::var("SNAPSHOT_BASE_URL") {
        config.snapshot_base_url = url;
    }
    if let Ok(url) = std::env::var("GATEWAY_BASE_URL") {
        config.gateway_base_url = url;
    }

    match cli.command {
        Commands::Run {
            dry_run,
            api_addr,
            no_api,
        } => {
            info!(dry_run, "Starting anchor keeper");

            let bot_config = BotConfig {
                database_url: cli.database.clone(),
                dry_run,
                api_addr: (!no_api).then_some(api_addr),
                keeper: config,
            };

            let bot = KeeperBot::new(bot_config).await?;
            bot.initialize().await?;

            println!("\n=== Anchor Keeper ===");
            println!("Mode: {}", if dry_run { "DRY RUN (no real orders)" } else { "LIVE" });
            println!("\nPress Ctrl+C to stop.\n");

            bot.run().await?;
        }

        Commands::Scan => {
            let db = Database::new(&cli.database).await?;
            let client = SnapshotClient::new(config.snapshot_base_url.clone())?;

            let positions = client.positions(&config.sub_account).await?;
            if positions.is_empty() {
                println!("No open positions on {}.", config.sub_account);
                return Ok(());
            }

            let date = config.exchange_today(Utc::now());

            println!(
                "\n{:<18} {:<6} {:>6} {:>10} {:>10} {:>9}  {}",
                "INSTRUMENT", "SIDE", "COUNT", "LIVE", "TARGET", "DELTA", "STATE"
            );
            println!("{}", "-".repeat(76));

            for pos in &positions {
                let key = pos.key();
                let count = db
                    .maintenance_count(
                        &config.sub_account,
                        &key.inst_id,
                        key.pos_side.as_str(),
                        date,
                    )
                    .await?;
                let target = target_margin(count);
                let live = pos.theoretical_margin();
                let deviation = classify(live, target, config.tolerance);

                println!(
                    "{:<18} {:<6} {:>6} {:>10.4} {:>10.2} {:>9.4}  {:?}",
                    key.inst_id,
                    key.pos_side.as_str(),
                    count,
                    live,
                    target,
                    deviation.delta,
                    deviation.class
                );
            }
        }

        Commands::Status => {
            let db = Database::new(&cli.database).await?;
            let date = config.exchange_today(Utc::now());

            let maintenance = db.maintenance_records_for(date).await?;
            let corrections = db.recent_correction_attempts(10).await?;
            let take_profits = db.recent_take_profits(10).await?;
            let anchors = db.active_anchors().await?;

            println!("\n=== Maintenance ({}) ===", date);
            if maintenance.is_empty() {
                println!("No corrections counted today.");
            }
            for record in &maintenance {
                println!(
                    "  {:<18} {:<6} count={} last={}",
                    record.inst_id,
                    record.pos_side,
                    record.count,
                    record
                        .last_maintenance
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }

            println!("\n=== Recent Corrections ===");
            for attempt in &corrections {
                println!(
                    "  [{}] {:<18} {:<6} attempt {} {} {:.4} -> {} ({}U off target)",
                    attempt.created_at,
                    attempt.inst_id,
                    attempt.pos_side,
                    attempt.attempt,
                    attempt.action,
                    attempt.requested_size,
                    attempt.result,
                    attempt.deviation
                );
            }

            println!("\n=== Recent Take-Profits ===");
            for record in &take_profits {
                println!(
                    "  [{}] {:<18} {:<6} rule={} rate={:.2}% closed={:.2}",
                    record.created_at,
                    record.inst_id,
                    record.pos_side,
                    record.rule,
                    record.profit_rate,
                    record.close_size
                );
            }

            println!("\n=== Active Anchors ({}) ===", anchors.len());
            for anchor in &anchors {
                println!(
                    "  {:<18} {:<6} size={} @ {} since {}",
                    anchor.inst_id,
                    anchor.pos_side,
                    anchor.anchor_size,
                    anchor.anchor_price,
                    anchor.opened_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        Commands::Config => {
            println!("\n=== Reconciliation ===");
            println!("  Tolerance:            {}U", config.tolerance);
            println!("  Max Retries:          {}", config.max_retries);
            println!("  Settle Delay:         {}s", config.settle_delay_secs);
            println!("  Margin Mode:          {}", config.margin_mode);

            println!("\n=== Take-Profit ===");
            println!("  Profit Threshold:     {}%", config.profit_threshold);
            println!("  Close Ratio:          {}", config.close_ratio);
            println!("  Hedge Loss Threshold: {}%", config.hedge_loss_threshold);
            println!("  Rule Priority:        {:?}", config.rule_priority);
            println!("  Cooldown:             {}s", config.take_profit_cooldown_secs);

            println!("\n=== Auto-Opener ===");
            println!("  Stake:                {}U", config.auto_open_stake);
            println!("  Leverage:             {}x", config.leverage);

            println!("\n=== Loops ===");
            println!("  Reconcile Interval:   {}s", config.reconcile_interval_secs);
            println!("  Take-Profit Interval: {}s", config.take_profit_interval_secs);
            println!("  Auto-Open Interval:   {}s", config.auto_open_interval_secs);
            println!("  Extremes Interval:    {}s", config.extremes_interval_secs);
            println!("  Snapshot TTL:         {}ms", config.snapshot_ttl_ms);

            println!("\n=== Accounts ===");
            println!("  Primary:              {}", config.primary_account);
            println!("  Sub:                  {}", config.sub_account);
            println!("  Exchange UTC Offset:  {:+}h", config.exchange_utc_offset_hours);
            println!("  Snapshot URL:         {}", config.snapshot_base_url);
            println!("  Gateway URL:          {}", config.gateway_base_url);
        }
    }

    Ok(())
}
