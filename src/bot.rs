//! Keeper runner: one independent polling loop per responsibility.
//!
//! Reconciliation, take-profit, auto-opening, and extremes tracking each
//! tick on their own interval and read through the shared short-TTL
//! snapshot cache. Loops never hold cross-loop locks; an error in one
//! key's handling never stops the cycle for the others, and a process
//! restart simply re-derives everything from the database and a fresh
//! snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::{
    DryRunGateway, ExchangeGateway, GatewayClient, PositionProvider, SnapshotCache,
    SnapshotClient,
};
use crate::db::Database;
use crate::engine::{AutoOpener, ExtremesTracker, KeeperConfig, TakeProfitEngine};
use crate::errors::KeeperError;
use crate::margin::{classify, target_margin, CorrectionOutcome, Corrector, TokioClock};
use crate::server::{ApiServer, OpsState};

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Database URL
    pub database_url: String,

    /// Whether to log orders instead of dispatching them
    pub dry_run: bool,

    /// Ops API bind address; `None` disables the API
    pub api_addr: Option<String>,

    /// Keeper policy configuration
    pub keeper: KeeperConfig,
}

/// Main keeper runner.
pub struct KeeperBot {
    config: Arc<KeeperConfig>,
    db: Arc<Database>,
    provider: Arc<dyn PositionProvider>,
    gateway: Arc<dyn ExchangeGateway>,
    corrector: Arc<Corrector>,
    take_profit: Arc<TakeProfitEngine>,
    auto_opener: Arc<AutoOpener>,
    extremes: Arc<ExtremesTracker>,
    api_addr: Option<String>,
    shutdown: Arc<AtomicBool>,
}

impl KeeperBot {
    /// Create a new keeper instance.
    pub async fn new(bot_config: BotConfig) -> Result<Self> {
        let config = Arc::new(bot_config.keeper);
        let db = Arc::new(
            Database::new(&bot_config.database_url)
                .await
                .context("Failed to open database")?,
        );

        let snapshot_client = SnapshotClient::new(config.snapshot_base_url.clone())?;
        let provider: Arc<dyn PositionProvider> = Arc::new(SnapshotCache::new(
            Arc::new(snapshot_client),
            config.snapshot_ttl(),
        ));

        let gateway: Arc<dyn ExchangeGateway> = if bot_config.dry_run {
            info!("Dry-run mode: orders will be logged, not dispatched");
            Arc::new(DryRunGateway)
        } else {
            Arc::new(GatewayClient::new(config.gateway_base_url.clone())?)
        };

        let clock = Arc::new(TokioClock);

        let corrector = Arc::new(Corrector::new(
            provider.clone(),
            gateway.clone(),
            clock.clone(),
            db.clone(),
            config.corrector_config(),
        ));

        let take_profit = Arc::new(TakeProfitEngine::new(
            gateway.clone(),
            clock,
            db.clone(),
            config.clone(),
        ));

        let auto_opener = Arc::new(AutoOpener::new(
            gateway.clone(),
            db.clone(),
            config.clone(),
        ));

        let extremes = Arc::new(ExtremesTracker::new(db.clone()));

        Ok(Self {
            config,
            db,
            provider,
            gateway,
            corrector,
            take_profit,
            auto_opener,
            extremes,
            api_addr: bot_config.api_addr,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Log what the keeper is resuming from.
    pub async fn initialize(&self) -> Result<()> {
        let date = self.config.exchange_today(Utc::now());
        let maintenance = self.db.maintenance_records_for(date).await?;
        let anchors = self.db.active_anchors().await?;

        info!(
            date = %date,
            maintained_today = maintenance.len(),
            active_anchors = anchors.len(),
            primary = %self.config.primary_account,
            sub = %self.config.sub_account,
            "Keeper initialized"
        );

        Ok(())
    }

    /// Run all loops until ctrl-c.
    pub async fn run(&self) -> Result<()> {
        info!(
            reconcile_interval = self.config.reconcile_interval_secs,
            take_profit_interval = self.config.take_profit_interval_secs,
            auto_open_interval = self.config.auto_open_interval_secs,
            extremes_interval = self.config.extremes_interval_secs,
            "Starting keeper loops"
        );

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let server_handle = match &self.api_addr {
            Some(addr) => {
                let server = ApiServer::new(Arc::new(OpsState {
                    db: self.db.clone(),
                    gateway: self.gateway.clone(),
                    corrector: self.corrector.clone(),
                    config: self.config.clone(),
                }));
                let addr = addr.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = server.serve(&addr).await {
                        error!(error = %e, "Ops API server error");
                    }
                }))
            }
            None => None,
        };

        let loops = vec![
            tokio::spawn(Self::reconcile_loop(
                self.provider.clone(),
                self.corrector.clone(),
                self.db.clone(),
                self.config.clone(),
                self.shutdown.clone(),
            )),
            tokio::spawn(Self::take_profit_loop(
                self.provider.clone(),
                self.take_profit.clone(),
                self.config.clone(),
                self.shutdown.clone(),
            )),
            tokio::spawn(Self::auto_open_loop(
                self.provider.clone(),
                self.auto_opener.clone(),
                self.config.clone(),
                self.shutdown.clone(),
            )),
            tokio::spawn(Self::extremes_loop(
                self.provider.clone(),
                self.extremes.clone(),
                self.config.clone(),
                self.shutdown.clone(),
            )),
        ];

        futures::future::join_all(loops).await;

        if let Some(handle) = server_handle {
            handle.abort();
        }

        info!("Keeper shutdown complete");
        Ok(())
    }

    // ==================== Reconciliation ====================

    async fn reconcile_loop(
        provider: Arc<dyn PositionProvider>,
        corrector: Arc<Corrector>,
        db: Arc<Database>,
        config: Arc<KeeperConfig>,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut ticker = interval(Duration::from_secs(config.reconcile_interval_secs));

        while !shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;

            if let Err(e) = Self::reconcile_tick(&provider, &corrector, &db, &config).await {
                error!(error = %e, "Reconcile tick failed");
            }
        }
    }

    /// One pass over the sub-account: classify every position against
    /// its tier target and drive deviants through the corrector.
    async fn reconcile_tick(
        provider: &Arc<dyn PositionProvider>,
        corrector: &Arc<Corrector>,
        db: &Arc<Database>,
        config: &Arc<KeeperConfig>,
    ) -> Result<(), KeeperError> {
        let positions = provider.positions(&config.sub_account).await?;
        let date = config.exchange_today(Utc::now());

        debug!(count = positions.len(), "Reconcile tick");

        for position in positions.iter().filter(|p| p.is_open()) {
            let key = position.key();

            let count = match db
                .maintenance_count(
                    &config.sub_account,
                    &key.inst_id,
                    key.pos_side.as_str(),
                    date,
                )
                .await
            {
                Ok(count) => count,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to read maintenance count");
                    continue;
                }
            };

            let target = target_margin(count);
            let live = position.theoretical_margin();
            let deviation = classify(live, target, config.tolerance);

            if deviation.is_within() {
                continue;
            }

            info!(
                key = %key,
                maintenance_count = count,
                live_margin = %live,
                target_margin = %target,
                deviation = %deviation.delta,
                "Margin deviation detected"
            );

            match corrector.reconcile(&config.sub_account, &key, target).await {
                Ok(CorrectionOutcome::Converged { attempts, .. }) if attempts > 0 => {
                    // Count the correction only once it verifiably stuck.
                    match db
                        .increment_maintenance_count(
                            &config.sub_account,
                            &key.inst_id,
                            key.pos_side.as_str(),
                            date,
                        )
                        .await
                    {
                        Ok(new_count) => {
                            info!(key = %key, maintenance_count = new_count, "Correction counted")
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "Failed to bump maintenance count")
                        }
                    }
                }
                Ok(_) => {}
                Err(e) if e.is_retriable_next_cycle() => {
                    // Contained: the next key proceeds regardless, and
                    // the next tick retries this one naturally.
                    warn!(key = %key, error = %e, "Correction run skipped this cycle");
                }
                Err(e) => {
                    error!(key = %key, error = %e, "Correction run failed");
                }
            }
        }

        Ok(())
    }

    // ==================== Take-Profit ====================

    async fn take_profit_loop(
        provider: Arc<dyn PositionProvider>,
        engine: Arc<TakeProfitEngine>,
        config: Arc<KeeperConfig>,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut ticker = interval(Duration::from_secs(config.take_profit_interval_secs));

        while !shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;

            let sub = match provider.positions(&config.sub_account).await {
                Ok(positions) => positions,
                Err(e) => {
                    error!(error = %e, "Take-profit tick: sub-account snapshot failed");
                    continue;
                }
            };
            if sub.is_empty() {
                continue;
            }

            let primary = match provider.positions(&config.primary_account).await {
                Ok(positions) => positions,
                Err(e) => {
                    error!(error = %e, "Take-profit tick: primary snapshot failed");
                    continue;
                }
            };

            let events = engine.evaluate_cycle(&sub, &primary).await;
            if !events.is_empty() {
                info!(fired = events.len(), "Take-profit cycle complete");
            }
        }
    }

    // ==================== Auto-Opener ====================

    async fn auto_open_loop(
        provider: Arc<dyn PositionProvider>,
        opener: Arc<AutoOpener>,
        config: Arc<KeeperConfig>,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut ticker = interval(Duration::from_secs(config.auto_open_interval_secs));

        while !shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;

            let primary = match provider.positions(&config.primary_account).await {
                Ok(positions) => positions,
                Err(e) => {
                    error!(error = %e, "Auto-open tick: primary snapshot failed");
                    continue;
                }
            };

            let losing = primary.iter().filter(|p| p.is_losing()).count();
            if losing == 0 {
                continue;
            }

            let sub = match provider.positions(&config.sub_account).await {
                Ok(positions) => positions,
                Err(e) => {
                    error!(error = %e, "Auto-open tick: sub-account snapshot failed");
                    continue;
                }
            };

            let events = opener.run_cycle(&primary, &sub).await;
            if !events.is_empty() {
                info!(opened = events.len(), "Auto-open cycle complete");
            }
        }
    }

    // ==================== Extremes ====================

    async fn extremes_loop(
        provider: Arc<dyn PositionProvider>,
        tracker: Arc<ExtremesTracker>,
        config: Arc<KeeperConfig>,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut ticker = interval(Duration::from_secs(config.extremes_interval_secs));

        while !shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;

            let positions = match provider.positions(&config.sub_account).await {
                Ok(positions) => positions,
                Err(e) => {
                    error!(error = %e, "Extremes tick: snapshot failed");
                    continue;
                }
            };

            let tracked = tracker.run_cycle(&positions).await;
            debug!(tracked, "Extremes cycle complete");
        }
    }
}
