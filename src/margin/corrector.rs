//! Correction executor and convergence verifier.
//!
//! Drives one position's live margin to its target through an explicit
//! state machine:
//!
//! ```text
//! PENDING -> EXECUTING -> VERIFYING -> { CONVERGED | RETRY | FAILED }
//! ```
//!
//! Every attempt recomputes its sizing from a fresh snapshot, never from
//! a stale one. Runs are serialized per (instrument, side); different
//! keys proceed independently. The clock, gateway, and snapshot provider
//! are injected so tests run deterministic and sleep-free.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{ExchangeGateway, OrderRequest, PositionProvider};
use crate::db::Database;
use crate::errors::KeeperError;
use crate::models::{Position, PositionKey};

use super::deviation::classify;
use super::sizing::{size_correction, CorrectionAction};

/// Time source seam.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by tokio.
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// States of a correction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionState {
    Pending,
    Executing,
    Verifying,
    Converged,
    Retry,
    Failed,
}

/// Terminal result of one correction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectionOutcome {
    /// Deviation inside tolerance. `attempts` is the number of orders
    /// dispatched; zero means the position was already on target.
    Converged {
        attempts: u32,
        final_margin: Decimal,
    },
    /// The position vanished from the snapshot; nothing to correct.
    AlreadyClosed,
    /// The run did not start or could not act this cycle; retried
    /// naturally on the next tick.
    Skipped { reason: String },
    /// All retries spent without converging. Operator attention needed.
    Exhausted {
        attempts: u32,
        final_deviation: Decimal,
    },
    /// Order dispatch failed (transport or gateway rejection).
    Failed { reason: String },
}

/// Tunables for the state machine.
#[derive(Debug, Clone)]
pub struct CorrectorConfig {
    pub tolerance: Decimal,
    pub max_retries: u32,
    pub settle_delay: Duration,
    pub margin_mode: String,
}

/// The retrying correction engine.
pub struct Corrector {
    provider: Arc<dyn PositionProvider>,
    gateway: Arc<dyn ExchangeGateway>,
    clock: Arc<dyn Clock>,
    db: Arc<Database>,
    config: CorrectorConfig,
    active: Mutex<HashSet<(String, PositionKey)>>,
}

impl Corrector {
    pub fn new(
        provider: Arc<dyn PositionProvider>,
        gateway: Arc<dyn ExchangeGateway>,
        clock: Arc<dyn Clock>,
        db: Arc<Database>,
        config: CorrectorConfig,
    ) -> Self {
        Self {
            provider,
            gateway,
            clock,
            db,
            config,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Drive one position toward `target` margin.
    ///
    /// Returns `Skipped` if a run for the same key is already in flight;
    /// a new run may not start until the previous one reaches a terminal
    /// state.
    pub async fn reconcile(
        &self,
        account: &str,
        key: &PositionKey,
        target: Decimal,
    ) -> Result<CorrectionOutcome, KeeperError> {
        {
            let mut active = self.active.lock().await;
            if !active.insert((account.to_string(), key.clone())) {
                debug!(key = %key, "Correction run already in flight");
                return Ok(CorrectionOutcome::Skipped {
                    reason: "run already in flight".to_string(),
                });
            }
        }

        let result = self.drive(account, key, target).await;

        self.active
            .lock()
            .await
            .remove(&(account.to_string(), key.clone()));

        result
    }

    async fn drive(
        &self,
        account: &str,
        key: &PositionKey,
        target: Decimal,
    ) -> Result<CorrectionOutcome, KeeperError> {
        let mut attempt: u32 = 0;
        let mut state = CorrectionState::Pending;
        let mut action = CorrectionAction::Close {
            size: Decimal::ZERO,
        };
        let mut last_deviation = Decimal::ZERO;

        loop {
            match state {
                CorrectionState::Pending => {
                    // Sizing always starts from the latest snapshot.
                    let Some(position) = self.fresh_position(account, key).await? else {
                        info!(key = %key, "Position absent from snapshot; treating as closed");
                        return Ok(CorrectionOutcome::AlreadyClosed);
                    };

                    let live = position.theoretical_margin();
                    let deviation = classify(live, target, self.config.tolerance);

                    if deviation.is_within() {
                        return Ok(CorrectionOutcome::Converged {
                            attempts: attempt,
                            final_margin: live,
                        });
                    }

                    action = size_correction(&position, &deviation)?;
                    attempt += 1;
                    last_deviation = deviation.delta;

                    if action.size().is_zero() {
                        // Deviation exceeds tolerance but rounds to zero
                        // contracts; nothing this run can do.
                        self.record_attempt(
                            account,
                            key,
                            target,
                            attempt,
                            deviation.delta,
                            &action,
                            "unsizable",
                            None,
                        )
                        .await?;

                        return Ok(CorrectionOutcome::Skipped {
                            reason: format!(
                                "deviation {}U sizes to zero contracts",
                                deviation.delta
                            ),
                        });
                    }

                    info!(
                        key = %key,
                        attempt,
                        live_margin = %live,
                        target_margin = %target,
                        deviation = %deviation.delta,
                        action = action.verb(),
                        size = %action.size(),
                        "Dispatching correction"
                    );

                    state = CorrectionState::Executing;
                }

                CorrectionState::Executing => {
                    let request = match action {
                        CorrectionAction::Close { size } => OrderRequest::close(
                            account,
                            key,
                            size,
                            &self.config.margin_mode,
                        ),
                        CorrectionAction::Open { size } => OrderRequest::open(
                            account,
                            key,
                            size,
                            &self.config.margin_mode,
                        ),
                    };

                    match self.gateway.place_order(&request).await {
                        Ok(ack) if ack.success => {
                            state = CorrectionState::Verifying;
                        }
                        Ok(ack) => {
                            let message = ack.message.unwrap_or_default();
                            warn!(key = %key, attempt, message = %message, "Correction order rejected");

                            self.record_attempt(
                                account,
                                key,
                                target,
                                attempt,
                                last_deviation,
                                &action,
                                "rejected",
                                Some(&message),
                            )
                            .await?;

                            return Ok(CorrectionOutcome::Failed { reason: message });
                        }
                        Err(KeeperError::Transport(message)) => {
                            // The gateway client already retried the
                            // transport; a failure here is terminal.
                            warn!(key = %key, attempt, message = %message, "Correction transport failure");

                            self.record_attempt(
                                account,
                                key,
                                target,
                                attempt,
                                last_deviation,
                                &action,
                                "transport_error",
                                Some(&message),
                            )
                            .await?;

                            return Ok(CorrectionOutcome::Failed { reason: message });
                        }
                        Err(e) => return Err(e),
                    }
                }

                CorrectionState::Verifying => {
                    // Give the first order time to settle; forced
                    // re-checks after a retry go straight through.
                    if attempt == 1 {
                        self.clock.sleep(self.config.settle_delay).await;
                    }

                    let Some(position) = self.fresh_position(account, key).await? else {
                        info!(key = %key, "Position gone after correction; treating as closed");
                        return Ok(CorrectionOutcome::AlreadyClosed);
                    };

                    let live = position.theoretical_margin();
                    let deviation = classify(live, target, self.config.tolerance);

                    if deviation.is_within() {
                        info!(
                            key = %key,
                            attempt,
                            final_margin = %live,
                            "Correction converged"
                        );

                        self.record_attempt(
                            account,
                            key,
                            target,
                            attempt,
                            deviation.delta,
                            &action,
                            "converged",
                            None,
                        )
                        .await?;

                        return Ok(CorrectionOutcome::Converged {
                            attempts: attempt,
                            final_margin: live,
                        });
                    }

                    if attempt < self.config.max_retries {
                        warn!(
                            key = %key,
                            attempt,
                            deviation = %deviation.delta,
                            "Still deviating; retrying"
                        );

                        self.record_attempt(
                            account,
                            key,
                            target,
                            attempt,
                            deviation.delta,
                            &action,
                            "retry",
                            None,
                        )
                        .await?;

                        state = CorrectionState::Pending;
                        continue;
                    }

                    // Discrepancy report: terminal, never escalates to a
                    // larger forced correction.
                    let report = KeeperError::ConvergenceExhausted {
                        key: key.to_string(),
                        attempts: attempt,
                        deviation: deviation.delta,
                    };
                    error!(
                        key = %key,
                        target_margin = %target,
                        final_margin = %live,
                        error = %report,
                        "Operator attention required"
                    );

                    self.record_attempt(
                        account,
                        key,
                        target,
                        attempt,
                        deviation.delta,
                        &action,
                        "exhausted",
                        Some(&report.to_string()),
                    )
                    .await?;

                    return Ok(CorrectionOutcome::Exhausted {
                        attempts: attempt,
                        final_deviation: deviation.delta,
                    });
                }

                // Terminal states return out of the loop above.
                CorrectionState::Converged
                | CorrectionState::Retry
                | CorrectionState::Failed => unreachable!("terminal states return directly"),
            }
        }
    }

    /// A missing position is not fatal: the exchange closed it while we
    /// were deciding, so there is nothing left to correct.
    async fn fresh_position(
        &self,
        account: &str,
        key: &PositionKey,
    ) -> Result<Option<Position>, KeeperError> {
        match self.provider.require(account, key).await {
            Ok(position) => Ok(Some(position)),
            Err(KeeperError::DataUnavailable(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_attempt(
        &self,
        account: &str,
        key: &PositionKey,
        target: Decimal,
        attempt: u32,
        deviation: Decimal,
        action: &CorrectionAction,
        result: &str,
        message: Option<&str>,
    ) -> Result<(), KeeperError> {
        self.db
            .record_correction_attempt(
                &Uuid::new_v4().to_string(),
                account,
                &key.inst_id,
                key.pos_side.as_str(),
                target,
                attempt,
                deviation,
                action.verb(),
                action.size(),
                result,
                message,
            )
            .await
    }
}
