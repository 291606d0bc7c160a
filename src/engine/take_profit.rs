//! Take-profit rule engine for sub-account positions.
//!
//! Two independent partial-close rules run every cycle:
//! - `absolute`: the position's own profit rate is strictly above the
//!   threshold.
//! - `hedge`: the primary account's opposite-side position on the same
//!   instrument is strictly losing.
//!
//! Rules are evaluated in an explicit, configurable priority order. Both
//! may fire on one position in the same cycle; the first consumes size
//! and the second acts on the remainder.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::{ExchangeGateway, OrderRequest};
use crate::db::Database;
use crate::margin::Clock;
use crate::models::{Position, PositionKey};

use super::config::KeeperConfig;

/// Which rule triggered a partial close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TakeProfitRule {
    Absolute,
    Hedge,
}

impl TakeProfitRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            TakeProfitRule::Absolute => "absolute",
            TakeProfitRule::Hedge => "hedge",
        }
    }
}

/// One executed partial close.
#[derive(Debug, Clone)]
pub struct TakeProfitEvent {
    pub account: String,
    pub key: PositionKey,
    pub rule: TakeProfitRule,
    pub profit_rate: Decimal,
    pub close_size: Decimal,
    pub remaining_size: Decimal,
    pub reason: String,
}

/// The rule engine. Gateway and clock are injected so tests run without
/// network or sleeps.
pub struct TakeProfitEngine {
    gateway: Arc<dyn ExchangeGateway>,
    clock: Arc<dyn Clock>,
    db: Arc<Database>,
    config: Arc<KeeperConfig>,
}

impl TakeProfitEngine {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        clock: Arc<dyn Clock>,
        db: Arc<Database>,
        config: Arc<KeeperConfig>,
    ) -> Self {
        Self {
            gateway,
            clock,
            db,
            config,
        }
    }

    /// Evaluate both rules for every sub-account position. One key's
    /// failure never aborts the cycle for the others.
    pub async fn evaluate_cycle(
        &self,
        sub_positions: &[Position],
        primary_positions: &[Position],
    ) -> Vec<TakeProfitEvent> {
        let mut events = Vec::new();

        for position in sub_positions.iter().filter(|p| p.is_open()) {
            let fired = self
                .evaluate_position(position, primary_positions, &mut events)
                .await;

            // A short cooldown between positions after a successful
            // close lets fills settle before the next evaluation.
            if fired {
                self.clock.sleep(self.config.take_profit_cooldown()).await;
            }
        }

        events
    }

    async fn evaluate_position(
        &self,
        position: &Position,
        primary_positions: &[Position],
        events: &mut Vec<TakeProfitEvent>,
    ) -> bool {
        let key = position.key();
        let mut remaining = position.pos_size;
        let mut fired = false;

        for rule in &self.config.rule_priority {
            if remaining <= Decimal::ZERO {
                break;
            }

            let reason = match rule {
                TakeProfitRule::Absolute => {
                    // Strict: exactly at the threshold does not fire.
                    if position.profit_rate > self.config.profit_threshold {
                        format!(
                            "profit rate {}% above threshold {}%",
                            position.profit_rate, self.config.profit_threshold
                        )
                    } else {
                        debug!(
                            key = %key,
                            profit_rate = %position.profit_rate,
                            "Absolute rule below threshold"
                        );
                        continue;
                    }
                }
                TakeProfitRule::Hedge => {
                    let opposite = primary_positions.iter().find(|p| {
                        p.inst_id == key.inst_id && p.pos_side == key.pos_side.opposite()
                    });

                    // No opposite-side primary position: rule not
                    // applicable, not an error.
                    let Some(opposite) = opposite else {
                        debug!(key = %key, "No opposite-side primary position");
                        continue;
                    };

                    if opposite.profit_rate < self.config.hedge_loss_threshold {
                        format!(
                            "primary {} {} losing {}%",
                            opposite.inst_id,
                            opposite.pos_side,
                            opposite.profit_rate
                        )
                    } else {
                        continue;
                    }
                }
            };

            match self
                .fire(position, &key, *rule, remaining, &reason)
                .await
            {
                Some(event) => {
                    remaining = event.remaining_size;
                    fired = true;
                    events.push(event);
                }
                None => continue,
            }
        }

        fired
    }

    /// Close a fraction of the remaining size under one rule. Returns
    /// `None` when nothing was closed.
    async fn fire(
        &self,
        position: &Position,
        key: &PositionKey,
        rule: TakeProfitRule,
        remaining: Decimal,
        reason: &str,
    ) -> Option<TakeProfitEvent> {
        let close_size = (remaining * self.config.close_ratio).floor();

        if close_size <= Decimal::ZERO {
            warn!(key = %key, remaining = %remaining, "Position too small to take profit");
            return None;
        }

        info!(
            key = %key,
            rule = rule.as_str(),
            profit_rate = %position.profit_rate,
            close_size = %close_size,
            remaining = %remaining,
            reason = %reason,
            "Take-profit triggered"
        );

        let request = OrderRequest::close(
            &position.account,
            key,
            close_size,
            &self.config.margin_mode,
        );

        let ack = match self.gateway.place_order(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(key = %key, rule = rule.as_str(), error = %e, "Take-profit order failed");
                return None;
            }
        };

        if !ack.success {
            warn!(
                key = %key,
                rule = rule.as_str(),
                message = ?ack.message,
                "Take-profit order rejected"
            );
            return None;
        }

        if let Err(e) = self
            .db
            .record_take_profit(
                &position.account,
                &key.inst_id,
                key.pos_side.as_str(),
                position.profit_rate,
                close_size,
                rule.as_str(),
                reason,
            )
            .await
        {
            warn!(key = %key, error = %e, "Failed to persist take-profit record");
        }

        Some(TakeProfitEvent {
            account: position.account.clone(),
            key: key.clone(),
            rule,
            profit_rate: position.profit_rate,
            close_size,
            remaining_size: remaining - close_size,
            reason: reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::OrderAck;
    use crate::errors::KeeperError;
    use crate::models::PosSide;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct MockGateway {
        requests: StdMutex<Vec<OrderRequest>>,
    }

    #[async_trait]
    impl ExchangeGateway for MockGateway {
        async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, KeeperError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(OrderAck {
                success: true,
                order_id: Some("oid".to_string()),
                message: None,
            })
        }
    }

    struct NoopClock {
        slept: StdMutex<usize>,
    }

    #[async_trait]
    impl Clock for NoopClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }

        async fn sleep(&self, _duration: Duration) {
            *self.slept.lock().unwrap() += 1;
        }
    }

    fn position(
        account: &str,
        inst: &str,
        side: PosSide,
        size: Decimal,
        profit_rate: Decimal,
    ) -> Position {
        Position {
            account: account.to_string(),
            inst_id: inst.to_string(),
            pos_side: side,
            pos_size: size,
            avg_price: dec!(1),
            mark_price: dec!(1),
            leverage: dec!(10),
            margin: dec!(10),
            profit_rate,
            fetched_at: Utc::now(),
        }
    }

    async fn engine(
        config: KeeperConfig,
    ) -> (TakeProfitEngine, Arc<MockGateway>, Arc<NoopClock>) {
        let gateway = Arc::new(MockGateway {
            requests: StdMutex::new(Vec::new()),
        });
        let clock = Arc::new(NoopClock {
            slept: StdMutex::new(0),
        });
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());

        let engine = TakeProfitEngine::new(
            gateway.clone(),
            clock.clone(),
            db,
            Arc::new(config),
        );

        (engine, gateway, clock)
    }

    #[tokio::test]
    async fn test_absolute_rule_boundary() {
        let (engine, gateway, _clock) = engine(KeeperConfig::default()).await;

        // Exactly at the threshold: no firing.
        let at = vec![position("sub1", "UNI-USDT-SWAP", PosSide::Long, dec!(100), dec!(30))];
        let events = engine.evaluate_cycle(&at, &[]).await;
        assert!(events.is_empty());
        assert_eq!(gateway.requests.lock().unwrap().len(), 0);

        // Just above: fires and closes half.
        let above = vec![position("sub1", "UNI-USDT-SWAP", PosSide::Long, dec!(100), dec!(30.01))];
        let events = engine.evaluate_cycle(&above, &[]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].rule, TakeProfitRule::Absolute);
        assert_eq!(events[0].close_size, dec!(50));
        assert!(events[0].close_size <= dec!(100));
    }

    #[tokio::test]
    async fn test_hedge_rule_boundary() {
        let (engine, _gateway, _clock) = engine(KeeperConfig::default()).await;
        let sub = vec![position("sub1", "BCH-USDT-SWAP", PosSide::Long, dec!(100), dec!(5))];

        // Opposite side exactly break-even: no firing.
        let primary_flat =
            vec![position("primary", "BCH-USDT-SWAP", PosSide::Short, dec!(50), dec!(0))];
        assert!(engine.evaluate_cycle(&sub, &primary_flat).await.is_empty());

        // Opposite side just losing: fires.
        let primary_losing =
            vec![position("primary", "BCH-USDT-SWAP", PosSide::Short, dec!(50), dec!(-0.01))];
        let events = engine.evaluate_cycle(&sub, &primary_losing).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].rule, TakeProfitRule::Hedge);
        assert_eq!(events[0].close_size, dec!(50));
    }

    #[tokio::test]
    async fn test_no_opposite_primary_is_not_an_error() {
        let (engine, _gateway, _clock) = engine(KeeperConfig::default()).await;
        let sub = vec![position("sub1", "FIL-USDT-SWAP", PosSide::Long, dec!(100), dec!(5))];

        // Same-side primary only: the hedge rule is simply inapplicable.
        let primary =
            vec![position("primary", "FIL-USDT-SWAP", PosSide::Long, dec!(50), dec!(-8))];
        assert!(engine.evaluate_cycle(&sub, &primary).await.is_empty());
    }

    #[tokio::test]
    async fn test_both_rules_fire_on_remainder() {
        let (engine, gateway, clock) = engine(KeeperConfig::default()).await;

        let sub = vec![position("sub1", "LDO-USDT-SWAP", PosSide::Long, dec!(100), dec!(35))];
        let primary =
            vec![position("primary", "LDO-USDT-SWAP", PosSide::Short, dec!(50), dec!(-2))];

        let events = engine.evaluate_cycle(&sub, &primary).await;

        // Absolute consumes 50 of 100, hedge acts on the remaining 50.
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].rule, TakeProfitRule::Absolute);
        assert_eq!(events[0].close_size, dec!(50));
        assert_eq!(events[1].rule, TakeProfitRule::Hedge);
        assert_eq!(events[1].close_size, dec!(25));
        assert_eq!(events[1].remaining_size, dec!(25));

        let requests = gateway.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.reduce_only));

        // One cooldown for the position, after its firings.
        assert_eq!(*clock.slept.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rule_priority_is_configurable() {
        let config = KeeperConfig {
            rule_priority: vec![TakeProfitRule::Hedge, TakeProfitRule::Absolute],
            ..KeeperConfig::default()
        };
        let (engine, _gateway, _clock) = engine(config).await;

        let sub = vec![position("sub1", "LDO-USDT-SWAP", PosSide::Long, dec!(100), dec!(35))];
        let primary =
            vec![position("primary", "LDO-USDT-SWAP", PosSide::Short, dec!(50), dec!(-2))];

        let events = engine.evaluate_cycle(&sub, &primary).await;
        assert_eq!(events[0].rule, TakeProfitRule::Hedge);
        assert_eq!(events[1].rule, TakeProfitRule::Absolute);
    }

    #[tokio::test]
    async fn test_dust_position_does_not_fire() {
        let (engine, gateway, _clock) = engine(KeeperConfig::default()).await;

        // Half of one contract floors to zero; nothing to close.
        let sub = vec![position("sub1", "UNI-USDT-SWAP", PosSide::Long, dec!(1), dec!(40))];
        let events = engine.evaluate_cycle(&sub, &[]).await;

        assert!(events.is_empty());
        assert_eq!(gateway.requests.lock().unwrap().len(), 0);
    }
}
