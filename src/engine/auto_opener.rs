//! Anchor auto-opener: mirror losing primary positions into the
//! sub-account at a fixed stake.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::api::{ExchangeGateway, OrderRequest};
use crate::db::Database;
use crate::models::{AnchorPosition, AnchorStatus, Position, PositionKey};

use super::config::KeeperConfig;

/// One anchor opened this cycle.
#[derive(Debug, Clone)]
pub struct OpenEvent {
    pub key: PositionKey,
    pub order_size: Decimal,
    pub mark_price: Decimal,
    pub primary_profit_rate: Decimal,
}

/// Opens fixed-stake mirrors of losing primary positions. There is no
/// nested retry: a failed open is logged and picked up again on the
/// next cycle.
pub struct AutoOpener {
    gateway: Arc<dyn ExchangeGateway>,
    db: Arc<Database>,
    config: Arc<KeeperConfig>,
}

impl AutoOpener {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        db: Arc<Database>,
        config: Arc<KeeperConfig>,
    ) -> Self {
        Self {
            gateway,
            db,
            config,
        }
    }

    /// Mirror every losing primary (instrument, side) the sub-account is
    /// missing.
    pub async fn run_cycle(
        &self,
        primary_positions: &[Position],
        sub_positions: &[Position],
    ) -> Vec<OpenEvent> {
        let existing: HashSet<PositionKey> =
            sub_positions.iter().map(Position::key).collect();

        let mut events = Vec::new();

        for position in primary_positions
            .iter()
            .filter(|p| p.is_open() && p.is_losing())
        {
            let key = position.key();

            if existing.contains(&key) {
                debug!(key = %key, "Sub-account already holds this anchor");
                continue;
            }

            match self.open_anchor(&key, position).await {
                Some(event) => events.push(event),
                None => continue,
            }
        }

        events
    }

    async fn open_anchor(&self, key: &PositionKey, primary: &Position) -> Option<OpenEvent> {
        if primary.mark_price <= Decimal::ZERO {
            warn!(key = %key, "No usable mark price; skipping open");
            return None;
        }

        let order_size = (self.config.auto_open_stake * self.config.leverage
            / primary.mark_price)
            .floor()
            .max(Decimal::ONE);

        info!(
            key = %key,
            primary_profit_rate = %primary.profit_rate,
            mark_price = %primary.mark_price,
            stake = %self.config.auto_open_stake,
            order_size = %order_size,
            "Opening anchor mirror"
        );

        let request = OrderRequest::open(
            &self.config.sub_account,
            key,
            order_size,
            &self.config.margin_mode,
        );

        let ack = match self.gateway.place_order(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(key = %key, error = %e, "Anchor open failed; retrying next cycle");
                return None;
            }
        };

        if !ack.success {
            warn!(
                key = %key,
                message = ?ack.message,
                "Anchor open rejected; retrying next cycle"
            );
            return None;
        }

        self.record_anchor(key, order_size, primary.mark_price).await;

        Some(OpenEvent {
            key: key.clone(),
            order_size,
            mark_price: primary.mark_price,
            primary_profit_rate: primary.profit_rate,
        })
    }

    /// Persist the new holding period. A stale active row from a mirror
    /// that was fully closed outside this process is retired first so
    /// the fresh period gets its own row.
    async fn record_anchor(&self, key: &PositionKey, size: Decimal, price: Decimal) {
        let inst_id = key.inst_id.as_str();
        let pos_side = key.pos_side.as_str();

        match self.db.active_anchor(inst_id, pos_side).await {
            Ok(Some(_)) => {
                if let Err(e) = self.db.close_anchor(inst_id, pos_side).await {
                    warn!(key = %key, error = %e, "Failed to retire stale anchor row");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to check for stale anchor row");
            }
        }

        let anchor = AnchorPosition {
            inst_id: inst_id.to_string(),
            pos_side: pos_side.to_string(),
            anchor_size: size,
            anchor_price: price,
            status: AnchorStatus::Active,
            opened_at: Utc::now(),
            closed_at: None,
        };

        if let Err(e) = self.db.save_anchor(&anchor).await {
            warn!(key = %key, error = %e, "Failed to persist anchor row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::OrderAck;
    use crate::errors::KeeperError;
    use crate::models::PosSide;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;

    struct MockGateway {
        requests: StdMutex<Vec<OrderRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl ExchangeGateway for MockGateway {
        async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, KeeperError> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(KeeperError::Transport("gateway down".to_string()));
            }
            Ok(OrderAck {
                success: true,
                order_id: Some("oid".to_string()),
                message: None,
            })
        }
    }

    fn position(
        account: &str,
        inst: &str,
        side: PosSide,
        mark: Decimal,
        profit_rate: Decimal,
    ) -> Position {
        Position {
            account: account.to_string(),
            inst_id: inst.to_string(),
            pos_side: side,
            pos_size: dec!(100),
            avg_price: mark,
            mark_price: mark,
            leverage: dec!(10),
            margin: dec!(10),
            profit_rate,
            fetched_at: Utc::now(),
        }
    }

    async fn opener(fail: bool) -> (AutoOpener, Arc<MockGateway>, Arc<Database>) {
        let gateway = Arc::new(MockGateway {
            requests: StdMutex::new(Vec::new()),
            fail,
        });
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let opener = AutoOpener::new(
            gateway.clone(),
            db.clone(),
            Arc::new(KeeperConfig::default()),
        );

        (opener, gateway, db)
    }

    #[tokio::test]
    async fn test_order_size_floors_with_minimum_one() {
        let (opener, gateway, db) = opener(false).await;

        // stake 10 x lever 10 / mark 50000 floors to 0; minimum is 1.
        let primary = vec![position(
            "primary",
            "BTC-USDT-SWAP",
            PosSide::Short,
            dec!(50000),
            dec!(-3),
        )];

        let events = opener.run_cycle(&primary, &[]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].order_size, dec!(1));

        let requests = gateway.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].account, "sub1");
        assert!(!requests[0].reduce_only);

        let anchor = db.active_anchor("BTC-USDT-SWAP", "short").await.unwrap();
        assert!(anchor.is_some());
    }

    #[tokio::test]
    async fn test_order_size_from_stake_and_leverage() {
        let (opener, _gateway, _db) = opener(false).await;

        // stake 10 x lever 10 / mark 0.25 = 400 contracts.
        let primary = vec![position(
            "primary",
            "CFX-USDT-SWAP",
            PosSide::Long,
            dec!(0.25),
            dec!(-1.5),
        )];

        let events = opener.run_cycle(&primary, &[]).await;
        assert_eq!(events[0].order_size, dec!(400));
    }

    #[tokio::test]
    async fn test_skips_existing_and_winning_positions() {
        let (opener, gateway, _db) = opener(false).await;

        let primary = vec![
            // Losing but already mirrored.
            position("primary", "UNI-USDT-SWAP", PosSide::Long, dec!(6), dec!(-4)),
            // Winning: no mirror wanted.
            position("primary", "FIL-USDT-SWAP", PosSide::Long, dec!(4), dec!(2)),
        ];
        let sub = vec![position("sub1", "UNI-USDT-SWAP", PosSide::Long, dec!(6), dec!(-1))];

        let events = opener.run_cycle(&primary, &sub).await;
        assert!(events.is_empty());
        assert_eq!(gateway.requests.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_same_instrument_other_side_still_opens() {
        let (opener, _gateway, _db) = opener(false).await;

        // The sub-account holds the long; the losing primary short has
        // no mirror yet.
        let primary = vec![position(
            "primary",
            "UNI-USDT-SWAP",
            PosSide::Short,
            dec!(6),
            dec!(-4),
        )];
        let sub = vec![position("sub1", "UNI-USDT-SWAP", PosSide::Long, dec!(6), dec!(1))];

        let events = opener.run_cycle(&primary, &sub).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key.pos_side, PosSide::Short);
    }

    #[tokio::test]
    async fn test_failure_leaves_no_anchor_row() {
        let (opener, gateway, db) = opener(true).await;

        let primary = vec![position(
            "primary",
            "LDO-USDT-SWAP",
            PosSide::Long,
            dec!(2),
            dec!(-9),
        )];

        let events = opener.run_cycle(&primary, &[]).await;
        assert!(events.is_empty());
        // The order was attempted once; the next cycle retries naturally.
        assert_eq!(gateway.requests.lock().unwrap().len(), 1);
        assert!(db
            .active_anchor("LDO-USDT-SWAP", "long")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_reopen_retires_stale_anchor_row() {
        let (opener, _gateway, db) = opener(false).await;

        let primary = vec![position(
            "primary",
            "BCH-USDT-SWAP",
            PosSide::Long,
            dec!(250),
            dec!(-2),
        )];

        // First holding period.
        opener.run_cycle(&primary, &[]).await;
        let first = db
            .active_anchor("BCH-USDT-SWAP", "long")
            .await
            .unwrap()
            .unwrap();

        // The mirror was closed externally; the next cycle reopens and
        // must start a fresh row rather than mutate the old one.
        opener.run_cycle(&primary, &[]).await;
        let second = db
            .active_anchor("BCH-USDT-SWAP", "long")
            .await
            .unwrap()
            .unwrap();

        assert!(second.opened_at >= first.opened_at);
    }
}
