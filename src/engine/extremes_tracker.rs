//! Extremes tracker: per-position profit-rate high/low-water marks.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::db::Database;
use crate::models::{ExtremeUpdate, Position, ProfitExtremes};

/// Maintains one `profit_extremes` row per holding period. The row key's
/// open time comes from the active anchor record, so a close-and-reopen
/// starts a new row and preserves the old period's history.
pub struct ExtremesTracker {
    db: Arc<Database>,
}

impl ExtremesTracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Fold the current profit rate of every open position into its
    /// extremes row. Returns how many positions were tracked.
    pub async fn run_cycle(&self, positions: &[Position]) -> usize {
        let mut tracked = 0;

        for position in positions.iter().filter(|p| p.is_open()) {
            if let Err(e) = self.track_position(position).await {
                warn!(
                    inst_id = %position.inst_id,
                    pos_side = %position.pos_side,
                    error = %e,
                    "Failed to track extremes"
                );
                continue;
            }
            tracked += 1;
        }

        tracked
    }

    async fn track_position(&self, position: &Position) -> Result<(), crate::errors::KeeperError> {
        let inst_id = position.inst_id.as_str();
        let pos_side = position.pos_side.as_str();
        let now = Utc::now();

        // The open time is read from the holding-period record, never
        // recomputed; without one, this observation starts the period.
        let open_time = self
            .db
            .active_anchor(inst_id, pos_side)
            .await?
            .map(|a| a.opened_at)
            .unwrap_or(now);

        let existing = self.db.get_extremes(inst_id, pos_side, open_time).await?;

        let extremes = match existing {
            Some(mut extremes) => {
                let update = extremes.observe(position.profit_rate, now);
                match update {
                    ExtremeUpdate::NewHigh => debug!(
                        inst_id,
                        pos_side,
                        rate = %position.profit_rate,
                        "New profit high"
                    ),
                    ExtremeUpdate::NewLow => debug!(
                        inst_id,
                        pos_side,
                        rate = %position.profit_rate,
                        "New loss low"
                    ),
                    ExtremeUpdate::CurrentOnly => {}
                }
                extremes
            }
            None => ProfitExtremes::open(inst_id, pos_side, open_time, position.profit_rate, now),
        };

        self.db.save_extremes(&extremes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnchorPosition, AnchorStatus, PosSide};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn position(inst: &str, side: PosSide, profit_rate: Decimal) -> Position {
        Position {
            account: "sub1".to_string(),
            inst_id: inst.to_string(),
            pos_side: side,
            pos_size: dec!(100),
            avg_price: dec!(1),
            mark_price: dec!(1),
            leverage: dec!(10),
            margin: dec!(10),
            profit_rate,
            fetched_at: Utc::now(),
        }
    }

    async fn tracker_with_anchor(inst: &str, side: &str) -> (ExtremesTracker, Arc<Database>) {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        db.save_anchor(&AnchorPosition {
            inst_id: inst.to_string(),
            pos_side: side.to_string(),
            anchor_size: dec!(100),
            anchor_price: dec!(1),
            status: AnchorStatus::Active,
            opened_at: Utc::now(),
            closed_at: None,
        })
        .await
        .unwrap();

        (ExtremesTracker::new(db.clone()), db)
    }

    #[tokio::test]
    async fn test_tracks_sequence_of_rates() {
        let (tracker, db) = tracker_with_anchor("UNI-USDT-SWAP", "long").await;
        let open_time = db
            .active_anchor("UNI-USDT-SWAP", "long")
            .await
            .unwrap()
            .unwrap()
            .opened_at;

        for rate in [dec!(5), dec!(12), dec!(3), dec!(-4), dec!(8)] {
            let tracked = tracker
                .run_cycle(&[position("UNI-USDT-SWAP", PosSide::Long, rate)])
                .await;
            assert_eq!(tracked, 1);
        }

        let extremes = db
            .get_extremes("UNI-USDT-SWAP", "long", open_time)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(extremes.max_profit_rate, dec!(12));
        assert_eq!(extremes.max_loss_rate, dec!(-4));
        assert_eq!(extremes.current_profit_rate, dec!(8));
    }

    #[tokio::test]
    async fn test_reopen_starts_fresh_row() {
        let (tracker, db) = tracker_with_anchor("BCH-USDT-SWAP", "short").await;
        let first_open = db
            .active_anchor("BCH-USDT-SWAP", "short")
            .await
            .unwrap()
            .unwrap()
            .opened_at;

        tracker
            .run_cycle(&[position("BCH-USDT-SWAP", PosSide::Short, dec!(15))])
            .await;

        // Close and reopen under a later open time.
        db.close_anchor("BCH-USDT-SWAP", "short").await.unwrap();
        let second_open = first_open + chrono::Duration::hours(1);
        db.save_anchor(&AnchorPosition {
            inst_id: "BCH-USDT-SWAP".to_string(),
            pos_side: "short".to_string(),
            anchor_size: dec!(100),
            anchor_price: dec!(1),
            status: AnchorStatus::Active,
            opened_at: second_open,
            closed_at: None,
        })
        .await
        .unwrap();

        tracker
            .run_cycle(&[position("BCH-USDT-SWAP", PosSide::Short, dec!(-2))])
            .await;

        // The first holding period's history survives untouched.
        let first = db
            .get_extremes("BCH-USDT-SWAP", "short", first_open)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.max_profit_rate, dec!(15));

        let second = db
            .get_extremes("BCH-USDT-SWAP", "short", second_open)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.max_loss_rate, dec!(-2));
        assert_eq!(second.max_profit_rate, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_closed_positions_are_skipped() {
        let (tracker, _db) = tracker_with_anchor("FIL-USDT-SWAP", "long").await;

        let mut closed = position("FIL-USDT-SWAP", PosSide::Long, dec!(3));
        closed.pos_size = Decimal::ZERO;

        let tracked = tracker.run_cycle(&[closed]).await;
        assert_eq!(tracked, 0);
    }
}
