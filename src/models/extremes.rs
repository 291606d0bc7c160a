//! Profit extremes: best/worst unrealized profit rate per holding period.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What a single observation changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtremeUpdate {
    /// A new maximum profit rate was recorded
    NewHigh,
    /// A new maximum loss rate was recorded
    NewLow,
    /// Only the current rate moved; extremes unchanged
    CurrentOnly,
}

/// High/low-water marks for one position, keyed by (instrument, side,
/// open time). A close-and-reopen starts a fresh row under the new open
/// time, preserving the prior holding period's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitExtremes {
    pub inst_id: String,
    pub pos_side: String,
    pub open_time: DateTime<Utc>,
    pub max_profit_rate: Decimal,
    pub max_profit_time: Option<DateTime<Utc>>,
    pub max_loss_rate: Decimal,
    pub max_loss_time: Option<DateTime<Utc>>,
    pub current_profit_rate: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl ProfitExtremes {
    /// Seed a new row from the first observation. The profit watermark
    /// starts at max(rate, 0) and the loss watermark at min(rate, 0), so
    /// max_profit_rate >= current >= max_loss_rate holds from the start.
    pub fn open(
        inst_id: &str,
        pos_side: &str,
        open_time: DateTime<Utc>,
        rate: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        let positive = rate > Decimal::ZERO;
        let negative = rate < Decimal::ZERO;
        Self {
            inst_id: inst_id.to_string(),
            pos_side: pos_side.to_string(),
            open_time,
            max_profit_rate: if positive { rate } else { Decimal::ZERO },
            max_profit_time: positive.then_some(now),
            max_loss_rate: if negative { rate } else { Decimal::ZERO },
            max_loss_time: negative.then_some(now),
            current_profit_rate: rate,
            updated_at: now,
        }
    }

    /// Fold one observation into the watermarks.
    pub fn observe(&mut self, rate: Decimal, now: DateTime<Utc>) -> ExtremeUpdate {
        self.current_profit_rate = rate;
        self.updated_at = now;

        if rate > self.max_profit_rate {
            self.max_profit_rate = rate;
            self.max_profit_time = Some(now);
            ExtremeUpdate::NewHigh
        } else if rate < self.max_loss_rate {
            self.max_loss_rate = rate;
            self.max_loss_time = Some(now);
            ExtremeUpdate::NewLow
        } else {
            ExtremeUpdate::CurrentOnly
        }
    }
}
