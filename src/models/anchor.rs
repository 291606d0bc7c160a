//! Anchor position record: the fixed-stake mirror opened in the sub-account.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle of an anchor row. At most one `Active` row may exist per
/// (instrument, side); a full close-and-reopen produces a new row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorStatus {
    Active,
    Closed,
}

impl AnchorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorStatus::Active => "active",
            AnchorStatus::Closed => "closed",
        }
    }
}

/// One anchor holding period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorPosition {
    pub inst_id: String,
    pub pos_side: String,
    pub anchor_size: Decimal,
    pub anchor_price: Decimal,
    pub status: AnchorStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}
