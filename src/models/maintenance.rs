//! Maintenance record: how many corrections a position has received today.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Per-day correction counter for one (account, instrument, side).
///
/// The count selects the margin tier and is monotonically non-decreasing
/// within a day; rows are keyed by the exchange-timezone calendar day, so
/// the rollover reset happens by keying rather than by deleting rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceRecord {
    pub account: String,
    pub inst_id: String,
    pub pos_side: String,
    pub date: NaiveDate,
    pub count: u32,
    pub last_maintenance: Option<DateTime<Utc>>,
}
