//! Process-wide configuration.
//!
//! Constructed once at startup and treated as immutable from then on;
//! a changed file takes effect at the next process start, never
//! mid-cycle.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::margin::CorrectorConfig;

use super::take_profit::TakeProfitRule;

/// Configuration for the keeper's loops and policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    /// Margin deviation tolerance in quote units
    pub tolerance: Decimal,

    /// Maximum correction attempts per triggering deviation
    pub max_retries: u32,

    /// Settle delay before the first convergence check (seconds)
    pub settle_delay_secs: u64,

    /// Rule A threshold: profit rate (percent) above which to take profit
    pub profit_threshold: Decimal,

    /// Fraction of the current size each take-profit firing closes
    pub close_ratio: Decimal,

    /// Rule B threshold: primary opposite-side profit rate (percent)
    /// strictly below this triggers the hedge rule
    pub hedge_loss_threshold: Decimal,

    /// Order in which take-profit rules are evaluated
    pub rule_priority: Vec<TakeProfitRule>,

    /// Cooldown after a successful partial close (seconds)
    pub take_profit_cooldown_secs: u64,

    /// Fixed stake for auto-opened anchors, in quote units
    pub auto_open_stake: Decimal,

    /// Leverage applied to auto-opened anchors
    pub leverage: Decimal,

    /// Margin mode for all dispatched orders
    pub margin_mode: String,

    // === Poll intervals ===
    pub reconcile_interval_secs: u64,
    pub take_profit_interval_secs: u64,
    pub auto_open_interval_secs: u64,
    pub extremes_interval_secs: u64,

    /// TTL of the shared position snapshot cache (milliseconds)
    pub snapshot_ttl_ms: u64,

    /// Exchange timezone as a UTC offset in hours; maintenance counts
    /// reset at this timezone's calendar-day rollover
    pub exchange_utc_offset_hours: i32,

    /// Primary account holding the organically-traded positions
    pub primary_account: String,

    /// Sub-account holding the fixed-stake mirrors
    pub sub_account: String,

    /// Position snapshot provider base URL
    pub snapshot_base_url: String,

    /// Exchange gateway base URL
    pub gateway_base_url: String,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            tolerance: dec!(0.5),                 // 0.5U deviation band
            max_retries: 3,
            settle_delay_secs: 5,
            profit_threshold: dec!(30),           // take profit above 30%
            close_ratio: dec!(0.5),               // close half each firing
            hedge_loss_threshold: Decimal::ZERO,  // any primary loss triggers
            rule_priority: vec![TakeProfitRule::Absolute, TakeProfitRule::Hedge],
            take_profit_cooldown_secs: 5,
            auto_open_stake: dec!(10),            // 10U per mirror
            leverage: dec!(10),
            margin_mode: "isolated".to_string(),
            reconcile_interval_secs: 30,
            take_profit_interval_secs: 10,
            auto_open_interval_secs: 30,
            extremes_interval_secs: 60,
            snapshot_ttl_ms: 2000,
            exchange_utc_offset_hours: 8,
            primary_account: "primary".to_string(),
            sub_account: "sub1".to_string(),
            snapshot_base_url: "http://localhost:5000/api".to_string(),
            gateway_base_url: "http://localhost:5000/api".to_string(),
        }
    }
}

impl KeeperConfig {
    /// Load from a JSON file, with defaults for any omitted field.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn take_profit_cooldown(&self) -> Duration {
        Duration::from_secs(self.take_profit_cooldown_secs)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_millis(self.snapshot_ttl_ms)
    }

    /// The exchange-timezone calendar day for a given instant.
    /// Maintenance counts are keyed by this date.
    pub fn exchange_today(&self, now: DateTime<Utc>) -> NaiveDate {
        let offset = FixedOffset::east_opt(self.exchange_utc_offset_hours * 3600)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset"));
        now.with_timezone(&offset).date_naive()
    }

    pub fn corrector_config(&self) -> CorrectorConfig {
        CorrectorConfig {
            tolerance: self.tolerance,
            max_retries: self.max_retries,
            settle_delay: self.settle_delay(),
            margin_mode: self.margin_mode.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_defaults() {
        let config = KeeperConfig::default();
        assert_eq!(config.tolerance, dec!(0.5));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.profit_threshold, dec!(30));
        assert_eq!(config.close_ratio, dec!(0.5));
        assert_eq!(config.auto_open_stake, dec!(10));
        assert_eq!(
            config.rule_priority,
            vec![TakeProfitRule::Absolute, TakeProfitRule::Hedge]
        );
    }

    #[test]
    fn test_exchange_day_rollover() {
        let config = KeeperConfig::default();

        // 20:00 UTC is already the next day at UTC+8.
        let evening = Utc.with_ymd_and_hms(2025, 3, 14, 20, 0, 0).unwrap();
        assert_eq!(
            config.exchange_today(evening),
            NaiveDate::from_ymd_opt(2025, 3, 15).unwrap()
        );

        // 08:00 UTC is still the same day.
        let morning = Utc.with_ymd_and_hms(2025, 3, 14, 8, 0, 0).unwrap();
        assert_eq!(
            config.exchange_today(morning),
            NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
        );
    }
}
