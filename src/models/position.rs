//! Position model: one live row from the snapshot provider.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a leveraged position (hedge mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PosSide {
    Long,
    Short,
}

impl PosSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PosSide::Long => "long",
            PosSide::Short => "short",
        }
    }

    /// The opposite direction, used by the hedge take-profit rule to
    /// find the primary account's counterpart.
    pub fn opposite(&self) -> PosSide {
        match self {
            PosSide::Long => PosSide::Short,
            PosSide::Short => PosSide::Long,
        }
    }

    pub fn parse(s: &str) -> Option<PosSide> {
        match s.to_lowercase().as_str() {
            "long" => Some(PosSide::Long),
            "short" => Some(PosSide::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for PosSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a position within one account: instrument plus direction.
///
/// Correction runs are serialized on this key; different keys are fully
/// independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub inst_id: String,
    pub pos_side: PosSide,
}

impl PositionKey {
    pub fn new(inst_id: impl Into<String>, pos_side: PosSide) -> Self {
        Self {
            inst_id: inst_id.into(),
            pos_side,
        }
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.inst_id, self.pos_side)
    }
}

/// Live position snapshot row.
///
/// Created, mutated, and destroyed entirely by the exchange; the keeper
/// consumes one consistent copy per cycle and never writes it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Account the position belongs to
    pub account: String,

    /// Instrument identifier (e.g. "CFX-USDT-SWAP")
    pub inst_id: String,

    /// Position direction
    pub pos_side: PosSide,

    /// Size in contracts
    pub pos_size: Decimal,

    /// Average entry price
    pub avg_price: Decimal,

    /// Current mark price
    pub mark_price: Decimal,

    /// Leverage multiplier
    pub leverage: Decimal,

    /// Collateral locked against the position, in quote units
    pub margin: Decimal,

    /// Unrealized P&L as a percentage (provider convention)
    pub profit_rate: Decimal,

    /// When this snapshot row was fetched
    #[serde(default = "Utc::now")]
    pub fetched_at: DateTime<Utc>,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.inst_id.clone(), self.pos_side)
    }

    /// Margin implied by size, mark price, and leverage. The provider's
    /// reported margin can lag order fills; the verifier compares
    /// against this instead.
    pub fn theoretical_margin(&self) -> Decimal {
        if self.leverage.is_zero() {
            return Decimal::ZERO;
        }
        self.pos_size * self.mark_price / self.leverage
    }

    pub fn is_losing(&self) -> bool {
        self.profit_rate < Decimal::ZERO
    }

    pub fn is_open(&self) -> bool {
        !self.pos_size.is_zero()
    }
}
