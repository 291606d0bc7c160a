//! Wire types for the snapshot provider and exchange gateway.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One position row as the snapshot provider reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionRow {
    pub inst_id: String,
    pub pos_side: String,
    pub pos_size: Decimal,
    #[serde(default)]
    pub avg_price: Decimal,
    #[serde(default)]
    pub mark_price: Decimal,
    #[serde(default)]
    pub margin: Decimal,
    #[serde(default)]
    pub lever: Decimal,
    #[serde(default)]
    pub profit_rate: Decimal,
}

/// Envelope returned by the snapshot provider.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionsEnvelope {
    pub success: bool,
    #[serde(default)]
    pub positions: Vec<PositionRow>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Order placement body sent to the exchange gateway.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBody {
    pub inst_id: String,
    pub pos_side: String,
    pub order_side: String,
    pub size: Decimal,
    pub margin_mode: String,
    pub reduce_only: bool,
    pub client_order_id: String,
}

/// Gateway reply to an order placement.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrderReply {
    pub success: bool,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
