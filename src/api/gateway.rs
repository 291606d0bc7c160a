//! Exchange gateway client: order dispatch with transport-level retries.
//!
//! Transport retries live here and only here. The correction state
//! machine treats any error out of this layer as terminal for the run.

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use reqwest::Client;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::KeeperError;
use crate::models::{PosSide, PositionKey};

use super::types::{OrderBody, OrderReply};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRY_ELAPSED: Duration = Duration::from_secs(15);

/// Exchange order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// A fully-specified order instruction.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub account: String,
    pub inst_id: String,
    pub pos_side: PosSide,
    pub order_side: OrderSide,
    pub size: Decimal,
    pub margin_mode: String,
    pub reduce_only: bool,
    pub client_order_id: String,
}

impl OrderRequest {
    /// Partially close a hedge-mode position: a long closes by selling,
    /// a short closes by buying.
    pub fn close(account: &str, key: &PositionKey, size: Decimal, margin_mode: &str) -> Self {
        let order_side = match key.pos_side {
            PosSide::Long => OrderSide::Sell,
            PosSide::Short => OrderSide::Buy,
        };
        Self::new(account, key, order_side, size, margin_mode, true)
    }

    /// Add contracts to a hedge-mode position: a long adds by buying,
    /// a short adds by selling.
    pub fn open(account: &str, key: &PositionKey, size: Decimal, margin_mode: &str) -> Self {
        let order_side = match key.pos_side {
            PosSide::Long => OrderSide::Buy,
            PosSide::Short => OrderSide::Sell,
        };
        Self::new(account, key, order_side, size, margin_mode, false)
    }

    fn new(
        account: &str,
        key: &PositionKey,
        order_side: OrderSide,
        size: Decimal,
        margin_mode: &str,
        reduce_only: bool,
    ) -> Self {
        Self {
            account: account.to_string(),
            inst_id: key.inst_id.clone(),
            pos_side: key.pos_side,
            order_side,
            size,
            margin_mode: margin_mode.to_string(),
            reduce_only,
            client_order_id: Uuid::new_v4().to_string(),
        }
    }

    fn body(&self) -> OrderBody {
        OrderBody {
            inst_id: self.inst_id.clone(),
            pos_side: self.pos_side.as_str().to_string(),
            order_side: self.order_side.as_str().to_string(),
            size: self.size,
            margin_mode: self.margin_mode.clone(),
            reduce_only: self.reduce_only,
            client_order_id: self.client_order_id.clone(),
        }
    }
}

/// Gateway acknowledgement. `success: false` means the gateway received
/// and rejected the order; that is not a transport error.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub success: bool,
    pub order_id: Option<String>,
    pub message: Option<String>,
}

/// Order dispatch seam.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, KeeperError>;
}

/// HTTP client for the exchange gateway.
pub struct GatewayClient {
    client: Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(base_url: String) -> Result<Self, KeeperError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| KeeperError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    fn retry_policy() -> ExponentialBackoff {
        ExponentialBackoff {
            max_elapsed_time: Some(MAX_RETRY_ELAPSED),
            ..ExponentialBackoff::default()
        }
    }
}

#[async_trait]
impl ExchangeGateway for GatewayClient {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, KeeperError> {
        let url = format!("{}/orders?account={}", self.base_url, request.account);
        let body = request.body();

        let reply: OrderReply = backoff::future::retry(Self::retry_policy(), || async {
            let response = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_connect() || e.is_timeout() {
                        backoff::Error::transient(format!("gateway unreachable: {e}"))
                    } else {
                        backoff::Error::permanent(format!("gateway request failed: {e}"))
                    }
                })?;

            let status = response.status();
            if status.is_server_error() {
                return Err(backoff::Error::transient(format!(
                    "gateway returned {status}"
                )));
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(backoff::Error::permanent(format!(
                    "gateway returned {status}: {text}"
                )));
            }

            response
                .json::<OrderReply>()
                .await
                .map_err(|e| backoff::Error::permanent(format!("bad gateway payload: {e}")))
        })
        .await
        .map_err(KeeperError::Transport)?;

        if reply.success {
            info!(
                inst_id = %request.inst_id,
                pos_side = %request.pos_side,
                order_side = request.order_side.as_str(),
                size = %request.size,
                order_id = ?reply.order_id,
                "Order accepted"
            );
        } else {
            warn!(
                inst_id = %request.inst_id,
                pos_side = %request.pos_side,
                message = ?reply.message,
                "Order rejected by gateway"
            );
        }

        Ok(OrderAck {
            success: reply.success,
            order_id: reply.order_id,
            message: reply.message,
        })
    }
}

/// Gateway stand-in for dry runs: logs what would be sent and reports
/// success without touching the network.
pub struct DryRunGateway;

#[async_trait]
impl ExchangeGateway for DryRunGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, KeeperError> {
        info!(
            inst_id = %request.inst_id,
            pos_side = %request.pos_side,
            order_side = request.order_side.as_str(),
            size = %request.size,
            reduce_only = request.reduce_only,
            "[DRY RUN] Would place order"
        );

        Ok(OrderAck {
            success: true,
            order_id: Some(format!("dry-{}", request.client_order_id)),
            message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_close_order_side_mapping() {
        let long = PositionKey::new("BTC-USDT-SWAP", PosSide::Long);
        let short = PositionKey::new("BTC-USDT-SWAP", PosSide::Short);

        let close_long = OrderRequest::close("sub1", &long, dec!(10), "isolated");
        assert_eq!(close_long.order_side, OrderSide::Sell);
        assert!(close_long.reduce_only);

        let close_short = OrderRequest::close("sub1", &short, dec!(10), "isolated");
        assert_eq!(close_short.order_side, OrderSide::Buy);
    }

    #[test]
    fn test_open_order_side_mapping() {
        let long = PositionKey::new("ETH-USDT-SWAP", PosSide::Long);
        let short = PositionKey::new("ETH-USDT-SWAP", PosSide::Short);

        assert_eq!(
            OrderRequest::open("sub1", &long, dec!(1), "isolated").order_side,
            OrderSide::Buy
        );
        assert_eq!(
            OrderRequest::open("sub1", &short, dec!(1), "isolated").order_side,
            OrderSide::Sell
        );
    }
}
