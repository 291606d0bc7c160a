//! HTTP clients for the position snapshot provider and exchange gateway.

mod gateway;
mod snapshot;
mod types;

pub use gateway::{DryRunGateway, ExchangeGateway, GatewayClient, OrderAck, OrderRequest, OrderSide};
pub use snapshot::{PositionProvider, SnapshotCache, SnapshotClient};
pub use types::*;
