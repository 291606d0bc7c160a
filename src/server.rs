//! Exposed ops API: close, maintain, and status endpoints.
//!
//! Close and maintain are idempotent, keyed by (inst_id, pos_side,
//! reason): a caller retry with the same key replays the stored
//! response instead of re-dispatching the order.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::{ExchangeGateway, OrderRequest};
use crate::db::{Database, StoredCorrectionAttempt, StoredTakeProfit};
use crate::engine::KeeperConfig;
use crate::margin::{CorrectionOutcome, Corrector};
use crate::models::{AnchorPosition, MaintenanceRecord, PosSide, PositionKey};

/// Shared state behind the ops endpoints.
pub struct OpsState {
    pub db: Arc<Database>,
    pub gateway: Arc<dyn ExchangeGateway>,
    pub corrector: Arc<Corrector>,
    pub config: Arc<KeeperConfig>,
}

/// The ops API server.
pub struct ApiServer {
    state: Arc<OpsState>,
}

#[derive(Debug, Deserialize)]
pub struct CloseRequest {
    pub account_id: String,
    pub inst_id: String,
    pub pos_side: String,
    pub close_size: Decimal,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct MaintainRequest {
    pub account_id: String,
    pub inst_id: String,
    pub pos_side: String,
    pub pos_size: Decimal,
    pub amount: Decimal,
    pub target_margin: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpsResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub maintenance_today: Vec<MaintenanceRecord>,
    pub recent_corrections: Vec<StoredCorrectionAttempt>,
    pub recent_take_profits: Vec<StoredTakeProfit>,
    pub active_anchors: Vec<AnchorPosition>,
}

impl ApiServer {
    pub fn new(state: Arc<OpsState>) -> Self {
        Self { state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/positions/close", post(close_position))
            .route("/api/positions/maintain", post(maintain_position))
            .route("/api/status", get(status))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until the process shuts down.
    pub async fn serve(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Ops API listening on {}", addr);

        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

/// Replay a previously served response for this idempotency key, if any.
async fn replay(state: &OpsState, request_key: &str) -> Option<Json<OpsResponse>> {
    match state.db.served_response(request_key).await {
        Ok(Some(stored)) => match serde_json::from_str::<OpsResponse>(&stored) {
            Ok(response) => {
                info!(request_key, "Replaying served response");
                Some(Json(response))
            }
            Err(_) => None,
        },
        _ => None,
    }
}

async fn remember(state: &OpsState, request_key: &str, response: &OpsResponse) {
    if let Ok(serialized) = serde_json::to_string(response) {
        if let Err(e) = state.db.store_served_response(request_key, &serialized).await {
            warn!(request_key, error = %e, "Failed to store served response");
        }
    }
}

/// Partially close a position on behalf of an external caller.
async fn close_position(
    State(state): State<Arc<OpsState>>,
    Json(request): Json<CloseRequest>,
) -> Result<Json<OpsResponse>, StatusCode> {
    let Some(pos_side) = PosSide::parse(&request.pos_side) else {
        return Err(StatusCode::BAD_REQUEST);
    };

    let request_key = format!(
        "close|{}|{}|{}",
        request.inst_id, request.pos_side, request.reason
    );
    if let Some(replayed) = replay(&state, &request_key).await {
        return Ok(replayed);
    }

    let key = PositionKey::new(request.inst_id.clone(), pos_side);
    let order = OrderRequest::close(
        &request.account_id,
        &key,
        request.close_size,
        &state.config.margin_mode,
    );

    let response = match state.gateway.place_order(&order).await {
        Ok(ack) => OpsResponse {
            success: ack.success,
            order_id: ack.order_id,
            message: ack.message,
        },
        Err(e) => OpsResponse {
            success: false,
            order_id: None,
            message: Some(e.to_string()),
        },
    };

    info!(
        inst_id = %request.inst_id,
        pos_side = %request.pos_side,
        close_size = %request.close_size,
        reason = %request.reason,
        success = response.success,
        "Close request served"
    );

    remember(&state, &request_key, &response).await;
    Ok(Json(response))
}

/// Open additional contracts, then converge the position onto the
/// requested target margin through the correction state machine.
async fn maintain_position(
    State(state): State<Arc<OpsState>>,
    Json(request): Json<MaintainRequest>,
) -> Result<Json<OpsResponse>, StatusCode> {
    let Some(pos_side) = PosSide::parse(&request.pos_side) else {
        return Err(StatusCode::BAD_REQUEST);
    };

    let reason = format!(
        "maintain {}U toward {}U",
        request.amount, request.target_margin
    );
    let request_key = format!(
        "maintain|{}|{}|{}",
        request.inst_id, request.pos_side, reason
    );
    if let Some(replayed) = replay(&state, &request_key).await {
        return Ok(replayed);
    }

    let key = PositionKey::new(request.inst_id.clone(), pos_side);
    let order = OrderRequest::open(
        &request.account_id,
        &key,
        request.pos_size,
        &state.config.margin_mode,
    );

    let ack = match state.gateway.place_order(&order).await {
        Ok(ack) if ack.success => ack,
        Ok(ack) => {
            let response = OpsResponse {
                success: false,
                order_id: None,
                message: ack.message,
            };
            remember(&state, &request_key, &response).await;
            return Ok(Json(response));
        }
        Err(e) => {
            let response = OpsResponse {
                success: false,
                order_id: None,
                message: Some(e.to_string()),
            };
            remember(&state, &request_key, &response).await;
            return Ok(Json(response));
        }
    };

    // The open settles into the target through the ordinary correction
    // machinery; a converged run counts as one maintenance.
    let outcome = state
        .corrector
        .reconcile(&request.account_id, &key, request.target_margin)
        .await;

    let response = match outcome {
        Ok(CorrectionOutcome::Converged { .. }) => {
            let date = state.config.exchange_today(Utc::now());
            match state
                .db
                .increment_maintenance_count(
                    &request.account_id,
                    &key.inst_id,
                    key.pos_side.as_str(),
                    date,
                )
                .await
            {
                Ok(count) => OpsResponse {
                    success: true,
                    order_id: ack.order_id,
                    message: Some(format!("maintenance count now {count}")),
                },
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to bump maintenance count");
                    OpsResponse {
                        success: true,
                        order_id: ack.order_id,
                        message: None,
                    }
                }
            }
        }
        Ok(outcome) => OpsResponse {
            success: false,
            order_id: ack.order_id,
            message: Some(format!("maintain did not converge: {outcome:?}")),
        },
        Err(e) => OpsResponse {
            success: false,
            order_id: ack.order_id,
            message: Some(e.to_string()),
        },
    };

    remember(&state, &request_key, &response).await;
    Ok(Json(response))
}

/// Summary of persisted keeper state.
async fn status(
    State(state): State<Arc<OpsState>>,
) -> Result<Json<StatusResponse>, StatusCode> {
    let date = state.config.exchange_today(Utc::now());

    let maintenance_today = state
        .db
        .maintenance_records_for(date)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let recent_corrections = state
        .db
        .recent_correction_attempts(20)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let recent_take_profits = state
        .db
        .recent_take_profits(20)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let active_anchors = state
        .db
        .active_anchors()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(StatusResponse {
        maintenance_today,
        recent_corrections,
        recent_take_profits,
        active_anchors,
    }))
}
