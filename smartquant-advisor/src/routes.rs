//! HTTP routes for the advisor service.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use smartquant_common::Error;
use std::sync::Arc;

use crate::data::PriceBar;
use crate::decision::DecisionRequest;
use crate::indicators::{self, FrameStatus, IndicatorSet};
use crate::portfolio::{HoldingsStore, Portfolio};
use crate::scheduler::SchedulerStatus;
use crate::AdvisorState;

// ============================================================================
// Errors
// ============================================================================

/// Error body returned by every failing handler.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

/// Handler error mapped onto an HTTP status through [`Error::status_code`].
#[derive(Debug)]
pub struct ApiError(Error);

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(err.into())
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.status_code();
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        let body = serde_json::json!({
            "success": false,
            "error": ErrorBody {
                code,
                message: self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
}

#[derive(Debug, Deserialize)]
pub struct CashRequest {
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
pub struct HoldingRequest {
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    pub total_shares: i64,
    pub avail_shares: i64,
    #[serde(default)]
    pub cost: f64,
    /// Date of the purchase being recorded, defaults to today
    #[serde(default)]
    pub buy_date: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
pub struct IndicatorResponse {
    pub symbol: String,
    pub bars: usize,
    pub status: FrameStatus,
    pub latest_bar: Option<PriceBar>,
    pub indicators: Option<IndicatorSet>,
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        service: "smartquant-advisor".to_string(),
    })
}

/// Run a store operation on the blocking pool. The store does file I/O under
/// a std mutex.
async fn with_store<T, F>(state: &AdvisorState, f: F) -> ApiResult<T>
where
    F: FnOnce(&HoldingsStore) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(&state.store);
    let result = tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
    Ok(Json(result?))
}

/// Current portfolio with T+1 settlement applied
pub async fn get_portfolio(State(state): State<Arc<AdvisorState>>) -> ApiResult<Portfolio> {
    with_store(&state, |store| Ok(store.load())).await
}

pub async fn update_cash(
    State(state): State<Arc<AdvisorState>>,
    Json(req): Json<CashRequest>,
) -> ApiResult<Portfolio> {
    with_store(&state, move |store| store.update_cash(req.amount)).await
}

/// Create or replace a holding; `total_shares <= 0` removes it
pub async fn upsert_holding(
    State(state): State<Arc<AdvisorState>>,
    Json(req): Json<HoldingRequest>,
) -> ApiResult<Portfolio> {
    let buy_date = req.buy_date.unwrap_or_else(|| Local::now().date_naive());
    with_store(&state, move |store| {
        store.upsert(
            &req.symbol,
            &req.name,
            req.total_shares,
            req.avail_shares,
            req.cost,
            buy_date,
        )
    })
    .await
}

pub async fn delete_holding(
    State(state): State<Arc<AdvisorState>>,
    Path(symbol): Path<String>,
) -> ApiResult<Portfolio> {
    with_store(&state, move |store| store.delete(&symbol)).await
}

pub async fn scheduler_status(State(state): State<Arc<AdvisorState>>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status())
}

/// Latest indicator row for one symbol
pub async fn get_indicators(
    State(state): State<Arc<AdvisorState>>,
    Path(symbol): Path<String>,
) -> ApiResult<IndicatorResponse> {
    let history = state.history.clone();
    let lookup = symbol.clone();
    let frame = tokio::task::spawn_blocking(move || indicators::compute(&history.load(&lookup)))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    if frame.bars.is_empty() {
        return Err(Error::NotFound(format!("no local history for {}", symbol)).into());
    }

    let (latest_bar, indicators) = match frame.latest() {
        Some((bar, row)) => (Some(bar.clone()), Some(row.clone())),
        None => (frame.bars.last().cloned(), None),
    };

    Ok(Json(IndicatorResponse {
        symbol,
        bars: frame.bars.len(),
        status: frame.status,
        latest_bar,
        indicators,
    }))
}

/// The request the next decision tick would send, without calling the model
pub async fn decision_preview(State(state): State<Arc<AdvisorState>>) -> Json<DecisionRequest> {
    Json(state.advisor.build_request().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_status_mapping() {
        let response = ApiError::from(Error::InvalidInput("bad".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ApiError::from(anyhow::anyhow!("disk full")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = ApiError::from(Error::NotFound("x".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_holding_request_defaults() {
        let req: HoldingRequest = serde_json::from_str(
            r#"{"symbol": "600519", "total_shares": 100, "avail_shares": 0}"#,
        )
        .unwrap();
        assert_eq!(req.buy_date, None);
        assert_eq!(req.cost, 0.0);

        let req: HoldingRequest = serde_json::from_str(
            r#"{"symbol": "600519", "total_shares": 100, "avail_shares": 0, "cost": 1.5, "buy_date": "2024-01-02"}"#,
        )
        .unwrap();
        assert_eq!(req.buy_date, NaiveDate::from_ymd_opt(2024, 1, 2));
    }
}
