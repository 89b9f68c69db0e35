//! Broadcast admin routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use courier_common::error::AppError;
use courier_common::types::{BroadcastRun, DeliveryView, Page, PageRequest};
use courier_engine::manager::{EnqueueRequest, RunDetail};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/broadcasts", post(create_broadcast).get(list_broadcasts))
        .route(
            "/api/broadcasts/{id}",
            get(get_broadcast).delete(delete_broadcast),
        )
        .route("/api/broadcasts/{id}/deliveries", get(list_deliveries))
        .route("/api/broadcasts/{id}/cancel", post(cancel_broadcast))
        .route("/api/broadcasts/{id}/repost", post(repost_broadcast))
        .route(
            "/api/broadcasts/{id}/requeue-unknown",
            post(requeue_unknown),
        )
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl PageQuery {
    fn request(&self) -> PageRequest {
        PageRequest::new(self.page, self.page_size)
    }
}

#[derive(Debug, Deserialize)]
pub struct DeliveryQuery {
    pub filter: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// POST /api/broadcasts — Enqueue a broadcast run.
async fn create_broadcast(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<BroadcastRun>), AppError> {
    let run = state.broadcasts.enqueue(req).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// GET /api/broadcasts — Runs, newest first.
async fn list_broadcasts(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<BroadcastRun>>, AppError> {
    let page = state.broadcasts.list_runs(query.request()).await?;
    Ok(Json(page))
}

/// GET /api/broadcasts/:id — Run with live delivery counts.
async fn get_broadcast(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<RunDetail>, AppError> {
    Ok(Json(state.broadcasts.run_detail(id).await?))
}

/// GET /api/broadcasts/:id/deliveries — Deliveries with recipient info.
async fn list_deliveries(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<DeliveryQuery>,
) -> Result<Json<Page<DeliveryView>>, AppError> {
    let page = PageRequest::new(query.page, query.page_size);
    let deliveries = state
        .broadcasts
        .list_deliveries(id, query.filter.as_deref(), page)
        .await?;
    Ok(Json(deliveries))
}

/// POST /api/broadcasts/:id/cancel
async fn cancel_broadcast(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<BroadcastRun>, AppError> {
    Ok(Json(state.broadcasts.cancel(id).await?))
}

/// POST /api/broadcasts/:id/repost — New run with the same message and audience.
async fn repost_broadcast(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<BroadcastRun>), AppError> {
    let run = state.broadcasts.repost(id, None).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// POST /api/broadcasts/:id/requeue-unknown
async fn requeue_unknown(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let requeued = state.broadcasts.requeue_unknown(id).await?;
    Ok(Json(json!({ "requeued": requeued })))
}

/// DELETE /api/broadcasts/:id
async fn delete_broadcast(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.broadcasts.delete(id).await?;
    Ok(Json(json!({ "deleted": true })))
}
