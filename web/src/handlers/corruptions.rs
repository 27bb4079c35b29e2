//! Corruption list, detail, and bulk operator actions.
//!
//! ```text
//! GET  /api/corruptions            active aggregates (from the view)
//! GET  /api/corruptions/:id        replayed state + history (from the log)
//! POST /api/corruptions/retry      {"ids": [...]}
//! POST /api/corruptions/ignore     {"ids": [...]}
//! POST /api/corruptions/delete     {"ids": [...]}
//! ```

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use healwatch_core::aggregate::AggregateId;
use healwatch_core::event::DomainEvent;
use healwatch_projections::{BulkOutcome, CorruptionAggregate, project};
use serde::{Deserialize, Serialize};

/// Header carrying the operator name for manual actions.
pub const USER_HEADER: &str = "x-user-id";

/// Body of the bulk action endpoints.
#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    /// Aggregate ids to act on.
    pub ids: Vec<String>,
}

/// Detail response.
#[derive(Debug, Serialize)]
pub struct CorruptionDetail {
    /// Replayed state.
    pub state: CorruptionAggregate,
    /// Full ordered history.
    pub history: Vec<DomainEvent>,
}

fn user_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn validate(request: &BulkRequest) -> Result<(), AppError> {
    if request.ids.is_empty() {
        return Err(AppError::bad_request("ids must not be empty"));
    }
    Ok(())
}

/// `GET /api/corruptions`
#[allow(clippy::unused_async)]
pub async fn list_active(State(state): State<AppState>) -> Json<Vec<CorruptionAggregate>> {
    Json(state.view.active())
}

/// `GET /api/corruptions/:id`
///
/// Replays from the log rather than reading the view.
///
/// # Errors
///
/// - 400 for a malformed id
/// - 404 when the aggregate has no corruption history
/// - 500/503 when the log cannot be read
pub async fn get_corruption(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<CorruptionDetail>, AppError> {
    let id = raw
        .parse::<AggregateId>()
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let history = state.log.query(&id).await?;
    let aggregate = project(&history).ok_or_else(|| AppError::not_found("Corruption", &id))?;

    Ok(Json(CorruptionDetail {
        state: aggregate,
        history,
    }))
}

/// `POST /api/corruptions/retry`
///
/// # Errors
///
/// 400 when `ids` is empty.
pub async fn retry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BulkRequest>,
) -> Result<Json<BulkOutcome>, AppError> {
    validate(&request)?;
    Ok(Json(state.actions.retry(&request.ids, user_id(&headers)).await))
}

/// `POST /api/corruptions/ignore`
///
/// # Errors
///
/// 400 when `ids` is empty.
pub async fn ignore(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BulkRequest>,
) -> Result<Json<BulkOutcome>, AppError> {
    validate(&request)?;
    Ok(Json(state.actions.ignore(&request.ids, user_id(&headers)).await))
}

/// `POST /api/corruptions/delete`
///
/// # Errors
///
/// 400 when `ids` is empty.
pub async fn delete(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> Result<Json<BulkOutcome>, AppError> {
    validate(&request)?;
    Ok(Json(state.actions.delete(&request.ids).await))
}
