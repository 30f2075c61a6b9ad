//! Federation HTTP surface
//!
//! The inbound wire contract: a single inbox endpoint accepting signed
//! documents, plus the read-only audit surface. The handlers translate
//! the engine's typed results into transport status codes; all protocol
//! logic lives in the federation module.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{InboxResult, extract_domain, extract_signature_key_id};

/// POST /inbox
///
/// Receives activities from remote instances. Rate limiting runs before
/// any signature work; everything else is the router's state machine.
///
/// # Status codes
/// - 202 accepted
/// - 400 malformed body or failed validation
/// - 401 missing/invalid signature
/// - 403 actor mismatch on Delete
/// - 429 rate limited
async fn inbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    // Rate limit per claimed signing domain. An unparseable Signature
    // header falls through to the router, which rejects it unsigned.
    if let Ok(key_id) = extract_signature_key_id(&headers) {
        let domain = extract_domain(&key_id);
        if !domain.is_empty() {
            state.rate_limiter.check_and_increment(&domain).await?;
        }
    }

    let result = state.inbox_router.receive("/inbox", &headers, &body).await?;

    let response = match result {
        InboxResult::Accepted => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "accepted"})),
        ),
        InboxResult::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "invalid signature"})),
        ),
        InboxResult::BadRequest(reason) => {
            (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": reason})))
        }
        InboxResult::Forbidden => (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"error": "forbidden"})),
        ),
    };

    Ok(response.into_response())
}

#[derive(Debug, Deserialize)]
struct ActivitiesQuery {
    actor: String,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// GET /audit/activities?actor=...
async fn audit_activities(
    State(state): State<AppState>,
    Query(query): Query<ActivitiesQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let activities = state
        .db
        .list_activities_by_actor(&query.actor, query.limit.clamp(1, 500))
        .await?;

    Ok(Json(serde_json::json!({ "activities": activities })))
}

#[derive(Debug, Deserialize)]
struct DeliveriesQuery {
    activity: Option<String>,
    endpoint: Option<String>,
    /// Restrict an endpoint listing to still-pending records
    #[serde(default)]
    pending: bool,
    #[serde(default = "default_limit")]
    limit: i64,
}

/// GET /audit/deliveries?activity=... | ?endpoint=...[&pending=true]
///
/// Delivery records by activity or by endpoint. Only terminal states are
/// meaningful for alerting; pending records show queue depth.
async fn audit_deliveries(
    State(state): State<AppState>,
    Query(query): Query<DeliveriesQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let records = match (&query.activity, &query.endpoint) {
        (Some(activity_id), _) => state.db.list_deliveries_by_activity(activity_id).await?,
        (None, Some(endpoint)) if query.pending => {
            state.db.list_pending_deliveries(endpoint).await?
        }
        (None, Some(endpoint)) => {
            state
                .db
                .list_deliveries_by_endpoint(endpoint, query.limit.clamp(1, 500))
                .await?
        }
        (None, None) => {
            return Err(AppError::Validation(
                "activity or endpoint query parameter required".to_string(),
            ));
        }
    };

    Ok(Json(serde_json::json!({ "deliveries": records })))
}

#[derive(Debug, Deserialize)]
struct EndpointQuery {
    endpoint: String,
}

/// GET /audit/endpoint-health?endpoint=...
async fn audit_endpoint_health(
    State(state): State<AppState>,
    Query(query): Query<EndpointQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let health = state.db.get_endpoint_health(&query.endpoint).await?;
    Ok(Json(serde_json::json!({ "health": health })))
}

/// Create the federation router
pub fn federation_router() -> Router<AppState> {
    Router::new()
        .route("/inbox", post(inbox))
        .route("/audit/activities", get(audit_activities))
        .route("/audit/deliveries", get(audit_deliveries))
        .route("/audit/endpoint-health", get(audit_endpoint_health))
}
