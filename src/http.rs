//! HTTP surface of the dispatcher, plus the WebSocket upgrade.
//!
//! Every `/api` route requires a Bearer token; the verified identity rides
//! along as a request extension. `/health` is open for probes and `/ws`
//! authenticates in-band after the upgrade.
//!
//! All bodies are JSON `{success, ...}`; error kinds map onto status codes
//! as: validation 400, missing result 404, publish failure 500, deadline
//! 504.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::auth::{Identity, JwtVerifier};
use crate::dispatcher::{DispatchError, Dispatcher, SubmitOptions};
use crate::hub::Hub;
use crate::ledger::{LedgerError, ResultLedger};
use crate::record::RequestType;

/// Window the stats endpoint aggregates over.
const STATS_WINDOW: Duration = Duration::from_secs(3600);

/// Shared state behind every handler.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub ledger: ResultLedger,
    pub hub: Arc<Hub>,
    pub verifier: JwtVerifier,
}

/// Errors surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("missing or invalid authorization")]
    Unauthorized,

    #[error("no result for request {0}")]
    NotFound(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Dispatch(DispatchError::Timeout { .. })
            | ApiError::Dispatch(DispatchError::WaiterDropped) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Dispatch(_) | ApiError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "success": false, "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

/// Body of the submit/execute endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    #[serde(rename = "type")]
    request_type: RequestType,
    payload: Value,
    user_id: Option<i64>,
    event_id: Option<i64>,
    /// Deadline in milliseconds, execute only.
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BacBody {
    #[serde(rename = "userId")]
    user_id: i64,
    #[serde(rename = "eventId")]
    event_id: i64,
    libations: Value,
}

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    limit: Option<u32>,
    metric: Option<String>,
}

/// Build the full route tree around the shared state.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .route("/api/compute/submit", post(submit))
        .route("/api/compute/execute", post(execute))
        .route("/api/compute/result/:request_id", get(get_result))
        .route("/api/compute/bac", post(calculate_bac))
        .route("/api/compute/analytics/:event_id", get(event_analytics))
        .route("/api/compute/leaderboard/:event_id", get(leaderboard))
        .route("/api/compute/stats", get(stats))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    // Probes stay open; WebSocket clients authenticate in-band.
    let path = req.uri().path();
    if path == "/health" || path == "/ws" {
        return Ok(next.run(req).await);
    }

    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match bearer {
        Some(token) => match state.verifier.verify(token) {
            Ok(identity) => {
                req.extensions_mut().insert(identity);
                Ok(next.run(req).await)
            }
            Err(e) => {
                warn!(error = %e, "Rejected API token");
                Err(ApiError::Unauthorized)
            }
        },
        None => Err(ApiError::Unauthorized),
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError::Validation(e.to_string()))
}

fn submit_opts(body: &SubmitBody, identity: &Identity) -> SubmitOptions {
    SubmitOptions {
        correlation_id: None,
        // The verified caller is the default routing hint.
        user_id: body.user_id.or(Some(identity.user_id)),
        event_id: body.event_id,
    }
}

async fn submit(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let body: SubmitBody = parse_body(body)?;
    let opts = submit_opts(&body, &identity);

    let receipt = state
        .dispatcher
        .submit(body.request_type, body.payload, opts)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "requestId": receipt.request_id,
            "correlationId": receipt.correlation_id,
        })),
    )
        .into_response())
}

async fn execute(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let body: SubmitBody = parse_body(body)?;
    let opts = submit_opts(&body, &identity);
    let timeout = body.timeout.map(Duration::from_millis);

    let record = state
        .dispatcher
        .submit_and_wait(body.request_type, body.payload, opts, timeout)
        .await?;

    Ok(Json(json!({
        "success": true,
        "requestId": record.request_id,
        "correlationId": record.correlation_id,
        "result": record.payload_json(),
        "processingTimeMs": record.processing_time_ms,
    })))
}

async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.ledger.get_by_request_id(&request_id).await? {
        Some(row) => Ok(Json(json!({ "success": true, "result": row }))),
        None => Err(ApiError::NotFound(request_id)),
    }
}

async fn calculate_bac(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let body: BacBody = parse_body(body)?;
    let record = state
        .dispatcher
        .calculate_bac(body.user_id, body.event_id, body.libations)
        .await?;

    Ok(Json(json!({ "success": true, "result": record.payload_json() })))
}

async fn event_analytics(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let record = state.dispatcher.event_analytics(event_id).await?;
    Ok(Json(json!({ "success": true, "result": record.payload_json() })))
}

async fn leaderboard(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<i64>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .dispatcher
        .leaderboard(
            event_id,
            query.limit.unwrap_or(100),
            query.metric.as_deref().unwrap_or("bac"),
        )
        .await?;

    Ok(Json(json!({ "success": true, "result": record.payload_json() })))
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let recent = state.ledger.stats_since(STATS_WINDOW).await?;
    Ok(Json(json!({
        "success": true,
        "pendingRequests": state.dispatcher.pending_count(),
        "recentResults": recent,
    })))
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.ledger.ping().await {
        Ok(()) => Json(json!({ "status": "ok", "ledger": "connected" })).into_response(),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "degraded", "ledger": "unreachable" })),
            )
                .into_response()
        }
    }
}

async fn ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| hub.handle_socket(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::error::KafkaError;

    use crate::producer::PublishError;

    #[test]
    fn error_kinds_map_to_contract_status_codes() {
        assert_eq!(
            ApiError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("r-1".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Dispatch(DispatchError::Publish(PublishError::Kafka(
                KafkaError::Canceled
            )))
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::Dispatch(DispatchError::Timeout {
                request_id: "r-1".into(),
                timeout: Duration::from_secs(1),
            })
            .status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn submit_body_requires_known_type_and_payload() {
        let ok: Result<SubmitBody, _> = parse_body(json!({
            "type": "LEADERBOARD",
            "payload": {"eventId": 10},
            "timeout": 1000
        }));
        let body = ok.unwrap();
        assert_eq!(body.request_type, RequestType::Leaderboard);
        assert_eq!(body.timeout, Some(1000));

        let missing_payload: Result<SubmitBody, ApiError> =
            parse_body(json!({"type": "LEADERBOARD"}));
        assert!(matches!(missing_payload, Err(ApiError::Validation(_))));

        let unknown_type: Result<SubmitBody, ApiError> =
            parse_body(json!({"type": "MINING", "payload": {}}));
        assert!(matches!(unknown_type, Err(ApiError::Validation(_))));
    }

    #[test]
    fn bac_body_shape() {
        let body: BacBody = parse_body(json!({
            "userId": 1,
            "eventId": 10,
            "libations": [{"volumeMl": 330, "abv": 4.7}]
        }))
        .unwrap();
        assert_eq!(body.user_id, 1);
        assert_eq!(body.event_id, 10);
        assert!(body.libations.is_array());
    }
}
