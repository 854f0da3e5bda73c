//! HTTP handlers: query submission, reconnect and health.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use clonar_admission::{Admission, AdmissionRequest, Rejection};
use clonar_core::ids::{EventId, SessionId};
use clonar_core::query::QueryRequest;
use clonar_store::StoreError;

use crate::gateway::sse_response;
use crate::server::AppState;

/// Errors a client can see. Everything past admission degrades inside the
/// stream instead.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid request: {0}")]
    BadRequest(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Rejected(Rejection::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
            Self::Rejected(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Rejected(r) => r.error_code(),
            Self::Store(e) => e.error_code(),
            Self::BadRequest(_) => "invalid_request",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retry_after = match &self {
            Self::Rejected(r) => r.retry_after(),
            _ => None,
        };
        let body = ErrorBody {
            error: self.error_code(),
            message: self.to_string(),
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
        };
        let mut response = (self.status(), Json(body)).into_response();
        if let Some(retry_after) = retry_after {
            // Whole seconds, rounded up.
            let secs = retry_after.as_millis().div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                let _ = response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Rate-limit key: explicit user id, else the first forwarded address, else
/// the peer address.
pub fn caller_key(user_id: Option<&str>, headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(user) = user_id.map(str::trim).filter(|u| !u.is_empty()) {
        return format!("user:{user}");
    }
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    match forwarded {
        Some(ip) => format!("ip:{ip}"),
        None => format!("ip:{}", peer.ip()),
    }
}

fn last_event_id(headers: &HeaderMap) -> Option<EventId> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// `POST /query`
#[instrument(skip_all, fields(caller = tracing::field::Empty))]
pub async fn submit_query(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Result<Response, ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".into()));
    }
    let caller = caller_key(request.user_id.as_deref(), &headers, peer);
    tracing::Span::current().record("caller", caller.as_str());

    let admission = AdmissionRequest::new(caller.clone(), request.priority());
    let permit = match state.admission.try_admit(&admission) {
        Ok(Admission::Admitted(permit)) => permit,
        Ok(Admission::Queued(ticket)) => {
            debug!(priority = ?ticket.priority(), "request queued");
            ticket.wait(state.config.queue_wait_timeout).await?
        }
        Err(rejection) => {
            warn!(reason = rejection.error_code(), "request rejected");
            return Err(rejection.into());
        }
    };

    let session = state.sessions.create(caller, Some(permit));
    let subscription = session.subscribe();
    info!(
        session_id = %session.id(),
        conversation = request.session_id.as_ref().map(SessionId::as_str),
        "query admitted"
    );

    let pipeline = state.pipeline.clone();
    let _ = tokio::spawn(async move { pipeline.run(session, request).await });

    Ok(sse_response(
        subscription,
        state.config.heartbeat_interval,
        state.config.reconnect_grace,
    )
    .into_response())
}

/// `POST /reconnect/{session_id}`
pub async fn reconnect(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let id = SessionId::from_raw(session_id);
    let last_seen = last_event_id(&headers);
    let subscription = state.sessions.resume(&id, last_seen)?;
    info!(session_id = %id, last_seen, "client reconnected");
    Ok(sse_response(
        subscription,
        state.config.heartbeat_interval,
        state.config.reconnect_grace,
    )
    .into_response())
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = if state.shutdown.is_cancelled() {
        "shutting_down"
    } else {
        "ok"
    };
    let code = if status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": status,
            "admission": state.admission.snapshot(),
            "sessions": {
                "total": state.sessions.len(),
                "active": state.sessions.active_count(),
            },
        })),
    )
}
