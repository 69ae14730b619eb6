//! HTTP API.
//!
//! Thin translation between axum and [`Gateway`]: extract, call, map the
//! outcome or the error kind to a status code.

use agentgate_core::{
    AgentDescriptor, AgentFilter, ErrorKind, Gateway, GatewayError, InvokeOutcome,
    InvokeRequest, Upload,
};
use agentgate_state::{JobId, JobRecord, JobState};
use axum::body::to_bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

/// Slack above the upload limit for multipart framing and the JSON part.
const BODY_OVERHEAD: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
}

impl AppState {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    fn body_limit(&self) -> usize {
        let max = self.gateway.config().invoke.max_upload_bytes;
        usize::try_from(max)
            .unwrap_or(usize::MAX)
            .saturating_add(BODY_OVERHEAD)
    }
}

pub fn router(state: AppState) -> Router {
    let limit = state.body_limit();
    Router::new()
        .route("/health", get(health))
        .route("/agents", get(list_agents))
        .route("/agents/{agent}", get(agent_detail))
        .route("/invoke/{agent}", post(invoke))
        .route("/status/{thread_id}", get(status))
        .route("/result/{thread_id}", get(result))
        .route("/progress/{thread_id}", post(progress))
        .route("/audit/verify", get(verify_audit))
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An error on its way to the client as `{"error", "kind"}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "unauthorized",
            message: "missing bearer token".into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::from(GatewayError::BadRequest(message.into()))
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::InvalidTransition | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let kind = err.kind();
        match kind {
            ErrorKind::InvalidTransition | ErrorKind::Conflict => {
                warn!(error = %err, "rejected job transition")
            }
            ErrorKind::Internal => warn!(error = %err, "internal error"),
            _ => {}
        }
        Self {
            status: status_for(kind),
            kind: kind.as_str(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.message, "kind": self.kind })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.health())
}

#[derive(Debug, Deserialize)]
struct AgentsQuery {
    state: Option<String>,
}

async fn list_agents(
    State(state): State<AppState>,
    Query(q): Query<AgentsQuery>,
) -> ApiResult<Json<Value>> {
    let raw = q.state.as_deref().unwrap_or("all");
    let filter = AgentFilter::parse(raw)
        .ok_or_else(|| ApiError::bad_request(format!("unknown state filter: {raw}")))?;
    let agents = state.gateway.list_agents(filter);
    Ok(Json(json!({ "agents": agents })))
}

async fn agent_detail(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> ApiResult<Json<AgentDescriptor>> {
    Ok(Json(state.gateway.agent(&agent)?))
}

#[derive(Debug, Default, Deserialize)]
struct InvokeQuery {
    #[serde(default)]
    sync: bool,
}

fn has_bearer_token(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| !token.trim().is_empty())
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"))
}

fn parse_payload(bytes: &[u8]) -> ApiResult<Value> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(bytes).map_err(|e| ApiError::bad_request(format!("invalid JSON: {e}")))
}

/// Remove a top-level `"sync": true|false` and return it.
fn take_sync_flag(payload: &mut Value) -> Option<bool> {
    let obj = payload.as_object_mut()?;
    match obj.get("sync") {
        Some(Value::Bool(b)) => {
            let b = *b;
            obj.remove("sync");
            Some(b)
        }
        _ => None,
    }
}

async fn read_multipart(
    state: &AppState,
    request: Request,
) -> ApiResult<(Value, Vec<Upload>)> {
    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?;

    let mut payload = json!({});
    let mut uploads = Vec::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(multipart_error(state, e)),
        };
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);
        let data = field.bytes().await.map_err(|e| multipart_error(state, e))?;
        match name.as_str() {
            "json" => payload = parse_payload(&data)?,
            "file" => uploads.push(Upload {
                filename: filename.unwrap_or_else(|| "upload".into()),
                data: data.to_vec(),
            }),
            // Unknown parts are ignored.
            _ => {}
        }
    }
    Ok((payload, uploads))
}

fn multipart_error(state: &AppState, err: axum::extract::multipart::MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        GatewayError::PayloadTooLarge {
            limit_bytes: state.gateway.config().invoke.max_upload_bytes,
        }
        .into()
    } else {
        ApiError::bad_request(err.body_text())
    }
}

async fn invoke(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    Query(q): Query<InvokeQuery>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Response> {
    if !has_bearer_token(&headers) {
        return Err(ApiError::unauthorized());
    }

    let (mut payload, uploads) = if is_multipart(&headers) {
        read_multipart(&state, request).await?
    } else {
        let bytes = to_bytes(request.into_body(), state.body_limit())
            .await
            .map_err(|_| GatewayError::PayloadTooLarge {
                limit_bytes: state.gateway.config().invoke.max_upload_bytes,
            })?;
        (parse_payload(&bytes)?, Vec::new())
    };
    let sync = take_sync_flag(&mut payload).unwrap_or(false) || q.sync;

    let mut req = InvokeRequest::new(agent, payload).sync(sync);
    req.uploads = uploads;

    let response = match state.gateway.invoke(req).await? {
        InvokeOutcome::Accepted { thread_id } => (
            StatusCode::ACCEPTED,
            Json(json!({ "thread_id": thread_id.as_str() })),
        )
            .into_response(),
        InvokeOutcome::Finished(job) => {
            let mut body = json!({
                "thread_id": job.id.as_str(),
                "state": job.state.as_str(),
                "result": job.result,
                "error": job.error,
            });
            add_audit_warning(&mut body, &job);
            (StatusCode::OK, Json(body)).into_response()
        }
        InvokeOutcome::StillRunning { thread_id } => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({
                "error": "job still running; poll /status for the outcome",
                "kind": ErrorKind::Timeout.as_str(),
                "thread_id": thread_id.as_str(),
            })),
        )
            .into_response(),
    };
    Ok(response)
}

fn add_audit_warning(body: &mut Value, job: &JobRecord) {
    if let (Some(err), Some(obj)) = (&job.audit_error, body.as_object_mut()) {
        obj.insert("audit_warning".into(), json!(err));
    }
}

fn status_view(job: &JobRecord) -> Value {
    json!({
        "thread_id": job.id.as_str(),
        "agent": job.agent_name,
        "state": job.state.as_str(),
        "progress": job.progress,
        "error": job.error,
    })
}

async fn status(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let job = state.gateway.status(&JobId::from(thread_id.as_str())).await?;
    Ok(Json(status_view(&job)))
}

async fn result(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> ApiResult<Response> {
    let res = state.gateway.result(&JobId::from(thread_id.as_str())).await?;
    let job = &res.job;

    if job.state != JobState::Completed {
        let message = match &job.error {
            Some(e) => e.clone(),
            None => format!("job is {}", job.state.as_str()),
        };
        let body = json!({
            "error": message,
            "kind": ErrorKind::Conflict.as_str(),
            "thread_id": job.id.as_str(),
            "state": job.state.as_str(),
        });
        return Ok((StatusCode::CONFLICT, Json(body)).into_response());
    }

    let mut body = json!({
        "thread_id": job.id.as_str(),
        "result": job.result,
        "artifacts": res.artifacts,
    });
    add_audit_warning(&mut body, job);
    Ok((StatusCode::OK, Json(body)).into_response())
}

async fn progress(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(progress): Json<Value>,
) -> ApiResult<Json<Value>> {
    let job = state
        .gateway
        .report_progress(&JobId::from(thread_id.as_str()), progress)
        .await?;
    Ok(Json(status_view(&job)))
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    #[serde(default)]
    from: u64,
}

async fn verify_audit(
    State(state): State<AppState>,
    Query(q): Query<VerifyQuery>,
) -> ApiResult<Json<Value>> {
    let report = state.gateway.verify_audit(q.from).await?;
    let mut body = json!({
        "intact": report.is_intact(),
        "checked": report.checked,
    });
    if let Some(obj) = body.as_object_mut() {
        if let Some(seq) = report.broken_at {
            obj.insert("broken_at".into(), json!(seq));
        }
        if let Some(reason) = report.reason {
            obj.insert("reason".into(), json!(reason));
        }
    }
    Ok(Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_flag_is_taken_from_the_payload() {
        let mut payload = json!({ "sync": true, "q": 1 });
        assert_eq!(take_sync_flag(&mut payload), Some(true));
        assert_eq!(payload, json!({ "q": 1 }));

        let mut nested = json!({ "sync": "yes" });
        assert_eq!(take_sync_flag(&mut nested), None);
        assert_eq!(nested, json!({ "sync": "yes" }));
    }

    #[test]
    fn empty_body_is_an_empty_object() {
        assert_eq!(parse_payload(b"").unwrap(), json!({}));
        assert_eq!(parse_payload(b" \n").unwrap(), json!({}));
        assert!(parse_payload(b"{nope").is_err());
    }

    #[test]
    fn bearer_token_must_be_non_empty() {
        let mut headers = HeaderMap::new();
        assert!(!has_bearer_token(&headers));
        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(!has_bearer_token(&headers));
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(!has_bearer_token(&headers));
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert!(has_bearer_token(&headers));
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
    }
}
