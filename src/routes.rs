//! HTTP routes for the compile webhook.
//!
//! The compile endpoint accepts a GraphQL-gateway action payload and answers
//! with either the encoded tape image or a gateway-style error body.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::core::{cancel_pair, CompileRequest, CompileResult, FailureReason};
use crate::handler::CompileService;

const SERVICE_NAME: &str = "zxbasic-compiler";
const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_REQUEST_ID_LEN: usize = 128;

/// Headroom for the JSON envelope around the source
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;
/// A control character escapes to `\u00XX` inside a JSON string
const MAX_ESCAPE_FACTOR: usize = 6;

/// Application state shared across handlers.
pub struct AppState {
    pub service: CompileService,
}

#[derive(Debug, Deserialize)]
pub struct SessionVariables {
    #[serde(rename = "x-hasura-role")]
    pub role: String,
    #[serde(rename = "x-hasura-user-id", default)]
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ActionInput {
    pub basic: String,
}

#[derive(Debug, Deserialize)]
pub struct ActionName {
    pub name: String,
}

/// Action payload posted by the GraphQL gateway
#[derive(Debug, Deserialize)]
pub struct CompileAction {
    #[serde(default)]
    pub action: Option<ActionName>,
    pub input: ActionInput,
    #[serde(default)]
    pub session_variables: Option<SessionVariables>,
}

#[derive(Debug, Serialize)]
pub struct CompileResponse {
    pub base64_encoded: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    extensions: ErrorExtensions,
}

#[derive(Debug, Serialize)]
struct ErrorExtensions {
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostics: Option<String>,
}

fn error_response(
    status: StatusCode,
    message: impl Into<String>,
    code: impl Into<String>,
    diagnostics: Option<String>,
) -> Response {
    let body = ErrorBody {
        message: message.into(),
        extensions: ErrorExtensions {
            code: code.into(),
            diagnostics,
        },
    };
    (status, Json(body)).into_response()
}

/// Largest request body accepted for a given source limit.
///
/// Sized for a fully escaped source; the exact source size is checked once
/// the payload is decoded.
pub fn body_limit(max_source_bytes: usize) -> usize {
    max_source_bytes
        .saturating_mul(MAX_ESCAPE_FACTOR)
        .saturating_add(BODY_OVERHEAD_BYTES)
}

/// Create the router with all routes.
pub fn create_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/compile", post(compile_handler))
        .route("/compile/", post(compile_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(CorsLayer::permissive().max_age(Duration::from_secs(3600)))
        .with_state(state)
}

/// Health check handler.
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
    }))
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn compile_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<CompileAction>, JsonRejection>,
) -> Response {
    let request_id = request_id(&headers);

    let Json(action) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!(
                "Rejected compile payload: request_id={}, status={}, error={}",
                request_id,
                rejection.status(),
                rejection.body_text()
            );
            return error_response(
                rejection.status(),
                rejection.body_text(),
                FailureReason::InvalidInput.to_string(),
                None,
            );
        }
    };

    if let Some(session) = &action.session_variables {
        debug!(
            "Compile action: request_id={}, action={}, role={}, user_id={:?}",
            request_id,
            action.action.as_ref().map_or("-", |a| a.name.as_str()),
            session.role,
            session.user_id
        );
    }

    let request = CompileRequest::new(action.input.basic);

    // Dropping this future fires the guard and kills the detached compile
    let (handle, token) = cancel_pair();
    let guard = handle.on_drop();
    let task_state = state.clone();
    let task = tokio::spawn(async move {
        task_state
            .service
            .compile_with_id(&request_id, &request, &token)
            .await
    });

    let result = match task.await {
        Ok(result) => result,
        Err(e) => {
            error!("Compile task failed: {}", e);
            CompileResult::system_failure(FailureReason::IoError)
        }
    };
    guard.disarm();

    result_response(result)
}

/// Map a compile result onto the webhook response contract
fn result_response(result: CompileResult) -> Response {
    match result {
        CompileResult::Success { artifact_encoded } => (
            StatusCode::OK,
            Json(CompileResponse {
                base64_encoded: artifact_encoded,
            }),
        )
            .into_response(),
        CompileResult::CompileFailure { diagnostics } => error_response(
            StatusCode::BAD_REQUEST,
            "compilation failed",
            "compile_error",
            Some(diagnostics),
        ),
        CompileResult::SystemFailure { reason } => {
            let (status, message) = match reason {
                FailureReason::InvalidInput => (StatusCode::BAD_REQUEST, "invalid input"),
                FailureReason::Timeout => (StatusCode::GATEWAY_TIMEOUT, "compilation timed out"),
                FailureReason::Cancelled => {
                    (StatusCode::SERVICE_UNAVAILABLE, "compilation cancelled")
                }
                FailureReason::IoError | FailureReason::MissingArtifact => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
                }
            };
            error_response(status, message, reason.to_string(), None)
        }
    }
}
