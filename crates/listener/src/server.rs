//! HTTP routes.
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | `POST` | `/workflows` | submit a workflow and wait for its result |
//! | `GET` | `/rate-limit` | budget of the anonymous caller at this origin |
//! | `GET` | `/rate-limit/{identity}` | budget of an identified caller |
//! | `GET` | `/weights` | latest published weight snapshot |
//! | `GET` | `/health` | liveness |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use orchestrator::{Gateway, ShutdownRx, WorkflowSubmission};
use routing::{Caller, Identity, RetryPolicy, SwitchboardError, WeightBoard};

/// Header carrying the credential forwarded to workers.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared state for every handler.
#[derive(Clone)]
pub struct ListenerState {
    pub gateway: Arc<Gateway>,
    pub weights: Arc<WeightBoard>,
}

pub fn build_router(state: ListenerState) -> Router {
    Router::new()
        .route("/workflows", post(submit_workflow))
        .route("/rate-limit", get(anonymous_rate_limit))
        .route("/rate-limit/{identity}", get(identified_rate_limit))
        .route("/weights", get(current_weights))
        .route("/health", get(health))
        .with_state(state)
}

/// Serves on `listener` until `shutdown` flips to `true`.
///
/// # Errors
///
/// Returns the server's I/O error if it stops for any other reason.
pub async fn serve(
    listener: TcpListener,
    state: ListenerState,
    mut shutdown: ShutdownRx,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Listening");
    }
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("Listener shutting down");
        })
        .await
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn submit_workflow(
    State(state): State<ListenerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(submission): Json<WorkflowSubmission>,
) -> Response {
    let credential = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    let origin = peer.ip().to_string();

    match state.gateway.submit(submission, &origin, credential).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

async fn anonymous_rate_limit(
    State(state): State<ListenerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let caller = Caller::Anonymous {
        origin: peer.ip().to_string(),
    };
    Json(state.gateway.limiter().status(&caller))
}

async fn identified_rate_limit(
    State(state): State<ListenerState>,
    Path(identity): Path<String>,
) -> Response {
    match Identity::new(identity) {
        Some(identity) => {
            Json(state.gateway.limiter().status(&Caller::Identified(identity))).into_response()
        }
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": "identity must not be empty"})),
        )
            .into_response(),
    }
}

async fn current_weights(State(state): State<ListenerState>) -> impl IntoResponse {
    Json(state.weights.current().as_ref().clone())
}

/// A request-ending error, rendered as JSON with a matching status code.
pub struct ApiError(pub SwitchboardError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            SwitchboardError::Validation(_) => StatusCode::BAD_REQUEST,
            SwitchboardError::Admission(routing::AdmissionError::InvalidSignature { .. }) => {
                StatusCode::UNAUTHORIZED
            }
            SwitchboardError::Admission(_) => StatusCode::TOO_MANY_REQUESTS,
            SwitchboardError::Persistence(_) | SwitchboardError::Configuration { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn details(&self) -> serde_json::Value {
        match &self.0 {
            SwitchboardError::Validation(err) => serde_json::to_value(err).unwrap_or_default(),
            SwitchboardError::Admission(err) => serde_json::to_value(err).unwrap_or_default(),
            _ => serde_json::Value::Null,
        }
    }

    /// Whole seconds to wait before retrying, rounded up, if retrying can help.
    fn retry_after_secs(&self) -> Option<u64> {
        let SwitchboardError::Admission(err) = &self.0 else {
            return None;
        };
        match err.retry_policy() {
            RetryPolicy::Retryable { after: Some(after) } => {
                Some(after.as_secs() + u64::from(after.subsec_nanos() > 0))
            }
            RetryPolicy::Retryable { after: None } => Some(1),
            RetryPolicy::NonRetryable => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = Json(json!({
            "success": false,
            "error": self.0.to_string(),
            "details": self.details(),
        }));
        let mut response = (status, body).into_response();
        if let Some(secs) = self.retry_after_secs() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
