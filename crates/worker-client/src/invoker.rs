//! HTTP implementation of [`WorkerInvoker`].
//!
//! Each call is a single `POST {base_url}/{capability}` with the JSON payload
//! as body. No retries, no caching.
//!
//! | Transport result | [`InvocationError`] |
//! |------------------|---------------------|
//! | connect / send failure | `Unreachable` |
//! | deadline elapsed | `Timeout` |
//! | HTTP 401 / 403 | `AuthRejected` |
//! | any other non-2xx | `WorkerReportedError` |
//! | 2xx with an `error` and no `output` | `WorkerReportedError` |
//! | 2xx not matching the capability schema | `MalformedResponse` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, instrument};

use routing::{Capability, InvocationError, InvocationRequest, TrafficKind, WorkerInvoker};

use crate::registry::{WorkerEndpoint, WorkerRegistry};

/// Header carrying the caller's credential.
pub const API_KEY_HEADER: &str = "X-API-Key";

const DETAIL_LIMIT: usize = 200;

pub struct HttpWorkerInvoker {
    client: reqwest::Client,
    registry: Arc<WorkerRegistry>,
}

impl HttpWorkerInvoker {
    pub fn new(client: reqwest::Client, registry: Arc<WorkerRegistry>) -> Self {
        Self { client, registry }
    }
}

#[async_trait]
impl WorkerInvoker for HttpWorkerInvoker {
    #[instrument(
        skip(self, request),
        fields(worker = %request.worker, capability = %request.capability, traffic = ?request.traffic)
    )]
    async fn invoke(&self, request: InvocationRequest) -> Result<Value, InvocationError> {
        let endpoint = self.registry.endpoint(&request.worker).ok_or_else(|| {
            InvocationError::Unreachable(format!(
                "no endpoint registered for worker '{}'",
                request.worker
            ))
        })?;
        let url = endpoint.url_for(request.capability.as_str());

        let mut call = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .json(&request.payload);
        if let Some(key) = api_key_for(&request, endpoint) {
            call = call.header(API_KEY_HEADER, key);
        }

        let response = call
            .send()
            .await
            .map_err(|err| transport_error(&err, request.timeout))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| transport_error(&err, request.timeout))?;
        debug!(%url, status = status.as_u16(), bytes = body.len(), "Worker replied");

        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        interpret_reply(request.capability, &body)
    }
}

/// Key sent with a call.
///
/// Organic calls forward the caller's credential and fall back to the
/// endpoint's key. Evaluation calls use the endpoint's key and fall back to
/// the evaluation credential.
fn api_key_for<'a>(request: &'a InvocationRequest, endpoint: &'a WorkerEndpoint) -> Option<&'a str> {
    let caller = request.credential.as_deref();
    let configured = endpoint.api_key.as_deref();
    match request.traffic {
        TrafficKind::Organic => caller.or(configured),
        TrafficKind::Evaluation => configured.or(caller),
    }
}

fn transport_error(err: &reqwest::Error, limit: Duration) -> InvocationError {
    if err.is_timeout() {
        InvocationError::timeout(limit)
    } else {
        InvocationError::Unreachable(err.to_string())
    }
}

/// Classifies a non-2xx reply.
pub fn status_error(status: StatusCode, body: &[u8]) -> InvocationError {
    let detail = error_detail(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            InvocationError::AuthRejected(format!("HTTP {}: {detail}", status.as_u16()))
        }
        _ => InvocationError::WorkerReportedError(format!("HTTP {}: {detail}", status.as_u16())),
    }
}

/// Parses and schema-checks a 2xx reply body.
pub fn interpret_reply(capability: Capability, body: &[u8]) -> Result<Value, InvocationError> {
    let reply: Value = serde_json::from_slice(body)
        .map_err(|err| InvocationError::MalformedResponse(format!("invalid JSON: {err}")))?;

    if reply.get("output").is_none() {
        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            let message = error
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| error.to_string());
            return Err(InvocationError::WorkerReportedError(message));
        }
    }

    capability
        .check_response(&reply)
        .map_err(InvocationError::MalformedResponse)?;
    Ok(reply)
}

/// `detail` or `error` from a JSON error body, else the start of the raw text.
fn error_detail(body: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<Value>(body) {
        for key in ["detail", "error", "message"] {
            if let Some(text) = json.get(key).and_then(Value::as_str) {
                return text.to_owned();
            }
        }
    }
    String::from_utf8_lossy(body).chars().take(DETAIL_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use routing::Identity;
    use serde_json::json;

    #[test]
    fn auth_statuses_map_to_auth_rejected() {
        let err = status_error(StatusCode::UNAUTHORIZED, br#"{"detail": "Invalid API key"}"#);
        assert_eq!(
            err,
            InvocationError::AuthRejected("HTTP 401: Invalid API key".into())
        );
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, b""),
            InvocationError::AuthRejected(_)
        ));
        assert!(matches!(
            status_error(StatusCode::INTERNAL_SERVER_ERROR, b"oops"),
            InvocationError::WorkerReportedError(m) if m == "HTTP 500: oops"
        ));
    }

    #[test]
    fn replies_are_checked_against_the_schema() {
        let ok = br#"{"output": {"immediate_response": "hi", "notebook": "no update"}}"#;
        assert!(interpret_reply(Capability::Complete, ok).is_ok());

        assert!(matches!(
            interpret_reply(Capability::Refine, b"not json"),
            Err(InvocationError::MalformedResponse(_))
        ));
        assert!(matches!(
            interpret_reply(Capability::Summary, br#"{"output": {"immediate_response": 3}}"#),
            Err(InvocationError::MalformedResponse(_))
        ));
        assert_eq!(
            interpret_reply(Capability::Complete, br#"{"error": "model overloaded"}"#),
            Err(InvocationError::WorkerReportedError("model overloaded".into()))
        );
    }

    async fn spawn_worker() -> String {
        async fn complete(headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
            let key = headers
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none")
                .to_owned();
            Json(json!({"output": {"immediate_response": format!("{key}:{}", body["task"])}}))
        }
        let app = Router::new().route("/complete", post(complete));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn request(credential: Option<&str>) -> InvocationRequest {
        InvocationRequest {
            worker: Identity::new("w1").unwrap(),
            capability: Capability::Complete,
            payload: json!({"task": "t"}),
            timeout: Duration::from_secs(5),
            credential: credential.map(str::to_owned),
            traffic: TrafficKind::Organic,
        }
    }

    fn evaluation_request(credential: Option<&str>) -> InvocationRequest {
        InvocationRequest {
            traffic: TrafficKind::Evaluation,
            ..request(credential)
        }
    }

    #[tokio::test]
    async fn forwards_caller_credential_or_falls_back_to_configured_key() {
        let base_url = spawn_worker().await;
        let registry = WorkerRegistry::new([WorkerEndpoint {
            identity: Identity::new("w1").unwrap(),
            base_url,
            api_key: Some("configured".into()),
        }]);
        let invoker = HttpWorkerInvoker::new(reqwest::Client::new(), Arc::new(registry));

        let forwarded = invoker.invoke(request(Some("caller"))).await.unwrap();
        assert_eq!(forwarded["output"]["immediate_response"], "caller:\"t\"");

        let fallback = invoker.invoke(request(None)).await.unwrap();
        assert_eq!(fallback["output"]["immediate_response"], "configured:\"t\"");
    }

    #[tokio::test]
    async fn evaluation_calls_prefer_the_endpoint_key() {
        let base_url = spawn_worker().await;
        let registry = WorkerRegistry::new([
            WorkerEndpoint {
                identity: Identity::new("w1").unwrap(),
                base_url: base_url.clone(),
                api_key: Some("endpoint-key".into()),
            },
            WorkerEndpoint {
                identity: Identity::new("w2").unwrap(),
                base_url,
                api_key: None,
            },
        ]);
        let invoker = HttpWorkerInvoker::new(reqwest::Client::new(), Arc::new(registry));

        let keyed = invoker
            .invoke(evaluation_request(Some("evaluation-key")))
            .await
            .unwrap();
        assert_eq!(keyed["output"]["immediate_response"], "endpoint-key:\"t\"");

        let keyless = invoker
            .invoke(InvocationRequest {
                worker: Identity::new("w2").unwrap(),
                ..evaluation_request(Some("evaluation-key"))
            })
            .await
            .unwrap();
        assert_eq!(keyless["output"]["immediate_response"], "evaluation-key:\"t\"");
    }

    #[tokio::test]
    async fn unknown_worker_and_closed_port_are_unreachable() {
        let invoker = HttpWorkerInvoker::new(reqwest::Client::new(), Arc::new(WorkerRegistry::default()));
        assert!(matches!(
            invoker.invoke(request(None)).await,
            Err(InvocationError::Unreachable(_))
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let registry = WorkerRegistry::new([WorkerEndpoint {
            identity: Identity::new("w1").unwrap(),
            base_url: format!("http://{addr}"),
            api_key: None,
        }]);
        let invoker = HttpWorkerInvoker::new(reqwest::Client::new(), Arc::new(registry));
        assert!(matches!(
            invoker.invoke(request(None)).await,
            Err(InvocationError::Unreachable(_))
        ));
    }
}
