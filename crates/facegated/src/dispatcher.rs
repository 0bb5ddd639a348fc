//! Backend dispatch — forwards a matched embedding to the access-control API.

use facegate_core::Embedding;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("invalid response body: {0}")]
    InvalidBody(#[from] serde_json::Error),
    #[error("response is missing `type` or `status`")]
    MissingFields,
}

/// Backend verdict for one dispatched face.
#[derive(Debug, Clone, PartialEq)]
pub struct GateResponse {
    /// Gate event type reported by the backend (the JSON `type` field).
    pub kind: String,
    pub status: String,
    pub message: Option<String>,
}

impl GateResponse {
    /// One-line text for frame annotation: `"{type} - {status}"`.
    pub fn summary(&self) -> String {
        format!("{} - {}", self.kind, self.status)
    }
}

#[derive(Deserialize)]
struct RawGateResponse {
    #[serde(rename = "type")]
    kind: Option<String>,
    status: Option<String>,
    message: Option<String>,
}

impl TryFrom<RawGateResponse> for GateResponse {
    type Error = DispatchError;

    fn try_from(raw: RawGateResponse) -> Result<Self, Self::Error> {
        match (raw.kind, raw.status) {
            (Some(kind), Some(status)) => Ok(GateResponse {
                kind,
                status,
                message: raw.message,
            }),
            _ => Err(DispatchError::MissingFields),
        }
    }
}

/// Sends matched embeddings to the backend. Never fails the caller.
pub trait Dispatch {
    /// Returns the backend verdict, or `None` on any failure.
    fn dispatch(&self, embedding: &Embedding) -> Option<GateResponse>;
}

/// Blocking HTTP dispatcher with a bounded request timeout.
pub struct Dispatcher {
    client: Client,
    endpoint: String,
}

impl Dispatcher {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST `{"embedding": [...]}` once; only 200 and 201 count as success.
    pub fn try_dispatch(&self, embedding: &Embedding) -> Result<GateResponse, DispatchError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "embedding": embedding.values }))
            .send()?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let body = response
                .text()
                .unwrap_or_else(|_| "Could not read error body".to_string());
            return Err(DispatchError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes()?;
        let raw: RawGateResponse = serde_json::from_slice(&body)?;
        raw.try_into()
    }
}

impl Dispatch for Dispatcher {
    fn dispatch(&self, embedding: &Embedding) -> Option<GateResponse> {
        match self.try_dispatch(embedding) {
            Ok(response) => {
                tracing::info!(
                    kind = %response.kind,
                    status = %response.status,
                    message = ?response.message,
                    "backend accepted scan"
                );
                Some(response)
            }
            Err(DispatchError::UnexpectedStatus { status, body }) => {
                tracing::warn!(status, %body, "backend rejected scan");
                None
            }
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "backend dispatch failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;
    use std::time::Instant;

    const PATH: &str = "/api/gate/screen";

    /// Serve `router` on an ephemeral port from a background runtime.
    fn spawn_backend(router: Router) -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(listener).unwrap();
                axum::serve(listener, router).await.unwrap();
            });
        });

        format!("http://{addr}{PATH}")
    }

    fn dispatcher(url: &str) -> Dispatcher {
        Dispatcher::new(url, Duration::from_secs(5)).unwrap()
    }

    fn probe() -> Embedding {
        Embedding::new(vec![0.6, 0.8, 0.0])
    }

    #[test]
    fn test_success_returns_typed_response() {
        let url = spawn_backend(Router::new().route(
            PATH,
            post(|Json(body): Json<Value>| async move {
                let dim = body["embedding"].as_array().map(|a| a.len()).unwrap_or(0);
                Json(serde_json::json!({
                    "type": "MASUK",
                    "status": format!("dim={dim}"),
                    "message": "Akses diterima",
                }))
            }),
        ));

        let response = dispatcher(&url).dispatch(&probe()).unwrap();
        assert_eq!(response.kind, "MASUK");
        assert_eq!(response.status, "dim=3");
        assert_eq!(response.message.as_deref(), Some("Akses diterima"));
        assert_eq!(response.summary(), "MASUK - dim=3");
    }

    #[test]
    fn test_created_counts_as_success() {
        let url = spawn_backend(Router::new().route(
            PATH,
            post(|| async {
                (
                    AxumStatus::CREATED,
                    Json(serde_json::json!({ "type": "KELUAR", "status": "ok" })),
                )
            }),
        ));
        assert!(dispatcher(&url).dispatch(&probe()).is_some());
    }

    #[test]
    fn test_server_error_yields_none() {
        let url = spawn_backend(Router::new().route(
            PATH,
            post(|| async {
                (
                    AxumStatus::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "message": "Error server" })),
                )
            }),
        ));
        let d = dispatcher(&url);
        assert!(d.dispatch(&probe()).is_none());
        assert!(matches!(
            d.try_dispatch(&probe()),
            Err(DispatchError::UnexpectedStatus { status: 500, .. })
        ));
    }

    #[test]
    fn test_forbidden_yields_none() {
        let url = spawn_backend(Router::new().route(
            PATH,
            post(|| async {
                (
                    AxumStatus::FORBIDDEN,
                    Json(serde_json::json!({
                        "message": "Pelanggaran!",
                        "reason": "No active permission"
                    })),
                )
            }),
        ));
        assert!(dispatcher(&url).dispatch(&probe()).is_none());
    }

    #[test]
    fn test_missing_fields_fail_closed() {
        let url = spawn_backend(Router::new().route(
            PATH,
            post(|| async { Json(serde_json::json!({ "message": "ok", "type": "MASUK" })) }),
        ));
        let d = dispatcher(&url);
        assert!(d.dispatch(&probe()).is_none());
        assert!(matches!(d.try_dispatch(&probe()), Err(DispatchError::MissingFields)));
    }

    #[test]
    fn test_non_json_body_yields_none() {
        let url = spawn_backend(Router::new().route(PATH, post(|| async { "not json" })));
        let d = dispatcher(&url);
        assert!(matches!(d.try_dispatch(&probe()), Err(DispatchError::InvalidBody(_))));
        assert!(d.dispatch(&probe()).is_none());
    }

    #[test]
    fn test_connection_refused_yields_none() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let d = dispatcher(&format!("http://{addr}{PATH}"));
        assert!(matches!(d.try_dispatch(&probe()), Err(DispatchError::Transport(_))));
        assert!(d.dispatch(&probe()).is_none());
    }

    #[test]
    fn test_slow_backend_times_out() {
        let url = spawn_backend(Router::new().route(
            PATH,
            post(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Json(serde_json::json!({ "type": "MASUK", "status": "late" }))
            }),
        ));
        let d = Dispatcher::new(url, Duration::from_millis(200)).unwrap();

        let started = Instant::now();
        assert!(d.dispatch(&probe()).is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
