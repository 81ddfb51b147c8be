//! Inference backend calls.
//!
//! The lifecycle controller talks to serving infrastructure through the
//! [`InferenceBackend`] trait so tests can substitute a mock. The production
//! implementation speaks HTTP to two kinds of backends:
//!
//! - **Local runtime** (Ollama-style API): warmed with a minimal one-token
//!   generation request, stopped with a zero keep-alive request, enumerated
//!   via its tags endpoint.
//! - **Accelerated container**: probed with a GET on its health endpoint.
//!   Start/stop are managed externally and are never issued from here.
//!
//! Every call carries a bounded timeout; timing out is reported the same way
//! as an explicit failure, never left hanging.

use crate::errors::BackendError;
use crate::registry::{BackendKind, ModelDescriptor};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Abstraction over the serving infrastructure.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Force the model into a loaded, ready state.
    async fn warm(&self, model: &ModelDescriptor) -> Result<(), BackendError>;

    /// Release the model from the runtime. Only meaningful for
    /// [`BackendKind::LocalRuntime`] models.
    async fn stop(&self, model: &ModelDescriptor) -> Result<(), BackendError>;

    /// Models the local runtime currently reports as present.
    async fn list_models(&self, endpoint: &Url) -> Result<Vec<String>, BackendError>;
}

type HttpsClient = Client<
    hyper_tls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    Full<Bytes>,
>;

/// HTTP implementation of [`InferenceBackend`].
#[derive(Clone)]
pub struct HttpRuntimeClient {
    client: HttpsClient,
    /// Timeout for warm-up generation calls on local runtimes.
    warm_timeout: Duration,
    /// Timeout for readiness probes and stop calls.
    probe_timeout: Duration,
}

impl Default for HttpRuntimeClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(5))
    }
}

impl HttpRuntimeClient {
    pub fn new(warm_timeout: Duration, probe_timeout: Duration) -> Self {
        let https = hyper_tls::HttpsConnector::new();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_timer(hyper_util::rt::TokioTimer::new())
            .build(https);
        Self {
            client,
            warm_timeout,
            probe_timeout,
        }
    }

    fn endpoint_path(endpoint: &Url, path: &str) -> String {
        format!("{}/{}", endpoint.as_str().trim_end_matches('/'), path)
    }

    /// Issue one request under a timeout and return the response body.
    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<Bytes, BackendError> {
        let uri: hyper::Uri = url
            .parse()
            .map_err(|e| BackendError::InvalidResponse(format!("invalid URL {url}: {e}")))?;

        let mut builder = Request::builder().method(method).uri(uri);
        let body_bytes = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                serde_json::to_vec(&value)
                    .map_err(|e| BackendError::InvalidResponse(e.to_string()))?
            }
            None => Vec::new(),
        };
        let request = builder
            .body(Full::new(Bytes::from(body_bytes)))
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        let response = tokio::time::timeout(timeout, self.client.request(request))
            .await
            .map_err(|_| BackendError::Timeout(timeout))?
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }

        let collected = response
            .into_body()
            .collect()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        Ok(collected.to_bytes())
    }
}

#[async_trait]
impl InferenceBackend for HttpRuntimeClient {
    async fn warm(&self, model: &ModelDescriptor) -> Result<(), BackendError> {
        match model.backend {
            BackendKind::LocalRuntime => {
                // A single-token generation forces the runtime to page the
                // model in; the output itself is discarded.
                let url = Self::endpoint_path(&model.endpoint, "api/generate");
                let body = json!({
                    "model": model.name,
                    "prompt": "ping",
                    "stream": false,
                    "options": { "num_predict": 1 },
                });
                debug!(model = %model.name, url = %url, "issuing warm-up generation");
                self.request(Method::POST, &url, Some(body), self.warm_timeout)
                    .await?;
            }
            BackendKind::AcceleratedContainer => {
                let url = Self::endpoint_path(&model.endpoint, "health");
                debug!(model = %model.name, url = %url, "probing container readiness");
                self.request(Method::GET, &url, None, self.probe_timeout)
                    .await?;
            }
        }
        info!(model = %model.name, "backend reports model ready");
        Ok(())
    }

    async fn stop(&self, model: &ModelDescriptor) -> Result<(), BackendError> {
        match model.backend {
            BackendKind::LocalRuntime => {
                // keep_alive=0 tells the runtime to release the model now.
                let url = Self::endpoint_path(&model.endpoint, "api/generate");
                let body = json!({ "model": model.name, "keep_alive": 0 });
                debug!(model = %model.name, url = %url, "issuing stop call");
                self.request(Method::POST, &url, Some(body), self.probe_timeout)
                    .await?;
                Ok(())
            }
            BackendKind::AcceleratedContainer => Err(BackendError::Unsupported),
        }
    }

    async fn list_models(&self, endpoint: &Url) -> Result<Vec<String>, BackendError> {
        let url = Self::endpoint_path(endpoint, "api/tags");
        let body = self
            .request(Method::GET, &url, None, self.probe_timeout)
            .await?;

        let parsed: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        let names = parsed
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }
}
