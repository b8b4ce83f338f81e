//! JSON-over-HTTP dependency client.
//!
//! The client resolves its logical service name on every call, so address changes in the
//! resolver take effect immediately. Transport failures map onto [`DependencyError`]:
//!
//! | transport                          | error                      |
//! |------------------------------------|----------------------------|
//! | no address, connect/reset failure  | `Connect`                  |
//! | request timeout                    | `Timeout`                  |
//! | non-2xx status                     | `Remote { status, .. }`    |
//! | body is not JSON                   | `Decode`                   |

use crate::client::{CreateClient, FetchClient};
use crate::discovery::Resolver;
use crate::error::DependencyError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Longest slice of a failure body kept in `Remote` errors.
const MAX_ERROR_BODY: usize = 256;

/// Default cap on a response body.
pub const DEFAULT_MAX_BODY: usize = 4 * 1024 * 1024;

/// One endpoint of a downstream service: `GET {address}{path}` for fetches and
/// `POST {address}{path}` for creates. `{key}` in the path is replaced by the primary key.
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    resolver: Arc<dyn Resolver>,
    service: String,
    path: String,
    timeout: Option<Duration>,
    max_body: usize,
}

impl HttpClient {
    pub fn new(resolver: Arc<dyn Resolver>, service: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            resolver,
            service: service.into(),
            path: path.into(),
            timeout: None,
            max_body: DEFAULT_MAX_BODY,
        }
    }

    /// Share a connection pool with other clients.
    pub fn with_http(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Transport-level timeout per request, reported as `DependencyError::Timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Largest response body read, in bytes. Longer bodies fail with `Decode`.
    pub fn with_max_body(mut self, bytes: usize) -> Self {
        self.max_body = bytes;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn url(&self, key: Option<u64>) -> Result<String, DependencyError> {
        let address = self.resolver.pick(&self.service).ok_or_else(|| {
            DependencyError::Connect(format!("no address for service '{}'", self.service))
        })?;
        let path = match key {
            Some(key) => self.path.replace("{key}", &key.to_string()),
            None => self.path.clone(),
        };
        Ok(format!("{address}{path}"))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, DependencyError> {
        let request = match self.timeout {
            Some(limit) => request.timeout(limit),
            None => request,
        };
        let response = request.send().await.map_err(|e| self.transport(e))?;
        let status = response.status();
        let body = self.read_body(response).await?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            return Err(DependencyError::Remote {
                status: status.as_u16(),
                message: text.chars().take(MAX_ERROR_BODY).collect(),
            });
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(|e| DependencyError::Decode(e.to_string()))
    }

    async fn read_body(&self, mut response: reqwest::Response) -> Result<Vec<u8>, DependencyError> {
        let too_large = || DependencyError::Decode(format!("response body exceeds {} bytes", self.max_body));
        let declared = response.content_length().unwrap_or(0);
        if usize::try_from(declared).map_or(true, |len| len > self.max_body) {
            return Err(too_large());
        }

        let mut body = Vec::with_capacity(usize::try_from(declared).unwrap_or(0));
        while let Some(chunk) = response.chunk().await.map_err(|e| self.transport(e))? {
            if body.len() + chunk.len() > self.max_body {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn transport(&self, error: reqwest::Error) -> DependencyError {
        if error.is_timeout() {
            DependencyError::Timeout { limit: self.timeout.unwrap_or_default() }
        } else if error.is_decode() {
            DependencyError::Decode(error.to_string())
        } else {
            DependencyError::Connect(error.to_string())
        }
    }
}

#[async_trait]
impl FetchClient<Value> for HttpClient {
    async fn fetch(&self, key: u64) -> Result<Value, DependencyError> {
        let url = self.url(Some(key))?;
        tracing::trace!(service = %self.service, %url, "GET");
        self.send(self.http.get(url)).await
    }
}

#[async_trait]
impl CreateClient<Value> for HttpClient {
    async fn create(&self, payload: &Value) -> Result<Value, DependencyError> {
        let url = self.url(None)?;
        tracing::trace!(service = %self.service, %url, "POST");
        self.send(self.http.post(url).json(payload)).await
    }
}
