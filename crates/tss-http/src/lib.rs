//! HTTP Coordinator Transport
//!
//! [`Transport`] over HTTP for talking to a remote coordinator.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing::{debug, instrument};
use tss_core::transport::async_trait;
use tss_core::{ClientConfig, Error, Response, Result, Transport};

/// HTTP-based coordinator transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// HTTP client
    client: Client,
    /// Coordinator base URL, without a trailing slash
    base_url: String,
    /// Request timeout
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for the coordinator at `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(&config.base_url, config.request_timeout()))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Response::new(status, parse_body(text)))
    }
}

/// Coordinator bodies are JSON; anything else is kept as a string
fn parse_body(text: String) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self))]
    async fn get(&self, path: &str) -> Result<Response> {
        let response = self.send(self.client.get(self.url(path))).await?;
        debug!(status = response.status, "GET completed");
        Ok(response)
    }

    #[instrument(skip(self, body))]
    async fn post(&self, path: &str, body: &Value) -> Result<Response> {
        let response = self.send(self.client.post(self.url(path)).json(body)).await?;
        debug!(status = response.status, "POST completed");
        Ok(response)
    }
}
