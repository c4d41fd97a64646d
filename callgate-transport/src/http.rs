// reqwest-backed HTTP transport

use crate::transport::{HttpTransport, TransportError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use callgate_core::request::value_to_pairs;
use callgate_core::{HttpMethod, RequestSpec, Response};
use reqwest::Client as HttpClient;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Prefix for relative request URLs
    pub base_url: Option<String>,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
    /// Headers sent with every request; per-request headers win
    pub default_headers: BTreeMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 30000,
            default_headers: BTreeMap::new(),
        }
    }
}

pub struct ReqwestTransport {
    config: TransportConfig,
    http_client: HttpClient,
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReqwestTransport {
    /// Create a new transport with the given configuration
    pub fn new(config: TransportConfig) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::with_client(http_client, config))
    }

    /// Create a transport for `base_url` with default settings
    pub fn new_with_base_url(base_url: &str) -> Result<Self> {
        Self::new(TransportConfig {
            base_url: Some(base_url.to_string()),
            ..Default::default()
        })
    }

    /// Wrap an existing client; `config.timeout_ms` is not applied to it
    pub fn with_client(http_client: HttpClient, config: TransportConfig) -> Self {
        Self {
            config,
            http_client,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        match &self.config.base_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                url.trim_start_matches('/')
            ),
            None => url.to_string(),
        }
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Options => reqwest::Method::OPTIONS,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

fn map_send_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::timeout(err.to_string()).with_code("ETIMEDOUT")
    } else if err.is_connect() {
        TransportError::network(err.to_string()).with_code("ECONNREFUSED")
    } else if err.is_decode() || err.is_body() {
        TransportError::parse(err.to_string())
    } else {
        TransportError::network(err.to_string())
    }
}

/// Decode a response body. JSON content types must parse; other bodies are
/// tried as JSON and fall back to a string.
fn decode_body(text: &str, content_type: Option<&str>) -> Result<Value, TransportError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    let is_json = content_type.is_some_and(|ct| ct.contains("json"));
    match serde_json::from_str(text) {
        Ok(value) => Ok(value),
        Err(e) if is_json => Err(TransportError::parse(format!(
            "Failed to parse JSON response: {}",
            e
        ))),
        Err(_) => Ok(Value::String(text.to_string())),
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn request(&self, request: &RequestSpec) -> Result<Response, TransportError> {
        let url = self.resolve_url(&request.url);
        debug!("Sending {} {}", request.method, url);

        let mut builder = self
            .http_client
            .request(to_reqwest_method(request.method), &url);

        if let Some(params) = &request.params {
            let pairs = value_to_pairs(params);
            if !pairs.is_empty() {
                builder = builder.query(&pairs);
            }
        }
        for (name, value) in &self.config.default_headers {
            if !request.headers.contains_key(name) {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(data) = &request.data {
            trace!("Request body: {}", data);
            builder = builder.json(data);
        }

        let response = builder.send().await.map_err(map_send_error)?;

        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let text = response.text().await.map_err(map_send_error)?;
        trace!("Response {} body: {}", status, text);

        let data = decode_body(&text, headers.get("content-type").map(String::as_str))?;

        Ok(Response {
            data,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            config: request.clone(),
        })
    }
}
