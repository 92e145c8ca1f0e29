//! transport.rs
//! HTTP seam between the pipeline and the ingestion endpoint.
//!
//! - `Transport` is what workers and the server-policy source call; tests
//!   script it, hosts get `HttpTransport` (reqwest).
//! - Any HTTP response (2xx/4xx/5xx) is `Ok`; the worker interprets status.
//!   `Err` means nothing usable came back (timeout, connect, request).
//! - Request bodies are gzip-compressed JSON.

use std::{io::Write, time::Duration};

use async_trait::async_trait;
use flate2::{Compression, write::GzEncoder};
use log::debug;
use serde::Serialize;

use crate::error::TransportError;

/// Identity headers required on every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaders {
    pub auth_token: String,
    pub device_id: String,
    pub app_id: String,
    pub sdk_version: String,
    pub os_version: String,
    /// IANA timezone name, e.g. `Europe/Berlin`.
    pub timezone: String,
}

impl RequestHeaders {
    pub fn pairs(&self) -> [(&'static str, String); 6] {
        [
            ("Authorization", format!("token {}", self.auth_token)),
            ("Device-Id", self.device_id.clone()),
            ("App-Id", self.app_id.clone()),
            ("Sdk-Version", self.sdk_version.clone()),
            ("Os-Version", self.os_version.clone()),
            ("Timezone", self.timezone.clone()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { status, body: body.into() }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 4xx: the server will never accept this request as sent.
    #[inline]
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// POSTs an already gzip-compressed JSON body.
    async fn post(&self, path: &str, body: &[u8], headers: &RequestHeaders) -> Result<TransportResponse, TransportError>;

    async fn get(&self, path: &str, headers: &RequestHeaders) -> Result<TransportResponse, TransportError>;
}

/// Serializes `value` to JSON and gzips it.
pub fn gzip_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, TransportError> {
    let json = serde_json::to_vec(value).map_err(|e| TransportError::Encode(e.to_string()))?;
    let mut encoder = GzEncoder::new(Vec::with_capacity((json.len() / 2).max(256)), Compression::fast());
    encoder
        .write_all(&json)
        .map_err(|e| TransportError::Encode(e.to_string()))?;
    encoder.finish().map_err(|e| TransportError::Encode(e.to_string()))
}

/// reqwest-backed transport against a single base URL.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn with_headers(builder: reqwest::RequestBuilder, headers: &RequestHeaders) -> reqwest::RequestBuilder {
        headers
            .pairs()
            .into_iter()
            .fold(builder, |b, (name, value)| b.header(name, value))
    }

    async fn finish(request: reqwest::RequestBuilder) -> Result<TransportResponse, TransportError> {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(TransportResponse { status, body })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, path: &str, body: &[u8], headers: &RequestHeaders) -> Result<TransportResponse, TransportError> {
        let url = self.url(path);
        debug!("[HttpTransport] POST {} ({} bytes gzip)", url, body.len());
        let request = Self::with_headers(self.client.post(&url), headers)
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "gzip")
            .body(body.to_vec());
        Self::finish(request).await
    }

    async fn get(&self, path: &str, headers: &RequestHeaders) -> Result<TransportResponse, TransportError> {
        let url = self.url(path);
        debug!("[HttpTransport] GET {}", url);
        let request = Self::with_headers(self.client.get(&url), headers).header("Accept", "application/json");
        Self::finish(request).await
    }
}
