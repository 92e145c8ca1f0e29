//! server.rs
//! Pulls server-pushed control policies.
//!
//! `GET {controls_path}/{user_id}`; 404 or an empty body means the server
//! has no policy for this user. Other non-2xx statuses are errors.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use serde::Deserialize;

use crate::controls::policy::{ControlPolicy, PolicyOrigin};
use crate::error::TransportError;
use crate::pipeline::transport::{RequestHeaders, Transport};

#[async_trait]
pub trait ServerPolicySource: Send + Sync {
    async fn fetch_server_policy(&self, user_id: &str) -> Result<Option<ControlPolicy>, TransportError>;
}

/// Body of the controls endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServerControlsDto {
    /// Seconds between flushes.
    pub batch_duration: u64,
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Seconds; 0 means no expiry.
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub minimum_displacement: Option<f64>,
}

impl ServerControlsDto {
    /// `batch_size` 0 is filled in from presets by the resolver.
    pub fn into_policy(self, fallback_displacement_m: f64) -> ControlPolicy {
        ControlPolicy {
            batch_interval_secs: self.batch_duration,
            batch_size: self.batch_size.unwrap_or(0),
            ttl_secs: self.ttl,
            minimum_displacement_m: self.minimum_displacement.unwrap_or(fallback_displacement_m),
            origin: PolicyOrigin::Server,
            forced: false,
            recorded_at: Utc::now(),
        }
    }
}

pub struct HttpServerPolicySource {
    transport: Arc<dyn Transport>,
    headers: RequestHeaders,
    controls_path: String,
    fallback_displacement_m: f64,
}

impl HttpServerPolicySource {
    pub fn new(
        transport: Arc<dyn Transport>,
        headers: RequestHeaders,
        controls_path: impl Into<String>,
        fallback_displacement_m: f64,
    ) -> Self {
        Self {
            transport,
            headers,
            controls_path: controls_path.into().trim_end_matches('/').to_string(),
            fallback_displacement_m,
        }
    }

    pub fn path_for(&self, user_id: &str) -> String {
        format!("{}/{}", self.controls_path, user_id)
    }
}

#[async_trait]
impl ServerPolicySource for HttpServerPolicySource {
    async fn fetch_server_policy(&self, user_id: &str) -> Result<Option<ControlPolicy>, TransportError> {
        let response = self.transport.get(&self.path_for(user_id), &self.headers).await?;
        if response.status == 404 {
            debug!("[Controls] no server policy for {}", user_id);
            return Ok(None);
        }
        if !response.is_success() {
            return Err(TransportError::Request(format!("controls endpoint returned {}", response.status)));
        }
        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let dto: ServerControlsDto =
            serde_json::from_slice(&response.body).map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(Some(dto.into_policy(self.fallback_displacement_m)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::transport::TransportResponse;
    use parking_lot::Mutex;

    struct Canned {
        response: TransportResponse,
        paths: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Canned {
        async fn post(&self, _: &str, _: &[u8], _: &RequestHeaders) -> Result<TransportResponse, TransportError> {
            unreachable!("controls are only fetched")
        }

        async fn get(&self, path: &str, _: &RequestHeaders) -> Result<TransportResponse, TransportError> {
            self.paths.lock().push(path.to_string());
            Ok(self.response.clone())
        }
    }

    fn source(status: u16, body: &str) -> (HttpServerPolicySource, Arc<Canned>) {
        let canned = Arc::new(Canned {
            response: TransportResponse::new(status, body),
            paths: Mutex::new(Vec::new()),
        });
        let headers = RequestHeaders {
            auth_token: "t".into(),
            device_id: "d".into(),
            app_id: "a".into(),
            sdk_version: "0".into(),
            os_version: "0".into(),
            timezone: "UTC".into(),
        };
        (HttpServerPolicySource::new(canned.clone(), headers, "/controls/", 30.0), canned)
    }

    #[tokio::test]
    async fn parses_policy_body() {
        let (src, canned) = source(200, r#"{"batch_duration": 120, "batch_size": 25, "ttl": 3600}"#);
        let p = src.fetch_server_policy("user-7").await.unwrap().unwrap();
        assert_eq!(p.batch_interval_secs, 120);
        assert_eq!(p.batch_size, 25);
        assert_eq!(p.ttl_secs, 3600);
        assert_eq!(p.minimum_displacement_m, 30.0);
        assert_eq!(p.origin, PolicyOrigin::Server);
        assert_eq!(canned.paths.lock().as_slice(), ["/controls/user-7"]);
    }

    #[tokio::test]
    async fn not_found_and_empty_mean_no_policy() {
        let (src, _) = source(404, "");
        assert!(src.fetch_server_policy("u").await.unwrap().is_none());
        let (src, _) = source(200, "  ");
        assert!(src.fetch_server_policy("u").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn server_errors_and_garbage_are_errors() {
        let (src, _) = source(503, "");
        assert!(matches!(src.fetch_server_policy("u").await, Err(TransportError::Request(_))));
        let (src, _) = source(200, "{not json");
        assert!(matches!(src.fetch_server_policy("u").await, Err(TransportError::Decode(_))));
    }
}
