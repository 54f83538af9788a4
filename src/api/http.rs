use super::error::{decode_envelope, ApiError};
use super::RunsApi;
use crate::model::{ManualRunResult, RunListing};
use anyhow::{Context, Result};
use rand::RngCore;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use std::time::Duration;
use tracing::debug;

const REQUEST_ID_HEADER: &str = "X-Request-ID";
const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Connection settings for the runs backend.
#[derive(Debug, Clone)]
pub(crate) struct ClientSettings {
    pub base_url: String,
    pub cookie: Option<String>,
    pub timeout: Duration,
    pub user_agent: String,
}

/// `reqwest` implementation of [`RunsApi`] against `/api/v1/runs`.
pub(crate) struct HttpRunsClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRunsClient {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = settings.cookie.as_deref() {
            let value =
                HeaderValue::from_str(cookie).context("cookie is not a valid header value")?;
            headers.insert(COOKIE, value);
        }
        let http = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.timeout)
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = resp.status().as_u16();
        let request_id = resp
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?;
        debug!(status, request_id = request_id.as_deref(), bytes = body.len(), "runs api response");
        decode_envelope(status, request_id, &body)
    }
}

impl RunsApi for HttpRunsClient {
    async fn list_runs(&self, limit: usize) -> Result<RunListing, ApiError> {
        let resp = self
            .http
            .get(self.url("/runs"))
            .query(&[("limit", limit)])
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn trigger_manual_run(&self) -> Result<ManualRunResult, ApiError> {
        let key = gen_idempotency_key();
        debug!(idempotency_key = %key, "triggering manual run");
        let resp = self
            .http
            .post(self.url("/runs/manual"))
            .header(IDEMPOTENCY_KEY_HEADER, key)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        Self::decode(resp).await
    }
}

/// Generate a random idempotency key for one submission.
fn gen_idempotency_key() -> String {
    let mut b = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut b);
    b.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_keys_are_hex_and_distinct() {
        let a = gen_idempotency_key();
        let b = gen_idempotency_key();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        let client = HttpRunsClient::new(&ClientSettings {
            base_url: "http://localhost:8000/".into(),
            cookie: Some("session=abc".into()),
            timeout: Duration::from_secs(5),
            user_agent: "scholar-runs/test".into(),
        })
        .unwrap();
        assert_eq!(client.url("/runs"), "http://localhost:8000/api/v1/runs");
    }
}
