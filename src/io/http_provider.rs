//! HTTP data provider
//!
//! Talks to the attendance service:
//! - `GET {base}/attendance/changes?date=..&tenant=..[&version=..]` -> `{changed, version}`
//! - `GET {base}/attendance/day?date=..&tenant=..` -> `{records, zones}`
//!
//! Bodies are read as bytes and decoded with serde_json so a malformed body
//! surfaces as [`FetchError::Decode`] rather than a transport error.

use crate::domain::error::FetchError;
use crate::domain::raw::{ChangeProbe, DayPayload};
use crate::domain::types::{SubscriptionKey, VersionToken};
use crate::infra::config::Config;
use crate::io::provider::PresenceProvider;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Longest error body kept in [`FetchError::Status`]
const MAX_ERROR_BODY: usize = 512;

pub struct HttpProvider {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { base_url, auth_token, client })
    }

    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        Self::new(
            config.provider_base_url(),
            config.provider_auth_token().map(str::to_string),
            Duration::from_millis(config.fetch_timeout_ms()),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(&url).query(query);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let body: Bytes = response.bytes().await?;

        if !status.is_success() {
            let text: String = String::from_utf8_lossy(&body).chars().take(MAX_ERROR_BODY).collect();
            return Err(FetchError::Status { status: status.as_u16(), body: text });
        }

        debug!(url = %url, bytes = body.len(), "provider_response");
        Ok(serde_json::from_slice(&body)?)
    }
}

fn key_query(key: &SubscriptionKey) -> Vec<(&'static str, String)> {
    vec![("date", key.date.format("%Y-%m-%d").to_string()), ("tenant", key.tenant.0.clone())]
}

#[async_trait]
impl PresenceProvider for HttpProvider {
    async fn changed_since(
        &self,
        key: &SubscriptionKey,
        last: Option<&VersionToken>,
    ) -> Result<ChangeProbe, FetchError> {
        let mut query = key_query(key);
        if let Some(version) = last {
            query.push(("version", version.0.clone()));
        }
        self.get_json("/attendance/changes", &query).await
    }

    async fn fetch_day(&self, key: &SubscriptionKey) -> Result<DayPayload, FetchError> {
        self.get_json("/attendance/day", &key_query(key)).await
    }
}
