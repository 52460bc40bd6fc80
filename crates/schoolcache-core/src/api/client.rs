//! API client for communicating with the school sync backend.
//!
//! Entities are addressed by alias:
//! `GET {base}/{kind}/by-alias/{provider}/{version}/{value}`.

use std::time::Duration;

use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::alias::Alias;
use crate::auth::SchoolCredentials;
use crate::error::FetchError;
use crate::models::RemoteEntity;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow school servers while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// API client for the sync backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let base_url = Url::parse(base_url)
            .map_err(|e| FetchError::InvalidResponse(format!("Invalid API base URL: {}", e)))?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// URL of the entity of `kind` known under `alias`.
    /// The alias value is a single, percent-encoded path segment.
    fn alias_url(&self, kind: &str, alias: &Alias) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidResponse("API base URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend([
                kind,
                "by-alias",
                alias.provider.as_str(),
                &alias.version.to_string(),
                &alias.value,
            ]);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: Url,
        credentials: Option<&SchoolCredentials>,
    ) -> Result<T, FetchError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self.client.get(url.clone());
            if let Some(credentials) = credentials {
                request = request.basic_auth(&credentials.username, Some(&credentials.password));
            }
            let response = request.send().await?;

            let status = response.status();
            if status.is_success() {
                return response.json().await.map_err(|e| {
                    FetchError::InvalidResponse(format!("Failed to parse JSON from {}: {}", url, e))
                });
            }

            if status.as_u16() == 429 {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(FetchError::RateLimited);
                }
                warn!(url = %url, retry = retries, backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status, &body));
        }
    }

    /// Download the entity of type `T` known under `alias`.
    pub async fn fetch_by_alias<T: RemoteEntity>(
        &self,
        alias: &Alias,
        credentials: &SchoolCredentials,
    ) -> Result<T, FetchError> {
        let url = self.alias_url(T::KIND, alias)?;
        debug!(kind = T::KIND, alias = %alias, "Downloading by alias");
        self.get(url, Some(credentials)).await
    }
}
