//! Access tokens for the Pub/Sub API.
//!
//! A [`TokenFetcher`] obtains a fresh token from one credential source (metadata server, service
//! account key, gcloud user credentials, see [`crate::publish::credentials`]).
//! [`CachedTokenSource`] keeps the last token until shortly before it expires.

use anyhow::Context;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use mock_instant::thread_local::SystemTime;
#[cfg(not(test))]
use std::time::SystemTime;

/// Default host of the metadata server.
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

/// Tokens are refreshed once they are closer than this to their expiry.
const REFRESH_MARGIN_SECONDS: u64 = 60;

/// Provides the bearer token presented to the Pub/Sub API.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns the token to present or `None` if requests are sent unauthenticated.
    async fn access_token(&self) -> anyhow::Result<Option<String>>;
}

/// Sends requests without credentials, as expected by the Pub/Sub emulator.
pub struct NoAuth;

#[async_trait]
impl TokenSource for NoAuth {
    async fn access_token(&self) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// A token as issued by a credential source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub lifetime: Duration,
}

/// The body returned by the metadata server and the OAuth token endpoint alike.
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

impl From<TokenResponse> for AccessToken {
    fn from(response: TokenResponse) -> Self {
        AccessToken {
            token: response.access_token,
            lifetime: Duration::from_secs(response.expires_in),
        }
    }
}

/// Obtains a fresh token from one credential source.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<AccessToken>;
}

struct CachedToken {
    token: AccessToken,
    fetched_at: SystemTime,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        SystemTime::now()
            .duration_since(self.fetched_at)
            .map(|age| age + Duration::from_secs(REFRESH_MARGIN_SECONDS) < self.token.lifetime)
            .unwrap_or(false)
    }
}

/// Caches the token of a [`TokenFetcher`] until it is about to expire.
pub struct CachedTokenSource {
    fetcher: Box<dyn TokenFetcher>,
    cached: ArcSwapOption<CachedToken>,
}

impl CachedTokenSource {
    pub fn new(fetcher: Box<dyn TokenFetcher>) -> Self {
        Self {
            fetcher,
            cached: ArcSwapOption::new(None),
        }
    }
}

#[async_trait]
impl TokenSource for CachedTokenSource {
    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    async fn access_token(&self) -> anyhow::Result<Option<String>> {
        if let Some(cached) = self.cached.load_full()
            && cached.is_fresh()
        {
            return Ok(Some(cached.token.token.clone()));
        }

        // Concurrent refreshes are harmless, the last one wins.
        let fetched_at = SystemTime::now();
        let token = self
            .fetcher
            .fetch()
            .await
            .inspect_err(|_| self.cached.store(None))?;
        tracing::debug!("Obtained a new access token valid for {:?}", token.lifetime);

        let fresh = Arc::new(CachedToken { token, fetched_at });
        self.cached.store(Some(fresh.clone()));

        Ok(Some(fresh.token.token.clone()))
    }
}

/// Fetches tokens of the default service account from the metadata server.
pub struct MetadataTokenFetcher {
    client: Client,
    url: String,
}

impl MetadataTokenFetcher {
    pub fn new(client: Client, metadata_host: &str) -> Self {
        Self {
            client,
            url: format!("http://{}{}", metadata_host, METADATA_TOKEN_PATH),
        }
    }
}

#[async_trait]
impl TokenFetcher for MetadataTokenFetcher {
    async fn fetch(&self) -> anyhow::Result<AccessToken> {
        let response = self
            .client
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .with_context(|| format!("Failed to reach metadata server at {}", self.url))?
            .error_for_status()
            .context("Metadata server refused to issue an access token")?;

        let token: TokenResponse = response
            .json()
            .await
            .context("Received an invalid access token response")?;

        Ok(token.into())
    }
}
