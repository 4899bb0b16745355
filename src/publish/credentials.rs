//! Application Default Credentials.
//!
//! Credentials are looked up in this order:
//!
//! 1. the JSON key file named by `GOOGLE_APPLICATION_CREDENTIALS` (service account or
//!    `gcloud` user credentials),
//! 2. the well-known file written by `gcloud auth application-default login`,
//! 3. the metadata server of the GCE/Cloud Run instance.
//!
//! A file that is configured explicitly but cannot be used aborts the startup.

use crate::publish::token::{AccessToken, MetadataTokenFetcher, TokenFetcher, TokenResponse};
use anyhow::{Context, bail};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// OAuth scope granting access to Pub/Sub.
pub const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";

/// Token endpoint used when a credentials file does not name one.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Name of the file `gcloud` stores user credentials in.
pub const WELL_KNOWN_FILE: &str = "application_default_credentials.json";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECONDS: u64 = 3600;

/// Where to look for credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialSources {
    /// Explicitly configured key file.
    pub credentials_file: Option<PathBuf>,
    /// `gcloud` user credentials, used only if the file exists.
    pub well_known_file: Option<PathBuf>,
    pub metadata_host: String,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialsFile {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

#[derive(Deserialize)]
struct AuthorizedUser {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// Picks the first available credential source.
pub fn resolve_fetcher(
    client: Client,
    sources: &CredentialSources,
) -> anyhow::Result<Box<dyn TokenFetcher>> {
    if let Some(path) = &sources.credentials_file {
        return load_credentials_file(client, path)
            .with_context(|| format!("Failed to load credentials from {}", path.display()));
    }

    if let Some(path) = sources.well_known_file.as_ref().filter(|path| path.is_file()) {
        return load_credentials_file(client, path).with_context(|| {
            format!("Failed to load gcloud credentials from {}", path.display())
        });
    }

    tracing::info!(
        "Using the metadata server at {} for credentials",
        sources.metadata_host
    );
    Ok(Box::new(MetadataTokenFetcher::new(
        client,
        &sources.metadata_host,
    )))
}

fn load_credentials_file(client: Client, path: &Path) -> anyhow::Result<Box<dyn TokenFetcher>> {
    let data = std::fs::read(path).context("Cannot read file")?;
    let credentials: CredentialsFile =
        serde_json::from_slice(&data).context("Not a supported credentials file")?;

    match credentials {
        CredentialsFile::ServiceAccount(key) => {
            tracing::info!("Using service account {} for credentials", key.client_email);
            Ok(Box::new(ServiceAccountFetcher::new(client, key)?))
        }
        CredentialsFile::AuthorizedUser(user) => {
            tracing::info!("Using gcloud user credentials from {}", path.display());
            Ok(Box::new(AuthorizedUserFetcher { client, user }))
        }
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

/// Exchanges a signed JWT assertion for an access token.
pub struct ServiceAccountFetcher {
    client: Client,
    client_email: String,
    key_id: Option<String>,
    token_uri: String,
    key: EncodingKey,
}

impl ServiceAccountFetcher {
    fn new(client: Client, key: ServiceAccountKey) -> anyhow::Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("Invalid private key")?;

        Ok(Self {
            client,
            client_email: key.client_email,
            key_id: key.private_key_id,
            token_uri: key.token_uri,
            key: encoding_key,
        })
    }

    fn assertion(&self) -> anyhow::Result<String> {
        let iat = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: PUBSUB_SCOPE,
            aud: &self.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECONDS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();

        encode(&header, &claims, &self.key).context("Failed to sign token assertion")
    }
}

#[async_trait]
impl TokenFetcher for ServiceAccountFetcher {
    async fn fetch(&self) -> anyhow::Result<AccessToken> {
        let assertion = self.assertion()?;
        request_token(
            &self.client,
            &self.token_uri,
            &[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)],
        )
        .await
    }
}

/// Refreshes `gcloud` user credentials.
pub struct AuthorizedUserFetcher {
    client: Client,
    user: AuthorizedUser,
}

#[async_trait]
impl TokenFetcher for AuthorizedUserFetcher {
    async fn fetch(&self) -> anyhow::Result<AccessToken> {
        request_token(
            &self.client,
            &self.user.token_uri,
            &[
                ("grant_type", "refresh_token"),
                ("client_id", &self.user.client_id),
                ("client_secret", &self.user.client_secret),
                ("refresh_token", &self.user.refresh_token),
            ],
        )
        .await
    }
}

async fn request_token(
    client: &Client,
    token_uri: &str,
    form: &[(&str, &str)],
) -> anyhow::Result<AccessToken> {
    let response = client
        .post(token_uri)
        .form(form)
        .send()
        .await
        .with_context(|| format!("Failed to reach token endpoint at {}", token_uri))?;

    let status = response.status();
    if !status.is_success() {
        let details = response.text().await.unwrap_or_default();
        bail!("Token endpoint responded with {}: {}", status, details.trim());
    }

    let token: TokenResponse = response
        .json()
        .await
        .context("Received an invalid access token response")?;

    Ok(token.into())
}
