//! Startup configuration.
//!
//! Everything is read once from the environment before the server starts. Missing or invalid
//! required settings abort the startup.

use crate::publish::TopicName;
use crate::publish::credentials::{CredentialSources, WELL_KNOWN_FILE};
use crate::publish::token::DEFAULT_METADATA_HOST;
use anyhow::{Context, bail};
use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_API_TOKEN: &str = "API_TOKEN";
pub const ENV_PROJECT: &str = "GCLOUD_PROJECT";
pub const ENV_TOPIC: &str = "PUBSUB_TOPIC";
pub const ENV_PORT: &str = "PORT";
pub const ENV_BIND_ADDRESS: &str = "BIND_ADDRESS";
pub const ENV_PUBLISH_TIMEOUT: &str = "PUBLISH_TIMEOUT_SECONDS";
pub const ENV_EMULATOR_HOST: &str = "PUBSUB_EMULATOR_HOST";
pub const ENV_METADATA_HOST: &str = "GCE_METADATA_HOST";
pub const ENV_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
pub const ENV_GCLOUD_CONFIG: &str = "CLOUDSDK_CONFIG";
const ENV_HOME: &str = "HOME";

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_PUBLISH_TIMEOUT_SECONDS: u64 = 10;

/// The set of accepted API tokens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiTokens(Vec<String>);

impl ApiTokens {
    /// Parses a comma-separated token list. Empty entries are dropped so that an empty
    /// `api_token` can never be accepted.
    pub fn parse(tokens: &str) -> anyhow::Result<Self> {
        let tokens: Vec<String> = tokens
            .split(',')
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect();

        if tokens.is_empty() {
            bail!("At least one API token is required");
        }

        Ok(ApiTokens(tokens))
    }

    /// Exact match against any of the accepted tokens.
    pub fn accepts(&self, token: &str) -> bool {
        self.0.iter().any(|accepted| accepted == token)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub api_tokens: ApiTokens,
    pub topic: TopicName,
    pub bind_address: SocketAddr,
    pub publish_timeout: Duration,
    pub emulator_host: Option<String>,
    pub credentials: CredentialSources,
}

impl RelayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from the given variable lookup.
    ///
    /// Blank values are treated like missing ones.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let require = |key: &str| {
            lookup(key).with_context(|| format!("{} environment variable not set.", key))
        };

        let api_tokens = ApiTokens::parse(&require(ENV_API_TOKEN)?)
            .with_context(|| format!("Invalid {}", ENV_API_TOKEN))?;
        let topic = TopicName::new(require(ENV_PROJECT)?, require(ENV_TOPIC)?);

        let bind_address = match lookup(ENV_BIND_ADDRESS) {
            Some(address) => SocketAddr::from_str(&address)
                .with_context(|| format!("Failed to parse {}: {}", ENV_BIND_ADDRESS, address))?,
            None => {
                let port = parse_or(&lookup, ENV_PORT, DEFAULT_PORT)?;
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
            }
        };

        let publish_timeout = Duration::from_secs(parse_or(
            &lookup,
            ENV_PUBLISH_TIMEOUT,
            DEFAULT_PUBLISH_TIMEOUT_SECONDS,
        )?);
        if publish_timeout.is_zero() {
            bail!("{} must be greater than zero", ENV_PUBLISH_TIMEOUT);
        }

        Ok(RelayConfig {
            api_tokens,
            topic,
            bind_address,
            publish_timeout,
            emulator_host: lookup(ENV_EMULATOR_HOST),
            credentials: credential_sources(&lookup),
        })
    }
}

fn credential_sources(lookup: &impl Fn(&str) -> Option<String>) -> CredentialSources {
    let gcloud_dir = lookup(ENV_GCLOUD_CONFIG)
        .map(PathBuf::from)
        .or_else(|| lookup(ENV_HOME).map(|home| PathBuf::from(home).join(".config/gcloud")));

    CredentialSources {
        credentials_file: lookup(ENV_CREDENTIALS).map(PathBuf::from),
        well_known_file: gcloud_dir.map(|dir| dir.join(WELL_KNOWN_FILE)),
        metadata_host: lookup(ENV_METADATA_HOST)
            .unwrap_or_else(|| DEFAULT_METADATA_HOST.to_string()),
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Failed to parse {}: {}", key, value)),
        None => Ok(default),
    }
}
