//! Google Cloud Pub/Sub publisher using the REST API.
//!
//! Every call publishes exactly one message:
//!
//! ```text
//! POST {endpoint}/v1/projects/{project}/topics/{topic}:publish
//! {"messages": [{"data": "<base64 payload>"}]}
//! ```

use crate::publish::credentials::{CredentialSources, resolve_fetcher};
use crate::publish::token::{CachedTokenSource, NoAuth, TokenSource};
use crate::publish::{MessageId, Publisher, TopicName};
use anyhow::{Context, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Public endpoint of the Pub/Sub API.
pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";

#[derive(Serialize)]
struct PublishRequest {
    messages: Vec<PubsubMessage>,
}

#[derive(Serialize)]
struct PubsubMessage {
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<MessageId>,
}

pub struct PubSubPublisher {
    client: Client,
    endpoint: String,
    tokens: Box<dyn TokenSource>,
}

impl PubSubPublisher {
    pub fn new(client: Client, endpoint: impl Into<String>, tokens: Box<dyn TokenSource>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Creates a publisher for the real service, authenticated with the first credentials found
    /// in `credentials`, or for the emulator at `emulator_host` without authentication.
    ///
    /// `timeout` bounds every outbound call, including token fetches.
    #[tracing::instrument(level = "debug", err(Display))]
    pub fn connect(
        emulator_host: Option<&str>,
        credentials: &CredentialSources,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client for Pub/Sub")?;

        match emulator_host {
            Some(host) => {
                tracing::info!("Publishing to the Pub/Sub emulator at {}", host);
                Ok(Self::new(client, format!("http://{}", host), Box::new(NoAuth)))
            }
            None => {
                let fetcher = resolve_fetcher(client.clone(), credentials)?;
                let tokens = CachedTokenSource::new(fetcher);
                Ok(Self::new(client, DEFAULT_ENDPOINT, Box::new(tokens)))
            }
        }
    }
}

#[async_trait]
impl Publisher for PubSubPublisher {
    #[tracing::instrument(level = "debug", skip(self, payload), fields(size = payload.len()))]
    async fn publish(&self, topic: &TopicName, payload: Vec<u8>) -> anyhow::Result<MessageId> {
        let token = self
            .tokens
            .access_token()
            .await
            .context("Failed to obtain Pub/Sub credentials")?;

        let request = PublishRequest {
            messages: vec![PubsubMessage {
                data: BASE64_STANDARD.encode(payload),
            }],
        };

        let mut call = self
            .client
            .post(format!("{}/v1/{}:publish", self.endpoint, topic))
            .json(&request);
        if let Some(token) = token {
            call = call.bearer_auth(token);
        }

        let response = call
            .send()
            .await
            .with_context(|| format!("Failed to reach Pub/Sub topic {}", topic))?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            bail!("Pub/Sub responded with {}: {}", status, details.trim());
        }

        let response: PublishResponse = response
            .json()
            .await
            .context("Received an invalid publish response")?;

        response
            .message_ids
            .into_iter()
            .next()
            .context("Pub/Sub did not acknowledge the message")
    }
}
