//! Outbound publishing of relayed log entries.
//!
//! The relay only depends on the [`Publisher`] capability: "send these bytes as one message to
//! this topic and tell me once it has been acknowledged". [`pubsub::PubSubPublisher`] implements
//! it against the Google Cloud Pub/Sub REST API.

use async_trait::async_trait;
use std::fmt::{Display, Formatter};

pub mod credentials;
pub mod pubsub;
pub mod token;

/// Identifier assigned by the topic to an acknowledged message.
pub type MessageId = String;

/// Address of a topic: `projects/{project}/topics/{topic}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicName {
    pub project: String,
    pub topic: String,
}

impl TopicName {
    pub fn new(project: impl Into<String>, topic: impl Into<String>) -> Self {
        TopicName {
            project: project.into(),
            topic: topic.into(),
        }
    }
}

impl Display for TopicName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "projects/{}/topics/{}", self.project, self.topic)
    }
}

/// Publishes opaque payloads to a topic.
///
/// Implementations must only return once the message has been acknowledged (or rejected) by
/// the topic.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &TopicName, payload: Vec<u8>) -> anyhow::Result<MessageId>;
}
