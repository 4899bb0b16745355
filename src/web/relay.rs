//! The relay route: accepts a batch of log entries and publishes each of them as one message.
//!
//! ```text
//! POST /
//! {"api_token": "secret", "logs": [{"type": "click", "attributes": {"x": 1}}]}
//! ```
//!
//! Entries are published one after another in input order, each publish being awaited before
//! the next one starts. The first failure stops the batch; entries published before it stay
//! published.

use crate::config::ApiTokens;
use crate::publish::{Publisher, TopicName};
use crate::status_bail;
use crate::web::error::ResultExt;
use crate::web::warp::{into_response, optional_content_length, read_limited_body, with_cloneable};
use crate::web::{Envelope, MAX_BODY_SIZE};
use anyhow::Context;
use bytes::Buf;
use futures_util::Stream;
use serde::de::{self, IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::http::{Method, StatusCode};
use warp::reply::Response;
use warp::{Filter, Rejection};

/// The body expected by the relay.
///
/// Decoding is lenient in the same way the clients of the relay have always relied on: keys match
/// case-insensitively, the last occurrence of a duplicate key wins, unknown keys are ignored and
/// `null` leaves a string field untouched.
#[derive(Clone, Debug, Default)]
pub struct RelayRequest {
    pub api_token: String,
    pub logs: Vec<LogEntry>,
}

/// A single log entry. The attributes are passed through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: Value,
}

impl<'de> Deserialize<'de> for RelayRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RequestVisitor;

        impl<'de> Visitor<'de> for RequestVisitor {
            type Value = RelayRequest;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a relay request object")
            }

            fn visit_unit<E: de::Error>(self) -> Result<RelayRequest, E> {
                Ok(RelayRequest::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<RelayRequest, A::Error> {
                let mut request = RelayRequest::default();
                while let Some(key) = map.next_key::<String>()? {
                    if key.eq_ignore_ascii_case("api_token") {
                        if let Some(token) = map.next_value::<Option<String>>()? {
                            request.api_token = token;
                        }
                    } else if key.eq_ignore_ascii_case("logs") {
                        request.logs = map
                            .next_value::<Option<Vec<LogEntry>>>()?
                            .unwrap_or_default();
                    } else {
                        map.next_value::<IgnoredAny>()?;
                    }
                }

                Ok(request)
            }
        }

        deserializer.deserialize_any(RequestVisitor)
    }
}

impl<'de> Deserialize<'de> for LogEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = LogEntry;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a log entry object")
            }

            fn visit_unit<E: de::Error>(self) -> Result<LogEntry, E> {
                Ok(LogEntry::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<LogEntry, A::Error> {
                let mut entry = LogEntry::default();
                while let Some(key) = map.next_key::<String>()? {
                    if key.eq_ignore_ascii_case("type") {
                        if let Some(kind) = map.next_value::<Option<String>>()? {
                            entry.kind = kind;
                        }
                    } else if key.eq_ignore_ascii_case("attributes") {
                        entry.attributes = map.next_value()?;
                    } else {
                        map.next_value::<IgnoredAny>()?;
                    }
                }

                Ok(entry)
            }
        }

        deserializer.deserialize_any(EntryVisitor)
    }
}

/// Everything a relay invocation needs. Immutable once built.
pub struct Relay {
    tokens: ApiTokens,
    topic: TopicName,
    publisher: Arc<dyn Publisher>,
}

impl Relay {
    pub fn new(tokens: ApiTokens, topic: TopicName, publisher: Arc<dyn Publisher>) -> Self {
        Relay {
            tokens,
            topic,
            publisher,
        }
    }

    /// Handles one request and returns the number of published entries.
    pub async fn relay<B, E>(
        &self,
        method: Method,
        content_length: Option<u64>,
        body: impl Stream<Item = Result<B, E>>,
    ) -> anyhow::Result<usize>
    where
        B: Buf,
        E: Into<anyhow::Error>,
    {
        if method != Method::POST {
            status_bail!(StatusCode::NOT_FOUND, "only POST method method was accepted");
        }

        let body = read_limited_body(body, content_length, MAX_BODY_SIZE).await?;
        let request = serde_json::from_slice::<RelayRequest>(&body)
            .inspect_err(|err| tracing::error!("Failed to parse relay request: {}", err))
            .mark_client_error()?;

        if !self.tokens.accepts(&request.api_token) {
            status_bail!(StatusCode::UNAUTHORIZED, "invalid api token.");
        }

        for entry in &request.logs {
            self.publish_entry(entry).await?;
        }

        Ok(request.logs.len())
    }

    async fn publish_entry(&self, entry: &LogEntry) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(entry)
            .inspect_err(|err| tracing::error!("Failed to serialize log entry: {}", err))
            .mark_client_error()?;

        tracing::debug!("publish data = {}", String::from_utf8_lossy(&payload));

        let message_id = self
            .publisher
            .publish(&self.topic, payload)
            .await
            .context("Could not publish message")
            .inspect_err(|err| tracing::error!("{:#}", err))
            .with_status(StatusCode::INTERNAL_SERVER_ERROR)?;

        tracing::trace!("Published message {} to {}", message_id, self.topic);
        Ok(())
    }
}

/// Serves the relay on every path; the method is checked by the handler itself.
pub fn relay_route(relay: Arc<Relay>) -> BoxedFilter<(Response,)> {
    warp::method()
        .and(optional_content_length())
        .and(warp::body::stream())
        .and(with_cloneable(relay))
        .and_then(handle_relay)
        .boxed()
}

#[tracing::instrument(level = "debug", name = "relay", skip_all)]
async fn handle_relay(
    method: Method,
    content_length: Option<u64>,
    body: impl Stream<Item = Result<impl Buf, warp::Error>> + Send,
    relay: Arc<Relay>,
) -> Result<Response, Rejection> {
    let result = relay.relay(method, content_length, body).await;
    if let Ok(published) = &result {
        tracing::info!("Published {} log entries", published);
    }

    into_response(result.map(|_| Envelope::ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::MessageId;
    use crate::web::warp::handle_rejection;
    use anyhow::bail;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use warp::Reply;

    /// Records every payload; fails the publish with the given 1-based index.
    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(TopicName, Vec<u8>)>>,
        fail_at: Option<usize>,
    }

    impl RecordingPublisher {
        fn failing_at(index: usize) -> Self {
            RecordingPublisher {
                fail_at: Some(index),
                ..Default::default()
            }
        }

        fn attempts(&self) -> Vec<Value> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &TopicName, payload: Vec<u8>) -> anyhow::Result<MessageId> {
            let mut published = self.published.lock().unwrap();
            published.push((topic.clone(), payload));
            if Some(published.len()) == self.fail_at {
                bail!("topic unavailable");
            }

            Ok(published.len().to_string())
        }
    }

    fn route(publisher: Arc<RecordingPublisher>) -> BoxedFilter<(impl Reply,)> {
        let relay = Relay::new(
            ApiTokens::parse("alpha,beta").unwrap(),
            TopicName::new("my-project", "logs"),
            publisher,
        );
        relay_route(Arc::new(relay))
            .recover(handle_rejection)
            .boxed()
    }

    async fn post(
        publisher: &Arc<RecordingPublisher>,
        body: impl Into<bytes::Bytes>,
    ) -> (StatusCode, Value) {
        send(publisher, "POST", body).await
    }

    async fn send(
        publisher: &Arc<RecordingPublisher>,
        method: &str,
        body: impl Into<bytes::Bytes>,
    ) -> (StatusCode, Value) {
        let body: bytes::Bytes = body.into();
        let response = warp::test::request()
            .method(method)
            .path("/")
            .body(body)
            .reply(&route(publisher.clone()))
            .await;

        assert_eq!(
            response.headers()["content-type"],
            "application/json",
            "every response is JSON"
        );
        (
            response.status(),
            serde_json::from_slice(response.body()).unwrap(),
        )
    }

    fn batch(token: &str, logs: Value) -> String {
        json!({"api_token": token, "logs": logs}).to_string()
    }

    #[tokio::test]
    async fn non_post_methods_are_not_found() {
        for method in ["GET", "PUT", "DELETE", "PATCH"] {
            let publisher = Arc::new(RecordingPublisher::default());
            let (status, body) = send(&publisher, method, batch("alpha", json!([]))).await;

            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(
                body,
                json!({"success": false, "message": "only POST method method was accepted"})
            );
            assert!(publisher.attempts().is_empty());
        }
    }

    #[tokio::test]
    async fn oversized_payloads_are_rejected() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut body = batch("alpha", json!([{"type": "a", "attributes": {}}]));
        body.push_str(&" ".repeat(MAX_BODY_SIZE as usize + 1 - body.len()));

        let (status, body) = post(&publisher, body).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({"success": false, "message": "Request payload size exceeded 64KB."})
        );
        assert!(publisher.attempts().is_empty());
    }

    #[tokio::test]
    async fn payload_of_exactly_the_limit_is_accepted() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut body = batch("alpha", json!([{"type": "a", "attributes": {}}]));
        body.push_str(&" ".repeat(MAX_BODY_SIZE as usize - body.len()));

        let (status, _) = post(&publisher, body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(publisher.attempts().len(), 1);
    }

    #[tokio::test]
    async fn malformed_json_is_a_client_error() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (status, body) = post(&publisher, r#"{"api_token": "alpha", "logs": ["#).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], json!(false));
        assert!(body["message"].as_str().unwrap().contains("EOF"));
        assert!(publisher.attempts().is_empty());
    }

    #[tokio::test]
    async fn unknown_tokens_are_unauthorized() {
        for token in ["gamma", "", "alpha,beta", "ALPHA"] {
            let publisher = Arc::new(RecordingPublisher::default());
            let logs = json!([{"type": "a", "attributes": 1}]);
            let (status, body) = post(&publisher, batch(token, logs)).await;

            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(
                body,
                json!({"success": false, "message": "invalid api token."})
            );
            assert!(publisher.attempts().is_empty());
        }
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (status, _) = post(&publisher, r#"{"logs": []}"#).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn empty_batch_succeeds_without_publishing() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (status, body) = post(&publisher, batch("beta", json!([]))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "message": "ok"}));
        assert!(publisher.attempts().is_empty());
    }

    #[tokio::test]
    async fn missing_or_null_logs_count_as_empty() {
        let publisher = Arc::new(RecordingPublisher::default());

        let (status, _) = post(&publisher, r#"{"api_token": "alpha"}"#).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = post(&publisher, r#"{"api_token": "alpha", "logs": null}"#).await;
        assert_eq!(status, StatusCode::OK);

        assert!(publisher.attempts().is_empty());
    }

    #[tokio::test]
    async fn entries_are_published_in_order() {
        let publisher = Arc::new(RecordingPublisher::default());
        let logs = json!([
            {"type": "click", "attributes": {"x": 1, "y": [1, 2]}},
            {"type": "view", "attributes": "home"},
            {"type": "error", "attributes": null},
        ]);

        let (status, body) = post(&publisher, batch("alpha", logs.clone())).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "message": "ok"}));
        assert_eq!(publisher.attempts(), logs.as_array().unwrap().clone());

        let published = publisher.published.lock().unwrap();
        assert!(
            published
                .iter()
                .all(|(topic, _)| topic.to_string() == "projects/my-project/topics/logs")
        );
    }

    #[tokio::test]
    async fn published_payload_has_type_then_attributes() {
        let publisher = Arc::new(RecordingPublisher::default());
        let body = r#"{"api_token":"alpha","logs":[{"attributes":{"b":2,"a":1.50},"type":"t","extra":true}]}"#;

        let (status, _) = post(&publisher, body).await;

        assert_eq!(status, StatusCode::OK);
        let published = publisher.published.lock().unwrap();
        assert_eq!(
            String::from_utf8(published[0].1.clone()).unwrap(),
            r#"{"type":"t","attributes":{"a":1.50,"b":2}}"#
        );
    }

    #[tokio::test]
    async fn missing_entry_fields_are_defaulted() {
        let publisher = Arc::new(RecordingPublisher::default());

        let (status, _) = post(&publisher, batch("alpha", json!([{}]))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            publisher.attempts(),
            vec![json!({"type": "", "attributes": null})]
        );
    }

    #[tokio::test]
    async fn keys_match_case_insensitively() {
        let publisher = Arc::new(RecordingPublisher::default());
        let body = r#"{"API_TOKEN":"alpha","Logs":[{"Type":"t","ATTRIBUTES":{"k":"v"}}]}"#;

        let (status, _) = post(&publisher, body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            publisher.attempts(),
            vec![json!({"type": "t", "attributes": {"k": "v"}})]
        );
    }

    #[tokio::test]
    async fn last_duplicate_key_wins() {
        let publisher = Arc::new(RecordingPublisher::default());
        let body = r#"{"api_token":"x","api_token":"alpha","logs":[{"type":"a","type":"b"}]}"#;

        let (status, _) = post(&publisher, body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            publisher.attempts(),
            vec![json!({"type": "b", "attributes": null})]
        );

        let body = r#"{"api_token":"alpha","api_token":"x","logs":[]}"#;
        let (status, _) = post(&publisher, body).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn null_keeps_earlier_string_values() {
        let publisher = Arc::new(RecordingPublisher::default());
        let body = r#"{"api_token":"alpha","api_token":null,"logs":[{"type":"t","type":null,"attributes":1,"attributes":null}]}"#;

        let (status, _) = post(&publisher, body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            publisher.attempts(),
            vec![json!({"type": "t", "attributes": null})]
        );
    }

    #[tokio::test]
    async fn null_request_and_entries_decode_as_empty() {
        let publisher = Arc::new(RecordingPublisher::default());

        let (status, _) = post(&publisher, "null").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = post(&publisher, batch("alpha", json!([null]))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            publisher.attempts(),
            vec![json!({"type": "", "attributes": null})]
        );

        let (status, _) = post(&publisher, batch("alpha", json!(["entry"]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn publish_failure_stops_the_batch() {
        let publisher = Arc::new(RecordingPublisher::failing_at(2));
        let logs = json!([
            {"type": "first", "attributes": 1},
            {"type": "second", "attributes": 2},
            {"type": "third", "attributes": 3},
        ]);

        let (status, body) = post(&publisher, batch("alpha", logs)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body,
            json!({"success": false, "message": "Could not publish message: topic unavailable"})
        );
        assert_eq!(
            publisher.attempts(),
            vec![
                json!({"type": "first", "attributes": 1}),
                json!({"type": "second", "attributes": 2}),
            ]
        );
    }

    #[tokio::test]
    async fn relay_reports_published_count() {
        let publisher = Arc::new(RecordingPublisher::default());
        let relay = Relay::new(
            ApiTokens::parse("alpha").unwrap(),
            TopicName::new("p", "t"),
            publisher.clone(),
        );
        let body = batch("alpha", json!([{"type": "a"}, {"type": "b"}]));
        let chunks = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(bytes::Bytes::from(
            body,
        ))]);

        let published = relay.relay(Method::POST, None, chunks).await.unwrap();

        assert_eq!(published, 2);
        assert_eq!(publisher.attempts().len(), 2);
    }
}
