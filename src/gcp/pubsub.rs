//! Pub/Sub JSON-API client.
//!
//! The Kinesis and SQS surfaces translate onto four verbs: publish to a
//! topic, pull from a subscription, acknowledge, and topic lifecycle.
//! Message payloads are base64 on the wire; this client works in raw
//! bytes and does the encoding at the boundary.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::auth::TokenProvider;
use crate::errors::SidecarError;

/// Pub/Sub JSON API base URL.
const PUBSUB_API_BASE: &str = "https://pubsub.googleapis.com/v1";

// -- Resource types ----------------------------------------------------------

/// An outgoing message: payload plus string attributes.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    /// Base64-encoded payload.
    pub data: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

impl OutgoingMessage {
    pub fn new(payload: &[u8], attributes: HashMap<String, String>) -> Self {
        Self {
            data: BASE64.encode(payload),
            attributes,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PulledMessage {
    pub ack_id: String,
    pub message: InnerMessage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InnerMessage {
    pub data: Option<String>,
    pub attributes: HashMap<String, String>,
    pub message_id: String,
}

impl InnerMessage {
    /// Decode the base64 payload; empty when absent.
    pub fn payload(&self) -> Result<Vec<u8>, SidecarError> {
        match &self.data {
            Some(data) => BASE64
                .decode(data)
                .map_err(|e| SidecarError::UpstreamFatal(format!("bad message payload: {e}"))),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TopicMeta {
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PublishResponse {
    message_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PullResponse {
    received_messages: Vec<PulledMessage>,
}

// -- Client ------------------------------------------------------------------

/// Pub/Sub client bound to one tenant's project and credentials.
pub struct PubSubClient {
    http: reqwest::Client,
    auth: Arc<TokenProvider>,
    project: String,
}

impl PubSubClient {
    pub fn new(http: reqwest::Client, auth: Arc<TokenProvider>, project: String) -> Self {
        Self { http, auth, project }
    }

    /// Fully qualified topic resource name.
    pub fn topic_path(&self, topic: &str) -> String {
        format!("projects/{}/topics/{}", self.project, topic)
    }

    /// Fully qualified subscription resource name.
    pub fn subscription_path(&self, subscription: &str) -> String {
        format!("projects/{}/subscriptions/{}", self.project, subscription)
    }

    async fn auth_headers(&self) -> Result<HeaderMap, SidecarError> {
        let token = self.auth.token().await?;
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SidecarError::UpstreamAuth(format!("invalid token value: {e}")))?,
        );
        Ok(headers)
    }

    async fn check(context: &str, resp: reqwest::Response) -> Result<reqwest::Response, SidecarError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(SidecarError::from_gcp_status(context, status, &body))
    }

    fn transport(context: &str, err: reqwest::Error) -> SidecarError {
        SidecarError::UpstreamTransient(format!("Pub/Sub {context}: {err}"))
    }

    /// Publish messages to a topic, returning the assigned message ids.
    pub async fn publish(
        &self,
        topic: &str,
        messages: &[OutgoingMessage],
    ) -> Result<Vec<String>, SidecarError> {
        let auth = self.auth_headers().await?;
        let url = format!("{}/{}:publish", PUBSUB_API_BASE, self.topic_path(topic));

        debug!("Pub/Sub publish: topic={topic} messages={}", messages.len());

        let resp = self
            .http
            .post(&url)
            .headers(auth)
            .json(&serde_json::json!({ "messages": messages }))
            .send()
            .await
            .map_err(|e| Self::transport("publish", e))?;
        let resp = Self::check(topic, resp).await?;
        let parsed: PublishResponse = resp
            .json()
            .await
            .map_err(|e| SidecarError::UpstreamFatal(format!("publish decode: {e}")))?;
        Ok(parsed.message_ids)
    }

    /// Create a topic.  Already-exists is surfaced as `UpstreamFatal`
    /// (HTTP 409), matching what the Kinesis surface reports.
    pub async fn create_topic(&self, topic: &str) -> Result<(), SidecarError> {
        let auth = self.auth_headers().await?;
        let url = format!("{}/{}", PUBSUB_API_BASE, self.topic_path(topic));

        debug!("Pub/Sub create_topic: {topic}");

        let resp = self
            .http
            .put(&url)
            .headers(auth)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| Self::transport("create_topic", e))?;
        Self::check(topic, resp).await.map(|_| ())
    }

    /// Delete a topic.
    pub async fn delete_topic(&self, topic: &str) -> Result<(), SidecarError> {
        let auth = self.auth_headers().await?;
        let url = format!("{}/{}", PUBSUB_API_BASE, self.topic_path(topic));

        debug!("Pub/Sub delete_topic: {topic}");

        let resp = self
            .http
            .delete(&url)
            .headers(auth)
            .send()
            .await
            .map_err(|e| Self::transport("delete_topic", e))?;
        Self::check(topic, resp).await.map(|_| ())
    }

    /// Fetch topic metadata.
    pub async fn get_topic(&self, topic: &str) -> Result<TopicMeta, SidecarError> {
        let auth = self.auth_headers().await?;
        let url = format!("{}/{}", PUBSUB_API_BASE, self.topic_path(topic));

        let resp = self
            .http
            .get(&url)
            .headers(auth)
            .send()
            .await
            .map_err(|e| Self::transport("get_topic", e))?;
        let resp = Self::check(topic, resp).await?;
        resp.json()
            .await
            .map_err(|e| SidecarError::UpstreamFatal(format!("get_topic decode: {e}")))
    }

    /// Pull up to `max_messages` from a subscription without blocking.
    pub async fn pull(
        &self,
        subscription: &str,
        max_messages: u32,
    ) -> Result<Vec<PulledMessage>, SidecarError> {
        let auth = self.auth_headers().await?;
        let url = format!(
            "{}/{}:pull",
            PUBSUB_API_BASE,
            self.subscription_path(subscription)
        );

        debug!("Pub/Sub pull: subscription={subscription} max={max_messages}");

        let resp = self
            .http
            .post(&url)
            .headers(auth)
            .json(&serde_json::json!({
                "maxMessages": max_messages,
                "returnImmediately": true,
            }))
            .send()
            .await
            .map_err(|e| Self::transport("pull", e))?;
        let resp = Self::check(subscription, resp).await?;
        let parsed: PullResponse = resp
            .json()
            .await
            .map_err(|e| SidecarError::UpstreamFatal(format!("pull decode: {e}")))?;
        Ok(parsed.received_messages)
    }

    /// Acknowledge pulled messages.
    pub async fn acknowledge(
        &self,
        subscription: &str,
        ack_ids: &[String],
    ) -> Result<(), SidecarError> {
        let auth = self.auth_headers().await?;
        let url = format!(
            "{}/{}:acknowledge",
            PUBSUB_API_BASE,
            self.subscription_path(subscription)
        );

        debug!("Pub/Sub acknowledge: subscription={subscription} acks={}", ack_ids.len());

        let resp = self
            .http
            .post(&url)
            .headers(auth)
            .json(&serde_json::json!({ "ackIds": ack_ids }))
            .send()
            .await
            .map_err(|e| Self::transport("acknowledge", e))?;
        Self::check(subscription, resp).await.map(|_| ())
    }

    /// Extend or shrink the ack deadline of pulled messages; the SQS
    /// surface maps `VisibilityTimeout` onto this.
    pub async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[String],
        seconds: u32,
    ) -> Result<(), SidecarError> {
        let auth = self.auth_headers().await?;
        let url = format!(
            "{}/{}:modifyAckDeadline",
            PUBSUB_API_BASE,
            self.subscription_path(subscription)
        );

        let resp = self
            .http
            .post(&url)
            .headers(auth)
            .json(&serde_json::json!({
                "ackIds": ack_ids,
                "ackDeadlineSeconds": seconds,
            }))
            .send()
            .await
            .map_err(|e| Self::transport("modify_ack_deadline", e))?;
        Self::check(subscription, resp).await.map(|_| ())
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_paths() {
        let client = PubSubClient::new(
            reqwest::Client::new(),
            Arc::new(TokenProvider::from_dest(
                &crate::config::DestGcp {
                    key_file_path: None,
                    raw_key: None,
                    from_instance_metadata: true,
                    project: "demo".into(),
                    instance: None,
                    multipart_db_directory: None,
                    shard_count: 1,
                    topic_rename: Default::default(),
                    kms_key_name: None,
                },
                reqwest::Client::new(),
            )),
            "demo".into(),
        );
        assert_eq!(client.topic_path("s1"), "projects/demo/topics/s1");
        assert_eq!(
            client.subscription_path("q1"),
            "projects/demo/subscriptions/q1"
        );
    }

    #[test]
    fn test_outgoing_message_encodes_base64() {
        let msg = OutgoingMessage::new(b"hello", HashMap::new());
        assert_eq!(msg.data, "aGVsbG8=");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("attributes").is_none());
    }

    #[test]
    fn test_pull_response_decode() {
        let body = r#"{
            "receivedMessages": [
                {"ackId": "a-1", "message": {"data": "aGVsbG8=", "messageId": "m-1",
                 "attributes": {"partitionKey": "p"}}}
            ]
        }"#;
        let parsed: PullResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.received_messages.len(), 1);
        let msg = &parsed.received_messages[0];
        assert_eq!(msg.ack_id, "a-1");
        assert_eq!(msg.message.payload().unwrap(), b"hello");
        assert_eq!(msg.message.attributes["partitionKey"], "p");
    }

    #[test]
    fn test_payload_empty_when_absent() {
        let inner = InnerMessage::default();
        assert!(inner.payload().unwrap().is_empty());
    }
}
