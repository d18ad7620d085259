//! Kinesis protocol surface, translated onto Pub/Sub.
//!
//! The wire surface is a single `POST /` whose `X-Amz-Target` header
//! names the operation; bodies are `x-amz-json-1.1`.  A stream maps to
//! the Pub/Sub topic of the same (optionally renamed) name.  Sequence
//! numbers are fabricated from Pub/Sub message ids; shard ids are a
//! stable hash of the partition key into the configured shard count.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::config::TenantConfig;
use crate::errors::SidecarError;
use crate::gcp::auth::TokenProvider;
use crate::gcp::kms::KmsClient;
use crate::gcp::pubsub::{OutgoingMessage, PubSubClient};
use crate::handlers::{map_sdk_error, ServiceHandler};

/// Operation prefix carried in `X-Amz-Target`.
const TARGET_PREFIX: &str = "Kinesis_20131202.";

// -- Request shapes ----------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PutRecordInput {
    stream_name: String,
    /// Base64 payload.
    data: String,
    partition_key: String,
    explicit_hash_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PutRecordsInput {
    stream_name: String,
    records: Vec<PutRecordsEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PutRecordsEntry {
    data: String,
    partition_key: String,
    explicit_hash_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StreamInput {
    stream_name: String,
    shard_count: Option<u32>,
}

// -- Tenant ------------------------------------------------------------------

enum Destination {
    PubSub {
        pubsub: PubSubClient,
        kms: Option<KmsClient>,
    },
    Aws {
        client: aws_sdk_kinesis::Client,
    },
}

/// Per-tenant state for the Kinesis surface.
pub struct KinesisTenant {
    pub key: String,
    config: RwLock<TenantConfig>,
    dest: Destination,
}

impl KinesisTenant {
    pub async fn new(key: &str, config: &TenantConfig) -> anyhow::Result<Arc<Self>> {
        let dest = if config.routes_to_gcp() {
            let dest_gcp = config
                .dest_gcp
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("tenant {key}: dest_gcp missing"))?;
            let http = crate::handlers::gcp_http_client()?;
            let auth = Arc::new(TokenProvider::from_dest(dest_gcp, http.clone()));
            let kms = dest_gcp
                .kms_key_name
                .clone()
                .map(|key_name| KmsClient::new(http.clone(), auth.clone(), key_name));
            Destination::PubSub {
                pubsub: PubSubClient::new(http, auth, dest_gcp.project.clone()),
                kms,
            }
        } else {
            let dest_aws = config
                .dest_aws
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("tenant {key}: dest_aws missing"))?;
            let sdk_config = crate::handlers::aws_sdk_config(dest_aws).await;
            Destination::Aws {
                client: aws_sdk_kinesis::Client::new(&sdk_config),
            }
        };

        Ok(Arc::new(Self {
            key: key.to_string(),
            config: RwLock::new(config.clone()),
            dest,
        }))
    }

    fn shard_count(&self) -> u32 {
        let config = self.config.read().expect("tenant config lock poisoned");
        config
            .dest_gcp
            .as_ref()
            .map(|g| g.shard_count.max(1))
            .unwrap_or(1)
    }

    fn topic_for(&self, stream: &str) -> String {
        let config = self.config.read().expect("tenant config lock poisoned");
        config
            .dest_gcp
            .as_ref()
            .map(|g| g.rename_topic(stream).to_string())
            .unwrap_or_else(|| stream.to_string())
    }
}

impl ServiceHandler for KinesisTenant {
    fn set_config(&self, config: TenantConfig) {
        let mut guard = self.config.write().expect("tenant config lock poisoned");
        *guard = config;
    }

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            debug!("Kinesis tenant {} shut down", self.key);
        })
    }
}

/// Register the Kinesis route for one tenant.
pub fn router(tenant: Arc<KinesisTenant>) -> axum::Router {
    axum::Router::new()
        .route("/", axum::routing::post(handle))
        .with_state(tenant)
}

// -- Dispatch ----------------------------------------------------------------

/// Map a partition key onto a stable shard id.
fn shard_id(partition_key: &str, shard_count: u32) -> String {
    let mut hasher = Md5::new();
    hasher.update(partition_key.as_bytes());
    let digest = hasher.finalize();
    let bucket = u64::from_be_bytes(digest[..8].try_into().expect("md5 is 16 bytes"))
        % u64::from(shard_count.max(1));
    format!("shardId-{bucket:012}")
}

fn json_response(body: serde_json::Value) -> Response {
    (
        StatusCode::OK,
        [("content-type", "application/x-amz-json-1.1")],
        body.to_string(),
    )
        .into_response()
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, SidecarError> {
    serde_json::from_slice(body)
        .map_err(|e| SidecarError::BadRequest(format!("bad request JSON: {e}")))
}

fn decode_data(data: &str) -> Result<Vec<u8>, SidecarError> {
    BASE64
        .decode(data)
        .map_err(|e| SidecarError::BadRequest(format!("Data is not valid base64: {e}")))
}

pub async fn handle(
    State(tenant): State<Arc<KinesisTenant>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match dispatch(&tenant, &headers, &body).await {
        Ok(response) => response,
        Err(e) => e.into_json_response(),
    }
}

async fn dispatch(
    tenant: &KinesisTenant,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, SidecarError> {
    let target = headers
        .get("x-amz-target")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| SidecarError::BadRequest("missing X-Amz-Target".into()))?;
    let operation = target.strip_prefix(TARGET_PREFIX).ok_or_else(|| {
        SidecarError::BadRequest(format!("unexpected X-Amz-Target {target:?}"))
    })?;

    debug!("Kinesis dispatch: {operation}");

    match operation {
        "PutRecord" => put_record(tenant, parse_body(body)?).await,
        "PutRecords" => put_records(tenant, parse_body(body)?).await,
        "CreateStream" => create_stream(tenant, parse_body(body)?).await,
        "DeleteStream" => delete_stream(tenant, parse_body(body)?).await,
        "DescribeStream" => describe_stream(tenant, parse_body(body)?).await,
        other => Err(SidecarError::BadRequest(format!(
            "unsupported operation {other}"
        ))),
    }
}

// -- Operations --------------------------------------------------------------

fn record_attributes(
    partition_key: &str,
    explicit_hash_key: Option<&str>,
) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    attributes.insert("partitionKey".to_string(), partition_key.to_string());
    if let Some(hash_key) = explicit_hash_key {
        attributes.insert("explicitHashKey".to_string(), hash_key.to_string());
    }
    attributes
}

async fn wrap_payload(
    kms: Option<&KmsClient>,
    payload: Vec<u8>,
) -> Result<Vec<u8>, SidecarError> {
    match kms {
        Some(kms) => kms.encrypt(&payload).await,
        None => Ok(payload),
    }
}

async fn put_record(
    tenant: &KinesisTenant,
    input: PutRecordInput,
) -> Result<Response, SidecarError> {
    match &tenant.dest {
        Destination::PubSub { pubsub, kms } => {
            let topic = tenant.topic_for(&input.stream_name);
            let payload = wrap_payload(kms.as_ref(), decode_data(&input.data)?).await?;
            let message = OutgoingMessage::new(
                &payload,
                record_attributes(&input.partition_key, input.explicit_hash_key.as_deref()),
            );
            let ids = pubsub.publish(&topic, &[message]).await?;
            let sequence = ids.into_iter().next().unwrap_or_default();
            Ok(json_response(serde_json::json!({
                "SequenceNumber": sequence,
                "ShardId": shard_id(&input.partition_key, tenant.shard_count()),
            })))
        }
        Destination::Aws { client } => {
            let resp = client
                .put_record()
                .stream_name(&input.stream_name)
                .data(aws_sdk_kinesis::primitives::Blob::new(decode_data(
                    &input.data,
                )?))
                .partition_key(&input.partition_key)
                .set_explicit_hash_key(input.explicit_hash_key)
                .send()
                .await
                .map_err(|e| map_sdk_error("put_record", e))?;
            Ok(json_response(serde_json::json!({
                "SequenceNumber": resp.sequence_number(),
                "ShardId": resp.shard_id(),
            })))
        }
    }
}

async fn put_records(
    tenant: &KinesisTenant,
    input: PutRecordsInput,
) -> Result<Response, SidecarError> {
    match &tenant.dest {
        Destination::PubSub { pubsub, kms } => {
            let topic = tenant.topic_for(&input.stream_name);

            let mut messages = Vec::with_capacity(input.records.len());
            for record in &input.records {
                let payload = wrap_payload(kms.as_ref(), decode_data(&record.data)?).await?;
                messages.push(OutgoingMessage::new(
                    &payload,
                    record_attributes(&record.partition_key, record.explicit_hash_key.as_deref()),
                ));
            }

            let ids = pubsub.publish(&topic, &messages).await?;
            let shard_count = tenant.shard_count();
            let records: Vec<serde_json::Value> = input
                .records
                .iter()
                .zip(ids.iter())
                .map(|(record, id)| {
                    serde_json::json!({
                        "SequenceNumber": id,
                        "ShardId": shard_id(&record.partition_key, shard_count),
                    })
                })
                .collect();

            Ok(json_response(serde_json::json!({
                "FailedRecordCount": 0,
                "Records": records,
            })))
        }
        Destination::Aws { client } => {
            let mut entries = Vec::with_capacity(input.records.len());
            for record in &input.records {
                entries.push(
                    aws_sdk_kinesis::types::PutRecordsRequestEntry::builder()
                        .data(aws_sdk_kinesis::primitives::Blob::new(decode_data(
                            &record.data,
                        )?))
                        .partition_key(&record.partition_key)
                        .set_explicit_hash_key(record.explicit_hash_key.clone())
                        .build()
                        .map_err(|e| SidecarError::BadRequest(format!("bad record: {e}")))?,
                );
            }
            let resp = client
                .put_records()
                .stream_name(&input.stream_name)
                .set_records(Some(entries))
                .send()
                .await
                .map_err(|e| map_sdk_error("put_records", e))?;

            let records: Vec<serde_json::Value> = resp
                .records()
                .iter()
                .map(|record| {
                    serde_json::json!({
                        "SequenceNumber": record.sequence_number(),
                        "ShardId": record.shard_id(),
                    })
                })
                .collect();
            Ok(json_response(serde_json::json!({
                "FailedRecordCount": resp.failed_record_count().unwrap_or(0),
                "Records": records,
            })))
        }
    }
}

async fn create_stream(
    tenant: &KinesisTenant,
    input: StreamInput,
) -> Result<Response, SidecarError> {
    match &tenant.dest {
        Destination::PubSub { pubsub, .. } => {
            let topic = tenant.topic_for(&input.stream_name);
            pubsub.create_topic(&topic).await?;
            info!("created topic {topic} for stream {}", input.stream_name);
            Ok(json_response(serde_json::json!({})))
        }
        Destination::Aws { client } => {
            client
                .create_stream()
                .stream_name(&input.stream_name)
                .set_shard_count(input.shard_count.map(|c| c as i32))
                .send()
                .await
                .map_err(|e| map_sdk_error("create_stream", e))?;
            Ok(json_response(serde_json::json!({})))
        }
    }
}

async fn delete_stream(
    tenant: &KinesisTenant,
    input: StreamInput,
) -> Result<Response, SidecarError> {
    match &tenant.dest {
        Destination::PubSub { pubsub, .. } => {
            let topic = tenant.topic_for(&input.stream_name);
            pubsub.delete_topic(&topic).await?;
            info!("deleted topic {topic} for stream {}", input.stream_name);
            Ok(json_response(serde_json::json!({})))
        }
        Destination::Aws { client } => {
            client
                .delete_stream()
                .stream_name(&input.stream_name)
                .send()
                .await
                .map_err(|e| map_sdk_error("delete_stream", e))?;
            Ok(json_response(serde_json::json!({})))
        }
    }
}

async fn describe_stream(
    tenant: &KinesisTenant,
    input: StreamInput,
) -> Result<Response, SidecarError> {
    match &tenant.dest {
        Destination::PubSub { pubsub, .. } => {
            let topic = tenant.topic_for(&input.stream_name);
            let meta = pubsub.get_topic(&topic).await?;

            let shards: Vec<serde_json::Value> = (0..tenant.shard_count())
                .map(|n| {
                    serde_json::json!({
                        "ShardId": format!("shardId-{n:012}"),
                        "HashKeyRange": {
                            "StartingHashKey": "0",
                            "EndingHashKey": "340282366920938463463374607431768211455",
                        },
                    })
                })
                .collect();

            Ok(json_response(serde_json::json!({
                "StreamDescription": {
                    "StreamName": input.stream_name,
                    "StreamARN": meta.name,
                    "StreamStatus": "ACTIVE",
                    "Shards": shards,
                    "HasMoreShards": false,
                }
            })))
        }
        Destination::Aws { client } => {
            let resp = client
                .describe_stream()
                .stream_name(&input.stream_name)
                .send()
                .await
                .map_err(|e| map_sdk_error("describe_stream", e))?;
            let description = resp
                .stream_description()
                .expect("describe_stream response missing stream_description");

            let shards: Vec<serde_json::Value> = description
                .shards()
                .iter()
                .map(|shard| serde_json::json!({ "ShardId": shard.shard_id() }))
                .collect();

            Ok(json_response(serde_json::json!({
                "StreamDescription": {
                    "StreamName": description.stream_name(),
                    "StreamARN": description.stream_arn(),
                    "StreamStatus": description.stream_status().as_str(),
                    "Shards": shards,
                    "HasMoreShards": description.has_more_shards(),
                }
            })))
        }
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_id_is_stable_and_bounded() {
        let a = shard_id("p", 4);
        let b = shard_id("p", 4);
        assert_eq!(a, b);
        assert!(a.starts_with("shardId-"));
        let n: u64 = a.strip_prefix("shardId-").unwrap().parse().unwrap();
        assert!(n < 4);
        // Shard count of zero never divides by zero.
        assert_eq!(shard_id("p", 0), "shardId-000000000000");
    }

    #[test]
    fn test_shard_id_spreads_keys() {
        let shards: std::collections::HashSet<String> =
            (0..64).map(|n| shard_id(&format!("key-{n}"), 8)).collect();
        assert!(shards.len() > 1);
    }

    #[test]
    fn test_put_record_input_parse() {
        let input: PutRecordInput = serde_json::from_str(
            r#"{"StreamName":"s1","Data":"aGVsbG8=","PartitionKey":"p"}"#,
        )
        .unwrap();
        assert_eq!(input.stream_name, "s1");
        assert_eq!(decode_data(&input.data).unwrap(), b"hello");
        assert_eq!(input.partition_key, "p");
        assert!(input.explicit_hash_key.is_none());
    }

    #[test]
    fn test_put_records_input_parse() {
        let input: PutRecordsInput = serde_json::from_str(
            r#"{"StreamName":"s1","Records":[
                {"Data":"YQ==","PartitionKey":"p1","ExplicitHashKey":"42"},
                {"Data":"Yg==","PartitionKey":"p2"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(input.records.len(), 2);
        assert_eq!(input.records[0].explicit_hash_key.as_deref(), Some("42"));
    }

    #[test]
    fn test_record_attributes() {
        let attributes = record_attributes("p", Some("42"));
        assert_eq!(attributes["partitionKey"], "p");
        assert_eq!(attributes["explicitHashKey"], "42");
        let attributes = record_attributes("p", None);
        assert!(!attributes.contains_key("explicitHashKey"));
    }

    #[test]
    fn test_bad_base64_rejected() {
        assert!(matches!(
            decode_data("not base64!!"),
            Err(SidecarError::BadRequest(_))
        ));
    }
}
