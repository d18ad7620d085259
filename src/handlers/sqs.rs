//! SQS protocol surface, translated onto Pub/Sub.
//!
//! The wire surface is the form-encoded query protocol: `POST /` with an
//! `Action` field.  A queue maps to the Pub/Sub subscription of the same
//! (optionally renamed) name, with its topic named alike; receipt
//! handles are Pub/Sub ack ids, and `VisibilityTimeout` maps onto the
//! ack deadline.  Responses are query-protocol XML documents; errors are
//! JSON like the other AWS surfaces.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::config::TenantConfig;
use crate::errors::{generate_request_id, SidecarError};
use crate::gcp::auth::TokenProvider;
use crate::gcp::kms::KmsClient;
use crate::gcp::pubsub::{OutgoingMessage, PubSubClient};
use crate::handlers::{map_sdk_error, ServiceHandler};
use crate::xml::{self, ReceivedMessage};

const DEFAULT_MAX_MESSAGES: u32 = 1;

enum Destination {
    PubSub {
        pubsub: PubSubClient,
        kms: Option<KmsClient>,
    },
    Aws {
        client: aws_sdk_sqs::Client,
    },
}

/// Per-tenant state for the SQS surface.
pub struct SqsTenant {
    pub key: String,
    config: RwLock<TenantConfig>,
    dest: Destination,
}

impl SqsTenant {
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
                client: aws_sdk_sqs::Client::new(&sdk_config),
            }
        };

        Ok(Arc::new(Self {
            key: key.to_string(),
            config: RwLock::new(config.clone()),
            dest,
        }))
    }

    fn subscription_for(&self, queue: &str) -> String {
        let config = self.config.read().expect("tenant config lock poisoned");
        config
            .dest_gcp
            .as_ref()
            .map(|g| g.rename_topic(queue).to_string())
            .unwrap_or_else(|| queue.to_string())
    }
}

impl ServiceHandler for SqsTenant {
    fn set_config(&self, config: TenantConfig) {
        let mut guard = self.config.write().expect("tenant config lock poisoned");
        *guard = config;
    }

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            debug!("SQS tenant {} shut down", self.key);
        })
    }
}

/// Register the SQS route for one tenant.
pub fn router(tenant: Arc<SqsTenant>) -> axum::Router {
    axum::Router::new()
        .route("/", axum::routing::post(handle))
        .with_state(tenant)
}

// -- Dispatch ----------------------------------------------------------------

/// The queue name is the last path segment of the `QueueUrl` field; a
/// bare `QueueName` is accepted too.
fn queue_name(form: &HashMap<String, String>) -> Result<String, SidecarError> {
    if let Some(url) = form.get("QueueUrl") {
        if let Some(name) = url.rsplit('/').find(|segment| !segment.is_empty()) {
            return Ok(name.to_string());
        }
    }
    if let Some(name) = form.get("QueueName") {
        return Ok(name.clone());
    }
    Err(SidecarError::BadRequest(
        "missing QueueUrl or QueueName".into(),
    ))
}

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn xml_response(body: String) -> Response {
    (StatusCode::OK, [("content-type", "application/xml")], body).into_response()
}

pub async fn handle(State(tenant): State<Arc<SqsTenant>>, body: String) -> Response {
    let form: HashMap<String, String> = match serde_urlencoded::from_str(&body) {
        Ok(form) => form,
        Err(e) => {
            return SidecarError::BadRequest(format!("bad form body: {e}")).into_json_response()
        }
    };

    match dispatch(&tenant, &form).await {
        Ok(response) => response,
        Err(e) => e.into_json_response(),
    }
}

async fn dispatch(
    tenant: &SqsTenant,
    form: &HashMap<String, String>,
) -> Result<Response, SidecarError> {
    let action = form
        .get("Action")
        .ok_or_else(|| SidecarError::BadRequest("missing Action".into()))?;

    debug!("SQS dispatch: {action}");

    match action.as_str() {
        "SendMessage" => send_message(tenant, form).await,
        "ReceiveMessage" => receive_message(tenant, form).await,
        "DeleteMessage" => delete_message(tenant, form).await,
        other => Err(SidecarError::BadRequest(format!(
            "unsupported action {other}"
        ))),
    }
}

// -- Operations --------------------------------------------------------------

async fn send_message(
    tenant: &SqsTenant,
    form: &HashMap<String, String>,
) -> Result<Response, SidecarError> {
    let queue = queue_name(form)?;
    let message_body = form
        .get("MessageBody")
        .ok_or_else(|| SidecarError::BadRequest("missing MessageBody".into()))?;

    match &tenant.dest {
        Destination::PubSub { pubsub, kms } => {
            let topic = tenant.subscription_for(&queue);
            let payload = match kms {
                Some(kms) => kms.encrypt(message_body.as_bytes()).await?,
                None => message_body.as_bytes().to_vec(),
            };
            let message = OutgoingMessage::new(&payload, HashMap::new());
            let ids = pubsub.publish(&topic, &[message]).await?;
            let message_id = ids.into_iter().next().unwrap_or_default();

            Ok(xml_response(xml::render_send_message_response(
                &message_id,
                &md5_hex(message_body.as_bytes()),
                &generate_request_id(),
            )))
        }
        Destination::Aws { client } => {
            let queue_url = form
                .get("QueueUrl")
                .ok_or_else(|| SidecarError::BadRequest("missing QueueUrl".into()))?;
            let resp = client
                .send_message()
                .queue_url(queue_url)
                .message_body(message_body)
                .send()
                .await
                .map_err(|e| map_sdk_error("send_message", e))?;

            Ok(xml_response(xml::render_send_message_response(
                resp.message_id().unwrap_or_default(),
                resp.md5_of_message_body().unwrap_or_default(),
                &generate_request_id(),
            )))
        }
    }
}

async fn receive_message(
    tenant: &SqsTenant,
    form: &HashMap<String, String>,
) -> Result<Response, SidecarError> {
    let queue = queue_name(form)?;
    let max_messages: u32 = form
        .get("MaxNumberOfMessages")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_MESSAGES);
    let visibility_timeout: Option<u32> =
        form.get("VisibilityTimeout").and_then(|v| v.parse().ok());

    match &tenant.dest {
        Destination::PubSub { pubsub, kms } => {
            let subscription = tenant.subscription_for(&queue);
            let pulled = pubsub.pull(&subscription, max_messages).await?;

            if let Some(timeout) = visibility_timeout {
                let ack_ids: Vec<String> = pulled.iter().map(|m| m.ack_id.clone()).collect();
                if !ack_ids.is_empty() {
                    pubsub
                        .modify_ack_deadline(&subscription, &ack_ids, timeout)
                        .await?;
                }
            }

            let mut messages = Vec::with_capacity(pulled.len());
            for received in &pulled {
                let payload = received.message.payload()?;
                let payload = match kms {
                    Some(kms) => kms.decrypt(&payload).await?,
                    None => payload,
                };
                messages.push(ReceivedMessage {
                    message_id: received.message.message_id.clone(),
                    receipt_handle: received.ack_id.clone(),
                    md5_of_body: md5_hex(&payload),
                    body: String::from_utf8_lossy(&payload).into_owned(),
                });
            }

            Ok(xml_response(xml::render_receive_message_response(
                &messages,
                &generate_request_id(),
            )))
        }
        Destination::Aws { client } => {
            let queue_url = form
                .get("QueueUrl")
                .ok_or_else(|| SidecarError::BadRequest("missing QueueUrl".into()))?;
            let mut req = client
                .receive_message()
                .queue_url(queue_url)
                .max_number_of_messages(max_messages as i32);
            if let Some(timeout) = visibility_timeout {
                req = req.visibility_timeout(timeout as i32);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| map_sdk_error("receive_message", e))?;

            let messages: Vec<ReceivedMessage> = resp
                .messages()
                .iter()
                .map(|message| ReceivedMessage {
                    message_id: message.message_id().unwrap_or_default().to_string(),
                    receipt_handle: message.receipt_handle().unwrap_or_default().to_string(),
                    md5_of_body: message.md5_of_body().unwrap_or_default().to_string(),
                    body: message.body().unwrap_or_default().to_string(),
                })
                .collect();

            Ok(xml_response(xml::render_receive_message_response(
                &messages,
                &generate_request_id(),
            )))
        }
    }
}

async fn delete_message(
    tenant: &SqsTenant,
    form: &HashMap<String, String>,
) -> Result<Response, SidecarError> {
    let receipt_handle = form
        .get("ReceiptHandle")
        .ok_or_else(|| SidecarError::BadRequest("missing ReceiptHandle".into()))?;

    match &tenant.dest {
        Destination::PubSub { pubsub, .. } => {
            let queue = queue_name(form)?;
            let subscription = tenant.subscription_for(&queue);
            pubsub
                .acknowledge(&subscription, &[receipt_handle.clone()])
                .await?;
        }
        Destination::Aws { client } => {
            let queue_url = form
                .get("QueueUrl")
                .ok_or_else(|| SidecarError::BadRequest("missing QueueUrl".into()))?;
            client
                .delete_message()
                .queue_url(queue_url)
                .receipt_handle(receipt_handle)
                .send()
                .await
                .map_err(|e| map_sdk_error("delete_message", e))?;
        }
    }

    Ok(xml_response(xml::render_delete_message_response(
        &generate_request_id(),
    )))
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn form(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_queue_name_from_url() {
        let form = form(&[("QueueUrl", "https://sqs.us-east-1.amazonaws.com/123456789/orders")]);
        assert_eq!(queue_name(&form).unwrap(), "orders");
    }

    #[test]
    fn test_queue_name_from_url_trailing_slash() {
        let form = form(&[("QueueUrl", "http://127.0.0.1:3452/queue/orders/")]);
        assert_eq!(queue_name(&form).unwrap(), "orders");
    }

    #[test]
    fn test_queue_name_fallback_and_missing() {
        assert_eq!(
            queue_name(&form(&[("QueueName", "orders")])).unwrap(),
            "orders"
        );
        assert!(matches!(
            queue_name(&form(&[])),
            Err(SidecarError::BadRequest(_))
        ));
    }

    #[test]
    fn test_md5_hex() {
        assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_form_decoding() {
        let body = "Action=SendMessage&QueueUrl=http%3A%2F%2Flocal%2Fq1&MessageBody=hi%20there";
        let form: HashMap<String, String> = serde_urlencoded::from_str(body).unwrap();
        assert_eq!(form["Action"], "SendMessage");
        assert_eq!(form["MessageBody"], "hi there");
        assert_eq!(queue_name(&form).unwrap(), "q1");
    }
}
