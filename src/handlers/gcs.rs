//! GCS protocol surface: a subset of the Cloud Storage JSON API
//! terminated locally and forwarded to an S3 destination (or passed
//! through to real GCS when the tenant destination is GCP).
//!
//! Covered: object metadata, media download, media upload, delete, and
//! object listing.  Errors are GCS-style JSON envelopes.

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::config::TenantConfig;
use crate::errors::SidecarError;
use crate::gcp::auth::TokenProvider;
use crate::gcp::gcs::GcsClient;
use crate::handlers::{map_sdk_error, ServiceHandler};

enum Destination {
    Aws { client: aws_sdk_s3::Client },
    Gcs { gcs: GcsClient },
}

/// Per-tenant state for the GCS surface.
pub struct GcsTenant {
    pub key: String,
    config: RwLock<TenantConfig>,
    dest: Destination,
}

impl GcsTenant {
    pub async fn new(key: &str, config: &TenantConfig) -> anyhow::Result<Arc<Self>> {
        let dest = if config.routes_to_gcp() {
            let dest_gcp = config
                .dest_gcp
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("tenant {key}: dest_gcp missing"))?;
            let http = crate::handlers::gcp_http_client()?;
            let auth = Arc::new(TokenProvider::from_dest(dest_gcp, http.clone()));
            Destination::Gcs {
                gcs: GcsClient::new(http, auth),
            }
        } else {
            let dest_aws = config
                .dest_aws
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("tenant {key}: dest_aws missing"))?;
            let sdk_config = crate::handlers::aws_sdk_config(dest_aws).await;
            Destination::Aws {
                client: aws_sdk_s3::Client::new(&sdk_config),
            }
        };

        Ok(Arc::new(Self {
            key: key.to_string(),
            config: RwLock::new(config.clone()),
            dest,
        }))
    }

    fn rename_bucket(&self, bucket: &str) -> String {
        let config = self.config.read().expect("tenant config lock poisoned");
        config.rename_bucket(bucket).to_string()
    }
}

impl ServiceHandler for GcsTenant {
    fn set_config(&self, config: TenantConfig) {
        let mut guard = self.config.write().expect("tenant config lock poisoned");
        *guard = config;
    }

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            debug!("GCS tenant {} shut down", self.key);
        })
    }
}

/// Register the GCS JSON API routes for one tenant.
pub fn router(tenant: Arc<GcsTenant>) -> axum::Router {
    use axum::routing::{delete, get, post};
    axum::Router::new()
        .route("/storage/v1/b/:bucket/o", get(handle_list))
        .route("/storage/v1/b/:bucket/o/*object", get(handle_get))
        .route("/storage/v1/b/:bucket/o/*object", delete(handle_delete))
        .route("/upload/storage/v1/b/:bucket/o", post(handle_upload))
        .with_state(tenant)
}

// -- Response helpers --------------------------------------------------------

fn gcs_error(err: SidecarError) -> Response {
    let status = err.status_code();
    let body = serde_json::json!({
        "error": {
            "code": status.as_u16(),
            "message": err.to_string(),
        }
    });
    (
        status,
        [(CONTENT_TYPE, "application/json; charset=UTF-8")],
        body.to_string(),
    )
        .into_response()
}

fn json_response(body: serde_json::Value) -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json; charset=UTF-8")],
        body.to_string(),
    )
        .into_response()
}

/// Reconstruct a GCS `md5Hash` from an S3 ETag when the ETag is a plain
/// MD5 digest (multipart ETags are not).
fn md5_from_etag(etag: &str) -> Option<String> {
    let digest = etag.trim_matches('"');
    if digest.len() != 32 {
        return None;
    }
    hex::decode(digest).ok().map(|bytes| BASE64.encode(bytes))
}

fn object_resource(
    bucket: &str,
    name: &str,
    size: Option<i64>,
    content_type: Option<&str>,
    etag: Option<&str>,
    updated: Option<String>,
) -> serde_json::Value {
    let mut resource = serde_json::json!({
        "kind": "storage#object",
        "name": name,
        "bucket": bucket,
    });
    if let Some(size) = size {
        resource["size"] = serde_json::Value::String(size.to_string());
    }
    if let Some(content_type) = content_type {
        resource["contentType"] = serde_json::Value::String(content_type.to_string());
    }
    if let Some(md5) = etag.and_then(md5_from_etag) {
        resource["md5Hash"] = serde_json::Value::String(md5);
    }
    if let Some(updated) = updated {
        resource["updated"] = serde_json::Value::String(updated);
    }
    resource
}

fn rfc3339(time: Option<aws_sdk_s3::primitives::DateTime>) -> Option<String> {
    time.and_then(|t| {
        t.fmt(aws_sdk_s3::primitives::DateTimeFormat::DateTime)
            .ok()
    })
}

// -- Handlers ----------------------------------------------------------------

async fn handle_get(
    State(tenant): State<Arc<GcsTenant>>,
    Path((bucket, object)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let media = query.get("alt").map(String::as_str) == Some("media");
    match get_object(&tenant, &bucket, &object, media).await {
        Ok(response) => response,
        Err(e) => gcs_error(e),
    }
}

async fn get_object(
    tenant: &GcsTenant,
    bucket: &str,
    object: &str,
    media: bool,
) -> Result<Response, SidecarError> {
    let dest_bucket = tenant.rename_bucket(bucket);
    match &tenant.dest {
        Destination::Aws { client } => {
            if media {
                let resp = client
                    .get_object()
                    .bucket(&dest_bucket)
                    .key(object)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("get_object", e))?;
                let content_type = resp
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = resp
                    .body
                    .collect()
                    .await
                    .map_err(|e| SidecarError::UpstreamTransient(format!("get_object body: {e}")))?
                    .into_bytes();
                Ok(([(CONTENT_TYPE, content_type)], data).into_response())
            } else {
                let resp = client
                    .head_object()
                    .bucket(&dest_bucket)
                    .key(object)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("head_object", e))?;
                Ok(json_response(object_resource(
                    bucket,
                    object,
                    resp.content_length(),
                    resp.content_type(),
                    resp.e_tag(),
                    rfc3339(resp.last_modified().copied()),
                )))
            }
        }
        Destination::Gcs { gcs } => {
            if media {
                let reader = gcs.reader(&dest_bucket, object, None).await?;
                Ok(Response::new(Body::from_stream(reader)))
            } else {
                let meta = gcs.object_meta(&dest_bucket, object).await?;
                Ok(json_response(object_resource(
                    bucket,
                    object,
                    meta.size.as_deref().and_then(|s| s.parse().ok()),
                    meta.content_type.as_deref(),
                    None,
                    meta.updated.clone(),
                )))
            }
        }
    }
}

async fn handle_list(
    State(tenant): State<Arc<GcsTenant>>,
    Path(bucket): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    match list_objects(&tenant, &bucket, &query).await {
        Ok(response) => response,
        Err(e) => gcs_error(e),
    }
}

async fn list_objects(
    tenant: &GcsTenant,
    bucket: &str,
    query: &HashMap<String, String>,
) -> Result<Response, SidecarError> {
    let dest_bucket = tenant.rename_bucket(bucket);
    let prefix = query.get("prefix").map(String::as_str).unwrap_or("");

    match &tenant.dest {
        Destination::Aws { client } => {
            let mut req = client.list_objects_v2().bucket(&dest_bucket);
            if !prefix.is_empty() {
                req = req.prefix(prefix);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| map_sdk_error("list_objects_v2", e))?;

            let items: Vec<serde_json::Value> = resp
                .contents()
                .iter()
                .map(|obj| {
                    object_resource(
                        bucket,
                        obj.key().unwrap_or(""),
                        obj.size(),
                        None,
                        obj.e_tag(),
                        rfc3339(obj.last_modified().copied()),
                    )
                })
                .collect();

            Ok(json_response(serde_json::json!({
                "kind": "storage#objects",
                "items": items,
            })))
        }
        Destination::Gcs { gcs } => {
            let listing = gcs.list_objects(&dest_bucket, prefix, "", None, None).await?;
            let items: Vec<serde_json::Value> = listing
                .items
                .unwrap_or_default()
                .iter()
                .map(|item| {
                    object_resource(
                        bucket,
                        item.name.as_deref().unwrap_or(""),
                        item.size.as_deref().and_then(|s| s.parse().ok()),
                        item.content_type.as_deref(),
                        None,
                        item.updated.clone(),
                    )
                })
                .collect();
            Ok(json_response(serde_json::json!({
                "kind": "storage#objects",
                "items": items,
            })))
        }
    }
}

async fn handle_delete(
    State(tenant): State<Arc<GcsTenant>>,
    Path((bucket, object)): Path<(String, String)>,
) -> Response {
    let dest_bucket = tenant.rename_bucket(&bucket);
    let result = match &tenant.dest {
        Destination::Aws { client } => client
            .delete_object()
            .bucket(&dest_bucket)
            .key(&object)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| map_sdk_error("delete_object", e)),
        Destination::Gcs { gcs } => gcs.delete_object(&dest_bucket, &object).await,
    };
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => gcs_error(e),
    }
}

async fn handle_upload(
    State(tenant): State<Arc<GcsTenant>>,
    Path(bucket): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match upload_object(&tenant, &bucket, &query, &headers, body).await {
        Ok(response) => response,
        Err(e) => gcs_error(e),
    }
}

async fn upload_object(
    tenant: &GcsTenant,
    bucket: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, SidecarError> {
    let name = query
        .get("name")
        .ok_or_else(|| SidecarError::BadRequest("missing name parameter".into()))?;
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let dest_bucket = tenant.rename_bucket(bucket);
    let size = body.len() as i64;

    match &tenant.dest {
        Destination::Aws { client } => {
            let resp = client
                .put_object()
                .bucket(&dest_bucket)
                .key(name)
                .content_type(&content_type)
                .body(aws_sdk_s3::primitives::ByteStream::from(body))
                .send()
                .await
                .map_err(|e| map_sdk_error("put_object", e))?;
            Ok(json_response(object_resource(
                bucket,
                name,
                Some(size),
                Some(&content_type),
                resp.e_tag(),
                None,
            )))
        }
        Destination::Gcs { gcs } => {
            let meta = crate::gcp::gcs::ObjectMeta {
                content_type: Some(content_type.clone()),
                ..Default::default()
            };
            let stream = futures::stream::once(async move { Ok::<_, SidecarError>(body) });
            let stored = gcs.upload_stream(&dest_bucket, name, &meta, stream).await?;
            Ok(json_response(object_resource(
                bucket,
                name,
                Some(size),
                stored.content_type.as_deref(),
                None,
                stored.updated.clone(),
            )))
        }
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_from_etag() {
        assert_eq!(
            md5_from_etag("\"d41d8cd98f00b204e9800998ecf8427e\"").as_deref(),
            Some("1B2M2Y8AsgTpgAmY7PhCfg==")
        );
        // Multipart-style ETags are not digests.
        assert!(md5_from_etag("\"abc123-4\"").is_none());
    }

    #[test]
    fn test_object_resource_shape() {
        let resource = object_resource(
            "b1",
            "a.txt",
            Some(3),
            Some("text/plain"),
            Some("\"d41d8cd98f00b204e9800998ecf8427e\""),
            Some("2024-01-01T00:00:00Z".into()),
        );
        assert_eq!(resource["kind"], "storage#object");
        assert_eq!(resource["size"], "3");
        assert_eq!(resource["contentType"], "text/plain");
        assert_eq!(resource["md5Hash"], "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    #[test]
    fn test_object_resource_omits_missing() {
        let resource = object_resource("b1", "a.txt", None, None, None, None);
        assert!(resource.get("size").is_none());
        assert!(resource.get("md5Hash").is_none());
    }
}
