//! Bucket-level S3 operations: ListObjectsV1 and GetBucketAcl.

use axum::extract::{Path, RawQuery, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use super::{parse_query, Destination, S3Tenant};
use crate::convert;
use crate::errors::SidecarError;
use crate::handlers::map_sdk_error;
use crate::xml::{self, AclGrant, ObjectEntry};

const DEFAULT_MAX_KEYS: u32 = 1000;

fn xml_response(body: String) -> Response {
    (StatusCode::OK, [(CONTENT_TYPE, "application/xml")], body).into_response()
}

/// `GET /{bucket}` — GetBucketAcl when `?acl` is present, otherwise
/// ListObjectsV1.
pub async fn handle_get_bucket(
    State(tenant): State<Arc<S3Tenant>>,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, SidecarError> {
    let query = parse_query(raw_query.as_deref());
    if query.contains_key("acl") {
        return get_bucket_acl(&tenant, &bucket).await;
    }
    list_objects(&tenant, &bucket, &query).await
}

async fn get_bucket_acl(tenant: &S3Tenant, bucket: &str) -> Result<Response, SidecarError> {
    match tenant.dest() {
        Destination::Gcs { .. } => {
            // GCS has no S3-shaped ACLs; fabricate a full-control grant
            // to the configured owner.
            let (owner_id, owner_display) = tenant.owner_identity();
            let grants = [AclGrant {
                id: owner_id.clone(),
                display_name: owner_display.clone(),
                permission: "FULL_CONTROL".to_string(),
            }];
            Ok(xml_response(xml::render_access_control_policy(
                &owner_id,
                &owner_display,
                &grants,
            )))
        }
        Destination::Aws { client } => {
            let resp = client
                .get_bucket_acl()
                .bucket(bucket)
                .send()
                .await
                .map_err(|e| map_sdk_error("get_bucket_acl", e))?;

            let owner_id = resp
                .owner()
                .and_then(|o| o.id())
                .unwrap_or_default()
                .to_string();
            let owner_display = resp
                .owner()
                .and_then(|o| o.display_name())
                .unwrap_or_default()
                .to_string();

            let grants: Vec<AclGrant> = resp
                .grants()
                .iter()
                .filter_map(|grant| {
                    let grantee = grant.grantee()?;
                    Some(AclGrant {
                        id: grantee.id().unwrap_or_default().to_string(),
                        display_name: grantee.display_name().unwrap_or_default().to_string(),
                        permission: grant
                            .permission()
                            .map(|p| p.as_str().to_string())
                            .unwrap_or_default(),
                    })
                })
                .collect();

            Ok(xml_response(xml::render_access_control_policy(
                &owner_id,
                &owner_display,
                &grants,
            )))
        }
    }
}

async fn list_objects(
    tenant: &S3Tenant,
    bucket: &str,
    query: &std::collections::HashMap<String, String>,
) -> Result<Response, SidecarError> {
    let prefix = query.get("prefix").map(String::as_str).unwrap_or("");
    let delimiter = query.get("delimiter").map(String::as_str).unwrap_or("");
    let marker = query.get("marker").map(String::as_str).unwrap_or("");
    let max_keys: u32 = query
        .get("max-keys")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_KEYS);

    match tenant.dest() {
        Destination::Gcs { gcs, .. } => {
            let dest_bucket = tenant.rename_bucket(bucket);
            let listing = gcs
                .list_objects(
                    &dest_bucket,
                    prefix,
                    delimiter,
                    if marker.is_empty() { None } else { Some(marker) },
                    Some(max_keys),
                )
                .await?;

            let items = listing.items.unwrap_or_default();
            // GCS startOffset is inclusive; the S3 marker is exclusive.
            let items: Vec<_> = items
                .into_iter()
                .filter(|item| item.name.as_deref().map(|n| n > marker).unwrap_or(false))
                .collect();

            let etags: Vec<String> = items
                .iter()
                .map(|item| {
                    item.md5_hash
                        .as_deref()
                        .and_then(convert::etag_from_md5)
                        .unwrap_or_default()
                })
                .collect();

            let entries: Vec<ObjectEntry<'_>> = items
                .iter()
                .zip(etags.iter())
                .map(|(item, etag)| ObjectEntry {
                    key: item.name.as_deref().unwrap_or(""),
                    last_modified: item.updated.as_deref().unwrap_or(""),
                    etag,
                    size: item
                        .size
                        .as_deref()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0),
                    storage_class: "STANDARD",
                })
                .collect();

            let prefixes = listing.prefixes.unwrap_or_default();
            let common_prefixes: Vec<&str> = prefixes.iter().map(String::as_str).collect();

            let is_truncated = listing.next_page_token.is_some();
            let next_marker = if is_truncated {
                entries.last().map(|e| e.key.to_string())
            } else {
                None
            };

            Ok(xml_response(xml::render_list_objects_result(
                bucket,
                prefix,
                delimiter,
                marker,
                max_keys,
                is_truncated,
                &entries,
                &common_prefixes,
                next_marker.as_deref(),
            )))
        }
        Destination::Aws { client } => {
            let mut req = client.list_objects().bucket(bucket).max_keys(max_keys as i32);
            if !prefix.is_empty() {
                req = req.prefix(prefix);
            }
            if !delimiter.is_empty() {
                req = req.delimiter(delimiter);
            }
            if !marker.is_empty() {
                req = req.marker(marker);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| map_sdk_error("list_objects", e))?;

            let timestamps: Vec<String> = resp
                .contents()
                .iter()
                .map(|obj| {
                    obj.last_modified()
                        .and_then(|t| t.fmt(aws_sdk_s3::primitives::DateTimeFormat::DateTime).ok())
                        .unwrap_or_default()
                })
                .collect();

            let entries: Vec<ObjectEntry<'_>> = resp
                .contents()
                .iter()
                .zip(timestamps.iter())
                .map(|(obj, timestamp)| ObjectEntry {
                    key: obj.key().unwrap_or(""),
                    last_modified: timestamp,
                    etag: obj.e_tag().unwrap_or(""),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    storage_class: obj
                        .storage_class()
                        .map(|s| s.as_str())
                        .unwrap_or("STANDARD"),
                })
                .collect();

            let prefixes: Vec<&str> = resp
                .common_prefixes()
                .iter()
                .filter_map(|p| p.prefix())
                .collect();

            Ok(xml_response(xml::render_list_objects_result(
                bucket,
                prefix,
                delimiter,
                marker,
                max_keys,
                resp.is_truncated().unwrap_or(false),
                &entries,
                &prefixes,
                resp.next_marker(),
            )))
        }
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantConfig;

    async fn gcs_tenant() -> Arc<S3Tenant> {
        let yaml = r#"
port: 1
service_type: s3
dest_gcp:
  from_instance_metadata: true
  project: demo
"#;
        let config: TenantConfig = serde_yaml::from_str(yaml).unwrap();
        S3Tenant::new("t", &config).await.unwrap()
    }

    #[tokio::test]
    async fn test_fabricated_acl_document() {
        let tenant = gcs_tenant().await;
        let response = get_bucket_acl(&tenant, "b1").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.starts_with(&format!("{}\n", xml::XML_HEADER)));
        assert!(body.contains("<ID>demo</ID>"));
        assert!(body.contains("xsi:type=\"CanonicalUser\""));
        assert!(body.contains("<Permission>FULL_CONTROL</Permission>"));
    }
}
