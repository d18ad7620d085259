//! S3 protocol surface for one tenant.
//!
//! The tenant owns exactly one destination: a GCS client (translate) or
//! an S3 client (re-signing passthrough).  Which one is decided at
//! construction from the tenant config; requests dispatch on it per call.

use axum::routing::{delete, get, head, post, put};
use axum::Router;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::config::TenantConfig;
use crate::gcp::auth::TokenProvider;
use crate::gcp::gcs::GcsClient;
use crate::handlers::ServiceHandler;
use crate::multipart::ManifestStore;

pub mod bucket;
pub mod object;

/// The tenant's outbound side.
pub enum Destination {
    /// Translate object operations onto Cloud Storage.
    Gcs {
        gcs: GcsClient,
        manifests: ManifestStore,
    },
    /// Forward to S3, re-signed with the configured credentials.
    Aws { client: aws_sdk_s3::Client },
}

/// Per-tenant state shared by all S3 route handlers.
pub struct S3Tenant {
    pub key: String,
    config: RwLock<TenantConfig>,
    dest: Destination,
}

impl S3Tenant {
    /// Build the tenant's destination clients from its config.
    pub async fn new(key: &str, config: &TenantConfig) -> anyhow::Result<Arc<Self>> {
        let dest = if config.routes_to_gcp() {
            let dest_gcp = config
                .dest_gcp
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("tenant {key}: dest_gcp missing"))?;
            let http = crate::handlers::gcp_http_client()?;
            let auth = Arc::new(TokenProvider::from_dest(dest_gcp, http.clone()));
            let manifest_dir = dest_gcp
                .multipart_db_directory
                .clone()
                .unwrap_or_else(|| {
                    std::env::temp_dir()
                        .join("cloudshim-multipart")
                        .to_string_lossy()
                        .into_owned()
                });
            Destination::Gcs {
                gcs: GcsClient::new(http, auth),
                manifests: ManifestStore::new(manifest_dir),
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

    pub fn dest(&self) -> &Destination {
        &self.dest
    }

    /// Apply the tenant's bucket rename map.
    pub fn rename_bucket(&self, bucket: &str) -> String {
        let config = self.config.read().expect("tenant config lock poisoned");
        config.rename_bucket(bucket).to_string()
    }

    /// The owner identity presented in fabricated ACL responses.
    pub fn owner_identity(&self) -> (String, String) {
        let config = self.config.read().expect("tenant config lock poisoned");
        if let Some(gcp) = &config.dest_gcp {
            if !gcp.project.is_empty() {
                return (gcp.project.clone(), gcp.project.clone());
            }
        }
        if let Some(aws) = &config.dest_aws {
            return (aws.access_key.clone(), aws.access_key.clone());
        }
        (self.key.clone(), self.key.clone())
    }
}

impl ServiceHandler for S3Tenant {
    fn set_config(&self, config: TenantConfig) {
        let mut guard = self.config.write().expect("tenant config lock poisoned");
        *guard = config;
    }

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            debug!("S3 tenant {} shut down", self.key);
        })
    }
}

/// Register the S3 routes for one tenant.
pub fn router(tenant: Arc<S3Tenant>) -> Router {
    Router::new()
        // Bucket-level: ?acl dispatching happens inside the handler.
        .route("/:bucket", get(bucket::handle_get_bucket))
        .route("/:bucket/", get(bucket::handle_get_bucket))
        // Object-level; the wildcard accepts any non-`#?` key, slashes
        // included.
        .route("/:bucket/*key", head(object::handle_head))
        .route("/:bucket/*key", get(object::handle_get))
        .route("/:bucket/*key", put(object::handle_put))
        .route("/:bucket/*key", post(object::handle_post))
        .route("/:bucket/*key", delete(object::handle_delete))
        .with_state(tenant)
}

/// Parse a raw query string into (key, value) pairs; bare keys (e.g.
/// `?uploads`) map to an empty value.
pub fn parse_query(raw: Option<&str>) -> std::collections::HashMap<String, String> {
    let mut map = std::collections::HashMap::new();
    let Some(raw) = raw else {
        return map;
    };
    for part in raw.split('&') {
        if part.is_empty() {
            continue;
        }
        if let Some((k, v)) = part.split_once('=') {
            map.insert(decode_query_component(k), decode_query_component(v));
        } else {
            map.insert(decode_query_component(part), String::new());
        }
    }
    map
}

fn decode_query_component(raw: &str) -> String {
    percent_encoding::percent_decode_str(raw)
        .decode_utf8_lossy()
        .into_owned()
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_bare_and_valued() {
        let query = parse_query(Some("uploads&partNumber=2&uploadId=u%2D1"));
        assert_eq!(query.get("uploads").map(String::as_str), Some(""));
        assert_eq!(query.get("partNumber").map(String::as_str), Some("2"));
        assert_eq!(query.get("uploadId").map(String::as_str), Some("u-1"));
        assert!(parse_query(None).is_empty());
    }

    #[tokio::test]
    async fn test_tenant_config_replacement() {
        let yaml = r#"
port: 1
service_type: s3
dest_gcp:
  from_instance_metadata: true
  project: demo
bucket_rename:
  visible: real
"#;
        let config: TenantConfig = serde_yaml::from_str(yaml).unwrap();
        let tenant = S3Tenant::new("t", &config).await.unwrap();
        assert_eq!(tenant.rename_bucket("visible"), "real");

        let mut updated = config.clone();
        updated
            .bucket_rename
            .insert("visible".to_string(), "elsewhere".to_string());
        tenant.set_config(updated);
        assert_eq!(tenant.rename_bucket("visible"), "elsewhere");
    }

    #[tokio::test]
    async fn test_owner_identity_prefers_project() {
        let yaml = r#"
port: 1
service_type: s3
dest_gcp:
  from_instance_metadata: true
  project: demo
"#;
        let config: TenantConfig = serde_yaml::from_str(yaml).unwrap();
        let tenant = S3Tenant::new("t", &config).await.unwrap();
        assert_eq!(tenant.owner_identity(), ("demo".into(), "demo".into()));
    }
}
