//! Configuration loading and types for CloudShim.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  The document carries two maps of tenant entries,
//! `aws_configs` and `gcp_configs`, keyed by an opaque tenant identifier.
//! Each tenant binds one loopback port, speaks one service protocol, and
//! forwards to one destination cloud.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Tenants whose client-facing surface is an AWS API (s3, kinesis, sqs).
    #[serde(default)]
    pub aws_configs: HashMap<String, TenantConfig>,

    /// Tenants whose client-facing surface is a GCP API (gcs).
    #[serde(default)]
    pub gcp_configs: HashMap<String, TenantConfig>,

    /// Exit the process when a listener port cannot be bound.
    #[serde(default)]
    pub panic_on_bind_error: bool,

    /// Loopback port for the Prometheus scrape endpoint, when wanted.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl Config {
    /// Iterate over every tenant in the document, both surfaces.
    ///
    /// Tenant keys must be unique across `aws_configs` and `gcp_configs`;
    /// the supervisor keys its listener table by them.
    pub fn tenants(&self) -> impl Iterator<Item = (&String, &TenantConfig)> {
        self.aws_configs.iter().chain(self.gcp_configs.iter())
    }

    /// Look up a tenant by key in either map.
    pub fn tenant(&self, key: &str) -> Option<&TenantConfig> {
        self.aws_configs
            .get(key)
            .or_else(|| self.gcp_configs.get(key))
    }
}

/// One forwarding endpoint: a port, a protocol surface, and a destination.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
    /// Loopback port to bind.
    pub port: u16,

    /// Protocol spoken to clients: `s3`, `kinesis`, `sqs`, `gcs`.
    /// Empty means the tenant is configured but not served.
    #[serde(default)]
    pub service_type: String,

    /// AWS destination credentials.
    #[serde(default)]
    pub dest_aws: Option<DestAws>,

    /// GCP destination credentials and settings.
    #[serde(default)]
    pub dest_gcp: Option<DestGcp>,

    /// Middleware names applied around the tenant router, in order.
    #[serde(default)]
    pub middleware: Vec<String>,

    /// Client-visible bucket name -> destination bucket name.
    #[serde(default)]
    pub bucket_rename: HashMap<String, String>,
}

impl TenantConfig {
    /// Whether requests for this tenant translate to a GCP destination.
    ///
    /// At least one destination must be present.  When both are, the
    /// destination is the provider whose API differs from the surface:
    /// an AWS surface (`s3`/`kinesis`/`sqs`) with a GCP destination
    /// translates, otherwise it is a re-signing passthrough; the `gcs`
    /// surface is the mirror image.
    pub fn routes_to_gcp(&self) -> bool {
        match self.service_type.as_str() {
            "gcs" => self.dest_aws.is_none(),
            _ => self.dest_gcp.is_some(),
        }
    }

    /// Validate the destination invariant.
    pub fn validate(&self, key: &str) -> anyhow::Result<()> {
        if self.dest_aws.is_none() && self.dest_gcp.is_none() {
            anyhow::bail!("tenant {key}: neither dest_aws nor dest_gcp configured");
        }
        if let Some(gcp) = &self.dest_gcp {
            gcp.validate(key)?;
        }
        Ok(())
    }

    /// Apply the bucket rename map; names without an entry pass through.
    pub fn rename_bucket<'a>(&'a self, bucket: &'a str) -> &'a str {
        self.bucket_rename
            .get(bucket)
            .map(String::as_str)
            .unwrap_or(bucket)
    }
}

/// AWS destination credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct DestAws {
    /// Static access key for outbound signing.
    pub access_key: String,

    /// Static secret key for outbound signing.
    pub secret_key: String,

    /// Destination region.
    #[serde(default = "default_region")]
    pub region: String,
}

/// GCP destination credentials and per-service settings.
///
/// Exactly one credential source should be set: `key_file_path`,
/// `raw_key` (inline service-account JSON), or `from_instance_metadata`.
#[derive(Debug, Clone, Deserialize)]
pub struct DestGcp {
    /// Path to a service-account JSON key file.
    #[serde(default)]
    pub key_file_path: Option<String>,

    /// Inline service-account JSON (alternative to `key_file_path`).
    #[serde(default)]
    pub raw_key: Option<String>,

    /// Resolve tokens from the GCE metadata server.
    #[serde(default)]
    pub from_instance_metadata: bool,

    /// GCP project id.
    #[serde(default)]
    pub project: String,

    /// Instance name, for services that need one.
    #[serde(default)]
    pub instance: Option<String>,

    /// Directory for multipart-upload manifest files (S3 -> GCS tenants).
    #[serde(default)]
    pub multipart_db_directory: Option<String>,

    /// Shard count reported to Kinesis clients.
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    /// Client-visible stream/queue name -> Pub/Sub topic/subscription name.
    #[serde(default)]
    pub topic_rename: HashMap<String, String>,

    /// Cloud KMS key resource name for payload envelope encryption.
    #[serde(default)]
    pub kms_key_name: Option<String>,
}

impl DestGcp {
    fn validate(&self, key: &str) -> anyhow::Result<()> {
        let sources = [
            self.key_file_path.is_some(),
            self.raw_key.is_some(),
            self.from_instance_metadata,
        ]
        .iter()
        .filter(|b| **b)
        .count();
        if sources != 1 {
            anyhow::bail!(
                "tenant {key}: dest_gcp needs exactly one of key_file_path, raw_key, \
                 from_instance_metadata (found {sources})"
            );
        }
        Ok(())
    }

    /// Apply the topic rename map; names without an entry pass through.
    pub fn rename_topic<'a>(&'a self, name: &'a str) -> &'a str {
        self.topic_rename
            .get(name)
            .map(String::as_str)
            .unwrap_or(name)
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_shard_count() -> u32 {
    1
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    for (key, tenant) in config.tenants() {
        tenant.validate(key)?;
    }
    Ok(config)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
aws_configs:
  obj:
    port: 3450
    service_type: s3
    dest_gcp:
      key_file_path: /secure/key.json
      project: demo
      multipart_db_directory: /tmp/multipart
    middleware: [logging]
    bucket_rename:
      visible: real-bucket
  stream:
    port: 3451
    service_type: kinesis
    dest_gcp:
      from_instance_metadata: true
      project: demo
      shard_count: 4
gcp_configs:
  blobs:
    port: 3460
    service_type: gcs
    dest_aws:
      access_key: AKID
      secret_key: SECRET
panic_on_bind_error: true
"#;

    #[test]
    fn test_parse_sample() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.aws_configs.len(), 2);
        assert_eq!(config.gcp_configs.len(), 1);
        assert!(config.panic_on_bind_error);

        let obj = &config.aws_configs["obj"];
        assert_eq!(obj.port, 3450);
        assert_eq!(obj.service_type, "s3");
        assert_eq!(obj.middleware, vec!["logging".to_string()]);
        assert_eq!(obj.rename_bucket("visible"), "real-bucket");
        assert_eq!(obj.rename_bucket("other"), "other");
    }

    #[test]
    fn test_destination_selection() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        // AWS surface with a GCP destination translates.
        assert!(config.aws_configs["obj"].routes_to_gcp());
        // GCS surface with an AWS destination translates the other way.
        assert!(!config.gcp_configs["blobs"].routes_to_gcp());
    }

    #[test]
    fn test_validate_rejects_missing_destination() {
        let yaml = r#"
aws_configs:
  broken:
    port: 3450
    service_type: s3
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.aws_configs["broken"].validate("broken").is_err());
    }

    #[test]
    fn test_validate_rejects_two_credential_sources() {
        let yaml = r#"
port: 1
service_type: s3
dest_gcp:
  key_file_path: /a
  from_instance_metadata: true
  project: p
"#;
        let tenant: TenantConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(tenant.validate("t").is_err());
    }

    #[test]
    fn test_default_region_and_shards() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(
            config.gcp_configs["blobs"].dest_aws.as_ref().unwrap().region,
            "us-east-1"
        );
        assert_eq!(
            config.aws_configs["stream"]
                .dest_gcp
                .as_ref()
                .unwrap()
                .shard_count,
            4
        );
    }

    #[test]
    fn test_tenant_lookup_spans_both_maps() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert!(config.tenant("obj").is_some());
        assert!(config.tenant("blobs").is_some());
        assert!(config.tenant("nope").is_none());
        assert_eq!(config.tenants().count(), 3);
    }
}
