//! Per-service protocol handlers.
//!
//! Each tenant gets one handler instance that owns its outbound clients.
//! Handlers are safe for concurrent requests: everything inside is
//! immutable after construction except the config reference, which the
//! config driver replaces on reload through [`ServiceHandler::set_config`].

use std::future::Future;
use std::pin::Pin;

use crate::config::TenantConfig;
use crate::errors::SidecarError;

pub mod gcs;
pub mod kinesis;
pub mod s3;
pub mod sqs;

/// Contract between the supervisor and a tenant handler.
///
/// This is also the registration interface out-of-tree service plugins
/// implement; the loader for those lives outside the core.
pub trait ServiceHandler: Send + Sync + 'static {
    /// Replace the handler's config reference after a reload.
    fn set_config(&self, config: TenantConfig);

    /// Release resources once the handler's last in-flight request has
    /// drained.  Called by the supervisor's background drainer.
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Map an AWS SDK failure onto the sidecar taxonomy.
///
/// Works for every service client; the smithy `SdkError` type is shared.
pub fn map_sdk_error<E>(context: &str, err: aws_sdk_s3::error::SdkError<E>) -> SidecarError
where
    E: aws_sdk_s3::error::ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};

    let detail = format!("{context}: {}", aws_sdk_s3::error::DisplayErrorContext(&err));

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            return SidecarError::UpstreamTransient(detail);
        }
        _ => {}
    }

    match err.code() {
        Some("NoSuchKey") | Some("NoSuchBucket") | Some("NoSuchUpload")
        | Some("ResourceNotFoundException") | Some("NotFound") => SidecarError::UpstreamNotFound {
            resource: context.to_string(),
        },
        Some("AccessDenied") | Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch")
        | Some("ExpiredToken") | Some("AccessDeniedException")
        | Some("UnrecognizedClientException") => SidecarError::UpstreamAuth(detail),
        Some("SlowDown") | Some("ServiceUnavailable") | Some("InternalError")
        | Some("ProvisionedThroughputExceededException") | Some("ThrottlingException") => {
            SidecarError::UpstreamTransient(detail)
        }
        _ => SidecarError::UpstreamFatal(detail),
    }
}

/// Shared reqwest client settings for the GCP JSON APIs.
pub fn gcp_http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()
        .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))
}

/// Build an AWS SDK config from a tenant's static destination credentials.
pub async fn aws_sdk_config(dest: &crate::config::DestAws) -> aws_config::SdkConfig {
    let creds = aws_sdk_s3::config::Credentials::new(
        dest.access_key.clone(),
        dest.secret_key.clone(),
        None,
        None,
        "cloudshim-config",
    );
    aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(dest.region.clone()))
        .credentials_provider(creds)
        .load()
        .await
}
