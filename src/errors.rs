//! Sidecar error types.
//!
//! Every variant maps to a well-known wire error.  The enum implements
//! [`axum::response::IntoResponse`] rendering an S3-style XML `<Error>`
//! body; handlers for the JSON/query protocols (Kinesis, SQS) use
//! [`SidecarError::into_json_response`] instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::xml::render_error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Translation-layer errors expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum SidecarError {
    /// Unparseable URL, headers, or body framing.
    #[error("{0}")]
    BadRequest(String),

    /// The specified multipart upload does not exist.
    #[error("The specified upload does not exist. The upload ID may be invalid, or the upload may have been aborted or completed.")]
    NoSuchUpload { upload_id: String },

    /// A chunk size line in an aws-chunked body could not be parsed.
    #[error("malformed aws-chunked framing: {0}")]
    MalformedChunk(String),

    /// The request body ended before its framing said it would.
    #[error("request body ended before the declared chunk length")]
    TruncatedBody,

    /// The body carried a different number of bytes than declared.
    #[error("request body length {actual} does not match declared length {expected}")]
    BodyLengthMismatch { expected: u64, actual: u64 },

    /// The destination cloud rejected the sidecar's own credentials.
    #[error("destination rejected sidecar credentials: {0}")]
    UpstreamAuth(String),

    /// The destination object/bucket/stream does not exist.
    #[error("The resource you requested does not exist")]
    UpstreamNotFound { resource: String },

    /// A retryable destination failure.  The sidecar never retries;
    /// the client's SDK is expected to.
    #[error("destination temporarily unavailable: {0}")]
    UpstreamTransient(String),

    /// A non-retryable destination failure.
    #[error("destination request failed: {0}")]
    UpstreamFatal(String),

    /// A conditional operation's precondition did not hold.
    #[error("At least one of the pre-conditions you specified did not hold")]
    PreconditionFailed,

    /// Catch-all for unexpected internal errors.  The diagnostic detail
    /// is logged, never sent to the client.
    #[error("We encountered an internal error, please try again.")]
    Internal(#[from] anyhow::Error),
}

impl SidecarError {
    /// Return the S3 XML error code string.
    pub fn code(&self) -> &'static str {
        match self {
            SidecarError::BadRequest(_) => "InvalidRequest",
            SidecarError::NoSuchUpload { .. } => "NoSuchUpload",
            SidecarError::MalformedChunk(_) => "IncompleteBody",
            SidecarError::TruncatedBody => "IncompleteBody",
            SidecarError::BodyLengthMismatch { .. } => "IncompleteBody",
            SidecarError::UpstreamAuth(_) => "InvalidAccessKeyId",
            SidecarError::UpstreamNotFound { .. } => "NoSuchKey",
            SidecarError::UpstreamTransient(_) => "ServiceUnavailable",
            SidecarError::UpstreamFatal(_) => "InternalError",
            SidecarError::PreconditionFailed => "PreconditionFailed",
            SidecarError::Internal(_) => "InternalError",
        }
    }

    /// Return the AWS JSON-protocol error type (Kinesis-style).
    pub fn json_type(&self) -> &'static str {
        match self {
            SidecarError::BadRequest(_) => "InvalidArgumentException",
            SidecarError::NoSuchUpload { .. } => "ResourceNotFoundException",
            SidecarError::MalformedChunk(_)
            | SidecarError::TruncatedBody
            | SidecarError::BodyLengthMismatch { .. } => "InvalidArgumentException",
            SidecarError::UpstreamAuth(_) => "AccessDeniedException",
            SidecarError::UpstreamNotFound { .. } => "ResourceNotFoundException",
            SidecarError::UpstreamTransient(_) => "ServiceUnavailableException",
            SidecarError::UpstreamFatal(_) | SidecarError::Internal(_) => "InternalFailure",
            SidecarError::PreconditionFailed => "ConditionalCheckFailedException",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            SidecarError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SidecarError::NoSuchUpload { .. } => StatusCode::NOT_FOUND,
            SidecarError::MalformedChunk(_) => StatusCode::BAD_REQUEST,
            SidecarError::TruncatedBody => StatusCode::BAD_REQUEST,
            SidecarError::BodyLengthMismatch { .. } => StatusCode::BAD_REQUEST,
            SidecarError::UpstreamAuth(_) => StatusCode::BAD_GATEWAY,
            SidecarError::UpstreamNotFound { .. } => StatusCode::NOT_FOUND,
            SidecarError::UpstreamTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
            SidecarError::UpstreamFatal(_) => StatusCode::BAD_GATEWAY,
            SidecarError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            SidecarError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render as an AWS JSON-protocol error response.
    pub fn into_json_response(self) -> Response {
        let request_id = generate_request_id();
        if let SidecarError::Internal(ref err) = self {
            tracing::error!("internal error (request {request_id}): {err:#}");
        }
        let body = serde_json::json!({
            "__type": self.json_type(),
            "message": self.to_string(),
        });
        (
            self.status_code(),
            [
                ("content-type", "application/x-amz-json-1.1".to_string()),
                ("x-amzn-requestid", request_id),
            ],
            body.to_string(),
        )
            .into_response()
    }

    /// Classify a reqwest transport/HTTP failure against a GCP API.
    pub fn from_gcp_status(context: &str, status: StatusCode, body: &str) -> Self {
        match status {
            StatusCode::NOT_FOUND => SidecarError::UpstreamNotFound {
                resource: context.to_string(),
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                SidecarError::UpstreamAuth(format!("{context}: HTTP {status}"))
            }
            s if s.is_server_error() => {
                SidecarError::UpstreamTransient(format!("{context}: HTTP {status} - {body}"))
            }
            s => SidecarError::UpstreamFatal(format!("{context}: HTTP {s} - {body}")),
        }
    }
}

impl IntoResponse for SidecarError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());

        if let SidecarError::Internal(ref err) = self {
            tracing::error!("internal error (request {request_id}): {err:#}");
        }

        let body = render_error(self.code(), &self.to_string(), "", &request_id);

        (
            status,
            [
                ("content-type", "application/xml".to_string()),
                ("x-amz-request-id", request_id),
                ("date", date),
                ("server", "CloudShim".to_string()),
            ],
            body,
        )
            .into_response()
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            SidecarError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SidecarError::NoSuchUpload {
                upload_id: "u".into()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        // Misconfigured sidecar credentials are not the client's fault.
        assert_eq!(
            SidecarError::UpstreamAuth("denied".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        // Transient destination failures surface for the client SDK to retry.
        assert_eq!(
            SidecarError::UpstreamTransient("503".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_gcp_status_classification() {
        let err = SidecarError::from_gcp_status("get object", StatusCode::NOT_FOUND, "");
        assert!(matches!(err, SidecarError::UpstreamNotFound { .. }));

        let err = SidecarError::from_gcp_status("get object", StatusCode::FORBIDDEN, "");
        assert!(matches!(err, SidecarError::UpstreamAuth(_)));

        let err = SidecarError::from_gcp_status("get object", StatusCode::BAD_GATEWAY, "");
        assert!(matches!(err, SidecarError::UpstreamTransient(_)));

        let err = SidecarError::from_gcp_status("get object", StatusCode::CONFLICT, "");
        assert!(matches!(err, SidecarError::UpstreamFatal(_)));
    }

    #[test]
    fn test_internal_detail_not_leaked() {
        let err = SidecarError::Internal(anyhow::anyhow!("secret backend path /var/db"));
        assert!(!err.to_string().contains("/var/db"));
    }

    #[test]
    fn test_request_id_shape() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
