//! Cloud Storage JSON-API client.
//!
//! Talks to GCS over `reqwest`.  Downloads and uploads are streamed so the
//! sidecar never buffers whole objects; uploads use `uploadType=multipart`
//! (metadata part + media part) so object attributes are in place before
//! the first payload byte lands.

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RANGE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::auth::TokenProvider;
use crate::errors::SidecarError;

/// GCS compose() supports at most 32 source objects per call.
pub const MAX_COMPOSE_SOURCES: usize = 32;

/// GCS JSON API base URL.
const GCS_API_BASE: &str = "https://storage.googleapis.com";

/// GCS upload base URL (for media/multipart uploads).
const GCS_UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";

// -- Resource types ----------------------------------------------------------

/// The subset of the GCS object resource the sidecar reads and writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// GCS serializes object size as a decimal string.
    #[serde(skip_serializing)]
    pub size: Option<String>,
    /// Base64-encoded MD5 digest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    /// RFC-3339 last-update timestamp.
    #[serde(skip_serializing)]
    pub updated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListResponse {
    pub items: Option<Vec<ObjectMeta>>,
    pub prefixes: Option<Vec<String>>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ComposeSourceObject {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ComposeRequest {
    source_objects: Vec<ComposeSourceObject>,
    destination: ObjectMeta,
}

// -- Byte ranges -------------------------------------------------------------

/// A client `Range: bytes=a-b` request, upper bound optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Tolerant parse: split on `=`, then on `-`.  An absent or empty
    /// upper bound means open-ended.  Returns `None` for values no split
    /// can make sense of.
    pub fn parse(header: &str) -> Option<Self> {
        let value = header.splitn(2, '=').nth(1)?;
        let mut parts = value.splitn(2, '-');
        let start = parts.next()?.trim().parse().ok()?;
        let end = parts.next().and_then(|s| {
            let s = s.trim();
            if s.is_empty() {
                None
            } else {
                s.parse().ok()
            }
        });
        Some(Self { start, end })
    }

    /// Render back into an HTTP `Range` header value.
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

// -- Client ------------------------------------------------------------------

/// Cloud Storage client bound to one tenant's credentials.
pub struct GcsClient {
    http: reqwest::Client,
    auth: Arc<TokenProvider>,
}

impl GcsClient {
    pub fn new(http: reqwest::Client, auth: Arc<TokenProvider>) -> Self {
        Self { http, auth }
    }

    /// URL-encode a GCS object name for use in API paths.
    fn encode(name: &str) -> String {
        percent_encoding::utf8_percent_encode(name, percent_encoding::NON_ALPHANUMERIC).to_string()
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
        SidecarError::UpstreamTransient(format!("GCS {context}: {err}"))
    }

    /// Fetch an object's metadata resource.
    pub async fn object_meta(&self, bucket: &str, object: &str) -> Result<ObjectMeta, SidecarError> {
        let auth = self.auth_headers().await?;
        let url = format!(
            "{}/storage/v1/b/{}/o/{}",
            GCS_API_BASE,
            Self::encode(bucket),
            Self::encode(object)
        );

        debug!("GCS object_meta: bucket={bucket} name={object}");

        let resp = self
            .http
            .get(&url)
            .headers(auth)
            .send()
            .await
            .map_err(|e| Self::transport("object_meta", e))?;
        let resp = Self::check(object, resp).await?;
        resp.json()
            .await
            .map_err(|e| SidecarError::UpstreamFatal(format!("GCS object_meta decode: {e}")))
    }

    /// Open a (possibly ranged) media download as a byte stream.
    pub async fn reader(
        &self,
        bucket: &str,
        object: &str,
        range: Option<&ByteRange>,
    ) -> Result<impl Stream<Item = Result<Bytes, SidecarError>> + Send + Unpin, SidecarError> {
        let auth = self.auth_headers().await?;
        let url = format!(
            "{}/storage/v1/b/{}/o/{}?alt=media",
            GCS_API_BASE,
            Self::encode(bucket),
            Self::encode(object)
        );

        debug!("GCS reader: bucket={bucket} name={object} range={range:?}");

        let mut req = self.http.get(&url).headers(auth);
        if let Some(range) = range {
            req = req.header(RANGE, range.header_value());
        }

        let resp = req.send().await.map_err(|e| Self::transport("reader", e))?;
        let resp = Self::check(object, resp).await?;

        Ok(resp
            .bytes_stream()
            .map_err(|e| SidecarError::UpstreamTransient(format!("GCS read: {e}")))
            .boxed())
    }

    /// Stream a new object into GCS.
    ///
    /// Uses `uploadType=multipart`: the metadata JSON part travels before
    /// the media part, so content type and custom metadata are committed
    /// ahead of the payload.  Returns the stored object's resource, whose
    /// `md5Hash` backs the ETag reported to the client.
    pub async fn upload_stream<S>(
        &self,
        bucket: &str,
        object: &str,
        meta: &ObjectMeta,
        body: S,
    ) -> Result<ObjectMeta, SidecarError>
    where
        S: Stream<Item = Result<Bytes, SidecarError>> + Send + 'static,
    {
        let auth = self.auth_headers().await?;
        let url = format!(
            "{}/b/{}/o?uploadType=multipart",
            GCS_UPLOAD_BASE,
            Self::encode(bucket)
        );

        let mut meta = meta.clone();
        meta.name = Some(object.to_string());
        let media_type = meta
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let meta_json = serde_json::to_string(&meta)
            .map_err(|e| SidecarError::Internal(anyhow::anyhow!("metadata encode: {e}")))?;

        let boundary = format!("shim_{}", uuid::Uuid::new_v4().simple());
        let prefix = format!(
            "--{boundary}\r\ncontent-type: application/json; charset=UTF-8\r\n\r\n\
             {meta_json}\r\n--{boundary}\r\ncontent-type: {media_type}\r\n\r\n"
        );
        let suffix = format!("\r\n--{boundary}--\r\n");

        debug!("GCS upload: bucket={bucket} name={object} content_type={media_type}");

        let framed = futures::stream::once(async move { Ok::<_, SidecarError>(Bytes::from(prefix)) })
            .chain(body)
            .chain(futures::stream::once(async move {
                Ok(Bytes::from(suffix))
            }));

        let resp = self
            .http
            .post(&url)
            .headers(auth)
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(reqwest::Body::wrap_stream(framed))
            .send()
            .await
            .map_err(|e| Self::transport("upload", e))?;
        let resp = Self::check(object, resp).await?;
        resp.json()
            .await
            .map_err(|e| SidecarError::UpstreamFatal(format!("GCS upload decode: {e}")))
    }

    /// Delete an object.  Idempotent: a missing object is not an error.
    pub async fn delete_object(&self, bucket: &str, object: &str) -> Result<(), SidecarError> {
        let auth = self.auth_headers().await?;
        let url = format!(
            "{}/storage/v1/b/{}/o/{}",
            GCS_API_BASE,
            Self::encode(bucket),
            Self::encode(object)
        );

        debug!("GCS delete: bucket={bucket} name={object}");

        let resp = self
            .http
            .delete(&url)
            .headers(auth)
            .send()
            .await
            .map_err(|e| Self::transport("delete", e))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(object, resp).await.map(|_| ())
    }

    /// Compose up to [`MAX_COMPOSE_SOURCES`] objects into `dest`.
    pub async fn compose(
        &self,
        bucket: &str,
        sources: &[String],
        dest: &str,
        content_type: Option<&str>,
    ) -> Result<ObjectMeta, SidecarError> {
        let auth = self.auth_headers().await?;
        let url = format!(
            "{}/storage/v1/b/{}/o/{}/compose",
            GCS_API_BASE,
            Self::encode(bucket),
            Self::encode(dest)
        );

        let body = ComposeRequest {
            source_objects: sources
                .iter()
                .map(|name| ComposeSourceObject { name: name.clone() })
                .collect(),
            destination: ObjectMeta {
                content_type: Some(
                    content_type
                        .unwrap_or("application/octet-stream")
                        .to_string(),
                ),
                ..Default::default()
            },
        };

        debug!("GCS compose: bucket={bucket} dest={dest} sources={}", sources.len());

        let resp = self
            .http
            .post(&url)
            .headers(auth)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::transport("compose", e))?;
        let resp = Self::check(dest, resp).await?;
        resp.json()
            .await
            .map_err(|e| SidecarError::UpstreamFatal(format!("GCS compose decode: {e}")))
    }

    /// Compose an arbitrary number of sources into `dest`, chaining
    /// intermediate composites in batches of [`MAX_COMPOSE_SOURCES`].
    /// Intermediates are deleted best-effort before returning.
    pub async fn compose_all(
        &self,
        bucket: &str,
        sources: &[String],
        dest: &str,
        content_type: Option<&str>,
    ) -> Result<ObjectMeta, SidecarError> {
        if sources.len() <= MAX_COMPOSE_SOURCES {
            return self.compose(bucket, sources, dest, content_type).await;
        }

        let mut intermediates: Vec<String> = Vec::new();
        let mut current: Vec<String> = sources.to_vec();
        let mut generation = 0u32;

        while current.len() > MAX_COMPOSE_SOURCES {
            let mut next: Vec<String> = Vec::new();
            for (batch_idx, chunk) in current.chunks(MAX_COMPOSE_SOURCES).enumerate() {
                if chunk.len() == 1 {
                    next.push(chunk[0].clone());
                    continue;
                }
                let intermediate = format!("{dest}.compose-tmp-{generation}-{batch_idx}");
                self.compose(bucket, chunk, &intermediate, content_type)
                    .await?;
                next.push(intermediate.clone());
                intermediates.push(intermediate);
            }
            current = next;
            generation += 1;
        }

        let meta = self.compose(bucket, &current, dest, content_type).await?;

        for name in &intermediates {
            if let Err(e) = self.delete_object(bucket, name).await {
                warn!("failed to clean up compose intermediate {name}: {e}");
            }
        }

        Ok(meta)
    }

    /// List objects in a bucket, one page.  `start_offset` filters to
    /// names lexicographically at or after the given key, which backs
    /// S3's `marker` parameter.
    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
        start_offset: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<ListResponse, SidecarError> {
        let auth = self.auth_headers().await?;
        let url = format!("{}/storage/v1/b/{}/o", GCS_API_BASE, Self::encode(bucket));

        let mut req = self.http.get(&url).headers(auth);
        if !prefix.is_empty() {
            req = req.query(&[("prefix", prefix)]);
        }
        if !delimiter.is_empty() {
            req = req.query(&[("delimiter", delimiter)]);
        }
        if let Some(offset) = start_offset {
            req = req.query(&[("startOffset", offset)]);
        }
        if let Some(max) = max_results {
            req = req.query(&[("maxResults", &max.to_string())]);
        }

        debug!("GCS list: bucket={bucket} prefix={prefix:?} delimiter={delimiter:?}");

        let resp = req.send().await.map_err(|e| Self::transport("list", e))?;
        let resp = Self::check(bucket, resp).await?;
        resp.json()
            .await
            .map_err(|e| SidecarError::UpstreamFatal(format!("GCS list decode: {e}")))
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_parse_bounded() {
        let range = ByteRange::parse("bytes=2-5").unwrap();
        assert_eq!(range, ByteRange { start: 2, end: Some(5) });
        assert_eq!(range.header_value(), "bytes=2-5");
    }

    #[test]
    fn test_range_parse_open_ended() {
        let range = ByteRange::parse("bytes=100-").unwrap();
        assert_eq!(range, ByteRange { start: 100, end: None });
        assert_eq!(range.header_value(), "bytes=100-");
    }

    #[test]
    fn test_range_parse_garbage() {
        assert!(ByteRange::parse("nonsense").is_none());
        assert!(ByteRange::parse("bytes=x-y").is_none());
    }

    #[test]
    fn test_encode_object_name() {
        let encoded = GcsClient::encode("path/to/my object.txt");
        assert!(encoded.contains("%2F"));
        assert!(encoded.contains("%20"));
        assert!(!encoded.contains(' '));
        assert_eq!(GcsClient::encode("simple"), "simple");
    }

    #[test]
    fn test_object_meta_upload_serialization() {
        let meta = ObjectMeta {
            name: Some("k".into()),
            size: Some("12".into()),
            content_type: Some("text/plain".into()),
            updated: Some("2024-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        // Server-owned fields never travel in upload metadata.
        assert!(json.get("size").is_none());
        assert!(json.get("updated").is_none());
        assert_eq!(json["contentType"], "text/plain");
        assert_eq!(json["name"], "k");
    }

    #[test]
    fn test_list_response_decode() {
        let body = r#"{
            "items": [{"name":"a.txt","size":"3","md5Hash":"rL0Y20zC+Fzt72VPzMSk2A=="}],
            "prefixes": ["dir/"],
            "nextPageToken": "tok"
        }"#;
        let parsed: ListResponse = serde_json::from_str(body).unwrap();
        let items = parsed.items.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name.as_deref(), Some("a.txt"));
        assert_eq!(items[0].size.as_deref(), Some("3"));
        assert_eq!(parsed.prefixes.unwrap(), vec!["dir/".to_string()]);
        assert_eq!(parsed.next_page_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_compose_batching_math() {
        // 65 sources -> 3 first-round batches, then a final compose.
        let num_sources: usize = 65;
        let round1 = num_sources.div_ceil(MAX_COMPOSE_SOURCES);
        assert_eq!(round1, 3);
        assert!(round1 <= MAX_COMPOSE_SOURCES);
    }
}
