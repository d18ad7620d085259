//! GCS attribute ⇄ S3 header conversion.
//!
//! HEAD/GET responses carry the destination object's attributes as S3
//! headers; PUT requests run the same mapping in reverse to build the
//! GCS writer metadata.  Missing source attributes are omitted, never
//! defaulted.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::gcp::gcs::ObjectMeta;

/// Prefix for user metadata headers on the S3 surface.
const AMZ_META_PREFIX: &str = "x-amz-meta-";

/// Convert a GCS base64 MD5 digest into an S3 ETag (quoted hex).
pub fn etag_from_md5(md5_base64: &str) -> Option<String> {
    let bytes = BASE64.decode(md5_base64).ok()?;
    Some(format!("\"{}\"", hex::encode(bytes)))
}

/// Convert an RFC-3339 timestamp into the RFC-1123 form S3 clients
/// expect, `GMT` spelled out.
fn last_modified(updated: &str) -> Option<String> {
    let parsed = chrono::DateTime::parse_from_rfc3339(updated).ok()?;
    Some(
        parsed
            .with_timezone(&chrono::Utc)
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string(),
    )
}

/// Map GCS object attributes onto S3 response headers.
pub fn gcs_meta_to_headers(meta: &ObjectMeta, headers: &mut HeaderMap) {
    if let Some(size) = &meta.size {
        if let Ok(value) = HeaderValue::from_str(size) {
            headers.insert("content-length", value);
        }
    }
    if let Some(etag) = meta.md5_hash.as_deref().and_then(etag_from_md5) {
        if let Ok(value) = HeaderValue::from_str(&etag) {
            headers.insert("etag", value);
        }
    }
    if let Some(content_type) = &meta.content_type {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert("content-type", value);
        }
    }
    if let Some(cache_control) = &meta.cache_control {
        if let Ok(value) = HeaderValue::from_str(cache_control) {
            headers.insert("cache-control", value);
        }
    }
    if let Some(modified) = meta.updated.as_deref().and_then(last_modified) {
        if let Ok(value) = HeaderValue::from_str(&modified) {
            headers.insert("last-modified", value);
        }
    }
    if let Some(metadata) = &meta.metadata {
        for (key, value) in metadata {
            let name = format!("{AMZ_META_PREFIX}{key}");
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
    }
}

/// The symmetric inverse: map S3 PUT request headers onto GCS writer
/// attributes.  `Content-MD5` carries base64 on both surfaces, so it
/// passes through untouched.
pub fn headers_to_gcs_meta(headers: &HeaderMap) -> ObjectMeta {
    let mut meta = ObjectMeta::default();

    meta.content_type = header_str(headers, "content-type");
    meta.cache_control = header_str(headers, "cache-control");
    meta.md5_hash = header_str(headers, "content-md5");

    let mut user_meta = std::collections::HashMap::new();
    for (name, value) in headers.iter() {
        let name = name.as_str();
        if let Some(key) = name.strip_prefix(AMZ_META_PREFIX) {
            if let Ok(value) = value.to_str() {
                user_meta.insert(key.to_string(), value.to_string());
            }
        }
    }
    if !user_meta.is_empty() {
        meta.metadata = Some(user_meta);
    }

    meta
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ObjectMeta {
        ObjectMeta {
            name: Some("hello".into()),
            size: Some("3".into()),
            // base64 of the MD5 of "abc"
            md5_hash: Some("kAFQmDzST7DWlj99KOF/cg==".into()),
            content_type: Some("text/plain".into()),
            cache_control: Some("max-age=60".into()),
            updated: Some("2024-03-01T12:30:45Z".into()),
            metadata: Some(
                [("color".to_string(), "blue".to_string())]
                    .into_iter()
                    .collect(),
            ),
        }
    }

    #[test]
    fn test_gcs_meta_to_headers() {
        let mut headers = HeaderMap::new();
        gcs_meta_to_headers(&meta(), &mut headers);

        assert_eq!(headers["content-length"], "3");
        assert_eq!(headers["content-type"], "text/plain");
        assert_eq!(headers["cache-control"], "max-age=60");
        assert_eq!(headers["etag"], "\"900150983cd24fb0d6963f7d28e17f72\"");
        assert_eq!(headers["last-modified"], "Fri, 01 Mar 2024 12:30:45 GMT");
        assert_eq!(headers["x-amz-meta-color"], "blue");
    }

    #[test]
    fn test_missing_attributes_are_omitted() {
        let mut headers = HeaderMap::new();
        gcs_meta_to_headers(&ObjectMeta::default(), &mut headers);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_headers_to_gcs_meta_round_trip() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain".parse().unwrap());
        headers.insert("content-md5", "kAFQmDzST7DWlj99KOF/cg==".parse().unwrap());
        headers.insert("x-amz-meta-color", "blue".parse().unwrap());
        headers.insert("x-amz-meta-shape", "round".parse().unwrap());
        // Unrelated headers never leak into writer attributes.
        headers.insert("authorization", "AWS4-HMAC-SHA256 ...".parse().unwrap());

        let meta = headers_to_gcs_meta(&headers);
        assert_eq!(meta.content_type.as_deref(), Some("text/plain"));
        assert_eq!(meta.md5_hash.as_deref(), Some("kAFQmDzST7DWlj99KOF/cg=="));
        let user = meta.metadata.unwrap();
        assert_eq!(user.len(), 2);
        assert_eq!(user["color"], "blue");
        assert_eq!(user["shape"], "round");
        assert!(meta.cache_control.is_none());
    }

    #[test]
    fn test_etag_from_md5() {
        // MD5 of the empty string.
        assert_eq!(
            etag_from_md5("1B2M2Y8AsgTpgAmY7PhCfg==").as_deref(),
            Some("\"d41d8cd98f00b204e9800998ecf8427e\"")
        );
        assert!(etag_from_md5("not base64!").is_none());
    }

    #[test]
    fn test_last_modified_uses_gmt() {
        let formatted = last_modified("2024-03-01T12:30:45+02:00").unwrap();
        assert!(formatted.ends_with("GMT"));
        assert_eq!(formatted, "Fri, 01 Mar 2024 10:30:45 GMT");
    }
}
