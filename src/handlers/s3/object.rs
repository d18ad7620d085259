//! Object-level S3 operations.
//!
//! HEAD, GET (ranged), PUT (plain and chunked-signed), DELETE, and the
//! multipart family.  Every operation dispatches on the tenant's
//! destination: GCS translation or re-signed S3 passthrough.
//!
//! Multipart on GCS is emulated: parts land as sibling objects named
//! `<key>-part-<n>` and are recorded in an on-disk manifest; completion
//! composes them server-side and cleans up.

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, RANGE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use md5::{Digest, Md5};
use std::sync::Arc;
use tracing::{info, warn};

use super::{parse_query, Destination, S3Tenant};
use crate::chunked::{self, ChunkedDecoder};
use crate::convert;
use crate::errors::SidecarError;
use crate::gcp::gcs::ByteRange;
use crate::handlers::map_sdk_error;
use crate::multipart::{part_object_key, sort_by_part_number, PartRecord};
use crate::upload::{self, UploadRequest};
use crate::xml;

type PayloadStream = BoxStream<'static, Result<Bytes, SidecarError>>;

/// Turn the incoming body into the raw payload stream, stripping
/// chunked-signed framing when present, and report the declared length.
fn payload_stream(headers: &HeaderMap, body: Body) -> (PayloadStream, Option<u64>) {
    let raw = body
        .into_data_stream()
        .map_err(|e| SidecarError::BadRequest(format!("request body read failed: {e}")));
    if chunked::is_chunked_signed(headers) {
        (
            ChunkedDecoder::new(raw).boxed(),
            chunked::decoded_content_length(headers),
        )
    } else {
        let declared = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        (raw.boxed(), declared)
    }
}

fn xml_response(status: StatusCode, body: String) -> Response {
    (status, [(CONTENT_TYPE, "application/xml")], body).into_response()
}

fn etag_response(status: StatusCode, etag: Option<&str>) -> Response {
    let mut response = (status, "").into_response();
    if let Some(etag) = etag {
        if let Ok(value) = HeaderValue::from_str(etag) {
            response.headers_mut().insert(ETAG, value);
        }
    }
    response
}

/// Map the headers of an S3 passthrough response onto the client response.
#[allow(clippy::too_many_arguments)]
fn aws_object_headers(
    headers: &mut HeaderMap,
    content_length: Option<i64>,
    content_type: Option<&str>,
    etag: Option<&str>,
    cache_control: Option<&str>,
    last_modified: Option<aws_sdk_s3::primitives::DateTime>,
    content_range: Option<&str>,
    accept_ranges: Option<&str>,
) {
    if let Some(length) = content_length {
        if let Ok(value) = HeaderValue::from_str(&length.to_string()) {
            headers.insert(CONTENT_LENGTH, value);
        }
    }
    if let Some(content_type) = content_type {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
    }
    if let Some(etag) = etag {
        if let Ok(value) = HeaderValue::from_str(etag) {
            headers.insert(ETAG, value);
        }
    }
    if let Some(cache_control) = cache_control {
        if let Ok(value) = HeaderValue::from_str(cache_control) {
            headers.insert(CACHE_CONTROL, value);
        }
    }
    if let Some(modified) = last_modified {
        if let Ok(time) = std::time::SystemTime::try_from(modified) {
            if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(time)) {
                headers.insert("last-modified", value);
            }
        }
    }
    if let Some(content_range) = content_range {
        if let Ok(value) = HeaderValue::from_str(content_range) {
            headers.insert(CONTENT_RANGE, value);
        }
    }
    if let Some(accept_ranges) = accept_ranges {
        if let Ok(value) = HeaderValue::from_str(accept_ranges) {
            headers.insert("accept-ranges", value);
        }
    }
}

// -- HEAD --------------------------------------------------------------------

pub async fn handle_head(
    State(tenant): State<Arc<S3Tenant>>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, SidecarError> {
    match tenant.dest() {
        Destination::Gcs { gcs, .. } => {
            let bucket = tenant.rename_bucket(&bucket);
            let meta = gcs.object_meta(&bucket, &key).await?;
            let mut response = StatusCode::OK.into_response();
            convert::gcs_meta_to_headers(&meta, response.headers_mut());
            Ok(response)
        }
        Destination::Aws { client } => {
            let resp = client
                .head_object()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| map_sdk_error("head_object", e))?;
            let mut response = StatusCode::OK.into_response();
            aws_object_headers(
                response.headers_mut(),
                resp.content_length(),
                resp.content_type(),
                resp.e_tag(),
                resp.cache_control(),
                resp.last_modified().copied(),
                None,
                resp.accept_ranges(),
            );
            Ok(response)
        }
    }
}

// -- GET ---------------------------------------------------------------------

pub async fn handle_get(
    State(tenant): State<Arc<S3Tenant>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, SidecarError> {
    let range = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ByteRange::parse);

    match tenant.dest() {
        Destination::Gcs { gcs, .. } => {
            let bucket = tenant.rename_bucket(&bucket);
            let meta = gcs.object_meta(&bucket, &key).await?;

            // Headers are committed before the first body byte.
            let mut response_headers = HeaderMap::new();
            convert::gcs_meta_to_headers(&meta, &mut response_headers);
            if range.is_some() {
                // A ranged body is shorter than the object; let the
                // server frame it instead of lying about the length.
                response_headers.remove(CONTENT_LENGTH);
            }

            let reader = gcs.reader(&bucket, &key, range.as_ref()).await?;
            let mut response = Response::new(Body::from_stream(reader));
            *response.headers_mut() = response_headers;
            Ok(response)
        }
        Destination::Aws { client } => {
            let mut req = client.get_object().bucket(&bucket).key(&key);
            if let Some(range) = &range {
                req = req.range(range.header_value());
            }
            let resp = req
                .send()
                .await
                .map_err(|e| map_sdk_error("get_object", e))?;

            let mut response_headers = HeaderMap::new();
            aws_object_headers(
                &mut response_headers,
                resp.content_length(),
                resp.content_type(),
                resp.e_tag(),
                resp.cache_control(),
                resp.last_modified().copied(),
                resp.content_range(),
                resp.accept_ranges(),
            );

            let data = resp
                .body
                .collect()
                .await
                .map_err(|e| SidecarError::UpstreamTransient(format!("get_object body: {e}")))?
                .into_bytes();

            let mut response = Response::new(Body::from(data));
            *response.headers_mut() = response_headers;
            Ok(response)
        }
    }
}

// -- PUT ---------------------------------------------------------------------

pub async fn handle_put(
    State(tenant): State<Arc<S3Tenant>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, SidecarError> {
    let query = parse_query(raw_query.as_deref());
    if let Some(upload_id) = query.get("uploadId") {
        let part_number: u32 = query
            .get("partNumber")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| SidecarError::BadRequest("invalid or missing partNumber".into()))?;
        return upload_part(&tenant, &bucket, &key, upload_id, part_number, &headers, body).await;
    }
    put_object(&tenant, &bucket, &key, &headers, body).await
}

async fn put_object(
    tenant: &S3Tenant,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, SidecarError> {
    let meta = convert::headers_to_gcs_meta(headers);
    let (stream, declared_length) = payload_stream(headers, body);

    match tenant.dest() {
        Destination::Gcs { gcs, .. } => {
            let request = UploadRequest {
                bucket: tenant.rename_bucket(bucket),
                key: key.to_string(),
                meta,
                body: stream,
                declared_length,
            };
            let stored = upload::copy_to_gcs(gcs, request).await?;
            let etag = stored.md5_hash.as_deref().and_then(convert::etag_from_md5);
            Ok(etag_response(StatusCode::OK, etag.as_deref()))
        }
        Destination::Aws { client } => {
            let request = UploadRequest {
                bucket: bucket.to_string(),
                key: key.to_string(),
                meta,
                body: stream,
                declared_length,
            };
            let etag = upload::copy_to_s3(client, request).await?;
            Ok(etag_response(StatusCode::OK, etag.as_deref()))
        }
    }
}

// -- Multipart: upload part --------------------------------------------------

async fn upload_part(
    tenant: &S3Tenant,
    bucket: &str,
    key: &str,
    upload_id: &str,
    part_number: u32,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, SidecarError> {
    let (stream, declared_length) = payload_stream(headers, body);

    match tenant.dest() {
        Destination::Gcs { gcs, manifests } => {
            if !manifests.exists(upload_id).await? {
                return Err(SidecarError::NoSuchUpload {
                    upload_id: upload_id.to_string(),
                });
            }

            let part_key = part_object_key(key, part_number);
            let request = UploadRequest {
                bucket: tenant.rename_bucket(bucket),
                key: part_key.clone(),
                meta: convert::headers_to_gcs_meta(headers),
                body: stream,
                declared_length,
            };
            let stored = upload::copy_to_gcs(gcs, request).await?;
            let etag = stored
                .md5_hash
                .as_deref()
                .and_then(convert::etag_from_md5)
                .ok_or_else(|| {
                    SidecarError::Internal(anyhow::anyhow!("no md5 in stored part metadata"))
                })?;

            manifests.append(upload_id, &etag, &part_key).await?;
            Ok(etag_response(StatusCode::OK, Some(&etag)))
        }
        Destination::Aws { client } => {
            let body =
                upload::collect_body(crate::upload::LengthCheckedStream::new(stream, declared_length))
                    .await?;
            let resp = client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number as i32)
                .body(aws_sdk_s3::primitives::ByteStream::from(body))
                .send()
                .await
                .map_err(|e| map_sdk_error("upload_part", e))?;
            Ok(etag_response(StatusCode::OK, resp.e_tag()))
        }
    }
}

// -- POST: initiate / complete ----------------------------------------------

pub async fn handle_post(
    State(tenant): State<Arc<S3Tenant>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    body: Bytes,
) -> Result<Response, SidecarError> {
    let query = parse_query(raw_query.as_deref());
    if query.contains_key("uploads") {
        return create_multipart(&tenant, &bucket, &key).await;
    }
    if let Some(upload_id) = query.get("uploadId") {
        return complete_multipart(&tenant, &bucket, &key, upload_id, &body).await;
    }
    Err(SidecarError::BadRequest(
        "POST on an object requires ?uploads or ?uploadId".into(),
    ))
}

async fn create_multipart(
    tenant: &S3Tenant,
    bucket: &str,
    key: &str,
) -> Result<Response, SidecarError> {
    let upload_id = match tenant.dest() {
        Destination::Gcs { manifests, .. } => {
            let upload_id = uuid::Uuid::new_v4().to_string();
            manifests.create(&upload_id).await?;
            info!("initiated multipart upload {upload_id} for {bucket}/{key}");
            upload_id
        }
        Destination::Aws { client } => {
            let resp = client
                .create_multipart_upload()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| map_sdk_error("create_multipart_upload", e))?;
            resp.upload_id()
                .ok_or_else(|| {
                    SidecarError::Internal(anyhow::anyhow!("no upload id from destination"))
                })?
                .to_string()
        }
    };

    Ok(xml_response(
        StatusCode::OK,
        xml::render_initiate_multipart_upload_result(bucket, key, &upload_id),
    ))
}

/// ETag of a completed multipart object: MD5 over the concatenated
/// binary part digests, suffixed with the part count.
fn composite_etag(records: &[PartRecord]) -> Option<String> {
    let mut combined: Vec<u8> = Vec::new();
    for record in records {
        let hex_digest = record.etag.trim_matches('"');
        combined.extend_from_slice(&hex::decode(hex_digest).ok()?);
    }
    if combined.is_empty() {
        return None;
    }
    let mut hasher = Md5::new();
    hasher.update(&combined);
    Some(format!(
        "\"{}-{}\"",
        hex::encode(hasher.finalize()),
        records.len()
    ))
}

/// Resolve a Complete whose manifest is already consumed.
///
/// `recorded` is the composed ETag written when the upload finished the
/// first time; `object` is the current lookup of the final key.  The
/// repeat is idempotent only when the object is still there and its
/// ETag does not contradict the record — composed objects carry no MD5,
/// so a plain digest on the key means it was overwritten by a simple
/// upload since composition.
fn repeated_complete_etag(
    recorded: &str,
    object: Result<crate::gcp::gcs::ObjectMeta, SidecarError>,
) -> Result<String, SidecarError> {
    let meta = match object {
        Ok(meta) => meta,
        Err(SidecarError::UpstreamNotFound { .. }) => {
            return Err(SidecarError::PreconditionFailed)
        }
        Err(e) => return Err(e),
    };
    match meta.md5_hash.as_deref().and_then(convert::etag_from_md5) {
        Some(current) if current != recorded => Err(SidecarError::PreconditionFailed),
        _ => Ok(recorded.to_string()),
    }
}

async fn complete_multipart(
    tenant: &S3Tenant,
    bucket: &str,
    key: &str,
    upload_id: &str,
    body: &[u8],
) -> Result<Response, SidecarError> {
    match tenant.dest() {
        Destination::Gcs { gcs, manifests } => {
            let dest_bucket = tenant.rename_bucket(bucket);

            let mut records = match manifests.read(upload_id).await {
                Ok(records) => records,
                Err(SidecarError::NoSuchUpload { .. }) => {
                    // A concurrent or repeated Complete consumed the
                    // manifest already.  Idempotent only when the final
                    // object still matches the ETag recorded when this
                    // upload was composed; anything else failed a
                    // precondition.
                    let Some(recorded) = manifests.completed_etag(upload_id).await? else {
                        return Err(SidecarError::PreconditionFailed);
                    };
                    let etag =
                        repeated_complete_etag(&recorded, gcs.object_meta(&dest_bucket, key).await)?;
                    return Ok(xml_response(
                        StatusCode::OK,
                        xml::render_complete_multipart_upload_result(
                            &format!("/{bucket}/{key}"),
                            bucket,
                            key,
                            &etag,
                        ),
                    ));
                }
                Err(e) => return Err(e),
            };

            if records.is_empty() {
                return Err(SidecarError::BadRequest(
                    "multipart upload has no parts".into(),
                ));
            }
            sort_by_part_number(&mut records);

            let sources: Vec<String> = records.iter().map(|r| r.part_key.clone()).collect();

            // On compose failure the manifest stays so the client can
            // retry or abort.
            let composed = gcs.compose_all(&dest_bucket, &sources, key, None).await?;

            let etag = composite_etag(&records)
                .or_else(|| composed.md5_hash.as_deref().and_then(convert::etag_from_md5))
                .unwrap_or_default();

            // The record must land before the manifest goes away, or a
            // repeated Complete has nothing to compare against.
            manifests.record_completed(upload_id, &etag).await?;

            for record in &records {
                if let Err(e) = gcs.delete_object(&dest_bucket, &record.part_key).await {
                    warn!("failed to delete part object {}: {e}", record.part_key);
                }
            }
            manifests.delete(upload_id).await?;

            info!("completed multipart upload {upload_id} for {bucket}/{key}");

            Ok(xml_response(
                StatusCode::OK,
                xml::render_complete_multipart_upload_result(
                    &format!("/{bucket}/{key}"),
                    bucket,
                    key,
                    &etag,
                ),
            ))
        }
        Destination::Aws { client } => {
            let parts = parse_complete_request(body)?;
            let completed = aws_sdk_s3::types::CompletedMultipartUpload::builder()
                .set_parts(Some(
                    parts
                        .into_iter()
                        .map(|(part_number, etag)| {
                            aws_sdk_s3::types::CompletedPart::builder()
                                .part_number(part_number)
                                .e_tag(etag)
                                .build()
                        })
                        .collect(),
                ))
                .build();

            let resp = client
                .complete_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .multipart_upload(completed)
                .send()
                .await
                .map_err(|e| map_sdk_error("complete_multipart_upload", e))?;

            Ok(xml_response(
                StatusCode::OK,
                xml::render_complete_multipart_upload_result(
                    resp.location().unwrap_or(""),
                    bucket,
                    key,
                    resp.e_tag().unwrap_or(""),
                ),
            ))
        }
    }
}

/// Parse the `<CompleteMultipartUpload>` request document into
/// `(part_number, etag)` pairs, preserving the client's order.
fn parse_complete_request(body: &[u8]) -> Result<Vec<(i32, String)>, SidecarError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut parts = Vec::new();
    let mut current_tag: Vec<u8> = Vec::new();
    let mut part_number: Option<i32> = None;
    let mut etag: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => current_tag = e.name().as_ref().to_vec(),
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| SidecarError::BadRequest(format!("bad XML body: {e}")))?;
                match current_tag.as_slice() {
                    b"PartNumber" => {
                        part_number = Some(text.trim().parse().map_err(|_| {
                            SidecarError::BadRequest(format!("bad PartNumber {text:?}"))
                        })?);
                    }
                    b"ETag" => etag = Some(text.into_owned()),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"Part" {
                    match (part_number.take(), etag.take()) {
                        (Some(number), Some(tag)) => parts.push((number, tag)),
                        _ => {
                            return Err(SidecarError::BadRequest(
                                "Part missing PartNumber or ETag".into(),
                            ));
                        }
                    }
                }
                current_tag.clear();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(SidecarError::BadRequest(format!("bad XML body: {e}"))),
        }
    }

    if parts.is_empty() {
        return Err(SidecarError::BadRequest("no parts in request".into()));
    }
    Ok(parts)
}

// -- DELETE: abort / delete object -------------------------------------------

pub async fn handle_delete(
    State(tenant): State<Arc<S3Tenant>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, SidecarError> {
    let query = parse_query(raw_query.as_deref());
    if let Some(upload_id) = query.get("uploadId") {
        return abort_multipart(&tenant, &bucket, &key, upload_id).await;
    }

    match tenant.dest() {
        Destination::Gcs { gcs, .. } => {
            let bucket = tenant.rename_bucket(&bucket);
            gcs.delete_object(&bucket, &key).await?;
        }
        Destination::Aws { client } => {
            client
                .delete_object()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| map_sdk_error("delete_object", e))?;
        }
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn abort_multipart(
    tenant: &S3Tenant,
    bucket: &str,
    key: &str,
    upload_id: &str,
) -> Result<Response, SidecarError> {
    match tenant.dest() {
        Destination::Gcs { gcs, manifests } => {
            let dest_bucket = tenant.rename_bucket(bucket);
            let records = manifests.read(upload_id).await?;
            for record in &records {
                if let Err(e) = gcs.delete_object(&dest_bucket, &record.part_key).await {
                    warn!("failed to delete part object {}: {e}", record.part_key);
                }
            }
            manifests.delete(upload_id).await?;
            info!("aborted multipart upload {upload_id} for {bucket}/{key}");
        }
        Destination::Aws { client } => {
            client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await
                .map_err(|e| map_sdk_error("abort_multipart_upload", e))?;
        }
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_request() {
        let body = br#"<CompleteMultipartUpload>
            <Part><PartNumber>1</PartNumber><ETag>"etag1"</ETag></Part>
            <Part><PartNumber>2</PartNumber><ETag>"etag2"</ETag></Part>
        </CompleteMultipartUpload>"#;
        let parts = parse_complete_request(body).unwrap();
        assert_eq!(
            parts,
            vec![(1, "\"etag1\"".to_string()), (2, "\"etag2\"".to_string())]
        );
    }

    #[test]
    fn test_parse_complete_request_rejects_empty() {
        assert!(matches!(
            parse_complete_request(b"<CompleteMultipartUpload></CompleteMultipartUpload>"),
            Err(SidecarError::BadRequest(_))
        ));
    }

    #[test]
    fn test_parse_complete_request_rejects_partial_part() {
        let body = b"<CompleteMultipartUpload><Part><PartNumber>1</PartNumber></Part></CompleteMultipartUpload>";
        assert!(matches!(
            parse_complete_request(body),
            Err(SidecarError::BadRequest(_))
        ));
    }

    #[test]
    fn test_composite_etag() {
        let records = vec![
            PartRecord {
                etag: "\"7ac66c0f148de9519b8bd264312c4d64\"".into(),
                part_key: "k-part-1".into(),
            },
            PartRecord {
                etag: "\"d41d8cd98f00b204e9800998ecf8427e\"".into(),
                part_key: "k-part-2".into(),
            },
        ];
        let etag = composite_etag(&records).unwrap();
        assert!(etag.starts_with('"'));
        assert!(etag.ends_with("-2\""));
        let inner = etag.trim_matches('"');
        assert_eq!(inner[..inner.rfind('-').unwrap()].len(), 32);
    }

    #[test]
    fn test_composite_etag_requires_hex_digests() {
        let records = vec![PartRecord {
            etag: "\"not-hex\"".into(),
            part_key: "k-part-1".into(),
        }];
        assert!(composite_etag(&records).is_none());
        assert!(composite_etag(&[]).is_none());
    }

    use crate::gcp::gcs::ObjectMeta;

    fn composite_object() -> ObjectMeta {
        // Compose results carry no md5Hash.
        ObjectMeta {
            name: Some("big".into()),
            size: Some("5".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_repeated_complete_accepts_surviving_composite() {
        let etag = repeated_complete_etag("\"abc-2\"", Ok(composite_object())).unwrap();
        assert_eq!(etag, "\"abc-2\"");
    }

    #[test]
    fn test_repeated_complete_accepts_matching_digest() {
        let meta = ObjectMeta {
            md5_hash: Some("kAFQmDzST7DWlj99KOF/cg==".into()),
            ..Default::default()
        };
        let recorded = "\"900150983cd24fb0d6963f7d28e17f72\"";
        assert_eq!(repeated_complete_etag(recorded, Ok(meta)).unwrap(), recorded);
    }

    #[test]
    fn test_repeated_complete_rejects_overwritten_key() {
        // The key now holds a simple upload with a different digest.
        let meta = ObjectMeta {
            md5_hash: Some("1B2M2Y8AsgTpgAmY7PhCfg==".into()),
            ..Default::default()
        };
        let err = repeated_complete_etag("\"abc-2\"", Ok(meta)).unwrap_err();
        assert!(matches!(err, SidecarError::PreconditionFailed));
    }

    #[test]
    fn test_repeated_complete_rejects_missing_object() {
        let err = repeated_complete_etag(
            "\"abc-2\"",
            Err(SidecarError::UpstreamNotFound {
                resource: "big".into(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, SidecarError::PreconditionFailed));
    }

    #[test]
    fn test_repeated_complete_propagates_lookup_failures() {
        // A transient destination failure is not a precondition verdict.
        let err = repeated_complete_etag(
            "\"abc-2\"",
            Err(SidecarError::UpstreamTransient("503".into())),
        )
        .unwrap_err();
        assert!(matches!(err, SidecarError::UpstreamTransient(_)));
    }

    async fn gcs_tenant(manifest_dir: &std::path::Path) -> Arc<S3Tenant> {
        let yaml = format!(
            r#"
port: 1
service_type: s3
dest_gcp:
  from_instance_metadata: true
  project: demo
  multipart_db_directory: {}
"#,
            manifest_dir.display()
        );
        let config: crate::config::TenantConfig = serde_yaml::from_str(&yaml).unwrap();
        S3Tenant::new("t", &config).await.unwrap()
    }

    const UPLOAD_ID: &str = "11111111-2222-3333-4444-555555555555";

    #[tokio::test]
    async fn test_complete_twice_without_record_is_precondition_failed() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = gcs_tenant(dir.path()).await;

        // No manifest and no completion record: the upload id has no
        // trace the sidecar can verify against, so the repeat fails its
        // precondition rather than claiming idempotent success.
        let err = complete_multipart(&tenant, "b1", "big", UPLOAD_ID, b"")
            .await
            .unwrap_err();
        assert!(matches!(err, SidecarError::PreconditionFailed));
    }

    #[tokio::test]
    async fn test_complete_with_empty_manifest_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = gcs_tenant(dir.path()).await;
        let Destination::Gcs { manifests, .. } = tenant.dest() else {
            panic!("expected GCS destination");
        };
        manifests.create(UPLOAD_ID).await.unwrap();

        let err = complete_multipart(&tenant, "b1", "big", UPLOAD_ID, b"")
            .await
            .unwrap_err();
        assert!(matches!(err, SidecarError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_upload_part_against_unknown_upload_is_no_such_upload() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = gcs_tenant(dir.path()).await;

        let err = upload_part(
            &tenant,
            "b1",
            "big",
            UPLOAD_ID,
            1,
            &HeaderMap::new(),
            Body::from("AAA"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SidecarError::NoSuchUpload { .. }));
    }

    #[test]
    fn test_payload_stream_prefers_decoded_length() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, "100".parse().unwrap());
        headers.insert(
            "x-amz-content-sha256",
            crate::chunked::STREAMING_PAYLOAD.parse().unwrap(),
        );
        headers.insert("x-amz-decoded-content-length", "5".parse().unwrap());
        let (_stream, declared) = payload_stream(&headers, Body::empty());
        assert_eq!(declared, Some(5));
    }

    #[tokio::test]
    async fn test_payload_stream_strips_chunked_framing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-amz-content-sha256",
            crate::chunked::STREAMING_PAYLOAD.parse().unwrap(),
        );
        headers.insert("x-amz-decoded-content-length", "5".parse().unwrap());
        let body = Body::from(
            &b"5;chunk-signature=xx\r\nhello\r\n0;chunk-signature=yy\r\n\r\n"[..],
        );
        let (stream, _) = payload_stream(&headers, body);
        let payload = crate::upload::collect_body(stream).await.unwrap();
        assert_eq!(&payload[..], b"hello");
    }
}
