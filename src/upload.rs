//! Upload adapter: copy a client body into a destination writer.
//!
//! The adapter is destination-agnostic plumbing shared by the PUT and
//! UploadPart paths.  Writer metadata is committed before the first
//! payload byte; the byte count is checked against the declared decoded
//! length and a mismatch fails the upload, so a partial object is never
//! left visible (a failed GCS multipart upload commits nothing, and the
//! S3 path buffers before sending).

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::errors::SidecarError;
use crate::gcp::gcs::{GcsClient, ObjectMeta};

/// A parsed upload: destination coordinates, writer attributes, and the
/// (already de-framed) payload stream.
pub struct UploadRequest<S> {
    pub bucket: String,
    pub key: String,
    pub meta: ObjectMeta,
    pub body: S,
    /// Payload length the client declared, when it declared one.
    pub declared_length: Option<u64>,
}

// -- Length enforcement ------------------------------------------------------

/// Stream wrapper that enforces the declared payload length.
///
/// Overruns fail as soon as they are observed; underruns fail at EOF.
pub struct LengthCheckedStream<S> {
    inner: S,
    expected: Option<u64>,
    seen: u64,
    finished: bool,
}

impl<S> LengthCheckedStream<S> {
    pub fn new(inner: S, expected: Option<u64>) -> Self {
        Self {
            inner,
            expected,
            seen: 0,
            finished: false,
        }
    }
}

impl<S> Stream for LengthCheckedStream<S>
where
    S: Stream<Item = Result<Bytes, SidecarError>> + Unpin,
{
    type Item = Result<Bytes, SidecarError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match futures::ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            Some(Ok(chunk)) => {
                this.seen += chunk.len() as u64;
                if let Some(expected) = this.expected {
                    if this.seen > expected {
                        this.finished = true;
                        return Poll::Ready(Some(Err(SidecarError::BodyLengthMismatch {
                            expected,
                            actual: this.seen,
                        })));
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(e)) => {
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.finished = true;
                if let Some(expected) = this.expected {
                    if this.seen != expected {
                        return Poll::Ready(Some(Err(SidecarError::BodyLengthMismatch {
                            expected,
                            actual: this.seen,
                        })));
                    }
                }
                Poll::Ready(None)
            }
        }
    }
}

// -- Destination writers -----------------------------------------------------

/// Copy the request body into a GCS object writer.
///
/// Returns the stored object's metadata (the source of the ETag the
/// handler reports).
pub async fn copy_to_gcs<S>(
    gcs: &GcsClient,
    req: UploadRequest<S>,
) -> Result<ObjectMeta, SidecarError>
where
    S: Stream<Item = Result<Bytes, SidecarError>> + Send + Unpin + 'static,
{
    let body = LengthCheckedStream::new(req.body, req.declared_length);
    gcs.upload_stream(&req.bucket, &req.key, &req.meta, body)
        .await
}

/// Copy the request body into an S3 object via the AWS uploader.
///
/// The SDK wants a rewindable body, so the payload is drained through the
/// length check into memory first.  Returns the ETag when S3 reports one.
pub async fn copy_to_s3<S>(
    client: &aws_sdk_s3::Client,
    req: UploadRequest<S>,
) -> Result<Option<String>, SidecarError>
where
    S: Stream<Item = Result<Bytes, SidecarError>> + Send + Unpin + 'static,
{
    let body = collect_body(LengthCheckedStream::new(req.body, req.declared_length)).await?;

    let mut put = client
        .put_object()
        .bucket(&req.bucket)
        .key(&req.key)
        .body(aws_sdk_s3::primitives::ByteStream::from(body));
    if let Some(content_type) = &req.meta.content_type {
        put = put.content_type(content_type);
    }
    if let Some(md5) = &req.meta.md5_hash {
        put = put.content_md5(md5);
    }
    if let Some(cache_control) = &req.meta.cache_control {
        put = put.cache_control(cache_control);
    }
    if let Some(metadata) = &req.meta.metadata {
        for (key, value) in metadata {
            put = put.metadata(key, value);
        }
    }

    let resp = put
        .send()
        .await
        .map_err(|e| crate::handlers::map_sdk_error("put_object", e))?;
    Ok(resp.e_tag().map(String::from))
}

/// Drain a payload stream into memory.
pub async fn collect_body<S>(mut stream: S) -> Result<Bytes, SidecarError>
where
    S: Stream<Item = Result<Bytes, SidecarError>> + Unpin,
{
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(out))
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(
        chunks: &[&[u8]],
    ) -> impl Stream<Item = Result<Bytes, SidecarError>> + Unpin {
        futures::stream::iter(
            chunks
                .iter()
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_length_check_passes_exact() {
        let stream = LengthCheckedStream::new(byte_stream(&[b"hel", b"lo"]), Some(5));
        let body = collect_body(stream).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_length_check_no_declared_length() {
        let stream = LengthCheckedStream::new(byte_stream(&[b"anything"]), None);
        assert_eq!(&collect_body(stream).await.unwrap()[..], b"anything");
    }

    #[tokio::test]
    async fn test_length_check_underrun() {
        let stream = LengthCheckedStream::new(byte_stream(&[b"hi"]), Some(5));
        let err = collect_body(stream).await.unwrap_err();
        assert!(matches!(
            err,
            SidecarError::BodyLengthMismatch {
                expected: 5,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_length_check_overrun_fails_midstream() {
        // Three chunks, but the limit trips on the second; the third must
        // never be pulled.
        let stream = LengthCheckedStream::new(byte_stream(&[b"hel", b"lo!", b"extra"]), Some(4));
        let err = collect_body(stream).await.unwrap_err();
        assert!(matches!(
            err,
            SidecarError::BodyLengthMismatch { expected: 4, .. }
        ));
    }

    #[tokio::test]
    async fn test_stream_ends_after_error() {
        let mut stream = LengthCheckedStream::new(byte_stream(&[b"hi"]), Some(5));
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }
}
