//! AWS chunked-signed body decoder.
//!
//! SigV4 streaming uploads frame the payload as `aws-chunked`: each chunk
//! is `<hex-size>;chunk-signature=<sig>\r\n<bytes>\r\n`, terminated by a
//! zero-length chunk.  Detection: the request carries
//! `x-amz-content-sha256: STREAMING-AWS4-HMAC-SHA256-PAYLOAD`, and the
//! true payload length travels in `x-amz-decoded-content-length`.
//!
//! [`ChunkedDecoder`] is a pull-mode [`Stream`] wrapper over the raw body
//! stream that yields only the inner payload bytes, so multi-gigabyte
//! uploads are never buffered.  Chunk signatures are not verified; the
//! sidecar discards client authentication and re-signs upstream.
//!
//! The decoder is single-pass and non-restartable.

use axum::http::HeaderMap;
use bytes::{Buf, Bytes, BytesMut};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::errors::SidecarError;

/// Sentinel value of `x-amz-content-sha256` for signed streaming payloads.
pub const STREAMING_PAYLOAD: &str = "STREAMING-AWS4-HMAC-SHA256-PAYLOAD";

/// Upper bound on a size line; anything longer is hostile or corrupt.
const MAX_SIZE_LINE: usize = 4096;

/// Check whether the request body uses chunked-signed framing.
pub fn is_chunked_signed(headers: &HeaderMap) -> bool {
    headers
        .get("x-amz-content-sha256")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == STREAMING_PAYLOAD)
        .unwrap_or(false)
}

/// Read the declared decoded payload length, when present.
pub fn decoded_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("x-amz-decoded-content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

enum DecodeState {
    /// Accumulating a `<hex-size>;chunk-signature=...` line.
    SizeLine,
    /// Passing through `remaining` payload bytes.
    Data { remaining: u64 },
    /// Consuming the CRLF that trails each chunk's payload.
    DataEnd,
    /// Zero-length chunk seen; the stream is finished.
    Done,
}

/// Pull-mode decoder for `aws-chunked` framed bodies.
///
/// Wraps any stream of `Bytes` frames (typically
/// `axum::body::Body::into_data_stream`) and yields the inner payload.
pub struct ChunkedDecoder<S> {
    upstream: S,
    buf: BytesMut,
    state: DecodeState,
}

impl<S> ChunkedDecoder<S> {
    pub fn new(upstream: S) -> Self {
        Self {
            upstream,
            buf: BytesMut::new(),
            state: DecodeState::SizeLine,
        }
    }

    /// Parse the size prefix of a chunk header line.
    fn parse_size_line(line: &[u8]) -> Result<u64, SidecarError> {
        let text = std::str::from_utf8(line)
            .map_err(|_| SidecarError::MalformedChunk("size line is not ASCII".to_string()))?;
        let size_part = text.split(';').next().unwrap_or(text).trim();
        u64::from_str_radix(size_part, 16)
            .map_err(|_| SidecarError::MalformedChunk(format!("bad chunk size {size_part:?}")))
    }

    /// Try to produce the next payload frame from buffered input.
    ///
    /// `Ok(Some(_))` is payload, `Ok(None)` means more input is needed
    /// (or the stream is done when state is `Done`).
    fn decode_buffered(&mut self) -> Result<Option<Bytes>, SidecarError> {
        loop {
            match self.state {
                DecodeState::SizeLine => {
                    let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") else {
                        if self.buf.len() > MAX_SIZE_LINE {
                            return Err(SidecarError::MalformedChunk(
                                "unterminated chunk size line".to_string(),
                            ));
                        }
                        return Ok(None);
                    };
                    let line = self.buf.split_to(pos);
                    self.buf.advance(2);
                    let size = Self::parse_size_line(&line)?;
                    if size == 0 {
                        // Final chunk; whatever trails (empty trailer CRLF)
                        // is irrelevant to the payload.
                        self.state = DecodeState::Done;
                        return Ok(None);
                    }
                    self.state = DecodeState::Data { remaining: size };
                }
                DecodeState::Data { remaining } => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let out = self.buf.split_to(take).freeze();
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        DecodeState::DataEnd
                    } else {
                        DecodeState::Data { remaining: left }
                    };
                    return Ok(Some(out));
                }
                DecodeState::DataEnd => {
                    // Tolerate a bare LF the way other S3 frontends do.
                    if self.buf.starts_with(b"\r\n") {
                        self.buf.advance(2);
                    } else if self.buf.starts_with(b"\n") {
                        self.buf.advance(1);
                    } else if self.buf.len() >= 2 {
                        return Err(SidecarError::MalformedChunk(
                            "missing CRLF after chunk payload".to_string(),
                        ));
                    } else {
                        return Ok(None);
                    }
                    self.state = DecodeState::SizeLine;
                }
                DecodeState::Done => return Ok(None),
            }
        }
    }
}

impl<S, E> Stream for ChunkedDecoder<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, SidecarError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.decode_buffered() {
                Err(e) => return Poll::Ready(Some(Err(e))),
                Ok(Some(bytes)) => return Poll::Ready(Some(Ok(bytes))),
                Ok(None) => {
                    if matches!(this.state, DecodeState::Done) {
                        return Poll::Ready(None);
                    }
                }
            }
            match Pin::new(&mut this.upstream).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buf.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(SidecarError::UpstreamFatal(format!(
                        "request body read failed: {e}"
                    )))));
                }
                Poll::Ready(None) => {
                    // Upstream ended mid-frame.
                    return Poll::Ready(Some(Err(SidecarError::TruncatedBody)));
                }
            }
        }
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    /// Frame a payload the way a SigV4 streaming client does.
    fn frame(payload: &[u8], chunk_size: usize) -> Vec<u8> {
        let mut framed = Vec::new();
        for chunk in payload.chunks(chunk_size.max(1)) {
            framed.extend_from_slice(
                format!("{:x};chunk-signature=deadbeef\r\n", chunk.len()).as_bytes(),
            );
            framed.extend_from_slice(chunk);
            framed.extend_from_slice(b"\r\n");
        }
        framed.extend_from_slice(b"0;chunk-signature=deadbeef\r\n\r\n");
        framed
    }

    /// Run the decoder over `framed` delivered in `piece`-sized frames.
    async fn decode(framed: &[u8], piece: usize) -> Result<Vec<u8>, SidecarError> {
        let frames: Vec<Result<Bytes, std::convert::Infallible>> = framed
            .chunks(piece.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let mut decoder = ChunkedDecoder::new(futures::stream::iter(frames));
        let mut out = Vec::new();
        while let Some(item) = decoder.next().await {
            out.extend_from_slice(&item?);
        }
        Ok(out)
    }

    /// Deterministic pseudo-random payload.
    fn pseudo_random(n: usize) -> Vec<u8> {
        let mut state = 0x2545_f491_4f6c_dd1du64;
        (0..n)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    #[tokio::test]
    async fn test_round_trip_exact_spec_example() {
        let framed = b"5;chunk-signature=xx\r\nhello\r\n0;chunk-signature=yy\r\n\r\n";
        assert_eq!(decode(framed, framed.len()).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_round_trip_random_payloads() {
        for n in [0usize, 1, 31, 1024, 70_000] {
            let payload = pseudo_random(n);
            for chunk_size in [1usize, 17, 8192, 65_536] {
                let framed = frame(&payload, chunk_size);
                let decoded = decode(&framed, 4096).await.unwrap();
                assert_eq!(decoded, payload, "n={n} chunk_size={chunk_size}");
            }
        }
    }

    #[tokio::test]
    async fn test_round_trip_survives_fragmented_delivery() {
        let payload = pseudo_random(1000);
        let framed = frame(&payload, 100);
        // Byte-at-a-time delivery exercises every partial-buffer path.
        for piece in [1usize, 3, 7] {
            assert_eq!(decode(&framed, piece).await.unwrap(), payload);
        }
    }

    #[tokio::test]
    async fn test_malformed_size_line() {
        let framed = b"zz;chunk-signature=xx\r\nhello\r\n";
        let err = decode(framed, framed.len()).await.unwrap_err();
        assert!(matches!(err, SidecarError::MalformedChunk(_)));
    }

    #[tokio::test]
    async fn test_truncated_body() {
        // Declares 10 bytes, delivers 5, then the connection ends.
        let framed = b"a;chunk-signature=xx\r\nhello";
        let err = decode(framed, framed.len()).await.unwrap_err();
        assert!(matches!(err, SidecarError::TruncatedBody));
    }

    #[tokio::test]
    async fn test_missing_terminal_chunk() {
        let framed = b"5;chunk-signature=xx\r\nhello\r\n";
        let err = decode(framed, framed.len()).await.unwrap_err();
        assert!(matches!(err, SidecarError::TruncatedBody));
    }

    #[test]
    fn test_detection_headers() {
        let mut headers = HeaderMap::new();
        assert!(!is_chunked_signed(&headers));
        headers.insert("x-amz-content-sha256", STREAMING_PAYLOAD.parse().unwrap());
        headers.insert("x-amz-decoded-content-length", "5".parse().unwrap());
        assert!(is_chunked_signed(&headers));
        assert_eq!(decoded_content_length(&headers), Some(5));
    }

    #[test]
    fn test_unsigned_sha_is_not_chunked() {
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-content-sha256", "UNSIGNED-PAYLOAD".parse().unwrap());
        assert!(!is_chunked_signed(&headers));
    }
}
