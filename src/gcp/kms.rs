//! Cloud KMS client for payload envelope encryption.
//!
//! When a tenant configures `kms_key_name`, the Kinesis/SQS surfaces wrap
//! message payloads with `encrypt` before publishing and unwrap with
//! `decrypt` on receive.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use super::auth::TokenProvider;
use crate::errors::SidecarError;

/// Cloud KMS JSON API base URL.
const KMS_API_BASE: &str = "https://cloudkms.googleapis.com/v1";

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EncryptResponse {
    ciphertext: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DecryptResponse {
    plaintext: Option<String>,
}

/// KMS client bound to one tenant's credentials and key.
pub struct KmsClient {
    http: reqwest::Client,
    auth: Arc<TokenProvider>,
    /// Full key resource name:
    /// `projects/*/locations/*/keyRings/*/cryptoKeys/*`.
    key_name: String,
}

impl KmsClient {
    pub fn new(http: reqwest::Client, auth: Arc<TokenProvider>, key_name: String) -> Self {
        Self { http, auth, key_name }
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

    async fn call(&self, verb: &str, field: &str, value: &[u8]) -> Result<String, SidecarError> {
        let auth = self.auth_headers().await?;
        let url = format!("{}/{}:{}", KMS_API_BASE, self.key_name, verb);

        debug!("KMS {verb}: key={}", self.key_name);

        let resp = self
            .http
            .post(&url)
            .headers(auth)
            .json(&serde_json::json!({ field: BASE64.encode(value) }))
            .send()
            .await
            .map_err(|e| SidecarError::UpstreamTransient(format!("KMS {verb}: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SidecarError::from_gcp_status(verb, status, &body));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| SidecarError::UpstreamFatal(format!("KMS {verb} decode: {e}")))?;
        Ok(body)
    }

    /// Encrypt a payload, returning the raw ciphertext bytes.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SidecarError> {
        let body = self.call("encrypt", "plaintext", plaintext).await?;
        let parsed: EncryptResponse = serde_json::from_str(&body)
            .map_err(|e| SidecarError::UpstreamFatal(format!("KMS encrypt decode: {e}")))?;
        let ciphertext = parsed
            .ciphertext
            .ok_or_else(|| SidecarError::UpstreamFatal("no ciphertext in response".to_string()))?;
        BASE64
            .decode(ciphertext)
            .map_err(|e| SidecarError::UpstreamFatal(format!("bad ciphertext encoding: {e}")))
    }

    /// Decrypt a payload, returning the raw plaintext bytes.
    pub async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SidecarError> {
        let body = self.call("decrypt", "ciphertext", ciphertext).await?;
        let parsed: DecryptResponse = serde_json::from_str(&body)
            .map_err(|e| SidecarError::UpstreamFatal(format!("KMS decrypt decode: {e}")))?;
        let plaintext = parsed
            .plaintext
            .ok_or_else(|| SidecarError::UpstreamFatal("no plaintext in response".to_string()))?;
        BASE64
            .decode(plaintext)
            .map_err(|e| SidecarError::UpstreamFatal(format!("bad plaintext encoding: {e}")))
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_response_decode() {
        let parsed: EncryptResponse =
            serde_json::from_str(r#"{"name": "k", "ciphertext": "aGVsbG8="}"#).unwrap();
        assert_eq!(parsed.ciphertext.as_deref(), Some("aGVsbG8="));
    }

    #[test]
    fn test_decrypt_response_decode() {
        let parsed: DecryptResponse = serde_json::from_str(r#"{"plaintext": "aGVsbG8="}"#).unwrap();
        assert_eq!(
            BASE64.decode(parsed.plaintext.unwrap()).unwrap(),
            b"hello"
        );
    }
}
