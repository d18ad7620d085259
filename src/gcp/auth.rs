//! OAuth2 token resolution for outbound GCP calls.
//!
//! Each tenant configures exactly one credential source: a service-account
//! key file, the same JSON inline (`raw_key`), or the GCE metadata server.
//! Service-account keys are exchanged for access tokens through the RS256
//! JWT-bearer flow; `authorized_user` credentials (gcloud login) use their
//! refresh token.  Tokens are cached until shortly before expiry.

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::DestGcp;
use crate::errors::SidecarError;

/// OAuth scope covering Storage, Pub/Sub, and KMS.
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Default token endpoint for the JWT-bearer exchange.
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Metadata-server token URL (GCE / GKE workloads).
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

enum CredentialSource {
    /// Path to a service-account JSON key file, read per refresh.
    KeyFile(String),
    /// Inline credential JSON from the config document.
    RawKey(String),
    /// GCE metadata server.
    InstanceMetadata,
}

/// Cached access token with expiry.
struct CachedToken {
    access_token: String,
    expiry: Instant,
}

/// Resolves and caches OAuth2 access tokens for one tenant destination.
pub struct TokenProvider {
    client: reqwest::Client,
    source: CredentialSource,
    cache: Mutex<Option<CachedToken>>,
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

impl TokenProvider {
    /// Build a provider from a tenant's GCP destination config.
    pub fn from_dest(dest: &DestGcp, client: reqwest::Client) -> Self {
        let source = if let Some(path) = &dest.key_file_path {
            CredentialSource::KeyFile(path.clone())
        } else if let Some(raw) = &dest.raw_key {
            CredentialSource::RawKey(raw.clone())
        } else {
            CredentialSource::InstanceMetadata
        };
        Self {
            client,
            source,
            cache: Mutex::new(None),
        }
    }

    /// Return a valid access token, refreshing if the cached one is stale.
    pub async fn token(&self) -> Result<String, SidecarError> {
        {
            let cache = self.cache.lock().expect("token cache mutex poisoned");
            if let Some(cached) = cache.as_ref() {
                if cached.expiry > Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let (token, expires_in) = self.fetch().await?;

        // Cache with a 60 s safety margin.
        let expiry = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));
        {
            let mut cache = self.cache.lock().expect("token cache mutex poisoned");
            *cache = Some(CachedToken {
                access_token: token.clone(),
                expiry,
            });
        }

        Ok(token)
    }

    async fn fetch(&self) -> Result<(String, u64), SidecarError> {
        match &self.source {
            CredentialSource::KeyFile(path) => {
                let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
                    SidecarError::UpstreamAuth(format!("cannot read key file {path}: {e}"))
                })?;
                self.token_from_credential_json(&contents).await
            }
            CredentialSource::RawKey(raw) => self.token_from_credential_json(raw).await,
            CredentialSource::InstanceMetadata => self.token_from_metadata_server().await,
        }
    }

    /// Exchange credential JSON (service account or authorized user) for
    /// an access token.
    async fn token_from_credential_json(&self, contents: &str) -> Result<(String, u64), SidecarError> {
        let creds: serde_json::Value = serde_json::from_str(contents)
            .map_err(|e| SidecarError::UpstreamAuth(format!("bad credential JSON: {e}")))?;

        match creds.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "service_account" => {
                let client_email = required_field(&creds, "client_email")?;
                let private_key = required_field(&creds, "private_key")?;
                let token_uri = creds
                    .get("token_uri")
                    .and_then(|v| v.as_str())
                    .unwrap_or(DEFAULT_TOKEN_URI);
                self.exchange_jwt_for_token(client_email, private_key, token_uri)
                    .await
            }
            "authorized_user" => {
                self.token_from_refresh(
                    creds.get("client_id").and_then(|v| v.as_str()).unwrap_or(""),
                    creds
                        .get("client_secret")
                        .and_then(|v| v.as_str())
                        .unwrap_or(""),
                    creds
                        .get("refresh_token")
                        .and_then(|v| v.as_str())
                        .unwrap_or(""),
                )
                .await
            }
            other => Err(SidecarError::UpstreamAuth(format!(
                "unsupported credential type {other:?}"
            ))),
        }
    }

    /// Sign an RS256 JWT assertion and exchange it for an access token
    /// (service-account flow).
    async fn exchange_jwt_for_token(
        &self,
        client_email: &str,
        private_key_pem: &str,
        token_uri: &str,
    ) -> Result<(String, u64), SidecarError> {
        let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| SidecarError::UpstreamAuth(format!("bad service-account key: {e}")))?;

        let iat = chrono::Utc::now().timestamp();
        let claims = JwtClaims {
            iss: client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: token_uri,
            iat,
            exp: iat + 3600,
        };
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| SidecarError::UpstreamAuth(format!("JWT signing failed: {e}")))?;

        debug!("exchanging service-account JWT for access token ({client_email})");

        let resp = self
            .client
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SidecarError::UpstreamAuth(format!("token exchange failed: {e}")))?;

        Self::parse_token_response(resp).await
    }

    /// Exchange a refresh token for an access token (gcloud user flow).
    async fn token_from_refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<(String, u64), SidecarError> {
        let resp = self
            .client
            .post(DEFAULT_TOKEN_URI)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| SidecarError::UpstreamAuth(format!("token refresh failed: {e}")))?;

        Self::parse_token_response(resp).await
    }

    /// Obtain an access token from the GCE metadata server.
    async fn token_from_metadata_server(&self) -> Result<(String, u64), SidecarError> {
        let resp = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| {
                SidecarError::UpstreamAuth(format!("metadata server unreachable: {e}"))
            })?;

        Self::parse_token_response(resp).await
    }

    async fn parse_token_response(resp: reqwest::Response) -> Result<(String, u64), SidecarError> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SidecarError::UpstreamAuth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let token_resp: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SidecarError::UpstreamAuth(format!("bad token response: {e}")))?;
        let access_token = token_resp
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                SidecarError::UpstreamAuth("no access_token in token response".to_string())
            })?
            .to_string();
        let expires_in = token_resp
            .get("expires_in")
            .and_then(|v| v.as_u64())
            .unwrap_or(3600);

        Ok((access_token, expires_in))
    }
}

fn required_field<'a>(creds: &'a serde_json::Value, name: &str) -> Result<&'a str, SidecarError> {
    creds
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| SidecarError::UpstreamAuth(format!("missing {name} in credential JSON")))
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(key_file: Option<&str>, raw: Option<&str>, metadata: bool) -> DestGcp {
        DestGcp {
            key_file_path: key_file.map(String::from),
            raw_key: raw.map(String::from),
            from_instance_metadata: metadata,
            project: "demo".into(),
            instance: None,
            multipart_db_directory: None,
            shard_count: 1,
            topic_rename: Default::default(),
            kms_key_name: None,
        }
    }

    #[test]
    fn test_source_selection() {
        let p = TokenProvider::from_dest(&dest(Some("/k.json"), None, false), reqwest::Client::new());
        assert!(matches!(p.source, CredentialSource::KeyFile(_)));

        let p = TokenProvider::from_dest(&dest(None, Some("{}"), false), reqwest::Client::new());
        assert!(matches!(p.source, CredentialSource::RawKey(_)));

        let p = TokenProvider::from_dest(&dest(None, None, true), reqwest::Client::new());
        assert!(matches!(p.source, CredentialSource::InstanceMetadata));
    }

    #[tokio::test]
    async fn test_rejects_unknown_credential_type() {
        let p = TokenProvider::from_dest(
            &dest(None, Some(r#"{"type":"mystery"}"#), false),
            reqwest::Client::new(),
        );
        let err = p.fetch().await.unwrap_err();
        assert!(matches!(err, SidecarError::UpstreamAuth(_)));
    }

    #[tokio::test]
    async fn test_rejects_malformed_json() {
        let p = TokenProvider::from_dest(
            &dest(None, Some("not json"), false),
            reqwest::Client::new(),
        );
        assert!(p.fetch().await.is_err());
    }
}
