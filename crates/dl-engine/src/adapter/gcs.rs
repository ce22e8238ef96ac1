//! GCS source adapter: the JSON API over HTTPS, authenticated with a
//! service-account JWT. The teacher crate never touched GCS directly, but its
//! own `reqwest::blocking` request idiom (seen in [`super::http`]) carries
//! over unchanged; only the auth and endpoint differ.

use std::io::Read;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, RANGE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{ObjectMeta, RangeSpec, SourceAdapter};
use crate::config::ProbeOverride;
use crate::error::AdapterError;

const SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_only";
const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    TOKEN_URI.to_string()
}

#[derive(Serialize)]
struct Claims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    access_token: String,
    expires_at: SystemTime,
}

pub struct GcsAdapter {
    client: Client,
    bucket: String,
    object: String,
    key: ServiceAccountKey,
    token: Mutex<Option<CachedToken>>,
    probe_override: ProbeOverride,
}

impl GcsAdapter {
    pub fn new(bucket: impl Into<String>, object: impl Into<String>, probe_override: ProbeOverride) -> anyhow::Result<Self> {
        let raw = std::env::var("GOOGLE_APPLICATION_CREDENTIALS_JSON")
            .map_err(|_| anyhow::anyhow!("GOOGLE_APPLICATION_CREDENTIALS_JSON is not set"))?;
        let key: ServiceAccountKey = serde_json::from_str(&raw)?;
        Ok(Self {
            client: Client::new(),
            bucket: bucket.into(),
            object: object.into(),
            key,
            token: Mutex::new(None),
            probe_override,
        })
    }

    fn mint_assertion(&self) -> anyhow::Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: self.key.client_email.clone(),
            scope: SCOPE.to_string(),
            aud: self.key.token_uri.clone(),
            iat: now,
            exp: now + 3600,
        };
        let encoding_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())?;
        let token = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)?;
        Ok(token)
    }

    fn access_token(&self) -> Result<String, AdapterError> {
        let mut guard = self.token.lock().unwrap();
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > SystemTime::now() + Duration::from_secs(60) {
                return Ok(cached.access_token.clone());
            }
        }

        let assertion = self
            .mint_assertion()
            .map_err(|e| AdapterError::Other(e.to_string()))?;

        let resp = self
            .client
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .map_err(|e| AdapterError::Transient(e.into()))?;

        if !resp.status().is_success() {
            return Err(AdapterError::Other(format!(
                "token exchange failed: {}",
                resp.status()
            )));
        }

        let body: TokenResponse = resp
            .json()
            .map_err(|e| AdapterError::Other(e.to_string()))?;
        let expires_at = UNIX_EPOCH + Duration::from_secs(0) + (SystemTime::now().duration_since(UNIX_EPOCH).unwrap())
            + Duration::from_secs(body.expires_in.max(0) as u64);

        *guard = Some(CachedToken {
            access_token: body.access_token.clone(),
            expires_at,
        });
        Ok(body.access_token)
    }

    fn media_url(&self) -> String {
        format!(
            "https://storage.googleapis.com/storage/v1/b/{}/o/{}?alt=media",
            self.bucket,
            object_path_segment(&self.object)
        )
    }

    fn metadata_url(&self) -> String {
        format!(
            "https://storage.googleapis.com/storage/v1/b/{}/o/{}",
            self.bucket,
            object_path_segment(&self.object)
        )
    }

    fn classify_status(status: StatusCode) -> Result<(), AdapterError> {
        if status.is_success() {
            return Ok(());
        }
        match status {
            StatusCode::NOT_FOUND => Err(AdapterError::NotFound),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                Err(AdapterError::Throttled)
            }
            other => Err(AdapterError::Other(format!("unexpected status: {other}"))),
        }
    }
}

/// RFC 3986 unreserved characters stay literal; everything else, including
/// `/`, gets percent-encoded so a multi-segment object name is addressed as
/// one opaque path segment rather than nested directories.
const PATH_SEGMENT: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn object_path_segment(object: &str) -> String {
    percent_encoding::utf8_percent_encode(object, &PATH_SEGMENT).to_string()
}

impl SourceAdapter for GcsAdapter {
    fn probe(&self, chunk_size: u64) -> Result<ObjectMeta, AdapterError> {
        if let Some(size) = self.probe_override.content_length {
            let supports_range = size > chunk_size && self.probe_override.accept_ranges.unwrap_or(true);
            return Ok(ObjectMeta {
                size,
                supports_range,
                supports_multipart: false,
            });
        }

        let token = self.access_token()?;
        let resp = self
            .client
            .get(self.metadata_url())
            .bearer_auth(token)
            .send()
            .map_err(|e| AdapterError::Transient(e.into()))?;
        Self::classify_status(resp.status())?;

        #[derive(Deserialize)]
        struct ObjectInfo {
            size: String,
        }
        let info: ObjectInfo = resp
            .json()
            .map_err(|e| AdapterError::Other(e.to_string()))?;
        let size: u64 = info
            .size
            .parse()
            .map_err(|_| AdapterError::Other("invalid size field".to_string()))?;

        Ok(ObjectMeta {
            size,
            supports_range: size > chunk_size,
            supports_multipart: false,
        })
    }

    fn get_all(&self) -> Result<Box<dyn Read + Send>, AdapterError> {
        let token = self.access_token()?;
        let resp = self
            .client
            .get(self.media_url())
            .bearer_auth(token)
            .send()
            .map_err(|e| AdapterError::Transient(e.into()))?;
        Self::classify_status(resp.status())?;
        Ok(Box::new(resp))
    }

    fn get_range(&self, range: RangeSpec) -> Result<Box<dyn Read + Send>, AdapterError> {
        let token = self.access_token()?;
        let resp = self
            .client
            .get(self.media_url())
            .bearer_auth(token)
            .header(RANGE, HeaderValue::from_str(&range.to_header_value()).unwrap())
            .send()
            .map_err(|e| AdapterError::Transient(e.into()))?;

        let status = resp.status();
        if status != StatusCode::PARTIAL_CONTENT && range.start != 0 {
            Self::classify_status(status)?;
        } else if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            Self::classify_status(status)?;
        }

        Ok(Box::new(resp))
    }

    fn get_multipart(&self, _ranges: &[RangeSpec]) -> Result<Box<dyn Read + Send>, AdapterError> {
        // GCS's JSON API does not serve multipart/byteranges bodies.
        Err(AdapterError::NotMultipart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_maps_404_to_not_found() {
        assert!(matches!(
            GcsAdapter::classify_status(StatusCode::NOT_FOUND),
            Err(AdapterError::NotFound)
        ));
    }

    #[test]
    fn classify_status_maps_429_to_throttled() {
        assert!(matches!(
            GcsAdapter::classify_status(StatusCode::TOO_MANY_REQUESTS),
            Err(AdapterError::Throttled)
        ));
    }

    #[test]
    fn classify_status_passes_through_success() {
        assert!(GcsAdapter::classify_status(StatusCode::OK).is_ok());
    }

    #[test]
    fn object_path_segment_encodes_slashes() {
        assert_eq!(object_path_segment("dir/file.tar.gz"), "dir%2Ffile.tar.gz");
    }
}
