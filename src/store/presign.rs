//! SigV4 presigned download URLs for S3-compatible stores.
//!
//! The URL carries a `response-content-disposition` parameter so the browser
//! saves the object under a caller-chosen filename.

use crate::config::PresignConfig;
use crate::error::{RelayError, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write;

/// S3 rejects presigned URLs valid for more than 7 days.
const MAX_EXPIRES_SECS: u64 = 604_800;

const SERVICE: &str = "s3";

/// Signs GET URLs for objects in one bucket.
#[derive(Clone)]
pub struct S3Presigner {
    endpoint: String,
    host: String,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
    expires_secs: u64,
}

impl std::fmt::Debug for S3Presigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Presigner")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("expires_secs", &self.expires_secs)
            .finish_non_exhaustive()
    }
}

impl S3Presigner {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        region: &str,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Result<Self> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let parsed = url::Url::parse(&endpoint)
            .map_err(|e| RelayError::config(format!("Invalid presign endpoint '{endpoint}': {e}")))?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(RelayError::config(format!(
                    "Presign endpoint '{endpoint}' has no host"
                )))
            }
        };
        if bucket.is_empty() {
            return Err(RelayError::config("Presign bucket must not be empty"));
        }

        Ok(Self {
            endpoint,
            host,
            bucket: bucket.to_string(),
            region: region.to_string(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            expires_secs: 3600,
        })
    }

    /// Builds a presigner reading credentials from the configured environment variables.
    pub fn from_config(config: &PresignConfig) -> Result<Self> {
        let read = |var: &str| {
            std::env::var(var).map_err(|_| {
                RelayError::config(format!("Environment variable {var} is not set"))
            })
        };
        let access_key = read(&config.access_key_env)?;
        let secret_key = read(&config.secret_key_env)?;
        Ok(Self::new(
            &config.endpoint,
            &config.bucket,
            &config.region,
            access_key,
            secret_key,
        )?
        .with_expiry(config.expires_secs))
    }

    /// Sets the validity window, capped at 7 days.
    pub fn with_expiry(mut self, secs: u64) -> Self {
        self.expires_secs = secs.clamp(1, MAX_EXPIRES_SECS);
        self
    }

    /// Presigns a GET for `key` that downloads as `filename`.
    pub fn presign_get(&self, key: &str, filename: &str) -> Result<String> {
        self.presign_get_at(key, filename, Utc::now())
    }

    pub fn presign_get_at(&self, key: &str, filename: &str, now: DateTime<Utc>) -> Result<String> {
        let key = key.trim_start_matches('/');
        if key.is_empty() {
            return Err(RelayError::internal("Cannot presign an empty object key"));
        }

        let date = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);

        let canonical_uri = uri_encode_path(&format!("/{}/{}", self.bucket, key));

        let mut params = BTreeMap::new();
        params.insert("X-Amz-Algorithm", "AWS4-HMAC-SHA256".to_string());
        params.insert("X-Amz-Credential", format!("{}/{scope}", self.access_key));
        params.insert("X-Amz-Date", amz_date.clone());
        params.insert("X-Amz-Expires", self.expires_secs.to_string());
        params.insert("X-Amz-SignedHeaders", "host".to_string());
        params.insert(
            "response-content-disposition",
            format!("attachment; filename=\"{}\"", sanitize_filename(filename)),
        );
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode_value(k), uri_encode_value(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "GET\n{canonical_uri}\n{query}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            self.host
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let signature = self.signature(&date, &string_to_sign)?;

        Ok(format!(
            "{}{canonical_uri}?{query}&X-Amz-Signature={signature}",
            self.endpoint
        ))
    }

    fn signature(&self, date: &str, string_to_sign: &str) -> Result<String> {
        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes())?;
        let k_region = hmac_sha256(&k_date, self.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, SERVICE.as_bytes())?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
        Ok(hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| RelayError::internal(format!("HMAC key rejected: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Drops characters that would break the quoted filename.
fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();
    if cleaned.trim().is_empty() {
        "result.csv".to_string()
    } else {
        cleaned
    }
}

fn uri_encode_path(path: &str) -> String {
    encode(path, true)
}

fn uri_encode_value(value: &str) -> String {
    encode(value, false)
}

fn encode(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if keep_slash => out.push('/'),
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}
