//! Coinbase Exchange request signing
//!
//! Every private request carries `CB-ACCESS-KEY`, `CB-ACCESS-SIGN`,
//! `CB-ACCESS-TIMESTAMP` and `CB-ACCESS-PASSPHRASE`. The signature is
//! base64(HMAC-SHA256(base64-decoded secret, timestamp + method + path + body)).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

use crate::gateway::{GatewayError, GatewayResult};

type HmacSha256 = Hmac<Sha256>;

/// API key, base64 secret and passphrase of one API profile
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
    passphrase: String,
}

impl Credentials {
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            passphrase: passphrase.into(),
        }
    }

    /// Build from optional config values, failing on the first missing one
    pub fn from_parts(
        api_key: Option<&str>,
        api_secret: Option<&str>,
        passphrase: Option<&str>,
    ) -> GatewayResult<Self> {
        let require = |value: Option<&str>, name: &str| {
            value
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| GatewayError::Auth(format!("{} must be set", name)))
        };
        Ok(Self {
            api_key: require(api_key, "COINBASE_API_KEY")?,
            api_secret: require(api_secret, "COINBASE_API_SECRET")?,
            passphrase: require(passphrase, "COINBASE_API_PASSPHRASE")?,
        })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    pub fn sign(
        &self,
        timestamp: &str,
        method: &str,
        request_path: &str,
        body: &str,
    ) -> GatewayResult<String> {
        sign_request(&self.api_secret, timestamp, method, request_path, body)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

pub fn sign_request(
    secret: &str,
    timestamp: &str,
    method: &str,
    request_path: &str,
    body: &str,
) -> GatewayResult<String> {
    let key = STANDARD
        .decode(secret)
        .map_err(|e| GatewayError::Auth(format!("API secret is not valid base64: {}", e)))?;
    let mut mac =
        HmacSha256::new_from_slice(&key).map_err(|e| GatewayError::Auth(e.to_string()))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.to_uppercase().as_bytes());
    mac.update(request_path.as_bytes());
    mac.update(body.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}
