//! Inbound webhook envelope and signature checks.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// An HTTP request as handed over by the host's webhook bridge.
///
/// Header lookups ignore case; `body` is the raw, unparsed payload that
/// signatures are computed over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookRequest {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl WebhookRequest {
    pub fn post(body: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.insert(name.to_string(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl WebhookResponse {
    pub fn ok() -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::ok()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }
}

impl Default for WebhookResponse {
    fn default() -> Self {
        Self::ok()
    }
}

/// Hex-encoded HMAC-SHA256 of `message`.
pub fn sign_hmac_sha256(secret: &str, message: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Check a hex HMAC-SHA256 `signature` over `message`, optionally behind a
/// scheme prefix such as `sha256=` or `v0=`. Comparison is constant-time.
pub fn verify_hmac_sha256(secret: &str, message: &[u8], signature: &str, prefix: Option<&str>) -> bool {
    let hex_sig = match prefix {
        Some(p) => match signature.strip_prefix(p) {
            Some(rest) => rest,
            None => {
                warn!("signature header is missing the {} prefix", p);
                return false;
            }
        },
        None => signature,
    };

    let expected = match hex::decode(hex_sig.trim()) {
        Ok(bytes) => bytes,
        Err(_) => {
            warn!("signature header is not valid hex");
            return false;
        }
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(message);
    mac.verify_slice(&expected).is_ok()
}

/// Constant-time string comparison for shared-token checks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Fresh random secret for a webhook registration.
pub fn generate_secret() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}
