use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Default cap on request bodies accepted for fingerprinting.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

const FINGERPRINT_DOMAIN: &[u8] = b"idempotency-fingerprint-v1";

/// Request content that identifies a logical operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

impl NormalizedRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            body: body.into(),
        }
    }
}

/// SHA-256 digest of a normalized request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(format!("fingerprint must be 64 hex characters, got {}", s.len()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| format!("invalid fingerprint hex: {}", e))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Derives deterministic fingerprints from request content. Pure, no I/O.
#[derive(Debug, Clone)]
pub struct FingerprintEngine {
    max_body_bytes: usize,
}

impl Default for FingerprintEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY_BYTES)
    }
}

impl FingerprintEngine {
    pub fn new(max_body_bytes: usize) -> Self {
        Self { max_body_bytes }
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn fingerprint(&self, request: &NormalizedRequest) -> Result<Fingerprint> {
        if request.body.len() > self.max_body_bytes {
            return Err(AppError::InvalidInput(format!(
                "request body of {} bytes exceeds the {} byte fingerprint limit",
                request.body.len(),
                self.max_body_bytes
            )));
        }

        let method = normalize_method(&request.method)?;
        let path = normalize_path(&request.path)?;
        let (body_kind, body) = normalize_body(&request.body)?;

        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        update_field(&mut hasher, b"method", method.as_bytes());
        update_field(&mut hasher, b"path", path.as_bytes());
        update_field(&mut hasher, body_kind, &body);

        Ok(Fingerprint(hasher.finalize().into()))
    }
}

// Length-prefixed so adjacent fields can never be re-split into a collision.
fn update_field(hasher: &mut Sha256, tag: &[u8], value: &[u8]) {
    hasher.update(tag);
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value);
}

fn normalize_method(method: &str) -> Result<String> {
    let method = method.trim();
    if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(AppError::InvalidInput(format!("invalid request method '{}'", method)));
    }
    Ok(method.to_ascii_uppercase())
}

/// Drops a trailing slash and sorts query pairs.
fn normalize_path(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if !raw.starts_with('/') {
        return Err(AppError::InvalidInput(format!("request path '{}' must start with '/'", raw)));
    }

    let (path, query) = match raw.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (raw, None),
    };

    let path = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };
    let path = if path.is_empty() { "/" } else { path };

    let mut pairs: Vec<&str> = query
        .map(|q| q.split('&').filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    pairs.sort_unstable();

    if pairs.is_empty() {
        Ok(path.to_string())
    } else {
        Ok(format!("{}?{}", path, pairs.join("&")))
    }
}

fn normalize_body(body: &[u8]) -> Result<(&'static [u8], Vec<u8>)> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok((b"json", b"null".to_vec()));
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(value) => {
            let canonical = serde_json::to_vec(&canonicalize(value))
                .map_err(|e| AppError::InvalidInput(format!("cannot normalize body: {}", e)))?;
            Ok((b"json", canonical))
        }
        Err(_) => Ok((b"raw", body.to_vec())),
    }
}

/// Rebuilds objects with keys inserted in sorted order, whatever map backs `Value`.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
