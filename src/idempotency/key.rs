use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest key accepted from a client, in bytes.
pub const MAX_KEY_LENGTH: usize = 255;

/// Separates the client id from the key in the storage form.
pub const SCOPE_SEPARATOR: char = ':';

/// Validated, caller-supplied idempotency key.
///
/// A key may be scoped to a client so two clients reusing the same literal
/// key address different records. Unscoped keys and client ids never contain
/// [`SCOPE_SEPARATOR`], so the two storage forms cannot overlap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        validate_component("idempotency key", &raw)?;
        reject_separator("idempotency key without a client id", &raw)?;
        Ok(Self(raw))
    }

    /// Builds the storage form `"{client}:{key}"`.
    pub fn scoped(client_id: &str, raw: &str) -> Result<Self> {
        validate_component("client id", client_id)?;
        validate_component("idempotency key", raw)?;
        reject_separator("client id", client_id)?;
        Ok(Self(format!("{}{}{}", client_id, SCOPE_SEPARATOR, raw)))
    }

    /// Rebuilds a key from its storage form, applying the same rules as
    /// [`IdempotencyKey::new`] and [`IdempotencyKey::scoped`].
    pub fn parse_stored(stored: &str) -> Result<Self> {
        match stored.split_once(SCOPE_SEPARATOR) {
            Some((client_id, raw)) => Self::scoped(client_id, raw),
            None => Self::new(stored),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Client id of a scoped key.
    pub fn client_id(&self) -> Option<&str> {
        self.0.split_once(SCOPE_SEPARATOR).map(|(client, _)| client)
    }

    /// Key used for the lease in the coordination store.
    pub fn lease_key(&self, prefix: &str) -> String {
        format!("{}:lease:{}", prefix, self.0)
    }
}

fn reject_separator(what: &str, value: &str) -> Result<()> {
    if value.contains(SCOPE_SEPARATOR) {
        return Err(AppError::InvalidInput(format!(
            "{} must not contain '{}'",
            what, SCOPE_SEPARATOR
        )));
    }
    Ok(())
}

fn validate_component(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::InvalidInput(format!("{} cannot be empty", what)));
    }
    if value.len() > MAX_KEY_LENGTH {
        return Err(AppError::InvalidInput(format!(
            "{} exceeds {} bytes",
            what, MAX_KEY_LENGTH
        )));
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(AppError::InvalidInput(format!(
            "{} contains control characters",
            what
        )));
    }
    Ok(())
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse_stored(&value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}
