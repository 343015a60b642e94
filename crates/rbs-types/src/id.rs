use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// URN prefix for blob ids derived from content.
const CONTENT_URN_PREFIX: &str = "urn:blake3:";

/// Check that `s` looks like an absolute URI: `scheme ":" rest`.
///
/// Only the shape is checked. The scheme must start with a letter and contain
/// letters, digits, `+`, `-` or `.`; the remainder must be non-empty and free
/// of whitespace.
fn validate_uri(s: &str) -> Result<(), TypeError> {
    let invalid = |reason| TypeError::InvalidUri {
        uri: s.to_string(),
        reason,
    };

    let (scheme, rest) = s.split_once(':').ok_or_else(|| invalid("missing scheme"))?;
    let mut chars = scheme.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return Err(invalid("scheme must start with a letter")),
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        return Err(invalid("illegal character in scheme"));
    }
    if rest.is_empty() {
        return Err(invalid("empty scheme-specific part"));
    }
    if s.chars().any(char::is_whitespace) {
        return Err(invalid("whitespace not allowed"));
    }
    Ok(())
}

/// Identity of a blob store instance.
///
/// Set at construction and stable for the lifetime of the process.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreId(String);

impl StoreId {
    /// Parse and validate a store URI.
    pub fn parse(uri: impl Into<String>) -> Result<Self, TypeError> {
        let uri = uri.into();
        validate_uri(&uri)?;
        Ok(Self(uri))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for StoreId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreId({})", self.0)
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a blob within a store.
///
/// Callers may choose their own ids, or let a store that advertises
/// [`capabilities::GENERATE_ID`](crate::capabilities::GENERATE_ID) derive one
/// from the content with [`BlobId::from_content`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId(String);

impl BlobId {
    /// Parse and validate a blob URI.
    pub fn parse(uri: impl Into<String>) -> Result<Self, TypeError> {
        let uri = uri.into();
        validate_uri(&uri)?;
        Ok(Self(uri))
    }

    /// Derive a content-addressed id: `urn:blake3:<hex digest>`.
    pub fn from_content(data: &[u8]) -> Self {
        Self(format!(
            "{CONTENT_URN_PREFIX}{}",
            hex::encode(blake3::hash(data).as_bytes())
        ))
    }

    /// The BLAKE3 digest if this id was derived from content.
    pub fn content_digest(&self) -> Option<Result<[u8; 32], TypeError>> {
        let digest = self.0.strip_prefix(CONTENT_URN_PREFIX)?;
        Some(
            hex::decode(digest)
                .map_err(|e| TypeError::InvalidHex(e.to_string()))
                .and_then(|bytes| {
                    bytes
                        .try_into()
                        .map_err(|_| TypeError::InvalidHex("digest is not 32 bytes".into()))
                }),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl FromStr for BlobId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
