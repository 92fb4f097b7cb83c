//! Instrument Keys
//!
//! Canonical identifiers for tradable instruments (equities, indices,
//! option contracts). Keys are case-insensitive on the wire; the canonical
//! form is trimmed and uppercase, and every lookup goes through the same
//! normalization so `nse_eq|reliance` and `NSE_EQ|RELIANCE` address the
//! same cache entry.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Errors produced when parsing an instrument key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// Key was empty or whitespace only.
    #[error("instrument key cannot be empty")]
    Empty,
}

/// Canonical (uppercase) instrument key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InstrumentKey(String);

impl InstrumentKey {
    /// Parse and canonicalize a raw key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Empty`] if the key is blank.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, KeyError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self(trimmed.to_uppercase()))
    }

    /// The canonical key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the key, returning the canonical string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for InstrumentKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for InstrumentKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for InstrumentKey {
    type Error = KeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for InstrumentKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for InstrumentKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Parse a batch of raw keys into a de-duplicated canonical set.
///
/// # Errors
///
/// Fails on the first blank key; nothing is returned in that case.
pub fn parse_keys<I, S>(raw: I) -> Result<BTreeSet<InstrumentKey>, KeyError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter().map(InstrumentKey::new).collect()
}
