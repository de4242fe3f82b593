//! Normalized storage keys.
//!
//! Keys are flat, slash-delimited logical paths such as
//! `spaces/3f2a/daily/notes.json`. Backslashes and colons are accepted as
//! separators on input, runs of separators collapse, and leading/trailing
//! separators are dropped, so `"/spaces//a:b/"` and `"spaces/a/b"` name the
//! same entry.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Path separator of normalized keys.
pub const SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageKey(String);

impl StorageKey {
    /// Normalize `raw` into a key. Empty keys are rejected.
    pub fn new(raw: &str) -> SyncResult<Self> {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            return Err(SyncError::InvalidKey(raw.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// Whether this key equals `base` or lives below it.
    ///
    /// An empty base matches every key.
    pub fn is_under(&self, base: &str) -> bool {
        let base = normalize(base);
        base.is_empty()
            || self.0 == base
            || (self.0.starts_with(&base) && self.0[base.len()..].starts_with(SEPARATOR))
    }
}

/// Normalize a raw path without validating it.
pub fn normalize(raw: &str) -> String {
    raw.split(|c| c == '/' || c == '\\' || c == ':')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StorageKey {
    type Error = SyncError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        StorageKey::new(&raw)
    }
}

impl TryFrom<&str> for StorageKey {
    type Error = SyncError;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        StorageKey::new(raw)
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> Self {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_separators() {
        let key = StorageKey::new("/spaces//abc:daily\\notes.json/").unwrap();
        assert_eq!(key.as_str(), "spaces/abc/daily/notes.json");
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(StorageKey::new("").is_err());
        assert!(StorageKey::new("///").is_err());
    }

    #[test]
    fn test_segments() {
        let key = StorageKey::new("a/b/c").unwrap();
        let segments: Vec<&str> = key.segments().collect();
        assert_eq!(segments, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_is_under() {
        let key = StorageKey::new("spaces/abc/notes").unwrap();
        assert!(key.is_under(""));
        assert!(key.is_under("spaces"));
        assert!(key.is_under("spaces/abc"));
        assert!(key.is_under("spaces/abc/notes"));
        assert!(!key.is_under("spaces/ab"));
        assert!(!key.is_under("other"));
    }

    #[test]
    fn test_serde_normalizes() {
        let key: StorageKey = serde_json::from_str("\"a:b\"").unwrap();
        assert_eq!(key.as_str(), "a/b");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"a/b\"");
    }
}
