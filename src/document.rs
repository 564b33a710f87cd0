use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, monotonically-advancing document version token.
///
/// The server of record mints these; clients only ever compare them. "Newer"
/// is defined by (length, lexicographic) order so that numeric-string tokens,
/// counter-style (`"42"`) and epoch-nanos-style alike, compare numerically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub String);

impl Version {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this version is strictly newer than `other`.
    pub fn newer_than(&self, other: &Version) -> bool {
        (self.0.len(), &self.0) > (other.0.len(), &other.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<&str> for Version {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

/// A document snapshot: the content a session starts from and the version the
/// server of record associates with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    pub version: Version,
}

impl Document {
    pub fn new(content: impl Into<String>, version: Version) -> Self {
        Self {
            content: content.into(),
            version,
        }
    }

    /// Content length in characters.
    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.content, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering_is_numeric_for_counters() {
        assert!(Version::new("10").newer_than(&Version::new("9")));
        assert!(Version::new("100").newer_than(&Version::new("99")));
        assert!(!Version::new("9").newer_than(&Version::new("10")));
        assert!(!Version::new("7").newer_than(&Version::new("7")));
    }

    #[test]
    fn test_version_serde_is_transparent() {
        let v = Version::new("42");
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"42\"");
        let back: Version = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_document_len_counts_chars() {
        let doc = Document::new("héllo", Version::new("0"));
        assert_eq!(doc.len(), 5);
        assert!(!doc.is_empty());
    }
}
