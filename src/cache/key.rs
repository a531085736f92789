use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered identifier of a cached query, e.g. `["workers", "queue"]`.
///
/// Invalidation works on prefixes: `["workers"]` covers every key that
/// starts with it. The empty key covers everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceKey(Vec<String>);

impl NamespaceKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// The empty prefix, which matches every key.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &NamespaceKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Extend with one more segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }
}

impl fmt::Display for NamespaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

impl<const N: usize> From<[&str; N]> for NamespaceKey {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

impl From<&[&str]> for NamespaceKey {
    fn from(segments: &[&str]) -> Self {
        Self::new(segments.iter().copied())
    }
}
