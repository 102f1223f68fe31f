//! Paths into the hierarchical state document.
//!
//! A path is a list of segments relative to the document root. The textual
//! form joins segments with `/`; the empty string is the root.
//!
//! ```text
//! ""                    → root
//! "fan"                 → top-level switch
//! "leds/3"              → slot 3 of the `leds` bank
//! "sensors/temperature" → sensor leaf
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters the hosted store refuses inside a key.
const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']'];

/// Path parse errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("empty segment in path '{0}'")]
    EmptySegment(String),

    #[error("forbidden character {ch:?} in segment '{segment}'")]
    ForbiddenCharacter { segment: String, ch: char },
}

/// A validated path into the state document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StatePath {
    segments: Vec<String>,
}

impl StatePath {
    /// The document root.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a textual path. Leading and trailing slashes are ignored.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.trim().is_empty() {
                return Err(PathError::EmptySegment(raw.to_string()));
            }
            if let Some(ch) = segment.chars().find(|c| FORBIDDEN.contains(c)) {
                return Err(PathError::ForbiddenCharacter {
                    segment: segment.to_string(),
                    ch,
                });
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Append one segment. The segment is trusted (used with schema names
    /// and numeric indices only).
    pub fn child(&self, segment: impl fmt::Display) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// `self` equals `other` or is one of its ancestors.
    pub fn is_prefix_of(&self, other: &StatePath) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// A write at one path changes the value seen at the other.
    pub fn overlaps(&self, other: &StatePath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl TryFrom<String> for StatePath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StatePath> for String {
    fn from(path: StatePath) -> Self {
        path.to_string()
    }
}
