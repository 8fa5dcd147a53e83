use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_NAMESPACE_LEN: usize = 128;
const MAX_PATH_LEN: usize = 256;

fn is_lower_alnum(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit()
}

/// `^[a-z][a-z0-9]*(\.[a-z][a-z0-9]*)*$`, checked without pulling in a regex
/// for the hot construction path (`spec.md` §3).
fn validate_namespace_str(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("namespace must not be empty".to_owned());
    }
    if s.len() > MAX_NAMESPACE_LEN {
        return Err(format!(
            "namespace exceeds {MAX_NAMESPACE_LEN} characters"
        ));
    }
    for segment in s.split('.') {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_lowercase() => {}
            _ => return Err(format!("segment '{segment}' must start with a-z")),
        }
        if !chars.all(is_lower_alnum) {
            return Err(format!("segment '{segment}' must be [a-z0-9]*"));
        }
    }
    Ok(())
}

/// A dotted lowercase identifier naming a logical participant
/// (`companion.satellite`, `hub.core`, `app.<sanitized-client-name>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    pub fn new(s: impl Into<String>) -> Result<Self, CodecError> {
        let s = s.into();
        validate_namespace_str(&s).map_err(|reason| CodecError::Invalid {
            field: "source".to_owned(),
            reason,
        })?;
        Ok(Self(s))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `companion.satellite` → trims to `companion` on the next call, then
    /// `None`. Used by the router's prefix target resolution
    /// (`spec.md` §4.4).
    #[must_use]
    pub fn parent(&self) -> Option<Namespace> {
        let (head, _) = self.0.rsplit_once('.')?;
        Some(Namespace(head.to_owned()))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Namespace {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_namespace_str(&value)?;
        Ok(Namespace(value))
    }
}

impl From<Namespace> for String {
    fn from(value: Namespace) -> Self {
        value.0
    }
}

/// A dotted hierarchical key naming a state entry or (when it also contains
/// `*`/`**`) a subscription pattern. Length-checked only; the wildcard
/// grammar is enforced by [`crate::pattern::compile_pattern`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Path(String);

impl Path {
    pub fn new(s: impl Into<String>) -> Result<Self, CodecError> {
        let s = s.into();
        if s.is_empty() {
            return Err(CodecError::Invalid {
                field: "path".to_owned(),
                reason: "path must not be empty".to_owned(),
            });
        }
        if s.len() > MAX_PATH_LEN {
            return Err(CodecError::Invalid {
                field: "path".to_owned(),
                reason: format!("path exceeds {MAX_PATH_LEN} characters"),
            });
        }
        let valid_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '*');
        if !s.chars().all(valid_char) {
            return Err(CodecError::Invalid {
                field: "path".to_owned(),
                reason: "path contains characters outside [A-Za-z0-9._*]".to_owned(),
            });
        }
        Ok(Self(s))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Path {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Path::new(value.clone())
            .map(|_| Path(value))
            .map_err(|e| e.to_string())
    }
}

impl From<Path> for String {
    fn from(value: Path) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dotted_lowercase_namespace() {
        assert!(Namespace::new("companion.satellite").is_ok());
        assert!(Namespace::new("hub.core").is_ok());
        assert!(Namespace::new("app.dashboard1").is_ok());
    }

    #[test]
    fn rejects_empty_and_uppercase_and_overlong_namespace() {
        assert!(Namespace::new("").is_err());
        assert!(Namespace::new("Hub.Core").is_err());
        assert!(Namespace::new("a".repeat(129)).is_err());
    }

    #[test]
    fn parent_trims_one_segment_at_a_time() {
        let ns = Namespace::new("companion.satellite").unwrap();
        let parent = ns.parent().unwrap();
        assert_eq!(parent.as_str(), "companion");
        assert!(parent.parent().is_none());
    }

    #[test]
    fn path_rejects_overlong_and_illegal_characters() {
        assert!(Path::new("a".repeat(257)).is_err());
        assert!(Path::new("a.b$c").is_err());
        assert!(Path::new("a.b_c.**").is_ok());
    }
}
