use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

/// Identity of a source repository: a kind (`git`, `oci`, ...), a location,
/// and an optional ref. Doubles as the cache key and the wire request field.
///
/// The canonical text form is `kind://location[?ref=R]` and round-trips
/// through [`fmt::Display`] and [`FromStr`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceKey {
    kind: String,
    location: String,
    reference: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("source key `{0}` is missing a kind")]
    MissingKind(String),

    #[error("source key `{0}` is missing a location")]
    MissingLocation(String),
}

// === impl SourceKey ===

impl SourceKey {
    pub fn new(kind: impl Into<String>, location: impl Into<String>) -> Result<Self, KeyError> {
        let kind = kind.into();
        let location = location.into();
        if kind.is_empty() {
            return Err(KeyError::MissingKind(location));
        }
        if location.is_empty() {
            return Err(KeyError::MissingLocation(kind));
        }
        Ok(Self {
            kind,
            location,
            reference: None,
        })
    }

    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.location)?;
        if let Some(r) = &self.reference {
            write!(f, "?ref={r}")?;
        }
        Ok(())
    }
}

impl FromStr for SourceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, KeyError> {
        let (kind, rest) = s
            .split_once("://")
            .ok_or_else(|| KeyError::MissingKind(s.to_string()))?;
        let (location, reference) = match rest.split_once("?ref=") {
            Some((l, r)) if !r.is_empty() => (l, Some(r.to_string())),
            Some((l, _)) => (l, None),
            None => (rest, None),
        };
        if kind.is_empty() {
            return Err(KeyError::MissingKind(s.to_string()));
        }
        if location.is_empty() {
            return Err(KeyError::MissingLocation(s.to_string()));
        }
        Ok(Self {
            kind: kind.to_string(),
            location: location.to_string(),
            reference,
        })
    }
}

/// A registered override: keys matching the predicate are served from a
/// local directory instead of their remote location.
#[derive(Clone, Debug)]
pub struct OverrideRule {
    kind: String,
    location: Option<String>,
    path: PathBuf,
}

// === impl OverrideRule ===

impl OverrideRule {
    /// Matches every key of `kind`.
    pub fn for_kind(kind: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: kind.into(),
            location: None,
            path: path.into(),
        }
    }

    /// Matches only keys of `kind` at exactly `location`.
    pub fn for_location(
        kind: impl Into<String>,
        location: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind: kind.into(),
            location: Some(location.into()),
            path: path.into(),
        }
    }

    pub fn matches(&self, key: &SourceKey) -> bool {
        self.kind == key.kind()
            && self
                .location
                .as_deref()
                .is_none_or(|location| location == key.location())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips() {
        let key = SourceKey::new("git", "example.com/org/repo").unwrap();
        assert_eq!(key.to_string(), "git://example.com/org/repo");
        assert_eq!(key.to_string().parse::<SourceKey>().unwrap(), key);

        let with_ref = key.clone().with_ref("main");
        assert_eq!(with_ref.to_string(), "git://example.com/org/repo?ref=main");
        assert_eq!(with_ref.to_string().parse::<SourceKey>().unwrap(), with_ref);
    }

    #[test]
    fn rejects_empty_kind() {
        assert!(matches!(
            SourceKey::new("", "example.com/repo"),
            Err(KeyError::MissingKind(_))
        ));
        assert!(matches!(
            "://example.com/repo".parse::<SourceKey>(),
            Err(KeyError::MissingKind(_))
        ));
        assert!(matches!(
            "example.com/repo".parse::<SourceKey>(),
            Err(KeyError::MissingKind(_))
        ));
    }

    #[test]
    fn rejects_empty_location() {
        assert!(matches!(
            "git://".parse::<SourceKey>(),
            Err(KeyError::MissingLocation(_))
        ));
    }

    #[test]
    fn kind_rule_matches_any_location() {
        let rule = OverrideRule::for_kind("git", "/local/repo");
        assert!(rule.matches(&SourceKey::new("git", "example.com/a").unwrap()));
        assert!(rule.matches(&SourceKey::new("git", "example.com/b").unwrap()));
        assert!(!rule.matches(&SourceKey::new("oci", "registry/x").unwrap()));
    }

    #[test]
    fn location_rule_is_exact() {
        let rule = OverrideRule::for_location("git", "example.com/a", "/local/repo");
        assert!(rule.matches(&SourceKey::new("git", "example.com/a").unwrap()));
        assert!(!rule.matches(&SourceKey::new("git", "example.com/b").unwrap()));
    }
}
