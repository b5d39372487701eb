//! Core data model: `Target`, `RepositoryKey`, `Package`,
//! `RegistryResolution`.
//!
//! Small, `Eq`/`Ord`/`Display`-bearing data with hand-written impls rather
//! than derives where ordering has custom semantics, the same shape as
//! `Source`/`Krate`.

use std::fmt;

use chrono::{DateTime, Utc};

/// A (crate, version) pair to confirm presence of in the index.
///
/// The crate name is normalized to lower-case ASCII for path derivation but
/// the version is preserved verbatim.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target {
    pub name: String,
    pub version: String,
}

impl Target {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// The lower-cased crate name used for entry-path derivation.
    pub fn normalized_name(&self) -> String {
        self.name.to_lowercase()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// An alias kept for readability at call sites that deal with the resolver
/// input list rather than a single lookup target; semantically identical to
/// `Target`.
pub type Package = Target;

/// Identifies one of the repositories the [`crate::manager::IndexManager`]
/// coordinates: the single mutable "current" index, or one immutable
/// historical snapshot.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RepositoryKey {
    Current,
    Snapshot(String),
}

impl RepositoryKey {
    /// The on-disk directory name this key is stored under.
    pub fn dir_name(&self) -> String {
        match self {
            Self::Current => "current".to_owned(),
            Self::Snapshot(date) => format!("snapshot-{date}"),
        }
    }
}

impl fmt::Display for RepositoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => write!(f, "current"),
            Self::Snapshot(date) => write!(f, "snapshot-{date}"),
        }
    }
}

/// The outcome of a resolver search: the commit at which every requested
/// package was simultaneously present, and that commit's committer time.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct RegistryResolution {
    pub commit_hash: String,
    pub commit_time: DateTime<Utc>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dir_names() {
        assert_eq!(RepositoryKey::Current.dir_name(), "current");
        assert_eq!(
            RepositoryKey::Snapshot("2024-01-01".to_owned()).dir_name(),
            "snapshot-2024-01-01"
        );
    }

    #[test]
    fn normalizes_name_but_keeps_version() {
        let t = Target::new("Serde", "1.0.193");
        assert_eq!(t.normalized_name(), "serde");
        assert_eq!(t.version, "1.0.193");
    }
}
