//! Pure `Cargo.lock` parsing and snapshot-selection helpers for the request
//! handler, kept free of any git or filesystem I/O so they're trivial to
//! unit test.
//!
//! The `toml`-based deserialization follows the same shape `LockContents`
//! uses elsewhere, trimmed down to just `(name, version)` pairs since this
//! crate only needs presence, not checksums or sources.

use chrono::NaiveDate;

use crate::error::{ResolverError, Result};
use crate::model::{RepositoryKey, Target};

#[derive(serde::Deserialize)]
struct LockPackage {
    name: String,
    version: String,
}

#[derive(serde::Deserialize)]
struct LockContents {
    package: Vec<LockPackage>,
}

/// Parses a `Cargo.lock` file's text into its `(name, version)` pairs, in
/// file order.
pub fn parse_lockfile(text: &str) -> Result<Vec<Target>> {
    let contents: LockContents =
        toml::from_str(text).map_err(|e| ResolverError::invalid(format!("invalid lockfile: {e}")))?;

    Ok(contents
        .package
        .into_iter()
        .map(|p| Target::new(p.name, p.version))
        .collect())
}

/// Selects the ordered list of repository keys relevant to a request for
/// `published`, given the sorted (ascending) list of available snapshot
/// dates.
///
/// Returns keys ordered `[CURRENT?]` followed by selected snapshots in
/// descending date order; an empty result means the caller shouldn't
/// contact the manager at all.
pub fn select_relevant_keys(
    sorted_snapshot_dates: &[String],
    published: NaiveDate,
) -> Result<Vec<RepositoryKey>> {
    let parsed: Vec<NaiveDate> = sorted_snapshot_dates
        .iter()
        .map(|d| {
            NaiveDate::parse_from_str(d, "%Y-%m-%d")
                .map_err(|e| ResolverError::invalid(format!("invalid snapshot date '{d}': {e}")))
        })
        .collect::<Result<_>>()?;

    let before = parsed.iter().filter(|d| **d < published).max().copied();
    let after = parsed.iter().filter(|d| **d >= published).min().copied();

    let needs_current = parsed.is_empty() || parsed.last().map(|d| published > *d).unwrap_or(true);

    let mut keys = Vec::new();
    if needs_current {
        keys.push(RepositoryKey::Current);
    }
    if let Some(after) = after {
        keys.push(RepositoryKey::Snapshot(after.format("%Y-%m-%d").to_string()));
    }
    if let Some(before) = before {
        if before > published - chrono::Duration::days(14) {
            keys.push(RepositoryKey::Snapshot(before.format("%Y-%m-%d").to_string()));
        }
    }

    Ok(keys)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_lockfile_packages() {
        let text = r#"
[[package]]
name = "serde"
version = "1.0.193"

[[package]]
name = "tokio"
version = "1.35.1"
"#;
        let packages = parse_lockfile(text).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].name, "serde");
        assert_eq!(packages[1].version, "1.35.1");
    }

    #[test]
    fn rejects_malformed_lockfile() {
        assert!(parse_lockfile("not valid toml [[[").is_err());
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn selects_current_when_no_snapshots() {
        let keys = select_relevant_keys(&[], date("2024-06-01")).unwrap();
        assert_eq!(keys, vec![RepositoryKey::Current]);
    }

    #[test]
    fn selects_after_and_recent_before_snapshot() {
        let dates = vec!["2024-05-20".to_owned(), "2024-05-30".to_owned()];
        let keys = select_relevant_keys(&dates, date("2024-05-25")).unwrap();
        assert_eq!(
            keys,
            vec![
                RepositoryKey::Snapshot("2024-05-30".to_owned()),
                RepositoryKey::Snapshot("2024-05-20".to_owned()),
            ]
        );
    }

    #[test]
    fn excludes_before_snapshot_older_than_14_days() {
        let dates = vec!["2024-01-01".to_owned()];
        let keys = select_relevant_keys(&dates, date("2024-06-01")).unwrap();
        // `before` is far older than 14 days and there's no `after`, so
        // CURRENT is the only relevant key.
        assert_eq!(keys, vec![RepositoryKey::Current]);
    }
}
