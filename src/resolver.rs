//! The registry resolver: entry-path mapping, a per-search blob-content
//! cache, and the two-phase (day-scan then commit-scan) search over one or
//! more ordered index repositories.
//!
//! `entry_path` is the same hashed-prefix scheme `get_crate_prefix` uses,
//! generalized to return the full entry path (prefix plus crate name)
//! rather than just the prefix, since this crate has no download-URL
//! template to splice the prefix into. The blob walk follows the same
//! tree/blob handling `write_cache_entries` uses.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::{ResolverError, Result};
use crate::manager::RepositoryHandle;
use crate::model::{RegistryResolution, Target};
use crate::util;

/// Computes the crates.io index entry path for a (already lower-cased)
/// crate name: `1/<name>`, `2/<name>`, `3/<c0>/<name>`, or
/// `<c0c1>/<c2c3>/<name>` for names of four or more characters.
pub fn entry_path(name: &str) -> String {
    let name = name.to_lowercase();
    let name = name.as_str();
    let prefix = match name.chars().count() {
        0 => unreachable!("crate names are never empty"),
        1 => "1".to_owned(),
        2 => "2".to_owned(),
        3 => format!("3/{}", name.chars().next().unwrap()),
        _ => {
            let mut citer = name.chars();
            let mut pfx = String::with_capacity(5);
            pfx.push(citer.next().unwrap());
            pfx.push(citer.next().unwrap());
            pfx.push('/');
            pfx.push(citer.next().unwrap());
            pfx.push(citer.next().unwrap());
            pfx
        }
    };
    format!("{prefix}/{name}")
}

/// Caches the matched/not-matched decision for a (entry path, blob id) pair
/// across commits in a single search, and the last object id seen at each
/// path so unchanged entries skip the blob read entirely.
#[derive(Default)]
struct MatchCache {
    decisions: HashMap<(String, git2::Oid), bool>,
    last_seen: HashMap<String, git2::Oid>,
}

impl MatchCache {
    fn is_matched(
        &mut self,
        repo: &git2::Repository,
        tree: &git2::Tree<'_>,
        path: &str,
        version: &str,
    ) -> bool {
        let entry = match tree.get_path(Path::new(path)) {
            Ok(e) => e,
            Err(_) => return false,
        };
        let oid = entry.id();

        if let Some(&decision) = self.decisions.get(&(path.to_owned(), oid)) {
            return decision;
        }

        let decision = match entry.to_object(repo).ok().and_then(|o| o.peel_to_blob().ok()) {
            Some(blob) => {
                let needle = format!("\"vers\":\"{version}\"");
                memchr::memmem::find(blob.content(), needle.as_bytes()).is_some()
            }
            None => false,
        };

        self.decisions.insert((path.to_owned(), oid), decision);
        self.last_seen.insert(path.to_owned(), oid);
        decision
    }
}

fn count_matches(
    repo: &git2::Repository,
    commit: &git2::Commit<'_>,
    packages: &[Target],
    paths: &[String],
    cache: &mut MatchCache,
) -> usize {
    let Ok(tree) = commit.tree() else { return 0 };
    packages
        .iter()
        .zip(paths)
        .filter(|(pkg, path)| cache.is_matched(repo, &tree, path, &pkg.version))
        .count()
}

#[derive(Clone)]
struct SingleSearchResult {
    commit_hash: String,
    commit_time: DateTime<Utc>,
    base: usize,
    prior_commit: Option<git2::Oid>,
}

impl SingleSearchResult {
    fn into_resolution(self) -> RegistryResolution {
        RegistryResolution {
            commit_hash: self.commit_hash,
            commit_time: self.commit_time,
        }
    }
}

const DAY_STEP: chrono::Duration = chrono::Duration::hours(24);

/// Runs the two-phase search over a single repository at `repo_path`.
fn search_single_repo(
    repo_path: &Path,
    packages: &[Target],
    paths: &[String],
    published: DateTime<Utc>,
) -> Result<SingleSearchResult> {
    let repo = git2::Repository::open(repo_path).map_err(ResolverError::from_git)?;
    let mut cache = MatchCache::default();

    let mut revwalk = repo.revwalk().map_err(ResolverError::from_git)?;
    revwalk
        .push_head()
        .map_err(ResolverError::from_git)?;
    revwalk
        .set_sorting(git2::Sort::TIME)
        .map_err(ResolverError::from_git)?;

    let mut iter = revwalk.filter_map(|oid| {
        let oid = oid.ok()?;
        let commit = repo.find_commit(oid).ok()?;
        let time = util::git_time_to_utc(commit.time());
        (time <= published).then_some((oid, time))
    });

    // Phase 1: day-scan.
    let Some((first_oid, first_time)) = iter.next() else {
        return Err(ResolverError::NotFound);
    };
    let first_commit = repo.find_commit(first_oid).map_err(ResolverError::from_git)?;
    let base = count_matches(&repo, &first_commit, packages, paths, &mut cache);
    if base == 0 {
        return Err(ResolverError::NoMatches);
    }

    let mut upper_oid = first_oid;
    let mut upper_time = first_time;
    let mut next_check = first_time - DAY_STEP;
    let mut found_drop = false;

    for (oid, time) in iter {
        if time > next_check {
            continue;
        }
        let commit = repo.find_commit(oid).map_err(ResolverError::from_git)?;
        let count = count_matches(&repo, &commit, packages, paths, &mut cache);
        if count < base {
            found_drop = true;
            break;
        }
        upper_oid = oid;
        upper_time = time;
        next_check -= DAY_STEP;
    }

    if !found_drop {
        return Ok(SingleSearchResult {
            commit_hash: upper_oid.to_string(),
            commit_time: upper_time,
            base,
            prior_commit: None,
        });
    }

    // Phase 2: commit-scan, starting fresh from `upper` so every
    // intervening commit skipped by the day-scan is examined.
    let mut fine_walk = repo.revwalk().map_err(ResolverError::from_git)?;
    fine_walk.push(upper_oid).map_err(ResolverError::from_git)?;
    fine_walk
        .set_sorting(git2::Sort::TIME)
        .map_err(ResolverError::from_git)?;

    let mut last_oid = upper_oid;
    let mut last_time = upper_time;
    let mut prior_commit = None;

    for oid in fine_walk {
        let oid = oid.map_err(ResolverError::from_git)?;
        let commit = repo.find_commit(oid).map_err(ResolverError::from_git)?;
        let count = count_matches(&repo, &commit, packages, paths, &mut cache);
        if count < base {
            prior_commit = Some(oid);
            break;
        }
        last_oid = oid;
        last_time = util::git_time_to_utc(commit.time());
    }

    Ok(SingleSearchResult {
        commit_hash: last_oid.to_string(),
        commit_time: last_time,
        base,
        prior_commit,
    })
}

/// Finds the earliest commit across `repos` (ordered newest → oldest) at
/// which every requested package was simultaneously present, continuing
/// into older repositories when the newer ones run out of history.
pub fn find_registry_resolution(
    repos: &[RepositoryHandle],
    packages: &[Target],
    published: DateTime<Utc>,
) -> Result<RegistryResolution> {
    if packages.is_empty() {
        return Err(ResolverError::invalid("package list must not be empty"));
    }

    let paths: Vec<String> = packages.iter().map(|p| entry_path(&p.name)).collect();

    let mut best: Option<SingleSearchResult> = None;
    let mut prev: Option<SingleSearchResult> = None;
    let last_index = repos.len().saturating_sub(1);

    for (i, handle) in repos.iter().enumerate() {
        match search_single_repo(handle.path(), packages, &paths, published) {
            Err(ResolverError::NoMatches) => {
                if i == last_index && best.is_none() {
                    return Err(ResolverError::NoMatches);
                }
                continue;
            }
            Err(e) => return Err(e),
            Ok(result) => {
                if let Some(prev_result) = &prev {
                    if prev_result.prior_commit.is_none() && result.base < prev_result.base {
                        return Ok(prev_result.clone().into_resolution());
                    }
                }

                let has_prior = result.prior_commit.is_some();
                best = Some(result.clone());
                prev = Some(result);

                if has_prior {
                    return Ok(best.unwrap().into_resolution());
                }
            }
        }
    }

    best.map(SingleSearchResult::into_resolution)
        .ok_or(ResolverError::NoMatches)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entry_path_matches_known_cases() {
        assert_eq!(entry_path("A"), "1/a");
        assert_eq!(entry_path("AB"), "2/ab");
        assert_eq!(entry_path("Abc"), "3/a/abc");
        assert_eq!(entry_path("Serde"), "se/rd/serde");
        assert_eq!(
            entry_path("very-long-package"),
            "ve/ry/very-long-package"
        );
    }

    /// One line per published version, matching the real index's
    /// newline-delimited-JSON layout closely enough for substring matching.
    fn index_lines(name: &str, versions: &[&str]) -> String {
        versions
            .iter()
            .map(|v| format!(r#"{{"name":"{name}","vers":"{v}"}}"#))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Builds a bare repo where each commit's tree holds accumulated index
    /// lines for `entries`, committed at `seconds_offset` (from an arbitrary
    /// epoch) apart, entirely through `git2` rather than shelling out.
    fn build_fixture(
        commits: &[(i64, Vec<(&str, Vec<&str>)>)],
    ) -> (tempfile::TempDir, Vec<git2::Oid>) {
        let dir = tempfile::tempdir().unwrap();
        let repo = git2::Repository::init_bare(dir.path()).unwrap();
        let sig = git2::Signature::new("test", "test@example.com", &git2::Time::new(0, 0)).unwrap();

        let mut parent: Option<git2::Oid> = None;
        let mut oids = Vec::new();

        for (seconds, entries) in commits {
            let mut tree_builder = repo.treebuilder(None).unwrap();
            for (name, versions) in entries {
                let path = entry_path(name);
                let blob_id = repo.blob(index_lines(name, versions).as_bytes()).unwrap();

                // Build nested directory trees for multi-segment paths.
                let segments: Vec<&str> = path.split('/').collect();
                insert_nested(&repo, &mut tree_builder, &segments, blob_id);
            }
            let tree_id = tree_builder.write().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();

            let commit_sig =
                git2::Signature::new("test", "test@example.com", &git2::Time::new(*seconds, 0))
                    .unwrap();

            let parents: Vec<git2::Commit<'_>> = parent
                .map(|p| repo.find_commit(p).unwrap())
                .into_iter()
                .collect();
            let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();

            let oid = repo
                .commit(
                    Some("HEAD"),
                    &commit_sig,
                    &sig,
                    "snapshot",
                    &tree,
                    &parent_refs,
                )
                .unwrap();
            parent = Some(oid);
            oids.push(oid);
        }

        (dir, oids)
    }

    fn insert_nested(
        repo: &git2::Repository,
        builder: &mut git2::TreeBuilder<'_>,
        segments: &[&str],
        blob_id: git2::Oid,
    ) {
        if segments.len() == 1 {
            builder.insert(segments[0], blob_id, 0o100644).unwrap();
            return;
        }

        let mut sub = repo.treebuilder(None).unwrap();
        insert_nested(repo, &mut sub, &segments[1..], blob_id);
        let sub_id = sub.write().unwrap();
        builder.insert(segments[0], sub_id, 0o040000).unwrap();
    }

    #[test]
    fn single_repo_finds_earliest_commit_with_both_packages() {
        let (dir, oids) = build_fixture(&[
            (0, vec![("serde", vec!["1.0.0"])]),
            (
                100_000,
                vec![("serde", vec!["1.0.0", "1.0.193"]), ("tokio", vec!["0.1.0"])],
            ),
            (
                200_000,
                vec![
                    ("serde", vec!["1.0.0", "1.0.193"]),
                    ("tokio", vec!["0.1.0", "1.35.1"]),
                ],
            ),
        ]);

        let packages = vec![Target::new("serde", "1.0.193"), Target::new("tokio", "1.35.1")];
        let paths: Vec<String> = packages.iter().map(|p| entry_path(&p.name)).collect();
        let published = Utc::now();

        let result = search_single_repo(dir.path(), &packages, &paths, published).unwrap();
        assert_eq!(result.commit_hash, oids[2].to_string());
        assert_eq!(result.base, 2);
    }

    #[test]
    fn search_is_idempotent_across_repeated_invocations() {
        let (dir, oids) = build_fixture(&[
            (0, vec![("serde", vec!["1.0.0"])]),
            (
                100_000,
                vec![("serde", vec!["1.0.0", "1.0.193"]), ("tokio", vec!["0.1.0"])],
            ),
            (
                200_000,
                vec![
                    ("serde", vec!["1.0.0", "1.0.193"]),
                    ("tokio", vec!["0.1.0", "1.35.1"]),
                ],
            ),
        ]);

        let packages = vec![Target::new("serde", "1.0.193"), Target::new("tokio", "1.35.1")];
        let paths: Vec<String> = packages.iter().map(|p| entry_path(&p.name)).collect();
        let published = Utc::now();

        let first = search_single_repo(dir.path(), &packages, &paths, published).unwrap();
        let second = search_single_repo(dir.path(), &packages, &paths, published).unwrap();

        assert_eq!(first.commit_hash, second.commit_hash);
        assert_eq!(first.commit_hash, oids[2].to_string());
    }

    #[test]
    fn single_repo_reports_no_matches_for_absent_package() {
        let (dir, _oids) = build_fixture(&[(0, vec![("serde", vec!["1.0.0"])])]);

        let packages = vec![Target::new("nonexistent", "1.0.0")];
        let paths: Vec<String> = packages.iter().map(|p| entry_path(&p.name)).collect();

        let err = search_single_repo(dir.path(), &packages, &paths, Utc::now()).unwrap_err();
        assert!(matches!(err, ResolverError::NoMatches));
    }
}
