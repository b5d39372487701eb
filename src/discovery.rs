//! Snapshot discovery: listing the crates.io index archive's remote
//! branches that match `snapshot-YYYY-MM-DD`, without cloning anything.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{ResolverError, Result};

fn snapshot_branch_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^refs/heads/snapshot-(\d{4}-\d{2}-\d{2})$").unwrap())
}

/// Lists the available snapshot dates on `archive_url`, sorted
/// lexicographically (equivalent to chronological order for ISO dates).
///
/// This is a `git ls-remote` equivalent: it connects to the remote and asks
/// for its reference list without ever materializing a local repository,
/// just stopping short of actually fetching anything. `connect_auth` takes
/// its own credentials callback rather than a `FetchOptions`, so this goes
/// through `with_authentication` directly rather than `with_fetch_options`.
pub fn list_available_snapshots(archive_url: &str) -> Result<Vec<String>> {
    let scratch = tempfile::tempdir().map_err(ResolverError::from)?;
    let repo = git2::Repository::init_opts(
        scratch.path(),
        git2::RepositoryInitOptions::new().bare(true),
    )
    .map_err(ResolverError::from_git)?;

    let mut remote = repo
        .remote_anonymous(archive_url)
        .map_err(ResolverError::from_git)?;

    let git_config = git2::Config::open_default().map_err(ResolverError::from_git)?;

    let mut dates = crate::git::with_authentication(archive_url, &git_config, |creds| {
        let mut rcb = git2::RemoteCallbacks::new();
        rcb.credentials(creds);

        remote
            .connect_auth(git2::Direction::Fetch, Some(rcb), None)
            .map_err(anyhow::Error::from)?;

        let mut found = Vec::new();
        for head in remote.list().map_err(anyhow::Error::from)? {
            if let Some(caps) = snapshot_branch_re().captures(head.name()) {
                found.push(caps[1].to_owned());
            }
        }

        remote.disconnect().map_err(anyhow::Error::from)?;
        Ok(found)
    })
    .map_err(|e| match e.downcast::<git2::Error>() {
        Ok(git_err) => ResolverError::from_git(git_err),
        Err(e) => ResolverError::Network(e),
    })?;

    dates.sort();
    Ok(dates)
}
