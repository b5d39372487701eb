//! Git fetchers: `CurrentFetcher` clones and incrementally updates the live
//! crates.io index; `SnapshotFetcher` clones one immutable archive branch
//! and never updates it again.
//!
//! Both build on the same `with_authentication` credential-negotiation path
//! `git.rs` uses for its own clones, driven through `git2::build::RepoBuilder`
//! rather than shelling out to the `git` binary. Sideband progress lines from
//! the fetch are pushed into a `LinePipe` and drained on a background thread
//! into `tracing::debug!`, so logging never blocks the transfer on a slow
//! sink.

use std::path::Path;
use std::sync::Arc;

use crate::error::{ResolverError, Result};
use crate::ring::LinePipe;

/// Runs `body` with a [`LinePipe`] feeding git's sideband progress lines,
/// draining and logging them on a background thread so a slow log sink
/// never blocks the fetch itself.
fn with_progress_log<T>(body: impl FnOnce(Arc<LinePipe>) -> T) -> T {
    let pipe = LinePipe::new(16 * 1024);
    let drain_pipe = pipe.clone();
    let drain = std::thread::spawn(move || {
        while let Some(lines) = drain_pipe.read_lines() {
            for line in lines {
                tracing::debug!(line = %String::from_utf8_lossy(&line), "git fetch progress");
            }
        }
    });

    let result = body(pipe.clone());
    pipe.close();
    let _ = drain.join();
    result
}

/// Strategy for populating and refreshing one [`crate::model::RepositoryKey`]
/// directory. Implementors run entirely inside `spawn_blocking`; `git2` has
/// no async API of its own.
pub trait Fetcher: Send + Sync {
    /// Clones the repository into `dest`, which must not yet exist.
    fn fetch(&self, dest: &Path) -> Result<()>;

    /// Refreshes an already-cloned repository at `dest` in place.
    fn update(&self, dest: &Path) -> Result<()>;
}

/// Clones `master` from the live index, single-branch and without a
/// checkout (only the git object store is needed, never a worktree), then
/// points `HEAD` at a symbolic ref tracking the remote branch so later
/// fetches advance it implicitly.
pub struct CurrentFetcher {
    pub url: String,
}

impl CurrentFetcher {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Fetcher for CurrentFetcher {
    fn fetch(&self, dest: &Path) -> Result<()> {
        let git_config = git2::Config::open_default().map_err(ResolverError::from_git)?;

        let repo = with_progress_log(|pipe| {
            let url = self.url.clone();
            let mut builder = git2::build::RepoBuilder::new();
            builder.bare(true);
            builder.branch("master");

            let mut result: Option<Result<git2::Repository>> = None;
            let outer = crate::git::with_fetch_options(
                &git_config,
                &url,
                pipe,
                &mut |mut opts| {
                    opts.download_tags(git2::AutotagOption::None);
                    result = Some(
                        builder
                            .fetch_options(opts)
                            .clone(&url, dest)
                            .map_err(anyhow::Error::from)
                            .map_err(|e| match e.downcast::<git2::Error>() {
                                Ok(git_err) => ResolverError::from_git(git_err),
                                Err(e) => ResolverError::Network(e),
                            }),
                    );
                    Ok(())
                },
            )
            .map_err(|e| match e.downcast::<git2::Error>() {
                Ok(git_err) => ResolverError::from_git(git_err),
                Err(e) => ResolverError::Network(e),
            });

            match outer {
                Ok(()) => result.expect("fetch callback always runs exactly once"),
                Err(e) => Err(e),
            }
        })?;

        repo.set_head("refs/remotes/origin/master")
            .map_err(ResolverError::from_git)?;

        Ok(())
    }

    fn update(&self, dest: &Path) -> Result<()> {
        let repo = git2::Repository::open(dest).map_err(ResolverError::from_git)?;
        let git_config = git2::Config::open_default().map_err(ResolverError::from_git)?;

        let mut remote = repo
            .find_remote("origin")
            .or_else(|_| repo.remote_anonymous(&self.url))
            .map_err(ResolverError::from_git)?;

        let url = self.url.clone();
        let refspecs = ["+refs/heads/master:refs/remotes/origin/master"];

        let result = with_progress_log(|pipe| {
            crate::git::with_fetch_options(&git_config, &url, pipe, &mut |mut opts| {
                opts.download_tags(git2::AutotagOption::None);
                remote
                    .fetch(&refspecs, Some(&mut opts), None)
                    .map_err(anyhow::Error::from)
            })
        });

        match result {
            Ok(()) => Ok(()),
            // Force-fetching an up-to-date ref is not an error; surface
            // anything else.
            Err(e) => match e.downcast::<git2::Error>() {
                Ok(git_err) => Err(ResolverError::from_git(git_err)),
                Err(e) => Err(ResolverError::Network(e)),
            },
        }
    }
}

/// Clones a single immutable `snapshot-<date>` branch from the archive
/// repository. Snapshots never change once cloned, so `update` is a no-op.
pub struct SnapshotFetcher {
    pub url: String,
    pub date: String,
}

impl SnapshotFetcher {
    pub fn new(url: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            date: date.into(),
        }
    }
}

impl Fetcher for SnapshotFetcher {
    fn fetch(&self, dest: &Path) -> Result<()> {
        let git_config = git2::Config::open_default().map_err(ResolverError::from_git)?;
        let branch = format!("snapshot-{}", self.date);

        with_progress_log(|pipe| {
            let url = self.url.clone();
            let mut builder = git2::build::RepoBuilder::new();
            builder.bare(true);
            builder.branch(&branch);

            let mut result: Option<Result<git2::Repository>> = None;
            crate::git::with_fetch_options(
                &git_config,
                &url,
                pipe,
                &mut |mut opts| {
                    opts.download_tags(git2::AutotagOption::None);
                    result = Some(
                        builder
                            .fetch_options(opts)
                            .clone(&url, dest)
                            .map_err(anyhow::Error::from)
                            .map_err(|e| match e.downcast::<git2::Error>() {
                                Ok(git_err) => ResolverError::from_git(git_err),
                                Err(e) => ResolverError::Network(e),
                            }),
                    );
                    Ok(())
                },
            )
            .map_err(|e| match e.downcast::<git2::Error>() {
                Ok(git_err) => ResolverError::from_git(git_err),
                Err(e) => ResolverError::Network(e),
            })?;

            result.expect("fetch callback always runs exactly once")?;
            Ok(())
        })
    }

    fn update(&self, _dest: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::process::Command;

    fn init_fixture_repo(dir: &Path) {
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .current_dir(dir)
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@example.com")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@example.com")
                .status()
                .expect("git available in test environment");
            assert!(status.success(), "git {:?} failed", args);
        };

        run(&["init", "--initial-branch=master"]);
        std::fs::write(dir.join("README"), "hello\n").unwrap();
        run(&["add", "README"]);
        run(&["commit", "-m", "initial"]);
        run(&["branch", "snapshot-2024-01-01"]);
    }

    #[test]
    fn current_fetcher_clones_and_updates() {
        let src = tempfile::tempdir().unwrap();
        init_fixture_repo(src.path());

        let dest = tempfile::tempdir().unwrap();
        std::fs::remove_dir(dest.path()).unwrap();

        let url = format!("file://{}", src.path().display());
        let fetcher = CurrentFetcher::new(&url);
        fetcher.fetch(dest.path()).unwrap();

        let repo = git2::Repository::open(dest.path()).unwrap();
        assert!(repo.head().is_ok());

        fetcher.update(dest.path()).unwrap();
    }

    #[test]
    fn snapshot_fetcher_clones_named_branch() {
        let src = tempfile::tempdir().unwrap();
        init_fixture_repo(src.path());

        let dest = tempfile::tempdir().unwrap();
        std::fs::remove_dir(dest.path()).unwrap();

        let url = format!("file://{}", src.path().display());
        let fetcher = SnapshotFetcher::new(&url, "2024-01-01");
        fetcher.fetch(dest.path()).unwrap();

        let repo = git2::Repository::open(dest.path()).unwrap();
        assert!(repo.find_branch("master", git2::BranchType::Local).is_err());

        // Update is a no-op for snapshots.
        fetcher.update(dest.path()).unwrap();
    }
}
