//! Typed error taxonomy for the index manager and resolver.
//!
//! `anyhow::Error` is fine at a binary's edges but loses the ability for a
//! caller (the HTTP handler in particular) to pattern-match on *kind*. We
//! keep `anyhow` at the CLI edges and use this typed enum at the library
//! boundary instead.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Every failure mode the index manager or resolver can produce is one of
/// these kinds.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    /// Malformed input: duplicate keys, empty package list, bad timestamp,
    /// bad base64, bad lockfile.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// No commit exists before the requested publish time.
    #[error("no commit found before the requested publish time")]
    NotFound,

    /// Zero of the requested packages matched at the newest eligible commit
    /// in a single repository.
    #[error("no requested packages matched in this repository")]
    NoMatches,

    /// The containment precondition failed: the current index's `HEAD` is
    /// older than the time the caller required it to contain.
    #[error(
        "registry index is out of date: required {required}, head is only at {head_commit_time}"
    )]
    RegistryOutOfDate {
        required: DateTime<Utc>,
        head_commit_time: DateTime<Utc>,
        next_update_time: DateTime<Utc>,
        update_interval: Duration,
    },

    /// Not enough snapshot repositories could be evicted to admit the
    /// requested set under `MaxSnapshots`.
    #[error("not enough capacity to admit the requested repositories")]
    Capacity,

    /// A transport-level failure talking to a remote git host.
    #[error("network error: {0}")]
    Network(#[source] anyhow::Error),

    /// A local filesystem or git-object-store failure.
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    /// The current index failed to update during acquisition.
    #[error("failed to update current index: {0}")]
    Update(#[source] Box<ResolverError>),

    /// The request's context was cancelled, or the manager was closed.
    #[error("request was cancelled")]
    Cancelled,
}

impl ResolverError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Classifies a [`git2::Error`] as [`ResolverError::Network`] or
    /// [`ResolverError::Storage`] based on its [`git2::ErrorClass`], the
    /// same classification `git.rs` uses to decide whether to hint at
    /// `net.git-fetch-with-cli`.
    pub fn from_git(err: git2::Error) -> Self {
        use git2::ErrorClass::*;

        match err.class() {
            Net | Ssl | Submodule | FetchHead | Ssh | Callback | Http => {
                Self::Network(anyhow::Error::from(err))
            }
            _ => Self::Storage(anyhow::Error::from(err)),
        }
    }
}

impl From<git2::Error> for ResolverError {
    fn from(err: git2::Error) -> Self {
        Self::from_git(err)
    }
}

impl From<std::io::Error> for ResolverError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(anyhow::Error::from(err))
    }
}

pub type Result<T> = std::result::Result<T, ResolverError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invalid_formats_message() {
        let e = ResolverError::invalid("duplicate key");
        assert_eq!(e.to_string(), "invalid input: duplicate key");
    }
}
