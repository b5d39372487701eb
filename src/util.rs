//! RFC3339 timestamp helpers and small filesystem utilities shared across
//! the index manager, resolver, and CLI.

use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::{ResolverError, Result};

/// Parses an RFC3339 timestamp, mapping failures to [`ResolverError::Invalid`]
/// the way the HTTP handler and CLI both need to.
pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ResolverError::invalid(format!("invalid RFC3339 timestamp '{s}': {e}")))
}

/// Converts a `git2` commit time (seconds-since-epoch + UTC offset minutes)
/// into a [`DateTime<Utc>`].
pub fn git_time_to_utc(time: git2::Time) -> DateTime<Utc> {
    DateTime::from_timestamp(time.seconds(), 0).unwrap_or_else(Utc::now)
}

/// Reads a single file's contents out of a gzip-compressed tarball without
/// unpacking the rest of it to disk, the way the CLI's `crate@version` mode
/// needs to pull `Cargo.lock` out of a downloaded `.crate` file.
///
/// `unpack_tar` unpacks everything to disk; we only need one small text
/// file, so we walk the archive entries instead.
pub fn read_file_from_crate_tar(data: &[u8], file_suffix: &str) -> Result<Option<String>> {
    let gz = flate2::read::GzDecoder::new(data);
    let mut archive = tar::Archive::new(gz);

    for entry in archive
        .entries()
        .map_err(|e| ResolverError::Storage(anyhow::Error::from(e)))?
    {
        let mut entry = entry.map_err(|e| ResolverError::Storage(anyhow::Error::from(e)))?;
        let path = entry
            .path()
            .map_err(|e| ResolverError::Storage(anyhow::Error::from(e)))?
            .to_string_lossy()
            .into_owned();

        if path.ends_with(file_suffix) {
            let mut contents = String::new();
            entry
                .read_to_string(&mut contents)
                .map_err(ResolverError::from)?;
            return Ok(Some(contents));
        }
    }

    Ok(None)
}

/// Removes a directory tree if it exists, treating "already gone" as
/// success. Used by eviction and by fetch-failure cleanup.
pub fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ResolverError::from(e)),
    }
}
