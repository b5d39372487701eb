//! `civr resolve <lockfile | crate@version> <cache_dir>`: resolves a
//! lockfile (or a single `crate@version`, fetched from the registry to
//! obtain its embedded lockfile and publish time) against the historical
//! index. A bare lockfile path has no registry to ask for a timestamp, so
//! `--published <RFC3339>` is required in that mode.

use std::path::PathBuf;

use anyhow::{Context, Error};
use serde::Deserialize;
use structopt::StructOpt;

use crate::manager::{AcquireOptions, IndexManager, IndexManagerConfig};
use crate::{lockfile, resolver, util};

#[derive(StructOpt)]
pub struct Args {
    /// Either a path to a Cargo.lock file, or `<crate>@<version>`, in which
    /// case the crate tarball is downloaded from crates.io to obtain its
    /// embedded lockfile and publish time.
    target: String,

    /// Directory under which the index manager keeps `current/` and
    /// `snapshot-<date>/` repositories.
    #[structopt(parse(from_os_str))]
    cache_dir: PathBuf,

    /// Publish timestamp to resolve against, required when `target` is a
    /// lockfile path — there's no registry to ask for one in that mode.
    /// Ignored for `<crate>@<version>` targets, whose timestamp comes from
    /// crates.io.
    #[structopt(long)]
    published: Option<String>,

    #[structopt(long, default_value = "16")]
    max_snapshots: usize,

    #[structopt(long, default_value = "15m", parse(try_from_str = crate::cli::parse_duration))]
    current_update_interval: std::time::Duration,
}

#[derive(Deserialize)]
struct CrateVersionMeta {
    version: VersionMeta,
}

#[derive(Deserialize)]
struct VersionMeta {
    created_at: String,
}

async fn resolve_crate_at_version(
    client: &reqwest::Client,
    name: &str,
    version: &str,
) -> Result<(String, chrono::DateTime<chrono::Utc>), Error> {
    let download_url =
        format!("https://static.crates.io/crates/{name}/{name}-{version}.crate");
    let bytes = client
        .get(&download_url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    let lockfile_text = util::read_file_from_crate_tar(&bytes, "Cargo.lock")
        .context("reading embedded Cargo.lock")?
        .context("crate tarball has no embedded Cargo.lock")?;

    let meta_url = format!("https://crates.io/api/v1/crates/{name}/{version}");
    let meta: CrateVersionMeta = client
        .get(&meta_url)
        .header("User-Agent", "crates-index-resolver")
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let published = util::parse_rfc3339(&meta.version.created_at)
        .context("parsing crates.io publish timestamp")?;

    Ok((lockfile_text, published))
}

pub async fn run(args: Args) -> Result<(), Error> {
    let (lockfile_text, published) = if let Some((name, version)) = args.target.split_once('@') {
        let client = reqwest::Client::builder().build()?;
        resolve_crate_at_version(&client, name, version).await?
    } else {
        let text = tokio::fs::read_to_string(&args.target)
            .await
            .with_context(|| format!("reading lockfile {}", args.target))?;
        let published_arg = args.published.as_deref().context(
            "--published <RFC3339> is required when resolving a lockfile path",
        )?;
        let published =
            util::parse_rfc3339(published_arg).context("parsing --published timestamp")?;
        (text, published)
    };

    let packages = lockfile::parse_lockfile(&lockfile_text)?;

    let mut cfg = IndexManagerConfig::from_root(args.cache_dir);
    cfg.max_snapshots = args.max_snapshots;
    cfg.current_update_interval = args.current_update_interval;
    let archive_index_url = cfg.archive_index_url.clone();

    let manager = IndexManager::new_from_fs(cfg).await?;

    let snapshot_dates = crate::discovery::list_available_snapshots(&archive_index_url)?;
    let keys = lockfile::select_relevant_keys(&snapshot_dates, published.date_naive())?;

    if keys.is_empty() {
        println!("{{}}");
        manager.close().await;
        return Ok(());
    }

    let mut handles = manager
        .acquire(
            keys,
            AcquireOptions {
                contains: Some(published),
            },
        )
        .await?;

    let result = resolver::find_registry_resolution(&handles, &packages, published);

    for handle in &mut handles {
        handle.close();
    }
    manager.close().await;

    let resolution = result?;
    println!("{{\"commit_hash\":\"{}\"}}", resolution.commit_hash);

    Ok(())
}
