//! `civr serve --bind <addr>` — stands the `/resolve` HTTP handler up on a
//! bound address.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Error};
use structopt::StructOpt;

use crate::http::{router, AppState};
use crate::manager::{IndexManager, IndexManagerConfig};

#[derive(StructOpt)]
pub struct Args {
    /// Address to bind the HTTP listener to.
    #[structopt(long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Directory under which the index manager keeps `current/` and
    /// `snapshot-<date>/` repositories.
    #[structopt(long, parse(from_os_str), default_value = "./index-cache")]
    cache_dir: PathBuf,

    #[structopt(long, default_value = "16")]
    max_snapshots: usize,

    #[structopt(long, default_value = "15m", parse(try_from_str = crate::cli::parse_duration))]
    current_update_interval: std::time::Duration,
}

pub async fn run(args: Args) -> Result<(), Error> {
    let mut cfg = IndexManagerConfig::from_root(args.cache_dir);
    cfg.max_snapshots = args.max_snapshots;
    cfg.current_update_interval = args.current_update_interval;
    let archive_index_url = cfg.archive_index_url.clone();

    let manager = IndexManager::new_from_fs(cfg).await?;
    let state = Arc::new(AppState {
        manager,
        archive_index_url,
    });

    let app = router(state);

    let bind = args.bind;
    tracing::info!(%bind, "listening");

    axum::Server::bind(&bind)
        .serve(app.into_make_service())
        .await
        .context("http server exited")?;

    Ok(())
}
