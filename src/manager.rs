//! The index manager: a disk-backed cache of one mutable `current` git
//! repository and a bounded set of immutable `snapshot-<date>` repositories,
//! all mutated through a single coordinator task so registry state is
//! totally ordered.
//!
//! One struct owns the filesystem root the way `Ctx` does, but acquisition
//! runs as a long-lived coordinator loop rather than a one-shot sync pass,
//! since callers can overlap requests against the same registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::error::{ResolverError, Result};
use crate::fetch::{CurrentFetcher, Fetcher, SnapshotFetcher};
use crate::model::RepositoryKey;
use crate::util;

const EVICTION_BACKOFF: Duration = Duration::from_millis(10);

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Configuration for [`IndexManager::new_from_fs`].
pub struct IndexManagerConfig {
    pub root: PathBuf,
    pub max_snapshots: usize,
    pub current_update_interval: Duration,
    pub current_index_url: String,
    pub archive_index_url: String,
}

impl IndexManagerConfig {
    /// Reads overrides from `CRATES_INDEX_RESOLVER_CURRENT_URL` and
    /// `CRATES_INDEX_RESOLVER_ARCHIVE_URL`, falling back to the well-known
    /// crates.io index and its archive mirror. The overrides let tests and
    /// self-hosted mirrors point at `file://` fixtures instead.
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_snapshots: 16,
            current_update_interval: Duration::from_secs(15 * 60),
            current_index_url: std::env::var("CRATES_INDEX_RESOLVER_CURRENT_URL")
                .unwrap_or_else(|_| "https://github.com/rust-lang/crates.io-index.git".to_owned()),
            archive_index_url: std::env::var("CRATES_INDEX_RESOLVER_ARCHIVE_URL").unwrap_or_else(
                |_| "https://github.com/rust-lang/crates.io-index-archive.git".to_owned(),
            ),
        }
    }
}

/// One registry entry: a key, its on-disk path, access/update bookkeeping,
/// the fetcher that knows how to populate/refresh it, and the rwlock every
/// reader or mutator of its directory must hold.
struct ManagedRepository {
    key: RepositoryKey,
    path: PathBuf,
    last_access: std::sync::atomic::AtomicI64,
    last_update: std::sync::atomic::AtomicI64,
    fetcher: Box<dyn Fetcher>,
    lock: Arc<RwLock<()>>,
}

impl ManagedRepository {
    fn touch_access(&self) {
        self.last_access.store(now_ms(), Ordering::SeqCst);
    }
}

/// A caller-held, release-once reference to a [`ManagedRepository`]'s read
/// lock.
pub struct RepositoryHandle {
    key: RepositoryKey,
    path: PathBuf,
    released: Arc<AtomicBool>,
    _guard: Option<tokio::sync::OwnedRwLockReadGuard<()>>,
}

impl RepositoryHandle {
    pub fn key(&self) -> &RepositoryKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the read lock. Idempotent: a second call is a no-op.
    pub fn close(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self._guard.take();
        }
    }
}

impl Drop for RepositoryHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Options accepted by [`IndexManager::acquire`].
#[derive(Default, Clone)]
pub struct AcquireOptions {
    pub contains: Option<chrono::DateTime<chrono::Utc>>,
}

struct AcquisitionRequest {
    keys: Vec<RepositoryKey>,
    opts: AcquireOptions,
    cancelled: Arc<AtomicBool>,
    respond_to: oneshot::Sender<Result<Vec<RepositoryHandle>>>,
}

/// Coordinates acquisition of repository handles. All registry mutation
/// happens inside a single task reading from an internal channel; this
/// struct is just the caller-facing handle to that task.
pub struct IndexManager {
    tx: mpsc::Sender<AcquisitionRequest>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl IndexManager {
    /// Scans `cfg.root` for existing `current`/`snapshot-<date>` directories,
    /// registers any that open as valid git repositories, then spawns the
    /// coordinator task.
    #[instrument(skip(cfg), fields(root = %cfg.root.display()))]
    pub async fn new_from_fs(cfg: IndexManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&cfg.root).map_err(ResolverError::from)?;

        let mut registry: HashMap<RepositoryKey, Arc<ManagedRepository>> = HashMap::new();

        for entry in std::fs::read_dir(&cfg.root).map_err(ResolverError::from)? {
            let entry = entry.map_err(ResolverError::from)?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();

            let key = if name == "current" {
                Some(RepositoryKey::Current)
            } else {
                name.strip_prefix("snapshot-")
                    .map(|date| RepositoryKey::Snapshot(date.to_owned()))
            };

            let Some(key) = key else { continue };

            if git2::Repository::open(&path).is_err() {
                continue;
            }

            let mtime_ms = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or_else(now_ms);

            let fetcher: Box<dyn Fetcher> = match &key {
                RepositoryKey::Current => Box::new(CurrentFetcher::new(&cfg.current_index_url)),
                RepositoryKey::Snapshot(date) => {
                    Box::new(SnapshotFetcher::new(&cfg.archive_index_url, date.clone()))
                }
            };

            registry.insert(
                key.clone(),
                Arc::new(ManagedRepository {
                    key,
                    path,
                    last_access: std::sync::atomic::AtomicI64::new(mtime_ms),
                    last_update: std::sync::atomic::AtomicI64::new(mtime_ms),
                    fetcher,
                    lock: Arc::new(RwLock::new(())),
                }),
            );
        }

        let (tx, rx) = mpsc::channel(32);
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let coordinator = Coordinator {
            root: cfg.root.clone(),
            max_snapshots: cfg.max_snapshots,
            current_update_interval: cfg.current_update_interval,
            current_index_url: cfg.current_index_url.clone(),
            archive_index_url: cfg.archive_index_url.clone(),
            registry,
        };

        tokio::spawn(coordinator.run(rx, shutdown.clone()));

        Ok(Self {
            tx,
            closed,
            shutdown,
        })
    }

    /// Requests handles for `keys`, in order, running the full acquisition
    /// protocol: dedup, capacity eviction, freshness refresh, containment
    /// check, and fetch of anything missing.
    pub async fn acquire(
        &self,
        keys: Vec<RepositoryKey>,
        opts: AcquireOptions,
    ) -> Result<Vec<RepositoryHandle>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ResolverError::Cancelled);
        }

        let (respond_to, rx) = oneshot::channel();
        let request = AcquisitionRequest {
            keys,
            opts,
            cancelled: Arc::new(AtomicBool::new(false)),
            respond_to,
        };

        if self.tx.send(request).await.is_err() {
            return Err(ResolverError::Cancelled);
        }

        rx.await.map_err(|_| ResolverError::Cancelled)?
    }

    /// Idempotently shuts the coordinator down. Further `acquire` calls fail
    /// with `Cancelled`.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_one();
        }
    }
}

struct Coordinator {
    root: PathBuf,
    max_snapshots: usize,
    current_update_interval: Duration,
    current_index_url: String,
    archive_index_url: String,
    registry: HashMap<RepositoryKey, Arc<ManagedRepository>>,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::Receiver<AcquisitionRequest>, shutdown: Arc<Notify>) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("index manager coordinator shutting down");
                    break;
                }
                request = rx.recv() => {
                    match request {
                        Some(request) => {
                            let result = self.handle_request(&request).await;
                            let _ = request.respond_to.send(result);
                        }
                        None => break,
                    }
                }
            }
        }
        rx.close();
    }

    fn make_fetcher(&self, key: &RepositoryKey) -> Box<dyn Fetcher> {
        match key {
            RepositoryKey::Current => Box::new(CurrentFetcher::new(&self.current_index_url)),
            RepositoryKey::Snapshot(date) => {
                Box::new(SnapshotFetcher::new(&self.archive_index_url, date.clone()))
            }
        }
    }

    fn path_for(&self, key: &RepositoryKey) -> PathBuf {
        self.root.join(key.dir_name())
    }

    #[instrument(skip(self, request), fields(n = request.keys.len()))]
    async fn handle_request(
        &mut self,
        request: &AcquisitionRequest,
    ) -> Result<Vec<RepositoryHandle>> {
        // Step 1: de-duplicate.
        let mut seen = std::collections::HashSet::new();
        for key in &request.keys {
            if !seen.insert(key.clone()) {
                return Err(ResolverError::invalid(format!(
                    "duplicate key in acquisition request: {key}"
                )));
            }
        }

        // Step 2: partition into existing / missing.
        let mut existing = Vec::new();
        let mut missing = Vec::new();
        for key in &request.keys {
            if let Some(repo) = self.registry.get(key) {
                repo.touch_access();
                existing.push(key.clone());
            } else {
                missing.push(key.clone());
            }
        }

        // Step 3: capacity provisioning.
        if let Err(e) = self
            .evict_for_capacity(&existing, &missing, &request.cancelled)
            .await
        {
            return Err(e);
        }

        // Step 4: freshness update of an existing CURRENT.
        if existing.contains(&RepositoryKey::Current) {
            self.maybe_refresh_current().await?;
        }

        // Step 5: read-lock all existing.
        let mut guards: HashMap<RepositoryKey, tokio::sync::OwnedRwLockReadGuard<()>> =
            HashMap::new();
        for key in &existing {
            let repo = self.registry.get(key).expect("checked present above").clone();
            let guard = repo.lock.clone().read_owned().await;
            guards.insert(key.clone(), guard);
        }

        // Step 6: containment precondition.
        if let Some(required) = request.opts.contains {
            if request.keys.contains(&RepositoryKey::Current) {
                if let Some(repo) = self.registry.get(&RepositoryKey::Current) {
                    match self.check_containment(repo, required) {
                        Ok(()) => {}
                        Err(e) => {
                            drop(guards);
                            return Err(e);
                        }
                    }
                }
            }
        }

        // Step 7: parallel fetch of missing.
        match self.fetch_missing(&missing, &request.cancelled).await {
            Ok(mut new_guards) => guards.extend(new_guards.drain()),
            Err(e) => {
                drop(guards);
                return Err(e);
            }
        }

        // Step 8: build handles in caller order.
        let mut handles = Vec::with_capacity(request.keys.len());
        for key in &request.keys {
            let repo = self.registry.get(key).expect("registered by now").clone();
            let guard = guards
                .remove(key)
                .expect("every requested key has a read guard by this point");
            handles.push(RepositoryHandle {
                key: key.clone(),
                path: repo.path.clone(),
                released: Arc::new(AtomicBool::new(false)),
                _guard: Some(guard),
            });
        }

        Ok(handles)
    }

    async fn evict_for_capacity(
        &mut self,
        existing: &[RepositoryKey],
        missing: &[RepositoryKey],
        cancelled: &Arc<AtomicBool>,
    ) -> Result<()> {
        let new_snapshot_count = missing
            .iter()
            .filter(|k| matches!(k, RepositoryKey::Snapshot(_)))
            .count();
        if new_snapshot_count == 0 {
            return Ok(());
        }

        let current_snapshot_count = self
            .registry
            .keys()
            .filter(|k| matches!(k, RepositoryKey::Snapshot(_)))
            .count();

        let projected = current_snapshot_count + new_snapshot_count;
        if projected <= self.max_snapshots {
            return Ok(());
        }
        let mut required = projected - self.max_snapshots;

        let protected: std::collections::HashSet<&RepositoryKey> =
            existing.iter().chain(missing.iter()).collect();

        loop {
            if required == 0 {
                return Ok(());
            }
            if cancelled.load(Ordering::SeqCst) {
                return Err(ResolverError::Cancelled);
            }

            let mut candidates: Vec<Arc<ManagedRepository>> = self
                .registry
                .values()
                .filter(|r| matches!(r.key, RepositoryKey::Snapshot(_)))
                .filter(|r| !protected.contains(&r.key))
                .cloned()
                .collect();

            if candidates.is_empty() {
                return Err(ResolverError::Capacity);
            }

            candidates.sort_by_key(|r| r.last_access.load(Ordering::SeqCst));

            let mut made_progress = false;
            for candidate in candidates.iter().take(required) {
                let Ok(_guard) = candidate.lock.try_write() else {
                    continue;
                };
                self.registry.remove(&candidate.key);
                util::remove_dir_if_exists(&candidate.path)?;
                required -= 1;
                made_progress = true;
                debug!(key = %candidate.key, "evicted snapshot for capacity");
                if required == 0 {
                    break;
                }
            }

            if !made_progress {
                tokio::time::sleep(EVICTION_BACKOFF).await;
            }
        }
    }

    async fn maybe_refresh_current(&mut self) -> Result<()> {
        let Some(repo) = self.registry.get(&RepositoryKey::Current).cloned() else {
            return Ok(());
        };

        let elapsed = now_ms() - repo.last_update.load(Ordering::SeqCst);
        if elapsed <= self.current_update_interval.as_millis() as i64 {
            return Ok(());
        }

        let guard = repo.lock.clone().write_owned().await;
        let start = now_ms();
        let path = repo.path.clone();
        let fetcher_url = self.current_index_url.clone();

        let result = tokio::task::spawn_blocking(move || {
            CurrentFetcher::new(fetcher_url).update(&path)
        })
        .await
        .map_err(|e| ResolverError::Storage(anyhow::Error::from(e)))?;

        drop(guard);

        match result {
            Ok(()) => {
                repo.last_update.store(start, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => Err(ResolverError::Update(Box::new(e))),
        }
    }

    fn check_containment(
        &self,
        repo: &Arc<ManagedRepository>,
        required: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let git_repo = git2::Repository::open(&repo.path).map_err(ResolverError::from_git)?;
        let head = git_repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(ResolverError::from_git)?;
        let head_commit_time = util::git_time_to_utc(head.time());

        if required > head_commit_time {
            let last_update = repo.last_update.load(Ordering::SeqCst);
            let next_update_time = chrono::DateTime::from_timestamp_millis(last_update)
                .unwrap_or_else(chrono::Utc::now)
                + chrono::Duration::from_std(self.current_update_interval).unwrap_or_default();

            return Err(ResolverError::RegistryOutOfDate {
                required,
                head_commit_time,
                next_update_time,
                update_interval: self.current_update_interval,
            });
        }

        Ok(())
    }

    async fn fetch_missing(
        &mut self,
        missing: &[RepositoryKey],
        cancelled: &Arc<AtomicBool>,
    ) -> Result<HashMap<RepositoryKey, tokio::sync::OwnedRwLockReadGuard<()>>> {
        if missing.is_empty() {
            return Ok(HashMap::new());
        }

        for key in missing {
            let path = self.path_for(key);
            let fetcher = self.make_fetcher(key);
            let repo = Arc::new(ManagedRepository {
                key: key.clone(),
                path: path.clone(),
                last_access: std::sync::atomic::AtomicI64::new(now_ms()),
                last_update: std::sync::atomic::AtomicI64::new(now_ms()),
                fetcher,
                lock: Arc::new(RwLock::new(())),
            });
            self.registry.entry(key.clone()).or_insert(repo);
        }

        let mut tasks = Vec::new();
        for key in missing {
            let repo = self.registry.get(key).expect("just inserted").clone();
            let cancelled = cancelled.clone();
            tasks.push(tokio::spawn(async move {
                if cancelled.load(Ordering::SeqCst) {
                    return (repo.key.clone(), Err(ResolverError::Cancelled));
                }
                let guard = repo.lock.clone().write_owned().await;
                let path = repo.path.clone();

                let result = tokio::task::spawn_blocking({
                    let repo = repo.clone();
                    move || repo.fetcher.fetch(&path)
                })
                .await
                .map_err(|e| ResolverError::Storage(anyhow::Error::from(e)));

                let result = match result {
                    Ok(inner) => inner,
                    Err(e) => Err(e),
                };

                match result {
                    Ok(()) => (repo.key.clone(), Ok(guard.downgrade())),
                    Err(e) => {
                        drop(guard);
                        (repo.key.clone(), Err(e))
                    }
                }
            }));
        }

        let mut guards = HashMap::new();
        let mut first_error = None;

        for task in tasks {
            let (key, result) = task
                .await
                .map_err(|e| ResolverError::Storage(anyhow::Error::from(e)))?;
            match result {
                Ok(guard) => {
                    guards.insert(key, guard);
                }
                Err(e) => {
                    if let Some(repo) = self.registry.remove(&key) {
                        let _ = util::remove_dir_if_exists(&repo.path);
                    }
                    cancelled.store(true, Ordering::SeqCst);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    warn!(%key, "fetch failed during acquisition");
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(guards),
        }
    }
}
