//! End-to-end tests that need a real `IndexManager` over two on-disk
//! repositories, rather than calling `find_registry_resolution` in
//! isolation: multi-repository boundary handling and the containment
//! precondition. Single-repository search and LRU eviction have unit
//! coverage next to the code they exercise, in `src/resolver.rs` and
//! `src/manager.rs`.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use civr::{
    entry_path, find_registry_resolution, AcquireOptions, IndexManager, IndexManagerConfig,
    RepositoryKey, Target,
};

/// One line per published version, matching the real index's
/// newline-delimited-JSON layout closely enough for substring matching.
fn index_lines(name: &str, versions: &[&str]) -> String {
    versions
        .iter()
        .map(|v| format!(r#"{{"name":"{name}","vers":"{v}"}}"#))
        .collect::<Vec<_>>()
        .join("\n")
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

/// Builds a bare repository at `path` with one commit per `(seconds, entries)`
/// pair, each entry a `(crate name, published versions)` pair, entirely
/// through `git2` rather than shelling out to the `git` binary.
fn build_fixture_at(path: &std::path::Path, commits: &[(i64, Vec<(&str, Vec<&str>)>)]) {
    let repo = git2::Repository::init_bare(path).unwrap();
    let sig = git2::Signature::new("test", "test@example.com", &git2::Time::new(0, 0)).unwrap();

    let mut parent: Option<git2::Oid> = None;
    for (seconds, entries) in commits {
        let mut tree_builder = repo.treebuilder(None).unwrap();
        for (name, versions) in entries {
            let path = entry_path(name);
            let blob_id = repo.blob(index_lines(name, versions).as_bytes()).unwrap();
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
            .commit(Some("HEAD"), &commit_sig, &sig, "snapshot", &tree, &parent_refs)
            .unwrap();
        parent = Some(oid);
    }
}

/// Both the newest repo and an older snapshot contain the requested
/// versions, but the newest repo's own history already shows the drop from
/// `base` to `base - 1`, so the search must return an answer from the
/// newest repo without ever inspecting the snapshot.
#[tokio::test]
async fn multi_repo_search_stays_in_newest_repo_when_drop_found_there() {
    let root = tempfile::tempdir().unwrap();

    // Newest: two commits, base drops from 2 to 1 going backward.
    build_fixture_at(
        &root.path().join("current"),
        &[
            (0, vec![("serde", vec!["1.0.193"])]),
            (
                200_000,
                vec![("serde", vec!["1.0.193"]), ("tokio", vec!["1.35.1"])],
            ),
        ],
    );

    // Snapshot: older, both present throughout — should never be reached.
    build_fixture_at(
        &root.path().join("snapshot-2024-01-01"),
        &[(
            0,
            vec![("serde", vec!["1.0.193"]), ("tokio", vec!["1.35.1"])],
        )],
    );

    let cfg = IndexManagerConfig::from_root(root.path());
    let manager = IndexManager::new_from_fs(cfg).await.unwrap();

    let mut handles = manager
        .acquire(
            vec![
                RepositoryKey::Current,
                RepositoryKey::Snapshot("2024-01-01".to_owned()),
            ],
            AcquireOptions::default(),
        )
        .await
        .unwrap();

    let packages = vec![Target::new("serde", "1.0.193"), Target::new("tokio", "1.35.1")];
    let resolution = find_registry_resolution(&handles, &packages, Utc::now()).unwrap();

    // The newest commit in `current` is the one where both versions are
    // first simultaneously present; the older commit in that same repo
    // only has serde, so the drop is found without consulting the snapshot.
    let current_repo = git2::Repository::open(root.path().join("current")).unwrap();
    let head_oid = current_repo.head().unwrap().peel_to_commit().unwrap().id();
    assert_eq!(resolution.commit_hash, head_oid.to_string());

    for handle in &mut handles {
        handle.close();
    }
    manager.close().await;
}

/// The newest repo has no commit (before the publish time) at which any
/// requested package is present, so it reports `NO_MATCHES`; the search
/// must continue into the older snapshot rather than aborting.
#[tokio::test]
async fn multi_repo_search_continues_past_no_matches_in_newest_repo() {
    let root = tempfile::tempdir().unwrap();

    build_fixture_at(
        &root.path().join("current"),
        &[(0, vec![("serde", vec!["2.0.0"])])],
    );

    build_fixture_at(
        &root.path().join("snapshot-2024-01-01"),
        &[(0, vec![("serde", vec!["1.0.193"])])],
    );

    let cfg = IndexManagerConfig::from_root(root.path());
    let manager = IndexManager::new_from_fs(cfg).await.unwrap();

    let mut handles = manager
        .acquire(
            vec![
                RepositoryKey::Current,
                RepositoryKey::Snapshot("2024-01-01".to_owned()),
            ],
            AcquireOptions::default(),
        )
        .await
        .unwrap();

    let packages = vec![Target::new("serde", "1.0.193")];
    let resolution = find_registry_resolution(&handles, &packages, Utc::now()).unwrap();

    let snapshot_repo =
        git2::Repository::open(root.path().join("snapshot-2024-01-01")).unwrap();
    let head_oid = snapshot_repo.head().unwrap().peel_to_commit().unwrap().id();
    assert_eq!(resolution.commit_hash, head_oid.to_string());

    for handle in &mut handles {
        handle.close();
    }
    manager.close().await;
}

/// The caller requires CURRENT to contain a commit at or after `published`,
/// but CURRENT's `HEAD` is older than that, so `acquire` must fail with
/// `RegistryOutOfDate` carrying the actual head commit time.
#[tokio::test]
async fn acquire_fails_when_current_head_is_older_than_required() {
    let root = tempfile::tempdir().unwrap();

    let head_time = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    build_fixture_at(
        &root.path().join("current"),
        &[(head_time.timestamp(), vec![("serde", vec!["1.0.193"])])],
    );

    let mut cfg = IndexManagerConfig::from_root(root.path());
    // Keep the freshness check from racing a real network fetch of
    // `current_index_url` during this test.
    cfg.current_update_interval = Duration::from_secs(3600);
    let manager = IndexManager::new_from_fs(cfg).await.unwrap();

    let required = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();
    let err = manager
        .acquire(
            vec![RepositoryKey::Current],
            AcquireOptions {
                contains: Some(required),
            },
        )
        .await
        .unwrap_err();

    match err {
        civr::ResolverError::RegistryOutOfDate {
            required: got_required,
            head_commit_time,
            next_update_time,
            ..
        } => {
            assert_eq!(got_required, required);
            assert_eq!(head_commit_time, head_time);
            assert!(next_update_time > head_commit_time);
        }
        other => panic!("expected RegistryOutOfDate, got {other:?}"),
    }

    manager.close().await;
}
