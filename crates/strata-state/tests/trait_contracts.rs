//! Trait contract tests for ManifestStore, RunRegistry, and TableStore.
//!
//! Registry contracts run against both the in-memory fake and the SurrealDB
//! registry (on `mem://`). Any conforming implementation must pass these.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde_json::json;
use strata_state::fakes::{MemoryManifestStore, MemoryRunRegistry, MemoryTableStore};
use strata_state::storage_traits::*;
use strata_state::{FsTableStore, StorageError, SurrealRunRegistry};

fn day(n: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 4, n).unwrap()
}

fn key(n: u32) -> PartitionKey {
    PartitionKey::new(Domain::new("screen_time").unwrap(), day(n))
}

fn bronze() -> AssetId {
    "bronze/screen_time/raw_usage".parse().unwrap()
}

fn silver() -> AssetId {
    "silver/screen_time/app_usage".parse().unwrap()
}

// ===========================================================================
// ManifestStore contract tests
// ===========================================================================

#[tokio::test]
async fn manifest_commit_is_versioned() {
    let store = MemoryManifestStore::new();
    let domain = Domain::new("location").unwrap();
    let mut m = store.load(&domain).await.unwrap();
    m.mark_committed(day(1), Utc::now());
    m.version = store.commit(&m).await.unwrap();

    let mut stale = m.clone();
    stale.version = 0;
    assert!(matches!(
        store.commit(&stale).await,
        Err(StorageError::VersionConflict { .. })
    ));
    assert_eq!(store.load(&domain).await.unwrap().committed().len(), 1);
    assert_eq!(store.domains().await.unwrap(), vec![domain]);
}

// ===========================================================================
// RunRegistry contract tests
// ===========================================================================

async fn registries() -> Vec<Arc<dyn RunRegistry>> {
    vec![
        Arc::new(MemoryRunRegistry::new()),
        Arc::new(SurrealRunRegistry::in_memory().await.unwrap()),
    ]
}

#[tokio::test]
async fn registry_lifecycle() {
    for reg in registries().await {
        let created = reg
            .create(&bronze(), &key(1), TriggerSource::Cron, 1)
            .await
            .unwrap();
        let CreateOutcome::Created(run) = created else {
            panic!("expected a new run");
        };
        assert_eq!(run.state, RunState::Pending);

        let started = reg.start(&run.run_id, &[]).await.unwrap();
        assert!(matches!(started, StartOutcome::Started(ref r) if r.state == RunState::Running));

        let done = reg
            .finish(&run.run_id, RunState::Succeeded, None)
            .await
            .unwrap();
        assert_eq!(done.state, RunState::Succeeded);
        assert!(done.finished_at.is_some());

        // Terminal runs are immutable.
        let err = reg
            .finish(&run.run_id, RunState::Failed, Some("late".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRunState { .. }));

        let latest = reg.latest(&bronze(), &key(1)).await.unwrap().unwrap();
        assert_eq!(latest.run_id, run.run_id);
    }
}

#[tokio::test]
async fn registry_rejects_second_active_run() {
    for reg in registries().await {
        let first = reg
            .create(&bronze(), &key(2), TriggerSource::Cron, 1)
            .await
            .unwrap();
        let second = reg
            .create(&bronze(), &key(2), TriggerSource::Manual, 1)
            .await
            .unwrap();
        assert!(matches!(first, CreateOutcome::Created(_)));
        match second {
            CreateOutcome::AlreadyActive(r) => assert_eq!(r.run_id, first.run().run_id),
            other => panic!("expected AlreadyActive, got {other:?}"),
        }

        // A different partition is independent.
        let other = reg
            .create(&bronze(), &key(3), TriggerSource::Cron, 1)
            .await
            .unwrap();
        assert!(matches!(other, CreateOutcome::Created(_)));
    }
}

#[tokio::test]
async fn registry_concurrent_creates_yield_one_run() {
    for reg in registries().await {
        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                reg.create(&silver(), &key(4), TriggerSource::Upstream, 1)
                    .await
                    .unwrap()
            }));
        }
        let mut created = 0;
        for h in handles {
            if matches!(h.await.unwrap(), CreateOutcome::Created(_)) {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(reg.list(Some(&silver())).await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn registry_start_gates_on_upstream_success() {
    for reg in registries().await {
        let down = reg
            .create(&silver(), &key(5), TriggerSource::Upstream, 1)
            .await
            .unwrap()
            .run()
            .clone();

        // No upstream run at all.
        let blocked = reg.start(&down.run_id, &[bronze()]).await.unwrap();
        assert_eq!(blocked, StartOutcome::Blocked { upstream: bronze() });

        // Upstream running is still blocked.
        let up = reg
            .create(&bronze(), &key(5), TriggerSource::Cron, 1)
            .await
            .unwrap()
            .run()
            .clone();
        reg.start(&up.run_id, &[]).await.unwrap();
        assert!(matches!(
            reg.start(&down.run_id, &[bronze()]).await.unwrap(),
            StartOutcome::Blocked { .. }
        ));

        reg.finish(&up.run_id, RunState::Succeeded, None)
            .await
            .unwrap();
        assert!(matches!(
            reg.start(&down.run_id, &[bronze()]).await.unwrap(),
            StartOutcome::Started(_)
        ));
    }
}

#[tokio::test]
async fn registry_pending_run_can_be_cancelled() {
    for reg in registries().await {
        let run = reg
            .create(&bronze(), &key(6), TriggerSource::Manual, 1)
            .await
            .unwrap()
            .run()
            .clone();
        let failed = reg
            .finish(&run.run_id, RunState::Failed, Some("cancelled".into()))
            .await
            .unwrap();
        assert_eq!(failed.error.as_deref(), Some("cancelled"));
        assert!(matches!(
            reg.finish(&run.run_id, RunState::Succeeded, None).await,
            Err(StorageError::InvalidRunState { .. })
        ));
    }
}

#[tokio::test]
async fn registry_fails_runs_left_active_by_a_crash() {
    for reg in registries().await {
        let CreateOutcome::Created(running) = reg
            .create(&bronze(), &key(1), TriggerSource::Cron, 1)
            .await
            .unwrap()
        else {
            panic!("expected a new run");
        };
        reg.start(&running.run_id, &[]).await.unwrap();
        let CreateOutcome::Created(pending) = reg
            .create(&bronze(), &key(2), TriggerSource::Cron, 1)
            .await
            .unwrap()
        else {
            panic!("expected a new run");
        };
        let CreateOutcome::Created(done) = reg
            .create(&bronze(), &key(3), TriggerSource::Cron, 1)
            .await
            .unwrap()
        else {
            panic!("expected a new run");
        };
        reg.start(&done.run_id, &[]).await.unwrap();
        reg.finish(&done.run_id, RunState::Succeeded, None).await.unwrap();

        let failed = reg.fail_interrupted("interrupted by restart").await.unwrap();
        let mut ids: Vec<_> = failed.iter().map(|r| r.run_id.clone()).collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        let mut expected = vec![running.run_id.clone(), pending.run_id.clone()];
        expected.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(ids, expected);

        let after = reg.get(&running.run_id).await.unwrap();
        assert_eq!(after.state, RunState::Failed);
        assert_eq!(after.error.as_deref(), Some("interrupted by restart"));
        assert!(after.finished_at.is_some());
        assert_eq!(reg.get(&done.run_id).await.unwrap().state, RunState::Succeeded);

        // Both pairs accept new work again.
        for n in [1, 2] {
            let again = reg
                .create(&bronze(), &key(n), TriggerSource::Manual, 2)
                .await
                .unwrap();
            assert!(matches!(again, CreateOutcome::Created(_)));
        }
        assert_eq!(reg.fail_interrupted("again").await.unwrap().len(), 2);
    }
}

#[tokio::test]
async fn reopened_registry_releases_a_crashed_run() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("surrealkv://{}", dir.path().join("registry").display());

    let reg = SurrealRunRegistry::connect(&url).await.unwrap();
    let CreateOutcome::Created(run) = reg
        .create(&bronze(), &key(1), TriggerSource::Cron, 1)
        .await
        .unwrap()
    else {
        panic!("expected a new run");
    };
    reg.start(&run.run_id, &[]).await.unwrap();
    drop(reg);

    let reg = SurrealRunRegistry::connect(&url).await.unwrap();
    assert!(matches!(
        reg.create(&bronze(), &key(1), TriggerSource::Cron, 1).await.unwrap(),
        CreateOutcome::AlreadyActive(_)
    ));
    let failed = reg.fail_interrupted("interrupted by restart").await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].run_id, run.run_id);

    let again = reg
        .create(&bronze(), &key(1), TriggerSource::Manual, 1)
        .await
        .unwrap();
    let CreateOutcome::Created(fresh) = again else {
        panic!("pair still held by the crashed run");
    };
    let started = reg.start(&fresh.run_id, &[]).await.unwrap();
    assert!(matches!(started, StartOutcome::Started(_)));
}

#[tokio::test]
async fn registry_unknown_run_not_found() {
    for reg in registries().await {
        let err = reg.get(&RunId::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::RunNotFound { .. }));
    }
}

// ===========================================================================
// TableStore contract tests
// ===========================================================================

fn row(k: &str, n: u32, minutes: i64) -> TableRow {
    TableRow {
        key: k.to_string(),
        partition: day(n),
        values: [("minutes".to_string(), json!(minutes))]
            .into_iter()
            .collect(),
    }
}

async fn table_stores(dir: &tempfile::TempDir) -> Vec<Arc<dyn TableStore>> {
    vec![
        Arc::new(MemoryTableStore::new()),
        Arc::new(FsTableStore::open(dir.path()).unwrap()),
    ]
}

#[tokio::test]
async fn table_replay_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    for store in table_stores(&dir).await {
        let batch = vec![row("safari", 1, 30), row("mail", 1, 5)];
        store
            .merge_partition(&silver(), day(1), batch.clone())
            .await
            .unwrap();
        let first = store.snapshot(&silver(), Some(day(1))).await.unwrap();

        let replay = store
            .merge_partition(&silver(), day(1), batch)
            .await
            .unwrap();
        assert!(!replay.committed);
        let second = store.snapshot(&silver(), Some(day(1))).await.unwrap();
        assert_eq!(first.digest(), second.digest());
        assert_eq!(second.rows.len(), 2);
    }
}

#[tokio::test]
async fn table_failed_merge_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    for store in table_stores(&dir).await {
        store
            .merge_partition(&bronze(), day(2), vec![row("a", 2, 1)])
            .await
            .unwrap();
        let before = store.snapshot(&bronze(), None).await.unwrap();

        let err = store
            .merge_partition(&bronze(), day(2), vec![row("b", 2, 1), row("b", 2, 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey { .. }));

        let after = store.snapshot(&bronze(), None).await.unwrap();
        assert_eq!(before, after);
    }
}

#[tokio::test]
async fn table_compaction_keeps_rows() {
    let dir = tempfile::tempdir().unwrap();
    for store in table_stores(&dir).await {
        for m in 1..=4 {
            store
                .merge_partition(&silver(), day(3), vec![row(&format!("app{m}"), 3, m)])
                .await
                .unwrap();
        }
        let before = store.snapshot(&silver(), Some(day(3))).await.unwrap();
        let report = store.compact(&silver()).await.unwrap();
        assert_eq!(report.files_after, 1);
        let after = store.snapshot(&silver(), Some(day(3))).await.unwrap();
        assert_eq!(before.rows, after.rows);

        let noop = store.compact(&silver()).await.unwrap();
        assert_eq!(noop.version, None);
        assert_eq!(store.list_tables().await.unwrap(), vec![silver()]);
    }
}
