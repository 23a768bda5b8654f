//! Compaction and version expiry over silver and gold tables.

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use serde_json::json;
use strata_core::{MaintenanceJob, MaintenanceSettings, StrataError};
use strata_state::{FsTableStore, Layer, TableId, TableRow, TableStore};

fn day(n: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, n).unwrap()
}

fn row(key: &str, partition: NaiveDate, minutes: i64) -> TableRow {
    TableRow {
        key: key.to_string(),
        partition,
        values: [("minutes".to_string(), json!(minutes))].into_iter().collect(),
    }
}

fn table(id: &str) -> TableId {
    id.parse().unwrap()
}

/// Three merges into one partition leave three data files behind.
async fn fragmented(store: &dyn TableStore, id: &TableId) {
    for minutes in [10, 20, 30] {
        store
            .merge_partition(id, day(1), vec![row(&format!("app-{minutes}"), day(1), minutes)])
            .await
            .unwrap();
    }
}

fn store() -> (tempfile::TempDir, Arc<FsTableStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsTableStore::open(dir.path().join("tables")).unwrap());
    (dir, store)
}

#[tokio::test]
async fn compacts_then_expires_without_changing_rows() {
    let (_dir, store) = store();
    let silver = table("silver/screen_time/app_usage");
    fragmented(store.as_ref(), &silver).await;
    let before = store.snapshot(&silver, None).await.unwrap();

    let job = MaintenanceJob::new(store.clone(), MaintenanceSettings::default());
    let later = Utc::now() + Duration::hours(200);
    let done = job.maintain_table(&silver, 168, later).await.unwrap();

    assert_eq!(done.compact.files_before, 3);
    assert_eq!(done.compact.files_after, 1);
    // Three merges and the compaction; only the latest survives.
    assert_eq!(done.expire.versions_removed, 3);

    let after = store.snapshot(&silver, None).await.unwrap();
    assert_eq!(after.digest(), before.digest());
    assert_eq!(after.rows.len(), 3);
}

#[tokio::test]
async fn recent_versions_are_kept_inside_retention() {
    let (_dir, store) = store();
    let silver = table("silver/screen_time/app_usage");
    fragmented(store.as_ref(), &silver).await;

    let job = MaintenanceJob::new(store.clone(), MaintenanceSettings::default());
    let done = job.maintain_table(&silver, 168, Utc::now()).await.unwrap();
    assert_eq!(done.expire.versions_removed, 0);
}

#[tokio::test]
async fn run_once_targets_configured_layers_only() {
    let (_dir, store) = store();
    let bronze = table("bronze/screen_time/raw");
    let silver = table("silver/screen_time/app_usage");
    let gold = table("gold/screen_time/device_totals");
    for t in [&bronze, &silver, &gold] {
        fragmented(store.as_ref(), t).await;
    }

    let job = MaintenanceJob::new(store.clone(), MaintenanceSettings::default());
    let report = job.run_once(Utc::now()).await.unwrap();

    let maintained: Vec<_> = report.maintained.iter().map(|m| m.compact.table.clone()).collect();
    assert_eq!(maintained, vec![silver, gold]);
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn one_failing_table_does_not_stop_the_run() {
    let (_dir, store) = store();
    let silver = table("silver/screen_time/app_usage");
    let missing = table("gold/location/visits");
    fragmented(store.as_ref(), &silver).await;

    let job = MaintenanceJob::new(
        store.clone(),
        MaintenanceSettings {
            tables: Some(vec![missing.clone(), silver.clone()]),
            target_layers: vec![Layer::Silver, Layer::Gold],
            ..MaintenanceSettings::default()
        },
    );
    let report = job.run_once(Utc::now()).await.unwrap();

    assert_eq!(report.maintained.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, missing);
}

#[tokio::test]
async fn retention_outside_bounds_is_rejected() {
    let (_dir, store) = store();
    let silver = table("silver/screen_time/app_usage");
    fragmented(store.as_ref(), &silver).await;
    let job = MaintenanceJob::new(store.clone(), MaintenanceSettings::default());

    for hours in [0, 8761] {
        let err = job.maintain_table(&silver, hours, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StrataError::Config(_)), "{hours}: {err}");
    }
    // Nothing was touched.
    let snapshot = store.snapshot(&silver, None).await.unwrap();
    assert_eq!(snapshot.version, 3);
}
