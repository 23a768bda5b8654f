//! Materialization through bronze, silver and gold against real stores.

use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::{json, Value};
use strata_core::graph::AssetNode;
use strata_core::materializer::{Aggregate, LandingIngest, Project};
use strata_core::{
    AssetDefinition, CronSchedule, FsLandingStore, LayerMaterializer, PartitionMaterializer,
    StrataError, TableSchema,
};
use strata_state::fakes::MemoryTableStore;
use strata_state::{AssetId, Domain, FsTableStore, PartitionKey, TableStore};

fn day(n: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, n).unwrap()
}

fn key(n: u32) -> PartitionKey {
    PartitionKey::new(Domain::new("screen_time").unwrap(), day(n))
}

fn bronze() -> AssetNode {
    AssetNode::cron(
        "bronze/screen_time/raw".parse().unwrap(),
        CronSchedule::parse("0 6 * * *").unwrap(),
        1,
    )
}

fn silver() -> AssetNode {
    AssetNode::eager("silver/screen_time/app_usage".parse().unwrap(), vec![bronze().id])
}

fn gold() -> AssetNode {
    AssetNode::eager("gold/screen_time/device_totals".parse().unwrap(), vec![silver().id])
}

fn schema(v: Value) -> TableSchema {
    serde_json::from_value(v).unwrap()
}

fn usage_columns(min: Option<f64>) -> Value {
    json!([
        {"name": "device_id", "type": "string"},
        {"name": "bundle_id", "type": "string"},
        {"name": "minutes", "type": "integer", "min": min},
        {"name": "updated_at", "type": "timestamp"}
    ])
}

fn materializer(tables: Arc<dyn TableStore>, landing: FsLandingStore) -> LayerMaterializer {
    let mut m = LayerMaterializer::new(tables);
    m.define(
        bronze().id,
        AssetDefinition {
            transform: Arc::new(LandingIngest::new(landing)),
            schema: schema(json!({
                "strict": false,
                "primary_key": ["device_id", "bundle_id"],
                "version_column": "updated_at",
                "columns": usage_columns(None),
            })),
        },
    )
    .unwrap();
    m.define(
        silver().id,
        AssetDefinition {
            transform: Arc::new(Project::new(vec![
                "device_id".into(),
                "bundle_id".into(),
                "minutes".into(),
                "updated_at".into(),
            ])),
            schema: schema(json!({
                "primary_key": ["device_id", "bundle_id"],
                "version_column": "updated_at",
                "columns": usage_columns(Some(0.0)),
            })),
        },
    )
    .unwrap();
    m.define(
        gold().id,
        AssetDefinition {
            transform: Arc::new(Aggregate::new(
                vec!["device_id".into()],
                vec!["minutes".into()],
                Some("apps".into()),
            )),
            schema: schema(json!({
                "primary_key": ["device_id"],
                "columns": [
                    {"name": "device_id", "type": "string"},
                    {"name": "minutes", "type": "integer"},
                    {"name": "apps", "type": "integer"}
                ]
            })),
        },
    )
    .unwrap();
    m
}

fn land(landing: &FsLandingStore, n: u32, data: Value) {
    landing
        .write(
            &key(n),
            "screen_time.json",
            &json!({
                "domain": "screen_time",
                "partition_date": day(n),
                "device_id": "mac-1",
                "device_name": "Work Mac",
                "device_type": "laptop",
                "updated_at": "2024-05-02T06:00:00Z",
                "data": data,
            }),
        )
        .unwrap();
}

fn day_one_usage(mail_minutes: i64) -> Value {
    json!([
        {"bundle_id": "com.apple.mail", "minutes": 30, "updated_at": "2024-05-01T10:00:00Z"},
        {"bundle_id": "com.apple.mail", "minutes": mail_minutes, "updated_at": "2024-05-01T12:00:00Z"},
        {"bundle_id": "com.tinyspeck.slack", "minutes": "20"}
    ])
}

async fn run_cascade(m: &LayerMaterializer, n: u32) -> Vec<bool> {
    let mut committed = Vec::new();
    for node in [bronze(), silver(), gold()] {
        committed.push(m.materialize(&node, &key(n)).await.unwrap().committed);
    }
    committed
}

async fn digest(tables: &dyn TableStore, asset: &AssetId) -> String {
    tables.snapshot(asset, None).await.unwrap().digest()
}

#[tokio::test]
async fn replaying_unchanged_inputs_leaves_tables_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let landing = FsLandingStore::open(dir.path().join("landing")).unwrap();
    let tables: Arc<dyn TableStore> = Arc::new(FsTableStore::open(dir.path().join("tables")).unwrap());
    let m = materializer(Arc::clone(&tables), landing.clone());
    land(&landing, 1, day_one_usage(45));

    assert_eq!(run_cascade(&m, 1).await, vec![true, true, true]);

    let gold_rows = tables.snapshot(&gold().id, Some(day(1))).await.unwrap().rows;
    assert_eq!(gold_rows.len(), 1);
    assert_eq!(gold_rows[0].values["minutes"], json!(65));
    assert_eq!(gold_rows[0].values["apps"], json!(2));

    let mut before = Vec::new();
    for node in [bronze(), silver(), gold()] {
        before.push(digest(tables.as_ref(), &node.id).await);
    }

    // Nothing changed upstream: no table gets a new version.
    assert_eq!(run_cascade(&m, 1).await, vec![false, false, false]);
    for (node, d) in [bronze(), silver(), gold()].iter().zip(&before) {
        assert_eq!(&digest(tables.as_ref(), &node.id).await, d);
    }
}

#[tokio::test]
async fn duplicate_keys_in_a_batch_keep_the_newest_version() {
    let dir = tempfile::tempdir().unwrap();
    let landing = FsLandingStore::open(dir.path().join("landing")).unwrap();
    let tables: Arc<dyn TableStore> = Arc::new(MemoryTableStore::new());
    let m = materializer(Arc::clone(&tables), landing.clone());
    land(&landing, 1, day_one_usage(45));

    m.materialize(&bronze(), &key(1)).await.unwrap();
    let rows = tables.snapshot(&bronze().id, Some(day(1))).await.unwrap().rows;
    let mail = rows.iter().find(|r| r.key == r#"["mac-1","com.apple.mail"]"#).unwrap();
    assert_eq!(mail.values["minutes"], json!(45));
    // Slack had no timestamp of its own and inherits the payload's.
    let slack = rows.iter().find(|r| r.key == r#"["mac-1","com.tinyspeck.slack"]"#).unwrap();
    assert_eq!(slack.values["minutes"], json!(20));
    assert_eq!(slack.values["updated_at"], json!("2024-05-02T06:00:00+00:00"));
}

#[tokio::test]
async fn corrected_source_updates_only_changed_rows() {
    let dir = tempfile::tempdir().unwrap();
    let landing = FsLandingStore::open(dir.path().join("landing")).unwrap();
    let tables: Arc<dyn TableStore> = Arc::new(MemoryTableStore::new());
    let m = materializer(Arc::clone(&tables), landing.clone());
    land(&landing, 1, day_one_usage(45));
    run_cascade(&m, 1).await;

    land(&landing, 1, day_one_usage(50));
    let report = m.materialize(&bronze(), &key(1)).await.unwrap();
    assert_eq!((report.inserted, report.updated, report.unchanged), (0, 1, 1));

    run_cascade(&m, 1).await;
    let gold_rows = tables.snapshot(&gold().id, None).await.unwrap().rows;
    assert_eq!(gold_rows.len(), 1);
    assert_eq!(gold_rows[0].values["minutes"], json!(70));
}

#[tokio::test]
async fn schema_violation_writes_nothing_and_spares_other_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let landing = FsLandingStore::open(dir.path().join("landing")).unwrap();
    let tables: Arc<dyn TableStore> = Arc::new(MemoryTableStore::new());
    let m = materializer(Arc::clone(&tables), landing.clone());

    land(&landing, 1, day_one_usage(45));
    land(
        &landing,
        2,
        json!([{"bundle_id": "com.apple.mail", "minutes": -5, "updated_at": "2024-05-02T10:00:00Z"}]),
    );
    run_cascade(&m, 1).await;
    let silver_before = tables.snapshot(&silver().id, None).await.unwrap();

    m.materialize(&bronze(), &key(2)).await.unwrap();
    let err = m.materialize(&silver(), &key(2)).await.unwrap_err();
    assert!(matches!(err, StrataError::Schema(_)), "{err}");

    let silver_after = tables.snapshot(&silver().id, None).await.unwrap();
    assert_eq!(silver_after.version, silver_before.version);
    assert_eq!(silver_after.digest(), silver_before.digest());
    assert!(silver_after.rows.iter().all(|r| r.partition == day(1)));
}

#[tokio::test]
async fn partition_without_landing_data_materializes_empty() {
    let dir = tempfile::tempdir().unwrap();
    let landing = FsLandingStore::open(dir.path().join("landing")).unwrap();
    let tables: Arc<dyn TableStore> = Arc::new(MemoryTableStore::new());
    let m = materializer(Arc::clone(&tables), landing);

    let report = m.materialize(&bronze(), &key(9)).await.unwrap();
    assert_eq!(report.inserted, 0);
    assert!(!report.committed);

    // Silver reads a never-written bronze partition as empty.
    let report = m.materialize(&silver(), &key(9)).await.unwrap();
    assert_eq!(report.inserted, 0);
}

#[tokio::test]
async fn undefined_asset_fails_as_a_transform_error() {
    let tables: Arc<dyn TableStore> = Arc::new(MemoryTableStore::new());
    let m = LayerMaterializer::new(tables);
    let err = m.materialize(&bronze(), &key(1)).await.unwrap_err();
    assert!(matches!(err, StrataError::Transform { .. }));
}
