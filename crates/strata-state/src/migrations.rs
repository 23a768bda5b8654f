//! SurrealDB schema migrations and initialization

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Strata tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Strata SurrealDB schema");
    init_asset_runs_table(db).await?;
    info!("Strata schema initialization complete");
    Ok(())
}

/// Initialize `asset_runs` table with constraints and indexes
///
/// Schema:
/// ```text
/// TABLE asset_runs {
///   run_id:          STRING (unique)
///   asset:           STRING (indexed with partition_date)
///   domain:          STRING
///   partition_date:  STRING (YYYY-MM-DD)
///   state:           STRING (pending | running | succeeded | failed)
///   attempt:         INT
///   trigger:         STRING
///   seq:             INT (creation order)
///   created_at:      DATETIME
///   started_at:      DATETIME?
///   finished_at:     DATETIME?
///   error:           STRING?
/// }
/// ```
///
/// The at-most-one-active-run rule is enforced by the registry under its
/// write lock, not by an index.
async fn init_asset_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing asset_runs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS asset_runs SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE asset_runs COLUMNS run_id UNIQUE;

        -- Latest-run lookups per (asset, partition)
        DEFINE INDEX IF NOT EXISTS idx_asset_partition ON TABLE asset_runs COLUMNS asset, partition_date;

        DEFINE INDEX IF NOT EXISTS idx_seq ON TABLE asset_runs COLUMNS seq;
    "#;

    db.query(sql).await?.check()?;
    info!("asset_runs table initialized");
    Ok(())
}
