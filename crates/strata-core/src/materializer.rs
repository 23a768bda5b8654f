//! Layer materialization: transform one partition, validate, dedupe, upsert.
//!
//! Re-running an asset for a partition against unchanged inputs yields the
//! same row set: rows are keyed by `(natural key, partition)`, duplicates in
//! a batch collapse to one row and the store writes no version when nothing
//! changed.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{Map, Value};
use strata_state::{AssetId, MergeReport, PartitionKey, StorageError, TableRow, TableStore};
use tracing::debug;

use crate::error::{Result, StrataError};
use crate::graph::AssetNode;
use crate::landing::FsLandingStore;
use crate::schema::{SchemaError, TableSchema};

/// Inputs visible to a transform.
pub struct TransformContext<'a> {
    pub asset: &'a AssetId,
    pub partition: &'a PartitionKey,
    pub upstream: &'a [AssetId],
    pub tables: &'a dyn TableStore,
}

impl TransformContext<'_> {
    /// Rows of `table` for this partition's date. A table that was never
    /// written reads as empty.
    pub async fn upstream_rows(&self, table: &AssetId) -> Result<Vec<TableRow>> {
        match self.tables.snapshot(table, Some(self.partition.date)).await {
            Ok(s) => Ok(s.rows),
            Err(StorageError::TableNotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn fail(&self, reason: impl Into<String>) -> StrataError {
        StrataError::Transform {
            asset: self.asset.to_string(),
            reason: reason.into(),
        }
    }
}

/// Produces the rows of one asset partition.
#[async_trait]
pub trait LayerTransform: Send + Sync {
    async fn transform(&self, ctx: &TransformContext<'_>) -> Result<Vec<Map<String, Value>>>;
}

/// Bronze: flatten landing payloads of the partition into rows.
///
/// Payload `data` arrays become one row per element, with the payload's
/// device fields and `updated_at` copied in when the element lacks them.
/// A bare JSON array or object document is taken as is.
pub struct LandingIngest {
    landing: FsLandingStore,
}

impl LandingIngest {
    pub fn new(landing: FsLandingStore) -> Self {
        Self { landing }
    }
}

const PAYLOAD_FIELDS: [&str; 4] = ["device_id", "device_name", "device_type", "updated_at"];

#[async_trait]
impl LayerTransform for LandingIngest {
    async fn transform(&self, ctx: &TransformContext<'_>) -> Result<Vec<Map<String, Value>>> {
        let landing = self.landing.clone();
        let key = ctx.partition.clone();
        let docs = tokio::task::spawn_blocking(move || landing.read_partition(&key))
            .await
            .map_err(|e| ctx.fail(format!("landing reader task failed: {e}")))??;

        let mut rows = Vec::new();
        for doc in docs {
            match doc.value {
                Value::Object(mut obj) => match obj.remove("data") {
                    Some(Value::Array(items)) => {
                        for item in items {
                            if let Value::Object(mut row) = item {
                                for field in PAYLOAD_FIELDS {
                                    if let Some(v) = obj.get(field) {
                                        row.entry(field).or_insert_with(|| v.clone());
                                    }
                                }
                                rows.push(row);
                            }
                        }
                    }
                    Some(other) => {
                        obj.insert("data".to_string(), other);
                        rows.push(obj);
                    }
                    None => rows.push(obj),
                },
                Value::Array(items) => {
                    rows.extend(items.into_iter().filter_map(|v| match v {
                        Value::Object(o) => Some(o),
                        _ => None,
                    }))
                }
                _ => {}
            }
        }
        Ok(rows)
    }
}

/// Derived: select columns from every upstream table's rows for the date.
pub struct Project {
    columns: Vec<String>,
}

impl Project {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }
}

#[async_trait]
impl LayerTransform for Project {
    async fn transform(&self, ctx: &TransformContext<'_>) -> Result<Vec<Map<String, Value>>> {
        let mut out = Vec::new();
        for up in ctx.upstream {
            for row in ctx.upstream_rows(up).await? {
                let projected = self
                    .columns
                    .iter()
                    .map(|c| (c.clone(), row.values.get(c).cloned().unwrap_or(Value::Null)))
                    .collect();
                out.push(projected);
            }
        }
        Ok(out)
    }
}

/// Derived: group upstream rows and sum numeric columns.
pub struct Aggregate {
    group_by: Vec<String>,
    sums: Vec<String>,
    count_as: Option<String>,
}

impl Aggregate {
    pub fn new(group_by: Vec<String>, sums: Vec<String>, count_as: Option<String>) -> Self {
        Self {
            group_by,
            sums,
            count_as,
        }
    }
}

#[async_trait]
impl LayerTransform for Aggregate {
    async fn transform(&self, ctx: &TransformContext<'_>) -> Result<Vec<Map<String, Value>>> {
        // Group key is the JSON of the group-by values; BTreeMap keeps output stable.
        let mut groups: BTreeMap<String, (Map<String, Value>, Vec<Total>, u64)> = BTreeMap::new();
        for up in ctx.upstream {
            for row in ctx.upstream_rows(up).await? {
                let key_values: Vec<Value> = self
                    .group_by
                    .iter()
                    .map(|c| row.values.get(c).cloned().unwrap_or(Value::Null))
                    .collect();
                let group_key = serde_json::to_string(&key_values)?;
                let entry = groups.entry(group_key).or_insert_with(|| {
                    let head = self.group_by.iter().cloned().zip(key_values).collect();
                    (head, vec![Total::Int(0); self.sums.len()], 0)
                });
                for (i, col) in self.sums.iter().enumerate() {
                    if let Some(v) = row.values.get(col) {
                        entry.1[i] = entry.1[i].add(v);
                    }
                }
                entry.2 += 1;
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for (_, (mut row, sums, count)) in groups {
            for (col, total) in self.sums.iter().zip(sums) {
                let value = match total {
                    Total::Int(i) => Value::from(i),
                    Total::Float(f) => Value::from(f),
                    Total::Overflow => {
                        return Err(SchemaError {
                            table: ctx.asset.to_string(),
                            violations: vec![format!("column '{col}' sum overflows a 64-bit integer")],
                        }
                        .into())
                    }
                };
                row.insert(col.clone(), value);
            }
            if let Some(name) = &self.count_as {
                row.insert(name.clone(), Value::from(count));
            }
            out.push(row);
        }
        Ok(out)
    }
}

/// Running sum: exact while every input is an integer.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Total {
    Int(i64),
    Float(f64),
    Overflow,
}

impl Total {
    fn add(self, v: &Value) -> Self {
        match (self, v.as_i64()) {
            (Total::Overflow, _) => Total::Overflow,
            (Total::Int(t), Some(i)) => t.checked_add(i).map_or(Total::Overflow, Total::Int),
            (Total::Int(t), None) => Total::Float(t as f64 + v.as_f64().unwrap_or(0.0)),
            (Total::Float(t), _) => Total::Float(t + v.as_f64().unwrap_or(0.0)),
        }
    }
}

/// How one asset is materialized.
#[derive(Clone)]
pub struct AssetDefinition {
    pub transform: Arc<dyn LayerTransform>,
    pub schema: TableSchema,
}

/// Executes one `(asset, partition)`.
///
/// Returns only after the merge has committed (or was a no-op).
#[async_trait]
pub trait PartitionMaterializer: Send + Sync {
    async fn materialize(&self, node: &AssetNode, partition: &PartitionKey) -> Result<MergeReport>;
}

pub struct LayerMaterializer {
    tables: Arc<dyn TableStore>,
    definitions: HashMap<AssetId, AssetDefinition>,
}

impl LayerMaterializer {
    pub fn new(tables: Arc<dyn TableStore>) -> Self {
        Self {
            tables,
            definitions: HashMap::new(),
        }
    }

    /// Register an asset. The schema is checked here so a bad declaration
    /// fails at startup rather than on the first run.
    pub fn define(&mut self, asset: AssetId, definition: AssetDefinition) -> Result<()> {
        definition.schema.check(&asset.to_string())?;
        self.definitions.insert(asset, definition);
        Ok(())
    }

    pub fn tables(&self) -> &Arc<dyn TableStore> {
        &self.tables
    }
}

/// Collapse rows sharing a natural key, keeping the greatest version value.
/// Ties keep the later row.
pub fn dedupe(schema: &TableSchema, rows: Vec<BTreeMap<String, Value>>) -> BTreeMap<String, BTreeMap<String, Value>> {
    let mut out: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
    for row in rows {
        let key = schema.natural_key(&row);
        let replace = match (out.get(&key), &schema.version_column) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(existing), Some(col)) => {
                compare_values(row.get(col), existing.get(col)) != Ordering::Less
            }
        };
        if replace {
            out.insert(key, row);
        }
    }
    out
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    if let (Some(Value::String(x)), Some(Value::String(y))) = (a, b) {
        if let (Ok(x), Ok(y)) = (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
            return x.cmp(&y);
        }
    }
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Null) | None, Some(Value::Null) | None) => Ordering::Equal,
        (Some(Value::Null) | None, _) => Ordering::Less,
        (_, Some(Value::Null) | None) => Ordering::Greater,
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[async_trait]
impl PartitionMaterializer for LayerMaterializer {
    async fn materialize(&self, node: &AssetNode, partition: &PartitionKey) -> Result<MergeReport> {
        let definition = self
            .definitions
            .get(&node.id)
            .ok_or_else(|| StrataError::Transform {
                asset: node.id.to_string(),
                reason: "no transform registered".to_string(),
            })?;

        let ctx = TransformContext {
            asset: &node.id,
            partition,
            upstream: &node.upstream,
            tables: self.tables.as_ref(),
        };
        let raw = definition.transform.transform(&ctx).await?;
        let produced = raw.len();

        let valid = definition.schema.validate(&node.id.to_string(), raw)?;
        let rows: Vec<TableRow> = dedupe(&definition.schema, valid)
            .into_iter()
            .map(|(key, values)| TableRow {
                key,
                partition: partition.date,
                values,
            })
            .collect();
        debug!(asset = %node.id, %partition, produced, unique = rows.len(), "partition transformed");

        Ok(self
            .tables
            .merge_partition(&node.id, partition.date, rows)
            .await?)
    }
}
