//! Row schemas checked before any merge.
//!
//! Validation is all-or-nothing per batch: one violation fails the run and
//! nothing is written. Values are lightly coerced (numeric strings to
//! numbers, scalars to strings) so upstream formatting drift does not fail
//! a partition on its own.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// A batch that did not match its table schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("schema validation failed for {table}: {}", violations.join("; "))]
pub struct SchemaError {
    pub table: String,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    Timestamp,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub nullable: bool,
    /// Inclusive lower bound for numeric columns.
    #[serde(default)]
    pub min: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSpec>,
    /// Reject columns that are not declared.
    #[serde(default = "default_strict")]
    pub strict: bool,
    /// Columns forming the natural key.
    pub primary_key: Vec<String>,
    /// When several rows of one batch share a natural key, the one with the
    /// greatest value here wins.
    #[serde(default)]
    pub version_column: Option<String>,
}

fn default_strict() -> bool {
    true
}

impl TableSchema {
    /// Check the schema itself: key columns exist and are not nullable.
    pub fn check(&self, table: &str) -> Result<(), SchemaError> {
        let mut violations = Vec::new();
        if self.primary_key.is_empty() {
            violations.push("primary_key is empty".to_string());
        }
        for key in &self.primary_key {
            match self.column(key) {
                None => violations.push(format!("primary key column '{key}' is not declared")),
                Some(c) if c.nullable => {
                    violations.push(format!("primary key column '{key}' is nullable"))
                }
                _ => {}
            }
        }
        if let Some(v) = &self.version_column {
            if self.column(v).is_none() {
                violations.push(format!("version column '{v}' is not declared"));
            }
        }
        finish(table, violations)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Validate and coerce a batch.
    pub fn validate(
        &self,
        table: &str,
        rows: Vec<Map<String, Value>>,
    ) -> Result<Vec<BTreeMap<String, Value>>, SchemaError> {
        let mut violations = Vec::new();
        let mut out = Vec::with_capacity(rows.len());

        for (idx, mut row) in rows.into_iter().enumerate() {
            let mut clean = BTreeMap::new();
            for col in &self.columns {
                let value = row.remove(&col.name).unwrap_or(Value::Null);
                match coerce(col, value) {
                    Ok(v) => {
                        clean.insert(col.name.clone(), v);
                    }
                    Err(reason) => violations.push(format!("row {idx}: column '{}' {reason}", col.name)),
                }
            }
            if self.strict {
                for extra in row.keys() {
                    violations.push(format!("row {idx}: undeclared column '{extra}'"));
                }
            }
            out.push(clean);
        }

        finish(table, violations)?;
        Ok(out)
    }

    /// Primary-key values as a JSON array, so values containing any
    /// separator still map to distinct keys.
    pub fn natural_key(&self, row: &BTreeMap<String, Value>) -> String {
        Value::Array(
            self.primary_key
                .iter()
                .map(|k| row.get(k).cloned().unwrap_or(Value::Null))
                .collect(),
        )
        .to_string()
    }
}

fn finish(table: &str, violations: Vec<String>) -> Result<(), SchemaError> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(SchemaError {
            table: table.to_string(),
            violations,
        })
    }
}

fn coerce(col: &ColumnSpec, value: Value) -> Result<Value, String> {
    if value.is_null() {
        return if col.nullable {
            Ok(Value::Null)
        } else {
            Err("is null".to_string())
        };
    }

    let coerced = match (col.column_type, value) {
        (ColumnType::Json, v) => v,
        (ColumnType::String, Value::String(s)) => Value::String(s),
        (ColumnType::String, v @ (Value::Number(_) | Value::Bool(_))) => Value::String(v.to_string()),
        (ColumnType::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Value::Number(n),
        (ColumnType::Integer, Value::Number(n)) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Value::from(f as i64),
            _ => return Err(format!("expected integer, got {n}")),
        },
        (ColumnType::Integer, Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(i) => Value::from(i),
            Err(_) => return Err(format!("expected integer, got '{s}'")),
        },
        (ColumnType::Float, Value::Number(n)) => Value::Number(n),
        (ColumnType::Float, Value::String(s)) => match s.trim().parse::<f64>().ok().and_then(Number::from_f64) {
            Some(n) => Value::Number(n),
            None => return Err(format!("expected float, got '{s}'")),
        },
        (ColumnType::Boolean, Value::Bool(b)) => Value::Bool(b),
        (ColumnType::Date, Value::String(s)) => match NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
            Ok(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            Err(_) => return Err(format!("expected YYYY-MM-DD date, got '{s}'")),
        },
        (ColumnType::Timestamp, Value::String(s)) => match DateTime::parse_from_rfc3339(&s) {
            Ok(t) => Value::String(t.with_timezone(&Utc).to_rfc3339()),
            Err(_) => return Err(format!("expected RFC 3339 timestamp, got '{s}'")),
        },
        (ty, v) => return Err(format!("expected {ty:?}, got {v}")),
    };

    if let (Some(min), Some(n)) = (col.min, coerced.as_f64()) {
        if n < min {
            return Err(format!("value {n} is below minimum {min}"));
        }
    }
    Ok(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn app_usage() -> TableSchema {
        toml::from_str(
            r#"
            primary_key = ["device_id", "usage_date", "bundle_id"]
            version_column = "updated_at"

            [[columns]]
            name = "device_id"
            type = "string"

            [[columns]]
            name = "usage_date"
            type = "date"

            [[columns]]
            name = "bundle_id"
            type = "string"

            [[columns]]
            name = "app_name"
            type = "string"
            nullable = true

            [[columns]]
            name = "total_usage_seconds"
            type = "integer"
            min = 0

            [[columns]]
            name = "updated_at"
            type = "timestamp"
            "#,
        )
        .unwrap()
    }

    fn row(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn valid_rows_are_coerced() {
        let schema = app_usage();
        schema.check("silver/screen_time/app_usage").unwrap();
        let rows = schema
            .validate(
                "t",
                vec![row(json!({
                    "device_id": "mac-1",
                    "usage_date": "2024-05-01",
                    "bundle_id": "com.apple.mail",
                    "total_usage_seconds": "120",
                    "updated_at": "2024-05-02T06:00:00Z"
                }))],
            )
            .unwrap();
        assert_eq!(rows[0]["total_usage_seconds"], json!(120));
        assert_eq!(rows[0]["app_name"], Value::Null);
        assert_eq!(
            schema.natural_key(&rows[0]),
            r#"["mac-1","2024-05-01","com.apple.mail"]"#
        );
    }

    #[test]
    fn keys_with_separator_characters_stay_distinct() {
        let schema = app_usage();
        let key = |device: &str, bundle: &str| {
            let row: BTreeMap<String, Value> = [
                ("device_id".to_string(), json!(device)),
                ("usage_date".to_string(), json!("2024-05-01")),
                ("bundle_id".to_string(), json!(bundle)),
            ]
            .into_iter()
            .collect();
            schema.natural_key(&row)
        };
        assert_ne!(key("mac|1", "mail"), key("mac", "1|mail"));
        assert_ne!(key("mac\",\"1", "mail"), key("mac", "1\",\"mail"));
    }

    #[test]
    fn timestamps_are_normalized_to_utc() {
        let rows = app_usage()
            .validate(
                "t",
                vec![row(json!({
                    "device_id": "mac-1",
                    "usage_date": "2024-05-01",
                    "bundle_id": "com.apple.mail",
                    "total_usage_seconds": 60,
                    "updated_at": "2024-05-02T08:00:00+02:00"
                }))],
            )
            .unwrap();
        assert_eq!(rows[0]["updated_at"], json!("2024-05-02T06:00:00+00:00"));
    }

    #[test]
    fn violations_are_collected() {
        let err = app_usage()
            .validate(
                "silver/screen_time/app_usage",
                vec![row(json!({
                    "device_id": "mac-1",
                    "usage_date": "May 1st",
                    "bundle_id": "com.apple.mail",
                    "total_usage_seconds": -5,
                    "updated_at": "2024-05-02T06:00:00Z",
                    "surprise": true
                }))],
            )
            .unwrap_err();
        assert_eq!(err.violations.len(), 3);
        assert!(err.to_string().contains("silver/screen_time/app_usage"));
    }

    #[test]
    fn nullable_primary_key_is_rejected() {
        let mut schema = app_usage();
        schema.columns[0].nullable = true;
        assert!(schema.check("t").is_err());
    }
}
