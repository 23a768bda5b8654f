//! SurrealDB row types.
//!
//! Rows hold plain strings so the persisted shape stays stable; conversion
//! to `storage_traits` types happens at the registry boundary.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{
    AssetRun, Domain, PartitionKey, RunId, RunState, StorageResult, TriggerSource,
};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Row in the `asset_runs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRunRecord {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub run_id: String,
    /// `<layer>/<domain>/<name>`
    pub asset: String,
    pub domain: String,
    /// `YYYY-MM-DD`
    pub partition_date: String,
    /// "pending" | "running" | "succeeded" | "failed"
    pub state: String,
    pub attempt: u32,
    /// "cron" | "upstream" | "manual" | "retry"
    pub trigger: String,
    /// Creation order; breaks ties between equal timestamps.
    pub seq: u64,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

fn trigger_str(t: TriggerSource) -> &'static str {
    match t {
        TriggerSource::Cron => "cron",
        TriggerSource::Upstream => "upstream",
        TriggerSource::Manual => "manual",
        TriggerSource::Retry => "retry",
    }
}

impl AssetRunRecord {
    pub fn from_run(run: &AssetRun, seq: u64) -> Self {
        Self {
            id: None,
            run_id: run.run_id.0.clone(),
            asset: run.asset.to_string(),
            domain: run.partition.domain.to_string(),
            partition_date: run.partition.date.to_string(),
            state: run.state.as_str().to_string(),
            attempt: run.attempt,
            trigger: trigger_str(run.trigger).to_string(),
            seq,
            created_at: run.created_at,
            started_at: run.started_at,
            finished_at: run.finished_at,
            error: run.error.clone(),
        }
    }

    pub fn into_run(self) -> StorageResult<AssetRun> {
        let state = match self.state.as_str() {
            "pending" => RunState::Pending,
            "running" => RunState::Running,
            "succeeded" => RunState::Succeeded,
            "failed" => RunState::Failed,
            other => return Err(StorageError::Backend(format!("unknown run state: {other}"))),
        };
        let trigger = match self.trigger.as_str() {
            "cron" => TriggerSource::Cron,
            "upstream" => TriggerSource::Upstream,
            "manual" => TriggerSource::Manual,
            "retry" => TriggerSource::Retry,
            other => return Err(StorageError::Backend(format!("unknown trigger: {other}"))),
        };
        let date = self
            .partition_date
            .parse::<NaiveDate>()
            .map_err(|e| StorageError::Backend(format!("bad partition date: {e}")))?;
        Ok(AssetRun {
            run_id: RunId(self.run_id),
            asset: self.asset.parse()?,
            partition: PartitionKey::new(Domain::new(self.domain)?, date),
            state,
            attempt: self.attempt,
            trigger,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_run() {
        let asset = "gold/screen_time/daily_summary".parse().unwrap();
        let key = PartitionKey::new(
            Domain::new("screen_time").unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
        );
        let run = AssetRun::new_pending(asset, key, TriggerSource::Upstream, 2);
        let record = AssetRunRecord::from_run(&run, 7);
        assert_eq!(record.partition_date, "2024-02-29");
        assert_eq!(record.trigger, "upstream");
        assert_eq!(record.into_run().unwrap(), run);
    }
}
