//! Typed configuration loaded from TOML.
//!
//! Everything is validated at load: domains, cron expressions, retention
//! bounds, table schemas and the asset graph. Secrets are never stored in
//! the file; the config names the environment variable that holds them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use strata_state::{AssetId, Domain, Layer};

use crate::graph::{AssetGraph, AssetNode};
use crate::landing::DeviceInfo;
use crate::maintenance::{MaintenanceSettings, MAX_RETENTION_HOURS, MIN_RETENTION_HOURS};
use crate::reconciler::ReconcilerSettings;
use crate::schedule::CronSchedule;
use crate::schema::TableSchema;
use crate::scheduler::SchedulerSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("environment variable {var} is not set")]
    MissingSecret { var: String },
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrataConfig {
    pub state: StateConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub assets: Vec<AssetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    /// Holds `manifests/`, `tables/` and `landing/` unless overridden.
    pub root: PathBuf,
    /// SurrealDB endpoint for the run registry, e.g. `surrealkv://var/registry`.
    /// In-memory when absent.
    #[serde(default)]
    pub registry_url: Option<String>,
    #[serde(default)]
    pub landing_dir: Option<PathBuf>,
    /// Local clock offset, e.g. `+02:00`.
    #[serde(default = "default_offset")]
    pub utc_offset: String,
}

impl StateConfig {
    pub fn manifest_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn table_dir(&self) -> PathBuf {
        self.root.join("tables")
    }

    pub fn landing_dir(&self) -> PathBuf {
        self.landing_dir
            .clone()
            .unwrap_or_else(|| self.root.join("landing"))
    }
}

fn default_offset() -> String {
    "+00:00".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Http,
    #[default]
    Landing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_auth_token_env")]
    pub auth_token_env: String,
    #[serde(default = "default_sink_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub device: DeviceConfig,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            endpoint: None,
            auth_token_env: default_auth_token_env(),
            timeout_secs: default_sink_timeout(),
            device: DeviceConfig::default(),
        }
    }
}

impl SinkConfig {
    /// Bearer token from the configured environment variable.
    pub fn token(&self) -> Result<String, ConfigError> {
        std::env::var(&self.auth_token_env).map_err(|_| ConfigError::MissingSecret {
            var: self.auth_token_env.clone(),
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_auth_token_env() -> String {
    "AUTH_TOKEN".to_string()
}

const fn default_sink_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_device_id")]
    pub device_name: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            device_name: default_device_id(),
            device_type: default_device_type(),
        }
    }
}

impl From<&DeviceConfig> for DeviceInfo {
    fn from(d: &DeviceConfig) -> Self {
        DeviceInfo {
            device_id: d.device_id.clone(),
            device_name: d.device_name.clone(),
            device_type: d.device_type.clone(),
        }
    }
}

fn default_device_id() -> String {
    "strata".to_string()
}

fn default_device_type() -> String {
    "server".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
        }
    }
}

const fn default_reconcile_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainConfig {
    pub name: Domain,
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default)]
    pub lag_days: u32,
    #[serde(default = "default_key_attempts")]
    pub max_attempts: u32,
    /// Directory of `<domain>/<YYYY-MM-DD>.jsonl` exports.
    pub source_dir: PathBuf,
}

const fn default_window_days() -> u32 {
    30
}

const fn default_key_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_run_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_secs: u64,
    #[serde(default = "default_run_deadline")]
    pub run_deadline_secs: u64,
    #[serde(default = "default_run_attempts")]
    pub trigger_attempts: u32,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_catchup_hours")]
    pub catchup_hours: u32,
    #[serde(default = "default_run_attempts_usize")]
    pub max_catchup: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_run_attempts(),
            retry_base_secs: default_retry_base(),
            retry_max_secs: default_retry_max(),
            run_deadline_secs: default_run_deadline(),
            trigger_attempts: default_run_attempts(),
            tick_interval_secs: default_tick_interval(),
            catchup_hours: default_catchup_hours(),
            max_catchup: default_run_attempts_usize(),
        }
    }
}

const fn default_run_attempts() -> u32 {
    3
}

const fn default_run_attempts_usize() -> usize {
    3
}

const fn default_retry_base() -> u64 {
    30
}

const fn default_retry_max() -> u64 {
    900
}

const fn default_run_deadline() -> u64 {
    1800
}

const fn default_tick_interval() -> u64 {
    30
}

const fn default_catchup_hours() -> u32 {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceConfig {
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u32,
    #[serde(default = "default_target_layers")]
    pub target_layers: Vec<Layer>,
    #[serde(default)]
    pub tables: Option<Vec<AssetId>>,
    #[serde(default = "default_maintenance_interval")]
    pub interval_hours: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            retention_hours: default_retention_hours(),
            target_layers: default_target_layers(),
            tables: None,
            interval_hours: default_maintenance_interval(),
        }
    }
}

fn default_retention_hours() -> u32 {
    std::env::var("STRATA_RETENTION_HOURS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(168)
}

fn default_target_layers() -> Vec<Layer> {
    vec![Layer::Silver, Layer::Gold]
}

const fn default_maintenance_interval() -> u64 {
    24
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    #[default]
    Log,
    Webhook,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyConfig {
    #[serde(default)]
    pub kind: NotifyKind,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Built-in transforms selectable from config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum TransformConfig {
    LandingIngest,
    Project {
        columns: Vec<String>,
    },
    Aggregate {
        group_by: Vec<String>,
        #[serde(default)]
        sums: Vec<String>,
        #[serde(default)]
        count_as: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetConfig {
    pub id: AssetId,
    /// Root assets only.
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub partition_lag_days: u32,
    /// Derived assets only.
    #[serde(default)]
    pub upstream: Vec<AssetId>,
    pub transform: TransformConfig,
    pub schema: TableSchema,
}

impl AssetConfig {
    pub fn node(&self) -> Result<AssetNode, ConfigError> {
        match (&self.cron, self.upstream.is_empty()) {
            (Some(expr), true) => {
                let schedule = CronSchedule::parse(expr)
                    .map_err(|e| invalid(format!("asset {}: bad cron '{expr}': {e}", self.id)))?;
                Ok(AssetNode::cron(self.id.clone(), schedule, self.partition_lag_days))
            }
            (None, false) => Ok(AssetNode::eager(self.id.clone(), self.upstream.clone())),
            (Some(_), false) => Err(invalid(format!(
                "asset {} declares both cron and upstream",
                self.id
            ))),
            (None, true) => Err(invalid(format!(
                "asset {} needs either cron or upstream",
                self.id
            ))),
        }
    }
}

impl StrataConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: StrataConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.utc_offset()?;

        let mut seen = HashSet::new();
        for d in &self.domains {
            if !seen.insert(d.name.clone()) {
                return Err(invalid(format!("domain {} declared twice", d.name)));
            }
            if d.window_days == 0 {
                return Err(invalid(format!("domain {}: window_days must be at least 1", d.name)));
            }
            if d.max_attempts == 0 {
                return Err(invalid(format!("domain {}: max_attempts must be at least 1", d.name)));
            }
        }

        if self.sink.kind == SinkKind::Http && self.sink.endpoint.is_none() {
            return Err(invalid("sink.endpoint is required for the http sink"));
        }
        if self.sink.timeout_secs == 0 {
            return Err(invalid("sink.timeout_secs must be positive"));
        }
        if self.notify.kind == NotifyKind::Webhook && self.notify.webhook_url.is_none() {
            return Err(invalid("notify.webhook_url is required for the webhook notifier"));
        }

        let r = self.maintenance.retention_hours;
        if !(MIN_RETENTION_HOURS..=MAX_RETENTION_HOURS).contains(&r) {
            return Err(invalid(format!(
                "maintenance.retention_hours must be within {MIN_RETENTION_HOURS}..={MAX_RETENTION_HOURS}, got {r}"
            )));
        }
        if self.scheduler.max_attempts == 0 || self.scheduler.run_deadline_secs == 0 {
            return Err(invalid("scheduler.max_attempts and run_deadline_secs must be positive"));
        }

        for asset in &self.assets {
            asset
                .schema
                .check(&asset.id.to_string())
                .map_err(|e| invalid(e.to_string()))?;
        }
        self.asset_graph()?;
        Ok(())
    }

    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        self.state
            .utc_offset
            .parse::<FixedOffset>()
            .map_err(|e| invalid(format!("state.utc_offset '{}': {e}", self.state.utc_offset)))
    }

    pub fn asset_graph(&self) -> Result<AssetGraph, ConfigError> {
        let nodes = self
            .assets
            .iter()
            .map(AssetConfig::node)
            .collect::<Result<Vec<_>, _>>()?;
        AssetGraph::from_nodes(nodes).map_err(|e| invalid(e.to_string()))
    }

    pub fn domain(&self, name: &Domain) -> Option<&DomainConfig> {
        self.domains.iter().find(|d| &d.name == name)
    }

    pub fn reconciler_settings(&self, domain: &DomainConfig) -> ReconcilerSettings {
        ReconcilerSettings {
            window_days: domain.window_days,
            lag_days: domain.lag_days,
            max_attempts: domain.max_attempts,
            sink_timeout: self.sink.timeout(),
            utc_offset: self.utc_offset().unwrap_or_else(|_| Utc.fix()),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        let s = &self.scheduler;
        SchedulerSettings {
            max_attempts: s.max_attempts,
            retry_base: Duration::from_secs(s.retry_base_secs),
            retry_max: Duration::from_secs(s.retry_max_secs),
            run_deadline: Duration::from_secs(s.run_deadline_secs),
            trigger_attempts: s.trigger_attempts,
            trigger_retry_delay: Duration::from_secs(1),
            utc_offset: self.utc_offset().unwrap_or_else(|_| Utc.fix()),
            tick_interval: Duration::from_secs(s.tick_interval_secs.max(1)),
            catchup_window: chrono::Duration::hours(i64::from(s.catchup_hours)),
            max_catchup: s.max_catchup,
        }
    }

    pub fn maintenance_settings(&self) -> MaintenanceSettings {
        let m = &self.maintenance;
        MaintenanceSettings {
            retention_hours: m.retention_hours,
            target_layers: m.target_layers.clone(),
            tables: m.tables.clone(),
            interval: Duration::from_secs(m.interval_hours.max(1) * 3600),
        }
    }
}
