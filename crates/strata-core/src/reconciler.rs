//! Backfill reconciliation.
//!
//! Each pass recomputes `missing = window \ committed` from the persisted
//! manifest and replays the missing partitions oldest first. The manifest is
//! committed after every key so a crash loses at most the in-flight key.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use futures::future::join_all;
use strata_state::{Domain, Manifest, ManifestStatus, ManifestStore, PartitionKey};
use tracing::{info, warn};

use crate::error::{Result, StrataError};
use crate::metrics::METRICS;
use crate::notify::{OperatorEvent, OperatorNotifier};
use crate::obs;
use crate::sink::IngestionSink;
use crate::source::RecordSource;
use crate::window::{local_today, RetentionWindow};

/// Partitions of `window` not committed in `manifest`, ascending.
pub fn diff(manifest: &Manifest, window: &RetentionWindow) -> BTreeSet<PartitionKey> {
    window
        .dates()
        .filter(|d| manifest.status(*d) != Some(ManifestStatus::Committed))
        .map(|d| PartitionKey::new(window.domain().clone(), d))
        .collect()
}

/// Per-domain reconciliation parameters.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Days the source retains.
    pub window_days: u32,
    /// Days between today and the newest window date.
    pub lag_days: u32,
    /// Attempts before a key is quarantined as `failed`.
    pub max_attempts: u32,
    pub sink_timeout: Duration,
    /// Offset that defines "today" for this domain.
    pub utc_offset: FixedOffset,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            window_days: 30,
            lag_days: 0,
            max_attempts: 5,
            sink_timeout: Duration::from_secs(30),
            utc_offset: Utc.fix(),
        }
    }
}

/// What happened to one key in a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Delivered and committed. Zero records means the source had nothing
    /// and the sink was not called.
    Committed { records: usize },
    /// Attempt failed; the key stays pending for the next pass.
    Retrying { attempt: u32, error: String },
    /// Attempt failed and the key is now quarantined.
    Failed { attempts: u32, error: String },
    /// Already quarantined; not attempted.
    Quarantined,
    /// Not reached because the pass was aborted.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub outcomes: Vec<(PartitionKey, KeyOutcome)>,
    /// Set when an authentication failure ended the pass.
    pub aborted: Option<String>,
}

impl ProcessReport {
    pub fn committed(&self) -> Vec<&PartitionKey> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, KeyOutcome::Committed { .. }))
            .map(|(k, _)| k)
            .collect()
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, KeyOutcome::Retrying { .. } | KeyOutcome::Failed { .. }))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub domain: Domain,
    pub floor: NaiveDate,
    pub ceiling: NaiveDate,
    pub missing: usize,
    /// Partitions that aged out of the window uncommitted.
    pub lost: Vec<PartitionKey>,
    pub process: ProcessReport,
}

/// Reconciler for a single domain. Sole writer of that domain's manifest.
pub struct DomainReconciler {
    domain: Domain,
    settings: ReconcilerSettings,
    manifests: Arc<dyn ManifestStore>,
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn IngestionSink>,
    notifier: Arc<dyn OperatorNotifier>,
}

impl DomainReconciler {
    pub fn new(
        domain: Domain,
        settings: ReconcilerSettings,
        manifests: Arc<dyn ManifestStore>,
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn IngestionSink>,
        notifier: Arc<dyn OperatorNotifier>,
    ) -> Self {
        Self {
            domain,
            settings,
            manifests,
            source,
            sink,
            notifier,
        }
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    pub fn window(&self, today: NaiveDate) -> RetentionWindow {
        RetentionWindow::ending_at(
            self.domain.clone(),
            today,
            self.settings.window_days,
            self.settings.lag_days,
        )
    }

    pub fn today(&self) -> NaiveDate {
        local_today(self.settings.utc_offset)
    }

    pub async fn manifest(&self) -> Result<Manifest> {
        Ok(self.manifests.load(&self.domain).await?)
    }

    /// Missing keys for `window` against the persisted manifest. Read-only.
    pub async fn diff(&self, window: &RetentionWindow) -> Result<BTreeSet<PartitionKey>> {
        let manifest = self.manifest().await?;
        Ok(diff(&manifest, window))
    }

    /// Replay `missing` oldest first, persisting the manifest after each key.
    ///
    /// A key failure never stops the pass; an authentication failure does,
    /// and leaves the remaining keys untouched.
    pub async fn process(&self, missing: &BTreeSet<PartitionKey>) -> Result<ProcessReport> {
        let mut manifest = self.manifest().await?;
        let mut report = ProcessReport::default();

        for key in missing {
            if key.domain != self.domain {
                warn!(partition = %key, domain = %self.domain, "ignoring key from another domain");
                continue;
            }
            if report.aborted.is_some() {
                report.outcomes.push((key.clone(), KeyOutcome::Skipped));
                continue;
            }
            match manifest.status(key.date) {
                Some(ManifestStatus::Committed) => continue,
                Some(ManifestStatus::Failed) => {
                    report.outcomes.push((key.clone(), KeyOutcome::Quarantined));
                    continue;
                }
                _ => {}
            }

            let outcome = match self.deliver(key).await {
                Ok(records) => {
                    manifest.mark_committed(key.date, Utc::now());
                    METRICS.inc_keys_committed();
                    obs::emit_key_committed(&key.to_string(), records);
                    KeyOutcome::Committed { records }
                }
                Err(e) if e.is_auth() => {
                    let reason = e.to_string();
                    warn!(partition = %key, reason = %reason, "authentication failed, aborting pass");
                    self.notifier
                        .notify(&OperatorEvent::AuthFailure {
                            domain: self.domain.to_string(),
                            error: reason.clone(),
                        })
                        .await;
                    report.aborted = Some(reason);
                    report.outcomes.push((key.clone(), KeyOutcome::Skipped));
                    continue;
                }
                Err(e) => {
                    let reason = e.to_string();
                    let status = manifest.record_failure(
                        key.date,
                        Utc::now(),
                        reason.clone(),
                        self.settings.max_attempts,
                    );
                    let attempts = manifest
                        .entries
                        .get(&key.date)
                        .map(|e| e.attempt_count)
                        .unwrap_or_default();
                    METRICS.inc_keys_failed();
                    obs::emit_key_failed(&key.to_string(), attempts, &status_str(status), &reason);
                    if status == ManifestStatus::Failed {
                        self.notifier
                            .notify(&OperatorEvent::ManifestKeyFailed {
                                partition: key.to_string(),
                                attempts,
                                error: reason.clone(),
                            })
                            .await;
                        KeyOutcome::Failed {
                            attempts,
                            error: reason,
                        }
                    } else {
                        KeyOutcome::Retrying {
                            attempt: attempts,
                            error: reason,
                        }
                    }
                }
            };

            manifest.version = self.manifests.commit(&manifest).await?;
            report.outcomes.push((key.clone(), outcome));
        }
        Ok(report)
    }

    /// Extract and push one partition; returns the delivered record count.
    async fn deliver(&self, key: &PartitionKey) -> Result<usize> {
        let records = self.source.extract(key).await?;
        if records.is_empty() {
            return Ok(0);
        }
        let receipt = tokio::time::timeout(self.settings.sink_timeout, self.sink.submit(key, &records))
            .await
            .map_err(|_| {
                StrataError::Transient(format!(
                    "sink call timed out after {}s",
                    self.settings.sink_timeout.as_secs()
                ))
            })??;
        Ok(receipt.accepted)
    }

    /// One full pass for `today`: detect lost partitions, diff, process.
    pub async fn run_pass(&self, today: NaiveDate) -> Result<PassReport> {
        let window = self.window(today);
        let mut manifest = self.manifest().await?;

        let lost = self.sweep_aged_out(&mut manifest, &window);
        if manifest.window_floor != Some(window.floor()) || !lost.is_empty() {
            manifest.window_floor = Some(window.floor());
            manifest.version = self.manifests.commit(&manifest).await?;
        }
        for (key, status) in &lost {
            obs::emit_partition_lost(&key.to_string(), status);
            self.notifier
                .notify(&OperatorEvent::PartitionLost {
                    partition: key.to_string(),
                    status: status.clone(),
                })
                .await;
        }

        let missing = diff(&manifest, &window);
        obs::emit_reconcile_started(
            self.domain.as_str(),
            &window.floor().to_string(),
            &window.ceiling().to_string(),
            missing.len(),
        );

        let process = self.process(&missing).await?;
        obs::emit_reconcile_finished(
            self.domain.as_str(),
            process.committed().len(),
            process.failures(),
            process.aborted.is_some(),
        );

        Ok(PassReport {
            domain: self.domain.clone(),
            floor: window.floor(),
            ceiling: window.ceiling(),
            missing: missing.len(),
            lost: lost.into_iter().map(|(k, _)| k).collect(),
            process,
        })
    }

    /// Pass for the domain's current local date.
    pub async fn run_pass_now(&self) -> Result<PassReport> {
        self.run_pass(self.today()).await
    }

    /// Collect uncommitted keys that fell below the window and drop their
    /// entries. Dates between the previous floor and the new one that were
    /// never committed count as lost too.
    fn sweep_aged_out(
        &self,
        manifest: &mut Manifest,
        window: &RetentionWindow,
    ) -> Vec<(PartitionKey, String)> {
        let floor = window.floor();
        let mut lost: BTreeSet<(NaiveDate, String)> = manifest
            .entries
            .iter()
            .filter(|(d, e)| **d < floor && e.status != ManifestStatus::Committed)
            .map(|(d, e)| (*d, status_str(e.status)))
            .collect();

        if let Some(prev) = manifest.window_floor {
            for date in prev.iter_days().take_while(|d| *d < floor) {
                if manifest.status(date).is_none() {
                    lost.insert((date, "never_attempted".to_string()));
                }
            }
        }

        // Nothing below the floor is ever replayed, committed or not.
        manifest.entries.retain(|d, _| *d >= floor);

        lost.into_iter()
            .map(|(d, s)| (PartitionKey::new(self.domain.clone(), d), s))
            .collect()
    }

    /// Forget every entry so the next pass replays the whole window.
    pub async fn full_reset(&self) -> Result<usize> {
        let mut manifest = self.manifest().await?;
        let cleared = manifest.entries.len();
        manifest.clear();
        self.manifests.commit(&manifest).await?;
        info!(domain = %self.domain, cleared, "manifest fully reset");
        Ok(cleared)
    }

    /// Return quarantined keys to pending with a fresh attempt budget.
    pub async fn reset_failed(&self) -> Result<Vec<NaiveDate>> {
        let mut manifest = self.manifest().await?;
        let reset = manifest.reset_failed();
        if !reset.is_empty() {
            self.manifests.commit(&manifest).await?;
            info!(domain = %self.domain, count = reset.len(), "failed keys reset");
        }
        Ok(reset)
    }
}

fn status_str(status: ManifestStatus) -> String {
    match status {
        ManifestStatus::Pending => "pending",
        ManifestStatus::Committed => "committed",
        ManifestStatus::Failed => "failed",
    }
    .to_string()
}

/// All configured domains. Domains reconcile concurrently; keys within a
/// domain stay sequential.
pub struct Reconciler {
    domains: Vec<DomainReconciler>,
}

impl Reconciler {
    pub fn new(domains: Vec<DomainReconciler>) -> Self {
        Self { domains }
    }

    pub fn domain(&self, domain: &Domain) -> Option<&DomainReconciler> {
        self.domains.iter().find(|d| d.domain() == domain)
    }

    pub fn domains(&self) -> impl Iterator<Item = &DomainReconciler> {
        self.domains.iter()
    }

    /// Run one pass per domain at its own local date.
    pub async fn run_all(&self) -> Vec<(Domain, Result<PassReport>)> {
        let passes = self.domains.iter().map(|d| async move {
            let result = d.run_pass_now().await;
            if let Err(e) = &result {
                warn!(domain = %d.domain(), error = %e, "reconcile pass failed");
            }
            (d.domain().clone(), result)
        });
        join_all(passes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn diff_is_window_minus_committed() {
        let domain = Domain::new("screen_time").unwrap();
        let mut manifest = Manifest::empty(domain.clone());
        manifest.mark_committed(d("2024-03-08"), Utc::now());
        manifest.record_failure(d("2024-03-09"), Utc::now(), "503", 5);
        // Committed outside the window is irrelevant.
        manifest.mark_committed(d("2024-01-01"), Utc::now());

        let window = RetentionWindow::ending_at(domain, d("2024-03-10"), 3, 0);
        let missing: Vec<_> = diff(&manifest, &window).into_iter().map(|k| k.date).collect();
        assert_eq!(missing, vec![d("2024-03-09"), d("2024-03-10")]);
    }
}
