//! Partition-aware scheduling cascade.
//!
//! Cron ticks create runs for root assets. When a run succeeds, a completion
//! event is dispatched to the asset's declared dependents, which are
//! triggered for the same partition date. The registry is the only authority
//! on run state: it rejects a second active run per `(asset, partition)` and
//! refuses to start a derived run until every upstream run for the date has
//! succeeded.
//!
//! A run is marked succeeded only after its merge has returned, so dependents
//! never observe an uncommitted upstream.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Days, FixedOffset, NaiveDate, Offset, Utc};
use strata_state::{
    AssetId, AssetRun, CreateOutcome, PartitionKey, RunId, RunRegistry, RunState, StartOutcome,
    StorageError, TriggerSource,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{Result, StrataError};
use crate::graph::{AssetGraph, AssetNode, TriggerKind};
use crate::materializer::PartitionMaterializer;
use crate::metrics::METRICS;
use crate::notify::{OperatorEvent, OperatorNotifier};
use crate::obs;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Attempts per `(asset, partition)` before operator attention.
    pub max_attempts: u32,
    /// Backoff before retry `n` is `retry_base * 2^(n-1)`, capped.
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Runs exceeding this are cancelled and failed.
    pub run_deadline: Duration,
    /// Attempts to enqueue a dependent before reporting a trigger failure.
    pub trigger_attempts: u32,
    pub trigger_retry_delay: Duration,
    /// Clock used for cron evaluation and tick dates.
    pub utc_offset: FixedOffset,
    pub tick_interval: Duration,
    /// How far back the first tick after startup looks for missed ticks.
    pub catchup_window: chrono::Duration,
    pub max_catchup: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base: Duration::from_secs(30),
            retry_max: Duration::from_secs(15 * 60),
            run_deadline: Duration::from_secs(30 * 60),
            trigger_attempts: 3,
            trigger_retry_delay: Duration::from_secs(1),
            utc_offset: Utc.fix(),
            tick_interval: Duration::from_secs(30),
            catchup_window: chrono::Duration::hours(24),
            max_catchup: 3,
        }
    }
}

impl SchedulerSettings {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.retry_base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.retry_max)
    }
}

/// Result of a trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// A new run was created and handed to a worker.
    Started(AssetRun),
    /// A non-terminal run already exists; nothing was executed.
    AlreadyActive(AssetRun),
    /// An upstream has not succeeded for the date; no run was created. The
    /// upstream's completion will trigger this asset.
    Waiting { upstream: AssetId },
}

impl TriggerOutcome {
    pub fn run(&self) -> Option<&AssetRun> {
        match self {
            TriggerOutcome::Started(r) | TriggerOutcome::AlreadyActive(r) => Some(r),
            TriggerOutcome::Waiting { .. } => None,
        }
    }
}

/// One cron tick's trigger.
#[derive(Debug)]
pub struct TickTrigger {
    pub asset: AssetId,
    pub scheduled_for: DateTime<FixedOffset>,
    pub partition: PartitionKey,
    pub outcome: Result<TriggerOutcome>,
}

enum RunOutcome {
    Succeeded,
    Failed { error: String, retry: bool },
}

struct RunEvent {
    run: AssetRun,
    outcome: RunOutcome,
    _in_flight: InFlight,
}

/// Counts work that [`Scheduler::drain`] must wait for: run tasks, queued
/// events, pending retries and dependent triggers.
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn new(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

struct Inner {
    graph: Arc<AssetGraph>,
    registry: Arc<dyn RunRegistry>,
    materializer: Arc<dyn PartitionMaterializer>,
    notifier: Arc<dyn OperatorNotifier>,
    settings: SchedulerSettings,
    events: mpsc::UnboundedSender<RunEvent>,
    in_flight: Arc<watch::Sender<usize>>,
    running: Mutex<HashMap<RunId, AbortHandle>>,
    last_ticks: Mutex<HashMap<AssetId, DateTime<Utc>>>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Build a scheduler and start its event dispatcher.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(
        graph: Arc<AssetGraph>,
        registry: Arc<dyn RunRegistry>,
        materializer: Arc<dyn PartitionMaterializer>,
        notifier: Arc<dyn OperatorNotifier>,
        settings: SchedulerSettings,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let (in_flight, _) = watch::channel(0usize);
        let inner = Arc::new(Inner {
            graph,
            registry,
            materializer,
            notifier,
            settings,
            events,
            in_flight: Arc::new(in_flight),
            running: Mutex::new(HashMap::new()),
            last_ticks: Mutex::new(HashMap::new()),
        });
        tokio::spawn(dispatch(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    pub fn graph(&self) -> &AssetGraph {
        &self.inner.graph
    }

    pub fn registry(&self) -> &Arc<dyn RunRegistry> {
        &self.inner.registry
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// Manually trigger `asset` for `partition`.
    ///
    /// The partition must belong to the asset's domain.
    pub async fn trigger(&self, asset: &AssetId, partition: &PartitionKey) -> Result<TriggerOutcome> {
        if partition.domain != asset.domain {
            return Err(StrataError::TriggerFailure {
                asset: asset.to_string(),
                partition: partition.to_string(),
                reason: format!("asset belongs to domain {}", asset.domain),
            });
        }
        self.inner
            .trigger(asset, partition, TriggerSource::Manual, 1)
            .await
    }

    /// Fire every root whose cron schedule has ticks due in `(last, now]`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<TickTrigger> {
        let settings = &self.inner.settings;
        let mut fired = Vec::new();
        for node in self.inner.graph.roots() {
            let TriggerKind::Cron {
                schedule,
                partition_lag_days,
            } = &node.trigger
            else {
                continue;
            };

            let ticks = {
                let mut last = self.inner.last_ticks.lock().await;
                let previous = last.insert(node.id.clone(), now);
                schedule.due_ticks(
                    previous,
                    now,
                    settings.utc_offset,
                    settings.catchup_window,
                    settings.max_catchup,
                )
            };

            for scheduled_for in ticks {
                let date = tick_partition_date(scheduled_for.date_naive(), *partition_lag_days);
                let partition = PartitionKey::new(node.id.domain.clone(), date);
                debug!(asset = %node.id, %partition, %scheduled_for, "cron tick due");
                let outcome = self
                    .inner
                    .trigger(&node.id, &partition, TriggerSource::Cron, 1)
                    .await;
                if let Err(e) = &outcome {
                    warn!(asset = %node.id, %partition, error = %e, "cron trigger failed");
                }
                fired.push(TickTrigger {
                    asset: node.id.clone(),
                    scheduled_for,
                    partition,
                    outcome,
                });
            }
        }
        fired
    }

    /// Record an in-flight run as failed and abort its task. Terminal runs
    /// are returned unchanged.
    ///
    /// The registry's terminal transition decides a race with the run's own
    /// completion: the task is only aborted once the cancel has been recorded,
    /// so a run that already succeeded still cascades.
    pub async fn cancel(&self, run_id: &RunId) -> Result<AssetRun> {
        let run = match self
            .inner
            .registry
            .finish(run_id, RunState::Failed, Some("cancelled".to_string()))
            .await
        {
            Ok(run) => run,
            Err(StorageError::InvalidRunState { .. }) => return Ok(self.inner.registry.get(run_id).await?),
            Err(e) => return Err(e.into()),
        };
        if let Some(handle) = self.inner.running.lock().await.remove(run_id) {
            handle.abort();
        }
        warn!(run_id = %run_id, asset = %run.asset, partition = %run.partition, "run cancelled");
        Ok(run)
    }

    /// Wait until no run, event, retry or dependent trigger is in flight.
    pub async fn drain(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        // Sender lives in `inner`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Tick on `tick_interval` until `shutdown` resolves, then drain.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(self.inner.settings.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!(
            roots = self.inner.graph.roots().count(),
            assets = self.inner.graph.len(),
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        info!("scheduler stopping, draining in-flight runs");
        self.drain().await;
    }
}

fn tick_partition_date(tick_date: NaiveDate, lag_days: u32) -> NaiveDate {
    tick_date
        .checked_sub_days(Days::new(u64::from(lag_days)))
        .unwrap_or(tick_date)
}

async fn dispatch(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<RunEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle(event).await;
    }
}

impl Inner {
    async fn trigger(
        self: &Arc<Self>,
        asset: &AssetId,
        partition: &PartitionKey,
        source: TriggerSource,
        attempt: u32,
    ) -> Result<TriggerOutcome> {
        let node = self.graph.get(asset)?.clone();

        for up in &node.upstream {
            let key = PartitionKey::new(up.domain.clone(), partition.date);
            let succeeded = matches!(
                self.registry.latest(up, &key).await?,
                Some(AssetRun {
                    state: RunState::Succeeded,
                    ..
                })
            );
            if !succeeded {
                debug!(asset = %asset, %partition, upstream = %up, "waiting for upstream");
                return Ok(TriggerOutcome::Waiting {
                    upstream: up.clone(),
                });
            }
        }

        let run = match self.registry.create(asset, partition, source, attempt).await? {
            CreateOutcome::Created(run) => run,
            CreateOutcome::AlreadyActive(active) => {
                obs::emit_trigger_rejected(&asset.to_string(), &partition.to_string(), &active.run_id.0);
                return Ok(TriggerOutcome::AlreadyActive(active));
            }
        };

        let guard = InFlight::new(&self.in_flight);
        let span = obs::run_span(&run.run_id.0, &asset.to_string(), &partition.to_string());
        let mut running = self.running.lock().await;
        let handle = tokio::spawn(
            Arc::clone(self)
                .execute(node, run.clone(), guard)
                .instrument(span),
        );
        running.insert(run.run_id.clone(), handle.abort_handle());
        Ok(TriggerOutcome::Started(run))
    }

    async fn execute(self: Arc<Self>, node: AssetNode, run: AssetRun, guard: InFlight) {
        let outcome = self.run_once(&node, &run).await;
        let run_id = run.run_id.clone();
        // Queue the event before deregistering; the lock is an await point.
        if let Some(outcome) = outcome {
            let _ = self.events.send(RunEvent {
                run,
                outcome,
                _in_flight: guard,
            });
        }
        self.running.lock().await.remove(&run_id);
    }

    /// Start, materialize under the deadline, record the terminal state.
    /// `None` when the start gate blocked the run or a cancel finished it.
    async fn run_once(&self, node: &AssetNode, run: &AssetRun) -> Option<RunOutcome> {
        let run_id = run.run_id.0.as_str();
        let asset = run.asset.to_string();
        let partition = run.partition.to_string();

        match self.registry.start(&run.run_id, &node.upstream).await {
            Ok(StartOutcome::Started(_)) => {}
            Ok(StartOutcome::Blocked { upstream }) => {
                let reason = format!("upstream {upstream} has not succeeded");
                info!(run_id, asset = %asset, partition = %partition, %reason, "run blocked at start");
                self.fail(run, &reason).await;
                return None;
            }
            Err(StorageError::InvalidRunState { status, .. }) => {
                debug!(run_id, %status, "run finished before it started");
                return None;
            }
            Err(e) => {
                let err = StrataError::from(e);
                let reason = err.to_string();
                obs::emit_run_failed(run_id, &asset, &partition, &reason);
                self.fail(run, &reason).await;
                return Some(RunOutcome::Failed {
                    error: reason,
                    retry: err.is_transient(),
                });
            }
        }

        obs::emit_run_started(run_id, &asset, &partition, run.attempt);
        let clock = Instant::now();
        let deadline = self.settings.run_deadline;
        let result = match tokio::time::timeout(
            deadline,
            self.materializer.materialize(node, &run.partition),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(StrataError::DeadlineExceeded {
                run_id: run_id.to_string(),
                seconds: deadline.as_secs(),
            }),
        };
        let elapsed_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = match result {
            Ok(report) => self
                .registry
                .finish(&run.run_id, RunState::Succeeded, None)
                .await
                .map(|_| report)
                .map_err(StrataError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(report) => {
                METRICS.inc_runs_succeeded();
                debug!(
                    run_id,
                    version = report.version,
                    inserted = report.inserted,
                    updated = report.updated,
                    committed = report.committed,
                    "merge committed"
                );
                obs::emit_run_finished(run_id, elapsed_ms, true);
                Some(RunOutcome::Succeeded)
            }
            Err(e) => {
                let retry = e.is_transient();
                let reason = e.to_string();
                if !self.fail(run, &reason).await {
                    return None;
                }
                obs::emit_run_failed(run_id, &asset, &partition, &reason);
                obs::emit_run_finished(run_id, elapsed_ms, false);
                Some(RunOutcome::Failed {
                    error: reason,
                    retry,
                })
            }
        }
    }

    /// Record a failure. `false` when the run was already terminal, which
    /// means it was cancelled and must not retry or notify.
    async fn fail(&self, run: &AssetRun, reason: &str) -> bool {
        match self
            .registry
            .finish(&run.run_id, RunState::Failed, Some(reason.to_string()))
            .await
        {
            Ok(_) => true,
            Err(StorageError::InvalidRunState { status, .. }) => {
                debug!(run_id = %run.run_id, %status, "run already finished elsewhere");
                false
            }
            Err(e) => {
                error!(run_id = %run.run_id, partition = %run.partition, error = %e, "could not record run failure");
                true
            }
        }
    }

    async fn handle(self: Arc<Self>, event: RunEvent) {
        let RunEvent {
            run,
            outcome,
            _in_flight,
        } = event;
        match outcome {
            RunOutcome::Succeeded => self.cascade(&run),
            RunOutcome::Failed { error, retry } => {
                if retry && run.attempt < self.settings.max_attempts {
                    self.schedule_retry(run);
                } else {
                    METRICS.inc_runs_failed();
                    error!(
                        asset = %run.asset,
                        partition = %run.partition,
                        attempts = run.attempt,
                        reason = %error,
                        "run failed; operator attention required"
                    );
                    self.notifier
                        .notify(&OperatorEvent::RunFailed {
                            asset: run.asset.to_string(),
                            partition: run.partition.to_string(),
                            attempts: run.attempt,
                            error,
                        })
                        .await;
                }
            }
        }
    }

    /// Trigger every dependent of a succeeded run for the same date.
    fn cascade(self: &Arc<Self>, run: &AssetRun) {
        let dependents = match self.graph.downstream_of(&run.asset) {
            Ok(d) => d,
            Err(e) => {
                warn!(asset = %run.asset, error = %e, "completed run for undeclared asset");
                return;
            }
        };
        for node in dependents {
            let partition = PartitionKey::new(node.id.domain.clone(), run.partition.date);
            let guard = InFlight::new(&self.in_flight);
            let inner = Arc::clone(self);
            let asset = node.id.clone();
            tokio::spawn(async move {
                inner.trigger_dependent(&asset, &partition).await;
                drop(guard);
            });
        }
    }

    async fn trigger_dependent(self: &Arc<Self>, asset: &AssetId, partition: &PartitionKey) {
        let attempts = self.settings.trigger_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.trigger(asset, partition, TriggerSource::Upstream, 1).await {
                Ok(outcome) => {
                    debug!(asset = %asset, %partition, ?outcome, "dependent triggered");
                    return;
                }
                Err(e) => {
                    warn!(asset = %asset, %partition, attempt, error = %e, "dependent trigger failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.trigger_retry_delay).await;
                    }
                }
            }
        }
        let err = StrataError::TriggerFailure {
            asset: asset.to_string(),
            partition: partition.to_string(),
            reason: last_error,
        };
        error!(error = %err, "giving up on dependent trigger");
        self.notifier
            .notify(&OperatorEvent::TriggerFailed {
                asset: asset.to_string(),
                partition: partition.to_string(),
                error: err.to_string(),
            })
            .await;
    }

    fn schedule_retry(self: &Arc<Self>, run: AssetRun) {
        let delay = self.settings.backoff(run.attempt);
        let next = run.attempt + 1;
        METRICS.inc_runs_retried();
        info!(
            asset = %run.asset,
            partition = %run.partition,
            attempt = next,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "retry scheduled"
        );
        let guard = InFlight::new(&self.in_flight);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = inner
                .trigger(&run.asset, &run.partition, TriggerSource::Retry, next)
                .await
            {
                error!(asset = %run.asset, partition = %run.partition, error = %e, "retry trigger failed");
            }
            drop(guard);
        });
    }
}
