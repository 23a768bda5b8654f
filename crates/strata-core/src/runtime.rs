//! Assembles the stores, reconciler, scheduler and maintenance job from a
//! loaded [`StrataConfig`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use strata_state::{
    FsManifestStore, FsTableStore, ManifestStore, RunRegistry, SurrealRunRegistry, TableStore,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{NotifyKind, SinkKind, StrataConfig, TransformConfig};
use crate::error::Result;
use crate::graph::AssetGraph;
use crate::landing::{DeviceInfo, FsLandingStore};
use crate::maintenance::MaintenanceJob;
use crate::metrics::METRICS;
use crate::materializer::{
    Aggregate, AssetDefinition, LandingIngest, LayerMaterializer, LayerTransform, Project,
};
use crate::notify::{LogNotifier, OperatorNotifier, WebhookNotifier};
use crate::reconciler::{DomainReconciler, Reconciler};
use crate::scheduler::Scheduler;
use crate::sink::{HttpIngestionSink, IngestionSink, LandingDirSink};
use crate::source::DirectorySource;

/// Every long-lived component of a Strata deployment.
pub struct Runtime {
    config: StrataConfig,
    manifests: Arc<dyn ManifestStore>,
    tables: Arc<dyn TableStore>,
    landing: FsLandingStore,
    reconciler: Reconciler,
    scheduler: Scheduler,
    maintenance: MaintenanceJob,
}

impl Runtime {
    /// Open the stores and wire every component.
    ///
    /// Must be called inside a Tokio runtime; the scheduler's dispatcher is
    /// spawned here.
    pub async fn build(config: StrataConfig) -> Result<Self> {
        let manifests: Arc<dyn ManifestStore> =
            Arc::new(FsManifestStore::open(config.state.manifest_dir())?);
        let tables: Arc<dyn TableStore> = Arc::new(FsTableStore::open(config.state.table_dir())?);
        let landing = FsLandingStore::open(config.state.landing_dir())?;

        let registry: Arc<dyn RunRegistry> = match &config.state.registry_url {
            Some(url) => Arc::new(SurrealRunRegistry::connect(url).await?),
            None => {
                warn!("no registry_url configured; run history is kept in memory only");
                Arc::new(SurrealRunRegistry::in_memory().await?)
            }
        };
        let interrupted = registry.fail_interrupted("interrupted by restart").await?;
        if !interrupted.is_empty() {
            warn!(runs = interrupted.len(), "failed runs left active by a previous process");
        }

        let notifier: Arc<dyn OperatorNotifier> = match (&config.notify.kind, &config.notify.webhook_url) {
            (NotifyKind::Webhook, Some(url)) => Arc::new(WebhookNotifier::from_env(url.clone())),
            _ => Arc::new(LogNotifier),
        };

        let sink = build_sink(&config, &landing)?;
        let reconciler = Reconciler::new(
            config
                .domains
                .iter()
                .map(|d| {
                    DomainReconciler::new(
                        d.name.clone(),
                        config.reconciler_settings(d),
                        Arc::clone(&manifests),
                        Arc::new(DirectorySource::new(d.source_dir.clone())),
                        Arc::clone(&sink),
                        Arc::clone(&notifier),
                    )
                })
                .collect(),
        );

        let graph = Arc::new(config.asset_graph()?);
        let mut materializer = LayerMaterializer::new(Arc::clone(&tables));
        for asset in &config.assets {
            materializer.define(
                asset.id.clone(),
                AssetDefinition {
                    transform: transform_for(&asset.transform, &landing),
                    schema: asset.schema.clone(),
                },
            )?;
        }
        let scheduler = Scheduler::new(
            Arc::clone(&graph),
            registry,
            Arc::new(materializer),
            Arc::clone(&notifier),
            config.scheduler_settings(),
        );

        let maintenance = MaintenanceJob::new(Arc::clone(&tables), config.maintenance_settings());

        info!(
            domains = config.domains.len(),
            assets = graph.len(),
            root = %config.state.root.display(),
            "runtime assembled"
        );

        Ok(Self {
            config,
            manifests,
            tables,
            landing,
            reconciler,
            scheduler,
            maintenance,
        })
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn manifests(&self) -> &Arc<dyn ManifestStore> {
        &self.manifests
    }

    pub fn tables(&self) -> &Arc<dyn TableStore> {
        &self.tables
    }

    pub fn landing(&self) -> &FsLandingStore {
        &self.landing
    }

    pub fn graph(&self) -> &AssetGraph {
        self.scheduler.graph()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn maintenance(&self) -> &MaintenanceJob {
        &self.maintenance
    }

    /// Reconcile every domain on the configured cadence until `shutdown`.
    pub async fn reconcile_until(&self, shutdown: impl Future<Output = ()>) {
        let every = Duration::from_secs(self.config.reconcile.interval_secs.max(1));
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    // Failed passes are logged by the reconciler and retried next interval.
                    self.reconciler.run_all().await;
                    METRICS.flush();
                }
            }
        }
    }

    /// Run the scheduler, reconciliation and maintenance loops together
    /// until `shutdown` resolves. In-flight runs are drained before return.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) {
        let (stop, stopped) = watch::channel(false);
        let signal = |mut rx: watch::Receiver<bool>| async move {
            let _ = rx.wait_for(|s| *s).await;
        };

        let loops = async {
            tokio::join!(
                self.scheduler.run_until(signal(stopped.clone())),
                self.reconcile_until(signal(stopped.clone())),
                self.maintenance.run_until(signal(stopped.clone())),
            );
        };
        tokio::pin!(loops);
        tokio::pin!(shutdown);

        let requested = tokio::select! {
            _ = &mut loops => false,
            _ = &mut shutdown => true,
        };
        if requested {
            info!("shutdown requested");
            let _ = stop.send(true);
            loops.await;
        }
    }
}

fn build_sink(config: &StrataConfig, landing: &FsLandingStore) -> Result<Arc<dyn IngestionSink>> {
    let device = DeviceInfo::from(&config.sink.device);
    match (config.sink.kind, &config.sink.endpoint) {
        (SinkKind::Http, Some(endpoint)) => {
            let token = config.sink.token()?;
            Ok(Arc::new(HttpIngestionSink::new(
                endpoint.clone(),
                token,
                device,
                config.sink.timeout(),
            )?))
        }
        _ => Ok(Arc::new(LandingDirSink::new(landing.clone(), device))),
    }
}

fn transform_for(config: &TransformConfig, landing: &FsLandingStore) -> Arc<dyn LayerTransform> {
    match config {
        TransformConfig::LandingIngest => Arc::new(LandingIngest::new(landing.clone())),
        TransformConfig::Project { columns } => Arc::new(Project::new(columns.clone())),
        TransformConfig::Aggregate {
            group_by,
            sums,
            count_as,
        } => Arc::new(Aggregate::new(group_by.clone(), sums.clone(), count_as.clone())),
    }
}
