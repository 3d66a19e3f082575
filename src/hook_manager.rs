// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Hook manager - the values orchestrator.
//!
//! Passes run one at a time. A pass collects a fresh [`ClusterSnapshot`],
//! runs every reconciler bound to its trigger in ascending order, applies each
//! reconciler's patches and metrics as soon as it succeeds, and commits the
//! working values only when the whole pass succeeds.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::MetricStorage;
use crate::pass::Pass;
use crate::patch;
use crate::reconcile_context::ReconcileContext;
use crate::reconciler::{cancellable, ReconcileError, Reconciler, Result};
use crate::reconciler_descriptor::{
    ReconcilerDescriptor, ReconcilerRegistry, ResourceKind, Schedule, Trigger,
};
use crate::requirements::RequirementsView;
use crate::snapshot::ClusterSnapshot;
use crate::values::Values;

/// Sleep used when no schedule is registered.
const IDLE_SCHEDULE_WAIT: Duration = Duration::from_secs(3600);

/// The hook manager.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use control_plane_hooks::config::HooksConfig;
/// use control_plane_hooks::etcd::grpc::GrpcEtcdConnector;
/// use control_plane_hooks::hook_manager::HookManager;
/// use control_plane_hooks::kube_api::KubeClusterApi;
/// use control_plane_hooks::reconcile_context::ReconcileContext;
/// use control_plane_hooks::values::Values;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = HooksConfig::default();
/// let client = kube::Client::try_default().await?;
/// let ctx = ReconcileContext::new(
///     Arc::new(KubeClusterApi::new(client)),
///     Arc::new(GrpcEtcdConnector::new(config.etcd_request_timeout)),
///     Arc::new(config),
/// );
/// let manager = HookManager::new(ctx, Values::default());
/// manager.run_once().await?;
/// # Ok(())
/// # }
/// ```
pub struct HookManager {
    /// Shared collaborators handed to every reconciler.
    ctx: ReconcileContext,

    /// Registry of all reconcilers.
    registry: ReconcilerRegistry,

    /// Values of the last fully successful pass.
    values: Arc<RwLock<Values>>,

    /// Process-wide metric storage.
    metrics: MetricStorage,

    /// Set after a successful cycle, cleared after a failed one.
    ready: Arc<AtomicBool>,

    /// Root cancellation token for shutdown.
    shutdown_token: CancellationToken,
}

impl HookManager {
    /// Creates a manager with every built-in reconciler registered.
    pub fn new(ctx: ReconcileContext, values: Values) -> Self {
        Self::with_registry(ctx, crate::hooks::registry(), values)
    }

    /// Creates a manager over a custom registry.
    pub fn with_registry(ctx: ReconcileContext, registry: ReconcilerRegistry, values: Values) -> Self {
        Self {
            ctx,
            registry,
            values: Arc::new(RwLock::new(values)),
            metrics: MetricStorage::new(),
            ready: Arc::new(AtomicBool::new(false)),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Adds a reconciler descriptor to the registry.
    pub fn register_reconciler(&mut self, descriptor: ReconcilerDescriptor) -> &mut Self {
        self.registry.register(descriptor);
        self
    }

    /// Returns the reconciler registry.
    pub fn registry(&self) -> &ReconcilerRegistry {
        &self.registry
    }

    /// Returns the shared reconcile context.
    pub fn context(&self) -> &ReconcileContext {
        &self.ctx
    }

    /// Returns a handle to the metric storage.
    pub fn metrics(&self) -> MetricStorage {
        self.metrics.clone()
    }

    /// Returns the readiness flag served on `/healthz/ready`.
    pub fn readiness(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// Returns the requirements registry bound to the committed values.
    pub fn requirements(&self) -> RequirementsView {
        RequirementsView::new(self.ctx.requirements.clone(), self.values.clone())
    }

    /// Returns the values committed by the last successful pass.
    pub async fn values(&self) -> Values {
        self.values.read().await.clone()
    }

    /// Returns the shutdown cancellation token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Initiates a graceful shutdown.
    pub fn shutdown(&self) {
        info!("initiating graceful shutdown");
        self.shutdown_token.cancel();
    }

    /// Runs every reconciler bound to `trigger`.
    ///
    /// Returns how many reconcilers ran. A failing reconciler stops the pass;
    /// its own patches and metrics are dropped and the committed values are
    /// left untouched.
    pub async fn run_pass(&self, trigger: Trigger) -> Result<usize> {
        let descriptors = self.registry.for_trigger(&trigger);
        if descriptors.is_empty() {
            return Ok(0);
        }

        let cancel = self.shutdown_token.child_token();
        let started = Instant::now();
        let snapshot = cancellable(&cancel, async {
            ClusterSnapshot::collect(self.ctx.cluster.as_ref(), self.ctx.namespace())
                .await
                .map_err(|e| ReconcileError::transient("collecting cluster snapshot", e))
        })
        .await?;

        let mut pass = Pass::new(trigger.clone(), Arc::new(snapshot), self.values().await);

        for descriptor in &descriptors {
            if cancel.is_cancelled() {
                return Err(ReconcileError::Cancelled);
            }
            let name = descriptor.name();
            debug!(reconciler = %name, trigger = %trigger, "running reconciler");

            if let Err(e) = descriptor.reconciler().reconcile(&self.ctx, &mut pass, &cancel).await {
                let dropped = pass.patches.take().len();
                pass.metrics.take();
                error!(
                    reconciler = %name,
                    trigger = %trigger,
                    dropped_patches = dropped,
                    error = %e,
                    "reconciler failed"
                );
                return Err(e);
            }

            let operations = pass.patches.take();
            if !operations.is_empty() {
                let count = operations.len();
                cancellable(&cancel, async {
                    patch::apply(self.ctx.cluster.as_ref(), operations)
                        .await
                        .map_err(|e| ReconcileError::transient(format!("applying patches of {}", name), e))
                })
                .await?;
                debug!(reconciler = %name, patches = count, "applied patches");
            }
            self.metrics.apply(pass.metrics.take());
        }

        self.write_values_output(&pass.values).await?;
        *self.values.write().await = pass.values;

        info!(
            trigger = %trigger,
            reconcilers = descriptors.len(),
            elapsed = ?started.elapsed(),
            "pass finished"
        );
        Ok(descriptors.len())
    }

    /// Runs the before-helm and after-helm phases.
    pub async fn run_cycle(&self) -> Result<()> {
        self.run_pass(Trigger::BeforeHelm).await?;
        self.run_pass(Trigger::AfterHelm).await?;
        Ok(())
    }

    /// Runs startup followed by one full cycle.
    pub async fn run_once(&self) -> Result<()> {
        self.run_pass(Trigger::Startup).await?;
        let res = self.run_cycle().await;
        self.ready.store(res.is_ok(), Ordering::Relaxed);
        res
    }

    /// Runs the manager until shutdown.
    ///
    /// Passes are serialized: events, schedules and the periodic resync never
    /// overlap. Failures are logged and retried on the next trigger.
    pub async fn run<S>(&self, events: S) -> Result<()>
    where
        S: Stream<Item = ResourceKind> + Unpin,
    {
        info!(reconcilers = self.registry.len(), "starting control-plane hooks");
        let mut events = events;
        let mut events_open = true;

        if let Err(e) = self.run_pass(Trigger::Startup).await {
            error!(error = %e, "startup pass failed");
        }
        self.cycle().await;

        let mut schedules: Vec<(Schedule, DateTime<Utc>)> = self
            .registry
            .schedules()
            .into_iter()
            .map(|s| {
                let next = s.next_after(Utc::now());
                (s, next)
            })
            .collect();

        let resync = tokio::time::sleep(self.ctx.resync_period());
        tokio::pin!(resync);

        loop {
            let due = next_due(&schedules, Utc::now());
            let schedule_wait = due.map(|(_, wait)| wait).unwrap_or(IDLE_SCHEDULE_WAIT);

            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("shutdown signal received, stopping hook manager");
                    break;
                }

                _ = &mut resync => {
                    debug!("periodic resync");
                    self.cycle().await;
                    resync
                        .as_mut()
                        .reset(tokio::time::Instant::now() + self.ctx.resync_period());
                }

                _ = tokio::time::sleep(schedule_wait), if due.is_some() => {
                    if let Some((index, _)) = due {
                        let (schedule, next) = &mut schedules[index];
                        *next = schedule.next_after(Utc::now());
                        let trigger = Trigger::Schedule(schedule.name.clone());
                        self.triggered_pass(trigger).await;
                    }
                }

                event = events.next(), if events_open => {
                    match event {
                        Some(kind) => {
                            let mut kinds = BTreeSet::from([kind]);
                            while let Some(Some(kind)) = events.next().now_or_never() {
                                kinds.insert(kind);
                            }
                            for kind in kinds {
                                self.triggered_pass(Trigger::KubeEvent(kind)).await;
                            }
                        }
                        None => {
                            warn!("event stream ended, relying on resync");
                            events_open = false;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Runs a full cycle and records readiness.
    async fn cycle(&self) {
        match self.run_cycle().await {
            Ok(()) => self.ready.store(true, Ordering::Relaxed),
            Err(e) => {
                error!(error = %e, retryable = e.is_retryable(), "cycle failed");
                self.ready.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Runs an event or schedule pass; a change of the published values
    /// re-renders through a full cycle.
    async fn triggered_pass(&self, trigger: Trigger) {
        let before = self.values().await;
        match self.run_pass(trigger.clone()).await {
            Ok(0) => {}
            Ok(_) => {
                if self.values().await != before {
                    info!(trigger = %trigger, "values changed, running cycle");
                    self.cycle().await;
                }
            }
            Err(e) => {
                warn!(trigger = %trigger, error = %e, "pass failed");
            }
        }
    }

    async fn write_values_output(&self, values: &Values) -> Result<()> {
        let Some(path) = &self.ctx.config.values_output else {
            return Ok(());
        };
        let rendered = values
            .to_json_pretty()
            .map_err(|e| ReconcileError::transient("serializing values", e))?;
        tokio::fs::write(path, rendered)
            .await
            .map_err(|e| ReconcileError::transient(format!("writing {}", path.display()), e))
    }
}

/// Index of the earliest schedule and the wait until it fires.
fn next_due(schedules: &[(Schedule, DateTime<Utc>)], now: DateTime<Utc>) -> Option<(usize, Duration)> {
    schedules
        .iter()
        .enumerate()
        .min_by_key(|(_, (_, at))| *at)
        .map(|(index, (_, at))| (index, (*at - now).to_std().unwrap_or(Duration::ZERO)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HooksConfig;
    use crate::fake::{self, ClusterCall, FakeCluster, FakeEtcd};
    use crate::metrics::labels;
    use crate::patch::ObjectRef;
    use crate::reconciler::{CancellationToken, Reconciler};
    use async_trait::async_trait;
    use serde_json::json;

    /// Records its name in the values, patches the node and sets a gauge.
    struct Step {
        name: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Reconciler for Step {
        fn name(&self) -> &str {
            self.name
        }

        async fn reconcile(
            &self,
            _ctx: &ReconcileContext,
            pass: &mut Pass,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            pass.values
                .internal_mut()
                .masters_node
                .get_or_insert_with(Vec::new)
                .push(self.name.to_string());
            pass.patches.merge_patch(
                ObjectRef::node("m-0"),
                json!({"metadata": {"annotations": {self.name: "seen"}}}),
            );
            pass.metrics.set("steps", 1.0, labels([("step", self.name)]));
            if self.fail {
                return Err(ReconcileError::Invariant(format!("{} failed", self.name)));
            }
            Ok(())
        }
    }

    fn step(name: &'static str, order: u32, fail: bool) -> ReconcilerDescriptor {
        ReconcilerDescriptor::builder(name)
            .before_helm(order)
            .subscribe(ResourceKind::Node)
            .build(Step { name, fail })
    }

    fn manager(cluster: Arc<FakeCluster>, config: HooksConfig, steps: Vec<ReconcilerDescriptor>) -> HookManager {
        let ctx = ReconcileContext::new(cluster, Arc::new(FakeEtcd::new()), Arc::new(config));
        let mut registry = ReconcilerRegistry::new();
        for s in steps {
            registry.register(s);
        }
        HookManager::with_registry(ctx, registry, Values::default())
    }

    fn cluster() -> Arc<FakeCluster> {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_node(fake::node("m-0", "10.0.0.1", "v1.29.1").master().build());
        cluster
    }

    #[tokio::test]
    async fn test_pass_runs_in_order_and_commits() {
        let cluster = cluster();
        let manager = manager(
            cluster.clone(),
            HooksConfig::default(),
            vec![step("b", 20, false), step("a", 10, false), step("c", 20, false)],
        );

        assert_eq!(manager.run_pass(Trigger::BeforeHelm).await.unwrap(), 3);

        let values = manager.values().await;
        assert_eq!(
            values.internal().masters_node,
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        let patches = cluster
            .calls()
            .into_iter()
            .filter(|c| matches!(c, ClusterCall::MergePatch { .. }))
            .count();
        assert_eq!(patches, 3);
        assert_eq!(manager.metrics().get("steps", &labels([("step", "c")])), Some(1.0));
    }

    #[tokio::test]
    async fn test_failure_keeps_committed_values() {
        let cluster = cluster();
        let manager = manager(
            cluster.clone(),
            HooksConfig::default(),
            vec![step("a", 10, false), step("b", 20, true), step("c", 30, false)],
        );

        let err = manager.run_pass(Trigger::BeforeHelm).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Invariant(_)));
        assert_eq!(manager.values().await, Values::default());

        // "a" succeeded and was applied; "b" was dropped; "c" never ran.
        let targets: Vec<_> = cluster
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                ClusterCall::MergePatch { patch, .. } => Some(patch),
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec![json!({"metadata": {"annotations": {"a": "seen"}}})]);
        assert_eq!(manager.metrics().get("steps", &labels([("step", "a")])), Some(1.0));
        assert_eq!(manager.metrics().get("steps", &labels([("step", "b")])), None);
    }

    #[tokio::test]
    async fn test_unbound_trigger_is_noop() {
        let cluster = cluster();
        let manager = manager(cluster.clone(), HooksConfig::default(), vec![step("a", 10, false)]);
        assert_eq!(manager.run_pass(Trigger::AfterHelm).await.unwrap(), 0);
        assert_eq!(manager.run_pass(Trigger::KubeEvent(ResourceKind::Secret)).await.unwrap(), 0);
        assert_eq!(manager.run_pass(Trigger::KubeEvent(ResourceKind::Node)).await.unwrap(), 1);
        assert_eq!(cluster.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_transient() {
        let cluster = cluster();
        cluster.set_fail_reads(true);
        let manager = manager(cluster, HooksConfig::default(), vec![step("a", 10, false)]);
        let err = manager.run_pass(Trigger::BeforeHelm).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Transient { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_values_output_written() {
        let dir = std::env::temp_dir().join(format!("hook-manager-values-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("values.json");
        let config = HooksConfig {
            values_output: Some(path.clone()),
            ..Default::default()
        };
        let manager = manager(cluster(), config, vec![step("a", 10, false)]);

        manager.run_once().await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            written["controlPlaneManager"]["internal"]["mastersNode"],
            json!(["a"])
        );
        assert!(manager.readiness().load(Ordering::Relaxed));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pass() {
        let manager = manager(cluster(), HooksConfig::default(), vec![step("a", 10, false)]);
        manager.shutdown();
        let err = manager.run_pass(Trigger::BeforeHelm).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Cancelled));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let manager = manager(cluster(), HooksConfig::default(), vec![step("a", 10, false)]);
        manager.shutdown();
        manager.run(futures::stream::pending()).await.unwrap();
        assert!(!manager.readiness().load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_event_pass_reruns_cycle_on_change() {
        let cluster = cluster();
        let manager = manager(cluster.clone(), HooksConfig::default(), vec![step("a", 10, false)]);

        manager.triggered_pass(Trigger::KubeEvent(ResourceKind::Node)).await;

        // The event pass changed the values, so the cycle ran the step again.
        assert_eq!(
            manager.values().await.internal().masters_node,
            Some(vec!["a".to_string(), "a".to_string()])
        );
        assert!(manager.readiness().load(Ordering::Relaxed));
    }

    #[test]
    fn test_next_due_picks_earliest() {
        let now = Utc::now();
        let schedules = vec![
            (Schedule::every("slow", Duration::from_secs(900)), now + chrono::Duration::minutes(15)),
            (Schedule::every("fast", Duration::from_secs(300)), now + chrono::Duration::minutes(5)),
        ];
        let (index, wait) = next_due(&schedules, now).unwrap();
        assert_eq!(index, 1);
        assert_eq!(wait, Duration::from_secs(300));

        let overdue = vec![(Schedule::every("late", Duration::from_secs(60)), now - chrono::Duration::seconds(5))];
        assert_eq!(next_due(&overdue, now).unwrap().1, Duration::ZERO);
        assert!(next_due(&[], now).is_none());
    }
}
