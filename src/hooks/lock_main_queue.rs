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

//! Main-queue lock.
//!
//! After rendering, the pass does not complete until the control-plane-manager
//! DaemonSet has rolled out: every pod Ready at the DaemonSet's generation.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::pass::Pass;
use crate::reconcile_context::ReconcileContext;
use crate::reconciler::{CancellationToken, ReconcileError, Reconciler, Result};
use crate::reconciler_descriptor::{ReconcilerDescriptor, ReconcilerRegistry};
use crate::snapshot::{
    daemonset_state, manager_pod, DaemonSetState, ManagerPod, MANAGER_DAEMONSET,
    MANAGER_POD_SELECTOR,
};
use crate::wait::{poll_until, PollError};

/// Reconciler name.
pub const NAME: &str = "lock-main-queue";

/// Returns true when the rollout of `daemonset` is complete.
pub fn rollout_complete(daemonset: &DaemonSetState, pods: &[ManagerPod]) -> bool {
    !pods.is_empty()
        && pods.len() >= daemonset.desired.max(0) as usize
        && pods
            .iter()
            .all(|p| p.ready && p.template_generation == Some(daemonset.generation))
}

/// Blocks the queue until the control-plane-manager pods settle.
#[derive(Debug, Default)]
pub struct LockMainQueue;

#[async_trait]
impl Reconciler for LockMainQueue {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        _pass: &mut Pass,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let namespace = ctx.namespace();

        let res = poll_until(
            ctx.config.poll_interval,
            ctx.config.poll_timeout,
            cancel,
            || async move {
                let Some(ds) = ctx.cluster.get_daemonset(namespace, MANAGER_DAEMONSET).await? else {
                    debug!(reconciler = NAME, "control-plane-manager DaemonSet not found");
                    return anyhow::Ok(true);
                };
                let ds = daemonset_state(&ds);
                let pods: Vec<ManagerPod> = ctx
                    .cluster
                    .list_pods(namespace, MANAGER_POD_SELECTOR)
                    .await?
                    .iter()
                    .filter_map(manager_pod)
                    .collect();
                Ok(rollout_complete(&ds, &pods))
            },
        )
        .await;

        match res {
            Ok(()) => Ok(()),
            Err(PollError::Cancelled) => Err(ReconcileError::Cancelled),
            Err(PollError::Condition(e)) => {
                Err(ReconcileError::transient("waiting for control-plane-manager", e))
            }
            Err(PollError::Timeout(after)) => {
                let message = format!(
                    "control-plane-manager pods are not Ready at the current generation after {:?}",
                    after
                );
                warn!(reconciler = NAME, "{}", message);
                Err(ReconcileError::QueueLocked(message))
            }
        }
    }
}

/// Registers the queue lock after Helm.
pub fn register(registry: &mut ReconcilerRegistry) {
    registry.register(
        ReconcilerDescriptor::builder(NAME)
            .after_helm(10)
            .build(LockMainQueue),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{self, FakeCluster, FakeEtcd};
    use crate::hooks::testing;
    use crate::snapshot::ClusterSnapshot;
    use crate::values::Values;
    use std::sync::Arc;

    fn pod(node: &str, generation: i64, ready: bool) -> ManagerPod {
        manager_pod(&fake::manager_pod(node, generation, ready)).unwrap()
    }

    #[test]
    fn test_rollout_complete() {
        let ds = DaemonSetState {
            generation: 3,
            desired: 2,
        };
        assert!(rollout_complete(&ds, &[pod("m-0", 3, true), pod("m-1", 3, true)]));
        assert!(!rollout_complete(&ds, &[pod("m-0", 3, true), pod("m-1", 2, true)]));
        assert!(!rollout_complete(&ds, &[pod("m-0", 3, true), pod("m-1", 3, false)]));
        assert!(!rollout_complete(&ds, &[pod("m-0", 3, true)]));
        assert!(!rollout_complete(&ds, &[]));
    }

    async fn run(cluster: Arc<FakeCluster>) -> Result<()> {
        let ctx = testing::context(cluster, FakeEtcd::new());
        let mut pass = testing::pass(ClusterSnapshot::default(), Values::default());
        LockMainQueue
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_passes_when_rolled_out() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_daemonset(fake::daemonset(MANAGER_DAEMONSET, 2, 1));
        cluster.add_pod(fake::manager_pod("m-0", 2, true));
        run(cluster).await.unwrap();
    }

    #[tokio::test]
    async fn test_passes_without_daemonset() {
        run(Arc::new(FakeCluster::new())).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_locks_on_stale_generation() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_daemonset(fake::daemonset(MANAGER_DAEMONSET, 2, 1));
        cluster.add_pod(fake::manager_pod("m-0", 1, true));
        let err = run(cluster).await.unwrap_err();
        assert!(matches!(err, ReconcileError::QueueLocked(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_read_failure_is_transient() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.set_fail_reads(true);
        let err = run(cluster).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Transient { .. }));
    }

    #[tokio::test]
    async fn test_cancelled() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_daemonset(fake::daemonset(MANAGER_DAEMONSET, 2, 1));
        let ctx = testing::context(cluster, FakeEtcd::new());
        let mut pass = testing::pass(ClusterSnapshot::default(), Values::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = LockMainQueue.reconcile(&ctx, &mut pass, &cancel).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Cancelled));
    }
}
