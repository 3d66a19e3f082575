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

//! Automatic etcd defragmentation.

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::hooks::connect_etcd;
use crate::metrics::labels;
use crate::pass::Pass;
use crate::reconcile_context::ReconcileContext;
use crate::reconciler::{CancellationToken, ReconcileError, Reconciler, Result};
use crate::reconciler_descriptor::{ReconcilerDescriptor, ReconcilerRegistry, Schedule};

/// Reconciler name.
pub const NAME: &str = "etcd-defrag";

/// Name of the hourly schedule.
pub const SCHEDULE: &str = "etcd-defrag-hourly";

/// Fill percentage at which a member is defragmented.
pub const DEFRAG_THRESHOLD_PERCENT: i128 = 90;

/// Counter of successful defragmentations.
pub const SUCCESS_METRIC: &str = "d8_etcd_defragmentation_success_total";

/// Counter of failed defragmentations.
pub const FAILED_METRIC: &str = "d8_etcd_defragmentation_failed_total";

/// Returns true when `db_size` fills at least 90% of `max_db_size`.
pub fn needs_defragmentation(db_size: i64, max_db_size: i64) -> bool {
    max_db_size > 0 && i128::from(db_size) * 100 >= i128::from(max_db_size) * DEFRAG_THRESHOLD_PERCENT
}

/// Defragments etcd members close to their quota.
#[derive(Debug, Default)]
pub struct EtcdDefrag;

#[async_trait]
impl Reconciler for EtcdDefrag {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        pass: &mut Pass,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if pass.values.control_plane_manager.etcd.disable_auto_defragmentation {
            debug!(reconciler = NAME, "automatic defragmentation disabled");
            return Ok(());
        }

        let snapshot = pass.snapshot.clone();
        let members: Vec<_> = snapshot
            .etcd_pods
            .iter()
            .filter(|p| p.running)
            .filter_map(|p| p.endpoint().map(|e| (p, e)))
            .collect();
        if members.is_empty() {
            return Ok(());
        }

        let endpoints: Vec<_> = members.iter().map(|(_, e)| e.clone()).collect();
        let client = connect_etcd(ctx, pass, &endpoints, cancel).await?;

        for (pod, endpoint) in members {
            if cancel.is_cancelled() {
                return Err(ReconcileError::Cancelled);
            }

            let status = match client.status(&endpoint).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(reconciler = NAME, endpoint = %endpoint, error = %e, "cannot get etcd status");
                    continue;
                }
            };

            let max_db_size = pod.max_db_size();
            if !needs_defragmentation(status.db_size, max_db_size) {
                debug!(
                    reconciler = NAME,
                    endpoint = %endpoint,
                    db_size = status.db_size,
                    max_db_size,
                    "defragmentation not needed"
                );
                continue;
            }

            info!(
                reconciler = NAME,
                pod = %pod.name,
                endpoint = %endpoint,
                db_size = status.db_size,
                max_db_size,
                "defragmenting etcd member"
            );
            let metric_labels = labels([
                ("pod_name", pod.name.as_str()),
                ("node", pod.node_name.as_str()),
            ]);
            match client.defragment(&endpoint).await {
                Ok(()) => pass.metrics.inc(SUCCESS_METRIC, metric_labels),
                Err(e) => {
                    error!(reconciler = NAME, pod = %pod.name, error = %e, "etcd defragmentation failed");
                    pass.metrics.inc(FAILED_METRIC, metric_labels);
                }
            }
        }
        Ok(())
    }
}

/// Registers the defragmenter on its hourly schedule.
pub fn register(registry: &mut ReconcilerRegistry) {
    registry.register(
        ReconcilerDescriptor::builder(NAME)
            .schedule(Schedule::hourly_at(SCHEDULE, 27))
            .build(EtcdDefrag),
    );
}
