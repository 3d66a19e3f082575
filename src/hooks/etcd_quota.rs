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

//! etcd quota planner.
//!
//! Chooses `--quota-backend-bytes` for new etcd pods from the memory of the
//! control-plane nodes. The quota grows with dedicated node memory, is capped
//! at 8 GiB and never shrinks.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::etcd::DEFAULT_ETCD_MAX_SIZE;
use crate::metrics::Labels;
use crate::pass::Pass;
use crate::reconcile_context::ReconcileContext;
use crate::reconciler::{CancellationToken, Reconciler, Result};
use crate::reconciler_descriptor::{ReconcilerDescriptor, ReconcilerRegistry, ResourceKind};
use crate::snapshot::{EtcdPod, MasterNode};

/// Reconciler name.
pub const NAME: &str = "etcd-quota-backend-bytes";

const GIB: i64 = 1024 * 1024 * 1024;

/// Largest quota the planner sets.
pub const MAX_ETCD_QUOTA: i64 = 8 * GIB;

/// Metric group expired on every pass.
pub const METRIC_GROUP: &str = "etcd_quota_backend_bytes";

/// Gauge holding the published quota.
pub const QUOTA_METRIC: &str = "d8_etcd_quota_backend_total";

/// Gauge set when node memory no longer supports the current quota.
pub const SHOULD_DECREASE_METRIC: &str = "d8_etcd_quota_backend_should_decrease";

/// Quota the step table allows for a dedicated node with `memory_bytes`.
///
/// 2 GiB up to 16 GiB of memory, then one more GiB per 8 GiB starting at
/// 20 GiB, capped at [`MAX_ETCD_QUOTA`].
pub fn quota_for_memory(memory_bytes: i64) -> i64 {
    let steps = if memory_bytes > 16 * GIB {
        (memory_bytes - 12 * GIB) / (8 * GIB)
    } else {
        0
    };
    (DEFAULT_ETCD_MAX_SIZE + steps * GIB).min(MAX_ETCD_QUOTA)
}

/// The node whose memory bounds the quota.
///
/// The first non-dedicated master wins; otherwise the dedicated master with
/// the least memory.
pub fn reference_node(masters: &[MasterNode]) -> Option<&MasterNode> {
    masters
        .iter()
        .find(|m| !m.is_dedicated)
        .or_else(|| masters.iter().min_by_key(|m| m.memory_bytes))
}

/// Largest quota among running etcd pods, or the etcd default.
pub fn current_quota(pods: &[EtcdPod]) -> i64 {
    pods.iter()
        .map(EtcdPod::max_db_size)
        .max()
        .unwrap_or(DEFAULT_ETCD_MAX_SIZE)
}

/// Outcome of planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPlan {
    /// Quota to publish.
    pub quota: i64,
    /// The table asks for less than the current quota.
    pub should_decrease: bool,
}

/// Plans the quota for `masters` given the quota currently in use.
pub fn plan(masters: &[MasterNode], current: i64) -> QuotaPlan {
    let keep = QuotaPlan {
        quota: current,
        should_decrease: false,
    };
    let Some(node) = reference_node(masters) else {
        return keep;
    };
    if !node.is_dedicated {
        return keep;
    }

    let wanted = quota_for_memory(node.memory_bytes);
    if wanted < current {
        QuotaPlan {
            quota: current,
            should_decrease: true,
        }
    } else {
        QuotaPlan {
            quota: wanted,
            should_decrease: false,
        }
    }
}

/// Publishes `etcdQuotaBackendBytes`.
#[derive(Debug, Default)]
pub struct EtcdQuota;

#[async_trait]
impl Reconciler for EtcdQuota {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(
        &self,
        _ctx: &ReconcileContext,
        pass: &mut Pass,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        pass.metrics.expire(METRIC_GROUP);

        let quota = match pass.values.control_plane_manager.etcd.max_db_size {
            Some(user) => {
                debug!(reconciler = NAME, quota = user, "using configured maxDbSize");
                user
            }
            None => {
                let snapshot = pass.snapshot.clone();
                let current = current_quota(&snapshot.etcd_pods);
                let planned = plan(&snapshot.masters, current);
                if planned.should_decrease {
                    warn!(
                        reconciler = NAME,
                        current,
                        "node memory is too small for the current etcd quota"
                    );
                    pass.metrics
                        .set_in_group(METRIC_GROUP, SHOULD_DECREASE_METRIC, 1.0, Labels::new());
                }
                if planned.quota != current {
                    info!(
                        reconciler = NAME,
                        from = current,
                        to = planned.quota,
                        "raising etcd quota-backend-bytes"
                    );
                }
                planned.quota
            }
        };

        pass.metrics
            .set_in_group(METRIC_GROUP, QUOTA_METRIC, quota as f64, Labels::new());
        pass.values.internal_mut().etcd_quota_backend_bytes = Some(quota);
        Ok(())
    }
}

/// Registers the quota planner.
pub fn register(registry: &mut ReconcilerRegistry) {
    registry.register(
        ReconcilerDescriptor::builder(NAME)
            .before_helm(20)
            .subscribe(ResourceKind::Node)
            .subscribe(ResourceKind::Pod)
            .build(EtcdQuota),
    );
}
