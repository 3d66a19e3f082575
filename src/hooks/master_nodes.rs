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

//! Master-node inventory.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::pass::Pass;
use crate::reconcile_context::ReconcileContext;
use crate::reconciler::{CancellationToken, Reconciler, Result};
use crate::reconciler_descriptor::{ReconcilerDescriptor, ReconcilerRegistry, ResourceKind, Schedule};

/// Reconciler name.
pub const NAME: &str = "master-nodes";

/// Publishes `mastersNode`, `hasEtcdArbiterNode` and `hasEtcdOnlyNode`.
#[derive(Debug, Default)]
pub struct MasterNodes;

#[async_trait]
impl Reconciler for MasterNodes {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(
        &self,
        _ctx: &ReconcileContext,
        pass: &mut Pass,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let snapshot = pass.snapshot.clone();
        let names: Vec<String> = snapshot.masters.iter().map(|m| m.name.clone()).collect();

        let internal = pass.values.internal_mut();
        if internal.masters_node.as_ref() != Some(&names) {
            info!(reconciler = NAME, masters = ?names, "master nodes changed");
        }
        internal.masters_node = Some(names);
        internal.has_etcd_arbiter_node = Some(!snapshot.arbiter_nodes.is_empty());
        internal.has_etcd_only_node = Some(!snapshot.etcd_only_nodes.is_empty());
        Ok(())
    }
}

/// Registers the inventory reconciler.
pub fn register(registry: &mut ReconcilerRegistry) {
    registry.register(
        ReconcilerDescriptor::builder(NAME)
            .before_helm(10)
            .subscribe(ResourceKind::Node)
            .schedule(Schedule::every(NAME, Duration::from_secs(15 * 60)))
            .build(MasterNodes),
    );
}
