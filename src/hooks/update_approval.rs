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

//! Master update approver.
//!
//! A master node asks for an update by carrying the waiting-for-approval
//! annotation. At most one master holds the approved annotation at a time; it
//! is cleared once the node's control-plane-manager pod is Ready again, and
//! the next waiting node is approved on a later pass.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::pass::Pass;
use crate::patch::ObjectRef;
use crate::reconcile_context::ReconcileContext;
use crate::reconciler::{CancellationToken, Reconciler, Result};
use crate::reconciler_descriptor::{ReconcilerDescriptor, ReconcilerRegistry, ResourceKind};
use crate::snapshot::{
    ApprovalState, ClusterSnapshot, MasterNode, APPROVED_ANNOTATION,
    WAITING_FOR_APPROVAL_ANNOTATION,
};

/// Reconciler name.
pub const NAME: &str = "update-approval";

/// One approval transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Remove the approved annotation from a settled node.
    Clear(String),
    /// Approve a waiting node.
    Approve(String),
}

fn manager_ready(snapshot: &ClusterSnapshot, node: &MasterNode) -> bool {
    snapshot
        .manager_pods
        .iter()
        .any(|p| p.node_name == node.name && p.ready)
}

/// Computes the transitions of one pass.
pub fn transitions(snapshot: &ClusterSnapshot) -> Vec<Transition> {
    let approved: Vec<&MasterNode> = snapshot
        .masters
        .iter()
        .filter(|m| m.approval == ApprovalState::Approved)
        .collect();

    let cleared: Vec<Transition> = approved
        .iter()
        .filter(|m| manager_ready(snapshot, m))
        .map(|m| Transition::Clear(m.name.clone()))
        .collect();
    if !cleared.is_empty() || !approved.is_empty() {
        return cleared;
    }

    snapshot
        .masters
        .iter()
        .find(|m| m.approval == ApprovalState::Waiting && m.ready && !m.unschedulable)
        .map(|m| vec![Transition::Approve(m.name.clone())])
        .unwrap_or_default()
}

/// Drives the approval annotations of master nodes.
#[derive(Debug, Default)]
pub struct UpdateApproval;

#[async_trait]
impl Reconciler for UpdateApproval {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(
        &self,
        _ctx: &ReconcileContext,
        pass: &mut Pass,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let planned = transitions(&pass.snapshot);
        if planned.is_empty() {
            debug!(reconciler = NAME, "no approval transitions");
        }

        for transition in planned {
            match transition {
                Transition::Clear(node) => {
                    info!(reconciler = NAME, node = %node, "update finished, removing approval");
                    pass.patches.merge_patch(
                        ObjectRef::node(node),
                        json!({"metadata": {"annotations": {APPROVED_ANNOTATION: null}}}),
                    );
                }
                Transition::Approve(node) => {
                    info!(reconciler = NAME, node = %node, "approving master node update");
                    pass.patches.merge_patch(
                        ObjectRef::node(node),
                        json!({"metadata": {"annotations": {
                            APPROVED_ANNOTATION: "",
                            WAITING_FOR_APPROVAL_ANNOTATION: null,
                        }}}),
                    );
                }
            }
        }
        Ok(())
    }
}

/// Registers the approver.
pub fn register(registry: &mut ReconcilerRegistry) {
    registry.register(
        ReconcilerDescriptor::builder(NAME)
            .before_helm(30)
            .subscribe(ResourceKind::Node)
            .subscribe(ResourceKind::Pod)
            .build(UpdateApproval),
    );
}
