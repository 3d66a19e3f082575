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

//! Removes the ConfigMap kubeadm leaves behind after bootstrap.

use async_trait::async_trait;
use tracing::info;

use crate::pass::Pass;
use crate::patch::ObjectRef;
use crate::reconcile_context::ReconcileContext;
use crate::reconciler::{CancellationToken, Reconciler, Result};
use crate::reconciler_descriptor::{ReconcilerDescriptor, ReconcilerRegistry};
use crate::snapshot::KUBEADM_CONFIG_MAP;

/// Reconciler name.
pub const NAME: &str = "kubeadm-config-cleanup";

/// Startup one-shot deleting `kubeadm-config`.
#[derive(Debug, Default)]
pub struct KubeadmConfigCleanup;

#[async_trait]
impl Reconciler for KubeadmConfigCleanup {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        pass: &mut Pass,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        if !pass.snapshot.kubeadm_config_exists {
            return Ok(());
        }
        info!(reconciler = NAME, namespace = ctx.namespace(), "deleting {}", KUBEADM_CONFIG_MAP);
        pass.patches
            .delete(ObjectRef::config_map(ctx.namespace(), KUBEADM_CONFIG_MAP));
        Ok(())
    }
}

/// Registers the cleanup on startup.
pub fn register(registry: &mut ReconcilerRegistry) {
    registry.register(
        ReconcilerDescriptor::builder(NAME)
            .on_startup(10)
            .build(KubeadmConfigCleanup),
    );
}
