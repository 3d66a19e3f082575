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

//! PKI checksum reader.

use async_trait::async_trait;
use tracing::info;

use crate::pass::Pass;
use crate::pki;
use crate::reconcile_context::ReconcileContext;
use crate::reconciler::{CancellationToken, ReconcileError, Reconciler, Result};
use crate::reconciler_descriptor::{ReconcilerDescriptor, ReconcilerRegistry, ResourceKind};
use crate::snapshot::PKI_SECRET;

/// Reconciler name.
pub const NAME: &str = "pki-checksum";

/// Publishes `pkiChecksum` from the PKI secret.
#[derive(Debug, Default)]
pub struct PkiChecksum;

#[async_trait]
impl Reconciler for PkiChecksum {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        pass: &mut Pass,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let data = pass.snapshot.pki.as_ref().ok_or_else(|| {
            ReconcileError::MissingInput(format!(
                "secret {}/{} not found",
                ctx.namespace(),
                PKI_SECRET
            ))
        })?;

        let sum = pki::checksum(data);
        if pass.values.internal().pki_checksum.as_deref() != Some(sum.as_str()) {
            info!(reconciler = NAME, checksum = %sum, "pki checksum changed");
        }
        pass.values.internal_mut().pki_checksum = Some(sum);
        Ok(())
    }
}

/// Registers the checksum reader.
pub fn register(registry: &mut ReconcilerRegistry) {
    registry.register(
        ReconcilerDescriptor::builder(NAME)
            .before_helm(10)
            .subscribe(ResourceKind::Secret)
            .build(PkiChecksum),
    );
}
