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

//! etcd peer URL corrector for single-master clusters.
//!
//! A freshly bootstrapped etcd advertises `https://localhost:2380`. Once the
//! pod listens on the node address, the sole member is updated to match.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::hooks::connect_etcd;
use crate::pass::Pass;
use crate::reconcile_context::ReconcileContext;
use crate::reconciler::{cancellable, CancellationToken, Reconciler, Result};
use crate::reconciler_descriptor::{ReconcilerDescriptor, ReconcilerRegistry, ResourceKind};
use crate::snapshot::EtcdPod;

/// Reconciler name.
pub const NAME: &str = "etcd-peer-url";

/// Rewrites the peer URL of the only etcd member.
#[derive(Debug, Default)]
pub struct EtcdPeerUrl;

fn single_running_pod(pods: &[EtcdPod]) -> Option<&EtcdPod> {
    let mut running = pods.iter().filter(|p| p.running);
    match (running.next(), running.next()) {
        (Some(pod), None) => Some(pod),
        _ => None,
    }
}

#[async_trait]
impl Reconciler for EtcdPeerUrl {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        pass: &mut Pass,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let snapshot = pass.snapshot.clone();
        let masters = snapshot.master_count(pass.values.global.discovery.cluster_master_count);
        if masters != 1 {
            debug!(reconciler = NAME, masters, "not a single-master cluster");
            return Ok(());
        }

        let Some(pod) = single_running_pod(&snapshot.etcd_pods) else {
            debug!(reconciler = NAME, "no single running etcd pod");
            return Ok(());
        };
        let (Some(peer_url), Some(endpoint)) = (pod.listen_peer_urls.as_deref(), pod.endpoint())
        else {
            debug!(reconciler = NAME, pod = %pod.name, "etcd pod has no peer url or address");
            return Ok(());
        };

        let client = connect_etcd(ctx, pass, std::slice::from_ref(&endpoint), cancel).await?;
        let members = cancellable(cancel, async { Ok(client.member_list().await?) }).await?;
        let [member] = members.as_slice() else {
            debug!(reconciler = NAME, members = members.len(), "expected exactly one etcd member");
            return Ok(());
        };

        if member.peer_urls.iter().any(|u| u == peer_url) {
            return Ok(());
        }

        info!(
            reconciler = NAME,
            member = %member.name,
            from = ?member.peer_urls,
            to = peer_url,
            "updating etcd member peer url"
        );
        cancellable(cancel, async {
            Ok(client.member_update(member.id, vec![peer_url.to_string()]).await?)
        })
        .await
    }
}

/// Registers the peer URL corrector.
pub fn register(registry: &mut ReconcilerRegistry) {
    registry.register(
        ReconcilerDescriptor::builder(NAME)
            .before_helm(20)
            .subscribe(ResourceKind::Pod)
            .build(EtcdPeerUrl),
    );
}
