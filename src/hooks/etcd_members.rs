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

//! etcd membership reconciler.
//!
//! Publishes the client endpoints of every etcd-capable node and removes
//! members that no longer map to such a node. Members listed as external and
//! members that have not started yet are kept. The reconciler refuses to
//! remove every member at once.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::etcd::{EtcdEndpoint, EtcdMember};
use crate::hooks::connect_etcd;
use crate::pass::Pass;
use crate::reconcile_context::ReconcileContext;
use crate::reconciler::{cancellable, CancellationToken, ReconcileError, Reconciler, Result};
use crate::reconciler_descriptor::{ReconcilerDescriptor, ReconcilerRegistry, ResourceKind, Schedule};
use crate::snapshot::ClusterSnapshot;

/// Reconciler name.
pub const NAME: &str = "etcd-members";

/// Client endpoints of masters, etcd-only and arbiter nodes, sorted.
pub fn client_endpoints(snapshot: &ClusterSnapshot) -> Vec<EtcdEndpoint> {
    let masters = snapshot.masters.iter().filter_map(|m| m.address());
    let others = snapshot
        .etcd_only_nodes
        .iter()
        .chain(&snapshot.arbiter_nodes)
        .filter_map(|n| n.address.as_deref());
    masters
        .chain(others)
        .map(EtcdEndpoint::for_ip)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Names of nodes allowed to host an etcd member.
pub fn known_member_names(snapshot: &ClusterSnapshot) -> BTreeSet<&str> {
    snapshot
        .masters
        .iter()
        .map(|m| m.name.as_str())
        .chain(snapshot.etcd_only_nodes.iter().map(|n| n.name.as_str()))
        .chain(snapshot.arbiter_nodes.iter().map(|n| n.name.as_str()))
        .collect()
}

/// Members to remove, or an error if that would be every member.
pub fn members_to_remove<'a>(
    members: &'a [EtcdMember],
    known: &BTreeSet<&str>,
    external: &[String],
) -> Result<Vec<&'a EtcdMember>> {
    let to_remove: Vec<&EtcdMember> = members
        .iter()
        .filter(|m| {
            !m.name.is_empty()
                && !external.iter().any(|e| e == &m.name)
                && !known.contains(m.name.as_str())
        })
        .collect();

    if !members.is_empty() && to_remove.len() == members.len() {
        return Err(ReconcileError::Invariant(format!(
            "every etcd member ({}) would be removed",
            members
                .iter()
                .map(|m| m.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }
    Ok(to_remove)
}

/// Keeps etcd membership aligned with the observed nodes.
#[derive(Debug, Default)]
pub struct EtcdMembers;

#[async_trait]
impl Reconciler for EtcdMembers {
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
        let endpoints = client_endpoints(&snapshot);
        pass.values.internal_mut().etcd_servers =
            Some(endpoints.iter().map(|e| e.to_string()).collect());

        if endpoints.is_empty() {
            debug!(reconciler = NAME, "no etcd nodes observed");
            return Ok(());
        }

        let client = connect_etcd(ctx, pass, &endpoints, cancel).await?;
        let members = cancellable(cancel, async { Ok(client.member_list().await?) }).await?;

        let known = known_member_names(&snapshot);
        let external = &pass.values.control_plane_manager.etcd.external_members_names;
        let to_remove = members_to_remove(&members, &known, external)?;

        if to_remove.is_empty() {
            debug!(reconciler = NAME, members = members.len(), "etcd membership in sync");
            return Ok(());
        }

        for member in to_remove {
            info!(
                reconciler = NAME,
                member = %member.name,
                id = format_args!("{:x}", member.id),
                "removing etcd member"
            );
            cancellable(cancel, async { Ok(client.member_remove(member.id).await?) }).await?;
        }
        Ok(())
    }
}

/// Registers the membership reconciler.
pub fn register(registry: &mut ReconcilerRegistry) {
    registry.register(
        ReconcilerDescriptor::builder(NAME)
            .before_helm(20)
            .subscribe(ResourceKind::Node)
            .schedule(Schedule::every(NAME, Duration::from_secs(5 * 60)))
            .build(EtcdMembers),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etcd::{EtcdError, MockEtcdClient};
    use crate::fake::{self, FakeCluster, FakeEtcd};
    use crate::hooks::testing;
    use crate::snapshot::ETCD_ONLY_NODE_LABEL;
    use crate::values::Values;
    use std::sync::Arc;

    fn member(id: u64, name: &str) -> EtcdMember {
        EtcdMember {
            id,
            name: name.to_string(),
            peer_urls: vec![],
        }
    }

    fn snapshot_with_pki() -> ClusterSnapshot {
        let mut snapshot = ClusterSnapshot::from_nodes(&[
            fake::node("m-0", "1.1.1.1", "v1.29.1").master().build(),
            fake::node("m-1", "1.1.1.2", "v1.29.1").master().build(),
        ]);
        snapshot.pki = Some(testing::pki_data());
        snapshot
    }

    #[test]
    fn test_endpoints_include_etcd_only_nodes() {
        let snapshot = ClusterSnapshot::from_nodes(&[
            fake::node("m-1", "10.0.0.2", "v1.29.1").master().build(),
            fake::node("m-0", "10.0.0.1", "v1.29.1").master().build(),
            fake::node("e-0", "10.0.0.7", "v1.29.1").label(ETCD_ONLY_NODE_LABEL).build(),
        ]);
        let endpoints: Vec<_> = client_endpoints(&snapshot)
            .into_iter()
            .map(|e| e.to_string())
            .collect();
        assert_eq!(
            endpoints,
            vec![
                "https://10.0.0.1:2379",
                "https://10.0.0.2:2379",
                "https://10.0.0.7:2379"
            ]
        );
        assert!(known_member_names(&snapshot).contains("e-0"));
    }

    #[test]
    fn test_members_to_remove_respects_external_and_unstarted() {
        let members = vec![member(1, "m-0"), member(2, ""), member(3, "ext"), member(4, "gone")];
        let known: BTreeSet<&str> = ["m-0"].into_iter().collect();
        let removed = members_to_remove(&members, &known, &["ext".to_string()]).unwrap();
        assert_eq!(removed.iter().map(|m| m.id).collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn test_refuses_to_remove_every_member() {
        let members = vec![member(1, "a"), member(2, "b")];
        let known: BTreeSet<&str> = ["m-0"].into_iter().collect();
        let err = members_to_remove(&members, &known, &[]).unwrap_err();
        assert!(matches!(err, ReconcileError::Invariant(_)));
    }

    #[tokio::test]
    async fn test_removes_stale_member_with_mock() {
        let mut client = MockEtcdClient::new();
        client
            .expect_member_list()
            .times(1)
            .returning(|| Ok(vec![member(1, "m-0"), member(2, "m-1"), member(3, "m-2")]));
        client
            .expect_member_remove()
            .withf(|id| *id == 3)
            .times(1)
            .returning(|_| Ok(()));

        let ctx = testing::context_with_client(Arc::new(FakeCluster::new()), client);
        let mut pass = testing::pass(snapshot_with_pki(), Values::default());
        EtcdMembers
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            pass.values.internal().etcd_servers,
            Some(vec![
                "https://1.1.1.1:2379".to_string(),
                "https://1.1.1.2:2379".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn test_guard_issues_no_removal() {
        let mut client = MockEtcdClient::new();
        client
            .expect_member_list()
            .returning(|| Ok(vec![member(7, "x-0"), member(8, "x-1")]));
        client.expect_member_remove().never();

        let ctx = testing::context_with_client(Arc::new(FakeCluster::new()), client);
        let mut pass = testing::pass(snapshot_with_pki(), Values::default());
        let err = EtcdMembers
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Invariant(_)));
    }

    #[tokio::test]
    async fn test_list_failure_is_etcd_error() {
        let mut client = MockEtcdClient::new();
        client
            .expect_member_list()
            .returning(|| Err(EtcdError::request("member list", "unavailable")));

        let ctx = testing::context_with_client(Arc::new(FakeCluster::new()), client);
        let mut pass = testing::pass(snapshot_with_pki(), Values::default());
        let err = EtcdMembers
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Etcd(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_pki_is_missing_input() {
        let snapshot = ClusterSnapshot::from_nodes(&[fake::node("m-0", "1.1.1.1", "v1.29.1")
            .master()
            .build()]);
        let ctx = testing::context(Arc::new(FakeCluster::new()), FakeEtcd::new());
        let mut pass = testing::pass(snapshot, Values::default());
        let err = EtcdMembers
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MissingInput(_)));
    }
}
