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

//! Effective Kubernetes version resolver.
//!
//! The control plane announces the version it should run from three inputs:
//! the desired version, the versions declared by running control-plane pods
//! and the kubelet versions of all nodes. A minor upgrade is taken only once
//! every node caught up, and a downgrade never skips more than one minor.
//!
//! The highest version ever announced is persisted as a watermark in the
//! cluster-configuration secret together with the platform default version.
//! Both values only grow.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::metrics::labels;
use crate::pass::Pass;
use crate::patch::ObjectRef;
use crate::reconcile_context::ReconcileContext;
use crate::reconciler::{cancellable, CancellationToken, ReconcileError, Reconciler, Result};
use crate::reconciler_descriptor::{ReconcilerDescriptor, ReconcilerRegistry, ResourceKind};
use crate::requirements::MIN_USED_CONTROL_PLANE_VERSION_KEY;
use crate::snapshot::{ClusterSnapshot, CLUSTER_CONFIGURATION_SECRET};
use crate::version::{min_max, Version};

/// Reconciler name.
pub const NAME: &str = "effective-kubernetes-version";

/// Secret key of the announced-version watermark.
pub const MAX_USED_VERSION_KEY: &str = "maxUsedControlPlaneKubernetesVersion";

/// Secret key of the persisted platform default version.
pub const DECKHOUSE_DEFAULT_VERSION_KEY: &str = "deckhouseDefaultKubernetesVersion";

/// Gauge carrying the announced version as a label.
pub const VERSION_METRIC: &str = "d8_kubernetes_version";

const METRIC_GROUP: &str = "kubernetes_version";

/// Versions persisted in the cluster-configuration secret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistedVersions {
    /// Highest version ever announced.
    pub max_used: Option<Version>,
    /// Platform default version at the time of the last update.
    pub deckhouse_default: Option<Version>,
}

impl PersistedVersions {
    /// Reads both keys from secret data. Absent keys stay `None`.
    pub fn from_data(data: &BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let read = |key: &str| -> Result<Option<Version>> {
            let Some(raw) = data.get(key) else {
                return Ok(None);
            };
            let raw = std::str::from_utf8(raw).map_err(|_| {
                ReconcileError::MalformedState(format!("{}: {} is not UTF-8", CLUSTER_CONFIGURATION_SECRET, key))
            })?;
            Version::parse(raw).map(Some).map_err(|e| {
                ReconcileError::MalformedState(format!("{}: {}: {}", CLUSTER_CONFIGURATION_SECRET, key, e))
            })
        };
        Ok(Self {
            max_used: read(MAX_USED_VERSION_KEY)?,
            deckhouse_default: read(DECKHOUSE_DEFAULT_VERSION_KEY)?,
        })
    }
}

/// Observed version ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observed {
    /// Lowest and highest kubelet versions.
    pub nodes: (Version, Version),
    /// Lowest and highest control-plane versions.
    pub control_plane: (Version, Version),
}

/// Chooses the version the control plane should announce.
pub fn resolve(desired: Version, observed: Observed, max_used: Version) -> Version {
    let (min_node, max_node) = observed.nodes;
    let (min_cp, max_cp) = observed.control_plane;

    if desired > max_node {
        if min_node < min_cp {
            min_cp
        } else {
            min_cp.inc_minor()
        }
    } else if desired < max_node {
        if max_node < max_cp && max_cp == max_used {
            max_cp.dec_minor()
        } else {
            max_cp
        }
    } else {
        desired
    }
}

/// Kubelet version range of every node, skipping unparseable versions.
pub fn node_versions(snapshot: &ClusterSnapshot) -> Option<(Version, Version)> {
    min_max(snapshot.node_versions.iter().filter_map(|n| {
        match Version::parse(&n.kubelet_version) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(reconciler = NAME, node = %n.name, error = %e, "skipping node with unparseable kubelet version");
                None
            }
        }
    }))
}

/// Versions declared by control-plane pods, and whether an apiserver is among them.
fn declared_versions(snapshot: &ClusterSnapshot) -> Result<(Vec<Version>, bool)> {
    let mut versions = Vec::new();
    let mut apiserver = false;
    for pod in &snapshot.control_plane_pods {
        let Some(raw) = pod.declared_version.as_deref() else {
            continue;
        };
        let version = Version::parse(raw).map_err(|e| {
            ReconcileError::MalformedState(format!("control-plane pod {}: {}", pod.name, e))
        })?;
        apiserver |= pod.name.contains("kube-apiserver");
        versions.push(version);
    }
    Ok((versions, apiserver))
}

/// The watermark patch, or `None` when nothing changes.
pub fn watermark_patch(
    effective: Version,
    max_used: Version,
    stored: PersistedVersions,
    platform_default: Version,
) -> Option<Value> {
    let mut data = Map::new();

    let stored_max = stored.max_used.map(|v| v.truncate());
    if effective >= max_used && stored_max != Some(effective.truncate()) {
        data.insert(
            MAX_USED_VERSION_KEY.to_string(),
            Value::String(STANDARD.encode(effective.major_minor())),
        );
    }

    if stored.deckhouse_default.map_or(true, |d| platform_default > d) {
        data.insert(
            DECKHOUSE_DEFAULT_VERSION_KEY.to_string(),
            Value::String(STANDARD.encode(platform_default.major_minor())),
        );
    }

    (!data.is_empty()).then(|| json!({ "data": data }))
}

async fn drop_kube_caches(ctx: &ReconcileContext) {
    for dir in &ctx.config.kube_cache_dirs {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => info!(reconciler = NAME, dir = %dir.display(), "removed kubectl cache"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(reconciler = NAME, dir = %dir.display(), error = %e, "cannot remove kubectl cache")
            }
        }
    }
}

/// Publishes `effectiveKubernetesVersion` and maintains the watermark.
#[derive(Debug, Default)]
pub struct EffectiveVersion;

#[async_trait]
impl Reconciler for EffectiveVersion {
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
        let previous = pass.values.internal().effective_kubernetes_version.clone();

        let desired = match pass
            .values
            .desired_kubernetes_version(&ctx.config.default_kubernetes_version)
        {
            None => {
                return Err(ReconcileError::MissingInput(
                    "global.clusterConfiguration.kubernetesVersion is not set".to_string(),
                ))
            }
            Some(Err(e)) => {
                return Err(ReconcileError::MissingInput(format!(
                    "global.clusterConfiguration.kubernetesVersion: {}",
                    e
                )))
            }
            Some(Ok(v)) => v,
        };

        let (mut declared, apiserver) = declared_versions(&snapshot)?;
        if !apiserver {
            warn!(
                reconciler = NAME,
                "managed control-plane pods are not deployed yet, using the server version"
            );
            let server = cancellable(cancel, async { Ok(ctx.cluster.server_version().await?) }).await?;
            declared = vec![server.truncate()];
        }
        let control_plane = min_max(declared).ok_or_else(|| {
            ReconcileError::MissingInput("no control-plane versions observed".to_string())
        })?;

        let nodes = node_versions(&snapshot)
            .ok_or_else(|| ReconcileError::MissingInput("no Nodes with a kubelet version".to_string()))?;

        let stored = match snapshot.cluster_configuration.as_ref() {
            Some(data) => PersistedVersions::from_data(data)?,
            None => {
                warn!(
                    reconciler = NAME,
                    secret = CLUSTER_CONFIGURATION_SECRET,
                    "cluster-configuration secret not found, no versions persisted"
                );
                PersistedVersions::default()
            }
        };
        let max_used = stored.max_used.unwrap_or_else(|| {
            warn!(reconciler = NAME, "no version watermark persisted, using the desired version");
            desired
        });

        let platform_default = Version::parse(&ctx.config.default_kubernetes_version).map_err(|e| {
            ReconcileError::MissingInput(format!("default kubernetes version: {}", e))
        })?;

        let effective = resolve(desired, Observed { nodes, control_plane }, max_used);
        let published = effective.major_minor();
        debug!(
            reconciler = NAME,
            desired = %desired,
            min_node = %nodes.0,
            max_node = %nodes.1,
            min_control_plane = %control_plane.0,
            max_control_plane = %control_plane.1,
            max_used = %max_used,
            effective = %published,
            "resolved effective kubernetes version"
        );

        ctx.requirements
            .save_value(MIN_USED_CONTROL_PLANE_VERSION_KEY, nodes.0.to_string());

        pass.metrics.expire(METRIC_GROUP);
        pass.metrics.set_in_group(
            METRIC_GROUP,
            VERSION_METRIC,
            1.0,
            labels([("k8s_version", published.as_str())]),
        );

        if let Some(patch) = watermark_patch(effective, max_used, stored, platform_default) {
            info!(reconciler = NAME, effective = %published, "updating persisted kubernetes versions");
            pass.patches.merge_patch(
                ObjectRef::secret(ctx.namespace(), CLUSTER_CONFIGURATION_SECRET),
                patch,
            );
        }

        if let Some(previous) = previous.filter(|p| !p.is_empty() && *p != published) {
            info!(reconciler = NAME, from = %previous, to = %published, "effective kubernetes version changed");
            drop_kube_caches(ctx).await;
        }

        pass.values.internal_mut().effective_kubernetes_version = Some(published);
        Ok(())
    }
}

/// Registers the version resolver.
pub fn register(registry: &mut ReconcilerRegistry) {
    registry.register(
        ReconcilerDescriptor::builder(NAME)
            .before_helm(50)
            .subscribe(ResourceKind::Node)
            .subscribe(ResourceKind::Pod)
            .subscribe(ResourceKind::Secret)
            .build(EffectiveVersion),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HooksConfig;
    use crate::fake::{self, FakeCluster, FakeEtcd};
    use crate::hooks::testing;
    use crate::metrics::{MetricStorage, MetricOperation};
    use crate::patch::PatchOperation;
    use crate::snapshot::control_plane_pod;
    use crate::values::Values;
    use std::sync::Arc;

    fn v(raw: &str) -> Version {
        Version::parse(raw).unwrap()
    }

    fn observed(nodes: &[&str], control_plane: &[&str]) -> Observed {
        Observed {
            nodes: min_max(nodes.iter().map(|n| v(n))).unwrap(),
            control_plane: min_max(control_plane.iter().map(|c| v(c))).unwrap(),
        }
    }

    #[test]
    fn test_resolve_decision_table() {
        // Nodes lag behind: stay on the control-plane version.
        assert_eq!(
            resolve(
                v("1.16"),
                observed(&["1.14.3", "1.14.1", "1.14.5", "1.15.2"], &["1.15", "1.15", "1.15"]),
                v("1.15")
            ),
            v("1.15")
        );
        // Nodes caught up: bump one minor.
        assert_eq!(
            resolve(v("1.16"), observed(&["1.15.1", "1.15.4"], &["1.15", "1.15"]), v("1.15")),
            v("1.16")
        );
        // Downgrade with the control plane ahead of nodes at the watermark.
        assert_eq!(
            resolve(v("1.13"), observed(&["1.14.2"], &["1.15.3"]), v("1.15.3")),
            Version::new(1, 14, 3)
        );
        // Watermark above the control plane: keep it.
        assert_eq!(
            resolve(v("1.13"), observed(&["1.14.2"], &["1.15"]), v("1.17")),
            v("1.15")
        );
        // Desired equals the newest node.
        assert_eq!(
            resolve(v("1.15.2"), observed(&["1.15.2"], &["1.14"]), v("1.15")),
            v("1.15.2")
        );
    }

    #[test]
    fn test_watermark_patch_is_monotonic_and_idempotent() {
        let stored = PersistedVersions {
            max_used: Some(v("1.15")),
            deckhouse_default: Some(v("1.29")),
        };
        assert_eq!(watermark_patch(v("1.15"), v("1.15"), stored, v("1.29")), None);
        assert_eq!(watermark_patch(v("1.14"), v("1.15"), stored, v("1.29")), None);
        assert_eq!(
            watermark_patch(v("1.16"), v("1.15"), stored, v("1.29")),
            Some(json!({"data": {MAX_USED_VERSION_KEY: STANDARD.encode("1.16")}}))
        );
        assert_eq!(
            watermark_patch(v("1.15"), v("1.15"), stored, v("1.30")),
            Some(json!({"data": {DECKHOUSE_DEFAULT_VERSION_KEY: STANDARD.encode("1.30")}}))
        );
        assert_eq!(
            watermark_patch(v("1.15"), v("1.15"), PersistedVersions::default(), v("1.29")),
            Some(json!({"data": {
                MAX_USED_VERSION_KEY: STANDARD.encode("1.15"),
                DECKHOUSE_DEFAULT_VERSION_KEY: STANDARD.encode("1.29"),
            }}))
        );
    }

    #[test]
    fn test_persisted_versions_parsing() {
        let mut data = BTreeMap::new();
        data.insert(MAX_USED_VERSION_KEY.to_string(), b"1.15".to_vec());
        let parsed = PersistedVersions::from_data(&data).unwrap();
        assert_eq!(parsed.max_used, Some(v("1.15.0")));
        assert_eq!(parsed.deckhouse_default, None);

        data.insert(DECKHOUSE_DEFAULT_VERSION_KEY.to_string(), b"one.two".to_vec());
        assert!(matches!(
            PersistedVersions::from_data(&data),
            Err(ReconcileError::MalformedState(_))
        ));
    }

    fn snapshot(nodes: &[&str], control_plane: &[&str], max_used: Option<&str>) -> ClusterSnapshot {
        let nodes: Vec<_> = nodes
            .iter()
            .enumerate()
            .map(|(i, version)| {
                fake::node(&format!("n-{}", i), &format!("10.0.0.{}", i + 1), version).build()
            })
            .collect();
        let mut snapshot = ClusterSnapshot::from_nodes(&nodes);
        snapshot.control_plane_pods = control_plane
            .iter()
            .enumerate()
            .map(|(i, version)| {
                control_plane_pod(&fake::control_plane_pod("kube-apiserver", &format!("m-{}", i), version))
                    .unwrap()
            })
            .collect();
        let mut data = BTreeMap::new();
        data.insert(DECKHOUSE_DEFAULT_VERSION_KEY.to_string(), b"1.29".to_vec());
        if let Some(max_used) = max_used {
            data.insert(MAX_USED_VERSION_KEY.to_string(), max_used.as_bytes().to_vec());
        }
        snapshot.cluster_configuration = Some(data);
        snapshot
    }

    fn values(desired: &str) -> Values {
        let mut values = Values::default();
        values.global.cluster_configuration.kubernetes_version = Some(desired.to_string());
        values
    }

    #[tokio::test]
    async fn test_upgrade_accepted_publishes_and_persists() {
        let ctx = testing::context(Arc::new(FakeCluster::new()), FakeEtcd::new());
        let mut pass = testing::pass(
            snapshot(&["v1.15.3", "v1.15.1"], &["1.15", "1.15"], Some("1.15")),
            values("1.16"),
        );
        EffectiveVersion
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            pass.values.internal().effective_kubernetes_version.as_deref(),
            Some("1.16")
        );
        assert_eq!(
            pass.patches.operations(),
            &[PatchOperation::MergePatch {
                target: ObjectRef::secret("kube-system", CLUSTER_CONFIGURATION_SECRET),
                patch: json!({"data": {MAX_USED_VERSION_KEY: STANDARD.encode("1.16")}}),
            }]
        );
        assert_eq!(
            ctx.requirements.get_value(MIN_USED_CONTROL_PLANE_VERSION_KEY).as_deref(),
            Some("1.15.1")
        );

        let ops = pass.metrics.take();
        assert!(matches!(ops[0], MetricOperation::Expire { .. }));
        let storage = MetricStorage::new();
        storage.apply(ops);
        assert_eq!(
            storage.get(VERSION_METRIC, &labels([("k8s_version", "1.16")])),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_falls_back_to_server_version() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.set_server_version(Version::new(1, 28, 7));
        let ctx = testing::context(cluster, FakeEtcd::new());
        let mut pass = testing::pass(snapshot(&["v1.28.4"], &[], None), values("1.29"));
        EffectiveVersion
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            pass.values.internal().effective_kubernetes_version.as_deref(),
            Some("1.29")
        );
    }

    #[tokio::test]
    async fn test_missing_inputs() {
        let ctx = testing::context(Arc::new(FakeCluster::new()), FakeEtcd::new());

        let mut pass = testing::pass(snapshot(&["v1.29.1"], &["1.29"], None), Values::default());
        let err = EffectiveVersion
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MissingInput(_)));

        let mut pass = testing::pass(snapshot(&[], &["1.29"], None), values("1.29"));
        let err = EffectiveVersion
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MissingInput(ref m) if m.contains("Nodes")));
    }

    #[tokio::test]
    async fn test_absent_cluster_configuration_falls_back_to_desired() {
        let ctx = testing::context(Arc::new(FakeCluster::new()), FakeEtcd::new());
        let mut without_secret = snapshot(&["v1.29.1"], &["1.29"], None);
        without_secret.cluster_configuration = None;
        let mut pass = testing::pass(without_secret, values("1.29"));
        EffectiveVersion
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            pass.values.internal().effective_kubernetes_version.as_deref(),
            Some("1.29")
        );
        assert_eq!(
            pass.patches.operations(),
            &[PatchOperation::MergePatch {
                target: ObjectRef::secret("kube-system", CLUSTER_CONFIGURATION_SECRET),
                patch: json!({"data": {
                    MAX_USED_VERSION_KEY: STANDARD.encode("1.29"),
                    DECKHOUSE_DEFAULT_VERSION_KEY: STANDARD.encode(HooksConfig::default().default_kubernetes_version),
                }}),
            }]
        );
    }

    #[tokio::test]
    async fn test_automatic_uses_default_version() {
        let ctx = testing::context(Arc::new(FakeCluster::new()), FakeEtcd::new());
        let mut pass = testing::pass(
            snapshot(&["v1.29.2"], &["1.29"], Some("1.29")),
            values(crate::values::AUTOMATIC_VERSION),
        );
        EffectiveVersion
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            pass.values.internal().effective_kubernetes_version.as_deref(),
            Some("1.29")
        );
        assert!(pass.patches.is_empty());
    }

    #[tokio::test]
    async fn test_version_change_drops_kube_caches() {
        let dir = std::env::temp_dir().join(format!("kube-cache-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("discovery")).unwrap();

        let config = HooksConfig {
            kube_cache_dirs: vec![dir.clone(), dir.join("missing")],
            ..Default::default()
        };
        let ctx = crate::reconcile_context::ReconcileContext::new(
            Arc::new(FakeCluster::new()),
            Arc::new(FakeEtcd::new()),
            Arc::new(config),
        );

        let mut unchanged = values("1.29");
        unchanged.internal_mut().effective_kubernetes_version = Some("1.29".to_string());
        let mut pass = testing::pass(snapshot(&["v1.29.2"], &["1.29"], Some("1.29")), unchanged);
        EffectiveVersion
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap();
        assert!(dir.exists());

        let mut changed = values("1.29");
        changed.internal_mut().effective_kubernetes_version = Some("1.28".to_string());
        let mut pass = testing::pass(snapshot(&["v1.29.2"], &["1.29"], Some("1.29")), changed);
        EffectiveVersion
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!dir.exists());
    }
}
