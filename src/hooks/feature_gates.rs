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

//! Feature-gate resolver.
//!
//! Splits the user's requested feature gates into per-component lists using a
//! capability table indexed by `MAJOR.MINOR`. Gates that are forbidden,
//! deprecated or unknown at the current version are dropped and reported via
//! the `d8_problematic_feature_gates` gauge.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::metrics::labels;
use crate::pass::Pass;
use crate::reconcile_context::ReconcileContext;
use crate::reconciler::{CancellationToken, Reconciler, Result};
use crate::reconciler_descriptor::{ReconcilerDescriptor, ReconcilerRegistry};
use crate::values::AllowedFeatureGates;
use crate::version::{self, Version};

/// Reconciler name.
pub const NAME: &str = "feature-gates";

/// Gauge reporting dropped or soon-to-be-dropped gates.
pub const PROBLEMATIC_GATES_METRIC: &str = "d8_problematic_feature_gates";

const METRIC_GROUP: &str = "d8_feature_gates";

const BUILTIN_TABLE: &str = r#"
"1.29":
  forbidden: [AllAlpha, AllBeta]
  deprecated: [CSIMigrationvSphere, DefaultHostNetworkHostPortsInPodTemplates, ExpandedDNSConfig]
  apiserver: [APIResponseCompression, ValidatingAdmissionPolicy, StructuredAuthenticationConfiguration, InPlacePodVerticalScaling, SidecarContainers]
  controllerManager: [CronJobsScheduledAnnotation, StatefulSetAutoDeletePVC, InPlacePodVerticalScaling]
  scheduler: [SchedulerQueueingHints, PodSchedulingReadiness]
  kubelet: [InPlacePodVerticalScaling, SidecarContainers, MemoryQoS, KubeletCgroupDriverFromCRI, GracefulNodeShutdown]
"1.30":
  forbidden: [AllAlpha, AllBeta]
  deprecated: [DefaultHostNetworkHostPortsInPodTemplates]
  apiserver: [APIResponseCompression, ValidatingAdmissionPolicy, StructuredAuthenticationConfiguration, InPlacePodVerticalScaling, SidecarContainers]
  controllerManager: [CronJobsScheduledAnnotation, StatefulSetAutoDeletePVC, InPlacePodVerticalScaling]
  scheduler: [SchedulerQueueingHints, PodSchedulingReadiness]
  kubelet: [InPlacePodVerticalScaling, SidecarContainers, MemoryQoS, KubeletCgroupDriverFromCRI, GracefulNodeShutdown]
"1.31":
  forbidden: [AllAlpha, AllBeta]
  deprecated: [ValidatingAdmissionPolicy, PodSchedulingReadiness]
  apiserver: [APIResponseCompression, StructuredAuthenticationConfiguration, InPlacePodVerticalScaling, SidecarContainers]
  controllerManager: [StatefulSetAutoDeletePVC, InPlacePodVerticalScaling]
  scheduler: [SchedulerQueueingHints]
  kubelet: [InPlacePodVerticalScaling, SidecarContainers, MemoryQoS, KubeletCgroupDriverFromCRI, GracefulNodeShutdown]
"1.32":
  forbidden: [AllAlpha, AllBeta]
  deprecated: [StatefulSetAutoDeletePVC]
  apiserver: [APIResponseCompression, StructuredAuthenticationConfiguration, InPlacePodVerticalScaling, SidecarContainers]
  controllerManager: [InPlacePodVerticalScaling]
  scheduler: [SchedulerQueueingHints]
  kubelet: [InPlacePodVerticalScaling, SidecarContainers, MemoryQoS, KubeletCgroupDriverFromCRI, GracefulNodeShutdown]
"1.33":
  forbidden: [AllAlpha, AllBeta]
  deprecated: [SidecarContainers, GracefulNodeShutdown]
  apiserver: [APIResponseCompression, StructuredAuthenticationConfiguration, InPlacePodVerticalScaling]
  controllerManager: [InPlacePodVerticalScaling]
  scheduler: [SchedulerQueueingHints]
  kubelet: [InPlacePodVerticalScaling, MemoryQoS, KubeletCgroupDriverFromCRI]
"#;

/// Gate sets of one `MAJOR.MINOR` release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureGates {
    /// Gates never passed to any component.
    pub forbidden: BTreeSet<String>,
    /// Gates removed in this release.
    pub deprecated: BTreeSet<String>,
    /// Gates kube-apiserver accepts.
    pub apiserver: BTreeSet<String>,
    /// Gates kube-controller-manager accepts.
    pub controller_manager: BTreeSet<String>,
    /// Gates kube-scheduler accepts.
    pub scheduler: BTreeSet<String>,
    /// Gates kubelet accepts.
    pub kubelet: BTreeSet<String>,
}

/// Gate capabilities indexed by `MAJOR.MINOR`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureTable {
    versions: BTreeMap<Version, FeatureGates>,
}

impl FeatureTable {
    /// Parses a YAML mapping of `"MAJOR.MINOR"` to [`FeatureGates`].
    pub fn from_yaml(input: &str) -> std::result::Result<Self, FeatureTableError> {
        let raw: BTreeMap<String, FeatureGates> = serde_yaml::from_str(input)?;
        let mut versions = BTreeMap::new();
        for (key, gates) in raw {
            let version = Version::parse(&key)
                .map_err(|e| FeatureTableError::Version(key.clone(), e))?
                .truncate();
            versions.insert(version, gates);
        }
        Ok(Self { versions })
    }

    /// The table compiled into this release.
    ///
    /// A table that fails to parse is logged and replaced by an empty one.
    pub fn builtin() -> Self {
        match Self::from_yaml(BUILTIN_TABLE) {
            Ok(table) => table,
            Err(e) => {
                error!(error = %e, "built-in feature gate table is invalid");
                Self::default()
            }
        }
    }

    /// Returns the gates of a release, ignoring the patch component.
    pub fn get(&self, version: &Version) -> Option<&FeatureGates> {
        self.versions.get(&version.truncate())
    }

    /// Returns the first release after `version` that deprecates `gate`.
    pub fn deprecated_after(&self, version: &Version, gate: &str) -> Option<Version> {
        self.versions
            .range(version.truncate()..)
            .skip_while(|(v, _)| **v == version.truncate())
            .find(|(_, gates)| gates.deprecated.contains(gate))
            .map(|(v, _)| *v)
    }
}

/// Errors loading a [`FeatureTable`].
#[derive(Debug, thiserror::Error)]
pub enum FeatureTableError {
    /// The document is not valid YAML.
    #[error("invalid feature table: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// A release key is not a version.
    #[error("invalid feature table version {0:?}: {1}")]
    Version(String, version::VersionError),
}

/// Status label of a problematic gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    /// Never allowed.
    Forbidden,
    /// Removed in the current release.
    Deprecated,
    /// Not accepted by any component.
    Unknown,
    /// Accepted now, removed in a later release.
    WillBeDeprecated,
}

impl GateStatus {
    fn as_str(self) -> &'static str {
        match self {
            GateStatus::Forbidden => "forbidden",
            GateStatus::Deprecated => "deprecated",
            GateStatus::Unknown => "unknown",
            GateStatus::WillBeDeprecated => "will_be_deprecated",
        }
    }
}

/// One problematic gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateProblem {
    /// Gate name.
    pub gate: String,
    /// What is wrong with it.
    pub status: GateStatus,
    /// Release that deprecates it, if any.
    pub deprecated_version: Option<Version>,
}

/// Result of resolving the requested gates at one release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Accepted gates per component.
    pub allowed: AllowedFeatureGates,
    /// Gates reported as problematic.
    pub problems: Vec<GateProblem>,
}

/// Resolves `requested` against the table entry of `version`.
///
/// Returns `None` if the table has no entry for `version`.
pub fn resolve(table: &FeatureTable, version: &Version, requested: &[String]) -> Option<Resolution> {
    let gates = table.get(version)?;
    let mut resolution = Resolution::default();

    for gate in requested {
        if gates.forbidden.contains(gate) {
            resolution.problems.push(GateProblem {
                gate: gate.clone(),
                status: GateStatus::Forbidden,
                deprecated_version: None,
            });
            continue;
        }
        if gates.deprecated.contains(gate) {
            resolution.problems.push(GateProblem {
                gate: gate.clone(),
                status: GateStatus::Deprecated,
                deprecated_version: Some(version.truncate()),
            });
            continue;
        }

        let allowed = &mut resolution.allowed;
        let mut accepted = false;
        for (set, out) in [
            (&gates.apiserver, &mut allowed.apiserver),
            (&gates.controller_manager, &mut allowed.kube_controller_manager),
            (&gates.scheduler, &mut allowed.kube_scheduler),
            (&gates.kubelet, &mut allowed.kubelet),
        ] {
            if set.contains(gate) {
                out.push(gate.clone());
                accepted = true;
            }
        }

        if !accepted {
            resolution.problems.push(GateProblem {
                gate: gate.clone(),
                status: GateStatus::Unknown,
                deprecated_version: None,
            });
            continue;
        }

        if let Some(later) = table.deprecated_after(version, gate) {
            resolution.problems.push(GateProblem {
                gate: gate.clone(),
                status: GateStatus::WillBeDeprecated,
                deprecated_version: Some(later),
            });
        }
    }

    Some(resolution)
}

/// Publishes `allowedFeatureGates`.
#[derive(Debug, Default)]
pub struct FeatureGatesReconciler;

#[async_trait]
impl Reconciler for FeatureGatesReconciler {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        pass: &mut Pass,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        pass.metrics.expire(METRIC_GROUP);

        let current = pass
            .values
            .internal()
            .effective_kubernetes_version
            .as_deref()
            .and_then(|v| Version::parse(v).ok())
            .or_else(|| {
                pass.values
                    .desired_kubernetes_version(&ctx.config.default_kubernetes_version)
                    .and_then(|v| v.ok())
            });

        let Some(current) = current else {
            debug!(reconciler = NAME, "kubernetes version unknown, no gates allowed");
            pass.values.internal_mut().allowed_feature_gates = Some(AllowedFeatureGates::default());
            return Ok(());
        };
        let current_label = current.major_minor();

        let requested = &pass.values.control_plane_manager.enabled_feature_gates;
        let Some(resolution) = resolve(&ctx.feature_table, &current, requested) else {
            warn!(reconciler = NAME, version = %current_label, "no feature table for version");
            pass.values.internal_mut().allowed_feature_gates = Some(AllowedFeatureGates::default());
            return Ok(());
        };

        for problem in &resolution.problems {
            warn!(
                reconciler = NAME,
                gate = %problem.gate,
                status = problem.status.as_str(),
                "problematic feature gate"
            );
            let deprecated = problem
                .deprecated_version
                .map(|v| v.major_minor())
                .unwrap_or_default();
            pass.metrics.set_in_group(
                METRIC_GROUP,
                PROBLEMATIC_GATES_METRIC,
                1.0,
                labels([
                    ("feature_gate", problem.gate.as_str()),
                    ("status", problem.status.as_str()),
                    ("deprecated_version", deprecated.as_str()),
                    ("current_version", current_label.as_str()),
                ]),
            );
        }
        if resolution.problems.is_empty() {
            pass.metrics.set_in_group(
                METRIC_GROUP,
                PROBLEMATIC_GATES_METRIC,
                0.0,
                labels([
                    ("feature_gate", ""),
                    ("status", ""),
                    ("deprecated_version", ""),
                    ("current_version", current_label.as_str()),
                ]),
            );
        }

        pass.values.internal_mut().allowed_feature_gates = Some(resolution.allowed);
        Ok(())
    }
}

/// Registers the feature-gate resolver.
pub fn register(registry: &mut ReconcilerRegistry) {
    registry.register(
        ReconcilerDescriptor::builder(NAME)
            .before_helm(5)
            .build(FeatureGatesReconciler),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::testing;
    use crate::metrics::{MetricOperation, MetricStorage};
    use crate::snapshot::ClusterSnapshot;
    use crate::values::Values;
    use std::sync::Arc;

    const TABLE: &str = r#"
"1.29":
  forbidden: [AllAlpha]
  deprecated: [OldGate]
  apiserver: [Shared, ApiOnly, Sunset]
  controllerManager: [Shared]
  kubelet: [Shared, KubeletOnly]
"1.30":
  forbidden: [AllAlpha]
  apiserver: [Shared, ApiOnly]
  controllerManager: [Shared]
"1.31":
  deprecated: [Sunset]
"#;

    fn gates(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_partitions_and_drops() {
        let table = FeatureTable::from_yaml(TABLE).unwrap();
        let v = Version::new(1, 29, 4);
        let resolution = resolve(
            &table,
            &v,
            &gates(&["Shared", "AllAlpha", "OldGate", "Nope", "Sunset", "KubeletOnly"]),
        )
        .unwrap();

        assert_eq!(resolution.allowed.apiserver, gates(&["Shared", "Sunset"]));
        assert_eq!(resolution.allowed.kube_controller_manager, gates(&["Shared"]));
        assert!(resolution.allowed.kube_scheduler.is_empty());
        assert_eq!(resolution.allowed.kubelet, gates(&["Shared", "KubeletOnly"]));

        let statuses: Vec<_> = resolution
            .problems
            .iter()
            .map(|p| (p.gate.as_str(), p.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("AllAlpha", GateStatus::Forbidden),
                ("OldGate", GateStatus::Deprecated),
                ("Nope", GateStatus::Unknown),
                ("Sunset", GateStatus::WillBeDeprecated),
            ]
        );
        assert_eq!(resolution.problems[3].deprecated_version, Some(Version::new(1, 31, 0)));
    }

    #[test]
    fn test_dropped_gates_never_accepted() {
        let table = FeatureTable::from_yaml(TABLE).unwrap();
        let resolution = resolve(
            &table,
            &Version::new(1, 29, 0),
            &gates(&["AllAlpha", "OldGate"]),
        )
        .unwrap();
        assert_eq!(resolution.allowed, AllowedFeatureGates::default());
    }

    #[test]
    fn test_unknown_version() {
        let table = FeatureTable::from_yaml(TABLE).unwrap();
        assert!(resolve(&table, &Version::new(1, 40, 0), &gates(&["Shared"])).is_none());
    }

    #[test]
    fn test_builtin_table_parses() {
        let table = FeatureTable::from_yaml(BUILTIN_TABLE).unwrap();
        assert!(table.get(&Version::new(1, 29, 0)).is_some());
        assert_eq!(table, FeatureTable::builtin());
    }

    #[tokio::test]
    async fn test_reconciler_emits_zero_sample_when_clean() {
        let cluster = Arc::new(crate::fake::FakeCluster::new());
        let ctx = testing::context(cluster, crate::fake::FakeEtcd::new())
            .with_feature_table(FeatureTable::from_yaml(TABLE).unwrap());
        let mut values = Values::default();
        values.internal_mut().effective_kubernetes_version = Some("1.30".into());
        values.control_plane_manager.enabled_feature_gates = gates(&["Shared"]);
        let mut pass = testing::pass(ClusterSnapshot::default(), values);

        FeatureGatesReconciler
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap();

        let allowed = pass.values.internal().allowed_feature_gates.clone().unwrap();
        assert_eq!(allowed.apiserver, gates(&["Shared"]));

        let storage = MetricStorage::new();
        let ops = pass.metrics.take();
        assert!(matches!(ops[0], MetricOperation::Expire { .. }));
        storage.apply(ops);
        assert_eq!(
            storage.get(
                PROBLEMATIC_GATES_METRIC,
                &labels([
                    ("feature_gate", ""),
                    ("status", ""),
                    ("deprecated_version", ""),
                    ("current_version", "1.30"),
                ])
            ),
            Some(0.0)
        );
    }

    #[tokio::test]
    async fn test_reconciler_falls_back_to_desired_version() {
        let cluster = Arc::new(crate::fake::FakeCluster::new());
        let ctx = testing::context(cluster, crate::fake::FakeEtcd::new())
            .with_feature_table(FeatureTable::from_yaml(TABLE).unwrap());
        let mut values = Values::default();
        values.global.cluster_configuration.kubernetes_version = Some("1.29".into());
        values.control_plane_manager.enabled_feature_gates = gates(&["AllAlpha"]);
        let mut pass = testing::pass(ClusterSnapshot::default(), values);

        FeatureGatesReconciler
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            pass.values.internal().allowed_feature_gates,
            Some(AllowedFeatureGates::default())
        );
        let storage = MetricStorage::new();
        storage.apply(pass.metrics.take());
        assert!(storage.render().unwrap().contains("status=\"forbidden\""));
    }
}
