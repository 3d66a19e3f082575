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

//! The module values document.
//!
//! Inputs come from the cluster configuration and the module config; outputs
//! live under `controlPlaneManager.internal` and are recomputed every pass.

use serde::{Deserialize, Serialize};

use crate::version::{Version, VersionError};

/// Desired version placeholder that resolves to the platform default.
pub const AUTOMATIC_VERSION: &str = "Automatic";

/// Root of the values document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Values {
    /// Cluster-wide values.
    #[serde(default)]
    pub global: GlobalValues,

    /// Values of the control-plane-manager module.
    #[serde(default)]
    pub control_plane_manager: ControlPlaneManagerValues,
}

/// `global.*`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalValues {
    /// `global.clusterConfiguration`
    #[serde(default)]
    pub cluster_configuration: ClusterConfiguration,

    /// `global.discovery`
    #[serde(default)]
    pub discovery: Discovery,
}

/// `global.clusterConfiguration`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfiguration {
    /// Desired control-plane version, `X.Y[.Z]` or `Automatic`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
}

/// `global.discovery`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discovery {
    /// Version reported by the apiserver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,

    /// Number of master nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_master_count: Option<u32>,
}

/// `controlPlaneManager.*`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneManagerValues {
    /// Feature gates requested by the user.
    #[serde(default)]
    pub enabled_feature_gates: Vec<String>,

    /// etcd settings.
    #[serde(default)]
    pub etcd: EtcdValues,

    /// apiserver settings.
    #[serde(default)]
    pub apiserver: ApiserverValues,

    /// Computed outputs.
    #[serde(default)]
    pub internal: InternalValues,
}

/// `controlPlaneManager.etcd`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdValues {
    /// Members that membership reconciliation never removes.
    #[serde(default)]
    pub external_members_names: Vec<String>,

    /// User override of `--quota-backend-bytes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_db_size: Option<i64>,

    /// Disables the hourly defragmentation.
    #[serde(default)]
    pub disable_auto_defragmentation: bool,
}

/// `controlPlaneManager.apiserver`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiserverValues {
    /// Enables envelope encryption of Secrets at rest.
    #[serde(default)]
    pub encryption_enabled: bool,
}

/// `controlPlaneManager.internal`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalValues {
    /// Published control-plane version, `MAJOR.MINOR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_kubernetes_version: Option<String>,

    /// Client URLs of every etcd member, sorted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_servers: Option<Vec<String>>,

    /// `--quota-backend-bytes` for new etcd pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_quota_backend_bytes: Option<i64>,

    /// etcd client TLS material.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_certs: Option<EtcdCertsValues>,

    /// Digest of the PKI secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pki_checksum: Option<String>,

    /// Envelope encryption key, base64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_encryption_key: Option<String>,

    /// Accepted feature gates per component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_feature_gates: Option<AllowedFeatureGates>,

    /// Master node names, sorted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masters_node: Option<Vec<String>>,

    /// True if an etcd arbiter node exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_etcd_arbiter_node: Option<bool>,

    /// True if an etcd-only node exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_etcd_only_node: Option<bool>,
}

/// `controlPlaneManager.internal.etcdCerts`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdCertsValues {
    /// CA certificate, base64.
    pub ca: String,
    /// Client certificate, base64.
    pub crt: String,
    /// Client key, base64.
    pub key: String,
}

/// `controlPlaneManager.internal.allowedFeatureGates`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedFeatureGates {
    /// kube-apiserver gates.
    pub apiserver: Vec<String>,
    /// kube-controller-manager gates.
    pub kube_controller_manager: Vec<String>,
    /// kube-scheduler gates.
    pub kube_scheduler: Vec<String>,
    /// kubelet gates.
    pub kubelet: Vec<String>,
}

impl Values {
    /// Parses a YAML or JSON document.
    pub fn from_yaml(input: &str) -> Result<Self, serde_yaml::Error> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(input)
    }

    /// Serializes the document as pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Resolves `global.clusterConfiguration.kubernetesVersion`.
    ///
    /// Returns `None` when unset. `Automatic` resolves to `default`.
    pub fn desired_kubernetes_version(
        &self,
        default: &str,
    ) -> Option<Result<Version, VersionError>> {
        let raw = self
            .global
            .cluster_configuration
            .kubernetes_version
            .as_deref()?;
        let raw = if raw == AUTOMATIC_VERSION { default } else { raw };
        Some(Version::parse(raw))
    }

    /// Convenience accessor for the internal outputs.
    pub fn internal(&self) -> &InternalValues {
        &self.control_plane_manager.internal
    }

    /// Mutable accessor for the internal outputs.
    pub fn internal_mut(&mut self) -> &mut InternalValues {
        &mut self.control_plane_manager.internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
global:
  clusterConfiguration:
    kubernetesVersion: "1.29"
  discovery:
    kubernetesVersion: "1.29.4"
    clusterMasterCount: 3
controlPlaneManager:
  enabledFeatureGates: [ComponentFlagz]
  etcd:
    externalMembersNames: [etcd-ext-0]
    maxDbSize: 4294967296
  apiserver:
    encryptionEnabled: true
  internal:
    effectiveKubernetesVersion: "1.28"
"#;

    #[test]
    fn test_parse_values_document() {
        let values = Values::from_yaml(DOC).unwrap();
        assert_eq!(values.global.discovery.cluster_master_count, Some(3));
        assert_eq!(
            values.control_plane_manager.etcd.external_members_names,
            vec!["etcd-ext-0".to_string()]
        );
        assert_eq!(values.control_plane_manager.etcd.max_db_size, Some(4294967296));
        assert!(values.control_plane_manager.apiserver.encryption_enabled);
        assert!(!values.control_plane_manager.etcd.disable_auto_defragmentation);
        assert_eq!(
            values.internal().effective_kubernetes_version.as_deref(),
            Some("1.28")
        );
    }

    #[test]
    fn test_empty_and_json_inputs() {
        assert_eq!(Values::from_yaml("").unwrap(), Values::default());
        let values = Values::from_yaml(r#"{"global":{"discovery":{"clusterMasterCount":1}}}"#).unwrap();
        assert_eq!(values.global.discovery.cluster_master_count, Some(1));
    }

    #[test]
    fn test_desired_version_automatic() {
        let mut values = Values::default();
        assert!(values.desired_kubernetes_version("1.29").is_none());

        values.global.cluster_configuration.kubernetes_version = Some("Automatic".into());
        assert_eq!(
            values.desired_kubernetes_version("1.29").unwrap().unwrap(),
            Version::new(1, 29, 0)
        );

        values.global.cluster_configuration.kubernetes_version = Some("bogus".into());
        assert!(values.desired_kubernetes_version("1.29").unwrap().is_err());
    }

    #[test]
    fn test_outputs_serialize_camel_case() {
        let mut values = Values::default();
        values.internal_mut().etcd_servers = Some(vec!["https://10.0.0.1:2379".into()]);
        values.internal_mut().has_etcd_only_node = Some(false);
        let json = values.to_json_pretty().unwrap();
        assert!(json.contains("\"etcdServers\""));
        assert!(json.contains("\"hasEtcdOnlyNode\": false"));
        assert!(!json.contains("pkiChecksum"));
    }
}
