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

//! Typed projections of cluster objects.
//!
//! Each projection keeps only the fields the reconcilers read. A
//! [`ClusterSnapshot`] is collected once per pass and shared read-only by every
//! reconciler of that pass.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};

use crate::etcd;
use crate::kube_api::ClusterApi;

/// Label carried by every control-plane node.
pub const MASTER_NODE_LABEL: &str = "node-role.kubernetes.io/control-plane";
/// Taint key marking a dedicated control-plane node.
pub const CONTROL_PLANE_TAINT_KEY: &str = "node-role.kubernetes.io/control-plane";
/// Label of nodes that run only etcd.
pub const ETCD_ONLY_NODE_LABEL: &str = "node-role.deckhouse.io/etcd-only";
/// Label of the etcd arbiter node.
pub const ETCD_ARBITER_NODE_LABEL: &str = "node-role.deckhouse.io/etcd-arbiter";

/// Node annotation set once an update is approved.
pub const APPROVED_ANNOTATION: &str = "control-plane-manger.deckhouse.io/approved";
/// Node annotation set while an update waits for approval.
pub const WAITING_FOR_APPROVAL_ANNOTATION: &str =
    "control-plane-manger.deckhouse.io/waiting-for-approval";
/// Pod annotation declaring the control-plane component version.
pub const KUBERNETES_VERSION_ANNOTATION: &str =
    "control-plane-manager.deckhouse.io/kubernetes-version";

/// Selector of apiserver, controller-manager and scheduler static pods.
pub const CONTROL_PLANE_POD_SELECTOR: &str =
    "component in (kube-apiserver,kube-controller-manager,kube-scheduler),tier=control-plane";
/// Selector of etcd static pods.
pub const ETCD_POD_SELECTOR: &str = "component=etcd,tier=control-plane";
/// Selector of control-plane-manager DaemonSet pods.
pub const MANAGER_POD_SELECTOR: &str = "app=d8-control-plane-manager";

/// Secret holding the persisted version watermarks.
pub const CLUSTER_CONFIGURATION_SECRET: &str = "d8-cluster-configuration";
/// Secret holding the control-plane PKI.
pub const PKI_SECRET: &str = "d8-pki";
/// Secret holding the envelope encryption key.
pub const ENCRYPTION_KEY_SECRET: &str = "d8-secret-encryption-key";
/// Data key of the envelope encryption key.
pub const ENCRYPTION_KEY_DATA_KEY: &str = "secretEncryptionKey";
/// The control-plane-manager DaemonSet.
pub const MANAGER_DAEMONSET: &str = "d8-control-plane-manager";
/// The ConfigMap left behind by kubeadm bootstrap.
pub const KUBEADM_CONFIG_MAP: &str = "kubeadm-config";

/// Approval state of a master node, derived from its annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalState {
    /// Neither annotation.
    Idle,
    /// Waiting for approval.
    Waiting,
    /// Approved; cleared once the node's manager pod is Ready again.
    Approved,
}

/// A control-plane node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterNode {
    /// Node name.
    pub name: String,
    /// `InternalIP` address.
    pub internal_ip: Option<String>,
    /// `ExternalIP` address.
    pub external_ip: Option<String>,
    /// Raw `status.nodeInfo.kubeletVersion`.
    pub kubelet_version: String,
    /// Carries the control-plane `NoSchedule` taint.
    pub is_dedicated: bool,
    /// Memory capacity in bytes.
    pub memory_bytes: i64,
    /// `Ready` condition is `True`.
    pub ready: bool,
    /// `spec.unschedulable`.
    pub unschedulable: bool,
    /// Approval annotations.
    pub approval: ApprovalState,
}

impl MasterNode {
    /// Preferred address: internal, else external.
    pub fn address(&self) -> Option<&str> {
        self.internal_ip
            .as_deref()
            .or(self.external_ip.as_deref())
    }
}

/// An etcd-only or arbiter node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdNode {
    /// Node name.
    pub name: String,
    /// Preferred address.
    pub address: Option<String>,
}

/// Kubelet version of any node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeVersion {
    /// Node name.
    pub name: String,
    /// Raw kubelet version.
    pub kubelet_version: String,
}

/// An apiserver, controller-manager or scheduler pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlanePod {
    /// Pod name.
    pub name: String,
    /// Value of the `component` label.
    pub component: String,
    /// Value of the kubernetes-version annotation.
    pub declared_version: Option<String>,
}

/// An etcd static pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdPod {
    /// Pod name.
    pub name: String,
    /// Node the pod runs on.
    pub node_name: String,
    /// `status.hostIP`.
    pub host_ip: Option<String>,
    /// `status.podIP`.
    pub pod_ip: Option<String>,
    /// `spec.hostNetwork`.
    pub host_network: bool,
    /// Value of `--listen-peer-urls`.
    pub listen_peer_urls: Option<String>,
    /// Value of `--quota-backend-bytes`.
    pub quota_backend_bytes: Option<i64>,
    /// `status.phase == Running`.
    pub running: bool,
}

impl EtcdPod {
    /// Client endpoint of this member: host IP on host network, else pod IP.
    pub fn endpoint(&self) -> Option<etcd::EtcdEndpoint> {
        let ip = if self.host_network {
            self.host_ip.as_deref()
        } else {
            self.pod_ip.as_deref()
        };
        ip.filter(|ip| !ip.is_empty()).map(etcd::EtcdEndpoint::for_ip)
    }

    /// Configured quota, or the etcd default when the flag is absent.
    pub fn max_db_size(&self) -> i64 {
        self.quota_backend_bytes
            .unwrap_or(etcd::DEFAULT_ETCD_MAX_SIZE)
    }
}

/// A control-plane-manager DaemonSet pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerPod {
    /// Pod name.
    pub name: String,
    /// Node the pod runs on.
    pub node_name: String,
    /// `pod-template-generation` label.
    pub template_generation: Option<i64>,
    /// `Ready` condition is `True`.
    pub ready: bool,
}

/// The control-plane-manager DaemonSet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonSetState {
    /// `metadata.generation`.
    pub generation: i64,
    /// `status.desiredNumberScheduled`.
    pub desired: i32,
}

/// Everything a pass observes, collected up front.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterSnapshot {
    /// Control-plane nodes sorted by name.
    pub masters: Vec<MasterNode>,
    /// Kubelet versions of every node.
    pub node_versions: Vec<NodeVersion>,
    /// etcd-only nodes sorted by name.
    pub etcd_only_nodes: Vec<EtcdNode>,
    /// Arbiter nodes sorted by name.
    pub arbiter_nodes: Vec<EtcdNode>,
    /// Control-plane pods in list order.
    pub control_plane_pods: Vec<ControlPlanePod>,
    /// etcd pods in list order.
    pub etcd_pods: Vec<EtcdPod>,
    /// control-plane-manager pods in list order.
    pub manager_pods: Vec<ManagerPod>,
    /// control-plane-manager DaemonSet.
    pub manager_daemonset: Option<DaemonSetState>,
    /// Data of the cluster-configuration secret.
    pub cluster_configuration: Option<BTreeMap<String, Vec<u8>>>,
    /// Data of the PKI secret.
    pub pki: Option<BTreeMap<String, Vec<u8>>>,
    /// Data of the encryption-key secret.
    pub encryption_key: Option<BTreeMap<String, Vec<u8>>>,
    /// `kubeadm-config` exists.
    pub kubeadm_config_exists: bool,
}

impl ClusterSnapshot {
    /// Reads every projected object from the cluster.
    pub async fn collect(api: &dyn ClusterApi, namespace: &str) -> anyhow::Result<Self> {
        let (nodes, cp_pods, etcd_pods, mgr_pods) = tokio::try_join!(
            api.list_nodes(),
            api.list_pods(namespace, CONTROL_PLANE_POD_SELECTOR),
            api.list_pods(namespace, ETCD_POD_SELECTOR),
            api.list_pods(namespace, MANAGER_POD_SELECTOR),
        )?;
        let (cluster_configuration, pki, encryption_key, daemonset, kubeadm_config_exists) = tokio::try_join!(
            api.get_secret(namespace, CLUSTER_CONFIGURATION_SECRET),
            api.get_secret(namespace, PKI_SECRET),
            api.get_secret(namespace, ENCRYPTION_KEY_SECRET),
            api.get_daemonset(namespace, MANAGER_DAEMONSET),
            api.config_map_exists(namespace, KUBEADM_CONFIG_MAP),
        )?;

        let mut snapshot = Self::from_nodes(&nodes);
        snapshot.control_plane_pods = cp_pods.iter().filter_map(control_plane_pod).collect();
        snapshot.etcd_pods = etcd_pods.iter().filter_map(etcd_pod).collect();
        snapshot.manager_pods = mgr_pods.iter().filter_map(manager_pod).collect();
        snapshot.manager_daemonset = daemonset.as_ref().map(daemonset_state);
        snapshot.cluster_configuration = cluster_configuration.as_ref().map(secret_data);
        snapshot.pki = pki.as_ref().map(secret_data);
        snapshot.encryption_key = encryption_key.as_ref().map(secret_data);
        snapshot.kubeadm_config_exists = kubeadm_config_exists;
        Ok(snapshot)
    }

    /// Builds the node projections.
    pub fn from_nodes(nodes: &[Node]) -> Self {
        let mut snapshot = Self::default();
        for node in nodes {
            let Some(name) = node.metadata.name.clone() else {
                continue;
            };
            snapshot.node_versions.push(NodeVersion {
                name: name.clone(),
                kubelet_version: kubelet_version(node),
            });

            let labels = node.metadata.labels.as_ref();
            let has_label = |key: &str| labels.is_some_and(|l| l.contains_key(key));

            if has_label(MASTER_NODE_LABEL) {
                snapshot.masters.push(master_node(node, name.clone()));
            }
            if has_label(ETCD_ONLY_NODE_LABEL) {
                snapshot.etcd_only_nodes.push(EtcdNode {
                    name: name.clone(),
                    address: preferred_address(node),
                });
            }
            if has_label(ETCD_ARBITER_NODE_LABEL) {
                snapshot.arbiter_nodes.push(EtcdNode {
                    name,
                    address: preferred_address(node),
                });
            }
        }
        snapshot.masters.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot.etcd_only_nodes.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot.arbiter_nodes.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }

    /// Master count from values, else the observed count.
    pub fn master_count(&self, configured: Option<u32>) -> usize {
        configured
            .map(|c| c as usize)
            .unwrap_or(self.masters.len())
    }
}

fn node_address(node: &Node, kind: &str) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == kind)
        .map(|a| a.address.clone())
}

fn preferred_address(node: &Node) -> Option<String> {
    node_address(node, "InternalIP").or_else(|| node_address(node, "ExternalIP"))
}

fn kubelet_version(node: &Node) -> String {
    node.status
        .as_ref()
        .and_then(|s| s.node_info.as_ref())
        .map(|i| i.kubelet_version.clone())
        .unwrap_or_default()
}

fn master_node(node: &Node, name: String) -> MasterNode {
    let spec = node.spec.as_ref();
    let status = node.status.as_ref();

    let is_dedicated = spec
        .and_then(|s| s.taints.as_ref())
        .is_some_and(|taints| {
            taints
                .iter()
                .any(|t| t.key == CONTROL_PLANE_TAINT_KEY && t.effect == "NoSchedule")
        });

    let memory_bytes = status
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("memory"))
        .and_then(|q| parse_quantity(&q.0))
        .unwrap_or(0);

    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"));

    let annotations = node.metadata.annotations.as_ref();
    let has_annotation = |key: &str| annotations.is_some_and(|a| a.contains_key(key));
    let approval = if has_annotation(APPROVED_ANNOTATION) {
        ApprovalState::Approved
    } else if has_annotation(WAITING_FOR_APPROVAL_ANNOTATION) {
        ApprovalState::Waiting
    } else {
        ApprovalState::Idle
    };

    MasterNode {
        name,
        internal_ip: node_address(node, "InternalIP"),
        external_ip: node_address(node, "ExternalIP"),
        kubelet_version: kubelet_version(node),
        is_dedicated,
        memory_bytes,
        ready,
        unschedulable: spec.and_then(|s| s.unschedulable).unwrap_or(false),
        approval,
    }
}

/// Projects a control-plane pod.
pub fn control_plane_pod(pod: &Pod) -> Option<ControlPlanePod> {
    let name = pod.metadata.name.clone()?;
    let component = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get("component"))
        .cloned()
        .unwrap_or_default();
    let declared_version = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(KUBERNETES_VERSION_ANNOTATION))
        .cloned();
    Some(ControlPlanePod {
        name,
        component,
        declared_version,
    })
}

/// Projects an etcd pod.
pub fn etcd_pod(pod: &Pod) -> Option<EtcdPod> {
    let name = pod.metadata.name.clone()?;
    let spec = pod.spec.as_ref()?;
    let status = pod.status.as_ref();

    let container = spec
        .containers
        .iter()
        .find(|c| c.name == "etcd")
        .or_else(|| spec.containers.first());
    let args: Vec<String> = container
        .map(|c| {
            c.command
                .iter()
                .flatten()
                .chain(c.args.iter().flatten())
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    Some(EtcdPod {
        name,
        node_name: spec.node_name.clone().unwrap_or_default(),
        host_ip: status.and_then(|s| s.host_ip.clone()),
        pod_ip: status.and_then(|s| s.pod_ip.clone()),
        host_network: spec.host_network.unwrap_or(false),
        listen_peer_urls: etcd::find_flag(&args, "listen-peer-urls").map(str::to_string),
        quota_backend_bytes: etcd::find_flag(&args, "quota-backend-bytes")
            .and_then(|v| v.parse().ok()),
        running: status.and_then(|s| s.phase.as_deref()) == Some("Running"),
    })
}

/// Projects a control-plane-manager pod.
pub fn manager_pod(pod: &Pod) -> Option<ManagerPod> {
    let name = pod.metadata.name.clone()?;
    let template_generation = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get("pod-template-generation"))
        .and_then(|g| g.parse().ok());
    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"));
    Some(ManagerPod {
        name,
        node_name: pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default(),
        template_generation,
        ready,
    })
}

/// Projects the control-plane-manager DaemonSet.
pub fn daemonset_state(ds: &DaemonSet) -> DaemonSetState {
    DaemonSetState {
        generation: ds.metadata.generation.unwrap_or(0),
        desired: ds
            .status
            .as_ref()
            .map(|s| s.desired_number_scheduled)
            .unwrap_or(0),
    }
}

/// Raw bytes of a Secret's `data`.
pub fn secret_data(secret: &Secret) -> BTreeMap<String, Vec<u8>> {
    secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), v.0.clone()))
        .collect()
}

/// Parses a resource quantity into an integer byte count.
pub fn parse_quantity(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let number: f64 = number.parse().ok()?;

    let multiplier: f64 = match suffix {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "m" => 1e-3,
        _ => return None,
    };
    Some((number * multiplier).round() as i64)
}
