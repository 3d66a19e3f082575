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

//! In-memory collaborators.
//!
//! [`FakeCluster`] and [`FakeEtcd`] keep objects and members in memory, apply
//! mutations the way the real servers do, and record every mutating call so
//! tests can assert on exactly what a pass did.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetStatus};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, Node, NodeAddress, NodeCondition, NodeSpec, NodeStatus, NodeSystemInfo,
    Pod, PodCondition, PodSpec, PodStatus, Secret, Taint,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::etcd::{
    EtcdClient, EtcdConnector, EtcdCredentials, EtcdEndpoint, EtcdError, EtcdMember, EtcdStatus,
};
use crate::kube_api::ClusterApi;
use crate::patch::{ObjectKind, ObjectRef};
use crate::snapshot::{
    CONTROL_PLANE_TAINT_KEY, KUBERNETES_VERSION_ANNOTATION, MASTER_NODE_LABEL,
};
use crate::version::Version;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A mutating call received by [`FakeCluster`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterCall {
    /// JSON merge patch.
    MergePatch {
        /// Patched object.
        target: ObjectRef,
        /// Patch body.
        patch: Value,
    },
    /// Secret creation.
    Create {
        /// Created object.
        target: ObjectRef,
    },
    /// Deletion.
    Delete {
        /// Deleted object.
        target: ObjectRef,
    },
}

type NamespacedKey = (String, String);

#[derive(Default)]
struct ClusterState {
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<NamespacedKey, Pod>,
    secrets: BTreeMap<NamespacedKey, Secret>,
    daemonsets: BTreeMap<NamespacedKey, DaemonSet>,
    config_maps: BTreeMap<NamespacedKey, ConfigMap>,
    server_version: Option<Version>,
    calls: Vec<ClusterCall>,
    fail_reads: bool,
}

/// In-memory Kubernetes API.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

fn namespaced_key(meta: &ObjectMeta) -> NamespacedKey {
    (
        meta.namespace.clone().unwrap_or_else(|| "kube-system".to_string()),
        meta.name.clone().unwrap_or_default(),
    )
}

impl FakeCluster {
    /// Creates an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a Node.
    pub fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        lock(&self.state).nodes.insert(name, node);
    }

    /// Stores a Pod. Pods without a namespace land in `kube-system`.
    pub fn add_pod(&self, pod: Pod) {
        let key = namespaced_key(&pod.metadata);
        lock(&self.state).pods.insert(key, pod);
    }

    /// Stores a Secret.
    pub fn add_secret(&self, secret: Secret) {
        let key = namespaced_key(&secret.metadata);
        lock(&self.state).secrets.insert(key, secret);
    }

    /// Stores a DaemonSet.
    pub fn add_daemonset(&self, daemonset: DaemonSet) {
        let key = namespaced_key(&daemonset.metadata);
        lock(&self.state).daemonsets.insert(key, daemonset);
    }

    /// Stores a ConfigMap.
    pub fn add_config_map(&self, config_map: ConfigMap) {
        let key = namespaced_key(&config_map.metadata);
        lock(&self.state).config_maps.insert(key, config_map);
    }

    /// Sets the version reported by the discovery endpoint.
    pub fn set_server_version(&self, version: Version) {
        lock(&self.state).server_version = Some(version);
    }

    /// Makes every read fail until reset.
    pub fn set_fail_reads(&self, fail: bool) {
        lock(&self.state).fail_reads = fail;
    }

    /// Returns a stored Node.
    pub fn node(&self, name: &str) -> Option<Node> {
        lock(&self.state).nodes.get(name).cloned()
    }

    /// Returns the annotations of a stored Node.
    pub fn node_annotations(&self, name: &str) -> BTreeMap<String, String> {
        self.node(name)
            .and_then(|n| n.metadata.annotations)
            .unwrap_or_default()
    }

    /// Returns a stored Secret.
    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        lock(&self.state)
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Returns true if the ConfigMap is stored.
    pub fn has_config_map(&self, namespace: &str, name: &str) -> bool {
        lock(&self.state)
            .config_maps
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    /// Returns every mutating call received so far.
    pub fn calls(&self) -> Vec<ClusterCall> {
        lock(&self.state).calls.clone()
    }

    /// Forgets recorded calls.
    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    fn check_reads(&self) -> anyhow::Result<()> {
        if lock(&self.state).fail_reads {
            bail!("injected read failure");
        }
        Ok(())
    }
}

fn patched<T: Serialize + DeserializeOwned>(object: &T, patch: &Value) -> anyhow::Result<T> {
    let mut doc = serde_json::to_value(object).context("failed to encode object")?;
    json_merge(&mut doc, patch);
    serde_json::from_value(doc).context("patched object does not decode")
}

/// Applies an RFC 7386 JSON merge patch.
pub fn json_merge(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(doc) = target {
        for (key, value) in entries {
            if value.is_null() {
                doc.remove(key);
            } else {
                json_merge(doc.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Returns true if `labels` satisfy a label selector.
///
/// Supports `k=v`, `k==v`, `k!=v`, `k in (a,b)`, `k notin (a,b)`, `k` and `!k`.
pub fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);
    split_selector(selector).iter().all(|term| {
        let term = term.trim();
        if term.is_empty() {
            return true;
        }
        if let Some((key, set)) = term.split_once(" notin ") {
            let set = parse_set(set);
            return labels.get(key.trim()).map_or(true, |v| !set.contains(v.as_str()));
        }
        if let Some((key, set)) = term.split_once(" in ") {
            let set = parse_set(set);
            return labels.get(key.trim()).is_some_and(|v| set.contains(v.as_str()));
        }
        if let Some((key, value)) = term.split_once("!=") {
            return labels.get(key.trim()).map(String::as_str) != Some(value.trim());
        }
        if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
            return labels.get(key.trim()).map(String::as_str) == Some(value.trim());
        }
        if let Some(key) = term.strip_prefix('!') {
            return !labels.contains_key(key.trim());
        }
        labels.contains_key(term)
    })
}

fn split_selector(selector: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&selector[start..]);
    terms
}

fn parse_set(raw: &str) -> HashSet<&str> {
    raw.trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .collect()
}

fn not_found(target: &ObjectRef) -> anyhow::Error {
    anyhow!("{} not found", target)
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_nodes(&self) -> anyhow::Result<Vec<Node>> {
        self.check_reads()?;
        Ok(lock(&self.state).nodes.values().cloned().collect())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> anyhow::Result<Vec<Pod>> {
        self.check_reads()?;
        Ok(lock(&self.state)
            .pods
            .iter()
            .filter(|((ns, _), pod)| {
                ns == namespace && matches_selector(pod.metadata.labels.as_ref(), label_selector)
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Secret>> {
        self.check_reads()?;
        Ok(self.secret(namespace, name))
    }

    async fn get_daemonset(&self, namespace: &str, name: &str) -> anyhow::Result<Option<DaemonSet>> {
        self.check_reads()?;
        Ok(lock(&self.state)
            .daemonsets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn config_map_exists(&self, namespace: &str, name: &str) -> anyhow::Result<bool> {
        self.check_reads()?;
        Ok(self.has_config_map(namespace, name))
    }

    async fn server_version(&self) -> anyhow::Result<Version> {
        self.check_reads()?;
        lock(&self.state)
            .server_version
            .context("discovery endpoint unavailable")
    }

    async fn merge_patch(&self, target: &ObjectRef, patch: &Value) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        let ns_key = || {
            (
                target.namespace.clone().unwrap_or_default(),
                target.name.clone(),
            )
        };
        match target.kind {
            ObjectKind::Node => {
                let node = state
                    .nodes
                    .get(&target.name)
                    .ok_or_else(|| not_found(target))?;
                let updated = patched(node, patch)?;
                state.nodes.insert(target.name.clone(), updated);
            }
            ObjectKind::Secret => {
                let key = ns_key();
                let secret = state.secrets.get(&key).ok_or_else(|| not_found(target))?;
                let updated = patched(secret, patch)?;
                state.secrets.insert(key, updated);
            }
            ObjectKind::ConfigMap => {
                let key = ns_key();
                let cm = state.config_maps.get(&key).ok_or_else(|| not_found(target))?;
                let updated = patched(cm, patch)?;
                state.config_maps.insert(key, updated);
            }
        }
        state.calls.push(ClusterCall::MergePatch {
            target: target.clone(),
            patch: patch.clone(),
        });
        Ok(())
    }

    async fn create_secret_if_absent(&self, secret: Secret) -> anyhow::Result<Secret> {
        let key = namespaced_key(&secret.metadata);
        let mut state = lock(&self.state);
        if let Some(existing) = state.secrets.get(&key) {
            return Ok(existing.clone());
        }
        state.secrets.insert(key.clone(), secret.clone());
        state.calls.push(ClusterCall::Create {
            target: ObjectRef::secret(key.0, key.1),
        });
        Ok(secret)
    }

    async fn delete(&self, target: &ObjectRef) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        let key = (
            target.namespace.clone().unwrap_or_default(),
            target.name.clone(),
        );
        let existed = match target.kind {
            ObjectKind::Node => state.nodes.remove(&target.name).is_some(),
            ObjectKind::Secret => state.secrets.remove(&key).is_some(),
            ObjectKind::ConfigMap => state.config_maps.remove(&key).is_some(),
        };
        if existed {
            state.calls.push(ClusterCall::Delete {
                target: target.clone(),
            });
        }
        Ok(())
    }
}

/// A call received by [`FakeEtcd`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EtcdCall {
    /// `MemberList`.
    MemberList,
    /// `MemberUpdate`.
    MemberUpdate {
        /// Member id.
        id: u64,
        /// New peer URLs.
        peer_urls: Vec<String>,
    },
    /// `MemberRemove`.
    MemberRemove {
        /// Member id.
        id: u64,
    },
    /// `Status`.
    Status {
        /// Queried member.
        endpoint: EtcdEndpoint,
    },
    /// `Defragment`.
    Defragment {
        /// Defragmented member.
        endpoint: EtcdEndpoint,
    },
}

impl EtcdCall {
    /// Returns true for calls that change the cluster.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            EtcdCall::MemberUpdate { .. } | EtcdCall::MemberRemove { .. } | EtcdCall::Defragment { .. }
        )
    }
}

#[derive(Default)]
struct EtcdState {
    members: Vec<EtcdMember>,
    statuses: HashMap<EtcdEndpoint, EtcdStatus>,
    failing_status: HashSet<EtcdEndpoint>,
    failing_defragment: HashSet<EtcdEndpoint>,
    connections: Vec<Vec<EtcdEndpoint>>,
    calls: Vec<EtcdCall>,
    refuse_connections: bool,
}

/// In-memory etcd cluster. Clones share state.
#[derive(Clone, Default)]
pub struct FakeEtcd {
    state: Arc<Mutex<EtcdState>>,
}

impl FakeEtcd {
    /// Creates a cluster without members.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member.
    pub fn add_member(&self, id: u64, name: &str, peer_urls: &[&str]) {
        lock(&self.state).members.push(EtcdMember {
            id,
            name: name.to_string(),
            peer_urls: peer_urls.iter().map(|u| u.to_string()).collect(),
        });
    }

    /// Sets the database size reported by the member at `endpoint`.
    pub fn set_db_size(&self, endpoint: &EtcdEndpoint, db_size: i64) {
        lock(&self.state)
            .statuses
            .insert(endpoint.clone(), EtcdStatus { db_size });
    }

    /// Makes `Status` against `endpoint` fail.
    pub fn fail_status(&self, endpoint: &EtcdEndpoint) {
        lock(&self.state).failing_status.insert(endpoint.clone());
    }

    /// Makes `Defragment` against `endpoint` fail.
    pub fn fail_defragment(&self, endpoint: &EtcdEndpoint) {
        lock(&self.state).failing_defragment.insert(endpoint.clone());
    }

    /// Makes every connection attempt fail.
    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.state).refuse_connections = refuse;
    }

    /// Returns the current members.
    pub fn members(&self) -> Vec<EtcdMember> {
        lock(&self.state).members.clone()
    }

    /// Returns every call received so far.
    pub fn calls(&self) -> Vec<EtcdCall> {
        lock(&self.state).calls.clone()
    }

    /// Returns the calls that changed the cluster.
    pub fn mutating_calls(&self) -> Vec<EtcdCall> {
        self.calls().into_iter().filter(EtcdCall::is_mutating).collect()
    }

    /// Returns the endpoint sets of every connection made.
    pub fn connections(&self) -> Vec<Vec<EtcdEndpoint>> {
        lock(&self.state).connections.clone()
    }

    /// Forgets recorded calls and connections.
    pub fn clear_calls(&self) {
        let mut state = lock(&self.state);
        state.calls.clear();
        state.connections.clear();
    }
}

#[async_trait]
impl EtcdConnector for FakeEtcd {
    async fn connect(
        &self,
        endpoints: &[EtcdEndpoint],
        _credentials: &EtcdCredentials,
    ) -> Result<Box<dyn EtcdClient>, EtcdError> {
        let mut state = lock(&self.state);
        if state.refuse_connections {
            return Err(EtcdError::Connect {
                endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
                source: "connection refused".into(),
            });
        }
        state.connections.push(endpoints.to_vec());
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl EtcdClient for FakeEtcd {
    async fn member_list(&self) -> Result<Vec<EtcdMember>, EtcdError> {
        let mut state = lock(&self.state);
        state.calls.push(EtcdCall::MemberList);
        Ok(state.members.clone())
    }

    async fn member_update(&self, id: u64, peer_urls: Vec<String>) -> Result<(), EtcdError> {
        let mut state = lock(&self.state);
        state.calls.push(EtcdCall::MemberUpdate {
            id,
            peer_urls: peer_urls.clone(),
        });
        let member = state
            .members
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| EtcdError::request("member update", format!("member {:x} not found", id)))?;
        member.peer_urls = peer_urls;
        Ok(())
    }

    async fn member_remove(&self, id: u64) -> Result<(), EtcdError> {
        let mut state = lock(&self.state);
        state.calls.push(EtcdCall::MemberRemove { id });
        let before = state.members.len();
        state.members.retain(|m| m.id != id);
        if state.members.len() == before {
            return Err(EtcdError::request("member remove", format!("member {:x} not found", id)));
        }
        Ok(())
    }

    async fn status(&self, endpoint: &EtcdEndpoint) -> Result<EtcdStatus, EtcdError> {
        let mut state = lock(&self.state);
        state.calls.push(EtcdCall::Status {
            endpoint: endpoint.clone(),
        });
        if state.failing_status.contains(endpoint) {
            return Err(EtcdError::request("status", "member unavailable"));
        }
        Ok(state
            .statuses
            .get(endpoint)
            .copied()
            .unwrap_or(EtcdStatus { db_size: 0 }))
    }

    async fn defragment(&self, endpoint: &EtcdEndpoint) -> Result<(), EtcdError> {
        let mut state = lock(&self.state);
        state.calls.push(EtcdCall::Defragment {
            endpoint: endpoint.clone(),
        });
        if state.failing_defragment.contains(endpoint) {
            return Err(EtcdError::request("defragment", "defragment failed"));
        }
        Ok(())
    }
}

/// Builder of Node fixtures.
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    node: Node,
}

/// Starts a Node named `name` with an internal IP and a kubelet version.
pub fn node(name: &str, internal_ip: &str, kubelet_version: &str) -> NodeBuilder {
    NodeBuilder {
        node: Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: internal_ip.to_string(),
                }]),
                node_info: Some(NodeSystemInfo {
                    kubelet_version: kubelet_version.to_string(),
                    ..Default::default()
                }),
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        },
    }
}

impl NodeBuilder {
    /// Adds a label with an empty value.
    pub fn label(mut self, key: &str) -> Self {
        self.node
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), String::new());
        self
    }

    /// Labels the node as a control-plane node.
    pub fn master(self) -> Self {
        self.label(MASTER_NODE_LABEL)
    }

    /// Taints the node with the control-plane `NoSchedule` taint.
    pub fn dedicated(mut self) -> Self {
        self.node
            .spec
            .get_or_insert_with(Default::default)
            .taints
            .get_or_insert_with(Default::default)
            .push(Taint {
                key: CONTROL_PLANE_TAINT_KEY.to_string(),
                effect: "NoSchedule".to_string(),
                ..Default::default()
            });
        self
    }

    /// Sets the memory capacity quantity, e.g. `16Gi`.
    pub fn memory(mut self, quantity: &str) -> Self {
        self.node
            .status
            .get_or_insert_with(Default::default)
            .capacity
            .get_or_insert_with(Default::default)
            .insert("memory".to_string(), Quantity(quantity.to_string()));
        self
    }

    /// Sets an annotation.
    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.node
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Marks the node not Ready.
    pub fn not_ready(mut self) -> Self {
        if let Some(conditions) = self
            .node
            .status
            .as_mut()
            .and_then(|s| s.conditions.as_mut())
        {
            for c in conditions.iter_mut().filter(|c| c.type_ == "Ready") {
                c.status = "False".to_string();
            }
        }
        self
    }

    /// Cordons the node.
    pub fn unschedulable(mut self) -> Self {
        self.node.spec.get_or_insert_with(Default::default).unschedulable = Some(true);
        self
    }

    /// Returns the Node.
    pub fn build(self) -> Node {
        self.node
    }
}

fn pod_condition_ready(ready: bool) -> PodCondition {
    PodCondition {
        type_: "Ready".to_string(),
        status: if ready { "True" } else { "False" }.to_string(),
        ..Default::default()
    }
}

/// A kube-apiserver, kube-controller-manager or kube-scheduler static pod.
pub fn control_plane_pod(component: &str, node_name: &str, version: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", component, node_name)),
            namespace: Some("kube-system".to_string()),
            labels: Some(
                [
                    ("component".to_string(), component.to_string()),
                    ("tier".to_string(), "control-plane".to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            annotations: Some(
                [(KUBERNETES_VERSION_ANNOTATION.to_string(), version.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

/// An etcd static pod with a host-network address and extra command flags.
pub fn etcd_pod(node_name: &str, host_ip: &str, flags: &[&str]) -> Pod {
    let mut command = vec!["etcd".to_string()];
    command.extend(flags.iter().map(|f| f.to_string()));
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("etcd-{}", node_name)),
            namespace: Some("kube-system".to_string()),
            labels: Some(
                [
                    ("component".to_string(), "etcd".to_string()),
                    ("tier".to_string(), "control-plane".to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            host_network: Some(true),
            containers: vec![Container {
                name: "etcd".to_string(),
                command: Some(command),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            host_ip: Some(host_ip.to_string()),
            pod_ip: Some(host_ip.to_string()),
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

/// A control-plane-manager DaemonSet pod.
pub fn manager_pod(node_name: &str, generation: i64, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("d8-control-plane-manager-{}", node_name)),
            namespace: Some("kube-system".to_string()),
            labels: Some(
                [
                    ("app".to_string(), "d8-control-plane-manager".to_string()),
                    ("pod-template-generation".to_string(), generation.to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![pod_condition_ready(ready)]),
            ..Default::default()
        }),
    }
}

/// A kube-system Secret with raw data.
pub fn secret(name: &str, data: &[(&str, &[u8])]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("kube-system".to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// A kube-system DaemonSet at `generation` scheduling `desired` pods.
pub fn daemonset(name: &str, generation: i64, desired: i32) -> DaemonSet {
    DaemonSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("kube-system".to_string()),
            generation: Some(generation),
            ..Default::default()
        },
        status: Some(DaemonSetStatus {
            desired_number_scheduled: desired,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A kube-system ConfigMap without data.
pub fn config_map(name: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("kube-system".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{APPROVED_ANNOTATION, CONTROL_PLANE_POD_SELECTOR, ETCD_POD_SELECTOR};
    use serde_json::json;

    #[test]
    fn test_json_merge_removes_nulls() {
        let mut doc = json!({"metadata": {"annotations": {"a": "1", "b": "2"}}});
        json_merge(&mut doc, &json!({"metadata": {"annotations": {"a": null, "c": "3"}}}));
        assert_eq!(doc, json!({"metadata": {"annotations": {"b": "2", "c": "3"}}}));
    }

    #[test]
    fn test_selector_matching() {
        let labels: BTreeMap<String, String> = [
            ("component".to_string(), "kube-apiserver".to_string()),
            ("tier".to_string(), "control-plane".to_string()),
        ]
        .into_iter()
        .collect();
        assert!(matches_selector(Some(&labels), CONTROL_PLANE_POD_SELECTOR));
        assert!(!matches_selector(Some(&labels), ETCD_POD_SELECTOR));
        assert!(matches_selector(Some(&labels), "tier,!app"));
        assert!(!matches_selector(None, "tier"));
        assert!(matches_selector(Some(&labels), "component notin (etcd)"));
    }

    #[tokio::test]
    async fn test_merge_patch_persists_on_node() {
        let cluster = FakeCluster::new();
        cluster.add_node(node("m-0", "10.0.0.1", "v1.29.1").master().build());
        cluster
            .merge_patch(
                &ObjectRef::node("m-0"),
                &json!({"metadata": {"annotations": {APPROVED_ANNOTATION: ""}}}),
            )
            .await
            .unwrap();
        assert!(cluster.node_annotations("m-0").contains_key(APPROVED_ANNOTATION));
        assert_eq!(cluster.calls().len(), 1);

        let err = cluster
            .merge_patch(&ObjectRef::node("missing"), &json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_secret_data_patch_roundtrips_base64() {
        let cluster = FakeCluster::new();
        cluster.add_secret(secret("d8-cluster-configuration", &[("a", b"1.28")]));
        cluster
            .merge_patch(
                &ObjectRef::secret("kube-system", "d8-cluster-configuration"),
                &json!({"data": {"b": "MS4yOQ=="}}),
            )
            .await
            .unwrap();
        let stored = cluster.secret("kube-system", "d8-cluster-configuration").unwrap();
        let data = stored.data.unwrap();
        assert_eq!(data["a"].0, b"1.28");
        assert_eq!(data["b"].0, b"1.29");
    }

    #[tokio::test]
    async fn test_create_if_absent_keeps_existing() {
        let cluster = FakeCluster::new();
        let first = secret("d8-secret-encryption-key", &[("secretEncryptionKey", b"one")]);
        let second = secret("d8-secret-encryption-key", &[("secretEncryptionKey", b"two")]);
        cluster.create_secret_if_absent(first).await.unwrap();
        let stored = cluster.create_secret_if_absent(second).await.unwrap();
        assert_eq!(stored.data.unwrap()["secretEncryptionKey"].0, b"one");
        assert_eq!(cluster.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_fake_etcd_member_mutations() {
        let etcd = FakeEtcd::new();
        etcd.add_member(1, "m-0", &["https://localhost:2380"]);
        etcd.add_member(2, "m-1", &["https://10.0.0.2:2380"]);

        etcd.member_update(1, vec!["https://10.0.0.1:2380".into()]).await.unwrap();
        etcd.member_remove(2).await.unwrap();
        assert!(etcd.member_remove(2).await.is_err());

        let members = etcd.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].peer_urls, vec!["https://10.0.0.1:2380"]);
        assert_eq!(etcd.mutating_calls().len(), 3);
    }
}
