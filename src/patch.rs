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

//! Object mutations collected during a pass.

use std::fmt;

use serde_json::Value;
use tracing::{debug, info};

use crate::kube_api::ClusterApi;

/// Kinds of objects the hooks mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// `v1/Node`, cluster scoped.
    Node,
    /// `v1/Secret`.
    Secret,
    /// `v1/ConfigMap`.
    ConfigMap,
}

/// Reference to a single object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Object kind.
    pub kind: ObjectKind,
    /// Namespace; `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    /// Object name.
    pub name: String,
}

impl ObjectRef {
    /// References a Node.
    pub fn node(name: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::Node,
            namespace: None,
            name: name.into(),
        }
    }

    /// References a Secret.
    pub fn secret(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::Secret,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// References a ConfigMap.
    pub fn config_map(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::ConfigMap,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{:?} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{:?} {}", self.kind, self.name),
        }
    }
}

/// A pending mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOperation {
    /// JSON merge patch (RFC 7386).
    MergePatch {
        /// Target object.
        target: ObjectRef,
        /// Patch body.
        patch: Value,
    },
    /// Delete, ignoring a missing object.
    Delete {
        /// Target object.
        target: ObjectRef,
    },
}

/// Collects mutations of one reconciler; the manager applies them once it succeeds.
#[derive(Debug, Default)]
pub struct PatchCollector {
    operations: Vec<PatchOperation>,
}

impl PatchCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a merge patch.
    pub fn merge_patch(&mut self, target: ObjectRef, patch: Value) {
        self.operations.push(PatchOperation::MergePatch { target, patch });
    }

    /// Records a delete.
    pub fn delete(&mut self, target: ObjectRef) {
        self.operations.push(PatchOperation::Delete { target });
    }

    /// Returns the pending operations.
    pub fn operations(&self) -> &[PatchOperation] {
        &self.operations
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Drains the pending operations.
    pub fn take(&mut self) -> Vec<PatchOperation> {
        std::mem::take(&mut self.operations)
    }
}

/// Applies `operations` in order, stopping at the first failure.
pub async fn apply(api: &dyn ClusterApi, operations: Vec<PatchOperation>) -> anyhow::Result<()> {
    for op in operations {
        match op {
            PatchOperation::MergePatch { target, patch } => {
                debug!(object = %target, "applying merge patch");
                api.merge_patch(&target, &patch).await?;
            }
            PatchOperation::Delete { target } => {
                info!(object = %target, "deleting object");
                api.delete(&target).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collector_take_drains() {
        let mut patches = PatchCollector::new();
        patches.merge_patch(ObjectRef::node("master-0"), json!({"metadata": {}}));
        patches.delete(ObjectRef::config_map("kube-system", "kubeadm-config"));
        assert_eq!(patches.operations().len(), 2);

        let ops = patches.take();
        assert_eq!(ops.len(), 2);
        assert!(patches.is_empty());
        assert_eq!(
            ops[1],
            PatchOperation::Delete {
                target: ObjectRef::config_map("kube-system", "kubeadm-config")
            }
        );
    }

    #[test]
    fn test_object_ref_display() {
        assert_eq!(ObjectRef::node("m-0").to_string(), "Node m-0");
        assert_eq!(
            ObjectRef::secret("kube-system", "d8-pki").to_string(),
            "Secret kube-system/d8-pki"
        );
    }
}
