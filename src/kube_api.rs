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

//! Kubernetes API collaborator.

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::patch::{ObjectKind, ObjectRef};
use crate::reconciler_descriptor::ResourceKind;
use crate::version::Version;

/// The Kubernetes operations the hooks perform.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Lists every Node.
    async fn list_nodes(&self) -> anyhow::Result<Vec<Node>>;

    /// Lists Pods in `namespace` matching a label selector.
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> anyhow::Result<Vec<Pod>>;

    /// Fetches a Secret, `None` if absent.
    async fn get_secret(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Secret>>;

    /// Fetches a DaemonSet, `None` if absent.
    async fn get_daemonset(&self, namespace: &str, name: &str) -> anyhow::Result<Option<DaemonSet>>;

    /// Returns true if the ConfigMap exists.
    async fn config_map_exists(&self, namespace: &str, name: &str) -> anyhow::Result<bool>;

    /// Returns the apiserver version from the discovery endpoint as `MAJOR.MINOR.0`.
    async fn server_version(&self) -> anyhow::Result<Version>;

    /// Applies a JSON merge patch.
    async fn merge_patch(&self, target: &ObjectRef, patch: &Value) -> anyhow::Result<()>;

    /// Creates `secret` unless it already exists; returns the stored object.
    async fn create_secret_if_absent(&self, secret: Secret) -> anyhow::Result<Secret>;

    /// Deletes an object; a missing object is not an error.
    async fn delete(&self, target: &ObjectRef) -> anyhow::Result<()>;
}

/// [`ClusterApi`] backed by a kube-rs client.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wraps a client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespace<'a>(target: &'a ObjectRef) -> anyhow::Result<&'a str> {
        target
            .namespace
            .as_deref()
            .with_context(|| format!("{} requires a namespace", target))
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

/// Parses the discovery `minor` field, which may carry a `+` suffix.
pub(crate) fn parse_discovery_version(major: &str, minor: &str) -> anyhow::Result<Version> {
    let digits = |s: &str| -> anyhow::Result<u64> {
        let trimmed: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
        trimmed
            .parse()
            .with_context(|| format!("invalid discovery version component {:?}", s))
    };
    Ok(Version::new(digits(major)?, digits(minor)?, 0))
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_nodes(&self) -> anyhow::Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .context("failed to list nodes")?;
        Ok(list.items)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> anyhow::Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .with_context(|| format!("failed to list pods {:?} in {}", label_selector, namespace))?;
        Ok(list.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .with_context(|| format!("failed to get secret {}/{}", namespace, name))
    }

    async fn get_daemonset(&self, namespace: &str, name: &str) -> anyhow::Result<Option<DaemonSet>> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .with_context(|| format!("failed to get daemonset {}/{}", namespace, name))
    }

    async fn config_map_exists(&self, namespace: &str, name: &str) -> anyhow::Result<bool> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = api
            .get_opt(name)
            .await
            .with_context(|| format!("failed to get configmap {}/{}", namespace, name))?;
        Ok(cm.is_some())
    }

    async fn server_version(&self) -> anyhow::Result<Version> {
        let info = self
            .client
            .apiserver_version()
            .await
            .context("failed to query apiserver version")?;
        parse_discovery_version(&info.major, &info.minor)
    }

    async fn merge_patch(&self, target: &ObjectRef, patch: &Value) -> anyhow::Result<()> {
        let params = PatchParams::default();
        let body = Patch::Merge(patch);
        let res = match target.kind {
            ObjectKind::Node => {
                let api: Api<Node> = Api::all(self.client.clone());
                api.patch(&target.name, &params, &body).await.map(|_| ())
            }
            ObjectKind::Secret => {
                let api: Api<Secret> =
                    Api::namespaced(self.client.clone(), Self::namespace(target)?);
                api.patch(&target.name, &params, &body).await.map(|_| ())
            }
            ObjectKind::ConfigMap => {
                let api: Api<ConfigMap> =
                    Api::namespaced(self.client.clone(), Self::namespace(target)?);
                api.patch(&target.name, &params, &body).await.map(|_| ())
            }
        };
        res.with_context(|| format!("failed to patch {}", target))
    }

    async fn create_secret_if_absent(&self, secret: Secret) -> anyhow::Result<Secret> {
        let namespace = secret
            .metadata
            .namespace
            .clone()
            .context("secret has no namespace")?;
        let name = secret.metadata.name.clone().context("secret has no name")?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);

        match api.create(&PostParams::default(), &secret).await {
            Ok(created) => Ok(created),
            Err(e) if is_status(&e, 409) => {
                debug!(secret = %name, "secret already exists, reading it back");
                api.get(&name)
                    .await
                    .with_context(|| format!("failed to get secret {}/{}", namespace, name))
            }
            Err(e) => Err(e).with_context(|| format!("failed to create secret {}/{}", namespace, name)),
        }
    }

    async fn delete(&self, target: &ObjectRef) -> anyhow::Result<()> {
        let params = DeleteParams::default();
        let res = match target.kind {
            ObjectKind::Node => {
                let api: Api<Node> = Api::all(self.client.clone());
                api.delete(&target.name, &params).await.map(|_| ())
            }
            ObjectKind::Secret => {
                let api: Api<Secret> =
                    Api::namespaced(self.client.clone(), Self::namespace(target)?);
                api.delete(&target.name, &params).await.map(|_| ())
            }
            ObjectKind::ConfigMap => {
                let api: Api<ConfigMap> =
                    Api::namespaced(self.client.clone(), Self::namespace(target)?);
                api.delete(&target.name, &params).await.map(|_| ())
            }
        };
        match res {
            Err(e) if is_status(&e, 404) => Ok(()),
            other => other.with_context(|| format!("failed to delete {}", target)),
        }
    }
}

/// Watches Nodes and the namespaced Pods, Secrets and DaemonSets, yielding
/// the kind of every changed object.
pub fn kube_events(client: Client, namespace: &str) -> BoxStream<'static, ResourceKind> {
    stream::select_all([
        watch(Api::<Node>::all(client.clone()), ResourceKind::Node),
        watch(Api::<Pod>::namespaced(client.clone(), namespace), ResourceKind::Pod),
        watch(Api::<Secret>::namespaced(client.clone(), namespace), ResourceKind::Secret),
        watch(Api::<DaemonSet>::namespaced(client, namespace), ResourceKind::DaemonSet),
    ])
    .boxed()
}

fn watch<K>(api: Api<K>, kind: ResourceKind) -> BoxStream<'static, ResourceKind>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(move |event| async move {
            match event {
                Ok(watcher::Event::Apply(_)) | Ok(watcher::Event::Delete(_)) => Some(kind),
                Ok(_) => None,
                Err(e) => {
                    warn!(kind = ?kind, error = %e, "watch failed");
                    None
                }
            }
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_discovery_version() {
        assert_eq!(parse_discovery_version("1", "29").unwrap(), Version::new(1, 29, 0));
        assert_eq!(parse_discovery_version("1", "30+").unwrap(), Version::new(1, 30, 0));
        assert!(parse_discovery_version("", "30").is_err());
    }
}
