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

//! Control-plane reconcilers.
//!
//! Each submodule holds one reconciler and a `register` function adding its
//! descriptor to a [`ReconcilerRegistry`]. [`registry`] builds the full set.

pub mod effective_version;
pub mod encryption_key;
pub mod etcd_certs;
pub mod etcd_defrag;
pub mod etcd_members;
pub mod etcd_peer_url;
pub mod etcd_quota;
pub mod feature_gates;
pub mod kubeadm_config_cleanup;
pub mod lock_main_queue;
pub mod master_nodes;
pub mod pki_checksum;
pub mod update_approval;

use crate::etcd::{CredentialsError, EtcdClient, EtcdCredentials, EtcdEndpoint};
use crate::pass::Pass;
use crate::reconcile_context::ReconcileContext;
use crate::reconciler::{cancellable, CancellationToken, ReconcileError, Result};
use crate::reconciler_descriptor::ReconcilerRegistry;
use crate::snapshot::PKI_SECRET;

/// Builds the registry of every control-plane reconciler.
pub fn registry() -> ReconcilerRegistry {
    let mut registry = ReconcilerRegistry::new();
    feature_gates::register(&mut registry);
    master_nodes::register(&mut registry);
    etcd_certs::register(&mut registry);
    pki_checksum::register(&mut registry);
    encryption_key::register(&mut registry);
    etcd_quota::register(&mut registry);
    etcd_members::register(&mut registry);
    etcd_peer_url::register(&mut registry);
    etcd_defrag::register(&mut registry);
    update_approval::register(&mut registry);
    effective_version::register(&mut registry);
    lock_main_queue::register(&mut registry);
    kubeadm_config_cleanup::register(&mut registry);
    registry
}

/// Reads the etcd client credentials from this pass's PKI secret.
pub(crate) fn etcd_credentials(ctx: &ReconcileContext, pass: &Pass) -> Result<EtcdCredentials> {
    let pki = pass.snapshot.pki.as_ref().ok_or_else(|| {
        ReconcileError::MissingInput(format!("secret {}/{} not found", ctx.namespace(), PKI_SECRET))
    })?;
    match EtcdCredentials::from_pki(pki) {
        Ok((credentials, _)) => Ok(credentials),
        Err(e @ CredentialsError::Missing(_)) => Err(ReconcileError::MissingInput(e.to_string())),
        Err(e) => Err(ReconcileError::MalformedState(format!("{}: {}", PKI_SECRET, e))),
    }
}

/// Connects to etcd through `endpoints` with the credentials of this pass.
pub(crate) async fn connect_etcd(
    ctx: &ReconcileContext,
    pass: &Pass,
    endpoints: &[EtcdEndpoint],
    cancel: &CancellationToken,
) -> Result<Box<dyn EtcdClient>> {
    let credentials = etcd_credentials(ctx, pass)?;
    cancellable(cancel, async {
        Ok(ctx.etcd.connect(endpoints, &credentials).await?)
    })
    .await
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers shared by the reconciler unit tests.

    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::config::HooksConfig;
    use crate::etcd::{
        EtcdClient, EtcdConnector, EtcdCredentials, EtcdEndpoint, EtcdError, ETCD_CA_CERT_KEY,
        ETCD_CA_KEY_KEY,
    };
    use crate::fake::{FakeCluster, FakeEtcd};
    use crate::pass::Pass;
    use crate::reconcile_context::ReconcileContext;
    use crate::reconciler_descriptor::Trigger;
    use crate::snapshot::ClusterSnapshot;
    use crate::values::Values;

    /// PKI secret data carrying a freshly generated etcd CA.
    pub fn pki_data() -> BTreeMap<String, Vec<u8>> {
        let generated =
            rcgen::generate_simple_self_signed(vec!["etcd-ca".to_string()]).unwrap();
        let mut data = BTreeMap::new();
        data.insert(ETCD_CA_CERT_KEY.to_string(), generated.cert.pem().into_bytes());
        data.insert(
            ETCD_CA_KEY_KEY.to_string(),
            generated.key_pair.serialize_pem().into_bytes(),
        );
        data
    }

    /// A context over in-memory collaborators.
    pub fn context(cluster: Arc<FakeCluster>, etcd: FakeEtcd) -> ReconcileContext {
        ReconcileContext::new(cluster, Arc::new(etcd), Arc::new(HooksConfig::default()))
    }

    /// A before-helm pass over `snapshot`.
    pub fn pass(snapshot: ClusterSnapshot, values: Values) -> Pass {
        Pass::new(Trigger::BeforeHelm, Arc::new(snapshot), values)
    }

    /// Connector handing out one prepared client, recording the endpoints.
    pub struct SingleClient {
        client: Mutex<Option<Box<dyn EtcdClient>>>,
        pub endpoints: Mutex<Vec<Vec<EtcdEndpoint>>>,
    }

    impl SingleClient {
        pub fn new(client: impl EtcdClient + 'static) -> Self {
            Self {
                client: Mutex::new(Some(Box::new(client))),
                endpoints: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EtcdConnector for SingleClient {
        async fn connect(
            &self,
            endpoints: &[EtcdEndpoint],
            _credentials: &EtcdCredentials,
        ) -> Result<Box<dyn EtcdClient>, EtcdError> {
            self.endpoints.lock().unwrap().push(endpoints.to_vec());
            self.client
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| EtcdError::request("connect", "client already taken"))
        }
    }

    /// A context whose etcd connector hands out `client` once.
    pub fn context_with_client(
        cluster: Arc<FakeCluster>,
        client: impl EtcdClient + 'static,
    ) -> ReconcileContext {
        ReconcileContext::new(
            cluster,
            Arc::new(SingleClient::new(client)),
            Arc::new(HooksConfig::default()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler_descriptor::Trigger;

    #[test]
    fn test_registry_phase_order() {
        let registry = registry();
        assert_eq!(registry.len(), 13);

        let before: Vec<_> = registry
            .for_trigger(&Trigger::BeforeHelm)
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(before.first().map(String::as_str), Some("feature-gates"));
        assert_eq!(before.last().map(String::as_str), Some("effective-kubernetes-version"));
        assert!(!before.contains(&"lock-main-queue".to_string()));

        let after: Vec<_> = registry
            .for_trigger(&Trigger::AfterHelm)
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(after, vec!["lock-main-queue"]);

        let startup: Vec<_> = registry
            .for_trigger(&Trigger::Startup)
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(startup, vec!["kubeadm-config-cleanup"]);

        let defrag = registry.for_trigger(&Trigger::Schedule(etcd_defrag::SCHEDULE.to_string()));
        assert_eq!(defrag.len(), 1);
    }
}
