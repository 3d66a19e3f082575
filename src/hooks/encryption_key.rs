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

//! Secret envelope-encryption key provisioner.
//!
//! The key is created once, when encryption is first enabled, and is never
//! rotated or deleted here.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use crate::pass::Pass;
use crate::reconcile_context::ReconcileContext;
use crate::reconciler::{cancellable, CancellationToken, ReconcileError, Reconciler, Result};
use crate::reconciler_descriptor::{ReconcilerDescriptor, ReconcilerRegistry, ResourceKind};
use crate::snapshot::{secret_data, ENCRYPTION_KEY_DATA_KEY, ENCRYPTION_KEY_SECRET};

/// Reconciler name.
pub const NAME: &str = "secret-encryption-key";

/// Length of the generated key in bytes.
pub const KEY_LENGTH: usize = 32;

fn key_secret(namespace: &str, key: Vec<u8>) -> Secret {
    let labels: BTreeMap<String, String> = [
        ("heritage", "deckhouse"),
        ("module", "control-plane-manager"),
        ("name", ENCRYPTION_KEY_SECRET),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    Secret {
        metadata: ObjectMeta {
            name: Some(ENCRYPTION_KEY_SECRET.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(
            [(ENCRYPTION_KEY_DATA_KEY.to_string(), ByteString(key))]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    }
}

fn stored_key(data: &BTreeMap<String, Vec<u8>>) -> Result<&[u8]> {
    data.get(ENCRYPTION_KEY_DATA_KEY)
        .filter(|k| !k.is_empty())
        .map(Vec::as_slice)
        .ok_or_else(|| {
            ReconcileError::MalformedState(format!(
                "secret {} has no {:?}",
                ENCRYPTION_KEY_SECRET, ENCRYPTION_KEY_DATA_KEY
            ))
        })
}

/// Ensures the encryption key secret and publishes `secretEncryptionKey`.
#[derive(Debug, Default)]
pub struct EncryptionKey;

#[async_trait]
impl Reconciler for EncryptionKey {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        pass: &mut Pass,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(data) = pass.snapshot.encryption_key.clone() {
            let key = stored_key(&data)?;
            pass.values.internal_mut().secret_encryption_key = Some(STANDARD.encode(key));
            return Ok(());
        }

        if !pass.values.control_plane_manager.apiserver.encryption_enabled {
            debug!(reconciler = NAME, "encryption disabled and no key present");
            pass.values.internal_mut().secret_encryption_key = None;
            return Ok(());
        }

        let mut key = vec![0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);

        let secret = key_secret(ctx.namespace(), key);
        let stored = cancellable(cancel, async {
            Ok(ctx.cluster.create_secret_if_absent(secret).await?)
        })
        .await?;
        info!(
            reconciler = NAME,
            secret = ENCRYPTION_KEY_SECRET,
            "ensured secret encryption key"
        );

        let data = secret_data(&stored);
        let key = stored_key(&data)?;
        pass.values.internal_mut().secret_encryption_key = Some(STANDARD.encode(key));
        Ok(())
    }
}

/// Registers the key provisioner.
pub fn register(registry: &mut ReconcilerRegistry) {
    registry.register(
        ReconcilerDescriptor::builder(NAME)
            .before_helm(10)
            .subscribe(ResourceKind::Secret)
            .build(EncryptionKey),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{self, ClusterCall, FakeCluster, FakeEtcd};
    use crate::hooks::testing;
    use crate::snapshot::ClusterSnapshot;
    use crate::values::Values;
    use std::sync::Arc;

    fn enabled() -> Values {
        let mut values = Values::default();
        values.control_plane_manager.apiserver.encryption_enabled = true;
        values
    }

    #[tokio::test]
    async fn test_disabled_without_key_publishes_nothing() {
        let cluster = Arc::new(FakeCluster::new());
        let ctx = testing::context(cluster.clone(), FakeEtcd::new());
        let mut pass = testing::pass(ClusterSnapshot::default(), Values::default());

        EncryptionKey
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap();
        assert!(pass.values.internal().secret_encryption_key.is_none());
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_creates_key_once() {
        let cluster = Arc::new(FakeCluster::new());
        let ctx = testing::context(cluster.clone(), FakeEtcd::new());
        let mut pass = testing::pass(ClusterSnapshot::default(), enabled());

        EncryptionKey
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap();

        let published = pass.values.internal().secret_encryption_key.clone().unwrap();
        assert_eq!(STANDARD.decode(&published).unwrap().len(), KEY_LENGTH);
        assert_eq!(
            cluster.calls(),
            vec![ClusterCall::Create {
                target: crate::patch::ObjectRef::secret("kube-system", ENCRYPTION_KEY_SECRET)
            }]
        );

        let stored = cluster.secret("kube-system", ENCRYPTION_KEY_SECRET).unwrap();
        let labels = stored.metadata.labels.unwrap();
        assert_eq!(labels["module"], "control-plane-manager");
        assert_eq!(labels["name"], ENCRYPTION_KEY_SECRET);
    }

    #[tokio::test]
    async fn test_concurrent_creation_accepts_existing() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_secret(fake::secret(
            ENCRYPTION_KEY_SECRET,
            &[(ENCRYPTION_KEY_DATA_KEY, &[7u8; KEY_LENGTH])],
        ));
        let ctx = testing::context(cluster.clone(), FakeEtcd::new());
        // The snapshot predates the other writer.
        let mut pass = testing::pass(ClusterSnapshot::default(), enabled());

        EncryptionKey
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            pass.values.internal().secret_encryption_key,
            Some(STANDARD.encode([7u8; KEY_LENGTH]))
        );
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_existing_key_published_even_when_disabled() {
        let mut data = BTreeMap::new();
        data.insert(ENCRYPTION_KEY_DATA_KEY.to_string(), vec![1u8; KEY_LENGTH]);
        let snapshot = ClusterSnapshot {
            encryption_key: Some(data),
            ..Default::default()
        };
        let ctx = testing::context(Arc::new(FakeCluster::new()), FakeEtcd::new());
        let mut pass = testing::pass(snapshot, Values::default());

        EncryptionKey
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            pass.values.internal().secret_encryption_key,
            Some(STANDARD.encode([1u8; KEY_LENGTH]))
        );
    }
}
