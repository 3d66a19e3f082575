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

//! etcd client certificates for rendering.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::warn;

use crate::etcd::EtcdCredentials;
use crate::pass::Pass;
use crate::reconcile_context::ReconcileContext;
use crate::reconciler::{CancellationToken, ReconcileError, Reconciler, Result};
use crate::reconciler_descriptor::{ReconcilerDescriptor, ReconcilerRegistry, ResourceKind};
use crate::snapshot::PKI_SECRET;
use crate::values::EtcdCertsValues;

/// Reconciler name.
pub const NAME: &str = "etcd-certs";

/// Warn when the etcd CA expires within this many days.
const EXPIRY_WARNING_DAYS: i64 = 30;

/// Publishes `etcdCerts` from the PKI secret.
#[derive(Debug, Default)]
pub struct EtcdCerts;

#[async_trait]
impl Reconciler for EtcdCerts {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        pass: &mut Pass,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let data = pass.snapshot.pki.as_ref().ok_or_else(|| {
            ReconcileError::MissingInput(format!(
                "secret {}/{} not found",
                ctx.namespace(),
                PKI_SECRET
            ))
        })?;

        let (credentials, parsed) = EtcdCredentials::from_pki(data)
            .map_err(|e| ReconcileError::MalformedState(format!("{}: {}", PKI_SECRET, e)))?;

        if parsed.expires_within(chrono::Duration::days(EXPIRY_WARNING_DAYS), chrono::Utc::now()) {
            warn!(
                reconciler = NAME,
                subject = %parsed.common_name,
                not_after = %parsed.not_after,
                "etcd CA certificate expires soon"
            );
        }

        pass.values.internal_mut().etcd_certs = Some(EtcdCertsValues {
            ca: STANDARD.encode(&credentials.ca),
            crt: STANDARD.encode(&credentials.cert),
            key: STANDARD.encode(&credentials.key),
        });
        Ok(())
    }
}

/// Registers the certificate publisher.
pub fn register(registry: &mut ReconcilerRegistry) {
    registry.register(
        ReconcilerDescriptor::builder(NAME)
            .before_helm(10)
            .subscribe(ResourceKind::Secret)
            .build(EtcdCerts),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etcd::ETCD_CA_CERT_KEY;
    use crate::fake::{FakeCluster, FakeEtcd};
    use crate::hooks::testing;
    use crate::snapshot::ClusterSnapshot;
    use crate::values::Values;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_publishes_base64_certs() {
        let data = testing::pki_data();
        let ca = data[ETCD_CA_CERT_KEY].clone();
        let snapshot = ClusterSnapshot {
            pki: Some(data),
            ..Default::default()
        };
        let ctx = testing::context(Arc::new(FakeCluster::new()), FakeEtcd::new());
        let mut pass = testing::pass(snapshot, Values::default());

        EtcdCerts
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap();

        let certs = pass.values.internal().etcd_certs.clone().unwrap();
        assert_eq!(STANDARD.decode(&certs.ca).unwrap(), ca);
        assert_eq!(certs.ca, certs.crt);
        assert!(STANDARD.decode(&certs.key).unwrap().starts_with(b"-----BEGIN"));
    }

    #[tokio::test]
    async fn test_garbage_certificate_is_malformed() {
        let mut data = testing::pki_data();
        data.insert(ETCD_CA_CERT_KEY.to_string(), b"not a certificate".to_vec());
        let snapshot = ClusterSnapshot {
            pki: Some(data),
            ..Default::default()
        };
        let ctx = testing::context(Arc::new(FakeCluster::new()), FakeEtcd::new());
        let mut pass = testing::pass(snapshot, Values::default());

        let err = EtcdCerts
            .reconcile(&ctx, &mut pass, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MalformedState(_)));
    }
}
