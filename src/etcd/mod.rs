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

//! etcd collaborator.
//!
//! Reconcilers talk to etcd through [`EtcdConnector`] and [`EtcdClient`] so the
//! gRPC implementation can be swapped for mocks and in-memory fakes. The
//! credentials are derived from the PKI secret of the current pass and are
//! never cached between passes.

pub mod grpc;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::pki::{self, ParsedCertificate};
use crate::reconciler::BoxError;

/// Client port of every etcd member.
pub const ETCD_CLIENT_PORT: u16 = 2379;

/// Default `--quota-backend-bytes` of an etcd instance (2 GiB).
pub const DEFAULT_ETCD_MAX_SIZE: i64 = 2 * 1024 * 1024 * 1024;

/// Key of the etcd CA certificate in the PKI secret.
pub const ETCD_CA_CERT_KEY: &str = "etcd-ca.crt";

/// Key of the etcd CA private key in the PKI secret.
pub const ETCD_CA_KEY_KEY: &str = "etcd-ca.key";

/// Errors returned by etcd operations.
#[derive(Error, Debug)]
pub enum EtcdError {
    /// The client could not be built or could not reach any endpoint.
    #[error("failed to connect to etcd {endpoints:?}: {source}")]
    Connect {
        endpoints: Vec<String>,
        #[source]
        source: BoxError,
    },

    /// An RPC returned an error.
    #[error("etcd {op} failed: {source}")]
    Request {
        op: &'static str,
        #[source]
        source: BoxError,
    },

    /// An RPC did not complete before the request deadline.
    #[error("etcd {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

impl EtcdError {
    /// Wraps an RPC error.
    pub fn request(op: &'static str, source: impl Into<BoxError>) -> Self {
        EtcdError::Request {
            op,
            source: source.into(),
        }
    }
}

/// A client URL of one etcd member.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EtcdEndpoint(String);

impl EtcdEndpoint {
    /// Builds `https://<ip>:2379`, bracketing IPv6 addresses.
    pub fn for_ip(ip: &str) -> Self {
        if ip.contains(':') && !ip.starts_with('[') {
            Self(format!("https://[{}]:{}", ip, ETCD_CLIENT_PORT))
        } else {
            Self(format!("https://{}:{}", ip, ETCD_CLIENT_PORT))
        }
    }

    /// Returns the URL.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EtcdEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A member as reported by `MemberList`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdMember {
    /// Member id.
    pub id: u64,
    /// Member name. Empty for members that have not started yet.
    pub name: String,
    /// Advertised peer URLs.
    pub peer_urls: Vec<String>,
}

/// Subset of the `Status` response the reconcilers need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtcdStatus {
    /// Size of the backend database in bytes.
    pub db_size: i64,
}

/// PEM-encoded TLS material used to reach etcd.
#[derive(Clone, PartialEq, Eq)]
pub struct EtcdCredentials {
    /// CA bundle used to verify members.
    pub ca: Vec<u8>,
    /// Client certificate.
    pub cert: Vec<u8>,
    /// Client private key.
    pub key: Vec<u8>,
}

impl fmt::Debug for EtcdCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdCredentials")
            .field("ca", &format_args!("{} bytes", self.ca.len()))
            .field("cert", &format_args!("{} bytes", self.cert.len()))
            .field("key", &"<redacted>")
            .finish()
    }
}

impl EtcdCredentials {
    /// Extracts the etcd CA pair from the PKI secret data.
    ///
    /// The CA certificate doubles as the client certificate. Returns the
    /// parsed certificate along with the credentials.
    pub fn from_pki(
        data: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(Self, ParsedCertificate), CredentialsError> {
        let ca = data
            .get(ETCD_CA_CERT_KEY)
            .filter(|v| !v.is_empty())
            .ok_or(CredentialsError::Missing(ETCD_CA_CERT_KEY))?;
        let key = data
            .get(ETCD_CA_KEY_KEY)
            .filter(|v| !v.is_empty())
            .ok_or(CredentialsError::Missing(ETCD_CA_KEY_KEY))?;

        let parsed = pki::parse_certificate_pem(ca)?;
        pki::validate_private_key_pem(key)?;

        Ok((
            Self {
                ca: ca.clone(),
                cert: ca.clone(),
                key: key.clone(),
            },
            parsed,
        ))
    }
}

/// Errors extracting [`EtcdCredentials`].
#[derive(Error, Debug)]
pub enum CredentialsError {
    /// A required key is absent from the PKI secret.
    #[error("pki secret has no {0:?}")]
    Missing(&'static str),

    /// The certificate or key is not usable.
    #[error(transparent)]
    Certificate(#[from] pki::CertificateError),
}

/// Operations the reconcilers issue against an etcd cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EtcdClient: Send + Sync {
    /// Lists cluster members.
    async fn member_list(&self) -> Result<Vec<EtcdMember>, EtcdError>;

    /// Replaces the peer URLs of a member.
    async fn member_update(&self, id: u64, peer_urls: Vec<String>) -> Result<(), EtcdError>;

    /// Removes a member from the cluster.
    async fn member_remove(&self, id: u64) -> Result<(), EtcdError>;

    /// Returns the status of the member serving `endpoint`.
    async fn status(&self, endpoint: &EtcdEndpoint) -> Result<EtcdStatus, EtcdError>;

    /// Defragments the member serving `endpoint`.
    async fn defragment(&self, endpoint: &EtcdEndpoint) -> Result<(), EtcdError>;
}

/// Builds [`EtcdClient`]s for a set of endpoints.
#[async_trait]
pub trait EtcdConnector: Send + Sync {
    /// Connects to the cluster through `endpoints`.
    async fn connect(
        &self,
        endpoints: &[EtcdEndpoint],
        credentials: &EtcdCredentials,
    ) -> Result<Box<dyn EtcdClient>, EtcdError>;
}

/// Extracts the value of `--<flag>=` from a container command line.
///
/// The first match wins.
pub fn find_flag<'a, I>(args: I, flag: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a String>,
{
    let prefix = format!("--{}=", flag);
    args.into_iter()
        .find_map(|arg| arg.strip_prefix(prefix.as_str()))
}
