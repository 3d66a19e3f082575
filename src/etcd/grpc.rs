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

//! etcd v3 gRPC implementation backed by `etcd-client`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Certificate, Client, ConnectOptions, Identity, TlsOptions};
use tokio::sync::Mutex;

use super::{EtcdClient, EtcdConnector, EtcdCredentials, EtcdEndpoint, EtcdError, EtcdMember, EtcdStatus};

/// Connects to etcd over CA-pinned mutual TLS.
#[derive(Debug, Clone)]
pub struct GrpcEtcdConnector {
    request_timeout: Duration,
}

impl GrpcEtcdConnector {
    /// Creates a connector whose RPCs are bounded by `request_timeout`.
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl EtcdConnector for GrpcEtcdConnector {
    async fn connect(
        &self,
        endpoints: &[EtcdEndpoint],
        credentials: &EtcdCredentials,
    ) -> Result<Box<dyn EtcdClient>, EtcdError> {
        let client = dial(endpoints, credentials, self.request_timeout).await?;
        Ok(Box::new(GrpcEtcdClient {
            client: Mutex::new(client),
            credentials: credentials.clone(),
            request_timeout: self.request_timeout,
        }))
    }
}

async fn dial(
    endpoints: &[EtcdEndpoint],
    credentials: &EtcdCredentials,
    request_timeout: Duration,
) -> Result<Client, EtcdError> {
    let urls: Vec<String> = endpoints.iter().map(|e| e.as_str().to_string()).collect();

    let tls = TlsOptions::new()
        .ca_certificate(Certificate::from_pem(credentials.ca.clone()))
        .identity(Identity::from_pem(
            credentials.cert.clone(),
            credentials.key.clone(),
        ));
    let options = ConnectOptions::new()
        .with_tls(tls)
        .with_connect_timeout(request_timeout)
        .with_timeout(request_timeout);

    let connect = Client::connect(urls.clone(), Some(options));
    match tokio::time::timeout(request_timeout, connect).await {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(e)) => Err(EtcdError::Connect {
            endpoints: urls,
            source: Box::new(e),
        }),
        Err(_) => Err(EtcdError::Timeout {
            op: "connect",
            after: request_timeout,
        }),
    }
}

/// A connected etcd client.
///
/// `etcd-client` methods take `&mut self`, so the client sits behind a mutex.
/// Per-member calls (`Status`, `Defragment`) dial the member directly.
pub struct GrpcEtcdClient {
    client: Mutex<Client>,
    credentials: EtcdCredentials,
    request_timeout: Duration,
}

impl GrpcEtcdClient {
    async fn deadline<T, F>(&self, op: &'static str, fut: F) -> Result<T, EtcdError>
    where
        F: Future<Output = Result<T, etcd_client::Error>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(res) => res.map_err(|e| EtcdError::request(op, e)),
            Err(_) => Err(EtcdError::Timeout {
                op,
                after: self.request_timeout,
            }),
        }
    }

    async fn member_client(&self, endpoint: &EtcdEndpoint) -> Result<Client, EtcdError> {
        dial(
            std::slice::from_ref(endpoint),
            &self.credentials,
            self.request_timeout,
        )
        .await
    }
}

#[async_trait]
impl EtcdClient for GrpcEtcdClient {
    async fn member_list(&self) -> Result<Vec<EtcdMember>, EtcdError> {
        let mut client = self.client.lock().await;
        let resp = self.deadline("member list", client.member_list()).await?;
        Ok(resp
            .members()
            .iter()
            .map(|m| EtcdMember {
                id: m.id(),
                name: m.name().to_string(),
                peer_urls: m.peer_urls().to_vec(),
            })
            .collect())
    }

    async fn member_update(&self, id: u64, peer_urls: Vec<String>) -> Result<(), EtcdError> {
        let mut client = self.client.lock().await;
        self.deadline("member update", client.member_update(id, peer_urls))
            .await?;
        Ok(())
    }

    async fn member_remove(&self, id: u64) -> Result<(), EtcdError> {
        let mut client = self.client.lock().await;
        self.deadline("member remove", client.member_remove(id))
            .await?;
        Ok(())
    }

    async fn status(&self, endpoint: &EtcdEndpoint) -> Result<EtcdStatus, EtcdError> {
        let mut client = self.member_client(endpoint).await?;
        let resp = self.deadline("status", client.status()).await?;
        Ok(EtcdStatus {
            db_size: resp.db_size(),
        })
    }

    async fn defragment(&self, endpoint: &EtcdEndpoint) -> Result<(), EtcdError> {
        let mut client = self.member_client(endpoint).await?;
        self.deadline("defragment", client.defragment()).await?;
        Ok(())
    }
}
