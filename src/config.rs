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

//! Runtime configuration of the hooks process.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Kubernetes version this release installs by default.
pub const DEFAULT_KUBERNETES_VERSION: &str = "1.29";

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HooksConfig {
    /// Namespace of the control-plane objects.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Deadline of every etcd RPC.
    #[serde(default = "default_etcd_request_timeout", with = "humantime_serde")]
    pub etcd_request_timeout: Duration,

    /// Ceiling of internal polling loops.
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,

    /// Pacing of internal polling loops.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Base period of the full before-helm/after-helm resync. Jittered.
    #[serde(default = "default_resync_period", with = "humantime_serde")]
    pub resync_period: Duration,

    /// Version `Automatic` resolves to and the persisted platform default.
    #[serde(default = "default_kubernetes_version")]
    pub default_kubernetes_version: String,

    /// kubectl cache directories dropped when the effective version changes.
    #[serde(default = "default_kube_cache_dirs")]
    pub kube_cache_dirs: Vec<PathBuf>,

    /// Address of the health and metrics server.
    #[serde(default = "default_healthz_bind_address")]
    pub healthz_bind_address: String,

    /// Port of the health and metrics server.
    #[serde(default = "default_healthz_bind_port")]
    pub healthz_bind_port: u16,

    /// File the published values are written to after every successful pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_output: Option<PathBuf>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            etcd_request_timeout: default_etcd_request_timeout(),
            poll_timeout: default_poll_timeout(),
            poll_interval: default_poll_interval(),
            resync_period: default_resync_period(),
            default_kubernetes_version: default_kubernetes_version(),
            kube_cache_dirs: default_kube_cache_dirs(),
            healthz_bind_address: default_healthz_bind_address(),
            healthz_bind_port: default_healthz_bind_port(),
            values_output: None,
        }
    }
}

fn default_namespace() -> String {
    "kube-system".to_string()
}

fn default_etcd_request_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_resync_period() -> Duration {
    Duration::from_secs(300)
}

fn default_kubernetes_version() -> String {
    DEFAULT_KUBERNETES_VERSION.to_string()
}

fn default_kube_cache_dirs() -> Vec<PathBuf> {
    match std::env::var_os("HOME") {
        Some(home) => {
            let kube = PathBuf::from(home).join(".kube");
            vec![kube.join("http-cache"), kube.join("cache")]
        }
        None => Vec::new(),
    }
}

fn default_healthz_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_healthz_bind_port() -> u16 {
    9680
}

/// Module for duration serialization/deserialization with human-readable format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
