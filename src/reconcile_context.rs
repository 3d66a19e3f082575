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

//! Reconcile context - shared collaborators for all reconcilers.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::HooksConfig;
use crate::etcd::EtcdConnector;
use crate::hooks::feature_gates::FeatureTable;
use crate::kube_api::ClusterApi;
use crate::requirements::RequirementsRegistry;

/// Shared context for all reconcilers.
///
/// Holds the collaborators a reconciler may call during a pass. Nothing here
/// carries per-pass state; that lives on [`crate::pass::Pass`].
#[derive(Clone)]
pub struct ReconcileContext {
    /// Kubernetes API.
    pub cluster: Arc<dyn ClusterApi>,

    /// Builds etcd clients from per-pass credentials.
    pub etcd: Arc<dyn EtcdConnector>,

    /// Runtime configuration.
    pub config: Arc<HooksConfig>,

    /// Platform requirements registry.
    pub requirements: Arc<RequirementsRegistry>,

    /// Feature-gate capability table.
    pub feature_table: Arc<FeatureTable>,

    /// Function to generate resync periods.
    ///
    /// Jittered so that replicas restarted together do not resync in lockstep.
    pub resync_period_fn: Arc<dyn Fn() -> Duration + Send + Sync>,
}

impl ReconcileContext {
    /// Creates a new reconcile context with the built-in feature table and a
    /// jittered resync period derived from `config`.
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        etcd: Arc<dyn EtcdConnector>,
        config: Arc<HooksConfig>,
    ) -> Self {
        let resync = config.resync_period;
        Self {
            cluster,
            etcd,
            config,
            requirements: Arc::new(RequirementsRegistry::new()),
            feature_table: Arc::new(FeatureTable::builtin()),
            resync_period_fn: Arc::new(resync_period_fn(resync)),
        }
    }

    /// Replaces the feature table.
    pub fn with_feature_table(mut self, table: FeatureTable) -> Self {
        self.feature_table = Arc::new(table);
        self
    }

    /// Returns the next resync period.
    pub fn resync_period(&self) -> Duration {
        (self.resync_period_fn)()
    }

    /// Namespace of the control-plane objects.
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }
}

impl std::fmt::Debug for ReconcileContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileContext")
            .field("config", &self.config)
            .field("requirements", &self.requirements)
            .finish_non_exhaustive()
    }
}

/// Creates a resync period function with the given base duration.
///
/// The returned function adds between 0 and 100% random jitter.
pub fn resync_period_fn(base: Duration) -> impl Fn() -> Duration + Send + Sync {
    move || {
        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(0.0..1.0);
        Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resync_period_fn() {
        let base = Duration::from_secs(60);
        let fn_resync = resync_period_fn(base);

        let mut periods = std::collections::HashSet::new();
        for _ in 0..10 {
            let period = fn_resync();
            assert!(period >= base && period < base * 2);
            periods.insert(period);
        }

        assert!(periods.len() > 1);
    }
}
