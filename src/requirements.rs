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

//! Platform upgrade requirements.
//!
//! Reconcilers save observed facts under string keys; the platform asks
//! registered checkers whether a release requirement is satisfied.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::values::Values;
use crate::version::{Version, VersionError};

/// Key under which the minimal observed kubelet version is saved.
pub const MIN_USED_CONTROL_PLANE_VERSION_KEY: &str =
    "controlPlaneManager:minUsedControlPlaneKubernetesVersion";

/// Name of the Kubernetes version checker.
pub const K8S_REQUIREMENT: &str = "k8s";

/// Errors evaluating a requirement.
#[derive(Error, Debug)]
pub enum RequirementError {
    /// No checker registered under this name.
    #[error("unknown requirement {0:?}")]
    Unknown(String),

    /// The checker has nothing to compare against.
    #[error("requirement {0:?} cannot be evaluated: {1}")]
    Unavailable(String, String),

    /// A version did not parse.
    #[error(transparent)]
    Version(#[from] VersionError),
}

type Checker = Box<dyn Fn(&str, &Values) -> Result<bool, RequirementError> + Send + Sync>;

/// Saved values and requirement checkers.
pub struct RequirementsRegistry {
    saved: RwLock<BTreeMap<String, String>>,
    checkers: HashMap<String, Checker>,
}

impl Default for RequirementsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequirementsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.checkers.keys().collect();
        names.sort();
        f.debug_struct("RequirementsRegistry")
            .field("checkers", &names)
            .finish()
    }
}

impl RequirementsRegistry {
    /// Creates a registry with the `k8s` checker.
    pub fn new() -> Self {
        let mut registry = Self {
            saved: RwLock::new(BTreeMap::new()),
            checkers: HashMap::new(),
        };
        registry.register(K8S_REQUIREMENT, check_kubernetes_version);
        registry
    }

    /// Registers a checker.
    ///
    /// # Panics
    ///
    /// Panics if a checker with the same name is already registered.
    pub fn register<F>(&mut self, name: &str, checker: F)
    where
        F: Fn(&str, &Values) -> Result<bool, RequirementError> + Send + Sync + 'static,
    {
        if self.checkers.contains_key(name) {
            panic!("requirement checker {:?} is already registered", name);
        }
        self.checkers.insert(name.to_string(), Box::new(checker));
    }

    /// Saves a value for later inspection by the platform.
    pub fn save_value(&self, key: &str, value: impl Into<String>) {
        let mut saved = match self.saved.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        saved.insert(key.to_string(), value.into());
    }

    /// Returns a saved value.
    pub fn get_value(&self, key: &str) -> Option<String> {
        let saved = match self.saved.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        saved.get(key).cloned()
    }

    /// Returns every saved value.
    pub fn saved_values(&self) -> BTreeMap<String, String> {
        let saved = match self.saved.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        saved.clone()
    }

    /// Evaluates `requirement` with the checker registered as `name`.
    pub fn check(&self, name: &str, requirement: &str, values: &Values) -> Result<bool, RequirementError> {
        let checker = self
            .checkers
            .get(name)
            .ok_or_else(|| RequirementError::Unknown(name.to_string()))?;
        checker(requirement, values)
    }
}

/// A registry evaluated against the values of the last successful pass.
///
/// Served by the health server so the platform can read saved values and
/// ask checkers before it rolls out a release.
#[derive(Debug, Clone)]
pub struct RequirementsView {
    registry: Arc<RequirementsRegistry>,
    values: Arc<tokio::sync::RwLock<Values>>,
}

impl RequirementsView {
    /// Binds `registry` to the committed `values`.
    pub fn new(registry: Arc<RequirementsRegistry>, values: Arc<tokio::sync::RwLock<Values>>) -> Self {
        Self { registry, values }
    }

    /// Returns every saved value.
    pub fn saved_values(&self) -> BTreeMap<String, String> {
        self.registry.saved_values()
    }

    /// Evaluates `requirement` with the checker `name` on the committed values.
    pub async fn check(&self, name: &str, requirement: &str) -> Result<bool, RequirementError> {
        let values = self.values.read().await;
        self.registry.check(name, requirement, &values)
    }
}

/// True iff `global.discovery.kubernetesVersion` is at least `requirement`.
fn check_kubernetes_version(requirement: &str, values: &Values) -> Result<bool, RequirementError> {
    let current = values
        .global
        .discovery
        .kubernetes_version
        .as_deref()
        .ok_or_else(|| {
            RequirementError::Unavailable(
                K8S_REQUIREMENT.to_string(),
                "global.discovery.kubernetesVersion is not set".to_string(),
            )
        })?;
    Ok(Version::parse(current)? >= Version::parse(requirement)?)
}
