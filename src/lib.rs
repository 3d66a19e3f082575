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

//! control-plane-hooks - control-plane reconciliation core of a Deckhouse cluster.
//!
//! This library provides:
//! - Reconciler traits, descriptors and the registry
//! - The hook manager running reconcilers around Helm rendering
//! - The control-plane reconcilers (version, etcd, approval, PKI, feature gates)
//! - Kubernetes and etcd collaborators, with in-memory fakes behind the
//!   `testing` feature
//! - Health checks and metrics

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod etcd;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod health;
pub mod hook_manager;
pub mod hooks;
pub mod kube_api;
pub mod metrics;
pub mod pass;
pub mod patch;
pub mod pki;
pub mod reconcile_context;
pub mod reconciler;
pub mod reconciler_descriptor;
pub mod requirements;
pub mod snapshot;
pub mod values;
pub mod version;
pub mod wait;

// Re-export commonly used types
pub use config::HooksConfig;
pub use hook_manager::HookManager;
pub use pass::Pass;
pub use reconcile_context::ReconcileContext;
pub use reconciler::{ReconcileError, Reconciler};
pub use reconciler_descriptor::{ReconcilerDescriptor, ReconcilerRegistry, Trigger};
pub use values::Values;
pub use version::Version;

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
