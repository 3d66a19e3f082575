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

//! State of one reconciliation pass.

use std::sync::Arc;

use crate::metrics::MetricsCollector;
use crate::patch::PatchCollector;
use crate::reconciler_descriptor::Trigger;
use crate::snapshot::ClusterSnapshot;
use crate::values::Values;

/// What a reconciler sees and records during a pass.
///
/// The snapshot is shared by every reconciler of the pass. Values are a
/// working copy committed by the manager only when the whole pass succeeds.
#[derive(Debug)]
pub struct Pass {
    /// What started the pass.
    pub trigger: Trigger,
    /// Cluster observations taken at the start of the pass.
    pub snapshot: Arc<ClusterSnapshot>,
    /// Working values.
    pub values: Values,
    /// Object mutations recorded by the running reconciler.
    pub patches: PatchCollector,
    /// Metric operations recorded by the running reconciler.
    pub metrics: MetricsCollector,
}

impl Pass {
    /// Starts a pass over `snapshot` with a working copy of `values`.
    pub fn new(trigger: Trigger, snapshot: Arc<ClusterSnapshot>, values: Values) -> Self {
        Self {
            trigger,
            snapshot,
            values,
            patches: PatchCollector::new(),
            metrics: MetricsCollector::new(),
        }
    }
}
