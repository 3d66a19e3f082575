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

//! Reconciler descriptor and registry.
//!
//! A descriptor declares when a reconciler runs: its phase bindings with their
//! order, the resource kinds it subscribes to, and its schedules.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};

use crate::reconciler::Reconciler;

/// Order used for event and schedule triggers of reconcilers without a before-helm binding.
pub const DEFAULT_ORDER: u32 = 100;

/// Kubernetes resource kinds a reconciler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// Nodes.
    Node,
    /// Pods in the control-plane namespace.
    Pod,
    /// Secrets in the control-plane namespace.
    Secret,
    /// DaemonSets in the control-plane namespace.
    DaemonSet,
}

/// When a schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    /// Every fixed interval.
    Every(Duration),
    /// Once an hour at the given minute.
    HourlyAt {
        /// Minute of the hour, 0..=59.
        minute: u32,
    },
}

/// A named schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    /// Name carried by the [`Trigger::Schedule`] it produces.
    pub name: String,
    /// Firing rule.
    pub kind: ScheduleKind,
}

impl Schedule {
    /// Fires every `interval`.
    pub fn every(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            kind: ScheduleKind::Every(interval),
        }
    }

    /// Fires hourly at `minute`.
    pub fn hourly_at(name: impl Into<String>, minute: u32) -> Self {
        Self {
            name: name.into(),
            kind: ScheduleKind::HourlyAt { minute: minute % 60 },
        }
    }

    /// Returns the first firing time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.kind {
            ScheduleKind::Every(interval) => {
                now + chrono::Duration::from_std(interval)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60))
            }
            ScheduleKind::HourlyAt { minute } => {
                let hour_start = now
                    .with_minute(0)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(now);
                let candidate = hour_start + chrono::Duration::minutes(i64::from(minute));
                if candidate > now {
                    candidate
                } else {
                    candidate + chrono::Duration::hours(1)
                }
            }
        }
    }
}

/// What started a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Process start, before anything else.
    Startup,
    /// Before values are handed to rendering.
    BeforeHelm,
    /// After a successful render.
    AfterHelm,
    /// A named schedule fired.
    Schedule(String),
    /// An object of this kind changed.
    KubeEvent(ResourceKind),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Startup => f.write_str("startup"),
            Trigger::BeforeHelm => f.write_str("before-helm"),
            Trigger::AfterHelm => f.write_str("after-helm"),
            Trigger::Schedule(name) => write!(f, "schedule/{}", name),
            Trigger::KubeEvent(kind) => write!(f, "event/{:?}", kind),
        }
    }
}

/// Descriptor of a reconciler.
///
/// # Example
///
/// ```ignore
/// let descriptor = ReconcilerDescriptor::builder("etcd-members")
///     .before_helm(20)
///     .subscribe(ResourceKind::Node)
///     .schedule(Schedule::every("etcd-members", Duration::from_secs(300)))
///     .build(EtcdMembers);
/// ```
#[derive(Clone)]
pub struct ReconcilerDescriptor {
    name: String,
    on_startup: Option<u32>,
    before_helm: Option<u32>,
    after_helm: Option<u32>,
    subscriptions: Vec<ResourceKind>,
    schedules: Vec<Schedule>,
    reconciler: Arc<dyn Reconciler>,
}

impl ReconcilerDescriptor {
    /// Creates a new builder for a reconciler descriptor.
    pub fn builder(name: impl Into<String>) -> Builder {
        Builder::new(name)
    }

    /// Returns the canonical name of this reconciler.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the subscribed resource kinds.
    pub fn subscriptions(&self) -> &[ResourceKind] {
        &self.subscriptions
    }

    /// Returns the schedules.
    pub fn schedules(&self) -> &[Schedule] {
        &self.schedules
    }

    /// Returns the reconciler.
    pub fn reconciler(&self) -> &Arc<dyn Reconciler> {
        &self.reconciler
    }

    /// Returns the order this reconciler runs at for `trigger`, or `None` if
    /// it does not run.
    pub fn order_for(&self, trigger: &Trigger) -> Option<u32> {
        let fallback = self.before_helm.unwrap_or(DEFAULT_ORDER);
        match trigger {
            Trigger::Startup => self.on_startup,
            Trigger::BeforeHelm => self.before_helm,
            Trigger::AfterHelm => self.after_helm,
            Trigger::Schedule(name) => self
                .schedules
                .iter()
                .any(|s| &s.name == name)
                .then_some(fallback),
            Trigger::KubeEvent(kind) => self.subscriptions.contains(kind).then_some(fallback),
        }
    }
}

impl fmt::Debug for ReconcilerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcilerDescriptor")
            .field("name", &self.name)
            .field("on_startup", &self.on_startup)
            .field("before_helm", &self.before_helm)
            .field("after_helm", &self.after_helm)
            .field("subscriptions", &self.subscriptions)
            .field("schedules", &self.schedules)
            .finish()
    }
}

/// Builder for creating [`ReconcilerDescriptor`] instances.
pub struct Builder {
    name: String,
    on_startup: Option<u32>,
    before_helm: Option<u32>,
    after_helm: Option<u32>,
    subscriptions: Vec<ResourceKind>,
    schedules: Vec<Schedule>,
}

impl Builder {
    /// Creates a new builder with the given reconciler name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_startup: None,
            before_helm: None,
            after_helm: None,
            subscriptions: Vec::new(),
            schedules: Vec::new(),
        }
    }

    /// Runs once at process start.
    pub fn on_startup(mut self, order: u32) -> Self {
        self.on_startup = Some(order);
        self
    }

    /// Runs before rendering at `order`.
    pub fn before_helm(mut self, order: u32) -> Self {
        self.before_helm = Some(order);
        self
    }

    /// Runs after rendering at `order`.
    pub fn after_helm(mut self, order: u32) -> Self {
        self.after_helm = Some(order);
        self
    }

    /// Runs when an object of `kind` changes.
    pub fn subscribe(mut self, kind: ResourceKind) -> Self {
        if !self.subscriptions.contains(&kind) {
            self.subscriptions.push(kind);
        }
        self
    }

    /// Runs on `schedule`.
    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedules.push(schedule);
        self
    }

    /// Builds the descriptor around `reconciler`.
    pub fn build(self, reconciler: impl Reconciler) -> ReconcilerDescriptor {
        ReconcilerDescriptor {
            name: self.name,
            on_startup: self.on_startup,
            before_helm: self.before_helm,
            after_helm: self.after_helm,
            subscriptions: self.subscriptions,
            schedules: self.schedules,
            reconciler: Arc::new(reconciler),
        }
    }
}

/// Registry of all known reconcilers.
#[derive(Debug, Clone, Default)]
pub struct ReconcilerRegistry {
    reconcilers: HashMap<String, ReconcilerDescriptor>,
}

impl ReconcilerRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reconciler descriptor.
    ///
    /// # Panics
    ///
    /// Panics if the name is empty or already registered.
    pub fn register(&mut self, descriptor: ReconcilerDescriptor) -> &mut Self {
        let name = descriptor.name();

        if name.is_empty() {
            panic!("reconciler name cannot be empty");
        }

        if self.reconcilers.contains_key(name) {
            panic!("reconciler {:?} is already registered", name);
        }

        self.reconcilers.insert(name.to_string(), descriptor);
        self
    }

    /// Returns the descriptor for the given name.
    pub fn get(&self, name: &str) -> Option<&ReconcilerDescriptor> {
        self.reconcilers.get(name)
    }

    /// Returns all registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.reconcilers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of registered reconcilers.
    pub fn len(&self) -> usize {
        self.reconcilers.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.reconcilers.is_empty()
    }

    /// Returns the reconcilers `trigger` runs, in ascending order then name.
    pub fn for_trigger(&self, trigger: &Trigger) -> Vec<&ReconcilerDescriptor> {
        let mut matched: Vec<(u32, &ReconcilerDescriptor)> = self
            .reconcilers
            .values()
            .filter_map(|d| d.order_for(trigger).map(|order| (order, d)))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name().cmp(b.1.name())));
        matched.into_iter().map(|(_, d)| d).collect()
    }

    /// Returns every distinct schedule, sorted by name.
    ///
    /// Reconcilers sharing a schedule name run in the same pass.
    pub fn schedules(&self) -> Vec<Schedule> {
        let mut by_name: HashMap<&str, &Schedule> = HashMap::new();
        for schedule in self.reconcilers.values().flat_map(|d| d.schedules()) {
            by_name.entry(schedule.name.as_str()).or_insert(schedule);
        }
        let mut schedules: Vec<Schedule> = by_name.into_values().cloned().collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        schedules
    }

    /// Returns every subscribed resource kind, sorted.
    pub fn subscriptions(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<ResourceKind> = self
            .reconcilers
            .values()
            .flat_map(|d| d.subscriptions().iter().copied())
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}
