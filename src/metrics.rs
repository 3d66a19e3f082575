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

//! Metrics emitted by the reconcilers.
//!
//! Reconcilers record operations on a per-pass [`MetricsCollector`]; the
//! manager flushes them into the process-wide [`MetricStorage`] after the
//! reconciler succeeds. The storage is encoded with the `prometheus` text
//! encoder.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use prometheus::proto::{Counter, Gauge, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};

/// Label set of a series, ordered by name.
pub type Labels = BTreeMap<String, String>;

/// Builds a label set from pairs.
pub fn labels<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Labels {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Series type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Set to a value.
    Gauge,
    /// Only grows.
    Counter,
}

/// One recorded operation.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricOperation {
    /// Set a gauge.
    Set {
        /// Metric name.
        name: String,
        /// New value.
        value: f64,
        /// Series labels.
        labels: Labels,
        /// Expiry group, if any.
        group: Option<String>,
    },
    /// Increment a counter by one.
    Inc {
        /// Metric name.
        name: String,
        /// Series labels.
        labels: Labels,
    },
    /// Drop every series of a group.
    Expire {
        /// Group name.
        group: String,
    },
}

/// Operations recorded by one reconciler.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    operations: Vec<MetricOperation>,
}

impl MetricsCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a gauge.
    pub fn set(&mut self, name: impl Into<String>, value: f64, labels: Labels) {
        self.operations.push(MetricOperation::Set {
            name: name.into(),
            value,
            labels,
            group: None,
        });
    }

    /// Sets a gauge that belongs to an expiry group.
    pub fn set_in_group(
        &mut self,
        group: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        labels: Labels,
    ) {
        self.operations.push(MetricOperation::Set {
            name: name.into(),
            value,
            labels,
            group: Some(group.into()),
        });
    }

    /// Increments a counter.
    pub fn inc(&mut self, name: impl Into<String>, labels: Labels) {
        self.operations.push(MetricOperation::Inc {
            name: name.into(),
            labels,
        });
    }

    /// Drops every series previously set in `group`.
    pub fn expire(&mut self, group: impl Into<String>) {
        self.operations
            .push(MetricOperation::Expire { group: group.into() });
    }

    /// Returns the recorded operations.
    pub fn operations(&self) -> &[MetricOperation] {
        &self.operations
    }

    /// Drains the recorded operations.
    pub fn take(&mut self) -> Vec<MetricOperation> {
        std::mem::take(&mut self.operations)
    }
}

#[derive(Debug, Clone)]
struct Series {
    kind: MetricKind,
    value: f64,
    group: Option<String>,
}

type SeriesKey = (String, Labels);

/// Process-wide metric values.
#[derive(Debug, Clone, Default)]
pub struct MetricStorage {
    series: Arc<RwLock<HashMap<SeriesKey, Series>>>,
}

impl MetricStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies operations in order.
    pub fn apply(&self, operations: Vec<MetricOperation>) {
        let mut series = match self.series.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for op in operations {
            match op {
                MetricOperation::Set {
                    name,
                    value,
                    labels,
                    group,
                } => {
                    series.insert(
                        (name, labels),
                        Series {
                            kind: MetricKind::Gauge,
                            value,
                            group,
                        },
                    );
                }
                MetricOperation::Inc { name, labels } => {
                    series
                        .entry((name, labels))
                        .or_insert(Series {
                            kind: MetricKind::Counter,
                            value: 0.0,
                            group: None,
                        })
                        .value += 1.0;
                }
                MetricOperation::Expire { group } => {
                    series.retain(|_, s| s.group.as_deref() != Some(group.as_str()));
                }
            }
        }
    }

    /// Returns the value of one series.
    pub fn get(&self, name: &str, labels: &Labels) -> Option<f64> {
        let series = match self.series.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        series
            .get(&(name.to_string(), labels.clone()))
            .map(|s| s.value)
    }

    /// Encodes all series in the Prometheus text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let families = {
            let series = match self.series.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            families(&series)
        };

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn families(series: &HashMap<SeriesKey, Series>) -> Vec<MetricFamily> {
    let mut by_name: BTreeMap<&str, Vec<(&Labels, &Series)>> = BTreeMap::new();
    for ((name, labels), s) in series.iter() {
        by_name.entry(name.as_str()).or_default().push((labels, s));
    }

    by_name
        .into_iter()
        .map(|(name, mut entries)| {
            entries.sort_by(|a, b| a.0.cmp(b.0));

            let mut family = MetricFamily::default();
            family.set_name(name.to_string());
            family.set_help(name.replace('_', " "));
            let kind = entries[0].1.kind;
            family.set_field_type(match kind {
                MetricKind::Gauge => MetricType::GAUGE,
                MetricKind::Counter => MetricType::COUNTER,
            });

            let metrics = family.mut_metric();
            for (labels, s) in entries {
                let mut metric = Metric::default();
                metric.set_label(
                    labels
                        .iter()
                        .map(|(name, value)| {
                            let mut pair = LabelPair::default();
                            pair.set_name(name.clone());
                            pair.set_value(value.clone());
                            pair
                        })
                        .collect(),
                );
                // A name keeps the kind of its first series.
                match kind {
                    MetricKind::Gauge => {
                        let mut gauge = Gauge::default();
                        gauge.set_value(s.value);
                        metric.set_gauge(gauge);
                    }
                    MetricKind::Counter => {
                        let mut counter = Counter::default();
                        counter.set_value(s.value);
                        metric.set_counter(counter);
                    }
                }
                metrics.push(metric);
            }
            family
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let storage = MetricStorage::new();
        let l = labels([("pod_name", "etcd-m-0"), ("node", "m-0")]);
        let mut collector = MetricsCollector::new();
        collector.inc("d8_etcd_defragmentation_success_total", l.clone());
        collector.inc("d8_etcd_defragmentation_success_total", l.clone());
        storage.apply(collector.take());
        assert_eq!(storage.get("d8_etcd_defragmentation_success_total", &l), Some(2.0));
    }

    #[test]
    fn test_expire_drops_only_group() {
        let storage = MetricStorage::new();
        let mut collector = MetricsCollector::new();
        collector.set_in_group("etcd_quota_backend_bytes", "d8_etcd_quota_backend_total", 2.0, Labels::new());
        collector.set("d8_kubernetes_version", 1.0, labels([("k8s_version", "1.29")]));
        storage.apply(collector.take());

        let mut collector = MetricsCollector::new();
        collector.expire("etcd_quota_backend_bytes");
        storage.apply(collector.take());

        assert_eq!(storage.get("d8_etcd_quota_backend_total", &Labels::new()), None);
        assert_eq!(
            storage.get("d8_kubernetes_version", &labels([("k8s_version", "1.29")])),
            Some(1.0)
        );
    }

    #[test]
    fn test_render_text_format() {
        let storage = MetricStorage::new();
        let mut collector = MetricsCollector::new();
        collector.set("d8_kubernetes_version", 1.0, labels([("k8s_version", "1.29")]));
        collector.inc("d8_etcd_defragmentation_failed_total", labels([("node", "m\"0")]));
        storage.apply(collector.take());

        let text = storage.render().unwrap();
        assert!(text.contains("# TYPE d8_kubernetes_version gauge\nd8_kubernetes_version{k8s_version=\"1.29\"} 1\n"));
        assert!(text.contains("# TYPE d8_etcd_defragmentation_failed_total counter"));
        assert!(text.contains("node=\"m\\\"0\""));
    }

    #[test]
    fn test_render_empty_and_expired() {
        let storage = MetricStorage::new();
        assert_eq!(storage.render().unwrap(), "");

        let mut collector = MetricsCollector::new();
        collector.set_in_group("g", "d8_etcd_quota_backend_total", 3.0, Labels::new());
        storage.apply(collector.take());
        assert!(storage.render().unwrap().contains("d8_etcd_quota_backend_total 3\n"));

        let mut collector = MetricsCollector::new();
        collector.expire("g");
        storage.apply(collector.take());
        assert!(!storage.render().unwrap().contains("d8_etcd_quota_backend_total"));
    }
}
