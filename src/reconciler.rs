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

//! Core reconciler traits and types.
//!
//! A reconciler is one step of a pass: it reads the pass snapshot and the
//! working values, and records values, patches and metrics on the [`Pass`].

use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;

pub use tokio_util::sync::CancellationToken;

use crate::etcd::EtcdError;
use crate::pass::Pass;
use crate::reconcile_context::ReconcileContext;

/// Boxed error used as the source of transient failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that fail a reconciliation pass.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Kubernetes API or other I/O failure. The pass is retried on the next trigger.
    #[error("{context}: {source}")]
    Transient {
        context: String,
        #[source]
        source: BoxError,
    },

    /// An etcd RPC failed or timed out.
    #[error(transparent)]
    Etcd(#[from] EtcdError),

    /// A hard dependency of rendering is absent or unusable.
    #[error("missing required input: {0}")]
    MissingInput(String),

    /// The pass would cause data loss and was aborted before any mutation.
    #[error("refusing to proceed: {0}")]
    Invariant(String),

    /// Persisted state could not be parsed.
    #[error("malformed persisted state: {0}")]
    MalformedState(String),

    /// The main queue stays locked until the control plane settles.
    #[error("main queue locked: {0}")]
    QueueLocked(String),

    /// The pass was cancelled.
    #[error("pass cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Wraps an error as a transient failure with context.
    pub fn transient(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        ReconcileError::Transient {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Returns true if retrying the same pass may succeed without input changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::Transient { .. }
                | ReconcileError::Etcd(_)
                | ReconcileError::QueueLocked(_)
                | ReconcileError::Cancelled
        )
    }
}

/// Result type for reconciler operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

impl From<anyhow::Error> for ReconcileError {
    fn from(err: anyhow::Error) -> Self {
        ReconcileError::Transient {
            context: "cluster api".to_string(),
            source: err.into(),
        }
    }
}

/// A single reconciliation step.
///
/// Reconcilers are registered in a [`crate::reconciler_descriptor::ReconcilerRegistry`]
/// and invoked one at a time by the [`crate::hook_manager::HookManager`]. They
/// must be idempotent: the manager retries a failed pass from scratch.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Returns the canonical name of this reconciler.
    fn name(&self) -> &str;

    /// Runs one step of the pass.
    ///
    /// Every I/O the reconciler performs should observe `cancel`; a cancelled
    /// reconciler returns [`ReconcileError::Cancelled`].
    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        pass: &mut Pass,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Runs `fut` unless `cancel` fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReconcileError::Cancelled),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retry_classification() {
        assert!(ReconcileError::transient("list nodes", "boom").is_retryable());
        assert!(ReconcileError::Cancelled.is_retryable());
        assert!(!ReconcileError::Invariant("would remove every member".into()).is_retryable());
        assert!(!ReconcileError::MissingInput("d8-pki".into()).is_retryable());
    }

    #[test]
    fn test_anyhow_maps_to_transient() {
        let err: ReconcileError = anyhow::anyhow!("connection refused").into();
        assert!(matches!(err, ReconcileError::Transient { .. }));
        assert_eq!(err.to_string(), "cluster api: connection refused");
    }

    #[tokio::test]
    async fn test_cancellable_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = cancellable(&cancel, std::future::pending::<Result<()>>()).await;
        assert!(matches!(res, Err(ReconcileError::Cancelled)));
    }
}
