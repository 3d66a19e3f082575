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

//! Polling helper.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why polling stopped without the condition becoming true.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError<E> {
    /// The ceiling was reached.
    #[error("condition not met within {0:?}")]
    Timeout(Duration),
    /// The token was cancelled.
    #[error("polling cancelled")]
    Cancelled,
    /// The condition itself failed.
    #[error("{0}")]
    Condition(E),
}

/// Evaluates `condition` immediately and then every `interval` until it
/// returns `Ok(true)`, `timeout` elapses, or `cancel` fires.
pub async fn poll_until<F, Fut, E>(
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut condition: F,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        if condition().await.map_err(PollError::Condition)? {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout(timeout));
        }
        let sleep = interval.min(deadline - now);

        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep(sleep) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_succeeds_after_retries() {
        let calls = AtomicUsize::new(0);
        let cancel = CancellationToken::new();
        let res: Result<(), PollError<()>> = poll_until(
            Duration::from_secs(1),
            Duration::from_secs(120),
            &cancel,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(n >= 3) }
            },
        )
        .await;
        assert!(res.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out() {
        let cancel = CancellationToken::new();
        let res: Result<(), PollError<()>> = poll_until(
            Duration::from_secs(1),
            Duration::from_secs(5),
            &cancel,
            || async { Ok(false) },
        )
        .await;
        assert_eq!(res, Err(PollError::Timeout(Duration::from_secs(5))));
    }

    #[tokio::test]
    async fn test_poll_until_zero_timeout_checks_once() {
        let cancel = CancellationToken::new();
        let res: Result<(), PollError<&str>> =
            poll_until(Duration::from_secs(1), Duration::ZERO, &cancel, || async {
                Err("boom")
            })
            .await;
        assert_eq!(res, Err(PollError::Condition("boom")));
    }

    #[tokio::test]
    async fn test_poll_until_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: Result<(), PollError<()>> =
            poll_until(Duration::from_secs(1), Duration::from_secs(5), &cancel, || async {
                Ok(true)
            })
            .await;
        assert_eq!(res, Err(PollError::Cancelled));
    }
}
