// Copyright 2024 The Matrix.org Foundation C.I.C.
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

//! A generic retry-with-backoff executor.
//!
//! [`execute`] runs a fallible task until it succeeds, fails with a permanent
//! error, or runs out of attempts. Between attempts it sleeps according to a
//! [`BackoffPolicy`], honoring any `retry_after` hint the error carries.
//!
//! The returned [`RetryTask`] is a future that can be cancelled through its
//! [`AbortHandle`]. Cancelling stops any further attempt; whatever the task
//! already committed before the cancellation stays committed.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
pub use futures_util::future::AbortHandle;
use futures_util::{
    future::{Abortable, Aborted},
    FutureExt,
};
use tracing::{debug, warn};

use crate::{debug::DebugStructExt, sleep::sleep, BoxFuture};

/// How an error should be handled by the retry executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryKind {
    /// The error may go away on its own; the task should be attempted again.
    Transient {
        /// A minimal delay requested by the remote end before retrying, e.g.
        /// the `retry_after_ms` of a rate-limited response.
        retry_after: Option<Duration>,
    },

    /// Retrying won't help.
    Permanent,
}

/// Errors that can tell the retry executor whether they are worth retrying.
pub trait Retryable {
    /// Classify this error.
    fn retry_kind(&self) -> RetryKind;
}

/// The ways a retried task can fail.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The task failed with an error that can't be retried.
    #[error(transparent)]
    Permanent(E),

    /// The task failed with transient errors until the maximal number of
    /// attempts was reached.
    #[error("giving up after {attempts} attempts: {last_error}")]
    AttemptsExhausted {
        /// How many times the task has been run.
        attempts: u32,
        /// The error of the last attempt.
        last_error: E,
    },

    /// The retry sequence has been cancelled by the caller.
    #[error("the task has been cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// Get the error of the last attempt, if there was one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Permanent(e) | Self::AttemptsExhausted { last_error: e, .. } => Some(e),
            Self::Cancelled => None,
        }
    }
}

/// Exponential backoff parameters.
#[derive(Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub(crate) initial_interval: Duration,
    pub(crate) multiplier: f64,
    pub(crate) max_interval: Duration,
    pub(crate) randomization_factor: f64,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let randomization =
            (self.randomization_factor > 0.0).then_some(self.randomization_factor);

        f.debug_struct("BackoffPolicy")
            .field("initial_interval", &self.initial_interval)
            .field("multiplier", &self.multiplier)
            .field("max_interval", &self.max_interval)
            .maybe_field("randomization_factor", &randomization)
            .finish()
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            randomization_factor: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Create a new default `BackoffPolicy`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// The delay before the first retry.
    #[must_use]
    pub fn initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// The factor the delay is multiplied by after each retry.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// The upper bound of a single delay.
    #[must_use]
    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// How much jitter to apply to every delay, between `0.0` (none) and
    /// `1.0`.
    #[must_use]
    pub fn randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Get the upper bound of a single delay.
    pub fn get_max_interval(&self) -> Duration {
        self.max_interval
    }

    fn to_backoff(self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(self.multiplier)
            .with_max_interval(self.max_interval)
            .with_randomization_factor(self.randomization_factor)
            // The number of attempts bounds a retry sequence, never its
            // duration.
            .with_max_elapsed_time(None)
            .build();
        backoff.reset();
        backoff
    }
}

/// Information about a retry that has just been scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryInfo {
    /// The number of the attempt that just failed, starting at 1.
    pub attempt: u32,
    /// How long the executor waits before the next attempt.
    pub delay: Duration,
}

/// A running retry sequence.
///
/// Resolves to the first successful result of the task, or to the error that
/// ended the sequence.
pub struct RetryTask<'a, T, E> {
    inner: Abortable<BoxFuture<'a, Result<T, RetryError<E>>>>,
    abort_handle: AbortHandle,
}

#[cfg(not(tarpaulin_include))]
impl<T, E> fmt::Debug for RetryTask<'_, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryTask")
            .field("is_aborted", &self.abort_handle.is_aborted())
            .finish_non_exhaustive()
    }
}

impl<T, E> RetryTask<'_, T, E> {
    /// Get a handle that cancels this retry sequence.
    ///
    /// The handle may be used from any task, and stays valid after the
    /// sequence is done.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }
}

impl<T, E> Future for RetryTask<'_, T, E> {
    type Output = Result<T, RetryError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx).map(|result| match result {
            Ok(result) => result,
            Err(Aborted) => Err(RetryError::Cancelled),
        })
    }
}

/// Run `task` until it succeeds, with at most `max_attempts` attempts.
///
/// `None` means the number of attempts is unbounded; the delay between two
/// attempts is still bounded by the policy's maximal interval. `Some(0)` is
/// treated like `Some(1)`: the task always runs at least once.
pub fn execute<'a, T, E, F, Fut>(
    task: F,
    max_attempts: Option<u32>,
    policy: BackoffPolicy,
) -> RetryTask<'a, T, E>
where
    T: Send + 'a,
    E: Retryable + Send + 'a,
    F: FnMut() -> Fut + Send + 'a,
    Fut: Future<Output = Result<T, E>> + Send + 'a,
{
    execute_with_observer(task, max_attempts, policy, |_: &E, _| {})
}

/// Same as [`execute`], but `observer` is called every time a retry is
/// scheduled, with the error that caused it.
pub fn execute_with_observer<'a, T, E, F, Fut, O>(
    task: F,
    max_attempts: Option<u32>,
    policy: BackoffPolicy,
    observer: O,
) -> RetryTask<'a, T, E>
where
    T: Send + 'a,
    E: Retryable + Send + 'a,
    F: FnMut() -> Fut + Send + 'a,
    Fut: Future<Output = Result<T, E>> + Send + 'a,
    O: FnMut(&E, RetryInfo) + Send + 'a,
{
    let (abort_handle, registration) = AbortHandle::new_pair();
    let future = run(task, max_attempts.map(|max| max.max(1)), policy, observer).boxed();

    RetryTask { inner: Abortable::new(future, registration), abort_handle }
}

async fn run<T, E, F, Fut, O>(
    mut task: F,
    max_attempts: Option<u32>,
    policy: BackoffPolicy,
    mut observer: O,
) -> Result<T, RetryError<E>>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    O: FnMut(&E, RetryInfo),
{
    let mut backoff = policy.to_backoff();
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);

        let error = match task().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Task succeeded after retrying");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let retry_after = match error.retry_kind() {
            RetryKind::Transient { retry_after } => retry_after,
            RetryKind::Permanent => return Err(RetryError::Permanent(error)),
        };

        if max_attempts.is_some_and(|max| attempt >= max) {
            return Err(RetryError::AttemptsExhausted { attempts: attempt, last_error: error });
        }

        let computed = backoff.next_backoff().unwrap_or(policy.max_interval);
        let delay = match retry_after {
            Some(retry_after) => retry_after.max(computed),
            None => computed,
        };

        warn!(attempt, ?delay, "Task failed with a transient error, retrying");
        observer(&error, RetryInfo { attempt, delay });

        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use assert_matches::assert_matches;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("transient")]
        Transient(Option<Duration>),
        #[error("permanent")]
        Permanent,
    }

    impl Retryable for TestError {
        fn retry_kind(&self) -> RetryKind {
            match self {
                Self::Transient(retry_after) => RetryKind::Transient { retry_after: *retry_after },
                Self::Permanent => RetryKind::Permanent,
            }
        }
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new()
            .initial_interval(Duration::from_millis(100))
            .max_interval(Duration::from_secs(1))
            .randomization_factor(0.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(Mutex::new(Vec::new()));

        let task_calls = calls.clone();
        let observed = retries.clone();

        let result = execute_with_observer(
            move || {
                let calls = task_calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError::Transient(None))
                    } else {
                        Ok(42)
                    }
                }
            },
            None,
            policy(),
            move |_, info| observed.lock().unwrap().push(info),
        )
        .await;

        assert_matches!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let retries = retries.lock().unwrap();
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0], RetryInfo { attempt: 1, delay: Duration::from_millis(100) });
        assert_eq!(retries[1], RetryInfo { attempt: 2, delay: Duration::from_millis(200) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let task_calls = calls.clone();

        let result = execute(
            move || {
                task_calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Permanent) }
            },
            Some(5),
            policy(),
        )
        .await;

        assert_matches!(result, Err(RetryError::Permanent(TestError::Permanent)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let task_calls = calls.clone();

        let result = execute(
            move || {
                task_calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Transient(None)) }
            },
            Some(3),
            policy(),
        )
        .await;

        assert_matches!(
            result,
            Err(RetryError::AttemptsExhausted { attempts: 3, last_error: TestError::Transient(_) })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_runs_once() {
        let result =
            execute(|| async { Err::<(), _>(TestError::Transient(None)) }, Some(0), policy())
                .await;

        assert_matches!(result, Err(RetryError::AttemptsExhausted { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_honored() {
        let calls = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(Mutex::new(Vec::new()));

        let task_calls = calls.clone();
        let observed = retries.clone();

        let result = execute_with_observer(
            move || {
                let calls = task_calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(TestError::Transient(Some(Duration::from_secs(5))))
                    } else {
                        Ok(())
                    }
                }
            },
            None,
            policy(),
            move |_, info| observed.lock().unwrap().push(info.delay),
        )
        .await;

        assert_matches!(result, Ok(()));
        assert_eq!(*retries.lock().unwrap(), vec![Duration::from_secs(5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_are_bounded() {
        let retries = Arc::new(Mutex::new(Vec::new()));
        let observed = retries.clone();

        let result = execute_with_observer(
            || async { Err::<(), _>(TestError::Transient(None)) },
            Some(8),
            policy(),
            move |_, info| observed.lock().unwrap().push(info.delay),
        )
        .await;

        assert_matches!(result, Err(RetryError::AttemptsExhausted { attempts: 8, .. }));

        let retries = retries.lock().unwrap();
        assert_eq!(retries.len(), 7);
        assert!(retries.iter().all(|delay| *delay <= Duration::from_secs(1)));
        assert_eq!(retries.last(), Some(&Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_further_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let task_calls = calls.clone();

        let task = execute(
            move || {
                task_calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Transient(None)) }
            },
            None,
            policy().initial_interval(Duration::from_secs(10)),
        );
        let abort_handle = task.abort_handle();

        let join_handle = tokio::spawn(task);

        // Let the first attempt run; the task is now waiting before the second
        // one.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        abort_handle.abort();

        assert_matches!(join_handle.await.unwrap(), Err(RetryError::Cancelled));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
