// Copyright 2020 Joyent, Inc.

//! Bounded exponential backoff for connection establishment.
//!
//! A [`RetryingConnector`](struct.RetryingConnector.html) turns a flaky
//! "connect once" operation into one that is attempted up to
//! `max_attempts` times. Between attempts the caller is suspended for the
//! current backoff delay plus a positive random jitter, and the delay doubles
//! after every failure. With the default policy a caller sees either a
//! connection or the error from the third and final attempt after sleeping
//! roughly 200ms and then 400ms.
//!
//! Each call owns a fresh [`RetryBudget`](struct.RetryBudget.html); nothing
//! about a backoff is shared between concurrent callers.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use slog::{debug, error, info, o, warn, Drain, Logger};

use crate::connection::ConnectionId;
use crate::delay::{jittered, AsyncDelay, Delay};

// Total connect attempts per acquisition
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
// Delay before the second attempt in milliseconds
const DEFAULT_BASE_DELAY: u64 = 200;
// Upper bound of the random fraction added to each delay
const DEFAULT_JITTER: f64 = 0.1;

/// Tunable knobs of the connect retry policy.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total number of connect attempts, including the first one. The
    /// default is 3.
    pub max_attempts: u32,
    /// Delay in milliseconds before the second attempt. Each further delay is
    /// double the previous one. The default is 200 milliseconds.
    pub base_delay_ms: u64,
    /// Maximum jitter as a fraction of the current delay. The jitter is only
    /// ever added, so a delay is never shorter than its nominal value. Values
    /// outside `[0, 1]` are clamped and NaN counts as no jitter. The default
    /// is 0.1.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Start a new budget for one connection acquisition.
    pub fn budget(&self) -> RetryBudget {
        RetryBudget {
            attempts_remaining: self.max_attempts,
            delay: Duration::from_millis(self.base_delay_ms),
            // f64::max ignores NaN
            jitter: self.jitter.max(0.0).min(1.0),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

/// Retry state for a single acquisition.
#[derive(Clone, Debug)]
pub struct RetryBudget {
    attempts_remaining: u32,
    delay: Duration,
    jitter: f64,
}

impl RetryBudget {
    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_remaining
    }

    /// Spend `units` attempts without a corresponding failure. Used when a
    /// liveness check already retried on the caller's behalf.
    pub fn spend(&mut self, units: u32) {
        self.attempts_remaining = self.attempts_remaining.saturating_sub(units);
    }

    /// Record a failed attempt. Returns how long to wait before the next
    /// attempt, or `None` if the failure must be surfaced to the caller.
    pub fn next_backoff<R>(&mut self, rng: &mut R) -> Option<Duration>
    where
        R: Rng + ?Sized,
    {
        if self.attempts_remaining <= 1 {
            return None;
        }
        self.attempts_remaining -= 1;

        let backoff = jittered(self.delay, self.jitter, rng);
        self.delay = self.delay.checked_mul(2).unwrap_or(self.delay);
        Some(backoff)
    }
}

/// Notification that a liveness check discarded a dead connection while an
/// acquisition was in progress, and transparently connected a replacement.
#[derive(Debug)]
pub struct InvalidationEvent<E> {
    /// The discarded connection
    pub connection: ConnectionId,
    /// Why the liveness check failed
    pub cause: E,
}

/// Receiver for [`InvalidationEvent`](struct.InvalidationEvent.html)s
/// scoped to a single `RetryingConnector::connect` or `connect_async` call.
/// The hook is created when the call starts and its count is only read by
/// that call, so events fired after the call returned are never charged to
/// another acquisition.
#[derive(Clone)]
pub struct InvalidationHook {
    fired: Arc<AtomicU32>,
    log: Logger,
}

impl InvalidationHook {
    fn new(log: Logger) -> Self {
        InvalidationHook {
            fired: Arc::new(AtomicU32::new(0)),
            log,
        }
    }

    pub fn fire<E>(&self, event: InvalidationEvent<E>)
    where
        E: fmt::Display,
    {
        warn!(
            self.log,
            "connection {} invalidated by liveness check: {}",
            event.connection,
            event.cause
        );
        self.fired.fetch_add(1, Ordering::SeqCst);
    }

    fn take(&self) -> u32 {
        self.fired.swap(0, Ordering::SeqCst)
    }
}

impl fmt::Debug for InvalidationHook {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InvalidationHook")
            .field("fired", &self.fired.load(Ordering::SeqCst))
            .finish()
    }
}

// Outcome of one attempt
enum Step<T, E> {
    Finished(Result<T, E>),
    Backoff(Duration),
}

/// Wraps connection establishment with the retry policy.
#[derive(Clone, Debug)]
pub struct RetryingConnector {
    policy: RetryPolicy,
    log: Logger,
}

impl RetryingConnector {
    pub fn new(policy: RetryPolicy, log: Option<Logger>) -> Self {
        let log = log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        RetryingConnector { policy, log }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt` until it succeeds or the budget runs out, blocking the
    /// thread in `delay` between attempts. Every
    /// [`InvalidationEvent`](struct.InvalidationEvent.html) fired into the
    /// hook passed to `attempt` spends one extra attempt. On exhaustion the
    /// error from the last attempt is returned as is.
    pub fn connect<T, E, D, F>(&self, delay: &D, mut attempt: F) -> Result<T, E>
    where
        D: Delay + ?Sized,
        E: fmt::Display,
        F: FnMut(&InvalidationHook) -> Result<T, E>,
    {
        let mut budget = self.policy.budget();
        let hook = InvalidationHook::new(self.log.clone());
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = attempt(&hook);
            match self.step(&mut budget, &hook, attempts, result) {
                Step::Finished(result) => return result,
                Step::Backoff(backoff) => delay.sleep(backoff),
            }
        }
    }

    /// The suspending counterpart of `connect`. Each attempt gets a handle
    /// to the call's invalidation hook. The backoff is awaited on `delay` so
    /// other tasks keep running during it, and dropping the returned future
    /// abandons the acquisition mid-backoff.
    pub async fn connect_async<T, E, D, F, Fut>(
        &self,
        delay: &D,
        mut attempt: F,
    ) -> Result<T, E>
    where
        D: AsyncDelay + ?Sized,
        E: fmt::Display,
        F: FnMut(InvalidationHook) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut budget = self.policy.budget();
        let hook = InvalidationHook::new(self.log.clone());
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = attempt(hook.clone()).await;
            match self.step(&mut budget, &hook, attempts, result) {
                Step::Finished(result) => return result,
                Step::Backoff(backoff) => delay.sleep(backoff).await,
            }
        }
    }

    // Charge the attempt and any invalidations it caused to the budget and
    // decide whether to finish or back off.
    fn step<T, E>(
        &self,
        budget: &mut RetryBudget,
        hook: &InvalidationHook,
        attempts: u32,
        result: Result<T, E>,
    ) -> Step<T, E>
    where
        E: fmt::Display,
    {
        let invalidated = hook.take();
        if invalidated > 0 {
            budget.spend(invalidated);
            debug!(
                self.log,
                "{} invalidation(s) during attempt {}, {} attempt(s) left",
                invalidated,
                attempts,
                budget.attempts_remaining()
            );
        }

        match result {
            Ok(conn) => {
                self.log_success(attempts);
                Step::Finished(Ok(conn))
            }
            Err(err) => match budget.next_backoff(&mut rand::thread_rng()) {
                Some(backoff) => {
                    self.log_retry(attempts, backoff, &err);
                    Step::Backoff(backoff)
                }
                None => {
                    self.log_give_up(attempts, &err);
                    Step::Finished(Err(err))
                }
            },
        }
    }

    fn log_success(&self, attempts: u32) {
        if attempts > 1 {
            info!(self.log, "connected after {} attempts", attempts);
        } else {
            debug!(self.log, "connected on first attempt");
        }
    }

    fn log_retry<E>(&self, attempts: u32, backoff: Duration, err: &E)
    where
        E: fmt::Display,
    {
        warn!(
            self.log,
            "connect attempt {} failed, retrying in {}ms: {}",
            attempts,
            backoff.as_millis(),
            err
        );
    }

    fn log_give_up<E>(&self, attempts: u32, err: &E)
    where
        E: fmt::Display,
    {
        error!(
            self.log,
            "giving up on connection after {} attempt(s): {}", attempts, err
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDelay(RefCell<Vec<Duration>>);

    impl Delay for RecordingDelay {
        fn sleep(&self, duration: Duration) {
            self.0.borrow_mut().push(duration);
        }
    }

    #[derive(Default)]
    struct RecordingAsyncDelay(Mutex<Vec<Duration>>);

    #[async_trait::async_trait]
    impl AsyncDelay for RecordingAsyncDelay {
        async fn sleep(&self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn assert_default_backoffs(sleeps: &[Duration]) {
        assert_eq!(sleeps.len(), 2);
        assert!(sleeps[0] >= ms(200) && sleeps[0] <= ms(220), "{:?}", sleeps);
        assert!(sleeps[1] >= ms(400) && sleeps[1] <= ms(440), "{:?}", sleeps);
    }

    #[test]
    fn budget_defaults() {
        let mut budget = RetryPolicy::default().budget();
        assert_eq!(budget.attempts_remaining(), 3);

        let mut rng = rand::thread_rng();
        assert!(budget.next_backoff(&mut rng).is_some());
        assert_eq!(budget.attempts_remaining(), 2);
        assert!(budget.next_backoff(&mut rng).is_some());
        assert_eq!(budget.attempts_remaining(), 1);
        assert!(budget.next_backoff(&mut rng).is_none());
        assert_eq!(budget.attempts_remaining(), 1);
    }

    #[test]
    fn budget_spend_saturates() {
        let mut budget = RetryPolicy::default().budget();
        budget.spend(5);
        assert_eq!(budget.attempts_remaining(), 0);
        assert!(budget.next_backoff(&mut rand::thread_rng()).is_none());
    }

    #[test]
    fn returns_first_success() {
        // outcomes ending in success, index of the success is the expected
        // number of invocations minus one
        let cases: Vec<Vec<Result<u32, &str>>> = vec![
            vec![Ok(1)],
            vec![Err("a"), Ok(2)],
            vec![Err("a"), Err("b"), Ok(3)],
        ];

        for outcomes in cases {
            let expected_calls = outcomes.len();
            let expected = outcomes[expected_calls - 1].clone();
            let mut outcomes = outcomes.into_iter();
            let mut calls = 0;
            let delay = RecordingDelay::default();
            let connector = RetryingConnector::new(RetryPolicy::default(), None);

            let result = connector.connect(&delay, |_| {
                calls += 1;
                outcomes.next().unwrap()
            });

            assert_eq!(result, expected);
            assert_eq!(calls, expected_calls);
            assert_eq!(delay.0.borrow().len(), expected_calls - 1);
        }
    }

    #[test]
    fn always_failing_returns_last_error() {
        let delay = RecordingDelay::default();
        let connector = RetryingConnector::new(RetryPolicy::default(), None);
        let mut calls = 0;

        let result: Result<(), String> = connector.connect(&delay, |_| {
            calls += 1;
            Err(format!("refused #{}", calls))
        });

        assert_eq!(result, Err(String::from("refused #3")));
        assert_eq!(calls, 3);
        assert_default_backoffs(&delay.0.borrow());
    }

    #[test]
    fn invalidation_spends_an_extra_attempt() {
        let delay = RecordingDelay::default();
        let connector = RetryingConnector::new(RetryPolicy::default(), None);
        let mut calls = 0;

        let result: Result<(), &str> = connector.connect(&delay, |hook| {
            calls += 1;
            if calls == 1 {
                hook.fire(InvalidationEvent {
                    connection: ConnectionId::from(7),
                    cause: "server closed the connection",
                });
            }
            Err("refused")
        });

        assert_eq!(result, Err("refused"));
        assert_eq!(calls, 2);
        assert_eq!(delay.0.borrow().len(), 1);
    }

    #[test]
    fn invalidation_on_success_is_harmless() {
        let delay = RecordingDelay::default();
        let connector = RetryingConnector::new(RetryPolicy::default(), None);

        let result: Result<u8, &str> = connector.connect(&delay, |hook| {
            hook.fire(InvalidationEvent {
                connection: ConnectionId::from(1),
                cause: "stale",
            });
            Ok(1)
        });

        assert_eq!(result, Ok(1));
        assert!(delay.0.borrow().is_empty());
    }

    #[test]
    fn policy_is_configurable() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 10,
            jitter: 0.0,
        };
        let delay = RecordingDelay::default();
        let connector = RetryingConnector::new(policy, None);
        let mut calls = 0;

        let result: Result<(), &str> = connector.connect(&delay, |_| {
            calls += 1;
            Err("down")
        });

        assert!(result.is_err());
        assert_eq!(calls, 5);
        assert_eq!(*delay.0.borrow(), vec![ms(10), ms(20), ms(40), ms(80)]);
    }

    #[test]
    fn single_attempt_policy_never_sleeps() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let delay = RecordingDelay::default();
        let connector = RetryingConnector::new(policy, None);
        let mut calls = 0;

        let result: Result<(), &str> = connector.connect(&delay, |_| {
            calls += 1;
            Err("down")
        });

        assert!(result.is_err());
        assert_eq!(calls, 1);
        assert!(delay.0.borrow().is_empty());
    }

    #[tokio::test]
    async fn async_always_failing_returns_last_error() {
        let delay = RecordingAsyncDelay::default();
        let connector = RetryingConnector::new(RetryPolicy::default(), None);
        let calls = Mutex::new(0);

        let result: Result<(), String> = connector
            .connect_async(&delay, |_| {
                let mut calls = calls.lock().unwrap();
                *calls += 1;
                let n = *calls;
                async move { Err(format!("refused #{}", n)) }
            })
            .await;

        assert_eq!(result, Err(String::from("refused #3")));
        assert_eq!(*calls.lock().unwrap(), 3);
        assert_default_backoffs(&delay.0.lock().unwrap());
    }

    #[tokio::test]
    async fn async_recovers_after_one_failure() {
        let delay = RecordingAsyncDelay::default();
        let connector = RetryingConnector::new(RetryPolicy::default(), None);
        let calls = Mutex::new(0);

        let result: Result<&str, &str> = connector
            .connect_async(&delay, |_| {
                let mut calls = calls.lock().unwrap();
                *calls += 1;
                let first = *calls == 1;
                async move {
                    if first {
                        Err("refused")
                    } else {
                        Ok("connected")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("connected"));
        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(delay.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn async_invalidation_spends_an_extra_attempt() {
        let delay = RecordingAsyncDelay::default();
        let connector = RetryingConnector::new(RetryPolicy::default(), None);
        let calls = Mutex::new(0);

        let result: Result<(), &str> = connector
            .connect_async(&delay, |hook| {
                let mut calls = calls.lock().unwrap();
                *calls += 1;
                let first = *calls == 1;
                async move {
                    if first {
                        hook.fire(InvalidationEvent {
                            connection: ConnectionId::from(3),
                            cause: "server closed the connection",
                        });
                    }
                    Err("refused")
                }
            })
            .await;

        assert_eq!(result, Err("refused"));
        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(delay.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn nan_jitter_means_no_jitter() {
        let policy = RetryPolicy {
            base_delay_ms: 10,
            jitter: f64::NAN,
            ..RetryPolicy::default()
        };
        let delay = RecordingDelay::default();
        let connector = RetryingConnector::new(policy, None);

        let result: Result<(), &str> = connector.connect(&delay, |_| Err("down"));

        assert!(result.is_err());
        assert_eq!(*delay.0.borrow(), vec![ms(10), ms(20)]);
    }

    #[test]
    fn jitter_is_clamped() {
        for jitter in &[f64::INFINITY, 7.5] {
            let policy = RetryPolicy {
                base_delay_ms: 10,
                jitter: *jitter,
                ..RetryPolicy::default()
            };
            let delay = RecordingDelay::default();
            let connector = RetryingConnector::new(policy, None);

            let result: Result<(), &str> =
                connector.connect(&delay, |_| Err("down"));

            assert!(result.is_err());
            let sleeps = delay.0.borrow();
            assert!(sleeps[0] >= ms(10) && sleeps[0] <= ms(20), "{:?}", sleeps);
            assert!(sleeps[1] >= ms(20) && sleeps[1] <= ms(40), "{:?}", sleeps);
        }
    }

    #[test]
    fn negative_jitter_means_no_jitter() {
        let policy = RetryPolicy {
            base_delay_ms: 10,
            jitter: -0.5,
            ..RetryPolicy::default()
        };
        let delay = RecordingDelay::default();
        let connector = RetryingConnector::new(policy, None);

        let result: Result<(), &str> = connector.connect(&delay, |_| Err("down"));

        assert!(result.is_err());
        assert_eq!(*delay.0.borrow(), vec![ms(10), ms(20)]);
    }
}
