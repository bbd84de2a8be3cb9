use std::future::Future;
use std::time;

use rand::Rng;
use thiserror::Error;
use tracing::warn;

use crate::executor::{BoundedExecutor, ExecutorError};

/// Why a single attempt failed.
#[derive(Error, Debug)]
pub enum AttemptError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Operation(E),
    #[error(transparent)]
    Executor(ExecutorError),
}

#[derive(Error, Debug)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: AttemptError<E>,
    },
    #[error("interrupted by shutdown after {attempts} attempts")]
    Interrupted { attempts: u32 },
}

#[derive(Copy, Clone, Debug)]
/// The retry policy used for outbound writes: a fixed number of attempts with a
/// delay that grows linearly with the attempt number.
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    max_attempts: u32,
    /// Delay after the first failed attempt; later delays are multiples of it.
    backoff_base: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        backoff_base: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            maximum_interval,
        }
    }

    /// Time to wait after failed attempt number `attempt` (1-based).
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self.backoff_base * attempt;

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Run `op` on `executor` until it succeeds or the attempts run out. Every
    /// attempt is its own executor task, so each one gets the executor timeout
    /// and no permit is held while sleeping between attempts.
    pub async fn run<F, Fut, T, E>(
        &self,
        executor: &BoundedExecutor,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let outcome = match executor.submit(op()) {
                Ok(handle) => handle.await,
                Err(e) => Err(e),
            };

            let error = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => AttemptError::Operation(e),
                Err(ExecutorError::ShuttingDown) | Err(ExecutorError::Cancelled) => {
                    return Err(RetryError::Interrupted { attempts: attempt })
                }
                Err(e) => AttemptError::Executor(e),
            };

            if attempt >= self.max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.time_until_next_retry(attempt);
            warn!(
                executor = executor.name(),
                attempt,
                ?delay,
                error = %error,
                "attempt failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = executor.closing() => return Err(RetryError::Interrupted { attempts: attempt }),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: time::Duration::from_millis(200),
            maximum_interval: None,
        }
    }
}

#[derive(Copy, Clone, Debug)]
/// Backoff between pipeline restarts after a fatal failure.
pub struct RestartPolicy {
    pub initial_backoff: time::Duration,
    pub max_backoff: time::Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random.
    pub jitter: f64,
    /// How long a streak of failures may last before giving up for good.
    pub max_elapsed: time::Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: time::Duration::from_secs(2),
            max_backoff: time::Duration::from_secs(60),
            multiplier: 1.5,
            jitter: 0.1,
            max_elapsed: time::Duration::from_secs(600),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum InvalidRestartPolicy {
    #[error("restart backoff multiplier must be a finite number of at least 1, got {0}")]
    Multiplier(f64),
    #[error("restart jitter factor must be between 0 and 1, got {0}")]
    Jitter(f64),
    #[error("restart {0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("initial restart backoff {initial:?} exceeds the maximum {max:?}")]
    InitialAboveMax {
        initial: time::Duration,
        max: time::Duration,
    },
}

impl RestartPolicy {
    /// Check the policy once, when it is configured, so that computing a delay
    /// after a failure cannot go wrong.
    pub fn validate(&self) -> Result<(), InvalidRestartPolicy> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(InvalidRestartPolicy::Multiplier(self.multiplier));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(InvalidRestartPolicy::Jitter(self.jitter));
        }
        for (name, value) in [
            ("initial backoff", self.initial_backoff),
            ("max backoff", self.max_backoff),
            ("max elapsed time", self.max_elapsed),
        ] {
            if value.is_zero() {
                return Err(InvalidRestartPolicy::ZeroDuration(name));
            }
        }
        if self.initial_backoff > self.max_backoff {
            return Err(InvalidRestartPolicy::InitialAboveMax {
                initial: self.initial_backoff,
                max: self.max_backoff,
            });
        }
        Ok(())
    }

    /// Delay before restart number `restart` (0-based), without jitter. Never
    /// above `max_backoff`, whatever the multiplier.
    pub fn base_delay(&self, restart: u32) -> time::Duration {
        let exponent = i32::try_from(restart).unwrap_or(i32::MAX);
        let seconds = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        time::Duration::try_from_secs_f64(seconds.max(0.0))
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    pub fn tracker(&self) -> RestartTracker {
        RestartTracker {
            policy: *self,
            restarts: 0,
            streak_started: None,
            running_since: None,
        }
    }
}

/// Restart bookkeeping for one process. A failure streak starts at the first
/// failure and ends once a run has stayed up for `max_elapsed`.
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    restarts: u32,
    streak_started: Option<time::Instant>,
    running_since: Option<time::Instant>,
}

impl RestartTracker {
    pub fn started(&mut self, now: time::Instant) {
        self.running_since = Some(now);
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Record a failure at `now` and return how long to wait before restarting,
    /// or `None` when the restart budget is spent.
    pub fn failed(&mut self, now: time::Instant) -> Option<time::Duration> {
        if let Some(since) = self.running_since.take() {
            if now.saturating_duration_since(since) >= self.policy.max_elapsed {
                self.restarts = 0;
                self.streak_started = None;
            }
        }

        let streak_started = *self.streak_started.get_or_insert(now);
        if now.saturating_duration_since(streak_started) >= self.policy.max_elapsed {
            return None;
        }

        let base = self.policy.base_delay(self.restarts);
        self.restarts += 1;

        let jitter = self.policy.jitter.abs();
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        Some(
            time::Duration::try_from_secs_f64(base.as_secs_f64() * factor.max(0.0))
                .unwrap_or(base),
        )
    }
}
