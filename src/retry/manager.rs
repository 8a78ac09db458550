//! Retry manager: bounded exponential-backoff retries with a circuit breaker
//! per destination account.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::DestinationError;
use crate::config::{CircuitBreakerConfig, RetryConfig};
use crate::notify::{Notification, NotificationKind, Notifier};

use super::breaker::{Admission, BreakerState, CircuitBreaker, Transition};

/// Successful execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Executed<T> {
    pub value: T,
    /// Attempts made, including the successful one
    pub attempts: u32,
}

/// Why an execute call gave up.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchFailure {
    /// Breaker open; nothing was sent on this attempt
    #[error("circuit open until {retry_at}")]
    CircuitOpen { retry_at: DateTime<Utc>, attempts: u32 },

    #[error("{error}")]
    NonRetryable { error: DestinationError, attempts: u32 },

    #[error("gave up after {attempts} attempts: {error}")]
    Exhausted { error: DestinationError, attempts: u32 },

    /// Shutdown arrived between attempts
    #[error("interrupted by shutdown after {attempts} attempts: {error}")]
    Interrupted { error: DestinationError, attempts: u32 },
}

impl DispatchFailure {
    pub fn attempts(&self) -> u32 {
        match self {
            DispatchFailure::CircuitOpen { attempts, .. }
            | DispatchFailure::NonRetryable { attempts, .. }
            | DispatchFailure::Exhausted { attempts, .. }
            | DispatchFailure::Interrupted { attempts, .. } => *attempts,
        }
    }

    pub fn error(&self) -> Option<&DestinationError> {
        match self {
            DispatchFailure::CircuitOpen { .. } => None,
            DispatchFailure::NonRetryable { error, .. }
            | DispatchFailure::Exhausted { error, .. }
            | DispatchFailure::Interrupted { error, .. } => Some(error),
        }
    }
}

/// Point-in-time view of one account's breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    pub account_id: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub next_trial_at: Option<DateTime<Utc>>,
}

/// Wraps destination operations with retries and per-account isolation.
pub struct RetryManager {
    policy: RetryConfig,
    breaker_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    notifier: Arc<dyn Notifier>,
    shutdown: watch::Receiver<bool>,
}

impl RetryManager {
    pub fn new(
        policy: RetryConfig,
        breaker_config: CircuitBreakerConfig,
        notifier: Arc<dyn Notifier>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            policy,
            breaker_config,
            breakers: Mutex::new(HashMap::new()),
            notifier,
            shutdown,
        }
    }

    /// Run `operation` against `account_id` with retries.
    ///
    /// Non-retryable errors return immediately and leave the breaker alone.
    /// Retryable errors count against the breaker and are retried up to
    /// `max_attempts`, sleeping with capped exponential backoff plus jitter.
    /// Only this call waits; other accounts are unaffected.
    pub async fn execute<T, F, Fut>(
        &self,
        account_id: &str,
        mut operation: F,
    ) -> Result<Executed<T>, DispatchFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DestinationError>>,
    {
        let mut schedule = self.schedule();
        let mut attempts = 0u32;

        loop {
            if let Err(retry_at) = self.admit(account_id).await {
                debug!(account = %account_id, retry_at = %retry_at, "Circuit open, failing fast");
                return Err(DispatchFailure::CircuitOpen { retry_at, attempts });
            }

            attempts += 1;
            let result = match tokio::time::timeout(self.policy.call_timeout(), operation()).await
            {
                Ok(result) => result,
                Err(_) => Err(DestinationError::Timeout),
            };

            let error = match result {
                Ok(value) => {
                    self.record_success(account_id).await;
                    if attempts > 1 {
                        info!(account = %account_id, attempts = attempts, "Succeeded after retries");
                    }
                    return Ok(Executed { value, attempts });
                }
                Err(error) if !error.is_retryable() => {
                    self.record_neutral(account_id);
                    warn!(account = %account_id, kind = error.kind(), error = %error, "Non-retryable failure");
                    return Err(DispatchFailure::NonRetryable { error, attempts });
                }
                Err(error) => error,
            };

            self.record_failure(account_id).await;

            if attempts >= self.policy.max_attempts {
                warn!(
                    account = %account_id,
                    attempts = attempts,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(DispatchFailure::Exhausted { error, attempts });
            }

            let delay = self.next_delay(&mut schedule);
            warn!(
                account = %account_id,
                attempt = attempts,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                kind = error.kind(),
                error = %error,
                "Attempt failed, retrying"
            );

            if self.interrupted_during(delay).await {
                return Err(DispatchFailure::Interrupted { error, attempts });
            }
        }
    }

    /// Snapshot of every breaker that has seen traffic.
    pub fn breakers(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = breakers
            .iter()
            .map(|(id, b)| BreakerSnapshot {
                account_id: id.clone(),
                state: b.state(),
                consecutive_failures: b.consecutive_failures(),
                opened_at: b.opened_at(),
                next_trial_at: b.next_trial_at(),
            })
            .collect();
        out.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        out
    }

    #[cfg(test)]
    pub fn breaker_state(&self, account_id: &str) -> BreakerState {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .get(account_id)
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }

    /// Capped exponential sequence: base, 2*base, 4*base, ... up to max.
    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.policy.base_delay())
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.policy.max_delay())
            .with_max_elapsed_time(None)
            .build()
    }

    fn next_delay(&self, schedule: &mut ExponentialBackoff) -> Duration {
        let delay = schedule
            .next_backoff()
            .unwrap_or_else(|| self.policy.max_delay());

        let fraction = self.policy.jitter_fraction;
        if fraction <= 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=fraction);
        delay + delay.mul_f64(jitter)
    }

    async fn interrupted_during(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        let stopped = async move { shutdown.wait_for(|stop| *stop).await.is_ok() };

        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            stopped = stopped => {
                if !stopped {
                    // Sender gone: nobody can ask us to stop
                    tokio::time::sleep(delay).await;
                }
                stopped
            }
        }
    }

    async fn admit(&self, account_id: &str) -> Result<Admission, DateTime<Utc>> {
        let admitted = {
            let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
            breakers
                .entry(account_id.to_string())
                .or_default()
                .admit(Utc::now())
        };

        let (admission, transition) = admitted?;
        if let Some(t) = transition {
            self.announce(account_id, t, None).await;
        }
        if admission == Admission::Trial {
            info!(account = %account_id, "Circuit half-open, admitting trial call");
        }
        Ok(admission)
    }

    async fn record_success(&self, account_id: &str) {
        let transition = {
            let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
            breakers
                .entry(account_id.to_string())
                .or_default()
                .on_success()
        };
        if let Some(t) = transition {
            self.announce(account_id, t, None).await;
        }
    }

    async fn record_failure(&self, account_id: &str) {
        let (transition, trial_at) = {
            let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
            let breaker = breakers.entry(account_id.to_string()).or_default();
            let transition = breaker.on_failure(
                Utc::now(),
                self.breaker_config.failure_threshold,
                self.breaker_config.cooldown(),
            );
            (transition, breaker.next_trial_at())
        };
        if let Some(t) = transition {
            self.announce(account_id, t, trial_at).await;
        }
    }

    fn record_neutral(&self, account_id: &str) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers.entry(account_id.to_string()).or_default().on_neutral();
    }

    async fn announce(&self, account_id: &str, t: Transition, trial_at: Option<DateTime<Utc>>) {
        let detail = match (t.to, trial_at) {
            (BreakerState::Open, Some(at)) => {
                format!("circuit {} -> {}; next trial call at {}", t.from, t.to, at)
            }
            _ => format!("circuit {} -> {}", t.from, t.to),
        };

        match t.to {
            BreakerState::Open => warn!(account = %account_id, from = %t.from, "Circuit opened"),
            _ => info!(account = %account_id, from = %t.from, to = %t.to, "Circuit state changed"),
        }

        self.notifier
            .notify(Notification::new(NotificationKind::CircuitStateChanged, detail).account(account_id))
            .await;
    }
}
