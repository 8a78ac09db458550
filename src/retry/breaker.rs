//! Per-account circuit breaker state machine.
//!
//! Pure bookkeeping driven by explicit timestamps; the retry manager owns one
//! instance per destination account and is the only caller.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: BreakerState,
    pub to: BreakerState,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single half-open trial call
    Trial,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    next_trial_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            next_trial_at: None,
            trial_in_flight: false,
        }
    }
}

impl CircuitBreaker {
    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    pub fn next_trial_at(&self) -> Option<DateTime<Utc>> {
        self.next_trial_at
    }

    /// Decide whether a call may go out now.
    ///
    /// `Err` carries the time the next trial call becomes possible.
    pub fn admit(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<(Admission, Option<Transition>), DateTime<Utc>> {
        match self.state {
            BreakerState::Closed => Ok((Admission::Normal, None)),
            BreakerState::Open => {
                let trial_at = self.next_trial_at.unwrap_or(now);
                if now < trial_at {
                    return Err(trial_at);
                }
                self.state = BreakerState::HalfOpen;
                self.trial_in_flight = true;
                Ok((
                    Admission::Trial,
                    Some(Transition {
                        from: BreakerState::Open,
                        to: BreakerState::HalfOpen,
                    }),
                ))
            }
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    return Err(self.next_trial_at.unwrap_or(now));
                }
                self.trial_in_flight = true;
                Ok((Admission::Trial, None))
            }
        }
    }

    pub fn on_success(&mut self) -> Option<Transition> {
        let from = self.state;
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.next_trial_at = None;
        self.trial_in_flight = false;

        (from != BreakerState::Closed).then_some(Transition {
            from,
            to: BreakerState::Closed,
        })
    }

    /// Record a retryable failure.
    pub fn on_failure(
        &mut self,
        now: DateTime<Utc>,
        threshold: u32,
        cooldown: Duration,
    ) -> Option<Transition> {
        self.consecutive_failures += 1;

        match self.state {
            BreakerState::HalfOpen => {
                self.trip(now, cooldown);
                Some(Transition {
                    from: BreakerState::HalfOpen,
                    to: BreakerState::Open,
                })
            }
            BreakerState::Closed if self.consecutive_failures >= threshold => {
                self.trip(now, cooldown);
                Some(Transition {
                    from: BreakerState::Closed,
                    to: BreakerState::Open,
                })
            }
            _ => None,
        }
    }

    /// A non-retryable result says nothing about availability: free the trial
    /// slot without moving the breaker.
    pub fn on_neutral(&mut self) {
        self.trial_in_flight = false;
    }

    fn trip(&mut self, now: DateTime<Utc>, cooldown: Duration) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.next_trial_at = Some(now + cooldown);
        self.trial_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: u32 = 3;

    fn cooldown() -> Duration {
        Duration::seconds(30)
    }

    fn tripped(now: DateTime<Utc>) -> CircuitBreaker {
        let mut b = CircuitBreaker::default();
        for _ in 0..THRESHOLD {
            b.on_failure(now, THRESHOLD, cooldown());
        }
        b
    }

    #[test]
    fn test_opens_at_threshold() {
        let now = Utc::now();
        let mut b = CircuitBreaker::default();

        assert_eq!(b.on_failure(now, THRESHOLD, cooldown()), None);
        assert_eq!(b.on_failure(now, THRESHOLD, cooldown()), None);
        let t = b.on_failure(now, THRESHOLD, cooldown()).unwrap();

        assert_eq!(t.from, BreakerState::Closed);
        assert_eq!(t.to, BreakerState::Open);
        assert_eq!(b.next_trial_at(), Some(now + cooldown()));
        assert_eq!(b.opened_at(), Some(now));
    }

    #[test]
    fn test_open_rejects_until_cooldown() {
        let now = Utc::now();
        let mut b = tripped(now);

        let retry_at = b.admit(now + Duration::seconds(5)).unwrap_err();
        assert_eq!(retry_at, now + cooldown());
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn test_single_trial_call_after_cooldown() {
        let now = Utc::now();
        let mut b = tripped(now);
        let later = now + cooldown() + Duration::seconds(1);

        let (admission, transition) = b.admit(later).unwrap();
        assert_eq!(admission, Admission::Trial);
        assert_eq!(transition.unwrap().to, BreakerState::HalfOpen);

        // Second caller while the trial call is out
        assert!(b.admit(later).is_err());
    }

    #[test]
    fn test_trial_success_closes() {
        let now = Utc::now();
        let mut b = tripped(now);
        b.admit(now + cooldown()).unwrap();

        let t = b.on_success().unwrap();
        assert_eq!(t.from, BreakerState::HalfOpen);
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.consecutive_failures(), 0);
        assert_eq!(b.admit(now).unwrap().0, Admission::Normal);
    }

    #[test]
    fn test_trial_failure_reopens_with_fresh_cooldown() {
        let now = Utc::now();
        let mut b = tripped(now);
        let trial_time = now + cooldown();
        b.admit(trial_time).unwrap();

        let t = b.on_failure(trial_time, THRESHOLD, cooldown()).unwrap();
        assert_eq!(t.from, BreakerState::HalfOpen);
        assert_eq!(t.to, BreakerState::Open);
        assert_eq!(b.next_trial_at(), Some(trial_time + cooldown()));
    }

    #[test]
    fn test_neutral_result_frees_trial_slot() {
        let now = Utc::now();
        let mut b = tripped(now);
        b.admit(now + cooldown()).unwrap();
        b.on_neutral();

        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert_eq!(b.admit(now + cooldown()).unwrap().0, Admission::Trial);
    }

    #[test]
    fn test_success_in_closed_is_silent() {
        let mut b = CircuitBreaker::default();
        b.on_failure(Utc::now(), THRESHOLD, cooldown());
        assert_eq!(b.on_success(), None);
        assert_eq!(b.consecutive_failures(), 0);
    }
}
