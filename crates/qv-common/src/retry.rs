//! Retry policies, exponential backoff, and error classification.
//!
//! Classification feeds both the retry decorator and the error-handling
//! decorator: transient failures are retried, critical failures are never
//! retried, everything else is eligible for dead-lettering after the
//! current attempt. Cancellation is its own class and is surfaced
//! unchanged.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::QuiverError;

/// Backend error codes treated as transient (connection drops, failovers,
/// throttling). Matched against `QuiverError::Storage { code, .. }`.
pub const TRANSIENT_STORAGE_CODES: &[i32] = &[
    2, 20, 64, 233, 10053, 10054, 40197, 40501, 40613, 49918, 49919, 49920,
];

/// How an error should be treated by retry and dead-letter machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after a delay.
    Transient,
    /// Never retry, never dead-letter; fail fast.
    Critical,
    /// Not retryable; dead-letter after the current attempt.
    Permanent,
    /// Cancellation or shutdown; surfaced unchanged, never dead-lettered.
    Cancellation,
}

/// Classify an error for retry purposes.
///
/// Timeouts and explicitly transient failures retry. Storage errors retry
/// when the backend code is in [`TRANSIENT_STORAGE_CODES`]. Memory and
/// access faults are critical. Messages mentioning a timeout, or handler
/// failures mentioning a connection, are treated as transient regardless
/// of kind.
pub fn classify(error: &QuiverError) -> ErrorClass {
    match error {
        QuiverError::Timeout(_) | QuiverError::Transient(_) => ErrorClass::Transient,
        QuiverError::Cancelled | QuiverError::ShutdownInProgress => ErrorClass::Cancellation,
        QuiverError::Storage { code: Some(code), .. }
            if TRANSIENT_STORAGE_CODES.contains(code) =>
        {
            ErrorClass::Transient
        }
        _ => {
            let text = error.to_string().to_ascii_lowercase();
            if is_critical_fault(&text) {
                ErrorClass::Critical
            } else if text.contains("timeout") || text.contains("connection") {
                ErrorClass::Transient
            } else {
                ErrorClass::Permanent
            }
        }
    }
}

fn is_critical_fault(text: &str) -> bool {
    text.contains("out of memory") || text.contains("stack overflow") || text.contains("access violation")
}

// ============================================================================
// Backoff
// ============================================================================

/// Exponential backoff with multiplicative jitter.
///
/// `delay(n) = base * 2^n * (1 + rand[0, jitter))`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            base,
            max_delay,
            jitter,
        }
    }

    /// No-jitter variant for tests and reproducible schedules.
    pub fn deterministic(base: Duration, max_delay: Duration) -> Self {
        Self::new(base, max_delay, 0.0)
    }

    /// Delay before attempt `attempt + 1` (0-based attempt counter).
    pub fn delay(&self, attempt: u32) -> Duration {
        // 2^attempt saturates well before the cap dominates
        let exp = 1u64 << attempt.min(20);
        let uncapped = self.base.saturating_mul(exp as u32);
        let capped = uncapped.min(self.max_delay);

        if self.jitter <= 0.0 {
            return capped;
        }

        let factor = 1.0 + rand::thread_rng().gen_range(0.0..self.jitter);
        let jittered = capped.mul_f64(factor);
        jittered.min(self.max_delay)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.3,
        }
    }
}

// ============================================================================
// Retry Policies
// ============================================================================

/// Optional predicate restricting which errors a policy retries.
pub type RetryPredicate = Arc<dyn Fn(&QuiverError) -> bool + Send + Sync>;

/// Retry decision logic consumed by the pipeline retry decorator and the
/// durable processors.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Never retry.
    None,
    /// Fixed delay between attempts.
    Linear {
        max_attempts: u32,
        delay: Duration,
        retry_on: Option<RetryPredicate>,
    },
    /// Exponential backoff with jitter.
    ExponentialBackoff { max_attempts: u32, backoff: Backoff },
}

impl RetryPolicy {
    pub fn linear(max_attempts: u32, delay: Duration) -> Self {
        Self::Linear {
            max_attempts,
            delay,
            retry_on: None,
        }
    }

    pub fn linear_for(
        max_attempts: u32,
        delay: Duration,
        retry_on: RetryPredicate,
    ) -> Self {
        Self::Linear {
            max_attempts,
            delay,
            retry_on: Some(retry_on),
        }
    }

    pub fn exponential(max_attempts: u32) -> Self {
        Self::ExponentialBackoff {
            max_attempts,
            backoff: Backoff::default(),
        }
    }

    pub fn exponential_with(max_attempts: u32, backoff: Backoff) -> Self {
        Self::ExponentialBackoff {
            max_attempts,
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Linear { max_attempts, .. } | Self::ExponentialBackoff { max_attempts, .. } => {
                *max_attempts
            }
        }
    }

    /// Whether `error` should be retried after `attempt` failures so far.
    ///
    /// Critical errors and cancellation are never retried. When a retry
    /// predicate is configured, errors outside it are not retried.
    pub fn should_retry(&self, error: &QuiverError, attempt: u32) -> bool {
        if attempt >= self.max_attempts() {
            return false;
        }
        match classify(error) {
            ErrorClass::Critical | ErrorClass::Cancellation => return false,
            ErrorClass::Transient | ErrorClass::Permanent => {}
        }
        match self {
            Self::None => false,
            Self::Linear { retry_on, .. } => match retry_on {
                Some(predicate) => predicate(error),
                None => true,
            },
            Self::ExponentialBackoff { .. } => true,
        }
    }

    /// Delay before re-invoking after `attempt` failures (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Linear { delay, .. } => *delay,
            Self::ExponentialBackoff { backoff, .. } => backoff.delay(attempt),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "RetryPolicy::None"),
            Self::Linear {
                max_attempts,
                delay,
                retry_on,
            } => f
                .debug_struct("RetryPolicy::Linear")
                .field("max_attempts", max_attempts)
                .field("delay", delay)
                .field("has_predicate", &retry_on.is_some())
                .finish(),
            Self::ExponentialBackoff {
                max_attempts,
                backoff,
            } => f
                .debug_struct("RetryPolicy::ExponentialBackoff")
                .field("max_attempts", max_attempts)
                .field("backoff", backoff)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let backoff = Backoff::deterministic(Duration::from_secs(1), Duration::from_secs(30));
        let mut previous = Duration::ZERO;
        for attempt in 0..10 {
            let delay = backoff.delay(attempt);
            assert!(delay >= previous, "backoff decreased at attempt {attempt}");
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
        assert_eq!(backoff.delay(9), Duration::from_secs(30));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.3);
        for attempt in 0..12 {
            assert!(backoff.delay(attempt) <= Duration::from_secs(30));
        }
    }

    #[test]
    fn timeouts_classify_transient() {
        assert_eq!(
            classify(&QuiverError::Timeout("fetch".into())),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&QuiverError::HandlerFailed("connection reset by peer".into())),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&QuiverError::storage_with_code("failover", 40613)),
            ErrorClass::Transient
        );
    }

    #[test]
    fn cancellation_is_never_retryable() {
        assert_eq!(classify(&QuiverError::Cancelled), ErrorClass::Cancellation);
        let policy = RetryPolicy::exponential(5);
        assert!(!policy.should_retry(&QuiverError::Cancelled, 0));
    }

    #[test]
    fn critical_faults_are_not_retried() {
        let oom = QuiverError::HandlerFailed("allocator reported out of memory".into());
        assert_eq!(classify(&oom), ErrorClass::Critical);
        assert!(!RetryPolicy::linear(3, Duration::from_millis(1)).should_retry(&oom, 0));
    }

    #[test]
    fn no_retry_policy_always_declines() {
        let policy = RetryPolicy::None;
        assert_eq!(policy.max_attempts(), 0);
        assert!(!policy.should_retry(&QuiverError::Timeout("t".into()), 0));
    }

    #[test]
    fn linear_predicate_limits_retryable_set() {
        let policy = RetryPolicy::linear_for(
            3,
            Duration::from_millis(10),
            Arc::new(|e| matches!(e, QuiverError::Timeout(_))),
        );
        assert!(policy.should_retry(&QuiverError::Timeout("t".into()), 1));
        assert!(!policy.should_retry(&QuiverError::HandlerFailed("boom".into()), 1));
    }

    #[test]
    fn attempts_beyond_max_are_declined() {
        let policy = RetryPolicy::exponential(2);
        let error = QuiverError::Timeout("t".into());
        assert!(policy.should_retry(&error, 1));
        assert!(!policy.should_retry(&error, 2));
    }
}
