//! Circuit breaker decorator.
//!
//! Closed → Open after `failure_threshold` consecutive failures, or when
//! the failure rate over the rolling outcome window reaches
//! `failure_rate_threshold` with at least `minimum_throughput` samples.
//! Open rejects calls fast for `break_duration`, then admits a single
//! probe (HalfOpen). Probe success closes the breaker; probe failure
//! re-opens it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use qv_common::{Message, ProcessingContext, ProcessingResult, QuiverError};

use crate::MessageProcessor;

const OUTCOME_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Failure rate (0.0–1.0) over the rolling window that trips the
    /// breaker once `minimum_throughput` samples exist.
    pub failure_rate_threshold: f64,
    /// How long the breaker stays open before admitting a probe.
    pub break_duration: Duration,
    /// Samples required before the rate rule applies.
    pub minimum_throughput: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            break_duration: Duration::from_secs(30),
            minimum_throughput: 10,
        }
    }
}

enum Admission {
    Allowed,
    Rejected,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    /// Recent outcomes, true = success.
    outcomes: Mutex<VecDeque<bool>>,
    probe_in_flight: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            outcomes: Mutex::new(VecDeque::with_capacity(OUTCOME_WINDOW)),
            probe_in_flight: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    fn admit(&self) -> Admission {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = self.opened_at.read().map(|t| t.elapsed());
                if elapsed.map_or(false, |e| e >= self.config.break_duration) {
                    *self.state.write() = CircuitState::HalfOpen;
                    self.probe_in_flight.store(true, Ordering::SeqCst);
                    tracing::debug!("circuit breaker half-open, admitting probe");
                    Admission::Allowed
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                // One probe at a time
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    Admission::Allowed
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    fn record_outcome(&self, success: bool) {
        let mut outcomes = self.outcomes.lock();
        if outcomes.len() == OUTCOME_WINDOW {
            outcomes.pop_front();
        }
        outcomes.push_back(success);
    }

    fn window_failure_rate(&self) -> Option<f64> {
        let outcomes = self.outcomes.lock();
        if (outcomes.len() as u32) < self.config.minimum_throughput {
            return None;
        }
        let failures = outcomes.iter().filter(|ok| !**ok).count();
        Some(failures as f64 / outcomes.len() as f64)
    }

    pub fn record_success(&self) {
        self.record_outcome(true);
        let state = *self.state.read();
        match state {
            CircuitState::HalfOpen => {
                *self.state.write() = CircuitState::Closed;
                *self.opened_at.write() = None;
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.probe_in_flight.store(false, Ordering::SeqCst);
                self.outcomes.lock().clear();
                tracing::info!("circuit breaker closed after successful probe");
            }
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.record_outcome(false);
        let state = *self.state.read();
        match state {
            CircuitState::Closed => {
                let consecutive = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                let rate_tripped = self
                    .window_failure_rate()
                    .map_or(false, |rate| rate >= self.config.failure_rate_threshold);
                if consecutive >= self.config.failure_threshold || rate_tripped {
                    self.trip(consecutive, rate_tripped);
                }
            }
            CircuitState::HalfOpen => {
                *self.state.write() = CircuitState::Open;
                *self.opened_at.write() = Some(Instant::now());
                self.probe_in_flight.store(false, Ordering::SeqCst);
                tracing::warn!("circuit breaker re-opened on failed probe");
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, consecutive: u32, rate_tripped: bool) {
        *self.state.write() = CircuitState::Open;
        *self.opened_at.write() = Some(Instant::now());
        tracing::warn!(
            consecutive_failures = consecutive,
            rate_tripped,
            "circuit breaker opened"
        );
    }
}

pub struct CircuitBreakerDecorator {
    inner: Arc<dyn MessageProcessor>,
    breaker: CircuitBreaker,
}

impl CircuitBreakerDecorator {
    pub fn new(inner: Arc<dyn MessageProcessor>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(config),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl MessageProcessor for CircuitBreakerDecorator {
    fn name(&self) -> &str {
        "circuit-breaker"
    }

    async fn process(
        &self,
        message: Arc<dyn Message>,
        ctx: &ProcessingContext,
    ) -> ProcessingResult {
        if let Admission::Rejected = self.breaker.admit() {
            return ProcessingResult::failed(QuiverError::CircuitOpen(
                message.type_name().to_string(),
            ));
        }

        let result = self.inner.process(message, ctx).await;

        match &result {
            ProcessingResult::Successful { .. } => self.breaker.record_success(),
            ProcessingResult::Failed { error } => {
                // Cancellation is not a downstream fault
                if !matches!(
                    qv_common::classify(error),
                    qv_common::ErrorClass::Cancellation
                ) {
                    self.breaker.record_failure();
                }
            }
        }

        result
    }
}
