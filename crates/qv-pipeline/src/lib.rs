//! Processing pipeline: an ordered decorator chain around a terminal
//! processor.
//!
//! Decorators are registered outermost-first and folded around the
//! terminal in reverse registration order, so the first-registered stage
//! runs first. Every stage returns a [`ProcessingResult`]; failures never
//! cross a stage boundary as panics. The terminal processor runs exactly
//! once per call unless a Retry stage re-invokes it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use qv_common::{Message, ProcessingContext, ProcessingResult, QuiverError};

pub mod circuit_breaker;
pub mod error_handling;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod validation;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error_handling::{DeadLetterSink, ErrorHandlingConfig};
pub use metrics::{PipelineMetrics, PipelineMetricsSnapshot};
pub use validation::MessageValidator;

/// One stage of the pipeline. Implementations wrap an inner stage and may
/// observe, mutate context, retry, or short-circuit.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn process(
        &self,
        message: Arc<dyn Message>,
        ctx: &ProcessingContext,
    ) -> ProcessingResult;
}

/// Terminal handler signature: the domain function at the center of the
/// chain.
pub type TerminalFn = Arc<
    dyn Fn(Arc<dyn Message>, ProcessingContext) -> BoxFuture<'static, ProcessingResult>
        + Send
        + Sync,
>;

/// Terminal processor executing the domain function. Catches nothing
/// itself; the closure is expected to return `ProcessingResult`, and the
/// surrounding stages convert anything else.
pub struct CoreMessageProcessor {
    terminal: TerminalFn,
}

impl CoreMessageProcessor {
    pub fn new(terminal: TerminalFn) -> Self {
        Self { terminal }
    }
}

#[async_trait]
impl MessageProcessor for CoreMessageProcessor {
    fn name(&self) -> &str {
        "core"
    }

    async fn process(
        &self,
        message: Arc<dyn Message>,
        ctx: &ProcessingContext,
    ) -> ProcessingResult {
        if ctx.is_cancelled() {
            return ProcessingResult::failed(QuiverError::Cancelled);
        }
        (self.terminal)(message, ctx.clone()).await
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Stage descriptions, materialized into decorator instances at build time.
#[derive(Clone)]
enum StageSpec {
    Logging {
        level: tracing::Level,
        include_payload: bool,
    },
    Validation,
    Retry(qv_common::RetryPolicy),
    CircuitBreaker(CircuitBreakerConfig),
    ErrorHandling(ErrorHandlingConfig),
    Metrics,
}

/// Builds a pipeline by folding decorators around a terminal processor.
///
/// Stages are added in the order they should run, outermost first. The
/// fold happens in reverse so registration order equals execution order.
/// Cloning a builder shares its metrics collector and dead-letter sink;
/// stateful stages (circuit breakers) are fresh per build.
#[derive(Clone)]
pub struct PipelineBuilder {
    stages: Vec<StageSpec>,
    validators: Vec<Arc<dyn MessageValidator>>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    metrics: Arc<PipelineMetrics>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            validators: Vec::new(),
            dead_letter: None,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    /// Bare terminal, no decorators.
    pub fn minimal() -> Self {
        Self::new()
    }

    /// Metrics and a single retry; for hot paths where latency matters
    /// more than diagnostics.
    pub fn high_throughput() -> Self {
        Self::new()
            .with_metrics()
            .with_retry(qv_common::RetryPolicy::exponential(1))
    }

    /// Debug logging, validation, two retries.
    pub fn development() -> Self {
        Self::new()
            .with_logging(tracing::Level::DEBUG, false)
            .with_validation()
            .with_retry(qv_common::RetryPolicy::exponential(2))
    }

    /// Full stack for service-to-service integration traffic.
    pub fn integration() -> Self {
        Self::new()
            .with_metrics()
            .with_logging(tracing::Level::INFO, false)
            .with_validation()
            .with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 5,
                failure_rate_threshold: 0.5,
                break_duration: std::time::Duration::from_secs(30),
                minimum_throughput: 10,
            })
            .with_error_handling(ErrorHandlingConfig::with_max_retries(3))
            .with_retry(qv_common::RetryPolicy::exponential_with(
                3,
                qv_common::Backoff::new(
                    std::time::Duration::from_secs(2),
                    std::time::Duration::from_secs(60),
                    0.3,
                ),
            ))
    }

    /// Widest safety margins plus payload logging; for traffic where a
    /// dropped message is a business incident.
    pub fn critical_business() -> Self {
        Self::new()
            .with_metrics()
            .with_logging(tracing::Level::INFO, true)
            .with_validation()
            .with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 10,
                failure_rate_threshold: 0.3,
                break_duration: std::time::Duration::from_secs(60),
                minimum_throughput: 20,
            })
            .with_error_handling(ErrorHandlingConfig::with_max_retries(5))
            .with_retry(qv_common::RetryPolicy::exponential(5))
    }

    // ------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------

    pub fn with_logging(mut self, level: tracing::Level, include_payload: bool) -> Self {
        self.stages.push(StageSpec::Logging {
            level,
            include_payload,
        });
        self
    }

    pub fn with_validation(mut self) -> Self {
        self.stages.push(StageSpec::Validation);
        self
    }

    pub fn add_validator(mut self, validator: Arc<dyn MessageValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn with_retry(mut self, policy: qv_common::RetryPolicy) -> Self {
        self.stages.push(StageSpec::Retry(policy));
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.stages.push(StageSpec::CircuitBreaker(config));
        self
    }

    pub fn with_error_handling(mut self, config: ErrorHandlingConfig) -> Self {
        self.stages.push(StageSpec::ErrorHandling(config));
        self
    }

    pub fn with_metrics(mut self) -> Self {
        self.stages.push(StageSpec::Metrics);
        self
    }

    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// Shared metrics collector; snapshots survive the builder.
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Fold the registered stages around `terminal`. First-registered runs
    /// outermost.
    pub fn build(self, terminal: TerminalFn) -> Arc<dyn MessageProcessor> {
        let mut processor: Arc<dyn MessageProcessor> =
            Arc::new(CoreMessageProcessor::new(terminal));

        for spec in self.stages.into_iter().rev() {
            processor = match spec {
                StageSpec::Logging {
                    level,
                    include_payload,
                } => Arc::new(logging::LoggingDecorator::new(
                    processor,
                    level,
                    include_payload,
                )),
                StageSpec::Validation => Arc::new(validation::ValidationDecorator::new(
                    processor,
                    self.validators.clone(),
                )),
                StageSpec::Retry(policy) => {
                    Arc::new(retry::RetryDecorator::new(processor, policy))
                }
                StageSpec::CircuitBreaker(config) => Arc::new(
                    circuit_breaker::CircuitBreakerDecorator::new(processor, config),
                ),
                StageSpec::ErrorHandling(config) => {
                    Arc::new(error_handling::ErrorHandlingDecorator::new(
                        processor,
                        config,
                        self.dead_letter.clone(),
                    ))
                }
                StageSpec::Metrics => {
                    Arc::new(metrics::MetricsDecorator::new(processor, self.metrics.clone()))
                }
            };
        }

        processor
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
