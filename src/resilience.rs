//! Resilient request handling: retry with exponential backoff, per-attempt
//! timeouts, and a circuit breaker, packaged as a [Handler] decorator so
//! attempts stay transparent to the rest of the pipeline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Error;
use crate::mediator::{Context, Handler, Request};
use crate::message::Envelope;

/// Retry policy configuration for exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap for the exponential backoff delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay on each retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that performs a single attempt and never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Overrides the total number of attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Overrides the delay before the first retry.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Calculates the backoff delay for the given 0-based attempt number.
    ///
    /// Uses exponential backoff: `initial_delay * multiplier ^ attempt`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_delay)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures within the window before opening
    /// the circuit.
    pub failure_threshold: u32,
    /// Failures further apart than this window do not accumulate.
    pub window: Duration,
    /// How long the circuit stays open before admitting a trial request.
    pub cooldown: Duration,
    /// Number of successes in the half-open state before closing the circuit.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation; failures are counted.
    Closed,
    /// Requests fail immediately until the cooldown elapses.
    Open,
    /// Trial requests are admitted to probe recovery.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
}

/// A circuit breaker guarding a handler: opens after a run of consecutive
/// failures within the configured window, fails fast while open, and probes
/// recovery through a half-open state after the cooldown.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    /// Creates a new [CircuitBreaker] in the closed state.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                last_failure_at: None,
                opened_at: None,
            })),
        }
    }

    /// Returns the current state of the breaker, transitioning an expired
    /// open circuit to half-open.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open {
            let expired = inner
                .opened_at
                .map_or(true, |at| at.elapsed() >= self.config.cooldown);

            if expired {
                inner.state = BreakerState::HalfOpen;
                inner.half_open_successes = 0;
            }
        }
    }

    fn try_pass(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state != BreakerState::Open
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            },
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;

                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                }
            },
            BreakerState::Open => {},
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            BreakerState::Closed => {
                let in_window = inner
                    .last_failure_at
                    .map_or(false, |at| at.elapsed() < self.config.window);

                if !in_window {
                    inner.consecutive_failures = 0;
                }

                inner.consecutive_failures += 1;
                inner.last_failure_at = Some(now);

                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    tracing::warn!("circuit opened after {} consecutive failures", inner.consecutive_failures);
                }
            },
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
            },
            BreakerState::Open => {},
        }
    }
}

/// A resilience profile: how many attempts to make, the per-attempt
/// deadline, and whether a circuit breaker guards the handler.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    /// The retry policy applied to transient failures.
    pub retry: RetryPolicy,
    /// The per-attempt deadline, enforced as a
    /// [Timeout][crate::error::Code::Timeout] failure.
    pub timeout: Option<Duration>,
    /// The circuit breaker configuration, when enabled.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Profile {
    /// A liberal profile for local development: single attempt, no
    /// deadline, no breaker.
    pub fn development() -> Self {
        Self {
            retry: RetryPolicy::none(),
            timeout: None,
            circuit_breaker: None,
        }
    }

    /// A production profile: retries, a per-attempt deadline and a
    /// circuit breaker, all at their default settings.
    pub fn production() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: Some(Duration::from_secs(30)),
            circuit_breaker: Some(CircuitBreakerConfig::default()),
        }
    }
}

/// [Handler] decorator applying a resilience [Profile] to every dispatch.
///
/// Attempts are transparent to the pipeline: behaviors run once, the wrapped
/// handler up to `max_attempts` times. The final failure carries the number
/// of attempts performed.
pub struct Resilient<H> {
    inner: H,
    profile: Profile,
    breaker: Option<CircuitBreaker>,
}

impl<H> Resilient<H> {
    /// Wraps the handler with the given resilience [Profile].
    pub fn new(inner: H, profile: Profile) -> Self {
        let breaker = profile.circuit_breaker.clone().map(CircuitBreaker::new);

        Self {
            inner,
            profile,
            breaker,
        }
    }

    /// Returns the circuit breaker guarding the handler, when enabled.
    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }
}

#[async_trait]
impl<T, H> Handler<T> for Resilient<H>
where
    T: Request + Clone,
    H: Handler<T>,
{
    async fn handle(&self, request: Envelope<T>, ctx: &Context) -> Result<T::Response, Error> {
        let max_attempts = self.profile.retry.max_attempts.max(1);

        for attempt in 0..max_attempts {
            if ctx.is_cancelled() {
                return Err(Error::cancelled().with_attempts(attempt));
            }

            if let Some(breaker) = &self.breaker {
                if !breaker.try_pass() {
                    return Err(Error::dependency("circuit breaker is open")
                        .with_attempts(attempt));
                }
            }

            let outcome = match self.profile.timeout {
                Some(limit) => match tokio::time::timeout(
                    limit,
                    self.inner.handle(request.clone(), ctx),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::timeout(format!(
                        "handler exceeded its {}ms deadline",
                        limit.as_millis(),
                    ))),
                },
                None => self.inner.handle(request.clone(), ctx).await,
            };

            match outcome {
                Ok(response) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }

                    return Ok(response);
                },
                Err(error) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_failure();
                    }

                    if attempt + 1 < max_attempts && error.is_transient() {
                        let delay = self.profile.retry.delay_for_attempt(attempt);

                        tracing::debug!(
                            request = request.message.name(),
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "transient failure, retrying",
                        );

                        tokio::select! {
                            () = ctx.cancellation().cancelled() => {
                                return Err(Error::cancelled().with_attempts(attempt + 1));
                            },
                            () = tokio::time::sleep(delay) => {},
                        }

                        continue;
                    }

                    return Err(error.with_attempts(attempt + 1));
                },
            }
        }

        Err(Error::unhandled("retry budget exhausted").with_attempts(max_attempts))
    }
}
