use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use lisa_core::config::RetryConfig;
use lisa_core::error::{LisaError, Result};
use lisa_core::event::EventBus;
use lisa_core::types::LisaEvent;

use crate::breaker::{BreakerRegistry, CircuitBreaker, Permit};

/// Decides whether a failed attempt may be retried.
pub type RetryPredicate = Arc<dyn Fn(&LisaError) -> bool + Send + Sync>;

/// Called before every retry with `(attempt, error, delay)`. Telemetry only.
pub type RetryObserver = Arc<dyn Fn(u32, &LisaError, Duration) + Send + Sync>;

/// Per-call policy for [`ResilientInvoker::execute`].
#[derive(Clone)]
pub struct InvokeOptions {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
    pub retry_if: Option<RetryPredicate>,
    pub on_retry: Option<RetryObserver>,
}

impl InvokeOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_retry_if(mut self, predicate: impl Fn(&LisaError) -> bool + Send + Sync + 'static) -> Self {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    pub fn on_retry(mut self, observer: impl Fn(u32, &LisaError, Duration) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    fn should_retry(&self, err: &LisaError) -> bool {
        match self.retry_if {
            Some(ref predicate) => predicate(err),
            None => err.is_retryable(),
        }
    }
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for InvokeOptions {
    fn from(config: &RetryConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
            retry_if: None,
            on_retry: None,
        }
    }
}

impl std::fmt::Debug for InvokeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeOptions")
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("retry_if", &self.retry_if.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

/// Delay before retry number `attempt` (1-based):
/// `initial_delay * backoff_multiplier^(attempt-1)`, capped at `max_delay`.
pub fn calculate_backoff(attempt: u32, options: &InvokeOptions) -> Duration {
    let exp = attempt.saturating_sub(1) as i32;
    let base = options.initial_delay.as_millis() as f64 * options.backoff_multiplier.powi(exp);
    let capped = base.min(options.max_delay.as_millis() as f64).max(0.0);
    let ms = if options.jitter {
        // Add jitter: 0.8x to 1.2x
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        (capped * jitter).min(options.max_delay.as_millis() as f64)
    } else {
        capped
    };
    Duration::from_millis(ms as u64)
}

/// Longest [`ResilientInvoker::execute`] can run under `options`: every
/// attempt times out and every backoff takes its maximum.
pub fn worst_case_duration(options: &InvokeOptions) -> Duration {
    let attempts = options.max_attempts.max(1);
    let steady = InvokeOptions {
        jitter: false,
        ..options.clone()
    };
    let backoff: Duration = (1..attempts)
        .map(|attempt| {
            let delay = calculate_backoff(attempt, &steady);
            if options.jitter {
                (delay * 6 / 5).min(options.max_delay)
            } else {
                delay
            }
        })
        .sum();
    options.timeout * attempts + backoff
}

/// Releases a half-open trial slot if the call is dropped before an outcome
/// is recorded.
struct Admission {
    breaker: Arc<CircuitBreaker>,
    permit: Permit,
    settled: bool,
}

impl Admission {
    fn success(mut self) {
        self.settled = true;
        self.breaker.record_success_with(self.permit);
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure_with(self.permit);
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.permit);
        }
    }
}

/// Wraps async operations with breaker admission, timeout and retry.
///
/// Admission is checked once per `execute`, never per attempt, and only the
/// final outcome is recorded to the breaker.
pub struct ResilientInvoker {
    breakers: Arc<BreakerRegistry>,
    defaults: InvokeOptions,
    events: Option<Arc<EventBus>>,
}

impl ResilientInvoker {
    pub fn new(breakers: Arc<BreakerRegistry>, defaults: InvokeOptions) -> Self {
        Self {
            breakers,
            defaults,
            events: None,
        }
    }

    /// Publish `RetryAttempted` events to this bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn defaults(&self) -> &InvokeOptions {
        &self.defaults
    }

    /// Execute with the invoker's default options.
    pub async fn call<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let options = self.defaults.clone();
        self.execute(operation, op, &options).await
    }

    /// Run `op` under the breaker keyed by `operation`.
    ///
    /// An open circuit fails fast with `CircuitOpen` without calling `op`.
    /// Each attempt is bounded by `options.timeout`; a timed-out attempt is
    /// abandoned and classified as `Timeout`.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F, options: &InvokeOptions) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breakers.get(operation);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                debug!(operation, error = %e, "Call rejected by circuit breaker");
                return Err(e);
            }
        };
        let admission = Admission {
            breaker,
            permit,
            settled: false,
        };

        let max_attempts = options.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(options.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(LisaError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: options.timeout.as_millis() as u64,
                }),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Operation succeeded after retry");
                    }
                    admission.success();
                    return Ok(value);
                }
                Err(e) => {
                    if options.should_retry(&e) && attempt < max_attempts {
                        let delay = calculate_backoff(attempt, options);
                        warn!(
                            operation,
                            attempt,
                            max_attempts,
                            backoff_ms = delay.as_millis() as u64,
                            error = %e,
                            "Retrying operation"
                        );
                        if let Some(ref observer) = options.on_retry {
                            observer(attempt, &e, delay);
                        }
                        if let Some(ref events) = self.events {
                            events.publish(LisaEvent::RetryAttempted {
                                operation: operation.to_string(),
                                attempt,
                                delay_ms: delay.as_millis() as u64,
                                error: e.to_string(),
                            });
                        }
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    debug!(operation, attempt, error = %e, "Operation failed");
                    admission.failure();
                    return Err(e);
                }
            }
        }
    }
}
