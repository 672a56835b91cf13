//! Circuit breaker state machine and the registry that owns one breaker per
//! operation key.
//!
//! Transitions:
//! - `closed` -> `open` after `failure_threshold` consecutive failures
//! - `open` -> `half_open` once `reset_timeout` has elapsed (checked on `allow`)
//! - `half_open` -> `closed` after `success_threshold` consecutive successes
//! - `half_open` -> `open` on any failure
//!
//! All state lives behind one mutex per breaker; the lock is never held across
//! an `.await`. Every transition bumps a generation counter, and an outcome
//! reported against an older generation never settles a half-open trial.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use lisa_core::config::BreakerConfig;
use lisa_core::error::{LisaError, Result};
use lisa_core::event::EventBus;
use lisa_core::types::{CircuitState, LisaEvent};

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
    opened_until: Option<Instant>,
    generation: u64,
}

/// Proof of admission, tagged with the breaker generation that granted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    generation: u64,
}

impl Permit {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Point-in-time view of a breaker, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Milliseconds until an open circuit admits a trial call.
    pub retry_after_ms: Option<u64>,
    pub ms_since_last_failure: Option<u64>,
    pub ms_since_last_success: Option<u64>,
}

/// Gate for one logical operation.
pub struct CircuitBreaker {
    key: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    events: Option<Arc<EventBus>>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                half_open_in_flight: 0,
                last_failure_at: None,
                last_success_at: None,
                opened_until: None,
                generation: 0,
            }),
            events: None,
        }
    }

    /// Publish `CircuitStateChanged` events to this bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // A poisoned breaker is still a consistent counter set; keep using it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// May a call proceed right now?
    ///
    /// Admission while half-open reserves one of `half_open_max_calls` trial
    /// slots; the slot is released by the matching `record_*` call.
    pub fn allow(&self) -> bool {
        self.try_acquire().is_ok()
    }

    /// Like [`allow`](Self::allow) but returns the `CircuitOpen` error to
    /// surface, or the permit to settle the call with.
    pub fn try_acquire(&self) -> Result<Permit> {
        let now = Instant::now();
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let until = inner.opened_until.unwrap_or(now);
            if now < until {
                return Err(LisaError::CircuitOpen {
                    operation: self.key.clone(),
                    retry_after_ms: (until - now).as_millis() as u64,
                });
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_in_flight >= self.config.half_open_max_calls.max(1) {
                return Err(LisaError::CircuitOpen {
                    operation: self.key.clone(),
                    retry_after_ms: 0,
                });
            }
            inner.half_open_in_flight += 1;
        }

        Ok(Permit {
            generation: inner.generation,
        })
    }

    /// Give back a half-open trial slot without recording an outcome
    /// (the admitted call was abandoned).
    pub fn release(&self, permit: Permit) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && permit.generation == inner.generation {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Record a success for the current generation.
    pub fn record_success(&self) {
        self.settle_success(None);
    }

    /// Record a success for a call admitted with `permit`.
    pub fn record_success_with(&self, permit: Permit) {
        self.settle_success(Some(permit.generation));
    }

    /// Record a failure for the current generation.
    pub fn record_failure(&self) {
        self.settle_failure(None);
    }

    /// Record a failure for a call admitted with `permit`.
    pub fn record_failure_with(&self, permit: Permit) {
        self.settle_failure(Some(permit.generation));
    }

    fn settle_success(&self, generation: Option<u64>) {
        let mut inner = self.lock();
        let current = generation.map_or(true, |g| g == inner.generation);
        inner.last_success_at = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            // Admitted before the circuit opened; the trials decide.
            CircuitState::HalfOpen if !current => {
                debug!(operation = %self.key, "Ignoring stale success while half-open");
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures = 0;
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // A call admitted before the circuit opened finished late.
            CircuitState::Open => {}
        }
    }

    fn settle_failure(&self, generation: Option<u64>) {
        let now = Instant::now();
        let mut inner = self.lock();
        let current = generation.map_or(true, |g| g == inner.generation);
        inner.last_failure_at = Some(now);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_successes = 0;
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner, now);
                }
            }
            CircuitState::HalfOpen if !current => {
                debug!(operation = %self.key, "Ignoring stale failure while half-open");
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes = 0;
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.consecutive_failures += 1;
                self.trip(&mut inner, now);
            }
            CircuitState::Open => {
                inner.consecutive_failures += 1;
            }
        }
    }

    /// Current state. Does not advance `open` to `half_open`; only `allow` does.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let inner = self.lock();
        let retry_after_ms = match (inner.state, inner.opened_until) {
            (CircuitState::Open, Some(until)) => {
                Some(until.saturating_duration_since(now).as_millis() as u64)
            }
            _ => None,
        };
        CircuitSnapshot {
            key: self.key.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            retry_after_ms,
            ms_since_last_failure: inner.last_failure_at.map(|t| millis_since(now, t)),
            ms_since_last_success: inner.last_success_at.map(|t| millis_since(now, t)),
        }
    }

    /// Force the breaker back to a fresh closed state.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
        inner.opened_until = None;
        self.transition(&mut inner, CircuitState::Closed);
    }

    fn trip(&self, inner: &mut BreakerInner, now: Instant) {
        inner.opened_until = Some(now + self.config.reset_timeout());
        inner.half_open_in_flight = 0;
        self.transition(inner, CircuitState::Open);
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.generation += 1;
        match to {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
                inner.opened_until = None;
                info!(operation = %self.key, %from, "Circuit closed");
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes = 0;
                inner.half_open_in_flight = 0;
                info!(operation = %self.key, "Circuit half-open, admitting trial calls");
            }
            CircuitState::Open => {
                warn!(
                    operation = %self.key,
                    %from,
                    consecutive_failures = inner.consecutive_failures,
                    reset_timeout_ms = self.config.reset_timeout_ms,
                    "Circuit opened"
                );
            }
        }
        if let Some(ref events) = self.events {
            events.publish(LisaEvent::CircuitStateChanged {
                operation: self.key.clone(),
                from,
                to,
            });
        }
    }
}

fn millis_since(now: Instant, then: Instant) -> u64 {
    now.saturating_duration_since(then).as_millis() as u64
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Owns every breaker, keyed by operation. Shared by the invoker and failover.
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    overrides: Mutex<HashMap<String, BreakerConfig>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    events: Option<Arc<EventBus>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            overrides: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Use a different config for one key. Only affects breakers created afterwards.
    pub fn configure(&self, key: impl Into<String>, config: BreakerConfig) {
        self.overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), config);
    }

    /// Fetch the breaker for `key`, creating it on first use.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(b) = breakers.get(key) {
            return b.clone();
        }
        let config = self
            .overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone());
        let mut breaker = CircuitBreaker::new(key, config);
        if let Some(ref events) = self.events {
            breaker = breaker.with_events(events.clone());
        }
        let breaker = Arc::new(breaker);
        breakers.insert(key.to_string(), breaker.clone());
        breaker
    }

    /// State of an existing breaker, without creating one.
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|b| b.state())
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut snaps: Vec<CircuitSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snaps.sort_by(|a, b| a.key.cmp(&b.key));
        snaps
    }

    pub fn reset(&self, key: &str) -> bool {
        let breaker = self
            .breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned();
        match breaker {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for b in breakers {
            b.reset();
        }
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
