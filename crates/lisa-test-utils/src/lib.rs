//! Scripted capabilities, providers and fixtures shared by Lisa's tests.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use lisa_core::error::{LisaError, Result};
use lisa_core::traits::{Capability, Provider};
use lisa_core::types::{CapabilityContext, CapabilityOutput, Task};

/// How a scripted call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// `Err(TransientBackend)`, retryable.
    Transient,
    /// `Err(PermanentBackend)`, not retryable.
    Permanent,
    /// `Ok` with `success: false`.
    Reported,
    /// The handler panics.
    Panic,
}

/// Shared, ordered log of `start:<task>` / `end:<task>` / `call:<provider>` entries.
#[derive(Debug, Clone, Default)]
pub struct Timeline(Arc<Mutex<Vec<String>>>);

impl Timeline {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

/// Capability whose behaviour is fixed up front.
///
/// Succeeds by echoing its input (or a fixed output), optionally after failing
/// the first N calls and/or sleeping.
pub struct ScriptedCapability {
    name: String,
    output: Option<Value>,
    failures_remaining: AtomicU32,
    failure: ScriptedFailure,
    delay: Option<Duration>,
    timeline: Option<Timeline>,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    inputs: Mutex<Vec<Value>>,
}

impl ScriptedCapability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: None,
            failures_remaining: AtomicU32::new(0),
            failure: ScriptedFailure::Transient,
            delay: None,
            timeline: None,
            calls: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn returning(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn failing_times(mut self, times: u32, failure: ScriptedFailure) -> Self {
        self.failures_remaining = AtomicU32::new(times);
        self.failure = failure;
        self
    }

    pub fn always_failing(self, failure: ScriptedFailure) -> Self {
        self.failing_times(u32::MAX, failure)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = Some(timeline);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping invocations observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<Value> {
        self.inputs.lock().unwrap().clone()
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Capability for ScriptedCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted test capability"
    }

    fn invoke(&self, input: Value, ctx: CapabilityContext) -> BoxFuture<'_, Result<CapabilityOutput>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().unwrap().push(input.clone());
            let label = ctx.task_id.clone().unwrap_or_else(|| self.name.clone());
            if let Some(ref timeline) = self.timeline {
                timeline.push(format!("start:{}", label));
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some(ref timeline) = self.timeline {
                timeline.push(format!("end:{}", label));
            }

            if self.take_failure() {
                return match self.failure {
                    ScriptedFailure::Transient => Err(LisaError::TransientBackend(format!("{} unavailable", self.name))),
                    ScriptedFailure::Permanent => Err(LisaError::PermanentBackend(format!("{} rejected input", self.name))),
                    ScriptedFailure::Reported => Ok(CapabilityOutput::failure(format!("{} reported failure", self.name))),
                    ScriptedFailure::Panic => panic!("{} panicked", self.name),
                };
            }

            Ok(CapabilityOutput::success(self.output.clone().unwrap_or(input)))
        })
    }
}

/// Provider whose behaviour is fixed up front. Successful calls answer
/// `{"provider": <name>, "request": <request>}`.
pub struct ScriptedProvider {
    name: String,
    failures_remaining: AtomicU32,
    failure: ScriptedFailure,
    delay: Option<Duration>,
    healthy: AtomicBool,
    timeline: Option<Timeline>,
    calls: AtomicU32,
    health_checks: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failures_remaining: AtomicU32::new(0),
            failure: ScriptedFailure::Transient,
            delay: None,
            healthy: AtomicBool::new(true),
            timeline: None,
            calls: AtomicU32::new(0),
            health_checks: AtomicU32::new(0),
        }
    }

    pub fn failing_times(mut self, times: u32, failure: ScriptedFailure) -> Self {
        self.failures_remaining = AtomicU32::new(times);
        self.failure = failure;
        self
    }

    pub fn always_failing(self, failure: ScriptedFailure) -> Self {
        self.failing_times(u32::MAX, failure)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = Some(timeline);
        self
    }

    /// Result of subsequent health probes.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> u32 {
        self.health_checks.load(Ordering::SeqCst)
    }
}

impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete(&self, request: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(ref timeline) = self.timeline {
                timeline.push(format!("call:{}", self.name));
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let fail = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return match self.failure {
                    ScriptedFailure::Permanent | ScriptedFailure::Reported => {
                        Err(LisaError::PermanentBackend(format!("{} rejected request", self.name)))
                    }
                    ScriptedFailure::Panic => panic!("{} panicked", self.name),
                    ScriptedFailure::Transient => Err(LisaError::TransientBackend(format!("{} unavailable", self.name))),
                };
            }
            Ok(json!({ "provider": self.name, "request": request }))
        })
    }

    fn health_check(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.health_checks.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(LisaError::TransientBackend(format!("{} health check failed", self.name)))
            }
        })
    }
}

/// A task with no input and no dependencies.
pub fn task(id: &str, capability: &str) -> Task {
    Task::new(id, capability)
}

/// A task depending on `deps`.
pub fn task_with_deps(id: &str, capability: &str, deps: &[&str]) -> Task {
    deps.iter().fold(Task::new(id, capability), |t, d| t.depends_on(*d))
}

pub fn test_context() -> CapabilityContext {
    CapabilityContext {
        workspace: std::env::temp_dir().join("lisa-test"),
        ..CapabilityContext::default()
    }
}

/// Wrap a scripted capability for registration while keeping a handle for
/// assertions.
pub fn shared(capability: ScriptedCapability) -> Arc<ScriptedCapability> {
    Arc::new(capability)
}
