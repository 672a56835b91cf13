//! Ordered failover across interchangeable providers.
//!
//! Two mechanisms govern a provider: its circuit breaker (keyed by provider
//! name) decides whether a call is admitted, and its health flag decides
//! whether the provider is a candidate at all. A provider is only flagged
//! unhealthy once its breaker has opened; the health-check loop flips it back
//! after a successful probe.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lisa_core::config::{FailoverConfig, ProviderConfig};
use lisa_core::error::{ErrorKind, LisaError, ProviderFailure, Result};
use lisa_core::event::EventBus;
use lisa_core::traits::Provider;
use lisa_core::types::{CircuitState, LisaEvent};

use crate::invoker::{worst_case_duration, InvokeOptions, ResilientInvoker};

/// Mutable health state of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<ProviderFailure>,
}

/// A provider plus its position in the failover order and its health.
pub struct ProviderDescriptor {
    name: String,
    priority: u32,
    provider: Arc<dyn Provider>,
    options: Option<InvokeOptions>,
    health: Mutex<ProviderHealth>,
}

impl ProviderDescriptor {
    pub fn new(provider: Arc<dyn Provider>, priority: u32) -> Self {
        Self {
            name: provider.name().to_string(),
            priority,
            provider,
            options: None,
            health: Mutex::new(ProviderHealth {
                healthy: true,
                last_checked_at: None,
                last_error: None,
            }),
        }
    }

    /// Build from config; `max_retries` and `timeout_ms` override `defaults`.
    pub fn from_config(provider: Arc<dyn Provider>, config: &ProviderConfig, defaults: &InvokeOptions) -> Self {
        let mut options = defaults.clone();
        if let Some(retries) = config.max_retries {
            options.max_attempts = retries.saturating_add(1);
        }
        if let Some(ms) = config.timeout_ms {
            options.timeout = Duration::from_millis(ms);
        }
        let mut descriptor = Self::new(provider, config.priority).with_options(options);
        descriptor.name = config.name.clone();
        descriptor
    }

    pub fn with_options(mut self, options: InvokeOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    fn lock(&self) -> MutexGuard<'_, ProviderHealth> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_healthy(&self) -> bool {
        self.lock().healthy
    }

    pub fn health(&self) -> ProviderHealth {
        self.lock().clone()
    }

    /// Returns true if this call changed the flag.
    fn set_healthy(&self, healthy: bool) -> bool {
        let mut health = self.lock();
        health.last_checked_at = Some(Utc::now());
        let changed = health.healthy != healthy;
        health.healthy = healthy;
        if healthy {
            health.last_error = None;
        }
        changed
    }

    fn record_failure(&self, failure: ProviderFailure) {
        self.lock().last_error = Some(failure);
    }

    fn last_failure(&self) -> ProviderFailure {
        self.lock().last_error.clone().unwrap_or_else(|| ProviderFailure {
            provider: self.name.clone(),
            kind: ErrorKind::CircuitOpen,
            message: "provider marked unhealthy".to_string(),
        })
    }
}

/// Tries providers in ascending priority until one succeeds.
pub struct ProviderFailover {
    capability: String,
    providers: Vec<Arc<ProviderDescriptor>>,
    invoker: Arc<ResilientInvoker>,
    events: Arc<EventBus>,
    health_check_interval: Duration,
    health_check_timeout: Duration,
}

impl ProviderFailover {
    /// `capability` names the operation the aggregate error is attributed to.
    pub fn new(
        capability: impl Into<String>,
        mut providers: Vec<ProviderDescriptor>,
        invoker: Arc<ResilientInvoker>,
        events: Arc<EventBus>,
    ) -> Self {
        // Stable sort keeps configuration order among equal priorities.
        providers.sort_by_key(|p| p.priority);
        let defaults = FailoverConfig::default();
        Self {
            capability: capability.into(),
            providers: providers.into_iter().map(Arc::new).collect(),
            invoker,
            events,
            health_check_interval: Duration::from_secs(defaults.health_check_interval_secs),
            health_check_timeout: Duration::from_millis(defaults.health_check_timeout_ms),
        }
    }

    pub fn with_health_checks(mut self, config: &FailoverConfig) -> Self {
        self.health_check_interval = Duration::from_secs(config.health_check_interval_secs.max(1));
        self.health_check_timeout = Duration::from_millis(config.health_check_timeout_ms);
        self
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Providers in the order they are tried.
    pub fn providers(&self) -> &[Arc<ProviderDescriptor>] {
        &self.providers
    }

    pub fn provider(&self, name: &str) -> Option<&Arc<ProviderDescriptor>> {
        self.providers.iter().find(|p| p.name == name)
    }

    fn options_for(&self, descriptor: &ProviderDescriptor) -> InvokeOptions {
        descriptor
            .options
            .clone()
            .unwrap_or_else(|| self.invoker.defaults().clone())
    }

    /// Longest a single [`complete`](Self::complete) can take: every provider
    /// tried with its full retry and timeout budget.
    pub fn time_budget(&self) -> Duration {
        self.providers
            .iter()
            .map(|descriptor| worst_case_duration(&self.options_for(descriptor)))
            .sum()
    }

    /// Send `request` to the first provider that answers.
    ///
    /// Unhealthy providers are skipped while at least one healthy provider
    /// remains; if none is healthy every provider is tried as a last resort.
    /// On exhaustion the error lists one entry per provider, in order.
    pub async fn complete(&self, request: serde_json::Value) -> Result<serde_json::Value> {
        let any_healthy = self.providers.iter().any(|p| p.is_healthy());
        let mut failures = Vec::with_capacity(self.providers.len());

        for descriptor in &self.providers {
            if any_healthy && !descriptor.is_healthy() {
                debug!(provider = %descriptor.name, "Skipping unhealthy provider");
                failures.push(descriptor.last_failure());
                continue;
            }

            let options = self.options_for(descriptor);
            let provider = descriptor.provider.clone();
            let outcome = self
                .invoker
                .execute(
                    &descriptor.name,
                    || {
                        let provider = provider.clone();
                        let request = request.clone();
                        async move { provider.complete(request).await }
                    },
                    &options,
                )
                .await;

            match outcome {
                Ok(response) => {
                    debug!(provider = %descriptor.name, "Provider succeeded");
                    return Ok(response);
                }
                Err(e) => {
                    warn!(provider = %descriptor.name, error = %e, "Provider failed, trying next");
                    let failure = ProviderFailure {
                        provider: descriptor.name.clone(),
                        kind: e.kind(),
                        message: e.to_string(),
                    };
                    descriptor.record_failure(failure.clone());
                    self.events.publish(LisaEvent::ProviderFailed {
                        provider: descriptor.name.clone(),
                        error: e.to_string(),
                    });

                    let breaker_open =
                        self.invoker.breakers().state(&descriptor.name) == Some(CircuitState::Open);
                    if breaker_open && descriptor.set_healthy(false) {
                        warn!(provider = %descriptor.name, "Provider marked unhealthy");
                        self.events.publish(LisaEvent::ProviderMarkedUnhealthy {
                            provider: descriptor.name.clone(),
                        });
                    }
                    failures.push(failure);
                }
            }
        }

        error!(
            capability = %self.capability,
            providers = failures.len(),
            "All providers exhausted"
        );
        self.events.publish(LisaEvent::AllProvidersExhausted {
            capability: self.capability.clone(),
            failures: failures.clone(),
        });
        Err(LisaError::ProvidersExhausted {
            capability: self.capability.clone(),
            failures,
        })
    }

    /// Probe every unhealthy provider once. Returns how many recovered.
    pub async fn probe_unhealthy(&self) -> usize {
        let mut recovered = 0;
        for descriptor in self.providers.iter().filter(|p| !p.is_healthy()) {
            let probe = tokio::time::timeout(self.health_check_timeout, descriptor.provider.health_check()).await;
            match probe {
                Ok(Ok(())) => {
                    if descriptor.set_healthy(true) {
                        info!(provider = %descriptor.name, "Provider recovered");
                        self.events.publish(LisaEvent::ProviderRecovered {
                            provider: descriptor.name.clone(),
                        });
                        recovered += 1;
                    }
                }
                Ok(Err(e)) => {
                    debug!(provider = %descriptor.name, error = %e, "Health probe failed");
                    descriptor.set_healthy(false);
                    descriptor.record_failure(ProviderFailure {
                        provider: descriptor.name.clone(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    debug!(provider = %descriptor.name, "Health probe timed out");
                    descriptor.set_healthy(false);
                }
            }
        }
        recovered
    }

    /// Run the health-check loop. Blocks until cancelled.
    pub async fn run_health_checks(&self, cancel: CancellationToken) {
        info!(
            capability = %self.capability,
            interval_secs = self.health_check_interval.as_secs(),
            "Provider health checks started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.health_check_interval) => {}
                _ = cancel.cancelled() => {
                    info!(capability = %self.capability, "Provider health checks shutting down");
                    break;
                }
            }
            let recovered = self.probe_unhealthy().await;
            if recovered > 0 {
                debug!(recovered, "Health check pass complete");
            }
        }
    }

    /// Spawn [`run_health_checks`](Self::run_health_checks) on the runtime.
    pub fn spawn_health_checks(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let failover = Arc::clone(self);
        tokio::spawn(async move { failover.run_health_checks(cancel).await })
    }
}
