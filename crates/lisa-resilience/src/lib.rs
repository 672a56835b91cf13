pub mod breaker;
pub mod capability;
pub mod failover;
pub mod invoker;
pub mod providers;

use std::sync::Arc;

use lisa_core::config::AppConfig;
use lisa_core::error::Result;
use lisa_core::event::EventBus;

pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitSnapshot, Permit};
pub use capability::FailoverCapability;
pub use failover::{ProviderDescriptor, ProviderFailover, ProviderHealth};
pub use invoker::{calculate_backoff, worst_case_duration, InvokeOptions, ResilientInvoker};
pub use providers::{create_provider, HttpProvider};

/// Build a failover over the configured HTTP providers, or `None` when no
/// provider is configured.
pub fn failover_from_config(
    capability: &str,
    config: &AppConfig,
    invoker: Arc<ResilientInvoker>,
    events: Arc<EventBus>,
) -> Result<Option<ProviderFailover>> {
    if config.failover.providers.is_empty() {
        return Ok(None);
    }
    let defaults = InvokeOptions::from(&config.retry);
    let mut descriptors = Vec::with_capacity(config.failover.providers.len());
    for provider_config in &config.failover.providers {
        let provider = create_provider(provider_config)?;
        descriptors.push(ProviderDescriptor::from_config(provider, provider_config, &defaults));
    }
    Ok(Some(
        ProviderFailover::new(capability, descriptors, invoker, events).with_health_checks(&config.failover),
    ))
}
