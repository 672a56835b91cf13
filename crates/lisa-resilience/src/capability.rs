use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use lisa_core::error::Result;
use lisa_core::traits::Capability;
use lisa_core::types::{CapabilityContext, CapabilityOutput};

use crate::failover::ProviderFailover;

/// Added to the combined provider budget when reporting the capability timeout.
const BUDGET_GRACE: Duration = Duration::from_secs(1);

/// Exposes a [`ProviderFailover`] as a capability. The task input is sent
/// as the request; the first provider response becomes the output.
///
/// Retries and timeouts already apply per provider, so callers are asked to
/// invoke it once, with a deadline covering the whole provider chain.
pub struct FailoverCapability {
    failover: Arc<ProviderFailover>,
    description: String,
}

impl FailoverCapability {
    pub fn new(failover: Arc<ProviderFailover>) -> Self {
        let names: Vec<&str> = failover.providers().iter().map(|p| p.name()).collect();
        let description = format!("Request with failover across: {}", names.join(", "));
        Self {
            failover,
            description,
        }
    }

    pub fn failover(&self) -> &Arc<ProviderFailover> {
        &self.failover
    }
}

impl Capability for FailoverCapability {
    fn name(&self) -> &str {
        self.failover.capability()
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn invoke(&self, input: serde_json::Value, _ctx: CapabilityContext) -> BoxFuture<'_, Result<CapabilityOutput>> {
        Box::pin(async move {
            let response = self.failover.complete(input).await?;
            Ok(CapabilityOutput::success(response))
        })
    }

    fn timeout_ms(&self) -> Option<u64> {
        Some((self.failover.time_budget() + BUDGET_GRACE).as_millis() as u64)
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(1)
    }
}
