use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{CapabilityContext, CapabilityOutput};

/// Capability — a named unit of invocable logic.
///
/// Handlers must not mutate shared application state; side effects are
/// reported through the returned output.
pub trait Capability: Send + Sync + 'static {
    /// Registry name (used as the task's `capability`).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Invoke the capability.
    ///
    /// `Err` carries a classified failure (transient, permanent, timeout);
    /// `Ok` with `success: false` is a handler-reported failure.
    fn invoke(
        &self,
        input: serde_json::Value,
        ctx: CapabilityContext,
    ) -> BoxFuture<'_, Result<CapabilityOutput>>;

    /// Per-attempt timeout in milliseconds; `None` uses the caller's default.
    fn timeout_ms(&self) -> Option<u64> {
        None
    }

    /// Attempts per invocation; `None` uses the caller's default. Capabilities
    /// that retry internally return `Some(1)`.
    fn max_attempts(&self) -> Option<u32> {
        None
    }
}

/// Provider — one of several interchangeable backends behind a failover.
pub trait Provider: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Perform a request.
    fn complete(&self, request: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Lightweight liveness probe used by the health-check loop.
    fn health_check(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.complete(serde_json::json!({ "ping": true })).await?;
            Ok(())
        })
    }
}
