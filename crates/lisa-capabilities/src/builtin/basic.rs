use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;

use lisa_core::error::{LisaError, Result};
use lisa_core::traits::Capability;
use lisa_core::types::{CapabilityContext, CapabilityOutput};

/// Returns its input unchanged.
pub struct EchoCapability;

impl Capability for EchoCapability {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the input unchanged."
    }

    fn invoke(&self, input: serde_json::Value, _ctx: CapabilityContext) -> BoxFuture<'_, Result<CapabilityOutput>> {
        Box::pin(async move { Ok(CapabilityOutput::success(input)) })
    }
}

pub struct DelayCapability;

#[derive(Deserialize)]
struct DelayInput {
    #[serde(default)]
    ms: u64,
    #[serde(default)]
    value: serde_json::Value,
}

impl Capability for DelayCapability {
    fn name(&self) -> &str {
        "delay"
    }

    fn description(&self) -> &str {
        "Wait `ms` milliseconds, then return `value`."
    }

    fn invoke(&self, input: serde_json::Value, _ctx: CapabilityContext) -> BoxFuture<'_, Result<CapabilityOutput>> {
        Box::pin(async move {
            let params: DelayInput = serde_json::from_value(input)
                .map_err(|e| LisaError::Validation(format!("delay: {}", e)))?;
            tokio::time::sleep(Duration::from_millis(params.ms)).await;
            Ok(CapabilityOutput::success(params.value))
        })
    }
}

pub struct HealthCapability;

impl Capability for HealthCapability {
    fn name(&self) -> &str {
        "health"
    }

    fn description(&self) -> &str {
        "Report service liveness."
    }

    fn invoke(&self, _input: serde_json::Value, _ctx: CapabilityContext) -> BoxFuture<'_, Result<CapabilityOutput>> {
        Box::pin(async move {
            Ok(CapabilityOutput::success(serde_json::json!({
                "status": "ok",
                "service": "lisa",
                "version": env!("CARGO_PKG_VERSION"),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lisa_test_utils::test_context;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo() {
        let out = EchoCapability.invoke(json!([1, 2, 3]), test_context()).await.unwrap();
        assert!(out.success);
        assert_eq!(out.output, json!([1, 2, 3]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_returns_value() {
        let start = tokio::time::Instant::now();
        let out = DelayCapability
            .invoke(json!({"ms": 250, "value": "done"}), test_context())
            .await
            .unwrap();
        assert_eq!(out.output, json!("done"));
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_delay_rejects_bad_input() {
        let err = DelayCapability
            .invoke(json!({"ms": "soon"}), test_context())
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_health() {
        let out = HealthCapability.invoke(json!(null), test_context()).await.unwrap();
        assert_eq!(out.output["status"], "ok");
        assert!(out.output["timestamp"].is_string());
    }
}
