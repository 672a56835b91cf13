use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LisaError, Result};
use crate::types::CapabilityContext;

/// Top-level Lisa configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
}

/// Ambient data handed to capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub preferences: HashMap<String, serde_json::Value>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            locale: default_locale(),
            workspace: default_workspace(),
            preferences: HashMap::new(),
        }
    }
}

fn default_locale() -> String { "en-US".to_string() }
fn default_workspace() -> String { "~/.lisa".to_string() }

/// Circuit breaker thresholds, shared by every breaker the registry creates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls.
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_ms: u64,
    /// Consecutive half-open successes needed to close again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Concurrent trial calls admitted while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout(),
            success_threshold: default_success_threshold(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

fn default_failure_threshold() -> u32 { 5 }
fn default_reset_timeout() -> u64 { 60_000 }
fn default_success_threshold() -> u32 { 2 }
fn default_half_open_max_calls() -> u32 { 2 }

/// Retry, backoff and timeout policy for the resilient invoker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Add +/-20% jitter to each backoff delay.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            timeout_ms: default_timeout(),
            initial_delay_ms: default_initial_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay(),
            jitter: false,
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_timeout() -> u64 { 30_000 }
fn default_initial_delay() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_delay() -> u64 { 30_000 }

/// Task graph coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    /// Upper bound on concurrently running tasks. `None` = unbounded.
    #[serde(default)]
    pub max_parallelism: Option<usize>,
    /// Reject submissions naming unknown capabilities before anything runs.
    #[serde(default)]
    pub strict_capabilities: bool,
    /// Capacity of the telemetry broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_parallelism: None,
            strict_capabilities: false,
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_event_capacity() -> usize { 256 }

/// Provider failover settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailoverConfig {
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_ms: u64,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval(),
            health_check_timeout_ms: default_health_check_timeout(),
            providers: vec![],
        }
    }
}

fn default_health_check_interval() -> u64 { 60 }
fn default_health_check_timeout() -> u64 { 5000 }

/// One interchangeable backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub name: String,
    /// Lower is tried first.
    #[serde(default)]
    pub priority: u32,
    /// Retries after the first attempt. Overrides `retry.max_attempts` when set.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Overrides `retry.timeout_ms` when set.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// HTTP endpoint accepting a JSON POST.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Endpoint for GET health probes; falls back to `endpoint`.
    #[serde(default)]
    pub health_endpoint: Option<String>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
            max_retries: None,
            timeout_ms: None,
            endpoint: None,
            api_key: None,
            health_endpoint: None,
        }
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| LisaError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| LisaError::Config(e.to_string()))
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.context.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    /// Build the read-only context handed to capability handlers.
    pub fn capability_context(&self) -> CapabilityContext {
        CapabilityContext {
            locale: self.context.locale.clone(),
            preferences: self.context.preferences.clone(),
            workspace: self.workspace_dir(),
            submission_id: None,
            task_id: None,
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
