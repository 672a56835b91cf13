use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use lisa_core::error::{LisaError, Result};
use lisa_core::traits::Capability;
use lisa_core::types::{CapabilityContext, CapabilityOutput};

type Loader = Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn Capability>>> + Send + Sync>;

/// Outcome of a registry lookup.
#[derive(Clone)]
pub enum Resolution {
    Found(Arc<dyn Capability>),
    NotFound,
}

impl Resolution {
    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found(_))
    }

    pub fn found(self) -> Option<Arc<dyn Capability>> {
        match self {
            Resolution::Found(cap) => Some(cap),
            Resolution::NotFound => None,
        }
    }
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Found(cap) => write!(f, "Found({})", cap.name()),
            Resolution::NotFound => write!(f, "NotFound"),
        }
    }
}

/// Listing entry for diagnostics and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub description: String,
    pub loaded: bool,
}

struct CapabilityEntry {
    description: String,
    loader: Loader,
    cell: OnceCell<Arc<dyn Capability>>,
}

/// Registry of capabilities by name.
///
/// Each entry is a deferred loader resolved at most once; concurrent first
/// resolutions of the same name wait on a single loader run.
pub struct CapabilityRegistry {
    entries: HashMap<String, CapabilityEntry>,
    timeout: Duration,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Timeout applied by [`invoke`](Self::invoke).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register an already-built capability.
    pub fn register(&mut self, capability: impl Capability) {
        self.register_arc(Arc::new(capability));
    }

    pub fn register_arc(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.name().to_string();
        let description = capability.description().to_string();
        let cell = OnceCell::new_with(Some(Arc::clone(&capability)));
        self.entries.insert(
            name,
            CapabilityEntry {
                description,
                loader: Box::new(move || {
                    let capability = Arc::clone(&capability);
                    Box::pin(async move { Ok(capability) })
                }),
                cell,
            },
        );
    }

    /// Register a capability whose handler is built on first use.
    pub fn register_lazy<F, Fut>(&mut self, name: impl Into<String>, description: impl Into<String>, loader: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Capability>>> + Send + 'static,
    {
        self.entries.insert(
            name.into(),
            CapabilityEntry {
                description: description.into(),
                loader: Box::new(move || Box::pin(loader())),
                cell: OnceCell::new(),
            },
        );
    }

    /// Unregister a capability by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a handler, running its loader if this is the first use.
    ///
    /// An unknown name is `Ok(NotFound)`; only a failing loader is an error,
    /// and a failed load is retried on the next resolution.
    pub async fn resolve(&self, name: &str) -> Result<Resolution> {
        let Some(entry) = self.entries.get(name) else {
            return Ok(Resolution::NotFound);
        };
        let capability = entry
            .cell
            .get_or_try_init(|| async {
                debug!(capability = name, "Loading capability");
                (entry.loader)().await
            })
            .await?;
        Ok(Resolution::Found(Arc::clone(capability)))
    }

    /// All registered capabilities, sorted by name.
    pub fn list(&self) -> Vec<CapabilityInfo> {
        let mut infos: Vec<CapabilityInfo> = self
            .entries
            .iter()
            .map(|(name, entry)| CapabilityInfo {
                name: name.clone(),
                description: entry.description.clone(),
                loaded: entry.cell.initialized(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Resolve and invoke a capability by name, bounded by the registry timeout.
    pub async fn invoke(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: CapabilityContext,
    ) -> Result<CapabilityOutput> {
        let capability = self
            .resolve(name)
            .await?
            .found()
            .ok_or_else(|| LisaError::CapabilityNotFound(name.to_string()))?;

        let timeout = capability
            .timeout_ms()
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);
        match tokio::time::timeout(timeout, capability.invoke(input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(LisaError::Timeout {
                operation: name.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Create a registry with all built-in capabilities registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register(crate::builtin::basic::EchoCapability);
        registry.register(crate::builtin::basic::DelayCapability);
        registry.register(crate::builtin::basic::HealthCapability);

        registry.register(crate::builtin::files::FileReadCapability);
        registry.register(crate::builtin::files::FileWriteCapability);
        registry.register(crate::builtin::files::FileListCapability);

        info!(count = registry.len(), "Registered built-in capabilities");
        registry
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use lisa_test_utils::{test_context, ScriptedCapability};
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let mut registry = CapabilityRegistry::new();
        registry.register(ScriptedCapability::new("scripted"));

        assert!(registry.contains("scripted"));
        let cap = registry.resolve("scripted").await.unwrap().found().unwrap();
        assert_eq!(cap.name(), "scripted");
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_found() {
        let registry = CapabilityRegistry::new();
        let resolution = registry.resolve("missing").await.unwrap();
        assert!(!resolution.is_found());
        assert!(matches!(resolution, Resolution::NotFound));
    }

    #[tokio::test]
    async fn test_lazy_loader_runs_once_under_concurrency() {
        let loads = Arc::new(AtomicU32::new(0));
        let counter = loads.clone();
        let mut registry = CapabilityRegistry::new();
        registry.register_lazy("slow", "Loaded on demand", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Arc::new(ScriptedCapability::new("slow")) as Arc<dyn Capability>)
            }
        });
        let registry = Arc::new(registry);
        assert!(!registry.list()[0].loaded);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.resolve("slow").await.unwrap().is_found() })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(registry.list()[0].loaded);

        // Cached afterwards.
        registry.resolve("slow").await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let mut registry = CapabilityRegistry::new();
        registry.register_lazy("flaky", "", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(LisaError::TransientBackend("loader unavailable".into()))
                } else {
                    Ok(Arc::new(ScriptedCapability::new("flaky")) as Arc<dyn Capability>)
                }
            }
        });

        assert!(registry.resolve("flaky").await.is_err());
        assert!(registry.resolve("flaky").await.unwrap().is_found());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invoke_unknown_capability() {
        let registry = CapabilityRegistry::new();
        let err = registry.invoke("nope", json!({}), test_context()).await.unwrap_err();
        assert!(matches!(err, LisaError::CapabilityNotFound(ref n) if n == "nope"));
    }

    #[tokio::test]
    async fn test_invoke_times_out() {
        let mut registry = CapabilityRegistry::new().with_timeout(Duration::from_millis(20));
        registry.register(ScriptedCapability::new("hang").with_delay(Duration::from_secs(5)));
        let err = registry.invoke("hang", json!({}), test_context()).await.unwrap_err();
        assert!(matches!(err, LisaError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_with_builtins() {
        let registry = CapabilityRegistry::with_builtins();
        let names: Vec<String> = registry.list().into_iter().map(|i| i.name).collect();
        assert_eq!(
            names,
            vec!["delay", "echo", "files.list", "files.read", "files.write", "health"]
        );

        let out = registry
            .invoke("echo", json!({"hello": "world"}), test_context())
            .await
            .unwrap();
        assert_eq!(out.output, json!({"hello": "world"}));
    }

    #[test]
    fn test_unregister() {
        let mut registry = CapabilityRegistry::new();
        registry.register(ScriptedCapability::new("x"));
        assert!(registry.unregister("x"));
        assert!(!registry.unregister("x"));
        assert!(registry.is_empty());
    }
}
