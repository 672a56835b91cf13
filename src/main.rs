mod doctor;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lisa_capabilities::CapabilityRegistry;
use lisa_core::config::AppConfig;
use lisa_core::event::EventBus;
use lisa_core::types::Task;
use lisa_orchestrator::{Coordinator, ExpressionEvaluator};
use lisa_resilience::{BreakerRegistry, FailoverCapability, InvokeOptions, ProviderFailover, ResilientInvoker};

/// Name under which the provider failover is exposed as a capability.
const FAILOVER_CAPABILITY: &str = "complete";

#[derive(Parser)]
#[command(name = "lisa", version, about = "Task orchestration with resilient capability calls")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "lisa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task submission from a JSON file and print the report
    Run {
        /// JSON array of tasks
        tasks: PathBuf,
        /// Maximum number of tasks running at once (0 = unbounded)
        #[arg(long)]
        max_parallelism: Option<usize>,
    },
    /// Evaluate a sandboxed expression
    Eval {
        expression: String,
        /// JSON object to evaluate against
        #[arg(long)]
        context: Option<String>,
    },
    /// List registered capabilities
    Capabilities,
    /// Show effective configuration
    Config,
    /// Run configuration health checks
    Doctor,
}

/// Everything a submission needs, wired from one config.
struct Runtime {
    coordinator: Coordinator,
    failover: Option<Arc<ProviderFailover>>,
}

impl Runtime {
    fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let events = Arc::new(EventBus::new(config.coordinator.event_capacity));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()).with_events(Arc::clone(&events)));
        let invoker = Arc::new(
            ResilientInvoker::new(breakers, InvokeOptions::from(&config.retry)).with_events(Arc::clone(&events)),
        );

        let mut registry = CapabilityRegistry::with_builtins();
        let failover = lisa_resilience::failover_from_config(
            FAILOVER_CAPABILITY,
            config,
            Arc::clone(&invoker),
            Arc::clone(&events),
        )?
        .map(Arc::new);
        if let Some(ref failover) = failover {
            info!(
                capability = FAILOVER_CAPABILITY,
                providers = failover.providers().len(),
                "Registered provider failover"
            );
            registry.register(FailoverCapability::new(Arc::clone(failover)));
        }

        let coordinator = Coordinator::new(Arc::new(registry), invoker, events)
            .with_config(config.coordinator.clone())
            .with_context(config.capability_context());
        Ok(Self { coordinator, failover })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lisa=info,warn")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Expressions need no config
    if let Commands::Eval { expression, context } = &cli.command {
        return run_eval(expression, context.as_deref());
    }

    let mut config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run { tasks, max_parallelism } => {
            if max_parallelism.is_some() {
                config.coordinator.max_parallelism = max_parallelism;
            }
            run_tasks(&config, &tasks).await
        }
        Commands::Capabilities => {
            let runtime = Runtime::build(&config)?;
            for info in runtime.coordinator.registry().list() {
                let loaded = if info.loaded { "" } else { " (lazy)" };
                println!("  {:<14} {}{}", info.name, info.description, loaded);
            }
            Ok(())
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Doctor => {
            println!("Lisa Doctor");
            println!("===========");
            println!();
            doctor::run_doctor(&config);
            Ok(())
        }
        Commands::Eval { .. } => Ok(()),
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return AppConfig::load(path).with_context(|| format!("loading {}", path.display()));
    }

    // Check for config in the home directory
    if let Some(home_config) = dirs_home().map(|h| h.join(".lisa").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return AppConfig::load(&home_config).with_context(|| format!("loading {}", home_config.display()));
        }
    }

    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

async fn run_tasks(config: &AppConfig, tasks_path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(tasks_path).with_context(|| format!("reading {}", tasks_path.display()))?;
    let tasks: Vec<Task> =
        serde_json::from_str(&content).with_context(|| format!("parsing tasks from {}", tasks_path.display()))?;

    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace).ok();

    let runtime = Runtime::build(config)?;
    let cancel = tokio_util::sync::CancellationToken::new();

    let health = runtime
        .failover
        .as_ref()
        .map(|failover| failover.spawn_health_checks(cancel.child_token()));

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling submission");
            interrupt.cancel();
        }
    });

    let result = runtime.coordinator.submit_with_cancel(tasks, cancel.clone()).await;
    cancel.cancel();
    if let Some(handle) = health {
        handle.await.ok();
    }

    let report = result?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_eval(expression: &str, context: Option<&str>) -> anyhow::Result<()> {
    let context = match context {
        Some(raw) => match serde_json::from_str(raw).context("parsing --context")? {
            serde_json::Value::Object(map) => map,
            _ => anyhow::bail!("--context must be a JSON object"),
        },
        None => serde_json::Map::new(),
    };

    let value = ExpressionEvaluator::new().evaluate(expression, &context)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
