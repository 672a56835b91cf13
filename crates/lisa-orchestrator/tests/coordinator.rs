use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use lisa_capabilities::CapabilityRegistry;
use lisa_core::config::{BreakerConfig, CoordinatorConfig};
use lisa_core::error::ErrorKind;
use lisa_core::event::EventBus;
use lisa_core::types::{LisaEvent, TaskStatus};
use lisa_orchestrator::Coordinator;
use lisa_resilience::{
    BreakerRegistry, FailoverCapability, InvokeOptions, ProviderDescriptor, ProviderFailover, ResilientInvoker,
};
use lisa_test_utils::{shared, task, task_with_deps, ScriptedCapability, ScriptedFailure, ScriptedProvider, Timeline};

fn fast_options() -> InvokeOptions {
    InvokeOptions {
        timeout: Duration::from_secs(5),
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        jitter: false,
        ..InvokeOptions::default()
    }
}

fn invoker() -> Arc<ResilientInvoker> {
    Arc::new(ResilientInvoker::new(
        Arc::new(BreakerRegistry::new(BreakerConfig::default())),
        fast_options(),
    ))
}

fn coordinator(registry: CapabilityRegistry) -> Coordinator {
    Coordinator::new(Arc::new(registry), invoker(), Arc::new(EventBus::default()))
}

#[tokio::test(start_paused = true)]
async fn independent_branches_run_in_parallel() {
    let timeline = Timeline::default();
    let mut registry = CapabilityRegistry::new();
    registry.register(ScriptedCapability::new("fetch").returning(json!({"n": 1})));
    registry.register(
        ScriptedCapability::new("slow")
            .with_delay(Duration::from_millis(200))
            .with_timeline(timeline.clone()),
    );

    let report = coordinator(registry)
        .submit(vec![
            task("a", "fetch"),
            task_with_deps("b", "slow", &["a"]),
            task_with_deps("c", "slow", &["a"]),
        ])
        .await
        .unwrap();

    assert!(report.all_succeeded());
    // Both branches start before either finishes.
    let end_b = timeline.position("end:b").unwrap();
    let end_c = timeline.position("end:c").unwrap();
    assert!(timeline.position("start:b").unwrap() < end_c);
    assert!(timeline.position("start:c").unwrap() < end_b);
    assert!(report.parallelism > 1.5, "parallelism was {}", report.parallelism);
    assert!(report.total_duration_ms >= 200 && report.total_duration_ms < 300);
}

#[tokio::test]
async fn every_task_runs_once_after_its_dependencies() {
    let timeline = Timeline::default();
    let step = shared(ScriptedCapability::new("step").with_timeline(timeline.clone()));
    let mut registry = CapabilityRegistry::new();
    registry.register_arc(step.clone());

    let report = coordinator(registry)
        .submit(vec![
            task_with_deps("report", "step", &["left", "right"]),
            task_with_deps("left", "step", &["root"]),
            task_with_deps("right", "step", &["root"]),
            task("root", "step"),
            task("lonely", "step"),
        ])
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 5);
    assert_eq!(step.calls(), 5);
    for id in ["report", "left", "right", "root", "lonely"] {
        assert_eq!(timeline.count(&format!("start:{}", id)), 1, "{} ran more than once", id);
    }
    let start = |id: &str| timeline.position(&format!("start:{}", id)).unwrap();
    let end = |id: &str| timeline.position(&format!("end:{}", id)).unwrap();
    assert!(end("root") < start("left"));
    assert!(end("root") < start("right"));
    assert!(end("left") < start("report"));
    assert!(end("right") < start("report"));
}

#[tokio::test]
async fn failure_blocks_downstream_without_invoking_it() {
    let downstream = shared(ScriptedCapability::new("downstream"));
    let unrelated = shared(ScriptedCapability::new("unrelated"));
    let mut registry = CapabilityRegistry::new();
    registry.register(ScriptedCapability::new("broken").always_failing(ScriptedFailure::Permanent));
    registry.register_arc(downstream.clone());
    registry.register_arc(unrelated.clone());

    let report = coordinator(registry)
        .submit(vec![
            task("a", "broken"),
            task_with_deps("b", "downstream", &["a"]),
            task_with_deps("c", "downstream", &["b"]),
            task("d", "unrelated"),
        ])
        .await
        .unwrap();

    assert_eq!(downstream.calls(), 0);
    assert_eq!(unrelated.calls(), 1);

    let a = report.get("a").unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(a.error.as_ref().unwrap().kind, ErrorKind::PermanentBackend);

    let b = report.get("b").unwrap();
    assert_eq!(b.error.as_ref().unwrap().kind, ErrorKind::BlockedByDependency);
    assert_eq!(b.error.as_ref().unwrap().details, Some(json!({"dependency": "a"})));
    assert!(b.started_at.is_none());

    let c = report.get("c").unwrap();
    assert_eq!(c.error.as_ref().unwrap().details, Some(json!({"dependency": "b"})));
    assert_eq!(report.get("d").unwrap().status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn cyclic_submission_is_rejected_before_running() {
    let step = shared(ScriptedCapability::new("step"));
    let mut registry = CapabilityRegistry::new();
    registry.register_arc(step.clone());

    let err = coordinator(registry)
        .submit(vec![
            task("start", "step"),
            task_with_deps("a", "step", &["b"]),
            task_with_deps("b", "step", &["a"]),
        ])
        .await
        .unwrap_err();

    assert!(err.is_validation());
    assert!(err.to_string().contains("cycle"));
    assert_eq!(step.calls(), 0);
}

#[tokio::test]
async fn unknown_dependency_is_rejected() {
    let mut registry = CapabilityRegistry::new();
    registry.register(ScriptedCapability::new("step"));

    let err = coordinator(registry)
        .submit(vec![task_with_deps("a", "step", &["ghost"])])
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("ghost"));
}

#[tokio::test]
async fn empty_submission_reports_nothing() {
    let report = coordinator(CapabilityRegistry::new()).submit(vec![]).await.unwrap();
    assert!(report.tasks.is_empty());
    assert_eq!(report.total_duration_ms, 0);
    assert_eq!(report.parallelism, 0.0);
}

#[tokio::test(start_paused = true)]
async fn slow_task_times_out() {
    let slow = shared(ScriptedCapability::new("slow").with_delay(Duration::from_secs(60)));
    let mut registry = CapabilityRegistry::new();
    registry.register_arc(slow.clone());

    let report = coordinator(registry)
        .with_invoke_options(fast_options().with_timeout(Duration::from_millis(100)).with_max_attempts(2))
        .submit(vec![task("a", "slow")])
        .await
        .unwrap();

    let a = report.get("a").unwrap();
    assert_eq!(a.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert_eq!(slow.calls(), 2);
}

#[tokio::test]
async fn open_circuit_fails_fast_for_later_tasks() {
    let broken = shared(ScriptedCapability::new("broken").always_failing(ScriptedFailure::Permanent));
    let mut registry = CapabilityRegistry::new();
    registry.register_arc(broken.clone());
    let invoker = Arc::new(ResilientInvoker::new(
        Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: 2,
            ..BreakerConfig::default()
        })),
        fast_options(),
    ));
    let coordinator = Coordinator::new(Arc::new(registry), invoker, Arc::new(EventBus::default())).with_config(
        CoordinatorConfig {
            max_parallelism: Some(1),
            ..CoordinatorConfig::default()
        },
    );

    let report = coordinator
        .submit((0..4).map(|i| task(&format!("t{}", i), "broken")).collect())
        .await
        .unwrap();

    assert_eq!(broken.calls(), 2);
    let kinds: Vec<ErrorKind> = report
        .tasks
        .values()
        .map(|r| r.error.as_ref().unwrap().kind)
        .collect();
    assert_eq!(kinds.iter().filter(|k| **k == ErrorKind::CircuitOpen).count(), 2);
}

#[tokio::test]
async fn failover_capability_as_a_task() {
    let events = Arc::new(EventBus::default());
    let invoker = invoker();
    let primary = Arc::new(ScriptedProvider::new("primary").always_failing(ScriptedFailure::Permanent));
    let backup = Arc::new(ScriptedProvider::new("backup"));
    let failover = ProviderFailover::new(
        "complete",
        vec![
            ProviderDescriptor::new(primary.clone(), 0),
            ProviderDescriptor::new(backup.clone(), 1),
        ],
        Arc::clone(&invoker),
        Arc::clone(&events),
    );

    let mut registry = CapabilityRegistry::new();
    registry.register(FailoverCapability::new(Arc::new(failover)));
    registry.register(ScriptedCapability::new("prompt").returning(json!({"text": "hi"})));
    let coordinator = Coordinator::new(Arc::new(registry), invoker, events);
    let mut rx = coordinator.events().subscribe();

    let report = coordinator
        .submit(vec![
            task("prompt", "prompt"),
            task_with_deps("answer", "complete", &["prompt"]).with_input(json!({"prompt": "$task.prompt.output.text"})),
        ])
        .await
        .unwrap();

    assert!(report.all_succeeded());
    let output = report.get("answer").unwrap().output.clone().unwrap();
    assert_eq!(output, json!({"provider": "backup", "request": {"prompt": "hi"}}));
    assert_eq!(primary.calls(), 1);

    let mut provider_failed = false;
    while let Ok(event) = rx.try_recv() {
        if let LisaEvent::ProviderFailed { provider, .. } = event {
            assert_eq!(provider, "primary");
            provider_failed = true;
        }
    }
    assert!(provider_failed);
}

#[tokio::test(start_paused = true)]
async fn hung_primary_fails_over_within_the_task_deadline() {
    let events = Arc::new(EventBus::default());
    let invoker = invoker();
    let primary = Arc::new(ScriptedProvider::new("primary").with_delay(Duration::from_secs(3600)));
    let backup = Arc::new(ScriptedProvider::new("backup"));
    let failover = ProviderFailover::new(
        "complete",
        vec![
            ProviderDescriptor::new(primary.clone(), 0),
            ProviderDescriptor::new(backup.clone(), 1),
        ],
        Arc::clone(&invoker),
        Arc::clone(&events),
    );

    let mut registry = CapabilityRegistry::new();
    registry.register(FailoverCapability::new(Arc::new(failover)));
    let report = Coordinator::new(Arc::new(registry), invoker, events)
        .submit(vec![task("answer", "complete").with_input(json!({"prompt": "hi"}))])
        .await
        .unwrap();

    let answer = report.get("answer").unwrap();
    assert_eq!(answer.status, TaskStatus::Succeeded, "{:?}", answer.error);
    assert_eq!(answer.output.as_ref().unwrap()["provider"], "backup");
    // each primary attempt times out on its own 5s deadline
    assert_eq!(primary.calls(), 3);
    assert_eq!(backup.calls(), 1);
}

#[tokio::test]
async fn builtins_run_through_the_coordinator() {
    let dir = std::env::temp_dir().join(format!("lisa-coordinator-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let context = lisa_core::types::CapabilityContext {
        workspace: dir.clone(),
        ..Default::default()
    };

    let report = coordinator(CapabilityRegistry::with_builtins())
        .with_context(context)
        .submit(vec![
            task("greet", "echo").with_input(json!({"text": "hello"})),
            task_with_deps("save", "files.write", &["greet"])
                .with_input(json!({"path": "out/greeting.txt", "content": "$task.greet.output.text"})),
            task_with_deps("load", "files.read", &["save"]).with_input(json!({"path": "out/greeting.txt"})),
        ])
        .await
        .unwrap();

    assert!(report.all_succeeded(), "{:?}", report.tasks);
    assert_eq!(report.get("load").unwrap().output.as_ref().unwrap()["content"], "hello");
    std::fs::remove_dir_all(&dir).ok();
}
