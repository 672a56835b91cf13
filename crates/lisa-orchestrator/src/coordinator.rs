//! Task graph coordinator: validates a submission, then runs every task once,
//! as soon as all of its dependencies have succeeded.
//!
//! Each task is driven through the resilient invoker keyed by its capability
//! name, so tasks sharing a capability share breaker state. A failed task
//! blocks everything downstream of it; unrelated tasks keep running.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lisa_capabilities::{CapabilityRegistry, Resolution};
use lisa_core::config::CoordinatorConfig;
use lisa_core::error::{LisaError, Result};
use lisa_core::event::EventBus;
use lisa_core::types::{
    CapabilityContext, ExecutionRecord, LisaEvent, Report, SubmissionId, Task, TaskError, TaskStatus,
};
use lisa_resilience::{InvokeOptions, ResilientInvoker};

use crate::expression::ExpressionEvaluator;
use crate::graph::TaskGraph;
use crate::template;

/// Runs task submissions against a capability registry.
pub struct Coordinator {
    registry: Arc<CapabilityRegistry>,
    invoker: Arc<ResilientInvoker>,
    evaluator: Arc<ExpressionEvaluator>,
    events: Arc<EventBus>,
    config: CoordinatorConfig,
    context: CapabilityContext,
    options: InvokeOptions,
}

impl Coordinator {
    pub fn new(registry: Arc<CapabilityRegistry>, invoker: Arc<ResilientInvoker>, events: Arc<EventBus>) -> Self {
        let options = invoker.defaults().clone();
        Self {
            registry,
            invoker,
            evaluator: Arc::new(ExpressionEvaluator::new()),
            events,
            config: CoordinatorConfig::default(),
            context: CapabilityContext::default(),
            options,
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Ambient data handed (read-only) to every capability.
    pub fn with_context(mut self, context: CapabilityContext) -> Self {
        self.context = context;
        self
    }

    /// Retry/timeout policy for each task's invocation.
    pub fn with_invoke_options(mut self, options: InvokeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_evaluator(mut self, evaluator: ExpressionEvaluator) -> Self {
        self.evaluator = Arc::new(evaluator);
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Run a submission to completion.
    ///
    /// Returns `Err` only for submission-level validation failures, before
    /// any task has run. Every task failure is reported in the [`Report`].
    pub async fn submit(&self, tasks: Vec<Task>) -> Result<Report> {
        self.submit_with_cancel(tasks, CancellationToken::new()).await
    }

    /// Like [`submit`](Self::submit), but `cancel` aborts the submission:
    /// running tasks are abandoned and every unfinished task is reported
    /// failed with `cancelled`.
    pub async fn submit_with_cancel(&self, tasks: Vec<Task>, cancel: CancellationToken) -> Result<Report> {
        let graph = self.validate(tasks)?;
        let mut run = SubmissionRun::new(graph, self.config.max_parallelism);

        info!(submission = %run.id, tasks = run.graph.len(), "Submission started");
        debug!(submission = %run.id, order = ?run.graph.topological_order(), "Execution plan");
        self.events.publish(LisaEvent::SubmissionStarted {
            submission_id: run.id.clone(),
            task_count: run.graph.len(),
        });

        loop {
            if cancel.is_cancelled() {
                break;
            }
            while run.has_capacity() {
                let Some(id) = run.ready.pop_front() else {
                    break;
                };
                self.launch(&mut run, &id);
            }
            if run.join_set.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(submission = %run.id, running = run.running.len(), "Submission cancelled");
                    run.join_set.abort_all();
                    break;
                }
                joined = run.join_set.join_next() => match joined {
                    Some(Ok((id, result))) => self.settle(&mut run, &id, result),
                    Some(Err(e)) => error!(submission = %run.id, error = %e, "Task join failed"),
                    None => break,
                },
            }
        }

        self.finish_unsettled(&mut run, cancel.is_cancelled());
        Ok(self.report(run))
    }

    /// Submission-level checks. Nothing runs if any of these fail.
    fn validate(&self, tasks: Vec<Task>) -> Result<TaskGraph> {
        let graph = TaskGraph::build(tasks)?;

        for task in graph.tasks() {
            let refs = template::references(&self.evaluator, &task.input);
            let undeclared = refs
                .tasks
                .iter()
                .chain(refs.identifiers.iter().filter(|id| graph.contains(id)))
                .find(|id| !task.dependencies.contains(*id));
            if let Some(id) = undeclared {
                return Err(LisaError::Validation(format!(
                    "task '{}' references '{}' which is not one of its dependencies",
                    task.id, id
                )));
            }

            if self.config.strict_capabilities && !self.registry.contains(&task.capability) {
                return Err(LisaError::Validation(format!(
                    "task '{}' uses unknown capability '{}'",
                    task.id, task.capability
                )));
            }
        }
        Ok(graph)
    }

    fn launch(&self, run: &mut SubmissionRun, id: &str) {
        let Some(task) = run.graph.get(id).cloned() else {
            return;
        };

        // Only declared dependencies' outputs are visible to the task.
        let outputs: BTreeMap<String, serde_json::Value> = task
            .dependencies
            .iter()
            .filter_map(|d| run.outputs.get(d).map(|v| (d.clone(), v.clone())))
            .collect();

        if let Some(record) = run.records.get_mut(id) {
            record.status = TaskStatus::Running;
            record.started_at = Some(Utc::now());
        }
        run.running.insert(id.to_string(), Instant::now());

        debug!(submission = %run.id, task = %task.id, capability = %task.capability, "Task started");
        self.events.publish(LisaEvent::TaskStarted {
            submission_id: run.id.clone(),
            task_id: task.id.clone(),
            capability: task.capability.clone(),
        });

        let mut context = self.context.clone();
        context.submission_id = Some(run.id.clone());
        context.task_id = Some(task.id.clone());

        let job = TaskJob {
            registry: Arc::clone(&self.registry),
            invoker: Arc::clone(&self.invoker),
            evaluator: Arc::clone(&self.evaluator),
            options: self.options.clone(),
            context,
            outputs,
        };
        let task_id = task.id.clone();
        run.join_set.spawn(async move {
            let result = match AssertUnwindSafe(job.run(task)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(LisaError::TaskPanicked(panic_message(panic.as_ref()))),
            };
            (task_id, result)
        });
    }

    fn settle(&self, run: &mut SubmissionRun, id: &str, result: Result<serde_json::Value>) {
        let finished = Instant::now();
        let elapsed = run
            .running
            .remove(id)
            .map(|started| finished - started)
            .unwrap_or_default();
        run.busy += elapsed;
        run.last_completion = Some(finished);
        let duration_ms = elapsed.as_millis() as u64;

        let Some(record) = run.records.get_mut(id) else {
            return;
        };
        record.finished_at = Some(Utc::now());
        record.duration_ms = Some(duration_ms);

        match result {
            Ok(output) => {
                record.status = TaskStatus::Succeeded;
                record.output = Some(output.clone());
                run.outputs.insert(id.to_string(), output);

                info!(submission = %run.id, task = id, duration_ms, "Task succeeded");
                self.events.publish(LisaEvent::TaskSucceeded {
                    submission_id: run.id.clone(),
                    task_id: id.to_string(),
                    duration_ms,
                });

                let dependents: Vec<String> = run.graph.dependents(id).into_iter().map(String::from).collect();
                for dependent in dependents {
                    if let Some(remaining) = run.remaining.get_mut(&dependent) {
                        *remaining = remaining.saturating_sub(1);
                        if *remaining == 0 {
                            run.ready.push_back(dependent);
                        }
                    }
                }
            }
            Err(e) => {
                let error = TaskError::from(&e);
                record.status = TaskStatus::Failed;
                record.error = Some(error.clone());

                warn!(submission = %run.id, task = id, kind = %error.kind, error = %e, "Task failed");
                self.events.publish(LisaEvent::TaskFailed {
                    submission_id: run.id.clone(),
                    task_id: id.to_string(),
                    error,
                });
                self.block_downstream(run, id);
            }
        }
    }

    /// Fail everything downstream of `failed` without running it. Each
    /// blocked task names the dependency that failed on its path.
    fn block_downstream(&self, run: &mut SubmissionRun, failed: &str) {
        let mut queue: VecDeque<(String, String)> = run
            .graph
            .dependents(failed)
            .into_iter()
            .map(|d| (d.to_string(), failed.to_string()))
            .collect();

        while let Some((id, dependency)) = queue.pop_front() {
            let Some(record) = run.records.get_mut(&id) else {
                continue;
            };
            if record.status != TaskStatus::Pending {
                continue;
            }
            let error = TaskError::from(LisaError::BlockedByDependency {
                dependency: dependency.clone(),
            });
            record.status = TaskStatus::Failed;
            record.error = Some(error);
            record.finished_at = Some(Utc::now());

            debug!(submission = %run.id, task = %id, dependency = %dependency, "Task blocked by failed dependency");
            self.events.publish(LisaEvent::TaskBlocked {
                submission_id: run.id.clone(),
                task_id: id.clone(),
                dependency,
            });

            queue.extend(run.graph.dependents(&id).into_iter().map(|d| (d.to_string(), id.clone())));
        }
    }

    /// Give every task still pending or running a terminal state.
    fn finish_unsettled(&self, run: &mut SubmissionRun, cancelled: bool) {
        let now = Instant::now();
        let unsettled: Vec<String> = run
            .records
            .iter()
            .filter(|(_, r)| !r.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();

        for id in unsettled {
            let started = run.running.remove(&id);
            let error = if cancelled {
                LisaError::Cancelled
            } else if started.is_some() {
                LisaError::TaskPanicked("task terminated without a result".into())
            } else {
                let dependency = run
                    .graph
                    .get(&id)
                    .and_then(|t| {
                        t.dependencies
                            .iter()
                            .find(|d| run.records.get(*d).map(|r| r.status) != Some(TaskStatus::Succeeded))
                            .cloned()
                    })
                    .unwrap_or_default();
                LisaError::BlockedByDependency { dependency }
            };

            let error = TaskError::from(error);
            if let Some(record) = run.records.get_mut(&id) {
                record.status = TaskStatus::Failed;
                record.finished_at = Some(Utc::now());
                if let Some(started) = started {
                    let elapsed = now - started;
                    record.duration_ms = Some(elapsed.as_millis() as u64);
                    run.busy += elapsed;
                    run.last_completion = Some(now);
                }
                self.events.publish(LisaEvent::TaskFailed {
                    submission_id: run.id.clone(),
                    task_id: id.clone(),
                    error: error.clone(),
                });
                record.error = Some(error);
            }
        }
    }

    fn report(&self, run: SubmissionRun) -> Report {
        let wall = run
            .last_completion
            .map(|t| t.saturating_duration_since(run.started))
            .unwrap_or_default();
        let parallelism = if wall.is_zero() {
            if run.busy.is_zero() { 0.0 } else { 1.0 }
        } else {
            run.busy.as_secs_f64() / wall.as_secs_f64()
        };

        let report = Report {
            submission_id: run.id,
            tasks: run.records,
            total_duration_ms: wall.as_millis() as u64,
            parallelism,
        };

        info!(
            submission = %report.submission_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            total_duration_ms = report.total_duration_ms,
            parallelism = report.parallelism,
            "Submission completed"
        );
        self.events.publish(LisaEvent::SubmissionCompleted {
            submission_id: report.submission_id.clone(),
            succeeded: report.succeeded(),
            failed: report.failed(),
            total_duration_ms: report.total_duration_ms,
        });
        report
    }
}

/// Mutable state of one submission, owned by the coordinator loop.
struct SubmissionRun {
    id: SubmissionId,
    graph: TaskGraph,
    records: BTreeMap<String, ExecutionRecord>,
    /// Dependencies not yet succeeded, per task.
    remaining: HashMap<String, usize>,
    ready: VecDeque<String>,
    outputs: HashMap<String, serde_json::Value>,
    running: HashMap<String, Instant>,
    join_set: JoinSet<(String, Result<serde_json::Value>)>,
    max_parallelism: Option<usize>,
    started: Instant,
    last_completion: Option<Instant>,
    busy: Duration,
}

impl SubmissionRun {
    fn new(graph: TaskGraph, max_parallelism: Option<usize>) -> Self {
        let records: BTreeMap<String, ExecutionRecord> = graph
            .tasks()
            .iter()
            .map(|t| (t.id.clone(), ExecutionRecord::pending(t)))
            .collect();
        let remaining = graph.in_degrees();
        let ready: VecDeque<String> = graph.roots().into_iter().map(String::from).collect();
        Self {
            id: SubmissionId::new(),
            graph,
            records,
            remaining,
            ready,
            outputs: HashMap::new(),
            running: HashMap::new(),
            join_set: JoinSet::new(),
            max_parallelism: max_parallelism.filter(|&n| n > 0),
            started: Instant::now(),
            last_completion: None,
            busy: Duration::ZERO,
        }
    }

    fn has_capacity(&self) -> bool {
        match self.max_parallelism {
            Some(limit) => self.running.len() < limit,
            None => true,
        }
    }
}

/// Everything one spawned task needs, detached from the coordinator.
struct TaskJob {
    registry: Arc<CapabilityRegistry>,
    invoker: Arc<ResilientInvoker>,
    evaluator: Arc<ExpressionEvaluator>,
    options: InvokeOptions,
    context: CapabilityContext,
    outputs: BTreeMap<String, serde_json::Value>,
}

impl TaskJob {
    async fn run(self, task: Task) -> Result<serde_json::Value> {
        let input = template::resolve_input(&self.evaluator, &task.input, &self.outputs)?;

        let capability = match self.registry.resolve(&task.capability).await? {
            Resolution::Found(capability) => capability,
            Resolution::NotFound => return Err(LisaError::CapabilityNotFound(task.capability.clone())),
        };

        let mut options = self.options.clone();
        if let Some(ms) = capability.timeout_ms() {
            options.timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = capability.max_attempts() {
            options.max_attempts = attempts;
        }

        let name = task.capability.as_str();
        let context = &self.context;
        self.invoker
            .execute(
                name,
                || {
                    let capability = Arc::clone(&capability);
                    let input = input.clone();
                    let context = context.clone();
                    async move {
                        let output = capability.invoke(input, context).await?;
                        if output.success {
                            Ok(output.output)
                        } else {
                            Err(LisaError::CapabilityFailed {
                                capability: name.to_string(),
                                message: output.error.unwrap_or_else(|| "capability reported failure".to_string()),
                            })
                        }
                    }
                },
                &options,
            )
            .await
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
