use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerConfigError, StageError};
use crate::metrics::Metrics;
use crate::workflow::executor::StageExecutor;
use crate::workflow::types::{
    InputSource, RunStatus, SplitStrategy, StageDefinition, StageInputs, StageResult,
    StageStatus, WorkflowRun,
};

pub const DEFAULT_TENANT: &str = "default";

/// Validated stage graph.
struct StagePlan<'a> {
    stages: &'a [StageDefinition],
    index: HashMap<&'a str, usize>,
    /// Stage indices in a dependency-respecting order.
    topo: Vec<usize>,
    terminal: usize,
}

impl<'a> StagePlan<'a> {
    fn build(stages: &'a [StageDefinition]) -> Result<Self, SchedulerConfigError> {
        if stages.is_empty() {
            return Err(SchedulerConfigError::Empty);
        }

        let mut index = HashMap::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            if index.insert(stage.name.as_str(), i).is_some() {
                return Err(SchedulerConfigError::DuplicateStage(stage.name.clone()));
            }
        }

        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..stages.len()).map(|i| graph.add_node(i)).collect();

        for (i, stage) in stages.iter().enumerate() {
            for dep in &stage.dependencies {
                let Some(&d) = index.get(dep.stage.as_str()) else {
                    return Err(SchedulerConfigError::UndeclaredDependency {
                        stage: stage.name.clone(),
                        dependency: dep.stage.clone(),
                    });
                };
                graph.add_edge(nodes[d], nodes[i], ());
            }

            if let SplitStrategy::FanOut {
                from: InputSource::Stage(source),
                ..
            } = &stage.split
            {
                if !stage.dependencies.iter().any(|d| &d.stage == source) {
                    return Err(SchedulerConfigError::InvalidFanOutSource {
                        stage: stage.name.clone(),
                        source_stage: source.clone(),
                    });
                }
            }
        }

        let topo: Vec<usize> = toposort(&graph, None)
            .map_err(|cycle| SchedulerConfigError::Cycle(stages[graph[cycle.node_id()]].name.clone()))?
            .into_iter()
            .map(|n| graph[n])
            .collect();

        // Last declared stage that nothing depends on.
        let terminal = (0..stages.len())
            .rev()
            .find(|&i| {
                graph
                    .neighbors_directed(nodes[i], petgraph::Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .unwrap_or(topo[topo.len() - 1]);

        Ok(Self {
            stages,
            index,
            topo,
            terminal,
        })
    }

    fn name(&self, i: usize) -> &'a str {
        self.stages[i].name.as_str()
    }
}

/// Drives a run through its stage graph.
pub struct WorkflowScheduler {
    executor: StageExecutor,
}

impl WorkflowScheduler {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            executor: StageExecutor::new(metrics),
        }
    }

    /// Check the stage graph without running anything.
    pub fn validate(stages: &[StageDefinition]) -> Result<Vec<String>, SchedulerConfigError> {
        let plan = StagePlan::build(stages)?;
        Ok(plan.topo.iter().map(|&i| plan.name(i).to_string()).collect())
    }

    pub async fn execute(
        &self,
        stages: &[StageDefinition],
        initial_input: Value,
        config: &SchedulerConfig,
    ) -> Result<WorkflowRun, SchedulerConfigError> {
        self.execute_with_cancel(
            DEFAULT_TENANT,
            stages,
            initial_input,
            config,
            CancellationToken::new(),
        )
        .await
    }

    /// Run every stage once, in dependency order.
    ///
    /// Graph errors are returned before any stage is invoked. Stage
    /// failures never surface as `Err`; they are recorded on the run.
    /// Cancelling `cancel` stops in-flight stages and skips the rest.
    pub async fn execute_with_cancel(
        &self,
        tenant: &str,
        stages: &[StageDefinition],
        initial_input: Value,
        config: &SchedulerConfig,
        cancel: CancellationToken,
    ) -> Result<WorkflowRun, SchedulerConfigError> {
        let plan = StagePlan::build(stages)?;

        let mut run = WorkflowRun::new(tenant);
        run.terminal_stage = Some(plan.name(plan.terminal).to_string());
        for stage in stages {
            run.modes.insert(stage.name.clone(), config.stage(&stage.name));
        }
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        run.append_audit(format!(
            "run started with {} stages, order {}",
            stages.len(),
            plan.topo
                .iter()
                .map(|&i| plan.name(i))
                .collect::<Vec<_>>()
                .join(" -> ")
        ));
        info!(run_id = %run.id, tenant, stages = stages.len(), "Workflow run started");

        let initial = Arc::new(initial_input);
        let run_cancel = cancel.child_token();
        let mut finished: HashMap<usize, StageStatus> = HashMap::new();
        let mut pending: BTreeSet<usize> = (0..stages.len()).collect();
        let mut failed_fast = false;

        while !pending.is_empty() {
            // A finished dependency whose outcome the dependent refuses ends the run.
            let refused: Vec<(usize, usize)> = pending
                .iter()
                .filter_map(|&i| {
                    stages[i].dependencies.iter().find_map(|dep| {
                        let d = plan.index[dep.stage.as_str()];
                        match finished.get(&d) {
                            Some(&status) if !dep.policy.accepts(status) => Some((i, d)),
                            _ => None,
                        }
                    })
                })
                .collect();

            if !refused.is_empty() {
                for (i, d) in refused {
                    let status = finished[&d];
                    let error = StageError::DependencyFailed {
                        stage: plan.name(i).to_string(),
                        dependency: plan.name(d).to_string(),
                        status: status.to_string(),
                    };
                    error!(run_id = %run.id, stage = plan.name(i), error = %error, "Stage failed fast");
                    run.append_audit(format!("stage {} failed fast: {error}", plan.name(i)));
                    pending.remove(&i);
                    finished.insert(i, StageStatus::Failed);
                    run.record(StageResult::failed(plan.name(i), &error));
                }
                failed_fast = true;
                run_cancel.cancel();
                break;
            }

            if run_cancel.is_cancelled() {
                run.append_audit("run cancelled");
                warn!(run_id = %run.id, "Workflow run cancelled");
                break;
            }

            let ready: Vec<usize> = pending
                .iter()
                .copied()
                .filter(|&i| {
                    stages[i]
                        .dependencies
                        .iter()
                        .all(|dep| finished.contains_key(&plan.index[dep.stage.as_str()]))
                })
                .collect();

            let Some(&first) = ready.first() else {
                // Unreachable for a validated graph.
                run.append_audit("no runnable stage left");
                break;
            };

            let concurrent = |i: &usize| {
                stages[*i].parallel_capable && run.modes[plan.name(*i)].parallel
            };
            let batch: Vec<usize> = if concurrent(&first) {
                ready.iter().copied().filter(concurrent).collect()
            } else {
                vec![first]
            };

            let mut in_flight: FuturesUnordered<_> = batch
                .iter()
                .map(|&i| {
                    pending.remove(&i);
                    let inputs = Arc::new(StageInputs {
                        initial: Arc::clone(&initial),
                        upstream: stages[i]
                            .dependencies
                            .iter()
                            .filter_map(|dep| {
                                run.results
                                    .get(&dep.stage)
                                    .map(|r| (dep.stage.clone(), Arc::clone(r)))
                            })
                            .collect::<BTreeMap<_, _>>(),
                    });
                    let mode = run.modes[plan.name(i)];
                    let stage = &stages[i];
                    let cancel = &run_cancel;
                    let executor = &self.executor;
                    async move { (i, executor.run(stage, mode, inputs, cancel).await) }
                })
                .collect();

            while let Some((i, result)) = in_flight.next().await {
                // Siblings still running are cancelled once a dependent is bound to refuse.
                if has_refusing_dependent(stages, plan.name(i), result.status) {
                    run_cancel.cancel();
                }
                run.append_audit(format!(
                    "stage {} finished {} in {}ms",
                    result.stage, result.status, result.duration_ms
                ));
                finished.insert(i, result.status);
                run.record(result);
            }
        }

        for i in plan.topo.iter().copied().filter(|i| pending.contains(i)) {
            self.skip_stage(&mut run, plan.name(i));
        }

        let terminal_failed = run
            .result(plan.name(plan.terminal))
            .map_or(true, |r| r.status == StageStatus::Failed || r.status == StageStatus::Skipped);
        run.status = if failed_fast || cancel.is_cancelled() || terminal_failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        run.finished_at = Some(Utc::now());
        run.append_audit(format!("run {}", run_status_word(run.status)));

        info!(
            run_id = %run.id,
            status = run_status_word(run.status),
            stages_finished = run.order.len(),
            "Workflow run finished"
        );

        Ok(run)
    }

    fn skip_stage(&self, run: &mut WorkflowRun, stage: &str) {
        self.executor.skip(stage);
        run.append_audit(format!("stage {stage} skipped"));
        run.record(StageResult::skipped(stage));
    }
}

fn has_refusing_dependent(stages: &[StageDefinition], name: &str, status: StageStatus) -> bool {
    stages.iter().any(|s| {
        s.dependencies
            .iter()
            .any(|d| d.stage == name && !d.policy.accepts(status))
    })
}

fn run_status_word(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageModeConfig;
    use crate::workflow::types::{StageWork, WorkUnit};
    use serde_json::json;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    fn stage<F, Fut>(name: &str, work: F) -> StageDefinition
    where
        F: Fn(WorkUnit, Arc<StageInputs>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        StageDefinition::new(name, work)
    }

    fn constant(name: &str, value: Value) -> StageDefinition {
        stage(name, move |_unit, _inputs| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    fn failing(name: &str) -> StageDefinition {
        stage(name, |_unit, _inputs| async move { anyhow::bail!("boom") })
    }

    fn scheduler() -> WorkflowScheduler {
        WorkflowScheduler::new(Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_any_stage_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = |name: &str| {
            let calls = Arc::clone(&calls);
            stage(name, move |_unit, _inputs| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Value::Null) }
            })
        };

        let stages = vec![
            counted("a").requires("c"),
            counted("b").requires("a"),
            counted("c").requires("b"),
        ];

        let err = scheduler()
            .execute(&stages, Value::Null, &SchedulerConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerConfigError::Cycle(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_graph_errors() {
        assert_eq!(
            WorkflowScheduler::validate(&[]).unwrap_err(),
            SchedulerConfigError::Empty
        );
        assert_eq!(
            WorkflowScheduler::validate(&[constant("a", json!(1)), constant("a", json!(2))])
                .unwrap_err(),
            SchedulerConfigError::DuplicateStage("a".to_string())
        );
        assert_eq!(
            WorkflowScheduler::validate(&[constant("a", json!(1)).requires("ghost")]).unwrap_err(),
            SchedulerConfigError::UndeclaredDependency {
                stage: "a".to_string(),
                dependency: "ghost".to_string(),
            }
        );
        assert_eq!(
            WorkflowScheduler::validate(&[
                constant("a", json!([])),
                constant("b", json!(1)).fan_out(InputSource::Stage("a".to_string()), ""),
            ])
            .unwrap_err(),
            SchedulerConfigError::InvalidFanOutSource {
                stage: "b".to_string(),
                source_stage: "a".to_string(),
            }
        );
        assert!(matches!(
            WorkflowScheduler::validate(&[constant("a", json!(1)).requires("a")]).unwrap_err(),
            SchedulerConfigError::Cycle(name) if name == "a"
        ));
    }

    #[test]
    fn test_validate_returns_dependency_order() {
        let order = WorkflowScheduler::validate(&[
            constant("report", json!(1)).requires("verify"),
            constant("verify", json!(1)).requires("extract"),
            constant("extract", json!(1)),
        ])
        .unwrap();
        assert_eq!(order, vec!["extract", "verify", "report"]);
    }

    #[tokio::test]
    async fn test_upstream_payload_flows_downstream() {
        let stages = vec![
            constant("extract", json!({"claims": ["x", "y"]})),
            stage("count", |_unit, inputs: Arc<StageInputs>| async move {
                let claims = inputs
                    .payload("extract")
                    .and_then(|p| p["claims"].as_array())
                    .map_or(0, |c| c.len());
                Ok(json!(claims))
            })
            .requires("extract"),
        ];

        let run = scheduler()
            .execute(&stages, Value::Null, &SchedulerConfig::default())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.terminal_stage.as_deref(), Some("count"));
        assert_eq!(run.result("count").unwrap().payload, json!(2));
        assert_eq!(run.order, vec!["extract", "count"]);
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_required_failure_fails_fast_and_skips_rest() {
        let stages = vec![
            failing("extract"),
            constant("verify", json!(1)).requires("extract"),
            constant("report", json!(1)).requires("verify"),
        ];

        let run = scheduler()
            .execute(&stages, Value::Null, &SchedulerConfig::default())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.result("extract").unwrap().status, StageStatus::Failed);
        let verify = run.result("verify").unwrap();
        assert_eq!(verify.status, StageStatus::Failed);
        assert!(verify.error.as_deref().unwrap().contains("dependency extract"));
        assert_eq!(run.result("report").unwrap().status, StageStatus::Skipped);
        assert!(run.audit().iter().any(|e| e.message.contains("failed fast")));
    }

    #[tokio::test]
    async fn test_tolerant_stage_proceeds_and_reports_upstream_failure() {
        let stages = vec![
            constant("extract", json!(1)),
            failing("enrich").requires("extract"),
            stage("report", |_unit, inputs: Arc<StageInputs>| async move {
                Ok(json!({"degraded": inputs.degraded()}))
            })
            .requires("extract")
            .tolerates("enrich"),
        ];

        let run = scheduler()
            .execute(&stages, Value::Null, &SchedulerConfig::default())
            .await
            .unwrap();

        let report = run.result("report").unwrap();
        assert_eq!(report.status, StageStatus::Ok);
        assert_eq!(report.upstream_failures, vec!["enrich"]);
        assert_eq!(report.payload, json!({"degraded": ["enrich"]}));
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_accepted_by_accepts_partial() {
        let stages = vec![
            constant("extract", json!({"claims": [{"id": "c1"}, {"id": "c2"}]})),
            stage("verify", |unit: WorkUnit, _inputs| async move {
                if unit.id() == Some("c2") {
                    anyhow::bail!("no evidence service");
                }
                Ok(json!("verified"))
            })
            .requires("extract")
            .fan_out(InputSource::Stage("extract".to_string()), "/claims"),
            constant("report", json!("done")).accepts_partial("verify"),
        ];

        let run = scheduler()
            .execute(&stages, Value::Null, &SchedulerConfig::default())
            .await
            .unwrap();

        assert_eq!(run.result("verify").unwrap().status, StageStatus::Partial);
        assert_eq!(run.result("report").unwrap().status, StageStatus::Ok);
        assert_eq!(run.result("report").unwrap().upstream_failures, vec!["verify"]);
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_flag_runs_independent_stages_together() {
        let slow = |name: &str| {
            stage(name, |_unit, _inputs| async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(Value::Null)
            })
            .parallel_capable()
        };
        let stages = vec![slow("a"), slow("b"), slow("c")];

        let parallel = StageModeConfig {
            parallel: true,
            ..Default::default()
        };
        let config = SchedulerConfig::default()
            .with_stage("a", parallel.clone())
            .with_stage("b", parallel.clone())
            .with_stage("c", parallel);

        let started = Instant::now();
        scheduler().execute(&stages, Value::Null, &config).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1_100));

        let started = Instant::now();
        scheduler()
            .execute(&stages, Value::Null, &SchedulerConfig::default())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_stages_follow_declaration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recording = |name: &'static str| {
            let seen = Arc::clone(&seen);
            stage(name, move |_unit, _inputs| {
                seen.lock().unwrap().push(name);
                async move { Ok(Value::Null) }
            })
        };

        let stages = vec![recording("root"), recording("x").requires("root"), recording("y").requires("root")];
        scheduler()
            .execute(&stages, Value::Null, &SchedulerConfig::default())
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["root", "x", "y"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel_fails_run() {
        let stages = vec![
            stage("slow", |_unit, _inputs| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }),
            constant("after", json!(1)).tolerates("slow"),
        ];

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let run = scheduler()
            .execute_with_cancel("acme", &stages, Value::Null, &SchedulerConfig::default(), cancel)
            .await
            .unwrap();

        assert_eq!(run.tenant, "acme");
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.result("slow").unwrap().error.as_deref().unwrap().contains("cancelled"));
        assert_eq!(run.result("after").unwrap().status, StageStatus::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_failure_cancels_sibling_in_flight() {
        let parallel = StageModeConfig {
            parallel: true,
            ..Default::default()
        };
        let config = SchedulerConfig::default()
            .with_stage("a", parallel.clone())
            .with_stage("b", parallel);

        let stages = vec![
            stage("a", |_unit, _inputs| async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                anyhow::bail!("upstream unavailable")
            })
            .parallel_capable(),
            stage("b", |_unit, _inputs| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            })
            .parallel_capable(),
            constant("c", json!(1)).requires("a"),
        ];

        let started = Instant::now();
        let run = scheduler().execute(&stages, Value::Null, &config).await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1_100), "took {elapsed:?}");
        assert_eq!(run.status, RunStatus::Failed);

        let b = run.result("b").unwrap();
        assert_eq!(b.status, StageStatus::Failed);
        assert!(b.error.as_deref().unwrap().contains("cancelled"));

        let c = run.result("c").unwrap();
        assert_eq!(c.status, StageStatus::Failed);
        assert!(c.error.as_deref().unwrap().contains("dependency a"));
    }

    #[tokio::test]
    async fn test_manifest_after_run_allows_only_audit_appends() {
        let mut run = scheduler()
            .execute(&[constant("only", json!(1))], Value::Null, &SchedulerConfig::default())
            .await
            .unwrap();
        assert!(run.is_finished());

        let before = run.manifest();
        run.append_audit("delivered");
        let after = run.manifest();
        assert_eq!(before.stages, after.stages);
        assert_eq!(after.audit.len(), before.audit.len() + 1);
    }

    struct Unused;

    #[async_trait::async_trait]
    impl StageWork for Unused {
        async fn run(&self, _unit: WorkUnit, _inputs: Arc<StageInputs>) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_terminal_failure_fails_run() {
        let stages = vec![
            StageDefinition::new("extract", Unused),
            failing("report").tolerates("extract"),
        ];
        let run = scheduler()
            .execute(&stages, Value::Null, &SchedulerConfig::default())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.manifest().terminal.unwrap().stage, "report");
    }
}
