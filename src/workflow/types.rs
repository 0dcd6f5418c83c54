use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::StageMode;
use crate::error::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    /// Some fan-out units failed.
    Partial,
    Failed,
    /// Never started because the run failed fast.
    Skipped,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Ok => write!(f, "ok"),
            StageStatus::Partial => write!(f, "partial"),
            StageStatus::Failed => write!(f, "failed"),
            StageStatus::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// What a stage will accept from one of its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyPolicy {
    /// Dependency must be `ok`.
    Required,
    /// Dependency may be `ok` or `partial`.
    AcceptPartial,
    /// Stage runs whatever the dependency's outcome.
    Tolerant,
}

impl DependencyPolicy {
    pub fn accepts(&self, status: StageStatus) -> bool {
        match self {
            DependencyPolicy::Required => status == StageStatus::Ok,
            DependencyPolicy::AcceptPartial => {
                matches!(status, StageStatus::Ok | StageStatus::Partial)
            }
            DependencyPolicy::Tolerant => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub stage: String,
    pub policy: DependencyPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// The run's initial input.
    Initial,
    /// The payload of an upstream stage.
    Stage(String),
}

/// How a stage turns its inputs into units of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitStrategy {
    /// One unit of work over all inputs.
    Inline,
    /// One unit per element of the JSON array at `pointer` in `from`.
    FanOut { from: InputSource, pointer: String },
}

/// Unit of work handed to a stage callback.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkUnit {
    Whole,
    Item {
        index: usize,
        id: String,
        value: Value,
    },
}

impl WorkUnit {
    pub fn id(&self) -> Option<&str> {
        match self {
            WorkUnit::Whole => None,
            WorkUnit::Item { id, .. } => Some(id),
        }
    }
}

/// Read-only view of everything a stage may consume.
#[derive(Debug, Clone)]
pub struct StageInputs {
    pub initial: Arc<Value>,
    pub upstream: BTreeMap<String, Arc<StageResult>>,
}

impl StageInputs {
    pub fn get(&self, stage: &str) -> Option<&StageResult> {
        self.upstream.get(stage).map(|r| r.as_ref())
    }

    pub fn payload(&self, stage: &str) -> Option<&Value> {
        self.get(stage).map(|r| &r.payload)
    }

    /// Upstream stages that did not finish `ok`.
    pub fn degraded(&self) -> Vec<&str> {
        self.upstream
            .values()
            .filter(|r| r.status != StageStatus::Ok)
            .map(|r| r.stage.as_str())
            .collect()
    }

    pub fn source(&self, source: &InputSource) -> Option<&Value> {
        match source {
            InputSource::Initial => Some(self.initial.as_ref()),
            InputSource::Stage(name) => self.payload(name),
        }
    }
}

/// Domain logic of a stage, supplied from outside the engine.
#[async_trait]
pub trait StageWork: Send + Sync {
    async fn run(&self, unit: WorkUnit, inputs: Arc<StageInputs>) -> anyhow::Result<Value>;

    /// Payload to record for a unit that failed, timed out or was cancelled.
    fn on_unit_failure(&self, _unit: &WorkUnit, _error: &StageError) -> Option<Value> {
        None
    }
}

#[async_trait]
impl<F, Fut> StageWork for F
where
    F: Fn(WorkUnit, Arc<StageInputs>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn run(&self, unit: WorkUnit, inputs: Arc<StageInputs>) -> anyhow::Result<Value> {
        (self)(unit, inputs).await
    }
}

#[derive(Clone)]
pub struct StageDefinition {
    pub name: String,
    pub dependencies: Vec<Dependency>,
    pub parallel_capable: bool,
    pub split: SplitStrategy,
    pub work: Arc<dyn StageWork>,
}

impl std::fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("parallel_capable", &self.parallel_capable)
            .field("split", &self.split)
            .finish()
    }
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, work: impl StageWork + 'static) -> Self {
        Self::from_arc(name, Arc::new(work))
    }

    pub fn from_arc(name: impl Into<String>, work: Arc<dyn StageWork>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            parallel_capable: false,
            split: SplitStrategy::Inline,
            work,
        }
    }

    pub fn requires(self, stage: impl Into<String>) -> Self {
        self.depends_on(stage, DependencyPolicy::Required)
    }

    pub fn accepts_partial(self, stage: impl Into<String>) -> Self {
        self.depends_on(stage, DependencyPolicy::AcceptPartial)
    }

    pub fn tolerates(self, stage: impl Into<String>) -> Self {
        self.depends_on(stage, DependencyPolicy::Tolerant)
    }

    pub fn depends_on(mut self, stage: impl Into<String>, policy: DependencyPolicy) -> Self {
        self.dependencies.push(Dependency {
            stage: stage.into(),
            policy,
        });
        self
    }

    pub fn parallel_capable(mut self) -> Self {
        self.parallel_capable = true;
        self
    }

    pub fn fan_out(mut self, from: InputSource, pointer: impl Into<String>) -> Self {
        self.split = SplitStrategy::FanOut {
            from,
            pointer: pointer.into(),
        };
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Ok,
    Failed,
}

/// Outcome of one fan-out sub-unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub id: String,
    pub index: usize,
    pub status: UnitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    pub payload: Value,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<UnitOutcome>,
    /// Non-ok dependencies this stage proceeded past.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstream_failures: Vec<String>,
}

impl StageResult {
    pub fn failed(stage: &str, error: &StageError) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Failed,
            payload: Value::Null,
            started_at: Utc::now(),
            duration_ms: 0,
            error: Some(error.to_string()),
            units: Vec::new(),
            upstream_failures: Vec::new(),
        }
    }

    pub fn skipped(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Skipped,
            payload: Value::Null,
            started_at: Utc::now(),
            duration_ms: 0,
            error: None,
            units: Vec::new(),
            upstream_failures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// State of one workflow execution.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub tenant: String,
    pub modes: BTreeMap<String, StageMode>,
    pub results: BTreeMap<String, Arc<StageResult>>,
    /// Stage names in the order they finished.
    pub order: Vec<String>,
    pub status: RunStatus,
    pub terminal_stage: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    audit: Vec<AuditEntry>,
}

impl WorkflowRun {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant: tenant.into(),
            modes: BTreeMap::new(),
            results: BTreeMap::new(),
            order: Vec::new(),
            status: RunStatus::Pending,
            terminal_stage: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            audit: Vec::new(),
        }
    }

    pub fn result(&self, stage: &str) -> Option<&StageResult> {
        self.results.get(stage).map(|r| r.as_ref())
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn audit(&self) -> &[AuditEntry] {
        &self.audit
    }

    /// The only mutation allowed once the run has finished.
    pub fn append_audit(&mut self, message: impl Into<String>) {
        self.audit.push(AuditEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    pub(crate) fn record(&mut self, result: StageResult) -> Arc<StageResult> {
        let name = result.stage.clone();
        let result = Arc::new(result);
        self.results.insert(name.clone(), Arc::clone(&result));
        self.order.push(name);
        result
    }

    pub fn manifest(&self) -> RunManifest {
        RunManifest {
            run_id: self.id,
            tenant: self.tenant.clone(),
            status: self.status,
            created_at: self.created_at,
            finished_at: self.finished_at,
            terminal: self
                .terminal_stage
                .as_deref()
                .and_then(|name| self.result(name))
                .cloned(),
            stages: self
                .order
                .iter()
                .filter_map(|name| self.result(name))
                .cloned()
                .collect(),
            audit: self.audit.clone(),
        }
    }
}

/// Final, serializable account of a run handed to delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub tenant: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub terminal: Option<StageResult>,
    pub stages: Vec<StageResult>,
    pub audit: Vec<AuditEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dependency_policies() {
        use StageStatus::*;
        assert!(DependencyPolicy::Required.accepts(Ok));
        assert!(!DependencyPolicy::Required.accepts(Partial));
        assert!(DependencyPolicy::AcceptPartial.accepts(Partial));
        assert!(!DependencyPolicy::AcceptPartial.accepts(Failed));
        assert!(DependencyPolicy::Tolerant.accepts(Failed));
        assert!(DependencyPolicy::Tolerant.accepts(Skipped));
    }

    #[test]
    fn test_inputs_report_degraded_upstream() {
        let mut upstream = BTreeMap::new();
        let mut ok = StageResult::skipped("ingest");
        ok.status = StageStatus::Ok;
        ok.payload = json!({"claims": []});
        upstream.insert("ingest".to_string(), Arc::new(ok));
        upstream.insert(
            "analysis".to_string(),
            Arc::new(StageResult::failed(
                "analysis",
                &StageError::Cancelled("analysis".to_string()),
            )),
        );

        let inputs = StageInputs {
            initial: Arc::new(json!({"claims": [1, 2]})),
            upstream,
        };
        assert_eq!(inputs.degraded(), vec!["analysis"]);
        assert_eq!(inputs.payload("ingest"), Some(&json!({"claims": []})));
        assert_eq!(
            inputs.source(&InputSource::Initial),
            Some(&json!({"claims": [1, 2]}))
        );
    }

    #[test]
    fn test_manifest_lists_stages_in_finish_order() {
        let mut run = WorkflowRun::new("tenant-a");
        run.record(StageResult::skipped("b"));
        run.record(StageResult::skipped("a"));
        run.terminal_stage = Some("a".to_string());
        run.status = RunStatus::Failed;
        run.append_audit("run failed");

        let manifest = run.manifest();
        let names: Vec<_> = manifest.stages.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(manifest.terminal.map(|t| t.stage), Some("a".to_string()));
        assert_eq!(manifest.audit.len(), 1);
    }
}
