use std::pin::pin;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StageMode;
use crate::error::StageError;
use crate::metrics::Metrics;
use crate::workflow::types::{
    InputSource, SplitStrategy, StageDefinition, StageInputs, StageResult, StageStatus,
    UnitOutcome, UnitStatus, WorkUnit,
};

/// Runs a single stage, inline or as bounded fan-out.
pub struct StageExecutor {
    metrics: Arc<Metrics>,
}

impl StageExecutor {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }

    pub async fn run(
        &self,
        stage: &StageDefinition,
        mode: StageMode,
        inputs: Arc<StageInputs>,
        cancel: &CancellationToken,
    ) -> StageResult {
        let started_at = Utc::now();
        let started = Instant::now();
        let upstream_failures: Vec<String> =
            inputs.degraded().into_iter().map(str::to_string).collect();

        self.metrics.stage_started();
        info!(
            stage = %stage.name,
            concurrency = mode.concurrency,
            timeout_secs = mode.timeout.as_secs(),
            degraded_inputs = upstream_failures.len(),
            "Stage started"
        );

        let mut result = match &stage.split {
            SplitStrategy::Inline => self.run_inline(stage, mode, inputs, cancel).await,
            SplitStrategy::FanOut { from, pointer } => {
                match split_units(&inputs, from, pointer) {
                    Ok(units) => self.run_fan_out(stage, mode, inputs, units, cancel).await,
                    Err(message) => failed(&StageError::Work {
                        stage: stage.name.clone(),
                        message,
                    }),
                }
            }
        };

        result.stage = stage.name.clone();
        result.started_at = started_at;
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.upstream_failures = upstream_failures;

        self.metrics.stage_finished(result.status, result.duration_ms);
        match result.status {
            StageStatus::Ok => info!(
                stage = %stage.name,
                duration_ms = result.duration_ms,
                units = result.units.len(),
                "Stage finished"
            ),
            status => warn!(
                stage = %stage.name,
                status = %status,
                duration_ms = result.duration_ms,
                units = result.units.len(),
                error = result.error.as_deref().unwrap_or(""),
                "Stage finished degraded"
            ),
        }

        result
    }

    /// Account for a stage that never started.
    pub fn skip(&self, stage: &str) {
        self.metrics.stage_finished(StageStatus::Skipped, 0);
        info!(stage, "Stage skipped");
    }

    async fn run_inline(
        &self,
        stage: &StageDefinition,
        mode: StageMode,
        inputs: Arc<StageInputs>,
        cancel: &CancellationToken,
    ) -> StageResult {
        let work = stage.work.run(WorkUnit::Whole, inputs);

        tokio::select! {
            outcome = tokio::time::timeout(mode.timeout, work) => match outcome {
                Ok(Ok(payload)) => completed(StageStatus::Ok, payload, Vec::new(), None),
                Ok(Err(e)) => failed(&StageError::Work {
                    stage: stage.name.clone(),
                    message: format!("{e:#}"),
                }),
                Err(_) => failed(&StageError::Timeout {
                    stage: stage.name.clone(),
                    after: mode.timeout,
                }),
            },
            _ = cancel.cancelled() => failed(&StageError::Cancelled(stage.name.clone())),
        }
    }

    async fn run_fan_out(
        &self,
        stage: &StageDefinition,
        mode: StageMode,
        inputs: Arc<StageInputs>,
        units: Vec<WorkUnit>,
        cancel: &CancellationToken,
    ) -> StageResult {
        let total = units.len();
        let mut outcomes: Vec<Option<UnitOutcome>> = vec![None; total];

        let mut pending = pin!(stream::iter(units.clone().into_iter().enumerate())
            .map(|(index, unit)| {
                let work = Arc::clone(&stage.work);
                let inputs = Arc::clone(&inputs);
                async move {
                    let result = work.run(unit.clone(), inputs).await;
                    (index, unit, result)
                }
            })
            .buffer_unordered(mode.concurrency));

        let deadline = tokio::time::sleep(mode.timeout);
        let mut deadline = pin!(deadline);
        let mut interrupted: Option<StageError> = None;

        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some((index, unit, Ok(payload))) => {
                        debug!(stage = %stage.name, unit = unit.id().unwrap_or(""), "Unit finished");
                        outcomes[index] = Some(unit_ok(index, &unit, payload));
                    }
                    Some((index, unit, Err(e))) => {
                        let error = StageError::Work {
                            stage: stage.name.clone(),
                            message: format!("unit {}: {e:#}", unit.id().unwrap_or("")),
                        };
                        warn!(stage = %stage.name, unit = unit.id().unwrap_or(""), error = %error, "Unit failed");
                        outcomes[index] = Some(unit_failed(stage, index, &unit, &error));
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    interrupted = Some(StageError::Timeout {
                        stage: stage.name.clone(),
                        after: mode.timeout,
                    });
                    break;
                }
                _ = cancel.cancelled() => {
                    interrupted = Some(StageError::Cancelled(stage.name.clone()));
                    break;
                }
            }
        }

        if let Some(error) = &interrupted {
            let unfinished = outcomes.iter().filter(|o| o.is_none()).count();
            warn!(stage = %stage.name, unfinished, error = %error, "Fan-out interrupted");
        }

        let outcomes: Vec<UnitOutcome> = outcomes
            .into_iter()
            .zip(units.iter())
            .enumerate()
            .map(|(index, (outcome, unit))| {
                outcome.unwrap_or_else(|| {
                    let error = interrupted
                        .clone()
                        .unwrap_or_else(|| StageError::Cancelled(stage.name.clone()));
                    unit_failed(stage, index, unit, &error)
                })
            })
            .collect();

        let failed_units = outcomes
            .iter()
            .filter(|o| o.status == UnitStatus::Failed)
            .count();
        let status = if failed_units == 0 {
            StageStatus::Ok
        } else if failed_units == total {
            StageStatus::Failed
        } else {
            StageStatus::Partial
        };

        let error = match (&interrupted, failed_units) {
            (Some(e), _) => Some(e.to_string()),
            (None, 0) => None,
            (None, n) => Some(format!("{n} of {total} units failed")),
        };

        let payload = Value::Array(outcomes.iter().filter_map(|o| o.payload.clone()).collect());
        completed(status, payload, outcomes, error)
    }
}

/// Pull the fan-out array out of the stage inputs.
fn split_units(
    inputs: &StageInputs,
    from: &InputSource,
    pointer: &str,
) -> Result<Vec<WorkUnit>, String> {
    let source = inputs.source(from).ok_or_else(|| match from {
        InputSource::Initial => "initial input missing".to_string(),
        InputSource::Stage(name) => format!("no payload from stage {name}"),
    })?;

    let items = source
        .pointer(pointer)
        .and_then(Value::as_array)
        .ok_or_else(|| format!("no array at {pointer:?} to fan out over"))?;

    Ok(items
        .iter()
        .enumerate()
        .map(|(index, value)| WorkUnit::Item {
            index,
            id: value
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| index.to_string()),
            value: value.clone(),
        })
        .collect())
}

fn unit_ok(index: usize, unit: &WorkUnit, payload: Value) -> UnitOutcome {
    UnitOutcome {
        id: unit.id().unwrap_or_default().to_string(),
        index,
        status: UnitStatus::Ok,
        payload: Some(payload),
        error: None,
    }
}

fn unit_failed(
    stage: &StageDefinition,
    index: usize,
    unit: &WorkUnit,
    error: &StageError,
) -> UnitOutcome {
    UnitOutcome {
        id: unit.id().unwrap_or_default().to_string(),
        index,
        status: UnitStatus::Failed,
        payload: stage.work.on_unit_failure(unit, error),
        error: Some(error.to_string()),
    }
}

fn completed(
    status: StageStatus,
    payload: Value,
    units: Vec<UnitOutcome>,
    error: Option<String>,
) -> StageResult {
    StageResult {
        stage: String::new(),
        status,
        payload,
        started_at: Utc::now(),
        duration_ms: 0,
        error,
        units,
        upstream_failures: Vec::new(),
    }
}

fn failed(error: &StageError) -> StageResult {
    StageResult::failed("", error)
}
