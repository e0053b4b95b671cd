use super::context::ExecutionContext;
use super::dag::Pipeline;
use super::step_executor::{StepExecutor, StepResult};
use crate::error::StepExecutionFailed;
use crate::types::{RunId, RunStatus, StepExecution, StepId, StepStatus};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use tokio::task::JoinSet;

/// Outcome of one pipeline run: outputs per step plus execution records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline: String,
    pub namespace: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// One record per step, in topological order
    pub steps: Vec<StepExecution>,
    /// Values produced by every completed step
    pub outputs: BTreeMap<StepId, Vec<Value>>,
}

impl RunReport {
    fn start(pipeline: &Pipeline, order: &[usize]) -> Self {
        Self {
            run_id: RunId::new(),
            pipeline: pipeline.name().to_string(),
            namespace: pipeline.namespace().to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            steps: order
                .iter()
                .map(|&p| StepExecution::pending(pipeline.steps()[p].id().clone()))
                .collect(),
            outputs: BTreeMap::new(),
        }
    }

    /// False for a run halted by a failing step
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// All outputs of a step
    pub fn output(&self, step: &str) -> Option<&[Value]> {
        self.outputs.get(&StepId::new(step)).map(Vec::as_slice)
    }

    /// The output of a single-output step
    pub fn value(&self, step: &str) -> Option<&Value> {
        match self.output(step) {
            Some([value]) => Some(value),
            _ => None,
        }
    }

    pub fn execution(&self, step: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|e| e.step.0 == step)
    }

    /// Steps that completed, in the order they are recorded
    pub fn completed_steps(&self) -> Vec<&StepId> {
        self.steps
            .iter()
            .filter(|e| e.status == StepStatus::Completed)
            .map(|e| &e.step)
            .collect()
    }

    fn finish(&mut self, status: RunStatus) {
        for exec in &mut self.steps {
            match exec.status {
                StepStatus::Pending => exec.status = StepStatus::Skipped,
                StepStatus::Running => {
                    exec.status = StepStatus::Failed;
                    exec.completed_at = Some(Utc::now());
                    exec.error.get_or_insert_with(|| "step did not finish".to_string());
                }
                _ => {}
            }
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

/// Executes a built pipeline, routing outputs along its edges
#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineExecutor;

impl PipelineExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run every step once, one at a time, in topological order.
    ///
    /// `ctx` must be fresh: a value already bound to any step input fails the
    /// run before any step executes.
    pub fn run(
        &self,
        pipeline: &Pipeline,
        ctx: &mut ExecutionContext,
    ) -> Result<RunReport, StepExecutionFailed> {
        let order = pipeline.execution_order();
        let mut report = reject_stale_context(pipeline, ctx, &order)?;

        tracing::info!(
            "Starting pipeline run: pipeline={}/{}, run_id={}",
            pipeline.namespace(),
            pipeline.name(),
            report.run_id
        );

        for (record, &position) in order.iter().enumerate() {
            let step = &pipeline.steps()[position];
            report.steps[record].status = StepStatus::Running;

            let result = match StepExecutor::gather_inputs(pipeline, position, ctx) {
                Ok(inputs) => StepExecutor::execute(step, &inputs),
                Err(e) => failed_before_start(e),
            };

            if let Err(failure) = record_result(pipeline, ctx, &mut report, record, position, result) {
                return Err(halt(report, step.id().clone(), failure));
            }
        }

        report.finish(RunStatus::Completed);
        tracing::info!("Pipeline run completed: run_id={}", report.run_id);

        Ok(report)
    }

    /// Run mutually independent steps in parallel on blocking tasks.
    ///
    /// A step is dispatched once every incoming edge has delivered its value.
    /// At most `max_concurrency` steps run at once; runnable steps are
    /// dispatched in registration order. `ctx` must be fresh, as for [`Self::run`].
    pub async fn run_concurrent(
        &self,
        pipeline: &Pipeline,
        ctx: &mut ExecutionContext,
        max_concurrency: usize,
    ) -> Result<RunReport, StepExecutionFailed> {
        let max_concurrency = max_concurrency.max(1);
        let order = pipeline.execution_order();
        let records: HashMap<usize, usize> =
            order.iter().enumerate().map(|(r, &p)| (p, r)).collect();
        let mut report = reject_stale_context(pipeline, ctx, &order)?;

        tracing::info!(
            "Starting concurrent pipeline run: pipeline={}/{}, run_id={}, max_concurrency={}",
            pipeline.namespace(),
            pipeline.name(),
            report.run_id,
            max_concurrency
        );

        let mut remaining = pipeline.in_degrees();
        let mut ready: BinaryHeap<Reverse<usize>> = remaining
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree == 0)
            .map(|(position, _)| Reverse(position))
            .collect();

        let mut in_flight: JoinSet<(usize, StepResult)> = JoinSet::new();
        let mut failure: Option<(StepId, anyhow::Error)> = None;

        loop {
            while failure.is_none() && in_flight.len() < max_concurrency {
                let Some(Reverse(position)) = ready.pop() else {
                    break;
                };
                let step = pipeline.steps()[position].clone();
                report.steps[records[&position]].status = StepStatus::Running;

                match StepExecutor::gather_inputs(pipeline, position, ctx) {
                    Ok(inputs) => {
                        in_flight.spawn_blocking(move || {
                            let result = StepExecutor::execute(&step, &inputs);
                            (position, result)
                        });
                    }
                    Err(e) => {
                        let result = failed_before_start(e);
                        if let Err(e) =
                            record_result(pipeline, ctx, &mut report, records[&position], position, result)
                        {
                            failure = Some((step.id().clone(), e));
                        }
                    }
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };

            match joined {
                Ok((position, result)) => {
                    let record = records[&position];
                    match record_result(pipeline, ctx, &mut report, record, position, result) {
                        Ok(()) => {
                            for (consumer, _) in pipeline.downstream(position) {
                                remaining[consumer] -= 1;
                                if remaining[consumer] == 0 {
                                    ready.push(Reverse(consumer));
                                }
                            }
                        }
                        Err(e) => {
                            if failure.is_none() {
                                failure = Some((pipeline.steps()[position].id().clone(), e));
                            } else {
                                tracing::warn!(
                                    "Step {} also failed while draining: {:#}",
                                    pipeline.steps()[position].id(),
                                    e
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Step task did not finish: {}", e);
                    if failure.is_none() {
                        failure = Some((
                            StepId::new("<unknown>"),
                            anyhow!("step task did not finish: {}", e),
                        ));
                    }
                }
            }
        }

        if let Some((step, error)) = failure {
            return Err(halt(report, step, error));
        }

        report.finish(RunStatus::Completed);
        tracing::info!("Pipeline run completed: run_id={}", report.run_id);

        Ok(report)
    }
}

/// Start a report, failing on the first step whose inputs were bound by an earlier run
fn reject_stale_context(
    pipeline: &Pipeline,
    ctx: &ExecutionContext,
    order: &[usize],
) -> Result<RunReport, StepExecutionFailed> {
    let mut report = RunReport::start(pipeline, order);

    for (record, &position) in order.iter().enumerate() {
        let step = &pipeline.steps()[position];
        if let Some(slot) = step
            .inputs()
            .iter()
            .find(|slot| ctx.get(step.id(), &slot.name).is_some())
        {
            let error = anyhow!(
                "input '{}' of step '{}' was bound before the run started; runs need a fresh execution context",
                slot.name,
                step.id()
            );
            let exec = &mut report.steps[record];
            exec.status = StepStatus::Failed;
            exec.error = Some(error.to_string());
            return Err(halt(report, step.id().clone(), error));
        }
    }

    Ok(report)
}

fn failed_before_start(error: anyhow::Error) -> StepResult {
    let now = Utc::now();
    StepResult {
        outcome: Err(error),
        started_at: now,
        completed_at: now,
    }
}

/// Store a step result in the report and deliver its outputs downstream
fn record_result(
    pipeline: &Pipeline,
    ctx: &mut ExecutionContext,
    report: &mut RunReport,
    record: usize,
    position: usize,
    result: StepResult,
) -> Result<()> {
    let exec = &mut report.steps[record];
    exec.started_at = Some(result.started_at);
    exec.completed_at = Some(result.completed_at);

    let delivered = result
        .outcome
        .and_then(|outputs| deliver(pipeline, ctx, position, &outputs).map(|()| outputs));

    match delivered {
        Ok(outputs) => {
            exec.status = StepStatus::Completed;
            report
                .outputs
                .insert(pipeline.steps()[position].id().clone(), outputs);
            Ok(())
        }
        Err(e) => {
            exec.status = StepStatus::Failed;
            exec.error = Some(format!("{:#}", e));
            Err(e)
        }
    }
}

fn deliver(
    pipeline: &Pipeline,
    ctx: &mut ExecutionContext,
    position: usize,
    outputs: &[Value],
) -> Result<()> {
    for (consumer, wire) in pipeline.downstream(position) {
        let consumer = &pipeline.steps()[consumer];
        let slot = &consumer.inputs()[wire.slot].name;
        tracing::debug!(
            "Delivering {}[{}] to {}.{}",
            pipeline.steps()[position].id(),
            wire.output,
            consumer.id(),
            slot
        );
        ctx.bind(consumer.id(), slot, outputs[wire.output].clone())?;
    }
    Ok(())
}

fn halt(mut report: RunReport, step: StepId, source: anyhow::Error) -> StepExecutionFailed {
    report.finish(RunStatus::Failed);

    let skipped = report
        .steps
        .iter()
        .filter(|e| e.status == StepStatus::Skipped)
        .count();
    tracing::error!(
        "Pipeline run failed: run_id={}, step={}, skipped={}",
        report.run_id,
        step,
        skipped
    );

    StepExecutionFailed {
        step,
        source,
        report: Box::new(report),
    }
}
