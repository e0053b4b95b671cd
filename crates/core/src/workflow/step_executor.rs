use super::context::ExecutionContext;
use super::dag::{Pipeline, SlotBinding};
use super::step::{Step, StepInputs};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

/// Result of executing a step
#[derive(Debug)]
pub struct StepResult {
    pub outcome: Result<Vec<Value>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Runs a single step body and checks what it returned
pub struct StepExecutor;

impl StepExecutor {
    /// Collect the concrete inputs of the step at `position`
    pub(crate) fn gather_inputs(
        pipeline: &Pipeline,
        position: usize,
        ctx: &ExecutionContext,
    ) -> Result<StepInputs> {
        let step = &pipeline.steps()[position];
        let mut slots = Vec::with_capacity(step.inputs().len());

        for (slot, binding) in step.inputs().iter().zip(pipeline.slot_bindings(position)) {
            let value = match binding {
                SlotBinding::Constant(value) | SlotBinding::Default(value) => value.clone(),
                SlotBinding::Upstream { .. } => ctx
                    .get(step.id(), &slot.name)
                    .cloned()
                    .ok_or_else(|| anyhow!("input '{}' was never delivered", slot.name))?,
            };
            slots.push((slot.name.clone(), value));
        }

        Ok(StepInputs::new(slots))
    }

    /// Execute a step body. A panic inside the body is reported as a failure.
    pub fn execute(step: &Step, inputs: &StepInputs) -> StepResult {
        tracing::info!("Executing step {}", step.id());

        let started_at = Utc::now();
        let start = Instant::now();

        let outcome = match catch_unwind(AssertUnwindSafe(|| step.invoke(inputs))) {
            Ok(result) => result,
            Err(payload) => Err(anyhow!("step panicked: {}", panic_message(payload.as_ref()))),
        };

        let outcome = outcome.and_then(|outputs| {
            if outputs.len() == step.outputs() {
                Ok(outputs)
            } else {
                Err(anyhow!(
                    "step declares {} outputs but returned {}",
                    step.outputs(),
                    outputs.len()
                ))
            }
        });

        let duration = start.elapsed();
        match &outcome {
            Ok(_) => tracing::info!("Step {} completed in {:?}", step.id(), duration),
            Err(e) => tracing::error!("Step {} failed after {:?}: {:#}", step.id(), duration, e),
        }

        StepResult {
            outcome,
            started_at,
            completed_at: Utc::now(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
