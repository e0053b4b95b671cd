//! Error types for pipeline construction and execution.

use crate::types::StepId;
use crate::workflow::executor::RunReport;

/// Result type for pipeline construction.
pub type BuildResult<T> = Result<T, BuildError>;

/// Errors detected while registering steps or tracing a pipeline definition.
///
/// Every variant is raised before any step body runs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    /// Two steps registered under the same name.
    #[error("step '{name}' is already registered")]
    DuplicateStepName { name: StepId },

    /// A step declared two input slots with the same name.
    #[error("step '{step}' declares input '{slot}' twice")]
    DuplicateSlotName { step: StepId, slot: String },

    /// The wiring closes at least one cycle.
    #[error("cyclic dependency between steps: {}", join_steps(.steps))]
    CyclicDependency { steps: Vec<StepId> },

    /// An input slot has neither a literal, a default, nor an incoming edge.
    #[error("input '{slot}' of step '{step}' is not bound")]
    UnboundInput { step: StepId, slot: String },

    /// An input slot was bound from two sources.
    #[error("input '{slot}' of step '{step}' is bound more than once")]
    SlotRebound { step: StepId, slot: String },

    /// A step was called more than once in the same trace.
    #[error("step '{step}' was invoked more than once")]
    DuplicateInvocation { step: StepId },

    /// A call or token referenced a step outside the pipeline's registry.
    #[error("step '{step}' is not registered in this pipeline")]
    UnknownStep { step: StepId },

    /// A keyword argument named a slot the step does not declare.
    #[error("step '{step}' has no input named '{slot}'")]
    UnknownSlot { step: StepId, slot: String },

    /// More positional arguments than the step has input slots.
    #[error("step '{step}' takes {expected} inputs but {got} were given")]
    TooManyArguments {
        step: StepId,
        expected: usize,
        got: usize,
    },

    /// A token referenced an output index the producer does not declare.
    #[error("step '{step}' has {arity} outputs, output {index} does not exist")]
    OutputIndexOutOfRange {
        step: StepId,
        index: usize,
        arity: usize,
    },

    /// Outputs were unpacked into the wrong number of tokens.
    #[error("step '{step}' declares {expected} outputs but {got} were unpacked")]
    OutputArity {
        step: StepId,
        expected: usize,
        got: usize,
    },

    /// A required pipeline parameter was not supplied.
    #[error("pipeline parameter '{0}' was not provided and has no default")]
    MissingParameter(String),

    /// An argument was supplied for a parameter the pipeline does not declare.
    #[error("pipeline does not declare a parameter named '{0}'")]
    UnknownParameter(String),

    /// Error raised by the definition body itself.
    #[error("pipeline definition failed: {0}")]
    Definition(String),
}

impl BuildError {
    /// Wrap an arbitrary error raised from inside a definition body.
    pub fn definition(message: impl std::fmt::Display) -> Self {
        Self::Definition(message.to_string())
    }
}

fn join_steps(steps: &[StepId]) -> String {
    steps
        .iter()
        .map(|s| s.0.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A step body failed during a run.
///
/// The run halts at the failing step. `report` holds the outputs of every step
/// that completed before it and is marked incomplete.
#[derive(Debug, thiserror::Error)]
#[error("step '{step}' failed: {source}")]
pub struct StepExecutionFailed {
    pub step: StepId,
    #[source]
    pub source: anyhow::Error,
    pub report: Box<RunReport>,
}

impl StepExecutionFailed {
    /// Partial results of the halted run.
    pub fn partial(&self) -> &RunReport {
        &self.report
    }
}

/// Any error surfaced by a pipeline invocation.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    StepExecution(#[from] StepExecutionFailed),
}

impl PipelineError {
    /// Partial run results, when the failure happened at run time.
    pub fn partial(&self) -> Option<&RunReport> {
        match self {
            Self::Build(_) => None,
            Self::StepExecution(failure) => Some(failure.partial()),
        }
    }
}
