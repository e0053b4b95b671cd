// Core engine for Stepgraph: decorator-style pipelines traced into a DAG and executed in dependency order

pub mod config;
pub mod error;
pub mod types;
pub mod workflow;

pub use config::{EngineConfig, ExecutionConfig, ExecutionMode};
pub use error::{BuildError, BuildResult, PipelineError, StepExecutionFailed};
pub use types::*;
pub use workflow::{
    define, Arg, ExecutionContext, Pipeline, PipelineArgs, PipelineDefinition, PipelineExecutor,
    RunReport, Step, StepInputs, StepRef, StepRegistry, Token, Tracer,
};
