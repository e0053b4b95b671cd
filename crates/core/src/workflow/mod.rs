// Step-graph pipelines: registration, tracing, DAG assembly and execution

pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod step;
pub mod step_executor;
pub mod trace;

pub use context::ExecutionContext;
pub use dag::{Edge, Pipeline, PipelineShape, SlotShape};
pub use definition::{define, DefinitionBuilder, Parameter, PipelineArgs, PipelineDefinition};
pub use executor::{PipelineExecutor, RunReport};
pub use step::{InputSlot, Step, StepBuilder, StepInputs, StepRef, StepRegistry};
pub use step_executor::{StepExecutor, StepResult};
pub use trace::{trace, Arg, Outputs, Token, Tracer};
