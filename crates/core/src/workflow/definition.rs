use super::context::ExecutionContext;
use super::dag::Pipeline;
use super::executor::{PipelineExecutor, RunReport};
use super::step::StepRegistry;
use super::trace::{trace, Tracer};
use crate::config::{ExecutionConfig, ExecutionMode};
use crate::error::{BuildError, BuildResult, PipelineError};
use serde_json::Value;
use std::sync::Arc;

type DefinitionFn = dyn Fn(&mut Tracer<'_>, &PipelineArgs) -> BuildResult<()> + Send + Sync;

/// Named literal arguments of a pipeline invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineArgs {
    values: Vec<(String, Value)>,
}

impl PipelineArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an argument
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = value,
            None => self.values.push((name, value)),
        }
    }

    /// Read an argument inside a definition body
    pub fn get(&self, name: &str) -> BuildResult<&Value> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
            .ok_or_else(|| BuildError::MissingParameter(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A declared pipeline parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub default: Option<Value>,
}

/// Start declaring a pipeline with the given identity
pub fn define(name: impl Into<String>, namespace: impl Into<String>) -> DefinitionBuilder {
    DefinitionBuilder {
        name: name.into(),
        namespace: namespace.into(),
        registry: StepRegistry::new(),
        params: Vec::new(),
        config: ExecutionConfig::default(),
    }
}

/// Collects everything a [`PipelineDefinition`] needs before its body is attached
pub struct DefinitionBuilder {
    name: String,
    namespace: String,
    registry: StepRegistry,
    params: Vec<Parameter>,
    config: ExecutionConfig,
}

impl DefinitionBuilder {
    /// Steps the definition body may call
    pub fn steps(mut self, registry: StepRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Declare a required parameter
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Parameter {
            name: name.into(),
            default: None,
        });
        self
    }

    pub fn param_with_default(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.params.push(Parameter {
            name: name.into(),
            default: Some(default.into()),
        });
        self
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach the definition body
    pub fn body<F>(self, definition: F) -> PipelineDefinition
    where
        F: Fn(&mut Tracer<'_>, &PipelineArgs) -> BuildResult<()> + Send + Sync + 'static,
    {
        PipelineDefinition {
            name: self.name,
            namespace: self.namespace,
            registry: self.registry,
            params: self.params,
            config: self.config,
            definition: Arc::new(definition),
            executor: PipelineExecutor::new(),
        }
    }
}

/// Reusable pipeline: every invocation retraces the body and runs a fresh context
pub struct PipelineDefinition {
    name: String,
    namespace: String,
    registry: StepRegistry,
    params: Vec<Parameter>,
    config: ExecutionConfig,
    definition: Arc<DefinitionFn>,
    executor: PipelineExecutor,
}

impl PipelineDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Trace the body with `args` and return the validated graph
    pub fn build(&self, args: &PipelineArgs) -> BuildResult<Pipeline> {
        let args = self.resolve_args(args)?;
        trace(&self.name, &self.namespace, &self.registry, &args, |tracer, args| {
            (self.definition)(tracer, args)
        })
    }

    /// Build, then run every step sequentially
    pub fn invoke(&self, args: &PipelineArgs) -> Result<RunReport, PipelineError> {
        let pipeline = self.build(args)?;
        let report = self.executor.run(&pipeline, &mut ExecutionContext::new())?;
        Ok(report)
    }

    /// Build, then run using the configured execution mode
    pub async fn invoke_async(&self, args: &PipelineArgs) -> Result<RunReport, PipelineError> {
        let pipeline = self.build(args)?;
        let mut ctx = ExecutionContext::new();

        let report = match self.config.mode {
            ExecutionMode::Sequential => self.executor.run(&pipeline, &mut ctx)?,
            ExecutionMode::Concurrent => {
                self.executor
                    .run_concurrent(&pipeline, &mut ctx, self.config.max_concurrency)
                    .await?
            }
        };
        Ok(report)
    }

    /// Merge supplied arguments with declared defaults
    fn resolve_args(&self, supplied: &PipelineArgs) -> BuildResult<PipelineArgs> {
        if let Some((unknown, _)) = supplied
            .iter()
            .find(|(name, _)| !self.params.iter().any(|p| p.name == *name))
        {
            return Err(BuildError::UnknownParameter(unknown.to_string()));
        }

        let mut resolved = PipelineArgs::new();
        for param in &self.params {
            let value = match supplied.get(&param.name) {
                Ok(value) => value.clone(),
                Err(_) => param
                    .default
                    .clone()
                    .ok_or_else(|| BuildError::MissingParameter(param.name.clone()))?,
            };
            resolved.set(param.name.clone(), value);
        }

        Ok(resolved)
    }
}

impl std::fmt::Debug for PipelineDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDefinition")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("steps", &self.registry.len())
            .field("params", &self.params)
            .field("config", &self.config)
            .finish()
    }
}
