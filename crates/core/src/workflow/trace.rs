use super::dag::Pipeline;
use super::definition::PipelineArgs;
use super::step::{StepRef, StepRegistry};
use crate::error::{BuildError, BuildResult};
use crate::types::StepId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder for a step output that does not exist yet.
///
/// Tokens are plain tags: two tokens naming the same producer and output index
/// are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    producer: StepId,
    output: usize,
}

impl Token {
    pub fn new(producer: impl Into<StepId>, output: usize) -> Self {
        Self {
            producer: producer.into(),
            output,
        }
    }

    pub fn producer(&self) -> &StepId {
        &self.producer
    }

    pub fn output(&self) -> usize {
        self.output
    }
}

/// Argument passed to a traced step call
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Output of another step, wired as an edge
    Token(Token),
    /// Concrete value, recorded as a constant input
    Literal(Value),
}

impl Arg {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }
}

impl From<Token> for Arg {
    fn from(token: Token) -> Self {
        Self::Token(token)
    }
}

impl From<&Token> for Arg {
    fn from(token: &Token) -> Self {
        Self::Token(token.clone())
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

impl From<&Value> for Arg {
    fn from(value: &Value) -> Self {
        Self::Literal(value.clone())
    }
}

macro_rules! literal_arg_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Self::Literal(Value::from(value))
                }
            }
        )*
    };
}

literal_arg_from!(&str, String, bool, i32, i64, u32, u64, f64);

/// Build a `Vec<Arg>` from mixed tokens and literals
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::workflow::Arg>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        vec![$($crate::workflow::Arg::from($arg)),+]
    };
}

/// Tokens returned by a traced call, one per declared output
#[derive(Debug, Clone, PartialEq)]
pub struct Outputs {
    step: StepId,
    tokens: Vec<Token>,
}

impl Outputs {
    fn for_step(step: StepId, arity: usize) -> Self {
        let tokens = (0..arity).map(|i| Token::new(step.clone(), i)).collect();
        Self { step, tokens }
    }

    pub fn get(&self, index: usize) -> BuildResult<Token> {
        self.tokens
            .get(index)
            .cloned()
            .ok_or_else(|| BuildError::OutputIndexOutOfRange {
                step: self.step.clone(),
                index,
                arity: self.tokens.len(),
            })
    }

    /// Destructure into exactly `N` tokens
    pub fn unpack<const N: usize>(self) -> BuildResult<[Token; N]> {
        let expected = self.tokens.len();
        let step = self.step;
        self.tokens
            .try_into()
            .map_err(|_| BuildError::OutputArity {
                step,
                expected,
                got: N,
            })
    }

    /// The only output of a single-output step
    pub fn single(self) -> BuildResult<Token> {
        let [token] = self.unpack::<1>()?;
        Ok(token)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Token> {
        self.tokens.iter()
    }
}

/// Where an input slot gets its value from
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SlotSource {
    Edge(Token),
    Constant(Value),
}

/// Wiring recorded by one trace, indexed by registration position then slot
#[derive(Debug)]
pub(crate) struct Wiring {
    pub(crate) sources: Vec<Vec<Option<SlotSource>>>,
}

/// Records step calls made by a pipeline definition instead of running them
pub struct Tracer<'r> {
    registry: &'r StepRegistry,
    sources: Vec<Vec<Option<SlotSource>>>,
    invoked: Vec<bool>,
}

impl<'r> Tracer<'r> {
    pub(crate) fn new(registry: &'r StepRegistry) -> Self {
        Self {
            registry,
            sources: registry
                .steps()
                .iter()
                .map(|step| vec![None; step.inputs().len()])
                .collect(),
            invoked: vec![false; registry.len()],
        }
    }

    /// Look up a registered step by name
    pub fn step(&self, name: &str) -> BuildResult<StepRef> {
        let id = StepId::new(name);
        self.registry
            .get(&id)
            .ok_or(BuildError::UnknownStep { step: id })
    }

    /// Call a step with positional arguments
    pub fn call<I>(&mut self, step: &StepRef, args: I) -> BuildResult<Outputs>
    where
        I: IntoIterator<Item = Arg>,
    {
        self.call_with(step, args, Vec::<(&str, Arg)>::new())
    }

    /// Call a step with positional and keyword arguments
    pub fn call_with<I, K, S>(&mut self, step: &StepRef, positional: I, keyword: K) -> BuildResult<Outputs>
    where
        I: IntoIterator<Item = Arg>,
        K: IntoIterator<Item = (S, Arg)>,
        S: AsRef<str>,
    {
        let position = self.position(step.id())?;
        if self.invoked[position] {
            return Err(BuildError::DuplicateInvocation {
                step: step.id().clone(),
            });
        }

        let positional: Vec<Arg> = positional.into_iter().collect();
        let arity = self.registry.steps()[position].inputs().len();
        if positional.len() > arity {
            return Err(BuildError::TooManyArguments {
                step: step.id().clone(),
                expected: arity,
                got: positional.len(),
            });
        }

        let mut staged = Vec::with_capacity(arity);
        for (slot, arg) in positional.into_iter().enumerate() {
            staged.push((slot, self.resolve(arg)?));
        }
        for (name, arg) in keyword {
            let slot = self.slot(position, name.as_ref())?;
            staged.push((slot, self.resolve(arg)?));
        }
        self.bind_slots(position, staged)?;

        self.invoked[position] = true;
        tracing::debug!("Traced call to step {}", step.id());

        let producer = &self.registry.steps()[position];
        Ok(Outputs::for_step(producer.id().clone(), producer.outputs()))
    }

    /// Bind one input slot directly, without calling the step
    pub fn bind(&mut self, step: &StepRef, slot: &str, arg: impl Into<Arg>) -> BuildResult<()> {
        let position = self.position(step.id())?;
        let slot = self.slot(position, slot)?;
        let source = self.resolve(arg.into())?;
        self.bind_slots(position, vec![(slot, source)])
    }

    /// Token for an output of any registered step, including steps not called yet
    pub fn token(&self, step: &StepRef, output: usize) -> BuildResult<Token> {
        let token = Token::new(step.id().clone(), output);
        self.check_token(&token)?;
        Ok(token)
    }

    pub(crate) fn finish(self) -> Wiring {
        Wiring {
            sources: self.sources,
        }
    }

    fn position(&self, id: &StepId) -> BuildResult<usize> {
        self.registry
            .position(id)
            .ok_or_else(|| BuildError::UnknownStep { step: id.clone() })
    }

    fn slot(&self, position: usize, name: &str) -> BuildResult<usize> {
        let step = &self.registry.steps()[position];
        step.slot_index(name).ok_or_else(|| BuildError::UnknownSlot {
            step: step.id().clone(),
            slot: name.to_string(),
        })
    }

    fn check_token(&self, token: &Token) -> BuildResult<()> {
        let producer = self.position(token.producer())?;
        let arity = self.registry.steps()[producer].outputs();
        if token.output() >= arity {
            return Err(BuildError::OutputIndexOutOfRange {
                step: token.producer().clone(),
                index: token.output(),
                arity,
            });
        }
        Ok(())
    }

    fn resolve(&self, arg: Arg) -> BuildResult<SlotSource> {
        match arg {
            Arg::Token(token) => {
                self.check_token(&token)?;
                Ok(SlotSource::Edge(token))
            }
            Arg::Literal(value) => Ok(SlotSource::Constant(value)),
        }
    }

    /// Write staged sources only once none of them conflicts, so a rejected call binds nothing
    fn bind_slots(&mut self, position: usize, staged: Vec<(usize, SlotSource)>) -> BuildResult<()> {
        let cells = &self.sources[position];
        for (i, (slot, _)) in staged.iter().enumerate() {
            if cells[*slot].is_some() || staged[..i].iter().any(|(earlier, _)| earlier == slot) {
                let step = &self.registry.steps()[position];
                return Err(BuildError::SlotRebound {
                    step: step.id().clone(),
                    slot: step.inputs()[*slot].name.clone(),
                });
            }
        }

        for (slot, source) in staged {
            self.sources[position][slot] = Some(source);
        }
        Ok(())
    }
}

/// Trace `definition` once against `registry` and assemble the resulting pipeline.
///
/// Step bodies are never invoked here.
pub fn trace<F>(
    name: &str,
    namespace: &str,
    registry: &StepRegistry,
    args: &PipelineArgs,
    definition: F,
) -> BuildResult<Pipeline>
where
    F: FnOnce(&mut Tracer<'_>, &PipelineArgs) -> BuildResult<()>,
{
    tracing::debug!("Tracing pipeline {}/{}", namespace, name);

    let mut tracer = Tracer::new(registry);
    definition(&mut tracer, args)?;

    Pipeline::assemble(name, namespace, registry, tracer.finish())
}
