use crate::error::{BuildError, BuildResult};
use crate::types::StepId;
use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;

/// User function executed for a step: receives the bound inputs, returns one value per declared output
pub type StepBody = Arc<dyn Fn(&StepInputs) -> anyhow::Result<Vec<Value>> + Send + Sync>;

/// A named input parameter of a step
#[derive(Debug, Clone, PartialEq)]
pub struct InputSlot {
    pub name: String,
    /// Used when the slot is left unbound by the pipeline definition
    pub default: Option<Value>,
}

/// A named unit of work wrapping an opaque user function
pub struct Step {
    id: StepId,
    inputs: Vec<InputSlot>,
    outputs: usize,
    body: StepBody,
}

impl Step {
    /// Start describing a step. Steps have no inputs and one output until told otherwise.
    pub fn builder(name: impl Into<String>) -> StepBuilder {
        StepBuilder {
            id: StepId::new(name),
            inputs: Vec::new(),
            outputs: 1,
        }
    }

    pub fn id(&self) -> &StepId {
        &self.id
    }

    pub fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    /// Declared output arity
    pub fn outputs(&self) -> usize {
        self.outputs
    }

    /// Position of the named input slot
    pub fn slot_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|slot| slot.name == name)
    }

    pub(crate) fn invoke(&self, inputs: &StepInputs) -> anyhow::Result<Vec<Value>> {
        (self.body)(inputs)
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Step`]; finished by supplying the body
pub struct StepBuilder {
    id: StepId,
    inputs: Vec<InputSlot>,
    outputs: usize,
}

impl StepBuilder {
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(InputSlot {
            name: name.into(),
            default: None,
        });
        self
    }

    pub fn inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self = self.input(name);
        }
        self
    }

    pub fn input_with_default(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.inputs.push(InputSlot {
            name: name.into(),
            default: Some(default.into()),
        });
        self
    }

    pub fn outputs(mut self, arity: usize) -> Self {
        self.outputs = arity;
        self
    }

    pub fn body<F>(self, body: F) -> Step
    where
        F: Fn(&StepInputs) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        Step {
            id: self.id,
            inputs: self.inputs,
            outputs: self.outputs,
            body: Arc::new(body),
        }
    }
}

/// Concrete input values handed to a step body, in slot order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInputs {
    slots: Vec<(String, Value)>,
}

impl StepInputs {
    pub(crate) fn new(slots: Vec<(String, Value)>) -> Self {
        Self { slots }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.slots
            .iter()
            .find(|(slot, _)| slot == name)
            .map(|(_, value)| value)
    }

    /// Like [`get`](Self::get) but fails the step when the slot is absent
    pub fn require(&self, name: &str) -> anyhow::Result<&Value> {
        self.get(name)
            .ok_or_else(|| anyhow!("input '{}' is not bound", name))
    }

    /// Deserialize the named input into a concrete type
    pub fn parse<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self.require(name)?.clone();
        serde_json::from_value(value).with_context(|| format!("input '{}' has the wrong type", name))
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.slots.get(index).map(|(_, value)| value)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.slots.iter().map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Shared handle to a registered step, used to call it from a definition body
#[derive(Debug, Clone)]
pub struct StepRef(Arc<Step>);

impl Deref for StepRef {
    type Target = Step;

    fn deref(&self) -> &Step {
        &self.0
    }
}

/// Steps belonging to one pipeline definition, in registration order
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: Vec<Arc<Step>>,
    index: HashMap<StepId, usize>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step under its name
    pub fn register(&mut self, step: Step) -> BuildResult<StepRef> {
        if self.index.contains_key(step.id()) {
            return Err(BuildError::DuplicateStepName {
                name: step.id().clone(),
            });
        }

        let mut seen = HashSet::new();
        for slot in step.inputs() {
            if !seen.insert(slot.name.as_str()) {
                return Err(BuildError::DuplicateSlotName {
                    step: step.id().clone(),
                    slot: slot.name.clone(),
                });
            }
        }

        tracing::debug!(
            "Registered step {} ({} inputs, {} outputs)",
            step.id(),
            step.inputs().len(),
            step.outputs()
        );

        let step = Arc::new(step);
        self.index.insert(step.id().clone(), self.steps.len());
        self.steps.push(step.clone());

        Ok(StepRef(step))
    }

    /// Registration position of a step
    pub fn position(&self, id: &StepId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &StepId) -> Option<StepRef> {
        self.position(id).map(|i| StepRef(self.steps[i].clone()))
    }

    pub fn steps(&self) -> &[Arc<Step>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(name: &str) -> Step {
        Step::builder(name).outputs(0).body(|_| Ok(vec![]))
    }

    #[test]
    fn test_builder_records_signature() {
        let step = Step::builder("second_step")
            .inputs(["b", "c"])
            .input_with_default("sep", " ")
            .outputs(0)
            .body(|_| Ok(vec![]));

        assert_eq!(step.id().as_str(), "second_step");
        assert_eq!(step.inputs().len(), 3);
        assert_eq!(step.outputs(), 0);
        assert_eq!(step.slot_index("c"), Some(1));
        assert_eq!(step.inputs()[2].default, Some(json!(" ")));
        assert_eq!(step.slot_index("missing"), None);
    }

    #[test]
    fn test_duplicate_step_name_rejected() {
        let mut registry = StepRegistry::new();
        registry.register(noop("my_step")).unwrap();

        let err = registry.register(noop("my_step")).unwrap_err();
        assert_eq!(
            err,
            BuildError::DuplicateStepName {
                name: StepId::new("my_step")
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_slot_name_rejected() {
        let mut registry = StepRegistry::new();
        let step = Step::builder("twice").inputs(["a", "a"]).body(|_| Ok(vec![]));

        let err = registry.register(step).unwrap_err();
        assert!(matches!(err, BuildError::DuplicateSlotName { .. }));
    }

    #[test]
    fn test_registration_order_preserved() {
        let mut registry = StepRegistry::new();
        registry.register(noop("c")).unwrap();
        registry.register(noop("a")).unwrap();
        registry.register(noop("b")).unwrap();

        let names: Vec<&str> = registry.steps().iter().map(|s| s.id().as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert_eq!(registry.position(&StepId::new("a")), Some(1));
    }

    #[test]
    fn test_registries_are_independent() {
        let mut first = StepRegistry::new();
        let mut second = StepRegistry::new();

        first.register(noop("shared")).unwrap();
        assert!(second.register(noop("shared")).is_ok());
    }

    #[test]
    fn test_step_inputs_lookup() {
        let inputs = StepInputs::new(vec![
            ("b".to_string(), json!("Some")),
            ("c".to_string(), json!(3)),
        ]);

        assert_eq!(inputs.get("b"), Some(&json!("Some")));
        assert_eq!(inputs.value(1), Some(&json!(3)));
        assert_eq!(inputs.parse::<i64>("c").unwrap(), 3);
        assert!(inputs.parse::<String>("c").is_err());
        assert!(inputs.require("d").is_err());
    }
}
