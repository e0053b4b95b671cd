use crate::types::StepId;
use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Per-run store of values delivered to step input slots.
///
/// Each `(step, slot)` cell is written at most once.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    bindings: HashMap<(StepId, String), Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a value into an input slot
    pub fn bind(&mut self, step: &StepId, slot: &str, value: Value) -> Result<()> {
        let key = (step.clone(), slot.to_string());
        if self.bindings.contains_key(&key) {
            bail!("input '{}' of step '{}' was already delivered", slot, step);
        }
        self.bindings.insert(key, value);
        Ok(())
    }

    pub fn get(&self, step: &StepId, slot: &str) -> Option<&Value> {
        self.bindings.get(&(step.clone(), slot.to_string()))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
