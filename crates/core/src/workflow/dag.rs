use super::step::{Step, StepRegistry};
use super::trace::{SlotSource, Wiring};
use crate::error::{BuildError, BuildResult};
use crate::types::StepId;
use anyhow::{anyhow, Result};
use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;

/// Data dependency: `consumer.slot` receives output `output` of `producer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub producer: StepId,
    pub output: usize,
    pub consumer: StepId,
    pub slot: String,
}

/// Edge weight: producer output index and consumer slot index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Wire {
    pub(crate) output: usize,
    pub(crate) slot: usize,
}

/// Resolved source of one input slot
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SlotBinding {
    /// Delivered at run time by an upstream step
    Upstream { producer: usize, output: usize },
    /// Literal from the definition body
    Constant(Value),
    /// Default declared on the step
    Default(Value),
}

/// Structural fingerprint of a pipeline, independent of literal values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineShape {
    pub steps: Vec<(StepId, Vec<SlotShape>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotShape {
    Upstream { producer: StepId, output: usize },
    Constant,
    Default,
}

/// DAG of steps produced by tracing a pipeline definition
pub struct Pipeline {
    name: String,
    namespace: String,
    steps: Vec<Arc<Step>>,
    slots: Vec<Vec<SlotBinding>>,
    graph: DiGraph<usize, Wire>,
    step_indices: HashMap<StepId, usize>,
}

impl Pipeline {
    /// Validate recorded wiring and build the graph
    pub(crate) fn assemble(
        name: &str,
        namespace: &str,
        registry: &StepRegistry,
        wiring: Wiring,
    ) -> BuildResult<Self> {
        let steps = registry.steps().to_vec();
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        // Node index equals registration position
        for (position, step) in steps.iter().enumerate() {
            graph.add_node(position);
            step_indices.insert(step.id().clone(), position);
        }

        let mut sources = Vec::with_capacity(steps.len());
        for (position, step_sources) in wiring.sources.into_iter().enumerate() {
            let mut resolved = Vec::with_capacity(step_sources.len());
            for (slot, source) in step_sources.into_iter().enumerate() {
                let binding = match source {
                    Some(SlotSource::Edge(token)) => {
                        let producer = *step_indices.get(token.producer()).ok_or_else(|| {
                            BuildError::UnknownStep {
                                step: token.producer().clone(),
                            }
                        })?;
                        graph.add_edge(
                            NodeIndex::new(producer),
                            NodeIndex::new(position),
                            Wire {
                                output: token.output(),
                                slot,
                            },
                        );
                        Some(SlotBinding::Upstream {
                            producer,
                            output: token.output(),
                        })
                    }
                    Some(SlotSource::Constant(value)) => Some(SlotBinding::Constant(value)),
                    None => steps[position].inputs()[slot]
                        .default
                        .clone()
                        .map(SlotBinding::Default),
                };
                resolved.push(binding);
            }
            sources.push(resolved);
        }

        let cyclic = cyclic_steps(&graph);
        if !cyclic.is_empty() {
            return Err(BuildError::CyclicDependency {
                steps: cyclic.into_iter().map(|p| steps[p].id().clone()).collect(),
            });
        }

        let mut slots = Vec::with_capacity(steps.len());
        for (position, step_slots) in sources.into_iter().enumerate() {
            let mut bound = Vec::with_capacity(step_slots.len());
            for (slot, binding) in step_slots.into_iter().enumerate() {
                let binding = binding.ok_or_else(|| BuildError::UnboundInput {
                    step: steps[position].id().clone(),
                    slot: steps[position].inputs()[slot].name.clone(),
                })?;
                bound.push(binding);
            }
            slots.push(bound);
        }

        tracing::debug!(
            "Built pipeline {}/{}: {} steps, {} edges",
            namespace,
            name,
            steps.len(),
            graph.edge_count()
        );

        Ok(Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            steps,
            slots,
            graph,
            step_indices,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Steps in registration order
    pub fn steps(&self) -> &[Arc<Step>] {
        &self.steps
    }

    pub fn step(&self, step_id: &StepId) -> Option<&Arc<Step>> {
        self.step_indices.get(step_id).map(|&i| &self.steps[i])
    }

    /// All data dependencies, ordered by consumer then slot
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        for (consumer, slots) in self.slots.iter().enumerate() {
            for (slot, binding) in slots.iter().enumerate() {
                if let SlotBinding::Upstream { producer, output } = binding {
                    edges.push(Edge {
                        producer: self.steps[*producer].id().clone(),
                        output: *output,
                        consumer: self.steps[consumer].id().clone(),
                        slot: self.steps[consumer].inputs()[slot].name.clone(),
                    });
                }
            }
        }
        edges
    }

    /// Constant inputs (literals and defaults) as `(step, slot, value)`
    pub fn constants(&self) -> Vec<(StepId, String, Value)> {
        let mut constants = Vec::new();
        for (position, slots) in self.slots.iter().enumerate() {
            for (slot, binding) in slots.iter().enumerate() {
                if let SlotBinding::Constant(value) | SlotBinding::Default(value) = binding {
                    constants.push((
                        self.steps[position].id().clone(),
                        self.steps[position].inputs()[slot].name.clone(),
                        value.clone(),
                    ));
                }
            }
        }
        constants
    }

    /// Get steps in topological order (dependencies first, ties by registration order)
    pub fn topological_order(&self) -> Vec<StepId> {
        self.execution_order()
            .into_iter()
            .map(|p| self.steps[p].id().clone())
            .collect()
    }

    /// Get dependencies for a step
    pub fn dependencies(&self, step_id: &StepId) -> Result<Vec<StepId>> {
        self.neighbors(step_id, Direction::Incoming)
    }

    /// Get steps that depend on the given step
    pub fn dependents(&self, step_id: &StepId) -> Result<Vec<StepId>> {
        self.neighbors(step_id, Direction::Outgoing)
    }

    /// Get all steps with no dependencies (can start immediately)
    pub fn entry_steps(&self) -> Vec<StepId> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .count()
                    == 0
            })
            .map(|n| self.steps[self.graph[n]].id().clone())
            .collect()
    }

    /// Structure of the pipeline without literal values
    pub fn shape(&self) -> PipelineShape {
        let steps = self
            .steps
            .iter()
            .zip(&self.slots)
            .map(|(step, slots)| {
                let slots = slots
                    .iter()
                    .map(|binding| match binding {
                        SlotBinding::Upstream { producer, output } => SlotShape::Upstream {
                            producer: self.steps[*producer].id().clone(),
                            output: *output,
                        },
                        SlotBinding::Constant(_) => SlotShape::Constant,
                        SlotBinding::Default(_) => SlotShape::Default,
                    })
                    .collect();
                (step.id().clone(), slots)
            })
            .collect();

        PipelineShape { steps }
    }

    /// Graphviz rendering, edges labelled `output -> slot`
    pub fn to_dot(&self) -> String {
        let labelled = self.graph.map(
            |_, &position| self.steps[position].id().0.clone(),
            |edge, wire| {
                let (_, consumer) = self.graph.edge_endpoints(edge).unwrap_or_default();
                let consumer = &self.steps[self.graph[consumer]];
                format!("{} -> {}", wire.output, consumer.inputs()[wire.slot].name)
            },
        );
        format!("{}", Dot::new(&labelled))
    }

    /// Kahn's algorithm over registration positions, ties broken by registration order
    pub(crate) fn execution_order(&self) -> Vec<usize> {
        let mut remaining = self.in_degrees();
        let mut ready: BinaryHeap<Reverse<usize>> = remaining
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree == 0)
            .map(|(position, _)| Reverse(position))
            .collect();

        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(Reverse(position)) = ready.pop() {
            order.push(position);
            for (consumer, _) in self.downstream(position) {
                remaining[consumer] -= 1;
                if remaining[consumer] == 0 {
                    ready.push(Reverse(consumer));
                }
            }
        }

        order
    }

    /// Number of incoming edges per step, counting each wired slot once
    pub(crate) fn in_degrees(&self) -> Vec<usize> {
        self.graph
            .node_indices()
            .map(|n| self.graph.edges_directed(n, Direction::Incoming).count())
            .collect()
    }

    /// Outgoing wires of a step as `(consumer position, wire)`
    pub(crate) fn downstream(&self, position: usize) -> Vec<(usize, Wire)> {
        self.graph
            .edges_directed(NodeIndex::new(position), Direction::Outgoing)
            .map(|edge| (self.graph[edge.target()], *edge.weight()))
            .collect()
    }

    pub(crate) fn slot_bindings(&self, position: usize) -> &[SlotBinding] {
        &self.slots[position]
    }

    fn neighbors(&self, step_id: &StepId, direction: Direction) -> Result<Vec<StepId>> {
        let position = self
            .step_indices
            .get(step_id)
            .ok_or_else(|| anyhow!("Step {} not found", step_id))?;

        let positions: BTreeSet<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(*position), direction)
            .map(|n| self.graph[n])
            .collect();

        Ok(positions
            .into_iter()
            .map(|p| self.steps[p].id().clone())
            .collect())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("steps", &self.steps.len())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}

/// Registration positions of every step that lies on a cycle, sorted
fn cyclic_steps(graph: &DiGraph<usize, Wire>) -> Vec<usize> {
    let mut cyclic = BTreeSet::new();
    for component in petgraph::algo::tarjan_scc(graph) {
        let on_cycle = component.len() > 1
            || component
                .first()
                .is_some_and(|&n| graph.contains_edge(n, n));
        if on_cycle {
            cyclic.extend(component.into_iter().map(|n| graph[n]));
        }
    }
    cyclic.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::workflow::definition::PipelineArgs;
    use crate::workflow::step::{Step, StepRef};
    use crate::workflow::trace::{trace, Token, Tracer};
    use serde_json::json;

    fn passthrough(name: &str, inputs: &[&str], outputs: usize) -> Step {
        Step::builder(name)
            .inputs(inputs.iter().copied())
            .outputs(outputs)
            .body(|_| Ok(vec![]))
    }

    fn build<F>(registry: &StepRegistry, definition: F) -> BuildResult<Pipeline>
    where
        F: FnOnce(&mut Tracer<'_>, &PipelineArgs) -> BuildResult<()>,
    {
        trace("test", "unit", registry, &PipelineArgs::new(), definition)
    }

    fn linear() -> (StepRegistry, Vec<StepRef>) {
        let mut registry = StepRegistry::new();
        let refs = vec![
            registry.register(passthrough("step1", &[], 1)).unwrap(),
            registry.register(passthrough("step2", &["x"], 1)).unwrap(),
            registry.register(passthrough("step3", &["x"], 1)).unwrap(),
        ];
        (registry, refs)
    }

    #[test]
    fn test_linear_dag() {
        let (registry, s) = linear();
        let pipeline = build(&registry, |t, _| {
            let a = t.call(&s[0], args![])?.single()?;
            let b = t.call(&s[1], args![a])?.single()?;
            t.call(&s[2], args![b])?;
            Ok(())
        })
        .unwrap();

        let order = pipeline.topological_order();
        assert_eq!(order.len(), 3);
        assert_eq!(order[0].0, "step1");
        assert_eq!(order[1].0, "step2");
        assert_eq!(order[2].0, "step3");
        assert_eq!(pipeline.edges().len(), 2);
    }

    #[test]
    fn test_parallel_dag() {
        let mut registry = StepRegistry::new();
        let s1 = registry.register(passthrough("step1", &[], 1)).unwrap();
        let s2 = registry.register(passthrough("step2", &[], 1)).unwrap();
        let s3 = registry.register(passthrough("step3", &["a", "b"], 1)).unwrap();
        let s4 = registry.register(passthrough("step4", &["x"], 0)).unwrap();

        let pipeline = build(&registry, |t, _| {
            let a = t.call(&s1, args![])?.single()?;
            let b = t.call(&s2, args![])?.single()?;
            let c = t.call(&s3, args![a, b])?.single()?;
            t.call(&s4, args![c])?;
            Ok(())
        })
        .unwrap();

        // step1 and step2 can start in parallel
        let entry = pipeline.entry_steps();
        assert_eq!(entry, vec![StepId::new("step1"), StepId::new("step2")]);

        let deps = pipeline.dependencies(&StepId::new("step3")).unwrap();
        assert_eq!(deps.len(), 2);
        assert_eq!(
            pipeline.dependents(&StepId::new("step3")).unwrap(),
            vec![StepId::new("step4")]
        );
        assert!(pipeline.dependencies(&StepId::new("missing")).is_err());
    }

    #[test]
    fn test_ties_follow_registration_order() {
        let mut registry = StepRegistry::new();
        let root = registry.register(passthrough("root", &[], 1)).unwrap();
        let late = registry.register(passthrough("zeta", &["x"], 0)).unwrap();
        let early = registry.register(passthrough("alpha", &["x"], 0)).unwrap();

        // Called in the opposite order to registration
        let pipeline = build(&registry, |t, _| {
            let r = t.call(&root, args![])?.single()?;
            t.call(&early, args![&r])?;
            t.call(&late, args![r])?;
            Ok(())
        })
        .unwrap();

        assert_eq!(
            pipeline.topological_order(),
            vec![StepId::new("root"), StepId::new("zeta"), StepId::new("alpha")]
        );
    }

    #[test]
    fn test_cyclic_dag_rejected() {
        let mut registry = StepRegistry::new();
        let a = registry.register(passthrough("a", &["x"], 1)).unwrap();
        let b = registry.register(passthrough("b", &["x"], 1)).unwrap();
        let free = registry.register(passthrough("free", &[], 1)).unwrap();

        let result = build(&registry, |t, _| {
            let forward = t.token(&b, 0)?;
            let out_a = t.call(&a, args![forward])?.single()?;
            t.call(&b, args![out_a])?;
            t.call(&free, args![])?;
            Ok(())
        });

        let err = result.unwrap_err();
        assert_eq!(
            err,
            BuildError::CyclicDependency {
                steps: vec![StepId::new("a"), StepId::new("b")]
            }
        );
        assert!(err.to_string().contains("cyclic dependency"));
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut registry = StepRegistry::new();
        let a = registry.register(passthrough("a", &["x"], 1)).unwrap();

        let err = build(&registry, |t, _| {
            let own = Token::new("a", 0);
            t.call(&a, args![own])?;
            Ok(())
        })
        .unwrap_err();

        assert_eq!(
            err,
            BuildError::CyclicDependency {
                steps: vec![StepId::new("a")]
            }
        );
    }

    #[test]
    fn test_unbound_input_rejected() {
        let (registry, s) = linear();
        let err = build(&registry, |t, _| {
            t.call(&s[0], args![])?;
            t.call(&s[1], args![])?;
            Ok(())
        })
        .unwrap_err();

        // step2 was called without its input, step3 never called at all
        assert_eq!(
            err,
            BuildError::UnboundInput {
                step: StepId::new("step2"),
                slot: "x".to_string()
            }
        );
    }

    #[test]
    fn test_default_used_only_when_unbound() {
        let mut registry = StepRegistry::new();
        let step = registry
            .register(
                Step::builder("greet")
                    .input("name")
                    .input_with_default("greeting", "hello")
                    .body(|_| Ok(vec![json!(null)])),
            )
            .unwrap();

        let defaulted = build(&registry, |t, _| {
            t.call(&step, args!["ada"])?;
            Ok(())
        })
        .unwrap();
        let overridden = build(&registry, |t, _| {
            t.call(&step, args!["ada", "hi"])?;
            Ok(())
        })
        .unwrap();

        assert_eq!(
            defaulted.constants()[1],
            (StepId::new("greet"), "greeting".to_string(), json!("hello"))
        );
        assert_eq!(overridden.constants()[1].2, json!("hi"));
        assert_ne!(defaulted.shape(), overridden.shape());
    }

    #[test]
    fn test_fan_out_edges() {
        let mut registry = StepRegistry::new();
        let split = registry.register(passthrough("split", &[], 2)).unwrap();
        let first = registry.register(passthrough("first", &["v"], 0)).unwrap();
        let second = registry.register(passthrough("second", &["v"], 0)).unwrap();
        let both = registry.register(passthrough("both", &["v", "w"], 0)).unwrap();

        let pipeline = build(&registry, |t, _| {
            let [a, b] = t.call(&split, args![])?.unpack()?;
            t.call(&second, args![&b])?;
            t.call(&first, args![&a])?;
            t.call(&both, args![a, b])?;
            Ok(())
        })
        .unwrap();

        let edges = pipeline.edges();
        assert_eq!(edges.len(), 4);
        assert_eq!(
            edges[0],
            Edge {
                producer: StepId::new("split"),
                output: 0,
                consumer: StepId::new("first"),
                slot: "v".to_string(),
            }
        );
        assert_eq!(edges[1].output, 1);
        assert_eq!(edges[1].consumer.0, "second");
        assert_eq!(pipeline.dependents(&StepId::new("split")).unwrap().len(), 3);
        assert_eq!(pipeline.dependencies(&StepId::new("both")).unwrap().len(), 1);
    }

    #[test]
    fn test_dot_rendering() {
        let (registry, s) = linear();
        let pipeline = build(&registry, |t, _| {
            let a = t.call(&s[0], args![])?.single()?;
            let b = t.call(&s[1], args![a])?.single()?;
            t.call(&s[2], args![b])?;
            Ok(())
        })
        .unwrap();

        let dot = pipeline.to_dot();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("step2"));
        assert!(dot.contains("0 -> x"));
    }
}
