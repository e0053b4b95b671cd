use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stepgraph_core::{
    args, define, BuildError, PipelineArgs, PipelineDefinition, PipelineError, RunStatus, Step,
    StepId, StepRegistry,
};

fn counting(name: &str, inputs: &[&str], outputs: usize, calls: &Arc<AtomicUsize>) -> Step {
    let calls = calls.clone();
    Step::builder(name)
        .inputs(inputs.iter().copied())
        .outputs(outputs)
        .body(move |step_inputs| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(step_inputs.values().cloned().chain(std::iter::repeat(Value::Null)).take(outputs).collect())
        })
}

fn produce_double_shout() -> PipelineDefinition {
    let mut registry = StepRegistry::new();
    let produce = registry
        .register(
            Step::builder("produce")
                .outputs(2)
                .body(|_| Ok(vec![json!(5), json!("x")])),
        )
        .unwrap();
    let double = registry
        .register(
            Step::builder("double")
                .input("n")
                .body(|inputs| Ok(vec![json!(inputs.parse::<i64>("n")? * 2)])),
        )
        .unwrap();
    let shout = registry
        .register(Step::builder("shout").input("s").body(|inputs| {
            Ok(vec![json!(inputs.parse::<String>("s")?.to_uppercase())])
        }))
        .unwrap();

    define("scenario", "integration")
        .steps(registry)
        .body(move |t, _| {
            let [n, s] = t.call(&produce, args![])?.unpack()?;
            t.call(&double, args![n])?;
            t.call(&shout, args![s])?;
            Ok(())
        })
}

#[test]
fn produce_double_shout_yields_expected_mapping() {
    let report = produce_double_shout().invoke(&PipelineArgs::new()).unwrap();

    let expected: Vec<(StepId, Vec<Value>)> = vec![
        (StepId::new("double"), vec![json!(10)]),
        (StepId::new("produce"), vec![json!(5), json!("x")]),
        (StepId::new("shout"), vec![json!("X")]),
    ];
    assert_eq!(report.outputs.into_iter().collect::<Vec<_>>(), expected);
}

#[test]
fn cycle_is_rejected_before_any_step_runs() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = StepRegistry::new();
    let source = registry.register(counting("source", &[], 1, &calls)).unwrap();
    let left = registry.register(counting("left", &["a", "b"], 1, &calls)).unwrap();
    let right = registry.register(counting("right", &["a"], 1, &calls)).unwrap();

    let pipeline = define("cyclic", "integration")
        .steps(registry)
        .body(move |t, _| {
            let s = t.call(&source, args![])?.single()?;
            let closing = t.token(&right, 0)?;
            let l = t.call(&left, args![s, closing])?.single()?;
            t.call(&right, args![l])?;
            Ok(())
        });

    let err = pipeline.invoke(&PipelineArgs::new()).unwrap_err();

    match err {
        PipelineError::Build(BuildError::CyclicDependency { steps }) => {
            assert_eq!(steps, vec![StepId::new("left"), StepId::new("right")]);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn validation_failure_preserves_completed_steps() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = StepRegistry::new();
    let process = registry
        .register(counting("data_processing", &["timestamp"], 2, &calls))
        .unwrap();
    let validate = registry
        .register(
            Step::builder("data_validation")
                .inputs(["train_data", "validate_data"])
                .outputs(2)
                .body(|_| Err(anyhow::anyhow!("data is not valid"))),
        )
        .unwrap();
    let train = registry
        .register(counting(
            "model_training",
            &["train_data", "validate_data", "training_iterations"],
            0,
            &calls,
        ))
        .unwrap();

    let pipeline = define("model_training", "integration")
        .steps(registry)
        .param("ts")
        .param_with_default("iters", 10)
        .body(move |t, args| {
            let [train_data, validate_data] = t.call(&process, args![args.get("ts")?])?.unpack()?;
            let [a, b] = t.call(&validate, args![train_data, validate_data])?.unpack()?;
            t.call(&train, args![a, b, args.get("iters")?])?;
            Ok(())
        });

    let err = pipeline
        .invoke(&PipelineArgs::new().with("ts", "2024-01-01"))
        .unwrap_err();

    let partial = err.partial().unwrap();
    assert_eq!(partial.status, RunStatus::Failed);
    assert_eq!(partial.completed_steps(), vec![&StepId::new("data_processing")]);
    assert!(partial.output("model_training").is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    match err {
        PipelineError::StepExecution(failure) => {
            assert_eq!(failure.step, StepId::new("data_validation"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn same_definition_reruns_with_new_literals() {
    let mut registry = StepRegistry::new();
    let echo = registry
        .register(Step::builder("echo").input("v").body(|inputs| Ok(vec![inputs.require("v")?.clone()])))
        .unwrap();

    let pipeline = define("echo", "integration")
        .steps(registry)
        .param("v")
        .body(move |t, args| {
            t.call(&echo, args![args.get("v")?])?;
            Ok(())
        });

    let one = pipeline.invoke(&PipelineArgs::new().with("v", 1)).unwrap();
    let two = pipeline.invoke(&PipelineArgs::new().with("v", "two")).unwrap();

    assert_eq!(one.value("echo"), Some(&json!(1)));
    assert_eq!(two.value("echo"), Some(&json!("two")));
    assert_eq!(
        pipeline.build(&PipelineArgs::new().with("v", 1)).unwrap().shape(),
        pipeline.build(&PipelineArgs::new().with("v", 2)).unwrap().shape()
    );
}
