use anyhow::{anyhow, Result};
use serde_json::json;
use stepgraph_core::{args, define, ExecutionConfig, PipelineDefinition, Step, StepRegistry};

/// `test-pipeline`: one step whose two outputs feed two different consumers
pub fn tutorial_pipeline(config: &ExecutionConfig) -> Result<PipelineDefinition> {
    let mut registry = StepRegistry::new();

    let my_step = registry.register(Step::builder("my_step").input("a").outputs(2).body(|inputs| {
        let a = inputs.parse::<String>("a")?;
        tracing::info!("my_step received {}", a);
        Ok(vec![json!("Some"), json!("Data")])
    }))?;

    let second_step = registry.register(concat_step("second_step"))?;
    let third_step = registry.register(concat_step("third_step"))?;

    Ok(define("test-pipeline", "kale-sdk-tutorial")
        .steps(registry)
        .param_with_default("parameter", "input")
        .with_config(config.clone())
        .body(move |t, args| {
            let parameter = args.get("parameter")?;
            let [data1, data2] = t.call(&my_step, args![parameter])?.unpack()?;
            t.call(&second_step, args![data1, parameter])?;
            t.call(&third_step, args![data2, parameter])?;
            Ok(())
        }))
}

fn concat_step(name: &str) -> Step {
    let label = name.to_string();
    Step::builder(name).inputs(["b", "c"]).body(move |inputs| {
        let joined = inputs.parse::<String>("b")? + &inputs.parse::<String>("c")?;
        tracing::info!("{}: {}", label, joined);
        Ok(vec![json!(joined)])
    })
}

/// `model_training`: process, validate, then train on the validated split
pub fn ml_experiment(config: &ExecutionConfig) -> Result<PipelineDefinition> {
    let mut registry = StepRegistry::new();

    let process = registry.register(
        Step::builder("data_processing")
            .input("timestamp")
            .outputs(2)
            .body(|inputs| {
                let timestamp = inputs.parse::<String>("timestamp")?;
                let seed = timestamp.bytes().map(u64::from).sum::<u64>() % 7 + 1;
                let data: Vec<u64> = (1..=10).map(|i| i * seed).collect();
                let (train, validate) = data.split_at(8);
                Ok(vec![json!(train), json!(validate)])
            }),
    )?;

    let validate = registry.register(
        Step::builder("data_validation")
            .inputs(["train_data", "validate_data"])
            .outputs(2)
            .body(|inputs| {
                let train = inputs.parse::<Vec<f64>>("train_data")?;
                let validate = inputs.parse::<Vec<f64>>("validate_data")?;
                if train.is_empty() || validate.is_empty() {
                    return Err(anyhow!("data is not valid: empty split"));
                }
                Ok(vec![json!(train), json!(validate)])
            }),
    )?;

    let train = registry.register(
        Step::builder("model_training")
            .inputs(["train_data", "validate_data", "training_iterations"])
            .body(|inputs| {
                let train = inputs.parse::<Vec<f64>>("train_data")?;
                let validate = inputs.parse::<Vec<f64>>("validate_data")?;
                let iterations = inputs.parse::<u32>("training_iterations")?;

                // Mean predictor fitted by gradient steps on squared error
                let mut mean = 0.0;
                for _ in 0..iterations {
                    let gradient = train.iter().map(|x| mean - x).sum::<f64>() / train.len() as f64;
                    mean -= 0.5 * gradient;
                }
                let error = validate.iter().map(|x| (x - mean).abs()).sum::<f64>()
                    / validate.len() as f64;

                tracing::info!("model_training: mean={:.3} validation_error={:.3}", mean, error);
                Ok(vec![json!({
                    "iterations": iterations,
                    "mean": mean,
                    "validation_error": error,
                })])
            }),
    )?;

    Ok(define("model_training", "kale_sdk_pipeline")
        .steps(registry)
        .param("ts")
        .param("iters")
        .with_config(config.clone())
        .body(move |t, args| {
            let [train_data, validate_data] = t.call(&process, args![args.get("ts")?])?.unpack()?;
            let [train_valid, validate_valid] = t
                .call(&validate, args![train_data, validate_data])?
                .unpack()?;
            t.call(&train, args![train_valid, validate_valid, args.get("iters")?])?;
            Ok(())
        }))
}
