use anyhow::{Context, Result};
use std::path::PathBuf;
use stepgraph_core::{EngineConfig, PipelineArgs, PipelineDefinition, PipelineError};

mod pipelines;

const CONFIG_ENV: &str = "STEPGRAPH_CONFIG";
const DEFAULT_CONFIG: &str = "stepgraph.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = EngineConfig::load(&config_path)?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("Starting stepgraph runner");
    tracing::info!("Execution mode: {:?}", config.execution.mode);

    let runs = [
        (
            pipelines::tutorial_pipeline(&config.execution)?,
            PipelineArgs::new().with("parameter", "example-param"),
        ),
        (
            pipelines::ml_experiment(&config.execution)?,
            PipelineArgs::new()
                .with("ts", "2024-01-01T00:00:00Z")
                .with("iters", 10),
        ),
    ];

    let mut failed = 0;
    for (pipeline, args) in &runs {
        if !run(pipeline, args).await? {
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} pipelines failed", failed, runs.len());
    }

    Ok(())
}

/// Run one pipeline and print its report. Returns false when the run failed.
async fn run(pipeline: &PipelineDefinition, args: &PipelineArgs) -> Result<bool> {
    tracing::info!(
        "Invoking pipeline {}/{}",
        pipeline.namespace(),
        pipeline.name()
    );

    match pipeline.invoke_async(args).await {
        Ok(report) => {
            let json = serde_json::to_string_pretty(&report).context("Failed to encode run report")?;
            println!("{}", json);
            Ok(true)
        }
        Err(PipelineError::Build(e)) => {
            tracing::error!("Pipeline {} could not be built: {}", pipeline.name(), e);
            Ok(false)
        }
        Err(PipelineError::StepExecution(failure)) => {
            tracing::error!("Pipeline {} failed: {:#}", pipeline.name(), failure);
            let json = serde_json::to_string_pretty(failure.partial())
                .context("Failed to encode partial run report")?;
            println!("{}", json);
            Ok(false)
        }
    }
}
