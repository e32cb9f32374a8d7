use anyhow::Context;
use clap::Parser;
use coordinator::config::CoordinatorConfig;
use coordinator::error::CoordinatorError;
use coordinator::input::RawTensorFile;
use coordinator::model;
use coordinator::orchestrator;
use coordinator_logging::LogConfig;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let config = CoordinatorConfig::parse();

    if let Err(e) = coordinator_logging::init_logging(LogConfig {
        app_name: "coordinator",
        log_dir: config.log_dir.clone(),
        verbose: config.verbose,
    }) {
        eprintln!("failed to initialize logging: {e:#}");
        std::process::exit(1);
    }

    std::process::exit(run(config).await);
}

async fn run(config: CoordinatorConfig) -> i32 {
    match run_inner(&config).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "coordinator exited with an error");
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    }
}

async fn run_inner(config: &CoordinatorConfig) -> anyhow::Result<()> {
    let (layers, quant) = model::load_model_config(&config.config)
        .with_context(|| format!("loading model config from {}", config.config.display()))?;

    let input_source = RawTensorFile {
        path: config.input.clone(),
        shape: config.input_shape,
    };

    let stats = orchestrator::run(config, layers, quant, &input_source)
        .await
        .context("running inference")?;

    tracing::info!(layers = stats.len(), "inference complete");
    println!("inference complete: {} layers executed", stats.len());
    Ok(())
}

fn exit_code_for(error: &anyhow::Error) -> i32 {
    let cause = error
        .chain()
        .find_map(|e| e.downcast_ref::<CoordinatorError>());
    match cause {
        Some(CoordinatorError::ConfigInvalid { .. }) => 1,
        Some(CoordinatorError::Json(_)) => 1,
        Some(CoordinatorError::Io(_)) => 1,
        Some(CoordinatorError::BindFailed { .. }) => 3,
        Some(CoordinatorError::InferenceAborted { .. }) => 2,
        Some(_) => 2,
        None => 1,
    }
}
