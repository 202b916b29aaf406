use std::process;

use fathom::{
    config,
    infra::{error::InfraError, telemetry},
    service::LayerConfig,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

fn main() {
    if let Err(error) = run() {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        InfraError::configuration(format!("failed to load configuration: {err}"))
    })?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::CheckConfig(config::CheckConfigArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::CheckConfig(_) => run_check_config(&settings),
    }
}

fn run_check_config(settings: &config::Settings) -> Result<(), InfraError> {
    let layer = LayerConfig::from(settings);
    info!(
        local_capacity = layer.cache.local_capacity,
        remote = layer.cache.enable_remote,
        families = layer.optimizer.families.len(),
        thresholds = layer.monitor.thresholds.len(),
        "configuration resolved"
    );
    println!("{layer:#?}");
    Ok(())
}
