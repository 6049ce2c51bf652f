//! Binary entry point for the pg-reflinker controller.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;

use pg_reflinker::config::{ConfigError, ReflinkerConfig};
use pg_reflinker::controller::{self, ControllerError};
use pg_reflinker::label::{LabelError, validate};
use pg_reflinker::telemetry::{self, TelemetryError};

mod cli;

use cli::{CheckLabelCommand, Cli, RunCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("controller error: {0}")]
    Controller(#[from] ControllerError),
    #[error("rejected: {0}")]
    Label(#[from] LabelError),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Run(command) => run_controllers(command).await,
        Cli::CheckLabel(command) => check_label(&command, io::stdout()),
    }
}

async fn run_controllers(command: RunCommand) -> Result<(), CliError> {
    let config = load_config(command)?;
    telemetry::init(config.log_format()?)?;
    controller::run(&config).await?;
    Ok(())
}

fn load_config(command: RunCommand) -> Result<ReflinkerConfig, CliError> {
    let mut config = ReflinkerConfig::load_without_cli_args()?;
    if let Some(node_name) = command.node_name {
        config.node_name = node_name;
    }
    if let Some(log_format) = command.log_format {
        config.log_format = log_format;
    }
    config.validate()?;
    Ok(config)
}

fn check_label(command: &CheckLabelCommand, mut out: impl Write) -> Result<(), CliError> {
    let label = validate(&command.label)?;
    writeln!(out, "{label}").map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
