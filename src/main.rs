use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{prelude::*, EnvFilter};

use commands::GlobalArgs;

mod commands;
mod output;

use commands::{check, config, generate};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "divoc")]
#[command(version = VERSION)]
#[command(about = "Generate synthetic FHIR data with Synthea and ship it to Azure Blob Storage")]
struct Cli {
    /// Read configuration from this file instead of divoc.json
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone Synthea, generate a population and copy it to blob storage
    Generate(generate::GenerateArgs),
    /// Report which host tools are available
    Check(check::CheckArgs),
    /// Show configuration
    Config(config::ConfigArgs),
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    if let Err(err) = configure_tracing(cli.verbose) {
        eprintln!("failed to initialise logging: {}", err);
    }

    let global = GlobalArgs { config: cli.config };

    let (json_result, exit_code) = commands::run_json(cli.command, &global);
    if let Err(err) = &json_result {
        tracing::error!(code = err.code.as_str(), error = %err, "divoc failed");
    }
    output::print_json_result(json_result, exit_code);

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

/// Logs go to stderr so stdout carries only the JSON response.
fn configure_tracing(verbose: bool) -> Result<(), String> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| err.to_string())
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
