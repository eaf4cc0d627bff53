mod artifact;
mod backoff;
mod backup;
mod cancel;
mod channel;
mod cli;
mod config;
mod constants;
mod error;
mod health;
mod lock;
mod migrate;
mod paths;
mod release;
#[cfg(test)]
mod test_support;
mod utils;

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

use crate::cancel::CancelToken;
use crate::cli::{Cli, Commands};
use crate::config::resolve_config_path;
use crate::error::exit_code_for;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cutover=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing() {
        eprintln!("Warning: logging disabled: {err}");
    }
    let cancel = CancelToken::new();
    cancel::install_signal_handler(cancel.clone());
    let config_path = resolve_config_path(cli.config);

    let result = match cli.command {
        Commands::Release(args) => release::handle(args, &config_path, cancel),
        Commands::Migrate(args) => migrate::handle(args, &config_path, cancel),
        Commands::Health(args) => health::handle(args, &config_path),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(u8::try_from(exit_code_for(&err)).unwrap_or(1))
        }
    }
}
