// SPDX-License-Identifier: GPL-3.0-only

//! `snapvol` command-line entry point

mod cli;
mod commands;
mod config;
mod logging;
mod prompt;
mod reporter;
mod signals;

use std::process::ExitCode;

use clap::Parser;

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::signals::Cancellation;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("snapvol: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(&config.log, cli.verbose);

    let result = match cli.command {
        Command::Download(args) => {
            if commands::download::keeps_existing_output(&args, prompt::confirm) {
                return ExitCode::SUCCESS;
            }
            let cancel = signals::install(Cancellation::All);
            commands::download::run(args, &config, cancel).await
        }
        Command::Mount(args) => {
            let cancel = signals::install(Cancellation::IgnoreInterrupt);
            commands::mount::run(args, &config, cancel).await
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!("{e:?}");
            eprintln!("snapvol: {e:#}");
            ExitCode::FAILURE
        }
    }
}
