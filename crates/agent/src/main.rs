// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use tripwire_agent::config::{AgentConfig, Cli, Command};

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_validated(path: &Path) -> Result<AgentConfig, ExitCode> {
    let config = match AgentConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e}");
            return Err(ExitCode::from(1));
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("config error: {e}");
        return Err(ExitCode::from(1));
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Version => {
            println!("tripwire-agent {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }

        Command::Validate { config } => match load_validated(&config) {
            Ok(_) => {
                println!("config OK");
                ExitCode::SUCCESS
            }
            Err(code) => code,
        },

        Command::Start { config } => {
            let config = match load_validated(&config) {
                Ok(config) => config,
                Err(code) => return code,
            };
            if let Err(e) = config.validate_tls_paths() {
                eprintln!("config error: {e}");
                return ExitCode::from(1);
            }

            init_tracing(&config.log_level, &config.log_format);

            match tripwire_agent::run::run(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("fatal: {e:#}");
                    ExitCode::from(2)
                }
            }
        }
    }
}
