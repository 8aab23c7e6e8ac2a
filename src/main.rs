mod cli;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use termbridge::commands;
use termbridge::config;
use termbridge::session::state::SessionStatus;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_logging();
    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let config = config::load(&root)?;

    match cli.command {
        Command::Relay { file } => {
            commands::relay::relay(file.as_deref(), &config).await?;
        }
        Command::History { file } => {
            let report = commands::history::history(&file, None, &mut std::io::stdout())?;
            if report.is_corrupted() {
                return Ok(ExitCode::from(2));
            }
        }
        Command::Run {
            prompt,
            model,
            cwd,
            resume,
            allow,
            agent_args,
        } => {
            let status = commands::run::run(
                commands::run::RunOptions {
                    prompt,
                    model,
                    cwd,
                    resume,
                    allow,
                    agent_args,
                },
                &config,
            )
            .await?;
            if status == SessionStatus::Error {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Log to stderr, filtered by `RUST_LOG`, then `TERMBRIDGE_LOG`, then `warn`.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("TERMBRIDGE_LOG"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
