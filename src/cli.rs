use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "termbridge",
    about = "Terminal stream relay and agent session bridge",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Project root holding `.termbridge/config.toml`. Defaults to the
    /// current directory.
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copy a terminal byte stream to stdout, stripping clipboard sequences.
    Relay {
        /// Read from this file instead of stdin.
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Show a persisted session history and whether it is corrupted.
    History {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Send one prompt to the agent, answering its permission requests and
    /// questions on the terminal.
    Run {
        #[arg(value_name = "PROMPT")]
        prompt: String,

        /// Model to run (falls back to `default_model` in the config).
        #[arg(long)]
        model: Option<String>,

        /// Working directory for the agent.
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Agent session id to continue.
        #[arg(long)]
        resume: Option<String>,

        /// Tool to approve without asking. Repeatable.
        #[arg(long = "allow", value_name = "TOOL")]
        allow: Vec<String>,

        /// Extra arguments to pass through to the agent (after --).
        #[arg(last = true)]
        agent_args: Vec<String>,
    },
}
