//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - run: drive a session with a script until it stops
//! - summary: print a session's durable summary
//! - artifacts: list a session's artifacts
//! - reconcile: poll orphaned remote runs

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Codeloop - generate, execute, analyze, repeat
#[derive(Parser, Debug)]
#[command(name = "codeloop")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a script in a loop until the session stops
    Run {
        /// Script file executed every iteration
        script: PathBuf,

        /// Session to run in (a new one is created if omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// Override the configured iteration cap
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Override the local interpreter
        #[arg(short, long)]
        interpreter: Option<String>,
    },

    /// Show the durable summary of a session
    Summary {
        /// Session ID
        session: String,
    },

    /// List the artifacts of a session
    Artifacts {
        /// Session ID
        session: String,
    },

    /// Poll orphaned remote runs and mark finished ones resolved
    Reconcile,
}
