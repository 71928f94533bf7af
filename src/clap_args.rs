use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long, global = true, action = clap::ArgAction::SetTrue)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a scenario
    Run {
        /// Scenario to run, `all` runs everything
        #[arg(short, long, default_value = "all")]
        scenario: String,

        /// Path to the scenario document
        #[arg(short, long, default_value = "scenarios.toml")]
        config: PathBuf,

        /// Print what would run without starting anything
        #[arg(long)]
        dry_run: bool,

        /// Write a JSON report of the run to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// List the scenarios in a document
    List {
        #[arg(short, long, default_value = "scenarios.toml")]
        config: PathBuf,
    },

    /// Write an example scenario document
    Init {
        #[arg(short, long, default_value = "scenarios.toml")]
        path: PathBuf,
    },
}

pub fn parse() -> Args {
    Args::parse()
}
