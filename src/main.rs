use anyhow::Context;
use colored::Colorize;
use itertools::Itertools;
use netsim_runner::{
    clap_args::{self, Commands},
    config::Config,
    scenario_runner::{summary, ScenarioRunner},
};
use std::{path::Path, process::ExitCode};
use tracing::{info, subscriber::set_global_default, warn, Subscriber};
use tracing_subscriber::EnvFilter;

const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = clap_args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    if let Err(e) = set_global_default(get_subscriber(level)) {
        eprintln!("Unable to install log subscriber: {e}");
    }

    match run(args.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn get_subscriber(env_filter: &str) -> impl Subscriber + Sync + Send {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}

async fn run(command: Commands) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Init { path } => {
            Config::write_example_to_file(&path)
                .context(format!("Unable to create {}", path.display()))?;
            println!("Wrote example scenarios to {}", path.display().to_string().green());
            Ok(ExitCode::SUCCESS)
        }

        Commands::List { config } => {
            let config = Config::try_from_path(&config)?;
            list_scenarios(&config);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run {
            scenario,
            config,
            dry_run,
            report,
        } => {
            let config = Config::try_from_path(&config)?;
            let runner = ScenarioRunner::new(config)?;

            if dry_run {
                let plan = runner.plan(&scenario)?;
                summary::print_plan(&scenario, &plan);
                return Ok(ExitCode::SUCCESS);
            }

            let shutdown = runner.shutdown_token();
            ctrlc::set_handler(move || {
                eprintln!("\n{}", "Interrupted, cleaning up...".yellow());
                shutdown.cancel();
            })
            .context("Unable to install Ctrl-C handler")?;

            let run_summary = runner.run(&scenario).await;
            runner.shutdown().await;

            summary::print_summary(&run_summary);
            if let Some(path) = report.as_deref() {
                write_report(path, &run_summary);
            }

            let code = if run_summary.interrupted {
                ExitCode::from(EXIT_INTERRUPTED)
            } else if run_summary.passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
            Ok(code)
        }
    }
}

fn write_report(path: &Path, run_summary: &netsim_runner::scenario_runner::RunSummary) {
    match summary::write_report(path, run_summary) {
        Ok(()) => info!("Report written to {}", path.display()),
        Err(e) => warn!("{:#}", e),
    }
}

fn list_scenarios(config: &Config) {
    println!("{}", " Scenarios ".reversed().green());
    for (name, scenario) in &config.scenarios {
        let mut line = format!("{}", name.green());
        if !scenario.description.is_empty() {
            line.push_str(&format!(": {}", scenario.description));
        }
        if scenario.is_composite() {
            line.push_str(&format!(
                " {}",
                format!("[{}]", scenario.include_scenarios.iter().join(", ")).bright_black()
            ));
        }
        println!("  {}", line);
    }
}
