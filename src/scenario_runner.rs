/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

mod checks;
mod steps;
pub mod summary;

use crate::{
    config::{secs, Config, HealthCheck, RtspServerSetup, ScenarioDefinition, Step},
    error::{kind_of, OrchestratorError},
    metrics::{parser::OutputParser, QualityRecord, QualityReport},
    metrics_logger::{self, StopHandle},
    network::{probe, NetworkImpairmentController},
    process_control::{self, ProcessSpec, ProcessSupervisor},
};
use anyhow::Context;
use colored::Colorize;
use serde::Serialize;
use std::{
    collections::HashMap,
    future::Future,
    path::PathBuf,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name of the synthetic scenario that runs everything when the document doesn't define it.
pub const ALL_SCENARIOS: &str = "all";

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const FILE_GENERATION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "step")]
pub enum ScenarioState {
    Pending,
    Setup,
    Running(usize),
    Cleanup,
    Passed,
    Failed,
}

/// What happened to one step. `success` is the true outcome; `counted_success` is what the
/// scenario saw, which differs only for allow-failure steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub name: String,
    pub kind: &'static str,
    pub attempts: u32,
    pub success: bool,
    pub counted_success: bool,
    pub exit_code: Option<i32>,
    pub duration_secs: f64,
    pub message: Option<String>,
}

impl StepOutcome {
    fn new(step: &Step) -> Self {
        Self {
            name: step.name().to_string(),
            kind: step.kind(),
            attempts: 0,
            success: false,
            counted_success: false,
            exit_code: None,
            duration_secs: 0.0,
            message: None,
        }
    }

    fn succeeded(mut self, message: impl Into<String>) -> Self {
        self.success = true;
        self.counted_success = true;
        self.message = Some(message.into());
        self
    }

    fn failed(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.counted_success = false;
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub name: String,
    pub description: String,
    pub state: ScenarioState,
    pub steps: Vec<StepOutcome>,
    pub included: Vec<ScenarioResult>,
    pub duration_secs: f64,
    pub error: Option<String>,
    pub interrupted: bool,
    pub quality: Option<QualityReport>,
}

impl ScenarioResult {
    fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            state: ScenarioState::Pending,
            steps: vec![],
            included: vec![],
            duration_secs: 0.0,
            error: None,
            interrupted: false,
            quality: None,
        }
    }

    fn failed_early(name: &str, error: &anyhow::Error) -> Self {
        let mut result = Self::new(name, "");
        result.state = ScenarioState::Failed;
        result.error = Some(format!("{error:#}"));
        result
    }

    pub fn passed(&self) -> bool {
        self.state == ScenarioState::Passed
    }

    /// Total attempts of the named step, searched through included scenarios too.
    pub fn find_step(&self, name: &str) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|step| step.name == name)
            .or_else(|| self.included.iter().find_map(|inc| inc.find_step(name)))
    }

    fn transition(&mut self, next: ScenarioState) {
        debug!("Scenario {}: {:?} -> {:?}", self.name, self.state, next);
        self.state = next;
    }
}

/// Per-scenario state shared by setup, steps and cleanup.
struct ScenarioContext {
    name: String,
    env: HashMap<String, String>,
    record: Arc<Mutex<QualityRecord>>,
    network_server: Option<String>,
    plain_server: Option<String>,
    urls: Vec<String>,
    processes: Vec<String>,
    generated: Vec<PathBuf>,
    monitor: Option<StopHandle>,
}

impl ScenarioContext {
    fn new(name: &str, env: HashMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            env,
            record: Arc::new(Mutex::new(QualityRecord::new(name))),
            network_server: None,
            plain_server: None,
            urls: vec![],
            processes: vec![],
            generated: vec![],
            monitor: None,
        }
    }

    /// Replaces `{rtsp_url}` and `{rtsp_url_N}` with the URLs of the server started in setup.
    fn substitute(&self, command: &str) -> String {
        substitute_urls(command, &self.urls)
    }
}

pub fn substitute_urls(command: &str, urls: &[String]) -> String {
    let mut command = command.to_string();
    for (i, url) in urls.iter().enumerate() {
        command = command.replace(&format!("{{rtsp_url_{i}}}"), url);
    }
    if let Some(first) = urls.first() {
        command = command.replace("{rtsp_url}", first);
    }
    command
}

/// Drives scenarios from one document. Owns the registries of the run: every process and server
/// started on its behalf is tracked here and torn down by [`ScenarioRunner::shutdown`].
pub struct ScenarioRunner {
    config: Config,
    supervisor: Arc<ProcessSupervisor>,
    controller: NetworkImpairmentController,
    parser: Arc<OutputParser>,
    shutdown: CancellationToken,
}

/// Everything one invocation produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub scenario: String,
    pub results: Vec<ScenarioResult>,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn passed(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(ScenarioResult::passed)
    }
}

impl ScenarioRunner {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let supervisor = Arc::new(
            ProcessSupervisor::new().with_grace_period(secs(config.server.stop_timeout)),
        );
        let controller = NetworkImpairmentController::new(
            config.server.clone(),
            config.project_root(),
            supervisor.clone(),
        );
        Ok(Self {
            config,
            supervisor,
            controller,
            parser: Arc::new(OutputParser::new()?),
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that interrupts the run when cancelled. The current scenario still cleans up.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn controller(&self) -> &NetworkImpairmentController {
        &self.controller
    }

    fn interrupted(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Runs the named scenario. `all` runs every scenario when the document has no scenario of
    /// that name.
    pub async fn run(&self, scenario: &str) -> RunSummary {
        let run_id = nanoid::nanoid!(5, &nanoid::alphabet::SAFE);
        info!("Run {} started for scenario {}", run_id, scenario);

        let mut results = vec![];
        if scenario == ALL_SCENARIOS && !self.config.scenarios.contains_key(ALL_SCENARIOS) {
            for name in self.config.scenarios.keys() {
                if self.interrupted() {
                    break;
                }
                results.push(self.run_scenario(name).await);
            }
        } else {
            results.push(self.run_scenario(scenario).await);
        }

        RunSummary {
            run_id,
            scenario: scenario.to_string(),
            results,
            interrupted: self.interrupted(),
        }
    }

    pub async fn run_scenario(&self, name: &str) -> ScenarioResult {
        let mut stack = vec![];
        self.run_nested(name.to_string(), &mut stack).await
    }

    fn run_nested<'a>(
        &'a self,
        name: String,
        stack: &'a mut Vec<String>,
    ) -> Pin<Box<dyn Future<Output = ScenarioResult> + 'a>> {
        Box::pin(async move {
            if stack.contains(&name) {
                let err = OrchestratorError::configuration(format!(
                    "scenario '{}' includes itself via {}",
                    name,
                    stack.join(" -> ")
                ));
                error!("{:#}", err);
                return ScenarioResult::failed_early(&name, &err);
            }

            let scenario = match self.config.find_scenario(&name) {
                Ok(scenario) => scenario,
                Err(e) => {
                    error!("{:#}", e);
                    return ScenarioResult::failed_early(&name, &e);
                }
            };

            let started = Instant::now();
            println!("> running scenario {}", name.green());
            info!("Description: {}", scenario.description);

            let mut result = ScenarioResult::new(&name, &scenario.description);
            let mut ok = true;

            stack.push(name.clone());
            for included in &scenario.include_scenarios {
                if self.interrupted() {
                    result.interrupted = true;
                    ok = false;
                    break;
                }
                let inc = self.run_nested(included.clone(), stack).await;
                let inc_passed = inc.passed();
                result.interrupted |= inc.interrupted;
                result.included.push(inc);
                if !inc_passed {
                    ok = false;
                    if !scenario.continue_on_failure || result.interrupted {
                        warn!("Included scenario {} failed, aborting {}", included, name);
                        break;
                    }
                }
            }
            stack.pop();

            let has_body = !scenario.steps.is_empty()
                || scenario.setup.rtsp_server.is_some()
                || !scenario.setup.processes.is_empty()
                || scenario.setup.test_files.is_some();
            if has_body && (ok || scenario.continue_on_failure) && !result.interrupted {
                ok &= self.run_body(scenario, &mut result).await;
            } else {
                result.transition(ScenarioState::Cleanup);
                self.remove_artifacts(scenario, vec![]);
            }

            result.duration_secs = started.elapsed().as_secs_f64();
            result.transition(if ok { ScenarioState::Passed } else { ScenarioState::Failed });

            if ok {
                println!("{} scenario {} passed", "✓".green(), name.green());
            } else {
                println!("{} scenario {} failed", "✗".red(), name.red());
            }
            result
        })
    }

    /// Setup, steps and cleanup of a single scenario. Cleanup always runs and never changes the
    /// outcome.
    async fn run_body(&self, scenario: &ScenarioDefinition, result: &mut ScenarioResult) -> bool {
        let mut ctx = ScenarioContext::new(&scenario.name, self.scenario_env(scenario));

        result.transition(ScenarioState::Setup);
        let mut ok = match self.setup(scenario, &mut ctx).await {
            Ok(()) => true,
            Err(e) => {
                error!("Setup of {} failed: {:#}", scenario.name, e);
                result.error = Some(format!("setup failed: {e:#}"));
                false
            }
        };

        if ok {
            for (index, step) in scenario.steps.iter().enumerate() {
                if self.interrupted() {
                    result.interrupted = true;
                    ok = false;
                    break;
                }

                result.transition(ScenarioState::Running(index));
                let outcome = self.execute_step(step, &mut ctx).await;
                let counted = outcome.counted_success;
                result.steps.push(outcome);

                if !counted {
                    ok = false;
                    if !scenario.continue_on_failure {
                        warn!("Step {} failed, skipping remaining steps", step.name());
                        break;
                    }
                }
            }
        }
        if self.interrupted() {
            result.interrupted = true;
            ok = false;
        }

        result.transition(ScenarioState::Cleanup);
        result.quality = Some(self.cleanup(scenario, &mut ctx).await);
        ok
    }

    /// Process environment overrides for one scenario: `[defaults]` not already set in the
    /// environment, then the scenario's own variables.
    fn scenario_env(&self, scenario: &ScenarioDefinition) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = self
            .config
            .default_env()
            .into_iter()
            .filter(|(key, _)| std::env::var_os(key).is_none())
            .collect();
        env.extend(scenario.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    async fn setup(&self, scenario: &ScenarioDefinition, ctx: &mut ScenarioContext) -> anyhow::Result<()> {
        let setup = &scenario.setup;

        if let Some(files) = setup.test_files.as_ref().filter(|files| files.enabled) {
            for file in &files.files {
                self.generate_file(file, ctx).await?;
            }
        }

        if let Some(server) = setup.rtsp_server.as_ref().filter(|server| server.enabled) {
            if server.is_network_aware() {
                self.start_network_server(server, ctx).await?;
            } else {
                self.start_plain_server(server, ctx).await?;
            }
        }

        let mut monitored = vec![];
        for process in &setup.processes {
            let command = ctx.substitute(&process.command);
            let name = format!("{}/{}", ctx.name, process.name);
            let mut spec = ProcessSpec::from_command_line(&name, &command, process.shell)?
                .envs(ctx.env.clone())
                .envs(process.env.clone())
                .timeout(secs(process.ready_timeout));
            if let Some(cwd) = &process.cwd {
                spec = spec.cwd(self.config.resolve(cwd));
            }
            if let Some(pattern) = &process.ready_pattern {
                spec = spec.ready_pattern(pattern.clone());
            }

            ctx.processes.push(name.clone());
            let handle = self.supervisor.start(spec).await?;
            if process.monitor {
                monitored.push(handle);
            }
        }

        ctx.monitor = Some(metrics_logger::start_monitoring(
            monitored,
            self.parser.clone(),
            ctx.record.clone(),
        ));
        Ok(())
    }

    async fn generate_file(
        &self,
        file: &crate::config::GeneratedFile,
        ctx: &mut ScenarioContext,
    ) -> anyhow::Result<()> {
        let output = self.config.resolve(&file.output);
        if output.exists() {
            debug!("Test file {} already exists", output.display());
            return Ok(());
        }

        info!("Generating test file: {}", output.display());
        let name = format!("{}/generate/{}", ctx.name, file.output.display());
        let mut spec = ProcessSpec::from_command_line(&name, &file.command, false)?.envs(ctx.env.clone());
        spec = spec.cwd(match &file.cwd {
            Some(cwd) => self.config.resolve(cwd),
            None => self.config.project_root(),
        });

        let handle = self.supervisor.start(spec).await?;
        let exited = handle.wait_for_exit(FILE_GENERATION_TIMEOUT).await;
        self.supervisor.stop(&name).await?;

        match exited {
            Some(Some(0)) => {
                ctx.generated.push(output);
                Ok(())
            }
            Some(code) => Err(OrchestratorError::StepFailure {
                name: format!("generate {}", file.output.display()),
                reason: format!("exit code {code:?}"),
            }
            .into()),
            None => Err(OrchestratorError::StepFailure {
                name: format!("generate {}", file.output.display()),
                reason: format!("timed out after {FILE_GENERATION_TIMEOUT:?}"),
            }
            .into()),
        }
    }

    async fn start_network_server(
        &self,
        server: &RtspServerSetup,
        ctx: &mut ScenarioContext,
    ) -> anyhow::Result<()> {
        let info = self
            .controller
            .start_server(&server.name, &server.streams, server.port, server.control_port)
            .await?;
        ctx.network_server = Some(server.name.clone());
        ctx.urls = info.urls;

        if let Some(first) = server.streams.first() {
            metrics_logger::lock_record(&ctx.record).apply_condition(&first.network);
        }
        for url in &ctx.urls {
            info!("Serving {}", url);
        }
        Ok(())
    }

    async fn start_plain_server(&self, server: &RtspServerSetup, ctx: &mut ScenarioContext) -> anyhow::Result<()> {
        let command = server.command.as_deref().ok_or_else(|| {
            OrchestratorError::configuration(format!(
                "rtsp_server '{}' needs either streams or a command",
                server.name
            ))
        })?;

        let mut spec = ProcessSpec::from_command_line(&server.name, command, false)?.envs(ctx.env.clone());
        if let Some(cwd) = &server.cwd {
            spec = spec.cwd(self.config.resolve(cwd));
        }
        ctx.plain_server = Some(server.name.clone());
        let handle = self.supervisor.start(spec).await?;

        if server.startup_delay > 0.0 {
            info!("Waiting {}s for {} to start", server.startup_delay, server.name);
            self.pause(secs(server.startup_delay)).await?;
        }
        process_control::ensure_running(&handle)?;

        if let Some(HealthCheck::Tcp { host, port, timeout }) = &server.health_check {
            probe::wait_for_port(host, *port, secs(*timeout), HEALTH_POLL_INTERVAL)
                .await
                .context(format!("{} health check failed", server.name))?;
        }
        Ok(())
    }

    /// Sleeps for `duration` unless the run is interrupted first.
    async fn pause(&self, duration: Duration) -> anyhow::Result<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(anyhow::anyhow!("interrupted")),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn cleanup(&self, scenario: &ScenarioDefinition, ctx: &mut ScenarioContext) -> QualityReport {
        let record = match ctx.monitor.take() {
            Some(monitor) => monitor.stop().await,
            None => metrics_logger::lock_record(&ctx.record).clone(),
        };

        for name in ctx.processes.drain(..).rev() {
            if let Err(e) = self.supervisor.stop(&name).await {
                warn!("Failed to stop {}: {:#}", name, e);
            }
        }

        if let Some(server) = ctx.network_server.take() {
            if let Err(e) = self.controller.stop_server(&server).await {
                warn!("Failed to stop server {}: {:#}", server, e);
            }
        }
        if let Some(server) = ctx.plain_server.take() {
            if let Err(e) = self.supervisor.stop(&server).await {
                warn!("Failed to stop server {}: {:#}", server, e);
            }
        }

        self.remove_artifacts(scenario, std::mem::take(&mut ctx.generated));
        record.report()
    }

    /// Deletes the files named by the cleanup block, plus `generated` when test files are to be
    /// removed. Runs whether or not the scenario body did.
    fn remove_artifacts(&self, scenario: &ScenarioDefinition, mut generated: Vec<PathBuf>) {
        let mut to_remove = vec![];
        if scenario.cleanup.remove_test_files {
            to_remove.append(&mut generated);
        }
        to_remove.extend(scenario.cleanup.remove_files.iter().map(|f| self.config.resolve(f)));
        for path in to_remove {
            if !path.exists() {
                continue;
            }
            info!("Removing {}", path.display());
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    /// Stops every server and process still tracked. Safe to call more than once.
    pub async fn shutdown(&self) {
        let servers = self.controller.cleanup_all().await;
        let processes = self.supervisor.stop_all().await;
        if servers > 0 || !processes.is_empty() {
            info!(
                "Stopped {} server(s) and {} process(es) at shutdown",
                servers,
                processes.len()
            );
        }
    }

    /// Lines describing what running `name` would do, without doing it.
    pub fn plan(&self, name: &str) -> anyhow::Result<Vec<String>> {
        let mut lines = vec![];
        let mut stack = vec![];
        if name == ALL_SCENARIOS && !self.config.scenarios.contains_key(ALL_SCENARIOS) {
            for scenario in self.config.scenarios.keys() {
                self.plan_into(scenario, 0, &mut stack, &mut lines)?;
            }
        } else {
            self.plan_into(name, 0, &mut stack, &mut lines)?;
        }
        Ok(lines)
    }

    fn plan_into(
        &self,
        name: &str,
        depth: usize,
        stack: &mut Vec<String>,
        lines: &mut Vec<String>,
    ) -> anyhow::Result<()> {
        if stack.iter().any(|s| s == name) {
            return Err(OrchestratorError::configuration(format!(
                "scenario '{name}' includes itself"
            )));
        }
        let scenario = self.config.find_scenario(name)?;
        let pad = "  ".repeat(depth);
        lines.push(format!("{pad}scenario {name}: {}", scenario.description));

        stack.push(name.to_string());
        for included in &scenario.include_scenarios {
            self.plan_into(included, depth + 1, stack, lines)?;
        }
        stack.pop();

        if let Some(server) = scenario.setup.rtsp_server.as_ref().filter(|s| s.enabled) {
            if server.is_network_aware() {
                lines.push(format!(
                    "{pad}  server {}: {}",
                    server.name,
                    self.controller.preview_command(&server.streams)
                ));
            } else if let Some(command) = &server.command {
                lines.push(format!("{pad}  server {}: {}", server.name, command));
            }
        }
        for process in &scenario.setup.processes {
            lines.push(format!("{pad}  process {}: {}", process.name, process.command));
        }
        for (i, step) in scenario.steps.iter().enumerate() {
            let detail = match step {
                Step::Command(cmd) => cmd.command.clone(),
                Step::NetworkUpdate(update) => format!("stream {} -> {:?}", update.stream_index, update.condition),
                Step::NetworkSequence(seq) => {
                    format!("stream {}: {} changes over {}s", seq.stream_index, seq.schedule.len(), seq.duration)
                }
                Step::ValidateMetrics(check) => format!("check {}", check.check),
            };
            lines.push(format!("{pad}  {}. [{}] {}: {}", i + 1, step.kind(), step.name(), detail));
        }
        Ok(())
    }
}

/// Whether `err` must not be retried.
fn is_configuration_error(err: &anyhow::Error) -> bool {
    matches!(kind_of(err), Some(OrchestratorError::Configuration(_)))
}
