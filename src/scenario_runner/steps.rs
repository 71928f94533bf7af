/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{is_configuration_error, ScenarioContext, ScenarioRunner, StepOutcome};
use crate::{
    config::{secs, CommandStep, NetworkSequenceStep, NetworkUpdateStep, Step},
    error::OrchestratorError,
    metrics_logger::lock_record,
    network::{ConditionSchedule, ScheduleEntry},
    process_control::{ProcessOutput, ProcessSpec},
};
use colored::Colorize;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// How one attempt of a command step ended.
enum Attempt {
    Exited(Option<i32>),
    TimedOut,
    Interrupted,
}

impl ScenarioRunner {
    pub(super) async fn execute_step(&self, step: &Step, ctx: &mut ScenarioContext) -> StepOutcome {
        println!("  {} {} [{}]", "-".dimmed(), step.name().bold(), step.kind());
        let started = Instant::now();

        let mut outcome = match step {
            Step::Command(cmd) => self.run_command_step(step, cmd, ctx).await,
            Step::NetworkUpdate(update) => self.run_network_update(step, update, ctx).await,
            Step::NetworkSequence(seq) => self.run_network_sequence(step, seq, ctx).await,
            Step::ValidateMetrics(check) => self.run_validation(step, check, ctx).await,
        };
        outcome.duration_secs = started.elapsed().as_secs_f64();

        let message = outcome.message.clone().unwrap_or_default();
        if outcome.success {
            info!("{} {}: {}", "✓".green(), step.name(), message);
        } else if outcome.counted_success {
            warn!("{} {} failed but is allowed to: {}", "!".yellow(), step.name(), message);
        } else {
            error!("{} {}: {}", "✗".red(), step.name(), message);
        }
        outcome
    }

    async fn run_command_step(&self, step: &Step, cmd: &CommandStep, ctx: &mut ScenarioContext) -> StepOutcome {
        let mut outcome = StepOutcome::new(step);
        let command = ctx.substitute(&cmd.command);
        let attempts = cmd.retry_count + 1;
        let mut last_failure = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                info!("Retry attempt {}/{} for {}", attempt - 1, cmd.retry_count, cmd.name);
                if self.pause(secs(cmd.retry_delay)).await.is_err() {
                    last_failure = "interrupted".to_string();
                    break;
                }
            }
            outcome.attempts = attempt;

            let (ended, output) = match self.command_attempt(cmd, &command, ctx).await {
                Ok(result) => result,
                Err(e) => {
                    last_failure = format!("{e:#}");
                    if is_configuration_error(&e) {
                        break;
                    }
                    continue;
                }
            };

            if cmd.collect_metrics {
                if let Some(output) = &output {
                    let mut record = lock_record(&ctx.record);
                    for line in output.stdout.iter().chain(&output.stderr) {
                        record.ingest_line(&self.parser, line);
                    }
                }
            }

            match ended {
                Attempt::Exited(code) => {
                    outcome.exit_code = code;
                    if code == Some(cmd.expected_exit_code) {
                        return outcome.succeeded(format!("exit code {}", cmd.expected_exit_code));
                    }
                    last_failure = format!("exit code {:?}, expected {}", code, cmd.expected_exit_code);
                    if let Some(output) = &output {
                        for line in output.stderr.iter().rev().take(5).rev() {
                            warn!("{}: {}", cmd.name, line);
                        }
                    }
                }
                Attempt::TimedOut => {
                    error!("Command {} timed out after {}s", cmd.name, cmd.timeout);
                    last_failure = format!("timed out after {}s", cmd.timeout);
                }
                Attempt::Interrupted => {
                    last_failure = "interrupted".to_string();
                    break;
                }
            }
        }

        let failure = OrchestratorError::StepFailure {
            name: cmd.name.clone(),
            reason: last_failure,
        };
        let mut outcome = outcome.failed(failure.to_string());
        outcome.counted_success = cmd.allow_failure;
        outcome
    }

    /// Starts the command once and waits for it to exit within the step timeout. The process is
    /// always reaped before returning.
    async fn command_attempt(
        &self,
        cmd: &CommandStep,
        command: &str,
        ctx: &ScenarioContext,
    ) -> anyhow::Result<(Attempt, Option<ProcessOutput>)> {
        let name = format!("{}/step/{}", ctx.name, cmd.name);
        let spec = ProcessSpec::from_command_line(&name, command, cmd.shell)?
            .cwd(self.config.resolve(&cmd.cwd))
            .envs(ctx.env.clone())
            .envs(cmd.env.clone());

        info!("Running: {}", spec.command_line());
        let handle = self.supervisor.start(spec).await?;
        let ended = tokio::select! {
            _ = self.shutdown.cancelled() => Attempt::Interrupted,
            exited = handle.wait_for_exit(secs(cmd.timeout)) => match exited {
                Some(code) => Attempt::Exited(code),
                None => Attempt::TimedOut,
            },
        };
        let output = self.supervisor.stop(&name).await?;
        Ok((ended, output))
    }

    fn target_server(&self, requested: Option<&String>, ctx: &ScenarioContext) -> anyhow::Result<String> {
        requested
            .cloned()
            .or_else(|| ctx.network_server.clone())
            .ok_or_else(|| {
                OrchestratorError::configuration("no network-aware server is running for this scenario")
            })
    }

    async fn run_network_update(
        &self,
        step: &Step,
        update: &NetworkUpdateStep,
        ctx: &mut ScenarioContext,
    ) -> StepOutcome {
        let mut outcome = StepOutcome::new(step);
        outcome.attempts = 1;

        let server = match self.target_server(update.server.as_ref(), ctx) {
            Ok(server) => server,
            Err(e) => return outcome.failed(format!("{e:#}")),
        };
        if let Err(e) = self
            .controller
            .update_condition(&server, update.stream_index, &update.condition)
            .await
        {
            return outcome.failed(format!("{e:#}"));
        }
        lock_record(&ctx.record).apply_condition(&update.condition);

        if update.wait > 0.0 && self.pause(secs(update.wait)).await.is_err() {
            return outcome.failed("interrupted");
        }
        outcome.succeeded(format!("stream {} updated on {}", update.stream_index, server))
    }

    async fn run_network_sequence(
        &self,
        step: &Step,
        seq: &NetworkSequenceStep,
        ctx: &mut ScenarioContext,
    ) -> StepOutcome {
        let mut outcome = StepOutcome::new(step);
        outcome.attempts = 1;

        let server = match self.target_server(seq.server.as_ref(), ctx) {
            Ok(server) => server,
            Err(e) => return outcome.failed(format!("{e:#}")),
        };
        let schedule = ConditionSchedule::new(
            seq.schedule
                .iter()
                .map(|entry| ScheduleEntry::new(secs(entry.at), entry.condition.clone())),
        );

        let result = self
            .controller
            .run_schedule(&server, seq.stream_index, &schedule, secs(seq.duration), &self.shutdown)
            .await;

        // whatever made it to the server is what the pipeline saw last
        if let Some(condition) = self.controller.current_condition(&server, seq.stream_index) {
            lock_record(&ctx.record).apply_condition(&condition);
        }

        match result {
            Ok(applied) => outcome.succeeded(format!(
                "applied {} of {} conditions over {}s",
                applied,
                schedule.len(),
                seq.duration
            )),
            Err(e) => outcome.failed(format!("{e:#}")),
        }
    }
}
