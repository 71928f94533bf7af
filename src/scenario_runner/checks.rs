/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{ScenarioContext, ScenarioRunner, StepOutcome};
use crate::{
    config::{secs, Step, ValidateMetricsStep},
    metrics::validation::{evaluate, Bounds, MetricCheck},
    metrics_logger::lock_record,
};
use std::time::Duration;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

impl ScenarioRunner {
    /// Re-evaluates the check against the live record until it passes or `timeout` runs out.
    /// The last evaluation's reason is reported on failure.
    pub(super) async fn run_validation(
        &self,
        step: &Step,
        check: &ValidateMetricsStep,
        ctx: &mut ScenarioContext,
    ) -> StepOutcome {
        let mut outcome = StepOutcome::new(step);

        let kind = match check.check.parse::<MetricCheck>() {
            Ok(kind) => kind,
            Err(e) => return outcome.failed(format!("{e:#}")),
        };
        let bounds = Bounds {
            expected: check.expected,
            min: check.min_value,
            max: check.max_value,
        };

        let deadline = Instant::now() + secs(check.timeout);
        loop {
            outcome.attempts += 1;
            let validation = {
                let record = lock_record(&ctx.record);
                evaluate(kind, bounds, check.stream.as_deref(), &record, &self.config.thresholds)
            };
            if validation.passed {
                return outcome.succeeded(validation.reason);
            }

            let now = Instant::now();
            if now >= deadline {
                return outcome.failed(validation.reason);
            }
            let wait = POLL_INTERVAL.min(deadline - now);
            if self.pause(wait).await.is_err() {
                return outcome.failed(format!("interrupted: {}", validation.reason));
            }
        }
    }
}
