/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod control_client;
pub mod controller;
pub mod probe;
pub mod profiles;
pub mod schedule;
pub mod server_command;

use crate::error::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr};

pub use controller::NetworkImpairmentController;
pub use schedule::{ConditionSchedule, ScheduleEntry};

/// A sparse description of network impairment. Only the fields that are set are ever turned into
/// flags or payload entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_kbps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_duplication: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_reorder: Option<f64>,
}

const PROFILE_FLAG: &str = "--network-profile";
const SCENARIO_FLAG: &str = "--network-scenario";
const PACKET_LOSS_FLAG: &str = "--packet-loss";
const LATENCY_FLAG: &str = "--latency";
const BANDWIDTH_FLAG: &str = "--bandwidth";
const JITTER_FLAG: &str = "--jitter";
const DUPLICATION_FLAG: &str = "--packet-duplication";
const REORDER_FLAG: &str = "--packet-reorder";

impl NetworkCondition {
    pub fn profile(name: &str) -> Self {
        Self {
            profile: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Flag/value pairs for the media server command line, in a fixed order.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![];
        let mut push = |flag: &str, value: Option<String>| {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value);
            }
        };

        push(PROFILE_FLAG, self.profile.clone());
        push(SCENARIO_FLAG, self.scenario.clone());
        push(PACKET_LOSS_FLAG, self.packet_loss.map(|v| v.to_string()));
        push(LATENCY_FLAG, self.latency_ms.map(|v| v.to_string()));
        push(BANDWIDTH_FLAG, self.bandwidth_kbps.map(|v| v.to_string()));
        push(JITTER_FLAG, self.jitter_ms.map(|v| v.to_string()));
        push(DUPLICATION_FLAG, self.packet_duplication.map(|v| v.to_string()));
        push(REORDER_FLAG, self.packet_reorder.map(|v| v.to_string()));
        args
    }

    /// Recovers a condition from the flags produced by [`NetworkCondition::to_cli_args`].
    /// Flags that don't describe network conditions are skipped.
    pub fn from_cli_args<S: AsRef<str>>(args: &[S]) -> anyhow::Result<Self> {
        let mut condition = Self::default();
        let mut iter = args.iter().map(AsRef::as_ref);

        while let Some(flag) = iter.next() {
            let known = [
                PROFILE_FLAG,
                SCENARIO_FLAG,
                PACKET_LOSS_FLAG,
                LATENCY_FLAG,
                BANDWIDTH_FLAG,
                JITTER_FLAG,
                DUPLICATION_FLAG,
                REORDER_FLAG,
            ];
            if !known.contains(&flag) {
                continue;
            }

            let value = iter.next().ok_or_else(|| {
                OrchestratorError::configuration(format!("flag {flag} is missing its value"))
            })?;
            match flag {
                PROFILE_FLAG => condition.profile = Some(value.to_string()),
                SCENARIO_FLAG => condition.scenario = Some(value.to_string()),
                PACKET_LOSS_FLAG => condition.packet_loss = Some(parse_value(flag, value)?),
                LATENCY_FLAG => condition.latency_ms = Some(parse_value(flag, value)?),
                BANDWIDTH_FLAG => condition.bandwidth_kbps = Some(parse_value(flag, value)?),
                JITTER_FLAG => condition.jitter_ms = Some(parse_value(flag, value)?),
                DUPLICATION_FLAG => condition.packet_duplication = Some(parse_value(flag, value)?),
                REORDER_FLAG => condition.packet_reorder = Some(parse_value(flag, value)?),
                _ => {}
            }
        }

        Ok(condition)
    }

    /// Fills the unset loss/latency/bandwidth fields from the named profile, if it is known.
    /// Explicitly set fields always win.
    pub fn resolved(&self) -> Self {
        let mut resolved = self.clone();
        if let Some(profile) = self.profile.as_deref().and_then(profiles::lookup) {
            resolved.packet_loss = resolved.packet_loss.or(Some(profile.packet_loss));
            resolved.latency_ms = resolved.latency_ms.or(Some(profile.latency_ms));
            resolved.bandwidth_kbps = resolved.bandwidth_kbps.or(Some(profile.bandwidth_kbps));
        }
        resolved
    }
}

fn parse_value<T: FromStr>(flag: &str, value: &str) -> anyhow::Result<T> {
    value.parse::<T>().map_err(|_| {
        OrchestratorError::configuration(format!("invalid value '{value}' for {flag}"))
    })
}

fn default_auto_repeat() -> bool {
    true
}

/// One logical stream served by a media server instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub source: PathBuf,
    pub mount: String,
    #[serde(default)]
    pub network: NetworkCondition,
    #[serde(default = "default_auto_repeat")]
    pub auto_repeat: bool,
}

impl StreamConfig {
    pub fn new(source: impl Into<PathBuf>, mount: &str) -> Self {
        Self {
            source: source.into(),
            mount: mount.to_string(),
            network: NetworkCondition::default(),
            auto_repeat: true,
        }
    }

    pub fn with_condition(mut self, condition: NetworkCondition) -> Self {
        self.network = condition;
        self
    }

    /// Mount point without leading slashes.
    pub fn mount_path(&self) -> &str {
        self.mount.trim_start_matches('/')
    }
}

/// Point-in-time snapshot of what a running server reports on its metrics route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerMetrics {
    pub streams: u64,
    pub clients: u64,
    pub bytes_sent: u64,
    pub errors: u64,
    #[serde(rename = "uptime")]
    pub uptime_seconds: f64,
}
