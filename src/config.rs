use crate::{
    error::OrchestratorError,
    metrics::validation::Thresholds,
    network::{NetworkCondition, StreamConfig},
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

static EXAMPLE_CONFIG: &str = include_str!("templates/scenarios.toml");

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Project root relative to the config file. Working directories and stream sources resolve
    /// against it.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub defaults: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioDefinition>,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl Config {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)?;
        File::write_all(&mut file, EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config file {}", path.display()))?
            .read_to_string(&mut config_str)?;

        let mut config = Config::try_from_str(&config_str)?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(config)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        let mut config = toml::from_str::<Config>(conf_str)
            .map_err(|e| OrchestratorError::configuration(format!("TOML parsing error: {}", e)))?;
        config.base_dir = PathBuf::from(".");
        for (name, scenario) in config.scenarios.iter_mut() {
            scenario.name = name.clone();
        }
        Ok(config)
    }

    pub fn example() -> anyhow::Result<Config> {
        Config::try_from_str(EXAMPLE_CONFIG)
    }

    pub fn project_root(&self) -> PathBuf {
        match &self.root {
            Some(root) => self.base_dir.join(root),
            None => self.base_dir.clone(),
        }
    }

    /// Resolves a path from the document against the project root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root().join(path)
        }
    }

    pub fn find_scenario(&self, scenario_name: &str) -> anyhow::Result<&ScenarioDefinition> {
        self.scenarios.get(scenario_name).ok_or_else(|| {
            OrchestratorError::configuration(format!(
                "Scenario '{}' not found in configuration",
                scenario_name
            ))
        })
    }

    /// `[defaults]` as upper-cased environment variables.
    pub fn default_env(&self) -> HashMap<String, String> {
        self.defaults
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.to_uppercase(), value)
            })
            .collect()
    }
}

/// Converts a seconds value from the scenario document into a `Duration`. Negative or
/// non-finite values collapse to zero.
pub fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

/// How to launch and reach the emulated media server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Program to run. Anything containing a path separator is treated as a build artifact that
    /// is reused when present and built with `build_command` otherwise.
    pub binary: String,
    /// Arguments placed before the generated ones.
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub build_command: Option<String>,
    pub host: String,
    pub scheme: String,
    pub base_port: u16,
    pub control_port_offset: u16,
    pub control_prefix: String,
    pub ready_timeout: f64,
    pub metrics_interval: f64,
    pub stop_timeout: f64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            binary: "target/release/source-videos".to_string(),
            args: vec![],
            cwd: None,
            build_command: Some("cargo build --release --bin source-videos".to_string()),
            host: "127.0.0.1".to_string(),
            scheme: "rtsp".to_string(),
            base_port: 8554,
            control_port_offset: 1000,
            control_prefix: "/api".to_string(),
            ready_timeout: 30.0,
            metrics_interval: 5.0,
            stop_timeout: 5.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScenarioDefinition {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub include_scenarios: Vec<String>,
    #[serde(default)]
    pub setup: Setup,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub cleanup: Cleanup,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ScenarioDefinition {
    pub fn is_composite(&self) -> bool {
        !self.include_scenarios.is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Setup {
    pub rtsp_server: Option<RtspServerSetup>,
    pub test_files: Option<TestFiles>,
    #[serde(default)]
    pub processes: Vec<BackgroundProcess>,
}

fn default_server_name() -> String {
    "rtsp_server".to_string()
}

/// Either a network-aware server (`streams` given) or a plain command.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RtspServerSetup {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_server_name")]
    pub name: String,
    pub command: Option<String>,
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
    pub port: Option<u16>,
    pub control_port: Option<u16>,
    #[serde(default)]
    pub startup_delay: f64,
    pub health_check: Option<HealthCheck>,
}

impl RtspServerSetup {
    pub fn is_network_aware(&self) -> bool {
        !self.streams.is_empty()
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_health_timeout() -> f64 {
    10.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheck {
    Tcp {
        #[serde(default = "default_host")]
        host: String,
        port: u16,
        #[serde(default = "default_health_timeout")]
        timeout: f64,
    },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TestFiles {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub files: Vec<GeneratedFile>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneratedFile {
    pub command: String,
    pub output: PathBuf,
    pub cwd: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_ready_timeout() -> f64 {
    30.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackgroundProcess {
    pub name: String,
    pub command: String,
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub ready_pattern: Option<String>,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout: f64,
    /// Feed this process's output to the metrics parser.
    #[serde(default = "default_true")]
    pub monitor: bool,
    #[serde(default)]
    pub shell: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Cleanup {
    #[serde(default)]
    pub remove_test_files: bool,
    #[serde(default)]
    pub remove_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Command(CommandStep),
    NetworkUpdate(NetworkUpdateStep),
    NetworkSequence(NetworkSequenceStep),
    ValidateMetrics(ValidateMetricsStep),
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::Command(step) => &step.name,
            Step::NetworkUpdate(step) => &step.name,
            Step::NetworkSequence(step) => &step.name,
            Step::ValidateMetrics(step) => &step.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Step::Command(_) => "command",
            Step::NetworkUpdate(_) => "network_update",
            Step::NetworkSequence(_) => "network_sequence",
            Step::ValidateMetrics(_) => "validate_metrics",
        }
    }
}

fn unnamed() -> String {
    "unnamed".to_string()
}

fn default_cwd() -> PathBuf {
    PathBuf::from(".")
}

fn default_step_timeout() -> f64 {
    300.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandStep {
    #[serde(default = "unnamed")]
    pub name: String,
    pub command: String,
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
    #[serde(default)]
    pub expected_exit_code: i32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_delay: f64,
    #[serde(default = "default_step_timeout")]
    pub timeout: f64,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub shell: bool,
    #[serde(default)]
    pub collect_metrics: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkUpdateStep {
    #[serde(default = "unnamed")]
    pub name: String,
    /// Defaults to the server started in setup.
    pub server: Option<String>,
    #[serde(default)]
    pub stream_index: usize,
    pub condition: NetworkCondition,
    #[serde(default)]
    pub wait: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduledCondition {
    pub at: f64,
    #[serde(flatten)]
    pub condition: NetworkCondition,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkSequenceStep {
    #[serde(default = "unnamed")]
    pub name: String,
    pub server: Option<String>,
    #[serde(default)]
    pub stream_index: usize,
    pub duration: f64,
    pub schedule: Vec<ScheduledCondition>,
}

fn default_validation_timeout() -> f64 {
    10.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValidateMetricsStep {
    #[serde(default = "unnamed")]
    pub name: String,
    pub check: String,
    pub expected: Option<f64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub stream: Option<String>,
    #[serde(default = "default_validation_timeout")]
    pub timeout: f64,
}
