pub mod clap_args;
pub mod config;
pub mod error;
pub mod metrics;
pub mod metrics_logger;
pub mod network;
pub mod process_control;
pub mod scenario_runner;
