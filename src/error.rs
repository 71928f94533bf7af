use std::time::Duration;

/// Failures the orchestrator distinguishes between. These are raised inside `anyhow::Error` so
/// callers that care about the kind can `downcast_ref::<OrchestratorError>()`.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Missing source file, unknown scenario reference, malformed step. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Port never opened, pattern never appeared or control status never succeeded.
    #[error("{what} not ready after {timeout:?}")]
    ReadinessTimeout { what: String, timeout: Duration },

    /// Wrong exit code or step timeout once all retries are exhausted.
    #[error("step '{name}' failed: {reason}")]
    StepFailure { name: String, reason: String },

    /// Control endpoint unreachable or answered with a non-200 status.
    #[error("control channel error: {0}")]
    ControlChannel(String),

    /// A supervised process exited while something was waiting on it.
    #[error("process '{name}' exited unexpectedly (exit code {code:?})")]
    ProcessCrash { name: String, code: Option<i32> },
}

impl OrchestratorError {
    pub fn configuration(msg: impl Into<String>) -> anyhow::Error {
        OrchestratorError::Configuration(msg.into()).into()
    }

    pub fn control_channel(msg: impl Into<String>) -> anyhow::Error {
        OrchestratorError::ControlChannel(msg.into()).into()
    }

    pub fn readiness_timeout(what: impl Into<String>, timeout: Duration) -> anyhow::Error {
        OrchestratorError::ReadinessTimeout {
            what: what.into(),
            timeout,
        }
        .into()
    }
}

/// Returns the orchestrator error kind carried by `err`, if any.
pub fn kind_of(err: &anyhow::Error) -> Option<&OrchestratorError> {
    err.downcast_ref::<OrchestratorError>()
}

