//! Messages passed between pipeline stages.

use crate::error::ExecutionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The canonical request relayed from intake to the responder and on to the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub language_key: String,
    pub code: String,
    pub callback_url: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub is_modal_round_trip: bool,
}

/// How the guest process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitIndicator {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitIndicator {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitIndicator {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit status {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Output of one sandbox run.
///
/// `failure_reason` is only set when the guest program itself failed (non-zero
/// exit, fatal signal, or a failed compile step). Standard error of a successful
/// run is not part of the result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub exit: ExitIndicator,
    pub failure_reason: Option<String>,
}

impl ExecutionResult {
    /// Text shown to the user: stdout, followed by the failure reason if any.
    pub fn rendered_output(&self) -> String {
        match &self.failure_reason {
            None => self.stdout.clone(),
            Some(reason) if self.stdout.is_empty() => reason.clone(),
            Some(reason) if self.stdout.ends_with('\n') => format!("{}{}", self.stdout, reason),
            Some(reason) => format!("{}\n{}", self.stdout, reason),
        }
    }
}

/// What the sandbox stage hands back across the stage boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SandboxReply {
    Completed { result: ExecutionResult },
    Failed { error: ExecutionError },
}

impl From<Result<ExecutionResult, ExecutionError>> for SandboxReply {
    fn from(outcome: Result<ExecutionResult, ExecutionError>) -> Self {
        match outcome {
            Ok(result) => SandboxReply::Completed { result },
            Err(error) => SandboxReply::Failed { error },
        }
    }
}
