use std::time::Duration;

/// Transport-level failures of the remote execution channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },
    #[error("authentication to {host} failed: {reason}")]
    AuthFailed { host: String, reason: String },
    #[error("command on {host} exited with {exit_code}: {command}: {stderr}")]
    RemoteCommandFailed {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("command on {host} timed out after {timeout:?}: {command}")]
    Timeout {
        host: String,
        command: String,
        timeout: Duration,
    },
    #[error("file transfer with {host} failed: {reason}")]
    Transfer { host: String, reason: String },
}

impl ChannelError {
    /// Connection-level failures that a caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::Unreachable { .. } | ChannelError::Timeout { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CutoverError {
    #[error("lock {key} is held by {holder}")]
    LockHeld { key: String, holder: String },
    #[error("source {host} unavailable: {reason}")]
    SourceUnavailable { host: String, reason: String },
    #[error("database {database} not found on {host}")]
    DatabaseNotFound { host: String, database: String },
    #[error("artifact {reference} not found: {reason}")]
    ArtifactMissing { reference: String, reason: String },
    #[error("backup {0} missing or empty")]
    BackupMissing(String),
    #[error("health gate failed after {attempts} attempts: {detail}")]
    HealthGateFailed { attempts: u32, detail: String },
    #[error("release rolled back: {0}")]
    RolledBack(String),
    #[error("verification found {0} mismatched collections")]
    VerifyMismatch(usize),
    #[error("interrupted during {stage}; retry required")]
    Cancelled { stage: String },
}

/// Process exit code for the final outcome of a command.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<CutoverError>() {
        Some(CutoverError::RolledBack(_)) => 2,
        Some(CutoverError::LockHeld { .. }) => 3,
        Some(CutoverError::Cancelled { .. }) => 130,
        _ => 1,
    }
}
