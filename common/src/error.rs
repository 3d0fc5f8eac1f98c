use thiserror::Error;

/// A schedule payload that could not be turned into a [`crate::Schedule`].
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule payload is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("schedule field `{field}` is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failures reported by the remote API collaborator (schedule fetch or telemetry).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("server rejected the device credential (401)")]
    Unauthorized,

    #[error("network is unreachable")]
    Offline,

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential must be exactly {expected} characters, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("credential is missing")]
    Missing,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("device is not in recovery mode")]
    NotInRecovery,

    #[error("credential rejected: {0}")]
    Rejected(#[from] CredentialError),

    #[error("failed to persist credential: {0}")]
    Storage(String),
}
