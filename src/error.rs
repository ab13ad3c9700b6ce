//! Error taxonomy for the live tracking subsystem.
//!
//! None of these are fatal to a route screen. Each component decides how its
//! errors degrade: the decoder drops records, the directory excludes stops,
//! the ETA client falls back or reports an absent result, and the refresh
//! orchestrator keeps the last-known-good state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    /// A stream record whose coordinates did not parse to finite numbers.
    #[error("Malformed telemetry record: {0}")]
    MalformedTelemetry(String),

    /// The station directory has no exact-name entry for a stop.
    #[error("No directory entry for stop {0:?}")]
    NotFound(String),

    /// The ETA oracle answered with its quota-exhausted status.
    #[error("ETA oracle quota exceeded")]
    OracleQuotaExceeded,

    #[error("ETA oracle unavailable: {0}")]
    OracleUnavailable(String),

    /// Fewer than two stops resolved an ETA during a refresh cycle.
    #[error("Only {resolved} ETA(s) resolved, at least 2 are needed for a bracket")]
    InsufficientBracketData { resolved: usize },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Position stream error: {0}")]
    Stream(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        TrackerError::Network(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TrackerError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TrackerError::Stream(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;
