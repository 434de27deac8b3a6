use thiserror::Error;

#[derive(Error, Debug)]
pub enum StitchError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Upstream returned status {0}")]
    UpstreamStatus(u16),

    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    #[error("No live instance of '{service}' matching '{range}'")]
    NoInstance { service: String, range: String },

    #[error("Service '{service}' unavailable for '{path}': live call impossible and no cached fallback")]
    Unavailable { service: String, path: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Version error: {0}")]
    Version(#[from] semver::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StitchError {
    /// Whether the resilient client should try its cache before surfacing
    /// this error. Covers breaker denials, failed calls, and discovery
    /// misses; invalid input and local IO problems are not recoverable
    /// from cache.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            StitchError::Transport(_)
                | StitchError::Timeout(_)
                | StitchError::UpstreamStatus(_)
                | StitchError::CircuitOpen(_)
                | StitchError::NoInstance { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, StitchError>;
