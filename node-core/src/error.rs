use thiserror::Error;

/// Unified error type for the node control agent.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("unknown tag: {0}")]
    UnknownTag(String),

    #[error("duplicate user: {0}")]
    DuplicateUser(String),

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("engine down: {0}")]
    EngineDown(String),

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("failed to spawn child process: {0}")]
    ChildSpawnFailed(String),

    #[error("failed to bind port: {0}")]
    PortBindFailed(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("usage collection timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal: {0}")]
    Internal(String),
}

impl NodeError {
    /// Whether this error should be logged at warn (expected, recoverable)
    /// rather than surfaced as a hard failure to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NodeError::DuplicateUser(_)
                | NodeError::UnknownUser(_)
                | NodeError::EngineDown(_)
                | NodeError::Timeout
        )
    }
}
