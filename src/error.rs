use thiserror::Error;

#[derive(Error, Debug)]
pub enum CouncilError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Unsupported finish reason: {reason}")]
    UnsupportedFinishReason { reason: String },

    #[error("Tool round limit exceeded: {rounds} rounds")]
    ToolRoundLimit { rounds: usize },

    #[error("Call depth exceeded: depth {depth}, max {max}")]
    CallDepthExceeded { depth: usize, max: usize },

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Operation interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CouncilError {
    /// Failures of the model provider or its HTTP transport; the only
    /// class worth retrying.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CouncilError::Provider(_)
                | CouncilError::Http(_)
                | CouncilError::UnsupportedFinishReason { .. }
        )
    }
}

pub type CouncilResult<T> = Result<T, CouncilError>;
