use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Schema fetch error: {0}")]
    SchemaFetch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Warehouse error: {0}")]
    Warehouse(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Cache store error: {0}")]
    CacheStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Message text without the variant prefix, as surfaced to the user
    /// and fed back into repair prompts.
    pub fn message(&self) -> String {
        match self {
            AgentError::SchemaFetch(m)
            | AgentError::Config(m)
            | AgentError::Warehouse(m)
            | AgentError::Generation(m)
            | AgentError::CacheStore(m) => m.clone(),
            AgentError::Io(e) => e.to_string(),
            AgentError::Json(e) => e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
