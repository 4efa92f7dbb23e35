use thiserror::Error;

pub type EngineResult<T> = Result<T, AttributionError>;

#[derive(Error, Debug)]
pub enum AttributionError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Degenerate model: {0}")]
    DegenerateModel(String),

    #[error("Intractable model: {channels} channels exceeds the exact-enumeration ceiling of {ceiling}; set max_combination_size")]
    IntractableModel { channels: usize, ceiling: usize },

    #[error("Empty input: {0}")]
    EmptyInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for AttributionError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
