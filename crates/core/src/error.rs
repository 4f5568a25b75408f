use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(String),
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("paper resolution failed: {0}")]
    Resolution(String),
    #[error("passage retrieval failed: {0}")]
    Retrieval(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("other: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;

impl From<anyhow::Error> for ChatError {
    fn from(value: anyhow::Error) -> Self {
        Self::Other(value.to_string())
    }
}
