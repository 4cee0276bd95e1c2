use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected script response: {0}")]
    ScriptResponse(String),
}

pub type Result<T> = std::result::Result<T, CoordError>;
