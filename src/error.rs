use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Kick failed: {0}")]
    Kick(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
