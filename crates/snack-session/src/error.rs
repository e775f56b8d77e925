use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnackError {
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("bundle for {name} not ready after {attempts} attempts")]
    BundlerTimeout { name: String, attempts: u32 },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}
