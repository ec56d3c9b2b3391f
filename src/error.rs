use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {source}")]
    HttpError {
        #[from]
        source: reqwest::Error,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: io::Error,
    },
    #[error("Config error: {source}")]
    ConfigParseError {
        #[from]
        source: figment::Error,
    },
    #[error("Config error: {message}")]
    ConfigError { message: String },
    #[error("Docker daemon error: {source}")]
    DockerError {
        #[from]
        source: bollard::errors::Error,
    },
    #[error("Appliance rejected the request: {message}")]
    ApplianceError { message: String },
    #[error("Appliance request timed out: {message}")]
    TimeoutError { message: String },
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::ConfigError {
            message: message.into(),
        }
    }
}
