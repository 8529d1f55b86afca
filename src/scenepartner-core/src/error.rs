//! Error types for the scene partner.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScenePartnerError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Speech error: {0}")]
    SpeechError(String),

    #[error("Unknown speech backend: {0}")]
    UnknownBackend(String),
}
