//! Error types for tunsvc

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunsvcError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// External command ran but reported failure
    #[error("Command '{cmd}' failed{}: {stderr}", exit_code_suffix(.code))]
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },

    /// Writing the transient credential file failed
    #[error("Failed to stage credentials at {path:?}: {source}")]
    StageCredentials {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The tunnel executable could not be launched
    #[error("Failed to spawn tunnel process '{binary}': {source}")]
    SpawnFailed {
        binary: String,
        #[source]
        source: io::Error,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for TunsvcError {
    fn from(error: serde_json::Error) -> Self {
        TunsvcError::ConfigError(error.to_string())
    }
}

fn exit_code_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {}", code),
        None => String::new(),
    }
}

pub type TunsvcResult<T> = Result<T, TunsvcError>;
