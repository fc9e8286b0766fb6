//! Error types for the lanwatch-discover crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("Nmap not found at path: {path}")]
    NmapNotFound { path: String },

    #[error("Nmap exited with code {code}: {stderr}")]
    NmapFailed { code: i32, stderr: String },

    #[error("Failed to parse nmap XML output: {0}")]
    XmlParse(String),

    #[error("Scan timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Scan cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] lanwatch_core::LanwatchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiscoverError>;
