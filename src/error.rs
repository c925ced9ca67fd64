use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Export error: {0}")]
    Export(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Watcher closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<nix::Error> for GpioError {
    fn from(errno: nix::Error) -> Self {
        GpioError::Io(io::Error::from(errno))
    }
}
