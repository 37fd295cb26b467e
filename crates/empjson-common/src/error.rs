//! Error types shared across the workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value '{value}' for {setting}")]
    InvalidSetting { setting: &'static str, value: String },

    #[error("Invalid filter directive: {0}")]
    FilterDirective(String),

    #[error("Logging already initialised: {0}")]
    AlreadyInitialised(String),
}

impl CommonError {
    pub fn invalid(setting: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidSetting {
            setting,
            value: value.into(),
        }
    }
}
