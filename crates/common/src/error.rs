use thiserror::Error;

/// Startup-level errors shared across the workspace.
///
/// Everything here is fatal when raised during bootstrap; per-source and
/// per-delivery failures have their own error types in the crates that own
/// them.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ledger connection error: {0}")]
    LedgerConnection(String),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

impl AppError {
    pub fn config(message: impl Into<String>) -> Self {
        AppError::Config(message.into())
    }
}
