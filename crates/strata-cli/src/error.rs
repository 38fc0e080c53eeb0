use strata_store::MigrateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// The request could not be decoded.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Migrate(#[from] MigrateError),
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::UnknownCommand(_) => "unknown_command",
            DispatchError::InvalidRequest(_) => "invalid_argument",
            DispatchError::Migrate(e) => e.kind(),
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            DispatchError::Migrate(e) => e.version(),
            _ => None,
        }
    }
}
