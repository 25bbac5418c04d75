//! crates/plantgo_core/src/error.rs
//!
//! User-facing failures of the ledger, challenge and mission operations.

use crate::ports::PortError;

#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("Challenge not found.")]
    NotFound,
    #[error("This challenge has already ended.")]
    Expired,
    #[error("Could not generate a join code. Try again.")]
    Exhausted,
    #[error("Please log in.")]
    Unauthenticated,
    #[error("Invalid input: {0}")]
    Invalid(String),
    #[error("Service temporarily unavailable: {0}")]
    Transient(String),
}

impl From<PortError> for GameError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Unauthorized => GameError::Unauthenticated,
            other => GameError::Transient(other.to_string()),
        }
    }
}

pub type GameResult<T> = Result<T, GameError>;
