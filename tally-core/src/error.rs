use tally_types::{TraceStep, ValidationReport};
use thiserror::Error;
use uuid::Uuid;

/// Ways a turn can end without an answer.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("Result validation failed")]
    ValidationFailed {
        turn_id: Uuid,
        report: ValidationReport,
        trace: Vec<TraceStep>,
    },
    /// The incremental receiver went away; no further stage was started.
    #[error("turn cancelled: receiver dropped")]
    Cancelled,
}

impl TurnError {
    pub fn code(&self) -> &'static str {
        match self {
            TurnError::EmptyMessage => "empty_message",
            TurnError::ValidationFailed { .. } => "validation_failed",
            TurnError::Cancelled => "cancelled",
        }
    }
}
