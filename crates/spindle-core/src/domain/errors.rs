//! Errors - エラー型と分類

use thiserror::Error;

use super::ids::TaskId;
use super::task::TaskType;

/// Operational classification of an error.
///
/// - Transient: worth retrying.
/// - Permanent: retrying cannot help.
/// - Infrastructure: the datastore or runtime failed, not the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum SpindleError {
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("payload serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("handler not found for task_type={0}")]
    HandlerNotFound(TaskType),

    #[error("duplicate handler for task_type={0}")]
    DuplicateHandler(TaskType),

    #[error("missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("lease lost for {task_id}")]
    LeaseLost { task_id: TaskId },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SpindleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpindleError::Persistence(_) => ErrorKind::Infrastructure,
            SpindleError::LeaseLost { .. } => ErrorKind::Transient,
            SpindleError::InvalidTask(_)
            | SpindleError::Serialization(_)
            | SpindleError::HandlerNotFound(_)
            | SpindleError::DuplicateHandler(_)
            | SpindleError::MissingTaskTypes(_)
            | SpindleError::Config(_) => ErrorKind::Permanent,
        }
    }
}

/// Failure reported by a task handler.
///
/// `Transient` failures go through back-off and the dead-queue check;
/// `Permanent` ones are dead-lettered right away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    kind: ErrorKind,
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == ErrorKind::Permanent
    }
}

impl From<SpindleError> for HandlerError {
    fn from(err: SpindleError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::Permanent => HandlerError::permanent(message),
            _ => HandlerError::new(message),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds() {
        assert_eq!(
            SpindleError::Persistence("disk".into()).kind(),
            ErrorKind::Infrastructure
        );
        assert_eq!(
            SpindleError::HandlerNotFound(TaskType::new("x")).kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn handler_error_defaults_to_transient() {
        let err = HandlerError::from("smtp timeout");
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.to_string(), "smtp timeout");
        assert!(HandlerError::permanent("bad payload").is_permanent());
    }

    #[test]
    fn permanent_spindle_errors_stay_permanent_in_handlers() {
        let err: HandlerError = SpindleError::InvalidTask("empty".into()).into();
        assert!(err.is_permanent());
        assert!(err.message().contains("empty"));
    }
}
