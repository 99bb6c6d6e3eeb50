//! Runtime error types.

use crate::context::{ContextId, ContextKind};
use crate::deployment::DeploymentId;
use std::fmt;
use std::sync::Arc;

/// Boxed error returned by fallible task bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned synchronously by the runtime API.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// An operation that needs an event loop was invoked from another kind of context
    #[error("Cannot use {operation} from a {kind} context")]
    IllegalContextUse {
        /// Operation that was attempted
        operation: String,
        /// Kind of the context it was attempted from
        kind: ContextKind,
    },

    /// The context no longer accepts tasks
    #[error("Context {0} is closed")]
    ContextClosed(ContextId),

    /// The runtime has been shut down
    #[error("Runtime is shut down")]
    Shutdown,

    /// Options failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Thread spawn or file I/O error
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// No deployment with that id
    #[error("Unknown deployment: {0}")]
    UnknownDeployment(DeploymentId),

    /// A bounded wait ran out of time
    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

/// Runtime API result
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Failure of a task body, reported asynchronously.
///
/// Never propagated across threads as a panic; it reaches either the
/// context's exception handler or a result continuation.
#[derive(Clone, thiserror::Error)]
pub enum TaskFailure {
    /// The task panicked; carries the panic message
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// A blocking body or lifecycle hook returned an error
    #[error("Task failed: {0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// The task was discarded before it ran
    #[error("Task cancelled")]
    Cancelled,
}

impl TaskFailure {
    /// Build a failure from a panic payload caught by `catch_unwind`
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        TaskFailure::Panicked(message)
    }

    /// Whether this failure is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskFailure::Cancelled)
    }
}

impl From<BoxError> for TaskFailure {
    fn from(err: BoxError) -> Self {
        TaskFailure::Failed(Arc::from(err))
    }
}

impl fmt::Debug for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::Panicked(msg) => f.debug_tuple("Panicked").field(msg).finish(),
            TaskFailure::Failed(err) => f.debug_tuple("Failed").field(&err.to_string()).finish(),
            TaskFailure::Cancelled => f.write_str("Cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payload_messages() {
        let failure = TaskFailure::from_panic(Box::new("boom"));
        assert!(matches!(failure, TaskFailure::Panicked(ref m) if m == "boom"));

        let failure = TaskFailure::from_panic(Box::new(String::from("owned boom")));
        assert!(matches!(failure, TaskFailure::Panicked(ref m) if m == "owned boom"));

        let failure = TaskFailure::from_panic(Box::new(42u32));
        assert!(matches!(failure, TaskFailure::Panicked(_)));
    }

    #[test]
    fn test_failed_from_box_error() {
        let err: BoxError = "disk on fire".into();
        let failure = TaskFailure::from(err);
        assert_eq!(failure.to_string(), "Task failed: disk on fire");
        assert!(!failure.is_cancelled());
        assert!(TaskFailure::Cancelled.is_cancelled());
    }

    #[test]
    fn test_illegal_context_use_message() {
        let err = RuntimeError::IllegalContextUse {
            operation: "HttpServer".to_string(),
            kind: ContextKind::Worker,
        };
        assert_eq!(err.to_string(), "Cannot use HttpServer from a worker context");
    }
}
