//! Error types for the service runtime

use strand_types::{ServiceId, TaskId};
use thiserror::Error;

/// Failure reported by a service's `init`
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Init(String),
}

impl ServiceError {
    pub fn init(message: impl Into<String>) -> Self {
        ServiceError::Init(message.into())
    }
}

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A service with this id is already registered
    #[error("a service with id '{0}' is already registered")]
    DuplicateService(ServiceId),

    /// The service's `init` returned an error or panicked
    #[error("service '{service}' failed to initialize: {source}")]
    Init {
        service: ServiceId,
        source: ServiceError,
    },

    /// The service thread died before reporting an init result
    #[error("service '{0}' terminated before reporting init")]
    InitAborted(ServiceId),
}

/// A scheduled background task panicked
///
/// Contained to the owning service: recorded in that service's fault log
/// and logged, without crashing dispatch or any other service.
#[derive(Debug, Clone, Error)]
#[error("task {task} ('{name}') of service '{service}' panicked: {message}")]
pub struct TaskFault {
    pub service: ServiceId,
    pub task: TaskId,
    pub name: String,
    pub message: String,
}

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
