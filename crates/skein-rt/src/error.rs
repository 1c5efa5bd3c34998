// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error types.
//!
//! Everything that reaches a callback is a `DomainError`. Faults that are
//! not already domain errors get wrapped through `DomainError::runtime`,
//! which keeps the message and nothing else.

use std::any::Any;
use std::fmt;

use thiserror::Error;

use crate::future::FutureId;

/// Where a domain error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainErrorKind {
    /// Raised by managed code itself (a method body, a default expression).
    User,
    /// Built by the runtime to wrap an unexpected fault.
    Runtime,
}

impl fmt::Display for DomainErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainErrorKind::User => write!(f, "error"),
            DomainErrorKind::Runtime => write!(f, "runtime error"),
        }
    }
}

/// An error value produced by managed code, delivered via `notify_failure`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct DomainError {
    pub kind: DomainErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<Box<DomainError>>,
}

impl DomainError {
    /// A domain error raised by managed code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: DomainErrorKind::User,
            message: message.into(),
            cause: None,
        }
    }

    /// Generic runtime error wrapping an unexpected fault. Only the
    /// message survives.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: DomainErrorKind::Runtime,
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap a panic payload caught with `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::runtime(panic_message(payload.as_ref()))
    }

    pub fn with_cause(mut self, cause: DomainError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn is_runtime(&self) -> bool {
        self.kind == DomainErrorKind::Runtime
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Argument validation failure. Returned synchronously by the invocation
/// entry points, before any future exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("object cannot be null")]
    NullObject,
    #[error("method name cannot be null")]
    NullMethodName,
}

/// Misuse of the write-once future protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FutureError {
    #[error("future {future} is already completed")]
    AlreadyCompleted { future: FutureId },
}

/// The scheduler refused a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("scheduler is shut down")]
    ShutDown,
    #[error("future {future} was already scheduled")]
    AlreadyScheduled { future: FutureId },
}

/// Bad runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid worker pool size `{value}`: expected a positive integer")]
    InvalidPoolSize { value: String },
}
