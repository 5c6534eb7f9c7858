//! Error record shared by the [Mediator][crate::mediator::Mediator] pipeline
//! and the delivery-guarantee stores.
//!
//! Unlike the store-local error enums in this crate, dispatch failures cross
//! adapter boundaries: outer layers map them onto their transport's native
//! errors. The [Code] set is therefore closed and its string form is stable.

use std::fmt;
use std::sync::Arc;

use crate::version::ConflictError;

/// Stable failure codes surfaced by the dispatch pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// No handler is registered for the request type.
    NoHandler,
    /// A validation behavior rejected the request.
    Validation,
    /// An authentication behavior rejected the request.
    Unauthorized,
    /// An authorization behavior rejected the request.
    Forbidden,
    /// A rate-limit behavior rejected the request.
    RateLimited,
    /// An append was attempted with a stale expected version.
    ConcurrencyConflict,
    /// The inbox or idempotency store rejected a duplicate.
    Duplicate,
    /// A stream, snapshot or entry is absent.
    NotFound,
    /// A deadline elapsed before the handler completed.
    Timeout,
    /// The operation was cancelled by the caller.
    Cancelled,
    /// A handler failed in an unexpected way.
    Unhandled,
    /// A downstream adapter or dependency failed.
    DependencyFailed,
}

impl Code {
    /// The stable string form of the code, as seen by adapters.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Code::NoHandler => "NoHandler",
            Code::Validation => "Validation",
            Code::Unauthorized => "Unauthorized",
            Code::Forbidden => "Forbidden",
            Code::RateLimited => "RateLimited",
            Code::ConcurrencyConflict => "ConcurrencyConflict",
            Code::Duplicate => "Duplicate",
            Code::NotFound => "NotFound",
            Code::Timeout => "Timeout",
            Code::Cancelled => "Cancelled",
            Code::Unhandled => "Unhandled",
            Code::DependencyFailed => "DependencyFailed",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single field rejection carried by a [Code::Validation] error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// The rejected field.
    pub field: String,
    /// Why the field was rejected.
    pub message: String,
}

impl FieldError {
    /// Creates a new [FieldError] for the named field.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// The failure half of every dispatch result.
///
/// Carries a stable [Code], a human-readable message, the number of attempts
/// performed by the resilience wrapper (set on final failure only), the field
/// rejections of a validation failure, and an optional causing error.
#[derive(Debug, Clone)]
pub struct Error {
    code: Code,
    message: String,
    attempts: Option<u32>,
    fields: Vec<FieldError>,
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Creates a new [Error] with the given [Code] and message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            attempts: None,
            fields: Vec::new(),
            source: None,
        }
    }

    /// No handler is registered for the named request type.
    pub fn no_handler(request_type: &str) -> Self {
        Self::new(
            Code::NoHandler,
            format!("no handler registered for request type '{request_type}'"),
        )
    }

    /// A validation behavior rejected the request.
    pub fn validation(fields: Vec<FieldError>) -> Self {
        let mut error = Self::new(Code::Validation, "request failed validation");
        error.fields = fields;
        error
    }

    /// A duplicate message has been detected.
    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(Code::Duplicate, message)
    }

    /// The requested entity is absent.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    /// A deadline elapsed before the operation completed.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(Code::Timeout, message)
    }

    /// The operation was cancelled by the caller.
    pub fn cancelled() -> Self {
        Self::new(Code::Cancelled, "the operation was cancelled")
    }

    /// A handler failed in an unexpected way.
    pub fn unhandled(message: impl Into<String>) -> Self {
        Self::new(Code::Unhandled, message)
    }

    /// A downstream dependency failed.
    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(Code::DependencyFailed, message)
    }

    /// Records the number of attempts performed before this failure.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Records the error that caused this failure.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// The stable [Code] of this failure.
    pub fn code(&self) -> Code {
        self.code
    }

    /// The human-readable failure message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Number of attempts performed by the resilience wrapper, if any.
    pub fn attempts(&self) -> Option<u32> {
        self.attempts
    }

    /// Field rejections of a [Code::Validation] failure.
    pub fn fields(&self) -> &[FieldError] {
        &self.fields
    }

    /// Whether a retry might observe a different outcome.
    ///
    /// Deterministic refusals (validation, conflicts, absent entities) are
    /// excluded: the caller decides how to proceed with those.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, Code::Timeout | Code::DependencyFailed)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn std::error::Error + 'static))
    }
}

impl From<ConflictError> for Error {
    fn from(conflict: ConflictError) -> Self {
        Self::new(Code::ConcurrencyConflict, conflict.to_string()).with_source(conflict)
    }
}
