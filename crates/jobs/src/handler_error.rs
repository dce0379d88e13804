//! Errors raised by business handlers, and their retry classification.

use std::panic::Location;

use jobwarden_core::StructMap;
use thiserror::Error;

use crate::seal::SealReason;

/// Result of a business handler: a non-empty result map, or a classified error.
pub type HandlerResult = Result<StructMap, HandlerError>;

/// How the dispatch layer must react to a handler failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HandlerErrorKind {
    /// Consumes one attempt; the job is dispatched again while budget remains.
    Retryable,
    /// The handler noticed the job was revoked while it was running.
    Revoked,
    /// The business operation failed for a reason retrying cannot fix.
    BusinessLogic,
    /// The work ran past its allotted time.
    TimeoutExceeded,
    /// The handler asked for the job to be stopped.
    Terminated,
}

impl HandlerErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerErrorKind::Retryable)
    }

    /// Reason a job is sealed with when it fails with this kind of error.
    ///
    /// `None` for retryable errors: those only seal once the retry budget is
    /// exhausted.
    pub fn seal_reason(&self) -> Option<SealReason> {
        match self {
            HandlerErrorKind::Retryable => None,
            HandlerErrorKind::TimeoutExceeded => Some(SealReason::TimeoutExceeded),
            HandlerErrorKind::Revoked
            | HandlerErrorKind::BusinessLogic
            | HandlerErrorKind::Terminated => Some(SealReason::NonRetryableError),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerErrorKind::Retryable => "retryable",
            HandlerErrorKind::Revoked => "revoked",
            HandlerErrorKind::BusinessLogic => "business-logic",
            HandlerErrorKind::TimeoutExceeded => "timeout-exceeded",
            HandlerErrorKind::Terminated => "terminated",
        }
    }
}

impl core::fmt::Display for HandlerErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PreviousError {
    code: Option<u32>,
    message: String,
}

/// Error returned by a business handler.
///
/// Captures where it was constructed (file and line) so that the failure
/// history of a job points back at the raising code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} handler error: {message}")]
pub struct HandlerError {
    kind: HandlerErrorKind,
    code: u32,
    message: String,
    file: &'static str,
    line: u32,
    previous: Option<PreviousError>,
}

impl HandlerError {
    #[track_caller]
    pub fn new(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            kind,
            code: 0,
            message: message.into(),
            file: location.file(),
            line: location.line(),
            previous: None,
        }
    }

    #[track_caller]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Retryable, message)
    }

    #[track_caller]
    pub fn business(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::BusinessLogic, message)
    }

    #[track_caller]
    pub fn revoked(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Revoked, message)
    }

    #[track_caller]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::TimeoutExceeded, message)
    }

    #[track_caller]
    pub fn terminated(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Terminated, message)
    }

    /// Attach an application-specific error code.
    pub fn with_code(mut self, code: u32) -> Self {
        self.code = code;
        self
    }

    /// Record the error that led to this one. Blank messages are dropped.
    pub fn caused_by(mut self, code: Option<u32>, message: impl Into<String>) -> Self {
        let message = message.into();
        self.previous = (!message.trim().is_empty()).then_some(PreviousError { code, message });
        self
    }

    pub fn kind(&self) -> HandlerErrorKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn file(&self) -> &'static str {
        self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn previous_code(&self) -> Option<u32> {
        self.previous.as_ref().and_then(|p| p.code)
    }

    pub fn previous_message(&self) -> Option<&str> {
        self.previous.as_ref().map(|p| p.message.as_str())
    }
}

/// Unclassified errors are retryable.
///
/// A `HandlerError` wrapped in the `anyhow` chain keeps its classification.
impl From<anyhow::Error> for HandlerError {
    #[track_caller]
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<HandlerError>() {
            Ok(handler_error) => handler_error,
            Err(error) => {
                let previous = error.chain().nth(1).map(|cause| cause.to_string());
                let err = HandlerError::retryable(error.to_string());
                match previous {
                    Some(previous) => err.caused_by(None, previous),
                    None => err,
                }
            }
        }
    }
}
