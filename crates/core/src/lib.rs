//! Shared primitives for every `stepwise` crate.

#![forbid(unsafe_code)]

/// Duration string parsing and formatting (`DurationString` grammar).
pub mod duration;

/// Step retry backoff policy and delay computation.
pub mod backoff;

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type used across every `stepwise` crate.
pub type AppResult<T> = Result<T, AppError>;

/// A validated non-empty UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NonEmptyString(String);

impl NonEmptyString {
    /// Creates a validated non-empty string.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::Validation(
                "value must not be empty or whitespace".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<NonEmptyString> for String {
    fn from(value: NonEmptyString) -> Self {
        value.0
    }
}

/// Scoping identifier for every run, attempt, and lease in the system.
///
/// Every backend query is filtered by namespace; there is no cross-namespace
/// visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespaceId(Uuid);

impl NamespaceId {
    /// Creates a random namespace identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a namespace identifier from an existing UUID value.
    #[must_use]
    pub fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    /// Returns the underlying UUID value.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NamespaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for NamespaceId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Error taxonomy shared by the runtime, the worker, and every backend.
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed duration, bad input, unknown workflow name, or similar.
    #[error("validation error: {0}")]
    Validation(String),

    /// Requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write operation conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A backend call was made against a run/attempt this worker no longer
    /// holds the lease on. Never surfaced to `Handle::result()`; the worker
    /// that stole the lease is authoritative.
    #[error("lease lost: {0}")]
    LeaseLost(String),

    /// Transient backend failure (connection drop, deadlock). Callers retry
    /// with bounded exponential backoff before escalating.
    #[error("transient backend error: {0}")]
    BackendTransient(String),

    /// Persistent backend failure (schema mismatch, auth failure) that
    /// requires operator intervention.
    #[error("backend error: {0}")]
    BackendFatal(String),

    /// A user step function returned an error.
    #[error("step failed: {0}")]
    StepFailed(String),

    /// Duplicate step name, overlapping step call, or cache disagreement
    /// within a single run execution.
    #[error("determinism violation: {0}")]
    DeterminismViolation(String),

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::{NamespaceId, NonEmptyString};

    #[test]
    fn non_empty_string_rejects_whitespace() {
        let result = NonEmptyString::new("   ");
        assert!(result.is_err());
    }

    #[test]
    fn namespace_id_formats_as_uuid() {
        let namespace_id = NamespaceId::new();
        assert_eq!(namespace_id.to_string().len(), 36);
    }
}
