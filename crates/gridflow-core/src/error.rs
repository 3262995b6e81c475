//! Error types raised by the core crate.
//!
//! [`ValidationError`] is the only way a malformed network is reported; the
//! solver crate wraps it into its own error enum. [`LinalgError`] comes out of
//! the dense factorization backend in [`crate::linalg`].

use crate::diagnostics::{DiagnosticIssue, Entity};
use thiserror::Error;

/// A network failed validation.
///
/// `entity` and `reason` describe the first error found; `issues` holds every
/// error discovered in the same pass.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid {entity}: {reason}")]
pub struct ValidationError {
    pub entity: Entity,
    pub reason: String,
    pub issues: Vec<DiagnosticIssue>,
}

impl ValidationError {
    pub fn new(entity: Entity, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            issues: vec![DiagnosticIssue {
                severity: crate::diagnostics::Severity::Error,
                entity: entity.clone(),
                message: reason.clone(),
            }],
            entity,
            reason,
        }
    }

    /// Build from a non-empty list of error issues.
    pub(crate) fn from_issues(issues: Vec<DiagnosticIssue>) -> Self {
        let (entity, reason) = issues
            .first()
            .map(|i| (i.entity.clone(), i.message.clone()))
            .unwrap_or((Entity::Network, "validation failed".to_string()));
        Self {
            entity,
            reason,
            issues,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinalgError {
    #[error("matrix of dimension {dim} is singular to working precision")]
    Singular { dim: usize },

    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
}

pub type ValidationResult<T> = Result<T, ValidationError>;
