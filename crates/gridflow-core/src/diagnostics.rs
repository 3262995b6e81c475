//! Issue collection for network validation.
//!
//! Validation walks the whole model and records every problem it finds rather
//! than stopping at the first one. Errors make [`crate::NetworkBuilder::build`]
//! fail; warnings are kept on the validated model so callers (and the solvers'
//! logging) can surface them.
//!
//! ```
//! use gridflow_core::diagnostics::{Diagnostics, Entity};
//! use gridflow_core::BusId;
//!
//! let mut diag = Diagnostics::new();
//! diag.warn(Entity::Bus(BusId::new(4)), "voltage-controlled bus has no generator");
//! diag.error(Entity::Network, "base MVA must be positive");
//!
//! assert_eq!(diag.warning_count(), 1);
//! assert!(diag.has_errors());
//! ```

use crate::{BranchId, BusId, GenId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which part of the model an issue refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Network,
    Bus(BusId),
    Branch(BranchId),
    Gen(GenId),
    /// A connected component, identified by its lowest-indexed bus.
    Island { first_bus: BusId, bus_count: usize },
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Network => write!(f, "network"),
            Entity::Bus(id) => write!(f, "bus {}", id.value()),
            Entity::Branch(id) => write!(f, "branch {}", id.value()),
            Entity::Gen(id) => write!(f, "generator {}", id.value()),
            Entity::Island {
                first_bus,
                bus_count,
            } => write!(
                f,
                "island containing bus {} ({} buses)",
                first_bus.value(),
                bus_count
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// The model is usable but something will be interpreted specially.
    Warning,
    /// The model cannot be solved.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticIssue {
    pub severity: Severity,
    pub entity: Entity,
    pub message: String,
}

impl fmt::Display for DiagnosticIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "[{}] {}: {}", severity, self.entity, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<DiagnosticIssue>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, entity: Entity, message: impl Into<String>) {
        self.issues.push(DiagnosticIssue {
            severity: Severity::Warning,
            entity,
            message: message.into(),
        });
    }

    pub fn error(&mut self, entity: Entity, message: impl Into<String>) {
        self.issues.push(DiagnosticIssue {
            severity: Severity::Error,
            entity,
            message: message.into(),
        });
    }

    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.errors().count()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings().count()
    }

    pub fn errors(&self) -> impl Iterator<Item = &DiagnosticIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &DiagnosticIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Split into errors and warnings, preserving discovery order.
    pub fn partition(self) -> (Vec<DiagnosticIssue>, Vec<DiagnosticIssue>) {
        self.issues
            .into_iter()
            .partition(|i| i.severity == Severity::Error)
    }
}
