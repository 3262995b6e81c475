use gridflow_core::{BusId, ValidationError};
use thiserror::Error;

use crate::opf::ConstraintViolation;
use crate::solution::{SolveStatus, SolverKind};

/// Errors raised by the solvers.
///
/// Structural problems (validation, singular systems) abort a solve.
/// Non-convergence is normally reported through [`crate::Solution::status`];
/// it only becomes [`SolveError::Convergence`] when the configuration asks
/// for strict behavior.
#[derive(Error, Debug)]
pub enum SolveError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("singular matrix in {context}{}", unreachable_suffix(.bus))]
    SingularMatrix { context: String, bus: Option<BusId> },

    #[error("{solver} solve {status} after {iterations} iterations (mismatch {max_mismatch:.3e})")]
    Convergence {
        solver: SolverKind,
        status: SolveStatus,
        iterations: usize,
        max_mismatch: f64,
    },

    #[error("optimal power flow infeasible ({reason}): {} violated constraint(s)", .violations.len())]
    Infeasible {
        reason: String,
        violations: Vec<ConstraintViolation>,
    },

    #[error("invalid solver configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

fn unreachable_suffix(bus: &Option<BusId>) -> String {
    match bus {
        Some(id) => format!(": bus {} is not connected to a slack bus", id.value()),
        None => String::new(),
    }
}

impl SolveError {
    pub(crate) fn singular(context: impl Into<String>) -> Self {
        SolveError::SingularMatrix {
            context: context.into(),
            bus: None,
        }
    }
}

pub type SolveResult<T> = Result<T, SolveError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solution::DivergenceReason;

    #[test]
    fn singular_message_names_bus() {
        let err = SolveError::SingularMatrix {
            context: "DC susceptance matrix".into(),
            bus: Some(BusId::new(12)),
        };
        assert_eq!(
            err.to_string(),
            "singular matrix in DC susceptance matrix: bus 12 is not connected to a slack bus"
        );
        assert_eq!(
            SolveError::singular("Newton Jacobian").to_string(),
            "singular matrix in Newton Jacobian"
        );
    }

    #[test]
    fn convergence_message() {
        let err = SolveError::Convergence {
            solver: SolverKind::Newton,
            status: SolveStatus::Diverged(DivergenceReason::MaxIterations),
            iterations: 10,
            max_mismatch: 0.5,
        };
        let text = err.to_string();
        assert!(text.contains("newton"));
        assert!(text.contains("max iterations"));
    }
}
