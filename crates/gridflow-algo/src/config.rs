//! Solver configuration.
//!
//! [`SolverConfig`] selects the solver variant and carries every tunable the
//! solvers read. It deserializes from TOML with partial documents allowed;
//! unspecified keys take the defaults below.
//!
//! ```toml
//! solver_type = "fast_decoupled"
//! tolerance = 1e-9
//! enforce_reactive_limits = true
//! deadline_ms = 250
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SolveError;

/// Power-flow formulation used for a plain solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverType {
    Dc,
    #[default]
    Newton,
    FastDecoupled,
}

/// Fast-decoupled variant: which matrix drops series resistance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FdMethod {
    /// Resistance dropped from B' (Stott and Alsac).
    #[default]
    Xb,
    /// Resistance dropped from B'' (van Amerongen).
    Bx,
}

/// Optimal power flow formulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpfFormulation {
    /// Lossless active-power network with linearized flows.
    Dc,
    /// Full polar AC network with reactive power and voltage limits.
    Ac,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Mismatch infinity-norm tolerance (pu).
    pub tolerance: f64,

    /// Power-flow iteration cap.
    pub max_iterations: usize,

    pub solver_type: SolverType,

    /// Switch PV buses to PQ when their generators hit reactive limits.
    pub enforce_reactive_limits: bool,

    /// Solve an optimal power flow instead of a plain power flow.
    pub opf_enabled: bool,

    /// Overrides the formulation implied by `solver_type` when set.
    pub opf_formulation: Option<OpfFormulation>,

    /// Interior-point iteration cap.
    pub opf_max_iterations: usize,

    /// Interior-point feasibility, gradient and complementarity tolerance.
    pub opf_tolerance: f64,

    pub fd_method: FdMethod,

    /// Per-bus PV/PQ switch budget before a solve is declared oscillating.
    pub max_bus_type_switches: usize,

    /// Wall-clock budget in milliseconds.
    pub deadline_ms: Option<u64>,

    /// Report non-convergence as an error instead of a DIVERGED solution.
    pub strict: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 30,
            solver_type: SolverType::Newton,
            enforce_reactive_limits: false,
            opf_enabled: false,
            opf_formulation: None,
            opf_max_iterations: 150,
            opf_tolerance: 1e-6,
            fd_method: FdMethod::Xb,
            max_bus_type_switches: 4,
            deadline_ms: None,
            strict: false,
        }
    }
}

impl SolverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dc() -> Self {
        Self::default().with_solver_type(SolverType::Dc)
    }

    pub fn newton() -> Self {
        Self::default().with_solver_type(SolverType::Newton)
    }

    pub fn fast_decoupled() -> Self {
        Self::default().with_solver_type(SolverType::FastDecoupled)
    }

    pub fn with_solver_type(mut self, solver_type: SolverType) -> Self {
        self.solver_type = solver_type;
        self
    }

    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.tolerance = tol;
        self
    }

    pub fn with_max_iterations(mut self, max_iter: usize) -> Self {
        self.max_iterations = max_iter;
        self
    }

    pub fn with_reactive_limits(mut self, enable: bool) -> Self {
        self.enforce_reactive_limits = enable;
        self
    }

    pub fn with_opf(mut self, enable: bool) -> Self {
        self.opf_enabled = enable;
        self
    }

    pub fn with_opf_formulation(mut self, formulation: OpfFormulation) -> Self {
        self.opf_formulation = Some(formulation);
        self
    }

    pub fn with_opf_max_iterations(mut self, max_iter: usize) -> Self {
        self.opf_max_iterations = max_iter;
        self
    }

    pub fn with_fd_method(mut self, method: FdMethod) -> Self {
        self.fd_method = method;
        self
    }

    pub fn with_max_bus_type_switches(mut self, switches: usize) -> Self {
        self.max_bus_type_switches = switches;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    /// OPF formulation actually used: the explicit override, else DC for the
    /// DC solver type and AC otherwise.
    pub fn effective_opf_formulation(&self) -> OpfFormulation {
        self.opf_formulation.unwrap_or(match self.solver_type {
            SolverType::Dc => OpfFormulation::Dc,
            SolverType::Newton | SolverType::FastDecoupled => OpfFormulation::Ac,
        })
    }

    pub fn validate(&self) -> Result<(), SolveError> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(SolveError::InvalidConfig(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if !(self.opf_tolerance.is_finite() && self.opf_tolerance > 0.0) {
            return Err(SolveError::InvalidConfig(format!(
                "opf_tolerance must be positive, got {}",
                self.opf_tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(SolveError::InvalidConfig(
                "max_iterations must be at least 1".into(),
            ));
        }
        if self.opf_enabled && self.opf_max_iterations == 0 {
            return Err(SolveError::InvalidConfig(
                "opf_max_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Parse a (possibly partial) TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, SolveError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, SolveError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, SolveError> {
        toml::to_string(self).map_err(|e| SolveError::InvalidConfig(e.to_string()))
    }
}
