//! Output record shared by every solver.
//!
//! A [`Solution`] is created fresh by each solve and never refers back into
//! the network model; all quantities are copied out in engineering units
//! (MW, Mvar, pu voltage, radians) alongside the element ids.

use std::fmt;

use gridflow_core::{BranchId, BusId, BusType, GenId};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    Dc,
    Newton,
    FastDecoupled,
    DcOpf,
    AcOpf,
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SolverKind::Dc => "dc",
            SolverKind::Newton => "newton",
            SolverKind::FastDecoupled => "fast-decoupled",
            SolverKind::DcOpf => "dc-opf",
            SolverKind::AcOpf => "ac-opf",
        };
        f.write_str(name)
    }
}

/// Why an iterative solve stopped without converging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceReason {
    /// Iteration cap reached with the mismatch above tolerance.
    MaxIterations,
    /// A bus kept flipping between PV and PQ.
    BusTypeOscillation,
    /// Wall-clock budget exhausted.
    Deadline,
    /// The iterate became non-finite or the step collapsed.
    NumericalBreakdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    Converged,
    Diverged(DivergenceReason),
}

impl fmt::Display for DivergenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DivergenceReason::MaxIterations => "max iterations",
            DivergenceReason::BusTypeOscillation => "bus type oscillation",
            DivergenceReason::Deadline => "deadline",
            DivergenceReason::NumericalBreakdown => "numerical breakdown",
        };
        f.write_str(reason)
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStatus::Converged => f.write_str("converged"),
            SolveStatus::Diverged(reason) => write!(f, "diverged ({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusResult {
    pub id: BusId,
    /// Bus type at termination; PV buses switched to PQ show up as PQ.
    pub bus_type: BusType,
    /// Voltage magnitude (pu)
    pub vm: f64,
    /// Voltage angle (rad)
    pub va: f64,
    /// Net injection into the network (generation minus load), MW
    pub p_injection_mw: f64,
    pub q_injection_mvar: f64,
    /// Locational marginal price of active power, $/MWh (OPF only)
    pub lmp: Option<f64>,
    /// Marginal price of reactive power, $/Mvarh (AC OPF only)
    pub q_price: Option<f64>,
    /// Multiplier on the lower voltage limit (AC OPF only)
    pub mu_v_min: Option<f64>,
    /// Multiplier on the upper voltage limit (AC OPF only)
    pub mu_v_max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchFlow {
    pub id: BranchId,
    pub in_service: bool,
    /// Power entering the branch at the from end
    pub p_from_mw: f64,
    pub q_from_mvar: f64,
    /// Power entering the branch at the to end
    pub p_to_mw: f64,
    pub q_to_mvar: f64,
    /// Multiplier on the from-end flow limit, $/MVAh (OPF only)
    pub mu_s_from: Option<f64>,
    /// Multiplier on the to-end flow limit, $/MVAh (OPF only)
    pub mu_s_to: Option<f64>,
}

impl BranchFlow {
    /// Series and charging losses, MW.
    pub fn loss_mw(&self) -> f64 {
        self.p_from_mw + self.p_to_mw
    }

    pub fn loss_mvar(&self) -> f64 {
        self.q_from_mvar + self.q_to_mvar
    }

    /// Apparent power at the more loaded end, MVA.
    pub fn max_apparent_mva(&self) -> f64 {
        self.p_from_mw
            .hypot(self.q_from_mvar)
            .max(self.p_to_mw.hypot(self.q_to_mvar))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenDispatch {
    pub id: GenId,
    pub bus: BusId,
    pub in_service: bool,
    pub p_mw: f64,
    pub q_mvar: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub solver: SolverKind,
    pub status: SolveStatus,
    pub iterations: usize,
    /// Infinity norm of the power mismatch at the returned iterate (pu)
    pub max_mismatch: f64,
    pub buses: Vec<BusResult>,
    pub branches: Vec<BranchFlow>,
    pub gens: Vec<GenDispatch>,
    /// Total generation cost, $/hr (OPF only)
    pub objective: Option<f64>,
    pub solve_time_ms: u128,
}

impl Solution {
    pub fn is_converged(&self) -> bool {
        self.status == SolveStatus::Converged
    }

    pub fn bus(&self, id: BusId) -> Option<&BusResult> {
        self.buses.iter().find(|b| b.id == id)
    }

    pub fn branch(&self, id: BranchId) -> Option<&BranchFlow> {
        self.branches.iter().find(|b| b.id == id)
    }

    pub fn gen(&self, id: GenId) -> Option<&GenDispatch> {
        self.gens.iter().find(|g| g.id == id)
    }

    /// Complex bus voltages in network order.
    pub fn voltages(&self) -> Vec<Complex64> {
        self.buses
            .iter()
            .map(|b| Complex64::from_polar(b.vm, b.va))
            .collect()
    }

    pub fn total_generation_mw(&self) -> f64 {
        self.gens.iter().map(|g| g.p_mw).sum()
    }

    pub fn total_losses_mw(&self) -> f64 {
        self.branches.iter().map(BranchFlow::loss_mw).sum()
    }

    /// Per-bus LMPs in network order, `None` for plain power flows.
    pub fn lmps(&self) -> Option<Vec<f64>> {
        self.buses.iter().map(|b| b.lmp).collect()
    }
}
