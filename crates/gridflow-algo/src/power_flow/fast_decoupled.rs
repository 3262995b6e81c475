//! Fast-Decoupled Power Flow (FDPF) Solver
//!
//! Implements the Stott-Alsac fast-decoupled load flow method which decouples
//! the P-θ and Q-V subproblems for faster iterations on well-conditioned networks.
//!
//! ## Algorithm Overview
//!
//! Instead of solving the full Jacobian system, FDPF uses:
//! - B' matrix for P-θ subproblem: ΔP/V = B' × Δθ
//! - B'' matrix for Q-V subproblem: ΔQ/V = B'' × ΔV
//!
//! Both are built from the admittance assembly with parts of the model
//! switched off:
//!
//! | matrix | bus shunts | line charging | tap magnitude | phase shift | resistance (XB / BX) |
//! |--------|------------|---------------|---------------|-------------|----------------------|
//! | B'     | dropped    | dropped       | forced to 1   | kept        | dropped / kept       |
//! | B''    | kept       | kept          | kept          | dropped     | kept / dropped       |
//!
//! The matrices are constant, so each is factorized once. B'' is refactorized
//! only when reactive-limit switching changes the set of PQ buses.
//! Reactive limits are checked on the same schedule as the Newton solver:
//! after a full P-θ/Q-V sweep once the mismatch is below
//! [`LIMIT_CHECK_MISMATCH`], and at the convergence test.
//!
//! ## References
//!
//! - Stott & Alsac (1974): "Fast Decoupled Load Flow"
//!   IEEE Trans. PAS, 93(3), 859-869
//!   DOI: [10.1109/TPAS.1974.293985](https://doi.org/10.1109/TPAS.1974.293985)
//! - van Amerongen (1989): "A General-Purpose Version of the Fast Decoupled Load Flow"
//!   IEEE Trans. Power Systems, 4(2), 760-770
//!   DOI: [10.1109/59.193851](https://doi.org/10.1109/59.193851)

use std::time::Duration;

use gridflow_core::{AdmittanceBuilder, LuFactor, NetworkModel};
use num_complex::Complex64;
use sprs::CsMat;
use tracing::{debug, info, warn};

use super::bus_state::{BusStates, LimitCheck};
use super::mismatch::{
    inf_norm, mismatch_at, mismatch_vector, power_mismatch, submatrix, voltages,
};
use super::newton::{Best, LIMIT_CHECK_MISMATCH};
use super::{ac_solution, check_energized, initial_voltages, AcTermination, Deadline};
use crate::config::{FdMethod, SolverConfig};
use crate::error::{SolveError, SolveResult};
use crate::solution::{DivergenceReason, Solution, SolveStatus, SolverKind};

/// Build the full-size B' and B'' matrices for the given variant.
pub fn build_b_matrices(network: &NetworkModel, method: FdMethod) -> (CsMat<f64>, CsMat<f64>) {
    let mut b_prime = AdmittanceBuilder::new(network)
        .without_bus_shunts()
        .without_line_charging()
        .without_taps();
    let mut b_double_prime = AdmittanceBuilder::new(network).without_phase_shift();
    match method {
        FdMethod::Xb => b_prime = b_prime.without_resistance(),
        FdMethod::Bx => b_double_prime = b_double_prime.without_resistance(),
    }
    (
        b_prime.build().susceptance(),
        b_double_prime.build().susceptance(),
    )
}

fn factor(matrix: &CsMat<f64>, keep: &[usize], name: &str) -> SolveResult<LuFactor> {
    LuFactor::from_triplets(&submatrix(matrix, keep)).map_err(|_| SolveError::singular(name))
}

/// Fast-decoupled AC power flow solver
#[derive(Debug, Clone)]
pub struct FastDecoupledPowerFlowSolver {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub enforce_q_limits: bool,
    pub max_bus_type_switches: usize,
    pub method: FdMethod,
    pub deadline: Option<Duration>,
}

impl Default for FastDecoupledPowerFlowSolver {
    fn default() -> Self {
        Self::from_config(&SolverConfig::default())
    }
}

impl FastDecoupledPowerFlowSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            tolerance: config.tolerance,
            max_iterations: config.max_iterations,
            enforce_q_limits: config.enforce_reactive_limits,
            max_bus_type_switches: config.max_bus_type_switches,
            method: config.fd_method,
            deadline: config.deadline(),
        }
    }

    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.tolerance = tol;
        self
    }

    pub fn with_max_iterations(mut self, max_iter: usize) -> Self {
        self.max_iterations = max_iter;
        self
    }

    pub fn with_q_limit_enforcement(mut self, enable: bool) -> Self {
        self.enforce_q_limits = enable;
        self
    }

    pub fn with_method(mut self, method: FdMethod) -> Self {
        self.method = method;
        self
    }

    pub fn solve(&self, network: &NetworkModel) -> SolveResult<Solution> {
        let clock = Deadline::start(self.deadline);
        check_energized(network, "fast-decoupled B' matrix")?;

        let y = network.admittance();
        let (b_prime, b_double_prime) = build_b_matrices(network, self.method);

        let (mut vm, mut va) = initial_voltages(network);
        let mut states = BusStates::new(network);
        let mut index = states.index();
        let base_spec = network.scheduled_injection_pu();
        let mut s_spec = base_spec.clone();

        // B' covers every non-slack bus and never changes
        let lu_p = factor(&b_prime, &index.pvpq, "fast-decoupled B' matrix")?;
        let mut lu_q = factor(&b_double_prime, &index.pq, "fast-decoupled B'' matrix")?;

        let mut best = Best::new(&vm, &va);
        let mut iterations = 0;
        let status = loop {
            iterations += 1;
            let v = voltages(&vm, &va);
            let ds = power_mismatch(y, &v, &s_spec);
            let norm = inf_norm(&mismatch_vector(&ds, &index));
            debug!(iteration = iterations, mismatch = norm, "fast-decoupled iteration");

            if norm.is_nan() {
                break SolveStatus::Diverged(DivergenceReason::NumericalBreakdown);
            }
            best.offer(norm, &vm, &va);

            let mut check = None;
            if norm < self.tolerance {
                if !self.enforce_q_limits {
                    break SolveStatus::Converged;
                }
                let s_calc: Vec<Complex64> = ds.iter().zip(&s_spec).map(|(d, s)| d + s).collect();
                check = Some(states.enforce_limits(&s_calc, &mut vm, self.max_bus_type_switches));
                if check == Some(LimitCheck::Unchanged) {
                    break SolveStatus::Converged;
                }
            }
            if check.is_none() {
                if iterations >= self.max_iterations {
                    break SolveStatus::Diverged(DivergenceReason::MaxIterations);
                }
                if clock.expired() {
                    warn!(iteration = iterations, "power flow deadline reached");
                    break SolveStatus::Diverged(DivergenceReason::Deadline);
                }

                // P-θ half step
                let dp: Vec<f64> = index.pvpq.iter().map(|&i| ds[i].re / vm[i]).collect();
                let dtheta = lu_p
                    .solve(&dp)
                    .map_err(|_| SolveError::singular("fast-decoupled B' matrix"))?;
                for (k, &i) in index.pvpq.iter().enumerate() {
                    va[i] -= dtheta[k];
                }

                // Q-V half step at the updated angles
                if !index.pq.is_empty() {
                    let ds = power_mismatch(y, &voltages(&vm, &va), &s_spec);
                    let dq: Vec<f64> = index.pq.iter().map(|&i| ds[i].im / vm[i]).collect();
                    let dv = lu_q
                        .solve(&dq)
                        .map_err(|_| SolveError::singular("fast-decoupled B'' matrix"))?;
                    for (k, &i) in index.pq.iter().enumerate() {
                        vm[i] -= dv[k];
                    }
                }

                if self.enforce_q_limits && norm < LIMIT_CHECK_MISMATCH {
                    let s_calc = y.injections(&voltages(&vm, &va));
                    check = Some(states.enforce_limits(&s_calc, &mut vm, self.max_bus_type_switches));
                }
            }

            match check {
                Some(LimitCheck::Oscillating) => {
                    break SolveStatus::Diverged(DivergenceReason::BusTypeOscillation)
                }
                Some(LimitCheck::Switched) => {
                    index = states.index();
                    s_spec.clone_from(&base_spec);
                    states.apply_pins(&mut s_spec);
                    lu_q = factor(&b_double_prime, &index.pq, "fast-decoupled B'' matrix")?;
                    best.rebase(mismatch_at(y, &vm, &va, &s_spec, &index), &vm, &va);
                    debug!(pq_buses = index.pq.len(), "B'' refactorized");
                    if norm < self.tolerance && iterations >= self.max_iterations {
                        break SolveStatus::Diverged(DivergenceReason::MaxIterations);
                    }
                }
                _ => {}
            }
        };

        if status != SolveStatus::Converged {
            best.restore(&mut vm, &mut va);
        }
        let max_mismatch = best.norm;

        info!(
            solver = "fast_decoupled",
            %status,
            iterations,
            max_mismatch,
            "power flow complete"
        );

        Ok(ac_solution(
            network,
            AcTermination {
                solver: SolverKind::FastDecoupled,
                status,
                iterations,
                max_mismatch,
                vm: &vm,
                va: &va,
                states: &states,
                deadline: &clock,
            },
        ))
    }
}
