//! # AC Power Flow Solver with Newton-Raphson Method
//!
//! Full Newton-Raphson AC power flow in polar coordinates with optional
//! reactive power limit enforcement (PV-PQ bus switching).
//!
//! ## Bus Classifications
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  BUS TYPE  │  SPECIFIED         │  CALCULATED        │  EQUATIONS       │
//! │────────────│────────────────────│────────────────────│──────────────────│
//! │  SLACK     │  |V|, θ (θ = 0)    │  P, Q              │  none            │
//! │  PV        │  P, |V|            │  Q, θ              │  ΔP              │
//! │  PQ        │  P, Q              │  |V|, θ            │  ΔP, ΔQ          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Iteration
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  NEWTON-RAPHSON ITERATION                                                │
//! │  ────────────────────────                                                │
//! │                                                                           │
//! │  1. Mismatch      ΔS = V ∘ conj(Ybus·V) − S_spec                          │
//! │                   F  = [ Re ΔS(pv,pq) ; Im ΔS(pq) ]                       │
//! │                                                                           │
//! │  2. Converged?    ‖F‖∞ < tolerance                                       │
//! │                                                                           │
//! │  3. Jacobian      J = [ ∂P/∂θ   ∂P/∂|V| ]                                │
//! │                       [ ∂Q/∂θ   ∂Q/∂|V| ]                                │
//! │                                                                           │
//! │  4. Step          J·Δx = −F                                              │
//! │                   θ(pv,pq) += Δθ,  |V|(pq) += Δ|V|                       │
//! │                                                                           │
//! │  5. Q limits      PV buses outside [Qmin, Qmax] become PQ at the limit   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Step 5 is gated. Reactive output is compared with the generator limits
//! only once the mismatch that produced the update is below
//! [`LIMIT_CHECK_MISMATCH`], and again at the convergence test.
//! When a check over-runs `max_bus_type_switches` the classification is left
//! as it was, so the reported bus types belong to the returned iterate.
//!
//! The iteration count is the number of mismatch evaluations, so a network
//! that already satisfies the balance equations (for instance a lone slack
//! bus) converges in one iteration.
//!
//! ## Termination
//!
//! ```text
//!   INIT ──► ITERATING ──► CONVERGED
//!                 │
//!                 └──────► DIVERGED ( max iterations | bus type oscillation
//!                                     | deadline | numerical breakdown )
//! ```
//!
//! A diverged solve returns the iterate with the smallest mismatch seen.
//! A singular Jacobian is an error, not a divergence.
//!
//! ## References
//!
//! - **Tinney & Hart (1967)**: "Power Flow Solution by Newton's Method"
//!   IEEE Trans. PAS, 86(11), 1449-1460.
//!   DOI: [10.1109/TPAS.1967.291823](https://doi.org/10.1109/TPAS.1967.291823)
//!
//! - **Zimmerman, Murillo-Sánchez & Thomas (2011)**: "MATPOWER: Steady-State
//!   Operations, Planning and Analysis Tools for Power Systems Research and
//!   Education", IEEE Trans. Power Systems, 26(1), 12-19.
//!   DOI: [10.1109/TPWRS.2010.2051168](https://doi.org/10.1109/TPWRS.2010.2051168)

use std::time::Duration;

use gridflow_core::{LuFactor, NetworkModel};
use num_complex::Complex64;
use tracing::{debug, info, warn};

use super::bus_state::{BusStates, LimitCheck};
use super::mismatch::{
    inf_norm, jacobian, mismatch_at, mismatch_vector, power_mismatch, voltage_derivatives,
    voltages,
};
use super::{ac_solution, check_energized, initial_voltages, AcTermination, Deadline};
use crate::config::SolverConfig;
use crate::error::{SolveError, SolveResult};
use crate::solution::{DivergenceReason, Solution, SolveStatus, SolverKind};

/// Once the mismatch is this small the reactive output of PV buses is
/// trusted enough to check it against the generator limits.
pub(crate) const LIMIT_CHECK_MISMATCH: f64 = 1e-3;

/// Newton-Raphson AC power flow solver
#[derive(Debug, Clone)]
pub struct NewtonPowerFlowSolver {
    /// Convergence tolerance for the mismatch infinity norm (pu)
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Whether to enforce generator Q limits (PV-PQ switching)
    pub enforce_q_limits: bool,
    /// Per-bus switch budget before the solve is declared oscillating
    pub max_bus_type_switches: usize,
    pub deadline: Option<Duration>,
}

impl Default for NewtonPowerFlowSolver {
    fn default() -> Self {
        Self::from_config(&SolverConfig::default())
    }
}

impl NewtonPowerFlowSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            tolerance: config.tolerance,
            max_iterations: config.max_iterations,
            enforce_q_limits: config.enforce_reactive_limits,
            max_bus_type_switches: config.max_bus_type_switches,
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

    /// Enable or disable Q-limit enforcement
    pub fn with_q_limit_enforcement(mut self, enable: bool) -> Self {
        self.enforce_q_limits = enable;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Solve AC power flow for the given network
    pub fn solve(&self, network: &NetworkModel) -> SolveResult<Solution> {
        let clock = Deadline::start(self.deadline);
        check_energized(network, "Newton Jacobian")?;

        let y = network.admittance();
        let (mut vm, mut va) = initial_voltages(network);
        let mut states = BusStates::new(network);
        let mut index = states.index();
        let base_spec = network.scheduled_injection_pu();
        let mut s_spec = base_spec.clone();

        let mut best = Best::new(&vm, &va);
        let mut iterations = 0;
        let status = loop {
            iterations += 1;
            let v = voltages(&vm, &va);
            let ds = power_mismatch(y, &v, &s_spec);
            let f = mismatch_vector(&ds, &index);
            let norm = inf_norm(&f);
            debug!(iteration = iterations, mismatch = norm, "newton iteration");

            if norm.is_nan() {
                break SolveStatus::Diverged(DivergenceReason::NumericalBreakdown);
            }
            best.offer(norm, &vm, &va);

            if norm < self.tolerance {
                if !self.enforce_q_limits {
                    break SolveStatus::Converged;
                }
                let s_calc: Vec<Complex64> = ds.iter().zip(&s_spec).map(|(d, s)| d + s).collect();
                match states.enforce_limits(&s_calc, &mut vm, self.max_bus_type_switches) {
                    LimitCheck::Unchanged => break SolveStatus::Converged,
                    LimitCheck::Oscillating => {
                        break SolveStatus::Diverged(DivergenceReason::BusTypeOscillation)
                    }
                    LimitCheck::Switched => {
                        index = states.index();
                        s_spec.clone_from(&base_spec);
                        states.apply_pins(&mut s_spec);
                        // the converged point is re-scored under the new bus types
                        best.rebase(mismatch_at(y, &vm, &va, &s_spec, &index), &vm, &va);
                        if iterations >= self.max_iterations {
                            break SolveStatus::Diverged(DivergenceReason::MaxIterations);
                        }
                        continue;
                    }
                }
            }
            if iterations >= self.max_iterations {
                break SolveStatus::Diverged(DivergenceReason::MaxIterations);
            }
            if clock.expired() {
                warn!(iteration = iterations, "power flow deadline reached");
                break SolveStatus::Diverged(DivergenceReason::Deadline);
            }

            let (d_va, d_vm) = voltage_derivatives(y.ybus(), &v);
            let jac = jacobian(&d_va, &d_vm, &index);
            let neg_f: Vec<f64> = f.iter().map(|x| -x).collect();
            let dx = LuFactor::from_triplets(&jac)
                .and_then(|lu| lu.solve(&neg_f))
                .map_err(|_| SolveError::singular("Newton Jacobian"))?;

            let npvpq = index.pvpq.len();
            for (k, &i) in index.pvpq.iter().enumerate() {
                va[i] += dx[k];
            }
            for (k, &i) in index.pq.iter().enumerate() {
                vm[i] += dx[npvpq + k];
            }

            if self.enforce_q_limits && norm < LIMIT_CHECK_MISMATCH {
                let s_calc = y.injections(&voltages(&vm, &va));
                match states.enforce_limits(&s_calc, &mut vm, self.max_bus_type_switches) {
                    LimitCheck::Unchanged => {}
                    LimitCheck::Oscillating => {
                        break SolveStatus::Diverged(DivergenceReason::BusTypeOscillation)
                    }
                    LimitCheck::Switched => {
                        index = states.index();
                        s_spec.clone_from(&base_spec);
                        states.apply_pins(&mut s_spec);
                        best.rebase(mismatch_at(y, &vm, &va, &s_spec, &index), &vm, &va);
                    }
                }
            }
        };

        let max_mismatch = if status == SolveStatus::Converged {
            best.norm
        } else {
            best.restore(&mut vm, &mut va);
            best.norm
        };

        info!(
            solver = "newton",
            %status,
            iterations,
            max_mismatch,
            "power flow complete"
        );

        Ok(ac_solution(
            network,
            AcTermination {
                solver: SolverKind::Newton,
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

/// Lowest-mismatch iterate seen under the current bus classification.
#[derive(Debug, Clone)]
pub(crate) struct Best {
    pub norm: f64,
    vm: Vec<f64>,
    va: Vec<f64>,
}

impl Best {
    pub(crate) fn new(vm: &[f64], va: &[f64]) -> Self {
        Self {
            norm: f64::INFINITY,
            vm: vm.to_vec(),
            va: va.to_vec(),
        }
    }

    pub(crate) fn offer(&mut self, norm: f64, vm: &[f64], va: &[f64]) {
        if norm <= self.norm {
            self.norm = norm;
            self.vm.copy_from_slice(vm);
            self.va.copy_from_slice(va);
        }
    }

    /// Forget earlier iterates and start over from `(vm, va)`.
    pub(crate) fn rebase(&mut self, norm: f64, vm: &[f64], va: &[f64]) {
        self.norm = norm;
        self.vm.copy_from_slice(vm);
        self.va.copy_from_slice(va);
    }

    /// Move the stored iterate back into `vm`/`va`; a no-op if nothing was recorded.
    pub(crate) fn restore(&self, vm: &mut [f64], va: &mut [f64]) {
        if self.norm.is_finite() {
            vm.copy_from_slice(&self.vm);
            va.copy_from_slice(&self.va);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::{Branch, BranchId, Bus, BusId, BusType, Gen, GenId, NetworkBuilder};

    fn slack_only() -> NetworkModel {
        let mut b = NetworkBuilder::new(100.0);
        b.add_bus(Bus::new(BusId::new(1), BusType::Slack, 138.0).with_load(20.0, 5.0))
            .add_gen(Gen::new(GenId::new(1), BusId::new(1)).with_voltage_setpoint(1.02));
        b.build().unwrap()
    }

    /// Slack feeding a PV bus with tight reactive limits and a heavy reactive load.
    fn q_limited(qmax: f64) -> NetworkModel {
        let mut b = NetworkBuilder::new(100.0);
        b.add_bus(Bus::new(BusId::new(1), BusType::Slack, 138.0))
            .add_bus(Bus::new(BusId::new(2), BusType::PV, 138.0).with_load(40.0, 50.0))
            .add_branch(Branch::new(BranchId::new(1), BusId::new(1), BusId::new(2), 0.01, 0.1))
            .add_gen(Gen::new(GenId::new(1), BusId::new(1)).with_q_limits(-100.0, 100.0))
            .add_gen(
                Gen::new(GenId::new(2), BusId::new(2))
                    .with_output(50.0, 0.0)
                    .with_q_limits(0.0, qmax),
            );
        b.build().unwrap()
    }

    #[test]
    fn slack_only_converges_in_one_iteration() {
        let sol = NewtonPowerFlowSolver::new().solve(&slack_only()).unwrap();
        assert!(sol.is_converged());
        assert_eq!(sol.iterations, 1);
        assert_eq!(sol.max_mismatch, 0.0);
        assert!((sol.buses[0].vm - 1.02).abs() < 1e-15);
        assert!((sol.gens[0].p_mw - 20.0).abs() < 1e-9);
    }

    #[test]
    fn converges_quadratically_on_two_buses() {
        let sol = NewtonPowerFlowSolver::new().solve(&q_limited(100.0)).unwrap();
        assert!(sol.is_converged());
        assert!(sol.iterations <= 6);
        assert!(sol.max_mismatch < 1e-8);
        assert!((sol.buses[1].vm - 1.0).abs() < 1e-12);
        // generator 2 supplies more than its 10 Mvar worth of the local load
        assert!(sol.gens[1].q_mvar > 10.0);
    }

    #[test]
    fn reactive_limit_switches_bus_to_pq() {
        let sol = NewtonPowerFlowSolver::new()
            .with_q_limit_enforcement(true)
            .solve(&q_limited(10.0))
            .unwrap();
        assert!(sol.is_converged());
        assert_eq!(sol.buses[1].bus_type, BusType::PQ);
        assert!((sol.gens[1].q_mvar - 10.0).abs() < 1e-6);
        assert!(sol.buses[1].vm < 1.0);
    }

    #[test]
    fn iteration_cap_reports_max_iterations() {
        let sol = NewtonPowerFlowSolver::new()
            .with_max_iterations(1)
            .solve(&q_limited(100.0))
            .unwrap();
        assert_eq!(
            sol.status,
            SolveStatus::Diverged(DivergenceReason::MaxIterations)
        );
        assert_eq!(sol.iterations, 1);
    }

    #[test]
    fn expired_deadline_reports_deadline() {
        let sol = NewtonPowerFlowSolver::new()
            .with_deadline(Duration::ZERO)
            .solve(&q_limited(100.0))
            .unwrap();
        assert_eq!(sol.status, SolveStatus::Diverged(DivergenceReason::Deadline));
    }

    /// Unloaded PV bus whose generator must produce at least 5 Mvar.
    fn q_floor() -> NetworkModel {
        let mut b = NetworkBuilder::new(100.0);
        b.add_bus(Bus::new(BusId::new(1), BusType::Slack, 138.0))
            .add_bus(Bus::new(BusId::new(2), BusType::PV, 138.0))
            .add_branch(Branch::new(BranchId::new(1), BusId::new(1), BusId::new(2), 0.01, 0.1))
            .add_gen(Gen::new(GenId::new(1), BusId::new(1)))
            .add_gen(Gen::new(GenId::new(2), BusId::new(2)).with_q_limits(5.0, 10.0));
        b.build().unwrap()
    }

    #[test]
    fn switch_on_last_iteration_keeps_finite_mismatch() {
        let sol = NewtonPowerFlowSolver::new()
            .with_q_limit_enforcement(true)
            .with_max_iterations(1)
            .solve(&q_floor())
            .unwrap();
        assert_eq!(
            sol.status,
            SolveStatus::Diverged(DivergenceReason::MaxIterations)
        );
        assert_eq!(sol.iterations, 1);
        assert_eq!(sol.buses[1].bus_type, BusType::PQ);
        // flat start scored against the pinned 5 Mvar target
        assert!((sol.max_mismatch - 0.05).abs() < 1e-9, "{}", sol.max_mismatch);

        let text = serde_json::to_string(&sol).unwrap();
        let back: Solution = serde_json::from_str(&text).unwrap();
        assert_eq!(back.max_mismatch, sol.max_mismatch);
    }

    #[test]
    fn best_iterate_tracking() {
        let mut best = Best::new(&[1.0], &[0.0]);
        best.offer(0.5, &[0.9], &[0.1]);
        best.offer(0.7, &[0.8], &[0.2]);
        let (mut vm, mut va) = (vec![0.0], vec![0.0]);
        best.restore(&mut vm, &mut va);
        assert_eq!((vm[0], va[0]), (0.9, 0.1));
        assert_eq!(best.norm, 0.5);

        best.rebase(0.9, &[1.1], &[0.3]);
        best.restore(&mut vm, &mut va);
        assert_eq!((vm[0], va[0], best.norm), (1.1, 0.3, 0.9));
    }
}
