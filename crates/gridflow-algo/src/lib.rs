//! # gridflow-algo: Power Flow and Optimal Power Flow Solvers
//!
//! Steady-state solvers over a validated [`gridflow_core::NetworkModel`]:
//!
//! | Solver | Description | Problem Class |
//! |--------|-------------|---------------|
//! | [`DcPowerFlowSolver`] | Linearized active-power flow | Linear, one solve |
//! | [`NewtonPowerFlowSolver`] | Full AC flow, Newton-Raphson | Nonlinear |
//! | [`FastDecoupledPowerFlowSolver`] | AC flow with constant B′/B″ | Nonlinear |
//! | [`OptimalPowerFlowSolver`] | Minimum-cost dispatch, DC or AC | Interior point |
//!
//! Every solver returns the same [`Solution`] record. [`solve`] picks the
//! solver from a [`SolverConfig`], which can also be loaded from TOML.
//!
//! ## Outcomes
//!
//! Structural problems are errors: an invalid model, a bus without a path to
//! a slack bus (singular system), an infeasible OPF. Running out of
//! iterations or wall-clock time is not: the best iterate comes back with
//! [`SolveStatus::Diverged`] so it can be inspected. Set
//! [`SolverConfig::strict`] to turn divergence into
//! [`SolveError::Convergence`].
//!
//! The network model is never modified. PV→PQ switching during reactive
//! limit enforcement lives in solver-local state and shows up only in
//! [`BusResult::bus_type`].
//!
//! ## Example
//!
//! ```
//! use gridflow_algo::{solve, SolverConfig};
//! use gridflow_core::{Branch, BranchId, Bus, BusId, BusType, Gen, GenId, NetworkBuilder};
//!
//! let mut builder = NetworkBuilder::new(100.0);
//! builder
//!     .add_bus(Bus::new(BusId::new(1), BusType::Slack, 138.0))
//!     .add_bus(Bus::new(BusId::new(2), BusType::PQ, 138.0).with_load(50.0, 10.0))
//!     .add_branch(Branch::new(BranchId::new(1), BusId::new(1), BusId::new(2), 0.01, 0.1))
//!     .add_gen(Gen::new(GenId::new(1), BusId::new(1)).with_voltage_setpoint(1.02));
//! let network = builder.build()?;
//!
//! let solution = solve(&network, &SolverConfig::newton())?;
//! assert!(solution.is_converged());
//! println!("V2 = {:.4} pu", solution.buses[1].vm);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod opf;
pub mod power_flow;
pub mod solution;

pub use config::{FdMethod, OpfFormulation, SolverConfig, SolverType};
pub use error::{SolveError, SolveResult};
pub use opf::{
    economic_dispatch, ConstraintKind, ConstraintViolation, EconomicDispatch, OptimalPowerFlowSolver,
};
pub use power_flow::{
    mismatch_norm, DcPowerFlowSolver, FastDecoupledPowerFlowSolver, NewtonPowerFlowSolver,
};
pub use solution::{
    BranchFlow, BusResult, DivergenceReason, GenDispatch, Solution, SolveStatus, SolverKind,
};

use gridflow_core::NetworkModel;
use tracing::warn;

/// A configured solver, one variant per formulation.
#[derive(Debug, Clone)]
pub enum Solver {
    Dc(DcPowerFlowSolver),
    Newton(NewtonPowerFlowSolver),
    FastDecoupled(FastDecoupledPowerFlowSolver),
    Opf(OptimalPowerFlowSolver),
}

impl Solver {
    /// Select and configure the solver a [`SolverConfig`] asks for.
    pub fn from_config(config: &SolverConfig) -> Self {
        if config.opf_enabled {
            return Solver::Opf(OptimalPowerFlowSolver::from_config(config));
        }
        match config.solver_type {
            SolverType::Dc => Solver::Dc(DcPowerFlowSolver::new()),
            SolverType::Newton => Solver::Newton(NewtonPowerFlowSolver::from_config(config)),
            SolverType::FastDecoupled => {
                Solver::FastDecoupled(FastDecoupledPowerFlowSolver::from_config(config))
            }
        }
    }

    pub fn kind(&self) -> SolverKind {
        match self {
            Solver::Dc(_) => SolverKind::Dc,
            Solver::Newton(_) => SolverKind::Newton,
            Solver::FastDecoupled(_) => SolverKind::FastDecoupled,
            Solver::Opf(opf) => opf.kind(),
        }
    }

    pub fn solve(&self, network: &NetworkModel) -> SolveResult<Solution> {
        match self {
            Solver::Dc(s) => s.solve(network),
            Solver::Newton(s) => s.solve(network),
            Solver::FastDecoupled(s) => s.solve(network),
            Solver::Opf(s) => s.solve(network),
        }
    }
}

/// Solve `network` with the solver selected by `config`.
pub fn solve(network: &NetworkModel, config: &SolverConfig) -> SolveResult<Solution> {
    config.validate()?;
    for issue in network.diagnostics().warnings() {
        warn!(entity = %issue.entity, "{}", issue.message);
    }

    let solution = Solver::from_config(config).solve(network)?;
    if config.strict {
        if let SolveStatus::Diverged(_) = solution.status {
            return Err(SolveError::Convergence {
                solver: solution.solver,
                status: solution.status,
                iterations: solution.iterations,
                max_mismatch: solution.max_mismatch,
            });
        }
    }
    Ok(solution)
}

/// Solve independent networks with one configuration, in parallel when the
/// `parallel` feature is enabled. Results keep the input order.
pub fn solve_batch(networks: &[NetworkModel], config: &SolverConfig) -> Vec<SolveResult<Solution>> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        networks.par_iter().map(|n| solve(n, config)).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        networks.iter().map(|n| solve(n, config)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::{Branch, BranchId, Bus, BusId, BusType, CostModel, Gen, GenId, NetworkBuilder};

    fn two_bus() -> NetworkModel {
        let mut b = NetworkBuilder::new(100.0);
        b.add_bus(Bus::new(BusId::new(1), BusType::Slack, 138.0))
            .add_bus(Bus::new(BusId::new(2), BusType::PQ, 138.0).with_load(50.0, 10.0))
            .add_branch(Branch::new(BranchId::new(1), BusId::new(1), BusId::new(2), 0.01, 0.1))
            .add_gen(
                Gen::new(GenId::new(1), BusId::new(1))
                    .with_p_limits(0.0, 200.0)
                    .with_q_limits(-100.0, 100.0)
                    .with_cost(CostModel::quadratic(0.0, 20.0, 0.01)),
            );
        b.build().unwrap()
    }

    #[test]
    fn config_selects_solver() {
        let cases = [
            (SolverConfig::dc(), SolverKind::Dc),
            (SolverConfig::newton(), SolverKind::Newton),
            (SolverConfig::fast_decoupled(), SolverKind::FastDecoupled),
            (SolverConfig::dc().with_opf(true), SolverKind::DcOpf),
            (SolverConfig::newton().with_opf(true), SolverKind::AcOpf),
            (
                SolverConfig::dc().with_opf(true).with_opf_formulation(OpfFormulation::Ac),
                SolverKind::AcOpf,
            ),
        ];
        let net = two_bus();
        for (config, kind) in cases {
            assert_eq!(Solver::from_config(&config).kind(), kind);
            let sol = solve(&net, &config).unwrap();
            assert_eq!(sol.solver, kind);
            assert!(sol.is_converged(), "{kind} did not converge");
        }
    }

    #[test]
    fn strict_mode_turns_divergence_into_error() {
        let net = two_bus();
        let lenient = SolverConfig::newton().with_max_iterations(1);
        let sol = solve(&net, &lenient).unwrap();
        assert!(!sol.is_converged());

        let strict = lenient.with_strict(true);
        match solve(&net, &strict) {
            Err(SolveError::Convergence { solver, iterations, .. }) => {
                assert_eq!(solver, SolverKind::Newton);
                assert_eq!(iterations, 1);
            }
            other => panic!("expected convergence error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SolverConfig::newton().with_tolerance(-1.0);
        assert!(matches!(solve(&two_bus(), &config), Err(SolveError::InvalidConfig(_))));
    }

    #[test]
    fn batch_keeps_order() {
        let nets = vec![two_bus(), two_bus(), two_bus()];
        let results = solve_batch(&nets, &SolverConfig::dc());
        assert_eq!(results.len(), 3);
        for result in results {
            let sol = result.unwrap();
            assert!((sol.buses[1].va + 0.05).abs() < 1e-12);
        }
    }
}
