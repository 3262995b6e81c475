//! Optimal Power Flow solvers
//!
//! Both formulations are posed as a [`NonlinearProgram`] and solved by the
//! same primal-dual interior point method in [`ipm`]:
//!
//! - [`dc_opf`]: lossless linearized network, variables `[θ, Pg, y]`
//! - [`ac_opf`]: full polar AC network, variables `[θ, |V|, Pg, Qg, y]`
//!
//! `y` holds one epigraph variable per generator with a piecewise-linear
//! cost; each segment of the curve becomes a linear inequality `y >= m·Pg + c`.
//!
//! [`economic_dispatch`] solves the network-free merit-order problem and is
//! what an unconstrained DC-OPF reduces to.
//!
//! ## Outcome
//!
//! A converged interior point run yields a converged [`Solution`] with
//! locational marginal prices and constraint multipliers filled in. When the
//! run stops early (iteration cap, numerical breakdown, deadline) the last
//! iterate is checked against every constraint: any violation produces
//! [`SolveError::Infeasible`] listing them, otherwise the feasible but
//! unconverged point comes back tagged diverged.

use std::time::Duration;

use gridflow_core::{Entity, NetworkModel};
use tracing::{info, warn};

use crate::config::{OpfFormulation, SolverConfig};
use crate::error::{SolveError, SolveResult};
use crate::power_flow::{check_energized, Deadline};
use crate::solution::{DivergenceReason, Solution, SolveStatus, SolverKind};

pub mod ac_opf;
pub mod dc_opf;
mod economic;
pub mod ipm;
mod types;

pub use economic::{economic_dispatch, EconomicDispatch};
pub use ipm::{IpmOptions, IpmResult, IpmStatus, NonlinearProgram, Triplets};
pub use types::{ConstraintKind, ConstraintViolation};

pub(crate) use types::Violations;

/// Objective scaling inside the interior point method. Costs of realistic
/// systems run to thousands of $/hr; scaling keeps the KKT system balanced.
const COST_MULT: f64 = 1e-4;

/// Absolute tolerance (pu) when checking a stopped iterate for violations.
const FEASIBILITY_TOL: f64 = 1e-4;

/// Optimal power flow over either formulation
#[derive(Debug, Clone)]
pub struct OptimalPowerFlowSolver {
    formulation: OpfFormulation,
    max_iterations: usize,
    tolerance: f64,
    deadline: Option<Duration>,
}

impl OptimalPowerFlowSolver {
    pub fn new(formulation: OpfFormulation) -> Self {
        Self {
            formulation,
            max_iterations: 150,
            tolerance: 1e-6,
            deadline: None,
        }
    }

    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            formulation: config.effective_opf_formulation(),
            max_iterations: config.opf_max_iterations,
            tolerance: config.opf_tolerance,
            deadline: config.deadline(),
        }
    }

    pub fn with_formulation(mut self, formulation: OpfFormulation) -> Self {
        self.formulation = formulation;
        self
    }

    /// Set maximum interior point iterations
    pub fn with_max_iterations(mut self, max_iter: usize) -> Self {
        self.max_iterations = max_iter;
        self
    }

    /// Set KKT convergence tolerance
    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.tolerance = tol;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn formulation(&self) -> OpfFormulation {
        self.formulation
    }

    /// Solver tag carried by the solutions this solver produces.
    pub fn kind(&self) -> SolverKind {
        match self.formulation {
            OpfFormulation::Dc => SolverKind::DcOpf,
            OpfFormulation::Ac => SolverKind::AcOpf,
        }
    }

    pub fn solve(&self, network: &NetworkModel) -> SolveResult<Solution> {
        let clock = Deadline::start(self.deadline);
        check_capacity(network)?;
        check_energized(network, "OPF KKT system")?;

        let options = IpmOptions {
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            cost_mult: COST_MULT,
        };
        let (solution, violations) = match self.formulation {
            OpfFormulation::Dc => dc_opf::solve(network, &options, &clock),
            OpfFormulation::Ac => ac_opf::solve(network, &options, &clock),
        };
        conclude(solution, violations)
    }
}

/// Reject a dispatch problem whose in-service capacity cannot cover the
/// demand, counted the same way [`economic_dispatch`] counts it.
fn check_capacity(network: &NetworkModel) -> SolveResult<()> {
    let capacity: f64 = network
        .gens()
        .iter()
        .filter(|g| g.status)
        .map(|g| g.pmax.value())
        .sum();
    let demand = network.total_demand_mw();
    if capacity < demand {
        warn!(capacity, demand, "generation capacity below demand");
        return Err(SolveError::Infeasible {
            reason: format!("in-service capacity {capacity:.1} MW below demand {demand:.1} MW"),
            violations: vec![ConstraintViolation {
                kind: ConstraintKind::GenerationCapacity,
                entity: Entity::Network,
                value: capacity,
                limit: demand,
            }],
        });
    }
    Ok(())
}

fn conclude(solution: Solution, violations: Violations) -> SolveResult<Solution> {
    info!(
        solver = %solution.solver,
        status = %solution.status,
        iterations = solution.iterations,
        objective = ?solution.objective,
        "optimal power flow complete"
    );
    match solution.status {
        SolveStatus::Converged => Ok(solution),
        SolveStatus::Diverged(reason) if !violations.is_empty() => {
            warn!(violations = violations.list.len(), "OPF stopped at an infeasible point");
            Err(SolveError::Infeasible {
                reason: format!("{reason} after {} iterations", solution.iterations),
                violations: violations.list,
            })
        }
        SolveStatus::Diverged(_) => Ok(solution),
    }
}

pub(crate) fn status_of(status: IpmStatus) -> SolveStatus {
    match status {
        IpmStatus::Converged => SolveStatus::Converged,
        IpmStatus::MaxIterations => SolveStatus::Diverged(DivergenceReason::MaxIterations),
        IpmStatus::NumericalBreakdown => SolveStatus::Diverged(DivergenceReason::NumericalBreakdown),
        IpmStatus::Deadline => SolveStatus::Diverged(DivergenceReason::Deadline),
    }
}

/// Starting value inside `[lb, ub]`, tolerating infinite bounds.
pub(crate) fn midpoint(lb: f64, ub: f64) -> f64 {
    match (lb.is_finite(), ub.is_finite()) {
        (true, true) => 0.5 * (lb + ub),
        (true, false) => lb + 1.0,
        (false, true) => ub - 1.0,
        (false, false) => 0.0,
    }
}

/// The in-service generators an OPF dispatches, with their cost handling.
#[derive(Debug, Clone)]
pub(crate) struct Units {
    /// Generator index per unit
    pub gens: Vec<usize>,
    /// Bus index per unit
    pub bus: Vec<usize>,
    /// Units priced through an epigraph variable
    pub pwl: Vec<usize>,
}

impl Units {
    pub(crate) fn new(network: &NetworkModel) -> Self {
        let gens: Vec<usize> = (0..network.gen_count())
            .filter(|&g| network.gens()[g].status)
            .collect();
        let bus = gens.iter().map(|&g| network.gen_bus(g)).collect();
        let pwl = gens
            .iter()
            .enumerate()
            .filter(|(_, &g)| network.gens()[g].cost_model.is_piecewise_linear())
            .map(|(u, _)| u)
            .collect();
        Self { gens, bus, pwl }
    }

    pub(crate) fn len(&self) -> usize {
        self.gens.len()
    }

    /// Active-power bounds in pu.
    pub(crate) fn p_bounds(&self, network: &NetworkModel) -> (Vec<f64>, Vec<f64>) {
        let base = network.base_mva();
        self.gens
            .iter()
            .map(|&g| {
                let gen = &network.gens()[g];
                (gen.pmin.to_per_unit(base), gen.pmax.to_per_unit(base))
            })
            .unzip()
    }

    /// Reactive-power bounds in pu.
    pub(crate) fn q_bounds(&self, network: &NetworkModel) -> (Vec<f64>, Vec<f64>) {
        let base = network.base_mva();
        self.gens
            .iter()
            .map(|&g| {
                let gen = &network.gens()[g];
                (gen.qmin.to_per_unit(base), gen.qmax.to_per_unit(base))
            })
            .unzip()
    }

    fn is_pwl(&self, u: usize) -> bool {
        self.pwl.binary_search(&u).is_ok()
    }

    /// Total cost ($/hr) with piecewise-linear units priced by their epigraph variables.
    pub(crate) fn cost(&self, network: &NetworkModel, pg: &[f64], y: &[f64]) -> f64 {
        let base = network.base_mva();
        let smooth: f64 = (0..self.len())
            .filter(|&u| !self.is_pwl(u))
            .map(|u| network.gens()[self.gens[u]].cost_model.evaluate(pg[u] * base))
            .sum();
        smooth + y.iter().sum::<f64>()
    }

    /// Cost gradient with respect to `Pg` (pu) and `y`.
    pub(crate) fn cost_gradient(&self, network: &NetworkModel, pg: &[f64], d_pg: &mut [f64], d_y: &mut [f64]) {
        let base = network.base_mva();
        for u in 0..self.len() {
            if !self.is_pwl(u) {
                d_pg[u] = network.gens()[self.gens[u]].cost_model.marginal_cost(pg[u] * base) * base;
            }
        }
        d_y.iter_mut().for_each(|d| *d = 1.0);
    }

    /// Scaled cost curvature on the `Pg` diagonal.
    pub(crate) fn cost_hessian(
        &self,
        network: &NetworkModel,
        pg: &[f64],
        pg_offset: usize,
        cost_mult: f64,
        out: &mut Triplets,
    ) {
        let base = network.base_mva();
        for u in 0..self.len() {
            if self.is_pwl(u) {
                continue;
            }
            let curvature = network.gens()[self.gens[u]].cost_model.curvature(pg[u] * base);
            if curvature != 0.0 {
                out.push((pg_offset + u, pg_offset + u, curvature * base * base * cost_mult));
            }
        }
    }

    /// Number of epigraph rows, one per cost segment.
    pub(crate) fn pwl_rows(&self, network: &NetworkModel) -> usize {
        self.pwl
            .iter()
            .map(|&u| network.gens()[self.gens[u]].cost_model.segments().len())
            .sum()
    }

    /// Append `m·Pg + c − y <= 0` per segment, in $/hr.
    pub(crate) fn pwl_constraints(
        &self,
        network: &NetworkModel,
        pg: &[f64],
        y: &[f64],
        offsets: (usize, usize),
        h: &mut Vec<f64>,
        jh: &mut Triplets,
    ) {
        let base = network.base_mva();
        let (pg_offset, y_offset) = offsets;
        for (p, &u) in self.pwl.iter().enumerate() {
            for (slope, intercept) in network.gens()[self.gens[u]].cost_model.segments() {
                let row = h.len();
                h.push(slope * pg[u] * base + intercept - y[p]);
                jh.push((row, pg_offset + u, slope * base));
                jh.push((row, y_offset + p, -1.0));
            }
        }
    }

    /// Epigraph start strictly above the curve at `pg`.
    pub(crate) fn initial_y(&self, network: &NetworkModel, pg: &[f64]) -> Vec<f64> {
        let base = network.base_mva();
        self.pwl
            .iter()
            .map(|&u| {
                let c = network.gens()[self.gens[u]].cost_model.evaluate(pg[u] * base);
                c + 0.1 * c.abs()
            })
            .collect()
    }

    /// Cost of the dispatch evaluated on the curves themselves ($/hr).
    pub(crate) fn total_cost(&self, network: &NetworkModel, pg: &[f64]) -> f64 {
        let base = network.base_mva();
        self.gens
            .iter()
            .zip(pg)
            .map(|(&g, &p)| network.gens()[g].cost_model.evaluate(p * base))
            .sum()
    }
}

/// Branches whose angle-difference window is active.
pub(crate) fn angle_limited(network: &NetworkModel) -> Vec<usize> {
    network
        .branches()
        .iter()
        .enumerate()
        .filter(|(_, b)| b.status && b.has_angle_limits())
        .map(|(k, _)| k)
        .collect()
}

/// Append `θf − θt − max <= 0` and `min − (θf − θt) <= 0` per branch.
pub(crate) fn angle_constraints(
    network: &NetworkModel,
    branches: &[usize],
    va: &[f64],
    va_offset: usize,
    h: &mut Vec<f64>,
    jh: &mut Triplets,
) {
    for &k in branches {
        let branch = &network.branches()[k];
        let (f, t) = network.branch_ends(k);
        let diff = va[f] - va[t];
        let row = h.len();
        h.push(diff - branch.angle_max.value());
        jh.push((row, va_offset + f, 1.0));
        jh.push((row, va_offset + t, -1.0));
        h.push(branch.angle_min.value() - diff);
        jh.push((row + 1, va_offset + f, -1.0));
        jh.push((row + 1, va_offset + t, 1.0));
    }
}

/// Generator limit and angle-difference checks common to both formulations.
pub(crate) fn check_units(
    network: &NetworkModel,
    units: &Units,
    pg: &[f64],
    va: &[f64],
    violations: &mut Violations,
) {
    let (pmin, pmax) = units.p_bounds(network);
    for (u, &g) in units.gens.iter().enumerate() {
        let entity = Entity::Gen(network.gens()[g].id);
        violations.lower(ConstraintKind::GenPMin, entity.clone(), pg[u], pmin[u]);
        violations.upper(ConstraintKind::GenPMax, entity, pg[u], pmax[u]);
    }
    for k in angle_limited(network) {
        let branch = &network.branches()[k];
        let (f, t) = network.branch_ends(k);
        let entity = Entity::Branch(branch.id);
        let diff = va[f] - va[t];
        violations.upper(ConstraintKind::AngleDifference, entity.clone(), diff, branch.angle_max.value());
        violations.lower(ConstraintKind::AngleDifference, entity, diff, branch.angle_min.value());
    }
}

pub(crate) fn violations_for(network: &NetworkModel) -> Violations {
    Violations::new(FEASIBILITY_TOL, network.base_mva())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::{Branch, BranchId, Bus, BusId, BusType, CostModel, Gen, GenId, NetworkBuilder};

    #[test]
    fn capacity_check_counts_shunt_conductance() {
        let mut b = NetworkBuilder::new(100.0);
        b.add_bus(Bus::new(BusId::new(1), BusType::Slack, 138.0))
            .add_bus(
                Bus::new(BusId::new(2), BusType::PQ, 138.0)
                    .with_load(80.0, 0.0)
                    .with_shunt(30.0, 0.0),
            )
            .add_branch(Branch::new(BranchId::new(1), BusId::new(1), BusId::new(2), 0.0, 0.1))
            .add_gen(
                Gen::new(GenId::new(1), BusId::new(1))
                    .with_p_limits(0.0, 100.0)
                    .with_cost(CostModel::quadratic(0.0, 10.0, 0.0)),
            );
        let net = b.build().unwrap();
        assert!(net.total_load_mw() < 100.0);

        match check_capacity(&net) {
            Err(SolveError::Infeasible { violations, .. }) => {
                assert_eq!(violations[0].kind, ConstraintKind::GenerationCapacity);
                assert_eq!(violations[0].limit, 110.0);
            }
            other => panic!("expected infeasible, got {other:?}"),
        }
        assert!(matches!(
            economic_dispatch(&net),
            Err(SolveError::Infeasible { .. })
        ));
    }

    #[test]
    fn midpoint_handles_open_bounds() {
        assert_eq!(midpoint(0.0, 2.0), 1.0);
        assert_eq!(midpoint(0.5, f64::INFINITY), 1.5);
        assert_eq!(midpoint(f64::NEG_INFINITY, 0.0), -1.0);
        assert_eq!(midpoint(f64::NEG_INFINITY, f64::INFINITY), 0.0);
    }

    #[test]
    fn capacity_shortfall_is_infeasible() {
        let mut b = NetworkBuilder::new(100.0);
        b.add_bus(Bus::new(BusId::new(1), BusType::Slack, 138.0))
            .add_bus(Bus::new(BusId::new(2), BusType::PQ, 138.0).with_load(150.0, 0.0))
            .add_branch(Branch::new(BranchId::new(1), BusId::new(1), BusId::new(2), 0.0, 0.1))
            .add_gen(
                Gen::new(GenId::new(1), BusId::new(1))
                    .with_p_limits(0.0, 100.0)
                    .with_cost(CostModel::linear(0.0, 10.0)),
            );
        let net = b.build().unwrap();

        for formulation in [OpfFormulation::Dc, OpfFormulation::Ac] {
            match OptimalPowerFlowSolver::new(formulation).solve(&net) {
                Err(SolveError::Infeasible { violations, .. }) => {
                    assert_eq!(violations.len(), 1);
                    assert_eq!(violations[0].kind, ConstraintKind::GenerationCapacity);
                    assert_eq!(violations[0].value, 100.0);
                    assert_eq!(violations[0].limit, 150.0);
                }
                other => panic!("expected infeasible, got {other:?}"),
            }
        }
    }

    #[test]
    fn epigraph_rows_follow_segments() {
        let mut b = NetworkBuilder::new(100.0);
        b.add_bus(Bus::new(BusId::new(1), BusType::Slack, 138.0))
            .add_gen(
                Gen::new(GenId::new(1), BusId::new(1))
                    .with_cost(CostModel::PiecewiseLinear(vec![(0.0, 0.0), (50.0, 500.0), (100.0, 1500.0)])),
            )
            .add_gen(Gen::new(GenId::new(2), BusId::new(1)).with_cost(CostModel::quadratic(0.0, 10.0, 0.1)));
        let net = b.build().unwrap();
        let units = Units::new(&net);
        assert_eq!(units.pwl, vec![0]);
        assert_eq!(units.pwl_rows(&net), 2);

        let (mut h, mut jh) = (Vec::new(), Vec::new());
        units.pwl_constraints(&net, &[0.6, 0.0], &[700.0], (0, 2), &mut h, &mut jh);
        // segments: 10·P and 20·P − 500 at 60 MW
        assert!((h[0] - (600.0 - 700.0)).abs() < 1e-9);
        assert!((h[1] - (700.0 - 700.0)).abs() < 1e-9);
        assert!(jh.contains(&(1, 0, 2000.0)));

        let mut d_pg = vec![0.0; 2];
        let mut d_y = vec![0.0; 1];
        units.cost_gradient(&net, &[0.6, 0.5], &mut d_pg, &mut d_y);
        assert_eq!(d_pg[0], 0.0);
        assert!((d_pg[1] - (10.0 + 0.2 * 50.0) * 100.0).abs() < 1e-9);
        assert_eq!(d_y, vec![1.0]);
    }
}
