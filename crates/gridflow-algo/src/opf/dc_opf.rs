//! DC Optimal Power Flow
//!
//! Minimizes generation cost over the linearized network of
//! [`crate::power_flow::dc`]:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  min   Σ_g C_g(Pg)                                                       │
//! │  s.t.  Bbus·θ + Pbusinj + Gs + Pd − Cg·Pg = 0      (λ, one per bus)      │
//! │        −rate_a <= b·(θf − θt) + Pfinj <= rate_a     (μ, rated branches)  │
//! │        angle_min <= θf − θt <= angle_max                                 │
//! │        Pmin <= Pg <= Pmax,  θ_slack = 0                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The balance multiplier of bus i is the cost of serving one more pu of
//! load there; divided by the MVA base it is the LMP in $/MWh. With no
//! binding branch limit every LMP equals the system lambda of
//! [`super::economic_dispatch`].

use gridflow_core::{Entity, NetworkModel};
use tracing::debug;

use super::ipm::{self, IpmOptions, IpmResult, NonlinearProgram, Triplets};
use super::{angle_constraints, angle_limited, check_units, midpoint, status_of, violations_for};
use super::{ConstraintKind, Units, Violations};
use crate::power_flow::dc::DcNetwork;
use crate::power_flow::{empty_dispatch, mismatch, Deadline};
use crate::solution::{BranchFlow, BusResult, Solution, SolverKind};

/// DC-OPF as a nonlinear program over `x = [θ, Pg, y]`.
pub struct DcOpfProgram<'a> {
    network: &'a NetworkModel,
    dc: DcNetwork,
    units: Units,
    /// Rated branches with their limit in pu
    rated: Vec<(usize, f64)>,
    angle_limited: Vec<usize>,
    /// `Pd + Gs` per bus (pu)
    demand: Vec<f64>,
}

impl<'a> DcOpfProgram<'a> {
    pub fn new(network: &'a NetworkModel) -> Self {
        let base = network.base_mva();
        let rated = network
            .branches()
            .iter()
            .enumerate()
            .filter(|(_, b)| b.status && !b.rate_a.is_unlimited())
            .map(|(k, b)| (k, b.rate_a.to_per_unit(base)))
            .collect();
        let demand = (0..network.bus_count())
            .map(|i| network.load_pu(i).re + network.shunt_pu(i).re)
            .collect();
        Self {
            network,
            dc: DcNetwork::build(network),
            units: Units::new(network),
            rated,
            angle_limited: angle_limited(network),
            demand,
        }
    }

    fn nb(&self) -> usize {
        self.network.bus_count()
    }

    fn pg_offset(&self) -> usize {
        self.nb()
    }

    fn y_offset(&self) -> usize {
        self.nb() + self.units.len()
    }

    /// Flow rows, angle-difference rows and epigraph rows, in that order.
    fn inequality_rows(&self) -> usize {
        2 * self.rated.len() + 2 * self.angle_limited.len() + self.units.pwl_rows(self.network)
    }

    fn split<'x>(&self, x: &'x [f64]) -> (&'x [f64], &'x [f64], &'x [f64]) {
        let (theta, rest) = x.split_at(self.nb());
        let (pg, y) = rest.split_at(self.units.len());
        (theta, pg, y)
    }

    /// Balance residuals `Bθ + Pbusinj + Gs + Pd − Cg·Pg` (pu).
    fn balance(&self, theta: &[f64], pg: &[f64]) -> Vec<f64> {
        let mut g = self.dc.bus_injections(theta);
        for (gi, d) in g.iter_mut().zip(&self.demand) {
            *gi += d;
        }
        for (u, &bus) in self.units.bus.iter().enumerate() {
            g[bus] -= pg[u];
        }
        g
    }
}

impl NonlinearProgram for DcOpfProgram<'_> {
    fn dim(&self) -> usize {
        self.y_offset() + self.units.pwl.len()
    }

    fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
        let n = self.dim();
        let mut lb = vec![f64::NEG_INFINITY; n];
        let mut ub = vec![f64::INFINITY; n];
        for &s in self.network.slack_buses() {
            lb[s] = 0.0;
            ub[s] = 0.0;
        }
        let (pmin, pmax) = self.units.p_bounds(self.network);
        let off = self.pg_offset();
        lb[off..off + self.units.len()].copy_from_slice(&pmin);
        ub[off..off + self.units.len()].copy_from_slice(&pmax);
        (lb, ub)
    }

    fn initial_point(&self) -> Vec<f64> {
        let (pmin, pmax) = self.units.p_bounds(self.network);
        let pg: Vec<f64> = pmin.iter().zip(&pmax).map(|(&l, &u)| midpoint(l, u)).collect();
        let y = self.units.initial_y(self.network, &pg);
        let mut x = vec![0.0; self.nb()];
        x.extend(pg);
        x.extend(y);
        x
    }

    fn objective(&self, x: &[f64]) -> (f64, Vec<f64>) {
        let (_, pg, y) = self.split(x);
        let mut grad = vec![0.0; x.len()];
        let (pg_off, y_off) = (self.pg_offset(), self.y_offset());
        let (head, d_y) = grad.split_at_mut(y_off);
        self.units
            .cost_gradient(self.network, pg, &mut head[pg_off..], d_y);
        (self.units.cost(self.network, pg, y), grad)
    }

    fn equalities(&self, x: &[f64]) -> (Vec<f64>, Triplets) {
        let (theta, pg, _) = self.split(x);
        let mut jac: Triplets = self
            .dc
            .bbus
            .iter()
            .map(|(&b, (r, c))| (r, c, b))
            .collect();
        for (u, &bus) in self.units.bus.iter().enumerate() {
            jac.push((bus, self.pg_offset() + u, -1.0));
        }
        (self.balance(theta, pg), jac)
    }

    fn inequalities(&self, x: &[f64]) -> (Vec<f64>, Triplets) {
        let (theta, pg, y) = self.split(x);
        let mut h = Vec::with_capacity(self.inequality_rows());
        let mut jh = Vec::new();
        for &(k, rate) in &self.rated {
            let (f, t) = self.network.branch_ends(k);
            let b = self.dc.b_branch[k];
            let pf = self.dc.branch_flow(self.network, k, theta);
            let row = h.len();
            h.push(pf - rate);
            h.push(-pf - rate);
            jh.extend([(row, f, b), (row, t, -b), (row + 1, f, -b), (row + 1, t, b)]);
        }
        angle_constraints(self.network, &self.angle_limited, theta, 0, &mut h, &mut jh);
        self.units.pwl_constraints(
            self.network,
            pg,
            y,
            (self.pg_offset(), self.y_offset()),
            &mut h,
            &mut jh,
        );
        (h, jh)
    }

    fn hessian(&self, x: &[f64], _lambda: &[f64], _mu: &[f64], cost_mult: f64) -> Triplets {
        let (_, pg, _) = self.split(x);
        let mut out = Vec::new();
        self.units
            .cost_hessian(self.network, pg, self.pg_offset(), cost_mult, &mut out);
        out
    }
}

/// Run the DC-OPF; the [`Solution`] carries the interior point status.
pub(crate) fn solve(network: &NetworkModel, options: &IpmOptions, clock: &Deadline) -> (Solution, Violations) {
    let program = DcOpfProgram::new(network);
    let result = ipm::solve(&program, options, clock);
    debug!(
        buses = network.bus_count(),
        units = program.units.len(),
        rated_branches = program.rated.len(),
        iterations = result.iterations,
        "DC-OPF interior point finished"
    );
    let violations = check(&program, &result);
    (build_solution(&program, &result, clock), violations)
}

fn check(program: &DcOpfProgram<'_>, result: &IpmResult) -> Violations {
    let network = program.network;
    let (theta, pg, _) = program.split(&result.x);
    let mut violations = violations_for(network);
    for (i, residual) in program.balance(theta, pg).into_iter().enumerate() {
        violations.zero(ConstraintKind::PowerBalanceP, Entity::Bus(network.buses()[i].id), residual);
    }
    for &(k, rate) in &program.rated {
        let pf = program.dc.branch_flow(network, k, theta);
        let entity = Entity::Branch(network.branches()[k].id);
        violations.upper(ConstraintKind::BranchFlow, entity, pf.abs(), rate);
    }
    check_units(network, &program.units, pg, theta, &mut violations);
    violations
}

fn build_solution(program: &DcOpfProgram<'_>, result: &IpmResult, clock: &Deadline) -> Solution {
    let network = program.network;
    let base = network.base_mva();
    let (theta, pg, _) = program.split(&result.x);
    let injections = program.dc.bus_injections(theta);
    let residual = mismatch::inf_norm(&program.balance(theta, pg));

    let buses = network
        .buses()
        .iter()
        .enumerate()
        .map(|(i, bus)| BusResult {
            id: bus.id,
            bus_type: network.effective_bus_type(i),
            vm: 1.0,
            va: theta[i],
            p_injection_mw: (injections[i] + network.shunt_pu(i).re) * base,
            q_injection_mvar: 0.0,
            lmp: Some(result.lambda[i] / base),
            q_price: None,
            mu_v_min: None,
            mu_v_max: None,
        })
        .collect();

    let mut mu_s = vec![(0.0, 0.0); network.branch_count()];
    for (m, &(k, _)) in program.rated.iter().enumerate() {
        mu_s[k] = (result.mu[2 * m] / base, result.mu[2 * m + 1] / base);
    }
    let branches = network
        .branches()
        .iter()
        .enumerate()
        .map(|(k, branch)| {
            let pf = if branch.status {
                program.dc.branch_flow(network, k, theta) * base
            } else {
                0.0
            };
            BranchFlow {
                id: branch.id,
                in_service: branch.status,
                p_from_mw: pf,
                q_from_mvar: 0.0,
                p_to_mw: -pf,
                q_to_mvar: 0.0,
                mu_s_from: branch.status.then_some(mu_s[k].0),
                mu_s_to: branch.status.then_some(mu_s[k].1),
            }
        })
        .collect();

    let mut gens = empty_dispatch(network);
    for (u, &g) in program.units.gens.iter().enumerate() {
        gens[g].p_mw = pg[u] * base;
    }

    Solution {
        solver: SolverKind::DcOpf,
        status: status_of(result.status),
        iterations: result.iterations,
        max_mismatch: residual,
        buses,
        branches,
        gens,
        objective: Some(program.units.total_cost(network, pg)),
        solve_time_ms: clock.elapsed_ms(),
    }
}
