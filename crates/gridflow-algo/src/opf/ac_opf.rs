//! AC Optimal Power Flow
//!
//! Full polar formulation over `x = [θ, |V|, Pg, Qg, y]`:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  min   Σ_g C_g(Pg)                                                       │
//! │  s.t.  P_i(V) − Σ Pg + Pd_i = 0                     (λP, one per bus)    │
//! │        Q_i(V) − Σ Qg + Qd_i = 0                     (λQ, one per bus)    │
//! │        |Sf|² − rate_a² <= 0,  |St|² − rate_a² <= 0  (μ, rated branches)  │
//! │        angle_min <= θf − θt <= angle_max                                 │
//! │        Vmin <= |V| <= Vmax,  Pmin <= Pg <= Pmax,  Qmin <= Qg <= Qmax     │
//! │        θ_slack = 0                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `P_i + jQ_i = V_i·conj(Ybus·V)_i` uses the full-model admittance, so bus
//! shunts, line charging, taps and phase shifters are all represented.
//!
//! ## Second derivatives
//!
//! Every bus injection and every branch-end flow is a sum of two-bus terms
//!
//! ```text
//!   P = Vi²·Gii + Vi·Vj·(G·cos θ + B·sin θ)
//!   Q = −Vi²·Bii + Vi·Vj·(G·sin θ − B·cos θ)        θ = θi − θj
//! ```
//!
//! so the Lagrangian Hessian is assembled from closed-form 4×4 blocks over
//! `[θi, θj, Vi, Vj]` (see [`pair_hessian`]). A flow limit on `|S|²`
//! reuses the block of its branch end weighted by `2μP` and `2μQ`, plus the
//! outer products `2μ(∇P∇Pᵀ + ∇Q∇Qᵀ)`.

use gridflow_core::{Entity, NetworkModel};
use num_complex::Complex64;
use tracing::debug;

use super::ipm::{self, IpmOptions, IpmResult, NonlinearProgram, Triplets};
use super::{angle_constraints, angle_limited, check_units, midpoint, status_of, violations_for};
use super::{ConstraintKind, Units, Violations};
use crate::power_flow::{ac_branch_flows, empty_dispatch, mismatch, Deadline};
use crate::solution::{BusResult, Solution, SolverKind};

/// Power leaving bus i through one two-bus term, with its gradient over
/// `[θi, θj, Vi, Vj]`.
#[derive(Debug, Clone, Copy)]
struct EndFlow {
    p: f64,
    q: f64,
    dp: [f64; 4],
    dq: [f64; 4],
}

fn end_flow(yii: Complex64, yij: Complex64, vi: f64, vj: f64, theta: f64) -> EndFlow {
    let (s, c) = theta.sin_cos();
    let a = yij.re * c + yij.im * s;
    let b = yij.re * s - yij.im * c;
    let vv = vi * vj;
    EndFlow {
        p: vi * vi * yii.re + vv * a,
        q: -vi * vi * yii.im + vv * b,
        dp: [-vv * b, vv * b, 2.0 * vi * yii.re + vj * a, vi * a],
        dq: [vv * a, -vv * a, -2.0 * vi * yii.im + vj * b, vi * b],
    }
}

/// `λp·∇²P + λq·∇²Q` of one two-bus term over `[θi, θj, Vi, Vj]`.
fn pair_hessian(
    yii: Complex64,
    yij: Complex64,
    vi: f64,
    vj: f64,
    theta: f64,
    lp: f64,
    lq: f64,
) -> [[f64; 4]; 4] {
    let (s, cos) = theta.sin_cos();
    let a = yij.re * cos + yij.im * s;
    let b = yij.re * s - yij.im * cos;
    let c = lp * a + lq * b;
    let d = -lp * b + lq * a;
    let vv = vi * vj;

    let mut h = [[0.0; 4]; 4];
    h[0][0] = -vv * c;
    h[0][1] = vv * c;
    h[1][1] = -vv * c;
    h[0][2] = vj * d;
    h[0][3] = vi * d;
    h[1][2] = -vj * d;
    h[1][3] = -vi * d;
    h[2][2] = 2.0 * (lp * yii.re - lq * yii.im);
    h[2][3] = c;
    for r in 0..4 {
        for col in 0..r {
            h[r][col] = h[col][r];
        }
    }
    h
}

fn push_block(out: &mut Triplets, index: [usize; 4], block: &[[f64; 4]; 4]) {
    for (r, row) in block.iter().enumerate() {
        for (c, &v) in row.iter().enumerate() {
            if v != 0.0 {
                out.push((index[r], index[c], v));
            }
        }
    }
}

/// AC-OPF as a nonlinear program.
pub struct AcOpfProgram<'a> {
    network: &'a NetworkModel,
    units: Units,
    /// Rated branches with their limit in pu
    rated: Vec<(usize, f64)>,
    angle_limited: Vec<usize>,
}

impl<'a> AcOpfProgram<'a> {
    pub fn new(network: &'a NetworkModel) -> Self {
        let base = network.base_mva();
        let rated = network
            .branches()
            .iter()
            .enumerate()
            .filter(|(_, b)| b.status && !b.rate_a.is_unlimited())
            .map(|(k, b)| (k, b.rate_a.to_per_unit(base)))
            .collect();
        Self {
            network,
            units: Units::new(network),
            rated,
            angle_limited: angle_limited(network),
        }
    }

    fn nb(&self) -> usize {
        self.network.bus_count()
    }

    fn vm_offset(&self) -> usize {
        self.nb()
    }

    fn pg_offset(&self) -> usize {
        2 * self.nb()
    }

    fn qg_offset(&self) -> usize {
        2 * self.nb() + self.units.len()
    }

    fn y_offset(&self) -> usize {
        2 * self.nb() + 2 * self.units.len()
    }

    /// Flow rows, angle-difference rows and epigraph rows, in that order.
    fn inequality_rows(&self) -> usize {
        2 * self.rated.len() + 2 * self.angle_limited.len() + self.units.pwl_rows(self.network)
    }

    fn split<'x>(&self, x: &'x [f64]) -> AcPoint<'x> {
        let nb = self.nb();
        let ng = self.units.len();
        AcPoint {
            va: &x[..nb],
            vm: &x[nb..2 * nb],
            pg: &x[2 * nb..2 * nb + ng],
            qg: &x[2 * nb + ng..2 * nb + 2 * ng],
            y: &x[2 * nb + 2 * ng..],
        }
    }

    /// Balance residuals stacked `[ΔP; ΔQ]` (pu).
    fn balance(&self, p: &AcPoint<'_>) -> Vec<f64> {
        let nb = self.nb();
        let v = mismatch::voltages(p.vm, p.va);
        let s = self.network.admittance().injections(&v);
        let mut g = vec![0.0; 2 * nb];
        for i in 0..nb {
            let load = self.network.load_pu(i);
            g[i] = s[i].re + load.re;
            g[nb + i] = s[i].im + load.im;
        }
        for (u, &bus) in self.units.bus.iter().enumerate() {
            g[bus] -= p.pg[u];
            g[nb + bus] -= p.qg[u];
        }
        g
    }

    /// From- and to-end flows of branch `k` with their local index maps.
    fn branch_ends(&self, k: usize, p: &AcPoint<'_>) -> Option<[(EndFlow, [usize; 4]); 2]> {
        let y = self.network.admittance().branch(k)?;
        let (f, t) = self.network.branch_ends(k);
        let vm = self.vm_offset();
        let from = end_flow(y.yff, y.yft, p.vm[f], p.vm[t], p.va[f] - p.va[t]);
        let to = end_flow(y.ytt, y.ytf, p.vm[t], p.vm[f], p.va[t] - p.va[f]);
        Some([
            (from, [f, t, vm + f, vm + t]),
            (to, [t, f, vm + t, vm + f]),
        ])
    }
}

struct AcPoint<'x> {
    va: &'x [f64],
    vm: &'x [f64],
    pg: &'x [f64],
    qg: &'x [f64],
    y: &'x [f64],
}

impl NonlinearProgram for AcOpfProgram<'_> {
    fn dim(&self) -> usize {
        self.y_offset() + self.units.pwl.len()
    }

    fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
        let n = self.dim();
        let ng = self.units.len();
        let mut lb = vec![f64::NEG_INFINITY; n];
        let mut ub = vec![f64::INFINITY; n];
        for &s in self.network.slack_buses() {
            lb[s] = 0.0;
            ub[s] = 0.0;
        }
        for (i, bus) in self.network.buses().iter().enumerate() {
            lb[self.vm_offset() + i] = bus.v_min.value();
            ub[self.vm_offset() + i] = bus.v_max.value();
        }
        let (pmin, pmax) = self.units.p_bounds(self.network);
        let (qmin, qmax) = self.units.q_bounds(self.network);
        let (po, qo) = (self.pg_offset(), self.qg_offset());
        lb[po..po + ng].copy_from_slice(&pmin);
        ub[po..po + ng].copy_from_slice(&pmax);
        lb[qo..qo + ng].copy_from_slice(&qmin);
        ub[qo..qo + ng].copy_from_slice(&qmax);
        (lb, ub)
    }

    fn initial_point(&self) -> Vec<f64> {
        let (lb, ub) = self.bounds();
        let mut x: Vec<f64> = lb.iter().zip(&ub).map(|(&l, &u)| midpoint(l, u)).collect();
        for va in &mut x[..self.nb()] {
            *va = 0.0;
        }
        let y0 = self.y_offset();
        let y = self.units.initial_y(self.network, &x[self.pg_offset()..self.qg_offset()]);
        x[y0..].copy_from_slice(&y);
        x
    }

    fn objective(&self, x: &[f64]) -> (f64, Vec<f64>) {
        let p = self.split(x);
        let mut grad = vec![0.0; x.len()];
        let (head, d_y) = grad.split_at_mut(self.y_offset());
        self.units
            .cost_gradient(self.network, p.pg, &mut head[self.pg_offset()..self.qg_offset()], d_y);
        (self.units.cost(self.network, p.pg, p.y), grad)
    }

    fn equalities(&self, x: &[f64]) -> (Vec<f64>, Triplets) {
        let nb = self.nb();
        let p = self.split(x);
        let v = mismatch::voltages(p.vm, p.va);
        let (d_va, d_vm) = mismatch::voltage_derivatives(self.network.admittance().ybus(), &v);

        let mut jac = Vec::with_capacity(2 * (d_va.nnz() + d_vm.nnz()) + 2 * self.units.len());
        for (&d, (r, c)) in d_va.iter() {
            jac.push((r, c, d.re));
            jac.push((nb + r, c, d.im));
        }
        for (&d, (r, c)) in d_vm.iter() {
            jac.push((r, self.vm_offset() + c, d.re));
            jac.push((nb + r, self.vm_offset() + c, d.im));
        }
        for (u, &bus) in self.units.bus.iter().enumerate() {
            jac.push((bus, self.pg_offset() + u, -1.0));
            jac.push((nb + bus, self.qg_offset() + u, -1.0));
        }
        (self.balance(&p), jac)
    }

    fn inequalities(&self, x: &[f64]) -> (Vec<f64>, Triplets) {
        let p = self.split(x);
        let mut h = Vec::with_capacity(self.inequality_rows());
        let mut jh = Vec::new();
        for &(k, smax) in &self.rated {
            let Some(ends) = self.branch_ends(k, &p) else {
                continue;
            };
            for (flow, index) in ends {
                let row = h.len();
                h.push(flow.p * flow.p + flow.q * flow.q - smax * smax);
                for l in 0..4 {
                    jh.push((row, index[l], 2.0 * (flow.p * flow.dp[l] + flow.q * flow.dq[l])));
                }
            }
        }
        angle_constraints(self.network, &self.angle_limited, p.va, 0, &mut h, &mut jh);
        self.units.pwl_constraints(
            self.network,
            p.pg,
            p.y,
            (self.pg_offset(), self.y_offset()),
            &mut h,
            &mut jh,
        );
        (h, jh)
    }

    fn hessian(&self, x: &[f64], lambda: &[f64], mu: &[f64], cost_mult: f64) -> Triplets {
        let nb = self.nb();
        let p = self.split(x);
        let mut out = Vec::new();
        self.units
            .cost_hessian(self.network, p.pg, self.pg_offset(), cost_mult, &mut out);

        let vm_off = self.vm_offset();
        let zero = Complex64::new(0.0, 0.0);
        for (&y, (i, j)) in self.network.admittance().ybus().iter() {
            let (lp, lq) = (lambda[i], lambda[nb + i]);
            if i == j {
                out.push((vm_off + i, vm_off + i, 2.0 * (lp * y.re - lq * y.im)));
            } else {
                let block = pair_hessian(zero, y, p.vm[i], p.vm[j], p.va[i] - p.va[j], lp, lq);
                push_block(&mut out, [i, j, vm_off + i, vm_off + j], &block);
            }
        }

        let mut row = 0;
        for &(k, _) in &self.rated {
            let (Some(ends), Some(y)) = (self.branch_ends(k, &p), self.network.admittance().branch(k)) else {
                continue;
            };
            let (f, t) = self.network.branch_ends(k);
            let terms = [
                (y.yff, y.yft, p.vm[f], p.vm[t], p.va[f] - p.va[t]),
                (y.ytt, y.ytf, p.vm[t], p.vm[f], p.va[t] - p.va[f]),
            ];
            for ((flow, index), (yii, yij, vi, vj, theta)) in ends.into_iter().zip(terms) {
                let m = mu[row];
                row += 1;
                if m == 0.0 {
                    continue;
                }
                let mut block = pair_hessian(yii, yij, vi, vj, theta, 2.0 * m * flow.p, 2.0 * m * flow.q);
                for r in 0..4 {
                    for c in 0..4 {
                        block[r][c] += 2.0 * m * (flow.dp[r] * flow.dp[c] + flow.dq[r] * flow.dq[c]);
                    }
                }
                push_block(&mut out, index, &block);
            }
        }
        out
    }
}

/// Run the AC-OPF; the [`Solution`] carries the interior point status.
pub(crate) fn solve(network: &NetworkModel, options: &IpmOptions, clock: &Deadline) -> (Solution, Violations) {
    let program = AcOpfProgram::new(network);
    let result = ipm::solve(&program, options, clock);
    debug!(
        buses = network.bus_count(),
        units = program.units.len(),
        rated_branches = program.rated.len(),
        iterations = result.iterations,
        "AC-OPF interior point finished"
    );
    let violations = check(&program, &result);
    (build_solution(&program, &result, clock), violations)
}

fn check(program: &AcOpfProgram<'_>, result: &IpmResult) -> Violations {
    let network = program.network;
    let nb = program.nb();
    let p = program.split(&result.x);
    let mut violations = violations_for(network);

    let g = program.balance(&p);
    for (i, bus) in network.buses().iter().enumerate() {
        let entity = Entity::Bus(bus.id);
        violations.zero(ConstraintKind::PowerBalanceP, entity.clone(), g[i]);
        violations.zero(ConstraintKind::PowerBalanceQ, entity.clone(), g[nb + i]);
        violations.lower(ConstraintKind::VoltageMin, entity.clone(), p.vm[i], bus.v_min.value());
        violations.upper(ConstraintKind::VoltageMax, entity, p.vm[i], bus.v_max.value());
    }
    let (qmin, qmax) = program.units.q_bounds(network);
    for (u, &gi) in program.units.gens.iter().enumerate() {
        let entity = Entity::Gen(network.gens()[gi].id);
        violations.lower(ConstraintKind::GenQMin, entity.clone(), p.qg[u], qmin[u]);
        violations.upper(ConstraintKind::GenQMax, entity, p.qg[u], qmax[u]);
    }
    for &(k, smax) in &program.rated {
        let Some(ends) = program.branch_ends(k, &p) else {
            continue;
        };
        let entity = Entity::Branch(network.branches()[k].id);
        for (flow, _) in ends {
            violations.upper(ConstraintKind::BranchFlow, entity.clone(), flow.p.hypot(flow.q), smax);
        }
    }
    check_units(network, &program.units, p.pg, p.va, &mut violations);
    violations
}

fn build_solution(program: &AcOpfProgram<'_>, result: &IpmResult, clock: &Deadline) -> Solution {
    let network = program.network;
    let nb = program.nb();
    let base = network.base_mva();
    let p = program.split(&result.x);
    let v = mismatch::voltages(p.vm, p.va);
    let s = network.admittance().injections(&v);
    let vm_off = program.vm_offset();

    let buses = network
        .buses()
        .iter()
        .enumerate()
        .map(|(i, bus)| BusResult {
            id: bus.id,
            bus_type: network.effective_bus_type(i),
            vm: p.vm[i],
            va: p.va[i],
            p_injection_mw: s[i].re * base,
            q_injection_mvar: s[i].im * base,
            lmp: Some(result.lambda[i] / base),
            q_price: Some(result.lambda[nb + i] / base),
            mu_v_min: Some(result.mu_lower[vm_off + i]),
            mu_v_max: Some(result.mu_upper[vm_off + i]),
        })
        .collect();

    let mut branches = ac_branch_flows(network, &v, base);
    for flow in branches.iter_mut().filter(|b| b.in_service) {
        flow.mu_s_from = Some(0.0);
        flow.mu_s_to = Some(0.0);
    }
    for (m, &(k, smax)) in program.rated.iter().enumerate() {
        branches[k].mu_s_from = Some(2.0 * result.mu[2 * m] * smax / base);
        branches[k].mu_s_to = Some(2.0 * result.mu[2 * m + 1] * smax / base);
    }

    let mut gens = empty_dispatch(network);
    for (u, &g) in program.units.gens.iter().enumerate() {
        gens[g].p_mw = p.pg[u] * base;
        gens[g].q_mvar = p.qg[u] * base;
    }

    Solution {
        solver: SolverKind::AcOpf,
        status: status_of(result.status),
        iterations: result.iterations,
        max_mismatch: mismatch::inf_norm(&program.balance(&p)),
        buses,
        branches,
        gens,
        objective: Some(program.units.total_cost(network, p.pg)),
        solve_time_ms: clock.elapsed_ms(),
    }
}
