//! Primal-dual interior point method
//!
//! Solves smooth nonlinear programs of the form
//!
//! ```text
//!   minimize    f(x)
//!   subject to  g(x)  = 0
//!               h(x) <= 0
//!               l <= x <= u
//! ```
//!
//! following the MATPOWER Interior Point Solver (MIPS). Variable bounds are
//! folded into the constraint sets (fixed variables become equalities, finite
//! bounds become linear inequalities). Each iteration solves the reduced KKT
//! system
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  [ M   Jgᵀ ] [ Δx ]   [ −N ]      M = ∇²L + Jhᵀ·diag(μ/z)·Jh        │
//! │  [ Jg  0   ] [ Δλ ] = [ −g ]      N = ∇L  + Jhᵀ·(μ∘h + γ)/z         │
//! │                                                                       │
//! │  Δz = −h − z − Jh·Δx              Δμ = −μ + (γ − μ∘Δz)/z             │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! then takes the largest fraction-to-boundary steps keeping `z, μ > 0` and
//! shrinks the barrier parameter `γ = σ·zᵀμ / n_ineq`.
//!
//! Convergence requires the scaled feasibility, gradient, complementarity
//! and cost-change conditions all below the tolerance.
//!
//! ## References
//!
//! - Wang, Murillo-Sánchez, Zimmerman & Thomas (2007): "On Computational
//!   Issues of Market-Based Optimal Power Flow", IEEE Trans. Power Systems,
//!   22(3), 1185-1193.
//!   DOI: [10.1109/TPWRS.2007.901301](https://doi.org/10.1109/TPWRS.2007.901301)

use gridflow_core::LuFactor;
use sprs::TriMat;
use tracing::debug;

use crate::power_flow::Deadline;

/// Sparse matrix entries `(row, col, value)`; duplicates are summed.
pub type Triplets = Vec<(usize, usize, f64)>;

/// A smooth nonlinear program in the form above.
///
/// Jacobian rows are constraint indices and columns variable indices. The
/// Hessian is of `cost_mult·f + λᵀg + μᵀh` over the program's own
/// constraints (bounds contribute nothing) and must list both triangles.
pub trait NonlinearProgram {
    fn dim(&self) -> usize;

    /// Lower and upper variable bounds; use infinities for free variables.
    fn bounds(&self) -> (Vec<f64>, Vec<f64>);

    fn initial_point(&self) -> Vec<f64>;

    /// Objective value and gradient.
    fn objective(&self, x: &[f64]) -> (f64, Vec<f64>);

    /// Equality residuals `g(x)` and their Jacobian.
    fn equalities(&self, x: &[f64]) -> (Vec<f64>, Triplets);

    /// Inequality values `h(x)` (feasible when `<= 0`) and their Jacobian.
    fn inequalities(&self, x: &[f64]) -> (Vec<f64>, Triplets);

    fn hessian(&self, x: &[f64], lambda: &[f64], mu: &[f64], cost_mult: f64) -> Triplets;
}

#[derive(Debug, Clone)]
pub struct IpmOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
    /// Objective scaling applied during the solve; multipliers are reported unscaled.
    pub cost_mult: f64,
}

impl Default for IpmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 150,
            tolerance: 1e-6,
            cost_mult: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpmStatus {
    Converged,
    MaxIterations,
    NumericalBreakdown,
    Deadline,
}

#[derive(Debug, Clone)]
pub struct IpmResult {
    pub status: IpmStatus,
    pub iterations: usize,
    pub x: Vec<f64>,
    pub objective: f64,
    /// Multipliers of the program's equalities
    pub lambda: Vec<f64>,
    /// Multipliers of the program's inequalities
    pub mu: Vec<f64>,
    /// Multipliers of the variable lower bounds
    pub mu_lower: Vec<f64>,
    /// Multipliers of the variable upper bounds
    pub mu_upper: Vec<f64>,
}

/// Bounds at or beyond this magnitude are treated as absent.
const BOUND_INF: f64 = 1e10;
const XI: f64 = 0.99995;
const SIGMA: f64 = 0.1;
const Z0: f64 = 1.0;
const ALPHA_MIN: f64 = 1e-8;
/// Multipliers below this on slack constraints are reported as zero.
const MU_THRESHOLD: f64 = 1e-5;

#[derive(Debug, Default)]
struct BoundRows {
    fixed: Vec<(usize, f64)>,
    upper: Vec<(usize, f64)>,
    lower: Vec<(usize, f64)>,
}

impl BoundRows {
    fn new(lb: &[f64], ub: &[f64]) -> Self {
        let mut rows = Self::default();
        for (j, (&l, &u)) in lb.iter().zip(ub).enumerate() {
            if (u - l).abs() <= f64::EPSILON {
                rows.fixed.push((j, u));
                continue;
            }
            if u < BOUND_INF {
                rows.upper.push((j, u));
            }
            if l > -BOUND_INF {
                rows.lower.push((j, l));
            }
        }
        rows
    }
}

/// Objective and constraints at one point, bounds included.
struct Eval {
    f: f64,
    df: Vec<f64>,
    g: Vec<f64>,
    jg: Triplets,
    h: Vec<f64>,
    jh: Triplets,
}

fn evaluate<P: NonlinearProgram + ?Sized>(
    nlp: &P,
    bounds: &BoundRows,
    x: &[f64],
    cost_mult: f64,
) -> Eval {
    let (f, mut df) = nlp.objective(x);
    df.iter_mut().for_each(|d| *d *= cost_mult);

    let (mut g, mut jg) = nlp.equalities(x);
    let base = g.len();
    for (k, &(j, value)) in bounds.fixed.iter().enumerate() {
        g.push(x[j] - value);
        jg.push((base + k, j, 1.0));
    }

    let (mut h, mut jh) = nlp.inequalities(x);
    let base = h.len();
    for (k, &(j, u)) in bounds.upper.iter().enumerate() {
        h.push(x[j] - u);
        jh.push((base + k, j, 1.0));
    }
    let base = h.len();
    for (k, &(j, l)) in bounds.lower.iter().enumerate() {
        h.push(l - x[j]);
        jh.push((base + k, j, -1.0));
    }

    Eval {
        f: f * cost_mult,
        df,
        g,
        jg,
        h,
        jh,
    }
}

fn norm_inf(v: &[f64]) -> f64 {
    v.iter().fold(0.0_f64, |m, x| m.max(x.abs()))
}

fn lagrangian_gradient(e: &Eval, lambda: &[f64], mu: &[f64]) -> Vec<f64> {
    let mut lx = e.df.clone();
    for &(r, c, v) in &e.jg {
        lx[c] += v * lambda[r];
    }
    for &(r, c, v) in &e.jh {
        lx[c] += v * mu[r];
    }
    lx
}

struct Conditions {
    feas: f64,
    grad: f64,
    comp: f64,
    cost: f64,
}

impl Conditions {
    fn new(e: &Eval, x: &[f64], z: &[f64], lambda: &[f64], mu: &[f64], lx: &[f64], f0: f64) -> Self {
        let max_h = e.h.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let violation = norm_inf(&e.g).max(max_h);
        let zmu: f64 = z.iter().zip(mu).map(|(a, b)| a * b).sum();
        Self {
            feas: violation / (1.0 + norm_inf(x).max(norm_inf(z))),
            grad: norm_inf(lx) / (1.0 + norm_inf(lambda).max(norm_inf(mu))),
            comp: zmu / (1.0 + norm_inf(x)),
            cost: (e.f - f0).abs() / (1.0 + f0.abs()),
        }
    }

    fn converged(&self, tol: f64) -> bool {
        self.feas < tol && self.grad < tol && self.comp < tol && self.cost < tol
    }
}

/// Largest step in `(0, 1]` keeping `v + α·dv` positive, scaled by ξ.
fn step_length(v: &[f64], dv: &[f64]) -> f64 {
    v.iter()
        .zip(dv)
        .filter(|&(_, &d)| d < 0.0)
        .map(|(&a, &d)| XI * a / -d)
        .fold(1.0, f64::min)
}

/// Run the interior point method from the program's initial point.
pub(crate) fn solve<P: NonlinearProgram + ?Sized>(
    nlp: &P,
    options: &IpmOptions,
    deadline: &Deadline,
) -> IpmResult {
    let nx = nlp.dim();
    let (lb, ub) = nlp.bounds();
    let bounds = BoundRows::new(&lb, &ub);
    let cost_mult = options.cost_mult;

    let mut x = nlp.initial_point();
    let mut e = evaluate(nlp, &bounds, &x, cost_mult);
    let neq = e.g.len();
    let niq = e.h.len();
    let neq_nln = neq - bounds.fixed.len();
    let niq_nln = niq - bounds.upper.len() - bounds.lower.len();

    let mut gamma = 1.0;
    let mut lambda = vec![0.0; neq];
    let mut z: Vec<f64> = e.h.iter().map(|&h| if h < -Z0 { -h } else { Z0 }).collect();
    let mut mu: Vec<f64> = z
        .iter()
        .map(|&zi| if gamma / zi > Z0 { gamma / zi } else { Z0 })
        .collect();

    let mut f0 = e.f;
    let mut lx = lagrangian_gradient(&e, &lambda, &mu);
    let mut cond = Conditions::new(&e, &x, &z, &lambda, &mu, &lx, f0);

    let mut iterations = 0;
    let status = loop {
        if cond.converged(options.tolerance) {
            break IpmStatus::Converged;
        }
        if iterations >= options.max_iterations {
            break IpmStatus::MaxIterations;
        }
        if deadline.expired() {
            break IpmStatus::Deadline;
        }
        iterations += 1;

        // Jh grouped by row for the condensed barrier term
        let mut jh_rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); niq];
        for &(r, c, v) in &e.jh {
            jh_rows[r].push((c, v));
        }

        let mut kkt = TriMat::new((nx + neq, nx + neq));
        for (r, c, v) in nlp.hessian(&x, &lambda[..neq_nln], &mu[..niq_nln], cost_mult) {
            kkt.add_triplet(r, c, v);
        }
        let mut n_vec = lx.clone();
        for (r, row) in jh_rows.iter().enumerate() {
            let w = mu[r] / z[r];
            let s = (mu[r] * e.h[r] + gamma) / z[r];
            for &(a, va) in row {
                n_vec[a] += va * s;
                for &(b, vb) in row {
                    kkt.add_triplet(a, b, w * va * vb);
                }
            }
        }
        for &(r, c, v) in &e.jg {
            kkt.add_triplet(c, nx + r, v);
            kkt.add_triplet(nx + r, c, v);
        }
        let rhs: Vec<f64> = n_vec
            .iter()
            .chain(&e.g)
            .map(|v| -v)
            .collect();

        let step = LuFactor::from_triplets(&kkt)
            .map(|lu| lu.with_condition_limit(f64::INFINITY))
            .and_then(|lu| lu.solve(&rhs));
        let Ok(step) = step else {
            break IpmStatus::NumericalBreakdown;
        };
        let (dx, dlambda) = step.split_at(nx);

        let mut jh_dx = vec![0.0; niq];
        for &(r, c, v) in &e.jh {
            jh_dx[r] += v * dx[c];
        }
        let dz: Vec<f64> = (0..niq).map(|r| -e.h[r] - z[r] - jh_dx[r]).collect();
        let dmu: Vec<f64> = (0..niq)
            .map(|r| -mu[r] + (gamma - mu[r] * dz[r]) / z[r])
            .collect();

        let alpha_p = step_length(&z, &dz);
        let alpha_d = step_length(&mu, &dmu);

        for (xi, d) in x.iter_mut().zip(dx) {
            *xi += alpha_p * d;
        }
        for (zi, d) in z.iter_mut().zip(&dz) {
            *zi += alpha_p * d;
        }
        for (li, d) in lambda.iter_mut().zip(dlambda) {
            *li += alpha_d * d;
        }
        for (mi, d) in mu.iter_mut().zip(&dmu) {
            *mi += alpha_d * d;
        }
        if niq > 0 {
            gamma = SIGMA * z.iter().zip(&mu).map(|(a, b)| a * b).sum::<f64>() / niq as f64;
        }

        e = evaluate(nlp, &bounds, &x, cost_mult);
        lx = lagrangian_gradient(&e, &lambda, &mu);
        cond = Conditions::new(&e, &x, &z, &lambda, &mu, &lx, f0);
        f0 = e.f;
        debug!(
            iteration = iterations,
            feascond = cond.feas,
            gradcond = cond.grad,
            compcond = cond.comp,
            costcond = cond.cost,
            gamma,
            alpha_p,
            alpha_d,
            "interior point iteration"
        );

        if cond.converged(options.tolerance) {
            break IpmStatus::Converged;
        }
        if x.iter().any(|v| !v.is_finite())
            || alpha_p < ALPHA_MIN
            || alpha_d < ALPHA_MIN
            || gamma < f64::EPSILON
            || gamma > 1.0 / f64::EPSILON
        {
            break IpmStatus::NumericalBreakdown;
        }
    };

    for (m, &h) in mu.iter_mut().zip(&e.h) {
        if h < -options.tolerance && *m < MU_THRESHOLD {
            *m = 0.0;
        }
    }
    lambda.iter_mut().for_each(|l| *l /= cost_mult);
    mu.iter_mut().for_each(|m| *m /= cost_mult);

    let mut mu_lower = vec![0.0; nx];
    let mut mu_upper = vec![0.0; nx];
    for (k, &(j, _)) in bounds.fixed.iter().enumerate() {
        let l = lambda[neq_nln + k];
        if l > 0.0 {
            mu_upper[j] = l;
        } else {
            mu_lower[j] = -l;
        }
    }
    let upper_base = niq_nln;
    for (k, &(j, _)) in bounds.upper.iter().enumerate() {
        mu_upper[j] = mu[upper_base + k];
    }
    let lower_base = niq_nln + bounds.upper.len();
    for (k, &(j, _)) in bounds.lower.iter().enumerate() {
        mu_lower[j] = mu[lower_base + k];
    }

    lambda.truncate(neq_nln);
    mu.truncate(niq_nln);
    IpmResult {
        status,
        iterations,
        objective: e.f / cost_mult,
        x,
        lambda,
        mu,
        mu_lower,
        mu_upper,
    }
}
