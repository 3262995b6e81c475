//! Sparse bus admittance matrix and branch flow operators.
//!
//! Every in-service branch is modeled as the standard two-port π with an ideal
//! transformer on the from side:
//!
//! ```text
//!   ys  = 1 / (r + jx)          tap = τ·e^{jφ}
//!   Ytt = ys + j·b/2            Yff = Ytt / |tap|²
//!   Yft = -ys / conj(tap)       Ytf = -ys / tap
//! ```
//!
//! The matrices are `Ybus = Cfᵀ·Yf + Ctᵀ·Yt + diag(Ysh)` with `Yf`/`Yt` the
//! branch-by-bus operators giving from-end and to-end currents, and
//! `Ysh = (Gs + jBs) / baseMVA` the bus shunts.
//!
//! The builder options switch individual model elements off. The
//! fast-decoupled solver uses them to derive its B' and B'' matrices from the
//! same assembly code (the MATPOWER `makeB` construction).

use crate::{Branch, NetworkModel};
use num_complex::Complex64;
use sprs::{CsMat, TriMat};

/// Per-branch two-port admittances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchAdmittance {
    pub yff: Complex64,
    pub yft: Complex64,
    pub ytf: Complex64,
    pub ytt: Complex64,
}

impl BranchAdmittance {
    fn from_branch(branch: &Branch, options: &AdmittanceOptions) -> Self {
        let r = if options.series_resistance || branch.reactance == 0.0 {
            branch.resistance
        } else {
            0.0
        };
        let ys = Complex64::new(1.0, 0.0) / Complex64::new(r, branch.reactance);
        let b = if options.line_charging {
            branch.charging_b
        } else {
            0.0
        };
        let tau = if options.tap_magnitude {
            branch.effective_tap()
        } else {
            1.0
        };
        let shift = if options.phase_shift {
            branch.phase_shift.value()
        } else {
            0.0
        };
        let tap = Complex64::from_polar(tau, shift);

        let ytt = ys + Complex64::new(0.0, b / 2.0);
        Self {
            yff: ytt / (tau * tau),
            yft: -ys / tap.conj(),
            ytf: -ys / tap,
            ytt,
        }
    }
}

/// Which parts of the network model enter the assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmittanceOptions {
    pub bus_shunts: bool,
    pub line_charging: bool,
    pub tap_magnitude: bool,
    pub phase_shift: bool,
    pub series_resistance: bool,
}

impl Default for AdmittanceOptions {
    fn default() -> Self {
        Self {
            bus_shunts: true,
            line_charging: true,
            tap_magnitude: true,
            phase_shift: true,
            series_resistance: true,
        }
    }
}

/// Assembles [`Admittance`] for a [`NetworkModel`].
///
/// The full model is cached on the network itself (see
/// [`NetworkModel::admittance`]); use the builder directly only for modified
/// assemblies.
pub struct AdmittanceBuilder<'a> {
    network: &'a NetworkModel,
    options: AdmittanceOptions,
}

impl<'a> AdmittanceBuilder<'a> {
    pub fn new(network: &'a NetworkModel) -> Self {
        Self {
            network,
            options: AdmittanceOptions::default(),
        }
    }

    pub fn with_options(mut self, options: AdmittanceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn without_bus_shunts(mut self) -> Self {
        self.options.bus_shunts = false;
        self
    }

    pub fn without_line_charging(mut self) -> Self {
        self.options.line_charging = false;
        self
    }

    /// Treat every tap magnitude as nominal.
    pub fn without_taps(mut self) -> Self {
        self.options.tap_magnitude = false;
        self
    }

    pub fn without_phase_shift(mut self) -> Self {
        self.options.phase_shift = false;
        self
    }

    /// Drop series resistance (branches with zero reactance keep theirs).
    pub fn without_resistance(mut self) -> Self {
        self.options.series_resistance = false;
        self
    }

    pub fn build(self) -> Admittance {
        let network = self.network;
        let nb = network.bus_count();
        let nl = network.branch_count();

        let mut ybus = TriMat::new((nb, nb));
        let mut yf = TriMat::new((nl, nb));
        let mut yt = TriMat::new((nl, nb));
        let mut branches = Vec::with_capacity(nl);

        // keep the diagonal structurally present even for isolated buses
        for i in 0..nb {
            ybus.add_triplet(i, i, Complex64::new(0.0, 0.0));
        }

        for (k, branch) in network.branches().iter().enumerate() {
            if !branch.status {
                branches.push(None);
                continue;
            }
            let (f, t) = network.branch_ends(k);
            let y = BranchAdmittance::from_branch(branch, &self.options);

            ybus.add_triplet(f, f, y.yff);
            ybus.add_triplet(f, t, y.yft);
            ybus.add_triplet(t, f, y.ytf);
            ybus.add_triplet(t, t, y.ytt);

            yf.add_triplet(k, f, y.yff);
            yf.add_triplet(k, t, y.yft);
            yt.add_triplet(k, f, y.ytf);
            yt.add_triplet(k, t, y.ytt);

            branches.push(Some(y));
        }

        let mut shunts = vec![Complex64::new(0.0, 0.0); nb];
        if self.options.bus_shunts {
            for (i, shunt) in shunts.iter_mut().enumerate() {
                *shunt = network.shunt_pu(i);
                if shunt.norm() > 0.0 {
                    ybus.add_triplet(i, i, *shunt);
                }
            }
        }

        Admittance {
            ybus: ybus.to_csr(),
            yf: yf.to_csr(),
            yt: yt.to_csr(),
            branches,
            branch_ends: (0..nl).map(|k| network.branch_ends(k)).collect(),
            shunts,
        }
    }
}

/// Assembled Y-bus with branch flow operators.
#[derive(Debug, Clone)]
pub struct Admittance {
    ybus: CsMat<Complex64>,
    yf: CsMat<Complex64>,
    yt: CsMat<Complex64>,
    branches: Vec<Option<BranchAdmittance>>,
    branch_ends: Vec<(usize, usize)>,
    shunts: Vec<Complex64>,
}

impl Admittance {
    /// Full-model assembly.
    pub fn build(network: &NetworkModel) -> Self {
        AdmittanceBuilder::new(network).build()
    }

    pub fn ybus(&self) -> &CsMat<Complex64> {
        &self.ybus
    }

    /// From-end branch operator (branches × buses).
    pub fn yf(&self) -> &CsMat<Complex64> {
        &self.yf
    }

    /// To-end branch operator (branches × buses).
    pub fn yt(&self) -> &CsMat<Complex64> {
        &self.yt
    }

    pub fn bus_count(&self) -> usize {
        self.ybus.rows()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Two-port admittances of branch `k`, `None` when out of service.
    pub fn branch(&self, k: usize) -> Option<&BranchAdmittance> {
        self.branches.get(k).and_then(|b| b.as_ref())
    }

    pub fn branch_ends(&self, k: usize) -> (usize, usize) {
        self.branch_ends[k]
    }

    pub fn bus_shunt(&self, i: usize) -> Complex64 {
        self.shunts[i]
    }

    /// Y-bus entry, zero when structurally absent.
    pub fn get(&self, i: usize, j: usize) -> Complex64 {
        self.ybus.get(i, j).copied().unwrap_or_default()
    }

    pub fn nnz(&self) -> usize {
        self.ybus.nnz()
    }

    /// Entry-wise symmetry check of the Y-bus.
    pub fn is_symmetric(&self, tol: f64) -> bool {
        self.ybus
            .iter()
            .all(|(&v, (i, j))| (v - self.get(j, i)).norm() <= tol)
    }

    /// Bus current injections `I = Ybus·V`.
    pub fn currents(&self, v: &[Complex64]) -> Vec<Complex64> {
        spmv(&self.ybus, v)
    }

    /// Bus complex power injections `S = V ∘ conj(Ybus·V)` (pu).
    pub fn injections(&self, v: &[Complex64]) -> Vec<Complex64> {
        self.currents(v)
            .iter()
            .zip(v)
            .map(|(i, vi)| vi * i.conj())
            .collect()
    }

    /// Complex power entering each branch at its from and to ends (pu).
    /// Out-of-service branches carry zero.
    pub fn branch_flows(&self, v: &[Complex64]) -> Vec<(Complex64, Complex64)> {
        let i_from = spmv(&self.yf, v);
        let i_to = spmv(&self.yt, v);
        self.branch_ends
            .iter()
            .enumerate()
            .map(|(k, &(f, t))| (v[f] * i_from[k].conj(), v[t] * i_to[k].conj()))
            .collect()
    }

    /// `-Im(Ybus)` as a real sparse matrix.
    pub fn susceptance(&self) -> CsMat<f64> {
        let n = self.bus_count();
        let mut tri = TriMat::new((n, n));
        for (&v, (i, j)) in self.ybus.iter() {
            tri.add_triplet(i, j, -v.im);
        }
        tri.to_csr()
    }
}

/// Sparse (CSR) matrix times dense vector.
pub fn spmv(matrix: &CsMat<Complex64>, x: &[Complex64]) -> Vec<Complex64> {
    matrix
        .outer_iterator()
        .map(|row| row.iter().map(|(j, &y)| y * x[j]).sum())
        .collect()
}
