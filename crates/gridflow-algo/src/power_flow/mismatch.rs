//! Power mismatch and polar voltage derivatives.
//!
//! Shared by the Newton and fast-decoupled solvers and by the round-trip
//! check in [`crate::mismatch_norm`].

use gridflow_core::Admittance;
use num_complex::Complex64;
use sprs::{CsMat, TriMat};

use super::bus_state::BusIndex;

/// Complex voltages from polar magnitude and angle.
pub fn voltages(vm: &[f64], va: &[f64]) -> Vec<Complex64> {
    vm.iter()
        .zip(va)
        .map(|(&m, &a)| Complex64::from_polar(m, a))
        .collect()
}

/// Complex mismatch `ΔS = V ∘ conj(Ybus·V) − S_spec` per bus (pu).
pub fn power_mismatch(y: &Admittance, v: &[Complex64], s_spec: &[Complex64]) -> Vec<Complex64> {
    y.injections(v)
        .into_iter()
        .zip(s_spec)
        .map(|(s, spec)| s - spec)
        .collect()
}

/// Stack `[ΔP(pvpq); ΔQ(pq)]`.
pub fn mismatch_vector(ds: &[Complex64], index: &BusIndex) -> Vec<f64> {
    index
        .pvpq
        .iter()
        .map(|&i| ds[i].re)
        .chain(index.pq.iter().map(|&i| ds[i].im))
        .collect()
}

/// Infinity norm that propagates NaN.
pub fn inf_norm(values: &[f64]) -> f64 {
    values.iter().fold(0.0_f64, |m, &v| {
        if v.is_nan() || m.is_nan() {
            f64::NAN
        } else {
            m.max(v.abs())
        }
    })
}

/// `‖F‖∞` at the polar point `(vm, va)` under the given classification.
pub fn mismatch_at(
    y: &Admittance,
    vm: &[f64],
    va: &[f64],
    s_spec: &[Complex64],
    index: &BusIndex,
) -> f64 {
    let ds = power_mismatch(y, &voltages(vm, va), s_spec);
    inf_norm(&mismatch_vector(&ds, index))
}

/// Partial derivatives of the bus injections with respect to voltage angle
/// and magnitude, polar form:
///
/// ```text
/// ∂S/∂θ   = j·diag(V)·conj(diag(I) − Ybus·diag(V))
/// ∂S/∂|V| = diag(V)·conj(Ybus·diag(V/|V|)) + conj(diag(I))·diag(V/|V|)
/// ```
pub fn voltage_derivatives(
    ybus: &CsMat<Complex64>,
    v: &[Complex64],
) -> (CsMat<Complex64>, CsMat<Complex64>) {
    let n = v.len();
    let currents = gridflow_core::admittance::spmv(ybus, v);
    let vnorm: Vec<Complex64> = v
        .iter()
        .map(|vi| {
            let m = vi.norm();
            if m > 0.0 {
                vi / m
            } else {
                Complex64::new(1.0, 0.0)
            }
        })
        .collect();
    let j = Complex64::new(0.0, 1.0);

    let mut d_va = TriMat::new((n, n));
    let mut d_vm = TriMat::new((n, n));
    for (&y, (r, c)) in ybus.iter() {
        d_va.add_triplet(r, c, -j * v[r] * (y * v[c]).conj());
        d_vm.add_triplet(r, c, v[r] * (y * vnorm[c]).conj());
    }
    for i in 0..n {
        d_va.add_triplet(i, i, j * v[i] * currents[i].conj());
        d_vm.add_triplet(i, i, currents[i].conj() * vnorm[i]);
    }
    (d_va.to_csr(), d_vm.to_csr())
}

/// Position of each bus inside an index list, `None` when absent.
pub fn positions(n: usize, list: &[usize]) -> Vec<Option<usize>> {
    let mut pos = vec![None; n];
    for (k, &i) in list.iter().enumerate() {
        pos[i] = Some(k);
    }
    pos
}

/// Reduced polar Jacobian
///
/// ```text
/// J = [ Re ∂S/∂θ  [pvpq, pvpq]   Re ∂S/∂|V| [pvpq, pq] ]
///     [ Im ∂S/∂θ  [pq,   pvpq]   Im ∂S/∂|V| [pq,   pq] ]
/// ```
pub fn jacobian(
    d_va: &CsMat<Complex64>,
    d_vm: &CsMat<Complex64>,
    index: &BusIndex,
) -> TriMat<f64> {
    let n = d_va.rows();
    let npvpq = index.pvpq.len();
    let dim = npvpq + index.pq.len();
    let pvpq = positions(n, &index.pvpq);
    let pq = positions(n, &index.pq);

    let mut jac = TriMat::new((dim, dim));
    for (&d, (r, c)) in d_va.iter() {
        let Some(col) = pvpq[c] else { continue };
        if let Some(row) = pvpq[r] {
            jac.add_triplet(row, col, d.re);
        }
        if let Some(row) = pq[r] {
            jac.add_triplet(npvpq + row, col, d.im);
        }
    }
    for (&d, (r, c)) in d_vm.iter() {
        let Some(col) = pq[c] else { continue };
        if let Some(row) = pvpq[r] {
            jac.add_triplet(row, npvpq + col, d.re);
        }
        if let Some(row) = pq[r] {
            jac.add_triplet(npvpq + row, npvpq + col, d.im);
        }
    }
    jac
}

/// Square submatrix over the listed rows and columns.
pub fn submatrix(matrix: &CsMat<f64>, keep: &[usize]) -> TriMat<f64> {
    let pos = positions(matrix.rows(), keep);
    let mut sub = TriMat::new((keep.len(), keep.len()));
    for (&v, (r, c)) in matrix.iter() {
        if let (Some(row), Some(col)) = (pos[r], pos[c]) {
            sub.add_triplet(row, col, v);
        }
    }
    sub
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::{Branch, BranchId, Bus, BusId, BusType, NetworkBuilder};

    fn two_bus() -> gridflow_core::NetworkModel {
        let mut b = NetworkBuilder::new(100.0);
        b.add_bus(Bus::new(BusId::new(1), BusType::Slack, 138.0))
            .add_bus(Bus::new(BusId::new(2), BusType::PQ, 138.0))
            .add_branch(
                Branch::new(BranchId::new(1), BusId::new(1), BusId::new(2), 0.02, 0.1)
                    .with_charging(0.04)
                    .with_tap(0.97),
            );
        b.build().unwrap()
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let net = two_bus();
        let y = net.admittance();
        let vm = [1.02, 0.97];
        let va = [0.0, -0.07];
        let v = voltages(&vm, &va);
        let (d_va, d_vm) = voltage_derivatives(y.ybus(), &v);
        let s0 = y.injections(&v);

        let h = 1e-7;
        for k in 0..2 {
            let mut va_h = va;
            va_h[k] += h;
            let s_h = y.injections(&voltages(&vm, &va_h));
            let mut vm_h = vm;
            vm_h[k] += h;
            let s_m = y.injections(&voltages(&vm_h, &va));
            for i in 0..2 {
                let fd_a = (s_h[i] - s0[i]) / h;
                let fd_m = (s_m[i] - s0[i]) / h;
                let an_a = d_va.get(i, k).copied().unwrap_or_default();
                let an_m = d_vm.get(i, k).copied().unwrap_or_default();
                assert!((fd_a - an_a).norm() < 1e-5, "dS{i}/dθ{k}");
                assert!((fd_m - an_m).norm() < 1e-5, "dS{i}/dV{k}");
            }
        }
    }

    #[test]
    fn mismatch_vector_layout() {
        let ds = vec![
            Complex64::new(9.0, 9.0),
            Complex64::new(1.0, 2.0),
            Complex64::new(3.0, 4.0),
        ];
        let index = BusIndex {
            pv: vec![1],
            pq: vec![2],
            pvpq: vec![1, 2],
        };
        assert_eq!(mismatch_vector(&ds, &index), vec![1.0, 3.0, 4.0]);
        assert_eq!(inf_norm(&[1.0, -5.0, 2.0]), 5.0);
        assert!(inf_norm(&[1.0, f64::NAN, 2.0]).is_nan());
    }

    #[test]
    fn submatrix_keeps_listed_rows() {
        let mut t = TriMat::new((3, 3));
        for i in 0..3 {
            for j in 0..3 {
                t.add_triplet(i, j, (3 * i + j) as f64);
            }
        }
        let m: CsMat<f64> = t.to_csr();
        let sub: CsMat<f64> = submatrix(&m, &[0, 2]).to_csr();
        assert_eq!(sub.get(0, 1).copied(), Some(2.0));
        assert_eq!(sub.get(1, 1).copied(), Some(8.0));
    }
}
