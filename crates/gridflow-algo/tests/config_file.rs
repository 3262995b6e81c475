//! Solver selection from TOML configuration files

mod common;

use std::fs;

use common::ieee14;
use gridflow_algo::{solve, SolveError, SolverConfig, SolverKind};
use gridflow_core::AdmittanceBuilder;
use tempfile::tempdir;

#[test]
fn toml_file_selects_dc_opf() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("solver.toml");
    fs::write(
        &path,
        "solver_type = \"dc\"\nopf_enabled = true\nopf_max_iterations = 80\n",
    )
    .unwrap();

    let config = SolverConfig::from_toml_file(&path).unwrap();
    let solution = solve(&ieee14(), &config).unwrap();
    assert_eq!(solution.solver, SolverKind::DcOpf);
    assert!(solution.objective.is_some());
}

#[test]
fn toml_file_with_strict_fast_decoupled() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("strict.toml");
    fs::write(
        &path,
        "solver_type = \"fast_decoupled\"\nmax_iterations = 2\nstrict = true\n",
    )
    .unwrap();

    let config = SolverConfig::from_toml_file(&path).unwrap();
    match solve(&ieee14(), &config) {
        Err(SolveError::Convergence { solver, iterations, .. }) => {
            assert_eq!(solver, SolverKind::FastDecoupled);
            assert_eq!(iterations, 2);
        }
        other => panic!("expected convergence error, got {other:?}"),
    }
}

#[test]
fn case14_admittance_is_symmetric() {
    let network = ieee14();
    let y = network.admittance();
    assert_eq!(y.bus_count(), 14);
    assert!(y.is_symmetric(1e-12));

    // 14 diagonal entries plus both directions of the 20 branches
    assert_eq!(y.nnz(), 14 + 2 * 20);

    let lossless = AdmittanceBuilder::new(&network)
        .without_resistance()
        .without_line_charging()
        .build();
    assert!(lossless.is_symmetric(1e-12));
    for i in 0..14 {
        assert_eq!(lossless.get(i, i).re, 0.0);
    }
}
