//! Optimal power flow integration tests on the IEEE 14-bus system

mod common;

use common::{bus, ieee14, ieee14_records};
use gridflow_algo::{
    economic_dispatch, solve, ConstraintKind, DivergenceReason, OpfFormulation,
    OptimalPowerFlowSolver, Solution, SolveError, SolveStatus, SolverConfig, SolverKind,
};
use gridflow_core::{GenId, NetworkModel};

fn dc_opf() -> SolverConfig {
    SolverConfig::dc().with_opf(true)
}

fn ac_opf() -> SolverConfig {
    SolverConfig::newton().with_opf(true)
}

#[test]
fn dc_opf_matches_reference_cost() {
    let network = ieee14();
    let solution = solve(&network, &dc_opf()).expect("DC-OPF should solve");

    assert_eq!(solution.solver, SolverKind::DcOpf);
    assert!(solution.is_converged());
    let cost = solution.objective.expect("objective");
    assert!((cost - 7642.59).abs() < 0.5, "objective {cost}");

    // no flow limits and no losses: one system price everywhere
    let lmps = solution.lmps().expect("lmps");
    for lmp in &lmps {
        assert!((lmp - 39.02).abs() < 0.05, "lmp {lmp}");
    }
    assert!((solution.total_generation_mw() - network.total_load_mw()).abs() < 1e-3);
}

#[test]
fn unconstrained_dc_opf_equals_economic_dispatch() {
    let network = ieee14();
    let solution = solve(&network, &dc_opf()).unwrap();
    let dispatch = economic_dispatch(&network).unwrap();

    for gen in &solution.gens {
        let merit = dispatch.output(gen.id).expect("dispatched");
        assert!(
            (gen.p_mw - merit).abs() < 0.05,
            "gen {}: opf {} vs merit order {}",
            gen.id.value(),
            gen.p_mw,
            merit
        );
    }
    let cost = solution.objective.unwrap();
    assert!((cost - dispatch.total_cost).abs() < 0.1);
    assert!((solution.buses[0].lmp.unwrap() - dispatch.lambda).abs() < 0.05);
}

#[test]
fn dc_opf_congestion_separates_prices() {
    let (buses, mut branches, gens) = ieee14_records();
    branches[0] = branches[0].clone().with_rating(100.0);
    let network = NetworkModel::new(100.0, buses, branches, gens).unwrap();

    let solution = solve(&network, &dc_opf()).unwrap();
    assert!(solution.is_converged());
    assert!(solution.objective.unwrap() > 7642.59);

    let line = &solution.branches[0];
    assert!(line.p_from_mw.abs() <= 100.0 + 1e-2, "flow {}", line.p_from_mw);
    assert!(line.p_from_mw > 99.0, "limit should bind, flow {}", line.p_from_mw);
    assert!(line.mu_s_from.unwrap() > 0.0);

    let lmp1 = solution.buses[bus(&network, 1)].lmp.unwrap();
    let lmp2 = solution.buses[bus(&network, 2)].lmp.unwrap();
    assert!(lmp2 > lmp1 + 1.0, "lmp1 {lmp1} lmp2 {lmp2}");
}

#[test]
fn ac_opf_matches_reference_cost() {
    let network = ieee14();
    let solution = solve(&network, &ac_opf()).expect("AC-OPF should solve");

    assert_eq!(solution.solver, SolverKind::AcOpf);
    assert!(solution.is_converged());
    let cost = solution.objective.expect("objective");
    assert!((cost - 8081.5).abs() < 1.0, "objective {cost}");

    let losses = solution.total_generation_mw() - network.total_load_mw();
    assert!(losses > 0.0 && losses < 20.0, "losses {losses}");
    assert!((losses - solution.total_losses_mw()).abs() < 1e-2);

    for (result, record) in solution.buses.iter().zip(network.buses()) {
        assert!(result.vm >= record.v_min.value() - 1e-4);
        assert!(result.vm <= record.v_max.value() + 1e-4);
        let lmp = result.lmp.expect("lmp");
        assert!(lmp > 30.0 && lmp < 50.0, "bus {} lmp {lmp}", result.id.value());
        assert!(result.q_price.is_some());
    }
    for (dispatch, record) in solution.gens.iter().zip(network.gens()) {
        assert!(dispatch.p_mw >= record.pmin.value() - 1e-2);
        assert!(dispatch.p_mw <= record.pmax.value() + 1e-2);
        assert!(dispatch.q_mvar >= record.qmin.value() - 1e-2);
        assert!(dispatch.q_mvar <= record.qmax.value() + 1e-2);
    }
}

#[test]
fn ac_opf_costs_more_than_lossless_dispatch() {
    let network = ieee14();
    let ac = solve(&network, &ac_opf()).unwrap().objective.unwrap();
    let dc = solve(&network, &dc_opf()).unwrap().objective.unwrap();
    assert!(ac > dc, "ac {ac} vs dc {dc}");
}

#[test]
fn capacity_shortfall_is_infeasible() {
    let (buses, branches, gens) = ieee14_records();
    let buses = buses
        .into_iter()
        .map(|b| {
            let (p, q) = (b.p_load.value() * 4.0, b.q_load.value());
            b.with_load(p, q)
        })
        .collect();
    let network = NetworkModel::new(100.0, buses, branches, gens).unwrap();

    for formulation in [OpfFormulation::Dc, OpfFormulation::Ac] {
        match OptimalPowerFlowSolver::new(formulation).solve(&network) {
            Err(SolveError::Infeasible { violations, .. }) => {
                assert_eq!(violations[0].kind, ConstraintKind::GenerationCapacity);
            }
            other => panic!("expected infeasible, got {other:?}"),
        }
    }
    assert!(matches!(
        economic_dispatch(&network),
        Err(SolveError::Infeasible { .. })
    ));
}

#[test]
fn early_stop_reports_violations_or_divergence() {
    let network = ieee14();
    let config = ac_opf().with_opf_max_iterations(3);
    match solve(&network, &config) {
        Err(SolveError::Infeasible { reason, violations }) => {
            assert!(!violations.is_empty());
            assert!(reason.contains("after 3 iterations"), "{reason}");
        }
        Ok(solution) => assert_eq!(
            solution.status,
            SolveStatus::Diverged(DivergenceReason::MaxIterations)
        ),
        Err(other) => panic!("unexpected error {other}"),
    }
}

#[test]
fn opf_solution_survives_json() {
    let network = ieee14();
    let solution = solve(&network, &dc_opf()).unwrap();

    let text = serde_json::to_string(&solution).unwrap();
    let back: Solution = serde_json::from_str(&text).unwrap();

    assert_eq!(back.solver, solution.solver);
    assert_eq!(back.status, solution.status);
    assert_eq!(back.iterations, solution.iterations);
    assert_eq!(back.buses.len(), solution.buses.len());
    for (a, b) in back.buses.iter().zip(&solution.buses) {
        assert_eq!(a.id, b.id);
        assert!((a.va - b.va).abs() < 1e-12);
        assert!((a.lmp.unwrap() - b.lmp.unwrap()).abs() < 1e-9);
    }
    let p1 = |s: &Solution| s.gen(GenId::new(1)).unwrap().p_mw;
    assert!((p1(&back) - p1(&solution)).abs() < 1e-9);
}
