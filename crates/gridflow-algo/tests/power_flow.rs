//! Power-flow integration tests on the IEEE 14-bus system

mod common;

use common::{bus, ieee14, ieee14_records};
use gridflow_algo::{
    mismatch_norm, solve, solve_batch, DivergenceReason, FdMethod, SolveError, SolveStatus,
    SolverConfig, SolverKind,
};
use gridflow_core::{
    Branch, BranchId, Bus, BusId, BusType, Gen, GenId, NetworkBuilder, NetworkModel,
};
use std::time::Duration;

#[test]
fn newton_matches_published_case14_voltages() {
    let network = ieee14();
    let solution = solve(&network, &SolverConfig::newton()).expect("newton should run");

    assert!(solution.is_converged());
    assert!(solution.iterations <= 6, "took {} iterations", solution.iterations);
    assert!(solution.max_mismatch < 1e-8);

    let b14 = &solution.buses[bus(&network, 14)];
    assert!((b14.vm - 1.036).abs() < 1e-3, "Vm14 = {}", b14.vm);
    assert!(
        (b14.va.to_degrees() + 16.03).abs() < 0.05,
        "Va14 = {}°",
        b14.va.to_degrees()
    );

    // slack picks up load plus ~13.4 MW of losses
    let slack = solution.gen(gridflow_core::GenId::new(1)).expect("gen 1");
    assert!((slack.p_mw - 232.4).abs() < 0.2, "slack P = {}", slack.p_mw);
    assert!((solution.total_losses_mw() - 13.39).abs() < 0.05);
    let balance = solution.total_generation_mw() - network.total_load_mw() - solution.total_losses_mw();
    assert!(balance.abs() < 1e-6, "power balance off by {balance} MW");
}

#[test]
fn newton_and_fast_decoupled_agree() {
    let network = ieee14();
    let newton = solve(&network, &SolverConfig::newton().with_tolerance(1e-10)).unwrap();
    let fd = solve(
        &network,
        &SolverConfig::fast_decoupled().with_tolerance(1e-10).with_max_iterations(100),
    )
    .unwrap();

    assert!(newton.is_converged());
    assert!(fd.is_converged());
    assert_eq!(fd.solver, SolverKind::FastDecoupled);
    assert!(
        newton.iterations < fd.iterations,
        "newton {} vs fast decoupled {}",
        newton.iterations,
        fd.iterations
    );

    for (a, b) in newton.buses.iter().zip(&fd.buses) {
        assert!((a.vm - b.vm).abs() < 1e-6, "bus {}: vm", a.id.value());
        assert!((a.va - b.va).abs() < 1e-6, "bus {}: va", a.id.value());
    }
}

#[test]
fn both_fast_decoupled_variants_converge() {
    let network = ieee14();
    for method in [FdMethod::Xb, FdMethod::Bx] {
        let config = SolverConfig::fast_decoupled()
            .with_fd_method(method)
            .with_max_iterations(100);
        let solution = solve(&network, &config).unwrap();
        assert!(solution.is_converged(), "{method:?} did not converge");
        assert!(mismatch_norm(&network, &solution) < 1e-6);
    }
}

#[test]
fn mismatch_norm_reproduces_solver_mismatch() {
    let network = ieee14();
    let solution = solve(&network, &SolverConfig::newton()).unwrap();
    let norm = mismatch_norm(&network, &solution);
    assert!(norm < 1e-6, "mismatch {norm}");
    assert!(norm <= solution.max_mismatch + 1e-9);
}

#[test]
fn reactive_limit_switches_generator_bus() {
    let (buses, branches, mut gens) = ieee14_records();
    // condenser at bus 8 produces ~17.6 Mvar unconstrained
    gens[4] = gens[4].clone().with_q_limits(-6.0, 10.0);
    let network = NetworkModel::new(100.0, buses, branches, gens).unwrap();

    let free = solve(&network, &SolverConfig::newton()).unwrap();
    assert!(free.gens[4].q_mvar > 10.0);

    let config = SolverConfig::newton().with_reactive_limits(true);
    let limited = solve(&network, &config).unwrap();
    assert!(limited.is_converged());

    let b8 = &limited.buses[bus(&network, 8)];
    assert_eq!(b8.bus_type, BusType::PQ);
    assert!(b8.vm < 1.09);
    assert!((limited.gens[4].q_mvar - 10.0).abs() < 1e-4);
    assert!(mismatch_norm(&network, &limited) < 1e-6);

    // the model itself is untouched
    assert_eq!(network.buses()[bus(&network, 8)].bus_type, BusType::PV);
}

/// PV bus behind a series capacitor: holding Q at its limit pushes the
/// voltage above the setpoint, which releases the bus, which violates the
/// limit again.
fn flip_flop() -> NetworkModel {
    let mut b = NetworkBuilder::new(100.0);
    b.add_bus(Bus::new(BusId::new(1), BusType::Slack, 138.0))
        .add_bus(Bus::new(BusId::new(2), BusType::PV, 138.0).with_load(0.0, 50.0))
        .add_branch(Branch::new(BranchId::new(1), BusId::new(1), BusId::new(2), 0.0, -0.1))
        .add_gen(Gen::new(GenId::new(1), BusId::new(1)))
        .add_gen(Gen::new(GenId::new(2), BusId::new(2)).with_q_limits(0.0, 10.0));
    b.build().unwrap()
}

#[test]
fn reactive_limit_flip_flop_is_reported_as_oscillation() {
    let network = flip_flop();
    for base in [SolverConfig::newton(), SolverConfig::fast_decoupled()] {
        let config = base
            .with_reactive_limits(true)
            .with_max_bus_type_switches(1)
            .with_max_iterations(100);
        let solution = solve(&network, &config).unwrap();
        assert_eq!(
            solution.status,
            SolveStatus::Diverged(DivergenceReason::BusTypeOscillation),
            "{:?}",
            solution.solver
        );

        // reported classification matches the returned iterate: still pinned
        // at Qmax, voltage above the setpoint
        let b2 = &solution.buses[1];
        assert_eq!(b2.bus_type, BusType::PQ);
        assert!(b2.vm > 1.03 && b2.vm < 1.05, "vm {}", b2.vm);
        assert!((solution.gens[1].q_mvar - 10.0).abs() < 0.1);
        assert!(solution.max_mismatch < 1e-3);

        match solve(&network, &config.with_strict(true)) {
            Err(SolveError::Convergence { status, .. }) => assert_eq!(
                status,
                SolveStatus::Diverged(DivergenceReason::BusTypeOscillation)
            ),
            other => panic!("expected convergence error, got {other:?}"),
        }
    }
}

#[test]
fn dc_flows_balance_at_every_bus() {
    let network = ieee14();
    let solution = solve(&network, &SolverConfig::dc()).unwrap();
    assert!(solution.is_converged());
    assert_eq!(solution.iterations, 1);
    assert_eq!(solution.buses[bus(&network, 1)].va, 0.0);
    assert!(solution.total_losses_mw().abs() < 1e-9);

    for (i, result) in solution.buses.iter().enumerate() {
        let mut net_out = 0.0;
        for (k, flow) in solution.branches.iter().enumerate() {
            let (f, t) = network.branch_ends(k);
            if f == i {
                net_out += flow.p_from_mw;
            }
            if t == i {
                net_out += flow.p_to_mw;
            }
        }
        assert!(
            (net_out - result.p_injection_mw).abs() < 1e-6,
            "bus {}: flows {net_out} vs injection {}",
            result.id.value(),
            result.p_injection_mw
        );
    }
}

#[test]
fn isolated_bus_is_reported_as_singular() {
    let (buses, mut branches, gens) = ieee14_records();
    // branch 7-8 is the only connection of bus 8
    branches[13] = branches[13].clone().with_status(false);
    let network = NetworkModel::new(100.0, buses, branches, gens).unwrap();

    for config in [SolverConfig::dc(), SolverConfig::newton(), SolverConfig::fast_decoupled()] {
        match solve(&network, &config) {
            Err(SolveError::SingularMatrix { bus, .. }) => assert_eq!(bus, Some(BusId::new(8))),
            other => panic!("expected singular matrix, got {other:?}"),
        }
    }
}

#[test]
fn slack_placement_is_validated() {
    let (mut buses, branches, gens) = ieee14_records();
    buses[0].bus_type = BusType::PV;
    let err = NetworkModel::new(100.0, buses.clone(), branches.clone(), gens.clone()).unwrap_err();
    assert!(err.reason.contains("no slack"), "{err}");

    buses[0].bus_type = BusType::Slack;
    buses[1].bus_type = BusType::Slack;
    let err = NetworkModel::new(100.0, buses, branches, gens).unwrap_err();
    assert!(err.reason.contains("multiple slack"), "{err}");
}

#[test]
fn iteration_cap_returns_best_iterate() {
    let network = ieee14();
    let solution = solve(&network, &SolverConfig::newton().with_max_iterations(2)).unwrap();
    assert_eq!(
        solution.status,
        SolveStatus::Diverged(DivergenceReason::MaxIterations)
    );
    assert_eq!(solution.iterations, 2);
    assert!(solution.max_mismatch.is_finite());
    assert_eq!(solution.buses.len(), network.bus_count());
}

#[test]
fn expired_deadline_stops_iterating() {
    let network = ieee14();
    let config = SolverConfig::fast_decoupled().with_deadline(Duration::ZERO);
    let solution = solve(&network, &config).unwrap();
    assert_eq!(
        solution.status,
        SolveStatus::Diverged(DivergenceReason::Deadline)
    );

    match solve(&network, &config.with_strict(true)) {
        Err(SolveError::Convergence { status, .. }) => {
            assert_eq!(status, SolveStatus::Diverged(DivergenceReason::Deadline))
        }
        other => panic!("expected convergence error, got {other:?}"),
    }
}

#[test]
fn dc_solve_is_not_bounded_by_deadline() {
    let network = ieee14();
    let config = SolverConfig::dc().with_deadline(Duration::ZERO).with_strict(true);
    let solution = solve(&network, &config).unwrap();
    assert!(solution.is_converged());
    assert_eq!(solution.iterations, 1);
}

#[test]
fn batch_results_follow_input_order() {
    let base = ieee14();
    let (mut buses, branches, gens) = ieee14_records();
    buses[13] = buses[13].clone().with_load(29.8, 10.0);
    let heavier = NetworkModel::new(100.0, buses, branches, gens).unwrap();

    let networks = vec![base.clone(), heavier, base];
    let results = solve_batch(&networks, &SolverConfig::newton());
    let vm14: Vec<f64> = results
        .into_iter()
        .map(|r| r.unwrap().buses[13].vm)
        .collect();

    assert_eq!(vm14[0], vm14[2]);
    assert!(vm14[1] < vm14[0]);
}
