//! Shared network fixtures for the integration tests.

#![allow(dead_code)]

use gridflow_core::{Branch, BranchId, Bus, BusId, BusType, CostModel, Gen, GenId, NetworkModel};

/// IEEE 14-bus test system (MATPOWER `case14`), 100 MVA base.
///
/// Branch ratings are zero so neither OPF formulation sees flow limits.
pub fn ieee14() -> NetworkModel {
    let (buses, branches, gens) = ieee14_records();
    NetworkModel::new(100.0, buses, branches, gens).expect("case14 is valid")
}

/// Raw case14 records, for tests that edit the case before validating it.
pub fn ieee14_records() -> (Vec<Bus>, Vec<Branch>, Vec<Gen>) {
    // id, type, Pd, Qd, Bs
    let buses: [(usize, BusType, f64, f64, f64); 14] = [
        (1, BusType::Slack, 0.0, 0.0, 0.0),
        (2, BusType::PV, 21.7, 12.7, 0.0),
        (3, BusType::PV, 94.2, 19.0, 0.0),
        (4, BusType::PQ, 47.8, -3.9, 0.0),
        (5, BusType::PQ, 7.6, 1.6, 0.0),
        (6, BusType::PV, 11.2, 7.5, 0.0),
        (7, BusType::PQ, 0.0, 0.0, 0.0),
        (8, BusType::PV, 0.0, 0.0, 0.0),
        (9, BusType::PQ, 29.5, 16.6, 19.0),
        (10, BusType::PQ, 9.0, 5.8, 0.0),
        (11, BusType::PQ, 3.5, 1.8, 0.0),
        (12, BusType::PQ, 6.1, 1.6, 0.0),
        (13, BusType::PQ, 13.5, 5.8, 0.0),
        (14, BusType::PQ, 14.9, 5.0, 0.0),
    ];
    // from, to, r, x, b, tap
    let branches: [(usize, usize, f64, f64, f64, f64); 20] = [
        (1, 2, 0.01938, 0.05917, 0.0528, 0.0),
        (1, 5, 0.05403, 0.22304, 0.0492, 0.0),
        (2, 3, 0.04699, 0.19797, 0.0438, 0.0),
        (2, 4, 0.05811, 0.17632, 0.034, 0.0),
        (2, 5, 0.05695, 0.17388, 0.0346, 0.0),
        (3, 4, 0.06701, 0.17103, 0.0128, 0.0),
        (4, 5, 0.01335, 0.04211, 0.0, 0.0),
        (4, 7, 0.0, 0.20912, 0.0, 0.978),
        (4, 9, 0.0, 0.55618, 0.0, 0.969),
        (5, 6, 0.0, 0.25202, 0.0, 0.932),
        (6, 11, 0.09498, 0.1989, 0.0, 0.0),
        (6, 12, 0.12291, 0.25581, 0.0, 0.0),
        (6, 13, 0.06615, 0.13027, 0.0, 0.0),
        (7, 8, 0.0, 0.17615, 0.0, 0.0),
        (7, 9, 0.0, 0.11001, 0.0, 0.0),
        (9, 10, 0.03181, 0.0845, 0.0, 0.0),
        (9, 14, 0.12711, 0.27038, 0.0, 0.0),
        (10, 11, 0.08205, 0.19207, 0.0, 0.0),
        (12, 13, 0.22092, 0.19988, 0.0, 0.0),
        (13, 14, 0.17093, 0.34802, 0.0, 0.0),
    ];
    // bus, Pg, Qmax, Qmin, Vg, Pmax, c2, c1
    let gens: [(usize, f64, f64, f64, f64, f64, f64, f64); 5] = [
        (1, 232.4, 10.0, 0.0, 1.06, 332.4, 0.0430292599, 20.0),
        (2, 40.0, 50.0, -40.0, 1.045, 140.0, 0.25, 20.0),
        (3, 0.0, 40.0, 0.0, 1.01, 100.0, 0.01, 40.0),
        (6, 0.0, 24.0, -6.0, 1.07, 100.0, 0.01, 40.0),
        (8, 0.0, 24.0, -6.0, 1.09, 100.0, 0.01, 40.0),
    ];

    let buses = buses
        .into_iter()
        .map(|(id, bus_type, pd, qd, bs)| {
            // 138 kV transmission above the step-down transformers
            let kv = if id <= 5 { 138.0 } else { 13.8 };
            Bus::new(BusId::new(id), bus_type, kv)
                .with_load(pd, qd)
                .with_shunt(0.0, bs)
                .with_voltage_limits(0.94, 1.06)
        })
        .collect();
    let branches = branches
        .into_iter()
        .enumerate()
        .map(|(k, (from, to, r, x, b, tap))| {
            Branch::new(BranchId::new(k + 1), BusId::new(from), BusId::new(to), r, x)
                .with_charging(b)
                .with_tap(tap)
        })
        .collect();
    let gens = gens
        .into_iter()
        .enumerate()
        .map(|(g, (bus, pg, qmax, qmin, vg, pmax, c2, c1))| {
            Gen::new(GenId::new(g + 1), BusId::new(bus))
                .with_output(pg, 0.0)
                .with_p_limits(0.0, pmax)
                .with_q_limits(qmin, qmax)
                .with_voltage_setpoint(vg)
                .with_cost(CostModel::quadratic(0.0, c1, c2))
        })
        .collect();
    (buses, branches, gens)
}

/// Index of a bus in network order.
pub fn bus(network: &NetworkModel, id: usize) -> usize {
    network.bus_index(BusId::new(id)).expect("bus exists")
}
