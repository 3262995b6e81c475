//! Power Flow Solvers
//!
//! This module provides the three power-flow formulations:
//!
//! - [`dc`]: linearized active-power flow, one sparse solve
//! - [`newton`]: full AC power flow using Newton-Raphson with Q-limit enforcement
//! - [`fast_decoupled`]: AC power flow with constant B' / B'' approximations
//!
//! ## Q-Limit Enforcement
//!
//! Both AC solvers support generator reactive power limit enforcement
//! (PV-PQ bus switching). When enabled, generators that exceed their Q limits
//! have their buses converted from PV (voltage-controlled) to PQ mode, allowing
//! the voltage to vary while fixing Q at the limit. The switching state lives
//! in [`bus_state::BusStates`], never in the network model.

use gridflow_core::{BusType, NetworkModel};
use num_complex::Complex64;
use std::time::Duration;
use web_time::Instant;

use crate::error::{SolveError, SolveResult};
use crate::solution::{BranchFlow, BusResult, GenDispatch, Solution, SolveStatus, SolverKind};

pub mod bus_state;
pub mod dc;
pub mod fast_decoupled;
pub mod mismatch;
pub mod newton;

pub use dc::DcPowerFlowSolver;
pub use fast_decoupled::FastDecoupledPowerFlowSolver;
pub use newton::NewtonPowerFlowSolver;

use bus_state::BusStates;

/// Wall-clock budget for one solve.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub(crate) fn start(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub(crate) fn expired(&self) -> bool {
        self.limit
            .is_some_and(|limit| self.started.elapsed() >= limit)
    }

    pub(crate) fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

/// Fail with a singular-matrix error naming the first bus that has no
/// in-service path to a slack bus.
pub(crate) fn check_energized(network: &NetworkModel, context: &str) -> SolveResult<()> {
    let energized = network.energized();
    match energized.iter().position(|&e| !e) {
        Some(i) => Err(SolveError::SingularMatrix {
            context: context.to_string(),
            bus: Some(network.buses()[i].id),
        }),
        None => Ok(()),
    }
}

/// Starting point: regulated magnitudes at their setpoints, everything else
/// from the bus records, slack angles at the reference.
pub(crate) fn initial_voltages(network: &NetworkModel) -> (Vec<f64>, Vec<f64>) {
    let n = network.bus_count();
    let mut vm = Vec::with_capacity(n);
    let mut va = Vec::with_capacity(n);
    for i in 0..n {
        vm.push(network.voltage_setpoint(i));
        va.push(match network.effective_bus_type(i) {
            BusType::Slack => 0.0,
            _ => network.buses()[i].angle.value(),
        });
    }
    (vm, va)
}

/// Split a bus's total generation among its in-service units (pu in, MW/Mvar out).
///
/// The slack unit listed first absorbs the active imbalance. Reactive output
/// at regulated buses is shared in proportion to each unit's Q range, or
/// equally when the ranges are unbounded. Units at unregulated buses keep
/// their scheduled Q. `q_total` of `None` zeroes reactive output.
pub(crate) fn split_generation(
    network: &NetworkModel,
    bus: usize,
    p_total: f64,
    q_total: Option<f64>,
    gens: &mut [GenDispatch],
) {
    let base = network.base_mva();
    let units: Vec<usize> = network.in_service_gens_at(bus).collect();
    let Some(&first) = units.first() else { return };
    let records = network.gens();

    for &g in &units {
        gens[g].p_mw = records[g].active_power.value();
    }
    if network.effective_bus_type(bus) == BusType::Slack {
        let others: f64 = units[1..]
            .iter()
            .map(|&g| records[g].active_power.value())
            .sum();
        gens[first].p_mw = p_total * base - others;
    }

    let Some(q_total) = q_total else {
        for &g in &units {
            gens[g].q_mvar = 0.0;
        }
        return;
    };
    if network.effective_bus_type(bus) == BusType::PQ {
        for &g in &units {
            gens[g].q_mvar = records[g].reactive_power.value();
        }
        return;
    }

    let q_mvar = q_total * base;
    let ranges: Vec<(f64, f64)> = units
        .iter()
        .map(|&g| (records[g].qmin.value(), records[g].qmax.value()))
        .collect();
    let qmin_total: f64 = ranges.iter().map(|r| r.0).sum();
    let range_total: f64 = ranges.iter().map(|r| r.1 - r.0).sum();
    let proportional = range_total.is_finite() && range_total > 1e-9;
    for (&g, &(qmin, qmax)) in units.iter().zip(&ranges) {
        gens[g].q_mvar = if proportional {
            qmin + (q_mvar - qmin_total) * (qmax - qmin) / range_total
        } else {
            q_mvar / units.len() as f64
        };
    }
}

pub(crate) fn empty_dispatch(network: &NetworkModel) -> Vec<GenDispatch> {
    network
        .gens()
        .iter()
        .map(|g| GenDispatch {
            id: g.id,
            bus: g.bus,
            in_service: g.status,
            p_mw: 0.0,
            q_mvar: 0.0,
        })
        .collect()
}

/// Everything an AC solver hands back at termination.
pub(crate) struct AcTermination<'a> {
    pub solver: SolverKind,
    pub status: SolveStatus,
    pub iterations: usize,
    pub max_mismatch: f64,
    pub vm: &'a [f64],
    pub va: &'a [f64],
    pub states: &'a BusStates,
    pub deadline: &'a Deadline,
}

/// Build the [`Solution`] of an AC power flow from the final iterate.
pub(crate) fn ac_solution(network: &NetworkModel, end: AcTermination<'_>) -> Solution {
    let base = network.base_mva();
    let y = network.admittance();
    let v = mismatch::voltages(end.vm, end.va);
    let s = y.injections(&v);

    let buses = network
        .buses()
        .iter()
        .enumerate()
        .map(|(i, bus)| BusResult {
            id: bus.id,
            bus_type: end.states.kind(i),
            vm: end.vm[i],
            va: end.va[i],
            p_injection_mw: s[i].re * base,
            q_injection_mvar: s[i].im * base,
            lmp: None,
            q_price: None,
            mu_v_min: None,
            mu_v_max: None,
        })
        .collect();

    let mut gens = empty_dispatch(network);
    for i in 0..network.bus_count() {
        let sg = s[i] + network.load_pu(i);
        split_generation(network, i, sg.re, Some(sg.im), &mut gens);
    }

    Solution {
        solver: end.solver,
        status: end.status,
        iterations: end.iterations,
        max_mismatch: end.max_mismatch,
        buses,
        branches: ac_branch_flows(network, &v, base),
        gens,
        objective: None,
        solve_time_ms: end.deadline.elapsed_ms(),
    }
}

pub(crate) fn ac_branch_flows(network: &NetworkModel, v: &[Complex64], base: f64) -> Vec<BranchFlow> {
    network
        .admittance()
        .branch_flows(v)
        .into_iter()
        .zip(network.branches())
        .map(|((sf, st), branch)| BranchFlow {
            id: branch.id,
            in_service: branch.status,
            p_from_mw: sf.re * base,
            q_from_mvar: sf.im * base,
            p_to_mw: st.re * base,
            q_to_mvar: st.im * base,
            mu_s_from: None,
            mu_s_to: None,
        })
        .collect()
}

/// Power-balance mismatch of a solution against the network (pu, infinity norm).
///
/// The scheduled injection is rebuilt from the solution's own generator
/// dispatch; active power is checked at every non-slack bus and reactive power
/// at the buses the solution reports as PQ. For an AC solution this
/// reproduces the solver's final mismatch. DC solutions ignore losses and
/// reactive power and will not balance under this check.
pub fn mismatch_norm(network: &NetworkModel, solution: &Solution) -> f64 {
    let base = network.base_mva();
    let v = solution.voltages();
    if v.len() != network.bus_count() || solution.gens.len() != network.gen_count() {
        return f64::NAN;
    }
    let mut s_spec: Vec<Complex64> = (0..network.bus_count()).map(|i| -network.load_pu(i)).collect();
    for (g, dispatch) in solution.gens.iter().enumerate() {
        if dispatch.in_service {
            s_spec[network.gen_bus(g)] += Complex64::new(dispatch.p_mw, dispatch.q_mvar) / base;
        }
    }
    let ds = mismatch::power_mismatch(network.admittance(), &v, &s_spec);
    let residuals: Vec<f64> = solution
        .buses
        .iter()
        .enumerate()
        .flat_map(|(i, bus)| {
            let p = (bus.bus_type != BusType::Slack).then_some(ds[i].re);
            let q = (bus.bus_type == BusType::PQ).then_some(ds[i].im);
            p.into_iter().chain(q)
        })
        .collect();
    mismatch::inf_norm(&residuals)
}
