//! DC Power Flow
//!
//! Linearizes the AC equations: voltage magnitudes fixed at 1 pu, series
//! resistance neglected, `sin(θf − θt) ≈ θf − θt`. Each in-service branch
//! contributes a susceptance `b = 1/(x·τ)` and a phase-shifter injection:
//!
//! ```text
//!   Pf      = b·(θf − θt − φ)
//!   Bbus·θ  = P − Pbusinj − Gs
//! ```
//!
//! The system is solved once with every slack row and column removed
//! (slack angles held at zero). The active-power result is exact for the
//! linear model; reactive power and losses are not represented.

use gridflow_core::{BusType, LuFactor, NetworkModel};
use sprs::{CsMat, TriMat};
use tracing::{debug, info};

use super::{check_energized, empty_dispatch, mismatch, split_generation, Deadline};
use crate::error::{SolveError, SolveResult};
use crate::solution::{BranchFlow, BusResult, Solution, SolveStatus, SolverKind};

/// Linear network data shared by the DC power flow and the DC OPF.
#[derive(Debug, Clone)]
pub struct DcNetwork {
    /// Bus susceptance matrix (pu)
    pub bbus: CsMat<f64>,
    /// Series susceptance per branch, zero when out of service
    pub b_branch: Vec<f64>,
    /// Phase-shifter flow `−b·φ` per branch
    pub pf_inj: Vec<f64>,
    /// Phase-shifter injection per bus
    pub pbus_inj: Vec<f64>,
}

impl DcNetwork {
    pub fn build(network: &NetworkModel) -> Self {
        let nb = network.bus_count();
        let mut bbus = TriMat::new((nb, nb));
        for i in 0..nb {
            bbus.add_triplet(i, i, 0.0);
        }
        let mut b_branch = vec![0.0; network.branch_count()];
        let mut pf_inj = vec![0.0; network.branch_count()];
        let mut pbus_inj = vec![0.0; nb];

        for (k, branch) in network.branches().iter().enumerate() {
            if !branch.status {
                continue;
            }
            let x = if branch.reactance != 0.0 {
                branch.reactance
            } else {
                branch.resistance
            };
            let b = 1.0 / (x * branch.effective_tap());
            let (f, t) = network.branch_ends(k);
            bbus.add_triplet(f, f, b);
            bbus.add_triplet(t, t, b);
            bbus.add_triplet(f, t, -b);
            bbus.add_triplet(t, f, -b);

            b_branch[k] = b;
            pf_inj[k] = -b * branch.phase_shift.value();
            pbus_inj[f] += pf_inj[k];
            pbus_inj[t] -= pf_inj[k];
        }

        Self {
            bbus: bbus.to_csr(),
            b_branch,
            pf_inj,
            pbus_inj,
        }
    }

    /// `Bbus·θ + Pbusinj`: active power leaving each bus into the branches.
    pub fn bus_injections(&self, theta: &[f64]) -> Vec<f64> {
        self.bbus
            .outer_iterator()
            .zip(&self.pbus_inj)
            .map(|(row, inj)| row.iter().map(|(j, &b)| b * theta[j]).sum::<f64>() + inj)
            .collect()
    }

    /// From-end branch flow `b·(θf − θt) + Pfinj`.
    pub fn branch_flow(&self, network: &NetworkModel, k: usize, theta: &[f64]) -> f64 {
        let (f, t) = network.branch_ends(k);
        self.b_branch[k] * (theta[f] - theta[t]) + self.pf_inj[k]
    }
}

/// Linear DC power flow. A single factorization, so a wall-clock deadline
/// has nothing to cut short and is not consulted.
#[derive(Debug, Clone, Default)]
pub struct DcPowerFlowSolver;

impl DcPowerFlowSolver {
    pub fn new() -> Self {
        Self
    }

    pub fn solve(&self, network: &NetworkModel) -> SolveResult<Solution> {
        let clock = Deadline::start(None);
        check_energized(network, "DC susceptance matrix")?;

        let nb = network.bus_count();
        let base = network.base_mva();
        let dc = DcNetwork::build(network);

        let non_slack: Vec<usize> = (0..nb)
            .filter(|&i| network.buses()[i].bus_type != BusType::Slack)
            .collect();
        let p_spec: Vec<f64> = network
            .scheduled_injection_pu()
            .iter()
            .map(|s| s.re)
            .collect();
        let rhs: Vec<f64> = non_slack
            .iter()
            .map(|&i| p_spec[i] - dc.pbus_inj[i] - network.shunt_pu(i).re)
            .collect();

        let reduced = mismatch::submatrix(&dc.bbus, &non_slack);
        let lu = LuFactor::from_triplets(&reduced)
            .map_err(|_| SolveError::singular("DC susceptance matrix"))?;
        let theta_red = lu
            .solve(&rhs)
            .map_err(|_| SolveError::singular("DC susceptance matrix"))?;

        let mut theta = vec![0.0; nb];
        for (&i, &t) in non_slack.iter().zip(&theta_red) {
            theta[i] = t;
        }

        // P_i = (Bθ)_i + Pbusinj_i + Gs_i
        let p_bus: Vec<f64> = dc
            .bus_injections(&theta)
            .iter()
            .enumerate()
            .map(|(i, p)| p + network.shunt_pu(i).re)
            .collect();
        let residual = mismatch::inf_norm(
            &non_slack
                .iter()
                .map(|&i| p_bus[i] - p_spec[i])
                .collect::<Vec<_>>(),
        );
        debug!(buses = nb, residual, "DC power flow solved");

        let buses = network
            .buses()
            .iter()
            .enumerate()
            .map(|(i, bus)| BusResult {
                id: bus.id,
                bus_type: network.effective_bus_type(i),
                vm: 1.0,
                va: theta[i],
                p_injection_mw: p_bus[i] * base,
                q_injection_mvar: 0.0,
                lmp: None,
                q_price: None,
                mu_v_min: None,
                mu_v_max: None,
            })
            .collect();

        let branches = network
            .branches()
            .iter()
            .enumerate()
            .map(|(k, branch)| {
                let pf = if branch.status {
                    dc.branch_flow(network, k, &theta) * base
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
                    mu_s_from: None,
                    mu_s_to: None,
                }
            })
            .collect();

        let mut gens = empty_dispatch(network);
        for i in 0..nb {
            split_generation(network, i, p_bus[i] + network.load_pu(i).re, None, &mut gens);
        }

        info!(solver = "dc", buses = nb, residual, "power flow complete");
        Ok(Solution {
            solver: SolverKind::Dc,
            status: SolveStatus::Converged,
            iterations: 1,
            max_mismatch: residual,
            buses,
            branches,
            gens,
            objective: None,
            solve_time_ms: clock.elapsed_ms(),
        })
    }
}
