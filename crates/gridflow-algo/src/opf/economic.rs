//! Merit-order economic dispatch
//!
//! Meets total demand at minimum cost with no network model: no flows,
//! losses, voltages or reactive power. Solved by lambda iteration: bisect
//! on the system marginal cost λ for the cheapest price at which the units
//! can cover the demand. Units on a flat cost segment at that price are
//! then loaded in merit order until the demand is met.

use gridflow_core::{Entity, GenId, NetworkModel};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ConstraintKind, ConstraintViolation};
use crate::error::{SolveError, SolveResult};

const LAMBDA_BISECTIONS: usize = 100;
const OUTPUT_BISECTIONS: usize = 60;

/// Result of [`economic_dispatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomicDispatch {
    /// Output per in-service generator (MW)
    pub dispatch: Vec<(GenId, f64)>,
    /// System marginal cost ($/MWh)
    pub lambda: f64,
    /// Total cost ($/hr)
    pub total_cost: f64,
}

impl EconomicDispatch {
    pub fn output(&self, id: GenId) -> Option<f64> {
        self.dispatch.iter().find(|(g, _)| *g == id).map(|(_, p)| *p)
    }
}

struct Unit<'a> {
    id: GenId,
    cost: &'a gridflow_core::CostModel,
    pmin: f64,
    pmax: f64,
}

impl Unit<'_> {
    fn mc(&self, p: f64) -> f64 {
        self.cost.marginal_cost(p)
    }

    /// Largest output whose marginal cost does not exceed λ.
    fn upper(&self, lambda: f64) -> f64 {
        if self.mc(self.pmax) <= lambda {
            return self.pmax;
        }
        if self.mc(self.pmin) > lambda {
            return self.pmin;
        }
        let (mut lo, mut hi) = (self.pmin, self.pmax);
        for _ in 0..OUTPUT_BISECTIONS {
            let mid = 0.5 * (lo + hi);
            if self.mc(mid) <= lambda {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

/// Network-free minimum-cost dispatch of the in-service generators.
///
/// Demand is the total bus load plus shunt conductance consumption at 1 pu,
/// which is what the DC-OPF balances. Units without a finite Pmax are capped
/// at the demand.
pub fn economic_dispatch(network: &NetworkModel) -> SolveResult<EconomicDispatch> {
    let demand = network.total_demand_mw();

    let units: Vec<Unit<'_>> = network
        .gens()
        .iter()
        .filter(|g| g.status)
        .map(|g| {
            let pmin = g.pmin.value();
            let pmax = if g.pmax.value().is_finite() {
                g.pmax.value()
            } else {
                pmin.max(0.0) + demand.max(0.0)
            };
            Unit {
                id: g.id,
                cost: &g.cost_model,
                pmin,
                pmax,
            }
        })
        .collect();

    let capacity: f64 = units.iter().map(|u| u.pmax).sum();
    let floor: f64 = units.iter().map(|u| u.pmin).sum();
    if capacity < demand {
        return Err(SolveError::Infeasible {
            reason: format!("capacity {capacity:.1} MW below demand {demand:.1} MW"),
            violations: vec![ConstraintViolation {
                kind: ConstraintKind::GenerationCapacity,
                entity: Entity::Network,
                value: capacity,
                limit: demand,
            }],
        });
    }
    if floor > demand {
        return Err(SolveError::Infeasible {
            reason: format!("minimum generation {floor:.1} MW exceeds demand {demand:.1} MW"),
            violations: vec![ConstraintViolation {
                kind: ConstraintKind::GenPMin,
                entity: Entity::Network,
                value: floor,
                limit: demand,
            }],
        });
    }

    // Smallest λ at which the units can cover the demand
    let mut lo = units
        .iter()
        .map(|u| u.mc(u.pmin))
        .fold(f64::INFINITY, f64::min)
        - 1.0;
    let mut hi = units
        .iter()
        .map(|u| u.mc(u.pmax))
        .fold(f64::NEG_INFINITY, f64::max)
        + 1.0;
    for _ in 0..LAMBDA_BISECTIONS {
        let mid = 0.5 * (lo + hi);
        let supply: f64 = units.iter().map(|u| u.upper(mid)).sum();
        if supply >= demand {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    let lambda = hi;

    // Outputs just below the clearing price, then the flat segments at it
    let mut output: Vec<f64> = units.iter().map(|u| u.upper(lo)).collect();
    let mut remaining = demand - output.iter().sum::<f64>();

    let mut merit: Vec<usize> = (0..units.len()).collect();
    merit.sort_by(|&a, &b| {
        units[a]
            .mc(output[a])
            .partial_cmp(&units[b].mc(output[b]))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for &u in &merit {
        if remaining <= 0.0 {
            break;
        }
        let headroom = (units[u].upper(hi) - output[u]).max(0.0);
        let increment = remaining.min(headroom);
        output[u] += increment;
        remaining -= increment;
    }

    let total_cost = units
        .iter()
        .zip(&output)
        .map(|(u, &p)| u.cost.evaluate(p))
        .sum();
    debug!(demand, lambda, total_cost, unserved = remaining.max(0.0), "economic dispatch");

    Ok(EconomicDispatch {
        dispatch: units.iter().map(|u| u.id).zip(output).collect(),
        lambda,
        total_cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::{Bus, BusId, BusType, CostModel, Gen, NetworkBuilder};

    fn single_bus(load: f64, gens: Vec<Gen>) -> NetworkModel {
        let mut b = NetworkBuilder::new(100.0);
        b.add_bus(Bus::new(BusId::new(1), BusType::Slack, 138.0).with_load(load, 0.0));
        for g in gens {
            b.add_gen(g);
        }
        b.build().unwrap()
    }

    #[test]
    fn quadratic_units_share_marginal_cost() {
        let net = single_bus(
            300.0,
            vec![
                Gen::new(GenId::new(1), BusId::new(1))
                    .with_p_limits(0.0, 400.0)
                    .with_cost(CostModel::quadratic(0.0, 10.0, 0.05)),
                Gen::new(GenId::new(2), BusId::new(1))
                    .with_p_limits(0.0, 400.0)
                    .with_cost(CostModel::quadratic(0.0, 20.0, 0.05)),
            ],
        );
        let ed = economic_dispatch(&net).unwrap();
        // 10 + 0.1·P1 = 20 + 0.1·P2, P1 + P2 = 300
        assert!((ed.output(GenId::new(1)).unwrap() - 200.0).abs() < 1e-6);
        assert!((ed.output(GenId::new(2)).unwrap() - 100.0).abs() < 1e-6);
        assert!((ed.lambda - 30.0).abs() < 1e-6);
    }

    #[test]
    fn linear_units_fill_in_merit_order() {
        let net = single_bus(
            150.0,
            vec![
                Gen::new(GenId::new(1), BusId::new(1))
                    .with_p_limits(10.0, 200.0)
                    .with_cost(CostModel::linear(0.0, 40.0)),
                Gen::new(GenId::new(2), BusId::new(1))
                    .with_p_limits(0.0, 100.0)
                    .with_cost(CostModel::linear(0.0, 15.0)),
            ],
        );
        let ed = economic_dispatch(&net).unwrap();
        assert!((ed.output(GenId::new(2)).unwrap() - 100.0).abs() < 1e-9);
        assert!((ed.output(GenId::new(1)).unwrap() - 50.0).abs() < 1e-9);
        assert!((ed.lambda - 40.0).abs() < 1e-6);
        assert!((ed.total_cost - (2000.0 + 1500.0)).abs() < 1e-6);
    }

    #[test]
    fn minimum_generation_above_demand_is_infeasible() {
        let net = single_bus(
            5.0,
            vec![Gen::new(GenId::new(1), BusId::new(1))
                .with_p_limits(10.0, 200.0)
                .with_cost(CostModel::linear(0.0, 40.0))],
        );
        assert!(matches!(
            economic_dispatch(&net),
            Err(SolveError::Infeasible { .. })
        ));
    }
}
