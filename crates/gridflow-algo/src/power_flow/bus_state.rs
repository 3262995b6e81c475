//! Transient bus classification for the AC solvers.
//!
//! The network model fixes each bus's declared type. During a solve with
//! reactive limits enforced, PV buses whose generators run out of reactive
//! capability are reclassified as PQ with their injection pinned at the
//! violated limit. That classification lives here, one entry per bus, and is
//! discarded when the solve returns.

use gridflow_core::{BusType, NetworkModel};
use num_complex::Complex64;
use tracing::warn;

/// Reactive generation outside `[Qmin, Qmax]` by more than this (pu) counts as a violation.
const Q_VIOLATION_TOL: f64 = 1e-6;

/// A pinned bus must cross its setpoint by this much (pu) to return to PV.
const V_RELEASE_TOL: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QLimit {
    Min,
    Max,
}

/// Non-slack bus index sets in the order the Jacobian uses them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusIndex {
    pub pv: Vec<usize>,
    pub pq: Vec<usize>,
    /// Every non-slack bus, ascending.
    pub pvpq: Vec<usize>,
}

/// Result of one reactive-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitCheck {
    Unchanged,
    Switched,
    /// Some bus exceeded its switch budget.
    Oscillating,
}

#[derive(Debug, Clone)]
pub struct BusStates {
    kinds: Vec<BusType>,
    pinned: Vec<Option<QLimit>>,
    switches: Vec<usize>,
    q_limits: Vec<(f64, f64)>,
    q_load: Vec<f64>,
    vset: Vec<f64>,
}

impl BusStates {
    pub fn new(network: &NetworkModel) -> Self {
        let n = network.bus_count();
        Self {
            kinds: (0..n).map(|i| network.effective_bus_type(i)).collect(),
            pinned: vec![None; n],
            switches: vec![0; n],
            q_limits: (0..n).map(|i| network.q_limits_pu(i)).collect(),
            q_load: (0..n).map(|i| network.load_pu(i).im).collect(),
            vset: (0..n).map(|i| network.voltage_setpoint(i)).collect(),
        }
    }

    pub fn kind(&self, i: usize) -> BusType {
        self.kinds[i]
    }

    pub fn kinds(&self) -> &[BusType] {
        &self.kinds
    }

    /// True when bus `i` started as PV and is currently held at a Q limit.
    pub fn is_pinned(&self, i: usize) -> bool {
        self.pinned[i].is_some()
    }

    pub fn voltage_setpoint(&self, i: usize) -> f64 {
        self.vset[i]
    }

    pub fn index(&self) -> BusIndex {
        let mut index = BusIndex::default();
        for (i, kind) in self.kinds.iter().enumerate() {
            match kind {
                BusType::Slack => continue,
                BusType::PV => index.pv.push(i),
                BusType::PQ => index.pq.push(i),
            }
            index.pvpq.push(i);
        }
        index
    }

    /// Overwrite the reactive target of pinned buses with `Qlim - Qload`.
    pub fn apply_pins(&self, s_spec: &mut [Complex64]) {
        for (i, pin) in self.pinned.iter().enumerate() {
            let (qmin, qmax) = self.q_limits[i];
            match pin {
                Some(QLimit::Min) => s_spec[i].im = qmin - self.q_load[i],
                Some(QLimit::Max) => s_spec[i].im = qmax - self.q_load[i],
                None => {}
            }
        }
    }

    /// Check generator reactive output against its limits and reclassify.
    ///
    /// `s_calc` is the net injection at the current iterate. Released buses
    /// have their magnitude reset to the setpoint in `vm`.
    ///
    /// On [`LimitCheck::Oscillating`] the classification and `vm` are left as
    /// they were before the check, so the reported bus types match the
    /// iterate the solver returns. The switch counters keep the attempt.
    pub fn enforce_limits(
        &mut self,
        s_calc: &[Complex64],
        vm: &mut [f64],
        max_switches: usize,
    ) -> LimitCheck {
        let kinds_before = self.kinds.clone();
        let pinned_before = self.pinned.clone();
        let vm_before = vm.to_vec();
        let mut released = vec![false; self.kinds.len()];

        for i in 0..self.kinds.len() {
            let Some(limit) = self.pinned[i] else { continue };
            let release = match limit {
                QLimit::Max => vm[i] > self.vset[i] + V_RELEASE_TOL,
                QLimit::Min => vm[i] < self.vset[i] - V_RELEASE_TOL,
            };
            if release {
                self.pinned[i] = None;
                self.kinds[i] = BusType::PV;
                self.switches[i] += 1;
                vm[i] = self.vset[i];
                released[i] = true;
                warn!(bus = i, vm = vm[i], "bus returns to voltage control");
            }
        }

        let mut changed = released.iter().any(|&r| r);
        for i in 0..self.kinds.len() {
            // a just-released bus has no valid Q at this iterate
            if self.kinds[i] != BusType::PV || released[i] {
                continue;
            }
            let qg = s_calc[i].im + self.q_load[i];
            let (qmin, qmax) = self.q_limits[i];
            let limit = if qg > qmax + Q_VIOLATION_TOL {
                QLimit::Max
            } else if qg < qmin - Q_VIOLATION_TOL {
                QLimit::Min
            } else {
                continue;
            };
            self.pinned[i] = Some(limit);
            self.kinds[i] = BusType::PQ;
            self.switches[i] += 1;
            changed = true;
            warn!(bus = i, q_gen = qg, qmin, qmax, "reactive limit reached, bus switched to PQ");
        }

        if let Some(i) = self.switches.iter().position(|&s| s > max_switches) {
            warn!(bus = i, switches = self.switches[i], "bus type oscillation");
            self.kinds = kinds_before;
            self.pinned = pinned_before;
            vm.copy_from_slice(&vm_before);
            return LimitCheck::Oscillating;
        }
        if changed {
            LimitCheck::Switched
        } else {
            LimitCheck::Unchanged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::{Branch, BranchId, Bus, BusId, Gen, GenId, NetworkBuilder};

    fn pv_pair() -> NetworkModel {
        let mut b = NetworkBuilder::new(100.0);
        b.add_bus(Bus::new(BusId::new(1), BusType::Slack, 138.0))
            .add_bus(Bus::new(BusId::new(2), BusType::PV, 138.0).with_load(0.0, 5.0))
            .add_branch(Branch::new(BranchId::new(1), BusId::new(1), BusId::new(2), 0.0, 0.1))
            .add_gen(Gen::new(GenId::new(1), BusId::new(1)))
            .add_gen(Gen::new(GenId::new(2), BusId::new(2)).with_q_limits(0.0, 10.0));
        b.build().unwrap()
    }

    fn injection(q: f64) -> Vec<Complex64> {
        vec![Complex64::new(0.0, 0.0), Complex64::new(0.0, q)]
    }

    #[test]
    fn index_splits_by_type() {
        let states = BusStates::new(&pv_pair());
        let index = states.index();
        assert_eq!(index.pv, vec![1]);
        assert!(index.pq.is_empty());
        assert_eq!(index.pvpq, vec![1]);
    }

    #[test]
    fn violation_pins_reactive_target() {
        let mut states = BusStates::new(&pv_pair());
        let mut vm = vec![1.0, 1.0];
        // generator would need 0.2 + 0.05 pu
        assert_eq!(states.enforce_limits(&injection(0.2), &mut vm, 4), LimitCheck::Switched);
        assert_eq!(states.kind(1), BusType::PQ);
        assert!(states.is_pinned(1));

        let mut s_spec = injection(0.0);
        states.apply_pins(&mut s_spec);
        assert!((s_spec[1].im - 0.05).abs() < 1e-12);

        // within limits now: nothing changes
        assert_eq!(states.enforce_limits(&injection(0.05), &mut vm, 4), LimitCheck::Unchanged);
    }

    #[test]
    fn pinned_bus_released_when_voltage_recovers() {
        let mut states = BusStates::new(&pv_pair());
        let mut vm = vec![1.0, 1.0];
        states.enforce_limits(&injection(0.2), &mut vm, 4);

        vm[1] = 1.01;
        assert_eq!(states.enforce_limits(&injection(0.05), &mut vm, 4), LimitCheck::Switched);
        assert_eq!(states.kind(1), BusType::PV);
        assert_eq!(vm[1], states.voltage_setpoint(1));
    }

    #[test]
    fn switch_budget_detects_oscillation() {
        let mut states = BusStates::new(&pv_pair());
        let mut vm = vec![1.0, 1.0];
        assert_eq!(states.enforce_limits(&injection(0.2), &mut vm, 1), LimitCheck::Switched);
        vm[1] = 1.01;
        assert_eq!(
            states.enforce_limits(&injection(0.05), &mut vm, 1),
            LimitCheck::Oscillating
        );
        // the over-budget release is not applied
        assert_eq!(states.kind(1), BusType::PQ);
        assert!(states.is_pinned(1));
        assert_eq!(vm[1], 1.01);
    }
}
