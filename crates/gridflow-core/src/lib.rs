//! Core data model for the gridflow power-flow engine.
//!
//! A network is described by three ordered collections: [`Bus`], [`Branch`]
//! and [`Gen`]. They are assembled with a [`NetworkBuilder`] which validates
//! referential integrity and slack placement and produces an immutable
//! [`NetworkModel`]. Everything the solvers derive from the model (admittance
//! matrices, island labels, per-unit injections) is computed from that
//! immutable value, so a model can be shared across threads and solved
//! concurrently.
//!
//! Conventions:
//!
//! | Quantity              | Unit on the records       | Solver unit        |
//! |-----------------------|---------------------------|--------------------|
//! | Load, generation      | MW / Mvar                 | pu on `base_mva`   |
//! | Bus shunt             | MW / Mvar consumed at 1 pu| pu on `base_mva`   |
//! | Branch r, x, b        | pu on the system base     | pu                 |
//! | Angles                | radians                   | radians            |
//! | Thermal rating        | MVA (0 = unlimited)       | pu on `base_mva`   |

pub mod admittance;
pub mod diagnostics;
pub mod error;
pub mod graph_utils;
pub mod linalg;
pub mod network;
pub mod units;

pub use admittance::{Admittance, AdmittanceBuilder, BranchAdmittance};
pub use diagnostics::{DiagnosticIssue, Diagnostics, Entity, Severity};
pub use error::{LinalgError, ValidationError, ValidationResult};
pub use linalg::LuFactor;
pub use network::{NetworkBuilder, NetworkModel};
pub use units::{Degrees, Kilovolts, Megavars, MegavoltAmperes, Megawatts, PerUnit, Radians};

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

// Newtype wrappers for IDs for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenId(usize);

macro_rules! id_methods {
    ($($id:ident),*) => {$(
        impl $id {
            #[inline]
            pub fn new(value: usize) -> Self {
                $id(value)
            }
            #[inline]
            pub fn value(&self) -> usize {
                self.0
            }
        }
    )*};
}

id_methods!(BusId, BranchId, GenId);

/// Bus classification used to set up the power-flow equations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BusType {
    /// Voltage magnitude and angle fixed; absorbs the island's imbalance.
    Slack,
    /// Real power and voltage magnitude fixed (generator controlled).
    PV,
    /// Real and reactive power fixed.
    #[default]
    PQ,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bus {
    pub id: BusId,
    pub name: String,
    pub bus_type: BusType,
    pub base_kv: Kilovolts,
    /// Initial voltage magnitude (pu)
    pub voltage: PerUnit,
    /// Initial voltage angle
    pub angle: Radians,
    pub p_load: Megawatts,
    pub q_load: Megavars,
    /// Shunt conductance, expressed as MW consumed at 1 pu voltage
    pub g_shunt: Megawatts,
    /// Shunt susceptance, expressed as Mvar injected at 1 pu voltage
    pub b_shunt: Megavars,
    pub v_min: PerUnit,
    pub v_max: PerUnit,
    pub zone: usize,
}

impl Bus {
    pub fn new(id: BusId, bus_type: BusType, base_kv: f64) -> Self {
        Self {
            id,
            name: format!("Bus {}", id.value()),
            bus_type,
            base_kv: Kilovolts(base_kv),
            voltage: PerUnit(1.0),
            angle: Radians(0.0),
            p_load: Megawatts(0.0),
            q_load: Megavars(0.0),
            g_shunt: Megawatts(0.0),
            b_shunt: Megavars(0.0),
            v_min: PerUnit(0.9),
            v_max: PerUnit(1.1),
            zone: 1,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_load(mut self, p_mw: f64, q_mvar: f64) -> Self {
        self.p_load = Megawatts(p_mw);
        self.q_load = Megavars(q_mvar);
        self
    }

    pub fn with_shunt(mut self, g_mw: f64, b_mvar: f64) -> Self {
        self.g_shunt = Megawatts(g_mw);
        self.b_shunt = Megavars(b_mvar);
        self
    }

    /// Initial voltage estimate; the angle is in radians.
    pub fn with_voltage(mut self, magnitude_pu: f64, angle_rad: f64) -> Self {
        self.voltage = PerUnit(magnitude_pu);
        self.angle = Radians(angle_rad);
        self
    }

    pub fn with_voltage_limits(mut self, v_min: f64, v_max: f64) -> Self {
        self.v_min = PerUnit(v_min);
        self.v_max = PerUnit(v_max);
        self
    }

    pub fn with_zone(mut self, zone: usize) -> Self {
        self.zone = zone;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    pub from_bus: BusId,
    pub to_bus: BusId,
    /// Series resistance (pu)
    pub resistance: f64,
    /// Series reactance (pu)
    pub reactance: f64,
    /// Total line-charging susceptance (pu)
    pub charging_b: f64,
    /// Off-nominal tap magnitude on the from side; 0 means nominal
    pub tap_ratio: f64,
    pub phase_shift: Radians,
    pub rate_a: MegavoltAmperes,
    pub rate_b: MegavoltAmperes,
    pub rate_c: MegavoltAmperes,
    /// Minimum angle difference θf - θt
    pub angle_min: Radians,
    /// Maximum angle difference θf - θt
    pub angle_max: Radians,
    pub status: bool,
}

impl Branch {
    pub fn new(id: BranchId, from_bus: BusId, to_bus: BusId, resistance: f64, reactance: f64) -> Self {
        Self {
            id,
            name: format!("Branch {}-{}", from_bus.value(), to_bus.value()),
            from_bus,
            to_bus,
            resistance,
            reactance,
            charging_b: 0.0,
            tap_ratio: 1.0,
            phase_shift: Radians(0.0),
            rate_a: MegavoltAmperes(0.0),
            rate_b: MegavoltAmperes(0.0),
            rate_c: MegavoltAmperes(0.0),
            angle_min: Radians(-2.0 * PI),
            angle_max: Radians(2.0 * PI),
            status: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_charging(mut self, b_pu: f64) -> Self {
        self.charging_b = b_pu;
        self
    }

    pub fn with_tap(mut self, ratio: f64) -> Self {
        self.tap_ratio = ratio;
        self
    }

    pub fn with_phase_shift(mut self, shift: impl Into<Radians>) -> Self {
        self.phase_shift = shift.into();
        self
    }

    /// Long-term rating (rate A) in MVA. Zero leaves the branch unconstrained.
    pub fn with_rating(mut self, mva: f64) -> Self {
        self.rate_a = MegavoltAmperes(mva);
        self
    }

    pub fn with_ratings(mut self, rate_a: f64, rate_b: f64, rate_c: f64) -> Self {
        self.rate_a = MegavoltAmperes(rate_a);
        self.rate_b = MegavoltAmperes(rate_b);
        self.rate_c = MegavoltAmperes(rate_c);
        self
    }

    pub fn with_angle_limits(mut self, min: impl Into<Radians>, max: impl Into<Radians>) -> Self {
        self.angle_min = min.into();
        self.angle_max = max.into();
        self
    }

    pub fn with_status(mut self, in_service: bool) -> Self {
        self.status = in_service;
        self
    }

    /// Tap magnitude with the "0 means nominal" convention resolved.
    #[inline]
    pub fn effective_tap(&self) -> f64 {
        if self.tap_ratio == 0.0 {
            1.0
        } else {
            self.tap_ratio
        }
    }

    /// True when the two-port is directional (off-nominal tap or phase shift).
    pub fn is_asymmetric(&self) -> bool {
        self.effective_tap() != 1.0 || self.phase_shift.value() != 0.0
    }

    /// True when the angle-difference window is tighter than a full turn either way.
    pub fn has_angle_limits(&self) -> bool {
        self.angle_min.value() > -2.0 * PI || self.angle_max.value() < 2.0 * PI
    }
}

/// Generator cost curve.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum CostModel {
    /// No cost function specified
    #[default]
    NoCost,
    /// Polynomial cost: `cost = sum(coeffs[i] * P^i)` where `coeffs[0]` is constant term.
    /// For quadratic: `coeffs = [c0, c1, c2]` means `cost = c0 + c1*P + c2*P^2`.
    Polynomial(Vec<f64>),
    /// Piecewise linear cost: Vec<(mw, $/hr)> breakpoints, increasing in MW
    PiecewiseLinear(Vec<(f64, f64)>),
}

impl CostModel {
    /// Create quadratic cost: c0 + c1*P + c2*P^2
    pub fn quadratic(c0: f64, c1: f64, c2: f64) -> Self {
        CostModel::Polynomial(vec![c0, c1, c2])
    }

    /// Create linear cost: c0 + c1*P (marginal cost c1 in $/MWh)
    pub fn linear(c0: f64, c1: f64) -> Self {
        CostModel::Polynomial(vec![c0, c1])
    }

    /// Evaluate cost at given power output ($/hr).
    ///
    /// Piecewise-linear curves are extended past their end points along the
    /// first and last segments.
    pub fn evaluate(&self, p_mw: f64) -> f64 {
        match self {
            CostModel::NoCost => 0.0,
            CostModel::Polynomial(coeffs) => coeffs
                .iter()
                .rev()
                .fold(0.0, |acc, c| acc * p_mw + c),
            CostModel::PiecewiseLinear(points) => {
                if points.len() < 2 {
                    return points.first().map(|p| p.1).unwrap_or(0.0);
                }
                // max over segment lines equals interpolation for a convex curve
                self.segments()
                    .into_iter()
                    .map(|(slope, intercept)| slope * p_mw + intercept)
                    .fold(f64::NEG_INFINITY, f64::max)
            }
        }
    }

    /// Marginal cost ($/MWh) at the given output.
    pub fn marginal_cost(&self, p_mw: f64) -> f64 {
        match self {
            CostModel::NoCost => 0.0,
            CostModel::Polynomial(coeffs) => {
                // d/dP[sum(c_i * P^i)] = sum(i * c_i * P^(i-1))
                coeffs
                    .iter()
                    .enumerate()
                    .skip(1)
                    .map(|(i, c)| (i as f64) * c * p_mw.powi(i as i32 - 1))
                    .sum()
            }
            CostModel::PiecewiseLinear(points) => {
                if points.len() < 2 {
                    return 0.0;
                }
                let segment = points
                    .windows(2)
                    .position(|w| p_mw < w[1].0)
                    .unwrap_or(points.len() - 2);
                let (a, b) = (points[segment], points[segment + 1]);
                (b.1 - a.1) / (b.0 - a.0)
            }
        }
    }

    /// Second derivative ($/MW²h). Zero for piecewise-linear curves.
    pub fn curvature(&self, p_mw: f64) -> f64 {
        match self {
            CostModel::Polynomial(coeffs) => coeffs
                .iter()
                .enumerate()
                .skip(2)
                .map(|(i, c)| (i * (i - 1)) as f64 * c * p_mw.powi(i as i32 - 2))
                .sum(),
            _ => 0.0,
        }
    }

    /// Check if this cost model has actual cost data
    pub fn has_cost(&self) -> bool {
        !matches!(self, CostModel::NoCost)
    }

    pub fn is_piecewise_linear(&self) -> bool {
        matches!(self, CostModel::PiecewiseLinear(_))
    }

    /// Supporting lines `(slope, intercept)` of a piecewise-linear curve, one per segment.
    pub fn segments(&self) -> Vec<(f64, f64)> {
        match self {
            CostModel::PiecewiseLinear(points) => points
                .windows(2)
                .map(|w| {
                    let slope = (w[1].1 - w[0].1) / (w[1].0 - w[0].0);
                    (slope, w[0].1 - slope * w[0].0)
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Convexity check; polynomial curves are judged by their leading terms up to degree 2.
    pub fn is_convex(&self) -> bool {
        match self {
            CostModel::NoCost => true,
            CostModel::Polynomial(coeffs) => coeffs.len() < 3 || coeffs[2] >= 0.0,
            CostModel::PiecewiseLinear(_) => self
                .segments()
                .windows(2)
                .all(|w| w[1].0 >= w[0].0 - 1e-12),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gen {
    pub id: GenId,
    pub name: String,
    pub bus: BusId,
    /// Scheduled active power output
    pub active_power: Megawatts,
    /// Reactive power output (initial / fixed for PQ-bus units)
    pub reactive_power: Megavars,
    pub pmin: Megawatts,
    pub pmax: Megawatts,
    pub qmin: Megavars,
    pub qmax: Megavars,
    /// Voltage magnitude setpoint at the owning bus
    pub voltage_setpoint: PerUnit,
    pub cost_model: CostModel,
    pub status: bool,
}

impl Gen {
    pub fn new(id: GenId, bus: BusId) -> Self {
        Self {
            id,
            name: format!("Gen {}", id.value()),
            bus,
            active_power: Megawatts(0.0),
            reactive_power: Megavars(0.0),
            pmin: Megawatts(0.0),
            pmax: Megawatts(f64::INFINITY),
            qmin: Megavars(f64::NEG_INFINITY),
            qmax: Megavars(f64::INFINITY),
            voltage_setpoint: PerUnit(1.0),
            cost_model: CostModel::NoCost,
            status: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_output(mut self, p_mw: f64, q_mvar: f64) -> Self {
        self.active_power = Megawatts(p_mw);
        self.reactive_power = Megavars(q_mvar);
        self
    }

    pub fn with_p_limits(mut self, pmin: f64, pmax: f64) -> Self {
        self.pmin = Megawatts(pmin);
        self.pmax = Megawatts(pmax);
        self
    }

    pub fn with_q_limits(mut self, qmin: f64, qmax: f64) -> Self {
        self.qmin = Megavars(qmin);
        self.qmax = Megavars(qmax);
        self
    }

    pub fn with_voltage_setpoint(mut self, vm_pu: f64) -> Self {
        self.voltage_setpoint = PerUnit(vm_pu);
        self
    }

    pub fn with_cost(mut self, cost: CostModel) -> Self {
        self.cost_model = cost;
        self
    }

    pub fn with_status(mut self, in_service: bool) -> Self {
        self.status = in_service;
        self
    }
}
