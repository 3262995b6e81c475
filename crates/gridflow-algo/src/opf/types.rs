use std::fmt;

use gridflow_core::Entity;
use serde::{Deserialize, Serialize};

/// Type of constraint for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PowerBalanceP,
    PowerBalanceQ,
    GenPMin,
    GenPMax,
    GenQMin,
    GenQMax,
    VoltageMin,
    VoltageMax,
    BranchFlow,
    AngleDifference,
    /// Total in-service capacity cannot cover the load.
    GenerationCapacity,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstraintKind::PowerBalanceP => "active power balance",
            ConstraintKind::PowerBalanceQ => "reactive power balance",
            ConstraintKind::GenPMin => "generator Pmin",
            ConstraintKind::GenPMax => "generator Pmax",
            ConstraintKind::GenQMin => "generator Qmin",
            ConstraintKind::GenQMax => "generator Qmax",
            ConstraintKind::VoltageMin => "voltage minimum",
            ConstraintKind::VoltageMax => "voltage maximum",
            ConstraintKind::BranchFlow => "branch flow limit",
            ConstraintKind::AngleDifference => "angle difference limit",
            ConstraintKind::GenerationCapacity => "generation capacity",
        };
        f.write_str(name)
    }
}

/// A constraint not satisfied at the reported point.
///
/// `value` and `limit` are in engineering units: MW, Mvar, MVA, pu voltage
/// or radians depending on `kind`. For balance constraints `value` is the
/// residual and `limit` is zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintViolation {
    pub kind: ConstraintKind,
    pub entity: Entity,
    pub value: f64,
    pub limit: f64,
}

impl fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {}: {:.6} against limit {:.6}",
            self.kind, self.entity, self.value, self.limit
        )
    }
}

impl ConstraintKind {
    /// Power quantities are checked in pu and reported on the MVA base.
    fn is_power(self) -> bool {
        !matches!(
            self,
            ConstraintKind::VoltageMin | ConstraintKind::VoltageMax | ConstraintKind::AngleDifference
        )
    }
}

/// Accumulates violations of pu quantities against a common absolute tolerance.
#[derive(Debug)]
pub(crate) struct Violations {
    tol: f64,
    base_mva: f64,
    pub list: Vec<ConstraintViolation>,
}

impl Violations {
    pub(crate) fn new(tol: f64, base_mva: f64) -> Self {
        Self {
            tol,
            base_mva,
            list: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    fn push(&mut self, kind: ConstraintKind, entity: Entity, value: f64, limit: f64) {
        let scale = if kind.is_power() { self.base_mva } else { 1.0 };
        self.list.push(ConstraintViolation {
            kind,
            entity,
            value: value * scale,
            limit: limit * scale,
        });
    }

    pub(crate) fn upper(&mut self, kind: ConstraintKind, entity: Entity, value: f64, limit: f64) {
        if value > limit + self.tol || value.is_nan() {
            self.push(kind, entity, value, limit);
        }
    }

    pub(crate) fn lower(&mut self, kind: ConstraintKind, entity: Entity, value: f64, limit: f64) {
        if value < limit - self.tol || value.is_nan() {
            self.push(kind, entity, value, limit);
        }
    }

    pub(crate) fn zero(&mut self, kind: ConstraintKind, entity: Entity, residual: f64) {
        if residual.abs() > self.tol || residual.is_nan() {
            self.push(kind, entity, residual, 0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::{BusId, GenId};

    #[test]
    fn collector_applies_tolerance() {
        let mut v = Violations::new(1e-3, 100.0);
        v.upper(ConstraintKind::GenPMax, Entity::Gen(GenId::new(1)), 1.0005, 1.0);
        v.upper(ConstraintKind::GenPMax, Entity::Gen(GenId::new(2)), 1.005, 1.0);
        v.lower(ConstraintKind::VoltageMin, Entity::Bus(BusId::new(3)), 0.9, 0.94);
        v.zero(ConstraintKind::PowerBalanceP, Entity::Bus(BusId::new(4)), f64::NAN);
        assert_eq!(v.list.len(), 3);
        assert_eq!(v.list[0].entity, Entity::Gen(GenId::new(2)));
        // powers are reported in MW, voltages stay in pu
        assert!((v.list[0].value - 100.5).abs() < 1e-9);
        assert_eq!(v.list[0].limit, 100.0);
        assert_eq!(v.list[1].limit, 0.94);
    }

    #[test]
    fn display_names_entity() {
        let violation = ConstraintViolation {
            kind: ConstraintKind::BranchFlow,
            entity: Entity::Bus(BusId::new(7)),
            value: 120.0,
            limit: 100.0,
        };
        assert!(violation.to_string().starts_with("branch flow limit at bus 7"));
    }
}
