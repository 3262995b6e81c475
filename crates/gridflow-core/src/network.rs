//! Validated, immutable network model.
//!
//! [`NetworkBuilder`] collects buses, branches and generators in any order;
//! [`NetworkBuilder::build`] resolves every bus reference to a dense index,
//! checks the records and the slack placement, and returns a
//! [`NetworkModel`] that is never mutated afterwards. Solvers keep their own
//! transient state (bus-type switching, iterates) outside the model.
//!
//! Slack placement is checked per island of the *modeled* topology (all
//! branches, in service or not): each must contain exactly one slack bus.
//! Whether a bus is actually energized from its slack under the current
//! switching state is a solve-time question, answered by
//! [`NetworkModel::energized`].

use crate::admittance::Admittance;
use crate::diagnostics::{Diagnostics, Entity};
use crate::error::{ValidationError, ValidationResult};
use crate::graph_utils::{bus_graph, island_labels, reachable_from};
use crate::{Branch, Bus, BusId, BusType, CostModel, Gen};
use num_complex::Complex64;
use once_cell::sync::OnceCell;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct NetworkBuilder {
    base_mva: f64,
    buses: Vec<Bus>,
    branches: Vec<Branch>,
    gens: Vec<Gen>,
}

impl NetworkBuilder {
    pub fn new(base_mva: f64) -> Self {
        Self {
            base_mva,
            buses: Vec::new(),
            branches: Vec::new(),
            gens: Vec::new(),
        }
    }

    pub fn add_bus(&mut self, bus: Bus) -> &mut Self {
        self.buses.push(bus);
        self
    }

    pub fn add_branch(&mut self, branch: Branch) -> &mut Self {
        self.branches.push(branch);
        self
    }

    pub fn add_gen(&mut self, gen: Gen) -> &mut Self {
        self.gens.push(gen);
        self
    }

    pub fn build(&self) -> ValidationResult<NetworkModel> {
        NetworkModel::new(
            self.base_mva,
            self.buses.clone(),
            self.branches.clone(),
            self.gens.clone(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct NetworkModel {
    base_mva: f64,
    buses: Vec<Bus>,
    branches: Vec<Branch>,
    gens: Vec<Gen>,
    bus_lookup: HashMap<BusId, usize>,
    branch_ends: Vec<(usize, usize)>,
    gen_bus: Vec<usize>,
    gens_at_bus: Vec<Vec<usize>>,
    island_of: Vec<usize>,
    island_count: usize,
    slack_buses: Vec<usize>,
    diagnostics: Diagnostics,
    admittance: OnceCell<Admittance>,
}

impl NetworkModel {
    /// Validate and index the given records.
    pub fn new(
        base_mva: f64,
        buses: Vec<Bus>,
        branches: Vec<Branch>,
        gens: Vec<Gen>,
    ) -> ValidationResult<Self> {
        let mut diag = Diagnostics::new();

        if !(base_mva.is_finite() && base_mva > 0.0) {
            diag.error(Entity::Network, format!("base MVA must be positive, got {base_mva}"));
        }
        if buses.is_empty() {
            diag.error(Entity::Network, "network has no buses");
        }

        let mut bus_lookup = HashMap::with_capacity(buses.len());
        for (idx, bus) in buses.iter().enumerate() {
            if bus_lookup.insert(bus.id, idx).is_some() {
                diag.error(Entity::Bus(bus.id), "duplicate bus id");
            }
            check_bus(bus, &mut diag);
        }

        let mut seen_branch = HashSet::with_capacity(branches.len());
        let mut branch_ends = Vec::with_capacity(branches.len());
        for branch in &branches {
            if !seen_branch.insert(branch.id) {
                diag.error(Entity::Branch(branch.id), "duplicate branch id");
            }
            let from = resolve(&bus_lookup, branch.from_bus, Entity::Branch(branch.id), "from", &mut diag);
            let to = resolve(&bus_lookup, branch.to_bus, Entity::Branch(branch.id), "to", &mut diag);
            check_branch(branch, &mut diag);
            branch_ends.push((from.unwrap_or(0), to.unwrap_or(0)));
        }

        let mut seen_gen = HashSet::with_capacity(gens.len());
        let mut gen_bus = Vec::with_capacity(gens.len());
        for gen in &gens {
            if !seen_gen.insert(gen.id) {
                diag.error(Entity::Gen(gen.id), "duplicate generator id");
            }
            let bus = resolve(&bus_lookup, gen.bus, Entity::Gen(gen.id), "owning", &mut diag);
            check_gen(gen, &mut diag);
            gen_bus.push(bus.unwrap_or(0));
        }

        // topology checks need every reference resolved
        if diag.has_errors() {
            let (errors, _) = diag.partition();
            return Err(ValidationError::from_issues(errors));
        }

        let graph = bus_graph(buses.len(), branch_ends.iter().copied());
        let (island_of, island_count) = island_labels(&graph);

        let mut slacks_per_island = vec![Vec::new(); island_count];
        for (idx, bus) in buses.iter().enumerate() {
            if bus.bus_type == BusType::Slack {
                slacks_per_island[island_of[idx]].push(idx);
            }
        }
        for (island, slacks) in slacks_per_island.iter().enumerate() {
            if slacks.len() == 1 {
                continue;
            }
            let members: Vec<usize> = (0..buses.len()).filter(|&i| island_of[i] == island).collect();
            let entity = Entity::Island {
                first_bus: buses[members[0]].id,
                bus_count: members.len(),
            };
            if slacks.is_empty() {
                diag.error(entity, "no slack bus");
            } else {
                let ids: Vec<String> = slacks.iter().map(|&i| buses[i].id.value().to_string()).collect();
                diag.error(entity, format!("multiple slack buses ({})", ids.join(", ")));
            }
        }

        let mut gens_at_bus = vec![Vec::new(); buses.len()];
        for (g, &bus) in gen_bus.iter().enumerate() {
            gens_at_bus[bus].push(g);
        }
        for (idx, bus) in buses.iter().enumerate() {
            let regulated = gens_at_bus[idx].iter().any(|&g| gens[g].status);
            match bus.bus_type {
                BusType::PV if !regulated => diag.warn(
                    Entity::Bus(bus.id),
                    "voltage-controlled bus has no in-service generator, solved as PQ",
                ),
                BusType::Slack if !regulated => diag.warn(
                    Entity::Bus(bus.id),
                    "slack bus has no in-service generator, its injection is unattributed",
                ),
                _ => {}
            }
        }

        let (errors, warnings) = diag.partition();
        if !errors.is_empty() {
            return Err(ValidationError::from_issues(errors));
        }

        let slack_buses = (0..buses.len())
            .filter(|&i| buses[i].bus_type == BusType::Slack)
            .collect();

        Ok(Self {
            base_mva,
            buses,
            branches,
            gens,
            bus_lookup,
            branch_ends,
            gen_bus,
            gens_at_bus,
            island_of,
            island_count,
            slack_buses,
            diagnostics: Diagnostics { issues: warnings },
            admittance: OnceCell::new(),
        })
    }

    pub fn base_mva(&self) -> f64 {
        self.base_mva
    }

    pub fn buses(&self) -> &[Bus] {
        &self.buses
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn gens(&self) -> &[Gen] {
        &self.gens
    }

    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    pub fn gen_count(&self) -> usize {
        self.gens.len()
    }

    pub fn bus_index(&self, id: BusId) -> Option<usize> {
        self.bus_lookup.get(&id).copied()
    }

    /// Dense `(from, to)` bus indices of branch `k`.
    pub fn branch_ends(&self, k: usize) -> (usize, usize) {
        self.branch_ends[k]
    }

    /// Dense bus index of generator `g`.
    pub fn gen_bus(&self, g: usize) -> usize {
        self.gen_bus[g]
    }

    /// All generators attached to bus `i`, in service or not.
    pub fn gens_at(&self, i: usize) -> &[usize] {
        &self.gens_at_bus[i]
    }

    pub fn in_service_gens_at(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.gens_at_bus[i]
            .iter()
            .copied()
            .filter(move |&g| self.gens[g].status)
    }

    pub fn island_of(&self, i: usize) -> usize {
        self.island_of[i]
    }

    pub fn island_count(&self) -> usize {
        self.island_count
    }

    pub fn slack_buses(&self) -> &[usize] {
        &self.slack_buses
    }

    /// Warnings raised during validation.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Cached full-model admittance, assembled on first use.
    pub fn admittance(&self) -> &Admittance {
        self.admittance.get_or_init(|| Admittance::build(self))
    }

    /// Buses reachable from a slack bus through in-service branches.
    pub fn energized(&self) -> Vec<bool> {
        let edges = self
            .branches
            .iter()
            .zip(&self.branch_ends)
            .filter(|(b, _)| b.status)
            .map(|(_, &ends)| ends);
        let graph = bus_graph(self.buses.len(), edges);
        reachable_from(&graph, self.slack_buses.iter().copied())
    }

    /// Bus type the solvers start from: PV buses without an in-service
    /// generator are treated as PQ.
    pub fn effective_bus_type(&self, i: usize) -> BusType {
        match self.buses[i].bus_type {
            BusType::PV if self.in_service_gens_at(i).next().is_none() => BusType::PQ,
            other => other,
        }
    }

    /// Voltage magnitude target: the first in-service generator's setpoint at
    /// regulated buses, the bus's initial magnitude otherwise.
    pub fn voltage_setpoint(&self, i: usize) -> f64 {
        match self.effective_bus_type(i) {
            BusType::Slack | BusType::PV => self
                .in_service_gens_at(i)
                .next()
                .map(|g| self.gens[g].voltage_setpoint.value())
                .unwrap_or(self.buses[i].voltage.value()),
            BusType::PQ => self.buses[i].voltage.value(),
        }
    }

    /// Bus load in pu.
    pub fn load_pu(&self, i: usize) -> Complex64 {
        let bus = &self.buses[i];
        Complex64::new(
            bus.p_load.to_per_unit(self.base_mva),
            bus.q_load.to_per_unit(self.base_mva),
        )
    }

    /// Bus shunt admittance in pu.
    pub fn shunt_pu(&self, i: usize) -> Complex64 {
        let bus = &self.buses[i];
        Complex64::new(
            bus.g_shunt.to_per_unit(self.base_mva),
            bus.b_shunt.to_per_unit(self.base_mva),
        )
    }

    /// Scheduled output of the in-service generators at bus `i`, in pu.
    pub fn generation_pu(&self, i: usize) -> Complex64 {
        self.in_service_gens_at(i)
            .map(|g| {
                let gen = &self.gens[g];
                Complex64::new(
                    gen.active_power.to_per_unit(self.base_mva),
                    gen.reactive_power.to_per_unit(self.base_mva),
                )
            })
            .sum()
    }

    /// Net scheduled injection `Sg - Sd` per bus, in pu.
    pub fn scheduled_injection_pu(&self) -> Vec<Complex64> {
        (0..self.buses.len())
            .map(|i| self.generation_pu(i) - self.load_pu(i))
            .collect()
    }

    /// Summed reactive limits of the in-service generators at bus `i`, in pu.
    pub fn q_limits_pu(&self, i: usize) -> (f64, f64) {
        self.in_service_gens_at(i).fold((0.0, 0.0), |(lo, hi), g| {
            let gen = &self.gens[g];
            (
                lo + gen.qmin.to_per_unit(self.base_mva),
                hi + gen.qmax.to_per_unit(self.base_mva),
            )
        })
    }

    pub fn total_load_mw(&self) -> f64 {
        self.buses.iter().map(|b| b.p_load.value()).sum()
    }

    /// Active demand a dispatch must cover: load plus shunt conductance at 1 pu.
    pub fn total_demand_mw(&self) -> f64 {
        self.buses
            .iter()
            .map(|b| b.p_load.value() + b.g_shunt.value())
            .sum()
    }

    pub fn has_asymmetric_branches(&self) -> bool {
        self.branches.iter().any(|b| b.status && b.is_asymmetric())
    }
}

fn resolve(
    lookup: &HashMap<BusId, usize>,
    id: BusId,
    owner: Entity,
    role: &str,
    diag: &mut Diagnostics,
) -> Option<usize> {
    let idx = lookup.get(&id).copied();
    if idx.is_none() {
        diag.error(owner, format!("{role} bus {} does not exist", id.value()));
    }
    idx
}

fn require_finite(values: &[(&str, f64)], owner: &Entity, diag: &mut Diagnostics) {
    for (name, v) in values {
        if !v.is_finite() {
            diag.error(owner.clone(), format!("{name} must be finite"));
        }
    }
}

fn check_bus(bus: &Bus, diag: &mut Diagnostics) {
    let owner = Entity::Bus(bus.id);
    require_finite(
        &[
            ("voltage", bus.voltage.value()),
            ("angle", bus.angle.value()),
            ("p_load", bus.p_load.value()),
            ("q_load", bus.q_load.value()),
            ("g_shunt", bus.g_shunt.value()),
            ("b_shunt", bus.b_shunt.value()),
        ],
        &owner,
        diag,
    );
    if !(bus.base_kv.value() > 0.0) {
        diag.error(owner.clone(), "base kV must be positive");
    }
    if bus.v_min.value() > bus.v_max.value() {
        diag.error(owner.clone(), "v_min exceeds v_max");
    }
    if !(bus.voltage.value() > 0.0) {
        diag.error(owner, "initial voltage magnitude must be positive");
    }
}

fn check_branch(branch: &Branch, diag: &mut Diagnostics) {
    let owner = Entity::Branch(branch.id);
    require_finite(
        &[
            ("resistance", branch.resistance),
            ("reactance", branch.reactance),
            ("charging", branch.charging_b),
            ("tap ratio", branch.tap_ratio),
            ("phase shift", branch.phase_shift.value()),
            ("rate_a", branch.rate_a.value()),
        ],
        &owner,
        diag,
    );
    if branch.from_bus == branch.to_bus {
        diag.error(owner.clone(), "branch connects a bus to itself");
    }
    if branch.status && branch.resistance == 0.0 && branch.reactance == 0.0 {
        diag.error(owner.clone(), "zero series impedance");
    }
    if branch.tap_ratio < 0.0 {
        diag.error(owner.clone(), "negative tap ratio");
    }
    if branch.angle_min.value() > branch.angle_max.value() {
        diag.error(owner, "angle_min exceeds angle_max");
    }
}

fn check_gen(gen: &Gen, diag: &mut Diagnostics) {
    let owner = Entity::Gen(gen.id);
    require_finite(
        &[
            ("active power", gen.active_power.value()),
            ("reactive power", gen.reactive_power.value()),
        ],
        &owner,
        diag,
    );
    // limits may be infinite but never NaN
    for (name, v) in [
        ("pmin", gen.pmin.value()),
        ("pmax", gen.pmax.value()),
        ("qmin", gen.qmin.value()),
        ("qmax", gen.qmax.value()),
    ] {
        if v.is_nan() {
            diag.error(owner.clone(), format!("{name} is NaN"));
        }
    }
    if gen.pmin.value() > gen.pmax.value() {
        diag.error(owner.clone(), "pmin exceeds pmax");
    }
    if gen.qmin.value() > gen.qmax.value() {
        diag.error(owner.clone(), "qmin exceeds qmax");
    }
    if !(gen.voltage_setpoint.value() > 0.0) {
        diag.error(owner.clone(), "voltage setpoint must be positive");
    }
    check_cost(&gen.cost_model, &owner, diag);
}

fn check_cost(cost: &CostModel, owner: &Entity, diag: &mut Diagnostics) {
    match cost {
        CostModel::NoCost => {}
        CostModel::Polynomial(coeffs) => {
            if coeffs.iter().any(|c| !c.is_finite()) {
                diag.error(owner.clone(), "cost coefficients must be finite");
            }
        }
        CostModel::PiecewiseLinear(points) => {
            if points.len() < 2 {
                diag.error(owner.clone(), "piecewise-linear cost needs at least two points");
            } else if points.windows(2).any(|w| !(w[1].0 > w[0].0)) {
                diag.error(owner.clone(), "piecewise-linear breakpoints must increase in MW");
            } else if !cost.is_convex() {
                diag.error(owner.clone(), "piecewise-linear cost must be convex");
            }
        }
    }
}
