//! Structural reduction of a network graph.
//!
//! Both strategies end in the same global elimination, so their results are
//! equal: canonical variables are the lowest id of each class whatever order
//! the classes were merged in, substitution runs to a fixpoint, and every
//! output list is sorted by variable id.

use crate::graph::{CurrentBalance, NetworkGraph, NeuronRecord, SynapseRecord};
use nwire_core::{
    Elimination, EliminationMode, EquationKind, EquationSystem, EquationSystemReducer, Expr,
    FlatEquation, NwireError, OdeSystem, Result, StateVector, Time, VarId, VarKind,
    VariableArena,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

// =============================================================================
// STRATEGY
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// One global pass over the whole graph
    #[default]
    Standard,
    /// Per-piece passes in parallel, then one global pass
    Split,
}

impl Strategy {
    /// Network size at which the split strategy starts paying off
    pub const SPLIT_THRESHOLD: usize = 50;

    pub fn recommended(neurons: usize) -> Self {
        if neurons < Self::SPLIT_THRESHOLD {
            Self::Standard
        } else {
            Self::Split
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Split => write!(f, "split"),
        }
    }
}

// =============================================================================
// REDUCED SYSTEM
// =============================================================================

/// Square ODE system over canonical states, with eliminated algebraic
/// variables kept as observed definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedSystem {
    arena: VariableArena,
    /// Sorted by id; `equations[k]` defines `states[k]`
    states: Vec<VarId>,
    equations: Vec<FlatEquation>,
    /// Sorted by lhs
    observed: Vec<FlatEquation>,
    /// Canonical representative of every arena variable, indexed by id
    canonical: Vec<VarId>,
    /// Arena id -> state column
    slots: Vec<Option<usize>>,
    neurons: Vec<NeuronRecord>,
    synapses: Vec<SynapseRecord>,
    balances: Vec<CurrentBalance>,
    strategy: Strategy,
}

impl ReducedSystem {
    fn assemble(
        arena: VariableArena,
        neurons: Vec<NeuronRecord>,
        synapses: Vec<SynapseRecord>,
        balances: Vec<CurrentBalance>,
        strategy: Strategy,
        elimination: Elimination,
    ) -> Self {
        let Elimination {
            differential,
            algebraic,
            observed,
            aliases,
            ..
        } = elimination;
        debug_assert!(algebraic.is_empty());

        let aliases: HashMap<VarId, VarId> = aliases.into_iter().collect();
        let canonical: Vec<VarId> = arena
            .ids()
            .map(|v| aliases.get(&v).copied().unwrap_or(v))
            .collect();
        let states: Vec<VarId> = differential.iter().map(|eq| eq.lhs).collect();
        let mut slots = vec![None; arena.len()];
        for (k, state) in states.iter().enumerate() {
            slots[state.index()] = Some(k);
        }

        Self {
            arena,
            states,
            equations: differential,
            observed,
            canonical,
            slots,
            neurons,
            synapses,
            balances,
            strategy,
        }
    }

    pub fn arena(&self) -> &VariableArena {
        &self.arena
    }

    pub fn states(&self) -> &[VarId] {
        &self.states
    }

    /// Differential equations, one per state.
    pub fn equations(&self) -> &[FlatEquation] {
        &self.equations
    }

    pub fn observed(&self) -> &[FlatEquation] {
        &self.observed
    }

    pub fn neurons(&self) -> &[NeuronRecord] {
        &self.neurons
    }

    pub fn synapses(&self) -> &[SynapseRecord] {
        &self.synapses
    }

    /// Balance equations as they were assembled, before elimination.
    pub fn current_balances(&self) -> &[CurrentBalance] {
        &self.balances
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Canonical representative of `id`.
    pub fn canonical(&self, id: VarId) -> VarId {
        self.canonical.get(id.index()).copied().unwrap_or(id)
    }

    /// Canonical representative of a qualified variable name.
    pub fn canonical_of(&self, name: &str) -> Result<VarId> {
        self.arena
            .find(name)
            .map(|id| self.canonical(id))
            .ok_or_else(|| NwireError::UnknownVariable(name.to_string()))
    }

    /// Full canonical map, indexed by arena id.
    pub fn canonical_map(&self) -> &[VarId] {
        &self.canonical
    }

    /// Column of `id` in a state vector, if its class is a state.
    pub fn state_index(&self, id: VarId) -> Option<usize> {
        self.slots
            .get(self.canonical(id).index())
            .copied()
            .flatten()
    }

    pub fn is_state(&self, id: VarId) -> bool {
        self.state_index(id).is_some()
    }

    /// Substituted definition of an observed variable.
    pub fn observed_definition(&self, id: VarId) -> Option<&Expr> {
        let c = self.canonical(id);
        self.observed
            .binary_search_by_key(&c, |eq| eq.lhs)
            .ok()
            .map(|k| &self.observed[k].rhs)
    }

    /// Same states, equations, observed set and canonical map.
    pub fn equivalent(&self, other: &Self) -> bool {
        self.states == other.states
            && self.equations == other.equations
            && self.observed == other.observed
            && self.canonical == other.canonical
    }

    /// Value of any variable given a state vector: states are read, observed
    /// definitions evaluated, parameters looked up.
    pub fn evaluate(&self, id: VarId, y: &StateVector) -> f64 {
        if let Some(k) = self.state_index(id) {
            return y[k];
        }
        let lookup = |v: VarId| self.value(v, y);
        match self.observed_definition(id) {
            Some(rhs) => rhs.eval(&lookup),
            None => self.arena.get(self.canonical(id)).value,
        }
    }

    fn value(&self, id: VarId, y: &StateVector) -> f64 {
        match self.slots.get(id.index()).copied().flatten() {
            Some(k) => y[k],
            None => self.arena.get(id).value,
        }
    }

    /// Initial state from declared defaults; `overrides` may name any member
    /// of a state's class.
    pub fn initial_state(&self, overrides: &BTreeMap<String, f64>) -> Result<StateVector> {
        let mut y: StateVector = self
            .states
            .iter()
            .map(|s| self.arena.get(*s).value)
            .collect();
        for (name, value) in overrides {
            let id = self.canonical_of(name)?;
            let k = self
                .state_index(id)
                .ok_or_else(|| NwireError::UnknownVariable(name.clone()))?;
            y[k] = *value;
        }
        Ok(y)
    }

    /// Run the global elimination again on this system's own output.
    pub fn reduce_again(&self) -> Result<ReducedSystem> {
        let mut equations = self.equations.clone();
        equations.extend(self.observed.iter().map(|eq| FlatEquation {
            kind: EquationKind::Algebraic,
            lhs: eq.lhs,
            rhs: eq.rhs.clone(),
        }));
        let aliases = self
            .arena
            .ids()
            .map(|v| (v, self.canonical(v)))
            .filter(|(v, c)| v != c)
            .collect();
        let system = EquationSystem {
            variables: self.arena.ids().collect(),
            equations,
            aliases,
            observed: Vec::new(),
        };
        let elimination =
            EquationSystemReducer::new(&self.arena).eliminate(system, &EliminationMode::Global)?;
        Ok(Self::assemble(
            self.arena.clone(),
            self.neurons.clone(),
            self.synapses.clone(),
            self.balances.clone(),
            self.strategy,
            elimination,
        ))
    }

    /// Differential equations followed by observed definitions.
    pub fn render_equations(&self) -> Vec<String> {
        self.equations
            .iter()
            .chain(&self.observed)
            .map(|eq| eq.render(&self.arena))
            .collect()
    }

    /// Number of parameters referenced by the reduced equations.
    pub fn parameter_count(&self) -> usize {
        let mut seen = HashSet::new();
        for eq in self.equations.iter().chain(&self.observed) {
            seen.extend(
                eq.rhs
                    .variables()
                    .into_iter()
                    .filter(|v| self.arena.get(*v).kind == VarKind::Parameter),
            );
        }
        seen.len()
    }
}

impl OdeSystem for ReducedSystem {
    fn dimension(&self) -> usize {
        self.states.len()
    }

    fn derivatives(&self, _t: Time, y: &StateVector) -> StateVector {
        let lookup = |v: VarId| self.value(v, y);
        self.equations.iter().map(|eq| eq.rhs.eval(&lookup)).collect()
    }
}

// =============================================================================
// REDUCTION
// =============================================================================

/// Reduce with the standard strategy.
pub fn reduce(graph: NetworkGraph) -> Result<ReducedSystem> {
    reduce_with(graph, Strategy::Standard)
}

/// Reduce with the split strategy.
pub fn reduce_split(graph: NetworkGraph) -> Result<ReducedSystem> {
    reduce_with(graph, Strategy::Split)
}

pub fn reduce_with(graph: NetworkGraph, strategy: Strategy) -> Result<ReducedSystem> {
    let elimination = match strategy {
        Strategy::Standard => eliminate_standard(&graph)?,
        Strategy::Split => match eliminate_split(&graph) {
            Ok(elimination) => elimination,
            // Partial passes count per piece; report against the whole network
            Err(err) => {
                warn!(error = %err, "split reduction failed, re-checking globally");
                return Err(eliminate_standard(&graph).err().unwrap_or(err));
            }
        },
    };
    info!(
        %strategy,
        states = elimination.differential.len(),
        observed = elimination.observed.len(),
        "reduced network"
    );
    let NetworkGraph {
        arena,
        neurons,
        synapses,
        balances,
        ..
    } = graph;
    Ok(ReducedSystem::assemble(
        arena,
        neurons,
        synapses,
        balances,
        strategy,
        elimination,
    ))
}

fn eliminate_standard(graph: &NetworkGraph) -> Result<Elimination> {
    EquationSystemReducer::new(&graph.arena)
        .eliminate(graph.equation_system(), &EliminationMode::Global)
}

fn eliminate_split(graph: &NetworkGraph) -> Result<Elimination> {
    let reducer = EquationSystemReducer::new(&graph.arena);
    let coupled: HashSet<VarId> = graph
        .couplings
        .iter()
        .flat_map(|&(a, b)| [a, b])
        .collect();

    let locals: Vec<Elimination> = graph
        .pieces
        .par_iter()
        .map(|piece| -> Result<Elimination> {
            let protected = piece
                .ports
                .values()
                .copied()
                .chain(piece.variables.iter().copied().filter(|v| coupled.contains(v)))
                .collect();
            let system = EquationSystem {
                variables: piece.variables.clone(),
                equations: piece.equations.clone(),
                aliases: piece.aliases.clone(),
                observed: Vec::new(),
            };
            let local = reducer.eliminate(system, &EliminationMode::Local { protected })?;
            debug!(
                piece = %piece.name,
                kept = local.differential.len() + local.algebraic.len(),
                observed = local.observed.len(),
                "reduced piece"
            );
            Ok(local)
        })
        .collect::<Result<_>>()?;

    let mut global = EquationSystem::default();
    for local in locals {
        global.variables.extend(local.variables);
        global.equations.extend(local.differential);
        global.equations.extend(local.algebraic);
        global.aliases.extend(local.aliases);
        global.observed.extend(local.observed);
    }
    global
        .equations
        .extend(graph.balances.iter().map(CurrentBalance::equation));
    global.aliases.extend(graph.couplings.iter().copied());

    reducer.eliminate(global, &EliminationMode::Global)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{resolve_network, Connections};
    use nwire_components::{models, SynapseKind, SynapseSpec};

    fn pair_graph() -> NetworkGraph {
        let neurons = vec![
            models::hodgkin_huxley("pre").unwrap(),
            models::hodgkin_huxley("post").unwrap(),
        ];
        let mut conns = Connections::new();
        conns.connect("pre", "post", SynapseSpec::new(SynapseKind::Exc, 0.5));
        resolve_network(&conns, &neurons).unwrap()
    }

    #[test]
    fn test_recommended_strategy() {
        assert_eq!(Strategy::recommended(2), Strategy::Standard);
        assert_eq!(Strategy::recommended(49), Strategy::Standard);
        assert_eq!(Strategy::recommended(50), Strategy::Split);
        assert_eq!(Strategy::recommended(400), Strategy::Split);
    }

    #[test]
    fn test_pair_states() {
        let system = reduce(pair_graph()).unwrap();
        let names: Vec<&str> = system
            .states()
            .iter()
            .map(|s| system.arena().name(*s))
            .collect();
        assert_eq!(
            names,
            vec![
                "pre.soma.v",
                "pre.na.m",
                "pre.na.h",
                "pre.k.n",
                "post.soma.v",
                "post.na.m",
                "post.na.h",
                "post.k.n",
                "pre_post_exc.s",
            ]
        );
        assert_eq!(system.dimension(), 9);
    }

    #[test]
    fn test_synapse_ports_share_neuron_voltage() {
        let graph = pair_graph();
        let pre_v = graph.neuron_port("pre", nwire_components::PortRole::V).unwrap();
        let syn_pre = graph
            .synapse_port("pre_post_exc", nwire_components::PortRole::Pre)
            .unwrap();
        let system = reduce(graph).unwrap();
        assert_eq!(system.canonical(syn_pre), pre_v);
        assert!(system.is_state(syn_pre));
    }

    #[test]
    fn test_rest_is_near_equilibrium() {
        let system = reduce(pair_graph()).unwrap();
        let y = system.initial_state(&BTreeMap::new()).unwrap();
        let dy = system.derivatives(0.0, &y);
        let v = system.state_index(system.canonical_of("post.soma.v").unwrap()).unwrap();
        assert!(dy[v].abs() < 0.05, "dv/dt = {}", dy[v]);
    }

    #[test]
    fn test_initial_state_overrides() {
        let system = reduce(pair_graph()).unwrap();
        let overrides: BTreeMap<String, f64> =
            [("pre_post_exc.v_pre".to_string(), -20.0)].into_iter().collect();
        let y = system.initial_state(&overrides).unwrap();
        let k = system.state_index(system.canonical_of("pre.soma.v").unwrap()).unwrap();
        assert_eq!(y[k], -20.0);

        let unknown: BTreeMap<String, f64> = [("nope".to_string(), 0.0)].into_iter().collect();
        assert_eq!(
            system.initial_state(&unknown).unwrap_err(),
            NwireError::UnknownVariable("nope".into())
        );
        let observed: BTreeMap<String, f64> =
            [("pre.na.i".to_string(), 0.0)].into_iter().collect();
        assert!(system.initial_state(&observed).is_err());
    }

    #[test]
    fn test_split_matches_standard() {
        let standard = reduce(pair_graph()).unwrap();
        let split = reduce_split(pair_graph()).unwrap();
        assert!(standard.equivalent(&split));
        assert_eq!(split.strategy(), Strategy::Split);
        assert_eq!(standard.render_equations(), split.render_equations());
    }

    #[test]
    fn test_reduce_again_is_idempotent() {
        let system = reduce(pair_graph()).unwrap();
        let again = system.reduce_again().unwrap();
        assert_eq!(system, again);
    }

    #[test]
    fn test_observed_evaluation() {
        let system = reduce(pair_graph()).unwrap();
        let y = system.initial_state(&BTreeMap::new()).unwrap();
        let leak = system.canonical_of("post.leak.i").unwrap();
        assert!(system.observed_definition(leak).is_some());
        let expected = 0.3 * (-65.0 - -54.387);
        assert!((system.evaluate(leak, &y) - expected).abs() < 1e-9);
    }
}
