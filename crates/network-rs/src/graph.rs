//! Connection resolver: neurons + connectivity -> flat network graph.

use crate::Connections;
use nwire_components::{instantiate_synapse, Component, FlatComponent, PortRole, SynapseKind};
use nwire_core::{
    EquationKind, EquationSystem, Expr, FlatEquation, NwireError, Result, VarId, VarKind,
    VariableArena,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

/// A neuron placed in the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuronRecord {
    pub name: String,
    /// Index into the graph's pieces
    pub piece: usize,
    /// The neuron's `v` port
    pub voltage: VarId,
}

/// A synapse placed in the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynapseRecord {
    pub name: String,
    pub kind: SynapseKind,
    pub weight: f64,
    /// Neuron indices
    pub pre: usize,
    pub post: usize,
    pub piece: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContributionSource {
    /// Channel current of the neuron itself
    Intrinsic,
    /// Current of the synapse with this index
    Synapse(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub var: VarId,
    pub source: ContributionSource,
}

/// `target = sum(terms)` for one neuron summing port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentBalance {
    pub neuron: usize,
    pub role: PortRole,
    pub target: VarId,
    pub terms: Vec<Contribution>,
}

impl CurrentBalance {
    pub fn equation(&self) -> FlatEquation {
        FlatEquation::algebraic(
            self.target,
            Expr::Sum(self.terms.iter().map(|t| Expr::Var(t.var)).collect()),
        )
    }

    pub fn synaptic_terms(&self) -> usize {
        self.terms
            .iter()
            .filter(|t| matches!(t.source, ContributionSource::Synapse(_)))
            .count()
    }

    pub fn intrinsic_terms(&self) -> usize {
        self.terms.len() - self.synaptic_terms()
    }
}

/// Pre-reduction network: every variable of every piece, the couplings
/// between synapse ports and neuron voltages, and one balance per neuron
/// summing port.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkGraph {
    pub(crate) arena: VariableArena,
    pub(crate) pieces: Vec<FlatComponent>,
    pub(crate) neurons: Vec<NeuronRecord>,
    pub(crate) synapses: Vec<SynapseRecord>,
    /// `(synapse port, neuron voltage)` plus manual couplings
    pub(crate) couplings: Vec<(VarId, VarId)>,
    pub(crate) balances: Vec<CurrentBalance>,
}

impl NetworkGraph {
    pub fn arena(&self) -> &VariableArena {
        &self.arena
    }

    pub fn pieces(&self) -> &[FlatComponent] {
        &self.pieces
    }

    pub fn neurons(&self) -> &[NeuronRecord] {
        &self.neurons
    }

    pub fn synapses(&self) -> &[SynapseRecord] {
        &self.synapses
    }

    pub fn couplings(&self) -> &[(VarId, VarId)] {
        &self.couplings
    }

    pub fn balances(&self) -> &[CurrentBalance] {
        &self.balances
    }

    pub fn neuron(&self, name: &str) -> Option<&NeuronRecord> {
        self.neurons.iter().find(|n| n.name == name)
    }

    pub fn synapse(&self, name: &str) -> Option<&SynapseRecord> {
        self.synapses.iter().find(|s| s.name == name)
    }

    pub fn neuron_port(&self, name: &str, role: PortRole) -> Option<VarId> {
        self.neuron(name)
            .and_then(|n| self.pieces[n.piece].port(role))
    }

    pub fn synapse_port(&self, name: &str, role: PortRole) -> Option<VarId> {
        self.synapse(name)
            .and_then(|s| self.pieces[s.piece].port(role))
    }

    /// Balance for a neuron's summing port.
    pub fn balance(&self, neuron: &str, role: PortRole) -> Option<&CurrentBalance> {
        let index = self.neurons.iter().position(|n| n.name == neuron)?;
        self.balances
            .iter()
            .find(|b| b.neuron == index && b.role == role)
    }

    /// Add an explicit `a == b` coupling.
    pub fn couple(&mut self, a: VarId, b: VarId) -> Result<()> {
        for id in [a, b] {
            if self.arena.try_get(id).is_none() {
                return Err(NwireError::UnknownVariable(format!("#{}", id.0)));
            }
        }
        self.couplings.push((a, b));
        Ok(())
    }

    /// Every equation of the graph: piece equations, balances, then couplings.
    pub fn equation_system(&self) -> EquationSystem {
        let mut aliases = Vec::new();
        let mut equations = Vec::new();
        for piece in &self.pieces {
            equations.extend(piece.equations.iter().cloned());
            aliases.extend(piece.aliases.iter().copied());
        }
        equations.extend(self.balances.iter().map(CurrentBalance::equation));
        aliases.extend(self.couplings.iter().copied());
        EquationSystem {
            variables: self.arena.ids().collect(),
            equations,
            aliases,
            observed: Vec::new(),
        }
    }

    /// Human-readable equation list, in the order the reducer sees it.
    pub fn render_equations(&self) -> Vec<String> {
        let system = self.equation_system();
        let mut out: Vec<String> = system
            .equations
            .iter()
            .map(|eq| eq.render(&self.arena))
            .collect();
        out.extend(system.aliases.iter().map(|(a, b)| {
            format!("{} == {}", self.arena.name(*a), self.arena.name(*b))
        }));
        out
    }
}

/// Move a neuron's own definition of a summing port onto a fresh
/// `<port>_intrinsic` variable so the port is defined only by its balance.
///
/// Returns the fresh variable, or `None` when nothing defines the port.
fn fold_own_definition(
    arena: &mut VariableArena,
    flat: &mut FlatComponent,
    target: VarId,
) -> Result<Option<VarId>> {
    let Some(eq) = flat.equations.iter_mut().find(|eq| eq.lhs == target) else {
        return Ok(None);
    };
    let var = arena.get(target).clone();
    if eq.kind == EquationKind::Differential {
        return Err(NwireError::malformed(
            &flat.name,
            format!("summing port '{}' is a differential state", var.name),
        ));
    }
    let name = format!("{}_intrinsic", var.name);
    if arena.find(&name).is_some() {
        return Err(NwireError::malformed(
            &flat.name,
            format!("'{}' already exists", name),
        ));
    }
    let own = arena.push(name, var.domain, VarKind::Unknown, var.value);
    eq.lhs = own;
    flat.variables.push(own);
    Ok(Some(own))
}

/// Flatten neurons and synapses into one graph.
///
/// Neurons are flattened first and in the order given, so every neuron's
/// voltage has a lower id than any synapse port coupled to it.
pub fn resolve_network(connections: &Connections, neurons: &[Component]) -> Result<NetworkGraph> {
    let mut graph = NetworkGraph {
        arena: VariableArena::new(),
        pieces: Vec::with_capacity(neurons.len() + connections.synapse_count()),
        neurons: Vec::with_capacity(neurons.len()),
        synapses: Vec::new(),
        couplings: Vec::new(),
        balances: Vec::new(),
    };
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(neurons.len());
    // (neuron, role) -> balance index
    let mut sums: BTreeMap<(usize, PortRole), usize> = BTreeMap::new();

    for neuron in neurons {
        if index.contains_key(neuron.name()) {
            return Err(NwireError::malformed(neuron.name(), "neuron declared twice"));
        }
        if neuron.port(PortRole::V).is_none() {
            return Err(NwireError::PortMismatch {
                component: neuron.name().to_string(),
                child: neuron.name().to_string(),
                role: PortRole::V.to_string(),
            });
        }
        let mut flat = neuron.flatten(&mut graph.arena)?;
        let n = graph.neurons.len();
        index.insert(neuron.name(), n);

        let summing: Vec<(PortRole, VarId)> = flat
            .ports
            .iter()
            .filter(|(r, _)| r.is_summing())
            .map(|(&r, &v)| (r, v))
            .collect();
        for (role, target) in summing {
            let own = fold_own_definition(&mut graph.arena, &mut flat, target)?;
            let terms = own
                .into_iter()
                .chain(flat.contributions.get(&role).into_iter().flatten().copied())
                .map(|var| Contribution {
                    var,
                    source: ContributionSource::Intrinsic,
                })
                .collect();
            sums.insert((n, role), graph.balances.len());
            graph.balances.push(CurrentBalance {
                neuron: n,
                role,
                target,
                terms,
            });
        }

        let voltage = flat.port(PortRole::V).ok_or_else(|| NwireError::PortMismatch {
            component: neuron.name().to_string(),
            child: neuron.name().to_string(),
            role: PortRole::V.to_string(),
        })?;
        graph.neurons.push(NeuronRecord {
            name: neuron.name().to_string(),
            piece: graph.pieces.len(),
            voltage,
        });
        graph.pieces.push(flat);
    }

    let lookup = |name: &str| -> Result<usize> {
        index
            .get(name)
            .copied()
            .ok_or_else(|| NwireError::UnknownNeuron(name.to_string()))
    };

    let mut names: HashSet<String> = HashSet::new();
    for entry in connections.iter() {
        let pre = lookup(&entry.pre)?;
        let post = lookup(&entry.post)?;
        for spec in &entry.synapses {
            let name = match &spec.name {
                Some(explicit) => {
                    if names.contains(explicit) {
                        return Err(NwireError::malformed(explicit, "synapse name used twice"));
                    }
                    explicit.clone()
                }
                None => {
                    let base = format!("{}_{}_{}", entry.pre, entry.post, spec.kind.tag());
                    let mut candidate = base.clone();
                    let mut n = 2;
                    while names.contains(&candidate) {
                        candidate = format!("{}_{}", base, n);
                        n += 1;
                    }
                    candidate
                }
            };
            let synapse = instantiate_synapse(spec.kind, spec.weight, &spec.overrides, &name)?;
            let flat = synapse.flatten(&mut graph.arena)?;
            let s = graph.synapses.len();

            let port = |role: PortRole| {
                flat.port(role).ok_or_else(|| NwireError::PortMismatch {
                    component: name.clone(),
                    child: name.clone(),
                    role: role.to_string(),
                })
            };
            graph.couplings.push((port(PortRole::Pre)?, graph.neurons[pre].voltage));
            graph.couplings.push((port(PortRole::Post)?, graph.neurons[post].voltage));

            let mut injections = vec![(post, port(PortRole::I)?)];
            if let Some(back) = flat.port(PortRole::IPre) {
                injections.push((pre, back));
            }
            for (neuron, var) in injections {
                let balance = sums.get(&(neuron, PortRole::I)).copied().ok_or_else(|| {
                    NwireError::PortMismatch {
                        component: name.clone(),
                        child: graph.neurons[neuron].name.clone(),
                        role: PortRole::I.to_string(),
                    }
                })?;
                graph.balances[balance].terms.push(Contribution {
                    var,
                    source: ContributionSource::Synapse(s),
                });
            }

            debug!(synapse = %name, pre = %entry.pre, post = %entry.post, "wired synapse");
            names.insert(name.clone());
            graph.synapses.push(SynapseRecord {
                name,
                kind: spec.kind,
                weight: spec.weight,
                pre,
                post,
                piece: graph.pieces.len(),
            });
            graph.pieces.push(flat);
        }
    }

    info!(
        neurons = graph.neurons.len(),
        synapses = graph.synapses.len(),
        variables = graph.arena.len(),
        "resolved network"
    );
    Ok(graph)
}
