//! # nwire Network
//!
//! Assembles neuron components and a connectivity specification into one
//! reduced differential-algebraic system.
//!
//! ## Pipeline
//!
//! ```text
//! Connections + [Component] --resolve_network--> NetworkGraph
//!                           --reduce / reduce_split--> ReducedSystem
//!                           --extract_voltages / inspect_network--> views
//! ```
//!
//! ## Example
//!
//! ```
//! use nwire_components::{models, SynapseKind, SynapseSpec};
//! use nwire_network::{build_network, extract_voltages, Connections};
//!
//! let neurons = vec![
//!     models::hodgkin_huxley("pre").unwrap(),
//!     models::hodgkin_huxley("post").unwrap(),
//! ];
//! let mut connections = Connections::new();
//! connections.connect("pre", "post", SynapseSpec::new(SynapseKind::Exc, 0.5));
//!
//! let system = build_network(&connections, &neurons).unwrap();
//! assert_eq!(extract_voltages(&system).unwrap().len(), 2);
//! ```

mod graph;
mod reduce;
mod trajectory;

pub use graph::{
    resolve_network, Contribution, ContributionSource, CurrentBalance, NetworkGraph,
    NeuronRecord, SynapseRecord,
};
pub use reduce::{reduce, reduce_split, reduce_with, ReducedSystem, Strategy};
pub use trajectory::{voltage_traces, Solution, Trajectory};

use nwire_components::{Component, SynapseSpec};
use nwire_core::{NwireError, Result, VarId, Variable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

// =============================================================================
// CONNECTIVITY
// =============================================================================

/// Synapses from `pre` onto `post`, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub pre: String,
    pub post: String,
    pub synapses: Vec<SynapseSpec>,
}

/// Ordered mapping `(pre, post) -> [synapse]`. Serialized as a list of
/// [`Connection`]s; repeated pairs are merged on load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Connection>", into = "Vec<Connection>")]
pub struct Connections {
    entries: Vec<Connection>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a synapse; a repeated pair keeps its original position.
    pub fn connect(&mut self, pre: &str, post: &str, synapse: SynapseSpec) -> &mut Self {
        match self
            .entries
            .iter_mut()
            .find(|c| c.pre == pre && c.post == post)
        {
            Some(entry) => entry.synapses.push(synapse),
            None => self.entries.push(Connection {
                pre: pre.to_string(),
                post: post.to_string(),
                synapses: vec![synapse],
            }),
        }
        self
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Connection> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn synapse_count(&self) -> usize {
        self.entries.iter().map(|c| c.synapses.len()).sum()
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| NwireError::ParseError(e.to_string()))
    }
}

impl From<Vec<Connection>> for Connections {
    fn from(entries: Vec<Connection>) -> Self {
        let mut out = Self::new();
        for entry in entries {
            for synapse in entry.synapses {
                out.connect(&entry.pre, &entry.post, synapse);
            }
        }
        out
    }
}

impl From<Connections> for Vec<Connection> {
    fn from(connections: Connections) -> Self {
        connections.entries
    }
}

impl<'a> IntoIterator for &'a Connections {
    type Item = &'a Connection;
    type IntoIter = std::slice::Iter<'a, Connection>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// =============================================================================
// PUBLIC SURFACE
// =============================================================================

/// Resolve and reduce with the standard strategy.
pub fn build_network(connections: &Connections, neurons: &[Component]) -> Result<ReducedSystem> {
    build_network_with(connections, neurons, Strategy::Standard)
}

/// Resolve and reduce with the split strategy.
pub fn build_network_split(
    connections: &Connections,
    neurons: &[Component],
) -> Result<ReducedSystem> {
    build_network_with(connections, neurons, Strategy::Split)
}

pub fn build_network_with(
    connections: &Connections,
    neurons: &[Component],
    strategy: Strategy,
) -> Result<ReducedSystem> {
    info!(
        neurons = neurons.len(),
        synapses = connections.synapse_count(),
        %strategy,
        "building network"
    );
    let graph = resolve_network(connections, neurons)?;
    reduce_with(graph, strategy)
}

// =============================================================================
// VIEWS
// =============================================================================

/// Anything the read-only views can be asked about.
#[derive(Debug, Clone, Copy)]
pub enum SystemView<'a> {
    Graph(&'a NetworkGraph),
    Reduced(&'a ReducedSystem),
    Solution(&'a Solution),
}

impl<'a> SystemView<'a> {
    fn reduced(self) -> Result<&'a ReducedSystem> {
        match self {
            Self::Graph(_) => Err(NwireError::NotAssembled),
            Self::Reduced(system) => Ok(system),
            Self::Solution(solution) => Ok(solution.system()),
        }
    }
}

impl<'a> From<&'a NetworkGraph> for SystemView<'a> {
    fn from(graph: &'a NetworkGraph) -> Self {
        Self::Graph(graph)
    }
}

impl<'a> From<&'a ReducedSystem> for SystemView<'a> {
    fn from(system: &'a ReducedSystem) -> Self {
        Self::Reduced(system)
    }
}

impl<'a> From<&'a Solution> for SystemView<'a> {
    fn from(solution: &'a Solution) -> Self {
        Self::Solution(solution)
    }
}

/// Structure of an assembled network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSummary {
    /// Neuron names in insertion order
    pub neurons: Vec<String>,
    /// Number of synapses whose postsynaptic endpoint is the neuron
    pub neuron_synapses: BTreeMap<String, usize>,
    /// Every state of the reduced system, in state order
    pub all_states: Vec<Variable>,
}

impl fmt::Display for NetworkSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Neurons: {}", self.neurons.len())?;
        for neuron in &self.neurons {
            let count = self.neuron_synapses.get(neuron).copied().unwrap_or(0);
            writeln!(f, "  {} ({} incoming synapses)", neuron, count)?;
        }
        write!(f, "States: {}", self.all_states.len())
    }
}

pub fn inspect_network<'a>(view: impl Into<SystemView<'a>>) -> Result<NetworkSummary> {
    let system = view.into().reduced()?;
    let neurons: Vec<String> = system.neurons().iter().map(|n| n.name.clone()).collect();
    let mut neuron_synapses: BTreeMap<String, usize> =
        neurons.iter().map(|n| (n.clone(), 0)).collect();
    for synapse in system.synapses() {
        let post = &system.neurons()[synapse.post].name;
        if let Some(count) = neuron_synapses.get_mut(post) {
            *count += 1;
        }
    }
    let all_states = system
        .states()
        .iter()
        .map(|s| system.arena().get(*s).clone())
        .collect();
    Ok(NetworkSummary {
        neurons,
        neuron_synapses,
        all_states,
    })
}

/// Canonical membrane voltage of one neuron.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeuronVoltage {
    pub neuron: String,
    pub var: VarId,
    /// Qualified name of the canonical variable
    pub name: String,
    /// Column in the state vector; `None` for observed (clamped) voltages
    pub state_index: Option<usize>,
}

/// One canonical voltage per neuron, in neuron insertion order.
pub fn extract_voltages<'a>(view: impl Into<SystemView<'a>>) -> Result<Vec<NeuronVoltage>> {
    let system = view.into().reduced()?;
    system
        .neurons()
        .iter()
        .map(|neuron| {
            let var = system.canonical(neuron.voltage);
            let state_index = system.state_index(var);
            if state_index.is_none() && system.observed_definition(var).is_none() {
                return Err(NwireError::NoVoltageFound(neuron.name.clone()));
            }
            Ok(NeuronVoltage {
                neuron: neuron.name.clone(),
                var,
                name: system.arena().name(var).to_string(),
                state_index,
            })
        })
        .collect()
}

/// Canonical voltage variables per neuron, for indexing into a solution.
pub fn parse_sol_for_membrane_voltages<'a>(
    view: impl Into<SystemView<'a>>,
) -> Result<Vec<VarId>> {
    Ok(extract_voltages(view)?.into_iter().map(|v| v.var).collect())
}
