//! Channel and neuron presets.

use crate::{compose_component, make_component, Component, PortBinding, PortRole, StateVar};
use nwire_core::{
    Domain, Equation, Expr, GateKinetics, GateVariable, IonChannel, RateFunction, Result,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// CHANNELS
// =============================================================================

/// Channel component with ports `v` and `i`.
pub fn channel_component(channel: &IonChannel) -> Result<Component> {
    let v = Expr::sym("v");
    let mut state_vars = vec![
        StateVar::new("v", Domain::Voltage, -65.0),
        StateVar::new("i", Domain::Current, 0.0),
    ];
    let mut equations = Vec::with_capacity(channel.gates.len() + 1);
    for gate in &channel.gates {
        state_vars.push(StateVar::new(&gate.name, Domain::Gating, gate.initial));
        equations.push(Equation::differential(&gate.name, gate.derivative(&v)));
    }
    equations.push(Equation::algebraic("i", channel.current()));
    make_component(
        &channel.name,
        state_vars,
        &[("g", channel.g_max), ("e", channel.e_rev)],
        equations,
        &[(PortRole::V, "v"), (PortRole::I, "i")],
    )
}

fn alpha_beta(
    name: &str,
    power: u32,
    initial: f64,
    alpha: RateFunction,
    beta: RateFunction,
) -> GateVariable {
    GateVariable {
        name: name.to_string(),
        power,
        initial,
        kinetics: GateKinetics::AlphaBeta { alpha, beta },
    }
}

/// Fast sodium channel (Hodgkin & Huxley 1952)
pub fn sodium() -> IonChannel {
    IonChannel {
        name: "na".into(),
        g_max: 120.0,
        e_rev: 50.0,
        gates: vec![
            alpha_beta(
                "m",
                3,
                0.0529,
                RateFunction::HodgkinHuxley { a: -0.1, b: 40.0, c: -10.0 },
                RateFunction::Exponential { a: 4.0, b: 65.0, c: -18.0 },
            ),
            alpha_beta(
                "h",
                1,
                0.5961,
                RateFunction::Exponential { a: 0.07, b: 65.0, c: -20.0 },
                RateFunction::Sigmoid { a: 1.0, b: 35.0, c: -10.0 },
            ),
        ],
        carries_calcium: false,
    }
}

/// Delayed rectifier potassium channel
pub fn potassium() -> IonChannel {
    IonChannel {
        name: "k".into(),
        g_max: 36.0,
        e_rev: -77.0,
        gates: vec![alpha_beta(
            "n",
            4,
            0.3177,
            RateFunction::HodgkinHuxley { a: -0.01, b: 55.0, c: -10.0 },
            RateFunction::Exponential { a: 0.125, b: 65.0, c: -80.0 },
        )],
        carries_calcium: false,
    }
}

pub fn leak() -> IonChannel {
    IonChannel {
        name: "leak".into(),
        g_max: 0.3,
        e_rev: -54.387,
        gates: Vec::new(),
        carries_calcium: false,
    }
}

/// Low-threshold T-type calcium channel
pub fn calcium_t(g_max: f64) -> IonChannel {
    IonChannel {
        name: "cat".into(),
        g_max,
        e_rev: 120.0,
        gates: vec![
            GateVariable {
                name: "m".into(),
                power: 3,
                initial: 0.01,
                kinetics: GateKinetics::SteadyState {
                    inf: RateFunction::Sigmoid { a: 1.0, b: 27.1, c: -7.2 },
                    tau_base: 21.7,
                    tau: RateFunction::Sigmoid { a: -21.3, b: 68.1, c: -20.5 },
                },
            },
            GateVariable {
                name: "h".into(),
                power: 1,
                initial: 0.6,
                kinetics: GateKinetics::SteadyState {
                    inf: RateFunction::Sigmoid { a: 1.0, b: 32.1, c: 5.5 },
                    tau_base: 105.0,
                    tau: RateFunction::Sigmoid { a: -89.8, b: 55.0, c: -16.9 },
                },
            },
        ],
        carries_calcium: true,
    }
}

// =============================================================================
// SOMA
// =============================================================================

/// Intracellular calcium pool driven by the `ca` port
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalciumPool {
    /// Current-to-concentration factor
    pub f: f64,
    /// Decay time constant (ms)
    pub tau: f64,
    /// Resting concentration (uM)
    pub ca0: f64,
}

impl Default for CalciumPool {
    fn default() -> Self {
        Self {
            f: 0.094,
            tau: 200.0,
            ca0: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SomaParams {
    /// Membrane capacitance (uF/cm^2)
    pub capacitance: f64,
    /// Applied current (uA/cm^2)
    pub i_app: f64,
    /// Resting potential (mV)
    pub v_rest: f64,
    pub calcium: Option<CalciumPool>,
}

impl Default for SomaParams {
    fn default() -> Self {
        Self {
            capacitance: 1.0,
            i_app: 0.0,
            v_rest: -65.0,
            calcium: None,
        }
    }
}

/// Membrane compartment: `dv/dt = (i_app - i) / c` where `i` is the summed
/// ionic and synaptic current.
pub fn soma(params: &SomaParams) -> Result<Component> {
    let mut state_vars = vec![
        StateVar::new("v", Domain::Voltage, params.v_rest),
        StateVar::new("i", Domain::Current, 0.0),
    ];
    let mut parameters = vec![("c", params.capacitance), ("i_app", params.i_app)];
    let mut equations = vec![Equation::parse("dv/dt = (i_app - i) / c")?];
    let mut ports = vec![(PortRole::V, "v"), (PortRole::I, "i")];

    if let Some(pool) = &params.calcium {
        state_vars.push(StateVar::new("ca", Domain::Concentration, pool.ca0));
        state_vars.push(StateVar::new("i_ca", Domain::CalciumFlux, 0.0));
        parameters.extend([("f", pool.f), ("tau_ca", pool.tau), ("ca0", pool.ca0)]);
        equations.push(Equation::parse("dca/dt = (-f * i_ca - ca + ca0) / tau_ca")?);
        ports.push((PortRole::Ca, "i_ca"));
    }
    make_component("soma", state_vars, &parameters, equations, &ports)
}

// =============================================================================
// NEURONS
// =============================================================================

/// Wire a soma and channels into a neuron exporting `v`, `i` (and `ca`).
pub fn neuron(name: &str, soma: Component, channels: &[IonChannel]) -> Result<Component> {
    let soma_name = soma.name().to_string();
    let has_calcium = soma.port(PortRole::Ca).is_some();

    let mut wiring = vec![
        PortBinding::export(&soma_name, PortRole::V, PortRole::V),
        PortBinding::export(&soma_name, PortRole::I, PortRole::I),
    ];
    if has_calcium {
        wiring.push(PortBinding::export(&soma_name, PortRole::Ca, PortRole::Ca));
    }

    let mut children = vec![soma];
    for channel in channels {
        wiring.push(PortBinding::join(&channel.name, PortRole::V, &soma_name, PortRole::V));
        wiring.push(PortBinding::contribute(&channel.name, PortRole::I, PortRole::I));
        if channel.carries_calcium {
            wiring.push(PortBinding::contribute(&channel.name, PortRole::I, PortRole::Ca));
        }
        children.push(channel_component(channel)?);
    }
    compose_component(name, children, Vec::new(), wiring)
}

/// Classic squid axon neuron.
pub fn hodgkin_huxley(name: &str) -> Result<Component> {
    neuron(
        name,
        soma(&SomaParams::default())?,
        &[sodium(), potassium(), leak()],
    )
}

/// HH neuron with a T-type calcium current feeding an intracellular pool.
pub fn bursting(name: &str) -> Result<Component> {
    let params = SomaParams {
        calcium: Some(CalciumPool::default()),
        ..SomaParams::default()
    };
    neuron(
        name,
        soma(&params)?,
        &[sodium(), potassium(), leak(), calcium_t(2.0)],
    )
}

/// Leaf holding `v` at `v_hold`; its `i` port absorbs whatever is injected.
pub fn voltage_clamp(name: &str, v_hold: f64) -> Result<Component> {
    make_component(
        name,
        vec![
            StateVar::new("v", Domain::Voltage, v_hold),
            StateVar::new("i", Domain::Current, 0.0),
        ],
        &[("v_hold", v_hold)],
        vec![Equation::parse("v = v_hold")?],
        &[(PortRole::V, "v"), (PortRole::I, "i")],
    )
}

/// Preset selector used by network files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeuronModel {
    Hh,
    Bursting,
    Clamp,
}

impl NeuronModel {
    pub fn build(&self, name: &str) -> Result<Component> {
        match self {
            Self::Hh => hodgkin_huxley(name),
            Self::Bursting => bursting(name),
            Self::Clamp => voltage_clamp(name, -65.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nwire_core::{EquationKind, VarKind, VariableArena};

    #[test]
    fn test_channel_component() {
        let na = channel_component(&sodium()).unwrap();
        assert_eq!(na.name(), "na");
        let names: Vec<&str> = na.state_vars().iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["v", "i", "m", "h"]);
        assert_eq!(na.equations().len(), 3);
        assert_eq!(na.equations()[2].to_string(), "i = g * m^3 * h * (v - e)");

        let leak = channel_component(&leak()).unwrap();
        assert_eq!(leak.equations().len(), 1);
    }

    #[test]
    fn test_hh_structure() {
        let hh = hodgkin_huxley("AB").unwrap();
        let children: Vec<&str> = hh.children().iter().map(|c| c.name()).collect();
        assert_eq!(children, vec!["soma", "na", "k", "leak"]);
        assert_eq!(hh.port(PortRole::V), Some("soma.v"));
        assert_eq!(hh.port(PortRole::I), Some("soma.i"));
        assert!(hh.port(PortRole::Ca).is_none());
        let currents: Vec<&str> = hh.contributions(PortRole::I).collect();
        assert_eq!(currents, vec!["na.i", "k.i", "leak.i"]);
    }

    #[test]
    fn test_hh_flattens_with_voltage_first() {
        let mut arena = VariableArena::new();
        let flat = hodgkin_huxley("AB").unwrap().flatten(&mut arena).unwrap();
        let v = flat.port(PortRole::V).unwrap();
        assert_eq!(v.0, 0);
        assert_eq!(arena.name(v), "AB.soma.v");
        assert_eq!(flat.aliases.len(), 3);
        assert_eq!(flat.contributions[&PortRole::I].len(), 3);
        let states = flat
            .equations
            .iter()
            .filter(|eq| eq.kind == EquationKind::Differential)
            .count();
        assert_eq!(states, 4);
        assert!(arena.iter().any(|var| var.name == "AB.na.g" && var.kind == VarKind::Parameter));
    }

    #[test]
    fn test_bursting_calcium_port() {
        let cell = bursting("PD").unwrap();
        assert_eq!(cell.port(PortRole::Ca), Some("soma.i_ca"));
        let calcium: Vec<&str> = cell.contributions(PortRole::Ca).collect();
        assert_eq!(calcium, vec!["cat.i"]);
        assert_eq!(cell.contributions(PortRole::I).count(), 4);
    }

    #[test]
    fn test_calcium_channel_needs_pool() {
        let err = neuron("X", soma(&SomaParams::default()).unwrap(), &[calcium_t(1.0)]);
        assert!(err.is_err());
    }

    #[test]
    fn test_clamp() {
        let clamp = voltage_clamp("VC", -40.0).unwrap();
        assert!(clamp.is_leaf());
        assert_eq!(clamp.parameters()["v_hold"], -40.0);
        assert_eq!(clamp.port(PortRole::I), Some("i"));
    }

    #[test]
    fn test_sodium_gates_start_near_steady_state() {
        let mut arena = VariableArena::new();
        let flat = channel_component(&sodium()).unwrap().flatten(&mut arena).unwrap();
        let lookup = |id| arena.get(id).value;
        for eq in flat.equations.iter().filter(|eq| eq.kind == EquationKind::Differential) {
            let rate = eq.rhs.eval(&lookup);
            assert!(rate.abs() < 1e-3, "{} -> {}", eq.render(&arena), rate);
        }
    }

    #[test]
    fn test_model_selector() {
        let model: NeuronModel = serde_json::from_str("\"bursting\"").unwrap();
        assert_eq!(model, NeuronModel::Bursting);
        assert_eq!(model.build("N").unwrap().children().len(), 5);
        assert!(NeuronModel::Clamp.build("C").unwrap().is_leaf());
    }
}
