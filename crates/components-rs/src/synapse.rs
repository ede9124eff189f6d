//! Synapse factory.
//!
//! Chemical synapses use a first-order activation driven by a sigmoid of the
//! presynaptic voltage; electrical synapses are voltage-dependent gap
//! junctions that return current to both endpoints.

use crate::{make_component, Component, PortRole, StateVar};
use nwire_core::{Domain, Equation, Expr, NwireError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Activation threshold shared by the chemical presets (mV)
pub const DEFAULT_THRESHOLD: f64 = -35.0;

/// Activation steepness shared by the chemical presets (mV)
pub const DEFAULT_STEEPNESS: f64 = 5.0;

/// Per-synapse parameter overrides
pub type Overrides = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SynapseKind {
    #[serde(alias = "exc")]
    Exc,
    #[serde(alias = "inh")]
    Inh,
    #[serde(alias = "chol")]
    Chol,
    #[serde(alias = "glut")]
    Glut,
    #[serde(alias = "custom")]
    Custom,
    #[serde(alias = "electrical")]
    Electrical,
}

impl SynapseKind {
    pub const ALL: [SynapseKind; 6] = [
        Self::Exc,
        Self::Inh,
        Self::Chol,
        Self::Glut,
        Self::Custom,
        Self::Electrical,
    ];

    /// Lowercase tag used in default synapse names.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Exc => "exc",
            Self::Inh => "inh",
            Self::Chol => "chol",
            Self::Glut => "glut",
            Self::Custom => "custom",
            Self::Electrical => "electrical",
        }
    }
}

impl fmt::Display for SynapseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Chemical synapse biophysics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChemicalParams {
    /// Reversal potential (mV)
    pub e_rev: f64,
    /// Kinetic rate
    pub k: f64,
    /// Activation steepness (mV)
    pub delta: f64,
    /// Activation threshold (mV)
    pub v_th: f64,
}

impl ChemicalParams {
    pub const KEYS: [&'static str; 4] = ["e_rev", "v_th", "delta", "k"];

    /// Preset row for a tabulated kind; `None` for `Custom` and `Electrical`.
    pub fn preset(kind: SynapseKind) -> Option<Self> {
        let (e_rev, k) = match kind {
            SynapseKind::Exc => (0.0, 0.025),
            SynapseKind::Inh => (-70.0, 0.01),
            SynapseKind::Chol => (-80.0, 0.01),
            SynapseKind::Glut => (-70.0, 0.025),
            SynapseKind::Custom | SynapseKind::Electrical => return None,
        };
        Some(Self {
            e_rev,
            k,
            delta: DEFAULT_STEEPNESS,
            v_th: DEFAULT_THRESHOLD,
        })
    }
}

/// Gap junction shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElectricalParams {
    /// Voltage difference at which conductance has decayed by 1/e (mV)
    pub v_half: f64,
    /// Conductance floor as a fraction of the weight
    pub g_min: f64,
}

impl Default for ElectricalParams {
    fn default() -> Self {
        Self {
            v_half: 20.0,
            g_min: 0.25,
        }
    }
}

/// One synapse descriptor of a connectivity entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynapseSpec {
    #[serde(rename = "type")]
    pub kind: SynapseKind,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: Overrides,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl SynapseSpec {
    pub fn new(kind: SynapseKind, weight: f64) -> Self {
        Self {
            kind,
            weight,
            overrides: Overrides::new(),
            name: None,
        }
    }

    pub fn with_override(mut self, key: &str, value: f64) -> Self {
        self.overrides.insert(key.to_string(), value);
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// Build a synapse component of the given kind.
pub fn instantiate_synapse(
    kind: SynapseKind,
    weight: f64,
    overrides: &Overrides,
    name: &str,
) -> Result<Component> {
    if !weight.is_finite() || weight <= 0.0 {
        return Err(NwireError::InvalidWeight {
            synapse: name.to_string(),
            weight,
        });
    }
    match kind {
        SynapseKind::Electrical => {
            let mut params = ElectricalParams::default();
            apply_overrides(name, overrides, &mut params)?;
            electrical(name, weight, params)
        }
        _ => {
            let mut params = match ChemicalParams::preset(kind) {
                Some(params) => params,
                None => {
                    if let Some(missing) = ChemicalParams::KEYS
                        .iter()
                        .find(|key| !overrides.contains_key(**key))
                    {
                        return Err(NwireError::MissingSynapseParameter {
                            synapse: name.to_string(),
                            parameter: missing.to_string(),
                        });
                    }
                    ChemicalParams {
                        e_rev: 0.0,
                        k: 0.0,
                        delta: 0.0,
                        v_th: 0.0,
                    }
                }
            };
            apply_overrides(name, overrides, &mut params)?;
            chemical(name, weight, params)
        }
    }
}

/// Build a synapse named after its endpoints (`{pre}_{post}_{type}`).
pub fn put_synapse(
    pre: &str,
    post: &str,
    kind: SynapseKind,
    weight: f64,
    overrides: Option<&Overrides>,
) -> Result<Component> {
    let empty = Overrides::new();
    let name = format!("{}_{}_{}", pre, post, kind.tag());
    instantiate_synapse(kind, weight, overrides.unwrap_or(&empty), &name)
}

/// Parameter sets that accept named overrides.
trait Tunable {
    fn slot(&mut self, key: &str) -> Option<&mut f64>;
}

impl Tunable for ChemicalParams {
    fn slot(&mut self, key: &str) -> Option<&mut f64> {
        match key {
            "e_rev" => Some(&mut self.e_rev),
            "k" => Some(&mut self.k),
            "delta" => Some(&mut self.delta),
            "v_th" => Some(&mut self.v_th),
            _ => None,
        }
    }
}

impl Tunable for ElectricalParams {
    fn slot(&mut self, key: &str) -> Option<&mut f64> {
        match key {
            "v_half" => Some(&mut self.v_half),
            "g_min" => Some(&mut self.g_min),
            _ => None,
        }
    }
}

fn apply_overrides<T: Tunable>(name: &str, overrides: &Overrides, params: &mut T) -> Result<()> {
    for (key, value) in overrides {
        match params.slot(key) {
            Some(target) => *target = *value,
            None => {
                return Err(NwireError::malformed(
                    name,
                    format!("unknown synapse parameter '{}'", key),
                ))
            }
        }
    }
    Ok(())
}

fn chemical(name: &str, weight: f64, p: ChemicalParams) -> Result<Component> {
    let equations = Equation::parse_block(
        "s_inf = 1 / (1 + exp((v_th - v_pre) / delta))
         ds/dt = k * (s_inf - s) / (1 - s_inf)
         i = w * s * (v_post - e_rev)",
    )?;
    make_component(
        name,
        vec![
            StateVar::new("v_pre", Domain::Voltage, -65.0),
            StateVar::new("v_post", Domain::Voltage, -65.0),
            StateVar::new("s", Domain::Gating, 0.0),
            StateVar::new("s_inf", Domain::Gating, 0.0),
            StateVar::new("i", Domain::Current, 0.0),
        ],
        &[
            ("w", weight),
            ("e_rev", p.e_rev),
            ("k", p.k),
            ("delta", p.delta),
            ("v_th", p.v_th),
        ],
        equations,
        &[
            (PortRole::Pre, "v_pre"),
            (PortRole::Post, "v_post"),
            (PortRole::I, "i"),
        ],
    )
}

fn electrical(name: &str, weight: f64, p: ElectricalParams) -> Result<Component> {
    let dv = (Expr::sym("v_pre") - Expr::sym("v_post")) / Expr::sym("v_half");
    let shape = (-dv.pow(Expr::from(2.0))).exp();
    let g = Expr::sym("w")
        * (Expr::sym("g_min") + (Expr::from(1.0) - Expr::sym("g_min")) * shape);
    let equations = vec![
        Equation::algebraic("g", g),
        Equation::parse("i = g * (v_post - v_pre)")?,
        Equation::parse("i_pre = -i")?,
    ];
    make_component(
        name,
        vec![
            StateVar::new("v_pre", Domain::Voltage, -65.0),
            StateVar::new("v_post", Domain::Voltage, -65.0),
            StateVar::new("g", Domain::Conductance, weight),
            StateVar::new("i", Domain::Current, 0.0),
            StateVar::new("i_pre", Domain::Current, 0.0),
        ],
        &[("w", weight), ("v_half", p.v_half), ("g_min", p.g_min)],
        equations,
        &[
            (PortRole::Pre, "v_pre"),
            (PortRole::Post, "v_post"),
            (PortRole::I, "i"),
            (PortRole::IPre, "i_pre"),
        ],
    )
}
