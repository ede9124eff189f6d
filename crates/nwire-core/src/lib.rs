//! # nwire Core
//!
//! Shared types for assembling conductance-based neuron networks into one
//! reduced differential-algebraic system.
//!
//! ## Contents
//!
//! | Area | Types |
//! |------|-------|
//! | Variables | [`Domain`], [`VarId`], [`Variable`], [`VariableArena`] |
//! | Expressions | [`Expr`], [`Equation`], [`FlatEquation`] |
//! | Reduction | [`EquationSystem`], [`EquationSystemReducer`] |
//! | Channels | [`RateFunction`], [`GateVariable`], [`IonChannel`] |
//! | Integrator boundary | [`OdeSystem`], [`TimeSeries`] |
//!
//! ## Design Philosophy
//!
//! 1. Variables are arena entries with stable ids, never re-resolved by name
//! 2. Every fallible step returns [`Result`] with a classified [`NwireError`]
//! 3. Equal inputs always produce equal outputs (ordering included)

mod expr;
mod system;

pub use expr::{BinaryOp, Equation, EquationKind, Expr, ExprDisplay, FlatEquation, Function};
pub use system::{Elimination, EliminationMode, EquationSystem, EquationSystemReducer, UnionFind};

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// ERRORS
// =============================================================================

/// Error category, mirroring where in the pipeline an error can arise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Raised while building components
    Definition,
    /// Raised while resolving a connectivity specification
    Specification,
    /// Raised by the structural reducer
    Structural,
    /// Internal defect; never caused by user input alone
    Invariant,
}

/// Common errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NwireError {
    #[error("Malformed component {component}: {reason}")]
    MalformedComponent { component: String, reason: String },

    #[error("Port mismatch in {component}: {child} has no port {role}")]
    PortMismatch {
        component: String,
        child: String,
        role: String,
    },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unknown neuron: {0}")]
    UnknownNeuron(String),

    #[error("Synapse {synapse} is missing parameter {parameter}")]
    MissingSynapseParameter { synapse: String, parameter: String },

    #[error("Synapse {synapse} has invalid weight {weight} (must be positive)")]
    InvalidWeight { synapse: String, weight: f64 },

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error(
        "Underdetermined system: {unknowns} unknowns, {equations} equations (undefined: {undefined:?})"
    )]
    UnderdeterminedSystem {
        unknowns: usize,
        equations: usize,
        undefined: Vec<String>,
    },

    #[error(
        "Overdetermined system: {unknowns} unknowns, {equations} equations (conflicting: {conflicting:?})"
    )]
    OverdeterminedSystem {
        unknowns: usize,
        equations: usize,
        conflicting: Vec<String>,
    },

    #[error("Algebraic loop through {variables:?}")]
    AlgebraicLoop { variables: Vec<String> },

    #[error("Network graph has not been reduced")]
    NotAssembled,

    #[error("No canonical voltage found for neuron {0}")]
    NoVoltageFound(String),

    #[error("Trajectory shape mismatch: expected {expected}, got {got}")]
    TrajectoryShape { expected: usize, got: usize },
}

impl NwireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedComponent { .. } | Self::PortMismatch { .. } | Self::ParseError(_) => {
                ErrorKind::Definition
            }
            Self::UnknownNeuron(_)
            | Self::MissingSynapseParameter { .. }
            | Self::InvalidWeight { .. }
            | Self::UnknownVariable(_) => ErrorKind::Specification,
            Self::UnderdeterminedSystem { .. }
            | Self::OverdeterminedSystem { .. }
            | Self::AlgebraicLoop { .. } => ErrorKind::Structural,
            Self::NotAssembled | Self::NoVoltageFound(_) | Self::TrajectoryShape { .. } => {
                ErrorKind::Invariant
            }
        }
    }

    /// Difference between unknowns and equations for structural errors.
    pub fn imbalance(&self) -> Option<usize> {
        match self {
            Self::UnderdeterminedSystem {
                unknowns,
                equations,
                ..
            }
            | Self::OverdeterminedSystem {
                unknowns,
                equations,
                ..
            } => Some(unknowns.abs_diff(*equations)),
            _ => None,
        }
    }

    pub fn malformed(component: &str, reason: impl Into<String>) -> Self {
        Self::MalformedComponent {
            component: component.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NwireError>;

// =============================================================================
// UNITS
// =============================================================================

/// Time point (ms)
pub type Time = f64;

/// Voltage (mV)
pub type Voltage = f64;

/// Current (nA)
pub type Current = f64;

/// Conductance (mS/cm^2)
pub type Conductance = f64;

/// Concentration (uM)
pub type Concentration = f64;

/// State vector for ODE systems
pub type StateVector = Array1<f64>;

// =============================================================================
// VARIABLES
// =============================================================================

/// Physical domain of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    Voltage,
    Current,
    /// Gating or activation fraction in [0, 1]
    Gating,
    Concentration,
    CalciumFlux,
    Conductance,
    Dimensionless,
}

/// Stable index of a variable inside a [`VariableArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarId(pub u32);

impl VarId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Whether an arena entry is solved for or held fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarKind {
    Unknown,
    Parameter,
}

/// Arena entry: a fully qualified variable or parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub id: VarId,
    /// Qualified name, e.g. `AB.soma.v`
    pub name: String,
    pub domain: Domain,
    pub kind: VarKind,
    /// Declared default for unknowns, fixed value for parameters
    pub value: f64,
}

impl Variable {
    pub fn is_parameter(&self) -> bool {
        self.kind == VarKind::Parameter
    }
}

/// Owner of every variable in an assembled system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableArena {
    vars: Vec<Variable>,
}

impl VariableArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: String, domain: Domain, kind: VarKind, value: f64) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(Variable {
            id,
            name,
            domain,
            kind,
            value,
        });
        id
    }

    /// Panics if `id` was not issued by this arena.
    pub fn get(&self, id: VarId) -> &Variable {
        &self.vars[id.index()]
    }

    pub fn try_get(&self, id: VarId) -> Option<&Variable> {
        self.vars.get(id.index())
    }

    pub fn name(&self, id: VarId) -> &str {
        &self.get(id).name
    }

    /// Linear lookup by qualified name.
    pub fn find(&self, name: &str) -> Option<VarId> {
        self.vars.iter().find(|v| v.name == name).map(|v| v.id)
    }

    pub fn ids(&self) -> impl Iterator<Item = VarId> + '_ {
        self.vars.iter().map(|v| v.id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Variable> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

// =============================================================================
// INTEGRATOR BOUNDARY
// =============================================================================

/// Time series data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Time points
    pub time: Vec<Time>,
    /// Values at each time point
    pub values: Vec<f64>,
    /// Variable name
    pub name: String,
    /// Units
    pub units: Option<String>,
}

impl TimeSeries {
    pub fn new(name: &str) -> Self {
        Self {
            time: Vec::new(),
            values: Vec::new(),
            name: name.to_string(),
            units: None,
        }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn push(&mut self, t: Time, v: f64) {
        self.time.push(t);
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// ODE system trait (consumed by external integrators)
pub trait OdeSystem {
    /// System dimension
    fn dimension(&self) -> usize;

    /// Compute derivatives: dy/dt = f(t, y)
    fn derivatives(&self, t: Time, y: &StateVector) -> StateVector;

    /// Optional Jacobian for stiff systems
    fn jacobian(&self, _t: Time, _y: &StateVector) -> Option<Array2<f64>> {
        None
    }
}

// =============================================================================
// ION CHANNEL DESCRIPTIONS
// =============================================================================

/// Voltage-dependent rate or steady-state function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RateFunction {
    /// Standard HH form: A*(V+B)/(exp((V+B)/C)-1)
    HodgkinHuxley { a: f64, b: f64, c: f64 },
    /// Exponential: A*exp((V+B)/C)
    Exponential { a: f64, b: f64, c: f64 },
    /// Sigmoid: A/(1+exp((V+B)/C))
    Sigmoid { a: f64, b: f64, c: f64 },
    /// Linear: A*(V+B)
    Linear { a: f64, b: f64 },
    /// Constant
    Constant(f64),
}

impl RateFunction {
    /// Evaluate rate at given voltage
    pub fn eval(&self, v: Voltage) -> f64 {
        match self {
            Self::HodgkinHuxley { a, b, c } => {
                let x = (v + b) / c;
                if x.abs() < 1e-6 {
                    // L'Hopital's rule for x -> 0
                    a * c
                } else {
                    a * (v + b) / (x.exp() - 1.0)
                }
            }
            Self::Exponential { a, b, c } => a * ((v + b) / c).exp(),
            Self::Sigmoid { a, b, c } => a / (1.0 + ((v + b) / c).exp()),
            Self::Linear { a, b } => a * (v + b),
            Self::Constant(c) => *c,
        }
    }

    /// Symbolic form in terms of the voltage expression `v`.
    ///
    /// The removable singularity of the HH form is not special-cased here;
    /// integrators only land on it with probability zero.
    pub fn to_expr(&self, v: &Expr) -> Expr {
        let shifted = |b: f64| v.clone() + Expr::from(b);
        match self {
            Self::HodgkinHuxley { a, b, c } => {
                Expr::from(*a) * shifted(*b)
                    / ((shifted(*b) / Expr::from(*c)).exp() - Expr::from(1.0))
            }
            Self::Exponential { a, b, c } => Expr::from(*a) * (shifted(*b) / Expr::from(*c)).exp(),
            Self::Sigmoid { a, b, c } => {
                Expr::from(*a) / (Expr::from(1.0) + (shifted(*b) / Expr::from(*c)).exp())
            }
            Self::Linear { a, b } => Expr::from(*a) * shifted(*b),
            Self::Constant(c) => Expr::from(*c),
        }
    }
}

/// Gate kinetics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GateKinetics {
    /// dx/dt = alpha(V)(1 - x) - beta(V) x
    AlphaBeta {
        alpha: RateFunction,
        beta: RateFunction,
    },
    /// dx/dt = (x_inf(V) - x) / (tau_base + tau(V))
    SteadyState {
        inf: RateFunction,
        tau_base: f64,
        tau: RateFunction,
    },
}

/// Gate variable (e.g., m, h, n in Hodgkin-Huxley)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVariable {
    /// Variable name
    pub name: String,
    /// Power (exponent in gating)
    pub power: u32,
    /// Initial gate value
    pub initial: f64,
    pub kinetics: GateKinetics,
}

impl GateVariable {
    /// Right-hand side of the gate's differential equation.
    pub fn derivative(&self, v: &Expr) -> Expr {
        let x = Expr::sym(&self.name);
        match &self.kinetics {
            GateKinetics::AlphaBeta { alpha, beta } => {
                alpha.to_expr(v) * (Expr::from(1.0) - x.clone()) - beta.to_expr(v) * x
            }
            GateKinetics::SteadyState { inf, tau_base, tau } => {
                (inf.to_expr(v) - x) / (Expr::from(*tau_base) + tau.to_expr(v))
            }
        }
    }
}

/// Ion channel model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IonChannel {
    /// Channel name
    pub name: String,
    /// Maximum conductance (mS/cm^2)
    pub g_max: Conductance,
    /// Reversal potential (mV)
    pub e_rev: Voltage,
    /// Gate variables
    pub gates: Vec<GateVariable>,
    /// Whether the channel current is a calcium current
    pub carries_calcium: bool,
}

impl IonChannel {
    /// Current expression `g * prod(gate^power) * (v - e)` over local symbols.
    pub fn current(&self) -> Expr {
        let mut conductance = Expr::sym("g");
        for gate in &self.gates {
            let x = Expr::sym(&gate.name);
            conductance = if gate.power == 1 {
                conductance * x
            } else {
                conductance * x.pow(Expr::from(gate.power as f64))
            };
        }
        conductance * (Expr::sym("v") - Expr::sym("e"))
    }
}
