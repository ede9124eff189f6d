//! # nwire Components
//!
//! Uniform representation of neurons, channels and synapses.
//!
//! A [`Component`] is an immutable bundle of state variables, parameters,
//! equations and typed ports. Leaves are built with [`make_component`];
//! neurons are composed from a soma and channels with [`compose_component`],
//! whose [`PortBinding`]s export child ports, join them, or declare them as
//! contributions to a summing port (injected current, calcium flux).
//!
//! ## Example
//!
//! ```
//! use nwire_components::models;
//!
//! let neuron = models::hodgkin_huxley("AB").unwrap();
//! assert_eq!(neuron.children().len(), 4);
//! assert!(neuron.port(nwire_components::PortRole::V).is_some());
//! ```

pub mod models;
mod synapse;

pub use synapse::{
    instantiate_synapse, put_synapse, ChemicalParams, ElectricalParams, Overrides, SynapseKind,
    SynapseSpec, DEFAULT_STEEPNESS, DEFAULT_THRESHOLD,
};

use nwire_core::{
    Domain, Equation, EquationKind, Expr, FlatEquation, NwireError, Result, VarId, VarKind,
    VariableArena,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

// =============================================================================
// PORTS
// =============================================================================

/// Role of a port variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    /// Membrane voltage
    V,
    /// Injected current (summing)
    I,
    /// Calcium flux (summing)
    Ca,
    /// Presynaptic voltage
    Pre,
    /// Postsynaptic voltage
    Post,
    /// Current returned to the presynaptic neuron (electrical synapses)
    IPre,
}

impl PortRole {
    /// Summing ports collect contributions into a balance equation.
    pub fn is_summing(&self) -> bool {
        matches!(self, Self::I | Self::Ca)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V => "v",
            Self::I => "i",
            Self::Ca => "ca",
            Self::Pre => "pre",
            Self::Post => "post",
            Self::IPre => "i_pre",
        }
    }
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a child port is wired to inside a composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PortTarget {
    /// Expose the child port as a parent port
    Export(PortRole),
    /// Alias the child port with another child's port
    Join { child: String, role: PortRole },
    /// Add the child port to a parent summing port
    Contribute(PortRole),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortBinding {
    pub child: String,
    pub role: PortRole,
    pub target: PortTarget,
}

impl PortBinding {
    pub fn export(child: &str, role: PortRole, as_role: PortRole) -> Self {
        Self {
            child: child.to_string(),
            role,
            target: PortTarget::Export(as_role),
        }
    }

    pub fn join(child: &str, role: PortRole, other: &str, other_role: PortRole) -> Self {
        Self {
            child: child.to_string(),
            role,
            target: PortTarget::Join {
                child: other.to_string(),
                role: other_role,
            },
        }
    }

    pub fn contribute(child: &str, role: PortRole, to: PortRole) -> Self {
        Self {
            child: child.to_string(),
            role,
            target: PortTarget::Contribute(to),
        }
    }
}

// =============================================================================
// COMPONENT
// =============================================================================

/// Declared state variable of a component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVar {
    pub name: String,
    pub domain: Domain,
    /// Declared default (initial value)
    pub default: f64,
}

impl StateVar {
    pub fn new(name: &str, domain: Domain, default: f64) -> Self {
        Self {
            name: name.to_string(),
            domain,
            default,
        }
    }
}

/// Neuron, channel or synapse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    name: String,
    state_vars: Vec<StateVar>,
    parameters: BTreeMap<String, f64>,
    equations: Vec<Equation>,
    /// Role -> local name or child path
    ports: BTreeMap<PortRole, String>,
    children: Vec<Component>,
    /// Joined child port paths
    aliases: Vec<(String, String)>,
    /// Summing role -> contributing child port paths
    contributions: Vec<(PortRole, String)>,
}

/// Build a leaf component.
pub fn make_component(
    name: &str,
    state_vars: Vec<StateVar>,
    parameters: &[(&str, f64)],
    equations: Vec<Equation>,
    ports: &[(PortRole, &str)],
) -> Result<Component> {
    check_name(name, name)?;
    let mut seen: BTreeMap<&str, ()> = BTreeMap::new();
    for var in &state_vars {
        check_name(name, &var.name)?;
        if seen.insert(var.name.as_str(), ()).is_some() {
            return Err(NwireError::malformed(
                name,
                format!("variable '{}' declared twice", var.name),
            ));
        }
    }
    let mut params = BTreeMap::new();
    for (p, value) in parameters {
        check_name(name, p)?;
        if seen.insert(p, ()).is_some() {
            return Err(NwireError::malformed(
                name,
                format!("parameter '{}' clashes with another declaration", p),
            ));
        }
        params.insert(p.to_string(), *value);
    }

    let mut port_map = BTreeMap::new();
    for (role, var) in ports {
        if !state_vars.iter().any(|v| v.name == *var) {
            return Err(NwireError::malformed(
                name,
                format!("port {} refers to unknown variable '{}'", role, var),
            ));
        }
        if port_map.insert(*role, var.to_string()).is_some() {
            return Err(NwireError::malformed(name, format!("port {} bound twice", role)));
        }
    }

    let component = Component {
        name: name.to_string(),
        state_vars,
        parameters: params,
        equations,
        ports: port_map,
        children: Vec::new(),
        aliases: Vec::new(),
        contributions: Vec::new(),
    };
    component.check_equations()?;
    Ok(component)
}

/// Build a composite from children and port wiring.
pub fn compose_component(
    name: &str,
    children: Vec<Component>,
    extra_equations: Vec<Equation>,
    wiring: Vec<PortBinding>,
) -> Result<Component> {
    check_name(name, name)?;
    for (i, child) in children.iter().enumerate() {
        if children[..i].iter().any(|c| c.name == child.name) {
            return Err(NwireError::malformed(
                name,
                format!("two children named '{}'", child.name),
            ));
        }
    }

    let child_port = |child: &str, role: PortRole| -> Result<String> {
        let found = children.iter().find(|c| c.name == child);
        match found.and_then(|c| c.port(role)) {
            Some(path) => Ok(format!("{}.{}", child, path)),
            None => Err(NwireError::PortMismatch {
                component: name.to_string(),
                child: child.to_string(),
                role: role.to_string(),
            }),
        }
    };

    let mut ports = BTreeMap::new();
    let mut aliases = Vec::new();
    let mut contributions = Vec::new();
    for binding in &wiring {
        let path = child_port(&binding.child, binding.role)?;
        match &binding.target {
            PortTarget::Export(as_role) => {
                if ports.insert(*as_role, path).is_some() {
                    return Err(NwireError::malformed(
                        name,
                        format!("port {} exported twice", as_role),
                    ));
                }
            }
            PortTarget::Join { child, role } => {
                aliases.push((path, child_port(child, *role)?));
            }
            PortTarget::Contribute(to) => {
                if !to.is_summing() {
                    return Err(NwireError::malformed(
                        name,
                        format!("port {} does not accept contributions", to),
                    ));
                }
                contributions.push((*to, path));
            }
        }
    }
    if let Some((role, _)) = contributions.iter().find(|(r, _)| !ports.contains_key(r)) {
        return Err(NwireError::malformed(
            name,
            format!("contributions to port {} which is not exported", role),
        ));
    }

    let component = Component {
        name: name.to_string(),
        state_vars: Vec::new(),
        parameters: BTreeMap::new(),
        equations: extra_equations,
        ports,
        children,
        aliases,
        contributions,
    };
    component.check_equations()?;
    Ok(component)
}

fn check_name(component: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(NwireError::malformed(
            component,
            format!("'{}' is not a valid identifier", name),
        ))
    }
}

impl Component {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state_vars(&self) -> &[StateVar] {
        &self.state_vars
    }

    pub fn parameters(&self) -> &BTreeMap<String, f64> {
        &self.parameters
    }

    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    pub fn ports(&self) -> &BTreeMap<PortRole, String> {
        &self.ports
    }

    pub fn port(&self, role: PortRole) -> Option<&str> {
        self.ports.get(&role).map(String::as_str)
    }

    pub fn children(&self) -> &[Component] {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<&Component> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Contributing paths for a summing role, in wiring order.
    pub fn contributions(&self, role: PortRole) -> impl Iterator<Item = &str> + '_ {
        self.contributions
            .iter()
            .filter(move |(r, _)| *r == role)
            .map(|(_, p)| p.as_str())
    }

    /// Copy with one parameter replaced; `path` may descend into children
    /// (`soma.i_app`).
    pub fn with_parameter(&self, path: &str, value: f64) -> Result<Component> {
        let mut out = self.clone();
        out.set_parameter(path, value)
            .map_err(|reason| NwireError::malformed(&self.name, reason))?;
        Ok(out)
    }

    fn set_parameter(&mut self, path: &str, value: f64) -> std::result::Result<(), String> {
        if let Some(slot) = self.parameters.get_mut(path) {
            *slot = value;
            return Ok(());
        }
        let (head, rest) = path
            .split_once('.')
            .ok_or_else(|| format!("no parameter '{}'", path))?;
        let child = self
            .children
            .iter_mut()
            .find(|c| c.name == head)
            .ok_or_else(|| format!("no child '{}'", head))?;
        child.set_parameter(rest, value)
    }

    /// Names visible to this component's equations: `(path, is_parameter)`.
    fn scope(&self) -> Vec<(String, bool)> {
        let mut out: Vec<(String, bool)> = self
            .state_vars
            .iter()
            .map(|v| (v.name.clone(), false))
            .chain(self.parameters.keys().map(|p| (p.clone(), true)))
            .collect();
        for child in &self.children {
            out.extend(
                child
                    .scope()
                    .into_iter()
                    .map(|(p, is_param)| (format!("{}.{}", child.name, p), is_param)),
            );
        }
        out
    }

    fn check_equations(&self) -> Result<()> {
        let scope: HashMap<String, bool> = self.scope().into_iter().collect();
        for eq in &self.equations {
            match scope.get(&eq.lhs) {
                Some(false) => {}
                Some(true) => {
                    return Err(NwireError::malformed(
                        &self.name,
                        format!("equation assigns to parameter '{}'", eq.lhs),
                    ))
                }
                None => {
                    return Err(NwireError::malformed(
                        &self.name,
                        format!("equation for unknown variable '{}'", eq.lhs),
                    ))
                }
            }
            if let Some(missing) = eq.rhs.symbols().into_iter().find(|s| !scope.contains_key(*s)) {
                return Err(NwireError::malformed(
                    &self.name,
                    format!("'{}' references unknown name '{}'", eq, missing),
                ));
            }
        }
        Ok(())
    }

    // =========================================================================
    // FLATTENING
    // =========================================================================

    /// Register every variable and parameter in `arena` under the component's
    /// name and resolve all equations, aliases, ports and contributions.
    ///
    /// Ids are issued in declaration order: own variables, own parameters,
    /// then children depth-first. Contributions of nested composites are
    /// closed with a balance equation here; the top level keeps them open for
    /// the network resolver.
    pub fn flatten(&self, arena: &mut VariableArena) -> Result<FlatComponent> {
        let first = arena.len();
        let mut out = FlatComponent {
            name: self.name.clone(),
            variables: Vec::new(),
            equations: Vec::new(),
            aliases: Vec::new(),
            ports: BTreeMap::new(),
            contributions: BTreeMap::new(),
        };
        let scope = self.flatten_into(&self.name, arena, &mut out, true)?;
        out.variables = (first..arena.len()).map(|i| VarId(i as u32)).collect();
        if scope.len() != out.variables.len() {
            return Err(NwireError::malformed(
                &self.name,
                "duplicate names in component tree",
            ));
        }
        debug!(
            component = %self.name,
            variables = out.variables.len(),
            equations = out.equations.len(),
            "flattened component"
        );
        Ok(out)
    }

    fn flatten_into(
        &self,
        prefix: &str,
        arena: &mut VariableArena,
        out: &mut FlatComponent,
        top: bool,
    ) -> Result<HashMap<String, VarId>> {
        let mut scope = HashMap::new();
        for var in &self.state_vars {
            let id = arena.push(
                format!("{}.{}", prefix, var.name),
                var.domain,
                VarKind::Unknown,
                var.default,
            );
            scope.insert(var.name.clone(), id);
        }
        for (name, value) in &self.parameters {
            let id = arena.push(
                format!("{}.{}", prefix, name),
                Domain::Dimensionless,
                VarKind::Parameter,
                *value,
            );
            scope.insert(name.clone(), id);
        }
        for child in &self.children {
            let child_scope =
                child.flatten_into(&format!("{}.{}", prefix, child.name), arena, out, false)?;
            for (path, id) in child_scope {
                scope.insert(format!("{}.{}", child.name, path), id);
            }
        }

        let lookup = |path: &str| -> Result<VarId> {
            scope.get(path).copied().ok_or_else(|| {
                NwireError::malformed(&self.name, format!("unresolved name '{}'", path))
            })
        };

        for eq in &self.equations {
            let lhs = lookup(&eq.lhs)?;
            let rhs = eq
                .rhs
                .resolve(|s| scope.get(s).copied())
                .map_err(|s| NwireError::malformed(&self.name, format!("unresolved name '{}'", s)))?;
            out.equations.push(FlatEquation {
                kind: eq.kind,
                lhs,
                rhs,
            });
        }
        for (a, b) in &self.aliases {
            out.aliases.push((lookup(a)?, lookup(b)?));
        }

        let mut sums: BTreeMap<PortRole, Vec<VarId>> = BTreeMap::new();
        for (role, path) in &self.contributions {
            sums.entry(*role).or_default().push(lookup(path)?);
        }
        if top {
            for (role, path) in &self.ports {
                out.ports.insert(*role, lookup(path)?);
            }
            out.contributions = sums;
        } else {
            for (role, terms) in sums {
                let target = lookup(self.ports.get(&role).map(String::as_str).unwrap_or_default())?;
                out.equations.push(FlatEquation {
                    kind: EquationKind::Algebraic,
                    lhs: target,
                    rhs: Expr::Sum(terms.into_iter().map(Expr::Var).collect()),
                });
            }
        }
        Ok(scope)
    }
}

/// A component resolved against an arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatComponent {
    pub name: String,
    /// Every arena id issued for this component, in issue order
    pub variables: Vec<VarId>,
    pub equations: Vec<FlatEquation>,
    pub aliases: Vec<(VarId, VarId)>,
    pub ports: BTreeMap<PortRole, VarId>,
    /// Open summing-port contributions (top level only)
    pub contributions: BTreeMap<PortRole, Vec<VarId>>,
}

impl FlatComponent {
    pub fn port(&self, role: PortRole) -> Option<VarId> {
        self.ports.get(&role).copied()
    }
}
