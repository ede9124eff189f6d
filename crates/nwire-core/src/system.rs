//! Equation system reducer.
//!
//! Collapses alias equations into canonical variables, checks that every
//! unknown is defined exactly once, and eliminates algebraic variables by
//! substitution. The network crate layers its reduction strategies on top of
//! [`EquationSystemReducer::eliminate`].

use crate::{
    EquationKind, Expr, FlatEquation, NwireError, Result, VarId, VarKind, VariableArena,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

// =============================================================================
// UNION-FIND
// =============================================================================

/// Union-find over variable ids whose representative is always the lowest id
/// of its class, so the outcome does not depend on union order.
#[derive(Debug, Clone, Default)]
pub struct UnionFind {
    parent: HashMap<VarId, VarId>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&mut self, x: VarId) -> VarId {
        let mut root = x;
        while let Some(&p) = self.parent.get(&root) {
            if p == root {
                break;
            }
            root = p;
        }
        // Path compression
        let mut cur = x;
        while cur != root {
            let next = self.parent.get(&cur).copied().unwrap_or(root);
            self.parent.insert(cur, root);
            cur = next;
        }
        root
    }

    pub fn union(&mut self, a: VarId, b: VarId) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent.insert(child, root);
        self.parent.entry(root).or_insert(root);
    }
}

// =============================================================================
// SYSTEM
// =============================================================================

/// Input to the reducer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EquationSystem {
    /// Variables in scope; parameters among them are ignored when counting
    pub variables: Vec<VarId>,
    pub equations: Vec<FlatEquation>,
    /// Explicit `a == b` couplings
    pub aliases: Vec<(VarId, VarId)>,
    /// Definitions eliminated by an earlier pass; substituted, never counted
    pub observed: Vec<FlatEquation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EliminationMode {
    /// Whole-system pass: every unknown class must be defined exactly once
    Global,
    /// Partial pass: classes containing a protected variable are left alone
    Local { protected: BTreeSet<VarId> },
}

/// Output of one elimination pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Elimination {
    /// One differential equation per state, sorted by state id
    pub differential: Vec<FlatEquation>,
    /// Algebraic equations kept because their class is protected
    pub algebraic: Vec<FlatEquation>,
    /// Eliminated definitions with substituted right-hand sides, sorted by lhs
    pub observed: Vec<FlatEquation>,
    /// Scope variables whose class survived elimination
    pub variables: Vec<VarId>,
    /// `(member, canonical)` for every aliased variable seen
    pub aliases: Vec<(VarId, VarId)>,
    pub unknowns: usize,
    pub equations: usize,
}

pub struct EquationSystemReducer<'a> {
    arena: &'a VariableArena,
}

impl<'a> EquationSystemReducer<'a> {
    pub fn new(arena: &'a VariableArena) -> Self {
        Self { arena }
    }

    pub fn eliminate(&self, system: EquationSystem, mode: &EliminationMode) -> Result<Elimination> {
        let EquationSystem {
            variables,
            equations,
            aliases,
            observed,
        } = system;

        // Alias classes
        let mut uf = UnionFind::new();
        for &(a, b) in &aliases {
            uf.union(a, b);
        }
        let mut kept = Vec::with_capacity(equations.len());
        // `x = p` with a parameter on either side is a definition, not an alias
        let is_parameter = |v: VarId| self.arena.get(v).kind == VarKind::Parameter;
        for eq in equations {
            match eq.alias_target() {
                Some(target) if !is_parameter(target) && !is_parameter(eq.lhs) => {
                    uf.union(eq.lhs, target)
                }
                _ => kept.push(eq),
            }
        }

        let canonical = self.canonical_map(&mut uf, &variables, &kept, &aliases, &observed);
        let canon = |v: VarId| canonical.get(&v).copied().unwrap_or(v);

        let kept: Vec<FlatEquation> = kept
            .into_iter()
            .map(|eq| FlatEquation {
                kind: eq.kind,
                lhs: canon(eq.lhs),
                rhs: eq.rhs.map_vars(canon),
            })
            .filter(|eq| eq.alias_target() != Some(eq.lhs))
            .collect();
        let observed: Vec<FlatEquation> = observed
            .into_iter()
            .map(|eq| FlatEquation {
                kind: eq.kind,
                lhs: canon(eq.lhs),
                rhs: eq.rhs.map_vars(canon),
            })
            .collect();

        // Classes and their definitions
        let is_fixed = |c: VarId| self.arena.get(c).kind == VarKind::Parameter;
        let mut classes: BTreeSet<VarId> = variables
            .iter()
            .filter(|v| self.arena.get(**v).kind == VarKind::Unknown)
            .map(|v| canon(*v))
            .filter(|c| !is_fixed(*c))
            .collect();
        let mut definitions: BTreeMap<VarId, Vec<usize>> = BTreeMap::new();
        for (i, eq) in kept.iter().enumerate() {
            if !is_fixed(eq.lhs) {
                classes.insert(eq.lhs);
            }
            definitions.entry(eq.lhs).or_default().push(i);
        }

        let protected: BTreeSet<VarId> = match mode {
            EliminationMode::Global => BTreeSet::new(),
            EliminationMode::Local { protected } => protected.iter().map(|v| canon(*v)).collect(),
        };
        let checked: Vec<VarId> = classes
            .iter()
            .copied()
            .filter(|c| !protected.contains(c))
            .collect();
        let unknowns = checked.len();
        let equation_count: usize = checked
            .iter()
            .map(|c| definitions.get(c).map_or(0, Vec::len))
            .sum::<usize>()
            + definitions
                .iter()
                .filter(|(c, _)| is_fixed(**c) && !protected.contains(*c))
                .map(|(_, defs)| defs.len())
                .sum::<usize>();

        let undefined: Vec<String> = checked
            .iter()
            .filter(|c| !definitions.contains_key(*c))
            .map(|c| self.arena.name(*c).to_string())
            .collect();
        let conflicting: Vec<String> = definitions
            .iter()
            .filter(|(c, defs)| !protected.contains(*c) && (defs.len() > 1 || is_fixed(**c)))
            .map(|(c, _)| self.arena.name(*c).to_string())
            .collect();

        debug!(
            unknowns,
            equations = equation_count,
            aliases = aliases.len(),
            "checking structural balance"
        );
        if equation_count > unknowns || (!conflicting.is_empty() && undefined.is_empty()) {
            return Err(NwireError::OverdeterminedSystem {
                unknowns,
                equations: equation_count,
                conflicting,
            });
        }
        if unknowns > equation_count || !undefined.is_empty() {
            return Err(NwireError::UnderdeterminedSystem {
                unknowns,
                equations: equation_count,
                undefined,
            });
        }

        // Algebraic elimination
        let mut defs: BTreeMap<VarId, Expr> = BTreeMap::new();
        let mut differential = Vec::new();
        let mut algebraic = Vec::new();
        for eq in kept {
            let eliminate = eq.kind == EquationKind::Algebraic && !protected.contains(&eq.lhs);
            if eliminate {
                defs.insert(eq.lhs, eq.rhs);
            } else if eq.kind == EquationKind::Differential {
                differential.push(eq);
            } else {
                algebraic.push(eq);
            }
        }
        for eq in observed {
            defs.insert(eq.lhs, eq.rhs);
        }

        let mut expanded: HashMap<VarId, Expr> = HashMap::with_capacity(defs.len());
        let mut stack = Vec::new();
        for &var in defs.keys() {
            self.expand(var, &defs, &mut expanded, &mut stack)?;
        }
        let substitute = |rhs: &Expr| rhs.substitute(|v| expanded.get(&v).cloned());

        differential.sort_by_key(|eq| eq.lhs);
        for eq in differential.iter_mut().chain(algebraic.iter_mut()) {
            eq.rhs = substitute(&eq.rhs);
        }
        let observed: Vec<FlatEquation> = defs
            .keys()
            .map(|&var| FlatEquation::algebraic(var, expanded[&var].clone()))
            .collect();

        let variables = variables
            .into_iter()
            .filter(|v| !defs.contains_key(&canon(*v)))
            .collect();
        let aliases = canonical
            .iter()
            .filter(|(v, c)| v != c)
            .map(|(v, c)| (*v, *c))
            .collect();

        Ok(Elimination {
            differential,
            algebraic,
            observed,
            variables,
            aliases,
            unknowns,
            equations: equation_count,
        })
    }

    /// Canonical representative for every variable the system mentions. A
    /// class containing a parameter is represented by its lowest parameter.
    fn canonical_map(
        &self,
        uf: &mut UnionFind,
        variables: &[VarId],
        equations: &[FlatEquation],
        aliases: &[(VarId, VarId)],
        observed: &[FlatEquation],
    ) -> BTreeMap<VarId, VarId> {
        let mut mentioned: BTreeSet<VarId> = variables.iter().copied().collect();
        for &(a, b) in aliases {
            mentioned.insert(a);
            mentioned.insert(b);
        }
        for eq in equations.iter().chain(observed) {
            mentioned.insert(eq.lhs);
            mentioned.extend(eq.rhs.variables());
        }

        let mut fixed_root: HashMap<VarId, VarId> = HashMap::new();
        for &v in &mentioned {
            if self.arena.get(v).kind == VarKind::Parameter {
                let root = uf.find(v);
                fixed_root.entry(root).or_insert(v);
            }
        }

        mentioned
            .into_iter()
            .map(|v| {
                let root = uf.find(v);
                (v, fixed_root.get(&root).copied().unwrap_or(root))
            })
            .collect()
    }

    fn expand(
        &self,
        var: VarId,
        defs: &BTreeMap<VarId, Expr>,
        expanded: &mut HashMap<VarId, Expr>,
        stack: &mut Vec<VarId>,
    ) -> Result<Expr> {
        if let Some(done) = expanded.get(&var) {
            return Ok(done.clone());
        }
        if let Some(pos) = stack.iter().position(|v| *v == var) {
            return Err(NwireError::AlgebraicLoop {
                variables: stack[pos..]
                    .iter()
                    .map(|v| self.arena.name(*v).to_string())
                    .collect(),
            });
        }
        let rhs = &defs[&var];
        stack.push(var);
        let mut inner = HashMap::new();
        for dep in rhs.variables() {
            if defs.contains_key(&dep) {
                inner.insert(dep, self.expand(dep, defs, expanded, stack)?);
            }
        }
        stack.pop();
        let result = rhs.substitute(|v| inner.get(&v).cloned());
        expanded.insert(var, result.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Domain, VarKind};

    fn arena(names: &[(&str, VarKind)]) -> (VariableArena, Vec<VarId>) {
        let mut arena = VariableArena::new();
        let ids = names
            .iter()
            .map(|(n, k)| arena.push(n.to_string(), Domain::Dimensionless, *k, 0.0))
            .collect();
        (arena, ids)
    }

    #[test]
    fn test_union_find_lowest_root() {
        let mut uf = UnionFind::new();
        uf.union(VarId(5), VarId(3));
        uf.union(VarId(7), VarId(5));
        uf.union(VarId(9), VarId(1));
        uf.union(VarId(9), VarId(7));
        for v in [1, 3, 5, 7, 9] {
            assert_eq!(uf.find(VarId(v)), VarId(1));
        }
        assert_eq!(uf.find(VarId(2)), VarId(2));
    }

    #[test]
    fn test_alias_collapse_and_substitution() {
        // dx/dt = -y ; y = 2 * z ; z == x
        let (arena, ids) = arena(&[
            ("x", VarKind::Unknown),
            ("y", VarKind::Unknown),
            ("z", VarKind::Unknown),
        ]);
        let (x, y, z) = (ids[0], ids[1], ids[2]);
        let system = EquationSystem {
            variables: ids.clone(),
            equations: vec![
                FlatEquation::differential(x, -Expr::Var(y)),
                FlatEquation::algebraic(y, Expr::from(2.0) * Expr::Var(z)),
            ],
            aliases: vec![(z, x)],
            observed: vec![],
        };
        let out = EquationSystemReducer::new(&arena)
            .eliminate(system, &EliminationMode::Global)
            .unwrap();
        assert_eq!(out.differential.len(), 1);
        assert_eq!(
            out.differential[0].rhs,
            -(Expr::from(2.0) * Expr::Var(x))
        );
        assert_eq!(out.observed.len(), 1);
        assert_eq!(out.aliases, vec![(z, x)]);
        assert_eq!((out.unknowns, out.equations), (2, 2));
    }

    #[test]
    fn test_underdetermined() {
        let (arena, ids) = arena(&[("x", VarKind::Unknown), ("y", VarKind::Unknown)]);
        let system = EquationSystem {
            variables: ids.clone(),
            equations: vec![FlatEquation::differential(ids[0], Expr::Var(ids[1]))],
            ..Default::default()
        };
        let err = EquationSystemReducer::new(&arena)
            .eliminate(system, &EliminationMode::Global)
            .unwrap_err();
        assert_eq!(
            err,
            NwireError::UnderdeterminedSystem {
                unknowns: 2,
                equations: 1,
                undefined: vec!["y".into()],
            }
        );
    }

    #[test]
    fn test_overdetermined_through_alias() {
        let (arena, ids) = arena(&[("a", VarKind::Unknown), ("b", VarKind::Unknown)]);
        let system = EquationSystem {
            variables: ids.clone(),
            equations: vec![
                FlatEquation::algebraic(ids[0], Expr::from(-65.0)),
                FlatEquation::algebraic(ids[1], Expr::from(-20.0)),
            ],
            aliases: vec![(ids[0], ids[1])],
            observed: vec![],
        };
        let err = EquationSystemReducer::new(&arena)
            .eliminate(system, &EliminationMode::Global)
            .unwrap_err();
        assert!(matches!(err, NwireError::OverdeterminedSystem { .. }));
        assert_eq!(err.imbalance(), Some(1));
    }

    #[test]
    fn test_algebraic_loop() {
        let (arena, ids) = arena(&[("a", VarKind::Unknown), ("b", VarKind::Unknown)]);
        let system = EquationSystem {
            variables: ids.clone(),
            equations: vec![
                FlatEquation::algebraic(ids[0], Expr::from(1.0) + Expr::Var(ids[1])),
                FlatEquation::algebraic(ids[1], Expr::from(1.0) + Expr::Var(ids[0])),
            ],
            ..Default::default()
        };
        let err = EquationSystemReducer::new(&arena)
            .eliminate(system, &EliminationMode::Global)
            .unwrap_err();
        assert!(matches!(err, NwireError::AlgebraicLoop { .. }));
    }

    #[test]
    fn test_local_mode_keeps_protected() {
        // port = 3 * w is protected; w = 2 is eliminated
        let (arena, ids) = arena(&[
            ("port", VarKind::Unknown),
            ("w", VarKind::Unknown),
            ("dangling", VarKind::Unknown),
        ]);
        let system = EquationSystem {
            variables: ids.clone(),
            equations: vec![
                FlatEquation::algebraic(ids[0], Expr::from(3.0) * Expr::Var(ids[1])),
                FlatEquation::algebraic(ids[1], Expr::from(2.0)),
            ],
            ..Default::default()
        };
        let protected = [ids[0], ids[2]].into_iter().collect();
        let out = EquationSystemReducer::new(&arena)
            .eliminate(system, &EliminationMode::Local { protected })
            .unwrap();
        assert_eq!(out.algebraic.len(), 1);
        assert_eq!(out.algebraic[0].rhs, Expr::from(3.0) * Expr::from(2.0));
        assert_eq!(out.observed.len(), 1);
        assert_eq!(out.variables, vec![ids[0], ids[2]]);
    }

    #[test]
    fn test_parameter_definition_is_observed() {
        // x = p defines x; a second definition through an alias conflicts
        let (arena, ids) = arena(&[
            ("x", VarKind::Unknown),
            ("p", VarKind::Parameter),
            ("y", VarKind::Unknown),
            ("q", VarKind::Parameter),
        ]);
        let single = EquationSystem {
            variables: vec![ids[0], ids[1]],
            equations: vec![FlatEquation::algebraic(ids[0], Expr::Var(ids[1]))],
            ..Default::default()
        };
        let out = EquationSystemReducer::new(&arena)
            .eliminate(single, &EliminationMode::Global)
            .unwrap();
        assert_eq!(out.observed, vec![FlatEquation::algebraic(ids[0], Expr::Var(ids[1]))]);
        assert!(out.aliases.is_empty());

        let clash = EquationSystem {
            variables: ids.clone(),
            equations: vec![
                FlatEquation::algebraic(ids[0], Expr::Var(ids[1])),
                FlatEquation::algebraic(ids[2], Expr::Var(ids[3])),
            ],
            aliases: vec![(ids[0], ids[2])],
            observed: vec![],
        };
        let err = EquationSystemReducer::new(&arena)
            .eliminate(clash, &EliminationMode::Global)
            .unwrap_err();
        assert_eq!(
            err,
            NwireError::OverdeterminedSystem {
                unknowns: 1,
                equations: 2,
                conflicting: vec!["x".into()],
            }
        );
    }

    #[test]
    fn test_parameter_alias_is_fixed() {
        let (arena, ids) = arena(&[("x", VarKind::Unknown), ("p", VarKind::Parameter)]);
        let system = EquationSystem {
            variables: ids.clone(),
            aliases: vec![(ids[0], ids[1])],
            ..Default::default()
        };
        let out = EquationSystemReducer::new(&arena)
            .eliminate(system, &EliminationMode::Global)
            .unwrap();
        assert_eq!(out.unknowns, 0);
        assert_eq!(out.aliases, vec![(ids[0], ids[1])]);
    }
}
