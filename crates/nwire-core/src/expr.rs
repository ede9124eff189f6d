//! Symbolic expressions and equations.
//!
//! Component authors write right-hand sides either with the operator
//! overloads on [`Expr`] or as text (`"g * m^3 * h * (v - e)"`), parsed by the
//! inline pest grammar below. Symbols stay unresolved ([`Expr::Sym`]) until a
//! component is flattened into a [`VariableArena`], at which point every symbol
//! becomes an [`Expr::Var`].

use crate::{NwireError, Result, VarId, VariableArena};
use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

// =============================================================================
// GRAMMAR
// =============================================================================

#[derive(Parser)]
#[grammar_inline = r#"
WHITESPACE = _{ " " | "\t" }

number = @{ (ASCII_DIGIT+ ~ ("." ~ ASCII_DIGIT*)? | "." ~ ASCII_DIGIT+) ~ (^"e" ~ ("+" | "-")? ~ ASCII_DIGIT+)? }
ident = @{ (ASCII_ALPHA | "_") ~ (ASCII_ALPHANUMERIC | "_")* }
path = @{ ident ~ ("." ~ ident)* }

function = { "exp" | "log" | "tanh" | "sqrt" | "abs" }
call = { function ~ "(" ~ expr ~ ")" }
primary = _{ number | call | path | "(" ~ expr ~ ")" }

power = { primary ~ ("^" ~ unary)? }
neg = { "-" }
unary = { neg* ~ power }
mul_op = { "*" | "/" }
term = { unary ~ (mul_op ~ unary)* }
add_op = { "+" | "-" }
expr = { term ~ (add_op ~ term)* }

derivative = ${ "d" ~ path ~ "/dt" }
lhs = { derivative | path }

equation = { SOI ~ lhs ~ "=" ~ expr ~ EOI }
expression = { SOI ~ expr ~ EOI }
"#]
struct ExprParser;

// =============================================================================
// EXPRESSIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Function {
    Exp,
    Log,
    Tanh,
    Sqrt,
    Abs,
}

impl Function {
    fn apply(&self, x: f64) -> f64 {
        match self {
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Tanh => x.tanh(),
            Self::Sqrt => x.sqrt(),
            Self::Abs => x.abs(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Tanh => "tanh",
            Self::Sqrt => "sqrt",
            Self::Abs => "abs",
        }
    }
}

/// Expression tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Const(f64),
    /// Unresolved local name or dotted child path
    Sym(String),
    /// Resolved arena variable
    Var(VarId),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Box<Expr>),
    /// N-ary sum; the empty sum is zero
    Sum(Vec<Expr>),
}

impl Expr {
    /// Parse an expression from text.
    pub fn parse(src: &str) -> Result<Self> {
        let mut pairs = ExprParser::parse(Rule::expression, src)
            .map_err(|e| NwireError::ParseError(e.to_string()))?;
        let root = next_pair(&mut pairs, src)?;
        let mut inner = root.into_inner();
        build(next_pair(&mut inner, src)?)
    }

    pub fn sym(name: &str) -> Self {
        Self::Sym(name.to_string())
    }

    pub fn pow(self, exponent: Expr) -> Self {
        Self::Binary(BinaryOp::Pow, Box::new(self), Box::new(exponent))
    }

    pub fn exp(self) -> Self {
        Self::Call(Function::Exp, Box::new(self))
    }

    pub fn call(self, function: Function) -> Self {
        Self::Call(function, Box::new(self))
    }

    pub fn as_var(&self) -> Option<VarId> {
        match self {
            Self::Var(id) => Some(*id),
            _ => None,
        }
    }

    /// Unresolved symbols, sorted.
    pub fn symbols(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| {
            if let Self::Sym(s) = e {
                out.insert(s.as_str());
            }
        });
        out
    }

    /// Resolved variables, sorted by id.
    pub fn variables(&self) -> BTreeSet<VarId> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| {
            if let Self::Var(id) = e {
                out.insert(*id);
            }
        });
        out
    }

    fn visit<'a, F: FnMut(&'a Expr)>(&'a self, f: &mut F) {
        f(self);
        match self {
            Self::Neg(e) | Self::Call(_, e) => e.visit(f),
            Self::Binary(_, a, b) => {
                a.visit(f);
                b.visit(f);
            }
            Self::Sum(terms) => {
                for t in terms {
                    t.visit(f);
                }
            }
            Self::Const(_) | Self::Sym(_) | Self::Var(_) => {}
        }
    }

    /// Rebuild the tree, replacing every node for which `leaf` returns `Some`.
    fn transform<F: FnMut(&Expr) -> Option<Expr>>(&self, leaf: &mut F) -> Expr {
        if let Some(replacement) = leaf(self) {
            return replacement;
        }
        match self {
            Self::Neg(e) => Self::Neg(Box::new(e.transform(leaf))),
            Self::Call(func, e) => Self::Call(*func, Box::new(e.transform(leaf))),
            Self::Binary(op, a, b) => {
                Self::Binary(*op, Box::new(a.transform(leaf)), Box::new(b.transform(leaf)))
            }
            Self::Sum(terms) => {
                let mut out = Vec::with_capacity(terms.len());
                for t in terms {
                    out.push(t.transform(leaf));
                }
                Self::Sum(out)
            }
            Self::Const(_) | Self::Sym(_) | Self::Var(_) => self.clone(),
        }
    }

    /// Resolve every symbol through `lookup`; the first unknown symbol is
    /// returned as the error.
    pub fn resolve<F>(&self, lookup: F) -> std::result::Result<Expr, String>
    where
        F: Fn(&str) -> Option<VarId>,
    {
        let mut missing = None;
        let resolved = self.transform(&mut |e| match e {
            Self::Sym(s) => match lookup(s) {
                Some(id) => Some(Self::Var(id)),
                None => {
                    missing.get_or_insert_with(|| s.clone());
                    Some(e.clone())
                }
            },
            _ => None,
        });
        match missing {
            Some(name) => Err(name),
            None => Ok(resolved),
        }
    }

    /// Replace variables for which `f` returns an expression (single pass).
    pub fn substitute<F>(&self, f: F) -> Expr
    where
        F: Fn(VarId) -> Option<Expr>,
    {
        self.transform(&mut |e| match e {
            Self::Var(id) => f(*id),
            _ => None,
        })
    }

    /// Rename variables.
    pub fn map_vars<F>(&self, f: F) -> Expr
    where
        F: Fn(VarId) -> VarId,
    {
        self.substitute(|id| Some(Self::Var(f(id))))
    }

    /// Evaluate with variable values supplied by `lookup`. Unresolved symbols
    /// evaluate to NaN.
    pub fn eval<F>(&self, lookup: &F) -> f64
    where
        F: Fn(VarId) -> f64,
    {
        match self {
            Self::Const(c) => *c,
            Self::Sym(_) => f64::NAN,
            Self::Var(id) => lookup(*id),
            Self::Neg(e) => -e.eval(lookup),
            Self::Call(func, e) => func.apply(e.eval(lookup)),
            Self::Sum(terms) => terms.iter().map(|t| t.eval(lookup)).sum(),
            Self::Binary(op, a, b) => {
                let (a, b) = (a.eval(lookup), b.eval(lookup));
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                }
            }
        }
    }

    /// Render with qualified arena names.
    pub fn display<'a>(&'a self, arena: &'a VariableArena) -> ExprDisplay<'a> {
        ExprDisplay {
            expr: self,
            arena: Some(arena),
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Self::Binary(BinaryOp::Add | BinaryOp::Sub, ..) => 1,
            Self::Sum(terms) if terms.len() > 1 => 1,
            Self::Binary(BinaryOp::Mul | BinaryOp::Div, ..) => 2,
            Self::Neg(_) => 3,
            Self::Const(c) if *c < 0.0 => 3,
            Self::Binary(BinaryOp::Pow, ..) => 4,
            _ => 5,
        }
    }
}

fn next_pair<'i>(pairs: &mut Pairs<'i, Rule>, src: &str) -> Result<Pair<'i, Rule>> {
    pairs
        .next()
        .ok_or_else(|| NwireError::ParseError(format!("unexpected end of input in '{}'", src)))
}

fn build(pair: Pair<Rule>) -> Result<Expr> {
    let src = pair.as_str().to_string();
    match pair.as_rule() {
        Rule::number => src
            .parse::<f64>()
            .map(Expr::Const)
            .map_err(|e| NwireError::ParseError(format!("bad number '{}': {}", src, e))),
        Rule::path => Ok(Expr::Sym(src)),
        Rule::call => {
            let mut inner = pair.into_inner();
            let function = match next_pair(&mut inner, &src)?.as_str() {
                "exp" => Function::Exp,
                "log" => Function::Log,
                "tanh" => Function::Tanh,
                "sqrt" => Function::Sqrt,
                _ => Function::Abs,
            };
            Ok(build(next_pair(&mut inner, &src)?)?.call(function))
        }
        Rule::power => {
            let mut inner = pair.into_inner();
            let base = build(next_pair(&mut inner, &src)?)?;
            match inner.next() {
                Some(exponent) => Ok(base.pow(build(exponent)?)),
                None => Ok(base),
            }
        }
        Rule::unary => {
            let mut negations = 0;
            let mut operand = None;
            for p in pair.into_inner() {
                match p.as_rule() {
                    Rule::neg => negations += 1,
                    _ => operand = Some(build(p)?),
                }
            }
            let mut expr = operand
                .ok_or_else(|| NwireError::ParseError(format!("missing operand in '{}'", src)))?;
            for _ in 0..negations {
                expr = -expr;
            }
            Ok(expr)
        }
        Rule::term | Rule::expr => {
            let mut inner = pair.into_inner();
            let mut acc = build(next_pair(&mut inner, &src)?)?;
            while let Some(op) = inner.next() {
                let rhs = build(next_pair(&mut inner, &src)?)?;
                acc = match op.as_str() {
                    "+" => acc + rhs,
                    "-" => acc - rhs,
                    "*" => acc * rhs,
                    _ => acc / rhs,
                };
            }
            Ok(acc)
        }
        rule => Err(NwireError::ParseError(format!(
            "unexpected {:?} in '{}'",
            rule, src
        ))),
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Self::Const(value)
    }
}

impl From<VarId> for Expr {
    fn from(id: VarId) -> Self {
        Self::Var(id)
    }
}

macro_rules! binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait for Expr {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                Expr::Binary($op, Box::new(self), Box::new(rhs))
            }
        }
    };
}

binary_op!(Add, add, BinaryOp::Add);
binary_op!(Sub, sub, BinaryOp::Sub);
binary_op!(Mul, mul, BinaryOp::Mul);
binary_op!(Div, div, BinaryOp::Div);

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}

// =============================================================================
// DISPLAY
// =============================================================================

/// Display adapter; renders arena variables by qualified name when an arena
/// is attached and as `#id` otherwise.
pub struct ExprDisplay<'a> {
    expr: &'a Expr,
    arena: Option<&'a VariableArena>,
}

impl ExprDisplay<'_> {
    fn write(&self, expr: &Expr, f: &mut fmt::Formatter<'_>, ctx: u8) -> fmt::Result {
        let paren = expr.precedence() < ctx;
        if paren {
            write!(f, "(")?;
        }
        match expr {
            Expr::Const(c) => write!(f, "{}", c)?,
            Expr::Sym(s) => write!(f, "{}", s)?,
            Expr::Var(id) => match self.arena.and_then(|a| a.try_get(*id)) {
                Some(var) => write!(f, "{}", var.name)?,
                None => write!(f, "#{}", id.0)?,
            },
            Expr::Neg(e) => {
                write!(f, "-")?;
                self.write(e, f, 4)?;
            }
            Expr::Call(func, e) => {
                write!(f, "{}(", func.name())?;
                self.write(e, f, 0)?;
                write!(f, ")")?;
            }
            Expr::Sum(terms) if terms.is_empty() => write!(f, "0")?,
            Expr::Sum(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, " + ")?;
                    }
                    self.write(term, f, 2)?;
                }
            }
            Expr::Binary(op, a, b) => {
                let (symbol, left, right) = match op {
                    BinaryOp::Add => (" + ", 1, 1),
                    BinaryOp::Sub => (" - ", 1, 2),
                    BinaryOp::Mul => (" * ", 2, 2),
                    BinaryOp::Div => (" / ", 2, 3),
                    BinaryOp::Pow => ("^", 5, 3),
                };
                self.write(a, f, left)?;
                write!(f, "{}", symbol)?;
                self.write(b, f, right)?;
            }
        }
        if paren {
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl fmt::Display for ExprDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write(self.expr, f, 0)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        ExprDisplay {
            expr: self,
            arena: None,
        }
        .fmt(f)
    }
}

// =============================================================================
// EQUATIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EquationKind {
    /// dx/dt = rhs
    Differential,
    /// x = rhs
    Algebraic,
}

/// Component-level equation over local symbols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equation {
    pub kind: EquationKind,
    pub lhs: String,
    pub rhs: Expr,
}

impl Equation {
    pub fn differential(lhs: &str, rhs: Expr) -> Self {
        Self {
            kind: EquationKind::Differential,
            lhs: lhs.to_string(),
            rhs,
        }
    }

    pub fn algebraic(lhs: &str, rhs: Expr) -> Self {
        Self {
            kind: EquationKind::Algebraic,
            lhs: lhs.to_string(),
            rhs,
        }
    }

    /// Parse `dv/dt = expr` or `x = expr`.
    pub fn parse(src: &str) -> Result<Self> {
        let mut pairs = ExprParser::parse(Rule::equation, src)
            .map_err(|e| NwireError::ParseError(e.to_string()))?;
        let mut inner = next_pair(&mut pairs, src)?.into_inner();
        let lhs = next_pair(&mut inner, src)?;
        let rhs = build(next_pair(&mut inner, src)?)?;
        let target = next_pair(&mut lhs.into_inner(), src)?;
        match target.as_rule() {
            Rule::derivative => {
                let var = next_pair(&mut target.into_inner(), src)?;
                Ok(Self::differential(var.as_str(), rhs))
            }
            _ => Ok(Self::algebraic(target.as_str(), rhs)),
        }
    }

    /// Parse one equation per line; blank lines and `#` comments are skipped.
    pub fn parse_block(text: &str) -> Result<Vec<Self>> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(Self::parse)
            .collect()
    }
}

impl fmt::Display for Equation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EquationKind::Differential => write!(f, "d{}/dt = {}", self.lhs, self.rhs),
            EquationKind::Algebraic => write!(f, "{} = {}", self.lhs, self.rhs),
        }
    }
}

/// Equation over arena variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatEquation {
    pub kind: EquationKind,
    pub lhs: VarId,
    pub rhs: Expr,
}

impl FlatEquation {
    pub fn differential(lhs: VarId, rhs: Expr) -> Self {
        Self {
            kind: EquationKind::Differential,
            lhs,
            rhs,
        }
    }

    pub fn algebraic(lhs: VarId, rhs: Expr) -> Self {
        Self {
            kind: EquationKind::Algebraic,
            lhs,
            rhs,
        }
    }

    /// `Some(other)` when this is an `x = other` alias.
    pub fn alias_target(&self) -> Option<VarId> {
        match self.kind {
            EquationKind::Algebraic => self.rhs.as_var(),
            EquationKind::Differential => None,
        }
    }

    pub fn render(&self, arena: &VariableArena) -> String {
        let name = arena.name(self.lhs);
        match self.kind {
            EquationKind::Differential => format!("d{}/dt = {}", name, self.rhs.display(arena)),
            EquationKind::Algebraic => format!("{} = {}", name, self.rhs.display(arena)),
        }
    }
}
