//! Constraint representation and normalisation.
//!
//! The driver posts a tree of literals, conjunctions and disjunctions;
//! before solving, the tree is flattened into clauses: each clause is a
//! single literal or a disjunction of literals. Conjunctions flatten into
//! the clause list and disjunctions distribute across each other.

use std::collections::BTreeSet;
use std::fmt;

use crate::context::Context;
use crate::types::{BuiltinType, ResourceId, TypeId};

/// A solver variable.
///
/// `Named` variables come from the user's code and must be ground in an
/// accepted solution. `Output` variables stand for a function's declared
/// outputs and are held to the same standard. `Anon` and `TypeVar`
/// variables are internal and may be left unresolved.
///
/// The `Ord` derive fixes the canonical orientation of `v1 = v2`
/// literals: the smaller variable goes on the left.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SolverVar {
    Named(String),
    Output(u32),
    Anon(u32),
    TypeVar(u32),
}

impl SolverVar {
    /// Whether an accepted solution must ground this variable.
    pub fn must_be_ground(&self) -> bool {
        matches!(self, SolverVar::Named(_) | SolverVar::Output(_))
    }
}

impl fmt::Display for SolverVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverVar::Named(name) => write!(f, "{name}"),
            SolverVar::Output(i) => write!(f, "output({i})"),
            SolverVar::Anon(i) => write!(f, "_{i}"),
            SolverVar::TypeVar(i) => write!(f, "'t{i}"),
        }
    }
}

/// Resource annotation carried by a function literal: `None` when the
/// call site has no idea (higher-order calls).
pub type ResourceSets = Option<(BTreeSet<ResourceId>, BTreeSet<ResourceId>)>;

/// A constraint literal with the source context that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal {
    pub kind: LiteralKind,
    pub context: Context,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiteralKind {
    True,
    /// `var = builtin(B)`
    Builtin { var: SolverVar, builtin: BuiltinType },
    /// `var = usertype(id, args)`
    UserType {
        var: SolverVar,
        type_id: TypeId,
        args: Vec<SolverVar>,
    },
    /// `var = func(inputs, outputs, resources?)`
    Func {
        var: SolverVar,
        inputs: Vec<SolverVar>,
        outputs: Vec<SolverVar>,
        resources: ResourceSets,
    },
    /// `var = free_type_var(name)` - a universally quantified variable of
    /// the enclosing declaration.
    FreeTypeVar { var: SolverVar, name: String },
    /// `var = var`
    VarVar(SolverVar, SolverVar),
}

impl Literal {
    pub fn new(kind: LiteralKind, context: Context) -> Self {
        Self { kind, context }
    }

    pub fn truth() -> Self {
        Self::new(LiteralKind::True, Context::Nil)
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LiteralKind::True => write!(f, "true"),
            LiteralKind::Builtin { var, builtin } => write!(f, "{var} = {builtin}"),
            LiteralKind::UserType { var, type_id, args } => {
                let args: Vec<_> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{var} = type#{}({})", type_id.0, args.join(", "))
            }
            LiteralKind::Func {
                var,
                inputs,
                outputs,
                resources,
            } => {
                let ins: Vec<_> = inputs.iter().map(|a| a.to_string()).collect();
                let outs: Vec<_> = outputs.iter().map(|a| a.to_string()).collect();
                let res = if resources.is_some() { "" } else { " ?resources" };
                write!(
                    f,
                    "{var} = func({}) -> ({}){res}",
                    ins.join(", "),
                    outs.join(", ")
                )
            }
            LiteralKind::FreeTypeVar { var, name } => {
                write!(f, "{var} = free_type_var({name})")
            }
            LiteralKind::VarVar(a, b) => write!(f, "{a} = {b}"),
        }
    }
}

/// A constraint tree as posted by the driver.
#[derive(Debug, Clone)]
pub enum Constraint {
    Lit(Literal),
    Conj(Vec<Constraint>),
    Disj(Vec<Constraint>),
}

/// A normalised clause.
#[derive(Debug, Clone)]
pub enum Clause {
    Single(Literal),
    Disj(Vec<Literal>),
}

impl Clause {
    pub fn literals(&self) -> &[Literal] {
        match self {
            Clause::Single(lit) => std::slice::from_ref(lit),
            Clause::Disj(lits) => lits,
        }
    }

    pub fn context(&self) -> &Context {
        &self.literals()[0].context
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::Single(lit) => write!(f, "{lit}"),
            Clause::Disj(lits) => {
                let parts: Vec<_> = lits.iter().map(|l| l.to_string()).collect();
                write!(f, "({})", parts.join(" ; "))
            }
        }
    }
}

/// Canonicalise a literal: identical-variable equalities become `true`,
/// and `v1 = v2` puts the smaller variable on the left.
pub fn simplify_literal(mut literal: Literal) -> Literal {
    if let LiteralKind::VarVar(a, b) = &mut literal.kind {
        if a == b {
            literal.kind = LiteralKind::True;
        } else if b < a {
            std::mem::swap(a, b);
        }
    }
    literal
}

/// Flatten a constraint tree into clauses.
///
/// An empty clause list means the constraint is trivially true.
pub fn to_clauses(constraint: Constraint) -> Vec<Clause> {
    match constraint {
        Constraint::Lit(literal) => {
            let literal = simplify_literal(literal);
            if matches!(literal.kind, LiteralKind::True) {
                Vec::new()
            } else {
                vec![Clause::Single(literal)]
            }
        }
        Constraint::Conj(parts) => parts.into_iter().flat_map(to_clauses).collect(),
        Constraint::Disj(parts) => {
            // Distribute: the clause lists of the branches combine as a
            // Cartesian product. A branch with no clauses is true and
            // makes the whole disjunction true.
            let mut acc: Option<Vec<Vec<Literal>>> = None;
            for part in parts {
                let clauses = to_clauses(part);
                if clauses.is_empty() {
                    return Vec::new();
                }
                let branches: Vec<Vec<Literal>> = clauses
                    .into_iter()
                    .map(|c| c.literals().to_vec())
                    .collect();
                acc = Some(match acc {
                    None => branches,
                    Some(prev) => {
                        let mut product = Vec::with_capacity(prev.len() * branches.len());
                        for left in &prev {
                            for right in &branches {
                                let mut merged = left.clone();
                                merged.extend(right.iter().cloned());
                                product.push(merged);
                            }
                        }
                        product
                    }
                });
            }
            match acc {
                None => Vec::new(),
                Some(clause_lits) => clause_lits
                    .into_iter()
                    .map(|lits| {
                        if lits.len() == 1 {
                            Clause::Single(lits.into_iter().next().unwrap())
                        } else {
                            Clause::Disj(lits)
                        }
                    })
                    .collect(),
            }
        }
    }
}
