//! The type-constraint solver.
//!
//! A propagation engine over Herbrand-style type domains. Each solver
//! variable has a domain; running a clause unifies domains and writes the
//! results back. Clauses that cannot be decided yet are delayed and
//! retried in the next round; the outer loop stops when a round makes no
//! progress.
//!
//! Disjunctions are single-answer: a branch's writes are only committed
//! once every other branch has failed. The solver never speculatively
//! commits a write it might have to undo.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

use super::constraints::{Clause, Literal, LiteralKind, ResourceSets, SolverVar};
use crate::context::Context;
use crate::types::{BuiltinType, ResourceId, TypeId};

/// Resource annotations on a function domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resources {
    /// Nothing known yet; the lattice bottom.
    Unknown,
    Known {
        used: BTreeSet<ResourceId>,
        observed: BTreeSet<ResourceId>,
    },
}

impl Resources {
    pub fn from_sets(sets: &ResourceSets) -> Self {
        match sets {
            None => Resources::Unknown,
            Some((used, observed)) => Resources::Known {
                used: used.clone(),
                observed: observed.clone(),
            },
        }
    }
}

/// Unify two resource annotations: `unknown` is the identity, and two
/// known annotations union their used and observed sets.
pub fn unify_resources(a: &Resources, b: &Resources) -> Resources {
    match (a, b) {
        (Resources::Unknown, r) | (r, Resources::Unknown) => r.clone(),
        (
            Resources::Known {
                used: u1,
                observed: o1,
            },
            Resources::Known {
                used: u2,
                observed: o2,
            },
        ) => Resources::Known {
            used: u1.union(u2).cloned().collect(),
            observed: o1.union(o2).cloned().collect(),
        },
    }
}

/// A solver variable's domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Domain {
    Free,
    Builtin(BuiltinType),
    Type {
        id: TypeId,
        args: Vec<Domain>,
    },
    Func {
        inputs: Vec<Domain>,
        outputs: Vec<Domain>,
        resources: Resources,
    },
    /// A universally quantified type variable of the enclosing
    /// declaration. Ground.
    UnivVar(String),
}

impl Domain {
    /// Ground means no `free` anywhere, transitively.
    pub fn is_ground(&self) -> bool {
        match self {
            Domain::Free => false,
            Domain::Builtin(_) | Domain::UnivVar(_) => true,
            Domain::Type { args, .. } => args.iter().all(Domain::is_ground),
            Domain::Func {
                inputs, outputs, ..
            } => inputs.iter().all(Domain::is_ground) && outputs.iter().all(Domain::is_ground),
        }
    }

    /// Whether a function domain occurs anywhere. Such domains propagate
    /// with delay: their resource sets can keep growing after the type
    /// shape is settled.
    pub fn has_func(&self) -> bool {
        match self {
            Domain::Free | Domain::Builtin(_) | Domain::UnivVar(_) => false,
            Domain::Type { args, .. } => args.iter().any(Domain::has_func),
            Domain::Func { .. } => true,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Free => write!(f, "_"),
            Domain::Builtin(b) => write!(f, "{b}"),
            Domain::UnivVar(name) => write!(f, "{name}"),
            Domain::Type { id, args } => {
                if args.is_empty() {
                    write!(f, "type#{}", id.0)
                } else {
                    let args: Vec<_> = args.iter().map(|a| a.to_string()).collect();
                    write!(f, "type#{}({})", id.0, args.join(", "))
                }
            }
            Domain::Func {
                inputs, outputs, ..
            } => {
                let ins: Vec<_> = inputs.iter().map(|a| a.to_string()).collect();
                let outs: Vec<_> = outputs.iter().map(|a| a.to_string()).collect();
                write!(f, "func({}) -> ({})", ins.join(", "), outs.join(", "))
            }
        }
    }
}

/// How a unification related its result to the stored domains.
///
/// The ordering is the aggregation order for compound domains: the
/// strongest argument status wins (`New > Delayed > Old`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnifyStatus {
    /// Nothing new was learnt.
    OldDomain,
    /// Cannot be decided yet; run again later.
    Delayed,
    /// The result carries new information.
    NewDomain,
}

/// A successful unification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unified {
    pub domain: Domain,
    pub status: UnifyStatus,
}

/// Why a unification failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnifyError {
    #[error("type mismatch: {left} vs {right}")]
    Mismatch { left: String, right: String },

    #[error("different types: {left} vs {right}")]
    TypeCtorMismatch { left: String, right: String },

    #[error("arity mismatch: {left} vs {right}")]
    ArityMismatch { left: String, right: String },

    #[error("distinct type variables: {left} vs {right}")]
    UnivVarMismatch { left: String, right: String },
}

fn mismatch(a: &Domain, b: &Domain) -> UnifyError {
    UnifyError::Mismatch {
        left: a.to_string(),
        right: b.to_string(),
    }
}

/// Unify two domains.
pub fn unify_domains(a: &Domain, b: &Domain) -> Result<Unified, UnifyError> {
    match (a, b) {
        (Domain::Free, Domain::Free) => Ok(Unified {
            domain: Domain::Free,
            status: UnifyStatus::Delayed,
        }),
        (Domain::Free, other) | (other, Domain::Free) => Ok(Unified {
            domain: other.clone(),
            status: UnifyStatus::NewDomain,
        }),

        (Domain::Builtin(x), Domain::Builtin(y)) => {
            if x == y {
                Ok(Unified {
                    domain: Domain::Builtin(*x),
                    status: UnifyStatus::OldDomain,
                })
            } else {
                Err(mismatch(a, b))
            }
        }

        (Domain::UnivVar(x), Domain::UnivVar(y)) => {
            if x == y {
                Ok(Unified {
                    domain: Domain::UnivVar(x.clone()),
                    status: UnifyStatus::OldDomain,
                })
            } else {
                Err(UnifyError::UnivVarMismatch {
                    left: x.clone(),
                    right: y.clone(),
                })
            }
        }

        (
            Domain::Type {
                id: id1,
                args: args1,
            },
            Domain::Type {
                id: id2,
                args: args2,
            },
        ) => {
            if id1 != id2 {
                return Err(UnifyError::TypeCtorMismatch {
                    left: a.to_string(),
                    right: b.to_string(),
                });
            }
            if args1.len() != args2.len() {
                return Err(UnifyError::ArityMismatch {
                    left: a.to_string(),
                    right: b.to_string(),
                });
            }
            let mut status = UnifyStatus::OldDomain;
            let mut args = Vec::with_capacity(args1.len());
            for (x, y) in args1.iter().zip(args2.iter()) {
                let unified = unify_domains(x, y)?;
                status = status.max(unified.status);
                args.push(unified.domain);
            }
            let domain = if status == UnifyStatus::OldDomain {
                a.clone()
            } else {
                Domain::Type { id: *id1, args }
            };
            Ok(Unified { domain, status })
        }

        (
            Domain::Func {
                inputs: in1,
                outputs: out1,
                resources: res1,
            },
            Domain::Func {
                inputs: in2,
                outputs: out2,
                resources: res2,
            },
        ) => {
            if in1.len() != in2.len() || out1.len() != out2.len() {
                return Err(UnifyError::ArityMismatch {
                    left: a.to_string(),
                    right: b.to_string(),
                });
            }
            let mut inputs = Vec::with_capacity(in1.len());
            for (x, y) in in1.iter().zip(in2.iter()) {
                inputs.push(unify_domains(x, y)?.domain);
            }
            let mut outputs = Vec::with_capacity(out1.len());
            for (x, y) in out1.iter().zip(out2.iter()) {
                outputs.push(unify_domains(x, y)?.domain);
            }
            let resources = unify_resources(res1, res2);
            // Function domains always propagate with delay, whatever the
            // argument statuses: a higher-order call's resource signature
            // may only become known late, so the clause must keep
            // running.
            Ok(Unified {
                domain: Domain::Func {
                    inputs,
                    outputs,
                    resources,
                },
                status: UnifyStatus::Delayed,
            })
        }

        _ => Err(mismatch(a, b)),
    }
}

/// The domain store.
#[derive(Debug, Clone, Default)]
pub struct Store {
    domains: BTreeMap<SolverVar, Domain>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// A variable's domain; unconstrained variables are `Free`.
    pub fn get(&self, var: &SolverVar) -> Domain {
        self.domains.get(var).cloned().unwrap_or(Domain::Free)
    }

    pub fn set(&mut self, var: SolverVar, domain: Domain) {
        self.domains.insert(var, domain);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SolverVar, &Domain)> {
        self.domains.iter()
    }
}

/// A failure while running a clause, with the literal's source context.
#[derive(Debug, Clone, Error)]
#[error("{reason} ({context})")]
pub struct SolveFailure {
    pub reason: UnifyError,
    pub context: Context,
}

/// The result of running one clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunResult {
    SuccessUpdated,
    SuccessNotUpdated,
    DelayedUpdated,
    DelayedNotUpdated,
}

/// The writes a literal would perform, computed without touching the
/// store.
#[derive(Debug, Clone)]
struct Probe {
    writes: Vec<(SolverVar, Domain)>,
    delayed: bool,
}

fn probe_literal(store: &Store, literal: &Literal) -> Result<Probe, UnifyError> {
    match &literal.kind {
        LiteralKind::True => Ok(Probe {
            writes: Vec::new(),
            delayed: false,
        }),

        LiteralKind::Builtin { var, builtin } => {
            let unified = unify_domains(&store.get(var), &Domain::Builtin(*builtin))?;
            Ok(Probe {
                writes: vec![(var.clone(), unified.domain)],
                delayed: unified.status == UnifyStatus::Delayed,
            })
        }

        LiteralKind::FreeTypeVar { var, name } => {
            let unified = unify_domains(&store.get(var), &Domain::UnivVar(name.clone()))?;
            Ok(Probe {
                writes: vec![(var.clone(), unified.domain)],
                delayed: unified.status == UnifyStatus::Delayed,
            })
        }

        LiteralKind::VarVar(a, b) => {
            let unified = unify_domains(&store.get(a), &store.get(b))?;
            // Until the shared domain is ground, more information can
            // arrive through either side; keep the clause live. Function
            // domains stay live for their resource sets.
            let delayed = unified.status == UnifyStatus::Delayed
                || !unified.domain.is_ground()
                || unified.domain.has_func();
            Ok(Probe {
                writes: vec![
                    (a.clone(), unified.domain.clone()),
                    (b.clone(), unified.domain),
                ],
                delayed,
            })
        }

        LiteralKind::UserType { var, type_id, args } => {
            let lhs = Domain::Type {
                id: *type_id,
                args: args.iter().map(|arg| store.get(arg)).collect(),
            };
            let unified = unify_domains(&lhs, &store.get(var))?;
            let mut writes = vec![(var.clone(), unified.domain.clone())];
            // Project the unified argument domains back onto the
            // argument variables.
            if let Domain::Type {
                args: unified_args, ..
            } = &unified.domain
            {
                for (arg_var, arg_domain) in args.iter().zip(unified_args.iter()) {
                    writes.push((arg_var.clone(), arg_domain.clone()));
                }
            }
            // The variable's domain holds a copy of the argument
            // domains, not a reference; the literal keeps running until
            // everything is ground so later bindings flow through.
            let delayed = unified.status == UnifyStatus::Delayed
                || !unified.domain.is_ground()
                || unified.domain.has_func();
            Ok(Probe { writes, delayed })
        }

        LiteralKind::Func {
            var,
            inputs,
            outputs,
            resources,
        } => {
            let lhs = Domain::Func {
                inputs: inputs.iter().map(|v| store.get(v)).collect(),
                outputs: outputs.iter().map(|v| store.get(v)).collect(),
                resources: Resources::from_sets(resources),
            };
            let unified = unify_domains(&lhs, &store.get(var))?;
            let mut writes = vec![(var.clone(), unified.domain.clone())];
            if let Domain::Func {
                inputs: unified_in,
                outputs: unified_out,
                ..
            } = &unified.domain
            {
                for (v, d) in inputs.iter().zip(unified_in.iter()) {
                    writes.push((v.clone(), d.clone()));
                }
                for (v, d) in outputs.iter().zip(unified_out.iter()) {
                    writes.push((v.clone(), d.clone()));
                }
            }
            // Func literals never retire: resource information can keep
            // arriving from other call sites.
            Ok(Probe {
                writes,
                delayed: true,
            })
        }
    }
}

fn commit(store: &mut Store, probe: &Probe) -> bool {
    let mut updated = false;
    for (var, domain) in &probe.writes {
        if store.get(var) != *domain {
            store.set(var.clone(), domain.clone());
            updated = true;
        }
    }
    updated
}

fn run_clause(store: &mut Store, clause: &Clause) -> Result<RunResult, SolveFailure> {
    match clause {
        Clause::Single(literal) => {
            let probe = probe_literal(store, literal).map_err(|reason| SolveFailure {
                reason,
                context: literal.context.clone(),
            })?;
            let updated = commit(store, &probe);
            Ok(match (probe.delayed, updated) {
                (true, true) => RunResult::DelayedUpdated,
                (true, false) => RunResult::DelayedNotUpdated,
                (false, true) => RunResult::SuccessUpdated,
                (false, false) => RunResult::SuccessNotUpdated,
            })
        }

        Clause::Disj(literals) => {
            // Single-answer scan: probe every branch without writing.
            let mut survivors: Vec<(usize, Probe)> = Vec::new();
            let mut last_failure = None;
            for (index, literal) in literals.iter().enumerate() {
                match probe_literal(store, literal) {
                    Ok(probe) => survivors.push((index, probe)),
                    Err(reason) => {
                        last_failure = Some(SolveFailure {
                            reason,
                            context: literal.context.clone(),
                        })
                    }
                }
            }

            match survivors.len() {
                0 => Err(last_failure.expect("a failed disjunction has a failure")),
                1 => {
                    // Every other branch failed; this one commits.
                    let (_, probe) = &survivors[0];
                    let updated = commit(store, probe);
                    Ok(match (probe.delayed, updated) {
                        (true, true) => RunResult::DelayedUpdated,
                        (true, false) => RunResult::DelayedNotUpdated,
                        (false, true) => RunResult::SuccessUpdated,
                        (false, false) => RunResult::SuccessNotUpdated,
                    })
                }
                _ => {
                    // More than one branch is still possible. If one of
                    // them holds without writing anything, the others may
                    // still fail later; either way no write is committed
                    // now.
                    Ok(RunResult::DelayedNotUpdated)
                }
            }
        }
    }
}

/// An accepted solution: the final domain store.
#[derive(Debug, Clone)]
pub struct Solution {
    store: Store,
}

impl Solution {
    pub fn domain(&self, var: &SolverVar) -> Domain {
        self.store.get(var)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SolverVar, &Domain)> {
        self.store.iter()
    }
}

/// Why solving stopped without a solution.
#[derive(Debug, Clone, Error)]
pub enum SolveError {
    #[error(transparent)]
    Failure(#[from] SolveFailure),

    #[error("ambiguous type ({context})")]
    Ambiguous { context: Context },

    #[error("cannot infer types for {vars:?}")]
    Flounder {
        vars: Vec<String>,
        remaining: Vec<String>,
    },
}

/// Run the solver over a clause list.
pub fn solve(clauses: Vec<Clause>) -> Result<Solution, SolveError> {
    let mut store = Store::new();
    let mut queue = clauses;
    let mut round = 0usize;

    loop {
        round += 1;
        let mut delays = Vec::new();
        let mut progress = false;

        for clause in queue {
            match run_clause(&mut store, &clause)? {
                RunResult::SuccessUpdated => progress = true,
                RunResult::SuccessNotUpdated => progress = true,
                RunResult::DelayedUpdated => {
                    progress = true;
                    delays.push(clause);
                }
                RunResult::DelayedNotUpdated => delays.push(clause),
            }
        }

        tracing::trace!(round, outstanding = delays.len(), "solver round");

        if delays.is_empty() {
            return check_and_accept(store, &[]);
        }
        if !progress {
            return check_and_accept(store, &delays);
        }

        queue = delays;
    }
}

/// Names of the named/output variables that are not ground, whether they
/// have a store entry or only appear in outstanding clauses.
fn unbound_named(store: &Store, remaining: &[Clause]) -> Vec<String> {
    let mut unbound: Vec<String> = store
        .iter()
        .filter(|(var, domain)| var.must_be_ground() && !domain.is_ground())
        .map(|(var, _)| var.to_string())
        .collect();
    for clause in remaining {
        for literal in clause.literals() {
            for var in literal_vars(literal) {
                if var.must_be_ground() && !store.get(var).is_ground() {
                    unbound.push(var.to_string());
                }
            }
        }
    }
    unbound.sort();
    unbound.dedup();
    unbound
}

/// Decide the outcome at a fixpoint.
///
/// If every named variable is ground the solution is accepted: clauses
/// still outstanding are satisfied disjunctions or function-domain
/// literals kept live for their resource sets. Otherwise the result is
/// an error: ambiguous when an undecided disjunction still has several
/// viable branches touching an unbound named variable, floundering when
/// the constraints simply ran out of information.
fn check_and_accept(store: Store, remaining: &[Clause]) -> Result<Solution, SolveError> {
    let unbound = unbound_named(&store, remaining);
    if unbound.is_empty() {
        return Ok(Solution { store });
    }

    for clause in remaining {
        let Clause::Disj(literals) = clause else {
            continue;
        };
        let mentions_unbound = literals.iter().any(|literal| {
            literal_vars(literal)
                .iter()
                .any(|var| var.must_be_ground() && !store.get(var).is_ground())
        });
        if !mentions_unbound {
            continue;
        }
        let viable = literals
            .iter()
            .filter(|literal| probe_literal(&store, literal).is_ok())
            .count();
        if viable > 1 {
            return Err(SolveError::Ambiguous {
                context: clause.context().clone(),
            });
        }
    }

    Err(SolveError::Flounder {
        vars: unbound,
        remaining: remaining.iter().map(|c| c.to_string()).collect(),
    })
}

fn literal_vars(literal: &Literal) -> Vec<&SolverVar> {
    match &literal.kind {
        LiteralKind::True => Vec::new(),
        LiteralKind::Builtin { var, .. } | LiteralKind::FreeTypeVar { var, .. } => vec![var],
        LiteralKind::VarVar(a, b) => vec![a, b],
        LiteralKind::UserType { var, args, .. } => {
            let mut vars = vec![var];
            vars.extend(args.iter());
            vars
        }
        LiteralKind::Func {
            var,
            inputs,
            outputs,
            ..
        } => {
            let mut vars = vec![var];
            vars.extend(inputs.iter());
            vars.extend(outputs.iter());
            vars
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typeck::constraints::Clause;

    fn named(name: &str) -> SolverVar {
        SolverVar::Named(name.to_string())
    }

    fn lit(kind: LiteralKind) -> Literal {
        Literal::new(kind, Context::Line(1))
    }

    fn int_domain() -> Domain {
        Domain::Builtin(BuiltinType::Int)
    }

    // ============================================================
    // unify_domains
    // ============================================================

    #[test]
    fn test_unify_free_free_delays() {
        let u = unify_domains(&Domain::Free, &Domain::Free).unwrap();
        assert_eq!(u.domain, Domain::Free);
        assert_eq!(u.status, UnifyStatus::Delayed);
    }

    #[test]
    fn test_unify_free_with_anything_is_new() {
        let u = unify_domains(&Domain::Free, &int_domain()).unwrap();
        assert_eq!(u.domain, int_domain());
        assert_eq!(u.status, UnifyStatus::NewDomain);
        let u = unify_domains(&int_domain(), &Domain::Free).unwrap();
        assert_eq!(u.status, UnifyStatus::NewDomain);
    }

    #[test]
    fn test_unify_equal_builtins_is_old() {
        let u = unify_domains(&int_domain(), &int_domain()).unwrap();
        assert_eq!(u.status, UnifyStatus::OldDomain);
    }

    #[test]
    fn test_unify_different_builtins_fails() {
        let r = unify_domains(&int_domain(), &Domain::Builtin(BuiltinType::String));
        assert!(r.is_err());
    }

    #[test]
    fn test_unify_univ_vars() {
        let t = Domain::UnivVar("T".into());
        assert_eq!(
            unify_domains(&t, &t).unwrap().status,
            UnifyStatus::OldDomain
        );
        assert!(unify_domains(&t, &Domain::UnivVar("U".into())).is_err());
    }

    #[test]
    fn test_unify_types_pointwise() {
        let list_free = Domain::Type {
            id: TypeId(0),
            args: vec![Domain::Free],
        };
        let list_int = Domain::Type {
            id: TypeId(0),
            args: vec![int_domain()],
        };
        let u = unify_domains(&list_free, &list_int).unwrap();
        assert_eq!(u.domain, list_int);
        assert_eq!(u.status, UnifyStatus::NewDomain);
    }

    #[test]
    fn test_unify_types_id_mismatch_fails() {
        let a = Domain::Type {
            id: TypeId(0),
            args: vec![],
        };
        let b = Domain::Type {
            id: TypeId(1),
            args: vec![],
        };
        assert!(matches!(
            unify_domains(&a, &b),
            Err(UnifyError::TypeCtorMismatch { .. })
        ));
    }

    #[test]
    fn test_unify_shape_mismatch_fails() {
        let ty = Domain::Type {
            id: TypeId(0),
            args: vec![],
        };
        let func = Domain::Func {
            inputs: vec![],
            outputs: vec![],
            resources: Resources::Unknown,
        };
        assert!(unify_domains(&ty, &func).is_err());
        assert!(unify_domains(&int_domain(), &ty).is_err());
    }

    #[test]
    fn test_func_unification_always_delays() {
        let f1 = Domain::Func {
            inputs: vec![int_domain()],
            outputs: vec![int_domain()],
            resources: Resources::Unknown,
        };
        let u = unify_domains(&f1, &f1.clone()).unwrap();
        assert_eq!(u.status, UnifyStatus::Delayed);
    }

    #[test]
    fn test_func_unification_merges_resources() {
        let known = |ids: &[u32]| Resources::Known {
            used: ids.iter().map(|&i| ResourceId(i)).collect(),
            observed: BTreeSet::new(),
        };
        let f1 = Domain::Func {
            inputs: vec![],
            outputs: vec![],
            resources: known(&[0]),
        };
        let f2 = Domain::Func {
            inputs: vec![],
            outputs: vec![],
            resources: known(&[1]),
        };
        let u = unify_domains(&f1, &f2).unwrap();
        match u.domain {
            Domain::Func { resources, .. } => assert_eq!(resources, known(&[0, 1])),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_unify_resources_lattice() {
        let r = Resources::Known {
            used: [ResourceId(3)].into_iter().collect(),
            observed: [ResourceId(4)].into_iter().collect(),
        };
        assert_eq!(unify_resources(&Resources::Unknown, &r), r);
        assert_eq!(unify_resources(&r, &Resources::Unknown), r);
        assert_eq!(
            unify_resources(&Resources::Unknown, &Resources::Unknown),
            Resources::Unknown
        );
    }

    // ============================================================
    // Clause running
    // ============================================================

    #[test]
    fn test_single_literal_grounds_var() {
        let clauses = vec![Clause::Single(lit(LiteralKind::Builtin {
            var: named("x"),
            builtin: BuiltinType::Int,
        }))];
        let solution = solve(clauses).unwrap();
        assert_eq!(solution.domain(&named("x")), int_domain());
    }

    #[test]
    fn test_var_var_propagates_both_ways() {
        let clauses = vec![
            Clause::Single(lit(LiteralKind::VarVar(named("a"), named("b")))),
            Clause::Single(lit(LiteralKind::Builtin {
                var: named("b"),
                builtin: BuiltinType::Int,
            })),
        ];
        let solution = solve(clauses).unwrap();
        assert_eq!(solution.domain(&named("a")), int_domain());
    }

    #[test]
    fn test_conflicting_literals_fail() {
        let clauses = vec![
            Clause::Single(lit(LiteralKind::Builtin {
                var: named("x"),
                builtin: BuiltinType::Int,
            })),
            Clause::Single(lit(LiteralKind::Builtin {
                var: named("x"),
                builtin: BuiltinType::String,
            })),
        ];
        assert!(matches!(solve(clauses), Err(SolveError::Failure(_))));
    }

    #[test]
    fn test_disjunction_commits_last_survivor() {
        // x = String forces the String branch of {String, Codepoint}.
        let clauses = vec![
            Clause::Single(lit(LiteralKind::Builtin {
                var: named("x"),
                builtin: BuiltinType::String,
            })),
            Clause::Disj(vec![
                lit(LiteralKind::Builtin {
                    var: named("x"),
                    builtin: BuiltinType::String,
                }),
                lit(LiteralKind::Builtin {
                    var: named("x"),
                    builtin: BuiltinType::Codepoint,
                }),
            ]),
        ];
        let solution = solve(clauses).unwrap();
        assert_eq!(
            solution.domain(&named("x")),
            Domain::Builtin(BuiltinType::String)
        );
    }

    #[test]
    fn test_disjunction_all_fail() {
        let clauses = vec![
            Clause::Single(lit(LiteralKind::Builtin {
                var: named("x"),
                builtin: BuiltinType::Int,
            })),
            Clause::Disj(vec![
                lit(LiteralKind::Builtin {
                    var: named("x"),
                    builtin: BuiltinType::String,
                }),
                lit(LiteralKind::Builtin {
                    var: named("x"),
                    builtin: BuiltinType::Codepoint,
                }),
            ]),
        ];
        assert!(matches!(solve(clauses), Err(SolveError::Failure(_))));
    }

    #[test]
    fn test_undecided_disjunction_on_anon_var_is_accepted() {
        // An anonymous variable may stay free; the ambiguous literal is
        // simply left outstanding.
        let clauses = vec![Clause::Disj(vec![
            lit(LiteralKind::Builtin {
                var: SolverVar::Anon(0),
                builtin: BuiltinType::String,
            }),
            lit(LiteralKind::Builtin {
                var: SolverVar::Anon(0),
                builtin: BuiltinType::Codepoint,
            }),
        ])];
        assert!(solve(clauses).is_ok());
    }

    #[test]
    fn test_undecided_disjunction_on_named_var_is_ambiguous() {
        let clauses = vec![Clause::Disj(vec![
            lit(LiteralKind::Builtin {
                var: named("s"),
                builtin: BuiltinType::String,
            }),
            lit(LiteralKind::Builtin {
                var: named("s"),
                builtin: BuiltinType::Codepoint,
            }),
        ])];
        assert!(matches!(solve(clauses), Err(SolveError::Ambiguous { .. })));
    }

    #[test]
    fn test_unbound_named_var_without_choice_flounders() {
        // Two named variables equated with nothing to ground them.
        let clauses = vec![Clause::Single(lit(LiteralKind::VarVar(
            named("a"),
            named("b"),
        )))];
        assert!(matches!(solve(clauses), Err(SolveError::Flounder { .. })));
    }

    #[test]
    fn test_solver_is_idempotent() {
        let clauses = || {
            vec![
                Clause::Single(lit(LiteralKind::VarVar(named("a"), named("b")))),
                Clause::Single(lit(LiteralKind::Builtin {
                    var: named("a"),
                    builtin: BuiltinType::Int,
                })),
            ]
        };
        let first = solve(clauses()).unwrap();
        let second = solve(clauses()).unwrap();
        assert_eq!(first.domain(&named("a")), second.domain(&named("a")));
        assert_eq!(first.domain(&named("b")), second.domain(&named("b")));
    }

    #[test]
    fn test_higher_order_resource_flow() {
        // f is used as func(Int) -> Int with unknown resources, then
        // bound to a concrete signature with a resource; the resource
        // survives in f's domain.
        let res: BTreeSet<ResourceId> = [ResourceId(0)].into_iter().collect();
        let clauses = vec![
            Clause::Single(lit(LiteralKind::Func {
                var: named("f"),
                inputs: vec![SolverVar::Anon(0)],
                outputs: vec![SolverVar::Anon(1)],
                resources: None,
            })),
            Clause::Single(lit(LiteralKind::Func {
                var: named("f"),
                inputs: vec![SolverVar::Anon(2)],
                outputs: vec![SolverVar::Anon(3)],
                resources: Some((res.clone(), BTreeSet::new())),
            })),
            Clause::Single(lit(LiteralKind::Builtin {
                var: SolverVar::Anon(0),
                builtin: BuiltinType::Int,
            })),
            Clause::Single(lit(LiteralKind::Builtin {
                var: SolverVar::Anon(1),
                builtin: BuiltinType::Int,
            })),
            Clause::Single(lit(LiteralKind::Builtin {
                var: SolverVar::Anon(2),
                builtin: BuiltinType::Int,
            })),
            Clause::Single(lit(LiteralKind::Builtin {
                var: SolverVar::Anon(3),
                builtin: BuiltinType::Int,
            })),
        ];
        let solution = solve(clauses).unwrap();
        match solution.domain(&named("f")) {
            Domain::Func { resources, .. } => {
                assert_eq!(
                    resources,
                    Resources::Known {
                        used: res,
                        observed: BTreeSet::new()
                    }
                );
            }
            other => panic!("unexpected {other}"),
        }
    }
}
