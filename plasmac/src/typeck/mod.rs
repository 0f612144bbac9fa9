//! Type checking: constraint generation, solving and result write-back.
//!
//! The driver walks a function's core-IR body, posting constraints for
//! every expression, normalises them to clauses, runs the solver, and
//! converts the accepted domains back into source types.
//!
//! Source type variables are mapped to solver variables through a scoped
//! mapping: each signature use opens a fresh scope, so a `T` in one
//! declaration never collides with a `T` in another.

pub mod constraints;
pub mod error;
pub mod solver;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use constraints::{Constraint, Literal, LiteralKind, SolverVar};
use error::TypeError;
use solver::{Domain, Resources};

use crate::context::Context;
use crate::core::{Expr, ExprKind, Pattern};
use crate::types::{BuiltinType, CtorId, FuncId, FuncType, Program, ResourceId, Type};

/// The solved types of one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolvedTypes {
    /// The type of every named variable in the body, parameters included.
    pub var_types: BTreeMap<String, Type>,
    /// The types of the function's outputs.
    pub output_types: Vec<Type>,
    /// Resources used and observed by the body.
    pub uses: BTreeSet<ResourceId>,
    pub observes: BTreeSet<ResourceId>,
}

/// How source type variables map to solver variables in the current
/// scope.
enum TypeVarMode {
    /// The enclosing declaration's own variables: universally
    /// quantified, so they ground to `univ_var` domains.
    Declare,
    /// A call-site instantiation: fresh variables that unify freely.
    Instantiate,
}

struct Typechecker<'p> {
    program: &'p Program,
    constraints: Vec<Constraint>,
    anon_counter: u32,
    type_var_counter: u32,
    type_var_scopes: Vec<HashMap<String, SolverVar>>,
    uses: BTreeSet<ResourceId>,
    observes: BTreeSet<ResourceId>,
    /// Higher-order callee variables, checked for resources afterwards.
    ho_callees: Vec<SolverVar>,
}

/// Type-check one function body against its declaration.
pub fn typecheck_func(
    program: &Program,
    func: FuncId,
    body: &Expr,
) -> Result<SolvedTypes, TypeError> {
    let mut tc = Typechecker {
        program,
        constraints: Vec::new(),
        anon_counter: 0,
        type_var_counter: 0,
        type_var_scopes: Vec::new(),
        uses: BTreeSet::new(),
        observes: BTreeSet::new(),
        ho_callees: Vec::new(),
    };

    let decl = program.func(func);
    if decl.params.len() != decl.sig.inputs.len() {
        return Err(TypeError::BadProgram {
            message: format!(
                "function {} declares {} parameters but {} input types",
                decl.name,
                decl.params.len(),
                decl.sig.inputs.len()
            ),
            context: body.context.clone(),
        });
    }

    // The declaration's own signature: its type variables are
    // universally quantified for the duration of this check.
    tc.start_type_var_mapping();
    for (name, ty) in decl.params.iter().zip(decl.sig.inputs.iter()) {
        let var = SolverVar::Named(name.clone());
        tc.constrain_var_to_type(var, ty, &TypeVarMode::Declare, &body.context);
    }
    for (index, ty) in decl.sig.outputs.iter().enumerate() {
        let var = SolverVar::Output(index as u32);
        tc.constrain_var_to_type(var, ty, &TypeVarMode::Declare, &body.context);
    }

    let results = tc.constrain_expr(body)?;
    if results.len() != decl.sig.outputs.len() {
        return Err(TypeError::BadProgram {
            message: format!(
                "function {} returns {} values but its body produces {}",
                decl.name,
                decl.sig.outputs.len(),
                results.len()
            ),
            context: body.context.clone(),
        });
    }
    for (index, var) in results.into_iter().enumerate() {
        tc.post(
            LiteralKind::VarVar(var, SolverVar::Output(index as u32)),
            &body.context,
        );
    }
    tc.end_type_var_mapping();

    let clauses = constraints::to_clauses(Constraint::Conj(std::mem::take(&mut tc.constraints)));
    tracing::debug!(num_clauses = clauses.len(), func = %decl.name, "solving");
    let solution = solver::solve(clauses)?;

    // Write back: named variables and outputs become source types.
    let mut var_types = BTreeMap::new();
    for (var, domain) in solution.iter() {
        if let SolverVar::Named(name) = var {
            var_types.insert(name.clone(), tc.domain_to_type(domain));
        }
    }
    let output_types = (0..decl.sig.outputs.len())
        .map(|index| tc.domain_to_type(&solution.domain(&SolverVar::Output(index as u32))))
        .collect();

    // Resources: everything first-order calls declared, plus whatever
    // the solver learnt about higher-order callees.
    let mut uses = tc.uses.clone();
    let mut observes = tc.observes.clone();
    for callee in &tc.ho_callees {
        if let Domain::Func {
            resources: Resources::Known { used, observed },
            ..
        } = solution.domain(callee)
        {
            uses.extend(used.iter().copied());
            observes.extend(observed.iter().copied());
        }
    }

    Ok(SolvedTypes {
        var_types,
        output_types,
        uses,
        observes,
    })
}

impl<'p> Typechecker<'p> {
    fn post(&mut self, kind: LiteralKind, context: &Context) {
        self.constraints
            .push(Constraint::Lit(Literal::new(kind, context.clone())));
    }

    fn fresh_anon(&mut self) -> SolverVar {
        let var = SolverVar::Anon(self.anon_counter);
        self.anon_counter += 1;
        var
    }

    fn start_type_var_mapping(&mut self) {
        self.type_var_scopes.push(HashMap::new());
    }

    fn end_type_var_mapping(&mut self) {
        self.type_var_scopes
            .pop()
            .expect("type-var scopes are balanced");
    }

    /// Intern a source type variable in the innermost scope.
    fn get_or_make_type_var(
        &mut self,
        name: &str,
        mode: &TypeVarMode,
        context: &Context,
    ) -> SolverVar {
        let scope = self
            .type_var_scopes
            .last()
            .expect("a type-var scope is open");
        if let Some(var) = scope.get(name) {
            return var.clone();
        }
        let var = SolverVar::TypeVar(self.type_var_counter);
        self.type_var_counter += 1;
        self.type_var_scopes
            .last_mut()
            .unwrap()
            .insert(name.to_string(), var.clone());
        if matches!(mode, TypeVarMode::Declare) {
            self.post(
                LiteralKind::FreeTypeVar {
                    var: var.clone(),
                    name: name.to_string(),
                },
                context,
            );
        }
        var
    }

    /// Constrain `var` to a declared type, descending user types and
    /// function types.
    fn constrain_var_to_type(
        &mut self,
        var: SolverVar,
        ty: &Type,
        mode: &TypeVarMode,
        context: &Context,
    ) {
        match ty {
            Type::Builtin(builtin) => {
                self.post(
                    LiteralKind::Builtin {
                        var,
                        builtin: *builtin,
                    },
                    context,
                );
            }
            Type::Var(name) => {
                let tv = self.get_or_make_type_var(name, mode, context);
                self.post(LiteralKind::VarVar(var, tv), context);
            }
            Type::Ref(type_id, args) => {
                let arg_vars: Vec<SolverVar> = args.iter().map(|_| self.fresh_anon()).collect();
                self.post(
                    LiteralKind::UserType {
                        var,
                        type_id: *type_id,
                        args: arg_vars.clone(),
                    },
                    context,
                );
                for (arg_var, arg_ty) in arg_vars.into_iter().zip(args.iter()) {
                    self.constrain_var_to_type(arg_var, arg_ty, mode, context);
                }
            }
            Type::Func(ft) => {
                let (inputs, outputs) = self.constrain_func_shape(ft, mode, context);
                self.post(
                    LiteralKind::Func {
                        var,
                        inputs,
                        outputs,
                        resources: Some((ft.uses.clone(), ft.observes.clone())),
                    },
                    context,
                );
            }
        }
    }

    /// Fresh variables for a function type's inputs and outputs, each
    /// constrained to its declared type.
    fn constrain_func_shape(
        &mut self,
        ft: &FuncType,
        mode: &TypeVarMode,
        context: &Context,
    ) -> (Vec<SolverVar>, Vec<SolverVar>) {
        let inputs: Vec<SolverVar> = ft.inputs.iter().map(|_| self.fresh_anon()).collect();
        let outputs: Vec<SolverVar> = ft.outputs.iter().map(|_| self.fresh_anon()).collect();
        for (var, ty) in inputs.iter().zip(ft.inputs.iter()) {
            self.constrain_var_to_type(var.clone(), ty, mode, context);
        }
        for (var, ty) in outputs.iter().zip(ft.outputs.iter()) {
            self.constrain_var_to_type(var.clone(), ty, mode, context);
        }
        (inputs, outputs)
    }

    /// Post the constraints for one expression; returns its result
    /// variables.
    fn constrain_expr(&mut self, expr: &Expr) -> Result<Vec<SolverVar>, TypeError> {
        let context = &expr.context;
        match &expr.kind {
            ExprKind::Var(name) => Ok(vec![SolverVar::Named(name.clone())]),

            ExprKind::IntLit(_) => {
                let var = self.fresh_anon();
                self.post(
                    LiteralKind::Builtin {
                        var: var.clone(),
                        builtin: BuiltinType::Int,
                    },
                    context,
                );
                Ok(vec![var])
            }

            ExprKind::StrLit(value) => {
                let var = self.fresh_anon();
                if value.chars().count() == 1 {
                    // A one-codepoint literal can be either a string or a
                    // codepoint; context picks the branch.
                    self.constraints.push(Constraint::Disj(vec![
                        Constraint::Lit(Literal::new(
                            LiteralKind::Builtin {
                                var: var.clone(),
                                builtin: BuiltinType::String,
                            },
                            context.clone(),
                        )),
                        Constraint::Lit(Literal::new(
                            LiteralKind::Builtin {
                                var: var.clone(),
                                builtin: BuiltinType::Codepoint,
                            },
                            context.clone(),
                        )),
                    ]));
                } else {
                    self.post(
                        LiteralKind::Builtin {
                            var: var.clone(),
                            builtin: BuiltinType::String,
                        },
                        context,
                    );
                }
                Ok(vec![var])
            }

            ExprKind::FuncRef(func) => {
                let var = self.fresh_anon();
                self.constrain_to_func_sig(var.clone(), *func, context);
                Ok(vec![var])
            }

            ExprKind::Tuple(items) => {
                let mut results = Vec::new();
                for item in items {
                    results.extend(self.constrain_expr(item)?);
                }
                Ok(results)
            }

            ExprKind::Let { name, value, body } => {
                let value_vars = self.constrain_expr(value)?;
                if value_vars.len() != 1 {
                    return Err(TypeError::BadProgram {
                        message: format!(
                            "let of {} binds one name to {} values",
                            name,
                            value_vars.len()
                        ),
                        context: context.clone(),
                    });
                }
                self.post(
                    LiteralKind::VarVar(
                        SolverVar::Named(name.clone()),
                        value_vars.into_iter().next().unwrap(),
                    ),
                    context,
                );
                self.constrain_expr(body)
            }

            ExprKind::Call { callee, args } => {
                let decl = self.program.func(*callee);
                if args.len() != decl.sig.inputs.len() {
                    return Err(TypeError::BadProgram {
                        message: format!(
                            "{} takes {} arguments but {} were given",
                            decl.name,
                            decl.sig.inputs.len(),
                            args.len()
                        ),
                        context: context.clone(),
                    });
                }
                self.uses.extend(decl.sig.uses.iter().copied());
                self.observes.extend(decl.sig.observes.iter().copied());
                let input_types = decl.sig.inputs.clone();
                let output_types = decl.sig.outputs.clone();

                self.start_type_var_mapping();
                for (arg, ty) in args.iter().zip(input_types.iter()) {
                    let arg_vars = self.constrain_expr(arg)?;
                    let arg_var = single(arg_vars, context)?;
                    self.constrain_var_to_type(arg_var, ty, &TypeVarMode::Instantiate, context);
                }
                let mut results = Vec::new();
                for ty in output_types.iter() {
                    let var = self.fresh_anon();
                    self.constrain_var_to_type(
                        var.clone(),
                        ty,
                        &TypeVarMode::Instantiate,
                        context,
                    );
                    results.push(var);
                }
                self.end_type_var_mapping();
                Ok(results)
            }

            ExprKind::HoCall { callee, args } => {
                let mut arg_vars = Vec::new();
                for arg in args {
                    let vars = self.constrain_expr(arg)?;
                    arg_vars.push(single(vars, context)?);
                }
                let result = self.fresh_anon();
                let callee_var = SolverVar::Named(callee.clone());
                self.ho_callees.push(callee_var.clone());
                self.post(
                    LiteralKind::Func {
                        var: callee_var,
                        inputs: arg_vars,
                        outputs: vec![result.clone()],
                        resources: None,
                    },
                    context,
                );
                Ok(vec![result])
            }

            ExprKind::Match { scrutinee, cases } => {
                let scrutinee_var = SolverVar::Named(scrutinee.clone());
                let mut first_results: Option<Vec<SolverVar>> = None;
                for case in cases {
                    self.constrain_pattern(&scrutinee_var, &case.pattern, context)?;
                    let results = self.constrain_expr(&case.body)?;
                    match &first_results {
                        None => first_results = Some(results),
                        Some(firsts) => {
                            if firsts.len() != results.len() {
                                return Err(TypeError::BadProgram {
                                    message: "match cases produce different numbers of values"
                                        .to_string(),
                                    context: context.clone(),
                                });
                            }
                            for (a, b) in firsts.iter().zip(results.iter()) {
                                self.post(
                                    LiteralKind::VarVar(a.clone(), b.clone()),
                                    &case.body.context,
                                );
                            }
                        }
                    }
                }
                first_results.ok_or_else(|| TypeError::BadProgram {
                    message: format!("match on {scrutinee} has no cases"),
                    context: context.clone(),
                })
            }

            ExprKind::Construction { ctors, args } => {
                let result = self.fresh_anon();
                let mut arg_vars = Vec::new();
                for arg in args {
                    let vars = self.constrain_expr(arg)?;
                    arg_vars.push(single(vars, context)?);
                }
                let constraint =
                    self.ctor_disjunction(&result, ctors, &arg_vars, context)?;
                self.constraints.push(constraint);
                Ok(vec![result])
            }

            ExprKind::MakeClosure { func, captured } => {
                let var = self.fresh_anon();
                self.constrain_to_func_sig(var.clone(), *func, context);

                let decl = self.program.func(*func);
                if captured.len() != decl.captured.len() {
                    return Err(TypeError::BadProgram {
                        message: format!(
                            "{} captures {} variables but {} were provided",
                            decl.name,
                            decl.captured.len(),
                            captured.len()
                        ),
                        context: context.clone(),
                    });
                }
                let captured_types = decl.captured.clone();
                self.start_type_var_mapping();
                for (name, ty) in captured.iter().zip(captured_types.iter()) {
                    self.constrain_var_to_type(
                        SolverVar::Named(name.clone()),
                        ty,
                        &TypeVarMode::Instantiate,
                        context,
                    );
                }
                self.end_type_var_mapping();
                Ok(vec![var])
            }
        }
    }

    /// Constrain `var` to a declared function's signature, instantiated
    /// in a fresh type-var scope.
    fn constrain_to_func_sig(&mut self, var: SolverVar, func: FuncId, context: &Context) {
        let sig = self.program.func(func).sig.clone();
        self.start_type_var_mapping();
        let (inputs, outputs) =
            self.constrain_func_shape(&sig, &TypeVarMode::Instantiate, context);
        self.post(
            LiteralKind::Func {
                var,
                inputs,
                outputs,
                resources: Some((sig.uses.clone(), sig.observes.clone())),
            },
            context,
        );
        self.end_type_var_mapping();
    }

    fn constrain_pattern(
        &mut self,
        scrutinee: &SolverVar,
        pattern: &Pattern,
        context: &Context,
    ) -> Result<(), TypeError> {
        match pattern {
            Pattern::Var(name) => {
                self.post(
                    LiteralKind::VarVar(SolverVar::Named(name.clone()), scrutinee.clone()),
                    context,
                );
                Ok(())
            }
            Pattern::Num(_) => {
                self.post(
                    LiteralKind::Builtin {
                        var: scrutinee.clone(),
                        builtin: BuiltinType::Int,
                    },
                    context,
                );
                Ok(())
            }
            Pattern::Ctor { ctors, binds } => {
                let bind_vars: Vec<SolverVar> = binds
                    .iter()
                    .map(|name| SolverVar::Named(name.clone()))
                    .collect();
                let constraint = self.ctor_disjunction(scrutinee, ctors, &bind_vars, context)?;
                self.constraints.push(constraint);
                Ok(())
            }
        }
    }

    /// A disjunction over candidate constructors: for each, the subject
    /// is the constructor's owning type and the field variables take the
    /// field types.
    fn ctor_disjunction(
        &mut self,
        subject: &SolverVar,
        ctors: &[CtorId],
        field_vars: &[SolverVar],
        context: &Context,
    ) -> Result<Constraint, TypeError> {
        let mut branches = Vec::new();
        for &ctor_id in ctors {
            let ctor = self.program.ctor(ctor_id).clone();
            if ctor.fields.len() != field_vars.len() {
                // Wrong arity cannot match; drop the candidate.
                continue;
            }
            let type_def = self.program.type_def(ctor.owner).clone();

            let param_vars: Vec<SolverVar> =
                type_def.params.iter().map(|_| self.fresh_anon()).collect();
            let param_map: HashMap<&str, &SolverVar> = type_def
                .params
                .iter()
                .map(|p| p.as_str())
                .zip(param_vars.iter())
                .collect();

            let mut parts = vec![Constraint::Lit(Literal::new(
                LiteralKind::UserType {
                    var: subject.clone(),
                    type_id: ctor.owner,
                    args: param_vars.clone(),
                },
                context.clone(),
            ))];
            for (field_var, field_ty) in field_vars.iter().zip(ctor.fields.iter()) {
                parts.push(self.constrain_ctor_field(field_var, field_ty, &param_map, context));
            }
            branches.push(Constraint::Conj(parts));
        }

        if branches.is_empty() {
            return Err(TypeError::BadProgram {
                message: format!("no constructor takes {} arguments here", field_vars.len()),
                context: context.clone(),
            });
        }
        Ok(Constraint::Disj(branches))
    }

    /// Constrain one constructor field against its declared type,
    /// substituting the owner's parameters.
    ///
    /// Substitution is single-level: it descends user-type arguments but
    /// not function types appearing in field positions.
    fn constrain_ctor_field(
        &mut self,
        var: &SolverVar,
        field_ty: &Type,
        param_map: &HashMap<&str, &SolverVar>,
        context: &Context,
    ) -> Constraint {
        match field_ty {
            Type::Var(name) => match param_map.get(name.as_str()) {
                Some(&param_var) => Constraint::Lit(Literal::new(
                    LiteralKind::VarVar(var.clone(), param_var.clone()),
                    context.clone(),
                )),
                None => {
                    // A type variable that is not an owner parameter has
                    // no binding here; leave the field unconstrained.
                    Constraint::Lit(Literal::truth())
                }
            },
            Type::Builtin(builtin) => Constraint::Lit(Literal::new(
                LiteralKind::Builtin {
                    var: var.clone(),
                    builtin: *builtin,
                },
                context.clone(),
            )),
            Type::Ref(type_id, args) => {
                let arg_vars: Vec<SolverVar> = args.iter().map(|_| self.fresh_anon()).collect();
                let mut parts = vec![Constraint::Lit(Literal::new(
                    LiteralKind::UserType {
                        var: var.clone(),
                        type_id: *type_id,
                        args: arg_vars.clone(),
                    },
                    context.clone(),
                ))];
                for (arg_var, arg_ty) in arg_vars.iter().zip(args.iter()) {
                    parts.push(self.constrain_ctor_field(arg_var, arg_ty, param_map, context));
                }
                Constraint::Conj(parts)
            }
            Type::Func(ft) => {
                let (inputs, outputs) =
                    self.constrain_func_shape_no_params(ft, context);
                Constraint::Lit(Literal::new(
                    LiteralKind::Func {
                        var: var.clone(),
                        inputs,
                        outputs,
                        resources: Some((ft.uses.clone(), ft.observes.clone())),
                    },
                    context.clone(),
                ))
            }
        }
    }

    /// Like [`Self::constrain_func_shape`] but without parameter
    /// substitution; type variables inside the function type are left
    /// free.
    fn constrain_func_shape_no_params(
        &mut self,
        ft: &FuncType,
        context: &Context,
    ) -> (Vec<SolverVar>, Vec<SolverVar>) {
        self.start_type_var_mapping();
        let shape = self.constrain_func_shape(ft, &TypeVarMode::Instantiate, context);
        self.end_type_var_mapping();
        shape
    }

    /// Convert an accepted domain back to a source type. Free domains
    /// surviving on named variables are a solver bug.
    fn domain_to_type(&self, domain: &Domain) -> Type {
        match domain {
            Domain::Free => unreachable!("accepted solution left a named variable free"),
            Domain::Builtin(builtin) => Type::Builtin(*builtin),
            Domain::UnivVar(name) => Type::Var(name.clone()),
            Domain::Type { id, args } => Type::Ref(
                *id,
                args.iter().map(|arg| self.domain_to_type(arg)).collect(),
            ),
            Domain::Func {
                inputs,
                outputs,
                resources,
            } => {
                let (uses, observes) = match resources {
                    Resources::Unknown => (BTreeSet::new(), BTreeSet::new()),
                    Resources::Known { used, observed } => (used.clone(), observed.clone()),
                };
                Type::Func(Box::new(FuncType {
                    inputs: inputs.iter().map(|d| self.domain_to_type(d)).collect(),
                    outputs: outputs.iter().map(|d| self.domain_to_type(d)).collect(),
                    uses,
                    observes,
                }))
            }
        }
    }
}

fn single(vars: Vec<SolverVar>, context: &Context) -> Result<SolverVar, TypeError> {
    if vars.len() == 1 {
        Ok(vars.into_iter().next().unwrap())
    } else {
        Err(TypeError::BadProgram {
            message: format!("expected a single value, found {}", vars.len()),
            context: context.clone(),
        })
    }
}
