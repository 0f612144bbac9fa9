//! The typed-core IR the checker consumes.
//!
//! Expressions are ANF-flavoured: scrutinees and higher-order callees are
//! variables, and every expression carries the source context the
//! front-end attached to it. The lowering pass that produces this IR is
//! an external collaborator; the constructors here exist for it and for
//! tests.

use crate::context::Context;
use crate::types::{CtorId, FuncId};

/// A core expression.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub context: Context,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    /// A variable reference.
    Var(String),
    /// An integer constant.
    IntLit(i64),
    /// A string constant. Single-codepoint literals may also be typed as
    /// `Codepoint`.
    StrLit(String),
    /// A reference to a declared function as a value.
    FuncRef(FuncId),
    /// Multiple values; the results concatenate.
    Tuple(Vec<Expr>),
    Let {
        name: String,
        value: Box<Expr>,
        body: Box<Expr>,
    },
    /// A first-order call to a declared function.
    Call {
        callee: FuncId,
        args: Vec<Expr>,
    },
    /// A call through a variable of function type.
    HoCall {
        callee: String,
        args: Vec<Expr>,
    },
    Match {
        scrutinee: String,
        cases: Vec<Case>,
    },
    /// Construct a value. The constructor name may be ambiguous in the
    /// source, hence a candidate set.
    Construction {
        ctors: Vec<CtorId>,
        args: Vec<Expr>,
    },
    /// Build a closure over a declared function.
    MakeClosure {
        func: FuncId,
        captured: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Case {
    pub pattern: Pattern,
    pub body: Expr,
}

#[derive(Debug, Clone)]
pub enum Pattern {
    /// Deconstruct with one of the candidate constructors, binding the
    /// fields to fresh variables.
    Ctor {
        ctors: Vec<CtorId>,
        binds: Vec<String>,
    },
    /// Bind the whole scrutinee.
    Var(String),
    /// Match an integer constant.
    Num(i64),
}

impl Expr {
    pub fn new(kind: ExprKind, context: Context) -> Self {
        Self { kind, context }
    }

    pub fn var(name: &str) -> Self {
        Self::new(ExprKind::Var(name.to_string()), Context::Nil)
    }

    pub fn int(value: i64) -> Self {
        Self::new(ExprKind::IntLit(value), Context::Nil)
    }

    pub fn string(value: &str) -> Self {
        Self::new(ExprKind::StrLit(value.to_string()), Context::Nil)
    }

    pub fn func_ref(func: FuncId) -> Self {
        Self::new(ExprKind::FuncRef(func), Context::Nil)
    }

    pub fn tuple(items: Vec<Expr>) -> Self {
        Self::new(ExprKind::Tuple(items), Context::Nil)
    }

    pub fn let_(name: &str, value: Expr, body: Expr) -> Self {
        Self::new(
            ExprKind::Let {
                name: name.to_string(),
                value: Box::new(value),
                body: Box::new(body),
            },
            Context::Nil,
        )
    }

    pub fn call(callee: FuncId, args: Vec<Expr>) -> Self {
        Self::new(ExprKind::Call { callee, args }, Context::Nil)
    }

    pub fn ho_call(callee: &str, args: Vec<Expr>) -> Self {
        Self::new(
            ExprKind::HoCall {
                callee: callee.to_string(),
                args,
            },
            Context::Nil,
        )
    }

    pub fn construction(ctors: Vec<CtorId>, args: Vec<Expr>) -> Self {
        Self::new(ExprKind::Construction { ctors, args }, Context::Nil)
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }
}
