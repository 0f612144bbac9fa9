//! # Plasma Compiler Core
//!
//! The compiler half of Plasma: the typed-core IR, the type-constraint
//! solver, and the PZ writer.
//!
//! ## Pipeline
//!
//! ```text
//! Source -> Parser -> AST -> Core IR -> Type Check -> Lowering -> PZ file
//!                            ^^^^^^^^^^^^^^^^^^^^^               ^^^^^^^
//!                            this crate's centre                 pz::write
//! ```
//!
//! The parser, AST and the lowering pass live with the driver; this
//! crate provides what they plug into:
//!
//! - [`core`] - the ANF-flavoured typed-core expression IR
//! - [`types`] - source types, builtins, and the program environment
//! - [`typeck`] - constraint generation, the solver, result write-back
//! - [`pz`] - PZ module structures and the bit-exact writer
//! - [`diagnostics`] - pretty error reports over source contexts
//! - [`context`] - source contexts attached to expressions and literals
//!
//! ## Type checking
//!
//! ```rust
//! use plasmac::core::Expr;
//! use plasmac::typeck;
//! use plasmac::types::{BuiltinType, FuncDecl, FuncType, Program, Type};
//!
//! let mut program = Program::new();
//! let ident = program.add_func(FuncDecl {
//!     name: "ident".to_string(),
//!     params: vec!["x".to_string()],
//!     sig: FuncType {
//!         inputs: vec![Type::Builtin(BuiltinType::Int)],
//!         outputs: vec![Type::Builtin(BuiltinType::Int)],
//!         ..FuncType::default()
//!     },
//!     captured: vec![],
//! });
//!
//! let solved = typeck::typecheck_func(&program, ident, &Expr::var("x")).unwrap();
//! assert_eq!(solved.var_types["x"], Type::Builtin(BuiltinType::Int));
//! ```

pub mod context;
pub mod core;
pub mod diagnostics;
pub mod options;
pub mod pz;
pub mod typeck;
pub mod types;

pub use context::Context;
pub use diagnostics::DiagnosticEmitter;
pub use options::CompileOptions;
pub use typeck::error::TypeError;
pub use typeck::{typecheck_func, SolvedTypes};

/// Compiler version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
