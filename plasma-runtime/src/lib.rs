//! # Plasma Runtime Library
//!
//! The runtime half of Plasma: everything needed to take a compiled PZ
//! module from bytes on disk to a running program.
//!
//! ## Components
//!
//! ```text
//! PZ file -> loader -> Library -> interpreter
//!                 \________ GC heap ________/
//! ```
//!
//! - [`binary`] - little-endian primitive reads over a PZ byte stream
//! - [`format`] - the PZ format constants and the static opcode table
//! - [`gc`] - the conservative mark/sweep heap and the capability chain
//!   that gates allocation and collection
//! - [`library`] - loaded modules: structs, data, procs, closures, exports
//! - [`loader`] - the two-pass reader that resolves every reference
//! - [`interp`] - the stack interpreter
//! - [`builtins`] - the `builtin` pseudo-library of native closures
//! - [`machine`] - the top-level state tying the above together
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use plasma_runtime::machine::{Machine, MachineOptions};
//! use plasma_runtime::{builtins, interp, loader};
//!
//! let machine = Machine::new(MachineOptions::default()).unwrap();
//! machine.add_library("builtin", builtins::make_builtin_library(&machine));
//!
//! let module = loader::read(&machine, "hello.pz".as_ref()).unwrap();
//! let name = module.name.clone().unwrap_or_else(|| "main".to_string());
//! machine.add_library(name.clone(), module.library);
//!
//! let code = machine
//!     .with_library(&name, |lib| interp::run(&machine, lib, &[]))
//!     .unwrap()
//!     .unwrap();
//! std::process::exit(code);
//! ```

pub mod binary;
pub mod builtins;
pub mod format;
pub mod gc;
pub mod interp;
pub mod library;
pub mod loader;
pub mod machine;

pub use format::{EntrySignature, Opcode, Width};
pub use library::{Closure, Export, Library};
pub use loader::{LoadError, LoadedModule};
pub use machine::{Machine, MachineOptions};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
