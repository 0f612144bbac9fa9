//! The PZ interpreter driver.
//!
//! ```text
//! pzrun [-v] <file.pz> [args...]
//! ```
//!
//! Exit code: 0 on success, non-zero on a load error, otherwise whatever
//! the entry closure returns.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use plasma_runtime::gc::HeapOptions;
use plasma_runtime::machine::{Machine, MachineOptions};
use plasma_runtime::{builtins, interp, loader};

/// Execute a compiled Plasma program.
#[derive(Parser)]
#[command(name = "pzrun")]
#[command(version = plasma_runtime::VERSION)]
#[command(about = "The Plasma abstract machine", long_about = None)]
struct Cli {
    /// Verbose output: loader progress, GC activity, debug contexts
    #[arg(short, long)]
    verbose: bool,

    /// The PZ program to run
    #[arg(value_name = "FILE.pz")]
    file: PathBuf,

    /// Arguments passed to the program's entry closure
    #[arg(value_name = "ARGS", trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let options = MachineOptions {
        heap: HeapOptions::from_env(),
        verbose: cli.verbose,
    };
    let machine = match Machine::new(options) {
        Ok(machine) => machine,
        Err(error) => {
            eprintln!("pzrun: cannot set up the heap: {error}");
            return ExitCode::FAILURE;
        }
    };

    machine.add_library(
        builtins::BUILTIN_MODULE,
        builtins::make_builtin_library(&machine),
    );

    let module = match loader::read(&machine, &cli.file) {
        Ok(module) => module,
        Err(error) => {
            eprintln!("pzrun: {error}");
            return ExitCode::FAILURE;
        }
    };

    let name = module
        .name
        .clone()
        .or_else(|| {
            cli.file
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "main".to_string());
    machine.add_library(name.clone(), module.library);

    let result = machine
        .with_library(&name, |library| interp::run(&machine, library, &cli.args))
        .expect("library was just registered");

    match result {
        Ok(code) => ExitCode::from(code.rem_euclid(256) as u8),
        Err(error) => {
            eprintln!("pzrun: {error}");
            ExitCode::FAILURE
        }
    }
}
