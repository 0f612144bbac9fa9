//! The top-level runtime state.
//!
//! A [`Machine`] owns the heap and every loaded library, including the
//! builtin pseudo-library. It sits at the bottom of the GC capability
//! chain and traces all libraries' roots during a collection.
//!
//! Program output flows through the machine's sink, which defaults to
//! stdout and can be replaced, e.g. to capture a program's output in a
//! test.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Write};

use crate::gc::capability::{GcCapability, GcMode, Tracer};
use crate::gc::{Heap, HeapOptions, MarkState};
use crate::library::{Export, Library};

/// Runtime configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct MachineOptions {
    pub heap: HeapOptions,
    /// Verbose mode: progress logging and loading of debug contexts.
    pub verbose: bool,
}

/// The abstract machine: heap plus loaded libraries.
pub struct Machine {
    heap: Heap,
    options: MachineOptions,
    libraries: RefCell<HashMap<String, Library>>,
    output: RefCell<Box<dyn Write>>,
}

impl Machine {
    pub fn new(options: MachineOptions) -> io::Result<Machine> {
        Ok(Machine {
            heap: Heap::new(options.heap)?,
            options,
            libraries: RefCell::new(HashMap::new()),
            output: RefCell::new(Box::new(io::stdout())),
        })
    }

    /// Replace the program-output sink.
    pub fn set_output(&self, output: Box<dyn Write>) {
        *self.output.borrow_mut() = output;
    }

    /// Write program output (the `builtin.print` path) through the sink.
    pub fn write_output(&self, bytes: &[u8]) -> io::Result<()> {
        self.output.borrow_mut().write_all(bytes)
    }

    /// Flush the program-output sink.
    pub fn flush_output(&self) -> io::Result<()> {
        self.output.borrow_mut().flush()
    }

    pub fn options(&self) -> &MachineOptions {
        &self.options
    }

    /// Whether the loader should keep debug contexts.
    pub fn load_debuginfo(&self) -> bool {
        self.options.verbose
    }

    pub fn add_library(&self, name: impl Into<String>, library: Library) {
        self.libraries.borrow_mut().insert(name.into(), library);
    }

    pub fn has_library(&self, name: &str) -> bool {
        self.libraries.borrow().contains_key(name)
    }

    /// Look up `qualified` (a `module.symbol` name) in the named module's
    /// export table.
    pub fn lookup_symbol(&self, module: &str, qualified: &str) -> Option<Export> {
        self.libraries
            .borrow()
            .get(module)
            .and_then(|lib| lib.lookup_symbol(qualified))
    }

    /// Run `f` with a borrow of the named library.
    pub fn with_library<R>(&self, name: &str, f: impl FnOnce(&Library) -> R) -> Option<R> {
        self.libraries.borrow().get(name).map(f)
    }
}

impl GcCapability for Machine {
    fn heap(&self) -> &Heap {
        &self.heap
    }
    fn mode(&self) -> GcMode {
        GcMode::CanGc
    }
    fn parent(&self) -> Option<&dyn GcCapability> {
        None
    }
    fn tracer(&self) -> Option<&dyn Tracer> {
        Some(self)
    }
}

impl Tracer for Machine {
    fn do_trace(&self, state: &mut MarkState<'_>) {
        for library in self.libraries.borrow().values() {
            library.trace_roots(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_library_registry() {
        let machine = Machine::new(MachineOptions::default()).unwrap();
        assert!(!machine.has_library("builtin"));
        machine.add_library("builtin", Library::new());
        assert!(machine.has_library("builtin"));
        assert!(machine.lookup_symbol("builtin", "builtin.print").is_none());
    }

    #[test]
    fn test_machine_can_gc() {
        let machine = Machine::new(MachineOptions::default()).unwrap();
        assert!(machine.can_gc());
    }
}
