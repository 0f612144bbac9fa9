//! Compile options, as consumed by the external driver.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Run the simplification pass over the core IR.
    pub do_simplify: bool,
    /// Emit tail calls where the lowering finds them.
    pub enable_tailcalls: bool,
    /// Log intermediate stages.
    pub dump_stages: bool,
    /// Write the output PZ file.
    pub write_output: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            do_simplify: true,
            enable_tailcalls: true,
            dump_stages: false,
            write_output: true,
        }
    }
}
