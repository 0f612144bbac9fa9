//! The builtin pseudo-library.
//!
//! Builtins are ordinary closures whose code buffers contain a `CCall`
//! token carrying a native function pointer, followed by `Ret`. They are
//! registered by fully-qualified name in a library called `builtin` and
//! imported like any other module's exports.

use crate::format::{write_instr, ImmediateValue, Opcode};
use crate::gc::capability::GcCapability;
use crate::gc::NoGcScope;
use crate::interp::{Interp, RuntimeError};
use crate::library::{Closure, Export, Library, Proc};
use crate::machine::Machine;

/// Module name the builtin library is registered under.
pub const BUILTIN_MODULE: &str = "builtin";

fn builtin_print(interp: &mut Interp<'_>) -> Result<(), RuntimeError> {
    let bytes = interp.pop_string()?;
    interp.write_output(&bytes)
}

fn builtin_int_to_string(interp: &mut Interp<'_>) -> Result<(), RuntimeError> {
    let value = interp.pop_fast()?;
    let text = value.to_string();
    interp.push_string(text.as_bytes());
    Ok(())
}

fn builtin_string_concat(interp: &mut Interp<'_>) -> Result<(), RuntimeError> {
    // Copy both operands out before allocating: the result allocation may
    // collect, and the popped blobs are no longer rooted by the stack.
    let b = interp.pop_string()?;
    let a = interp.pop_string()?;
    let mut joined = a;
    joined.extend_from_slice(&b);
    interp.push_string(&joined);
    Ok(())
}

/// Build one builtin closure: a heap code buffer of `CCall f; Ret` plus a
/// closure cell with no environment.
fn make_builtin(
    no_gc: &NoGcScope<'_>,
    library: &mut Library,
    name: &str,
    f: fn(&mut Interp<'_>) -> Result<(), RuntimeError>,
) {
    let imm = ImmediateValue::Word(f as usize);
    let mut size = write_instr(None, 0, Opcode::CCall, None, None, imm);
    size = write_instr(None, size, Opcode::Ret, None, None, ImmediateValue::None);

    let code = no_gc.alloc_bytes(size);
    // SAFETY: the buffer was sized by the identical write sequence.
    let code_slice = unsafe { std::slice::from_raw_parts_mut(code, size) };
    let mut offset = write_instr(Some(&mut *code_slice), 0, Opcode::CCall, None, None, imm);
    offset = write_instr(
        Some(&mut *code_slice),
        offset,
        Opcode::Ret,
        None,
        None,
        ImmediateValue::None,
    );
    debug_assert_eq!(offset, size);

    let closure = no_gc.alloc_bytes(std::mem::size_of::<Closure>()) as *mut Closure;
    // SAFETY: a fresh closure cell.
    unsafe {
        (*closure).code = code;
        (*closure).env = std::ptr::null_mut();
    }

    library.add_proc(Proc::new(name.to_string(), code, size));
    let id = library.add_closure(closure) as u32;
    library.add_symbol(
        format!("{BUILTIN_MODULE}.{name}"),
        Export::new(id, closure),
    );
}

/// Build the builtin library. Registered on the machine as `builtin`
/// before any module is loaded so imports can resolve against it.
pub fn make_builtin_library(machine: &Machine) -> Library {
    // The closures being built are unreachable from any root until the
    // library is registered, so collection must stay off.
    let no_gc = NoGcScope::new(machine);
    let mut library = Library::new();
    make_builtin(&no_gc, &mut library, "print", builtin_print);
    make_builtin(&no_gc, &mut library, "int_to_string", builtin_int_to_string);
    make_builtin(&no_gc, &mut library, "string_concat", builtin_string_concat);
    no_gc.abort_if_oom("setting up builtins");
    library
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineOptions;

    #[test]
    fn test_builtin_library_exports() {
        let machine = Machine::new(MachineOptions::default()).unwrap();
        let library = make_builtin_library(&machine);
        for name in ["print", "int_to_string", "string_concat"] {
            let qualified = format!("builtin.{name}");
            let export = library.lookup_symbol(&qualified);
            assert!(export.is_some(), "missing builtin {name}");
            assert!(!export.unwrap().closure().is_null());
        }
        assert!(library.lookup_symbol("builtin.missing").is_none());
    }
}
