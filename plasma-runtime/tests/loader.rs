//! Loader and interpreter integration tests over hand-built PZ images.

use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;

use plasma_runtime::binary::BinaryInput;
use plasma_runtime::format::{
    DataEnc, EntrySignature, Opcode, Width, PZ_CODE_INSTR, PZ_CODE_META_CONTEXT_NIL,
    PZ_CODE_META_CONTEXT_SHORT, PZ_DATA_ARRAY, PZ_DATA_STRING, PZ_FORMAT_VERSION,
    PZ_MAGIC_LIBRARY, PZ_MAGIC_OBJECT, PZ_MAGIC_PROGRAM, PZ_OPT_ENTRY_CLOSURE,
};
use plasma_runtime::loader::{self, LoadError};
use plasma_runtime::machine::{Machine, MachineOptions};
use plasma_runtime::{builtins, interp};

/// Minimal PZ image builder for tests.
struct PzBuilder {
    bytes: Vec<u8>,
}

impl PzBuilder {
    fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.bytes.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn str16(&mut self, s: &str) -> &mut Self {
        self.u16(s.len() as u16);
        self.bytes.extend_from_slice(s.as_bytes());
        self
    }

    fn header(&mut self, magic: u32, description: &str) -> &mut Self {
        self.u32(magic);
        self.str16(description);
        self.u16(PZ_FORMAT_VERSION)
    }

    fn entry_option(&mut self, closure_id: u32) -> &mut Self {
        self.u16(1); // one option
        self.u16(PZ_OPT_ENTRY_CLOSURE);
        self.u16(5);
        self.u8(EntrySignature::Plain as u8);
        self.u32(closure_id)
    }

    fn no_options(&mut self) -> &mut Self {
        self.u16(0)
    }

    fn names(&mut self, names: &[&str]) -> &mut Self {
        self.u32(names.len() as u32);
        for name in names {
            self.str16(name);
        }
        self
    }

    fn counts(
        &mut self,
        imports: u32,
        structs: u32,
        datas: u32,
        procs: u32,
        closures: u32,
        exports: u32,
    ) -> &mut Self {
        self.u32(imports);
        self.u32(structs);
        self.u32(datas);
        self.u32(procs);
        self.u32(closures);
        self.u32(exports)
    }

    /// An empty byte array, usable as a do-nothing closure environment.
    fn empty_env_data(&mut self) -> &mut Self {
        self.u8(PZ_DATA_ARRAY);
        self.u16(0);
        self.u8(Width::W8 as u8)
    }

    fn instr(&mut self, op: Opcode) -> &mut Self {
        self.u8(PZ_CODE_INSTR);
        self.u8(op as u8)
    }

    fn finish(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

fn machine() -> Machine {
    let machine = Machine::new(MachineOptions::default()).unwrap();
    machine.add_library(
        builtins::BUILTIN_MODULE,
        builtins::make_builtin_library(&machine),
    );
    machine
}

/// A program-output sink backed by a shared buffer, so a test can read
/// back what the program printed.
#[derive(Clone, Default)]
struct CaptureOutput(Rc<RefCell<Vec<u8>>>);

impl CaptureOutput {
    fn bytes(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }
}

impl std::io::Write for CaptureOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn load(machine: &Machine, bytes: Vec<u8>) -> Result<loader::LoadedModule, LoadError> {
    let input = BinaryInput::from_reader("test.pz", Cursor::new(bytes));
    loader::read_input(machine, input)
}

fn run(machine: &Machine, bytes: Vec<u8>) -> i32 {
    let module = load(machine, bytes).expect("load failed");
    let name = module.name.clone().unwrap_or_else(|| "test".to_string());
    machine.add_library(name.clone(), module.library);
    machine
        .with_library(&name, |lib| interp::run(machine, lib, &[]))
        .unwrap()
        .expect("run failed")
}

/// A program with one empty proc and an entry closure referencing it.
fn empty_program() -> Vec<u8> {
    let mut b = PzBuilder::new();
    b.header(PZ_MAGIC_PROGRAM, "Plasma program v0");
    b.entry_option(0);
    b.names(&["empty"]);
    b.counts(0, 0, 1, 1, 1, 0);
    b.empty_env_data();
    // proc 0: one block, one Ret
    b.str16("main");
    b.u32(1); // blocks
    b.u32(1); // items
    b.instr(Opcode::Ret);
    // closure 0: proc 0, data 0
    b.u32(0);
    b.u32(0);
    b.finish()
}

#[test]
fn test_empty_program_runs_and_exits_zero() {
    let machine = machine();
    assert_eq!(run(&machine, empty_program()), 0);
}

#[test]
fn test_load_is_deterministic() {
    let machine = machine();
    let first = load(&machine, empty_program()).unwrap();
    let second = load(&machine, empty_program()).unwrap();

    assert_eq!(first.names, second.names);
    let mut firsts: Vec<_> = first.library.symbols().map(|(n, e)| (n.clone(), e.id())).collect();
    let mut seconds: Vec<_> = second.library.symbols().map(|(n, e)| (n.clone(), e.id())).collect();
    firsts.sort();
    seconds.sort();
    assert_eq!(firsts, seconds);
    assert_eq!(first.library.num_procs(), second.library.num_procs());
    for i in 0..first.library.num_procs() {
        assert_eq!(
            first.library.proc(i).unwrap().size(),
            second.library.proc(i).unwrap().size()
        );
    }
}

#[test]
fn test_bad_magic_is_rejected() {
    let machine = machine();
    let mut b = PzBuilder::new();
    b.u32(0xdead_beef);
    b.str16("Plasma program");
    assert!(matches!(
        load(&machine, b.finish()),
        Err(LoadError::BadMagic { .. })
    ));
}

#[test]
fn test_object_files_are_rejected() {
    let machine = machine();
    let mut b = PzBuilder::new();
    b.u32(PZ_MAGIC_OBJECT);
    let error = load(&machine, b.finish()).unwrap_err();
    assert!(error.to_string().contains("link objects"));
}

#[test]
fn test_version_mismatch_is_rejected() {
    let machine = machine();
    let mut b = PzBuilder::new();
    b.u32(PZ_MAGIC_PROGRAM);
    b.str16("Plasma program v99");
    b.u16(PZ_FORMAT_VERSION + 1);
    assert!(matches!(
        load(&machine, b.finish()),
        Err(LoadError::Version { .. })
    ));
}

#[test]
fn test_bad_description_is_rejected() {
    let machine = machine();
    let mut b = PzBuilder::new();
    b.u32(PZ_MAGIC_PROGRAM);
    b.str16("Something else entirely");
    b.u16(PZ_FORMAT_VERSION);
    assert!(matches!(
        load(&machine, b.finish()),
        Err(LoadError::BadDescription { .. })
    ));
}

#[test]
fn test_unknown_options_are_skipped_by_length() {
    let machine = machine();
    let mut b = PzBuilder::new();
    b.header(PZ_MAGIC_PROGRAM, "Plasma program v0");
    // Two options: an unknown one (skipped by length) then the entry.
    b.u16(2);
    b.u16(0x7fff);
    b.u16(3);
    b.u8(1).u8(2).u8(3);
    b.u16(PZ_OPT_ENTRY_CLOSURE);
    b.u16(5);
    b.u8(EntrySignature::Plain as u8);
    b.u32(0);
    b.names(&["opts"]);
    b.counts(0, 0, 1, 1, 1, 0);
    b.empty_env_data();
    b.str16("main");
    b.u32(1);
    b.u32(1);
    b.instr(Opcode::Ret);
    b.u32(0);
    b.u32(0);
    assert_eq!(run(&machine, b.finish()), 0);
}

#[test]
fn test_forward_data_reference_is_rejected() {
    let machine = machine();
    let mut b = PzBuilder::new();
    b.header(PZ_MAGIC_PROGRAM, "Plasma program v0");
    b.no_options();
    b.names(&["fwd"]);
    b.counts(0, 0, 2, 0, 0, 0);
    // data 0: an array of one pointer whose slot references data 1.
    b.u8(PZ_DATA_ARRAY);
    b.u16(1);
    b.u8(Width::Ptr as u8);
    b.u8(DataEnc::Data.tag(4));
    b.u32(1);
    // data 1 would follow, but loading fails before it is reached.
    b.empty_env_data();

    let error = load(&machine, b.finish()).unwrap_err();
    assert!(matches!(error, LoadError::ForwardDataRef { id: 1, .. }));
    assert!(error.to_string().contains("forward reference"));
}

#[test]
fn test_backward_data_reference_resolves() {
    let machine = machine();
    let mut b = PzBuilder::new();
    b.header(PZ_MAGIC_PROGRAM, "Plasma program v0");
    b.entry_option(0);
    b.names(&["back"]);
    b.counts(0, 0, 2, 1, 1, 0);
    // data 0: one-byte array.
    b.u8(PZ_DATA_ARRAY);
    b.u16(1);
    b.u8(Width::W8 as u8);
    b.u8(DataEnc::Normal.tag(1));
    b.u8(7);
    // data 1: a pointer array referencing data 0.
    b.u8(PZ_DATA_ARRAY);
    b.u16(1);
    b.u8(Width::Ptr as u8);
    b.u8(DataEnc::Data.tag(4));
    b.u32(0);
    b.str16("main");
    b.u32(1);
    b.u32(1);
    b.instr(Opcode::Ret);
    b.u32(0);
    b.u32(1);
    assert_eq!(run(&machine, b.finish()), 0);
}

#[test]
fn test_junk_at_end_is_rejected() {
    let machine = machine();
    let mut bytes = empty_program();
    bytes.push(0x42);
    assert!(matches!(
        load(&machine, bytes),
        Err(LoadError::JunkAtEnd { .. })
    ));
}

#[test]
fn test_missing_import_module_fails() {
    let machine = machine();
    let mut b = PzBuilder::new();
    b.header(PZ_MAGIC_PROGRAM, "Plasma program v0");
    b.no_options();
    b.names(&["imports"]);
    b.counts(1, 0, 0, 0, 0, 0);
    b.str16("nonexistent");
    b.str16("f");
    let error = load(&machine, b.finish()).unwrap_err();
    assert!(matches!(error, LoadError::ModuleNotFound { .. }));
    assert!(error.to_string().contains("nonexistent"));
}

#[test]
fn test_missing_import_symbol_fails() {
    let machine = machine();
    let mut b = PzBuilder::new();
    b.header(PZ_MAGIC_PROGRAM, "Plasma program v0");
    b.no_options();
    b.names(&["imports"]);
    b.counts(1, 0, 0, 0, 0, 0);
    b.str16("builtin");
    b.str16("no_such_builtin");
    let error = load(&machine, b.finish()).unwrap_err();
    assert!(matches!(error, LoadError::SymbolNotFound { .. }));
}

#[test]
fn test_program_exit_code() {
    // load_immediate 42 at the fast width, then return.
    let machine = machine();
    let mut b = PzBuilder::new();
    b.header(PZ_MAGIC_PROGRAM, "Plasma program v0");
    b.entry_option(0);
    b.names(&["exitcode"]);
    b.counts(0, 0, 1, 1, 1, 0);
    b.empty_env_data();
    b.str16("main");
    b.u32(1);
    b.u32(2);
    b.instr(Opcode::LoadImmediateNum);
    b.u8(Width::Fast as u8);
    b.u32(42);
    b.instr(Opcode::Ret);
    b.u32(0);
    b.u32(0);
    assert_eq!(run(&machine, b.finish()), 42);
}

#[test]
fn test_arithmetic_program() {
    // (50 - 8) via immediates: push 50, push 8, sub, ret.
    let machine = machine();
    let mut b = PzBuilder::new();
    b.header(PZ_MAGIC_PROGRAM, "Plasma program v0");
    b.entry_option(0);
    b.names(&["arith"]);
    b.counts(0, 0, 1, 1, 1, 0);
    b.empty_env_data();
    b.str16("main");
    b.u32(1);
    b.u32(4);
    b.instr(Opcode::LoadImmediateNum);
    b.u8(Width::Fast as u8);
    b.u32(50);
    b.instr(Opcode::LoadImmediateNum);
    b.u8(Width::Fast as u8);
    b.u32(8);
    b.instr(Opcode::Sub);
    b.u8(Width::Fast as u8);
    b.instr(Opcode::Ret);
    b.u32(0);
    b.u32(0);
    assert_eq!(run(&machine, b.finish()), 42);
}

#[test]
fn test_conditional_jump_between_blocks() {
    // Block 0: push 1; cjmp to block 2; (fallthrough) block 1: push 13,
    // ret; block 2: push 42, ret.
    let machine = machine();
    let mut b = PzBuilder::new();
    b.header(PZ_MAGIC_PROGRAM, "Plasma program v0");
    b.entry_option(0);
    b.names(&["cjmp"]);
    b.counts(0, 0, 1, 1, 1, 0);
    b.empty_env_data();
    b.str16("main");
    b.u32(3);
    // block 0
    b.u32(2);
    b.instr(Opcode::LoadImmediateNum);
    b.u8(Width::Fast as u8);
    b.u32(1);
    b.instr(Opcode::CJmp);
    b.u8(Width::Fast as u8);
    b.u32(2); // target block
    // block 1
    b.u32(2);
    b.instr(Opcode::LoadImmediateNum);
    b.u8(Width::Fast as u8);
    b.u32(13);
    b.instr(Opcode::Ret);
    // block 2
    b.u32(2);
    b.instr(Opcode::LoadImmediateNum);
    b.u8(Width::Fast as u8);
    b.u32(42);
    b.instr(Opcode::Ret);
    b.u32(0);
    b.u32(0);
    assert_eq!(run(&machine, b.finish()), 42);
}

#[test]
fn test_echo_program_prints_through_builtin() {
    // The string data entry becomes the entry closure's environment; the
    // proc pushes it and calls builtin.print.
    let machine = machine();
    let capture = CaptureOutput::default();
    machine.set_output(Box::new(capture.clone()));
    let mut b = PzBuilder::new();
    b.header(PZ_MAGIC_PROGRAM, "Plasma program v0");
    b.entry_option(0);
    b.names(&["echo"]);
    b.counts(1, 0, 1, 1, 1, 0);
    // import 0: builtin.print
    b.str16("builtin");
    b.str16("print");
    // data 0: the string "hi\n"
    b.u8(PZ_DATA_STRING);
    b.u16(3);
    for byte in b"hi\n" {
        b.u8(DataEnc::Normal.tag(1));
        b.u8(*byte);
    }
    // proc 0: get_env; call_import 0; ret
    b.str16("main");
    b.u32(1);
    b.u32(3);
    b.instr(Opcode::GetEnv);
    b.instr(Opcode::CallImport);
    b.u32(0);
    b.instr(Opcode::Ret);
    // closure 0: proc 0, env = the string
    b.u32(0);
    b.u32(0);
    assert_eq!(run(&machine, b.finish()), 0);
    assert_eq!(capture.bytes(), b"hi\n");
}

#[test]
fn test_calls_between_procs() {
    // proc 0 calls proc 1 (a closure-less call through call_proc), which
    // pushes the exit code.
    let machine = machine();
    let mut b = PzBuilder::new();
    b.header(PZ_MAGIC_PROGRAM, "Plasma program v0");
    b.entry_option(0);
    b.names(&["calls"]);
    b.counts(0, 0, 1, 2, 1, 0);
    b.empty_env_data();
    // proc 0: call_proc 1; ret
    b.str16("main");
    b.u32(1);
    b.u32(2);
    b.instr(Opcode::CallProc);
    b.u32(1);
    b.instr(Opcode::Ret);
    // proc 1: push 42; ret
    b.str16("forty_two");
    b.u32(1);
    b.u32(2);
    b.instr(Opcode::LoadImmediateNum);
    b.u8(Width::Fast as u8);
    b.u32(42);
    b.instr(Opcode::Ret);
    // closure 0: proc 0
    b.u32(0);
    b.u32(0);
    assert_eq!(run(&machine, b.finish()), 42);
}

#[test]
fn test_exports_resolve_for_later_modules() {
    // A library exporting its only closure, then a program importing it.
    let machine = machine();
    let mut lib = PzBuilder::new();
    lib.header(PZ_MAGIC_LIBRARY, "Plasma library v0");
    lib.no_options();
    lib.names(&["mylib"]);
    lib.counts(0, 0, 1, 1, 1, 1);
    lib.empty_env_data();
    lib.str16("answer");
    lib.u32(1);
    lib.u32(2);
    lib.instr(Opcode::LoadImmediateNum);
    lib.u8(Width::Fast as u8);
    lib.u32(42);
    lib.instr(Opcode::Ret);
    lib.u32(0);
    lib.u32(0);
    lib.str16("mylib.answer");
    lib.u32(0);

    let module = load(&machine, lib.finish()).unwrap();
    assert_eq!(module.name.as_deref(), Some("mylib"));
    machine.add_library("mylib", module.library);

    let mut prog = PzBuilder::new();
    prog.header(PZ_MAGIC_PROGRAM, "Plasma program v0");
    prog.entry_option(0);
    prog.names(&["user"]);
    prog.counts(1, 0, 1, 1, 1, 0);
    prog.str16("mylib");
    prog.str16("answer");
    prog.empty_env_data();
    prog.str16("main");
    prog.u32(1);
    prog.u32(2);
    prog.instr(Opcode::CallImport);
    prog.u32(0);
    prog.instr(Opcode::Ret);
    prog.u32(0);
    prog.u32(0);
    assert_eq!(run(&machine, prog.finish()), 42);
}

#[test]
fn test_context_meta_items_are_skipped_without_debug() {
    let machine = machine();
    let mut b = PzBuilder::new();
    b.header(PZ_MAGIC_PROGRAM, "Plasma program v0");
    b.entry_option(0);
    b.names(&["meta"]);
    b.counts(0, 0, 1, 1, 1, 0);
    b.empty_env_data();
    b.str16("main");
    b.u32(1);
    b.u32(3);
    b.u8(PZ_CODE_META_CONTEXT_SHORT);
    b.u32(12); // line number
    b.instr(Opcode::Ret);
    b.u8(PZ_CODE_META_CONTEXT_NIL);
    b.u32(0);
    b.u32(0);
    assert_eq!(run(&machine, b.finish()), 0);
}

#[test]
fn test_struct_data_and_field_access() {
    // struct 0: { W8, Fast }; data 1 is an instance; the program loads
    // the Fast field through a Load instruction.
    let machine = machine();
    let mut b = PzBuilder::new();
    b.header(PZ_MAGIC_PROGRAM, "Plasma program v0");
    b.entry_option(0);
    b.names(&["structs"]);
    b.counts(0, 1, 1, 1, 1, 0);
    // struct 0
    b.u32(2);
    b.u8(Width::W8 as u8);
    b.u8(Width::Fast as u8);
    // data 0: instance with fields 9 and 42
    b.u8(plasma_runtime::format::PZ_DATA_STRUCT);
    b.u32(0);
    b.u8(DataEnc::Normal.tag(1));
    b.u8(9);
    b.u8(DataEnc::Fast.tag(4));
    b.u32(42);
    // proc 0: get_env (the struct); load fast field 1; ret
    b.str16("main");
    b.u32(1);
    b.u32(3);
    b.instr(Opcode::GetEnv);
    b.instr(Opcode::Load);
    b.u8(Width::Fast as u8);
    b.u32(0); // struct id
    b.u8(1); // field
    b.instr(Opcode::Ret);
    // closure 0: proc 0, env = the struct instance
    b.u32(0);
    b.u32(0);
    assert_eq!(run(&machine, b.finish()), 42);
}
