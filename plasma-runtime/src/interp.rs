//! The bytecode interpreter.
//!
//! Executes the resolved instruction stream the loader produced. All
//! symbolic immediates were rewritten to absolute addresses at load time,
//! so dispatch never consults a table.
//!
//! The interpreter keeps an expression stack of [`StackValue`] words and a
//! return stack of code addresses. The bottom of the return stack is a
//! one-token buffer holding `End`; when the entry closure returns, control
//! lands there and the run finishes with the top of the expression stack
//! (or zero) as the exit code.

use std::io;

use thiserror::Error;

use crate::format::{EntrySignature, Opcode, Width, WORD_SIZE};
use crate::gc::capability::{trace_parent, GcCapability, GcMode, Tracer};
use crate::gc::{Heap, MarkState};
use crate::library::{Closure, Library, ProcContext};
use crate::machine::Machine;

/// One slot of the expression stack.
#[derive(Copy, Clone)]
#[repr(C)]
pub union StackValue {
    pub u64_: u64,
    pub s64: i64,
    pub uptr: usize,
    pub sptr: isize,
    pub ptr: *mut u8,
}

/// Errors surfaced while running bytecode.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("module has no entry closure")]
    NoEntryClosure,

    #[error("division by zero at {location}")]
    DivideByZero { location: String },

    #[error("expression stack underflow at {location}")]
    StackUnderflow { location: String },

    #[error("invalid instruction token {token:#04x} at {location}")]
    BadToken { token: u8, location: String },

    #[error("called a null closure at {location}")]
    NullClosure { location: String },

    #[error("cannot write program output: {0}")]
    Io(#[from] io::Error),
}

/// A builtin's native implementation. The word immediate of a `CCall`
/// token is one of these function pointers.
pub type BuiltinFn = fn(&mut Interp<'_>) -> Result<(), RuntimeError>;

/// Interpreter state for one run.
pub struct Interp<'m> {
    machine: &'m Machine,
    ip: *const u8,
    env: *mut u8,
    return_stack: Vec<*const u8>,
    expr_stack: Vec<StackValue>,
    /// One `End` token on the heap; the bottom of the return stack.
    end_code: *mut u8,
    /// The library being run, for error locations.
    library: &'m Library,
}

impl<'m> Interp<'m> {
    fn new(machine: &'m Machine, library: &'m Library) -> Self {
        let end_code = machine.alloc_bytes(1);
        // SAFETY: a fresh one-byte (one-cell) buffer.
        unsafe {
            *end_code = Opcode::End as u8;
        }
        Self {
            machine,
            ip: std::ptr::null(),
            env: std::ptr::null_mut(),
            return_stack: Vec::with_capacity(64),
            expr_stack: Vec::with_capacity(64),
            end_code,
            library,
        }
    }

    /// Where execution currently is, rendered for diagnostics using the
    /// proc's context table when one was loaded.
    fn location(&self) -> String {
        match self.library.find_proc_by_addr(self.ip) {
            Some((proc, offset)) => match proc.context_for(offset) {
                Some(ProcContext::FileLine(file, line)) => {
                    format!("{} ({}:{})", proc.name(), file, line)
                }
                Some(ProcContext::Line(line)) => format!("{} (line {})", proc.name(), line),
                _ => format!("{}+{}", proc.name(), offset),
            },
            None => "unknown code".to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Stack discipline
    // ------------------------------------------------------------------

    fn push(&mut self, value: StackValue) {
        self.expr_stack.push(value);
    }

    fn pop(&mut self) -> Result<StackValue, RuntimeError> {
        self.expr_stack.pop().ok_or_else(|| RuntimeError::StackUnderflow {
            location: self.location(),
        })
    }

    fn push_uint(&mut self, width: Width, value: u64) {
        self.push(StackValue {
            u64_: mask_to_width(value, width),
        });
    }

    fn pop_uint(&mut self, width: Width) -> Result<u64, RuntimeError> {
        // SAFETY: every push stores through u64_ or uptr; reading u64_ of
        // a pointer value is defined for our repr(C) union.
        let raw = unsafe { self.pop()?.u64_ };
        Ok(mask_to_width(raw, width))
    }

    fn pop_sint(&mut self, width: Width) -> Result<i64, RuntimeError> {
        Ok(sign_extend(self.pop_uint(width)?, width))
    }

    fn pop_ptr(&mut self) -> Result<*mut u8, RuntimeError> {
        // SAFETY: as above; pointers are stored through ptr/uptr.
        Ok(unsafe { self.pop()?.ptr })
    }

    fn push_ptr(&mut self, p: *mut u8) {
        self.push(StackValue { ptr: p });
    }

    // ------------------------------------------------------------------
    // Instruction fetch
    // ------------------------------------------------------------------

    unsafe fn fetch_u8(&mut self) -> u8 {
        let v = *self.ip;
        self.ip = self.ip.add(1);
        v
    }

    unsafe fn fetch_width(&mut self) -> Width {
        Width::from_u8(self.fetch_u8()).expect("loader validated widths")
    }

    /// Fetch an immediate of `size` bytes, aligned as the loader wrote it.
    unsafe fn fetch_imm(&mut self, size: usize) -> u64 {
        let addr = self.ip as usize;
        let aligned = (addr + size - 1) & !(size - 1);
        self.ip = aligned as *const u8;
        let value = match size {
            1 => *self.ip as u64,
            2 => (self.ip as *const u16).read_unaligned() as u64,
            4 => (self.ip as *const u32).read_unaligned() as u64,
            8 => (self.ip as *const u64).read_unaligned(),
            _ => unreachable!(),
        };
        self.ip = self.ip.add(size);
        value
    }

    unsafe fn fetch_word(&mut self) -> usize {
        self.fetch_imm(WORD_SIZE) as usize
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn enter_closure(&mut self, closure: *mut Closure, tail: bool) -> Result<(), RuntimeError> {
        if closure.is_null() {
            return Err(RuntimeError::NullClosure {
                location: self.location(),
            });
        }
        if !tail {
            self.return_stack.push(self.ip);
        }
        // SAFETY: non-null closures come from the loader or MakeClosure.
        unsafe {
            self.ip = (*closure).code;
            self.env = (*closure).env;
        }
        Ok(())
    }

    fn enter_proc(&mut self, code: *const u8, tail: bool) {
        if !tail {
            self.return_stack.push(self.ip);
        }
        self.ip = code;
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    fn run(&mut self, closure: *mut Closure) -> Result<i32, RuntimeError> {
        self.return_stack.push(self.end_code);
        self.enter_closure(closure, true)?;

        loop {
            // SAFETY: ip always points into a loaded, resolved code
            // buffer; the loader sized every fetch below.
            let token = unsafe { self.fetch_u8() };
            let op = Opcode::from_token_u8(token).ok_or_else(|| RuntimeError::BadToken {
                token,
                location: self.location(),
            })?;

            match op {
                Opcode::LoadImmediateNum => unsafe {
                    let width = self.fetch_width();
                    let value = self.fetch_imm(crate::format::num_immediate_bytes(width));
                    self.push_uint(width, value);
                },
                Opcode::Ze => unsafe {
                    let from = self.fetch_width();
                    let to = self.fetch_width();
                    let value = self.pop_uint(from)?;
                    self.push_uint(to, value);
                },
                Opcode::Se => unsafe {
                    let from = self.fetch_width();
                    let to = self.fetch_width();
                    let value = self.pop_sint(from)?;
                    self.push_uint(to, value as u64);
                },
                Opcode::Trunc => unsafe {
                    let from = self.fetch_width();
                    let to = self.fetch_width();
                    let value = self.pop_uint(from)?;
                    self.push_uint(to, value);
                },
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::Lshift
                | Opcode::Rshift
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor => unsafe {
                    let width = self.fetch_width();
                    let b = self.pop_uint(width)?;
                    let a = self.pop_uint(width)?;
                    let result = self.arith(op, width, a, b)?;
                    self.push_uint(width, result);
                },
                Opcode::LtU | Opcode::GtU => unsafe {
                    let width = self.fetch_width();
                    let b = self.pop_uint(width)?;
                    let a = self.pop_uint(width)?;
                    let r = match op {
                        Opcode::LtU => a < b,
                        _ => a > b,
                    };
                    self.push_uint(width, r as u64);
                },
                Opcode::LtS | Opcode::GtS => unsafe {
                    let width = self.fetch_width();
                    let b = self.pop_sint(width)?;
                    let a = self.pop_sint(width)?;
                    let r = match op {
                        Opcode::LtS => a < b,
                        _ => a > b,
                    };
                    self.push_uint(width, r as u64);
                },
                Opcode::Eq => unsafe {
                    let width = self.fetch_width();
                    let b = self.pop_uint(width)?;
                    let a = self.pop_uint(width)?;
                    self.push_uint(width, (a == b) as u64);
                },
                Opcode::Not => unsafe {
                    let width = self.fetch_width();
                    let a = self.pop_uint(width)?;
                    self.push_uint(width, (a == 0) as u64);
                },
                Opcode::Dup => {
                    let top = *self.expr_stack.last().ok_or_else(|| {
                        RuntimeError::StackUnderflow {
                            location: self.location(),
                        }
                    })?;
                    self.push(top);
                }
                Opcode::Drop => {
                    self.pop()?;
                }
                Opcode::Swap => {
                    let a = self.pop()?;
                    let b = self.pop()?;
                    self.push(a);
                    self.push(b);
                }
                Opcode::Roll => unsafe {
                    let depth = self.fetch_imm(1) as usize;
                    let len = self.expr_stack.len();
                    if depth == 0 || depth > len {
                        return Err(RuntimeError::StackUnderflow {
                            location: self.location(),
                        });
                    }
                    let value = self.expr_stack.remove(len - depth);
                    self.expr_stack.push(value);
                },
                Opcode::Pick => unsafe {
                    let depth = self.fetch_imm(1) as usize;
                    let len = self.expr_stack.len();
                    if depth == 0 || depth > len {
                        return Err(RuntimeError::StackUnderflow {
                            location: self.location(),
                        });
                    }
                    let value = self.expr_stack[len - depth];
                    self.expr_stack.push(value);
                },
                Opcode::Call | Opcode::CallImport => unsafe {
                    let closure = self.fetch_word() as *mut Closure;
                    self.enter_closure(closure, false)?;
                },
                Opcode::TCall | Opcode::TCallImport => unsafe {
                    let closure = self.fetch_word() as *mut Closure;
                    self.enter_closure(closure, true)?;
                },
                Opcode::CallInd => {
                    let closure = self.pop_ptr()? as *mut Closure;
                    self.enter_closure(closure, false)?;
                }
                Opcode::TCallInd => {
                    let closure = self.pop_ptr()? as *mut Closure;
                    self.enter_closure(closure, true)?;
                }
                Opcode::CallProc => unsafe {
                    let code = self.fetch_word() as *const u8;
                    self.enter_proc(code, false);
                },
                Opcode::TCallProc => unsafe {
                    let code = self.fetch_word() as *const u8;
                    self.enter_proc(code, true);
                },
                Opcode::CJmp => unsafe {
                    let width = self.fetch_width();
                    let target = self.fetch_word() as *const u8;
                    let cond = self.pop_uint(width)?;
                    if cond != 0 {
                        self.ip = target;
                    }
                },
                Opcode::Jmp => unsafe {
                    self.ip = self.fetch_word() as *const u8;
                },
                Opcode::Ret => {
                    self.ip = self
                        .return_stack
                        .pop()
                        .expect("return stack holds at least the end token");
                }
                Opcode::Alloc => unsafe {
                    let size = self.fetch_word();
                    let cell = self.alloc_bytes(size.max(1));
                    self.push_ptr(cell);
                },
                Opcode::MakeClosure => unsafe {
                    let code = self.fetch_word() as *mut u8;
                    let env = self.pop_ptr()?;
                    let cell =
                        self.alloc_bytes(std::mem::size_of::<Closure>()) as *mut Closure;
                    (*cell).code = code;
                    (*cell).env = env;
                    self.push_ptr(cell as *mut u8);
                },
                Opcode::LoadImport => unsafe {
                    let offset = self.fetch_imm(2) as usize;
                    let slot = self.env.add(offset) as *const *mut u8;
                    self.push_ptr(slot.read_unaligned());
                },
                Opcode::Load => unsafe {
                    let width = self.fetch_width();
                    let offset = self.fetch_imm(2) as usize;
                    let ptr = self.pop_ptr()?;
                    let value = read_at_width(ptr.add(offset), width);
                    self.push_uint(width, value);
                },
                Opcode::Store => unsafe {
                    let width = self.fetch_width();
                    let offset = self.fetch_imm(2) as usize;
                    let ptr = self.pop_ptr()?;
                    let value = self.pop_uint(width)?;
                    write_at_width(ptr.add(offset), width, value);
                },
                Opcode::GetEnv => {
                    let env = self.env;
                    self.push_ptr(env);
                }
                Opcode::CCall => unsafe {
                    let word = self.fetch_word();
                    // SAFETY: CCall tokens are only synthesised by the
                    // builtin registry, which stores a BuiltinFn here.
                    let f: BuiltinFn = std::mem::transmute(word);
                    f(self)?;
                },
                Opcode::End => {
                    let code = match self.expr_stack.last() {
                        // SAFETY: exit codes are pushed as integers.
                        Some(v) => unsafe { v.u64_ as u32 as i32 },
                        None => 0,
                    };
                    return Ok(code);
                }
            }
        }
    }

    fn arith(
        &mut self,
        op: Opcode,
        width: Width,
        a: u64,
        b: u64,
    ) -> Result<u64, RuntimeError> {
        let result = match op {
            Opcode::Add => a.wrapping_add(b),
            Opcode::Sub => a.wrapping_sub(b),
            Opcode::Mul => a.wrapping_mul(b),
            Opcode::Div => {
                if b == 0 {
                    return Err(RuntimeError::DivideByZero {
                        location: self.location(),
                    });
                }
                let sa = sign_extend(a, width);
                let sb = sign_extend(b, width);
                sa.wrapping_div(sb) as u64
            }
            Opcode::Mod => {
                if b == 0 {
                    return Err(RuntimeError::DivideByZero {
                        location: self.location(),
                    });
                }
                let sa = sign_extend(a, width);
                let sb = sign_extend(b, width);
                sa.wrapping_rem(sb) as u64
            }
            Opcode::Lshift => a.wrapping_shl(b as u32),
            Opcode::Rshift => a.wrapping_shr(b as u32),
            Opcode::And => a & b,
            Opcode::Or => a | b,
            Opcode::Xor => a ^ b,
            _ => unreachable!(),
        };
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Support for builtins
    // ------------------------------------------------------------------

    /// Allocate raw bytes on the GC heap through the interpreter's own
    /// capability.
    pub fn alloc_bytes(&mut self, size: usize) -> *mut u8 {
        self.machine.heap().alloc_bytes(size, &Frame { interp: self })
    }

    /// Pop a string blob pointer and copy out its bytes.
    pub fn pop_string(&mut self) -> Result<Vec<u8>, RuntimeError> {
        let ptr = self.pop_ptr()?;
        // SAFETY: string blobs are a length word followed by that many
        // bytes; only string-typed values reach here in checked programs.
        unsafe {
            let len = (ptr as *const usize).read();
            Ok(std::slice::from_raw_parts(ptr.add(WORD_SIZE), len).to_vec())
        }
    }

    /// Allocate a string blob and push its address.
    pub fn push_string(&mut self, bytes: &[u8]) {
        let blob = self.alloc_bytes(WORD_SIZE + bytes.len());
        // SAFETY: the blob was sized for a length word plus the bytes.
        unsafe {
            (blob as *mut usize).write(bytes.len());
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), blob.add(WORD_SIZE), bytes.len());
        }
        self.push_ptr(blob);
    }

    /// Pop an integer at the fast width.
    pub fn pop_fast(&mut self) -> Result<i32, RuntimeError> {
        Ok(self.pop_sint(Width::Fast)? as i32)
    }

    /// Push an integer at the fast width.
    pub fn push_fast(&mut self, value: i32) {
        self.push_uint(Width::Fast, value as u32 as u64);
    }

    /// Write program output through the machine's sink.
    pub fn write_output(&mut self, bytes: &[u8]) -> Result<(), RuntimeError> {
        self.machine.write_output(bytes)?;
        Ok(())
    }
}

/// Capability wrapper for allocations made mid-instruction. Tracing sees
/// the interpreter's stacks, current environment and instruction pointer.
struct Frame<'a, 'm> {
    interp: &'a Interp<'m>,
}

impl GcCapability for Frame<'_, '_> {
    fn heap(&self) -> &Heap {
        self.interp.machine.heap()
    }
    fn mode(&self) -> GcMode {
        GcMode::CanGc
    }
    fn parent(&self) -> Option<&dyn GcCapability> {
        Some(self.interp.machine)
    }
    fn tracer(&self) -> Option<&dyn Tracer> {
        Some(self)
    }
}

impl Tracer for Frame<'_, '_> {
    fn do_trace(&self, state: &mut MarkState<'_>) {
        for value in &self.interp.expr_stack {
            // SAFETY: reading any union field of a stack slot is defined;
            // non-pointer values simply fail the heap test.
            state.mark_root(unsafe { value.ptr });
        }
        for &ret in &self.interp.return_stack {
            state.mark_root(ret);
        }
        state.mark_root(self.interp.env);
        state.mark_root(self.interp.ip);
        state.mark_root(self.interp.end_code);
        trace_parent(self, state);
    }
}

fn mask_to_width(value: u64, width: Width) -> u64 {
    match width.to_bytes() {
        1 => value & 0xff,
        2 => value & 0xffff,
        4 => value & 0xffff_ffff,
        8 => value,
        _ => unreachable!(),
    }
}

fn sign_extend(value: u64, width: Width) -> i64 {
    match width.to_bytes() {
        1 => value as u8 as i8 as i64,
        2 => value as u16 as i16 as i64,
        4 => value as u32 as i32 as i64,
        8 => value as i64,
        _ => unreachable!(),
    }
}

unsafe fn read_at_width(p: *const u8, width: Width) -> u64 {
    match width.to_bytes() {
        1 => *p as u64,
        2 => (p as *const u16).read_unaligned() as u64,
        4 => (p as *const u32).read_unaligned() as u64,
        8 => (p as *const u64).read_unaligned(),
        _ => unreachable!(),
    }
}

unsafe fn write_at_width(p: *mut u8, width: Width, value: u64) {
    match width.to_bytes() {
        1 => *p = value as u8,
        2 => (p as *mut u16).write_unaligned(value as u16),
        4 => (p as *mut u32).write_unaligned(value as u32),
        8 => (p as *mut u64).write_unaligned(value),
        _ => unreachable!(),
    }
}

/// Run a library's entry closure and return the process exit code.
pub fn run(machine: &Machine, library: &Library, args: &[String]) -> Result<i32, RuntimeError> {
    let (signature, closure) = library
        .entry_closure()
        .ok_or(RuntimeError::NoEntryClosure)?;

    let mut interp = Interp::new(machine, library);

    if signature == EntrySignature::Argv {
        // Build the argument vector on the heap: an array of string
        // pointers, then push its address and the count.
        let array = interp.alloc_bytes((args.len() * WORD_SIZE).max(1));
        interp.push_ptr(array);
        for (i, arg) in args.iter().enumerate() {
            interp.push_string(arg.as_bytes());
            let ptr = interp.pop_ptr().expect("just pushed");
            // SAFETY: the array has one word per argument.
            unsafe {
                (array as *mut *mut u8).add(i).write(ptr);
            }
        }
        interp.push_uint(Width::Fast, args.len() as u64);
    }

    let result = interp.run(closure);
    machine.flush_output()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_and_extend() {
        assert_eq!(mask_to_width(0x1ff, Width::W8), 0xff);
        assert_eq!(sign_extend(0xff, Width::W8), -1);
        assert_eq!(sign_extend(0x7f, Width::W8), 127);
        assert_eq!(sign_extend(0xffff_ffff, Width::W32), -1);
        assert_eq!(sign_extend(0xffff_ffff, Width::W64), 0xffff_ffff);
    }
}
