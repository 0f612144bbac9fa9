//! PZ bytecode format constants.
//!
//! This module is the single source of truth for the on-disk format: magic
//! numbers, width codes, data-slot encodings, code-item bytes, opcodes and
//! the static per-opcode immediate table. The compiler's writer and the
//! runtime's loader both consume it.
//!
//! All multi-byte integers are little-endian. Strings are prefixed by a
//! 16-bit length.

/// Magic number of a runnable program file.
pub const PZ_MAGIC_PROGRAM: u32 = 0x505A_5000;
/// Magic number of a library file (exports only, no entry closure required).
pub const PZ_MAGIC_LIBRARY: u32 = 0x505A_4C00;
/// Magic number of an unlinked object file. Objects cannot be executed.
pub const PZ_MAGIC_OBJECT: u32 = 0x505A_4F00;

/// Prefix of the description string in a program file.
pub const PZ_MAGIC_STRING_PROGRAM: &str = "Plasma program";
/// Prefix of the description string in a library file.
pub const PZ_MAGIC_STRING_LIBRARY: &str = "Plasma library";

/// The format version this reader and writer support. There is no backward
/// compatibility: the version in the file must match exactly.
pub const PZ_FORMAT_VERSION: u16 = 0;

/// Option type carrying the program's entry closure.
///
/// Value layout: `signature:u8, closure_id:u32`.
pub const PZ_OPT_ENTRY_CLOSURE: u16 = 0;

/// How the entry closure expects to be invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntrySignature {
    /// No arguments on the stack.
    Plain = 0,
    /// The process argument vector is pushed before entry.
    Argv = 1,
}

impl EntrySignature {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EntrySignature::Plain),
            1 => Some(EntrySignature::Argv),
            _ => None,
        }
    }
}

/// The size in bytes of the machine's efficient integer width.
pub const FAST_SIZE: usize = 4;
/// The size in bytes of a native pointer.
pub const PTR_SIZE: usize = std::mem::size_of::<usize>();
/// The size in bytes of a machine word.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Operand widths.
///
/// `Fast` is the platform's efficient integer width (32 bits here), `Ptr`
/// the native pointer width. The numeric codes are the on-disk encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Width {
    W8 = 0,
    W16 = 1,
    W32 = 2,
    W64 = 3,
    Fast = 4,
    Ptr = 5,
}

impl Width {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Width::W8),
            1 => Some(Width::W16),
            2 => Some(Width::W32),
            3 => Some(Width::W64),
            4 => Some(Width::Fast),
            5 => Some(Width::Ptr),
            _ => None,
        }
    }

    /// Storage size of a value of this width.
    pub fn to_bytes(self) -> usize {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
            Width::W64 => 8,
            Width::Fast => FAST_SIZE,
            Width::Ptr => PTR_SIZE,
        }
    }
}

/// Data-slot encoding types, stored in the high nibble of the slot tag byte.
/// The low nibble carries the encoded byte count for `Normal` slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataEnc {
    /// Inline integer of the given width.
    Normal = 0,
    /// 32-bit encoded, stored at the fast width.
    Fast = 1,
    /// Signed 32-bit encoded, extended to pointer width.
    Wptr = 2,
    /// Reference to an earlier data entry (by local id).
    Data = 3,
    /// Reference to an import (by local id), stored as a closure pointer.
    Import = 4,
    /// Reference to a local closure (by local id).
    Closure = 5,
}

impl DataEnc {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag >> 4 {
            0 => Some(DataEnc::Normal),
            1 => Some(DataEnc::Fast),
            2 => Some(DataEnc::Wptr),
            3 => Some(DataEnc::Data),
            4 => Some(DataEnc::Import),
            5 => Some(DataEnc::Closure),
            _ => None,
        }
    }

    /// Build the slot tag byte from an encoding and a byte count.
    pub fn tag(self, bytes: u8) -> u8 {
        ((self as u8) << 4) | (bytes & 0x0f)
    }
}

/// The byte count carried in the low nibble of a slot tag byte.
pub fn data_enc_bytes(tag: u8) -> u8 {
    tag & 0x0f
}

/// Data entry kinds.
pub const PZ_DATA_ARRAY: u8 = 1;
pub const PZ_DATA_STRUCT: u8 = 2;
pub const PZ_DATA_STRING: u8 = 3;

/// Code item kinds. A proc's block is a sequence of items, each introduced
/// by one of these bytes.
pub const PZ_CODE_INSTR: u8 = 0;
pub const PZ_CODE_META_CONTEXT: u8 = 1;
pub const PZ_CODE_META_CONTEXT_SHORT: u8 = 2;
pub const PZ_CODE_META_CONTEXT_NIL: u8 = 3;

/// Bytecode opcodes.
///
/// The on-disk operand layout of each opcode is given by [`instruction_info`]:
/// how many width bytes follow the opcode and which immediate kind, if any,
/// follows the widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    LoadImmediateNum = 0,
    Ze,
    Se,
    Trunc,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lshift,
    Rshift,
    And,
    Or,
    Xor,
    LtU,
    LtS,
    GtU,
    GtS,
    Eq,
    Not,
    Dup,
    Drop,
    Swap,
    Roll,
    Pick,
    Call,
    CallImport,
    CallInd,
    CallProc,
    TCall,
    TCallImport,
    TCallInd,
    TCallProc,
    CJmp,
    Jmp,
    Ret,
    Alloc,
    MakeClosure,
    LoadImport,
    Load,
    Store,
    GetEnv,
    // Tokens below never appear in a PZ file; the runtime synthesises them.
    End = 0xfe,
    CCall = 0xff,
}

impl Opcode {
    /// Decode a file opcode. The interpreter-only tokens `End` and `CCall`
    /// are not valid in files and decode to `None` here.
    pub fn from_file_u8(v: u8) -> Option<Self> {
        use Opcode::*;
        Some(match v {
            0 => LoadImmediateNum,
            1 => Ze,
            2 => Se,
            3 => Trunc,
            4 => Add,
            5 => Sub,
            6 => Mul,
            7 => Div,
            8 => Mod,
            9 => Lshift,
            10 => Rshift,
            11 => And,
            12 => Or,
            13 => Xor,
            14 => LtU,
            15 => LtS,
            16 => GtU,
            17 => GtS,
            18 => Eq,
            19 => Not,
            20 => Dup,
            21 => Drop,
            22 => Swap,
            23 => Roll,
            24 => Pick,
            25 => Call,
            26 => CallImport,
            27 => CallInd,
            28 => CallProc,
            29 => TCall,
            30 => TCallImport,
            31 => TCallInd,
            32 => TCallProc,
            33 => CJmp,
            34 => Jmp,
            35 => Ret,
            36 => Alloc,
            37 => MakeClosure,
            38 => LoadImport,
            39 => Load,
            40 => Store,
            41 => GetEnv,
            _ => return None,
        })
    }

    /// Decode any token, including the interpreter-only ones. Used when
    /// walking an already-loaded code buffer.
    pub fn from_token_u8(v: u8) -> Option<Self> {
        match v {
            0xfe => Some(Opcode::End),
            0xff => Some(Opcode::CCall),
            _ => Opcode::from_file_u8(v),
        }
    }
}

/// The immediate kind an opcode carries.
///
/// Symbolic kinds (`ClosureRef` and friends) appear in files as 32-bit local
/// ids and are resolved by the loader to absolute addresses or offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmediateType {
    None,
    /// A raw integer whose encoded size matches the instruction's first
    /// width byte (`Fast` and `Ptr` encode as 32 bits).
    Num,
    Imm8,
    /// 32-bit local closure id; resolved to the closure's address.
    ClosureRef,
    /// 32-bit local proc id; resolved to the proc's code address.
    ProcRef,
    /// 32-bit local import id; resolved to the import's byte offset within
    /// the module environment struct.
    ImportRef,
    /// 32-bit local import id; resolved to the imported closure's address.
    ImportClosureRef,
    /// 32-bit block number; resolved to an absolute address within the
    /// containing proc.
    LabelRef,
    /// 32-bit struct id; resolved to the struct's total size.
    StructRef,
    /// 32-bit struct id plus 8-bit field number; resolved to the field's
    /// byte offset.
    StructRefField,
}

/// Static operand layout for one opcode.
#[derive(Debug, Clone, Copy)]
pub struct InstructionInfo {
    pub num_width_bytes: u8,
    pub immediate: ImmediateType,
}

/// The static opcode table. Both passes of the loader and the writer use
/// this to walk instruction streams.
pub fn instruction_info(op: Opcode) -> InstructionInfo {
    use ImmediateType as I;
    use Opcode::*;
    let (num_width_bytes, immediate) = match op {
        LoadImmediateNum => (1, I::Num),
        Ze | Se | Trunc => (2, I::None),
        Add | Sub | Mul | Div | Mod | Lshift | Rshift | And | Or | Xor => (1, I::None),
        LtU | LtS | GtU | GtS | Eq | Not => (1, I::None),
        Dup | Drop | Swap => (0, I::None),
        Roll | Pick => (0, I::Imm8),
        Call | TCall => (0, I::ClosureRef),
        CallImport | TCallImport => (0, I::ImportClosureRef),
        CallInd | TCallInd => (0, I::None),
        CallProc | TCallProc => (0, I::ProcRef),
        CJmp => (1, I::LabelRef),
        Jmp => (0, I::LabelRef),
        Ret => (0, I::None),
        Alloc => (0, I::StructRef),
        MakeClosure => (0, I::ProcRef),
        LoadImport => (0, I::ImportRef),
        Load | Store => (1, I::StructRefField),
        GetEnv => (0, I::None),
        End => (0, I::None),
        CCall => (0, I::None),
    };
    InstructionInfo {
        num_width_bytes,
        immediate,
    }
}

/// A resolved immediate, ready to be written into a code buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmediateValue {
    None,
    /// Stored at the instruction's first width.
    Num(u64),
    U8(u8),
    /// Byte offsets (import slots, struct fields) are stored as 16 bits.
    U16(u16),
    /// Absolute addresses and struct sizes are stored as full words.
    Word(usize),
}

impl ImmediateValue {
    fn size(self, width1: Option<Width>) -> usize {
        match self {
            ImmediateValue::None => 0,
            ImmediateValue::Num(_) => num_immediate_bytes(width1.expect("Num needs a width")),
            ImmediateValue::U8(_) => 1,
            ImmediateValue::U16(_) => 2,
            ImmediateValue::Word(_) => WORD_SIZE,
        }
    }
}

/// The encoded size of a `Num` immediate for a given width. `Fast` and
/// `Ptr` immediates are encoded as 32 bits.
pub fn num_immediate_bytes(w: Width) -> usize {
    match w {
        Width::W8 => 1,
        Width::W16 => 2,
        Width::W32 | Width::Fast | Width::Ptr => 4,
        Width::W64 => 8,
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (offset + align - 1) & !(align - 1)
}

/// Append one instruction to an in-memory code buffer.
///
/// When `code` is `None` nothing is written; the returned offset is still
/// advanced exactly as it would be by a real write. The loader's first pass
/// uses this to size proc buffers and compute block offsets before any code
/// exists.
///
/// Layout: token byte, then the width byte(s), then the immediate aligned
/// to its own size.
pub fn write_instr(
    code: Option<&mut [u8]>,
    mut offset: usize,
    op: Opcode,
    width1: Option<Width>,
    width2: Option<Width>,
    imm: ImmediateValue,
) -> usize {
    let mut sink = code;
    let mut put = |off: usize, bytes: &[u8]| {
        if let Some(buf) = sink.as_deref_mut() {
            buf[off..off + bytes.len()].copy_from_slice(bytes);
        }
    };

    put(offset, &[op as u8]);
    offset += 1;
    if let Some(w) = width1 {
        put(offset, &[w as u8]);
        offset += 1;
    }
    if let Some(w) = width2 {
        put(offset, &[w as u8]);
        offset += 1;
    }

    let size = imm.size(width1);
    if size > 0 {
        offset = align_up(offset, size);
        match imm {
            ImmediateValue::None => unreachable!(),
            ImmediateValue::Num(v) => match size {
                1 => put(offset, &(v as u8).to_le_bytes()),
                2 => put(offset, &(v as u16).to_le_bytes()),
                4 => put(offset, &(v as u32).to_le_bytes()),
                8 => put(offset, &v.to_le_bytes()),
                _ => unreachable!(),
            },
            ImmediateValue::U8(v) => put(offset, &[v]),
            ImmediateValue::U16(v) => put(offset, &v.to_le_bytes()),
            ImmediateValue::Word(v) => put(offset, &v.to_le_bytes()),
        }
        offset += size;
    }

    offset
}
