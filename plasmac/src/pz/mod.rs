//! PZ module structures.
//!
//! The lowering pass builds one [`Module`] per compiled source module:
//! options, names, imports, structs, data entries, procs made of blocks
//! of instructions with symbolic immediates, closures and exports. The
//! [`write`] module serialises it bit-exactly for the runtime's loader.

pub mod write;

use plasma_runtime::format::{EntrySignature, Opcode, Width};

/// Whether the module is a runnable program or a library of exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Program,
    Library,
}

/// One data slot: how a single value is encoded in a data entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSlot {
    /// An inline integer of the given byte count (1, 2, 4 or 8).
    Normal { bytes: u8, value: u64 },
    /// 32-bit encoded, stored at the fast width.
    Fast(u32),
    /// Signed 32-bit encoded, stored at pointer width.
    Wptr(i32),
    /// A reference to an earlier data entry.
    DataRef(u32),
    /// A reference to an import, stored as a closure pointer.
    ImportRef(u32),
    /// A reference to a local closure.
    ClosureRef(u32),
}

/// One data entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataEntry {
    Array { width: Width, elements: Vec<DataSlot> },
    Struct { struct_id: u32, fields: Vec<DataSlot> },
    /// A flat narrow-character buffer.
    String(Vec<u8>),
}

/// A symbolic instruction immediate; the loader resolves these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Imm {
    Num(u64),
    U8(u8),
    Closure(u32),
    Proc(u32),
    Import(u32),
    ImportClosure(u32),
    Label(u32),
    Struct(u32),
    StructField(u32, u8),
}

/// One instruction with its operand widths and optional immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub opcode: Opcode,
    pub width1: Option<Width>,
    pub width2: Option<Width>,
    pub imm: Option<Imm>,
}

impl Instr {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            width1: None,
            width2: None,
            imm: None,
        }
    }

    pub fn width(mut self, width: Width) -> Self {
        if self.width1.is_none() {
            self.width1 = Some(width);
        } else {
            self.width2 = Some(width);
        }
        self
    }

    pub fn imm(mut self, imm: Imm) -> Self {
        self.imm = Some(imm);
        self
    }
}

/// One item of a block: an instruction or a context annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Instr(Instr),
    /// Context with the file name given as a string data entry id.
    Context { file_data: u32, line: u32 },
    ContextShort { line: u32 },
    ContextNil,
}

/// A basic block: the unit label immediates refer to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub items: Vec<Item>,
}

/// A procedure: named, and made of blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcEntry {
    pub name: String,
    pub blocks: Vec<Block>,
}

/// A whole module, ready to serialise.
#[derive(Debug, Clone)]
pub struct Module {
    pub variant: Variant,
    /// Name-table entries; by convention index 0 is the module's name.
    pub names: Vec<String>,
    pub entry: Option<(EntrySignature, u32)>,
    pub imports: Vec<(String, String)>,
    pub structs: Vec<Vec<Width>>,
    pub datas: Vec<DataEntry>,
    pub procs: Vec<ProcEntry>,
    /// `(proc_id, data_id)` pairs.
    pub closures: Vec<(u32, u32)>,
    /// `(fully_qualified_name, closure_id)` pairs.
    pub exports: Vec<(String, u32)>,
}

impl Module {
    pub fn new(variant: Variant, name: &str) -> Self {
        Self {
            variant,
            names: vec![name.to_string()],
            entry: None,
            imports: Vec::new(),
            structs: Vec::new(),
            datas: Vec::new(),
            procs: Vec::new(),
            closures: Vec::new(),
            exports: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.names[0]
    }

    pub fn set_entry(&mut self, signature: EntrySignature, closure_id: u32) {
        self.entry = Some((signature, closure_id));
    }

    pub fn add_import(&mut self, module: &str, symbol: &str) -> u32 {
        self.imports.push((module.to_string(), symbol.to_string()));
        self.imports.len() as u32 - 1
    }

    pub fn add_struct(&mut self, fields: Vec<Width>) -> u32 {
        self.structs.push(fields);
        self.structs.len() as u32 - 1
    }

    pub fn add_data(&mut self, entry: DataEntry) -> u32 {
        self.datas.push(entry);
        self.datas.len() as u32 - 1
    }

    pub fn add_string(&mut self, text: &str) -> u32 {
        self.add_data(DataEntry::String(text.as_bytes().to_vec()))
    }

    pub fn add_proc(&mut self, proc: ProcEntry) -> u32 {
        self.procs.push(proc);
        self.procs.len() as u32 - 1
    }

    pub fn add_closure(&mut self, proc_id: u32, data_id: u32) -> u32 {
        self.closures.push((proc_id, data_id));
        self.closures.len() as u32 - 1
    }

    pub fn add_export(&mut self, symbol: &str, closure_id: u32) {
        self.exports
            .push((format!("{}.{}", self.name(), symbol), closure_id));
    }
}
