//! The PZ binary writer.
//!
//! Serialises a [`Module`](super::Module) in the exact layout the
//! runtime's loader reads: little-endian integers, 16-bit length-prefixed
//! strings, and counts before each record group. The writer validates
//! instructions against the runtime's static opcode table, so an
//! instruction the loader could not walk is refused up front.

use thiserror::Error;

use plasma_runtime::format::{
    instruction_info, num_immediate_bytes, DataEnc, ImmediateType, Opcode, PZ_CODE_INSTR,
    PZ_CODE_META_CONTEXT, PZ_CODE_META_CONTEXT_NIL, PZ_CODE_META_CONTEXT_SHORT, PZ_DATA_ARRAY,
    PZ_DATA_STRING, PZ_DATA_STRUCT, PZ_FORMAT_VERSION, PZ_MAGIC_LIBRARY, PZ_MAGIC_PROGRAM,
    PZ_MAGIC_STRING_LIBRARY, PZ_MAGIC_STRING_PROGRAM, PZ_OPT_ENTRY_CLOSURE,
};

use super::{DataEntry, DataSlot, Imm, Instr, Item, Module, Variant};

#[derive(Debug, Error)]
pub enum PzWriteError {
    #[error("string too long for a 16-bit length: {len} bytes")]
    StringTooLong { len: usize },

    #[error("proc {proc}: {opcode:?} expects {expected} width bytes, {given} given")]
    WidthMismatch {
        proc: String,
        opcode: Opcode,
        expected: u8,
        given: u8,
    },

    #[error("proc {proc}: {opcode:?} has the wrong immediate kind")]
    ImmediateMismatch { proc: String, opcode: Opcode },

    #[error("proc {proc}: {opcode:?} cannot appear in a PZ file")]
    NotAFileOpcode { proc: String, opcode: Opcode },

    #[error("data slot holds {bytes}-byte integer; only 1, 2, 4 or 8 are valid")]
    BadSlotWidth { bytes: u8 },

    #[error("a program module needs an entry closure")]
    MissingEntry,
}

struct Out {
    bytes: Vec<u8>,
}

impl Out {
    fn u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn str16(&mut self, s: &str) -> Result<(), PzWriteError> {
        let len = s.len();
        if len > u16::MAX as usize {
            return Err(PzWriteError::StringTooLong { len });
        }
        self.u16(len as u16);
        self.bytes.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

/// Serialise a module to bytes.
pub fn write_module(module: &Module) -> Result<Vec<u8>, PzWriteError> {
    let mut out = Out { bytes: Vec::new() };

    match module.variant {
        Variant::Program => {
            if module.entry.is_none() {
                return Err(PzWriteError::MissingEntry);
            }
            out.u32(PZ_MAGIC_PROGRAM);
            out.str16(PZ_MAGIC_STRING_PROGRAM)?;
        }
        Variant::Library => {
            out.u32(PZ_MAGIC_LIBRARY);
            out.str16(PZ_MAGIC_STRING_LIBRARY)?;
        }
    }
    out.u16(PZ_FORMAT_VERSION);

    // Options.
    match module.entry {
        Some((signature, closure_id)) => {
            out.u16(1);
            out.u16(PZ_OPT_ENTRY_CLOSURE);
            out.u16(5);
            out.u8(signature as u8);
            out.u32(closure_id);
        }
        None => out.u16(0),
    }

    // Names.
    out.u32(module.names.len() as u32);
    for name in &module.names {
        out.str16(name)?;
    }

    // Counts.
    out.u32(module.imports.len() as u32);
    out.u32(module.structs.len() as u32);
    out.u32(module.datas.len() as u32);
    out.u32(module.procs.len() as u32);
    out.u32(module.closures.len() as u32);
    out.u32(module.exports.len() as u32);

    for (module_name, symbol) in &module.imports {
        out.str16(module_name)?;
        out.str16(symbol)?;
    }

    for fields in &module.structs {
        out.u32(fields.len() as u32);
        for width in fields {
            out.u8(*width as u8);
        }
    }

    for data in &module.datas {
        write_data(&mut out, data)?;
    }

    for proc in &module.procs {
        out.str16(&proc.name)?;
        out.u32(proc.blocks.len() as u32);
        for block in &proc.blocks {
            out.u32(block.items.len() as u32);
            for item in &block.items {
                write_item(&mut out, &proc.name, item)?;
            }
        }
    }

    for (proc_id, data_id) in &module.closures {
        out.u32(*proc_id);
        out.u32(*data_id);
    }

    for (name, closure_id) in &module.exports {
        out.str16(name)?;
        out.u32(*closure_id);
    }

    Ok(out.bytes)
}

fn write_data(out: &mut Out, data: &DataEntry) -> Result<(), PzWriteError> {
    match data {
        DataEntry::Array { width, elements } => {
            out.u8(PZ_DATA_ARRAY);
            out.u16(elements.len() as u16);
            out.u8(*width as u8);
            for slot in elements {
                write_slot(out, slot)?;
            }
        }
        DataEntry::Struct { struct_id, fields } => {
            out.u8(PZ_DATA_STRUCT);
            out.u32(*struct_id);
            for slot in fields {
                write_slot(out, slot)?;
            }
        }
        DataEntry::String(bytes) => {
            out.u8(PZ_DATA_STRING);
            out.u16(bytes.len() as u16);
            for byte in bytes {
                out.u8(DataEnc::Normal.tag(1));
                out.u8(*byte);
            }
        }
    }
    Ok(())
}

fn write_slot(out: &mut Out, slot: &DataSlot) -> Result<(), PzWriteError> {
    match slot {
        DataSlot::Normal { bytes, value } => {
            out.u8(DataEnc::Normal.tag(*bytes));
            match bytes {
                1 => out.u8(*value as u8),
                2 => out.u16(*value as u16),
                4 => out.u32(*value as u32),
                8 => out.u64(*value),
                _ => return Err(PzWriteError::BadSlotWidth { bytes: *bytes }),
            }
        }
        DataSlot::Fast(value) => {
            out.u8(DataEnc::Fast.tag(4));
            out.u32(*value);
        }
        DataSlot::Wptr(value) => {
            out.u8(DataEnc::Wptr.tag(4));
            out.u32(*value as u32);
        }
        DataSlot::DataRef(id) => {
            out.u8(DataEnc::Data.tag(4));
            out.u32(*id);
        }
        DataSlot::ImportRef(id) => {
            out.u8(DataEnc::Import.tag(4));
            out.u32(*id);
        }
        DataSlot::ClosureRef(id) => {
            out.u8(DataEnc::Closure.tag(4));
            out.u32(*id);
        }
    }
    Ok(())
}

fn write_item(out: &mut Out, proc: &str, item: &Item) -> Result<(), PzWriteError> {
    match item {
        Item::Instr(instr) => {
            out.u8(PZ_CODE_INSTR);
            write_instr(out, proc, instr)
        }
        Item::Context { file_data, line } => {
            out.u8(PZ_CODE_META_CONTEXT);
            out.u32(*file_data);
            out.u32(*line);
            Ok(())
        }
        Item::ContextShort { line } => {
            out.u8(PZ_CODE_META_CONTEXT_SHORT);
            out.u32(*line);
            Ok(())
        }
        Item::ContextNil => {
            out.u8(PZ_CODE_META_CONTEXT_NIL);
            Ok(())
        }
    }
}

fn write_instr(out: &mut Out, proc: &str, instr: &Instr) -> Result<(), PzWriteError> {
    if Opcode::from_file_u8(instr.opcode as u8).is_none() {
        return Err(PzWriteError::NotAFileOpcode {
            proc: proc.to_string(),
            opcode: instr.opcode,
        });
    }

    let info = instruction_info(instr.opcode);
    let given = instr.width1.is_some() as u8 + instr.width2.is_some() as u8;
    if given != info.num_width_bytes {
        return Err(PzWriteError::WidthMismatch {
            proc: proc.to_string(),
            opcode: instr.opcode,
            expected: info.num_width_bytes,
            given,
        });
    }

    out.u8(instr.opcode as u8);
    if let Some(width) = instr.width1 {
        out.u8(width as u8);
    }
    if let Some(width) = instr.width2 {
        out.u8(width as u8);
    }

    let mismatch = || PzWriteError::ImmediateMismatch {
        proc: proc.to_string(),
        opcode: instr.opcode,
    };

    match (info.immediate, instr.imm) {
        (ImmediateType::None, None) => {}
        (ImmediateType::Num, Some(Imm::Num(value))) => {
            let width = instr.width1.expect("Num immediates follow a width byte");
            match num_immediate_bytes(width) {
                1 => out.u8(value as u8),
                2 => out.u16(value as u16),
                4 => out.u32(value as u32),
                8 => out.u64(value),
                _ => unreachable!(),
            }
        }
        (ImmediateType::Imm8, Some(Imm::U8(value))) => out.u8(value),
        (ImmediateType::ClosureRef, Some(Imm::Closure(id))) => out.u32(id),
        (ImmediateType::ProcRef, Some(Imm::Proc(id))) => out.u32(id),
        (ImmediateType::ImportRef, Some(Imm::Import(id))) => out.u32(id),
        (ImmediateType::ImportClosureRef, Some(Imm::ImportClosure(id))) => out.u32(id),
        (ImmediateType::LabelRef, Some(Imm::Label(block))) => out.u32(block),
        (ImmediateType::StructRef, Some(Imm::Struct(id))) => out.u32(id),
        (ImmediateType::StructRefField, Some(Imm::StructField(id, field))) => {
            out.u32(id);
            out.u8(field);
        }
        _ => return Err(mismatch()),
    }

    Ok(())
}
