//! The PZ module reader.
//!
//! Loading resolves every reference in the file, so the interpreter never
//! consults a table at run time. The file is processed strictly in
//! (options, names, imports, structs, data, code, closures, exports)
//! order; all references point backwards, which is what lets a single
//! forward walk resolve them.
//!
//! Code is read in two passes. Label and call immediates must encode
//! absolute byte addresses in the final code buffers, but buffer sizes
//! depend on per-instruction operand sizes, so the first pass walks every
//! proc purely to compute sizes and block offsets, then the second pass
//! re-reads the same bytes and writes resolved instructions.

use std::io;
use std::path::Path;

use thiserror::Error;

use crate::binary::BinaryInput;
use crate::format::{
    self, data_enc_bytes, instruction_info, num_immediate_bytes, write_instr, DataEnc,
    EntrySignature, ImmediateType, ImmediateValue, Opcode, Width, PTR_SIZE, WORD_SIZE,
};
use crate::gc::capability::GcCapability;
use crate::gc::NoGcScope;
use crate::library::{Closure, Export, Library, LibraryLoading, Proc, ProcContext, StructLayout};
use crate::machine::Machine;

/// Everything that can go wrong while loading a module.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{filename}: {error}")]
    Io {
        filename: String,
        #[source]
        error: io::Error,
    },

    #[error("{filename}: bad magic value, is this a PZ file?")]
    BadMagic { filename: String },

    #[error("{filename}: cannot execute plasma objects, link objects into a program first")]
    ObjectFile { filename: String },

    #[error("{filename}: bad description string, is this a PZ file?")]
    BadDescription { filename: String },

    #[error("{filename}: incorrect PZ version, found {found}, expecting {expected}")]
    Version {
        filename: String,
        found: u16,
        expected: u16,
    },

    #[error("{filename}: corrupt file while reading options")]
    CorruptOptions { filename: String },

    #[error("module not found: {module}")]
    ModuleNotFound { module: String },

    #[error("symbol not found: {module}.{symbol}")]
    SymbolNotFound { module: String, symbol: String },

    #[error("{filename}: invalid width code {code} at offset {offset}")]
    BadWidth {
        filename: String,
        code: u8,
        offset: u64,
    },

    #[error("{filename}: unknown data kind {kind} at offset {offset}")]
    BadDataKind {
        filename: String,
        kind: u8,
        offset: u64,
    },

    #[error("{filename}: unrecognised data slot encoding {tag:#04x} at offset {offset}")]
    BadDataEnc {
        filename: String,
        tag: u8,
        offset: u64,
    },

    #[error("{filename}: forward reference to data {id}")]
    ForwardDataRef { filename: String, id: u32 },

    #[error("{filename}: unknown data id {id}")]
    BadDataId { filename: String, id: u32 },

    #[error("{filename}: unknown struct id {id}")]
    BadStructId { filename: String, id: u32 },

    #[error("{filename}: struct {id} has no field {field}")]
    BadStructField {
        filename: String,
        id: u32,
        field: u8,
    },

    #[error("{filename}: unknown closure id {id}")]
    BadClosureId { filename: String, id: u32 },

    #[error("{filename}: unknown proc id {id}")]
    BadProcId { filename: String, id: u32 },

    #[error("{filename}: unknown import id {id}")]
    BadImportId { filename: String, id: u32 },

    #[error("{filename}: unknown label {block} in proc {proc}")]
    BadLabel {
        filename: String,
        block: u32,
        proc: u32,
    },

    #[error("{filename}: unknown opcode {opcode} at offset {offset}")]
    BadOpcode {
        filename: String,
        opcode: u8,
        offset: u64,
    },

    #[error("{filename}: unknown byte {byte} in instruction stream at offset {offset}")]
    BadMetaByte {
        filename: String,
        byte: u8,
        offset: u64,
    },

    #[error("{filename}: junk at end of file")]
    JunkAtEnd { filename: String },
}

/// A successfully loaded module.
#[derive(Debug)]
pub struct LoadedModule {
    /// The module's own name: by convention, name-table entry 0.
    pub name: Option<String>,
    pub library: Library,
    pub names: Vec<String>,
}

/// The entry-closure option, if present: signature kind and closure id.
#[derive(Debug, Clone, Copy)]
struct EntryClosure {
    signature: EntrySignature,
    closure_id: u32,
}

/// Imports resolved against previously loaded libraries.
struct Imported {
    num_imports: usize,
    import_closures: Vec<*mut Closure>,
}

struct ReadInfo<'m> {
    machine: &'m Machine,
    file: BinaryInput,
    load_debuginfo: bool,
}

impl ReadInfo<'_> {
    fn io_err(&mut self, error: io::Error) -> LoadError {
        LoadError::Io {
            filename: self.file.filename().to_string(),
            error,
        }
    }

    fn filename(&self) -> String {
        self.file.filename().to_string()
    }

    fn offset(&mut self) -> u64 {
        self.file.tell().unwrap_or(0)
    }
}

macro_rules! try_read {
    ($read:expr, $e:expr) => {
        match $e {
            Ok(v) => v,
            Err(error) => return Err($read.io_err(error)),
        }
    };
}

/// Load a module from a file.
pub fn read(machine: &Machine, path: &Path) -> Result<LoadedModule, LoadError> {
    let file = BinaryInput::open(path).map_err(|error| LoadError::Io {
        filename: path.display().to_string(),
        error,
    })?;
    read_input(machine, file)
}

/// Load a module from an already-open input.
pub fn read_input(machine: &Machine, file: BinaryInput) -> Result<LoadedModule, LoadError> {
    let mut read = ReadInfo {
        machine,
        file,
        load_debuginfo: machine.load_debuginfo(),
    };

    let magic = try_read!(read, read.file.read_u32());
    match magic {
        format::PZ_MAGIC_OBJECT => {
            return Err(LoadError::ObjectFile {
                filename: read.filename(),
            })
        }
        format::PZ_MAGIC_PROGRAM | format::PZ_MAGIC_LIBRARY => {}
        _ => {
            return Err(LoadError::BadMagic {
                filename: read.filename(),
            })
        }
    }

    let description = try_read!(read, read.file.read_len_string());
    if !description.starts_with(format::PZ_MAGIC_STRING_PROGRAM)
        && !description.starts_with(format::PZ_MAGIC_STRING_LIBRARY)
    {
        return Err(LoadError::BadDescription {
            filename: read.filename(),
        });
    }

    let version = try_read!(read, read.file.read_u16());
    if version != format::PZ_FORMAT_VERSION {
        return Err(LoadError::Version {
            filename: read.filename(),
            found: version,
            expected: format::PZ_FORMAT_VERSION,
        });
    }

    let entry_closure = read_options(&mut read)?;

    let num_names = try_read!(read, read.file.read_u32());
    let mut names = Vec::with_capacity(num_names as usize);
    for _ in 0..num_names {
        names.push(try_read!(read, read.file.read_len_string()));
    }

    let num_imports = try_read!(read, read.file.read_u32());
    let num_structs = try_read!(read, read.file.read_u32());
    let num_datas = try_read!(read, read.file.read_u32());
    let num_procs = try_read!(read, read.file.read_u32());
    let num_closures = try_read!(read, read.file.read_u32());
    let num_exports = try_read!(read, read.file.read_u32());

    tracing::debug!(
        num_imports,
        num_structs,
        num_datas,
        num_procs,
        num_closures,
        num_exports,
        "loading module"
    );

    let lib_load = {
        let no_gc = NoGcScope::new(machine);
        let lib_load = LibraryLoading::new(
            machine,
            &no_gc,
            num_structs as usize,
            num_datas as usize,
            num_procs as usize,
            num_closures as usize,
        );
        no_gc.abort_if_oom("loading a module");
        lib_load
    };

    let imported = read_imports(&mut read, num_imports)?;
    read_structs(&mut read, num_structs, &lib_load)?;
    read_data(&mut read, num_datas, &lib_load, &imported)?;
    read_code(&mut read, num_procs, &lib_load, &imported)?;
    read_closures(&mut read, num_closures, &lib_load)?;
    read_exports(&mut read, num_exports, &lib_load)?;

    if read.file.read_u8().is_ok() {
        return Err(LoadError::JunkAtEnd {
            filename: read.filename(),
        });
    }
    if !try_read!(read, read.file.is_at_eof()) {
        return Err(LoadError::JunkAtEnd {
            filename: read.filename(),
        });
    }

    // A collection here would miss the loaded objects: they are not yet
    // reachable from the machine until the caller registers the library.
    let no_gc = NoGcScope::new(machine);
    let entry = match entry_closure {
        Some(entry) => match lib_load.closure(entry.closure_id) {
            Some(closure) => Some((entry.signature, closure)),
            None => {
                return Err(LoadError::BadClosureId {
                    filename: read.filename(),
                    id: entry.closure_id,
                })
            }
        },
        None => None,
    };
    let mut library = lib_load.freeze();
    if let Some((signature, closure)) = entry {
        library.set_entry_closure(signature, closure);
    }
    no_gc.abort_if_oom("publishing a module");

    Ok(LoadedModule {
        name: names.first().cloned(),
        library,
        names,
    })
}

fn read_options(read: &mut ReadInfo<'_>) -> Result<Option<EntryClosure>, LoadError> {
    let num_options = try_read!(read, read.file.read_u16());
    let mut entry = None;

    for _ in 0..num_options {
        let opt_type = try_read!(read, read.file.read_u16());
        let len = try_read!(read, read.file.read_u16());

        match opt_type {
            format::PZ_OPT_ENTRY_CLOSURE => {
                if len != 5 {
                    return Err(LoadError::CorruptOptions {
                        filename: read.filename(),
                    });
                }
                let signature_byte = try_read!(read, read.file.read_u8());
                let closure_id = try_read!(read, read.file.read_u32());
                let signature = EntrySignature::from_u8(signature_byte).ok_or_else(|| {
                    LoadError::CorruptOptions {
                        filename: read.filename(),
                    }
                })?;
                entry = Some(EntryClosure {
                    signature,
                    closure_id,
                });
            }
            _ => {
                try_read!(read, read.file.seek_cur(len as i64));
            }
        }
    }

    Ok(entry)
}

fn read_imports(read: &mut ReadInfo<'_>, num_imports: u32) -> Result<Imported, LoadError> {
    let mut imported = Imported {
        num_imports: num_imports as usize,
        import_closures: Vec::with_capacity(num_imports as usize),
    };

    for _ in 0..num_imports {
        let module_name = try_read!(read, read.file.read_len_string());
        let symbol_name = try_read!(read, read.file.read_len_string());

        if !read.machine.has_library(&module_name) {
            return Err(LoadError::ModuleNotFound {
                module: module_name,
            });
        }
        let qualified = format!("{module_name}.{symbol_name}");
        match read.machine.lookup_symbol(&module_name, &qualified) {
            Some(export) => imported.import_closures.push(export.closure()),
            None => {
                return Err(LoadError::SymbolNotFound {
                    module: module_name,
                    symbol: symbol_name,
                })
            }
        }
    }

    Ok(imported)
}

fn read_width(read: &mut ReadInfo<'_>) -> Result<Width, LoadError> {
    let offset = read.offset();
    let code = try_read!(read, read.file.read_u8());
    Width::from_u8(code).ok_or_else(|| LoadError::BadWidth {
        filename: read.filename(),
        code,
        offset,
    })
}

fn read_structs(
    read: &mut ReadInfo<'_>,
    num_structs: u32,
    library: &LibraryLoading<'_>,
) -> Result<(), LoadError> {
    for _ in 0..num_structs {
        let num_fields = try_read!(read, read.file.read_u32());
        let mut layout = StructLayout::new();
        for _ in 0..num_fields {
            layout.add_field(read_width(read)?);
        }
        layout.calculate_layout();
        library.add_struct(layout);
    }
    Ok(())
}

fn read_data(
    read: &mut ReadInfo<'_>,
    num_datas: u32,
    library: &LibraryLoading<'_>,
    imported: &Imported,
) -> Result<(), LoadError> {
    let mut total_size = 0usize;

    for _ in 0..num_datas {
        let offset = read.offset();
        let kind = try_read!(read, read.file.read_u8());
        let data = match kind {
            format::PZ_DATA_ARRAY => {
                let num_elements = try_read!(read, read.file.read_u16());
                let width = read_width(read)?;
                let size = width.to_bytes() * num_elements as usize;
                let data = library.alloc_bytes(size.max(1));
                let mut dest = data;
                for _ in 0..num_elements {
                    read_data_slot(read, dest, library, imported)?;
                    // SAFETY: dest stays within the freshly allocated
                    // buffer of num_elements * width bytes.
                    dest = unsafe { dest.add(width.to_bytes()) };
                }
                total_size += size;
                data
            }
            format::PZ_DATA_STRUCT => {
                let struct_id = try_read!(read, read.file.read_u32());
                let layout =
                    library
                        .struct_layout(struct_id)
                        .ok_or_else(|| LoadError::BadStructId {
                            filename: read.filename(),
                            id: struct_id,
                        })?;
                let data = library.alloc_bytes(layout.total_size().max(1));
                for field in 0..layout.num_fields() {
                    let field_offset = layout.field_offset(field).unwrap();
                    // SAFETY: field offsets are below the struct's total
                    // size by construction.
                    let dest = unsafe { data.add(field_offset) };
                    read_data_slot(read, dest, library, imported)?;
                }
                total_size += layout.total_size();
                data
            }
            format::PZ_DATA_STRING => {
                // A flat buffer of narrow characters: a length word then
                // the bytes. UTF-8 is not decoded at load time.
                let num_elements = try_read!(read, read.file.read_u16());
                let data = library.alloc_bytes(WORD_SIZE + num_elements as usize);
                // SAFETY: the buffer holds one word plus num_elements
                // bytes.
                unsafe {
                    (data as *mut usize).write(num_elements as usize);
                    let mut dest = data.add(WORD_SIZE);
                    for _ in 0..num_elements {
                        read_data_slot(read, dest, library, imported)?;
                        dest = dest.add(1);
                    }
                }
                total_size += WORD_SIZE + num_elements as usize;
                data
            }
            _ => {
                return Err(LoadError::BadDataKind {
                    filename: read.filename(),
                    kind,
                    offset,
                })
            }
        };
        library.add_data(data);
    }

    tracing::debug!(num_datas, total_size, "loaded data entries");
    Ok(())
}

/// Read one data slot and write its value at `dest`.
fn read_data_slot(
    read: &mut ReadInfo<'_>,
    dest: *mut u8,
    library: &LibraryLoading<'_>,
    imported: &Imported,
) -> Result<(), LoadError> {
    let offset = read.offset();
    let tag = try_read!(read, read.file.read_u8());
    let enc = DataEnc::from_tag(tag).ok_or_else(|| LoadError::BadDataEnc {
        filename: read.filename(),
        tag,
        offset,
    })?;

    // SAFETY: callers pass a dest with room for the slot's target width.
    unsafe {
        match enc {
            DataEnc::Normal => match data_enc_bytes(tag) {
                1 => {
                    let value = try_read!(read, read.file.read_u8());
                    dest.write_unaligned(value);
                }
                2 => {
                    let value = try_read!(read, read.file.read_u16());
                    (dest as *mut u16).write_unaligned(value);
                }
                4 => {
                    let value = try_read!(read, read.file.read_u32());
                    (dest as *mut u32).write_unaligned(value);
                }
                8 => {
                    let value = try_read!(read, read.file.read_u64());
                    (dest as *mut u64).write_unaligned(value);
                }
                _ => {
                    return Err(LoadError::BadDataEnc {
                        filename: read.filename(),
                        tag,
                        offset,
                    })
                }
            },
            DataEnc::Fast => {
                let value = try_read!(read, read.file.read_u32());
                (dest as *mut u32).write_unaligned(value);
            }
            DataEnc::Wptr => {
                let value = try_read!(read, read.file.read_u32()) as i32;
                (dest as *mut isize).write_unaligned(value as isize);
            }
            DataEnc::Data => {
                let id = try_read!(read, read.file.read_u32());
                match library.data(id) {
                    Some(data) if !data.is_null() => {
                        (dest as *mut *mut u8).write_unaligned(data);
                    }
                    _ => {
                        return Err(LoadError::ForwardDataRef {
                            filename: read.filename(),
                            id,
                        })
                    }
                }
            }
            DataEnc::Import => {
                let id = try_read!(read, read.file.read_u32());
                let closure = imported
                    .import_closures
                    .get(id as usize)
                    .copied()
                    .ok_or_else(|| LoadError::BadImportId {
                        filename: read.filename(),
                        id,
                    })?;
                (dest as *mut *mut Closure).write_unaligned(closure);
            }
            DataEnc::Closure => {
                let id = try_read!(read, read.file.read_u32());
                let closure = library.closure(id).ok_or_else(|| LoadError::BadClosureId {
                    filename: read.filename(),
                    id,
                })?;
                (dest as *mut *mut Closure).write_unaligned(closure);
            }
        }
    }

    Ok(())
}

fn read_code(
    read: &mut ReadInfo<'_>,
    num_procs: u32,
    library: &LibraryLoading<'_>,
    imported: &Imported,
) -> Result<(), LoadError> {
    let mut block_offsets: Vec<Vec<usize>> = vec![Vec::new(); num_procs as usize];

    // First pass: walk every proc to learn its size and block offsets,
    // then allocate its code buffer.
    tracing::debug!("reading procs, first pass");
    let code_start = try_read!(read, read.file.tell());
    for i in 0..num_procs {
        let (size, name) =
            read_proc(read, imported, library, None, &mut block_offsets[i as usize])?;
        let code = library.alloc_bytes(size.max(1));
        library.add_proc(Proc::new(name, code, size));
    }

    // Second pass: every proc's address is now known, so calls between
    // procs in either direction resolve.
    tracing::debug!("reading procs, second pass");
    try_read!(read, read.file.seek_set(code_start));
    for i in 0..num_procs {
        read_proc(read, imported, library, Some(i), &mut block_offsets[i as usize])?;
    }

    Ok(())
}

/// Read one proc. In the first pass (`proc_id` is `None`) nothing is
/// written; block offsets are recorded and the proc's byte size returned.
fn read_proc(
    read: &mut ReadInfo<'_>,
    imported: &Imported,
    library: &LibraryLoading<'_>,
    proc_id: Option<u32>,
    block_offsets: &mut Vec<usize>,
) -> Result<(usize, String), LoadError> {
    let first_pass = proc_id.is_none();
    let name = try_read!(read, read.file.read_len_string());
    let num_blocks = try_read!(read, read.file.read_u32());
    let mut proc_offset = 0usize;

    for _ in 0..num_blocks {
        if first_pass {
            block_offsets.push(proc_offset);
        }
        let num_items = try_read!(read, read.file.read_u32());
        for _ in 0..num_items {
            let offset = read.offset();
            let byte = try_read!(read, read.file.read_u8());
            match byte {
                format::PZ_CODE_INSTR => {
                    read_instr(
                        read,
                        imported,
                        library,
                        proc_id,
                        block_offsets,
                        &mut proc_offset,
                    )?;
                }
                format::PZ_CODE_META_CONTEXT
                | format::PZ_CODE_META_CONTEXT_SHORT
                | format::PZ_CODE_META_CONTEXT_NIL => {
                    read_meta(read, library, proc_id, proc_offset, byte)?;
                }
                _ => {
                    return Err(LoadError::BadMetaByte {
                        filename: read.filename(),
                        byte,
                        offset,
                    })
                }
            }
        }
    }

    Ok((proc_offset, name))
}

fn read_instr(
    read: &mut ReadInfo<'_>,
    imported: &Imported,
    library: &LibraryLoading<'_>,
    proc_id: Option<u32>,
    block_offsets: &[usize],
    proc_offset: &mut usize,
) -> Result<(), LoadError> {
    let first_pass = proc_id.is_none();
    let offset = read.offset();
    let opcode_byte = try_read!(read, read.file.read_u8());
    let opcode = Opcode::from_file_u8(opcode_byte).ok_or_else(|| LoadError::BadOpcode {
        filename: read.filename(),
        opcode: opcode_byte,
        offset,
    })?;

    let info = instruction_info(opcode);
    let width1 = if info.num_width_bytes > 0 {
        Some(read_width(read)?)
    } else {
        None
    };
    let width2 = if info.num_width_bytes > 1 {
        Some(read_width(read)?)
    } else {
        None
    };

    let immediate = match info.immediate {
        ImmediateType::None => ImmediateValue::None,
        ImmediateType::Num => {
            let width = width1.expect("Num immediate requires a width byte");
            let value = match num_immediate_bytes(width) {
                1 => try_read!(read, read.file.read_u8()) as u64,
                2 => try_read!(read, read.file.read_u16()) as u64,
                4 => try_read!(read, read.file.read_u32()) as u64,
                8 => try_read!(read, read.file.read_u64()),
                _ => unreachable!(),
            };
            ImmediateValue::Num(value)
        }
        ImmediateType::Imm8 => {
            let value = try_read!(read, read.file.read_u8());
            ImmediateValue::U8(value)
        }
        ImmediateType::ClosureRef => {
            let id = try_read!(read, read.file.read_u32());
            if first_pass {
                ImmediateValue::Word(0)
            } else {
                let closure = library.closure(id).ok_or_else(|| LoadError::BadClosureId {
                    filename: read.filename(),
                    id,
                })?;
                ImmediateValue::Word(closure as usize)
            }
        }
        ImmediateType::ProcRef => {
            let id = try_read!(read, read.file.read_u32());
            if first_pass {
                ImmediateValue::Word(0)
            } else {
                let (code, _) = library.proc_code(id).ok_or_else(|| LoadError::BadProcId {
                    filename: read.filename(),
                    id,
                })?;
                ImmediateValue::Word(code as usize)
            }
        }
        ImmediateType::ImportRef => {
            let id = try_read!(read, read.file.read_u32());
            if id as usize >= imported.num_imports {
                return Err(LoadError::BadImportId {
                    filename: read.filename(),
                    id,
                });
            }
            ImmediateValue::U16((id as usize * PTR_SIZE) as u16)
        }
        ImmediateType::ImportClosureRef => {
            let id = try_read!(read, read.file.read_u32());
            let closure = imported
                .import_closures
                .get(id as usize)
                .copied()
                .ok_or_else(|| LoadError::BadImportId {
                    filename: read.filename(),
                    id,
                })?;
            ImmediateValue::Word(closure as usize)
        }
        ImmediateType::LabelRef => {
            let block = try_read!(read, read.file.read_u32());
            if first_pass {
                ImmediateValue::Word(0)
            } else {
                let proc = proc_id.unwrap();
                let block_offset = block_offsets.get(block as usize).copied().ok_or_else(
                    || LoadError::BadLabel {
                        filename: read.filename(),
                        block,
                        proc,
                    },
                )?;
                let (code, _) = library.proc_code(proc).expect("current proc exists");
                ImmediateValue::Word(code as usize + block_offset)
            }
        }
        ImmediateType::StructRef => {
            let id = try_read!(read, read.file.read_u32());
            if first_pass {
                ImmediateValue::Word(0)
            } else {
                let layout = library.struct_layout(id).ok_or_else(|| LoadError::BadStructId {
                    filename: read.filename(),
                    id,
                })?;
                ImmediateValue::Word(layout.total_size())
            }
        }
        ImmediateType::StructRefField => {
            let id = try_read!(read, read.file.read_u32());
            let field = try_read!(read, read.file.read_u8());
            if first_pass {
                ImmediateValue::U16(0)
            } else {
                let layout = library.struct_layout(id).ok_or_else(|| LoadError::BadStructId {
                    filename: read.filename(),
                    id,
                })?;
                let field_offset =
                    layout
                        .field_offset(field as usize)
                        .ok_or_else(|| LoadError::BadStructField {
                            filename: read.filename(),
                            id,
                            field,
                        })?;
                ImmediateValue::U16(field_offset as u16)
            }
        }
    };

    if let Some(proc) = proc_id {
        let (code, size) = library.proc_code(proc).expect("current proc exists");
        // SAFETY: the first pass sized this buffer with the identical
        // walk, so every write lands within it.
        let code_slice = unsafe { std::slice::from_raw_parts_mut(code, size) };
        *proc_offset = write_instr(
            Some(code_slice),
            *proc_offset,
            opcode,
            width1,
            width2,
            immediate,
        );
    } else {
        *proc_offset = write_instr(None, *proc_offset, opcode, width1, width2, immediate);
    }

    Ok(())
}

fn read_meta(
    read: &mut ReadInfo<'_>,
    library: &LibraryLoading<'_>,
    proc_id: Option<u32>,
    proc_offset: usize,
    meta_byte: u8,
) -> Result<(), LoadError> {
    // Contexts are only materialised on the second pass, and only when
    // debug tracing wants them.
    let wanted = proc_id.is_some() && read.load_debuginfo;

    match meta_byte {
        format::PZ_CODE_META_CONTEXT => {
            if wanted {
                let data_id = try_read!(read, read.file.read_u32());
                let data = match library.data(data_id) {
                    Some(data) if !data.is_null() => data,
                    _ => {
                        return Err(LoadError::BadDataId {
                            filename: read.filename(),
                            id: data_id,
                        })
                    }
                };
                let filename = unsafe { read_heap_string(data) };
                let line = try_read!(read, read.file.read_u32());
                library.proc_add_context(
                    proc_id.unwrap(),
                    proc_offset,
                    ProcContext::FileLine(filename, line),
                );
            } else {
                try_read!(read, read.file.seek_cur(8));
            }
        }
        format::PZ_CODE_META_CONTEXT_SHORT => {
            if wanted {
                let line = try_read!(read, read.file.read_u32());
                library.proc_add_context(proc_id.unwrap(), proc_offset, ProcContext::Line(line));
            } else {
                try_read!(read, read.file.seek_cur(4));
            }
        }
        format::PZ_CODE_META_CONTEXT_NIL => {
            if wanted {
                library.proc_add_context(proc_id.unwrap(), proc_offset, ProcContext::Nil);
            }
        }
        _ => unreachable!("read_proc dispatches only meta bytes here"),
    }

    Ok(())
}

/// Decode a string data blob: a length word followed by that many bytes.
///
/// # Safety
///
/// `data` must point at a string data entry produced by `read_data`.
unsafe fn read_heap_string(data: *mut u8) -> String {
    let len = (data as *const usize).read();
    let bytes = std::slice::from_raw_parts(data.add(WORD_SIZE), len);
    String::from_utf8_lossy(bytes).into_owned()
}

fn read_closures(
    read: &mut ReadInfo<'_>,
    num_closures: u32,
    library: &LibraryLoading<'_>,
) -> Result<(), LoadError> {
    for i in 0..num_closures {
        let proc_id = try_read!(read, read.file.read_u32());
        let (code, _) = library.proc_code(proc_id).ok_or_else(|| LoadError::BadProcId {
            filename: read.filename(),
            id: proc_id,
        })?;

        let data_id = try_read!(read, read.file.read_u32());
        let env = match library.data(data_id) {
            Some(data) => data,
            None => {
                return Err(LoadError::BadDataId {
                    filename: read.filename(),
                    id: data_id,
                })
            }
        };

        let closure = library.closure(i).expect("closures were pre-allocated");
        // SAFETY: the closure cell was allocated by LibraryLoading::new.
        unsafe {
            (*closure).code = code;
            (*closure).env = env;
        }
    }
    Ok(())
}

fn read_exports(
    read: &mut ReadInfo<'_>,
    num_exports: u32,
    library: &LibraryLoading<'_>,
) -> Result<(), LoadError> {
    for _ in 0..num_exports {
        let name = try_read!(read, read.file.read_len_string());
        let closure_id = try_read!(read, read.file.read_u32());
        let closure = library
            .closure(closure_id)
            .ok_or_else(|| LoadError::BadClosureId {
                filename: read.filename(),
                id: closure_id,
            })?;
        library.add_symbol(name, Export::new(closure_id, closure));
    }
    Ok(())
}
