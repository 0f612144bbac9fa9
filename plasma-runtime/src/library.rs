//! Loaded module representation.
//!
//! A [`Library`] holds everything the loader produced for one module:
//! struct layouts, data blobs, procs, closures and the exported-symbol
//! table. [`LibraryLoading`] is the same shape mid-load: its slots fill in
//! file order, and it participates in GC rooting so that half-loaded object
//! graphs survive collections triggered by later allocations.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::format::{EntrySignature, Width};
use crate::gc::capability::{trace_parent, GcCapability, GcMode, NoGcScope, Tracer};
use crate::gc::{Heap, MarkState};

/// A struct's computed layout: per-field byte offsets and the total size.
#[derive(Debug, Clone, Default)]
pub struct StructLayout {
    field_widths: Vec<Width>,
    field_offsets: Vec<usize>,
    total_size: usize,
}

impl StructLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_field(&mut self, width: Width) {
        self.field_widths.push(width);
    }

    /// Compute field offsets and the total size. Fields are aligned to
    /// their own width.
    pub fn calculate_layout(&mut self) {
        let mut offset = 0usize;
        self.field_offsets.clear();
        for width in &self.field_widths {
            let size = width.to_bytes();
            offset = (offset + size - 1) & !(size - 1);
            self.field_offsets.push(offset);
            offset += size;
        }
        self.total_size = offset;
    }

    pub fn num_fields(&self) -> usize {
        self.field_widths.len()
    }

    pub fn field_width(&self, field: usize) -> Width {
        self.field_widths[field]
    }

    pub fn field_offset(&self, field: usize) -> Option<usize> {
        self.field_offsets.get(field).copied()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }
}

/// Context attached to a code offset for debug traces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcContext {
    Nil,
    Line(u32),
    FileLine(String, u32),
}

/// A procedure: a contiguous, already-resolved code buffer on the GC heap,
/// plus an optional context table.
#[derive(Debug)]
pub struct Proc {
    name: String,
    code: *mut u8,
    size: usize,
    contexts: Vec<(usize, ProcContext)>,
}

impl Proc {
    pub fn new(name: String, code: *mut u8, size: usize) -> Self {
        Self {
            name,
            code,
            size,
            contexts: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> *mut u8 {
        self.code
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn add_context(&mut self, offset: usize, context: ProcContext) {
        self.contexts.push((offset, context));
    }

    /// The most recent context at or before `offset`.
    pub fn context_for(&self, offset: usize) -> Option<&ProcContext> {
        self.contexts
            .iter()
            .take_while(|(o, _)| *o <= offset)
            .last()
            .map(|(_, c)| c)
    }
}

/// A closure cell on the GC heap: the pair of a code pointer and an
/// environment pointer.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Closure {
    pub code: *mut u8,
    pub env: *mut u8,
}

/// An exported symbol: the closure's local id and its address.
#[derive(Debug, Clone, Copy)]
pub struct Export {
    id: u32,
    closure: *mut Closure,
}

impl Export {
    pub fn new(id: u32, closure: *mut Closure) -> Self {
        Self { id, closure }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn closure(&self) -> *mut Closure {
        self.closure
    }
}

/// A fully loaded module.
#[derive(Debug)]
pub struct Library {
    structs: Vec<StructLayout>,
    datas: Vec<*mut u8>,
    procs: Vec<Proc>,
    closures: Vec<*mut Closure>,
    symbols: HashMap<String, Export>,
    entry: Option<(EntrySignature, *mut Closure)>,
}

impl Library {
    /// An empty library, used for the builtin pseudo-module.
    pub fn new() -> Self {
        Self {
            structs: Vec::new(),
            datas: Vec::new(),
            procs: Vec::new(),
            closures: Vec::new(),
            symbols: HashMap::new(),
            entry: None,
        }
    }

    pub fn add_proc(&mut self, proc: Proc) -> usize {
        self.procs.push(proc);
        self.procs.len() - 1
    }

    pub fn add_closure(&mut self, closure: *mut Closure) -> usize {
        self.closures.push(closure);
        self.closures.len() - 1
    }

    pub fn add_symbol(&mut self, name: String, export: Export) {
        self.symbols.insert(name, export);
    }

    pub fn lookup_symbol(&self, name: &str) -> Option<Export> {
        self.symbols.get(name).copied()
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&String, &Export)> {
        self.symbols.iter()
    }

    pub fn set_entry_closure(&mut self, signature: EntrySignature, closure: *mut Closure) {
        self.entry = Some((signature, closure));
    }

    pub fn entry_closure(&self) -> Option<(EntrySignature, *mut Closure)> {
        self.entry
    }

    pub fn proc(&self, id: usize) -> Option<&Proc> {
        self.procs.get(id)
    }

    pub fn closure(&self, id: usize) -> Option<*mut Closure> {
        self.closures.get(id).copied()
    }

    pub fn num_procs(&self) -> usize {
        self.procs.len()
    }

    /// Find the proc whose code buffer contains `addr`, along with the
    /// byte offset of `addr` within it.
    pub fn find_proc_by_addr(&self, addr: *const u8) -> Option<(&Proc, usize)> {
        let addr = addr as usize;
        self.procs.iter().find_map(|proc| {
            let start = proc.code() as usize;
            if addr >= start && addr < start + proc.size().max(1) {
                Some((proc, addr - start))
            } else {
                None
            }
        })
    }

    /// Mark every root this library owns.
    pub fn trace_roots(&self, state: &mut MarkState<'_>) {
        for &data in &self.datas {
            state.mark_root(data);
        }
        for &closure in &self.closures {
            state.mark_root(closure as *const u8);
        }
        for proc in &self.procs {
            state.mark_root(proc.code());
        }
    }
}

impl Default for Library {
    fn default() -> Self {
        Self::new()
    }
}

/// A module while the loader is filling it in.
///
/// The vectors are pre-sized from the file's counts; closures are
/// pre-allocated so that data slots and instructions can refer to them
/// before they are initialised. The loading library is a `CanGc`
/// capability: allocations made through it may collect, with the partial
/// module's own slots serving as roots.
pub struct LibraryLoading<'p> {
    parent: &'p dyn GcCapability,
    structs: RefCell<Vec<StructLayout>>,
    /// Pre-sized with nulls; slots fill in file order. A null slot is an
    /// entry that has not been loaded yet.
    datas: RefCell<Vec<*mut u8>>,
    datas_loaded: std::cell::Cell<usize>,
    procs: RefCell<Vec<Proc>>,
    closures: RefCell<Vec<*mut Closure>>,
    symbols: RefCell<HashMap<String, Export>>,
}

impl<'p> LibraryLoading<'p> {
    /// Pre-size the arenas and pre-allocate all closure cells inside the
    /// given no-GC scope.
    pub fn new(
        parent: &'p dyn GcCapability,
        alloc_cap: &NoGcScope<'_>,
        num_structs: usize,
        num_datas: usize,
        num_procs: usize,
        num_closures: usize,
    ) -> Self {
        let mut closures = Vec::with_capacity(num_closures);
        for _ in 0..num_closures {
            let cell =
                alloc_cap.alloc_bytes(std::mem::size_of::<Closure>()) as *mut Closure;
            closures.push(cell);
        }
        Self {
            parent,
            structs: RefCell::new(Vec::with_capacity(num_structs)),
            datas: RefCell::new(vec![std::ptr::null_mut(); num_datas]),
            datas_loaded: std::cell::Cell::new(0),
            procs: RefCell::new(Vec::with_capacity(num_procs)),
            closures: RefCell::new(closures),
            symbols: RefCell::new(HashMap::new()),
        }
    }

    pub fn add_struct(&self, layout: StructLayout) {
        self.structs.borrow_mut().push(layout);
    }

    pub fn struct_layout(&self, id: u32) -> Option<StructLayout> {
        self.structs.borrow().get(id as usize).cloned()
    }

    /// Fill in the next data slot, in file order.
    pub fn add_data(&self, data: *mut u8) {
        let index = self.datas_loaded.get();
        self.datas.borrow_mut()[index] = data;
        self.datas_loaded.set(index + 1);
    }

    /// Look up a data entry. The slot of an entry that has not been read
    /// yet is null, which is what rejects forward references.
    pub fn data(&self, id: u32) -> Option<*mut u8> {
        self.datas.borrow().get(id as usize).copied()
    }

    pub fn num_datas_loaded(&self) -> usize {
        self.datas_loaded.get()
    }

    pub fn add_proc(&self, proc: Proc) {
        self.procs.borrow_mut().push(proc);
    }

    pub fn proc_code(&self, id: u32) -> Option<(*mut u8, usize)> {
        self.procs
            .borrow()
            .get(id as usize)
            .map(|p| (p.code(), p.size()))
    }

    pub fn proc_add_context(&self, id: u32, offset: usize, context: ProcContext) {
        self.procs.borrow_mut()[id as usize].add_context(offset, context);
    }

    pub fn closure(&self, id: u32) -> Option<*mut Closure> {
        self.closures.borrow().get(id as usize).copied()
    }

    pub fn num_closures(&self) -> usize {
        self.closures.borrow().len()
    }

    pub fn add_symbol(&self, name: String, export: Export) {
        self.symbols.borrow_mut().insert(name, export);
    }

    /// Turn the loading state into a finished library.
    pub fn freeze(self) -> Library {
        Library {
            structs: self.structs.into_inner(),
            datas: self.datas.into_inner(),
            procs: self.procs.into_inner(),
            closures: self.closures.into_inner(),
            symbols: self.symbols.into_inner(),
            entry: None,
        }
    }
}

impl GcCapability for LibraryLoading<'_> {
    fn heap(&self) -> &Heap {
        self.parent.heap()
    }
    fn mode(&self) -> GcMode {
        GcMode::CanGc
    }
    fn parent(&self) -> Option<&dyn GcCapability> {
        Some(self.parent)
    }
    fn tracer(&self) -> Option<&dyn Tracer> {
        Some(self)
    }
}

impl Tracer for LibraryLoading<'_> {
    fn do_trace(&self, state: &mut MarkState<'_>) {
        for &data in self.datas.borrow().iter() {
            state.mark_root(data);
        }
        for &closure in self.closures.borrow().iter() {
            state.mark_root(closure as *const u8);
        }
        for proc in self.procs.borrow().iter() {
            state.mark_root(proc.code());
        }
        trace_parent(self, state);
    }
}
