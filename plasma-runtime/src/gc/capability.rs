//! GC capabilities, root tracers and no-GC scopes.
//!
//! Allocation is gated through a [`GcCapability`] handle. Handles form a
//! parent chain; a handle's mode decides whether an allocation through it
//! may trigger a collection:
//!
//! - `IsRoot` sits at the top of the chain and cannot itself be traced.
//! - `CanGc` handles may collect and must expose a [`Tracer`].
//! - `CannotGc` handles may allocate but never collect; an allocation
//!   failure is recorded in the handle and must be acknowledged before the
//!   handle is dropped.
//!
//! [`NoGcScope`] is the `CannotGc` discipline in scoped form: while one is
//! anywhere in the chain, no collection can run, so freshly allocated
//! object graphs that are not yet reachable from any root stay alive.

use std::cell::{Cell, RefCell};

use super::heap::{Heap, MarkState};

/// The collection mode of one capability in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    /// Top of the chain; cannot be traced.
    IsRoot,
    /// May trigger collection; must also be a tracer.
    CanGc,
    /// May allocate but never collect.
    CannotGc,
}

/// A tracer knows how to mark the roots it owns, and delegates to its
/// parent afterwards.
pub trait Tracer {
    fn do_trace(&self, state: &mut MarkState<'_>);
}

/// A handle through which heap allocation is performed.
pub trait GcCapability {
    /// The heap this capability allocates from.
    fn heap(&self) -> &Heap;

    /// This handle's collection mode.
    fn mode(&self) -> GcMode;

    /// The parent handle, if any.
    fn parent(&self) -> Option<&dyn GcCapability>;

    /// The tracer for this handle. Required for `CanGc` handles.
    fn tracer(&self) -> Option<&dyn Tracer> {
        None
    }

    /// The out-of-memory policy. The default policy aborts; `NoGcScope`
    /// overrides it to record the failure instead.
    fn oom(&self, size_bytes: usize) {
        eprintln!("Out of memory, tried to allocate {size_bytes} bytes.");
        std::process::abort();
    }

    /// Whether an allocation through this handle may trigger a collection.
    ///
    /// Walks the chain: any `CannotGc` handle forbids collection; reaching
    /// an `IsRoot` handle permits it only if that handle is an ancestor
    /// rather than `self` (the root has no tracer of its own).
    fn can_gc(&self) -> bool
    where
        Self: Sized,
    {
        can_gc_dyn(self)
    }

    /// Allocate `size_in_words` words through this handle.
    fn alloc(&self, size_in_words: usize) -> *mut u8
    where
        Self: Sized,
    {
        self.heap().alloc(size_in_words, self)
    }

    /// Allocate a byte count through this handle.
    fn alloc_bytes(&self, size_in_bytes: usize) -> *mut u8
    where
        Self: Sized,
    {
        self.heap().alloc_bytes(size_in_bytes, self)
    }
}

/// `can_gc` for dynamically-typed capabilities.
///
/// Object-safe twin of [`GcCapability::can_gc`]; the heap calls this on the
/// `&dyn` handle it is given.
pub fn can_gc_dyn(cap: &dyn GcCapability) -> bool {
    let mut cur: &dyn GcCapability = cap;
    loop {
        match cur.mode() {
            GcMode::IsRoot => {
                return !std::ptr::eq(
                    cur as *const dyn GcCapability as *const (),
                    cap as *const dyn GcCapability as *const (),
                );
            }
            GcMode::CannotGc => return false,
            GcMode::CanGc => {}
        }
        match cur.parent() {
            Some(p) => cur = p,
            None => return true,
        }
    }
}

/// Mark the parent chain's roots after a tracer's own.
pub fn trace_parent(cap: &dyn GcCapability, state: &mut MarkState<'_>) {
    if let Some(parent) = cap.parent() {
        if can_gc_dyn(parent) {
            if let Some(tracer) = parent.tracer() {
                tracer.do_trace(state);
            }
        }
    }
}

/// A capability that owns an explicit list of root slots.
///
/// Roots are *addresses of* pointer variables: tracing dereferences each
/// slot and marks the pointed-to object. `add_root`/`remove_root` are
/// stack-disciplined; the most recent addition must be removed first.
pub struct RootTracer<'p> {
    parent: &'p dyn GcCapability,
    roots: RefCell<Vec<*const *mut u8>>,
}

impl<'p> RootTracer<'p> {
    pub fn new(parent: &'p dyn GcCapability) -> Self {
        Self {
            parent,
            roots: RefCell::new(Vec::new()),
        }
    }

    /// Register the address of a pointer variable as a root slot.
    pub fn add_root(&self, root: *const *mut u8) {
        self.roots.borrow_mut().push(root);
    }

    /// Unregister a root slot. Must be the most recently added one.
    pub fn remove_root(&self, root: *const *mut u8) {
        let mut roots = self.roots.borrow_mut();
        let last = roots.pop().expect("remove_root on an empty root list");
        assert!(
            std::ptr::eq(last, root),
            "remove_root out of stack order"
        );
    }
}

impl GcCapability for RootTracer<'_> {
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

impl Tracer for RootTracer<'_> {
    fn do_trace(&self, state: &mut MarkState<'_>) {
        for &slot in self.roots.borrow().iter() {
            // SAFETY: callers guarantee registered slots outlive their
            // registration; remove_root enforces the stack discipline.
            state.mark_root(unsafe { *slot });
        }
        trace_parent(self, state);
    }
}

/// A scoped capability under which no collection can happen.
///
/// Allocation failures inside the scope are recorded rather than aborting
/// immediately. The scope's user must acknowledge a recorded failure
/// through [`NoGcScope::is_oom`] or [`NoGcScope::abort_if_oom`]; dropping
/// the scope with an unacknowledged failure aborts the process.
pub struct NoGcScope<'p> {
    parent: &'p dyn GcCapability,
    did_oom: Cell<bool>,
    oom_size: Cell<usize>,
    needs_check: Cell<bool>,
}

impl<'p> NoGcScope<'p> {
    pub fn new(parent: &'p dyn GcCapability) -> Self {
        Self {
            parent,
            did_oom: Cell::new(false),
            oom_size: Cell::new(0),
            needs_check: Cell::new(true),
        }
    }

    /// Whether an allocation inside the scope failed.
    pub fn is_oom(&self) -> bool {
        self.needs_check.set(false);
        self.did_oom.get()
    }

    /// Abort with a diagnostic naming the interrupted phase if an
    /// allocation inside the scope failed.
    pub fn abort_if_oom(&self, label: &str) {
        self.needs_check.set(false);
        if self.did_oom.get() {
            eprintln!(
                "Out of memory while {label}, tried to allocate {} bytes.",
                self.oom_size.get()
            );
            std::process::abort();
        }
    }
}

impl GcCapability for NoGcScope<'_> {
    fn heap(&self) -> &Heap {
        self.parent.heap()
    }
    fn mode(&self) -> GcMode {
        GcMode::CannotGc
    }
    fn parent(&self) -> Option<&dyn GcCapability> {
        Some(self.parent)
    }
    fn oom(&self, size_bytes: usize) {
        if !self.did_oom.get() {
            self.did_oom.set(true);
            self.oom_size.set(size_bytes);
        }
    }
}

impl Drop for NoGcScope<'_> {
    fn drop(&mut self) {
        if self.did_oom.get() && self.needs_check.get() {
            eprintln!(
                "Out of memory ({} bytes) was not checked before the scope ended.",
                self.oom_size.get()
            );
            std::process::abort();
        }
    }
}
