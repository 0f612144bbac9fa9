//! Garbage collection.
//!
//! The heap is a conservative, non-moving mark/sweep collector over
//! fixed-cell blocks ([`heap`]). All allocation goes through a capability
//! chain that decides when collection may run and how roots are found
//! ([`capability`]).

pub mod capability;
pub mod heap;

pub use capability::{GcCapability, GcMode, NoGcScope, RootTracer, Tracer};
pub use heap::{Heap, HeapOptions, MarkState};
