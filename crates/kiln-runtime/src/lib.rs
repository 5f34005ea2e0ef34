//! kiln-runtime: heap, promises, and the cooperative evaluator.
//!
//! The heap ([`heap`]) is a semispace copying collector over an object
//! arena; long-lived holders pin values with roots. The evaluator
//! ([`runtime`]) is a single-threaded trampoline over a work stack;
//! suspensions are first-class continuation objects on promises, which
//! is what lets a collection interrupt and replay any step. The
//! primitive registry ([`prims`]) carries the core families; the job
//! primitives are registered by the jobs crate.

pub mod heap;
pub mod prims;
pub mod runtime;

pub use heap::{Cont, GcNeeded, Heap, HeapRef, Obj, PromiseState, RootId};
pub use prims::{
    make_enum, make_record, register_basics, want_int, want_str, PrimEntry, PrimError,
    PrimRegistry, PrimRun,
};
pub use runtime::{exit_now, Runtime, Work, EXIT_ASAP};
