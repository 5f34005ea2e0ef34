//! kiln-ssa: term graph, lowering, and the optimizer.
//!
//! The resolved expression tree flattens into functions of SSA-style
//! terms addressed by `(depth, offset)` (see [`term`]). The optimizer
//! passes run in a fixed order (see [`opt::optimize`]); the result
//! flattens into a [`program::Program`] for the interpreter.

pub mod cases;
pub mod cse;
pub mod decon;
pub mod inline;
pub mod lower;
pub mod opt;
pub mod program;
pub mod purity;
pub mod scope;
pub mod sweep;
pub mod term;
pub mod usage;

pub use lower::lower;
pub use opt::optimize;
pub use program::{flatten, CodeFun, CodeTerm, Program};
pub use term::{make_ref, ref_depth, ref_offset, FunTerm, Term, TermKind, TermRef, TermStream};
