//! Primitive interface as seen by the frontend.
//!
//! The runtime owns the actual primitive implementations; the resolver
//! only needs each primitive's arity and effect class, and the
//! typechecker needs a hook that unifies its signature at each use site.
//! Keeping this split lets the language crate stay independent of the
//! runtime and job crates.

use crate::types::{TypeContext, TypeId};
use std::collections::HashMap;

/// Flat effect-class flags, combined bitwise.
pub mod flags {
    /// Freely duplicated, reordered, or dropped.
    pub const PURE: u8 = 0;
    /// May be dropped if dead, but never lifted across other ordered or
    /// effectful operations, and never merged by CSE.
    pub const ORDERED: u8 = 1;
    /// Must run exactly as often as the program says, in data order.
    pub const EFFECT: u8 = 2;
    /// Invokes one of its arguments as a function.
    pub const FNARG: u8 = 4;
}

/// What the resolver needs to know about a primitive.
#[derive(Debug, Clone, Copy)]
pub struct PrimDesc {
    pub nargs: usize,
    pub pflags: u8,
}

impl PrimDesc {
    pub fn pure(nargs: usize) -> Self {
        Self {
            nargs,
            pflags: flags::PURE,
        }
    }

    pub fn ordered(nargs: usize) -> Self {
        Self {
            nargs,
            pflags: flags::ORDERED,
        }
    }

    pub fn effect(nargs: usize) -> Self {
        Self {
            nargs,
            pflags: flags::EFFECT,
        }
    }

    pub fn with_fnarg(mut self) -> Self {
        self.pflags |= flags::FNARG;
        self
    }
}

/// Typechecker hook: unify the primitive's argument and result types.
/// Returns false when the primitive cannot produce a signature (the
/// caller reports the diagnostic).
pub type PrimTyper = fn(&mut TypeContext, args: &[TypeId], out: TypeId) -> bool;

/// Frontend view of the primitive registry.
#[derive(Default)]
pub struct PrimInterface {
    descs: HashMap<String, PrimDesc>,
    typers: HashMap<String, PrimTyper>,
}

impl PrimInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: &str, desc: PrimDesc, typer: PrimTyper) {
        self.descs.insert(name.to_string(), desc);
        self.typers.insert(name.to_string(), typer);
    }

    pub fn desc(&self, name: &str) -> Option<PrimDesc> {
        self.descs.get(name).copied()
    }

    pub fn typer(&self, name: &str) -> Option<PrimTyper> {
        self.typers.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_and_query() {
        let mut iface = PrimInterface::new();
        iface.declare("icmp", PrimDesc::pure(2), |cx, args, out| {
            for a in args {
                let int = cx.integer();
                if cx.unify(*a, int).is_err() {
                    return false;
                }
            }
            let order = cx.ctor("Order", vec![]);
            cx.unify(out, order).is_ok()
        });
        let d = iface.desc("icmp").unwrap();
        assert_eq!(d.nargs, 2);
        assert_eq!(d.pflags, flags::PURE);
        assert!(iface.desc("missing").is_none());
    }

    #[test]
    fn flag_composition() {
        let d = PrimDesc::effect(1).with_fnarg();
        assert_eq!(d.pflags, flags::EFFECT | flags::FNARG);
    }
}
