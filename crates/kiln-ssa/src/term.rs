//! SSA term graph.
//!
//! A function is a flat vector of terms; every reference is a packed
//! `(depth, offset)` pair, where depth counts enclosing functions upward
//! from the referencing term's own function and offset indexes that
//! function's term vector. Arguments occupy the leading slots. Within a
//! function, a term's non-recursive references always point at smaller
//! offsets, except references to sibling functions of a recursive group.

use kiln_lang::ast::Literal;
use kiln_lang::datatype::Sum;
use std::fmt;
use std::rc::Rc;

/// Packed `(depth, offset)` reference.
pub type TermRef = usize;

const DEPTH_SHIFT: u32 = 44;
const OFFSET_MASK: usize = (1 << DEPTH_SHIFT) - 1;

pub fn make_ref(depth: usize, offset: usize) -> TermRef {
    debug_assert!(offset <= OFFSET_MASK);
    (depth << DEPTH_SHIFT) | offset
}

pub fn ref_depth(r: TermRef) -> usize {
    r >> DEPTH_SHIFT
}

pub fn ref_offset(r: TermRef) -> usize {
    r & OFFSET_MASK
}

/// Pass scratch flags.
pub mod flag {
    /// Referenced by the output or by a kept term.
    pub const USED: u32 = 1 << 0;
    /// Function whose body references itself (never inlined).
    pub const RECURSIVE: u32 = 1 << 1;
    /// Evaluating this term has no observable effect (may be dropped,
    /// duplicated, merged).
    pub const PURE: u32 = 1 << 2;
    /// May be dropped if dead, but not merged or reordered.
    pub const DROPPABLE: u32 = 1 << 3;
}

#[derive(Debug, Clone)]
pub enum TermKind {
    /// Function argument; filled at apply time.
    Arg,
    Lit {
        value: Literal,
    },
    App {
        f: TermRef,
        v: TermRef,
    },
    Prim {
        name: String,
        pflags: u8,
        args: Vec<TermRef>,
    },
    /// Indexed field read of a constructed record.
    Get {
        sum: Rc<Sum>,
        cons: usize,
        field: usize,
        tuple: TermRef,
    },
    /// Case dispatch: `args` are the handlers (one per member, in member
    /// order) followed by the scrutinee.
    Des {
        sum: Rc<Sum>,
        args: Vec<TermRef>,
    },
    Con {
        sum: Rc<Sum>,
        cons: usize,
        args: Vec<TermRef>,
    },
    Fun(Box<FunTerm>),
}

#[derive(Debug, Clone)]
pub struct Term {
    pub kind: TermKind,
    /// Pass scratch word (sizes, purity masks).
    pub meta: u64,
    pub flags: u32,
    /// Definition name when one exists; not unique.
    pub label: String,
}

impl Term {
    pub fn new(kind: TermKind) -> Self {
        Self {
            kind,
            meta: 0,
            flags: 0,
            label: String::new(),
        }
    }

    pub fn is(&self, f: u32) -> bool {
        self.flags & f != 0
    }

    pub fn set(&mut self, f: u32) {
        self.flags |= f;
    }

    pub fn clear(&mut self, f: u32) {
        self.flags &= !f;
    }

    /// Visit every outgoing reference.
    pub fn for_each_ref(&self, mut f: impl FnMut(TermRef)) {
        match &self.kind {
            TermKind::Arg | TermKind::Lit { .. } => {}
            TermKind::App { f: a, v } => {
                f(*a);
                f(*v);
            }
            TermKind::Prim { args, .. } => args.iter().copied().for_each(&mut f),
            TermKind::Get { tuple, .. } => f(*tuple),
            TermKind::Des { args, .. } => args.iter().copied().for_each(&mut f),
            TermKind::Con { args, .. } => args.iter().copied().for_each(&mut f),
            TermKind::Fun(_) => {}
        }
    }

    /// Rewrite every outgoing reference in place.
    pub fn map_refs(&mut self, mut f: impl FnMut(TermRef) -> TermRef) {
        match &mut self.kind {
            TermKind::Arg | TermKind::Lit { .. } => {}
            TermKind::App { f: a, v } => {
                *a = f(*a);
                *v = f(*v);
            }
            TermKind::Prim { args, .. } => {
                for a in args {
                    *a = f(*a);
                }
            }
            TermKind::Get { tuple, .. } => *tuple = f(*tuple),
            TermKind::Des { args, .. } => {
                for a in args {
                    *a = f(*a);
                }
            }
            TermKind::Con { args, .. } => {
                for a in args {
                    *a = f(*a);
                }
            }
            TermKind::Fun(_) => {}
        }
    }
}

/// One function of the term graph.
#[derive(Debug, Clone)]
pub struct FunTerm {
    /// Stable identity assigned at lowering, for recursion detection.
    pub id: u64,
    pub label: String,
    pub nargs: usize,
    pub terms: Vec<Term>,
    pub output: TermRef,
}

impl FunTerm {
    /// Total term count including nested functions (the inline budget).
    pub fn size(&self) -> usize {
        let mut n = self.terms.len();
        for t in &self.terms {
            if let TermKind::Fun(inner) = &t.kind {
                n += inner.size();
            }
        }
        n
    }
}

/// Reference remapper used by the structural passes.
///
/// Every open function depth holds a map from old offsets to their
/// replacement: either a new offset in the rebuilt function, or an alias
/// to another term expressed as a packed ref relative to that depth
/// (which is how deconstruction and CSE forward references).
#[derive(Debug, Default)]
pub struct TermStream {
    depths: Vec<Vec<Option<TermRef>>>,
}

impl TermStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, size: usize) {
        self.depths.push(vec![None; size]);
    }

    pub fn pop(&mut self) {
        self.depths.pop();
    }

    /// Old offset at the current depth now lives at `new_offset`.
    pub fn keep(&mut self, old_offset: usize, new_offset: usize) {
        let top = self.depths.last_mut().expect("stream frame open");
        top[old_offset] = Some(make_ref(0, new_offset));
    }

    /// Old offset at the current depth is replaced by `alias` (a packed
    /// ref relative to the current depth).
    pub fn alias(&mut self, old_offset: usize, alias: TermRef) {
        let top = self.depths.last_mut().expect("stream frame open");
        top[old_offset] = Some(alias);
    }

    /// Map a reference as seen from the current (innermost) depth.
    ///
    /// Single-step: alias targets are installed pre-canonicalized (the
    /// aliasing passes rewrite a term's references before any alias to it
    /// can exist), so no chain chasing is needed.
    pub fn resolve(&self, r: TermRef) -> TermRef {
        let d = ref_depth(r);
        let o = ref_offset(r);
        let frame = &self.depths[self.depths.len() - 1 - d];
        match frame[o] {
            Some(mapped) => make_ref(ref_depth(mapped) + d, ref_offset(mapped)),
            // Unmapped: the frame was pushed read-only (identity).
            None => r,
        }
    }

    /// Push an identity frame: every slot maps to itself. Used by the
    /// aliasing passes, which never move terms.
    pub fn push_identity(&mut self, size: usize) {
        let mut frame = Vec::with_capacity(size);
        for i in 0..size {
            frame.push(Some(make_ref(0, i)));
        }
        self.depths.push(frame);
    }
}

impl fmt::Display for FunTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn go(fun: &FunTerm, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let pad = "  ".repeat(indent);
            writeln!(f, "{}fun {} (args {}):", pad, fun.label, fun.nargs)?;
            for (i, t) in fun.terms.iter().enumerate() {
                let r = |x: TermRef| format!("{}:{}", ref_depth(x), ref_offset(x));
                match &t.kind {
                    TermKind::Arg => writeln!(f, "{}  {} = arg", pad, i)?,
                    TermKind::Lit { value } => writeln!(f, "{}  {} = lit {}", pad, i, value)?,
                    TermKind::App { f: a, v } => {
                        writeln!(f, "{}  {} = app {} {}", pad, i, r(*a), r(*v))?
                    }
                    TermKind::Prim { name, args, .. } => writeln!(
                        f,
                        "{}  {} = prim {:?} {}",
                        pad,
                        i,
                        name,
                        args.iter().map(|&a| r(a)).collect::<Vec<_>>().join(" ")
                    )?,
                    TermKind::Get { field, tuple, .. } => {
                        writeln!(f, "{}  {} = get.{} {}", pad, i, field, r(*tuple))?
                    }
                    TermKind::Des { args, .. } => writeln!(
                        f,
                        "{}  {} = des {}",
                        pad,
                        i,
                        args.iter().map(|&a| r(a)).collect::<Vec<_>>().join(" ")
                    )?,
                    TermKind::Con { cons, args, sum } => writeln!(
                        f,
                        "{}  {} = con {}.{} {}",
                        pad,
                        i,
                        sum.name,
                        cons,
                        args.iter().map(|&a| r(a)).collect::<Vec<_>>().join(" ")
                    )?,
                    TermKind::Fun(inner) => {
                        writeln!(f, "{}  {} =", pad, i)?;
                        go(inner, indent + 2, f)?;
                    }
                }
            }
            writeln!(
                f,
                "{}  -> {}:{}",
                pad,
                ref_depth(fun.output),
                ref_offset(fun.output)
            )
        }
        go(self, 0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_roundtrip() {
        let r = make_ref(3, 17);
        assert_eq!(ref_depth(r), 3);
        assert_eq!(ref_offset(r), 17);
        let r0 = make_ref(0, 0);
        assert_eq!(ref_depth(r0), 0);
        assert_eq!(ref_offset(r0), 0);
    }

    #[test]
    fn stream_keep_and_alias() {
        let mut s = TermStream::new();
        s.push(4);
        s.keep(0, 0);
        s.keep(2, 1);
        // Old slot 3 aliases old->new slot 1.
        s.alias(3, make_ref(0, 1));
        assert_eq!(s.resolve(make_ref(0, 2)), make_ref(0, 1));
        assert_eq!(s.resolve(make_ref(0, 3)), make_ref(0, 1));
        s.pop();
    }

    #[test]
    fn stream_cross_depth_resolution() {
        let mut s = TermStream::new();
        s.push(2);
        s.keep(0, 0);
        s.keep(1, 1);
        s.push(3);
        s.keep(0, 0);
        // A depth-1 reference from the inner frame resolves via the outer map.
        assert_eq!(s.resolve(make_ref(1, 1)), make_ref(1, 1));
        s.pop();
        s.pop();
    }

    #[test]
    fn fun_size_counts_nested() {
        let inner = FunTerm {
            id: 2,
            label: "inner".into(),
            nargs: 1,
            terms: vec![Term::new(TermKind::Arg)],
            output: make_ref(0, 0),
        };
        let outer = FunTerm {
            id: 1,
            label: "outer".into(),
            nargs: 1,
            terms: vec![
                Term::new(TermKind::Arg),
                Term::new(TermKind::Fun(Box::new(inner))),
            ],
            output: make_ref(0, 1),
        };
        assert_eq!(outer.size(), 3);
    }
}
