//! Case tagging.
//!
//! A destruct's handler receives only records of one known constructor.
//! When a handler is a function defined in the same frame, its argument
//! term is tagged with that constructor (stored as `member + 1` in the
//! argument's `meta`), which later lets deconstruction collapse an
//! identity re-construction of the scrutinee.

use crate::term::{ref_depth, ref_offset, FunTerm, TermKind};

pub fn pass_cases(root: &mut FunTerm) {
    cases_fun(root);
}

fn cases_fun(fun: &mut FunTerm) {
    for i in 0..fun.terms.len() {
        if let TermKind::Des { args, .. } = &fun.terms[i].kind {
            let handlers: Vec<_> = args[..args.len() - 1].to_vec();
            for (member, h) in handlers.into_iter().enumerate() {
                if ref_depth(h) != 0 {
                    continue;
                }
                let o = ref_offset(h);
                if o == i {
                    continue;
                }
                if let TermKind::Fun(inner) = &mut fun.terms[o].kind {
                    if inner.nargs == 1 {
                        inner.terms[0].meta = (member + 1) as u64;
                    }
                }
            }
        }
    }
    for t in &mut fun.terms {
        if let TermKind::Fun(inner) = &mut t.kind {
            cases_fun(inner);
        }
    }
}
