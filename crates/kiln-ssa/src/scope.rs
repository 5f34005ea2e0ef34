//! Scope numbering check.
//!
//! Verifies that every reference resolves inside its enclosing function
//! stack and that in-frame references respect SSA dominance: a term only
//! references earlier slots, except references to function slots (which
//! recursive groups may reach forward). Runs between optimizer passes in
//! debug builds and after the final sweep unconditionally.

use crate::term::{ref_depth, ref_offset, FunTerm, TermKind};

/// Returns the number of violations found (0 = well-formed).
pub fn pass_scope(root: &FunTerm) -> usize {
    let mut sizes: Vec<usize> = Vec::new();
    let mut fun_slots: Vec<Vec<bool>> = Vec::new();
    check(root, &mut sizes, &mut fun_slots)
}

fn check(fun: &FunTerm, sizes: &mut Vec<usize>, fun_slots: &mut Vec<Vec<bool>>) -> usize {
    let mut bad = 0usize;
    sizes.push(fun.terms.len());
    fun_slots.push(
        fun.terms
            .iter()
            .map(|t| matches!(t.kind, TermKind::Fun(_)))
            .collect(),
    );

    let verify = |r: usize, at: usize, sizes: &[usize], fun_slots: &[Vec<bool>]| -> usize {
        let d = ref_depth(r);
        let o = ref_offset(r);
        if d >= sizes.len() {
            return 1;
        }
        let idx = sizes.len() - 1 - d;
        if o >= sizes[idx] {
            return 1;
        }
        if d == 0 && o >= at && !fun_slots[idx][o] {
            return 1;
        }
        0
    };

    for (i, t) in fun.terms.iter().enumerate() {
        t.for_each_ref(|r| {
            bad += verify(r, i, sizes, fun_slots);
        });
        if let TermKind::Fun(inner) = &t.kind {
            bad += check(inner, sizes, fun_slots);
        }
    }
    bad += verify(fun.output, fun.terms.len(), sizes, fun_slots);

    sizes.pop();
    fun_slots.pop();
    bad
}
