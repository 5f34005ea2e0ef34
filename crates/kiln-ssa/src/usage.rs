//! Usage analysis: which terms are live.
//!
//! A term is live when the output chain or a live term references it, or
//! when it carries a mandatory effect. Marking iterates to a fixed point
//! because sibling functions of a recursive group reference forward.

use crate::term::{flag, ref_depth, ref_offset, FunTerm, TermKind, TermRef};
use kiln_lang::prim::flags as pflag;

/// Recompute `flag::USED` across the whole graph.
pub fn pass_usage(root: &mut FunTerm) {
    clear(root);
    let mut stack: Vec<Vec<bool>> = Vec::new();
    loop {
        let mut changed = false;
        mark(root, &mut stack, &mut changed);
        debug_assert!(stack.is_empty());
        if !changed {
            break;
        }
    }
}

/// True when the term must execute regardless of liveness.
pub fn is_effect(kind: &TermKind) -> bool {
    matches!(kind, TermKind::Prim { pflags, .. } if pflags & pflag::EFFECT != 0)
}

/// A term survives even when dead unless purity proved it droppable;
/// before purity runs nothing is droppable, which errs safe. Effect
/// primitives survive regardless.
pub fn must_keep(t: &crate::term::Term) -> bool {
    is_effect(&t.kind) || !t.is(flag::DROPPABLE)
}

fn clear(fun: &mut FunTerm) {
    for t in &mut fun.terms {
        t.clear(flag::USED);
        if let TermKind::Fun(inner) = &mut t.kind {
            clear(inner);
        }
    }
}

fn mark_ref(stack: &mut [Vec<bool>], r: TermRef, changed: &mut bool) {
    let idx = stack.len() - 1 - ref_depth(r);
    let o = ref_offset(r);
    if !stack[idx][o] {
        stack[idx][o] = true;
        *changed = true;
    }
}

fn mark(fun: &mut FunTerm, stack: &mut Vec<Vec<bool>>, changed: &mut bool) {
    stack.push(fun.terms.iter().map(|t| t.is(flag::USED)).collect());
    let top = stack.len() - 1;

    // Arguments hold the applied values; their slots are part of the
    // calling convention and always survive.
    for i in 0..fun.nargs {
        stack[top][i] = true;
    }
    mark_ref(stack, fun.output, changed);

    for i in (0..fun.terms.len()).rev() {
        let keep = stack[top][i] || must_keep(&fun.terms[i]);
        if keep {
            if !stack[top][i] {
                stack[top][i] = true;
                *changed = true;
            }
            fun.terms[i].for_each_ref(|r| mark_ref(stack, r, changed));
        }
        if stack[top][i] {
            if let TermKind::Fun(inner) = &mut fun.terms[i].kind {
                mark(inner, stack, changed);
            }
        }
    }

    let flags = stack.pop().expect("frame pushed above");
    for (t, u) in fun.terms.iter_mut().zip(flags) {
        if u {
            t.set(flag::USED);
        }
    }
}
