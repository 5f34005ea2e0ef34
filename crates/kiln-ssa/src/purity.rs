//! Purity analysis.
//!
//! Every function gets an application mask in its `meta`: bit k set means
//! applying the function k+1 times is observably pure. The mask starts
//! optimistically all-ones for every function and is revised downward
//! until stable, which is what lets recursive functions come out pure.
//!
//! Evaluation classes derived per term:
//! - `flag::PURE`: may be dropped, duplicated, or merged (CSE).
//! - `flag::DROPPABLE`: may be dropped if dead, but never merged or
//!   lifted across other ordered operations (`ORDERED` primitives).
//! - neither: `EFFECT` primitives; they run exactly as written.

use crate::term::{flag, ref_depth, ref_offset, FunTerm, TermKind, TermRef};
use kiln_lang::prim::flags as pflag;

pub fn pass_purity(root: &mut FunTerm) {
    init(root);
    let mut stack: Vec<Vec<u64>> = Vec::new();
    loop {
        let mut changed = false;
        analyze(root, &mut stack, &mut changed);
        debug_assert!(stack.is_empty());
        if !changed {
            break;
        }
    }
}

fn init(fun: &mut FunTerm) {
    for t in &mut fun.terms {
        if let TermKind::Fun(inner) = &mut t.kind {
            t.meta = u64::MAX;
            init(inner);
        }
    }
}

fn mask_at(stack: &[Vec<u64>], r: TermRef) -> u64 {
    let idx = stack.len() - 1 - ref_depth(r);
    stack[idx][ref_offset(r)]
}

/// Returns the mask of the function's output (used by the caller to
/// shift into the enclosing `Fun` term's mask).
fn analyze(fun: &mut FunTerm, stack: &mut Vec<Vec<u64>>, changed: &mut bool) -> u64 {
    // Seed this frame with masks from the previous iteration; forward
    // references into recursive groups read these until they settle.
    stack.push(
        fun.terms
            .iter()
            .map(|t| match t.kind {
                TermKind::Fun(_) | TermKind::App { .. } => t.meta,
                _ => 0,
            })
            .collect(),
    );
    let top = stack.len() - 1;

    for i in 0..fun.terms.len() {
        let (mask, pure, droppable) = match &mut fun.terms[i].kind {
            TermKind::Arg | TermKind::Lit { .. } => (0, true, true),
            TermKind::Con { .. } | TermKind::Get { .. } => (0, true, true),
            TermKind::Fun(inner) => {
                let out_mask = analyze(inner, stack, changed);
                let inner_pure = inner
                    .terms
                    .iter()
                    .all(|t| t.is(flag::PURE));
                let mask = if inner_pure {
                    1 | (out_mask << 1)
                } else {
                    0
                };
                (mask, true, true)
            }
            TermKind::App { f, .. } => {
                let m = mask_at(stack, *f) >> 1;
                let pure = mask_at(stack, *f) & 1 != 0;
                (m, pure, pure)
            }
            TermKind::Des { args, .. } => {
                // Evaluation applies exactly one handler; require them all
                // pure on first application.
                let handlers = &args[..args.len() - 1];
                let pure = handlers.iter().all(|&h| mask_at(stack, h) & 1 != 0);
                (0, pure, pure)
            }
            TermKind::Prim { pflags, .. } => {
                let effect = *pflags & pflag::EFFECT != 0;
                let ordered = *pflags & pflag::ORDERED != 0;
                (0, !effect && !ordered, !effect)
            }
        };

        let term = &mut fun.terms[i];
        if stack[top][i] != mask {
            stack[top][i] = mask;
            *changed = true;
        }
        let had = (term.is(flag::PURE), term.is(flag::DROPPABLE));
        term.clear(flag::PURE | flag::DROPPABLE);
        if pure {
            term.set(flag::PURE);
        }
        if droppable {
            term.set(flag::DROPPABLE);
        }
        if had != (pure, droppable) {
            *changed = true;
        }
    }

    let out_mask = mask_at(stack, fun.output);
    let frame = stack.pop().expect("frame pushed above");
    for (t, m) in fun.terms.iter_mut().zip(frame) {
        if matches!(t.kind, TermKind::Fun(_) | TermKind::App { .. }) {
            t.meta = m;
        }
    }
    out_mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::{make_ref, Term};
    use kiln_lang::ast::Literal;

    fn lit(i: i64) -> Term {
        Term::new(TermKind::Lit {
            value: Literal::Integer(i),
        })
    }

    fn prim(pflags: u8) -> Term {
        Term::new(TermKind::Prim {
            name: "p".into(),
            pflags,
            args: vec![],
        })
    }

    #[test]
    fn effect_classes() {
        let mut fun = FunTerm {
            id: 0,
            label: "top".into(),
            nargs: 0,
            terms: vec![prim(pflag::PURE), prim(pflag::ORDERED), prim(pflag::EFFECT)],
            output: make_ref(0, 0),
        };
        pass_purity(&mut fun);
        assert!(fun.terms[0].is(flag::PURE) && fun.terms[0].is(flag::DROPPABLE));
        assert!(!fun.terms[1].is(flag::PURE) && fun.terms[1].is(flag::DROPPABLE));
        assert!(!fun.terms[2].is(flag::PURE) && !fun.terms[2].is(flag::DROPPABLE));
    }

    #[test]
    fn pure_function_application_is_pure() {
        let inner = FunTerm {
            id: 1,
            label: "f".into(),
            nargs: 1,
            terms: vec![Term::new(TermKind::Arg)],
            output: make_ref(0, 0),
        };
        let mut fun = FunTerm {
            id: 0,
            label: "top".into(),
            nargs: 0,
            terms: vec![
                Term::new(TermKind::Fun(Box::new(inner))),
                lit(1),
                Term::new(TermKind::App {
                    f: make_ref(0, 0),
                    v: make_ref(0, 1),
                }),
            ],
            output: make_ref(0, 2),
        };
        pass_purity(&mut fun);
        assert!(fun.terms[2].is(flag::PURE), "applying identity is pure");
    }

    #[test]
    fn effectful_body_poisons_application() {
        let inner = FunTerm {
            id: 1,
            label: "f".into(),
            nargs: 1,
            terms: vec![Term::new(TermKind::Arg), prim(pflag::EFFECT)],
            output: make_ref(0, 1),
        };
        let mut fun = FunTerm {
            id: 0,
            label: "top".into(),
            nargs: 0,
            terms: vec![
                Term::new(TermKind::Fun(Box::new(inner))),
                lit(1),
                Term::new(TermKind::App {
                    f: make_ref(0, 0),
                    v: make_ref(0, 1),
                }),
            ],
            output: make_ref(0, 2),
        };
        pass_purity(&mut fun);
        assert!(!fun.terms[2].is(flag::PURE));
        assert!(!fun.terms[2].is(flag::DROPPABLE));
    }

    #[test]
    fn recursive_pure_function_settles_pure() {
        // f = \x f x  (self application through the enclosing slot)
        let inner = FunTerm {
            id: 1,
            label: "f".into(),
            nargs: 1,
            terms: vec![
                Term::new(TermKind::Arg),
                Term::new(TermKind::App {
                    f: make_ref(1, 0),
                    v: make_ref(0, 0),
                }),
            ],
            output: make_ref(0, 1),
        };
        let mut fun = FunTerm {
            id: 0,
            label: "top".into(),
            nargs: 0,
            terms: vec![Term::new(TermKind::Fun(Box::new(inner)))],
            output: make_ref(0, 0),
        };
        pass_purity(&mut fun);
        // The closure value itself is pure to create.
        assert!(fun.terms[0].is(flag::PURE));
    }
}
