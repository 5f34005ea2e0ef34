//! Inlining and literal pooling.
//!
//! An application of a same-frame, non-recursive, single-argument
//! function whose body is pure and under the size budget is replaced by
//! a copy of that body; the argument reference substitutes for the
//! callee's parameter and the callee frame disappears, so references out
//! of the copied body drop one depth. Copies land exactly where the
//! application stood, preserving evaluation order.
//!
//! Identical literals within one function are pooled onto the first
//! occurrence with the same aliasing machinery; orphans die in the next
//! sweep.

use crate::term::{flag, make_ref, ref_depth, ref_offset, FunTerm, Term, TermKind, TermStream};
use kiln_lang::ast::Literal;
use std::collections::HashMap;
use tracing::trace;

/// Callee body budget, in total terms.
const INLINE_BUDGET: usize = 100;

pub fn pass_inline(root: FunTerm) -> FunTerm {
    let mut stream = TermStream::new();
    inline_fun(root, &mut stream)
}

enum Plan {
    Keep,
    /// Replace the application at this slot with a copy of the callee.
    Expand { body: FunTerm },
}

fn inline_fun(fun: FunTerm, stream: &mut TermStream) -> FunTerm {
    let FunTerm {
        id,
        label,
        nargs,
        terms,
        output,
    } = fun;
    let n = terms.len();

    // ---- Plan ---------------------------------------------------------
    let mut plans: Vec<Plan> = Vec::with_capacity(n);
    for (i, t) in terms.iter().enumerate() {
        let mut plan = Plan::Keep;
        if let TermKind::App { f, .. } = &t.kind {
            if ref_depth(*f) == 0 && ref_offset(*f) < i {
                let o = ref_offset(*f);
                if !terms[o].is(flag::RECURSIVE) {
                    if let TermKind::Fun(callee) = &terms[o].kind {
                        let body_pure = callee.terms.iter().all(|t| t.is(flag::PURE));
                        if callee.nargs == 1 && body_pure && callee.size() < INLINE_BUDGET {
                            trace!(callee = %callee.label, "inlining application");
                            plan = Plan::Expand {
                                body: (**callee).clone(),
                            };
                        }
                    }
                }
            }
        }
        plans.push(plan);
    }

    // ---- New offsets (complete before any reference rewrites, so that
    // forward references into recursive groups stay correct) ------------
    stream.push(n);
    let mut pos = 0usize;
    let mut copy_base = vec![0usize; n];
    for (i, plan) in plans.iter().enumerate() {
        match plan {
            Plan::Keep => {
                stream.keep(i, pos);
                pos += 1;
            }
            Plan::Expand { body } => {
                copy_base[i] = pos;
                pos += body.terms.len() - body.nargs;
                // The application slot itself aliases into the copy; the
                // exact target is installed during emission.
            }
        }
    }

    // ---- Emit ---------------------------------------------------------
    let mut out: Vec<Term> = Vec::with_capacity(pos);
    let mut pool: HashMap<Literal, usize> = HashMap::new();
    for (i, t) in terms.into_iter().enumerate() {
        let expand = matches!(plans[i], Plan::Expand { .. });
        if !expand {
            let mut t = t;
            t.map_refs(|r| stream.resolve(r));
            if let TermKind::Fun(inner) = t.kind {
                t.kind = TermKind::Fun(Box::new(inline_fun(*inner, stream)));
            }
            // Pool duplicate literals onto their first occurrence.
            if let TermKind::Lit { value } = &t.kind {
                match pool.get(value) {
                    Some(&first) => stream.alias(i, make_ref(0, first)),
                    None => {
                        pool.insert(value.clone(), out.len());
                    }
                }
            }
            out.push(t);
            continue;
        }

        let Plan::Expand { body } = std::mem::replace(&mut plans[i], Plan::Keep) else {
            unreachable!("checked above")
        };
        let TermKind::App { v, .. } = t.kind else {
            unreachable!("only applications are expanded")
        };
        let v_new = stream.resolve(v);
        let base = copy_base[i];
        let out_ref = body.output;

        // Local map for callee-frame slots, in new space relative to this
        // (merge) frame.
        let local = move |o: usize| -> usize {
            if o == 0 {
                v_new
            } else {
                make_ref(0, base + o - 1)
            }
        };

        for mut bt in body.terms.into_iter().skip(1) {
            retarget(&mut bt, 0, &local, stream);
            out.push(bt);
        }

        // The application aliases the copied output.
        let target = match ref_depth(out_ref) {
            0 => local(ref_offset(out_ref)),
            d => stream.resolve(make_ref(d - 1, ref_offset(out_ref))),
        };
        stream.alias(i, target);
    }

    let output = stream.resolve(output);
    stream.pop();
    FunTerm {
        id,
        label,
        nargs,
        terms: out,
        output,
    }
}

/// Rewrite one copied term (and its nested functions) for life in the
/// merge frame. `k` is the copy-nesting level: 0 for direct body terms.
/// - depth < k: internal to the copy, unchanged;
/// - depth == k: the vanished callee frame, mapped through `local`;
/// - depth > k: frames outside the callee; one frame closer now, and
///   renumbered through the surrounding stream.
fn retarget(
    t: &mut Term,
    k: usize,
    local: &dyn Fn(usize) -> usize,
    stream: &TermStream,
) {
    t.map_refs(|r| {
        let d = ref_depth(r);
        let o = ref_offset(r);
        if d < k {
            r
        } else if d == k {
            let m = local(o);
            make_ref(k + ref_depth(m), ref_offset(m))
        } else {
            let resolved = stream.resolve(make_ref(d - 1 - k, o));
            make_ref(ref_depth(resolved) + k, ref_offset(resolved))
        }
    });
    if let TermKind::Fun(inner) = &mut t.kind {
        for it in &mut inner.terms {
            retarget(it, k + 1, local, stream);
        }
        let r = inner.output;
        let d = ref_depth(r);
        let o = ref_offset(r);
        let k1 = k + 1;
        inner.output = if d < k1 {
            r
        } else if d == k1 {
            let m = local(o);
            make_ref(k1 + ref_depth(m), ref_offset(m))
        } else {
            let resolved = stream.resolve(make_ref(d - 1 - k1, o));
            make_ref(ref_depth(resolved) + k1, ref_offset(resolved))
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::purity::pass_purity;
    use crate::sweep::pass_sweep;
    use crate::usage::pass_usage;
    use kiln_lang::prim::flags as pflag;

    fn lit(i: i64) -> Term {
        Term::new(TermKind::Lit {
            value: Literal::Integer(i),
        })
    }

    #[test]
    fn identity_application_inlines_away() {
        // top: f = \x x ; one = 1 ; r = f one ; -> r
        let identity = FunTerm {
            id: 1,
            label: "id".into(),
            nargs: 1,
            terms: vec![Term::new(TermKind::Arg)],
            output: make_ref(0, 0),
        };
        let mut fun = FunTerm {
            id: 0,
            label: "top".into(),
            nargs: 0,
            terms: vec![
                Term::new(TermKind::Fun(Box::new(identity))),
                lit(1),
                Term::new(TermKind::App {
                    f: make_ref(0, 0),
                    v: make_ref(0, 1),
                }),
            ],
            output: make_ref(0, 2),
        };
        pass_purity(&mut fun);
        let mut fun = pass_inline(fun);
        pass_usage(&mut fun);
        let fun = pass_sweep(fun);
        assert!(
            fun.terms.iter().all(|t| !matches!(t.kind, TermKind::App { .. })),
            "{}",
            fun
        );
        match &fun.terms[ref_offset(fun.output)].kind {
            TermKind::Lit { value } => assert_eq!(*value, Literal::Integer(1)),
            other => panic!("expected literal, got {:?}", other),
        }
    }

    #[test]
    fn body_with_work_is_copied_in_place() {
        // f = \x iadd x x ; r = f 2
        let body = FunTerm {
            id: 1,
            label: "dbl".into(),
            nargs: 1,
            terms: vec![
                Term::new(TermKind::Arg),
                Term::new(TermKind::Prim {
                    name: "iadd".into(),
                    pflags: pflag::PURE,
                    args: vec![make_ref(0, 0), make_ref(0, 0)],
                }),
            ],
            output: make_ref(0, 1),
        };
        let mut fun = FunTerm {
            id: 0,
            label: "top".into(),
            nargs: 0,
            terms: vec![
                Term::new(TermKind::Fun(Box::new(body))),
                lit(2),
                Term::new(TermKind::App {
                    f: make_ref(0, 0),
                    v: make_ref(0, 1),
                }),
            ],
            output: make_ref(0, 2),
        };
        pass_purity(&mut fun);
        let mut fun = pass_inline(fun);
        pass_usage(&mut fun);
        let fun = pass_sweep(fun);
        // The prim now lives in the top frame, fed by the literal.
        let prim = fun
            .terms
            .iter()
            .find(|t| matches!(t.kind, TermKind::Prim { .. }))
            .unwrap_or_else(|| panic!("prim missing: {}", fun));
        match &prim.kind {
            TermKind::Prim { args, .. } => {
                assert_eq!(ref_depth(args[0]), 0);
                assert_eq!(args[0], args[1]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn recursive_functions_are_not_inlined() {
        let body = FunTerm {
            id: 1,
            label: "loop".into(),
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
        let mut loop_term = Term::new(TermKind::Fun(Box::new(body)));
        loop_term.set(flag::RECURSIVE);
        let mut fun = FunTerm {
            id: 0,
            label: "top".into(),
            nargs: 0,
            terms: vec![
                loop_term,
                lit(1),
                Term::new(TermKind::App {
                    f: make_ref(0, 0),
                    v: make_ref(0, 1),
                }),
            ],
            output: make_ref(0, 2),
        };
        pass_purity(&mut fun);
        let fun = pass_inline(fun);
        assert!(fun
            .terms
            .iter()
            .any(|t| matches!(t.kind, TermKind::App { .. })));
    }

    #[test]
    fn duplicate_literals_pool() {
        let mut fun = FunTerm {
            id: 0,
            label: "top".into(),
            nargs: 0,
            terms: vec![
                lit(7),
                lit(7),
                Term::new(TermKind::Prim {
                    name: "iadd".into(),
                    pflags: pflag::PURE,
                    args: vec![make_ref(0, 0), make_ref(0, 1)],
                }),
            ],
            output: make_ref(0, 2),
        };
        pass_purity(&mut fun);
        let mut fun = pass_inline(fun);
        pass_usage(&mut fun);
        let fun = pass_sweep(fun);
        let lits = fun
            .terms
            .iter()
            .filter(|t| matches!(t.kind, TermKind::Lit { .. }))
            .count();
        assert_eq!(lits, 1, "{}", fun);
    }
}
