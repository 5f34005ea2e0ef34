//! Dead-code sweep: drop unreferenced, effect-free terms.
//!
//! Runs after `pass_usage`. The keep-set and the new offsets for a whole
//! function are decided before any reference is rewritten, so forward
//! references into recursive groups remap correctly.

use crate::term::{flag, FunTerm, TermKind, TermStream};
use crate::usage::must_keep;

pub fn pass_sweep(root: FunTerm) -> FunTerm {
    let mut stream = TermStream::new();
    sweep_fun(root, &mut stream)
}

fn sweep_fun(fun: FunTerm, stream: &mut TermStream) -> FunTerm {
    let FunTerm {
        id,
        label,
        nargs,
        terms,
        output,
    } = fun;

    let keeps: Vec<bool> = terms
        .iter()
        .enumerate()
        .map(|(i, t)| i < nargs || t.is(flag::USED) || must_keep(t))
        .collect();

    stream.push(terms.len());
    let mut next = 0usize;
    for (i, &k) in keeps.iter().enumerate() {
        if k {
            stream.keep(i, next);
            next += 1;
        }
    }

    let mut out = Vec::with_capacity(next);
    for (i, mut t) in terms.into_iter().enumerate() {
        if !keeps[i] {
            continue;
        }
        t.map_refs(|r| stream.resolve(r));
        if let TermKind::Fun(inner) = t.kind {
            t.kind = TermKind::Fun(Box::new(sweep_fun(*inner, stream)));
        }
        out.push(t);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::purity::pass_purity;
    use crate::term::{make_ref, Term};
    use crate::usage::pass_usage;
    use kiln_lang::ast::Literal;

    fn lit(i: i64) -> Term {
        Term::new(TermKind::Lit {
            value: Literal::Integer(i),
        })
    }

    #[test]
    fn dead_terms_removed_and_refs_rewritten() {
        let mut fun = FunTerm {
            id: 0,
            label: "top".into(),
            nargs: 0,
            terms: vec![
                lit(1), // dead
                lit(2),
                Term::new(TermKind::App {
                    f: make_ref(0, 1),
                    v: make_ref(0, 1),
                }),
            ],
            output: make_ref(0, 2),
        };
        pass_purity(&mut fun);
        pass_usage(&mut fun);
        let fun = pass_sweep(fun);
        assert_eq!(fun.terms.len(), 2);
        match fun.terms[1].kind {
            TermKind::App { f, v } => {
                assert_eq!(f, make_ref(0, 0));
                assert_eq!(v, make_ref(0, 0));
            }
            ref other => panic!("expected app, got {:?}", other),
        }
        assert_eq!(fun.output, make_ref(0, 1));
    }

    #[test]
    fn sweep_after_usage_is_idempotent() {
        let mut fun = FunTerm {
            id: 0,
            label: "top".into(),
            nargs: 0,
            terms: vec![lit(1), lit(2)],
            output: make_ref(0, 0),
        };
        pass_usage(&mut fun);
        let mut once = pass_sweep(fun);
        pass_usage(&mut once);
        let twice = pass_sweep(once.clone());
        assert_eq!(once.terms.len(), twice.terms.len());
        assert_eq!(once.output, twice.output);
    }
}
