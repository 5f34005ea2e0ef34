//! Common-subexpression elimination.
//!
//! Terms are keyed by `(opcode, canonical argument refs)` and duplicates
//! within one function alias the first occurrence. Keys carry argument
//! refs as `(depth, offset)` pairs, so a merge never crosses a lexical
//! depth (the same offsets in different frames name unrelated values).
//! Only `flag::PURE` terms participate; `ORDERED` primitives are never
//! merged. Orphans die in the following sweep.

use crate::term::{flag, make_ref, FunTerm, TermKind, TermRef, TermStream};
use kiln_lang::ast::Literal;
use std::collections::HashMap;

#[derive(PartialEq, Eq, Hash)]
enum Key {
    Lit(Literal),
    App(TermRef, TermRef),
    Prim(String, Vec<TermRef>),
    Get(usize, usize, usize, TermRef),
    Des(usize, Vec<TermRef>),
    Con(usize, usize, Vec<TermRef>),
}

fn key_of(kind: &TermKind) -> Option<Key> {
    match kind {
        TermKind::Arg | TermKind::Fun(_) => None,
        TermKind::Lit { value } => Some(Key::Lit(value.clone())),
        TermKind::App { f, v } => Some(Key::App(*f, *v)),
        TermKind::Prim { name, args, .. } => Some(Key::Prim(name.clone(), args.clone())),
        TermKind::Get {
            sum,
            cons,
            field,
            tuple,
        } => Some(Key::Get(
            std::rc::Rc::as_ptr(sum) as usize,
            *cons,
            *field,
            *tuple,
        )),
        TermKind::Des { sum, args } => {
            Some(Key::Des(std::rc::Rc::as_ptr(sum) as usize, args.clone()))
        }
        TermKind::Con { sum, cons, args } => Some(Key::Con(
            std::rc::Rc::as_ptr(sum) as usize,
            *cons,
            args.clone(),
        )),
    }
}

pub fn pass_cse(root: &mut FunTerm) {
    let mut stream = TermStream::new();
    cse_fun(root, &mut stream);
}

fn cse_fun(fun: &mut FunTerm, stream: &mut TermStream) {
    stream.push_identity(fun.terms.len());
    let mut seen: HashMap<Key, usize> = HashMap::new();

    for i in 0..fun.terms.len() {
        fun.terms[i].map_refs(|r| stream.resolve(r));

        let mergeable = fun.terms[i].is(flag::PURE);
        if mergeable {
            if let Some(key) = key_of(&fun.terms[i].kind) {
                match seen.get(&key) {
                    Some(&prev) => {
                        stream.alias(i, make_ref(0, prev));
                        continue;
                    }
                    None => {
                        seen.insert(key, i);
                    }
                }
            }
        }

        if let TermKind::Fun(inner) = &mut fun.terms[i].kind {
            cse_fun(inner, stream);
        }
    }

    fun.output = stream.resolve(fun.output);
    stream.pop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::purity::pass_purity;
    use crate::sweep::pass_sweep;
    use crate::term::Term;
    use crate::usage::pass_usage;
    use kiln_lang::prim::flags as pflag;

    fn lit(i: i64) -> Term {
        Term::new(TermKind::Lit {
            value: Literal::Integer(i),
        })
    }

    fn prim(name: &str, pflags: u8, args: Vec<TermRef>) -> Term {
        Term::new(TermKind::Prim {
            name: name.into(),
            pflags,
            args,
        })
    }

    fn optimize_small(mut fun: FunTerm) -> FunTerm {
        pass_purity(&mut fun);
        pass_cse(&mut fun);
        pass_usage(&mut fun);
        pass_sweep(fun)
    }

    #[test]
    fn duplicate_pure_prims_merge() {
        let fun = FunTerm {
            id: 0,
            label: "top".into(),
            nargs: 0,
            terms: vec![
                lit(1),
                lit(2),
                prim("iadd", pflag::PURE, vec![make_ref(0, 0), make_ref(0, 1)]),
                lit(1),
                lit(2),
                prim("iadd", pflag::PURE, vec![make_ref(0, 3), make_ref(0, 4)]),
                prim(
                    "iadd",
                    pflag::PURE,
                    vec![make_ref(0, 2), make_ref(0, 5)],
                ),
            ],
            output: make_ref(0, 6),
        };
        let fun = optimize_small(fun);
        let prims = fun
            .terms
            .iter()
            .filter(|t| matches!(t.kind, TermKind::Prim { .. }))
            .count();
        // The two iadd 1 2 merged; the outer survives.
        assert_eq!(prims, 2, "{}", fun);
    }

    #[test]
    fn ordered_prims_never_merge() {
        let fun = FunTerm {
            id: 0,
            label: "top".into(),
            nargs: 0,
            terms: vec![
                lit(1),
                prim("stamp", pflag::ORDERED, vec![make_ref(0, 0)]),
                prim("stamp", pflag::ORDERED, vec![make_ref(0, 0)]),
                prim(
                    "iadd",
                    pflag::PURE,
                    vec![make_ref(0, 1), make_ref(0, 2)],
                ),
            ],
            output: make_ref(0, 3),
        };
        let fun = optimize_small(fun);
        let stamps = fun
            .terms
            .iter()
            .filter(|t| matches!(&t.kind, TermKind::Prim { name, .. } if name == "stamp"))
            .count();
        assert_eq!(stamps, 2);
    }

    #[test]
    fn literals_merge() {
        let fun = FunTerm {
            id: 0,
            label: "top".into(),
            nargs: 0,
            terms: vec![
                lit(5),
                lit(5),
                prim(
                    "iadd",
                    pflag::PURE,
                    vec![make_ref(0, 0), make_ref(0, 1)],
                ),
            ],
            output: make_ref(0, 2),
        };
        let fun = optimize_small(fun);
        let lits = fun
            .terms
            .iter()
            .filter(|t| matches!(t.kind, TermKind::Lit { .. }))
            .count();
        assert_eq!(lits, 1);
        match &fun.terms.last().unwrap().kind {
            TermKind::Prim { args, .. } => assert_eq!(args[0], args[1]),
            other => panic!("expected prim, got {:?}", other),
        }
    }
}
