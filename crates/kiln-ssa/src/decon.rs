//! Deconstruction simplification.
//!
//! Two rewrites:
//! 1. A `Get` whose tuple is a same-frame `Con` of the matching
//!    constructor forwards the constructed field directly.
//! 2. A function that rebuilds its own argument (`\x Con(get0 x, ...)`
//!    where the argument's case tag proves the constructor) returns the
//!    argument instead.
//!
//! Neither rewrite moves terms; referrers are redirected through aliases
//! and the orphaned terms fall to the next usage/sweep.

use crate::term::{make_ref, ref_depth, ref_offset, FunTerm, TermKind, TermStream};

pub fn pass_decon(root: &mut FunTerm) {
    let mut stream = TermStream::new();
    decon_fun(root, &mut stream);
}

fn decon_fun(fun: &mut FunTerm, stream: &mut TermStream) {
    stream.push_identity(fun.terms.len());

    for i in 0..fun.terms.len() {
        // Canonicalize this term's references first.
        fun.terms[i].map_refs(|r| stream.resolve(r));

        if let TermKind::Get {
            cons,
            field,
            tuple,
            ..
        } = fun.terms[i].kind.clone()
        {
            if ref_depth(tuple) == 0 {
                let o = ref_offset(tuple);
                if o < i {
                    if let TermKind::Con {
                        cons: have, args, ..
                    } = &fun.terms[o].kind
                    {
                        if *have == cons && field < args.len() {
                            stream.alias(i, args[field]);
                        }
                    }
                }
            }
        }

        if let TermKind::Fun(inner) = &mut fun.terms[i].kind {
            decon_fun(inner, stream);
            collapse_identity(inner);
        }
    }

    fun.output = stream.resolve(fun.output);
    stream.pop();
}

/// `\x Con_c(get_c.0 x, get_c.1 x, ...)` with `x` tagged as constructor
/// `c` collapses to `\x x`.
fn collapse_identity(fun: &mut FunTerm) {
    if fun.nargs != 1 {
        return;
    }
    let tag = fun.terms[0].meta;
    if tag == 0 {
        return;
    }
    let known_cons = (tag - 1) as usize;

    let out = fun.output;
    if ref_depth(out) != 0 {
        return;
    }
    let TermKind::Con { cons, args, sum } = &fun.terms[ref_offset(out)].kind else {
        return;
    };
    if *cons != known_cons || args.len() != sum.members[*cons].arity() {
        return;
    }
    // Every field must be `get.{k} arg`.
    for (k, &a) in args.iter().enumerate() {
        if ref_depth(a) != 0 {
            return;
        }
        match &fun.terms[ref_offset(a)].kind {
            TermKind::Get {
                cons: gc,
                field,
                tuple,
                ..
            } if *gc == known_cons
                && *field == k
                && ref_depth(*tuple) == 0
                && ref_offset(*tuple) == 0 => {}
            _ => return,
        }
    }
    fun.output = make_ref(0, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::purity::pass_purity;
    use crate::sweep::pass_sweep;
    use crate::term::{flag, Term};
    use crate::usage::pass_usage;
    use kiln_lang::ast::{Ast, Literal};
    use kiln_lang::datatype::{Constructor, Sum};
    use kiln_lang::location::Location;
    use std::rc::Rc;

    fn pair_sum() -> Rc<Sum> {
        let here = Location::synthetic("t");
        Rc::new(Sum {
            name: "Pair".into(),
            location: here.clone(),
            args: vec!["a".into(), "b".into()],
            members: vec![Constructor {
                ast: Ast::with_args(
                    here.clone(),
                    "Pair",
                    vec![Ast::new(here.clone(), "a"), Ast::new(here, "b")],
                ),
                index: 0,
            }],
        })
    }

    fn lit(i: i64) -> Term {
        Term::new(TermKind::Lit {
            value: Literal::Integer(i),
        })
    }

    #[test]
    fn get_of_con_forwards_field() {
        let sum = pair_sum();
        let mut fun = FunTerm {
            id: 0,
            label: "top".into(),
            nargs: 0,
            terms: vec![
                lit(1),
                lit(2),
                Term::new(TermKind::Con {
                    sum: sum.clone(),
                    cons: 0,
                    args: vec![make_ref(0, 0), make_ref(0, 1)],
                }),
                Term::new(TermKind::Get {
                    sum,
                    cons: 0,
                    field: 1,
                    tuple: make_ref(0, 2),
                }),
            ],
            output: make_ref(0, 3),
        };
        pass_decon(&mut fun);
        pass_purity(&mut fun);
        pass_usage(&mut fun);
        let fun = pass_sweep(fun);
        // The get and the con are gone; the output is the field literal.
        assert!(fun
            .terms
            .iter()
            .all(|t| !matches!(t.kind, TermKind::Get { .. } | TermKind::Con { .. })));
        match &fun.terms[ref_offset(fun.output)].kind {
            TermKind::Lit { value } => assert_eq!(*value, Literal::Integer(2)),
            other => panic!("expected literal output, got {:?}", other),
        }
    }

    #[test]
    fn identity_reconstruction_collapses_to_arg() {
        let sum = pair_sum();
        let mut inner = FunTerm {
            id: 1,
            label: "h".into(),
            nargs: 1,
            terms: vec![
                Term::new(TermKind::Arg),
                Term::new(TermKind::Get {
                    sum: sum.clone(),
                    cons: 0,
                    field: 0,
                    tuple: make_ref(0, 0),
                }),
                Term::new(TermKind::Get {
                    sum: sum.clone(),
                    cons: 0,
                    field: 1,
                    tuple: make_ref(0, 0),
                }),
                Term::new(TermKind::Con {
                    sum: sum.clone(),
                    cons: 0,
                    args: vec![make_ref(0, 1), make_ref(0, 2)],
                }),
            ],
            output: make_ref(0, 3),
        };
        inner.terms[0].meta = 1; // case tag: constructor 0
        let mut fun = FunTerm {
            id: 0,
            label: "top".into(),
            nargs: 0,
            terms: vec![Term::new(TermKind::Fun(Box::new(inner)))],
            output: make_ref(0, 0),
        };
        fun.terms[0].set(flag::USED);
        pass_decon(&mut fun);
        match &fun.terms[0].kind {
            TermKind::Fun(inner) => assert_eq!(inner.output, make_ref(0, 0)),
            other => panic!("expected fun, got {:?}", other),
        }
    }
}
