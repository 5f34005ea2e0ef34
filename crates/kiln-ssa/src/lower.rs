//! Lowering: resolved expression tree to the SSA term graph.
//!
//! Bottom-up, single pass. Every surface node contributes at most one
//! term to the innermost open function; `VarRef` contributes none and
//! simply forwards its binding's slot. Binding groups reserve their
//! function slots *before* lowering the bodies, so mutually recursive
//! references resolve to real offsets.

use crate::term::{flag, make_ref, FunTerm, Term, TermKind};
use kiln_lang::ast::{DefBinding, Expr, ExprKind};
use kiln_lang::resolver::META_RECURSIVE;
use tracing::debug;

/// Absolute position of a term: (function depth, offset).
type Loc = (usize, usize);

struct FunFrame {
    label: String,
    nargs: usize,
    terms: Vec<Term>,
}

struct EnvFrame {
    lambda: bool,
    slots: Vec<Loc>,
}

struct Lowerer {
    funs: Vec<FunFrame>,
    env: Vec<EnvFrame>,
    next_id: u64,
}

/// Lower a resolved program into the root function of the term graph.
pub fn lower(root: &Expr) -> FunTerm {
    let mut lw = Lowerer {
        funs: vec![FunFrame {
            label: "top".to_string(),
            nargs: 0,
            terms: Vec::new(),
        }],
        env: Vec::new(),
        next_id: 1,
    };
    let out = lw.lower_expr(root);
    let frame = lw.funs.pop().expect("root frame");
    let output = make_ref(0, out.1);
    debug_assert_eq!(out.0, 0, "root output must land in the root function");
    let fun = FunTerm {
        id: 0,
        label: frame.label,
        nargs: frame.nargs,
        terms: frame.terms,
        output,
    };
    debug!(terms = fun.size(), "lowered program");
    fun
}

impl Lowerer {
    fn depth(&self) -> usize {
        self.funs.len() - 1
    }

    fn emit(&mut self, term: Term) -> Loc {
        let d = self.depth();
        let frame = self.funs.last_mut().expect("open fun");
        frame.terms.push(term);
        (d, frame.terms.len() - 1)
    }

    /// Convert an absolute location to a reference from the current depth.
    fn rel(&self, loc: Loc) -> usize {
        make_ref(self.depth() - loc.0, loc.1)
    }

    /// Slot locations of the `n` innermost lambda arguments, outermost of
    /// the group first (application order).
    fn lambda_args(&self, n: usize) -> Vec<usize> {
        let mut locs = Vec::with_capacity(n);
        for frame in self.env.iter().rev() {
            if locs.len() == n {
                break;
            }
            if frame.lambda {
                locs.push(frame.slots[0]);
            }
        }
        debug_assert_eq!(locs.len(), n, "resolver validated lambda depth");
        locs.reverse();
        locs.into_iter().map(|l| self.rel(l)).collect()
    }

    fn lower_expr(&mut self, e: &Expr) -> Loc {
        match &e.kind {
            ExprKind::VarRef { depth, offset, .. } => {
                let frame = &self.env[self.env.len() - 1 - *depth as usize];
                let loc = frame.slots[*offset as usize];
                debug_assert_ne!(
                    loc.0,
                    usize::MAX,
                    "stratification admits no forward value reference"
                );
                loc
            }
            ExprKind::Literal { value } => self.emit(Term::new(TermKind::Lit {
                value: value.clone(),
            })),
            ExprKind::Lambda { .. } => {
                let fun = self.lower_lambda(e);
                self.emit(Term::new(TermKind::Fun(Box::new(fun))))
            }
            ExprKind::App { f, v } => {
                let f_loc = self.lower_expr(f);
                let v_loc = self.lower_expr(v);
                let term = Term::new(TermKind::App {
                    f: self.rel(f_loc),
                    v: self.rel(v_loc),
                });
                self.emit(term)
            }
            ExprKind::Prim {
                name,
                args,
                pflags,
            } => {
                let refs = self.lambda_args(*args);
                self.emit(Term::new(TermKind::Prim {
                    name: name.clone(),
                    pflags: *pflags,
                    args: refs,
                }))
            }
            ExprKind::Construct { sum, cons } => {
                let arity = sum.members[*cons].arity();
                let refs = self.lambda_args(arity);
                self.emit(Term::new(TermKind::Con {
                    sum: sum.clone(),
                    cons: *cons,
                    args: refs,
                }))
            }
            ExprKind::Destruct { sum } => {
                let refs = self.lambda_args(sum.members.len() + 1);
                self.emit(Term::new(TermKind::Des {
                    sum: sum.clone(),
                    args: refs,
                }))
            }
            ExprKind::Get { sum, cons, field } => {
                let tuple = self.lambda_args(1)[0];
                self.emit(Term::new(TermKind::Get {
                    sum: sum.clone(),
                    cons: *cons,
                    field: *field,
                    tuple,
                }))
            }
            ExprKind::DefBinding(b) => self.lower_binding(b),
            ExprKind::Subscribe { .. }
            | ExprKind::DefMap { .. }
            | ExprKind::Top { .. }
            | ExprKind::Match { .. } => {
                unreachable!("resolution eliminates this node before lowering")
            }
        }
    }

    /// Lower a lambda into a standalone `FunTerm` (not yet emitted).
    fn lower_lambda(&mut self, e: &Expr) -> FunTerm {
        let ExprKind::Lambda { name, body, fnname } = &e.kind else {
            unreachable!("lower_lambda on a non-lambda");
        };
        self.funs.push(FunFrame {
            label: if fnname.is_empty() {
                "anon".to_string()
            } else {
                fnname.clone()
            },
            nargs: 1,
            terms: vec![{
                let mut arg = Term::new(TermKind::Arg);
                arg.label = name.clone();
                arg
            }],
        });
        let my_depth = self.depth();
        self.env.push(EnvFrame {
            lambda: true,
            slots: vec![(my_depth, 0)],
        });

        let out = self.lower_expr(body);

        self.env.pop();
        let frame = self.funs.pop().expect("lambda frame");
        let output = make_ref(my_depth - out.0, out.1);
        let id = self.next_id;
        self.next_id += 1;
        FunTerm {
            id,
            label: frame.label,
            nargs: frame.nargs,
            terms: frame.terms,
            output,
        }
    }

    fn lower_binding(&mut self, b: &DefBinding) -> Loc {
        let d = self.depth();
        let nvals = b.val.len();
        let nfuns = b.fun.len();

        // Function slots are reserved up front, so references into a
        // recursive group (from sibling functions or from values) land on
        // real offsets. The frame is pushed before any value lowers:
        // value bodies may name function slots, and stratification has
        // already ruled out forward value-to-value references.
        let base = self.funs.last().expect("open fun").terms.len();
        for k in 0..nfuns {
            let mut placeholder = Term::new(TermKind::Arg);
            placeholder.label = b.order[nvals + k].clone();
            self.funs
                .last_mut()
                .expect("open fun")
                .terms
                .push(placeholder);
        }

        const UNSET: Loc = (usize::MAX, usize::MAX);
        let mut slots: Vec<Loc> = vec![UNSET; nvals];
        for k in 0..nfuns {
            slots.push((d, base + k));
        }
        self.env.push(EnvFrame {
            lambda: false,
            slots,
        });
        let frame = self.env.len() - 1;

        for (i, v) in b.val.iter().enumerate() {
            let loc = self.lower_expr(v);
            if loc.0 == d {
                let t = &mut self.funs.last_mut().expect("open fun").terms[loc.1];
                if t.label.is_empty() {
                    t.label = b.order[i].clone();
                }
            }
            self.env[frame].slots[i] = loc;
        }

        for (k, f) in b.fun.iter().enumerate() {
            let mut fun = self.lower_lambda(f);
            fun.label = b.order[nvals + k].clone();
            let mut term = Term::new(TermKind::Fun(Box::new(fun)));
            term.label = b.order[nvals + k].clone();
            if f.meta & META_RECURSIVE != 0 {
                term.set(flag::RECURSIVE);
            }
            self.funs.last_mut().expect("open fun").terms[base + k] = term;
        }

        let out = self.lower_expr(&b.body);
        self.env.pop();
        out
    }
}
