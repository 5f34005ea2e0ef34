//! Hindley–Milner type inference over the resolved tree.
//!
//! Each scope frame mirrors the runtime scope graph: lambda frames hold
//! one monomorphic argument slot, binding frames hold one slot per
//! definition. Slots start as monomorphic placeholders (which is what
//! makes recursion within an SCC monomorphic) and are generalized in the
//! dependency order the resolver recorded, with whole SCCs generalized
//! only after the group converges.

use crate::ast::{Expr, ExprKind, Literal};
use crate::datatype::Sum;
use crate::diagnostics::Diagnostics;
use crate::location::Location;
use crate::prim::PrimInterface;
use crate::types::{TypeContext, TypeId};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::trace;

#[derive(Clone, Copy)]
enum Slot {
    Mono(TypeId),
    /// Generalized type plus the dob threshold for instantiation.
    Poly(TypeId, u64),
}

struct TypeFrame {
    lambda: bool,
    slots: Vec<Slot>,
}

/// Where a unification happened, for the two-sided message.
enum Site<'s> {
    Apply,
    Definition(&'s str),
    Scrutinee(&'s str),
    Handler(&'s str),
    ConstructorArg(&'s str),
}

pub struct Inference<'a> {
    cx: &'a mut TypeContext,
    prims: &'a PrimInterface,
    frames: Vec<TypeFrame>,
}

/// Infer types for a resolved program, stamping every node's `typ`.
pub fn infer_program(
    root: &mut Expr,
    cx: &mut TypeContext,
    prims: &PrimInterface,
    diags: &mut Diagnostics,
) -> TypeId {
    let mut inf = Inference {
        cx,
        prims,
        frames: Vec::new(),
    };
    inf.infer(root, diags)
}

impl<'a> Inference<'a> {
    fn infer(&mut self, e: &mut Expr, diags: &mut Diagnostics) -> TypeId {
        let location = e.location.clone();
        let t = match &mut e.kind {
            ExprKind::Literal { value } => match value {
                Literal::Integer(_) => self.cx.integer(),
                Literal::Double(_) => self.cx.double(),
                Literal::Str(_) => self.cx.string(),
            },
            ExprKind::VarRef { depth, offset, name } => {
                let name = name.clone();
                let slot = self.slot(*depth, *offset);
                match slot {
                    Some(Slot::Mono(t)) => t,
                    Some(Slot::Poly(t, dob)) => self.cx.instantiate(t, dob),
                    None => {
                        // Resolution already failed here; stay quiet.
                        trace!(name = %name, "typing unresolved reference");
                        self.cx.fresh()
                    }
                }
            }
            ExprKind::App { f, v } => {
                let tf = self.infer(f, diags);
                let tv = self.infer(v, diags);
                let r = self.cx.fresh();
                let want = self.cx.arrow(tv, r);
                self.unify_at(&location, Site::Apply, tf, want, diags);
                r
            }
            ExprKind::Lambda { body, .. } => {
                let arg = self.cx.fresh();
                self.frames.push(TypeFrame {
                    lambda: true,
                    slots: vec![Slot::Mono(arg)],
                });
                let tb = self.infer(body, diags);
                self.frames.pop();
                self.cx.arrow(arg, tb)
            }
            ExprKind::Prim { name, args, .. } => {
                let name = name.clone();
                let nargs = *args;
                let arg_types = self.lambda_args(nargs);
                let out = self.cx.fresh();
                match self.prims.typer(&name) {
                    Some(typer) => {
                        if !typer(self.cx, &arg_types, out) {
                            diags.error(
                                location.clone(),
                                format!("primitive '{}' signature mismatch", name),
                            );
                        }
                    }
                    None => {
                        // Unknown prim was already diagnosed by resolution.
                        trace!(name = %name, "typing unknown primitive");
                    }
                }
                out
            }
            ExprKind::Construct { sum, cons } => {
                let sum = sum.clone();
                let cons = *cons;
                let (sum_type, params) = self.sum_type(&sum);
                let fields: Vec<TypeId> = sum.members[cons]
                    .ast
                    .args
                    .iter()
                    .map(|a| self.type_from_ast(a, &params))
                    .collect();
                let args = self.lambda_args(fields.len());
                let ctor_name = sum.members[cons].ast.name.clone();
                for (have, want) in args.into_iter().zip(fields) {
                    self.unify_at(
                        &location,
                        Site::ConstructorArg(&ctor_name),
                        have,
                        want,
                        diags,
                    );
                }
                sum_type
            }
            ExprKind::Destruct { sum } => {
                let sum = sum.clone();
                let (sum_type, _) = self.sum_type(&sum);
                let result = self.cx.fresh();
                let mut args = self.lambda_args(sum.members.len() + 1);
                let scrutinee = args.pop().expect("destruct always has a scrutinee");
                self.unify_at(&location, Site::Scrutinee(&sum.name), scrutinee, sum_type, diags);
                for handler in args {
                    let want = self.cx.arrow(sum_type, result);
                    self.unify_at(&location, Site::Handler(&sum.name), handler, want, diags);
                }
                result
            }
            ExprKind::Get { sum, cons, field } => {
                let sum = sum.clone();
                let (cons, field) = (*cons, *field);
                let (sum_type, params) = self.sum_type(&sum);
                let out = self.type_from_ast(&sum.members[cons].ast.args[field], &params);
                let tuple = self.lambda_args(1)[0];
                self.unify_at(&location, Site::Scrutinee(&sum.name), tuple, sum_type, diags);
                out
            }
            ExprKind::DefBinding(b) => {
                let n = b.val.len() + b.fun.len();
                let placeholders: Vec<TypeId> = (0..n).map(|_| self.cx.fresh()).collect();
                self.frames.push(TypeFrame {
                    lambda: false,
                    slots: placeholders.iter().map(|&t| Slot::Mono(t)).collect(),
                });
                let frame = self.frames.len() - 1;

                let typing = b.typing.clone();
                let nvals = b.val.len();
                let mut k = 0usize;
                while k < typing.len() {
                    let slot = typing[k] as usize;
                    if slot < nvals {
                        // Value: infer, then generalize.
                        let t0 = self.cx.now();
                        self.cx.tick();
                        let name = b.order[slot].clone();
                        let t = self.infer(&mut b.val[slot], diags);
                        self.unify_at(
                            &b.val[slot].location.clone(),
                            Site::Definition(&name),
                            t,
                            placeholders[slot],
                            diags,
                        );
                        self.frames[frame].slots[slot] = Slot::Poly(placeholders[slot], t0);
                        k += 1;
                    } else {
                        // Function SCC: consecutive fun slots sharing an id.
                        let scc_id = b.scc[slot - nvals];
                        let t0 = self.cx.now();
                        self.cx.tick();
                        let start = k;
                        while k < typing.len() {
                            let s = typing[k] as usize;
                            if s < nvals || b.scc[s - nvals] != scc_id {
                                break;
                            }
                            k += 1;
                        }
                        for &s in &typing[start..k] {
                            let s = s as usize;
                            let name = b.order[s].clone();
                            let loc = b.fun[s - nvals].location.clone();
                            let t = self.infer(&mut b.fun[s - nvals], diags);
                            self.unify_at(
                                &loc,
                                Site::Definition(&name),
                                t,
                                placeholders[s],
                                diags,
                            );
                        }
                        for &s in &typing[start..k] {
                            let s = s as usize;
                            self.frames[frame].slots[s] = Slot::Poly(placeholders[s], t0);
                        }
                    }
                }

                let t = self.infer(&mut b.body, diags);
                self.frames.pop();
                t
            }
            ExprKind::Subscribe { .. }
            | ExprKind::DefMap { .. }
            | ExprKind::Top { .. }
            | ExprKind::Match { .. } => {
                unreachable!("resolution eliminates this node before typing")
            }
        };
        e.typ = t;
        t
    }

    /// Argument types of the `n` innermost enclosing lambda frames,
    /// outermost of the group first (matching application order).
    fn lambda_args(&mut self, n: usize) -> Vec<TypeId> {
        let mut out = Vec::with_capacity(n);
        for frame in self.frames.iter().rev() {
            if out.len() == n {
                break;
            }
            if frame.lambda {
                match frame.slots[0] {
                    Slot::Mono(t) => out.push(t),
                    Slot::Poly(t, _) => out.push(t),
                }
            }
        }
        // Short on lambdas only after a resolution error; pad to keep going.
        while out.len() < n {
            out.push(self.cx.fresh());
        }
        out.reverse();
        out
    }

    fn slot(&self, depth: u32, offset: u32) -> Option<Slot> {
        let idx = self.frames.len().checked_sub(1 + depth as usize)?;
        self.frames[idx].slots.get(offset as usize).copied()
    }

    /// Sum type with fresh parameters, plus the name -> variable map.
    fn sum_type(&mut self, sum: &Rc<Sum>) -> (TypeId, HashMap<String, TypeId>) {
        let mut params = HashMap::new();
        let mut args = Vec::with_capacity(sum.args.len());
        for p in &sum.args {
            let v = self.cx.fresh();
            params.insert(p.clone(), v);
            args.push(v);
        }
        (self.cx.ctor(sum.name.clone(), args), params)
    }

    fn type_from_ast(
        &mut self,
        ast: &crate::ast::Ast,
        params: &HashMap<String, TypeId>,
    ) -> TypeId {
        if ast.is_constructor() {
            let args: Vec<TypeId> = ast
                .args
                .iter()
                .map(|a| self.type_from_ast(a, params))
                .collect();
            self.cx.ctor(ast.name.clone(), args)
        } else {
            match params.get(&ast.name) {
                Some(&t) => t,
                // A type variable not bound by the sum head; tolerated as
                // fresh (the datatype pass will have complained already).
                None => self.cx.fresh(),
            }
        }
    }

    fn unify_at(
        &mut self,
        location: &Location,
        site: Site<'_>,
        have: TypeId,
        want: TypeId,
        diags: &mut Diagnostics,
    ) {
        if let Err(conflict) = self.cx.unify(have, want) {
            let mut names = HashMap::new();
            let left = self.cx.format_with(conflict.left, &mut names);
            let right = self.cx.format_with(conflict.right, &mut names);
            let have_s = self.cx.format_with(have, &mut names);
            let want_s = self.cx.format_with(want, &mut names);
            let msg = match site {
                Site::Apply => format!(
                    "cannot apply a function of type {} where {} is expected ({} vs {})",
                    have_s, want_s, left, right
                ),
                Site::Definition(name) => format!(
                    "definition '{}' was inferred as {} but is used as {} ({} vs {})",
                    name, have_s, want_s, left, right
                ),
                Site::Scrutinee(sum) => format!(
                    "scrutinee of a {} match has type {} ({} vs {})",
                    sum, have_s, left, right
                ),
                Site::Handler(sum) => format!(
                    "handler of a {} match has type {} where {} is expected ({} vs {})",
                    sum, have_s, want_s, left, right
                ),
                Site::ConstructorArg(ctor) => format!(
                    "argument of constructor {} has type {} where {} is expected ({} vs {})",
                    ctor, have_s, want_s, left, right
                ),
            };
            diags.error(location.clone(), msg);
        }
    }
}
