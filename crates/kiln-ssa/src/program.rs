//! Final code form handed to the interpreter.
//!
//! Nested `Fun` terms are hoisted into a flat function table; a `Fun`
//! term becomes a `Closure` referencing its table index. Everything else
//! carries over unchanged, so scope numbering is identical to the
//! optimized term graph.

use crate::term::{FunTerm, TermKind, TermRef};
use kiln_lang::ast::Literal;
use kiln_lang::datatype::Sum;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub enum CodeTerm {
    Arg,
    Lit {
        value: Literal,
    },
    App {
        f: TermRef,
        v: TermRef,
    },
    Prim {
        name: String,
        pflags: u8,
        args: Vec<TermRef>,
    },
    Get {
        field: usize,
        tuple: TermRef,
    },
    /// Handlers in member order, then the scrutinee.
    Des {
        args: Vec<TermRef>,
    },
    Con {
        sum: Rc<Sum>,
        cons: usize,
        args: Vec<TermRef>,
    },
    /// Allocate a closure over the current scope.
    Closure {
        fun: usize,
    },
}

#[derive(Debug, Clone)]
pub struct CodeFun {
    pub label: String,
    pub nargs: usize,
    pub terms: Vec<CodeTerm>,
    pub output: TermRef,
}

#[derive(Debug, Clone)]
pub struct Program {
    pub funs: Vec<CodeFun>,
    pub entry: usize,
}

impl Program {
    pub fn entry_fun(&self) -> &CodeFun {
        &self.funs[self.entry]
    }
}

/// Flatten the optimized term graph into a function table.
pub fn flatten(root: FunTerm) -> Program {
    let mut funs: Vec<Option<CodeFun>> = Vec::new();
    let entry = flatten_fun(root, &mut funs);
    Program {
        funs: funs.into_iter().map(|f| f.expect("every slot filled")).collect(),
        entry,
    }
}

fn flatten_fun(fun: FunTerm, funs: &mut Vec<Option<CodeFun>>) -> usize {
    let idx = funs.len();
    funs.push(None);
    let mut terms = Vec::with_capacity(fun.terms.len());
    for t in fun.terms {
        let code = match t.kind {
            TermKind::Arg => CodeTerm::Arg,
            TermKind::Lit { value } => CodeTerm::Lit { value },
            TermKind::App { f, v } => CodeTerm::App { f, v },
            TermKind::Prim {
                name,
                pflags,
                args,
            } => CodeTerm::Prim {
                name,
                pflags,
                args,
            },
            TermKind::Get { field, tuple, .. } => CodeTerm::Get { field, tuple },
            TermKind::Des { args, .. } => CodeTerm::Des { args },
            TermKind::Con { sum, cons, args } => CodeTerm::Con { sum, cons, args },
            TermKind::Fun(inner) => {
                let inner_idx = flatten_fun(*inner, funs);
                CodeTerm::Closure { fun: inner_idx }
            }
        };
        terms.push(code);
    }
    funs[idx] = Some(CodeFun {
        label: fun.label,
        nargs: fun.nargs,
        terms,
        output: fun.output,
    });
    idx
}
