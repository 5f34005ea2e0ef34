//! Surface expression tree.
//!
//! The parser produces a "raw" tree where names are unresolved strings;
//! resolution rewrites `Match`/`DefMap`/`Top`/`Subscribe` away, leaving a
//! core of `Lambda`/`App`/`VarRef`/`Literal`/`Prim`/`Construct`/`Destruct`/
//! `Get`/`DefBinding` whose every `VarRef` addresses a `(depth, offset)`
//! slot. Every node carries its `Location`, a `TypeId` filled by inference,
//! and a `meta` scratch word used by later passes.

use crate::datatype::Sum;
use crate::location::Location;
use crate::types::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Arc;

/// A literal value as written in source.
#[derive(Debug, Clone)]
pub enum Literal {
    Integer(i64),
    Double(f64),
    Str(Arc<str>),
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::Integer(a), Literal::Integer(b)) => a == b,
            (Literal::Double(a), Literal::Double(b)) => a.to_bits() == b.to_bits(),
            (Literal::Str(a), Literal::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Literal {}

impl Hash for Literal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Literal::Integer(i) => {
                0u8.hash(state);
                i.hash(state);
            }
            Literal::Double(d) => {
                1u8.hash(state);
                d.to_bits().hash(state);
            }
            Literal::Str(s) => {
                2u8.hash(state);
                s.hash(state);
            }
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Integer(i) => write!(f, "{}", i),
            Literal::Double(d) => write!(f, "{}", d),
            Literal::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Pattern / type-expression tree.
///
/// `name` starting upper-case is a constructor (or type constructor); a
/// lower-case name is a variable (or type variable); `_` is an anonymous
/// variable; an empty name with `literal` set is a literal pattern.
#[derive(Debug, Clone)]
pub struct Ast {
    pub location: Location,
    pub name: String,
    pub args: Vec<Ast>,
    pub literal: Option<Literal>,
}

impl Ast {
    pub fn new(location: Location, name: impl Into<String>) -> Self {
        Self {
            location,
            name: name.into(),
            args: Vec::new(),
            literal: None,
        }
    }

    pub fn with_args(location: Location, name: impl Into<String>, args: Vec<Ast>) -> Self {
        Self {
            location,
            name: name.into(),
            args,
            literal: None,
        }
    }

    pub fn literal(location: Location, value: Literal) -> Self {
        Self {
            location,
            name: String::new(),
            args: Vec::new(),
            literal: Some(value),
        }
    }

    pub fn is_constructor(&self) -> bool {
        self.name
            .chars()
            .next()
            .map(|c| c.is_uppercase())
            .unwrap_or(false)
    }

    pub fn is_wildcard(&self) -> bool {
        self.name == "_"
    }

    pub fn is_variable(&self) -> bool {
        !self.is_constructor() && self.literal.is_none() && !self.name.is_empty()
    }

    /// Render a pattern shape, used by non-exhaustive-match counterexamples.
    pub fn render(&self) -> String {
        if let Some(lit) = &self.literal {
            return lit.to_string();
        }
        if self.args.is_empty() {
            self.name.clone()
        } else {
            let mut out = self.name.clone();
            for a in &self.args {
                out.push(' ');
                if a.args.is_empty() {
                    out.push_str(&a.render());
                } else {
                    out.push('(');
                    out.push_str(&a.render());
                    out.push(')');
                }
            }
            out
        }
    }
}

/// One arm of a surface `match`.
#[derive(Debug, Clone)]
pub struct MatchArm {
    /// One pattern per scrutinee.
    pub patterns: Vec<Ast>,
    pub guard: Option<Expr>,
    pub body: Expr,
}

/// A named definition inside a `DefMap` (or a publish).
#[derive(Debug, Clone)]
pub struct Def {
    pub name: String,
    pub location: Location,
    pub body: Expr,
}

/// The unresolved per-file scope: definitions, publishes, and a body.
#[derive(Debug, Clone, Default)]
pub struct DefMap {
    pub defs: Vec<Def>,
    pub pubs: Vec<Def>,
}

/// Fully-resolved binding group: `val` children are evaluated (in order)
/// before the body; `fun` children are mutually recursive lambdas grouped
/// by their strongly-connected component for generalization.
#[derive(Debug, Clone)]
pub struct DefBinding {
    pub val: Vec<Expr>,
    pub fun: Vec<Expr>,
    /// Slot names in evaluation order (vals then funs), for traces.
    pub order: Vec<String>,
    /// SCC group id per `fun` entry.
    pub scc: Vec<usize>,
    /// Slot indices in dependency order, interleaving vals and fun SCCs;
    /// the typechecker processes (and generalizes) in this order.
    pub typing: Vec<u32>,
    pub body: Box<Expr>,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub location: Location,
    pub typ: TypeId,
    pub meta: u64,
    pub kind: ExprKind,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    /// Named reference; `depth`/`offset` are filled by the resolver.
    VarRef {
        name: String,
        depth: u32,
        offset: u32,
    },
    App {
        f: Box<Expr>,
        v: Box<Expr>,
    },
    Lambda {
        name: String,
        body: Box<Expr>,
        /// Name of the enclosing definition, for stack traces.
        fnname: String,
    },
    Literal {
        value: Literal,
    },
    /// Native primitive; consumes the `args` innermost enclosing lambda
    /// parameters when lowered.
    Prim {
        name: String,
        args: usize,
        pflags: u8,
    },
    /// Unresolved scope; eliminated by resolution.
    DefMap {
        map: DefMap,
        body: Box<Expr>,
    },
    /// Root of the program: one `DefMap` per file plus the entry body.
    Top {
        files: Vec<(String, DefMap)>,
        globals: Vec<String>,
        body: Box<Expr>,
    },
    /// Surface match; eliminated by pattern compilation.
    Match {
        args: Vec<Expr>,
        arms: Vec<MatchArm>,
        refutable: bool,
    },
    Subscribe {
        name: String,
    },
    /// Constructor function body; consumes the member's arity in enclosing
    /// lambda parameters.
    Construct {
        sum: Rc<Sum>,
        cons: usize,
    },
    /// Case dispatch; consumes `members + 1` enclosing lambda parameters
    /// (one handler per member, then the scrutinee).
    Destruct {
        sum: Rc<Sum>,
    },
    /// Field projection; consumes one enclosing lambda parameter.
    Get {
        sum: Rc<Sum>,
        cons: usize,
        field: usize,
    },
    /// Resolved binding group.
    DefBinding(DefBinding),
}

impl Expr {
    pub fn new(location: Location, kind: ExprKind) -> Self {
        Self {
            location,
            typ: TypeId::UNSET,
            meta: 0,
            kind,
        }
    }

    pub fn var(location: Location, name: impl Into<String>) -> Self {
        Self::new(
            location,
            ExprKind::VarRef {
                name: name.into(),
                depth: 0,
                offset: 0,
            },
        )
    }

    pub fn app(f: Expr, v: Expr) -> Self {
        let location = f.location.through(&v.location);
        Self::new(
            location,
            ExprKind::App {
                f: Box::new(f),
                v: Box::new(v),
            },
        )
    }

    pub fn lambda(location: Location, name: impl Into<String>, body: Expr) -> Self {
        Self::new(
            location,
            ExprKind::Lambda {
                name: name.into(),
                body: Box::new(body),
                fnname: String::new(),
            },
        )
    }

    pub fn literal(location: Location, value: Literal) -> Self {
        Self::new(location, ExprKind::Literal { value })
    }

    /// Apply `f` to all of `args` left to right.
    pub fn apply_all(f: Expr, args: impl IntoIterator<Item = Expr>) -> Expr {
        args.into_iter().fold(f, Expr::app)
    }

    /// One-line structural summary, used by `--stop-after-parse`.
    pub fn summarize(&self) -> String {
        match &self.kind {
            ExprKind::VarRef { name, .. } => format!("var {}", name),
            ExprKind::App { .. } => "app".to_string(),
            ExprKind::Lambda { name, .. } => format!("\\{}", name),
            ExprKind::Literal { value } => value.to_string(),
            ExprKind::Prim { name, .. } => format!("prim {:?}", name),
            ExprKind::DefMap { map, .. } => format!("defmap[{}]", map.defs.len()),
            ExprKind::Top { files, .. } => format!("top[{}]", files.len()),
            ExprKind::Match { arms, .. } => format!("match[{}]", arms.len()),
            ExprKind::Subscribe { name } => format!("subscribe {}", name),
            ExprKind::Construct { sum, cons } => {
                format!("construct {}", sum.members[*cons].ast.name)
            }
            ExprKind::Destruct { sum } => format!("destruct {}", sum.name),
            ExprKind::Get { sum, cons, field } => {
                format!("get {}.{}.{}", sum.name, sum.members[*cons].ast.name, field)
            }
            ExprKind::DefBinding(b) => format!("binding[{}+{}]", b.val.len(), b.fun.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn here() -> Location {
        Location::synthetic("t.kiln")
    }

    #[test]
    fn literal_equality_by_bits() {
        assert_eq!(Literal::Double(1.5), Literal::Double(1.5));
        assert_ne!(Literal::Double(0.0), Literal::Double(-0.0));
        assert_eq!(Literal::Integer(3), Literal::Integer(3));
        assert_ne!(Literal::Integer(3), Literal::Double(3.0));
    }

    #[test]
    fn pattern_classification() {
        assert!(Ast::new(here(), "Cons").is_constructor());
        assert!(Ast::new(here(), "x").is_variable());
        assert!(Ast::new(here(), "_").is_wildcard());
        assert!(!Ast::literal(here(), Literal::Integer(1)).is_variable());
    }

    #[test]
    fn render_nested_pattern() {
        let p = Ast::with_args(
            here(),
            "Cons",
            vec![
                Ast::new(here(), "_"),
                Ast::with_args(here(), "Cons", vec![Ast::new(here(), "_"), Ast::new(here(), "_")]),
            ],
        );
        assert_eq!(p.render(), "Cons _ (Cons _ _)");
    }

    #[test]
    fn apply_all_folds_left() {
        let e = Expr::apply_all(
            Expr::var(here(), "f"),
            vec![Expr::var(here(), "a"), Expr::var(here(), "b")],
        );
        match e.kind {
            ExprKind::App { f, .. } => match f.kind {
                ExprKind::App { .. } => {}
                other => panic!("expected inner app, got {:?}", other),
            },
            other => panic!("expected app, got {:?}", other),
        }
    }
}
