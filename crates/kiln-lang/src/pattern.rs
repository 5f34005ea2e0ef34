//! Pattern-match compilation.
//!
//! Rewrites a surface `match` into nested `Destruct` applications over
//! plain lambdas, before name resolution sees the tree. The classic
//! matrix algorithm: pick the leftmost column with a constructor,
//! re-bucket rows per member, recurse. Literal patterns desugar into
//! comparison guards (`icmp`/`dcmp`/`scmp`), guards become inner
//! `Boolean` matches, and missing cases synthesize a counterexample from
//! the prototype tree. Rows that are never reached are diagnosed.

use crate::ast::{Ast, Expr, ExprKind, Literal, MatchArm};
use crate::datatype::{Sum, SumRegistry};
use crate::diagnostics::Diagnostics;
use crate::location::Location;
use std::collections::HashSet;
use std::rc::Rc;

/// Hygienic name source shared with the resolver.
#[derive(Debug, Default)]
pub struct Gensym(u32);

impl Gensym {
    pub fn fresh(&mut self, tag: &str) -> String {
        self.0 += 1;
        format!(" {}{}", tag, self.0)
    }
}

#[derive(Clone)]
struct Row {
    patterns: Vec<Ast>,
    /// Pattern variable -> scrutinee variable, applied at the leaf.
    binds: Vec<(String, String)>,
    guard: Option<Expr>,
    body: Expr,
    id: usize,
}

struct Compiler<'a> {
    sums: &'a SumRegistry,
    gensym: &'a mut Gensym,
    diags: &'a mut Diagnostics,
    location: Location,
    used: HashSet<usize>,
    /// Missing-case witnesses, one `Ast` per current column; inner calls
    /// report relative to their own columns and `destruct_column` folds a
    /// member's field columns back into a single constructor shape.
    missing: Vec<Vec<Ast>>,
    failed: bool,
}

/// Compile one `match` into the core tree. `refutable` single-arm matches
/// (desugared definition parameters) panic at runtime instead of being
/// rejected for non-exhaustiveness.
pub fn compile_match(
    location: Location,
    args: Vec<Expr>,
    arms: Vec<MatchArm>,
    refutable: bool,
    sums: &SumRegistry,
    gensym: &mut Gensym,
    diags: &mut Diagnostics,
) -> Expr {
    let mut cc = Compiler {
        sums,
        gensym,
        diags,
        location: location.clone(),
        used: HashSet::new(),
        missing: Vec::new(),
        failed: false,
    };

    let vars: Vec<String> = (0..args.len()).map(|_| cc.gensym.fresh("m")).collect();
    let rows: Vec<Row> = arms
        .iter()
        .enumerate()
        .map(|(id, arm)| Row {
            patterns: arm.patterns.clone(),
            binds: Vec::new(),
            guard: arm.guard.clone(),
            body: arm.body.clone(),
            id,
        })
        .collect();
    let compiled = cc.compile(&vars, rows);

    for (id, arm) in arms.iter().enumerate() {
        if !cc.used.contains(&id) && !cc.failed {
            let at = arm
                .patterns
                .first()
                .map(|p| p.location.clone())
                .unwrap_or_else(|| location.clone());
            cc.diags.error(at, "unreachable pattern");
        }
    }
    if !refutable && !cc.missing.is_empty() && !cc.failed {
        let mut missing: Vec<String> = cc
            .missing
            .iter()
            .map(|shapes| {
                shapes
                    .iter()
                    .map(Ast::render)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();
        missing.sort();
        missing.dedup();
        cc.diags.error(
            location.clone(),
            format!("non-exhaustive match; missing: {}", missing.join("; ")),
        );
    }

    // Bind each scrutinee to its generated name.
    let lambdas = vars
        .into_iter()
        .rev()
        .fold(compiled, |acc, v| Expr::lambda(location.clone(), v, acc));
    Expr::apply_all(lambdas, args)
}

impl<'a> Compiler<'a> {
    fn compile(&mut self, vars: &[String], rows: Vec<Row>) -> Expr {
        if rows.is_empty() {
            let wilds = vars
                .iter()
                .map(|_| Ast::new(self.location.clone(), "_"))
                .collect();
            self.missing.push(wilds);
            return self.panic_expr();
        }

        // A leading row of pure variables matches unconditionally
        // (modulo its guard).
        let leading_irrefutable = rows[0]
            .patterns
            .iter()
            .all(|p| p.is_variable() || p.is_wildcard());
        if leading_irrefutable {
            let mut row = rows[0].clone();
            for (i, p) in row.patterns.iter().enumerate() {
                if p.is_variable() && !p.is_wildcard() {
                    row.binds.push((p.name.clone(), vars[i].to_string()));
                }
            }
            self.used.insert(row.id);
            let body = self.apply_binds(&row.binds, row.body.clone());
            return match row.guard.clone() {
                None => body,
                Some(guard) => {
                    let guard = self.apply_binds(&row.binds, guard);
                    let rest = self.compile(vars, rows[1..].to_vec());
                    self.boolean_branch(guard, body, rest)
                }
            };
        }

        // Pick the leftmost column holding a constructor or literal.
        let col = rows
            .iter()
            .flat_map(|r| r.patterns.iter().enumerate())
            .find(|(_, p)| p.is_constructor() || p.literal.is_some())
            .map(|(i, _)| i)
            .expect("some row must be refutable here");

        if rows.iter().any(|r| r.patterns[col].literal.is_some()) {
            return self.compile_literals(vars, rows, col);
        }

        // All refutable patterns in this column are constructors; they
        // must agree on one sum.
        let first = rows
            .iter()
            .map(|r| &r.patterns[col])
            .find(|p| p.is_constructor())
            .expect("column chosen for a constructor");
        let Some((sum, _)) = self.sums.lookup_ctor(&first.name).cloned() else {
            self.diags.error(
                first.location.clone(),
                format!("unknown constructor '{}'", first.name),
            );
            self.failed = true;
            return self.panic_expr();
        };
        for r in &rows {
            let p = &r.patterns[col];
            if !p.is_constructor() {
                continue;
            }
            match sum.member(&p.name) {
                None => {
                    self.diags.error(
                        p.location.clone(),
                        format!("constructor '{}' does not belong to data type {}", p.name, sum.name),
                    );
                    self.failed = true;
                    return self.panic_expr();
                }
                Some(m) => {
                    let want = sum.members[m].arity();
                    if p.args.len() != want {
                        self.diags.error(
                            p.location.clone(),
                            format!(
                                "constructor {} expects {} arguments, pattern has {}",
                                p.name,
                                want,
                                p.args.len()
                            ),
                        );
                        self.failed = true;
                        return self.panic_expr();
                    }
                }
            }
        }

        self.destruct_column(vars, rows, col, sum)
    }

    /// Build the `Destruct` over every member of `sum` at column `col`.
    fn destruct_column(
        &mut self,
        vars: &[String],
        rows: Vec<Row>,
        col: usize,
        sum: Rc<Sum>,
    ) -> Expr {
        let location = self.location.clone();
        let scrutinee = Expr::var(location.clone(), vars[col].to_string());
        let mut handlers = Vec::with_capacity(sum.members.len());

        for member in 0..sum.members.len() {
            let arity = sum.members[member].arity();
            let ctor_name = sum.members[member].ast.name.clone();
            let field_vars: Vec<String> =
                (0..arity).map(|_| self.gensym.fresh("f")).collect();

            // Rows surviving into this member's bucket.
            let mut sub_rows = Vec::new();
            for r in &rows {
                let p = &r.patterns[col];
                if p.is_constructor() {
                    if sum.member(&p.name) != Some(member) {
                        continue;
                    }
                    let mut nr = r.clone();
                    let mut pats = r.patterns.clone();
                    let expanded: Vec<Ast> = p.args.clone();
                    pats.splice(col..=col, expanded);
                    nr.patterns = pats;
                    sub_rows.push(nr);
                } else {
                    // Variable or wildcard: survives every bucket.
                    let mut nr = r.clone();
                    if p.is_variable() && !p.is_wildcard() {
                        nr.binds.push((p.name.clone(), vars[col].to_string()));
                    }
                    let mut pats = r.patterns.clone();
                    let wilds: Vec<Ast> = (0..arity)
                        .map(|_| Ast::new(p.location.clone(), "_"))
                        .collect();
                    pats.splice(col..=col, wilds);
                    nr.patterns = pats;
                    sub_rows.push(nr);
                }
            }

            let mut sub_vars: Vec<String> = vars.to_vec();
            sub_vars.splice(col..=col, field_vars.clone());

            let missing_before = self.missing.len();
            let sub = self.compile(&sub_vars, sub_rows);

            // Fold this member's field columns of any new missing-case
            // witnesses back into a single constructor shape.
            for entry in self.missing.iter_mut().skip(missing_before) {
                let fields: Vec<Ast> = entry
                    .splice(col..col + arity, std::iter::empty::<Ast>())
                    .collect();
                entry.insert(
                    col,
                    Ast::with_args(location.clone(), ctor_name.clone(), fields),
                );
            }

            // handler = \d (\f0 .. \fk-1 sub) (get0 d) ... (getk-1 d)
            let dvar = self.gensym.fresh("d");
            let mut inner = field_vars
                .iter()
                .rev()
                .fold(sub, |acc, f| Expr::lambda(location.clone(), f.clone(), acc));
            for k in 0..arity {
                let getter = Expr::lambda(
                    location.clone(),
                    self.gensym.fresh("g"),
                    Expr::new(
                        location.clone(),
                        ExprKind::Get {
                            sum: sum.clone(),
                            cons: member,
                            field: k,
                        },
                    ),
                );
                inner = Expr::app(inner, Expr::app(getter, Expr::var(location.clone(), dvar.clone())));
            }
            handlers.push(Expr::lambda(location.clone(), dvar, inner));
        }

        self.apply_destruct(sum, handlers, scrutinee)
    }

    /// `De h0 .. hM-1 scrutinee` where `De` is the lambda-wrapped Destruct.
    fn apply_destruct(&mut self, sum: Rc<Sum>, handlers: Vec<Expr>, scrutinee: Expr) -> Expr {
        let location = self.location.clone();
        let svar = self.gensym.fresh("s");
        let hvars: Vec<String> = (0..handlers.len())
            .map(|_| self.gensym.fresh("h"))
            .collect();
        let core = Expr::new(location.clone(), ExprKind::Destruct { sum });
        let mut wrapped = Expr::lambda(location.clone(), svar, core);
        for h in hvars.iter().rev() {
            wrapped = Expr::lambda(location.clone(), h.clone(), wrapped);
        }
        let mut out = wrapped;
        for h in handlers {
            out = Expr::app(out, h);
        }
        Expr::app(out, scrutinee)
    }

    /// Rewrite literal patterns in `col` into comparison guards, then
    /// retry compilation of the same matrix.
    fn compile_literals(&mut self, vars: &[String], rows: Vec<Row>, col: usize) -> Expr {
        let location = self.location.clone();
        let mut rewritten = Vec::with_capacity(rows.len());
        for r in &rows {
            let p = &r.patterns[col];
            let Some(lit) = p.literal.clone() else {
                rewritten.push(r.clone());
                continue;
            };
            let cmp = match lit {
                Literal::Integer(_) => "icmp",
                Literal::Double(_) => "dcmp",
                Literal::Str(_) => "scmp",
            };
            let call = Expr::apply_all(
                Expr::var(location.clone(), cmp),
                vec![
                    Expr::var(location.clone(), vars[col].to_string()),
                    Expr::literal(p.location.clone(), lit),
                ],
            );
            // match (cmp v lit) ( EQ = <old guard or True> ; _ = False )
            let hit = match r.guard.clone() {
                Some(g) => g,
                None => Expr::var(location.clone(), "True"),
            };
            let guard = Expr::new(
                location.clone(),
                ExprKind::Match {
                    args: vec![call],
                    arms: vec![
                        MatchArm {
                            patterns: vec![Ast::new(location.clone(), "EQ")],
                            guard: None,
                            body: hit,
                        },
                        MatchArm {
                            patterns: vec![Ast::new(location.clone(), "_")],
                            guard: None,
                            body: Expr::var(location.clone(), "False"),
                        },
                    ],
                    refutable: false,
                },
            );
            let mut nr = r.clone();
            nr.patterns[col] = Ast::new(p.location.clone(), "_");
            nr.guard = Some(guard);
            rewritten.push(nr);
        }
        // A literal column never proves exhaustiveness on its own.
        self.compile(vars, rewritten)
    }

    /// `match guard ( True = body ; False = rest )` via a Boolean destruct.
    fn boolean_branch(&mut self, guard: Expr, body: Expr, rest: Expr) -> Expr {
        let location = self.location.clone();
        let Some(boolean) = self.sums.boolean.clone() else {
            self.diags.error(
                location,
                "guards require the Boolean data type from the prelude",
            );
            self.failed = true;
            return self.panic_expr();
        };
        let t = self.gensym.fresh("d");
        let f = self.gensym.fresh("d");
        let handlers = vec![
            Expr::lambda(location.clone(), t, body),
            Expr::lambda(location.clone(), f, rest),
        ];
        self.apply_destruct(boolean, handlers, guard)
    }

    fn apply_binds(&mut self, binds: &[(String, String)], body: Expr) -> Expr {
        let location = self.location.clone();
        let mut out = body;
        for (pvar, svar) in binds.iter().rev() {
            out = Expr::app(
                Expr::lambda(location.clone(), pvar.clone(), out),
                Expr::var(location.clone(), svar.clone()),
            );
        }
        out
    }

    fn panic_expr(&mut self) -> Expr {
        let location = self.location.clone();
        Expr::app(
            Expr::var(location.clone(), "panic"),
            Expr::literal(
                location,
                Literal::Str(std::sync::Arc::from("pattern match failed")),
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::DataDecl;

    fn here() -> Location {
        Location::synthetic("t.kiln")
    }

    fn registry() -> SumRegistry {
        let mut reg = SumRegistry::new();
        let mut diags = Diagnostics::new();
        reg.define(
            &DataDecl {
                location: here(),
                name: Ast::new(here(), "Boolean"),
                ctors: vec![Ast::new(here(), "True"), Ast::new(here(), "False")],
            },
            &mut diags,
        );
        reg.define(
            &DataDecl {
                location: here(),
                name: Ast::with_args(here(), "List", vec![Ast::new(here(), "a")]),
                ctors: vec![
                    Ast::new(here(), "Nil"),
                    Ast::with_args(
                        here(),
                        "Cons",
                        vec![
                            Ast::new(here(), "a"),
                            Ast::with_args(here(), "List", vec![Ast::new(here(), "a")]),
                        ],
                    ),
                ],
            },
            &mut diags,
        );
        assert!(diags.ok());
        reg
    }

    fn arm(pattern: Ast, body: Expr) -> MatchArm {
        MatchArm {
            patterns: vec![pattern],
            guard: None,
            body,
        }
    }

    fn lit(i: i64) -> Expr {
        Expr::literal(here(), Literal::Integer(i))
    }

    #[test]
    fn exhaustive_boolean_match_compiles() {
        let reg = registry();
        let mut gs = Gensym::default();
        let mut diags = Diagnostics::new();
        let out = compile_match(
            here(),
            vec![Expr::var(here(), "x")],
            vec![
                arm(Ast::new(here(), "True"), lit(1)),
                arm(Ast::new(here(), "False"), lit(0)),
            ],
            false,
            &reg,
            &mut gs,
            &mut diags,
        );
        assert!(diags.ok(), "{:?}", diags.take());
        assert!(matches!(out.kind, ExprKind::App { .. }));
    }

    #[test]
    fn non_exhaustive_reports_counterexample() {
        let reg = registry();
        let mut gs = Gensym::default();
        let mut diags = Diagnostics::new();
        let _ = compile_match(
            here(),
            vec![Expr::var(here(), "x")],
            vec![arm(Ast::new(here(), "True"), lit(1))],
            false,
            &reg,
            &mut gs,
            &mut diags,
        );
        assert!(!diags.ok());
        let msg = diags.iter().next().unwrap().to_string();
        assert!(msg.contains("non-exhaustive match"), "{}", msg);
        assert!(msg.contains("False"), "{}", msg);
    }

    #[test]
    fn refutable_match_suppresses_exhaustiveness() {
        let reg = registry();
        let mut gs = Gensym::default();
        let mut diags = Diagnostics::new();
        let _ = compile_match(
            here(),
            vec![Expr::var(here(), "x")],
            vec![arm(
                Ast::with_args(
                    here(),
                    "Cons",
                    vec![Ast::new(here(), "h"), Ast::new(here(), "_")],
                ),
                Expr::var(here(), "h"),
            )],
            true,
            &reg,
            &mut gs,
            &mut diags,
        );
        assert!(diags.ok(), "{:?}", diags.take());
    }

    #[test]
    fn unreachable_row_reported() {
        let reg = registry();
        let mut gs = Gensym::default();
        let mut diags = Diagnostics::new();
        let _ = compile_match(
            here(),
            vec![Expr::var(here(), "x")],
            vec![
                arm(Ast::new(here(), "_"), lit(1)),
                arm(Ast::new(here(), "True"), lit(2)),
            ],
            false,
            &reg,
            &mut gs,
            &mut diags,
        );
        assert!(!diags.ok());
        let msg = diags.iter().next().unwrap().to_string();
        assert!(msg.contains("unreachable pattern"), "{}", msg);
    }

    #[test]
    fn literal_pattern_desugars_to_guard() {
        let reg = registry();
        let mut gs = Gensym::default();
        let mut diags = Diagnostics::new();
        let out = compile_match(
            here(),
            vec![Expr::var(here(), "x")],
            vec![
                MatchArm {
                    patterns: vec![Ast::literal(here(), Literal::Integer(0))],
                    guard: None,
                    body: lit(1),
                },
                arm(Ast::new(here(), "_"), lit(2)),
            ],
            false,
            &reg,
            &mut gs,
            &mut diags,
        );
        assert!(diags.ok(), "{:?}", diags.take());
        // The compiled tree must reference icmp somewhere.
        fn mentions(e: &Expr, name: &str) -> bool {
            match &e.kind {
                ExprKind::VarRef { name: n, .. } => n == name,
                ExprKind::App { f, v } => mentions(f, name) || mentions(v, name),
                ExprKind::Lambda { body, .. } => mentions(body, name),
                ExprKind::Match { args, arms, .. } => {
                    args.iter().any(|a| mentions(a, name))
                        || arms.iter().any(|a| {
                            mentions(&a.body, name)
                                || a.guard.as_ref().map(|g| mentions(g, name)).unwrap_or(false)
                        })
                }
                _ => false,
            }
        }
        assert!(mentions(&out, "icmp"));
    }

    #[test]
    fn used_bindings_flow_into_body() {
        let reg = registry();
        let mut gs = Gensym::default();
        let mut diags = Diagnostics::new();
        let out = compile_match(
            here(),
            vec![Expr::var(here(), "x")],
            vec![
                arm(
                    Ast::with_args(
                        here(),
                        "Cons",
                        vec![Ast::new(here(), "h"), Ast::new(here(), "t")],
                    ),
                    Expr::var(here(), "h"),
                ),
                arm(Ast::new(here(), "Nil"), lit(0)),
            ],
            false,
            &reg,
            &mut gs,
            &mut diags,
        );
        assert!(diags.ok(), "{:?}", diags.take());
        assert!(matches!(out.kind, ExprKind::App { .. }));
    }
}
