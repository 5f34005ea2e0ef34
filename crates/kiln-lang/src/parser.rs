//! Parser: token stream to surface AST.
//!
//! Produces a raw per-file [`FileSyntax`]: `data` declarations, a `DefMap`
//! of definitions and publishes, and the set of names declared `global`.
//! Parameter patterns, operator definitions, `if`, and `target` bodies are
//! desugared here; name resolution and match compilation happen later.
//!
//! Errors are collected into the shared [`Diagnostics`] sink and recovery
//! skips to the next top-level line, so a single run reports many problems.

use crate::ast::{Ast, Def, DefMap, Expr, ExprKind, Literal, MatchArm};
use crate::datatype::DataDecl;
use crate::diagnostics::Diagnostics;
use crate::lexer;
use crate::location::Location;
use crate::token::{is_constructor_name, op_precedence, Token, TokenKind};
use std::sync::Arc;

/// Parsed contents of one source file.
#[derive(Debug, Default)]
pub struct FileSyntax {
    pub file: String,
    pub datas: Vec<DataDecl>,
    pub map: DefMap,
    pub globals: Vec<String>,
}

/// Lex and parse one file.
pub fn parse_file(file: &str, text: &str, diags: &mut Diagnostics) -> FileSyntax {
    let tokens = lexer::lex(file, text, diags);
    let mut p = Parser {
        tokens,
        pos: 0,
        gensym: 0,
    };
    p.file(file, diags)
}

/// Parse a command-line expression (the build's entry body).
pub fn parse_expression(text: &str, diags: &mut Diagnostics) -> Option<Expr> {
    let tokens = lexer::lex("<command-line>", text, diags);
    let mut p = Parser {
        tokens,
        pos: 0,
        gensym: 0,
    };
    let e = p.expr(0, diags);
    p.eat(TokenKind::Eol);
    if !p.at(TokenKind::End) {
        let t = p.peek().clone();
        diags.error(t.location, format!("expected end of expression, found {}", t.kind));
    }
    if diags.ok() {
        e
    } else {
        None
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    gensym: u32,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek2(&self) -> &Token {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)]
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn next(&mut self) -> Token {
        let t = self.peek().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.next();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, diags: &mut Diagnostics) -> Option<Token> {
        if self.at(kind) {
            Some(self.next())
        } else {
            let t = self.peek().clone();
            diags.error(
                t.location.clone(),
                format!("expected {}, found {}", kind, t.kind),
            );
            None
        }
    }

    /// Fresh hygienic name; the embedded space cannot appear in source ids.
    fn fresh(&mut self, tag: &str) -> String {
        self.gensym += 1;
        format!(" {}{}", tag, self.gensym)
    }

    /// Skip to the start of the next top-level statement after an error.
    fn recover(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.peek().kind {
                TokenKind::End => return,
                TokenKind::Indent => {
                    depth += 1;
                    self.next();
                }
                TokenKind::Dedent => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                    self.next();
                }
                TokenKind::Eol if depth == 0 => {
                    self.next();
                    if !matches!(self.peek().kind, TokenKind::Indent) {
                        return;
                    }
                }
                _ => {
                    self.next();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Top level
    // ------------------------------------------------------------------

    fn file(&mut self, file: &str, diags: &mut Diagnostics) -> FileSyntax {
        let mut out = FileSyntax {
            file: file.to_string(),
            ..Default::default()
        };
        loop {
            match self.peek().kind {
                TokenKind::End => break,
                TokenKind::Eol => {
                    self.next();
                }
                TokenKind::Data => {
                    if let Some(d) = self.data_decl(diags) {
                        out.datas.push(d);
                    } else {
                        self.recover();
                    }
                }
                TokenKind::Global | TokenKind::Def | TokenKind::Target => {
                    let global = self.eat(TokenKind::Global);
                    let before = diags.error_count();
                    if let Some(def) = self.def_stmt(diags) {
                        if global {
                            out.globals.push(def.name.clone());
                        }
                        out.map.defs.push(def);
                    } else if diags.error_count() > before {
                        self.recover();
                    }
                }
                TokenKind::Publish => {
                    if let Some(def) = self.publish_stmt(diags) {
                        out.map.pubs.push(def);
                    } else {
                        self.recover();
                    }
                }
                _ => {
                    let t = self.peek().clone();
                    diags.error(
                        t.location,
                        format!("expected a definition, found {}", t.kind),
                    );
                    self.recover();
                }
            }
        }
        out
    }

    fn data_decl(&mut self, diags: &mut Diagnostics) -> Option<DataDecl> {
        let kw = self.expect(TokenKind::Data, diags)?;
        let head = self.expect(TokenKind::Id, diags)?;
        if !is_constructor_name(&head.text) {
            diags.error(
                head.location.clone(),
                format!("data type name '{}' must start upper-case", head.text),
            );
        }
        let mut params = Vec::new();
        while self.at(TokenKind::Id) {
            let p = self.next();
            if is_constructor_name(&p.text) {
                diags.error(
                    p.location.clone(),
                    format!("type parameter '{}' must start lower-case", p.text),
                );
            }
            params.push(Ast::new(p.location, p.text));
        }
        let name = Ast::with_args(kw.location.through(&head.location), head.text, params);
        self.expect(TokenKind::Equals, diags)?;

        let mut ctors = Vec::new();
        if self.eat(TokenKind::Eol) {
            // Block form: one constructor per line.
            self.expect(TokenKind::Indent, diags)?;
            while !self.at(TokenKind::Dedent) && !self.at(TokenKind::End) {
                if self.eat(TokenKind::Eol) {
                    continue;
                }
                ctors.push(self.ctor_decl(diags)?);
                self.eat(TokenKind::Eol);
            }
            self.expect(TokenKind::Dedent, diags)?;
        } else {
            ctors.push(self.ctor_decl(diags)?);
            while self.at(TokenKind::Op) && self.peek().text == "|" {
                self.next();
                ctors.push(self.ctor_decl(diags)?);
            }
            self.eat(TokenKind::Eol);
        }
        Some(DataDecl {
            location: name.location.clone(),
            name,
            ctors,
        })
    }

    fn ctor_decl(&mut self, diags: &mut Diagnostics) -> Option<Ast> {
        let head = self.expect(TokenKind::Id, diags)?;
        if !is_constructor_name(&head.text) {
            diags.error(
                head.location.clone(),
                format!("constructor '{}' must start upper-case", head.text),
            );
        }
        let mut args = Vec::new();
        while self.at(TokenKind::Id) || self.at(TokenKind::POpen) {
            args.push(self.type_atom(diags)?);
        }
        Some(Ast::with_args(head.location, head.text, args))
    }

    fn type_atom(&mut self, diags: &mut Diagnostics) -> Option<Ast> {
        if self.eat(TokenKind::POpen) {
            let t = self.type_apply(diags)?;
            self.expect(TokenKind::PClose, diags)?;
            Some(t)
        } else {
            let t = self.expect(TokenKind::Id, diags)?;
            Some(Ast::new(t.location, t.text))
        }
    }

    fn type_apply(&mut self, diags: &mut Diagnostics) -> Option<Ast> {
        let head = self.expect(TokenKind::Id, diags)?;
        let mut args = Vec::new();
        while self.at(TokenKind::Id) || self.at(TokenKind::POpen) {
            args.push(self.type_atom(diags)?);
        }
        Some(Ast::with_args(head.location, head.text, args))
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    fn def_stmt(&mut self, diags: &mut Diagnostics) -> Option<Def> {
        let is_target = self.at(TokenKind::Target);
        let kw = self.next(); // Def or Target
        debug_assert!(matches!(kw.kind, TokenKind::Def | TokenKind::Target));

        // Gather lhs items up to '='.
        enum LhsItem {
            Pat(Ast),
            Op(Token),
        }
        let mut items = Vec::new();
        while !self.at(TokenKind::Equals) && !self.at(TokenKind::Eol) && !self.at(TokenKind::End) {
            if self.at(TokenKind::Op) {
                items.push(LhsItem::Op(self.next()));
            } else {
                items.push(LhsItem::Pat(self.pattern_atom(diags)?));
            }
        }
        self.expect(TokenKind::Equals, diags)?;

        // Classify the lhs shape: infix operator definition or named
        // definition with parameter patterns.
        let infix = matches!(
            items.as_slice(),
            [LhsItem::Pat(_), LhsItem::Op(_), LhsItem::Pat(_)]
        );
        let (name, name_loc, params): (String, Location, Vec<Ast>) = if infix {
            let mut it = items.into_iter();
            let (Some(LhsItem::Pat(a)), Some(LhsItem::Op(op)), Some(LhsItem::Pat(b))) =
                (it.next(), it.next(), it.next())
            else {
                unreachable!("shape checked above")
            };
            (format!("binary {}", op.text), op.location, vec![a, b])
        } else {
            let mut it = items.into_iter();
            match it.next() {
                Some(LhsItem::Pat(head)) if head.is_variable() => {
                    let mut params = Vec::new();
                    for item in it {
                        match item {
                            LhsItem::Pat(p) => params.push(p),
                            LhsItem::Op(op) => {
                                diags.error(
                                    op.location,
                                    "operator not allowed among definition parameters",
                                );
                                return None;
                            }
                        }
                    }
                    (head.name.clone(), head.location, params)
                }
                Some(LhsItem::Pat(head)) => {
                    diags.error(
                        head.location.clone(),
                        format!(
                            "definition name '{}' must start lower-case (constructors come from data)",
                            head.name
                        ),
                    );
                    return None;
                }
                _ => {
                    diags.error(kw.location.clone(), "malformed definition left-hand side");
                    return None;
                }
            }
        };

        let body = self.def_body(diags)?;
        let body = if is_target {
            self.desugar_target(&name, name_loc.clone(), params, body)
        } else {
            self.wrap_params(params, body)
        };
        Some(Def {
            name,
            location: name_loc,
            body,
        })
    }

    fn publish_stmt(&mut self, diags: &mut Diagnostics) -> Option<Def> {
        self.expect(TokenKind::Publish, diags)?;
        let name = self.expect(TokenKind::Id, diags)?;
        if is_constructor_name(&name.text) {
            diags.error(
                name.location.clone(),
                format!("publish name '{}' must start lower-case", name.text),
            );
        }
        self.expect(TokenKind::Equals, diags)?;
        let body = self.def_body(diags)?;
        Some(Def {
            name: name.text,
            location: name.location,
            body,
        })
    }

    /// A definition body: inline expression, or an indented block of local
    /// definitions followed by a final expression.
    fn def_body(&mut self, diags: &mut Diagnostics) -> Option<Expr> {
        if self.at(TokenKind::Eol) && self.peek2().kind == TokenKind::Indent {
            self.next(); // Eol
            self.next(); // Indent
            let mut map = DefMap::default();
            let mut body = None;
            while !self.at(TokenKind::Dedent) && !self.at(TokenKind::End) {
                match self.peek().kind {
                    TokenKind::Eol => {
                        self.next();
                    }
                    TokenKind::Def | TokenKind::Target | TokenKind::Global => {
                        // 'global' is meaningless inside a block.
                        if self.eat(TokenKind::Global) {
                            diags.error(
                                self.peek().location.clone(),
                                "'global' is only allowed at the top level",
                            );
                        }
                        map.defs.push(self.def_stmt(diags)?);
                    }
                    TokenKind::Publish => {
                        map.pubs.push(self.publish_stmt(diags)?);
                    }
                    _ => {
                        if body.is_some() {
                            let t = self.peek().clone();
                            diags.error(
                                t.location,
                                "block already has a result expression; expected a definition",
                            );
                            self.recover();
                        } else {
                            body = self.expr(0, diags);
                            self.eat(TokenKind::Eol);
                        }
                    }
                }
            }
            self.expect(TokenKind::Dedent, diags)?;
            let body = match body {
                Some(b) => b,
                None => {
                    diags.error(
                        self.peek().location.clone(),
                        "block is missing a result expression",
                    );
                    return None;
                }
            };
            if map.defs.is_empty() && map.pubs.is_empty() {
                Some(body)
            } else {
                let location = body.location.clone();
                Some(Expr::new(
                    location,
                    ExprKind::DefMap {
                        map,
                        body: Box::new(body),
                    },
                ))
            }
        } else {
            let e = self.expr(0, diags);
            self.eat(TokenKind::Eol);
            e
        }
    }

    /// Wrap a body in one lambda per parameter; non-variable patterns
    /// become a single refutable match over the generated arguments.
    fn wrap_params(&mut self, params: Vec<Ast>, body: Expr) -> Expr {
        if params.is_empty() {
            return body;
        }
        if params.iter().all(|p| p.is_variable() || p.is_wildcard()) {
            return params.into_iter().rev().fold(body, |acc, p| {
                Expr::lambda(p.location.clone(), p.name, acc)
            });
        }
        let names: Vec<String> = (0..params.len()).map(|_| self.fresh("a")).collect();
        let location = body.location.clone();
        let scrutinees: Vec<Expr> = names
            .iter()
            .map(|n| Expr::var(location.clone(), n.clone()))
            .collect();
        let arm = MatchArm {
            patterns: params.clone(),
            guard: None,
            body,
        };
        let matched = Expr::new(
            location.clone(),
            ExprKind::Match {
                args: scrutinees,
                arms: vec![arm],
                refutable: true,
            },
        );
        names
            .into_iter()
            .rev()
            .fold(matched, |acc, n| Expr::lambda(location.clone(), n, acc))
    }

    /// `target f a b = body` desugars to a per-definition memo table:
    /// the table is created once (a `val` of the definition) and each call
    /// keys it by the argument tuple.
    fn desugar_target(
        &mut self,
        name: &str,
        location: Location,
        params: Vec<Ast>,
        body: Expr,
    ) -> Expr {
        let table = self.fresh("tbl");
        let unit = self.fresh("u");
        let names: Vec<String> = (0..params.len()).map(|_| self.fresh("a")).collect();

        // Key: right-nested pairs over the arguments, Unit-terminated.
        let mut key = Expr::var(location.clone(), "Unit");
        for n in names.iter().rev() {
            key = Expr::apply_all(
                Expr::var(location.clone(), "Pair"),
                vec![Expr::var(location.clone(), n.clone()), key],
            );
        }

        // Rebind the surface parameter patterns over the generated names.
        let inner = self.wrap_params(params, body);
        let applied = Expr::apply_all(
            inner,
            names
                .iter()
                .map(|n| Expr::var(location.clone(), n.clone()))
                .collect::<Vec<_>>(),
        );
        let thunk = Expr::lambda(location.clone(), unit, applied);

        let get = Expr::apply_all(
            Expr::var(location.clone(), "tget"),
            vec![Expr::var(location.clone(), table.clone()), key, thunk],
        );
        let lambdas = names
            .into_iter()
            .rev()
            .fold(get, |acc, n| Expr::lambda(location.clone(), n, acc));

        // def f = (\tbl lambdas...) (tnew "f")
        let tnew = Expr::app(
            Expr::var(location.clone(), "tnew"),
            Expr::literal(location.clone(), Literal::Str(Arc::from(name))),
        );
        Expr::app(Expr::lambda(location, table, lambdas), tnew)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn starts_atom(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Id
                | TokenKind::Integer
                | TokenKind::Double
                | TokenKind::Str
                | TokenKind::POpen
                | TokenKind::Prim
                | TokenKind::Subscribe
        )
    }

    fn expr(&mut self, min_prec: u8, diags: &mut Diagnostics) -> Option<Expr> {
        match self.peek().kind {
            TokenKind::If => return self.if_expr(diags),
            TokenKind::Lambda => return self.lambda_expr(diags),
            TokenKind::Match => return self.match_expr(diags),
            _ => {}
        }
        let mut lhs = self.app_chain(diags)?;
        while self.at(TokenKind::Op) {
            let (prec, right) = op_precedence(&self.peek().text);
            if prec < min_prec {
                break;
            }
            let op = self.next();
            let next_min = if right { prec } else { prec + 1 };
            let rhs = match self.peek().kind {
                TokenKind::If => self.if_expr(diags)?,
                TokenKind::Lambda => self.lambda_expr(diags)?,
                TokenKind::Match => self.match_expr(diags)?,
                _ => self.expr(next_min, diags)?,
            };
            let f = Expr::var(op.location.clone(), format!("binary {}", op.text));
            lhs = Expr::apply_all(f, vec![lhs, rhs]);
        }
        Some(lhs)
    }

    fn if_expr(&mut self, diags: &mut Diagnostics) -> Option<Expr> {
        let kw = self.expect(TokenKind::If, diags)?;
        let cond = self.expr(0, diags)?;
        self.expect(TokenKind::Then, diags)?;
        let then = self.expr(0, diags)?;
        self.expect(TokenKind::Else, diags)?;
        let other = self.expr(0, diags)?;
        let location = kw.location.through(&other.location);
        // if desugars to a Boolean match.
        Some(Expr::new(
            location.clone(),
            ExprKind::Match {
                args: vec![cond],
                arms: vec![
                    MatchArm {
                        patterns: vec![Ast::new(location.clone(), "True")],
                        guard: None,
                        body: then,
                    },
                    MatchArm {
                        patterns: vec![Ast::new(location, "False")],
                        guard: None,
                        body: other,
                    },
                ],
                refutable: false,
            },
        ))
    }

    fn lambda_expr(&mut self, diags: &mut Diagnostics) -> Option<Expr> {
        self.expect(TokenKind::Lambda, diags)?;
        let pat = self.pattern_atom(diags)?;
        let body = self.expr(0, diags)?;
        Some(self.wrap_params(vec![pat], body))
    }

    fn match_expr(&mut self, diags: &mut Diagnostics) -> Option<Expr> {
        let kw = self.expect(TokenKind::Match, diags)?;
        let mut args = vec![self.atom(diags)?];
        while self.starts_atom() {
            args.push(self.atom(diags)?);
        }
        let nargs = args.len();
        self.expect(TokenKind::Eol, diags)?;
        self.expect(TokenKind::Indent, diags)?;
        let mut arms = Vec::new();
        while !self.at(TokenKind::Dedent) && !self.at(TokenKind::End) {
            if self.eat(TokenKind::Eol) {
                continue;
            }
            let mut patterns = Vec::new();
            if nargs == 1 {
                patterns.push(self.pattern_apply(diags)?);
            } else {
                for _ in 0..nargs {
                    patterns.push(self.pattern_atom(diags)?);
                }
            }
            let guard = if self.eat(TokenKind::If) {
                Some(self.expr(0, diags)?)
            } else {
                None
            };
            self.expect(TokenKind::Equals, diags)?;
            let body = self.def_body(diags)?;
            arms.push(MatchArm {
                patterns,
                guard,
                body,
            });
        }
        self.expect(TokenKind::Dedent, diags)?;
        if arms.is_empty() {
            diags.error(kw.location.clone(), "match has no arms");
            return None;
        }
        Some(Expr::new(
            kw.location,
            ExprKind::Match {
                args,
                arms,
                refutable: false,
            },
        ))
    }

    fn app_chain(&mut self, diags: &mut Diagnostics) -> Option<Expr> {
        let mut e = self.atom(diags)?;
        while self.starts_atom() {
            let arg = self.atom(diags)?;
            e = Expr::app(e, arg);
        }
        Some(e)
    }

    fn atom(&mut self, diags: &mut Diagnostics) -> Option<Expr> {
        match self.peek().kind {
            TokenKind::Id => {
                let t = self.next();
                Some(Expr::var(t.location, t.text))
            }
            TokenKind::Integer => {
                let t = self.next();
                match t.text.parse::<i64>() {
                    Ok(i) => Some(Expr::literal(t.location, Literal::Integer(i))),
                    Err(_) => {
                        diags.error(t.location, "integer literal out of range");
                        None
                    }
                }
            }
            TokenKind::Double => {
                let t = self.next();
                match t.text.parse::<f64>() {
                    Ok(d) => Some(Expr::literal(t.location, Literal::Double(d))),
                    Err(_) => {
                        diags.error(t.location, "malformed double literal");
                        None
                    }
                }
            }
            TokenKind::Str => {
                let t = self.next();
                Some(Expr::literal(
                    t.location,
                    Literal::Str(Arc::from(t.text.as_str())),
                ))
            }
            TokenKind::POpen => {
                self.next();
                // Operator section: (+)
                if self.at(TokenKind::Op) && self.peek2().kind == TokenKind::PClose {
                    let op = self.next();
                    self.next(); // )
                    return Some(Expr::var(op.location.clone(), format!("binary {}", op.text)));
                }
                let e = self.expr(0, diags)?;
                self.expect(TokenKind::PClose, diags)?;
                Some(e)
            }
            TokenKind::Prim => {
                let kw = self.next();
                let name = self.expect(TokenKind::Str, diags)?;
                Some(Expr::new(
                    kw.location.through(&name.location),
                    ExprKind::Prim {
                        name: name.text,
                        args: 0,
                        pflags: 0,
                    },
                ))
            }
            TokenKind::Subscribe => {
                let kw = self.next();
                let name = self.expect(TokenKind::Id, diags)?;
                Some(Expr::new(
                    kw.location.through(&name.location),
                    ExprKind::Subscribe { name: name.text },
                ))
            }
            _ => {
                let t = self.peek().clone();
                diags.error(
                    t.location,
                    format!("expected an expression, found {}", t.kind),
                );
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Patterns
    // ------------------------------------------------------------------

    fn pattern_atom(&mut self, diags: &mut Diagnostics) -> Option<Ast> {
        match self.peek().kind {
            TokenKind::Id => {
                let t = self.next();
                Some(Ast::new(t.location, t.text))
            }
            TokenKind::Integer => {
                let t = self.next();
                match t.text.parse::<i64>() {
                    Ok(i) => Some(Ast::literal(t.location, Literal::Integer(i))),
                    Err(_) => {
                        diags.error(t.location, "integer literal out of range");
                        None
                    }
                }
            }
            TokenKind::Double => {
                let t = self.next();
                let d = t.text.parse::<f64>().unwrap_or(0.0);
                Some(Ast::literal(t.location, Literal::Double(d)))
            }
            TokenKind::Str => {
                let t = self.next();
                Some(Ast::literal(
                    t.location,
                    Literal::Str(Arc::from(t.text.as_str())),
                ))
            }
            TokenKind::POpen => {
                self.next();
                let p = self.pattern_apply(diags)?;
                self.expect(TokenKind::PClose, diags)?;
                Some(p)
            }
            _ => {
                let t = self.peek().clone();
                diags.error(t.location, format!("expected a pattern, found {}", t.kind));
                None
            }
        }
    }

    fn pattern_apply(&mut self, diags: &mut Diagnostics) -> Option<Ast> {
        let head = self.pattern_atom(diags)?;
        if head.is_constructor() {
            let mut args = Vec::new();
            while matches!(
                self.peek().kind,
                TokenKind::Id
                    | TokenKind::Integer
                    | TokenKind::Double
                    | TokenKind::Str
                    | TokenKind::POpen
            ) {
                args.push(self.pattern_atom(diags)?);
            }
            let location = head.location.clone();
            Some(Ast::with_args(location, head.name, args))
        } else {
            Some(head)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse_ok(text: &str) -> FileSyntax {
        let mut diags = Diagnostics::new();
        let f = parse_file("t.kiln", text, &mut diags);
        let msgs: Vec<String> = diags.iter().map(|d| d.to_string()).collect();
        assert!(diags.ok(), "unexpected errors: {:?}", msgs);
        f
    }

    #[test]
    fn simple_defs() {
        let f = parse_ok("def x = 1\ndef y = x\n");
        assert_eq!(f.map.defs.len(), 2);
        assert_eq!(f.map.defs[0].name, "x");
    }

    #[test]
    fn function_def_wraps_lambdas() {
        let f = parse_ok("def add x y = x + y\n");
        let body = &f.map.defs[0].body;
        match &body.kind {
            ExprKind::Lambda { name, body, .. } => {
                assert_eq!(name, "x");
                assert!(matches!(body.kind, ExprKind::Lambda { .. }));
            }
            other => panic!("expected lambda, got {:?}", other),
        }
    }

    #[test]
    fn operator_definition() {
        let f = parse_ok("def a ++ b = a\n");
        assert_eq!(f.map.defs[0].name, "binary ++");
    }

    #[test]
    fn global_marks_name() {
        let f = parse_ok("global def x = 1\n");
        assert_eq!(f.globals, vec!["x".to_string()]);
    }

    #[test]
    fn data_inline_and_block() {
        let f = parse_ok("data Boolean = True | False\ndata Order =\n    LT\n    EQ\n    GT\n");
        assert_eq!(f.datas.len(), 2);
        assert_eq!(f.datas[0].ctors.len(), 2);
        assert_eq!(f.datas[1].ctors.len(), 3);
    }

    #[test]
    fn data_with_parameters() {
        let f = parse_ok("data List a = Nil | Cons a (List a)\n");
        let d = &f.datas[0];
        assert_eq!(d.name.args.len(), 1);
        assert_eq!(d.ctors[1].args.len(), 2);
        assert_eq!(d.ctors[1].args[1].name, "List");
    }

    #[test]
    fn match_with_guard() {
        let f = parse_ok("def f x = match x\n    Cons h t if h = 1\n    _ = 0\n");
        let ExprKind::Lambda { body, .. } = &f.map.defs[0].body.kind else {
            panic!("expected lambda");
        };
        let ExprKind::Match { arms, .. } = &body.kind else {
            panic!("expected match, got {:?}", body.summarize());
        };
        assert_eq!(arms.len(), 2);
        assert!(arms[0].guard.is_some());
        assert_eq!(arms[0].patterns[0].args.len(), 2);
    }

    #[test]
    fn precedence_mul_over_add() {
        let f = parse_ok("def x = 1 + 2 * 3\n");
        // (binary +) 1 ((binary *) 2 3)
        let ExprKind::App { f: outer, v } = &f.map.defs[0].body.kind else {
            panic!("expected app");
        };
        let ExprKind::App { f: plus, .. } = &outer.kind else {
            panic!("expected inner app");
        };
        match &plus.kind {
            ExprKind::VarRef { name, .. } => assert_eq!(name, "binary +"),
            other => panic!("expected varref, got {:?}", other),
        }
        assert!(matches!(v.kind, ExprKind::App { .. }));
    }

    #[test]
    fn block_body_builds_defmap() {
        let f = parse_ok("def x =\n    def y = 1\n    y + 1\n");
        match &f.map.defs[0].body.kind {
            ExprKind::DefMap { map, .. } => assert_eq!(map.defs.len(), 1),
            other => panic!("expected defmap, got {:?}", other),
        }
    }

    #[test]
    fn publish_and_subscribe() {
        let f = parse_ok("publish path = \"x\"\ndef p = subscribe path\n");
        assert_eq!(f.map.pubs.len(), 1);
        match &f.map.defs[0].body.kind {
            ExprKind::Subscribe { name } => assert_eq!(name, "path"),
            other => panic!("expected subscribe, got {:?}", other),
        }
    }

    #[test]
    fn target_desugars_to_table() {
        let f = parse_ok("target fib n = n\n");
        // Outermost must be the application binding the table.
        assert!(matches!(f.map.defs[0].body.kind, ExprKind::App { .. }));
    }

    #[test]
    fn if_desugars_to_match() {
        let f = parse_ok("def x = if y then 1 else 2\n");
        match &f.map.defs[0].body.kind {
            ExprKind::Match { arms, refutable, .. } => {
                assert_eq!(arms.len(), 2);
                assert!(!refutable);
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn error_recovery_continues() {
        let mut diags = Diagnostics::new();
        let f = parse_file("t.kiln", "def = 1\ndef ok = 2\n", &mut diags);
        assert!(!diags.ok());
        assert_eq!(f.map.defs.len(), 1);
        assert_eq!(f.map.defs[0].name, "ok");
    }

    #[test]
    fn command_line_expression() {
        let mut diags = Diagnostics::new();
        let e = parse_expression("build 5", &mut diags).unwrap();
        assert!(matches!(e.kind, ExprKind::App { .. }));
    }
}
