//! kiln-lang: the language frontend.
//!
//! Lexing, parsing, datatypes, name resolution (with SCC stratification
//! and pattern compilation), and Hindley–Milner type inference. This
//! crate has no database or process dependencies; the SSA lowering and
//! the runtime build on the resolved tree it produces.
//!
//! Pipeline:
//!
//! ```text
//! source text -> lexer -> parser -> FileSyntax
//!                                       |
//!                  SumRegistry <- data declarations
//!                                       |
//!            resolve_program -> resolved Expr (DefBinding core)
//!                                       |
//!                  infer_program -> typed Expr
//! ```

pub mod ast;
pub mod datatype;
pub mod diagnostics;
pub mod infer;
pub mod lexer;
pub mod location;
pub mod parser;
pub mod pattern;
pub mod prim;
pub mod resolver;
pub mod token;
pub mod types;

pub use ast::{Ast, Def, DefBinding, DefMap, Expr, ExprKind, Literal, MatchArm};
pub use datatype::{Constructor, DataDecl, Sum, SumRegistry};
pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use infer::infer_program;
pub use location::{Coord, Location};
pub use parser::{parse_expression, parse_file, FileSyntax};
pub use prim::{flags, PrimDesc, PrimInterface, PrimTyper};
pub use resolver::resolve_program;
pub use types::{TypeContext, TypeId};
