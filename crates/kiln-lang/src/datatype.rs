//! Algebraic datatypes: sums and constructors.
//!
//! `data` declarations across all files collect into a [`SumRegistry`].
//! A handful of sums are distinguished: the pattern compiler needs
//! `Boolean` and `Order`, publish/subscribe needs `List`, and the job
//! primitives traffic in `Unit`, `Pair`, `Result`, and `JValue`. Their
//! shapes are validated once after the prelude parses.

use crate::ast::Ast;
use crate::diagnostics::Diagnostics;
use crate::location::Location;
use std::collections::HashMap;
use std::rc::Rc;

/// One member of a sum.
#[derive(Debug, Clone)]
pub struct Constructor {
    /// `ast.name` is the constructor name; `ast.args` its argument types.
    pub ast: Ast,
    /// Position within the owning sum.
    pub index: usize,
}

impl Constructor {
    pub fn arity(&self) -> usize {
        self.ast.args.len()
    }
}

/// An algebraic datatype.
#[derive(Debug, Clone)]
pub struct Sum {
    pub name: String,
    pub location: Location,
    /// Type parameter names, e.g. `["a"]` for `List a`.
    pub args: Vec<String>,
    pub members: Vec<Constructor>,
}

impl Sum {
    /// Index of a member by constructor name.
    pub fn member(&self, name: &str) -> Option<usize> {
        self.members.iter().position(|m| m.ast.name == name)
    }
}

/// A parsed `data` declaration, before sums are built.
#[derive(Debug, Clone)]
pub struct DataDecl {
    pub location: Location,
    /// `name.name` is the sum name; `name.args` the type parameters.
    pub name: Ast,
    pub ctors: Vec<Ast>,
}

/// All sums known to a program, plus the distinguished handles.
#[derive(Debug, Default)]
pub struct SumRegistry {
    by_name: HashMap<String, Rc<Sum>>,
    by_ctor: HashMap<String, (Rc<Sum>, usize)>,
    pub boolean: Option<Rc<Sum>>,
    pub order: Option<Rc<Sum>>,
    pub list: Option<Rc<Sum>>,
    pub unit: Option<Rc<Sum>>,
    pub pair: Option<Rc<Sum>>,
    pub result: Option<Rc<Sum>>,
    pub jvalue: Option<Rc<Sum>>,
}

impl SumRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<&Rc<Sum>> {
        self.by_name.get(name)
    }

    pub fn lookup_ctor(&self, name: &str) -> Option<&(Rc<Sum>, usize)> {
        self.by_ctor.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<Sum>> {
        self.by_name.values()
    }

    /// Convert a declaration into a registered sum; duplicate sum or
    /// constructor names are diagnosed and the duplicate dropped.
    pub fn define(&mut self, decl: &DataDecl, diags: &mut Diagnostics) {
        if let Some(prior) = self.by_name.get(&decl.name.name) {
            diags.error(
                decl.location.clone(),
                format!(
                    "duplicate definition of data type {}; previously defined at {}",
                    decl.name.name, prior.location
                ),
            );
            return;
        }
        let mut members = Vec::with_capacity(decl.ctors.len());
        for (index, ctor) in decl.ctors.iter().enumerate() {
            if !ctor.is_constructor() {
                diags.error(
                    ctor.location.clone(),
                    format!("constructor '{}' must start with an upper-case letter", ctor.name),
                );
            }
            members.push(Constructor {
                ast: ctor.clone(),
                index,
            });
        }
        let args = decl.name.args.iter().map(|a| a.name.clone()).collect();
        let sum = Rc::new(Sum {
            name: decl.name.name.clone(),
            location: decl.location.clone(),
            args,
            members,
        });
        for m in &sum.members {
            if let Some((other, _)) = self.by_ctor.get(&m.ast.name) {
                diags.error(
                    m.ast.location.clone(),
                    format!(
                        "duplicate constructor {}; previously defined by data type {}",
                        m.ast.name, other.name
                    ),
                );
                continue;
            }
            self.by_ctor
                .insert(m.ast.name.clone(), (sum.clone(), m.index));
        }
        self.record_special(&sum);
        self.by_name.insert(sum.name.clone(), sum);
    }

    fn record_special(&mut self, sum: &Rc<Sum>) {
        match sum.name.as_str() {
            "Boolean" => self.boolean = Some(sum.clone()),
            "Order" => self.order = Some(sum.clone()),
            "List" => self.list = Some(sum.clone()),
            "Unit" => self.unit = Some(sum.clone()),
            "Pair" => self.pair = Some(sum.clone()),
            "Result" => self.result = Some(sum.clone()),
            "JValue" => self.jvalue = Some(sum.clone()),
            _ => {}
        }
    }

    /// Validate the shapes of the distinguished sums after the prelude is
    /// in. Missing or malformed ones are fatal to the pipeline.
    pub fn check_special(&self, diags: &mut Diagnostics) {
        let mut check = |handle: &Option<Rc<Sum>>, name: &str, arities: &[usize]| {
            match handle {
                None => {
                    diags.error(
                        Location::synthetic("<prelude>"),
                        format!("required data type {} is not defined", name),
                    );
                }
                Some(sum) => {
                    let shape: Vec<usize> = sum.members.iter().map(|m| m.arity()).collect();
                    if shape != arities {
                        diags.error(
                            sum.location.clone(),
                            format!("special data type {} is not defined correctly", name),
                        );
                    }
                }
            }
        };
        check(&self.boolean, "Boolean", &[0, 0]);
        check(&self.order, "Order", &[0, 0, 0]);
        check(&self.list, "List", &[0, 2]);
        check(&self.unit, "Unit", &[0]);
        check(&self.pair, "Pair", &[2]);
        check(&self.result, "Result", &[1, 1]);
    }
}
