//! Type variables and unification.
//!
//! Types are union-find nodes in a [`TypeContext`] arena. A node is either
//! a free variable (empty name) or a constructor application (`Integer`,
//! `List a`, `a => b`). Every node carries a date-of-birth stamp; union
//! keeps the *oldest* dob, which is what makes let-generalization sound
//! across recursive groups: a variable that escapes into an older scope
//! inherits that scope's dob and is never generalized.

use std::collections::HashMap;
use std::fmt::Write as _;

/// Handle into a [`TypeContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

impl TypeId {
    pub const UNSET: TypeId = TypeId(u32::MAX);

    pub fn is_set(self) -> bool {
        self != Self::UNSET
    }
}

/// Name of the function-arrow type constructor.
pub const FN: &str = "=>";

#[derive(Debug)]
struct TypeVar {
    /// Union-find parent; self-index when this node is a root.
    parent: u32,
    /// Constructor name; empty string marks a free variable.
    name: String,
    children: Vec<TypeId>,
    dob: u64,
}

/// Reported unification conflict: the two irreconcilable sub-terms.
#[derive(Debug, Clone)]
pub struct TypeConflict {
    pub left: TypeId,
    pub right: TypeId,
}

#[derive(Debug, Default)]
pub struct TypeContext {
    vars: Vec<TypeVar>,
    clock: u64,
}

impl TypeContext {
    pub fn new() -> Self {
        Self {
            vars: Vec::new(),
            clock: 1,
        }
    }

    /// Current clock value; new variables are born at this time.
    pub fn now(&self) -> u64 {
        self.clock
    }

    /// Advance the clock. Called when entering a binding group so that
    /// variables created while inferring it are distinguishably younger.
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// A fresh free variable born now.
    pub fn fresh(&mut self) -> TypeId {
        self.alloc(String::new(), Vec::new())
    }

    /// A constructed type.
    pub fn ctor(&mut self, name: impl Into<String>, children: Vec<TypeId>) -> TypeId {
        self.alloc(name.into(), children)
    }

    pub fn arrow(&mut self, arg: TypeId, ret: TypeId) -> TypeId {
        self.ctor(FN, vec![arg, ret])
    }

    pub fn integer(&mut self) -> TypeId {
        self.ctor("Integer", Vec::new())
    }

    pub fn double(&mut self) -> TypeId {
        self.ctor("Double", Vec::new())
    }

    pub fn string(&mut self) -> TypeId {
        self.ctor("String", Vec::new())
    }

    fn alloc(&mut self, name: String, children: Vec<TypeId>) -> TypeId {
        let id = self.vars.len() as u32;
        self.vars.push(TypeVar {
            parent: id,
            name,
            children,
            dob: self.clock,
        });
        TypeId(id)
    }

    /// Union-find root with path compression.
    pub fn find(&mut self, t: TypeId) -> TypeId {
        let mut root = t.0;
        while self.vars[root as usize].parent != root {
            root = self.vars[root as usize].parent;
        }
        let mut walk = t.0;
        while self.vars[walk as usize].parent != walk {
            let next = self.vars[walk as usize].parent;
            self.vars[walk as usize].parent = root;
            walk = next;
        }
        TypeId(root)
    }

    pub fn is_free(&mut self, t: TypeId) -> bool {
        let r = self.find(t);
        self.vars[r.0 as usize].name.is_empty()
    }

    /// Does free root `var` occur inside `t`?
    fn occurs(&mut self, var: TypeId, t: TypeId) -> bool {
        let r = self.find(t);
        if r == var {
            return true;
        }
        let children = self.vars[r.0 as usize].children.clone();
        children.into_iter().any(|c| self.occurs(var, c))
    }

    /// Unify two types; on conflict returns the two sub-terms that clash.
    pub fn unify(&mut self, a: TypeId, b: TypeId) -> Result<(), TypeConflict> {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return Ok(());
        }
        let a_free = self.vars[ra.0 as usize].name.is_empty();
        let b_free = self.vars[rb.0 as usize].name.is_empty();
        match (a_free, b_free) {
            (true, _) => {
                if !b_free && self.occurs(ra, rb) {
                    return Err(TypeConflict { left: ra, right: rb });
                }
                self.point(ra, rb);
                Ok(())
            }
            (false, true) => {
                if self.occurs(rb, ra) {
                    return Err(TypeConflict { left: ra, right: rb });
                }
                self.point(rb, ra);
                Ok(())
            }
            (false, false) => {
                let (na, ca) = {
                    let v = &self.vars[ra.0 as usize];
                    (v.name.clone(), v.children.clone())
                };
                let (nb, cb) = {
                    let v = &self.vars[rb.0 as usize];
                    (v.name.clone(), v.children.clone())
                };
                if na != nb || ca.len() != cb.len() {
                    return Err(TypeConflict { left: ra, right: rb });
                }
                self.point(ra, rb);
                for (x, y) in ca.into_iter().zip(cb) {
                    self.unify(x, y)?;
                }
                Ok(())
            }
        }
    }

    /// Make `child` point at `root`, keeping the oldest dob on the root.
    fn point(&mut self, child: TypeId, root: TypeId) {
        let child_dob = self.vars[child.0 as usize].dob;
        let root_dob = self.vars[root.0 as usize].dob;
        self.vars[root.0 as usize].dob = root_dob.min(child_dob);
        self.vars[child.0 as usize].parent = root.0;
    }

    /// Clone `t`, replacing free variables born after `threshold` with
    /// fresh ones (standard instantiation of a generalized type).
    pub fn instantiate(&mut self, t: TypeId, threshold: u64) -> TypeId {
        let mut map = HashMap::new();
        self.instantiate_inner(t, threshold, &mut map)
    }

    fn instantiate_inner(
        &mut self,
        t: TypeId,
        threshold: u64,
        map: &mut HashMap<TypeId, TypeId>,
    ) -> TypeId {
        let r = self.find(t);
        if let Some(copy) = map.get(&r) {
            return *copy;
        }
        let (name, children, dob) = {
            let v = &self.vars[r.0 as usize];
            (v.name.clone(), v.children.clone(), v.dob)
        };
        if name.is_empty() {
            if dob > threshold {
                let fresh = self.fresh();
                map.insert(r, fresh);
                fresh
            } else {
                r
            }
        } else {
            let kids: Vec<TypeId> = children
                .into_iter()
                .map(|c| self.instantiate_inner(c, threshold, map))
                .collect();
            // Share the original node when nothing underneath changed.
            if kids.iter().zip(&self.vars[r.0 as usize].children).all(|(a, b)| *a == *b) {
                r
            } else {
                let copy = self.ctor(name, kids);
                map.insert(r, copy);
                copy
            }
        }
    }

    /// Render a type with canonical free-variable names (`a`, `b`, ...).
    /// A shared `names` map keeps both sides of an error consistent.
    pub fn format_with(&mut self, t: TypeId, names: &mut HashMap<TypeId, String>) -> String {
        let mut out = String::new();
        self.fmt_inner(t, names, false, &mut out);
        out
    }

    pub fn format(&mut self, t: TypeId) -> String {
        let mut names = HashMap::new();
        self.format_with(t, &mut names)
    }

    fn fmt_inner(
        &mut self,
        t: TypeId,
        names: &mut HashMap<TypeId, String>,
        nested: bool,
        out: &mut String,
    ) {
        let r = self.find(t);
        let (name, children) = {
            let v = &self.vars[r.0 as usize];
            (v.name.clone(), v.children.clone())
        };
        if name.is_empty() {
            let next = names.len();
            let label = names.entry(r).or_insert_with(|| {
                // a, b, ..., z, t26, t27, ...
                if next < 26 {
                    ((b'a' + next as u8) as char).to_string()
                } else {
                    format!("t{}", next)
                }
            });
            out.push_str(label);
        } else if name == FN && children.len() == 2 {
            if nested {
                out.push('(');
            }
            self.fmt_inner(children[0], names, true, out);
            out.push_str(" => ");
            self.fmt_inner(children[1], names, false, out);
            if nested {
                out.push(')');
            }
        } else if children.is_empty() {
            out.push_str(&name);
        } else {
            if nested {
                out.push('(');
            }
            let _ = write!(out, "{}", name);
            for c in children {
                out.push(' ');
                self.fmt_inner(c, names, true, out);
            }
            if nested {
                out.push(')');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unify_free_with_ctor() {
        let mut cx = TypeContext::new();
        let v = cx.fresh();
        let int = cx.integer();
        cx.unify(v, int).unwrap();
        assert_eq!(cx.format(v), "Integer");
    }

    #[test]
    fn conflict_reports() {
        let mut cx = TypeContext::new();
        let int = cx.integer();
        let s = cx.string();
        assert!(cx.unify(int, s).is_err());
    }

    #[test]
    fn occurs_check_rejects_infinite_type() {
        let mut cx = TypeContext::new();
        let v = cx.fresh();
        let arrow = cx.arrow(v, v);
        assert!(cx.unify(v, arrow).is_err());
    }

    #[test]
    fn oldest_dob_survives_union() {
        let mut cx = TypeContext::new();
        let old = cx.fresh();
        cx.tick();
        let young = cx.fresh();
        cx.unify(old, young).unwrap();
        let root = cx.find(young);
        assert_eq!(cx.vars[root.0 as usize].dob, 1);
    }

    #[test]
    fn instantiate_refreshes_young_vars_only() {
        let mut cx = TypeContext::new();
        let outer = cx.fresh();
        let t0 = cx.now();
        cx.tick();
        let inner = cx.fresh();
        let poly = cx.arrow(inner, outer);
        let copy1 = cx.instantiate(poly, t0);
        let copy2 = cx.instantiate(poly, t0);
        // The young variable is fresh per instantiation; the old one shared.
        let int = cx.integer();
        let c1 = cx.find(copy1);
        let arg1 = cx.vars[c1.0 as usize].children[0];
        cx.unify(arg1, int).unwrap();
        let c2 = cx.find(copy2);
        let arg2 = cx.vars[c2.0 as usize].children[0];
        assert!(cx.is_free(arg2), "second instantiation must stay fresh");
        let ret2 = cx.vars[c2.0 as usize].children[1];
        let r = cx.find(ret2);
        assert_eq!(r, cx.find(outer), "old variable is shared, not cloned");
    }

    #[test]
    fn format_arrow_nesting() {
        let mut cx = TypeContext::new();
        let a = cx.fresh();
        let b = cx.fresh();
        let inner = cx.arrow(a, b);
        let outer = cx.arrow(inner, b);
        assert_eq!(cx.format(outer), "(a => b) => b");
    }
}
