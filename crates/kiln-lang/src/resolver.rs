//! Name resolution and binding.
//!
//! Consumes the per-file `FileSyntax` trees and produces one resolved
//! expression: `DefMap`/`Top`/`Subscribe`/`Match` are rewritten into
//! `DefBinding` + `Lambda` + `VarRef`, with every `VarRef` addressing a
//! deterministic `(depth, offset)` slot.
//!
//! Within each scope the definitions are stratified: a use graph is built
//! while bodies resolve, Bellman–Ford longest-path assigns levels (edges
//! out of non-lambda bindings weigh 1, so any cycle through a value is
//! detected and reported), and Tarjan groups the lambda bindings of the
//! scope into strongly-connected components for the typechecker.

use crate::ast::{Def, DefBinding, DefMap, Expr, ExprKind};
use crate::datatype::SumRegistry;
use crate::diagnostics::Diagnostics;
use crate::location::Location;
use crate::parser::FileSyntax;
use crate::pattern::{compile_match, Gensym};
use crate::prim::PrimInterface;
use std::collections::HashMap;
use tracing::debug;

const NOT_RESOLVING: usize = usize::MAX;

/// Set on a `fun` entry's `meta` when it takes part in a recursive group.
pub const META_RECURSIVE: u64 = 1;

struct Frame {
    /// Lambda frames hold a single argument name.
    lambda: Option<String>,
    /// File-scoped frames (the root) try `"{file} {name}"` before `name`.
    filescoped: bool,
    names: Vec<String>,
    locations: Vec<Location>,
    map: HashMap<String, usize>,
    /// Use edges `(user-slot, used-slot)` recorded during resolution.
    edges: Vec<(usize, usize)>,
    /// Slot currently being resolved, or `NOT_RESOLVING` for the body.
    current: usize,
}

impl Frame {
    fn lambda(arg: String) -> Self {
        Self {
            lambda: Some(arg),
            filescoped: false,
            names: Vec::new(),
            locations: Vec::new(),
            map: HashMap::new(),
            edges: Vec::new(),
            current: NOT_RESOLVING,
        }
    }

    fn binding(filescoped: bool) -> Self {
        Self {
            lambda: None,
            filescoped,
            names: Vec::new(),
            locations: Vec::new(),
            map: HashMap::new(),
            edges: Vec::new(),
            current: NOT_RESOLVING,
        }
    }
}

struct Resolver<'a> {
    sums: &'a SumRegistry,
    prims: &'a PrimInterface,
    gensym: Gensym,
    frames: Vec<Frame>,
    /// File id used for prefixed lookups in file-scoped frames.
    current_file: Option<usize>,
    /// Name of the definition being resolved, for lambda traces.
    current_def: String,
    /// While resolving a `publish X` body, `(frame, X)`: subscribes to X
    /// look up strictly outside that frame so the chain reaches outward.
    publish_skip: Option<(usize, String)>,
    /// Enclosing lambda frames, checked by leaf nodes that consume them.
    lambda_depth: usize,
}

/// Key for a file-local definition.
fn local_key(file: usize, name: &str) -> String {
    format!("{} {}", file, name)
}

/// Resolve a whole program: all files plus the entry body.
pub fn resolve_program(
    files: &[FileSyntax],
    body: Expr,
    sums: &SumRegistry,
    prims: &PrimInterface,
    diags: &mut Diagnostics,
) -> Option<Expr> {
    let mut rr = Resolver {
        sums,
        prims,
        gensym: Gensym::default(),
        frames: Vec::new(),
        current_file: None,
        current_def: String::new(),
        publish_skip: None,
        lambda_depth: 0,
    };

    // Assemble the root scope: constructor functions, then every file's
    // definitions (file-locals prefixed), then the merged publishes.
    let mut defs: Vec<(Def, Option<usize>)> = Vec::new();
    let mut sums_sorted: Vec<_> = sums.iter().collect();
    sums_sorted.sort_by(|a, b| a.name.cmp(&b.name));
    for sum in sums_sorted {
        for member in &sum.members {
            defs.push((rr.constructor_def(sum, member.index), None));
        }
    }
    let mut pubs: Vec<Def> = Vec::new();
    for (file_id, file) in files.iter().enumerate() {
        for def in &file.map.defs {
            let name = if file.globals.contains(&def.name) {
                def.name.clone()
            } else {
                local_key(file_id, &def.name)
            };
            defs.push((
                Def {
                    name,
                    location: def.location.clone(),
                    body: def.body.clone(),
                },
                Some(file_id),
            ));
        }
        pubs.extend(file.map.pubs.iter().cloned());
    }

    let out = rr.resolve_scope(defs, pubs, body, true, diags);
    if diags.ok() {
        Some(out)
    } else {
        None
    }
}

impl<'a> Resolver<'a> {
    /// `Cons` becomes `\x0 \x1 Construct(List, 1)`.
    fn constructor_def(&mut self, sum: &std::rc::Rc<crate::datatype::Sum>, index: usize) -> Def {
        let member = &sum.members[index];
        let location = member.ast.location.clone();
        let arity = member.arity();
        let core = Expr::new(
            location.clone(),
            ExprKind::Construct {
                sum: sum.clone(),
                cons: index,
            },
        );
        let body = (0..arity).rev().fold(core, |acc, k| {
            Expr::lambda(location.clone(), format!(" x{}", k), acc)
        });
        Def {
            name: member.ast.name.clone(),
            location,
            body,
        }
    }

    /// Resolve one binding scope (the root or a block) into a `DefBinding`.
    fn resolve_scope(
        &mut self,
        defs: Vec<(Def, Option<usize>)>,
        pubs: Vec<Def>,
        body: Expr,
        filescoped: bool,
        diags: &mut Diagnostics,
    ) -> Expr {
        let mut all = defs;
        // Merge publishes of the same name into a single chained channel
        // definition: `publish x` = e1 ++ e2 ++ ... ++ <outer chain>.
        let mut by_name: Vec<(String, Vec<Def>)> = Vec::new();
        for p in pubs {
            match by_name.iter_mut().find(|(n, _)| *n == p.name) {
                Some((_, list)) => list.push(p),
                None => by_name.push((p.name.clone(), vec![p])),
            }
        }
        for (name, list) in by_name {
            let location = list[0].location.clone();
            let outer = Expr::new(
                location.clone(),
                ExprKind::Subscribe { name: name.clone() },
            );
            let chained = list.into_iter().rev().fold(outer, |acc, p| {
                let cat = Expr::var(p.location.clone(), "binary ++");
                Expr::apply_all(cat, vec![p.body, acc])
            });
            all.push((
                Def {
                    name: format!("publish {}", name),
                    location,
                    body: chained,
                },
                None,
            ));
        }

        // Build the frame with duplicate detection. Slots stay parallel to
        // `all`; a duplicate keeps its slot but loses the name lookup.
        let mut frame = Frame::binding(filescoped);
        for (i, (def, _)) in all.iter().enumerate() {
            frame.names.push(def.name.clone());
            frame.locations.push(def.location.clone());
            if let Some(&prior) = frame.map.get(&def.name) {
                diags.error(
                    def.location.clone(),
                    format!(
                        "duplicate definition of '{}'; previously defined at {}",
                        display_name(&def.name),
                        frame.locations[prior]
                    ),
                );
                continue;
            }
            frame.map.insert(def.name.clone(), i);
        }

        self.frames.push(frame);
        let frame_idx = self.frames.len() - 1;

        let mut resolved: Vec<Expr> = Vec::with_capacity(all.len());
        let mut is_lambda: Vec<bool> = Vec::with_capacity(all.len());
        for (i, (def, file)) in all.iter().enumerate() {
            self.frames[frame_idx].current = i;
            let saved_file = self.current_file;
            let saved_def = std::mem::replace(&mut self.current_def, def.name.clone());
            let saved_skip = self.publish_skip.take();
            self.current_file = *file;
            if let Some(chan) = def.name.strip_prefix("publish ") {
                self.publish_skip = Some((frame_idx, chan.to_string()));
            }
            let mut e = self.resolve_expr(def.body.clone(), diags);
            if let ExprKind::Lambda { fnname, .. } = &mut e.kind {
                *fnname = def.name.clone();
            }
            is_lambda.push(matches!(e.kind, ExprKind::Lambda { .. }));
            resolved.push(e);
            self.current_file = saved_file;
            self.current_def = saved_def;
            self.publish_skip = saved_skip;
        }
        self.frames[frame_idx].current = NOT_RESOLVING;
        let mut body = self.resolve_expr(body, diags);

        let edges = std::mem::take(&mut self.frames[frame_idx].edges);
        let names: Vec<String> = self.frames[frame_idx].names.clone();
        let locations: Vec<Location> = self.frames[frame_idx].locations.clone();
        self.frames.pop();

        // ---- Stratification -------------------------------------------
        let n = all.len();
        let (levels, cycle) = bellman_ford_levels(n, &edges, &is_lambda);
        if let Some(cycle) = cycle {
            let mut parts: Vec<String> = cycle
                .iter()
                .map(|&i| format!("{} at {}", display_name(&names[i]), locations[i]))
                .collect();
            parts.sort();
            parts.dedup();
            diags.error(
                locations[cycle[0]].clone(),
                format!(
                    "value definition cycle detected including: {}",
                    parts.join("; ")
                ),
            );
        }

        // Lambda-lambda subgraph SCCs, in callee-first order.
        let sccs = tarjan_sccs(n, &edges, &is_lambda);

        // New slot order: values by (level, index), then functions by
        // (level, scc, index).
        let mut val_slots: Vec<usize> = (0..n).filter(|&i| !is_lambda[i]).collect();
        val_slots.sort_by_key(|&i| (levels[i], i));
        let mut scc_of = vec![0usize; n];
        for (scc_id, group) in sccs.iter().enumerate() {
            for &i in group {
                scc_of[i] = scc_id;
            }
        }
        let mut fun_slots: Vec<usize> = (0..n).filter(|&i| is_lambda[i]).collect();
        fun_slots.sort_by_key(|&i| (levels[i], scc_of[i], i));

        let mut perm = vec![0u32; n];
        let mut order = Vec::with_capacity(n);
        for (new, &old) in val_slots.iter().chain(fun_slots.iter()).enumerate() {
            perm[old] = new as u32;
            order.push(display_name(&names[old]).to_string());
        }

        // Dependency order for the typechecker: merge the level-sorted val
        // and fun lists, vals first on ties (a same-level fun may close
        // over a same-level val, never the reverse).
        let mut typing: Vec<u32> = Vec::with_capacity(n);
        let (mut vi, mut fi) = (0usize, 0usize);
        while vi < val_slots.len() || fi < fun_slots.len() {
            let take_val = match (val_slots.get(vi), fun_slots.get(fi)) {
                (Some(&v), Some(&f)) => levels[v] <= levels[f],
                (Some(_), None) => true,
                _ => false,
            };
            if take_val {
                typing.push(vi as u32);
                vi += 1;
            } else {
                typing.push((val_slots.len() + fi) as u32);
                fi += 1;
            }
        }

        debug!(
            vals = val_slots.len(),
            funs = fun_slots.len(),
            sccs = sccs.len(),
            "resolved scope"
        );

        let mut val = Vec::with_capacity(val_slots.len());
        let mut fun = Vec::with_capacity(fun_slots.len());
        let mut scc = Vec::with_capacity(fun_slots.len());
        let mut resolved: Vec<Option<Expr>> = resolved.into_iter().map(Some).collect();
        for &i in &val_slots {
            let mut e = resolved[i].take().expect("slot taken once");
            renumber(&mut e, 0, &perm);
            val.push(e);
        }
        for &i in &fun_slots {
            let mut e = resolved[i].take().expect("slot taken once");
            renumber(&mut e, 0, &perm);
            // Recursive functions (self-edge or SCC of several) are marked
            // so the optimizer never inlines them.
            let group = sccs.iter().find(|g| g.contains(&i));
            let recursive = group.map(|g| g.len() > 1).unwrap_or(false)
                || edges.contains(&(i, i));
            if recursive {
                e.meta |= META_RECURSIVE;
            }
            fun.push(e);
            scc.push(scc_of[i]);
        }
        renumber(&mut body, 0, &perm);

        let location = body.location.clone();
        Expr::new(
            location,
            ExprKind::DefBinding(DefBinding {
                val,
                fun,
                order,
                scc,
                typing,
                body: Box::new(body),
            }),
        )
    }

    fn resolve_expr(&mut self, e: Expr, diags: &mut Diagnostics) -> Expr {
        let Expr {
            location,
            typ,
            meta,
            kind,
        } = e;
        let kind = match kind {
            ExprKind::VarRef { name, .. } => match self.lookup(&name, 0) {
                Some((depth, offset)) => ExprKind::VarRef {
                    name,
                    depth,
                    offset,
                },
                None => {
                    diags.error(
                        location.clone(),
                        format!("unbound name '{}'", display_name(&name)),
                    );
                    ExprKind::VarRef {
                        name,
                        depth: 0,
                        offset: 0,
                    }
                }
            },
            ExprKind::App { f, v } => {
                let f = self.resolve_expr(*f, diags);
                let v = self.resolve_expr(*v, diags);
                ExprKind::App {
                    f: Box::new(f),
                    v: Box::new(v),
                }
            }
            ExprKind::Lambda { name, body, .. } => {
                self.frames.push(Frame::lambda(name.clone()));
                self.lambda_depth += 1;
                let body = self.resolve_expr(*body, diags);
                self.lambda_depth -= 1;
                self.frames.pop();
                ExprKind::Lambda {
                    name,
                    body: Box::new(body),
                    fnname: self.current_def.clone(),
                }
            }
            ExprKind::Literal { value } => ExprKind::Literal { value },
            ExprKind::Prim { name, .. } => match self.prims.desc(&name) {
                Some(desc) => {
                    if self.lambda_depth < desc.nargs {
                        diags.error(
                            location.clone(),
                            format!(
                                "primitive '{}' needs {} enclosing lambda parameters",
                                name, desc.nargs
                            ),
                        );
                    }
                    ExprKind::Prim {
                        name,
                        args: desc.nargs,
                        pflags: desc.pflags,
                    }
                }
                None => {
                    diags.error(location.clone(), format!("unknown primitive '{}'", name));
                    ExprKind::Prim {
                        name,
                        args: 0,
                        pflags: 0,
                    }
                }
            },
            ExprKind::DefMap { map, body } => {
                let DefMap { defs, pubs } = map;
                // Block definitions keep the enclosing file's scope so they
                // can still reach its file-local names.
                let file = self.current_file;
                let defs = defs.into_iter().map(|d| (d, file)).collect();
                let resolved = self.resolve_scope(defs, pubs, *body, false, diags);
                return resolved;
            }
            ExprKind::Top { .. } => unreachable!("Top is resolved via resolve_program"),
            ExprKind::Match {
                args,
                arms,
                refutable,
            } => {
                let compiled = compile_match(
                    location.clone(),
                    args,
                    arms,
                    refutable,
                    self.sums,
                    &mut self.gensym,
                    diags,
                );
                return self.resolve_expr(compiled, diags);
            }
            ExprKind::Subscribe { name } => {
                let channel = format!("publish {}", name);
                let skip_above = match &self.publish_skip {
                    Some((frame, chan)) if *chan == name => Some(*frame),
                    _ => None,
                };
                let hit = self.lookup_channel(&channel, skip_above);
                match hit {
                    Some((depth, offset)) => ExprKind::VarRef {
                        name: channel,
                        depth,
                        offset,
                    },
                    None => match self.lookup("Nil", 0) {
                        Some((depth, offset)) => ExprKind::VarRef {
                            name: "Nil".to_string(),
                            depth,
                            offset,
                        },
                        None => {
                            diags.error(
                                location.clone(),
                                format!(
                                    "nothing publishes '{}' and Nil is not defined",
                                    name
                                ),
                            );
                            ExprKind::VarRef {
                                name: channel,
                                depth: 0,
                                offset: 0,
                            }
                        }
                    },
                }
            }
            ExprKind::Construct { sum, cons } => {
                let arity = sum.members[cons].arity();
                debug_assert!(self.lambda_depth >= arity);
                ExprKind::Construct { sum, cons }
            }
            ExprKind::Destruct { sum } => {
                debug_assert!(self.lambda_depth >= sum.members.len() + 1);
                ExprKind::Destruct { sum }
            }
            ExprKind::Get { sum, cons, field } => {
                debug_assert!(self.lambda_depth >= 1);
                ExprKind::Get { sum, cons, field }
            }
            ExprKind::DefBinding(_) => unreachable!("DefBinding is produced, not consumed"),
        };
        Expr {
            location,
            typ,
            meta,
            kind,
        }
    }

    /// Walk frames innermost-out; returns `(depth, slot)` and records a
    /// use edge when the hit lands in a binding frame mid-resolution.
    fn lookup(&mut self, name: &str, skip_innermost: usize) -> Option<(u32, u32)> {
        let top = self.frames.len();
        for rel in skip_innermost..top {
            let idx = top - 1 - rel;
            let frame = &self.frames[idx];
            if let Some(arg) = &frame.lambda {
                if arg == name {
                    return Some((rel as u32, 0));
                }
                continue;
            }
            let mut hit = None;
            if frame.filescoped {
                if let Some(file) = self.current_file {
                    hit = frame.map.get(&local_key(file, name)).copied();
                }
            }
            if hit.is_none() {
                hit = frame.map.get(name).copied();
            }
            if let Some(slot) = hit {
                let current = frame.current;
                if current != NOT_RESOLVING {
                    self.frames[idx].edges.push((current, slot));
                }
                return Some((rel as u32, slot as u32));
            }
        }
        None
    }

    /// Lookup for subscribe: optionally start strictly outside `skip_above`
    /// (the frame whose own `publish` chain is being built).
    fn lookup_channel(&mut self, channel: &str, skip_above: Option<usize>) -> Option<(u32, u32)> {
        let skip = match skip_above {
            None => 0,
            Some(frame_idx) => self.frames.len() - frame_idx,
        };
        self.lookup(channel, skip)
    }
}

/// Strip the file-id prefix from a local name for display.
fn display_name(name: &str) -> &str {
    match name.find(' ') {
        Some(i) if name[..i].chars().all(|c| c.is_ascii_digit()) => &name[i + 1..],
        _ => name,
    }
}

/// Rewrite `VarRef` offsets addressing the frame `depth` frames above.
fn renumber(e: &mut Expr, depth: u32, perm: &[u32]) {
    match &mut e.kind {
        ExprKind::VarRef {
            depth: d, offset, ..
        } => {
            if *d == depth {
                *offset = perm[*offset as usize];
            }
        }
        ExprKind::App { f, v } => {
            renumber(f, depth, perm);
            renumber(v, depth, perm);
        }
        ExprKind::Lambda { body, .. } => renumber(body, depth + 1, perm),
        ExprKind::DefBinding(b) => {
            for x in b.val.iter_mut().chain(b.fun.iter_mut()) {
                renumber(x, depth + 1, perm);
            }
            renumber(&mut b.body, depth + 1, perm);
        }
        ExprKind::Literal { .. }
        | ExprKind::Prim { .. }
        | ExprKind::Construct { .. }
        | ExprKind::Destruct { .. }
        | ExprKind::Get { .. }
        | ExprKind::Subscribe { .. } => {}
        ExprKind::DefMap { .. } | ExprKind::Top { .. } | ExprKind::Match { .. } => {
            unreachable!("eliminated before renumbering")
        }
    }
}

/// Longest-path levels; edges out of non-lambda bindings weigh 1. Returns
/// the levels and, when a positive-weight cycle exists, its members.
fn bellman_ford_levels(
    n: usize,
    edges: &[(usize, usize)],
    is_lambda: &[bool],
) -> (Vec<i64>, Option<Vec<usize>>) {
    let mut level = vec![0i64; n];
    let mut pred: Vec<Option<usize>> = vec![None; n];
    for round in 0..=n {
        let mut changed = None;
        for &(user, used) in edges {
            let w = if is_lambda[user] { 0 } else { 1 };
            if level[user] < level[used] + w {
                level[user] = level[used] + w;
                pred[user] = Some(used);
                changed = Some(user);
            }
        }
        match changed {
            None => return (level, None),
            Some(start) if round == n => {
                // Walk predecessors until a repeat to surface the cycle.
                let mut seen = vec![false; n];
                let mut walk = start;
                while !seen[walk] {
                    seen[walk] = true;
                    walk = match pred[walk] {
                        Some(p) => p,
                        None => break,
                    };
                }
                let mut cycle = vec![walk];
                let mut cur = pred[walk];
                while let Some(c) = cur {
                    if c == walk {
                        break;
                    }
                    cycle.push(c);
                    cur = pred[c];
                }
                return (level, Some(cycle));
            }
            Some(_) => {}
        }
    }
    (level, None)
}

/// Tarjan over the lambda-lambda subgraph; groups come out callee-first.
fn tarjan_sccs(n: usize, edges: &[(usize, usize)], is_lambda: &[bool]) -> Vec<Vec<usize>> {
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
    for &(user, used) in edges {
        if user < n && used < n && is_lambda[user] && is_lambda[used] {
            adj[user].push(used);
        }
    }

    struct State {
        index: Vec<Option<usize>>,
        low: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        next: usize,
        out: Vec<Vec<usize>>,
    }
    fn strongconnect(v: usize, adj: &[Vec<usize>], st: &mut State) {
        st.index[v] = Some(st.next);
        st.low[v] = st.next;
        st.next += 1;
        st.stack.push(v);
        st.on_stack[v] = true;
        for &w in &adj[v] {
            if st.index[w].is_none() {
                strongconnect(w, adj, st);
                st.low[v] = st.low[v].min(st.low[w]);
            } else if st.on_stack[w] {
                st.low[v] = st.low[v].min(st.index[w].unwrap());
            }
        }
        if st.low[v] == st.index[v].unwrap() {
            let mut group = Vec::new();
            loop {
                let w = st.stack.pop().expect("tarjan stack never underflows");
                st.on_stack[w] = false;
                group.push(w);
                if w == v {
                    break;
                }
            }
            group.sort_unstable();
            st.out.push(group);
        }
    }

    let mut st = State {
        index: vec![None; n],
        low: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        next: 0,
        out: Vec::new(),
    };
    for v in 0..n {
        if is_lambda[v] && st.index[v].is_none() {
            strongconnect(v, &adj, &mut st);
        }
    }
    st.out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bellman_detects_value_cycle() {
        // a = b + 1 ; b = a + 1 (both non-lambda)
        let edges = vec![(0, 1), (1, 0)];
        let (_, cycle) = bellman_ford_levels(2, &edges, &[false, false]);
        let cycle = cycle.expect("cycle expected");
        assert!(cycle.contains(&0) || cycle.contains(&1));
    }

    #[test]
    fn lambda_cycle_is_fine() {
        // Mutually recursive functions carry weight-0 edges.
        let edges = vec![(0, 1), (1, 0)];
        let (levels, cycle) = bellman_ford_levels(2, &edges, &[true, true]);
        assert!(cycle.is_none());
        assert_eq!(levels, vec![0, 0]);
    }

    #[test]
    fn mixed_cycle_is_a_value_cycle() {
        // x = f 1 (val), f y = x (lambda): weight 1 + 0 loop.
        let edges = vec![(0, 1), (1, 0)];
        let (_, cycle) = bellman_ford_levels(2, &edges, &[false, true]);
        assert!(cycle.is_some());
    }

    #[test]
    fn levels_order_values() {
        // c = b + 1, b = a + 1, a = 1 (all vals)
        let edges = vec![(2, 1), (1, 0)];
        let (levels, cycle) = bellman_ford_levels(3, &edges, &[false, false, false]);
        assert!(cycle.is_none());
        assert!(levels[0] < levels[1] && levels[1] < levels[2]);
    }

    #[test]
    fn tarjan_groups_mutual_recursion() {
        // f <-> g, h -> f
        let edges = vec![(0, 1), (1, 0), (2, 0)];
        let sccs = tarjan_sccs(3, &edges, &[true, true, true]);
        assert_eq!(sccs.len(), 2);
        // Callee-first: {f,g} before {h}.
        assert_eq!(sccs[0], vec![0, 1]);
        assert_eq!(sccs[1], vec![2]);
    }

    #[test]
    fn display_name_strips_file_prefix() {
        assert_eq!(display_name("3 helper"), "helper");
        assert_eq!(display_name("binary ++"), "binary ++");
        assert_eq!(display_name("plain"), "plain");
    }
}
