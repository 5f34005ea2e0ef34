//! The cooperative evaluator.
//!
//! Single-threaded trampoline over a LIFO stack of [`Work`]. Each
//! `Interpret` walks one function's terms in order, publishing every
//! result into the matching scope slot (a promise). A term that needs a
//! value not yet available either installs a continuation on the empty
//! promise (`Get`/`Des`/`App`) or suspends the whole interpret
//! (`Prim` argument gathering). Fulfilling a promise splices its waiters
//! onto the work stack in registration order.
//!
//! The heap may refuse an allocation at any step; the run loop then
//! re-queues the current work, collects, and replays it, so every step
//! is re-entrant up to its first effect.

use crate::heap::{Cont, GcNeeded, Heap, HeapRef, Obj, PromiseState, RootId};
use crate::prims::{PrimError, PrimRegistry};
use kiln_ssa::program::{CodeTerm, Program};
use kiln_ssa::term::{ref_depth, ref_offset};
use siphasher::sip::SipHasher13;
use std::collections::HashMap;
use std::collections::HashSet;
use std::hash::Hasher;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Set by signal handlers; the run loop exits at the next safepoint.
pub static EXIT_ASAP: AtomicBool = AtomicBool::new(false);

pub fn exit_now() -> bool {
    EXIT_ASAP.load(Ordering::Relaxed)
}

/// Iterations between safepoint checks.
const SAFEPOINT: u64 = 10_000;

/// Headroom demanded before executing any work item.
const WORK_HEADROOM: usize = 64;

#[derive(Debug, Clone)]
pub enum Work {
    Interpret {
        fun: u32,
        index: u32,
        scope: HeapRef,
    },
    Resume {
        cont: HeapRef,
        value: HeapRef,
    },
}

struct TargetEntry {
    check: u64,
    promise: RootId,
}

struct TargetTable {
    label: String,
    entries: HashMap<u64, TargetEntry>,
}

pub struct Runtime {
    pub heap: Heap,
    program: Rc<Program>,
    prims: Rc<PrimRegistry>,
    stack: Vec<Work>,
    pub abort: bool,
    /// Captured primitive output; the driver flushes it to stdout.
    pub stdout: Vec<u8>,
    targets: Vec<TargetTable>,
    hash_key: (u64, u64),
    iterations: u64,
    /// Largest scope any apply can need, precomputed for reservations.
    max_scope: usize,
    /// Call-chain sample histogram; `Some` enables safepoint sampling.
    profile: Option<HashMap<String, u64>>,
}

impl Runtime {
    pub fn new(program: Program, prims: Rc<PrimRegistry>, heap_factor: f64) -> Self {
        let max_scope = program.funs.iter().map(|f| f.terms.len()).max().unwrap_or(0);
        Self {
            heap: Heap::new(heap_factor),
            program: Rc::new(program),
            prims,
            stack: Vec::new(),
            abort: false,
            stdout: Vec::new(),
            targets: Vec::new(),
            hash_key: (0x6b696c6e, 0x7761746572),
            iterations: 0,
            max_scope,
            profile: None,
        }
    }

    /// Turn on safepoint call-stack sampling.
    pub fn enable_profile(&mut self) {
        self.profile = Some(HashMap::new());
    }

    /// Sampled call chains with their hit counts, hottest first.
    pub fn profile_report(&self) -> Vec<(String, u64)> {
        let Some(hist) = &self.profile else {
            return Vec::new();
        };
        let mut out: Vec<(String, u64)> = hist.iter().map(|(k, v)| (k.clone(), *v)).collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    /// Record one sample of the pending work's call chain.
    fn sample(&mut self) {
        let Some(Work::Interpret { fun, scope, .. }) = self.stack.last().cloned() else {
            return;
        };
        let mut chain = vec![self.program.funs[fun as usize].label.clone()];
        let mut s = Some(scope);
        while let (Some(cur), true) = (s, chain.len() < 8) {
            let Obj::Scope { fun, caller, .. } = self.heap.get(cur) else {
                break;
            };
            let label = &self.program.funs[*fun as usize].label;
            if chain.last() != Some(label) {
                chain.push(label.clone());
            }
            s = *caller;
        }
        let key = chain.join(" <- ");
        if let Some(hist) = &mut self.profile {
            *hist.entry(key).or_insert(0) += 1;
        }
    }

    pub fn max_scope(&self) -> usize {
        self.max_scope
    }

    fn scope_slot(&self, scope: HeapRef, index: usize) -> HeapRef {
        let Obj::Scope { slots, .. } = self.heap.get(scope) else {
            unreachable!("interpret always runs in a scope");
        };
        slots[index]
    }

    /// Install the per-database SipHash key (from the catalog's entropy).
    pub fn set_hash_key(&mut self, k0: u64, k1: u64) {
        self.hash_key = (k0, k1);
    }

    pub fn program(&self) -> Rc<Program> {
        self.program.clone()
    }

    /// Seed evaluation of the entry function; returns a root holding the
    /// promise of the program's result.
    pub fn seed(&mut self) -> RootId {
        let program = self.program.clone();
        let entry = program.entry;
        let code = &program.funs[entry];
        assert_eq!(code.nargs, 0, "entry takes no arguments");
        let n = code.terms.len();

        let out_o = ref_offset(code.output);
        let result = self.heap.alloc(Obj::Promise(PromiseState::Empty {
            waiters: Vec::new(),
        }));
        let root = self.heap.root(result);

        let mut slots = Vec::with_capacity(n);
        for k in 0..n {
            if k == out_o && ref_depth(code.output) == 0 {
                slots.push(result);
            } else {
                slots.push(self.heap.alloc(Obj::Promise(PromiseState::Empty {
                    waiters: Vec::new(),
                })));
            }
        }
        let scope = self.heap.alloc(Obj::Scope {
            fun: entry as u32,
            parent: None,
            caller: None,
            slots,
        });
        self.stack.push(Work::Interpret {
            fun: entry as u32,
            index: 0,
            scope,
        });
        root
    }

    pub fn schedule(&mut self, work: Work) {
        self.stack.push(work);
    }

    /// No runnable work remains (jobs may still be outstanding).
    pub fn idle(&self) -> bool {
        self.stack.is_empty()
    }

    /// Drain the work stack. Returns when no work remains, on abort, or
    /// when a cancellation signal arrives.
    pub fn run(&mut self) {
        loop {
            if self.abort {
                self.stack.clear();
                return;
            }
            self.iterations += 1;
            if self.iterations % SAFEPOINT == 0 {
                if exit_now() {
                    debug!("cancellation requested; draining evaluator");
                    self.stack.clear();
                    return;
                }
                if self.profile.is_some() {
                    self.sample();
                }
            }
            let Some(work) = self.stack.pop() else { return };
            if self.heap.reserve(WORK_HEADROOM).is_err() {
                self.stack.push(work);
                self.gc();
                if !self.heap.grow_for(WORK_HEADROOM) {
                    eprintln!("PANIC: heap exhausted and growth is disabled");
                    self.abort = true;
                }
                continue;
            }
            match work {
                Work::Interpret { fun, index, scope } => self.interpret(fun, index, scope),
                Work::Resume { cont, value } => self.resume(cont, value),
            }
        }
    }

    pub fn gc(&mut self) {
        let Runtime { heap, stack, .. } = self;
        let mut extra: Vec<&mut HeapRef> = Vec::with_capacity(stack.len() * 2);
        for w in stack.iter_mut() {
            match w {
                Work::Interpret { scope, .. } => extra.push(scope),
                Work::Resume { cont, value } => {
                    extra.push(cont);
                    extra.push(value);
                }
            }
        }
        heap.collect(&mut extra);
        debug!(live = self.heap.live(), "collection complete");
    }

    // ------------------------------------------------------------------
    // Promises
    // ------------------------------------------------------------------

    pub fn empty_promise(&mut self) -> HeapRef {
        self.heap.alloc(Obj::Promise(PromiseState::Empty {
            waiters: Vec::new(),
        }))
    }

    pub fn full_promise(&mut self, value: HeapRef) -> HeapRef {
        self.heap.alloc(Obj::Promise(PromiseState::Fulfilled(value)))
    }

    /// Fulfill a promise exactly once, waking its waiters in order.
    pub fn fulfill(&mut self, promise: HeapRef, value: HeapRef) {
        let Obj::Promise(state) = self.heap.get_mut(promise) else {
            unreachable!("fulfill target is always a promise");
        };
        match state {
            PromiseState::Empty { waiters } => {
                let ws = std::mem::take(waiters);
                *state = PromiseState::Fulfilled(value);
                // LIFO stack: push reversed so waiters run in
                // registration order.
                for cont in ws.into_iter().rev() {
                    self.stack.push(Work::Resume { cont, value });
                }
            }
            PromiseState::Fulfilled(_) => {
                unreachable!("a promise is fulfilled at most once")
            }
        }
    }

    fn attach(&mut self, promise: HeapRef, cont: Cont) {
        let c = self.heap.alloc(Obj::Cont(cont));
        let Obj::Promise(PromiseState::Empty { waiters }) = self.heap.get_mut(promise) else {
            unreachable!("attach requires an empty promise");
        };
        waiters.push(c);
    }

    /// Forward `src` into `dst`: now if full, on fulfillment otherwise.
    pub fn link(&mut self, src: HeapRef, dst: HeapRef) {
        match self.heap.get(src) {
            Obj::Promise(PromiseState::Fulfilled(v)) => {
                let v = *v;
                self.fulfill(dst, v);
            }
            Obj::Promise(PromiseState::Empty { .. }) => {
                self.attach(src, Cont::Fill { dst });
            }
            _ => unreachable!("link source is always a promise"),
        }
    }

    /// Walk the scope chain to the promise a packed ref addresses.
    pub fn resolve_ref(&self, scope: HeapRef, r: usize) -> HeapRef {
        let mut s = scope;
        for _ in 0..ref_depth(r) {
            let Obj::Scope { parent, .. } = self.heap.get(s) else {
                unreachable!("scope chain holds scopes");
            };
            s = parent.expect("reference depth validated by pass_scope");
        }
        let Obj::Scope { slots, .. } = self.heap.get(s) else {
            unreachable!("scope chain holds scopes");
        };
        slots[ref_offset(r)]
    }

    // ------------------------------------------------------------------
    // Interpret
    // ------------------------------------------------------------------

    fn interpret(&mut self, fun: u32, start: u32, scope: HeapRef) {
        let program = self.program.clone();
        let code = &program.funs[fun as usize];
        let mut index = start as usize;

        while index < code.terms.len() {
            // Worst-case allocation for this term; an apply needs a whole
            // scope.
            let needed = match &code.terms[index] {
                CodeTerm::App { .. } | CodeTerm::Des { .. } => self.max_scope + 8,
                _ => 16,
            };
            if self.heap.reserve(needed).is_err() {
                self.stack.push(Work::Interpret {
                    fun,
                    index: index as u32,
                    scope,
                });
                self.gc();
                if !self.heap.grow_for(needed) {
                    eprintln!("PANIC: heap exhausted and growth is disabled");
                    self.abort = true;
                }
                return;
            }

            let slot = self.scope_slot(scope, index);
            match &code.terms[index] {
                CodeTerm::Arg => {}
                CodeTerm::Lit { value } => {
                    let v = self.alloc_literal(value);
                    self.fulfill(slot, v);
                }
                CodeTerm::Closure { fun: f } => {
                    let c = self.heap.alloc(Obj::Closure {
                        fun: *f as u32,
                        scope: Some(scope),
                    });
                    self.fulfill(slot, c);
                }
                CodeTerm::Con { sum, cons, args } => {
                    let fields: Vec<HeapRef> =
                        args.iter().map(|&r| self.resolve_ref(scope, r)).collect();
                    let rec = self.heap.alloc(Obj::Record {
                        sum: sum.clone(),
                        cons: *cons as u32,
                        fields,
                    });
                    self.fulfill(slot, rec);
                }
                CodeTerm::Get { field, tuple } => {
                    let tp = self.resolve_ref(scope, *tuple);
                    match self.heap.get(tp) {
                        Obj::Promise(PromiseState::Fulfilled(v)) => {
                            let v = *v;
                            let Obj::Record { fields, .. } = self.heap.get(v) else {
                                self.panic_with_trace("field access on a non-record", scope);
                                return;
                            };
                            let p = fields[*field];
                            self.link(p, slot);
                        }
                        Obj::Promise(PromiseState::Empty { .. }) => {
                            self.attach(
                                tp,
                                Cont::GetField {
                                    field: *field as u32,
                                    dst: slot,
                                },
                            );
                        }
                        _ => unreachable!("slots hold promises"),
                    }
                }
                CodeTerm::Des { args } => {
                    let scrut = self.resolve_ref(scope, *args.last().expect("scrutinee"));
                    let handlers: Vec<HeapRef> = args[..args.len() - 1]
                        .iter()
                        .map(|&r| self.resolve_ref(scope, r))
                        .collect();
                    match self.heap.get(scrut) {
                        Obj::Promise(PromiseState::Fulfilled(v)) => {
                            let v = *v;
                            if !self.select_handler(v, scrut, &handlers, slot, scope) {
                                return;
                            }
                        }
                        Obj::Promise(PromiseState::Empty { .. }) => {
                            self.attach(scrut, Cont::DesSelect { handlers, dst: slot });
                        }
                        _ => unreachable!("slots hold promises"),
                    }
                }
                CodeTerm::App { f, v } => {
                    let fp = self.resolve_ref(scope, *f);
                    let vp = self.resolve_ref(scope, *v);
                    match self.heap.get(fp) {
                        Obj::Promise(PromiseState::Fulfilled(c)) => {
                            let c = *c;
                            if !matches!(self.heap.get(c), Obj::Closure { .. }) {
                                self.panic_with_trace("applied a non-function value", scope);
                                return;
                            }
                            self.apply(c, vp, slot, Some(scope))
                                .expect("reserved above");
                        }
                        Obj::Promise(PromiseState::Empty { .. }) => {
                            self.attach(fp, Cont::ApplyTo { arg: vp, dst: slot });
                        }
                        _ => unreachable!("slots hold promises"),
                    }
                }
                CodeTerm::Prim { name, args, .. } => {
                    let mut vals = Vec::with_capacity(args.len());
                    let mut waiting = None;
                    for &r in args {
                        let p = self.resolve_ref(scope, r);
                        match self.heap.get(p) {
                            Obj::Promise(PromiseState::Fulfilled(v)) => vals.push(*v),
                            Obj::Promise(PromiseState::Empty { .. }) => {
                                waiting = Some(p);
                                break;
                            }
                            _ => unreachable!("slots hold promises"),
                        }
                    }
                    if let Some(p) = waiting {
                        self.attach(
                            p,
                            Cont::Step {
                                fun,
                                index: index as u32,
                                scope,
                            },
                        );
                        return;
                    }
                    let prims = self.prims.clone();
                    let entry = prims
                        .get(name)
                        .expect("resolution rejected unknown primitives");
                    match (entry.run)(self, &vals, slot) {
                        Ok(()) => {}
                        Err(PrimError::Gc) => {
                            self.stack.push(Work::Interpret {
                                fun,
                                index: index as u32,
                                scope,
                            });
                            self.gc();
                            return;
                        }
                        Err(PrimError::Wait(p)) => {
                            self.attach(
                                p,
                                Cont::Step {
                                    fun,
                                    index: index as u32,
                                    scope,
                                },
                            );
                            return;
                        }
                        Err(PrimError::Panic(msg)) => {
                            self.panic_with_trace(&msg, scope);
                            return;
                        }
                    }
                }
            }
            index += 1;
        }
    }

    /// Dispatch a destructed record to its member's handler. Returns
    /// false when the interpret must stop (runtime error).
    fn select_handler(
        &mut self,
        record: HeapRef,
        record_promise: HeapRef,
        handlers: &[HeapRef],
        dst: HeapRef,
        scope: HeapRef,
    ) -> bool {
        let Obj::Record { cons, .. } = self.heap.get(record) else {
            self.panic_with_trace("match on a non-record value", scope);
            return false;
        };
        let hp = handlers[*cons as usize];
        match self.heap.get(hp) {
            Obj::Promise(PromiseState::Fulfilled(c)) => {
                let c = *c;
                self.apply(c, record_promise, dst, Some(scope))
                    .expect("reserved by the caller");
                true
            }
            Obj::Promise(PromiseState::Empty { .. }) => {
                self.attach(hp, Cont::ApplyHandler { record, dst });
                true
            }
            _ => unreachable!("slots hold promises"),
        }
    }

    /// Apply a unary closure: build the callee scope (sharing the
    /// argument promise and, in tail position, the caller's result
    /// promise) and schedule its body.
    pub fn apply(
        &mut self,
        closure: HeapRef,
        arg: HeapRef,
        result: HeapRef,
        caller: Option<HeapRef>,
    ) -> Result<(), GcNeeded> {
        let Obj::Closure { fun, scope: captured } = self.heap.get(closure) else {
            unreachable!("apply requires a closure");
        };
        let (fun, captured) = (*fun, *captured);
        let program = self.program.clone();
        let code = &program.funs[fun as usize];
        let n = code.terms.len();
        self.heap.reserve(n + 2)?;
        debug_assert_eq!(code.nargs, 1, "functions are unary after lowering");

        let out_d = ref_depth(code.output);
        let out_o = ref_offset(code.output);

        let mut slots = Vec::with_capacity(n);
        for k in 0..n {
            if k == 0 {
                slots.push(arg);
            } else if out_d == 0 && k == out_o {
                slots.push(result);
            } else {
                slots.push(self.empty_promise());
            }
        }
        let scope = self.heap.alloc(Obj::Scope {
            fun,
            parent: captured,
            caller,
            slots,
        });

        if out_d == 0 && out_o == 0 {
            // The body returns its argument.
            self.link(arg, result);
        } else if out_d > 0 {
            let p = self.resolve_ref(scope, code.output);
            self.link(p, result);
        }

        self.stack.push(Work::Interpret {
            fun,
            index: 0,
            scope,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Resume
    // ------------------------------------------------------------------

    fn resume(&mut self, cont: HeapRef, value: HeapRef) {
        let Obj::Cont(c) = self.heap.get(cont) else {
            unreachable!("resume target is always a continuation");
        };
        match c.clone() {
            Cont::Step { fun, index, scope } => {
                self.stack.push(Work::Interpret { fun, index, scope });
            }
            Cont::Fill { dst } => self.fulfill(dst, value),
            Cont::GetField { field, dst } => {
                let Obj::Record { fields, .. } = self.heap.get(value) else {
                    self.runtime_error("field access on a non-record");
                    return;
                };
                let p = fields[field as usize];
                self.link(p, dst);
            }
            Cont::DesSelect { handlers, dst } => {
                let p = self.full_promise(value);
                self.select_handler_resumed(value, p, &handlers, dst);
            }
            Cont::ApplyHandler { record, dst } => {
                let p = self.full_promise(record);
                if self.apply(value, p, dst, None).is_err() {
                    self.stack.push(Work::Resume { cont, value });
                    self.gc();
                }
            }
            Cont::ApplyTo { arg, dst } => {
                if !matches!(self.heap.get(value), Obj::Closure { .. }) {
                    self.runtime_error("applied a non-function value");
                    return;
                }
                if self.apply(value, arg, dst, None).is_err() {
                    self.stack.push(Work::Resume { cont, value });
                    self.gc();
                }
            }
        }
    }

    fn select_handler_resumed(
        &mut self,
        record: HeapRef,
        record_promise: HeapRef,
        handlers: &[HeapRef],
        dst: HeapRef,
    ) {
        let Obj::Record { cons, .. } = self.heap.get(record) else {
            self.runtime_error("match on a non-record value");
            return;
        };
        let hp = handlers[*cons as usize];
        match self.heap.get(hp) {
            Obj::Promise(PromiseState::Fulfilled(c)) => {
                let c = *c;
                if self.apply(c, record_promise, dst, None).is_err() {
                    // Rare: replay via a fresh handler wait.
                    self.attach(hp, Cont::ApplyHandler { record, dst });
                    self.gc();
                }
            }
            Obj::Promise(PromiseState::Empty { .. }) => {
                self.attach(hp, Cont::ApplyHandler { record, dst });
            }
            _ => unreachable!("slots hold promises"),
        }
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    pub fn alloc_literal(&mut self, value: &kiln_lang::ast::Literal) -> HeapRef {
        use kiln_lang::ast::Literal;
        match value {
            Literal::Integer(i) => self.heap.alloc(Obj::Int(*i)),
            Literal::Double(d) => self.heap.alloc(Obj::Dbl(*d)),
            Literal::Str(s) => self.heap.alloc(Obj::Str(Rc::from(&**s))),
        }
    }

    /// Render a value for `format`, panics, and traces.
    pub fn render(&self, v: HeapRef) -> String {
        match self.heap.get(v) {
            Obj::Str(s) => s.to_string(),
            Obj::Int(i) => i.to_string(),
            Obj::Dbl(d) => d.to_string(),
            Obj::Record { sum, cons, fields } => {
                let name = &sum.members[*cons as usize].ast.name;
                if fields.is_empty() {
                    name.clone()
                } else {
                    let mut out = format!("({}", name);
                    for &f in fields {
                        out.push(' ');
                        match self.heap.get(f) {
                            Obj::Promise(PromiseState::Fulfilled(v)) => {
                                out.push_str(&self.render(*v))
                            }
                            _ => out.push('_'),
                        }
                    }
                    out.push(')');
                    out
                }
            }
            Obj::Closure { fun, .. } => {
                format!("<{}>", self.program.funs[*fun as usize].label)
            }
            Obj::Job(id) => format!("Job {}", id),
            Obj::Target(id) => format!("Target {}", id),
            other => format!("<{:?}>", other),
        }
    }

    /// Structural hash of a fully-evaluated value. Records hash as a
    /// function of their constructor and field hashes only; an
    /// unfulfilled field reports the blocking promise so the caller can
    /// wait on it.
    pub fn deep_hash(&self, v: HeapRef, k0: u64, k1: u64) -> Result<u64, HeapRef> {
        let mut hasher = SipHasher13::new_with_keys(k0, k1);
        let mut seen = HashSet::new();
        self.hash_into(v, &mut hasher, &mut seen)?;
        Ok(hasher.finish())
    }

    pub fn value_hash(&self, v: HeapRef) -> Result<u64, HeapRef> {
        self.deep_hash(v, self.hash_key.0, self.hash_key.1)
    }

    /// Secondary hash used to detect target key collisions.
    pub fn check_hash(&self, v: HeapRef) -> Result<u64, HeapRef> {
        self.deep_hash(v, self.hash_key.0 ^ 0x5bd1e995, self.hash_key.1.rotate_left(17))
    }

    fn hash_into(
        &self,
        v: HeapRef,
        hasher: &mut SipHasher13,
        seen: &mut HashSet<u32>,
    ) -> Result<(), HeapRef> {
        if !seen.insert(v.0) {
            hasher.write_u8(0xff);
            return Ok(());
        }
        match self.heap.get(v) {
            Obj::Str(s) => {
                hasher.write_u8(1);
                hasher.write(s.as_bytes());
            }
            Obj::Int(i) => {
                hasher.write_u8(2);
                hasher.write_i64(*i);
            }
            Obj::Dbl(d) => {
                hasher.write_u8(3);
                hasher.write_u64(d.to_bits());
            }
            Obj::Record { sum, cons, fields } => {
                hasher.write_u8(4);
                hasher.write(sum.name.as_bytes());
                hasher.write_u32(*cons);
                for &f in fields {
                    match self.heap.get(f) {
                        Obj::Promise(PromiseState::Fulfilled(fv)) => {
                            self.hash_into(*fv, hasher, seen)?
                        }
                        _ => return Err(f),
                    }
                }
            }
            // Closures hash by code identity; captured environments are
            // deliberately not traversed (see DESIGN.md).
            Obj::Closure { fun, .. } => {
                hasher.write_u8(5);
                hasher.write_u32(*fun);
            }
            Obj::Job(id) => {
                hasher.write_u8(6);
                hasher.write_u32(*id);
            }
            Obj::Target(id) => {
                hasher.write_u8(7);
                hasher.write_u32(*id);
            }
            other => unreachable!("hashed a non-value object: {:?}", other),
        }
        seen.remove(&v.0);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Targets
    // ------------------------------------------------------------------

    pub fn target_new(&mut self, label: &str) -> u32 {
        self.targets.push(TargetTable {
            label: label.to_string(),
            entries: HashMap::new(),
        });
        self.targets.len() as u32 - 1
    }

    /// Look up or install a target entry. On a hit with a mismatched
    /// check hash, reports the collision.
    pub fn target_entry(
        &mut self,
        table: u32,
        key: u64,
        check: u64,
    ) -> Result<(HeapRef, bool), String> {
        if let Some(entry) = self.targets[table as usize].entries.get(&key) {
            if entry.check != check {
                return Err(format!(
                    "target '{}' hash collision; rerun the build",
                    self.targets[table as usize].label
                ));
            }
            let p = self.heap.deref(entry.promise);
            return Ok((p, false));
        }
        let p = self.empty_promise();
        let root = self.heap.root(p);
        self.targets[table as usize]
            .entries
            .insert(key, TargetEntry { check, promise: root });
        Ok((p, true))
    }

    /// Labels of targets whose promises never resolved (reported as
    /// warnings at teardown).
    pub fn unfulfilled_targets(&self) -> Vec<String> {
        let mut out = Vec::new();
        for t in &self.targets {
            for entry in t.entries.values() {
                let p = self.heap.deref(entry.promise);
                if matches!(
                    self.heap.get(p),
                    Obj::Promise(PromiseState::Empty { .. })
                ) {
                    out.push(t.label.clone());
                    break;
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Runtime panic: print the message and the call stack, then abort;
    /// the evaluator drains without performing further effects.
    pub fn panic_with_trace(&mut self, msg: &str, scope: HeapRef) {
        eprintln!("PANIC: {}", msg);
        let mut s = Some(scope);
        let mut depth = 0;
        while let Some(cur) = s {
            let Obj::Scope { fun, caller, .. } = self.heap.get(cur) else {
                break;
            };
            eprintln!("  at {}", self.program.funs[*fun as usize].label);
            s = *caller;
            depth += 1;
            if depth > 64 {
                eprintln!("  ...");
                break;
            }
        }
        self.abort = true;
    }

    fn runtime_error(&mut self, msg: &str) {
        eprintln!("PANIC: {}", msg);
        self.abort = true;
    }

    /// Read a fulfilled result; `None` while pending or after abort.
    pub fn result_value(&self, root: RootId) -> Option<HeapRef> {
        let p = self.heap.deref(root);
        match self.heap.get(p) {
            Obj::Promise(PromiseState::Fulfilled(v)) => Some(*v),
            _ => None,
        }
    }
}
