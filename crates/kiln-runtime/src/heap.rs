//! The managed heap: values, scopes, promises, continuations.
//!
//! A semispace copying collector over an object arena. `HeapRef` is an
//! arena index and is only stable between collections; anything that
//! survives across potential GC points must hold a `RootId` instead.
//! Collection is a Cheney scan: roots are forwarded, then the to-space
//! is walked left to right forwarding every embedded reference.
//!
//! `reserve` never collects on its own; it reports `GcNeeded` and the
//! run loop re-queues the current work, collects, and replays it. All
//! work is therefore written to be re-entrant up to its first effect.

use kiln_lang::datatype::Sum;
use std::rc::Rc;

/// Arena index; invalidated by collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapRef(pub u32);

/// Stable handle registered in the root set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootId(pub u32);

/// Raised when an allocation would overflow the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcNeeded;

/// A suspended computation, resumed by a promise fulfillment.
#[derive(Debug, Clone)]
pub enum Cont {
    /// Resume interpretation at `(fun, index)` in `scope`.
    Step {
        fun: u32,
        index: u32,
        scope: HeapRef,
    },
    /// Copy the fulfilled value into `dst`.
    Fill { dst: HeapRef },
    /// The value is a record; forward its `field` into `dst`.
    GetField { field: u32, dst: HeapRef },
    /// The value is a record; apply the matching handler promise.
    DesSelect {
        handlers: Vec<HeapRef>,
        dst: HeapRef,
    },
    /// The value is a closure; apply it to the record held here.
    ApplyHandler { record: HeapRef, dst: HeapRef },
    /// The value is a closure; apply it to the argument promise.
    ApplyTo { arg: HeapRef, dst: HeapRef },
}

#[derive(Debug, Clone)]
pub enum PromiseState {
    /// Waiters in registration order.
    Empty { waiters: Vec<HeapRef> },
    Fulfilled(HeapRef),
}

/// Everything that lives in the arena.
#[derive(Debug, Clone)]
pub enum Obj {
    /// Forwarding pointer; only exists during collection.
    Moved(HeapRef),
    Str(Rc<str>),
    Int(i64),
    Dbl(f64),
    Record {
        sum: Rc<Sum>,
        cons: u32,
        /// One promise per field.
        fields: Vec<HeapRef>,
    },
    Closure {
        fun: u32,
        scope: Option<HeapRef>,
    },
    Scope {
        fun: u32,
        parent: Option<HeapRef>,
        /// Calling scope, for stack traces only.
        caller: Option<HeapRef>,
        /// One promise per term of the function.
        slots: Vec<HeapRef>,
    },
    Promise(PromiseState),
    Cont(Cont),
    /// Handle into the external job table.
    Job(u32),
    /// Handle into the target (memoization) table.
    Target(u32),
}

impl Obj {
    fn for_each_ref(&mut self, mut f: impl FnMut(&mut HeapRef)) {
        match self {
            Obj::Moved(_) | Obj::Str(_) | Obj::Int(_) | Obj::Dbl(_) | Obj::Job(_)
            | Obj::Target(_) => {}
            Obj::Record { fields, .. } => fields.iter_mut().for_each(&mut f),
            Obj::Closure { scope, .. } => {
                if let Some(s) = scope {
                    f(s);
                }
            }
            Obj::Scope {
                parent,
                caller,
                slots,
                ..
            } => {
                if let Some(p) = parent {
                    f(p);
                }
                if let Some(c) = caller {
                    f(c);
                }
                slots.iter_mut().for_each(&mut f);
            }
            Obj::Promise(state) => match state {
                PromiseState::Empty { waiters } => waiters.iter_mut().for_each(&mut f),
                PromiseState::Fulfilled(v) => f(v),
            },
            Obj::Cont(cont) => match cont {
                Cont::Step { scope, .. } => f(scope),
                Cont::Fill { dst } => f(dst),
                Cont::GetField { dst, .. } => f(dst),
                Cont::DesSelect { handlers, dst } => {
                    handlers.iter_mut().for_each(&mut f);
                    f(dst);
                }
                Cont::ApplyHandler { record, dst } => {
                    f(record);
                    f(dst);
                }
                Cont::ApplyTo { arg, dst } => {
                    f(arg);
                    f(dst);
                }
            },
        }
    }
}

pub struct Heap {
    objs: Vec<Obj>,
    limit: usize,
    /// Growth factor when a collection still leaves the arena tight;
    /// `<= 0` disables growth (stale mode, used to shake out GC bugs).
    factor: f64,
    roots: Vec<Option<HeapRef>>,
    free_roots: Vec<u32>,
    pub collections: u64,
}

const INITIAL_LIMIT: usize = 1 << 16;

impl Heap {
    pub fn new(factor: f64) -> Self {
        Self {
            objs: Vec::new(),
            limit: INITIAL_LIMIT,
            factor,
            roots: Vec::new(),
            free_roots: Vec::new(),
            collections: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.objs.len()
    }

    /// Override the arena soft limit (debugging and GC stress tests).
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    /// Check that `n` more objects fit without collecting.
    pub fn reserve(&self, n: usize) -> Result<(), GcNeeded> {
        if self.objs.len() + n <= self.limit {
            Ok(())
        } else {
            Err(GcNeeded)
        }
    }

    /// Allocate. The caller must have reserved capacity; the arena may
    /// spill past its soft limit rather than lose an object mid-step.
    pub fn alloc(&mut self, obj: Obj) -> HeapRef {
        let r = HeapRef(self.objs.len() as u32);
        self.objs.push(obj);
        r
    }

    pub fn get(&self, r: HeapRef) -> &Obj {
        &self.objs[r.0 as usize]
    }

    pub fn get_mut(&mut self, r: HeapRef) -> &mut Obj {
        &mut self.objs[r.0 as usize]
    }

    pub fn root(&mut self, r: HeapRef) -> RootId {
        match self.free_roots.pop() {
            Some(slot) => {
                self.roots[slot as usize] = Some(r);
                RootId(slot)
            }
            None => {
                self.roots.push(Some(r));
                RootId(self.roots.len() as u32 - 1)
            }
        }
    }

    pub fn unroot(&mut self, id: RootId) {
        self.roots[id.0 as usize] = None;
        self.free_roots.push(id.0);
    }

    pub fn deref(&self, id: RootId) -> HeapRef {
        self.roots[id.0 as usize].expect("dereferenced a cleared root")
    }

    /// Stop-the-world copy. `extra` lists references held outside the
    /// root set (the work stack) that must survive and be rewritten.
    pub fn collect(&mut self, extra: &mut [&mut HeapRef]) {
        let mut from = std::mem::take(&mut self.objs);
        let mut to: Vec<Obj> = Vec::with_capacity(from.len());

        fn forward(r: HeapRef, from: &mut [Obj], to: &mut Vec<Obj>) -> HeapRef {
            match from[r.0 as usize] {
                Obj::Moved(n) => n,
                _ => {
                    let n = HeapRef(to.len() as u32);
                    let obj = std::mem::replace(&mut from[r.0 as usize], Obj::Moved(n));
                    to.push(obj);
                    n
                }
            }
        }

        for slot in self.roots.iter_mut().flatten() {
            *slot = forward(*slot, &mut from, &mut to);
        }
        for r in extra.iter_mut() {
            **r = forward(**r, &mut from, &mut to);
        }

        // Cheney scan: forward the references of every copied object.
        let mut scan = 0usize;
        while scan < to.len() {
            let mut obj = std::mem::replace(&mut to[scan], Obj::Int(0));
            obj.for_each_ref(|r| {
                *r = forward(*r, &mut from, &mut to);
            });
            to[scan] = obj;
            scan += 1;
        }

        self.collections += 1;
        self.objs = to;

        // Still tight after the copy: grow (unless growth is disabled).
        if self.objs.len() * 2 > self.limit && self.factor > 0.0 {
            self.limit = ((self.limit as f64) * self.factor) as usize;
        }
    }

    /// Make room for `n` more objects after a collection. Returns false
    /// when growth is disabled and the space still is not there.
    pub fn grow_for(&mut self, n: usize) -> bool {
        if self.factor <= 0.0 {
            return self.reserve(n).is_ok();
        }
        while self.objs.len() + n > self.limit {
            self.limit = ((self.limit as f64) * self.factor).ceil() as usize;
        }
        true
    }

    /// Live-object count reachable from the roots, for tests.
    pub fn live(&self) -> usize {
        self.objs.len()
    }
}
