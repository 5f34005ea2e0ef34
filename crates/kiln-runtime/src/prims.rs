//! Primitive registry.
//!
//! Maps names to typed, effect-classified native functions. The
//! frontend sees only arity/flags and a typing hook (via
//! [`PrimInterface`]); the evaluator calls `run`. Job primitives are
//! registered by the jobs crate; this module carries the integer,
//! double, string, compare, panic, print, and target families.

use crate::heap::{HeapRef, Obj};
use crate::runtime::Runtime;
use kiln_lang::datatype::{Sum, SumRegistry};
use kiln_lang::prim::{PrimDesc, PrimInterface, PrimTyper};
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug)]
pub enum PrimError {
    /// Allocation pressure; replay after a collection.
    Gc,
    /// Blocked on this promise; replay after it fulfills.
    Wait(HeapRef),
    /// Runtime panic (kind 5): abort the build.
    Panic(String),
}

pub type PrimRun = Box<dyn Fn(&mut Runtime, &[HeapRef], HeapRef) -> Result<(), PrimError>>;

pub struct PrimEntry {
    pub desc: PrimDesc,
    pub typer: PrimTyper,
    pub run: PrimRun,
}

#[derive(Default)]
pub struct PrimRegistry {
    map: HashMap<String, PrimEntry>,
}

impl PrimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, desc: PrimDesc, typer: PrimTyper, run: PrimRun) {
        self.map.insert(
            name.to_string(),
            PrimEntry { desc, typer, run },
        );
    }

    pub fn get(&self, name: &str) -> Option<&PrimEntry> {
        self.map.get(name)
    }

    /// The frontend's view: arity, flags, and typing hooks.
    pub fn interface(&self) -> PrimInterface {
        let mut iface = PrimInterface::new();
        for (name, entry) in &self.map {
            iface.declare(name, entry.desc, entry.typer);
        }
        iface
    }
}

// ----------------------------------------------------------------------
// Value helpers shared with the job primitives.
// ----------------------------------------------------------------------

pub fn want_int(rt: &Runtime, v: HeapRef) -> Result<i64, PrimError> {
    match rt.heap.get(v) {
        Obj::Int(i) => Ok(*i),
        other => Err(PrimError::Panic(format!(
            "expected an Integer, got {:?}",
            other
        ))),
    }
}

pub fn want_double(rt: &Runtime, v: HeapRef) -> Result<f64, PrimError> {
    match rt.heap.get(v) {
        Obj::Dbl(d) => Ok(*d),
        other => Err(PrimError::Panic(format!(
            "expected a Double, got {:?}",
            other
        ))),
    }
}

pub fn want_str(rt: &Runtime, v: HeapRef) -> Result<Rc<str>, PrimError> {
    match rt.heap.get(v) {
        Obj::Str(s) => Ok(s.clone()),
        other => Err(PrimError::Panic(format!(
            "expected a String, got {:?}",
            other
        ))),
    }
}

/// Allocate a field-less record of `sum` member `idx`.
pub fn make_enum(rt: &mut Runtime, sum: &Rc<Sum>, idx: usize) -> HeapRef {
    rt.heap.alloc(Obj::Record {
        sum: sum.clone(),
        cons: idx as u32,
        fields: Vec::new(),
    })
}

/// Allocate a record with already-evaluated field values.
pub fn make_record(rt: &mut Runtime, sum: &Rc<Sum>, idx: usize, values: &[HeapRef]) -> HeapRef {
    let fields: Vec<HeapRef> = values.iter().map(|&v| rt.full_promise(v)).collect();
    rt.heap.alloc(Obj::Record {
        sum: sum.clone(),
        cons: idx as u32,
        fields,
    })
}

fn order_index(o: std::cmp::Ordering) -> usize {
    match o {
        std::cmp::Ordering::Less => 0,
        std::cmp::Ordering::Equal => 1,
        std::cmp::Ordering::Greater => 2,
    }
}

// ----------------------------------------------------------------------
// Typers (plain functions so they stay `fn` pointers).
// ----------------------------------------------------------------------

use kiln_lang::types::{TypeContext, TypeId};

fn type_int_binop(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    args.iter().all(|&a| {
        let t = cx.integer();
        cx.unify(a, t).is_ok()
    }) && {
        let t = cx.integer();
        cx.unify(out, t).is_ok()
    }
}

fn type_int_cmp(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    args.iter().all(|&a| {
        let t = cx.integer();
        cx.unify(a, t).is_ok()
    }) && {
        let t = cx.ctor("Order", vec![]);
        cx.unify(out, t).is_ok()
    }
}

fn type_dbl_binop(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    args.iter().all(|&a| {
        let t = cx.double();
        cx.unify(a, t).is_ok()
    }) && {
        let t = cx.double();
        cx.unify(out, t).is_ok()
    }
}

fn type_dbl_cmp(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    args.iter().all(|&a| {
        let t = cx.double();
        cx.unify(a, t).is_ok()
    }) && {
        let t = cx.ctor("Order", vec![]);
        cx.unify(out, t).is_ok()
    }
}

fn type_str_binop(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    args.iter().all(|&a| {
        let t = cx.string();
        cx.unify(a, t).is_ok()
    }) && {
        let t = cx.string();
        cx.unify(out, t).is_ok()
    }
}

fn type_str_cmp(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    args.iter().all(|&a| {
        let t = cx.string();
        cx.unify(a, t).is_ok()
    }) && {
        let t = cx.ctor("Order", vec![]);
        cx.unify(out, t).is_ok()
    }
}

fn type_panic(cx: &mut TypeContext, args: &[TypeId], _out: TypeId) -> bool {
    let t = cx.string();
    cx.unify(args[0], t).is_ok()
}

fn type_print(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    let t = cx.string();
    cx.unify(args[0], t).is_ok() && {
        let u = cx.ctor("Unit", vec![]);
        cx.unify(out, u).is_ok()
    }
}

fn type_format(cx: &mut TypeContext, _args: &[TypeId], out: TypeId) -> bool {
    let t = cx.string();
    cx.unify(out, t).is_ok()
}

fn type_tnew(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    let s = cx.string();
    cx.unify(args[0], s).is_ok() && {
        let t = cx.ctor("Target", vec![]);
        cx.unify(out, t).is_ok()
    }
}

fn type_tget(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    let table = cx.ctor("Target", vec![]);
    if cx.unify(args[0], table).is_err() {
        return false;
    }
    // args[1] is any key; args[2] is Unit => out.
    let unit = cx.ctor("Unit", vec![]);
    let thunk = cx.arrow(unit, out);
    cx.unify(args[2], thunk).is_ok()
}

// ----------------------------------------------------------------------
// Registration
// ----------------------------------------------------------------------

/// Register the core primitive families. `sums` must already hold the
/// prelude's distinguished data types.
pub fn register_basics(reg: &mut PrimRegistry, sums: &SumRegistry) {
    let order = sums.order.clone().expect("prelude defines Order");
    let unit = sums.unit.clone().expect("prelude defines Unit");

    // Integers.
    reg.register(
        "iadd",
        PrimDesc::pure(2),
        type_int_binop,
        Box::new(|rt, args, out| {
            let (a, b) = (want_int(rt, args[0])?, want_int(rt, args[1])?);
            let v = a
                .checked_add(b)
                .ok_or_else(|| PrimError::Panic("integer overflow in iadd".into()))?;
            let v = rt.heap.alloc(Obj::Int(v));
            rt.fulfill(out, v);
            Ok(())
        }),
    );
    reg.register(
        "isub",
        PrimDesc::pure(2),
        type_int_binop,
        Box::new(|rt, args, out| {
            let (a, b) = (want_int(rt, args[0])?, want_int(rt, args[1])?);
            let v = a
                .checked_sub(b)
                .ok_or_else(|| PrimError::Panic("integer overflow in isub".into()))?;
            let v = rt.heap.alloc(Obj::Int(v));
            rt.fulfill(out, v);
            Ok(())
        }),
    );
    reg.register(
        "imul",
        PrimDesc::pure(2),
        type_int_binop,
        Box::new(|rt, args, out| {
            let (a, b) = (want_int(rt, args[0])?, want_int(rt, args[1])?);
            let v = a
                .checked_mul(b)
                .ok_or_else(|| PrimError::Panic("integer overflow in imul".into()))?;
            let v = rt.heap.alloc(Obj::Int(v));
            rt.fulfill(out, v);
            Ok(())
        }),
    );
    reg.register(
        "idiv",
        PrimDesc::pure(2),
        type_int_binop,
        Box::new(|rt, args, out| {
            let (a, b) = (want_int(rt, args[0])?, want_int(rt, args[1])?);
            if b == 0 {
                return Err(PrimError::Panic("division by zero".into()));
            }
            let v = a
                .checked_div(b)
                .ok_or_else(|| PrimError::Panic("integer overflow in idiv".into()))?;
            let v = rt.heap.alloc(Obj::Int(v));
            rt.fulfill(out, v);
            Ok(())
        }),
    );
    reg.register(
        "imod",
        PrimDesc::pure(2),
        type_int_binop,
        Box::new(|rt, args, out| {
            let (a, b) = (want_int(rt, args[0])?, want_int(rt, args[1])?);
            if b == 0 {
                return Err(PrimError::Panic("division by zero".into()));
            }
            let v = a
                .checked_rem(b)
                .ok_or_else(|| PrimError::Panic("integer overflow in imod".into()))?;
            let v = rt.heap.alloc(Obj::Int(v));
            rt.fulfill(out, v);
            Ok(())
        }),
    );
    {
        let order = order.clone();
        reg.register(
            "icmp",
            PrimDesc::pure(2),
            type_int_cmp,
            Box::new(move |rt, args, out| {
                let (a, b) = (want_int(rt, args[0])?, want_int(rt, args[1])?);
                let v = make_enum(rt, &order, order_index(a.cmp(&b)));
                rt.fulfill(out, v);
                Ok(())
            }),
        );
    }

    // Doubles.
    reg.register(
        "dadd",
        PrimDesc::pure(2),
        type_dbl_binop,
        Box::new(|rt, args, out| {
            let (a, b) = (want_double(rt, args[0])?, want_double(rt, args[1])?);
            let v = rt.heap.alloc(Obj::Dbl(a + b));
            rt.fulfill(out, v);
            Ok(())
        }),
    );
    reg.register(
        "dsub",
        PrimDesc::pure(2),
        type_dbl_binop,
        Box::new(|rt, args, out| {
            let (a, b) = (want_double(rt, args[0])?, want_double(rt, args[1])?);
            let v = rt.heap.alloc(Obj::Dbl(a - b));
            rt.fulfill(out, v);
            Ok(())
        }),
    );
    reg.register(
        "dmul",
        PrimDesc::pure(2),
        type_dbl_binop,
        Box::new(|rt, args, out| {
            let (a, b) = (want_double(rt, args[0])?, want_double(rt, args[1])?);
            let v = rt.heap.alloc(Obj::Dbl(a * b));
            rt.fulfill(out, v);
            Ok(())
        }),
    );
    reg.register(
        "ddiv",
        PrimDesc::pure(2),
        type_dbl_binop,
        Box::new(|rt, args, out| {
            let (a, b) = (want_double(rt, args[0])?, want_double(rt, args[1])?);
            let v = rt.heap.alloc(Obj::Dbl(a / b));
            rt.fulfill(out, v);
            Ok(())
        }),
    );
    {
        let order = order.clone();
        reg.register(
            "dcmp",
            PrimDesc::pure(2),
            type_dbl_cmp,
            Box::new(move |rt, args, out| {
                let (a, b) = (want_double(rt, args[0])?, want_double(rt, args[1])?);
                let v = make_enum(rt, &order, order_index(a.total_cmp(&b)));
                rt.fulfill(out, v);
                Ok(())
            }),
        );
    }

    // Strings.
    reg.register(
        "scat",
        PrimDesc::pure(2),
        type_str_binop,
        Box::new(|rt, args, out| {
            let (a, b) = (want_str(rt, args[0])?, want_str(rt, args[1])?);
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(&a);
            s.push_str(&b);
            let v = rt.heap.alloc(Obj::Str(Rc::from(s.as_str())));
            rt.fulfill(out, v);
            Ok(())
        }),
    );
    {
        let order = order.clone();
        reg.register(
            "scmp",
            PrimDesc::pure(2),
            type_str_cmp,
            Box::new(move |rt, args, out| {
                let (a, b) = (want_str(rt, args[0])?, want_str(rt, args[1])?);
                let v = make_enum(rt, &order, order_index(a.cmp(&b)));
                rt.fulfill(out, v);
                Ok(())
            }),
        );
    }
    reg.register(
        "format",
        PrimDesc::pure(1),
        type_format,
        Box::new(|rt, args, out| {
            let s = rt.render(args[0]);
            let v = rt.heap.alloc(Obj::Str(Rc::from(s.as_str())));
            rt.fulfill(out, v);
            Ok(())
        }),
    );

    // Effects.
    reg.register(
        "panic",
        PrimDesc::effect(1),
        type_panic,
        Box::new(|rt, args, _out| {
            let msg = want_str(rt, args[0])?;
            Err(PrimError::Panic(msg.to_string()))
        }),
    );
    {
        let unit2 = unit.clone();
        reg.register(
            "print",
            PrimDesc::effect(1),
            type_print,
            Box::new(move |rt, args, out| {
                let s = want_str(rt, args[0])?;
                rt.stdout.extend_from_slice(s.as_bytes());
                let v = make_enum(rt, &unit2, 0);
                rt.fulfill(out, v);
                Ok(())
            }),
        );
    }

    // Targets: at-most-once evaluation per argument tuple.
    reg.register(
        "tnew",
        PrimDesc::ordered(1),
        type_tnew,
        Box::new(|rt, args, out| {
            let label = want_str(rt, args[0])?;
            let id = rt.target_new(&label);
            let v = rt.heap.alloc(Obj::Target(id));
            rt.fulfill(out, v);
            Ok(())
        }),
    );
    {
        let unit2 = unit;
        reg.register(
            "tget",
            PrimDesc::effect(3).with_fnarg(),
            type_tget,
            Box::new(move |rt, args, out| {
                let table = match rt.heap.get(args[0]) {
                    Obj::Target(id) => *id,
                    other => {
                        return Err(PrimError::Panic(format!(
                            "expected a Target, got {:?}",
                            other
                        )))
                    }
                };
                let key = rt.value_hash(args[1]).map_err(PrimError::Wait)?;
                let check = rt.check_hash(args[1]).map_err(PrimError::Wait)?;
                // Everything below must succeed without collecting, or a
                // replay would find a half-installed entry.
                rt.heap
                    .reserve(rt.max_scope() + 16)
                    .map_err(|_| PrimError::Gc)?;
                let (p, installed) = rt
                    .target_entry(table, key, check)
                    .map_err(PrimError::Panic)?;
                if installed {
                    let u = make_enum(rt, &unit2, 0);
                    let up = rt.full_promise(u);
                    rt.apply(args[2], up, p, None)
                        .expect("reserved above this apply");
                }
                rt.link(p, out);
                Ok(())
            }),
        );
    }
}
