//! Job primitives.
//!
//! The language side drives the job lifecycle through these:
//! `job_create` allocates the job and its catalog row, `job_cache`
//! consults the fingerprint index, `job_launch` queues onto a pool,
//! `job_virtual` completes launchless work, `job_finish` records trees
//! and runs the overlap checks, and the accessors block (by suspending
//! the calling interpret on the matching queue) until their lifecycle
//! point fires.

use crate::job::state;
use crate::table::JobTable;
use kiln_db::Database;
use kiln_lang::datatype::SumRegistry;
use kiln_lang::prim::PrimDesc;
use kiln_lang::types::{TypeContext, TypeId};
use kiln_runtime::{
    make_record, want_int, want_str, HeapRef, Obj, PrimError, PrimRegistry, PromiseState, Runtime,
};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::info;

// ----------------------------------------------------------------------
// Value plumbing
// ----------------------------------------------------------------------

fn want_job(rt: &Runtime, v: HeapRef) -> Result<usize, PrimError> {
    match rt.heap.get(v) {
        Obj::Job(id) => Ok(*id as usize),
        other => Err(PrimError::Panic(format!("expected a Job, got {:?}", other))),
    }
}

fn want_bool(rt: &Runtime, v: HeapRef) -> Result<bool, PrimError> {
    match rt.heap.get(v) {
        Obj::Record { cons, .. } => Ok(*cons == 0), // True | False
        other => Err(PrimError::Panic(format!(
            "expected a Boolean, got {:?}",
            other
        ))),
    }
}

/// Walk a `List String` value; an unfulfilled link or element suspends.
fn want_string_list(rt: &Runtime, v: HeapRef) -> Result<Vec<String>, PrimError> {
    let mut out = Vec::new();
    let mut cur = v;
    loop {
        match rt.heap.get(cur) {
            Obj::Record { cons: 0, .. } => return Ok(out),
            Obj::Record { cons: 1, fields, .. } => {
                let head = resolve(rt, fields[0])?;
                out.push(want_str(rt, head)?.to_string());
                cur = resolve(rt, fields[1])?;
            }
            other => {
                return Err(PrimError::Panic(format!(
                    "expected a List, got {:?}",
                    other
                )))
            }
        }
    }
}

fn resolve(rt: &Runtime, promise: HeapRef) -> Result<HeapRef, PrimError> {
    match rt.heap.get(promise) {
        Obj::Promise(PromiseState::Fulfilled(v)) => Ok(*v),
        Obj::Promise(PromiseState::Empty { .. }) => Err(PrimError::Wait(promise)),
        _ => unreachable!("record fields are promises"),
    }
}

/// NUL-join a list blob the way the catalog stores command lines.
fn join_blob(items: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for i in items {
        out.extend_from_slice(i.as_bytes());
        out.push(0);
    }
    out
}

// ----------------------------------------------------------------------
// Typers
// ----------------------------------------------------------------------

fn t_string_list(cx: &mut TypeContext) -> TypeId {
    let s = cx.string();
    cx.ctor("List", vec![s])
}

fn type_job_create(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    let s1 = cx.string();
    let s2 = cx.string();
    let s3 = cx.string();
    let lst1 = t_string_list(cx);
    let lst2 = t_string_list(cx);
    let int = cx.integer();
    let b = cx.ctor("Boolean", vec![]);
    let job = cx.ctor("Job", vec![]);
    cx.unify(args[0], s1).is_ok()          // label
        && cx.unify(args[1], s2).is_ok()   // directory
        && cx.unify(args[2], lst1).is_ok() // command line
        && cx.unify(args[3], lst2).is_ok() // environment
        && cx.unify(args[4], s3).is_ok()   // stdin path
        && cx.unify(args[5], int).is_ok()  // signature
        && cx.unify(args[6], b).is_ok()    // keep
        && cx.unify(out, job).is_ok()
}

fn type_job_cache(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    let s1 = cx.string();
    let s2 = cx.string();
    let lst1 = t_string_list(cx);
    let lst2 = t_string_list(cx);
    let vis = t_string_list(cx);
    let int = cx.integer();
    let job = cx.ctor("Job", vec![]);
    let err = cx.string();
    let res = cx.ctor("Result", vec![job, err]);
    cx.unify(args[0], s1).is_ok()
        && cx.unify(args[1], lst1).is_ok()
        && cx.unify(args[2], lst2).is_ok()
        && cx.unify(args[3], s2).is_ok()
        && cx.unify(args[4], int).is_ok()
        && cx.unify(args[5], vis).is_ok()
        && cx.unify(out, res).is_ok()
}

fn type_job_unit(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    let job = cx.ctor("Job", vec![]);
    let int = cx.integer();
    let unit = cx.ctor("Unit", vec![]);
    cx.unify(args[0], job).is_ok()
        && args[1..]
            .iter()
            .all(|&a| {
                let i = int;
                cx.unify(a, i).is_ok()
            })
        && cx.unify(out, unit).is_ok()
}

fn type_job_virtual(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    let job = cx.ctor("Job", vec![]);
    let s1 = cx.string();
    let s2 = cx.string();
    let int = cx.integer();
    let unit = cx.ctor("Unit", vec![]);
    cx.unify(args[0], job).is_ok()
        && cx.unify(args[1], s1).is_ok()
        && cx.unify(args[2], s2).is_ok()
        && cx.unify(args[3], int).is_ok()
        && cx.unify(out, unit).is_ok()
}

fn type_job_finish(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    let job = cx.ctor("Job", vec![]);
    let ins = t_string_list(cx);
    let outs = t_string_list(cx);
    let ok = cx.string();
    let err = cx.string();
    let res = cx.ctor("Result", vec![ok, err]);
    cx.unify(args[0], job).is_ok()
        && cx.unify(args[1], ins).is_ok()
        && cx.unify(args[2], outs).is_ok()
        && cx.unify(out, res).is_ok()
}

fn type_job_output(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    let job = cx.ctor("Job", vec![]);
    let int = cx.integer();
    let s = cx.string();
    cx.unify(args[0], job).is_ok()
        && cx.unify(args[1], int).is_ok()
        && cx.unify(out, s).is_ok()
}

fn type_job_status(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    let job = cx.ctor("Job", vec![]);
    let int = cx.integer();
    cx.unify(args[0], job).is_ok() && cx.unify(out, int).is_ok()
}

fn type_job_tree(cx: &mut TypeContext, args: &[TypeId], out: TypeId) -> bool {
    let job = cx.ctor("Job", vec![]);
    let int = cx.integer();
    let lst = t_string_list(cx);
    cx.unify(args[0], job).is_ok()
        && cx.unify(args[1], int).is_ok()
        && cx.unify(out, lst).is_ok()
}

// ----------------------------------------------------------------------
// Registration
// ----------------------------------------------------------------------

/// Register the job family. Closures capture the shared table/catalog.
pub fn register_job_prims(
    reg: &mut PrimRegistry,
    sums: &SumRegistry,
    table: Rc<RefCell<JobTable>>,
    db: Rc<RefCell<Database>>,
) {
    let result_sum = sums.result.clone().expect("prelude defines Result");
    let unit_sum = sums.unit.clone().expect("prelude defines Unit");

    {
        let (table, db) = (table.clone(), db.clone());
        reg.register(
            "job_create",
            PrimDesc::effect(7),
            type_job_create,
            Box::new(move |rt, args, out| {
                let label = want_str(rt, args[0])?;
                let dir = want_str(rt, args[1])?;
                let cmd = join_blob(&want_string_list(rt, args[2])?);
                let env = join_blob(&want_string_list(rt, args[3])?);
                let stdin = want_str(rt, args[4])?;
                let signature = want_int(rt, args[5])?;
                let keep = want_bool(rt, args[6])?;
                let idx = table
                    .borrow_mut()
                    .create(
                        rt,
                        &mut db.borrow_mut(),
                        &label,
                        &dir,
                        cmd,
                        env,
                        stdin.to_string(),
                        signature,
                        keep,
                    )
                    .map_err(|e| PrimError::Panic(e.to_string()))?;
                let v = rt.heap.alloc(Obj::Job(idx as u32));
                rt.fulfill(out, v);
                Ok(())
            }),
        );
    }

    {
        let (table, db) = (table.clone(), db.clone());
        let result_sum2 = result_sum.clone();
        reg.register(
            "job_cache",
            PrimDesc::effect(6),
            type_job_cache,
            Box::new(move |rt, args, out| {
                let dir = want_str(rt, args[0])?;
                let cmd = join_blob(&want_string_list(rt, args[1])?);
                let env = join_blob(&want_string_list(rt, args[2])?);
                let stdin = want_str(rt, args[3])?;
                let signature = want_int(rt, args[4])?;
                let visible_paths = want_string_list(rt, args[5])?;

                let mut db_ref = db.borrow_mut();
                let mut visible = std::collections::HashMap::new();
                for p in &visible_paths {
                    if let Some(h) = db_ref
                        .current_hash(p)
                        .map_err(|e| PrimError::Panic(e.to_string()))?
                    {
                        visible.insert(p.clone(), h);
                    }
                }
                let key = kiln_db::JobKey {
                    directory: &dir,
                    commandline: &cmd,
                    environment: &env,
                    stdin: &stdin,
                    signature,
                };
                let check = table.borrow().check;
                let hit = db_ref
                    .reuse_job(&key, &visible, check)
                    .map_err(|e| PrimError::Panic(e.to_string()))?;
                let (cons, payload) = match hit {
                    Some(reused) if !check => {
                        let idx = table
                            .borrow_mut()
                            .create_cached(rt, &mut db_ref, reused)
                            .map_err(|e| PrimError::Panic(e.to_string()))?;
                        (0, rt.heap.alloc(Obj::Job(idx as u32)))
                    }
                    Some(reused) => {
                        info!(job_id = reused.job_id, "cache hit under --check; rerunning");
                        (
                            1,
                            rt.heap
                                .alloc(Obj::Str(Rc::from("cache hit (check mode; rerunning)"))),
                        )
                    }
                    None => (1, rt.heap.alloc(Obj::Str(Rc::from("no cached job")))),
                };
                let v = make_record(rt, &result_sum2, cons, &[payload]);
                rt.fulfill(out, v);
                Ok(())
            }),
        );
    }

    {
        let (table, db) = (table.clone(), db.clone());
        let unit2 = unit_sum.clone();
        reg.register(
            "job_launch",
            PrimDesc::effect(2),
            type_job_unit,
            Box::new(move |rt, args, out| {
                let idx = want_job(rt, args[0])?;
                let pool = want_int(rt, args[1])?.max(0) as usize;
                table
                    .borrow_mut()
                    .launch(idx, pool, rt, &mut db.borrow_mut());
                let v = kiln_runtime::make_enum(rt, &unit2, 0);
                rt.fulfill(out, v);
                Ok(())
            }),
        );
    }

    {
        let (table, db) = (table.clone(), db.clone());
        let unit2 = unit_sum.clone();
        reg.register(
            "job_virtual",
            PrimDesc::effect(4),
            type_job_virtual,
            Box::new(move |rt, args, out| {
                let idx = want_job(rt, args[0])?;
                let stdout = want_str(rt, args[1])?.to_string();
                let stderr = want_str(rt, args[2])?.to_string();
                let status = want_int(rt, args[3])? as i32;
                let usage = kiln_db::JobUsage {
                    status,
                    ..Default::default()
                };
                table.borrow_mut().virtual_complete(
                    idx,
                    rt,
                    &mut db.borrow_mut(),
                    stdout,
                    stderr,
                    usage,
                );
                let v = kiln_runtime::make_enum(rt, &unit2, 0);
                rt.fulfill(out, v);
                Ok(())
            }),
        );
    }

    {
        let (table, db) = (table.clone(), db.clone());
        reg.register(
            "job_finish",
            PrimDesc::effect(3),
            type_job_finish,
            Box::new(move |rt, args, out| {
                let idx = want_job(rt, args[0])?;
                let inputs = want_string_list(rt, args[1])?;
                let outputs = want_string_list(rt, args[2])?;
                // Finishing waits for the merge point.
                {
                    let t = table.borrow();
                    let job = t.job(idx);
                    if job.is(state::FINISHED) {
                        return Err(PrimError::Panic(format!(
                            "job {} finished twice",
                            job.label
                        )));
                    }
                    if !job.is(state::MERGED) {
                        let p = rt.heap.deref(job.q_reality);
                        return Err(PrimError::Wait(p));
                    }
                }
                let report = {
                    let mut t = table.borrow_mut();
                    match t.finish(idx, rt, &mut db.borrow_mut(), inputs, outputs) {
                        Ok(()) => rt.heap.deref(t.job(idx).q_report),
                        Err(msg) => {
                            eprintln!("{}", msg);
                            rt.abort = true;
                            rt.heap.deref(t.job(idx).q_report)
                        }
                    }
                };
                rt.link(report, out);
                Ok(())
            }),
        );
    }

    {
        let table = table.clone();
        reg.register(
            "job_output",
            PrimDesc::ordered(2),
            type_job_output,
            Box::new(move |rt, args, out| {
                let idx = want_job(rt, args[0])?;
                let fd = want_int(rt, args[1])?;
                let q = {
                    let t = table.borrow();
                    match fd {
                        1 => t.job(idx).q_stdout,
                        2 => t.job(idx).q_stderr,
                        other => {
                            return Err(PrimError::Panic(format!(
                                "job_output descriptor must be 1 or 2, got {}",
                                other
                            )))
                        }
                    }
                };
                let p = rt.heap.deref(q);
                rt.link(p, out);
                Ok(())
            }),
        );
    }

    {
        let table = table.clone();
        reg.register(
            "job_status",
            PrimDesc::ordered(1),
            type_job_status,
            Box::new(move |rt, args, out| {
                let idx = want_job(rt, args[0])?;
                let t = table.borrow();
                let job = t.job(idx);
                if !job.is(state::MERGED) {
                    let p = rt.heap.deref(job.q_reality);
                    return Err(PrimError::Wait(p));
                }
                let status = job.reality.status as i64;
                drop(t);
                let v = rt.heap.alloc(Obj::Int(status));
                rt.fulfill(out, v);
                Ok(())
            }),
        );
    }

    {
        let table = table.clone();
        reg.register(
            "job_tree",
            PrimDesc::ordered(2),
            type_job_tree,
            Box::new(move |rt, args, out| {
                let idx = want_job(rt, args[0])?;
                let access = want_int(rt, args[1])?;
                let q = {
                    let t = table.borrow();
                    match access {
                        1 => t.job(idx).q_inputs,
                        2 => t.job(idx).q_outputs,
                        other => {
                            return Err(PrimError::Panic(format!(
                                "job_tree access must be 1 or 2, got {}",
                                other
                            )))
                        }
                    }
                };
                let p = rt.heap.deref(q);
                rt.link(p, out);
                Ok(())
            }),
        );
    }

    {
        let unit2 = unit_sum;
        reg.register(
            "job_kill",
            PrimDesc::effect(2),
            type_job_unit,
            Box::new(move |rt, args, out| {
                let idx = want_job(rt, args[0])?;
                let sig = want_int(rt, args[1])? as i32;
                table.borrow_mut().kill(idx, sig);
                let v = kiln_runtime::make_enum(rt, &unit2, 0);
                rt.fulfill(out, v);
                Ok(())
            }),
        );
    }
}
