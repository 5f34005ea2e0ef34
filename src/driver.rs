//! Pipeline driving: sources in, evaluated build out.
//!
//! Parses the prelude and workspace files, resolves and types the
//! program, lowers and optimizes it, then alternates the evaluator's
//! `run()` with the job table's `wait()` until no runnable work and no
//! outstanding jobs remain.

use anyhow::{Context, Result};
use kiln_db::Database;
use kiln_jobs::{register_job_prims, JobSums, JobTable};
use kiln_lang::datatype::SumRegistry;
use kiln_lang::diagnostics::Diagnostics;
use kiln_lang::infer::infer_program;
use kiln_lang::parser::{parse_expression, parse_file, FileSyntax};
use kiln_lang::resolver::resolve_program;
use kiln_lang::types::TypeContext;
use kiln_runtime::{exit_now, register_basics, PrimRegistry, Runtime};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{info, warn};

pub const PRELUDE: &str = include_str!("prelude.kiln");

pub struct BuildRequest {
    /// User sources as `(name, text)`.
    pub sources: Vec<(String, String)>,
    /// Entry expression evaluated as the build body.
    pub expr: String,
    /// Catalog location; `None` keeps it in memory.
    pub db_path: Option<PathBuf>,
    /// Absolute paths hashed into the catalog's visible set.
    pub visible: Vec<String>,
    pub jobs: usize,
    pub check: bool,
    pub wait_for_db: bool,
    pub heap_factor: f64,
    pub quiet: bool,
    pub stop_after_parse: bool,
    pub stop_after_type_check: bool,
    pub profile: bool,
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            expr: "Unit".to_string(),
            db_path: None,
            visible: Vec::new(),
            jobs: 1,
            check: false,
            wait_for_db: false,
            heap_factor: 1.5,
            quiet: false,
            stop_after_parse: false,
            stop_after_type_check: false,
            profile: false,
        }
    }
}

pub struct BuildOutcome {
    pub exit: i32,
    /// Primitive `print` output.
    pub stdout: String,
    pub diagnostics: Vec<String>,
    /// Rendered result value, when evaluation converged.
    pub result: Option<String>,
}

fn failed(diags: &mut Diagnostics) -> BuildOutcome {
    BuildOutcome {
        exit: 1,
        stdout: String::new(),
        diagnostics: diags.take().iter().map(|d| d.to_string()).collect(),
        result: None,
    }
}

pub fn build(req: BuildRequest) -> Result<BuildOutcome> {
    let mut diags = Diagnostics::new();

    // ---- Frontend -----------------------------------------------------
    let mut files: Vec<FileSyntax> = Vec::with_capacity(req.sources.len() + 1);
    files.push(parse_file("<prelude>", PRELUDE, &mut diags));
    for (name, text) in &req.sources {
        files.push(parse_file(name, text, &mut diags));
    }
    if req.stop_after_parse {
        let mut out = Vec::new();
        for f in &files {
            for d in &f.map.defs {
                out.push(format!("{}: def {} = {}", f.file, d.name, d.body.summarize()));
            }
        }
        let exit = if diags.ok() { 0 } else { 1 };
        let mut outcome = failed(&mut diags);
        outcome.exit = exit;
        outcome.result = Some(out.join("\n"));
        return Ok(outcome);
    }
    if !diags.ok() {
        return Ok(failed(&mut diags));
    }

    let mut sums = SumRegistry::new();
    for f in &files {
        for d in &f.datas {
            sums.define(d, &mut diags);
        }
    }
    sums.check_special(&mut diags);
    if !diags.ok() {
        return Ok(failed(&mut diags));
    }

    // ---- Catalog and scheduler ---------------------------------------
    let mut db = Database::open(req.db_path.as_deref(), req.wait_for_db)
        .context("opening the build catalog")?;
    db.begin_txn().context("opening the visible-set transaction")?;
    for path in &req.visible {
        match kiln_db::hash_path(std::path::Path::new(path)) {
            Ok(h) => {
                let modified = std::fs::symlink_metadata(path)
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                db.add_hash(path, &h, modified)
                    .with_context(|| format!("recording {}", path))?;
            }
            Err(e) => warn!(path = %path, "visible file unreadable: {}", e),
        }
    }
    db.end_txn().context("closing the visible-set transaction")?;
    let entropy = db.entropy();

    let table = Rc::new(RefCell::new(JobTable::new(
        req.jobs,
        req.check,
        JobSums::from_registry(&sums),
    )));
    let db = Rc::new(RefCell::new(db));

    let mut registry = PrimRegistry::new();
    register_basics(&mut registry, &sums);
    register_job_prims(&mut registry, &sums, table.clone(), db.clone());
    let iface = registry.interface();

    // ---- Resolve, type, lower ----------------------------------------
    let Some(body) = parse_expression(&req.expr, &mut diags) else {
        return Ok(failed(&mut diags));
    };
    let Some(mut root) = resolve_program(&files, body, &sums, &iface, &mut diags) else {
        return Ok(failed(&mut diags));
    };
    let mut cx = TypeContext::new();
    infer_program(&mut root, &mut cx, &iface, &mut diags);
    if !diags.ok() {
        return Ok(failed(&mut diags));
    }
    if req.stop_after_type_check {
        let mut outcome = failed(&mut diags);
        outcome.exit = 0;
        return Ok(outcome);
    }

    let fun = kiln_ssa::lower(&root);
    let fun = kiln_ssa::optimize(fun);
    let program = kiln_ssa::flatten(fun);
    info!(funs = program.funs.len(), "program compiled");

    // ---- Evaluate -----------------------------------------------------
    let mut rt = Runtime::new(program, Rc::new(registry), req.heap_factor);
    rt.set_hash_key(entropy.0, entropy.1);
    if req.profile {
        rt.enable_profile();
    }
    let result = rt.seed();

    loop {
        rt.run();
        if rt.abort || exit_now() {
            break;
        }
        let progress = table
            .borrow_mut()
            .wait(&mut rt, &mut db.borrow_mut());
        if !progress && rt.idle() && !table.borrow().alive() {
            break;
        }
    }

    // ---- Teardown -----------------------------------------------------
    {
        let mut db = db.borrow_mut();
        if let Err(e) = db.end_txn() {
            warn!("final transaction commit failed: {}", e);
        }
        if let Err(e) = db.set_critical_paths() {
            warn!("critical path accounting failed: {}", e);
        }
        if let Err(e) = db.clean() {
            warn!("catalog sweep failed: {}", e);
        }
    }
    if !req.quiet {
        for label in rt.unfulfilled_targets() {
            eprintln!("warning: target '{}' was keyed but never evaluated", label);
        }
    }
    if req.profile {
        for (chain, hits) in rt.profile_report().into_iter().take(20) {
            eprintln!("profile: {:8} {}", hits, chain);
        }
    }

    let stdout = String::from_utf8_lossy(&rt.stdout).into_owned();
    let rendered = rt.result_value(result).map(|v| rt.render(v));
    let exit = if rt.abort {
        1
    } else if rendered.is_none() {
        if !req.quiet {
            eprintln!("error: the build stalled without finishing its result");
        }
        1
    } else {
        0
    };

    Ok(BuildOutcome {
        exit,
        stdout,
        diagnostics: diags.take().iter().map(|d| d.to_string()).collect(),
        result: rendered,
    })
}
