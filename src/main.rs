//! kiln entry point: flag handling, workspace discovery, and the
//! parse/resolve/type/lower/evaluate/wait cycle in `driver`.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use kiln::driver::{self, build, BuildRequest};
use kiln::sources;
use kiln_db::Database;
use kiln_runtime::EXIT_ASAP;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tracing_subscriber::EnvFilter;

extern "C" fn request_exit(_sig: libc::c_int) {
    EXIT_ASAP.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    let handler = request_exit as extern "C" fn(libc::c_int);
    unsafe {
        for sig in [
            libc::SIGINT,
            libc::SIGTERM,
            libc::SIGHUP,
            libc::SIGQUIT,
            libc::SIGXCPU,
            libc::SIGXFSZ,
        ] {
            libc::signal(sig, handler as libc::sighandler_t);
        }
    }
}

fn init_logging(cli: &Cli) {
    let default = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(!cli.no_tty)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    install_signal_handlers();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    if let Some(dir) = &cli.init {
        sources::init_workspace(Path::new(dir))?;
        println!("workspace initialized at {}", dir);
        return Ok(0);
    }

    let cwd = std::env::current_dir().context("reading the working directory")?;
    let root = match sources::find_workspace(&cwd) {
        Some(r) => r,
        None if cli.no_workspace => cwd.clone(),
        None => {
            eprintln!("error: no workspace found; run kiln --init DIR first");
            return Ok(1);
        }
    };
    let db_path = root.join(sources::DB_NAME);

    // Catalog-only modes.
    if cli.list_tasks || cli.remove_task.is_some() || cli.debug_db || cli.input.is_some()
        || cli.output.is_some()
    {
        let mut db = Database::open(Some(&db_path), !cli.no_wait)?;
        if cli.list_tasks {
            for (id, expr) in db.list_tasks()? {
                println!("{}: {}", id, expr);
            }
            return Ok(0);
        }
        if let Some(n) = cli.remove_task {
            db.remove_task(n)?;
            return Ok(0);
        }
        if cli.debug_db {
            let rows = db.dump_jobs()?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            return Ok(0);
        }
        let (path, access, verb) = match (&cli.input, &cli.output) {
            (Some(p), _) => (p.clone(), kiln_db::Access::Input, "reads"),
            (_, Some(p)) => (p.clone(), kiln_db::Access::Output, "writes"),
            _ => unreachable!(),
        };
        let abs = absolutize(&root, &path);
        for job in db.explain(&abs, access)? {
            println!(
                "job {} {} {} (in {}): {}",
                job.job_id,
                verb,
                path,
                job.directory,
                String::from_utf8_lossy(&job.commandline).replace('\0', " ")
            );
        }
        return Ok(0);
    }

    if cli.add_task {
        let expr = cli.targets.join(" ");
        let mut db = Database::open(Some(&db_path), !cli.no_wait)?;
        db.add_task(&expr)?;
        println!("stored task: {}", expr);
        return Ok(0);
    }

    // Gather sources.
    let discovered = sources::discover(&root, cli.no_workspace)?;
    let visible = sources::absolute_paths(&root, &discovered);
    let mut texts = Vec::new();
    let source_files = if cli.script {
        cli.targets.iter().map(PathBuf::from).collect()
    } else {
        sources::kiln_files(&discovered)
    };
    for rel in &source_files {
        let path = root.join(rel);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        texts.push((rel.display().to_string(), text));
    }

    if cli.globals {
        let mut diags = kiln_lang::Diagnostics::new();
        let mut names = Vec::new();
        let prelude = kiln_lang::parse_file("<prelude>", driver::PRELUDE, &mut diags);
        names.extend(prelude.globals.iter().cloned());
        for (name, text) in &texts {
            let f = kiln_lang::parse_file(name, text, &mut diags);
            names.extend(f.globals.iter().cloned());
        }
        names.sort();
        for n in names {
            println!("{}", n);
        }
        return Ok(if diags.ok() { 0 } else { 1 });
    }

    let expr = if cli.script || cli.targets.is_empty() {
        // With no target, run the stored tasks (or nothing).
        let db = Database::open(Some(&db_path), !cli.no_wait)?;
        let tasks = db.list_tasks()?;
        drop(db);
        if tasks.is_empty() {
            eprintln!("nothing to do: pass a target expression or store tasks");
            return Ok(0);
        }
        tasks
            .into_iter()
            .map(|(_, e)| e)
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        cli.targets.join(" ")
    };

    let outcome = build(BuildRequest {
        sources: texts,
        expr,
        db_path: Some(db_path),
        visible,
        jobs: cli.jobs,
        check: cli.check,
        wait_for_db: !cli.no_wait,
        heap_factor: cli.heap_factor,
        quiet: cli.quiet,
        stop_after_parse: cli.stop_after_parse,
        stop_after_type_check: cli.stop_after_type_check,
        profile: cli.profile,
    })?;

    for d in &outcome.diagnostics {
        eprintln!("{}", d);
    }
    print!("{}", outcome.stdout);
    if let Some(result) = &outcome.result {
        if cli.verbose || cli.stop_after_parse {
            println!("{}", result);
        }
    }
    Ok(outcome.exit.clamp(0, 255) as u8)
}

fn absolutize(root: &Path, p: &str) -> String {
    let pb = PathBuf::from(p);
    if pb.is_absolute() {
        p.to_string()
    } else {
        root.join(pb).display().to_string()
    }
}
