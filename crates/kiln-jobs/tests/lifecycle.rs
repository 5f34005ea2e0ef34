//! Job lifecycle against real processes and an in-memory catalog.

use kiln_db::{Database, JobKey};
use kiln_jobs::{state, JobSums, JobTable};
use kiln_lang::diagnostics::Diagnostics;
use kiln_lang::parser::parse_file;
use kiln_lang::datatype::SumRegistry;
use kiln_runtime::{Obj, PrimRegistry, PromiseState, Runtime};
use kiln_ssa::program::{CodeFun, Program};
use std::collections::HashMap;
use std::rc::Rc;

const DATA: &str = "\
data Boolean = True | False
data Order = LT | EQ | GT
data List a = Nil | Cons a (List a)
data Unit = Unit
data Pair a b = Pair a b
data Result o f = Pass o | Fail f
";

fn sums() -> SumRegistry {
    let mut diags = Diagnostics::new();
    let f = parse_file("<prelude>", DATA, &mut diags);
    let mut sums = SumRegistry::new();
    for d in &f.datas {
        sums.define(d, &mut diags);
    }
    assert!(diags.ok());
    sums
}

fn mini_runtime() -> Runtime {
    let program = Program {
        funs: vec![CodeFun {
            label: "top".into(),
            nargs: 0,
            terms: vec![],
            output: 0,
        }],
        entry: 0,
    };
    Runtime::new(program, Rc::new(PrimRegistry::new()), 1.5)
}

fn drive(table: &mut JobTable, rt: &mut Runtime, db: &mut Database) {
    for _ in 0..600 {
        rt.run();
        if !table.alive() {
            return;
        }
        table.wait(rt, db);
    }
    panic!("jobs made no progress within the deadline");
}

fn promise_str(rt: &Runtime, root: kiln_runtime::RootId) -> Option<String> {
    let p = rt.heap.deref(root);
    match rt.heap.get(p) {
        Obj::Promise(PromiseState::Fulfilled(v)) => match rt.heap.get(*v) {
            Obj::Str(s) => Some(s.to_string()),
            _ => None,
        },
        _ => None,
    }
}

#[test]
fn echo_runs_captures_and_merges() {
    let sums = sums();
    let mut rt = mini_runtime();
    let mut db = Database::open(None, false).unwrap();
    let mut table = JobTable::new(2, false, JobSums::from_registry(&sums));

    let dir = tempfile::tempdir().unwrap();
    let idx = table
        .create(
            &mut rt,
            &mut db,
            "echo hi",
            &dir.path().display().to_string(),
            b"echo\0hi\0".to_vec(),
            b"PATH=/bin:/usr/bin\0".to_vec(),
            String::new(),
            0x1234,
            true,
        )
        .unwrap();
    table.launch(idx, 0, &mut rt, &mut db);
    drive(&mut table, &mut rt, &mut db);

    assert!(table.job(idx).is(state::MERGED));
    assert_eq!(table.job(idx).reality.status, 0);
    assert_eq!(
        promise_str(&rt, table.job(idx).q_stdout).as_deref(),
        Some("hi\n")
    );
    assert!(table.job(idx).reality.runtime >= 0.0);
}

#[test]
fn finished_job_is_reusable_and_replays_stdout() {
    let sums = sums();
    let mut rt = mini_runtime();
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("kiln.db");
    let mut db = Database::open(Some(&db_path), false).unwrap();
    let mut table = JobTable::new(2, false, JobSums::from_registry(&sums));

    let out_file = dir.path().join("result.txt");
    std::fs::write(&out_file, "artifact").unwrap();

    let cmd = b"echo\0hi\0".to_vec();
    let env = b"PATH=/bin:/usr/bin\0".to_vec();
    let workdir = dir.path().display().to_string();
    let idx = table
        .create(
            &mut rt,
            &mut db,
            "echo hi",
            &workdir,
            cmd.clone(),
            env.clone(),
            String::new(),
            0x1234,
            true,
        )
        .unwrap();
    table.launch(idx, 0, &mut rt, &mut db);
    drive(&mut table, &mut rt, &mut db);
    table
        .finish(
            idx,
            &mut rt,
            &mut db,
            vec![],
            vec![out_file.display().to_string()],
        )
        .unwrap();
    assert!(table.job(idx).is(state::FINISHED));
    drop(table);
    drop(db);

    // Second build: identical fingerprint, no process spawned.
    let mut db = Database::open(Some(&db_path), false).unwrap();
    let mut table = JobTable::new(2, false, JobSums::from_registry(&sums));
    let key = JobKey {
        directory: &workdir,
        commandline: &cmd,
        environment: &env,
        stdin: "",
        signature: 0x1234,
    };
    let hit = db
        .reuse_job(&key, &HashMap::new(), false)
        .unwrap()
        .expect("fingerprint hit");
    let cached = table.create_cached(&mut rt, &mut db, hit).unwrap();
    assert!(table.job(cached).is(state::FINISHED));
    assert_eq!(
        promise_str(&rt, table.job(cached).q_stdout).as_deref(),
        Some("hi\n")
    );
}

#[test]
fn overlap_between_two_build_jobs_aborts() {
    let sums = sums();
    let mut rt = mini_runtime();
    let mut db = Database::open(None, false).unwrap();
    let mut table = JobTable::new(2, false, JobSums::from_registry(&sums));

    let dir = tempfile::tempdir().unwrap();
    let shared = dir.path().join("shared.o");
    std::fs::write(&shared, "x").unwrap();
    let workdir = dir.path().display().to_string();

    let mut finish_one = |table: &mut JobTable,
                          rt: &mut Runtime,
                          db: &mut Database,
                          cmd: &[u8]|
     -> Result<(), String> {
        let idx = table
            .create(
                rt,
                db,
                "writer",
                &workdir,
                cmd.to_vec(),
                b"PATH=/bin:/usr/bin\0".to_vec(),
                String::new(),
                1,
                true,
            )
            .unwrap();
        table.launch(idx, 0, rt, db);
        drive(table, rt, db);
        table.finish(idx, rt, db, vec![], vec![shared.display().to_string()])
    };

    assert!(finish_one(&mut table, &mut rt, &mut db, b"true\0").is_ok());
    let err = finish_one(&mut table, &mut rt, &mut db, b"echo\0x\0").unwrap_err();
    assert!(
        err.contains("File output by multiple Jobs"),
        "unexpected error: {}",
        err
    );
    assert!(err.contains("shared.o"), "unexpected error: {}", err);
}

#[test]
fn hash_pseudo_command_completes_virtually() {
    let sums = sums();
    let mut rt = mini_runtime();
    let mut db = Database::open(None, false).unwrap();
    let mut table = JobTable::new(2, false, JobSums::from_registry(&sums));

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("src.txt");
    std::fs::write(&file, "content").unwrap();

    let mut cmd = b"<hash>\0".to_vec();
    cmd.extend_from_slice(file.display().to_string().as_bytes());
    cmd.push(0);
    let idx = table
        .create(
            &mut rt,
            &mut db,
            "hash",
            &dir.path().display().to_string(),
            cmd,
            Vec::new(),
            String::new(),
            0,
            false,
        )
        .unwrap();
    table.launch(idx, 1, &mut rt, &mut db);

    // Virtual: complete without any wait() round.
    assert!(table.job(idx).is(state::MERGED));
    let out = promise_str(&rt, table.job(idx).q_stdout).expect("hash printed");
    assert_eq!(out.trim_end().len(), 64);
    assert_eq!(
        out.trim_end(),
        kiln_db::hash_bytes(b"content"),
        "in-process hash matches the content hash"
    );
    // And the catalog learned the file's hash.
    let recorded = db.current_hash(&file.display().to_string()).unwrap();
    assert_eq!(recorded.as_deref(), Some(out.trim_end()));
}

#[test]
fn pool_admission_is_bounded_but_drains() {
    let sums = sums();
    let mut rt = mini_runtime();
    let mut db = Database::open(None, false).unwrap();
    // One slot in the CPU pool; three queued jobs run one after another.
    let mut table = JobTable::new(1, false, JobSums::from_registry(&sums));
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().display().to_string();

    let mut ids = Vec::new();
    for i in 0..3 {
        let idx = table
            .create(
                &mut rt,
                &mut db,
                &format!("echo {}", i),
                &workdir,
                format!("echo\0{}\0", i).into_bytes(),
                b"PATH=/bin:/usr/bin\0".to_vec(),
                String::new(),
                i,
                true,
            )
            .unwrap();
        table.launch(idx, 0, &mut rt, &mut db);
        ids.push(idx);
    }
    drive(&mut table, &mut rt, &mut db);
    for (i, &idx) in ids.iter().enumerate() {
        assert!(table.job(idx).is(state::MERGED), "job {} never merged", i);
        assert_eq!(
            promise_str(&rt, table.job(idx).q_stdout).as_deref(),
            Some(format!("{}\n", i).as_str())
        );
    }
}

#[test]
fn failed_launch_reports_rather_than_crashes() {
    let sums = sums();
    let mut rt = mini_runtime();
    let mut db = Database::open(None, false).unwrap();
    let mut table = JobTable::new(2, false, JobSums::from_registry(&sums));
    let dir = tempfile::tempdir().unwrap();

    let idx = table
        .create(
            &mut rt,
            &mut db,
            "broken",
            &dir.path().display().to_string(),
            b"kiln-no-such-binary\0".to_vec(),
            b"\0".to_vec(),
            String::new(),
            0,
            true,
        )
        .unwrap();
    table.launch(idx, 0, &mut rt, &mut db);
    assert!(table.job(idx).is(state::MERGED));
    assert!(table.job(idx).bad_launch.is_some());
    assert_eq!(table.job(idx).reality.status, 127);
}
