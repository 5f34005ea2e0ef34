//! End-to-end build scenarios: reuse, invalidation, overlap, and the
//! frontend diagnostics, driven through the library driver against real
//! processes and an on-disk catalog.

use kiln::{build, BuildRequest};
use std::fs;
use std::path::Path;

fn req(dir: &Path, src: &str, expr: &str) -> BuildRequest {
    BuildRequest {
        sources: vec![("build.kiln".to_string(), src.to_string())],
        expr: expr.to_string(),
        db_path: Some(dir.join("kiln.db")),
        visible: vec![],
        jobs: 1,
        ..Default::default()
    }
}

fn job_rows(dir: &Path) -> usize {
    let db = kiln_db::Database::open(Some(&dir.join("kiln.db")), false).unwrap();
    db.dump_jobs().unwrap().len()
}

const ENV: &str = "(Cons \"PATH=/bin:/usr/bin\" Nil)";

#[test]
fn identity_job_reuse_skips_second_run() {
    let dir = tempfile::tempdir().unwrap();
    let f = dir.path().join("f.txt");
    fs::write(&f, "data").unwrap();

    let src = format!(
        "global def main = jobStdout (runJob \"say hi\" \"{d}\" (Cons \"echo\" (Cons \"hi\" Nil)) {env} \"\" 4660 (Cons \"{f}\" Nil) (Cons \"{f}\" Nil) Nil True)\n",
        d = dir.path().display(),
        env = ENV,
        f = f.display(),
    );

    let mut r = req(dir.path(), &src, "main");
    r.visible = vec![f.display().to_string()];
    let first = build(r).unwrap();
    assert_eq!(first.exit, 0, "diags: {:?}", first.diagnostics);
    assert_eq!(first.result.as_deref(), Some("hi\n"));
    assert_eq!(job_rows(dir.path()), 1);

    let mut r = req(dir.path(), &src, "main");
    r.visible = vec![f.display().to_string()];
    let second = build(r).unwrap();
    assert_eq!(second.exit, 0, "diags: {:?}", second.diagnostics);
    assert_eq!(second.result.as_deref(), Some("hi\n"));
    // Replayed from the catalog: no new job row was created.
    assert_eq!(job_rows(dir.path()), 1);
}

#[test]
fn modified_input_invalidates_and_reruns() {
    let dir = tempfile::tempdir().unwrap();
    let f = dir.path().join("f.txt");
    fs::write(&f, "v1").unwrap();

    let src = format!(
        "global def main = jobStdout (runJob \"cat\" \"{d}\" (Cons \"cat\" (Cons \"f.txt\" Nil)) {env} \"\" 7 (Cons \"{f}\" Nil) (Cons \"{f}\" Nil) Nil True)\n",
        d = dir.path().display(),
        env = ENV,
        f = f.display(),
    );

    let mut r = req(dir.path(), &src, "main");
    r.visible = vec![f.display().to_string()];
    let first = build(r).unwrap();
    assert_eq!(first.exit, 0, "diags: {:?}", first.diagnostics);
    assert_eq!(first.result.as_deref(), Some("v1"));

    fs::write(&f, "v2").unwrap();
    let mut r = req(dir.path(), &src, "main");
    r.visible = vec![f.display().to_string()];
    let second = build(r).unwrap();
    assert_eq!(second.exit, 0, "diags: {:?}", second.diagnostics);
    assert_eq!(second.result.as_deref(), Some("v2"), "stale replay served");
}

#[test]
fn overlapping_outputs_abort_the_build() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");

    let write_cmd = "(Cons \"sh\" (Cons \"-c\" (Cons \"echo x > out.txt\" Nil)))";
    let src = format!(
        "def a = runJob \"w1\" \"{d}\" {cmd} {env} \"\" 1 Nil Nil (Cons \"{o}\" Nil) True\n\
         def b = runJob \"w2\" \"{d}\" {cmd2} {env} \"\" 2 Nil Nil (Cons \"{o}\" Nil) True\n\
         global def main = jobStdout a ^ jobStdout b\n",
        d = dir.path().display(),
        cmd = write_cmd,
        cmd2 = "(Cons \"sh\" (Cons \"-c\" (Cons \"echo y > out.txt\" Nil)))",
        env = ENV,
        o = out.display(),
    );

    let outcome = build(req(dir.path(), &src, "main")).unwrap();
    assert_eq!(outcome.exit, 1, "two writers of one path must abort");
}

#[test]
fn value_definition_cycle_is_diagnosed() {
    let dir = tempfile::tempdir().unwrap();
    let src = "def a = b + 1\ndef b = a + 1\nglobal def main = a\n";
    let outcome = build(req(dir.path(), src, "main")).unwrap();
    assert_eq!(outcome.exit, 1);
    let all = outcome.diagnostics.join("\n");
    assert!(
        all.contains("value definition cycle"),
        "diagnostics: {}",
        all
    );
    assert!(all.contains('a') && all.contains('b'), "diagnostics: {}", all);
}

#[test]
fn non_exhaustive_match_is_diagnosed_with_witness() {
    let dir = tempfile::tempdir().unwrap();
    let src = "global def f x = match x\n    True = 0\nglobal def main = f True\n";
    let outcome = build(req(dir.path(), src, "main")).unwrap();
    assert_eq!(outcome.exit, 1);
    let all = outcome.diagnostics.join("\n");
    assert!(all.contains("non-exhaustive match"), "diagnostics: {}", all);
    assert!(all.contains("False"), "diagnostics: {}", all);
}

#[test]
fn duplicate_definitions_are_diagnosed() {
    let dir = tempfile::tempdir().unwrap();
    let src = "def x = 1\ndef x = 2\nglobal def main = 0\n";
    let outcome = build(req(dir.path(), src, "main")).unwrap();
    assert_eq!(outcome.exit, 1);
    let all = outcome.diagnostics.join("\n");
    assert!(all.contains("duplicate definition"), "diagnostics: {}", all);
}

#[test]
fn pure_duplicate_work_still_computes_correctly() {
    let dir = tempfile::tempdir().unwrap();
    // Two textually distinct `add 1 2` chains merge under CSE without
    // changing the observable result.
    let src = "\
global def add x y = x + y
global def main =
    def u = print (format (add 1 2 + add 1 2))
    add 1 2
";
    let outcome = build(req(dir.path(), src, "main")).unwrap();
    assert_eq!(outcome.exit, 0, "diags: {:?}", outcome.diagnostics);
    assert_eq!(outcome.stdout, "6");
    assert_eq!(outcome.result.as_deref(), Some("3"));
}

#[test]
fn virtual_jobs_complete_without_processes() {
    let dir = tempfile::tempdir().unwrap();
    let src = format!(
        "def j = job_create \"v\" \"{d}\" (Cons \"virtual\" Nil) Nil \"\" 9 False\n\
         def go = job_virtual j \"hello virtual\" \"\" 0\n\
         global def main = jobStdout j\n",
        d = dir.path().display(),
    );
    let outcome = build(req(dir.path(), &src, "main")).unwrap();
    assert_eq!(outcome.exit, 0, "diags: {:?}", outcome.diagnostics);
    assert_eq!(outcome.result.as_deref(), Some("hello virtual"));
    assert_eq!(job_rows(dir.path()), 1);
}

#[test]
fn check_mode_reruns_despite_cache_hit() {
    let dir = tempfile::tempdir().unwrap();
    let src = format!(
        "global def main = jobStdout (runJob \"hi\" \"{d}\" (Cons \"echo\" (Cons \"hi\" Nil)) {env} \"\" 11 Nil Nil Nil True)\n",
        d = dir.path().display(),
        env = ENV,
    );

    let first = build(req(dir.path(), &src, "main")).unwrap();
    assert_eq!(first.exit, 0, "diags: {:?}", first.diagnostics);

    let mut audit = req(dir.path(), &src, "main");
    audit.check = true;
    let second = build(audit).unwrap();
    assert_eq!(second.exit, 0, "diags: {:?}", second.diagnostics);
    assert_eq!(second.result.as_deref(), Some("hi\n"), "audit rerun output");
}

#[test]
fn failing_job_reports_through_result() {
    let dir = tempfile::tempdir().unwrap();
    let src = format!(
        "def j = runJob \"boom\" \"{d}\" (Cons \"sh\" (Cons \"-c\" (Cons \"exit 3\" Nil))) {env} \"\" 5 Nil Nil Nil False\n\
         global def main = match (job_status j)\n    0 = \"ok\"\n    _ = \"failed\"\n",
        d = dir.path().display(),
        env = ENV,
    );
    let outcome = build(req(dir.path(), &src, "main")).unwrap();
    assert_eq!(outcome.exit, 0, "diags: {:?}", outcome.diagnostics);
    assert_eq!(outcome.result.as_deref(), Some("failed"));
}
