//! The persistent job catalog.
//!
//! One SQLite file per workspace (`kiln.db`). Jobs are indexed by their
//! identity tuple `(directory, commandline, environment, stdin)` plus
//! the declared dependency `signature`; `files` caches content hashes
//! keyed by `(path, modified)`; `filetree` records the visible, input,
//! and output sets per job; `log` replays captured stdout/stderr;
//! `stats` feeds runtime prediction and critical-path accounting.
//!
//! Multi-statement updates run inside explicit transactions. The schema
//! version is stamped on creation; an existing database with any other
//! version is refused with a remove-it message rather than migrated.

use crate::hash;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database {0} was produced by an incompatible version of kiln; remove it to continue")]
    SchemaMismatch(String),
    #[error("database {0} is busy (another kiln holds it)")]
    Busy(String),
}

/// Resource usage of one completed job.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JobUsage {
    pub status: i32,
    pub runtime: f64,
    pub cputime: f64,
    pub membytes: i64,
    pub ibytes: i64,
    pub obytes: i64,
}

/// File roles within a job's tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Visible = 0,
    Input = 1,
    Output = 2,
}

/// A prior job matched by `reuse_job`.
#[derive(Debug, Clone)]
pub struct ReusedJob {
    pub job_id: i64,
    pub usage: JobUsage,
    /// Output `(path, hash)` pairs recorded at finish time.
    pub outputs: Vec<(String, String)>,
}

/// Identity tuple shared by insert, reuse, and the prior-row cleanups.
#[derive(Debug, Clone)]
pub struct JobKey<'a> {
    pub directory: &'a str,
    pub commandline: &'a [u8],
    pub environment: &'a [u8],
    pub stdin: &'a str,
    pub signature: i64,
}

/// A row answering `--input` / `--output` queries.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub job_id: i64,
    pub label: String,
    pub directory: String,
    pub commandline: Vec<u8>,
}

pub struct Database {
    conn: Connection,
    run_id: i64,
    entropy: (u64, u64),
    in_txn: bool,
}

const SCHEMA_SQL: &str = "
create table if not exists schema(
  version integer primary key);
create table if not exists entropy(
  row_id integer primary key autoincrement,
  seed   integer not null);
create table if not exists runs(
  run_id integer primary key autoincrement,
  time   text    not null default current_timestamp);
create table if not exists files(
  file_id  integer primary key,
  path     text    not null,
  hash     text    not null,
  modified integer not null);
create unique index if not exists filenames on files(path);
create table if not exists stats(
  stat_id    integer primary key autoincrement,
  hashcode   integer not null,
  status     integer not null,
  runtime    real    not null,
  cputime    real    not null,
  membytes   integer not null,
  ibytes     integer not null,
  obytes     integer not null,
  pathtime   real);
create index if not exists stathash on stats(hashcode);
create table if not exists jobs(
  job_id      integer primary key autoincrement,
  run_id      integer not null references runs(run_id),
  use_id      integer not null references runs(run_id),
  label       text    not null,
  directory   text    not null,
  commandline blob    not null,
  environment blob    not null,
  stdin       text    not null,
  signature   integer not null,
  stack       blob    not null,
  stat_id     integer references stats(stat_id),
  endtime     text    not null default '',
  keep        integer not null default 0);
create index if not exists job on jobs(directory, commandline, environment, stdin, signature, keep, job_id, stat_id);
create table if not exists filetree(
  tree_id  integer primary key autoincrement,
  access   integer not null,
  job_id   integer not null references jobs(job_id) on delete cascade,
  file_id  integer not null references files(file_id),
  unique(job_id, access, file_id) on conflict ignore);
create index if not exists filesearch on filetree(file_id, access, job_id);
create table if not exists log(
  log_id     integer primary key autoincrement,
  job_id     integer not null references jobs(job_id) on delete cascade,
  descriptor integer not null,
  seconds    real    not null,
  output     text    not null);
create index if not exists logorder on log(job_id, descriptor, log_id);
create table if not exists tags(
  job_id     integer not null references jobs(job_id) on delete cascade,
  uri        text,
  unique(job_id, uri) on conflict ignore);
create table if not exists tasks(
  task_id    integer primary key autoincrement,
  expression text    not null);
";

fn seed() -> i64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    std::time::SystemTime::now().hash(&mut h);
    std::process::id().hash(&mut h);
    h.finish() as i64
}

impl Database {
    /// Open (or create) the catalog. `None` opens an in-memory database
    /// for tests. With `wait`, a busy database is retried every second;
    /// otherwise it fails immediately.
    pub fn open(path: Option<&Path>, wait: bool) -> Result<Self, DbError> {
        let name = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string());
        let conn = loop {
            let attempt = match path {
                Some(p) => Connection::open(p),
                None => Connection::open_in_memory(),
            };
            match attempt {
                Ok(c) => break c,
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::DatabaseBusy && wait =>
                {
                    warn!("database {} is busy; waiting 1 second", name);
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::DatabaseBusy =>
                {
                    return Err(DbError::Busy(name));
                }
                Err(e) => return Err(e.into()),
            }
        };

        conn.pragma_update(None, "auto_vacuum", "incremental")?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", 0)?;
        conn.pragma_update(None, "locking_mode", "exclusive")?;
        conn.pragma_update(None, "foreign_keys", "on")?;

        conn.execute_batch(SCHEMA_SQL)?;

        // An empty entropy table marks a freshly created database.
        let fresh: i64 =
            conn.query_row("select count(row_id) from entropy", [], |r| r.get(0))?;
        if fresh == 0 {
            conn.execute("insert into entropy(seed) values(?1)", params![seed()])?;
            conn.execute("insert into entropy(seed) values(?1)", params![seed()])?;
            conn.execute(
                "insert or ignore into schema(version) values(?1)",
                params![SCHEMA_VERSION],
            )?;
        } else {
            let version: Option<i64> =
                conn.query_row("select max(version) from schema", [], |r| r.get(0))?;
            if version != Some(SCHEMA_VERSION) {
                return Err(DbError::SchemaMismatch(name));
            }
        }

        let mut seeds = Vec::new();
        {
            let mut stmt = conn.prepare("select seed from entropy order by row_id")?;
            let rows = stmt.query_map([], |r| r.get::<_, i64>(0))?;
            for row in rows {
                seeds.push(row? as u64);
            }
        }
        let entropy = (seeds[0], seeds[1]);

        conn.execute("insert into runs default values", [])?;
        let run_id = conn.last_insert_rowid();
        debug!(run_id, "catalog opened");

        Ok(Self {
            conn,
            run_id,
            entropy,
            in_txn: false,
        })
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    /// Per-database SipHash key for fingerprints and value hashing.
    pub fn entropy(&self) -> (u64, u64) {
        self.entropy
    }

    pub fn begin_txn(&mut self) -> Result<(), DbError> {
        if !self.in_txn {
            self.conn.execute_batch("begin transaction")?;
            self.in_txn = true;
        }
        Ok(())
    }

    pub fn end_txn(&mut self) -> Result<(), DbError> {
        if self.in_txn {
            self.conn.execute_batch("commit transaction")?;
            self.in_txn = false;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Latest recorded content hash for a path, regardless of mtime.
    pub fn current_hash(&self, path: &str) -> Result<Option<String>, DbError> {
        let mut stmt = self
            .conn
            .prepare_cached("select hash from files where path=?1")?;
        Ok(stmt.query_row(params![path], |r| r.get(0)).optional()?)
    }

    /// Cached content hash for an unmodified file.
    pub fn get_hash(&self, path: &str, modified: i64) -> Result<Option<String>, DbError> {
        let mut stmt = self
            .conn
            .prepare_cached("select hash from files where path=?1 and modified=?2")?;
        Ok(stmt
            .query_row(params![path, modified], |r| r.get(0))
            .optional()?)
    }

    /// Record a file's hash. Any job that consumed this path with a
    /// different hash is invalidated first.
    pub fn add_hash(&mut self, path: &str, file_hash: &str, modified: i64) -> Result<(), DbError> {
        self.begin_txn()?;
        self.conn.execute(
            "delete from jobs where job_id in (
               select t.job_id from filetree t join files f on t.file_id=f.file_id
               where t.access=1 and f.path=?1 and f.hash<>?2)",
            params![path, file_hash],
        )?;
        self.conn.execute(
            "insert into files(path, hash, modified) values(?1, ?2, ?3)
             on conflict(path) do update set hash=?2, modified=?3",
            params![path, file_hash, modified],
        )?;
        Ok(())
    }

    fn file_id(&self, path: &str) -> Result<i64, DbError> {
        self.conn.execute(
            "insert or ignore into files(path, hash, modified) values(?1, '', 0)",
            params![path],
        )?;
        let id = self
            .conn
            .query_row("select file_id from files where path=?1", params![path], |r| {
                r.get(0)
            })?;
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Latest recorded usage for a job code, for scheduling prediction.
    pub fn predict_job(&self, hashcode: i64) -> Result<Option<JobUsage>, DbError> {
        let mut stmt = self.conn.prepare_cached(
            "select status, runtime, cputime, membytes, ibytes, obytes
             from stats where hashcode=?1 order by stat_id desc limit 1",
        )?;
        Ok(stmt
            .query_row(params![hashcode], |r| {
                Ok(JobUsage {
                    status: r.get(0)?,
                    runtime: r.get(1)?,
                    cputime: r.get(2)?,
                    membytes: r.get(3)?,
                    ibytes: r.get(4)?,
                    obytes: r.get(5)?,
                })
            })
            .optional()?)
    }

    pub fn insert_job(
        &mut self,
        key: &JobKey<'_>,
        label: &str,
        stack: &str,
    ) -> Result<i64, DbError> {
        self.begin_txn()?;
        self.conn.execute(
            "insert into jobs(run_id, use_id, label, directory, commandline, environment,
                              stdin, signature, stack)
             values(?1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                self.run_id,
                label,
                key.directory,
                key.commandline,
                key.environment,
                key.stdin,
                key.signature,
                stack
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Append captured output for replay and `-v` display.
    pub fn save_output(
        &mut self,
        job_id: i64,
        descriptor: i32,
        output: &str,
        seconds: f64,
    ) -> Result<(), DbError> {
        let mut stmt = self.conn.prepare_cached(
            "insert into log(job_id, descriptor, seconds, output) values(?1, ?2, ?3, ?4)",
        )?;
        stmt.execute(params![job_id, descriptor, seconds, output])?;
        Ok(())
    }

    pub fn get_output(&self, job_id: i64, descriptor: i32) -> Result<String, DbError> {
        let mut stmt = self.conn.prepare_cached(
            "select output from log where job_id=?1 and descriptor=?2 order by log_id",
        )?;
        let rows = stmt.query_map(params![job_id, descriptor], |r| r.get::<_, String>(0))?;
        let mut out = String::new();
        for r in rows {
            out.push_str(&r?);
        }
        Ok(out)
    }

    /// Mark a job finished: write stats and file trees, clear superseded
    /// rows, and report any same-build output overlaps.
    #[allow(clippy::too_many_arguments)]
    pub fn finish_job(
        &mut self,
        job_id: i64,
        key: &JobKey<'_>,
        hashcode: i64,
        keep: bool,
        usage: &JobUsage,
        inputs: &[String],
        outputs: &[(String, String)],
    ) -> Result<Vec<String>, DbError> {
        self.begin_txn()?;

        self.conn.execute(
            "insert into stats(hashcode, status, runtime, cputime, membytes, ibytes, obytes)
             values(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                hashcode,
                usage.status,
                usage.runtime,
                usage.cputime,
                usage.membytes,
                usage.ibytes,
                usage.obytes
            ],
        )?;
        let stat_id = self.conn.last_insert_rowid();
        self.conn.execute(
            "update jobs set stat_id=?2, keep=?3, endtime=current_timestamp where job_id=?1",
            params![job_id, stat_id, keep as i64],
        )?;

        for path in inputs {
            let fid = self.file_id(path)?;
            self.conn.execute(
                "insert into filetree(access, job_id, file_id) values(?1, ?2, ?3)",
                params![Access::Input as i64, job_id, fid],
            )?;
        }
        let now = 0i64;
        for (path, file_hash) in outputs {
            self.add_hash(path, file_hash, now)?;
            let fid = self.file_id(path)?;
            self.conn.execute(
                "insert into filetree(access, job_id, file_id) values(?1, ?2, ?3)",
                params![Access::Output as i64, job_id, fid],
            )?;
        }

        // Older rows with the same identity are superseded.
        self.conn.execute(
            "delete from jobs where directory=?1 and commandline=?2 and environment=?3
               and stdin=?4 and job_id<>?5 and run_id<>?6",
            params![
                key.directory,
                key.commandline,
                key.environment,
                key.stdin,
                job_id,
                self.run_id
            ],
        )?;
        // Older jobs that produced any of the same outputs are stale.
        self.conn.execute(
            "delete from jobs where job_id in (
               select t1.job_id from filetree t1 join filetree t2 on t1.file_id=t2.file_id
               where t1.access=2 and t2.access=2 and t2.job_id=?1
                 and t1.job_id<>?1)
             and run_id<>?2",
            params![job_id, self.run_id],
        )?;

        // Anything left sharing an output came from this same build.
        let mut overlaps = Vec::new();
        {
            let mut stmt = self.conn.prepare_cached(
                "select distinct f.path
                 from filetree t1
                 join filetree t2 on t1.file_id=t2.file_id
                 join files f on f.file_id=t1.file_id
                 where t1.access=2 and t2.access=2 and t2.job_id=?1 and t1.job_id<>?1",
            )?;
            let rows = stmt.query_map(params![job_id], |r| r.get::<_, String>(0))?;
            for r in rows {
                overlaps.push(r?);
            }
        }
        Ok(overlaps)
    }

    /// Find a finished prior job with this exact fingerprint whose inputs
    /// are still in today's visible set and whose outputs are all still
    /// readable. A hit advances the row's `use_id` to the current run
    /// (unless `check`, the replay-audit mode).
    pub fn reuse_job(
        &mut self,
        key: &JobKey<'_>,
        visible: &HashMap<String, String>,
        check: bool,
    ) -> Result<Option<ReusedJob>, DbError> {
        let row: Option<(i64, Option<i64>)> = {
            let mut stmt = self.conn.prepare_cached(
                "select job_id, stat_id from jobs
                 where directory=?1 and commandline=?2 and environment=?3 and stdin=?4
                   and signature=?5 and keep=1
                 order by job_id desc limit 1",
            )?;
            stmt.query_row(
                params![
                    key.directory,
                    key.commandline,
                    key.environment,
                    key.stdin,
                    key.signature
                ],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?
        };
        let Some((job_id, stat_id)) = row else {
            return Ok(None);
        };
        let Some(stat_id) = stat_id else {
            return Ok(None); // never merged; not reusable
        };

        // All recorded inputs must still be visible with the same hash.
        for (path, input_hash) in self.get_tree(Access::Input, job_id)? {
            match visible.get(&path) {
                Some(h) if *h == input_hash => {}
                _ => {
                    debug!(job_id, path = %path, "input drifted; not reusing");
                    return Ok(None);
                }
            }
        }
        // All outputs must still be present on disk.
        let outputs = self.get_tree(Access::Output, job_id)?;
        for (path, _) in &outputs {
            if std::fs::symlink_metadata(path).is_err() {
                debug!(job_id, path = %path, "output missing; not reusing");
                return Ok(None);
            }
        }

        let usage = {
            let mut stmt = self.conn.prepare_cached(
                "select status, runtime, cputime, membytes, ibytes, obytes
                 from stats where stat_id=?1",
            )?;
            stmt.query_row(params![stat_id], |r| {
                Ok(JobUsage {
                    status: r.get(0)?,
                    runtime: r.get(1)?,
                    cputime: r.get(2)?,
                    membytes: r.get(3)?,
                    ibytes: r.get(4)?,
                    obytes: r.get(5)?,
                })
            })?
        };

        if !check {
            self.conn.execute(
                "update jobs set use_id=?2 where job_id=?1",
                params![job_id, self.run_id],
            )?;
        }
        Ok(Some(ReusedJob {
            job_id,
            usage,
            outputs,
        }))
    }

    pub fn get_tree(&self, access: Access, job_id: i64) -> Result<Vec<(String, String)>, DbError> {
        let mut stmt = self.conn.prepare_cached(
            "select f.path, f.hash from filetree t join files f on t.file_id=f.file_id
             where t.job_id=?1 and t.access=?2 order by f.path",
        )?;
        let rows = stmt.query_map(params![job_id, access as i64], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Jobs that read (`Access::Input`) or wrote (`Access::Output`) a path.
    pub fn explain(&self, path: &str, access: Access) -> Result<Vec<JobSummary>, DbError> {
        let mut stmt = self.conn.prepare_cached(
            "select j.job_id, j.label, j.directory, j.commandline
             from jobs j join filetree t on t.job_id=j.job_id
             join files f on f.file_id=t.file_id
             where f.path=?1 and t.access=?2 order by j.job_id",
        )?;
        let rows = stmt.query_map(params![path, access as i64], |r| {
            Ok(JobSummary {
                job_id: r.get(0)?,
                label: r.get(1)?,
                directory: r.get(2)?,
                commandline: r.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn tag_job(&mut self, job_id: i64, uri: &str) -> Result<(), DbError> {
        self.conn.execute(
            "insert into tags(job_id, uri) values(?1, ?2)",
            params![job_id, uri],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Sweep stats rows that are neither the newest for their hashcode
    /// nor referenced by a surviving job, then reclaim space.
    pub fn clean(&mut self) -> Result<(), DbError> {
        self.begin_txn()?;
        self.conn.execute(
            "delete from stats where stat_id not in
               (select max(stat_id) from stats group by hashcode)
             and stat_id not in
               (select stat_id from jobs where stat_id is not null)",
            [],
        )?;
        self.end_txn()?;
        self.conn.execute_batch("pragma incremental_vacuum")?;
        Ok(())
    }

    /// Critical-path times: walk jobs newest-first so every consumer is
    /// settled before its producers, then stamp `stats.pathtime`.
    pub fn set_critical_paths(&mut self) -> Result<(), DbError> {
        struct Row {
            job_id: i64,
            stat_id: i64,
            runtime: f64,
        }
        let mut rows = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "select j.job_id, j.stat_id, s.runtime from jobs j
                 join stats s on s.stat_id=j.stat_id
                 where j.stat_id is not null order by j.job_id desc",
            )?;
            let it = stmt.query_map([], |r| {
                Ok(Row {
                    job_id: r.get(0)?,
                    stat_id: r.get(1)?,
                    runtime: r.get(2)?,
                })
            })?;
            for r in it {
                rows.push(r?);
            }
        }

        let mut pathtime: HashMap<i64, f64> = HashMap::new();
        self.begin_txn()?;
        for row in rows {
            // Consumers: jobs whose inputs include any of this job's outputs.
            let mut downstream: f64 = 0.0;
            {
                let mut stmt = self.conn.prepare_cached(
                    "select distinct t2.job_id from filetree t1
                     join filetree t2 on t1.file_id=t2.file_id
                     where t1.job_id=?1 and t1.access=2 and t2.access=1",
                )?;
                let it = stmt.query_map(params![row.job_id], |r| r.get::<_, i64>(0))?;
                for consumer in it {
                    let consumer = consumer?;
                    if let Some(&t) = pathtime.get(&consumer) {
                        downstream = downstream.max(t);
                    }
                }
            }
            let total = row.runtime + downstream;
            pathtime.insert(row.job_id, total);
            self.conn.execute(
                "update stats set pathtime=?2 where stat_id=?1",
                params![row.stat_id, total],
            )?;
        }
        self.end_txn()
    }

    /// One line per job row, for `--debug-db`.
    pub fn dump_jobs(&self) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "select job_id, run_id, use_id, label, directory, keep, endtime
             from jobs order by job_id",
        )?;
        let rows = stmt.query_map([], |r| {
            let job_id: i64 = r.get(0)?;
            let run_id: i64 = r.get(1)?;
            let use_id: i64 = r.get(2)?;
            let label: String = r.get(3)?;
            let directory: String = r.get(4)?;
            let keep: i64 = r.get(5)?;
            let endtime: String = r.get(6)?;
            Ok(format!(
                "job {} run {} use {} keep {} dir {} end {:10} {}",
                job_id, run_id, use_id, keep, directory, endtime, label
            ))
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Task list
    // ------------------------------------------------------------------

    pub fn add_task(&mut self, expression: &str) -> Result<(), DbError> {
        self.conn.execute(
            "insert into tasks(expression) values(?1)",
            params![expression],
        )?;
        Ok(())
    }

    pub fn remove_task(&mut self, n: i64) -> Result<(), DbError> {
        self.conn
            .execute("delete from tasks where task_id=?1", params![n])?;
        Ok(())
    }

    pub fn list_tasks(&self) -> Result<Vec<(i64, String)>, DbError> {
        let mut stmt = self
            .conn
            .prepare_cached("select task_id, expression from tasks order by task_id")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Convenience for computing a job code with this database's key.
    pub fn job_code(&self, key: &JobKey<'_>) -> i64 {
        hash::job_code(
            self.entropy,
            key.directory,
            key.stdin,
            key.environment,
            key.commandline,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn mem() -> Database {
        Database::open(None, false).expect("in-memory catalog")
    }

    fn key<'a>(cmd: &'a [u8]) -> JobKey<'a> {
        JobKey {
            directory: ".",
            commandline: cmd,
            environment: b"A=1\0",
            stdin: "",
            signature: 0x1234,
        }
    }

    fn touch(dir: &std::path::Path, name: &str, content: &str) -> String {
        let p = dir.join(name);
        let mut f = std::fs::File::create(&p).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        p.display().to_string()
    }

    #[test]
    fn open_stamps_schema_and_entropy() {
        let db = mem();
        assert!(db.run_id() >= 1);
        let (a, b) = db.entropy();
        // Two independent seeds.
        assert!(a != 0 || b != 0);
    }

    #[test]
    fn reopen_preserves_entropy_and_run_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.db");
        let (e1, r1) = {
            let db = Database::open(Some(&path), false).unwrap();
            (db.entropy(), db.run_id())
        };
        let db = Database::open(Some(&path), false).unwrap();
        assert_eq!(db.entropy(), e1, "entropy is per-database, not per-run");
        assert!(db.run_id() > r1);
    }

    #[test]
    fn schema_mismatch_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.db");
        {
            let db = Database::open(Some(&path), false).unwrap();
            db.conn.execute("update schema set version=999", []).unwrap();
        }
        match Database::open(Some(&path), false) {
            Err(DbError::SchemaMismatch(_)) => {}
            other => panic!("expected schema mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn insert_finish_reuse_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = touch(dir.path(), "out.txt", "artifact");
        let in_path = touch(dir.path(), "f.txt", "source");
        let in_hash = hash::hash_bytes(b"source");

        let mut db = mem();
        db.add_hash(&in_path, &in_hash, 1).unwrap();
        let k = key(b"echo\0hi\0");
        let job = db.insert_job(&k, "echo", "").unwrap();
        db.save_output(job, 1, "hi\n", 0.01).unwrap();
        let usage = JobUsage {
            status: 0,
            runtime: 0.1,
            ..Default::default()
        };
        let overlaps = db
            .finish_job(
                job,
                &k,
                42,
                true,
                &usage,
                &[in_path.clone()],
                &[(out_path.clone(), hash::hash_bytes(b"artifact"))],
            )
            .unwrap();
        assert!(overlaps.is_empty());
        db.end_txn().unwrap();

        let mut visible = HashMap::new();
        visible.insert(in_path.clone(), in_hash.clone());
        let hit = db.reuse_job(&k, &visible, false).unwrap().expect("cache hit");
        assert_eq!(hit.job_id, job);
        assert_eq!(hit.usage.status, 0);
        assert_eq!(db.get_output(job, 1).unwrap(), "hi\n");

        // Reuse is idempotent: the same call hits the same row again.
        let hit2 = db.reuse_job(&k, &visible, false).unwrap().expect("second hit");
        assert_eq!(hit2.job_id, hit.job_id);
    }

    #[test]
    fn reuse_misses_when_input_hash_drifts() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = touch(dir.path(), "out.txt", "artifact");
        let in_path = touch(dir.path(), "f.txt", "v1");

        let mut db = mem();
        db.add_hash(&in_path, &hash::hash_bytes(b"v1"), 1).unwrap();
        let k = key(b"cc\0main.c\0");
        let job = db.insert_job(&k, "cc", "").unwrap();
        db.finish_job(
            job,
            &k,
            7,
            true,
            &JobUsage::default(),
            &[in_path.clone()],
            &[(out_path, hash::hash_bytes(b"artifact"))],
        )
        .unwrap();
        db.end_txn().unwrap();

        let mut visible = HashMap::new();
        visible.insert(in_path.clone(), hash::hash_bytes(b"v2"));
        assert!(db.reuse_job(&k, &visible, false).unwrap().is_none());
    }

    #[test]
    fn reuse_misses_when_output_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = touch(dir.path(), "out.txt", "artifact");

        let mut db = mem();
        let k = key(b"gen\0");
        let job = db.insert_job(&k, "gen", "").unwrap();
        db.finish_job(
            job,
            &k,
            7,
            true,
            &JobUsage::default(),
            &[],
            &[(out_path.clone(), hash::hash_bytes(b"artifact"))],
        )
        .unwrap();
        db.end_txn().unwrap();

        std::fs::remove_file(&out_path).unwrap();
        assert!(db.reuse_job(&k, &HashMap::new(), false).unwrap().is_none());
    }

    #[test]
    fn keep_zero_jobs_never_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = touch(dir.path(), "out.txt", "x");
        let mut db = mem();
        let k = key(b"volatile\0");
        let job = db.insert_job(&k, "volatile", "").unwrap();
        db.finish_job(
            job,
            &k,
            7,
            false, // remember, but do not reuse
            &JobUsage::default(),
            &[],
            &[(out_path, hash::hash_bytes(b"x"))],
        )
        .unwrap();
        db.end_txn().unwrap();
        assert!(db.reuse_job(&k, &HashMap::new(), false).unwrap().is_none());
    }

    #[test]
    fn same_build_overlap_detected() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = touch(dir.path(), "shared.txt", "x");
        let mut db = mem();

        let k1 = key(b"writer1\0");
        let j1 = db.insert_job(&k1, "writer1", "").unwrap();
        let o1 = db
            .finish_job(
                j1,
                &k1,
                1,
                true,
                &JobUsage::default(),
                &[],
                &[(out_path.clone(), hash::hash_bytes(b"x"))],
            )
            .unwrap();
        assert!(o1.is_empty());

        let k2 = key(b"writer2\0");
        let j2 = db.insert_job(&k2, "writer2", "").unwrap();
        let o2 = db
            .finish_job(
                j2,
                &k2,
                2,
                true,
                &JobUsage::default(),
                &[],
                &[(out_path.clone(), hash::hash_bytes(b"x"))],
            )
            .unwrap();
        db.end_txn().unwrap();
        assert_eq!(o2, vec![out_path]);
    }

    #[test]
    fn add_hash_invalidates_stale_consumers() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = touch(dir.path(), "o.txt", "out");
        let in_path = touch(dir.path(), "i.txt", "v1");
        let mut db = mem();
        db.add_hash(&in_path, &hash::hash_bytes(b"v1"), 1).unwrap();
        let k = key(b"consumer\0");
        let job = db.insert_job(&k, "consumer", "").unwrap();
        db.finish_job(
            job,
            &k,
            9,
            true,
            &JobUsage::default(),
            &[in_path.clone()],
            &[(out_path, hash::hash_bytes(b"out"))],
        )
        .unwrap();
        db.end_txn().unwrap();

        // New content on the input wipes the consuming job row.
        db.add_hash(&in_path, &hash::hash_bytes(b"v2"), 2).unwrap();
        db.end_txn().unwrap();
        let n: i64 = db
            .conn
            .query_row("select count(*) from jobs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn predict_job_returns_latest_stats() {
        let mut db = mem();
        let k = key(b"p\0");
        for (i, rt) in [(1i64, 1.0f64), (2, 2.0)] {
            let job = db.insert_job(&k, "p", "").unwrap();
            db.finish_job(
                job,
                &k,
                77,
                true,
                &JobUsage {
                    status: 0,
                    runtime: rt,
                    ..Default::default()
                },
                &[],
                &[],
            )
            .unwrap();
            db.end_txn().unwrap();
            let _ = i;
        }
        let u = db.predict_job(77).unwrap().expect("stats exist");
        assert_eq!(u.runtime, 2.0);
    }

    #[test]
    fn explain_by_output_path() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = touch(dir.path(), "exe", "bin");
        let mut db = mem();
        let k = key(b"link\0");
        let job = db.insert_job(&k, "link exe", "").unwrap();
        db.finish_job(
            job,
            &k,
            3,
            true,
            &JobUsage::default(),
            &[],
            &[(out_path.clone(), hash::hash_bytes(b"bin"))],
        )
        .unwrap();
        db.end_txn().unwrap();
        let writers = db.explain(&out_path, Access::Output).unwrap();
        assert_eq!(writers.len(), 1);
        assert_eq!(writers[0].label, "link exe");
        assert!(db.explain(&out_path, Access::Input).unwrap().is_empty());
    }

    #[test]
    fn task_list_roundtrip() {
        let mut db = mem();
        db.add_task("build all").unwrap();
        db.add_task("test all").unwrap();
        let tasks = db.list_tasks().unwrap();
        assert_eq!(tasks.len(), 2);
        db.remove_task(tasks[0].0).unwrap();
        assert_eq!(db.list_tasks().unwrap().len(), 1);
    }

    #[test]
    fn critical_path_accumulates_downstream() {
        let dir = tempfile::tempdir().unwrap();
        let mid = touch(dir.path(), "mid.o", "obj");
        let fin = touch(dir.path(), "app", "bin");
        let mut db = mem();

        let k1 = key(b"compile\0");
        let j1 = db.insert_job(&k1, "compile", "").unwrap();
        db.finish_job(
            j1,
            &k1,
            1,
            true,
            &JobUsage {
                runtime: 2.0,
                ..Default::default()
            },
            &[],
            &[(mid.clone(), hash::hash_bytes(b"obj"))],
        )
        .unwrap();

        let k2 = key(b"link\0");
        let j2 = db.insert_job(&k2, "link", "").unwrap();
        db.finish_job(
            j2,
            &k2,
            2,
            true,
            &JobUsage {
                runtime: 3.0,
                ..Default::default()
            },
            &[mid.clone()],
            &[(fin, hash::hash_bytes(b"bin"))],
        )
        .unwrap();
        db.end_txn().unwrap();

        db.set_critical_paths().unwrap();
        let pt: f64 = db
            .conn
            .query_row(
                "select s.pathtime from stats s join jobs j on j.stat_id=s.stat_id where j.job_id=?1",
                params![j1],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(pt, 5.0, "compile inherits link's downstream time");
    }
}
