//! The job table: pool admission, launch, I/O capture, completion.
//!
//! Two pools: pool 0 is CPU-bound and admits at most `max_jobs`
//! concurrent processes; pool 1 is the overflow pool and launches
//! immediately. One reader thread per captured pipe feeds a channel;
//! `wait()` blocks on it (with a 100 ms refresh tick), appends chunks to
//! the in-memory buffers and the catalog log, flips lifecycle bits on
//! EOF, and reaps with `wait4` once both pipes close. The evaluator
//! never blocks on job I/O; the driver alternates `runtime.run()` with
//! `table.wait()`.

use crate::job::{state, Job};
use crate::launch::{split_blob, LaunchSpec, Launched, PosixLauncher, ProcessLauncher};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use kiln_db::{hash_path, Database, JobKey, JobUsage};
use kiln_lang::datatype::{Sum, SumRegistry};
use kiln_runtime::{Obj, Runtime};
use std::collections::VecDeque;
use std::io::Read;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const POOLS: usize = 2;
pub const TERM_ATTEMPTS: u32 = 6;

/// One captured-pipe event; `None` data marks EOF.
pub struct PipeEvent {
    pub job: usize,
    pub fd: u8,
    pub data: Option<Vec<u8>>,
}

/// Distinguished sums the table needs to build language values.
pub struct JobSums {
    pub list: Rc<Sum>,
    pub pair: Rc<Sum>,
    pub result: Rc<Sum>,
    pub unit: Rc<Sum>,
}

impl JobSums {
    pub fn from_registry(sums: &SumRegistry) -> Self {
        Self {
            list: sums.list.clone().expect("prelude defines List"),
            pair: sums.pair.clone().expect("prelude defines Pair"),
            result: sums.result.clone().expect("prelude defines Result"),
            unit: sums.unit.clone().expect("prelude defines Unit"),
        }
    }
}

pub struct JobTable {
    jobs: Vec<Job>,
    queues: Vec<VecDeque<usize>>,
    running: usize,
    max_jobs: usize,
    /// Replay-audit mode: report cache hits but rerun anyway.
    pub check: bool,
    tx: Sender<PipeEvent>,
    rx: Receiver<PipeEvent>,
    launcher: Box<dyn ProcessLauncher>,
    sums: JobSums,
}

impl JobTable {
    pub fn new(max_jobs: usize, check: bool, sums: JobSums) -> Self {
        let (tx, rx) = unbounded();
        Self {
            jobs: Vec::new(),
            queues: (0..POOLS).map(|_| VecDeque::new()).collect(),
            running: 0,
            max_jobs: max_jobs.max(1),
            check,
            tx,
            rx,
            launcher: Box::new(PosixLauncher),
            sums,
        }
    }

    pub fn job(&self, idx: usize) -> &Job {
        &self.jobs[idx]
    }

    pub fn job_mut(&mut self, idx: usize) -> &mut Job {
        &mut self.jobs[idx]
    }

    /// Jobs still owed progress: queued, or forked and not yet merged.
    pub fn alive(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
            || self
                .jobs
                .iter()
                .any(|j| j.is(state::FORKED) && !j.is(state::MERGED))
    }

    fn promises(rt: &mut Runtime) -> [kiln_runtime::RootId; 6] {
        std::array::from_fn(|_| {
            let p = rt.empty_promise();
            rt.heap.root(p)
        })
    }

    /// Allocate a job and its catalog row.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        rt: &mut Runtime,
        db: &mut Database,
        label: &str,
        directory: &str,
        commandline: Vec<u8>,
        environment: Vec<u8>,
        stdin: String,
        signature: i64,
        keep: bool,
    ) -> Result<usize, kiln_db::DbError> {
        let key = JobKey {
            directory,
            commandline: &commandline,
            environment: &environment,
            stdin: &stdin,
            signature,
        };
        let code = db.job_code(&key);
        let predict = db.predict_job(code)?.unwrap_or_default();
        let job_id = db.insert_job(&key, label, "")?;
        let [q_stdout, q_stderr, q_reality, q_inputs, q_outputs, q_report] = Self::promises(rt);
        self.jobs.push(Job {
            job_id,
            code,
            label: label.to_string(),
            directory: directory.to_string(),
            commandline,
            environment,
            stdin,
            signature,
            keep,
            pool: 0,
            state: 0,
            pid: None,
            started: None,
            predict,
            reality: JobUsage::default(),
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            eof: 0,
            q_stdout,
            q_stderr,
            q_reality,
            q_inputs,
            q_outputs,
            q_report,
            bad_launch: None,
            bad_finish: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        });
        debug!(job_id, label, "job created");
        Ok(self.jobs.len() - 1)
    }

    /// Wrap a catalog hit as an already-finished job: no process runs,
    /// the recorded streams and trees replay into the queues.
    pub fn create_cached(
        &mut self,
        rt: &mut Runtime,
        db: &mut Database,
        reused: kiln_db::ReusedJob,
    ) -> Result<usize, kiln_db::DbError> {
        let stdout = db.get_output(reused.job_id, 1)?;
        let stderr = db.get_output(reused.job_id, 2)?;
        let inputs: Vec<String> = db
            .get_tree(kiln_db::Access::Input, reused.job_id)?
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        let [q_stdout, q_stderr, q_reality, q_inputs, q_outputs, q_report] = Self::promises(rt);
        let idx = self.jobs.len();
        self.jobs.push(Job {
            job_id: reused.job_id,
            code: 0,
            label: String::new(),
            directory: String::new(),
            commandline: Vec::new(),
            environment: Vec::new(),
            stdin: String::new(),
            signature: 0,
            keep: true,
            pool: 0,
            state: state::FORKED | state::STDOUT | state::STDERR | state::MERGED | state::FINISHED,
            pid: None,
            started: None,
            predict: reused.usage,
            reality: reused.usage,
            stdout_buf: stdout.clone().into_bytes(),
            stderr_buf: stderr.clone().into_bytes(),
            eof: 3,
            q_stdout,
            q_stderr,
            q_reality,
            q_inputs,
            q_outputs,
            q_report,
            bad_launch: None,
            bad_finish: None,
            inputs: inputs.clone(),
            outputs: reused.outputs.clone(),
        });

        self.fulfill_str(rt, q_stdout, &stdout);
        self.fulfill_str(rt, q_stderr, &stderr);
        self.fulfill_reality(rt, idx);
        let input_list = self.make_string_list(rt, &inputs);
        let p = rt.heap.deref(q_inputs);
        rt.fulfill(p, input_list);
        let outs: Vec<String> = self.jobs[idx]
            .outputs
            .iter()
            .map(|(p, _)| p.clone())
            .collect();
        let output_list = self.make_string_list(rt, &outs);
        let p = rt.heap.deref(q_outputs);
        rt.fulfill(p, output_list);
        self.fulfill_report(rt, idx);
        debug!(job_id = reused.job_id, "replayed cached job");
        Ok(idx)
    }

    /// Queue a job onto a pool and start whatever fits.
    pub fn launch(&mut self, idx: usize, pool: usize, rt: &mut Runtime, db: &mut Database) {
        let pool = pool.min(POOLS - 1);
        self.jobs[idx].pool = pool;
        self.queues[pool].push_back(idx);
        self.pump(rt, db);
    }

    fn pump(&mut self, rt: &mut Runtime, db: &mut Database) {
        while let Some(idx) = self.queues[1].pop_front() {
            self.start(idx, rt, db);
        }
        while self.running < self.max_jobs {
            let Some(idx) = self.queues[0].pop_front() else { break };
            self.start(idx, rt, db);
        }
    }

    fn start(&mut self, idx: usize, rt: &mut Runtime, db: &mut Database) {
        let argv = split_blob(&self.jobs[idx].commandline);

        // The hash pseudo-command is serviced in-process.
        if argv.first().map(|s| s.as_str()) == Some("<hash>") {
            let path = argv.get(1).cloned().unwrap_or_default();
            match hash_path(std::path::Path::new(&path)) {
                Ok(h) => {
                    let modified = std::fs::symlink_metadata(&path)
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0);
                    if let Err(e) = db.add_hash(&path, &h, modified) {
                        warn!(path = %path, "hash not recorded: {}", e);
                    }
                    let usage = JobUsage::default();
                    self.virtual_complete(idx, rt, db, format!("{}\n", h), String::new(), usage);
                }
                Err(e) => {
                    self.jobs[idx].bad_launch = Some(format!("hash {}: {}", path, e));
                    let usage = JobUsage {
                        status: 1,
                        ..Default::default()
                    };
                    self.virtual_complete(idx, rt, db, String::new(), format!("{}\n", e), usage);
                }
            }
            return;
        }

        let spec = LaunchSpec {
            directory: &self.jobs[idx].directory,
            stdin: &self.jobs[idx].stdin,
            commandline: &self.jobs[idx].commandline,
            environment: &self.jobs[idx].environment,
        };
        match self.launcher.launch(&spec) {
            Ok(Launched {
                pid,
                stdout,
                stderr,
            }) => {
                self.jobs[idx].advance(state::FORKED);
                self.jobs[idx].pid = Some(pid);
                self.jobs[idx].started = Some(Instant::now());
                if self.jobs[idx].pool == 0 {
                    self.running += 1;
                }
                spawn_reader(idx, 1, stdout, self.tx.clone());
                spawn_reader(idx, 2, stderr, self.tx.clone());
                debug!(job_id = self.jobs[idx].job_id, pid, "job forked");
            }
            Err(e) => {
                self.jobs[idx].bad_launch = Some(e.to_string());
                let usage = JobUsage {
                    status: 127,
                    ..Default::default()
                };
                self.virtual_complete(
                    idx,
                    rt,
                    db,
                    String::new(),
                    format!("launch failed: {}\n", e),
                    usage,
                );
            }
        }
    }

    /// Launchless completion: the caller supplies the streams and usage;
    /// the job passes FORKED, both stream points, and MERGED in one step.
    pub fn virtual_complete(
        &mut self,
        idx: usize,
        rt: &mut Runtime,
        db: &mut Database,
        stdout: String,
        stderr: String,
        usage: JobUsage,
    ) {
        if self.jobs[idx].is(state::MERGED) {
            warn!(
                job_id = self.jobs[idx].job_id,
                "virtual completion on an already-merged job ignored"
            );
            return;
        }
        let job = &mut self.jobs[idx];
        job.state |= state::FORKED | state::STDOUT | state::STDERR;
        job.advance(state::MERGED);
        job.eof = 3;
        job.stdout_buf = stdout.clone().into_bytes();
        job.stderr_buf = stderr.clone().into_bytes();
        job.reality = usage;
        let job_id = job.job_id;
        if !stdout.is_empty() {
            let _ = db.save_output(job_id, 1, &stdout, 0.0);
        }
        if !stderr.is_empty() {
            let _ = db.save_output(job_id, 2, &stderr, 0.0);
        }
        let (qo, qe) = (self.jobs[idx].q_stdout, self.jobs[idx].q_stderr);
        self.fulfill_str(rt, qo, &stdout);
        self.fulfill_str(rt, qe, &stderr);
        self.fulfill_reality(rt, idx);
    }

    /// Block for job progress (100 ms refresh tick), then drain every
    /// pending event. Returns whether anything advanced.
    pub fn wait(&mut self, rt: &mut Runtime, db: &mut Database) -> bool {
        if !self.alive() {
            return false;
        }
        let mut progress = false;
        match self.rx.recv_timeout(Duration::from_millis(100)) {
            Ok(ev) => {
                self.handle_event(ev, rt, db);
                progress = true;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return false,
        }
        while let Ok(ev) = self.rx.try_recv() {
            self.handle_event(ev, rt, db);
            progress = true;
        }
        progress
    }

    fn handle_event(&mut self, ev: PipeEvent, rt: &mut Runtime, db: &mut Database) {
        let idx = ev.job;
        let seconds = self.jobs[idx]
            .started
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        match ev.data {
            Some(chunk) => {
                let text = String::from_utf8_lossy(&chunk).into_owned();
                let job_id = self.jobs[idx].job_id;
                if let Err(e) = db.save_output(job_id, ev.fd as i32, &text, seconds) {
                    warn!(job_id, "output not logged: {}", e);
                }
                let buf = if ev.fd == 1 {
                    &mut self.jobs[idx].stdout_buf
                } else {
                    &mut self.jobs[idx].stderr_buf
                };
                buf.extend_from_slice(&chunk);
            }
            None => {
                self.jobs[idx].eof |= ev.fd;
                if ev.fd == 1 {
                    self.jobs[idx].advance(state::STDOUT);
                    let q = self.jobs[idx].q_stdout;
                    let text = String::from_utf8_lossy(&self.jobs[idx].stdout_buf).into_owned();
                    self.fulfill_str(rt, q, &text);
                } else {
                    self.jobs[idx].advance(state::STDERR);
                    let q = self.jobs[idx].q_stderr;
                    let text = String::from_utf8_lossy(&self.jobs[idx].stderr_buf).into_owned();
                    self.fulfill_str(rt, q, &text);
                }
                if self.jobs[idx].eof == 3 {
                    self.reap(idx, rt);
                    self.pump(rt, db);
                }
            }
        }
    }

    fn reap(&mut self, idx: usize, rt: &mut Runtime) {
        let Some(pid) = self.jobs[idx].pid else { return };
        let mut status: i32 = 0;
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        let r = unsafe { libc::wait4(pid as i32, &mut status, 0, &mut ru) };
        let exit = if r < 0 {
            warn!(pid, "wait4 failed");
            1
        } else if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            1
        };
        let cputime = ru.ru_utime.tv_sec as f64
            + ru.ru_utime.tv_usec as f64 * 1e-6
            + ru.ru_stime.tv_sec as f64
            + ru.ru_stime.tv_usec as f64 * 1e-6;
        self.jobs[idx].reality = JobUsage {
            status: exit,
            runtime: self.jobs[idx]
                .started
                .map(|s| s.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            cputime,
            membytes: ru.ru_maxrss * 1024,
            ibytes: ru.ru_inblock * 512,
            obytes: ru.ru_oublock * 512,
        };
        self.jobs[idx].advance(state::MERGED);
        if self.jobs[idx].pool == 0 {
            self.running -= 1;
        }
        debug!(job_id = self.jobs[idx].job_id, exit, "job merged");
        self.fulfill_reality(rt, idx);
    }

    /// Record trees and stats, clear superseded rows, and surface
    /// same-build output conflicts.
    pub fn finish(
        &mut self,
        idx: usize,
        rt: &mut Runtime,
        db: &mut Database,
        inputs: Vec<String>,
        output_paths: Vec<String>,
    ) -> Result<(), String> {
        debug_assert!(self.jobs[idx].is(state::MERGED));
        let mut outputs = Vec::with_capacity(output_paths.len());
        for p in &output_paths {
            match hash_path(std::path::Path::new(p)) {
                Ok(h) => outputs.push((p.clone(), h)),
                Err(e) => {
                    let msg = format!("declared output {} is unreadable: {}", p, e);
                    self.jobs[idx].bad_finish = Some(msg.clone());
                    self.fulfill_report(rt, idx);
                    return Err(msg);
                }
            }
        }

        let job = &self.jobs[idx];
        let key = JobKey {
            directory: &job.directory,
            commandline: &job.commandline,
            environment: &job.environment,
            stdin: &job.stdin,
            signature: job.signature,
        };
        let overlaps = db
            .finish_job(
                job.job_id,
                &key,
                job.code,
                job.keep,
                &job.reality,
                &inputs,
                &outputs,
            )
            .map_err(|e| e.to_string())?;
        db.end_txn().map_err(|e| e.to_string())?;

        if let Some(path) = overlaps.first() {
            let msg = format!("File output by multiple Jobs: {}", path);
            self.jobs[idx].bad_finish = Some(msg.clone());
            self.fulfill_report(rt, idx);
            return Err(msg);
        }

        self.jobs[idx].inputs = inputs.clone();
        self.jobs[idx].outputs = outputs;
        self.jobs[idx].advance(state::FINISHED);

        let input_list = self.make_string_list(rt, &inputs);
        let p = rt.heap.deref(self.jobs[idx].q_inputs);
        rt.fulfill(p, input_list);
        let outs: Vec<String> = self.jobs[idx]
            .outputs
            .iter()
            .map(|(p, _)| p.clone())
            .collect();
        let output_list = self.make_string_list(rt, &outs);
        let p = rt.heap.deref(self.jobs[idx].q_outputs);
        rt.fulfill(p, output_list);
        self.fulfill_report(rt, idx);
        Ok(())
    }

    pub fn kill(&mut self, idx: usize, signal: i32) {
        if let Some(pid) = self.jobs[idx].pid {
            if self.jobs[idx].is(state::FORKED) && !self.jobs[idx].is(state::MERGED) {
                unsafe {
                    libc::kill(pid as i32, signal);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Language-value builders
    // ------------------------------------------------------------------

    fn fulfill_str(&self, rt: &mut Runtime, q: kiln_runtime::RootId, s: &str) {
        let v = rt.heap.alloc(Obj::Str(Rc::from(s)));
        let p = rt.heap.deref(q);
        rt.fulfill(p, v);
    }

    /// `q_reality` carries `Pair status runtime`.
    fn fulfill_reality(&mut self, rt: &mut Runtime, idx: usize) {
        let status = rt.heap.alloc(Obj::Int(self.jobs[idx].reality.status as i64));
        let runtime = rt.heap.alloc(Obj::Dbl(self.jobs[idx].reality.runtime));
        let pair = kiln_runtime::make_record(rt, &self.sums.pair, 0, &[status, runtime]);
        let p = rt.heap.deref(self.jobs[idx].q_reality);
        rt.fulfill(p, pair);
    }

    /// `q_report` carries `Result stdout-string error-string`.
    fn fulfill_report(&mut self, rt: &mut Runtime, idx: usize) {
        let job = &self.jobs[idx];
        let (cons, text) = if let Some(m) = &job.bad_finish {
            (1, m.clone())
        } else if let Some(m) = &job.bad_launch {
            (1, m.clone())
        } else if job.reality.status != 0 {
            (
                1,
                format!(
                    "job {} failed with status {}",
                    job.label, job.reality.status
                ),
            )
        } else {
            (0, String::from_utf8_lossy(&job.stdout_buf).into_owned())
        };
        let s = rt.heap.alloc(Obj::Str(Rc::from(text.as_str())));
        let result = kiln_runtime::make_record(rt, &self.sums.result, cons, &[s]);
        let p = rt.heap.deref(self.jobs[idx].q_report);
        rt.fulfill(p, result);
    }

    fn make_string_list(&self, rt: &mut Runtime, items: &[String]) -> kiln_runtime::HeapRef {
        let mut tail = kiln_runtime::make_enum(rt, &self.sums.list, 0);
        for item in items.iter().rev() {
            let s = rt.heap.alloc(Obj::Str(Rc::from(item.as_str())));
            tail = kiln_runtime::make_record(rt, &self.sums.list, 1, &[s, tail]);
        }
        tail
    }
}

fn spawn_reader(job: usize, fd: u8, mut pipe: impl Read + Send + 'static, tx: Sender<PipeEvent>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => {
                    let _ = tx.send(PipeEvent {
                        job,
                        fd,
                        data: None,
                    });
                    return;
                }
                Ok(n) => {
                    if tx
                        .send(PipeEvent {
                            job,
                            fd,
                            data: Some(buf[..n].to_vec()),
                        })
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    });
}

impl Drop for JobTable {
    /// Terminate stragglers: SIGTERM, exponentially widening waits up to
    /// `TERM_ATTEMPTS` rounds, then SIGKILL.
    fn drop(&mut self) {
        let live: Vec<u32> = self
            .jobs
            .iter()
            .filter(|j| j.is(state::FORKED) && !j.is(state::MERGED))
            .filter_map(|j| j.pid)
            .collect();
        if live.is_empty() {
            return;
        }
        for &pid in &live {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        let mut window = Duration::from_millis(50);
        for _ in 0..TERM_ATTEMPTS {
            let any_alive = live
                .iter()
                .any(|&pid| unsafe { libc::kill(pid as i32, 0) } == 0);
            if !any_alive {
                break;
            }
            std::thread::sleep(window);
            window *= 2;
        }
        for &pid in &live {
            unsafe {
                if libc::kill(pid as i32, 0) == 0 {
                    warn!(pid, "job ignored SIGTERM; killing");
                    libc::kill(pid as i32, libc::SIGKILL);
                }
                let mut status = 0i32;
                libc::waitpid(pid as i32, &mut status, libc::WNOHANG);
            }
        }
    }
}
