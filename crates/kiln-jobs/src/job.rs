//! Job lifecycle state.
//!
//! A job advances through a bitset of lifecycle points; each point wakes
//! the matching promise queue exactly once:
//!
//! ```text
//! new -> (db row) -> FORKED -> STDOUT/STDERR (independent) -> MERGED -> FINISHED
//!                          \_________ virtual completion _________/
//! ```

use kiln_db::JobUsage;
use kiln_runtime::RootId;
use std::time::Instant;

pub mod state {
    pub const FORKED: u8 = 1 << 0;
    pub const STDOUT: u8 = 1 << 1;
    pub const STDERR: u8 = 1 << 2;
    pub const MERGED: u8 = 1 << 3;
    pub const FINISHED: u8 = 1 << 4;
}

/// One tracked job. The six `q_*` roots are promises the language side
/// waits on; each fulfills at its lifecycle point and never re-empties.
pub struct Job {
    pub job_id: i64,
    /// Keyed fingerprint hash of (directory, stdin, environment, command).
    pub code: i64,
    pub label: String,
    pub directory: String,
    pub commandline: Vec<u8>,
    pub environment: Vec<u8>,
    pub stdin: String,
    pub signature: i64,
    pub keep: bool,
    pub pool: usize,

    pub state: u8,
    pub pid: Option<u32>,
    pub started: Option<Instant>,
    pub predict: JobUsage,
    pub reality: JobUsage,

    pub stdout_buf: Vec<u8>,
    pub stderr_buf: Vec<u8>,
    /// EOF bits for the two captured descriptors (1 = stdout, 2 = stderr).
    pub eof: u8,

    pub q_stdout: RootId,
    pub q_stderr: RootId,
    pub q_reality: RootId,
    pub q_inputs: RootId,
    pub q_outputs: RootId,
    pub q_report: RootId,

    pub bad_launch: Option<String>,
    pub bad_finish: Option<String>,

    /// Filled at finish time.
    pub inputs: Vec<String>,
    pub outputs: Vec<(String, String)>,
}

impl Job {
    pub fn is(&self, bit: u8) -> bool {
        self.state & bit != 0
    }

    pub fn advance(&mut self, bit: u8) {
        debug_assert!(
            !self.is(bit),
            "lifecycle point {:#x} reached twice on job {}",
            bit,
            self.job_id
        );
        self.state |= bit;
    }

    /// Exit status is only meaningful at MERGED or later.
    pub fn succeeded(&self) -> bool {
        self.is(state::MERGED) && self.reality.status == 0 && self.bad_launch.is_none()
    }
}
