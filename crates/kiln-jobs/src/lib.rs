//! kiln-jobs: job lifecycle, pool scheduling, and I/O capture.
//!
//! Jobs are external processes (or launchless virtual completions)
//! tracked by a [`table::JobTable`]: pool admission, pipe capture via
//! reader threads and a channel, `wait4` reaping, and catalog recording
//! with overlap detection. The [`prims`] module exposes the lifecycle
//! to the language.

pub mod job;
pub mod launch;
pub mod prims;
pub mod table;

pub use job::{state, Job};
pub use launch::{split_blob, split_env, LaunchSpec, Launched, PosixLauncher, ProcessLauncher};
pub use prims::register_job_prims;
pub use table::{JobSums, JobTable, PipeEvent, POOLS, TERM_ATTEMPTS};
