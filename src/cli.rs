//! Command-line surface.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "kiln", version, about = "Content-addressed incremental build orchestrator")]
pub struct Cli {
    /// Target expression to evaluate (or files in --script mode).
    pub targets: Vec<String>,

    /// Maximum concurrent jobs in the CPU-bound pool.
    #[arg(short = 'j', long = "jobs", default_value_t = default_jobs())]
    pub jobs: usize,

    /// Replay-audit: report cache hits but rerun jobs anyway.
    #[arg(short = 'c', long = "check")]
    pub check: bool,

    /// More logging (stacks with -d).
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Debug logging, including evaluator internals.
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Suppress warnings and progress chatter.
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Fail immediately if the database is held by another kiln.
    #[arg(long = "no-wait")]
    pub no_wait: bool,

    /// Scan the directory tree instead of consulting git.
    #[arg(long = "no-workspace")]
    pub no_workspace: bool,

    /// Disable terminal styling.
    #[arg(long = "no-tty")]
    pub no_tty: bool,

    /// Explain which jobs read the given path.
    #[arg(short = 'i', long = "input")]
    pub input: Option<String>,

    /// Explain which jobs wrote the given path.
    #[arg(short = 'o', long = "output")]
    pub output: Option<String>,

    /// Treat the positional arguments as source files, not an expression.
    #[arg(short = 's', long = "script")]
    pub script: bool,

    /// Create a workspace rooted at the given directory.
    #[arg(long = "init")]
    pub init: Option<String>,

    /// List the stored task expressions.
    #[arg(long = "list-tasks")]
    pub list_tasks: bool,

    /// Store the target expression as a task.
    #[arg(long = "add-task")]
    pub add_task: bool,

    /// Remove stored task N.
    #[arg(long = "remove-task")]
    pub remove_task: Option<i64>,

    /// Print the global definitions visible to target expressions.
    #[arg(short = 'g', long = "globals")]
    pub globals: bool,

    /// Dump catalog contents for debugging.
    #[arg(long = "debug-db")]
    pub debug_db: bool,

    /// Stop after parsing and print the per-file definition summary.
    #[arg(long = "stop-after-parse")]
    pub stop_after_parse: bool,

    /// Stop after type checking.
    #[arg(long = "stop-after-type-check")]
    pub stop_after_type_check: bool,

    /// Heap growth factor; values <= 0 disable growth (GC stress mode).
    #[arg(long = "heap-factor", default_value_t = 1.5, hide = true)]
    pub heap_factor: f64,

    /// Sample evaluator call chains and print the hottest at exit.
    #[arg(long = "profile")]
    pub profile: bool,
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
