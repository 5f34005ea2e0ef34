//! kiln: content-addressed, incremental build orchestration.
//!
//! The library surface is the driver (parse -> resolve -> type -> lower
//! -> optimize -> evaluate/wait) and workspace source discovery; the
//! `kiln` binary layers flag handling on top. The language, SSA,
//! runtime, catalog, and job subsystems live in the workspace crates
//! (`kiln-lang`, `kiln-ssa`, `kiln-runtime`, `kiln-db`, `kiln-jobs`).

pub mod driver;
pub mod sources;

pub use driver::{build, BuildOutcome, BuildRequest, PRELUDE};
