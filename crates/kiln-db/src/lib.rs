//! kiln-db: the persistent job catalog.
//!
//! A thin typed layer over SQLite: schema management, fingerprint
//! lookup (`reuse_job`), file-hash caching with consumer invalidation,
//! output logs, stats/prediction, overlap bookkeeping, and the task
//! list. Content hashing (BLAKE2b-256) and keyed fingerprint hashing
//! (SipHash-1-3, seeded from the catalog's entropy) live in [`hash`].

pub mod catalog;
pub mod hash;

pub use catalog::{
    Access, Database, DbError, JobKey, JobSummary, JobUsage, ReusedJob, SCHEMA_VERSION,
};
pub use hash::{hash_bytes, hash_path, job_code, signature_hash, ZERO_HASH};
