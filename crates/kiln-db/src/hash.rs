//! Content and fingerprint hashing.
//!
//! File content hashes are BLAKE2b-256, rendered as 64 lowercase hex
//! characters. Symlinks hash their link text; directories hash to the
//! zero digest. Job codes are keyed SipHash-1-3 over the fingerprint
//! fields, with the key drawn from the catalog's entropy table so one
//! workspace hashes consistently across runs.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use siphasher::sip::SipHasher13;
use std::fs;
use std::hash::Hasher;
use std::io;
use std::path::Path;

type Blake2b256 = Blake2b<U32>;

/// The hash a directory reports.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Hash a path the way the job runner's `<hash>` pseudo-command does:
/// regular file contents, symlink target text, or zero for a directory.
pub fn hash_path(path: &Path) -> io::Result<String> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(path)?;
        Ok(hash_bytes(target.to_string_lossy().as_bytes()))
    } else if meta.is_dir() {
        Ok(ZERO_HASH.to_string())
    } else {
        let data = fs::read(path)?;
        Ok(hash_bytes(&data))
    }
}

pub fn hash_bytes(data: &[u8]) -> String {
    let mut h = Blake2b256::new();
    h.update(data);
    hex::encode(h.finalize())
}

/// Keyed fingerprint hash of a job's identity tuple.
pub fn job_code(
    key: (u64, u64),
    directory: &str,
    stdin: &str,
    environment: &[u8],
    commandline: &[u8],
) -> i64 {
    let mut h = SipHasher13::new_with_keys(key.0, key.1);
    h.write(directory.as_bytes());
    h.write_u8(0);
    h.write(stdin.as_bytes());
    h.write_u8(0);
    h.write(environment);
    h.write_u8(0);
    h.write(commandline);
    h.finish() as i64
}

/// Keyed hash of the job's declared dependency signature inputs.
pub fn signature_hash(key: (u64, u64), parts: &[&[u8]]) -> i64 {
    let mut h = SipHasher13::new_with_keys(key.0, key.1);
    for p in parts {
        h.write(p);
        h.write_u8(0xfe);
    }
    h.finish() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_hash_is_64_hex() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.txt");
        let mut f = fs::File::create(&p).unwrap();
        f.write_all(b"hello").unwrap();
        let h = hash_path(&p).unwrap();
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        // Stable across reads.
        assert_eq!(h, hash_path(&p).unwrap());
    }

    #[test]
    fn directory_hashes_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(hash_path(dir.path()).unwrap(), ZERO_HASH);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_hashes_link_text() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("l");
        std::os::unix::fs::symlink("target-text", &link).unwrap();
        let h = hash_path(&link).unwrap();
        assert_eq!(h, hash_bytes(b"target-text"));
    }

    #[test]
    fn job_code_sensitive_to_every_field() {
        let k = (1, 2);
        let base = job_code(k, ".", "", b"A=1\0", b"echo\0hi\0");
        assert_ne!(base, job_code(k, "sub", "", b"A=1\0", b"echo\0hi\0"));
        assert_ne!(base, job_code(k, ".", "in", b"A=1\0", b"echo\0hi\0"));
        assert_ne!(base, job_code(k, ".", "", b"A=2\0", b"echo\0hi\0"));
        assert_ne!(base, job_code(k, ".", "", b"A=1\0", b"echo\0ho\0"));
        assert_eq!(base, job_code(k, ".", "", b"A=1\0", b"echo\0hi\0"));
    }

    #[test]
    fn job_code_depends_on_key() {
        let a = job_code((1, 2), ".", "", b"", b"x");
        let b = job_code((3, 4), ".", "", b"", b"x");
        assert_ne!(a, b);
    }
}
