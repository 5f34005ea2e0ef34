//! Process launching.
//!
//! A `ProcessLauncher` turns a launch spec into a running child with
//! captured stdout/stderr; the POSIX implementation is the only one
//! shipped, but the trait keeps platform differences out of the table.
//! Command lines and environments travel as NUL-separated blobs, the
//! same shape the catalog stores.

use std::fs::File;
use std::io;
use std::path::Path;
use std::process::{ChildStderr, ChildStdout, Command, Stdio};

/// `"echo\0hi\0"` -> `["echo", "hi"]`.
pub fn split_blob(blob: &[u8]) -> Vec<String> {
    blob.split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

/// `["A=1", "B=2"]` from a NUL-separated environment blob.
pub fn split_env(blob: &[u8]) -> Vec<(String, String)> {
    split_blob(blob)
        .into_iter()
        .filter_map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

pub struct LaunchSpec<'a> {
    pub directory: &'a str,
    /// Path redirected into fd 0; empty means /dev/null.
    pub stdin: &'a str,
    pub commandline: &'a [u8],
    pub environment: &'a [u8],
}

pub struct Launched {
    pub pid: u32,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

pub trait ProcessLauncher {
    fn launch(&self, spec: &LaunchSpec<'_>) -> io::Result<Launched>;
}

/// Spawn via `std::process::Command`: chdir into the job directory,
/// redirect stdin from the named file, pipe both output descriptors.
pub struct PosixLauncher;

impl ProcessLauncher for PosixLauncher {
    fn launch(&self, spec: &LaunchSpec<'_>) -> io::Result<Launched> {
        let argv = split_blob(spec.commandline);
        if argv.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty command line",
            ));
        }
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(spec.directory)
            .env_clear()
            .envs(split_env(spec.environment))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if spec.stdin.is_empty() {
            cmd.stdin(Stdio::null());
        } else {
            let path = Path::new(spec.directory).join(spec.stdin);
            cmd.stdin(Stdio::from(File::open(path)?));
        }
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let pid = child.id();
        // The child is reaped with wait4 once both pipes close; dropping
        // the handle here neither kills nor reaps it.
        drop(child);
        Ok(Launched {
            pid,
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn blob_splitting() {
        assert_eq!(split_blob(b"echo\0hi\0"), vec!["echo", "hi"]);
        assert_eq!(split_blob(b""), Vec::<String>::new());
        assert_eq!(
            split_env(b"A=1\0B=x=y\0"),
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string())
            ]
        );
    }

    #[test]
    fn launch_captures_stdout() {
        let launcher = PosixLauncher;
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec {
            directory: &dir.path().display().to_string(),
            stdin: "",
            commandline: b"echo\0hi\0",
            environment: b"PATH=/bin:/usr/bin\0",
        };
        let mut launched = launcher.launch(&spec).expect("echo launches");
        let mut out = String::new();
        launched.stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hi\n");
        // Reap so the test leaves no zombie.
        unsafe {
            let mut status = 0i32;
            libc::waitpid(launched.pid as i32, &mut status, 0);
        }
    }

    #[test]
    fn launch_missing_binary_fails() {
        let launcher = PosixLauncher;
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec {
            directory: &dir.path().display().to_string(),
            stdin: "",
            commandline: b"definitely-not-a-real-binary-kiln\0",
            environment: b"\0",
        };
        assert!(launcher.launch(&spec).is_err());
    }
}
