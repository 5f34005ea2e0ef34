//! Workspace and source discovery.
//!
//! The workspace root is the nearest ancestor holding `kiln.db` (created
//! by `--init`). Source files come from `git ls-files -z` in every
//! git-rooted directory under the root, minus `.gitmodules` submodule
//! paths; `--no-workspace` falls back to a plain directory scan.
//! `.build` and `.fuse` directories are always skipped.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

pub const DB_NAME: &str = "kiln.db";

/// Walk upward from `start` to the directory containing the catalog.
pub fn find_workspace(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(DB_NAME).is_file() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Create a workspace marker (an empty catalog is created on first open).
pub fn init_workspace(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("creating workspace directory {}", dir.display()))?;
    let marker = dir.join(DB_NAME);
    if marker.exists() {
        bail!("workspace already initialized at {}", dir.display());
    }
    // Touch the file so find_workspace sees it; the catalog stamps its
    // schema when first opened.
    fs::File::create(&marker)
        .with_context(|| format!("creating {}", marker.display()))?;
    Ok(())
}

/// Every tracked file under the workspace, workspace-relative.
pub fn discover(root: &Path, no_workspace: bool) -> Result<Vec<PathBuf>> {
    let mut out = if !no_workspace && root.join(".git").exists() {
        git_files(root)?
    } else {
        let mut acc = Vec::new();
        scan_dir(root, root, &mut acc)?;
        acc
    };
    out.sort();
    out.dedup();
    debug!(files = out.len(), "workspace sources discovered");
    Ok(out)
}

/// Source files the frontend parses.
pub fn kiln_files(all: &[PathBuf]) -> Vec<PathBuf> {
    all.iter()
        .filter(|p| p.extension().map(|e| e == "kiln").unwrap_or(false))
        .cloned()
        .collect()
}

fn git_files(root: &Path) -> Result<Vec<PathBuf>> {
    let output = Command::new("git")
        .arg("ls-files")
        .arg("-z")
        .current_dir(root)
        .output()
        .context("running git ls-files")?;
    if !output.status.success() {
        bail!(
            "git ls-files failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    let submodules = submodule_paths(root);
    let mut files = Vec::new();
    for raw in output.stdout.split(|&b| b == 0) {
        if raw.is_empty() {
            continue;
        }
        let rel = PathBuf::from(String::from_utf8_lossy(raw).into_owned());
        if submodules.iter().any(|s| rel.starts_with(s)) {
            continue;
        }
        if skip_component(&rel) {
            continue;
        }
        files.push(rel);
    }
    Ok(files)
}

fn submodule_paths(root: &Path) -> Vec<PathBuf> {
    let Ok(text) = fs::read_to_string(root.join(".gitmodules")) else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|l| {
            let l = l.trim();
            l.strip_prefix("path")
                .and_then(|rest| rest.trim_start().strip_prefix('='))
                .map(|p| PathBuf::from(p.trim()))
        })
        .collect()
}

fn skip_component(rel: &Path) -> bool {
    rel.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        name == ".build" || name == ".fuse" || name == ".git"
    })
}

fn scan_dir(root: &Path, dir: &Path, acc: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("scanning {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == ".git" || name == ".build" || name == ".fuse" || name == DB_NAME {
            continue;
        }
        // WAL companions of the catalog.
        if name.starts_with(DB_NAME) {
            continue;
        }
        let ftype = entry.file_type()?;
        if ftype.is_dir() {
            scan_dir(root, &path, acc)?;
        } else if ftype.is_file() {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_path_buf();
            acc.push(rel);
        }
    }
    Ok(())
}

/// Duplicate-free visible set as absolute path strings.
pub fn absolute_paths(root: &Path, rels: &[PathBuf]) -> Vec<String> {
    let mut seen = HashSet::new();
    rels.iter()
        .map(|r| root.join(r).display().to_string())
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_skips_build_dirs_and_finds_sources() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".build")).unwrap();
        fs::write(dir.path().join(".build/x.kiln"), "ignored").unwrap();
        fs::write(dir.path().join("build.kiln"), "def x = 1\n").unwrap();
        fs::write(dir.path().join("data.txt"), "hello").unwrap();

        let all = discover(dir.path(), true).unwrap();
        assert_eq!(all.len(), 2);
        let kiln = kiln_files(&all);
        assert_eq!(kiln, vec![PathBuf::from("build.kiln")]);
    }

    #[test]
    fn workspace_found_upward() {
        let dir = tempfile::tempdir().unwrap();
        init_workspace(dir.path().join("ws").as_path()).unwrap();
        let nested = dir.path().join("ws/a/b");
        fs::create_dir_all(&nested).unwrap();
        let found = find_workspace(&nested).unwrap();
        assert_eq!(found, dir.path().join("ws"));
    }

    #[test]
    fn double_init_refused() {
        let dir = tempfile::tempdir().unwrap();
        init_workspace(dir.path().join("ws").as_path()).unwrap();
        assert!(init_workspace(dir.path().join("ws").as_path()).is_err());
    }

    #[test]
    fn submodule_parser_reads_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(".gitmodules"),
            "[submodule \"dep\"]\n\tpath = third_party/dep\n\turl = ../dep.git\n",
        )
        .unwrap();
        let subs = submodule_paths(dir.path());
        assert_eq!(subs, vec![PathBuf::from("third_party/dep")]);
    }
}
