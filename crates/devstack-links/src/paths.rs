//! Path and directory plumbing shared by the writer and the updater.

use std::fs::{self, DirBuilder, Metadata};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Component, Path, PathBuf};

use crate::mac;

/// Shortest relative path from the directory `from_dir` to `to`.
///
/// Both paths must be absolute and free of `.`/`..` components; `None`
/// otherwise. Symlinks are not resolved, the computation is purely
/// lexical: the result is meant to be stored inside a symlink that
/// lives in `from_dir`.
pub fn make_relative(from_dir: &Path, to: &Path) -> Option<PathBuf> {
    if !from_dir.is_absolute() || !to.is_absolute() {
        return None;
    }

    let normal = |p: &Path| -> Option<Vec<std::ffi::OsString>> {
        let mut out = Vec::new();
        for c in p.components() {
            match c {
                Component::RootDir => {}
                Component::Normal(s) => out.push(s.to_os_string()),
                _ => return None,
            }
        }
        Some(out)
    };

    let from = normal(from_dir)?;
    let to = normal(to)?;

    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for part in &to[common..] {
        rel.push(part);
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    Some(rel)
}

/// Create all missing parent directories of `path` with the given mode.
pub fn mkdir_parents(path: &Path, mode: u32) -> io::Result<()> {
    mkdir_parents_inner(path, mode, false)
}

/// Like [`mkdir_parents`], also applying the default MAC label to every
/// directory actually created.
pub fn mkdir_parents_label(path: &Path, mode: u32) -> io::Result<()> {
    mkdir_parents_inner(path, mode, true)
}

fn mkdir_parents_inner(path: &Path, mode: u32, label: bool) -> io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };

    // Collect the missing ancestors, then create them top-down so each
    // new directory can be labelled individually.
    let mut missing = Vec::new();
    let mut cur = parent;
    loop {
        if cur.as_os_str().is_empty() || cur.exists() {
            break;
        }
        missing.push(cur.to_path_buf());
        match cur.parent() {
            Some(p) => cur = p,
            None => break,
        }
    }

    for dir in missing.iter().rev() {
        match DirBuilder::new().mode(mode).create(dir) {
            Ok(()) => {
                if label {
                    mac::fix_dir_label(dir);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Remove empty parent directories of `path`, walking upward but never
/// removing `stop` itself or anything outside it. Stops at the first
/// directory that cannot be removed.
pub fn rmdir_parents(path: &Path, stop: &Path) {
    let mut cur = path.parent();
    while let Some(dir) = cur {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        cur = dir.parent();
    }
}

/// Path that dereferences an open handle for syscalls that cannot take
/// an `O_PATH` descriptor directly.
pub(crate) fn proc_fd_path(fd: std::os::fd::RawFd) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{fd}"))
}

/// Whether two stat results describe the same unmodified inode: same
/// filesystem, same inode, same file type, same modification time (and
/// size, for regular files). Either side missing counts as modified.
pub fn stat_inode_unmodified(a: Option<&Metadata>, b: Option<&Metadata>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => {
            a.dev() == b.dev()
                && a.ino() == b.ino()
                && (a.mode() & libc::S_IFMT) == (b.mode() & libc::S_IFMT)
                && a.mtime() == b.mtime()
                && a.mtime_nsec() == b.mtime_nsec()
                && (!a.file_type().is_file() || a.size() == b.size())
        }
        _ => false,
    }
}
