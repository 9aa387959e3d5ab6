//! Mandatory-access-control label plumbing.
//!
//! Labels are applied verbatim through the `security.*` extended
//! attributes of the node, reached through `/proc/self/fd` when only an
//! `O_PATH` handle is available. Restoring a policy-derived default
//! context would need libselinux; without it the reachable defaults are
//! clearing the SMACK access label and keeping the label the kernel
//! assigned at creation time for SELinux.

use std::io;
use std::os::fd::RawFd;
use std::path::Path;

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    const SELINUX_XATTR: &str = "security.selinux";
    const SMACK_XATTR: &str = "security.SMACK64";

    fn cstr(path: &Path) -> io::Result<CString> {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn setxattr(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
        let p = cstr(path)?;
        let n = CString::new(name).expect("xattr name");
        let r = unsafe {
            libc::setxattr(p.as_ptr(), n.as_ptr(), value.as_ptr().cast(), value.len(), 0)
        };
        if r < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn removexattr(path: &Path, name: &str) -> io::Result<()> {
        let p = cstr(path)?;
        let n = CString::new(name).expect("xattr name");
        let r = unsafe { libc::removexattr(p.as_ptr(), n.as_ptr()) };
        if r < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn selinux_enabled() -> bool {
        Path::new("/sys/fs/selinux").exists()
    }

    pub fn selinux_apply_fd(fd: RawFd, label: &str) -> io::Result<()> {
        setxattr(
            &crate::paths::proc_fd_path(fd),
            SELINUX_XATTR,
            label.as_bytes(),
        )
    }

    pub fn selinux_fix_fd(_fd: RawFd) -> io::Result<()> {
        if !selinux_enabled() {
            return Ok(());
        }
        // The policy default comes from a libselinux selabel lookup; the
        // creation-time label stands until a relabel pass runs.
        tracing::trace!("leaving SELinux label for policy relabel");
        Ok(())
    }

    pub fn smack_apply_fd(fd: RawFd, label: Option<&str>) -> io::Result<()> {
        let path = crate::paths::proc_fd_path(fd);
        match label {
            Some(l) => setxattr(&path, SMACK_XATTR, l.as_bytes()),
            None => match removexattr(&path, SMACK_XATTR) {
                Ok(()) => Ok(()),
                Err(e)
                    if matches!(
                        e.raw_os_error(),
                        Some(libc::ENODATA) | Some(libc::EOPNOTSUPP)
                    ) =>
                {
                    Ok(())
                }
                Err(e) => Err(e),
            },
        }
    }

    pub fn fix_dir_label(dir: &Path) {
        if !selinux_enabled() {
            return;
        }
        tracing::trace!(dir = %dir.display(), "leaving directory label for policy relabel");
    }

    pub fn fix_symlink_label(link: &Path) {
        if !selinux_enabled() {
            return;
        }
        tracing::trace!(link = %link.display(), "leaving symlink label for policy relabel");
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub fn selinux_apply_fd(_fd: RawFd, _label: &str) -> io::Result<()> {
        Ok(())
    }

    pub fn selinux_fix_fd(_fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    pub fn smack_apply_fd(_fd: RawFd, _label: Option<&str>) -> io::Result<()> {
        Ok(())
    }

    pub fn fix_dir_label(_dir: &Path) {}

    pub fn fix_symlink_label(_link: &Path) {}
}

pub(crate) use imp::{
    fix_dir_label, fix_symlink_label, selinux_apply_fd, selinux_fix_fd, smack_apply_fd,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn smack_clear_on_plain_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node");
        std::fs::write(&path, b"").unwrap();
        let f = std::fs::File::open(&path).unwrap();

        // Clearing an absent label must not be an error; unprivileged
        // runs may see EPERM on security.* attributes instead.
        match smack_apply_fd(f.as_raw_fd(), None) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {}
            Err(e) => panic!("unexpected error clearing label: {e}"),
        }
    }
}
