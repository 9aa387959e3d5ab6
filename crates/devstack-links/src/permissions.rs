//! Permission and label reconciliation for the device node itself.
//!
//! The node is only touched through an `O_PATH` handle obtained after
//! confirming the inode still belongs to this device (file-type bits
//! plus `st_rdev`). A node that is missing or already reused by another
//! device is left alone; both races are inherent to the event stream.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;

use devstack_device::Device;
use tracing::{debug, error};

use crate::error::Result;
use crate::{mac, paths};

/// One `SECLABEL{module}=label` assignment from the rule engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecLabel {
    pub module: String,
    pub label: String,
}

impl SecLabel {
    pub fn new(module: &str, label: &str) -> Self {
        Self {
            module: module.to_string(),
            label: label.to_string(),
        }
    }
}

/// Reconcile mode, ownership and MAC labels of the device node, and
/// refresh its timestamps (downstream consumers use the node mtime as a
/// media-change heartbeat).
///
/// `None` for mode, uid or gid means "leave as is".
pub fn apply_node_permissions(
    dev: &dyn Device,
    apply_mac: bool,
    mode: Option<u32>,
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
    seclabels: &[SecLabel],
) -> Result<()> {
    let devnode = dev.devnode()?;
    let subsystem = dev.subsystem()?;
    let devnum = dev.devnum()?;

    let expected_type = if subsystem == "block" {
        libc::S_IFBLK
    } else {
        libc::S_IFCHR
    };

    let c_node = CString::new(devnode.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let raw = unsafe {
        libc::open(
            c_node.as_ptr(),
            libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
        )
    };
    if raw < 0 {
        let e = io::Error::last_os_error();
        if e.kind() == io::ErrorKind::NotFound {
            // The device is already gone; this race is unavoidable.
            debug!(node = %devnode.display(), "device node is missing, skipping");
            return Ok(());
        }
        return Err(e.into());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } < 0 {
        return Err(io::Error::last_os_error().into());
    }

    let type_mismatch = mode.is_some() && (st.st_mode & libc::S_IFMT) != expected_type;
    if type_mismatch || st.st_rdev != devnum.as_dev_t() {
        // The inode was reused for another device since the event was
        // queued; it is not ours to touch.
        debug!(
            node = %devnode.display(),
            devnum = %devnum,
            "node does not match device anymore, skipping"
        );
        return Ok(());
    }

    let apply_mode = mode.map_or(false, |m| st.st_mode & 0o777 != m & 0o777);
    let apply_uid = uid.map_or(false, |u| st.st_uid != u);
    let apply_gid = gid.map_or(false, |g| st.st_gid != g);

    if apply_mode || apply_uid || apply_gid || apply_mac {
        if apply_mode || apply_uid || apply_gid {
            let shown_mode = format!("{:#o}", mode.unwrap_or(st.st_mode & 0o777));
            debug!(
                node = %devnode.display(),
                uid = uid.unwrap_or(st.st_uid),
                gid = gid.unwrap_or(st.st_gid),
                mode = %shown_mode,
                "setting permissions"
            );
            if let Err(e) = chmod_and_chown(fd.as_raw_fd(), mode, uid, gid) {
                if e.kind() == io::ErrorKind::NotFound {
                    debug!(node = %devnode.display(), error = %e, "node vanished while setting permissions");
                } else {
                    error!(node = %devnode.display(), error = %e, "failed to set owner/mode");
                }
            }
        } else {
            debug!(node = %devnode.display(), "preserving permissions");
        }

        let mut selinux = false;
        let mut smack = false;
        for sl in seclabels {
            let applied = match sl.module.as_str() {
                "selinux" => {
                    selinux = true;
                    mac::selinux_apply_fd(fd.as_raw_fd(), &sl.label)
                }
                "smack" => {
                    smack = true;
                    mac::smack_apply_fd(fd.as_raw_fd(), Some(&sl.label))
                }
                _ => {
                    error!(
                        module = %sl.module,
                        label = %sl.label,
                        "unknown security module, ignoring"
                    );
                    continue;
                }
            };
            match applied {
                Ok(()) => debug!(module = %sl.module, label = %sl.label, "security label set"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(module = %sl.module, error = %e, "node vanished while labelling")
                }
                Err(e) => error!(module = %sl.module, label = %sl.label, error = %e, "failed to set security label"),
            }
        }

        // Modules the ruleset did not label explicitly go back to their
        // defaults.
        if !selinux {
            let _ = mac::selinux_fix_fd(fd.as_raw_fd());
        }
        if !smack {
            let _ = mac::smack_apply_fd(fd.as_raw_fd(), None);
        }
    }

    if let Err(e) = touch_opath(fd.as_raw_fd()) {
        if e.kind() == io::ErrorKind::NotFound {
            debug!(node = %devnode.display(), error = %e, "failed to refresh node timestamp");
            return Ok(());
        }
        return Err(e.into());
    }
    Ok(())
}

/// Apply mode then ownership through an `O_PATH` handle. Mode goes via
/// `/proc/self/fd` (`fchmod` rejects path-only descriptors), ownership
/// via `fchownat` with `AT_EMPTY_PATH`.
fn chmod_and_chown(
    fd: RawFd,
    mode: Option<u32>,
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
) -> io::Result<()> {
    if let Some(m) = mode {
        let proc_path = paths::proc_fd_path(fd);
        let c = CString::new(proc_path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        if unsafe { libc::chmod(c.as_ptr(), m & 0o7777) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    if uid.is_some() || gid.is_some() {
        let empty = CString::new("").expect("empty path");
        let r = unsafe {
            libc::fchownat(
                fd,
                empty.as_ptr(),
                uid.unwrap_or(libc::uid_t::MAX),
                gid.unwrap_or(libc::gid_t::MAX),
                libc::AT_EMPTY_PATH,
            )
        };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Set both node timestamps to now through an `O_PATH` handle.
fn touch_opath(fd: RawFd) -> io::Result<()> {
    let proc_path = paths::proc_fd_path(fd);
    let c = CString::new(proc_path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    if unsafe { libc::utimensat(libc::AT_FDCWD, c.as_ptr(), std::ptr::null(), 0) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
