//! Claim index on scratch storage.
//!
//! For every stable name there is one directory under the links root,
//! named by the escaped form of the name, holding one empty marker file
//! per claiming device. Marker filenames are device ids, so the
//! filesystem itself enforces at most one claim per device and the set
//! of claimants is observable by every process without IPC.

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use devstack_config::Config;
use devstack_device::{parse_device_id, Device};
use tracing::debug;

use crate::error::{LinkError, Result};
use crate::{escape, paths};

/// The part of a stable name below the device root, with its leading
/// separator kept (the escaped form therefore starts with `\x2f`).
pub(crate) fn stable_name_suffix<'a>(cfg: &Config, slink: &'a Path) -> Result<&'a Path> {
    let mut root = cfg.dev_root.as_os_str().as_bytes();
    while root.last() == Some(&b'/') {
        root = &root[..root.len() - 1];
    }
    let s = slink.as_os_str().as_bytes();
    if s.len() > root.len() + 1 && s.starts_with(root) && s[root.len()] == b'/' {
        Ok(Path::new(std::ffi::OsStr::from_bytes(&s[root.len()..])))
    } else {
        Err(LinkError::InvalidLink(slink.to_path_buf()))
    }
}

/// Directory holding the markers for `slink`.
pub fn claim_dir(cfg: &Config, slink: &Path) -> Result<PathBuf> {
    let suffix = stable_name_suffix(cfg, slink)?;
    Ok(cfg.links_root.join(escape::escape_path_os(suffix)))
}

/// Marker path recording that the device with `id` claims `slink`.
/// The id must pass [`parse_device_id`]; anything else cannot serve as
/// a marker filename.
pub fn claim_path(cfg: &Config, slink: &Path, id: &str) -> Result<PathBuf> {
    parse_device_id(id)?;
    Ok(claim_dir(cfg, slink)?.join(id))
}

/// Record this device's claim on `slink`.
///
/// The open is retried when the claim directory is removed between the
/// mkdir and the open by a concurrent claimant retiring the name.
pub fn add_claim(cfg: &Config, dev: &dyn Device, slink: &Path) -> Result<()> {
    let marker = claim_path(cfg, slink, dev.device_id()?)?;
    debug!(marker = %marker.display(), "adding claim");

    loop {
        paths::mkdir_parents(&marker, 0o755)?;
        match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o444)
            .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
            .open(&marker)
        {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Drop this device's claim on `slink`, pruning the claim directory if
/// that was the last marker.
pub fn remove_claim(cfg: &Config, dev: &dyn Device, slink: &Path) -> Result<()> {
    let marker = claim_path(cfg, slink, dev.device_id()?)?;
    debug!(marker = %marker.display(), "removing claim");

    if fs::remove_file(&marker).is_ok() {
        if let Some(dir) = marker.parent() {
            let _ = fs::remove_dir(dir);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devstack_config::testing::TestEnvironment;
    use devstack_device::{DevNum, StaticDevice};
    use std::os::unix::fs::PermissionsExt;

    fn env_and_dev() -> (TestEnvironment, Config, StaticDevice) {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.config();
        let node = env.create_device_node("sda").unwrap();
        let dev = StaticDevice::block(DevNum::new(8, 0), node).with_id("d1");
        (env, cfg, dev)
    }

    #[test]
    fn claim_dir_uses_escaped_suffix() {
        let (env, cfg, _) = env_and_dev();
        let dir = claim_dir(&cfg, &env.devlink("disk/by-id/X")).unwrap();
        assert_eq!(dir, cfg.links_root.join("\\x2fdisk\\x2fby-id\\x2fX"));
    }

    #[test]
    fn names_outside_dev_root_are_rejected() {
        let (_env, cfg, _) = env_and_dev();
        assert!(matches!(
            claim_dir(&cfg, Path::new("/tmp/elsewhere")),
            Err(LinkError::InvalidLink(_))
        ));
        assert!(matches!(
            claim_dir(&cfg, &cfg.dev_root),
            Err(LinkError::InvalidLink(_))
        ));
    }

    #[test]
    fn add_creates_readonly_empty_marker() {
        let (env, cfg, dev) = env_and_dev();
        let slink = env.devlink("disk/by-id/X");

        add_claim(&cfg, &dev, &slink).unwrap();

        let marker = claim_path(&cfg, &slink, "d1").unwrap();
        let meta = fs::metadata(&marker).unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.len(), 0);
        // 0444 before the umask: owner-readable, writable by nobody.
        let mode = meta.permissions().mode();
        assert_eq!(mode & 0o400, 0o400);
        assert_eq!(mode & 0o222, 0);
    }

    #[test]
    fn add_is_idempotent() {
        let (env, cfg, dev) = env_and_dev();
        let slink = env.devlink("disk/X");
        add_claim(&cfg, &dev, &slink).unwrap();

        // Re-opening the 0444 marker for truncation needs
        // CAP_DAC_OVERRIDE; unprivileged runs stop here.
        match add_claim(&cfg, &dev, &slink) {
            Ok(()) => {}
            Err(LinkError::Io(e)) if e.kind() == io::ErrorKind::PermissionDenied => return,
            Err(e) => panic!("unexpected error re-adding claim: {e}"),
        }

        let dir = claim_dir(&cfg, &slink).unwrap();
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[test]
    fn remove_prunes_empty_claim_dir() {
        let (env, cfg, dev) = env_and_dev();
        let slink = env.devlink("disk/X");
        add_claim(&cfg, &dev, &slink).unwrap();

        remove_claim(&cfg, &dev, &slink).unwrap();
        assert!(!claim_dir(&cfg, &slink).unwrap().exists());
    }

    #[test]
    fn remove_keeps_dir_with_other_claimants() {
        let (env, cfg, dev) = env_and_dev();
        let slink = env.devlink("disk/X");
        add_claim(&cfg, &dev, &slink).unwrap();

        let other = StaticDevice::block(DevNum::new(8, 16), env.dev_root.join("sdb"))
            .with_id("d2");
        add_claim(&cfg, &other, &slink).unwrap();

        remove_claim(&cfg, &dev, &slink).unwrap();
        let dir = claim_dir(&cfg, &slink).unwrap();
        assert!(dir.join("d2").exists());
        assert!(!dir.join("d1").exists());
    }

    #[test]
    fn remove_of_absent_claim_is_ok() {
        let (env, cfg, dev) = env_and_dev();
        remove_claim(&cfg, &dev, &env.devlink("disk/never-added")).unwrap();
    }

    #[test]
    fn marker_unsafe_id_is_rejected() {
        let (env, cfg, _) = env_and_dev();
        let slink = env.devlink("disk/X");
        assert!(matches!(
            claim_path(&cfg, &slink, "a/b"),
            Err(LinkError::Device(_))
        ));
        assert!(matches!(
            claim_path(&cfg, &slink, ".hidden"),
            Err(LinkError::Device(_))
        ));
    }
}
