//! Device lifecycle façade.
//!
//! The event dispatcher calls [`node_add`] on add/change events,
//! [`node_remove`] on remove events, and [`update_old_links`] when a
//! change event shrinks the set of stable names. A failure on one
//! stable name never poisons the remaining names of the same device.

use std::fs;
use std::path::PathBuf;

use devstack_config::Config;
use devstack_device::{Device, DeviceLookup};
use tracing::{debug, warn};

use crate::error::Result;
use crate::permissions::{self, SecLabel};
use crate::{symlink, update};

/// Fixed-topology link path `<dev_root>/<block|char>/<major>:<minor>`.
pub fn dev_num_path(cfg: &Config, dev: &dyn Device) -> Result<PathBuf> {
    let subsystem = dev.subsystem()?;
    let devnum = dev.devnum()?;
    let kind = if subsystem == "block" { "block" } else { "char" };
    Ok(cfg.dev_root.join(kind).join(devnum.to_string()))
}

/// Handle a device appearing or changing: reconcile node permissions,
/// install the fixed-topology link, then bring every stable name of the
/// device up to date.
///
/// A permission-reconciliation failure aborts the add before any link
/// is touched; the next event for the device retries. Failures on
/// individual stable names are logged and skipped.
#[allow(clippy::too_many_arguments)]
pub fn node_add(
    cfg: &Config,
    dev: &dyn Device,
    lookup: &dyn DeviceLookup,
    apply_mac: bool,
    mode: Option<u32>,
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
    seclabels: &[SecLabel],
) -> Result<()> {
    let devnode = dev.devnode()?.to_path_buf();
    debug!(
        node = %devnode.display(),
        id = dev.device_id().unwrap_or("n/a"),
        "handling device node"
    );

    permissions::apply_node_permissions(dev, apply_mac, mode, uid, gid, seclabels)?;

    // Always provide /dev/{block,char}/<major>:<minor>, best effort.
    let num_path = dev_num_path(cfg, dev)?;
    if let Err(e) = symlink::node_symlink(dev, &devnode, &num_path) {
        debug!(link = %num_path.display(), error = %e, "failed to create device number symlink");
    }

    for link in dev.devlinks() {
        if let Err(e) = update::link_update(cfg, dev, lookup, link, true) {
            warn!(
                link = %link.display(),
                error = %e,
                "failed to update device symlink, ignoring"
            );
        }
    }

    Ok(())
}

/// Handle a device going away: retire every stable name, then drop the
/// fixed-topology link.
pub fn node_remove(cfg: &Config, dev: &dyn Device, lookup: &dyn DeviceLookup) -> Result<()> {
    for link in dev.devlinks() {
        if let Err(e) = update::link_update(cfg, dev, lookup, link, false) {
            warn!(
                link = %link.display(),
                error = %e,
                "failed to update device symlink, ignoring"
            );
        }
    }

    let num_path = dev_num_path(cfg, dev)?;
    let _ = fs::remove_file(&num_path);
    Ok(())
}

/// Retire stable names the ruleset stopped emitting: every name on the
/// old handle that the new handle no longer carries.
pub fn update_old_links(
    cfg: &Config,
    dev: &dyn Device,
    dev_old: &dyn Device,
    lookup: &dyn DeviceLookup,
) -> Result<()> {
    let devpath = dev.devpath()?;

    for old_link in dev_old.devlinks() {
        if dev.devlinks().any(|l| l == old_link) {
            continue;
        }

        debug!(
            link = %old_link.display(),
            devpath,
            "removing symlink no longer belonging to device"
        );
        if let Err(e) = update::link_update(cfg, dev, lookup, old_link, false) {
            warn!(
                link = %old_link.display(),
                error = %e,
                "failed to update device symlink, ignoring"
            );
        }
    }

    Ok(())
}
