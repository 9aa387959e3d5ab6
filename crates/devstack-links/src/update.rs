//! Claim bookkeeping plus convergence for one stable name.
//!
//! After mutating its own claim, the updater repeatedly arbitrates and
//! installs until the claim set stops changing underneath it. The
//! stat-before / arbitrate / stat-after pattern on the claim directory
//! is the concurrent-change detector; no locks are involved. Every
//! iteration rereads the index from disk.

use std::fs;
use std::io;
use std::path::Path;

use devstack_config::Config;
use devstack_device::{Device, DeviceLookup};
use tracing::debug;

use crate::error::{LinkError, Result};
use crate::symlink::LinkOutcome;
use crate::{claims, paths, priority, symlink};

/// Retry budget for an initialised device. Exhausting it means another
/// claimant kept mutating the claim set the whole time.
pub const LINK_UPDATE_MAX_RETRIES: u32 = 128;

/// Add or drop this device's claim on `stable_name` and drive the
/// symlink to the arbitrated winner.
///
/// Before the device's database entry is committed only one pass is
/// made; a wrong symlink from that window is corrected by the next
/// invocation.
pub fn link_update(
    cfg: &Config,
    dev: &dyn Device,
    lookup: &dyn DeviceLookup,
    stable_name: &Path,
    add: bool,
) -> Result<()> {
    let claim_dir = claims::claim_dir(cfg, stable_name)?;
    let marker = claims::claim_path(cfg, stable_name, dev.device_id()?)?;

    if add {
        claims::add_claim(cfg, dev, stable_name)?;
    } else {
        claims::remove_claim(cfg, dev, stable_name)?;
    }

    let retries = if dev.is_initialized() {
        LINK_UPDATE_MAX_RETRIES
    } else {
        1
    };

    let mut i = 0;
    while i < retries {
        let st1 = stat_claim_dir(&claim_dir)?;

        let winner = priority::find_prioritized(dev, add, &claim_dir, lookup)?;
        let Some(node) = winner else {
            debug!(link = %stable_name.display(), "no reference left, removing");
            if fs::remove_file(stable_name).is_ok() {
                paths::rmdir_parents(stable_name, &cfg.dev_root);
            }
            break;
        };

        match symlink::node_symlink(dev, &node, stable_name) {
            Err(e) => {
                // Do not pin a broken state with our own marker.
                let _ = fs::remove_file(&marker);
                return Err(e);
            }
            Ok(LinkOutcome::Replaced) => {
                // We overwrote an existing symlink; another device may
                // be contending for this name right now, so give it one
                // more round to reclaim at a higher priority.
                i += 1;
                continue;
            }
            Ok(LinkOutcome::Created | LinkOutcome::Preserved) => {
                let Some(ref st1) = st1 else { break };
                let st2 = stat_claim_dir(&claim_dir)?;
                if paths::stat_inode_unmodified(Some(st1), st2.as_ref()) {
                    break;
                }
            }
        }
        i += 1;
    }

    // Only the full budget counts as divergence; a single uninitialised
    // pass always settles for now.
    if i < LINK_UPDATE_MAX_RETRIES {
        Ok(())
    } else {
        Err(LinkError::Unstable {
            link: stable_name.to_path_buf(),
            attempts: i,
        })
    }
}

fn stat_claim_dir(dir: &Path) -> Result<Option<fs::Metadata>> {
    match fs::metadata(dir) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
