//! Priority arbitration over a claim directory.
//!
//! Scans the marker files for one stable name and picks the device node
//! the symlink should point at. Stale markers (ids that no longer
//! resolve to a live device) are skipped, never fatal.

use std::fs;
use std::path::{Path, PathBuf};

use devstack_device::{parse_device_id, Device, DeviceLookup};
use tracing::debug;

use crate::error::Result;

/// Device node of the highest-priority claimant, or `None` when nothing
/// claims the name.
///
/// With `add` set, the calling device seeds the candidate with its own
/// node and priority. Peers only displace the incumbent with a strictly
/// greater priority, so ties favour the seed; that bias damps
/// oscillation when two devices of equal priority install concurrently.
pub fn find_prioritized(
    dev: &dyn Device,
    add: bool,
    claim_dir: &Path,
    lookup: &dyn DeviceLookup,
) -> Result<Option<PathBuf>> {
    let mut best: Option<(PathBuf, i32)> = None;
    if add {
        let priority = dev.devlink_priority()?;
        best = Some((dev.devnode()?.to_path_buf(), priority));
    }

    let entries = match fs::read_dir(claim_dir) {
        Ok(entries) => entries,
        // The index may not have been written to disk yet; the seed is
        // then the only claimant we know of.
        Err(_) if best.is_some() => return Ok(best.map(|(node, _)| node)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let own_id = dev.device_id()?;
    for entry in entries {
        // A failing readdir ends the scan with what was seen so far.
        let Ok(entry) = entry else { break };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        // Entries that do not validate as device ids (hidden files,
        // stray temp names) are not markers.
        if parse_device_id(name).is_err() {
            continue;
        }
        if name == own_id {
            continue;
        }

        debug!(claimant = name, dir = %claim_dir.display(), "found claim");

        let Ok(peer) = lookup.device_by_id(name) else {
            continue;
        };
        let Ok(node) = peer.devnode() else { continue };
        let Ok(priority) = peer.devlink_priority() else {
            continue;
        };

        if let Some((_, best_priority)) = &best {
            if priority <= *best_priority {
                continue;
            }
        }
        debug!(
            claimant = name,
            priority,
            dir = %claim_dir.display(),
            "device claims higher priority"
        );
        best = Some((node.to_path_buf(), priority));
    }

    Ok(best.map(|(node, _)| node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use devstack_device::{DevNum, EmptyLookup, StaticDevice, StaticRegistry};
    use tempfile::tempdir;

    fn dev(id: &str, node: &str, priority: i32) -> StaticDevice {
        StaticDevice::block(DevNum::new(8, 0), PathBuf::from("/dev").join(node))
            .with_id(id)
            .with_priority(priority)
    }

    fn mark(dir: &Path, id: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(id), b"").unwrap();
    }

    #[test]
    fn missing_dir_returns_seed_on_add() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("absent");
        let d = dev("d1", "sda", 0);

        let got = find_prioritized(&d, true, &dir, &EmptyLookup).unwrap();
        assert_eq!(got, Some(PathBuf::from("/dev/sda")));
    }

    #[test]
    fn missing_dir_without_seed_is_no_claim() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("absent");
        let d = dev("d1", "sda", 0);

        let got = find_prioritized(&d, false, &dir, &EmptyLookup).unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn higher_priority_peer_wins() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("claims");
        mark(&dir, "d1");
        mark(&dir, "d2");

        let mut reg = StaticRegistry::new();
        reg.insert(dev("d2", "sdb", 10));

        let d1 = dev("d1", "sda", 0);
        let got = find_prioritized(&d1, true, &dir, &reg).unwrap();
        assert_eq!(got, Some(PathBuf::from("/dev/sdb")));
    }

    #[test]
    fn equal_priority_keeps_the_seed() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("claims");
        mark(&dir, "d1");
        mark(&dir, "d2");

        let mut reg = StaticRegistry::new();
        reg.insert(dev("d2", "sdb", 0));

        let d1 = dev("d1", "sda", 0);
        let got = find_prioritized(&d1, true, &dir, &reg).unwrap();
        assert_eq!(got, Some(PathBuf::from("/dev/sda")));
    }

    #[test]
    fn stale_markers_are_skipped() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("claims");
        mark(&dir, "d1");
        mark(&dir, "gone");
        mark(&dir, ".hidden");

        let d1 = dev("d1", "sda", 0);
        let got = find_prioritized(&d1, true, &dir, &EmptyLookup).unwrap();
        assert_eq!(got, Some(PathBuf::from("/dev/sda")));
    }

    #[test]
    fn remove_mode_adopts_remaining_claimant() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("claims");
        mark(&dir, "d2");

        let mut reg = StaticRegistry::new();
        reg.insert(dev("d2", "sdb", -5));

        let d1 = dev("d1", "sda", 0);
        let got = find_prioritized(&d1, false, &dir, &reg).unwrap();
        assert_eq!(got, Some(PathBuf::from("/dev/sdb")));
    }

    #[test]
    fn peer_without_node_is_skipped() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("claims");
        mark(&dir, "d2");

        let mut reg = StaticRegistry::new();
        reg.insert(dev("d2", "sdb", 10).without_devnode());

        let d1 = dev("d1", "sda", 0);
        let got = find_prioritized(&d1, true, &dir, &reg).unwrap();
        assert_eq!(got, Some(PathBuf::from("/dev/sda")));
    }
}
