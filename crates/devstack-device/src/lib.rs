//! # devstack-device
//!
//! Device handle abstraction consumed by the symlink manager core.
//!
//! The event dispatcher hands the core an object implementing [`Device`];
//! the core never talks to the kernel device database itself. The one
//! non-trivial collaborator dependency is [`DeviceLookup`], which the
//! priority arbiter uses to re-hydrate a peer device from the id found in
//! a claim marker filename. Production embeds a device-database lookup
//! behind that trait; tests use the in-memory [`StaticRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device has no {0}")]
    MissingField(&'static str),

    #[error("unknown device id '{0}'")]
    UnknownDevice(String),

    #[error("malformed device id '{0}'")]
    InvalidDeviceId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Kernel device number, split into its major/minor halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevNum {
    pub major: u32,
    pub minor: u32,
}

impl DevNum {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Combined `dev_t` as the kernel reports it in `st_rdev`.
    pub fn as_dev_t(&self) -> libc::dev_t {
        libc::makedev(self.major, self.minor)
    }
}

impl fmt::Display for DevNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Build the canonical device id for a device with a device number:
/// `b<major>:<minor>` for the block subsystem, `c<major>:<minor>` otherwise.
///
/// Net devices (`n<ifindex>`) and bare kernel objects
/// (`+<subsystem>:<sysname>`) have no device node and never reach the
/// symlink manager, so only the block/char forms are produced here.
pub fn device_id_for(subsystem: &str, devnum: DevNum) -> String {
    let kind = if subsystem == "block" { 'b' } else { 'c' };
    format!("{kind}{devnum}")
}

/// Parsed view of a device id string.
///
/// Canonical ids are the ones [`device_id_for`] and its net/kernel
/// counterparts produce; any other token that is still usable as a
/// claim marker filename parses as [`DeviceIdRef::Opaque`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceIdRef<'a> {
    /// `b<major>:<minor>`, a block device.
    Block(DevNum),
    /// `c<major>:<minor>`, a character device.
    Char(DevNum),
    /// `n<ifindex>`, a net device.
    Net(u64),
    /// `+<subsystem>:<sysname>`, a kernel object without a device node.
    Sys { subsystem: &'a str, sysname: &'a str },
    /// A non-canonical id that is safe to use as a marker filename.
    Opaque(&'a str),
}

/// Validate a device id and classify its canonical forms.
///
/// Ids that cannot serve as claim marker filenames are rejected: the
/// empty string, ids starting with `.`, and ids containing `/`.
pub fn parse_device_id(id: &str) -> Result<DeviceIdRef<'_>> {
    if id.is_empty() || id.starts_with('.') || id.contains('/') {
        return Err(DeviceError::InvalidDeviceId(id.to_string()));
    }

    let parsed = match id.as_bytes()[0] {
        b'b' => parse_devnum(&id[1..]).map(DeviceIdRef::Block),
        b'c' => parse_devnum(&id[1..]).map(DeviceIdRef::Char),
        b'n' => id[1..].parse().ok().map(DeviceIdRef::Net),
        b'+' => id[1..].split_once(':').and_then(|(subsystem, sysname)| {
            (!subsystem.is_empty() && !sysname.is_empty())
                .then_some(DeviceIdRef::Sys { subsystem, sysname })
        }),
        _ => None,
    };
    Ok(parsed.unwrap_or(DeviceIdRef::Opaque(id)))
}

fn parse_devnum(s: &str) -> Option<DevNum> {
    let (major, minor) = s.split_once(':')?;
    Some(DevNum::new(major.parse().ok()?, minor.parse().ok()?))
}

/// The device handle consumed by the core.
///
/// Getters are fallible because a handle may describe a device the
/// property database has only partially committed; the core decides per
/// call site whether a missing field is fatal or skippable.
pub trait Device {
    /// Stable, unique, filesystem-safe identifier for this device.
    fn device_id(&self) -> Result<&str>;

    /// Absolute path of the device node under the device filesystem.
    fn devnode(&self) -> Result<&Path>;

    fn devnum(&self) -> Result<DevNum>;

    fn subsystem(&self) -> Result<&str>;

    /// Kernel object path, used for log context only.
    fn devpath(&self) -> Result<&str>;

    /// Symlink priority assigned by the rule engine; higher wins.
    fn devlink_priority(&self) -> Result<i32>;

    /// True once the property database entry has been committed.
    /// Arbitration against an uninitialised device is unreliable.
    fn is_initialized(&self) -> bool;

    /// Ordered stable-name paths this device should resolve from.
    fn devlinks(&self) -> Box<dyn Iterator<Item = &Path> + '_>;
}

/// Re-hydrates a peer device from the id recorded in a claim marker.
pub trait DeviceLookup {
    fn device_by_id(&self, id: &str) -> Result<Box<dyn Device + '_>>;
}

/// Lookup that knows no devices. Arbitration then only ever sees the
/// calling device's own seed.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyLookup;

impl DeviceLookup for EmptyLookup {
    fn device_by_id(&self, id: &str) -> Result<Box<dyn Device + '_>> {
        Err(DeviceError::UnknownDevice(id.to_string()))
    }
}

/// Owned, fully-specified device handle.
///
/// This is what embedders build at the event-dispatch boundary and what
/// tests use throughout. Constructors derive the device id from the
/// subsystem and device number; `with_id` overrides it.
#[derive(Debug, Clone)]
pub struct StaticDevice {
    id: String,
    devnode: Option<PathBuf>,
    devnum: Option<DevNum>,
    subsystem: String,
    devpath: Option<String>,
    priority: i32,
    initialized: bool,
    devlinks: Vec<PathBuf>,
}

impl StaticDevice {
    pub fn new(subsystem: &str, devnum: DevNum, devnode: impl Into<PathBuf>) -> Self {
        Self {
            id: device_id_for(subsystem, devnum),
            devnode: Some(devnode.into()),
            devnum: Some(devnum),
            subsystem: subsystem.to_string(),
            devpath: None,
            priority: 0,
            initialized: false,
            devlinks: Vec::new(),
        }
    }

    pub fn block(devnum: DevNum, devnode: impl Into<PathBuf>) -> Self {
        Self::new("block", devnum, devnode)
    }

    pub fn char(subsystem: &str, devnum: DevNum, devnode: impl Into<PathBuf>) -> Self {
        Self::new(subsystem, devnum, devnode)
    }

    pub fn with_id(mut self, id: &str) -> Self {
        debug_assert!(parse_device_id(id).is_ok());
        self.id = id.to_string();
        self
    }

    pub fn with_devpath(mut self, devpath: &str) -> Self {
        self.devpath = Some(devpath.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_initialized(mut self, initialized: bool) -> Self {
        self.initialized = initialized;
        self
    }

    pub fn with_devlink(mut self, link: impl Into<PathBuf>) -> Self {
        self.devlinks.push(link.into());
        self
    }

    /// Drop the device node, modelling a handle whose node vanished.
    pub fn without_devnode(mut self) -> Self {
        self.devnode = None;
        self
    }
}

impl Device for StaticDevice {
    fn device_id(&self) -> Result<&str> {
        Ok(&self.id)
    }

    fn devnode(&self) -> Result<&Path> {
        self.devnode
            .as_deref()
            .ok_or(DeviceError::MissingField("devnode"))
    }

    fn devnum(&self) -> Result<DevNum> {
        self.devnum.ok_or(DeviceError::MissingField("devnum"))
    }

    fn subsystem(&self) -> Result<&str> {
        Ok(&self.subsystem)
    }

    fn devpath(&self) -> Result<&str> {
        self.devpath
            .as_deref()
            .ok_or(DeviceError::MissingField("devpath"))
    }

    fn devlink_priority(&self) -> Result<i32> {
        Ok(self.priority)
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn devlinks(&self) -> Box<dyn Iterator<Item = &Path> + '_> {
        Box::new(self.devlinks.iter().map(PathBuf::as_path))
    }
}

/// In-memory id-to-device map implementing [`DeviceLookup`].
#[derive(Debug, Default)]
pub struct StaticRegistry {
    devices: HashMap<String, StaticDevice>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under its own id, replacing any previous entry.
    pub fn insert(&mut self, dev: StaticDevice) {
        self.devices.insert(dev.id.clone(), dev);
    }

    pub fn remove(&mut self, id: &str) -> Option<StaticDevice> {
        self.devices.remove(id)
    }
}

impl DeviceLookup for StaticRegistry {
    fn device_by_id(&self, id: &str) -> Result<Box<dyn Device + '_>> {
        parse_device_id(id)?;
        self.devices
            .get(id)
            .cloned()
            .map(|d| Box::new(d) as Box<dyn Device>)
            .ok_or_else(|| DeviceError::UnknownDevice(id.to_string()))
    }
}
