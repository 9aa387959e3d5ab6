use std::io;
use std::path::PathBuf;

use devstack_device::DeviceError;
use thiserror::Error;

/// Errors surfaced by the symlink manager.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The stable name does not lie under the device filesystem root.
    #[error("symbolic link '{0}' is not under the device root")]
    InvalidLink(PathBuf),

    /// A real block or character device inode sits where a symlink was
    /// requested. It belongs to another device and is never touched.
    #[error("conflicting device node '{0}' found, link will not be created")]
    ConflictingNode(PathBuf),

    /// The claim set kept changing for the whole retry budget.
    #[error("symlink '{link}' did not settle after {attempts} attempts")]
    Unstable { link: PathBuf, attempts: u32 },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;
