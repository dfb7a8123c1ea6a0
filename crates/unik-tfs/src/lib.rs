//! # unik-tfs
//!
//! Encoder and decoder for tfs, the log-structured filesystem read by the
//! unikernel at boot.
//!
//! ## On-disk layout
//!
//! ```text
//! +------------------+  sector 0
//! | Initial log ext  |  "NVMTFS", version, size=1, uuid, label, link record
//! +------------------+  sector 1
//! | Log extension    |  1024 sectors of records, chained by link records
//! +------------------+
//! | File extents     |  file bytes, each padded to whole sectors
//! +------------------+
//! | ...              |
//! ```
//!
//! The log carries one serialized tuple graph: the root tuple holds a
//! `children` tuple for the directory tree plus the boot attributes.

pub mod decoder;
pub mod encoder;
pub mod fs;
pub mod header;

pub use decoder::{Entry, TupleId};
pub use encoder::{Encoder, WrittenFs};
pub use fs::{Extent, FileInfo, FileKind, FileLayout, FileReader, Filesystem};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Bytes per sector; all tfs offsets and lengths are sector based
pub const SECTOR_SIZE: u64 = 512;

/// Size of every log extension after the initial one
pub const LOG_EXTENSION_SIZE: u64 = 1024 * SECTOR_SIZE;

pub(crate) const TFS_MAGIC: &[u8; 6] = b"NVMTFS";

/// Maximum symlink hops followed when opening a file
pub const SYMLINK_HOPS_MAX: usize = 8;

/// Record types of the metadata log
pub(crate) mod record {
    pub const END_OF_LOG: u8 = 1;
    pub const TUPLE_AVAILABLE: u8 = 2;
    pub const TUPLE_EXTENDED: u8 = 3;
    pub const END_OF_SEGMENT: u8 = 4;
    pub const LOG_EXTENSION_LINK: u8 = 5;
}

pub(crate) const MAX_VARINT_SIZE: usize = 10;
pub(crate) const TUPLE_AVAILABLE_HEADER_SIZE: usize = 1 + 2 * MAX_VARINT_SIZE;
pub(crate) const TUPLE_AVAILABLE_MIN_SIZE: usize = TUPLE_AVAILABLE_HEADER_SIZE + 32;
pub(crate) const EXT_LINK_BYTES: usize = 1 + 2 * MAX_VARINT_SIZE;

/// Encoding of the tuple stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TfsVersion {
    /// Two data types (buffer, tuple), 5 inline length bits
    #[default]
    V4,
    /// Adds vector, integer and string types, 3 inline length bits
    V5,
}

impl TfsVersion {
    pub fn number(self) -> u64 {
        match self {
            TfsVersion::V4 => 4,
            TfsVersion::V5 => 5,
        }
    }

    pub fn from_number(number: u64) -> Option<Self> {
        match number {
            4 => Some(TfsVersion::V4),
            5 => Some(TfsVersion::V5),
            _ => None,
        }
    }

    /// Length bits stored in the first header byte
    pub(crate) fn inline_bits(self) -> u32 {
        match self {
            TfsVersion::V4 => 5,
            TfsVersion::V5 => 3,
        }
    }
}

/// Errors that can occur while writing or reading a tfs filesystem
#[derive(Error, Debug)]
pub enum TfsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot read host file {}: {source}", path.display())]
    HostFile { path: PathBuf, source: io::Error },

    #[error("available space ({available} bytes) too small, required {required}")]
    NoSpace { available: u64, required: u64 },

    #[error("label too long for the initial log extension ({0} bytes)")]
    LabelTooLong(usize),

    #[error("TFS version mismatch: found {0}")]
    VersionMismatch(u64),

    #[error("invalid tfs filesystem: {0}")]
    Format(String),

    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("'{0}' is not a file")]
    NotAFile(String),

    #[error("'{0}' is not a symbolic link")]
    NotALink(String),

    #[error("too many symbolic links, aborting at '{0}'")]
    TooManyLinks(String),
}

pub type Result<T> = std::result::Result<T, TfsError>;

pub(crate) fn format_err(msg: impl Into<String>) -> TfsError {
    TfsError::Format(msg.into())
}
