//! # unik-image
//!
//! Composes a bootable unik image out of a [`Manifest`](unik_manifest::Manifest)
//! and reads finished images back.
//!
//! ## Partitioned layout
//!
//! ```text
//! +----------------------+  0
//! | MBR / boot loader    |  signature 55AA at 510, partition table at 446
//! +----------------------+
//! | klog dump gap        |  4 KiB
//! +----------------------+
//! | EFI System Partition |  33 MiB, only with a UEFI loader
//! +----------------------+
//! | boot tfs             |  12 MiB, only when the manifest has a boot tree
//! +----------------------+
//! | root tfs             |  to end of file
//! +----------------------+
//! ```
//!
//! An unpartitioned image is a bare root tfs starting at offset 0.

pub mod esp;
pub mod mbr;
pub mod mkfs;
pub mod reader;

pub use mbr::{Mbr, PartitionEntry};
pub use mkfs::{parse_size, ImageLayout, MkfsCommand, Region};
pub use reader::Reader;

use std::io;

use thiserror::Error;
use unik_manifest::ManifestError;
use unik_tfs::TfsError;

pub use unik_tfs::SECTOR_SIZE;

/// Room left after the boot loader for the kernel to dump its log
pub const KLOG_DUMP_SIZE: u64 = 4 * 1024;

/// Fixed size of the boot filesystem region
pub const BOOTFS_SIZE: u64 = 12 * 1024 * 1024;

/// Fixed size of the EFI System Partition
pub const UEFI_FS_SIZE: u64 = 33 * 1024 * 1024;

/// Errors that can occur while composing or reading an image
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("invalid size {0:?}")]
    InvalidSize(String),

    #[error("output image file path not set")]
    MissingOutputPath,

    #[error("{context}: {source}")]
    Io { context: String, source: io::Error },

    #[error(transparent)]
    Tfs(#[from] TfsError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("invalid MBR: {0}")]
    InvalidMbr(String),

    #[error("bootfs not found")]
    BootFsNotFound,

    #[error("cannot write UEFI partition: {0}")]
    Uefi(String),
}

pub type Result<T> = std::result::Result<T, ImageError>;

/// Attach `context` to an I/O error
pub(crate) fn io_context(context: impl Into<String>) -> impl FnOnce(io::Error) -> ImageError {
    let context = context.into();
    move |source| ImageError::Io { context, source }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_sizes_are_sector_aligned() {
        for size in [KLOG_DUMP_SIZE, BOOTFS_SIZE, UEFI_FS_SIZE] {
            assert_eq!(size % SECTOR_SIZE, 0);
        }
    }

    #[test]
    fn test_io_context_message() {
        let err = io_context("cannot open boot image /x")(io::Error::from(io::ErrorKind::NotFound));
        assert!(err.to_string().starts_with("cannot open boot image /x: "));
    }
}
