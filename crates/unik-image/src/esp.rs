//! Minimal FAT32 EFI System Partition holding a single UEFI loader.
//!
//! The partition is written from fixed blobs: the volume boot record and
//! its backup, FSInfo, the head of the FAT with a cluster chain sized for
//! the loader, and the `EFI/Boot` directory entries. The loader file itself
//! starts at cluster 6.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use unik_config::log_mkfs_debug;

use crate::{io_context, ImageError, Result, SECTOR_SIZE, UEFI_FS_SIZE};

const FSINFO_OFFSET: u64 = 0x200;
const BACKUP_VBR_OFFSET: u64 = 0xC00;
const FAT_OFFSET: u64 = 0x4000;
const DIR_EFI_OFFSET: u64 = 0x85800;
const DIR_BOOT_OFFSET: u64 = 0x85A00;
const FILE_ENTRY_OFFSET: u64 = 0x85C00;
const FILE_DATA_OFFSET: u64 = 0x85E00;

const FIRST_CLUSTER: u32 = 6;
const END_OF_CHAIN: u32 = 0x0FFF_FFFF;

const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Volume boot record
const VBR: [u8; 219] = [
    0xEB, 0x58, 0x90, 0x6D, 0x6B, 0x66, 0x73, 0x2E, 0x66, 0x61, 0x74, 0x00, 0x02, 0x01, 0x20, 0x00,
    0x02, 0x00, 0x00, 0x00, 0x00, 0xF8, 0x00, 0x00, 0x20, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xCC, 0x06, 0x01, 0x00, 0x06, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x80, 0x00, 0x29, 0x9E, 0xF9, 0x43, 0xDF, 0x4E, 0x4F, 0x20, 0x4E, 0x41, 0x4D, 0x45, 0x20, 0x20,
    0x20, 0x20, 0x46, 0x41, 0x54, 0x33, 0x32, 0x20, 0x20, 0x20, 0x0E, 0x1F, 0xBE, 0x77, 0x7C, 0xAC,
    0x22, 0xC0, 0x74, 0x0B, 0x56, 0xB4, 0x0E, 0xBB, 0x07, 0x00, 0xCD, 0x10, 0x5E, 0xEB, 0xF0, 0x32,
    0xE4, 0xCD, 0x16, 0xCD, 0x19, 0xEB, 0xFE, 0x54, 0x68, 0x69, 0x73, 0x20, 0x69, 0x73, 0x20, 0x6E,
    0x6F, 0x74, 0x20, 0x61, 0x20, 0x62, 0x6F, 0x6F, 0x74, 0x61, 0x62, 0x6C, 0x65, 0x20, 0x64, 0x69,
    0x73, 0x6B, 0x2E, 0x20, 0x20, 0x50, 0x6C, 0x65, 0x61, 0x73, 0x65, 0x20, 0x69, 0x6E, 0x73, 0x65,
    0x72, 0x74, 0x20, 0x61, 0x20, 0x62, 0x6F, 0x6F, 0x74, 0x61, 0x62, 0x6C, 0x65, 0x20, 0x66, 0x6C,
    0x6F, 0x70, 0x70, 0x79, 0x20, 0x61, 0x6E, 0x64, 0x0D, 0x0A, 0x70, 0x72, 0x65, 0x73, 0x73, 0x20,
    0x61, 0x6E, 0x79, 0x20, 0x6B, 0x65, 0x79, 0x20, 0x74, 0x6F, 0x20, 0x74, 0x72, 0x79, 0x20, 0x61,
    0x67, 0x61, 0x69, 0x6E, 0x20, 0x2E, 0x2E, 0x2E, 0x20, 0x0D, 0x0A,
];

/// FSInfo sector, all zero apart from its three signatures and free counts
const FS_INFO: [u8; 493] = fs_info();

const fn fs_info() -> [u8; 493] {
    let mut b = [0u8; 493];
    b[0] = 0x52;
    b[1] = 0x52;
    b[2] = 0x61;
    b[3] = 0x41;
    b[484] = 0x72;
    b[485] = 0x72;
    b[486] = 0x41;
    b[487] = 0x61;
    b[488] = 0xAE;
    b[489] = 0x01;
    b[490] = 0x01;
    b[492] = 0xF3;
    b
}

/// First entries of the file allocation table
const FAT_HEAD: [u8; 20] = [
    0xF8, 0xFF, 0xFF, 0x0F, 0xFF, 0xFF, 0xFF, 0x0F, 0xF8, 0xFF, 0xFF, 0x0F, 0xFF, 0xFF, 0xFF, 0x0F,
    0xFF, 0xFF, 0xFF, 0x0F,
];

/// "EFI" entry of the root directory
const DIR_EFI: [u8; 27] = [
    0x45, 0x46, 0x49, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x10, 0x00, 0x00, 0x60, 0x39,
    0x7C, 0x52, 0x7C, 0x52, 0x00, 0x00, 0x60, 0x39, 0x7C, 0x52, 0x03,
];

/// "EFI" directory: dot entries and the "Boot" subdirectory
const DIR_BOOT: [u8; 123] = [
    0x2E, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x10, 0x00, 0x00, 0x8F, 0x9C,
    0x7B, 0x52, 0x7B, 0x52, 0x00, 0x00, 0x8F, 0x9C, 0x7B, 0x52, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x2E, 0x2E, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x10, 0x00, 0x00, 0x8F, 0x9C,
    0x7B, 0x52, 0x7B, 0x52, 0x00, 0x00, 0x8F, 0x9C, 0x7B, 0x52, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x41, 0x42, 0x00, 0x6F, 0x00, 0x6F, 0x00, 0x74, 0x00, 0x00, 0x00, 0x0F, 0x00, 0xDD, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF,
    0x42, 0x4F, 0x4F, 0x54, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x10, 0x00, 0x00, 0x8F, 0x9C,
    0x7B, 0x52, 0x7B, 0x52, 0x00, 0x00, 0x8F, 0x9C, 0x7B, 0x52, 0x04,
];

/// "EFI/Boot" directory with "bootx64.efi", size field excluded
const FILE_BOOTX64: [u8; 124] = [
    0x2E, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x10, 0x00, 0x00, 0x8F, 0x9C,
    0x7B, 0x52, 0x7B, 0x52, 0x00, 0x00, 0x8F, 0x9C, 0x7B, 0x52, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x2E, 0x2E, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x10, 0x00, 0x00, 0x8F, 0x9C,
    0x7B, 0x52, 0x7B, 0x52, 0x00, 0x00, 0x8F, 0x9C, 0x7B, 0x52, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x41, 0x62, 0x00, 0x6F, 0x00, 0x6F, 0x00, 0x74, 0x00, 0x78, 0x00, 0x0F, 0x00, 0x1D, 0x36, 0x00,
    0x34, 0x00, 0x2E, 0x00, 0x65, 0x00, 0x66, 0x00, 0x69, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF,
    0x42, 0x4F, 0x4F, 0x54, 0x58, 0x36, 0x34, 0x20, 0x45, 0x46, 0x49, 0x20, 0x00, 0x00, 0x8F, 0x9C,
    0x7B, 0x52, 0x7B, 0x52, 0x00, 0x00, 0x8F, 0x9C, 0x7B, 0x52, 0x05, 0x00,
];

/// "EFI/Boot" directory with "bootaa64.efi", size field excluded
const FILE_BOOTAA64: [u8; 124] = [
    0x2E, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x10, 0x00, 0x00, 0x8F, 0x9C,
    0x7B, 0x52, 0x7B, 0x52, 0x00, 0x00, 0x8F, 0x9C, 0x7B, 0x52, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x2E, 0x2E, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x10, 0x00, 0x00, 0x8F, 0x9C,
    0x7B, 0x52, 0x7B, 0x52, 0x00, 0x00, 0x8F, 0x9C, 0x7B, 0x52, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x41, 0x62, 0x00, 0x6F, 0x00, 0x6F, 0x00, 0x74, 0x00, 0x61, 0x00, 0x0F, 0x00, 0x54, 0x61, 0x00,
    0x36, 0x00, 0x34, 0x00, 0x2E, 0x00, 0x65, 0x00, 0x66, 0x00, 0x00, 0x00, 0x69, 0x00, 0x00, 0x00,
    0x42, 0x4F, 0x4F, 0x54, 0x41, 0x41, 0x36, 0x34, 0x45, 0x46, 0x49, 0x20, 0x00, 0x64, 0x4B, 0x9C,
    0x7B, 0x52, 0x7B, 0x52, 0x00, 0x00, 0x4B, 0x9C, 0x7B, 0x52, 0x05, 0x00,
];

/// Write the ESP at byte `offset` of `image`, returning the offset just past it
pub fn write_esp(image: &mut File, offset: u64, loader_path: &Path) -> Result<u64> {
    let entry = file_entry(loader_path)?;
    let mut loader = File::open(loader_path).map_err(io_context(format!(
        "cannot open UEFI loader file {}",
        loader_path.display()
    )))?;
    let loader_size = loader
        .metadata()
        .map_err(io_context("failed to get UEFI loader file info"))?
        .len();
    if FILE_DATA_OFFSET + loader_size > UEFI_FS_SIZE {
        return Err(ImageError::Uefi(format!(
            "loader of {} bytes does not fit in the partition",
            loader_size
        )));
    }

    write_sector(image, offset, &VBR)?;
    write_sector(image, offset + FSINFO_OFFSET, &FS_INFO)?;
    write_sector(image, offset + BACKUP_VBR_OFFSET, &VBR)?;
    write_at(image, offset + FAT_OFFSET, &fat_chain(loader_size))?;
    write_at(image, offset + DIR_EFI_OFFSET, &DIR_EFI)?;
    write_at(image, offset + DIR_BOOT_OFFSET, &DIR_BOOT)?;

    let mut dir_file = entry.to_vec();
    dir_file.extend_from_slice(&(loader_size as u32).to_le_bytes());
    write_at(image, offset + FILE_ENTRY_OFFSET, &dir_file)?;

    image
        .seek(SeekFrom::Start(offset + FILE_DATA_OFFSET))
        .map_err(io_context("cannot seek in output file"))?;
    io::copy(&mut loader, image).map_err(io_context("cannot copy UEFI loader file"))?;

    log_mkfs_debug!(
        "EFI System Partition written",
        offset = offset,
        loader = tracing::field::display(loader_path.display()),
        loader_size = loader_size
    );
    Ok(offset + UEFI_FS_SIZE)
}

fn file_entry(loader_path: &Path) -> Result<&'static [u8]> {
    let name = loader_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    match name {
        "bootx64.efi" => Ok(&FILE_BOOTX64),
        "bootaa64.efi" => Ok(&FILE_BOOTAA64),
        _ => Err(ImageError::Uefi(format!("invalid UEFI loader file name '{}'", name))),
    }
}

/// FAT head followed by the loader's cluster chain
fn fat_chain(loader_size: u64) -> Vec<u8> {
    let last = FIRST_CLUSTER + loader_size.div_ceil(SECTOR_SIZE) as u32;
    let mut fat = FAT_HEAD.to_vec();
    for cluster in FIRST_CLUSTER..=last {
        fat.extend_from_slice(&cluster.to_le_bytes());
    }
    fat.extend_from_slice(&END_OF_CHAIN.to_le_bytes());
    fat
}

/// Blob at the start of a sector, with the boot signature in its last two bytes
fn write_sector(image: &mut File, pos: u64, blob: &[u8]) -> Result<()> {
    write_at(image, pos, blob)?;
    write_at(image, pos + SECTOR_SIZE - 2, &BOOT_SIGNATURE)
}

fn write_at(image: &mut File, pos: u64, bytes: &[u8]) -> Result<()> {
    image
        .seek(SeekFrom::Start(pos))
        .and_then(|_| image.write_all(bytes))
        .map_err(io_context("cannot write UEFI partition"))
}
