//! Image composition: boot loader, ESP, boot and root tfs, partition table.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use unik_config::{log_mkfs_debug, log_mkfs_info, log_mkfs_warn};
use unik_manifest::{Attributes, Directory, Manifest};
use unik_tfs::{Encoder, TfsVersion, WrittenFs};

use crate::esp::write_esp;
use crate::mbr::{Mbr, PartitionEntry, MBR_SIZE, PARTITION_TYPE_ESP, PARTITION_TYPE_LINUX};
use crate::{io_context, ImageError, Result, BOOTFS_SIZE, KLOG_DUMP_SIZE, SECTOR_SIZE, UEFI_FS_SIZE};

/// Byte range of one region inside the image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
}

/// Where `execute` placed each region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub esp: Option<Region>,
    pub boot: Option<Region>,
    /// Root filesystem; extends to the end of the file
    pub root: Region,
}

/// Parse `<digits>[k|m|g]` into a byte count rounded up to whole sectors
pub fn parse_size(text: &str) -> Result<u64> {
    let invalid = || ImageError::InvalidSize(text.to_string());

    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    if split == 0 {
        return Err(invalid());
    }
    let multiplier: u64 = match text[split..].to_ascii_lowercase().as_str() {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        _ => return Err(invalid()),
    };
    let bytes = text[..split]
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(invalid)?;
    Ok(bytes.div_ceil(SECTOR_SIZE) * SECTOR_SIZE)
}

/// Builds one image file from a manifest
pub struct MkfsCommand {
    manifest: Option<Manifest>,
    boot_path: Option<PathBuf>,
    uefi_path: Option<PathBuf>,
    out_path: Option<PathBuf>,
    label: String,
    partitions: bool,
    size: u64,
    version: TfsVersion,
    root_fs: Option<WrittenFs>,
    layout: Option<ImageLayout>,
}

impl MkfsCommand {
    /// Without a manifest the root filesystem is empty
    pub fn new(manifest: Option<Manifest>, partitions: bool) -> Self {
        Self {
            manifest,
            boot_path: None,
            uefi_path: None,
            out_path: None,
            label: String::new(),
            partitions,
            size: 0,
            version: TfsVersion::default(),
            root_fs: None,
            layout: None,
        }
    }

    /// Total image size, e.g. "64m"
    pub fn set_file_system_size(&mut self, size: &str) -> Result<()> {
        self.size = parse_size(size)?;
        Ok(())
    }

    /// Boot loader blob copied to the start of the image; implies partitions
    pub fn set_boot(&mut self, path: impl Into<PathBuf>) {
        self.boot_path = Some(path.into());
        self.partitions = true;
    }

    /// UEFI loader placed in an EFI System Partition; implies partitions
    pub fn set_uefi(&mut self, path: impl Into<PathBuf>) {
        self.uefi_path = Some(path.into());
        self.partitions = true;
    }

    pub fn set_partitions(&mut self, partitions: bool) {
        self.partitions = partitions;
    }

    pub fn set_file_system_path(&mut self, path: impl Into<PathBuf>) {
        self.out_path = Some(path.into());
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    pub fn set_tfs_version(&mut self, version: TfsVersion) {
        self.version = version;
    }

    /// Requested total size in bytes (0 = as small as the content allows)
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Region placement of the last successful `execute`
    pub fn layout(&self) -> Option<&ImageLayout> {
        self.layout.as_ref()
    }

    /// Root filesystem UUID (8-4-4-4-12 lowercase hex) once written
    pub fn uuid(&self) -> Option<String> {
        self.root_fs.as_ref().map(WrittenFs::uuid_string)
    }

    /// Write the image
    pub fn execute(&mut self) -> Result<()> {
        let out_path = self.out_path.clone().ok_or(ImageError::MissingOutputPath)?;
        if out_path.exists() {
            log_mkfs_warn!(
                "Overwriting existing image",
                path = tracing::field::display(out_path.display())
            );
        }
        let mut out = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&out_path)
            .map_err(io_context(format!("cannot create output file {}", out_path.display())))?;

        let has_boot_tree = self.manifest.as_ref().is_some_and(Manifest::has_boot);
        // the boot filesystem is only reachable through the partition table
        let partitioned = self.partitions || has_boot_tree;

        let mut offset = 0;
        if let Some(boot_path) = &self.boot_path {
            offset = copy_boot_loader(&mut out, boot_path)?;
        } else if partitioned {
            out.write_all(Mbr::empty().as_bytes())
                .map_err(io_context("cannot write partition table"))?;
            offset = SECTOR_SIZE;
        }
        let loader_end = offset;
        if partitioned {
            offset += KLOG_DUMP_SIZE;
        }

        let mut esp = None;
        if let Some(uefi_path) = &self.uefi_path {
            esp = Some(Region {
                offset,
                size: UEFI_FS_SIZE,
            });
            offset = write_esp(&mut out, offset, uefi_path)?;
        }

        let empty = Directory::new();
        let (root_dir, root_attributes) = match &self.manifest {
            Some(m) => (m.root_dir(), m.root_attributes()),
            None => (&empty, Attributes::new()),
        };

        let mut boot = None;
        if let Some((boot_dir, boot_attributes)) = self
            .manifest
            .as_ref()
            .and_then(|m| m.boot_dir().map(|dir| (dir, m.boot_attributes())))
        {
            Encoder::new(&mut out, offset, BOOTFS_SIZE, "", self.version)?.write(boot_dir, &boot_attributes)?;
            boot = Some(Region {
                offset,
                size: BOOTFS_SIZE,
            });
            log_mkfs_debug!("Boot filesystem written", offset = offset);
            offset += BOOTFS_SIZE;
        }

        let root_fs = Encoder::new(&mut out, offset, 0, &self.label, self.version)?.write(root_dir, &root_attributes)?;
        let root_offset = offset;

        let mut file_len = out
            .metadata()
            .map_err(io_context("cannot get size of output file"))?
            .len();
        if self.size != 0 && file_len < self.size {
            out.set_len(self.size)
                .map_err(io_context("cannot set size of output file"))?;
            file_len = self.size;
        } else if self.size != 0 && file_len > self.size {
            log_mkfs_warn!("Image content exceeds requested size", size = self.size, actual = file_len);
        }

        let layout = ImageLayout {
            esp,
            boot,
            root: Region {
                offset: root_offset,
                size: file_len - root_offset,
            },
        };
        if partitioned {
            write_partition_table(&mut out, &layout, loader_end)?;
        }

        log_mkfs_info!(
            "Image written",
            path = tracing::field::display(out_path.display()),
            uuid = root_fs.uuid_string().as_str(),
            size = file_len,
            partitioned = partitioned
        );
        self.root_fs = Some(root_fs);
        self.layout = Some(layout);
        Ok(())
    }
}

/// Stream the boot loader to the start of `out`, returning its length
fn copy_boot_loader(out: &mut File, boot_path: &Path) -> Result<u64> {
    let mut boot = File::open(boot_path).map_err(io_context(format!(
        "cannot open boot image {}",
        boot_path.display()
    )))?;
    let len = io::copy(&mut boot, out).map_err(io_context(format!(
        "cannot copy boot image {}",
        boot_path.display()
    )))?;
    if len < MBR_SIZE as u64 {
        return Err(ImageError::InvalidMbr(format!(
            "boot image {} shorter than one sector",
            boot_path.display()
        )));
    }
    Ok(len)
}

/// Fill sector 0's partition table from the recorded regions
fn write_partition_table(out: &mut File, layout: &ImageLayout, loader_end: u64) -> Result<()> {
    let mut sector = [0u8; MBR_SIZE];
    out.seek(SeekFrom::Start(0))
        .and_then(|_| out.read_exact(&mut sector))
        .map_err(io_context("failed to read MBR"))?;
    let mut mbr = Mbr::from_bytes(&sector)?;
    if !mbr.has_signature() {
        return Err(ImageError::InvalidMbr("invalid MBR signature".to_string()));
    }
    if let Some(region_len) = mbr.fs_region_length() {
        if SECTOR_SIZE + region_len != loader_end {
            log_mkfs_warn!(
                "Boot loader region length disagrees with its size",
                recorded = region_len,
                loader_size = loader_end
            );
        }
    }

    let mut entries = Vec::with_capacity(4);
    if let Some(esp) = layout.esp {
        entries.push(PartitionEntry::new(PARTITION_TYPE_ESP, esp.offset, esp.size));
    }
    if let Some(boot) = layout.boot {
        entries.push(PartitionEntry::new(PARTITION_TYPE_LINUX, boot.offset, boot.size));
    } else {
        // keep the root in its fixed slot
        entries.push(PartitionEntry::default());
    }
    entries.push(PartitionEntry::new(PARTITION_TYPE_LINUX, layout.root.offset, layout.root.size));
    let used = entries.len();
    entries.resize(4, PartitionEntry::default());
    for (index, entry) in entries.iter().enumerate() {
        mbr.set_partition(index, entry);
    }

    out.seek(SeekFrom::Start(0))
        .and_then(|_| out.write_all(mbr.as_bytes()))
        .map_err(io_context("failed to write MBR"))?;
    log_mkfs_debug!("Partition table written", partitions = used);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("1k").unwrap(), 1024);
        assert_eq!(parse_size("16K").unwrap(), 16 * 1024);
        assert_eq!(parse_size("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("4G").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1024").unwrap(), 1024);
    }

    #[test]
    fn test_parse_size_rounds_to_sector() {
        assert_eq!(parse_size("12").unwrap(), 512);
        assert_eq!(parse_size("513").unwrap(), 1024);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_size_rejects() {
        for bad in ["size", "2s", "", "k", "1kb", "-1", "99999999999999999999g"] {
            assert!(matches!(parse_size(bad), Err(ImageError::InvalidSize(_))), "{bad}");
        }
    }

    #[test]
    fn test_missing_output_path() {
        let mut cmd = MkfsCommand::new(None, false);
        assert!(matches!(cmd.execute(), Err(ImageError::MissingOutputPath)));
        assert!(cmd.uuid().is_none());
    }

    #[test]
    fn test_setters_imply_partitions() {
        let mut cmd = MkfsCommand::new(None, false);
        cmd.set_uefi("/boot/bootx64.efi");
        assert!(cmd.partitions);
        cmd.set_file_system_size("1m").unwrap();
        assert_eq!(cmd.size(), 1024 * 1024);
        assert!(cmd.set_file_system_size("1x").is_err());
    }
}
