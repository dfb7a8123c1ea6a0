//! Master Boot Record partition table.
//!
//! Only the parts the kernel and the reader look at are modelled: the
//! 55AA signature, the four 16-byte partition entries and the filesystem
//! region record the boot loader leaves right before the table.

use crate::{ImageError, Result, SECTOR_SIZE};

pub const MBR_SIZE: usize = SECTOR_SIZE as usize;
pub const PARTITION_ENTRY_SIZE: usize = 16;
pub const PARTITION_TABLE_OFFSET: usize = MBR_SIZE - 2 - 4 * PARTITION_ENTRY_SIZE;

pub const PARTITION_TYPE_LINUX: u8 = 0x83;
pub const PARTITION_TYPE_ESP: u8 = 0xEF;

const SIGNATURE: [u8; 2] = [0x55, 0xAA];
const ACTIVE: u8 = 0x80;

/// Boot loader region record type for the stage2 filesystem
const REGION_FILESYSTEM: u32 = 12;

const SECTORS_PER_TRACK: u64 = 63;
const HEADS: u64 = 255;
const MAX_CYLINDER: u64 = 1023;

/// One partition table entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionEntry {
    pub active: bool,
    pub partition_type: u8,
    pub lba_start: u32,
    pub sectors: u32,
}

impl PartitionEntry {
    /// Active entry covering `size` bytes at byte `offset`
    pub fn new(partition_type: u8, offset: u64, size: u64) -> Self {
        Self {
            active: true,
            partition_type,
            lba_start: (offset / SECTOR_SIZE) as u32,
            sectors: (size / SECTOR_SIZE) as u32,
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.lba_start) * SECTOR_SIZE
    }

    pub fn size(&self) -> u64 {
        u64::from(self.sectors) * SECTOR_SIZE
    }

    /// Unused slot (no start or no length)
    pub fn is_empty(&self) -> bool {
        self.lba_start == 0 || self.sectors == 0
    }

    fn encode(&self) -> [u8; PARTITION_ENTRY_SIZE] {
        if *self == Self::default() {
            return [0; PARTITION_ENTRY_SIZE];
        }
        let offset = self.offset();
        let last = (offset + self.size()).saturating_sub(SECTOR_SIZE);

        let mut entry = [0u8; PARTITION_ENTRY_SIZE];
        entry[0] = if self.active { ACTIVE } else { 0 };
        entry[1..4].copy_from_slice(&chs(offset));
        entry[4] = self.partition_type;
        entry[5..8].copy_from_slice(&chs(last));
        entry[8..12].copy_from_slice(&self.lba_start.to_le_bytes());
        entry[12..16].copy_from_slice(&self.sectors.to_le_bytes());
        entry
    }

    fn decode(entry: &[u8]) -> Self {
        Self {
            active: entry[0] == ACTIVE,
            partition_type: entry[4],
            lba_start: u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]),
            sectors: u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]]),
        }
    }
}

/// Cylinder/head/sector triple for a byte offset, as stored in an entry.
///
/// Offsets past cylinder 1023 clamp to the conventional (1023, 254, 63).
pub fn chs(offset: u64) -> [u8; 3] {
    let sector = offset / SECTOR_SIZE;
    let mut cylinder = sector / SECTORS_PER_TRACK / HEADS;
    let mut head = (sector / SECTORS_PER_TRACK % HEADS) as u8;
    let mut sec = sector % SECTORS_PER_TRACK + 1;
    if cylinder > MAX_CYLINDER {
        cylinder = MAX_CYLINDER;
        head = 254;
        sec = 63;
    }
    [head, ((cylinder >> 8) | sec) as u8, (cylinder & 0xff) as u8]
}

/// Sector 0 of an image
#[derive(Clone)]
pub struct Mbr {
    sector: [u8; MBR_SIZE],
}

impl Mbr {
    /// Blank sector carrying only the boot signature
    pub fn empty() -> Self {
        let mut sector = [0u8; MBR_SIZE];
        sector[MBR_SIZE - 2..].copy_from_slice(&SIGNATURE);
        Self { sector }
    }

    /// Take the first sector of `bytes`; shorter input is an error
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let sector: [u8; MBR_SIZE] = bytes
            .get(..MBR_SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| ImageError::InvalidMbr(format!("need {} bytes, got {}", MBR_SIZE, bytes.len())))?;
        Ok(Self { sector })
    }

    pub fn as_bytes(&self) -> &[u8; MBR_SIZE] {
        &self.sector
    }

    pub fn has_signature(&self) -> bool {
        self.sector[MBR_SIZE - 2..] == SIGNATURE
    }

    /// Length of the filesystem region recorded by the boot loader, if any
    pub fn fs_region_length(&self) -> Option<u64> {
        let t = &self.sector[PARTITION_TABLE_OFFSET - 4..PARTITION_TABLE_OFFSET];
        if u32::from_le_bytes([t[0], t[1], t[2], t[3]]) != REGION_FILESYSTEM {
            return None;
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&self.sector[PARTITION_TABLE_OFFSET - 12..PARTITION_TABLE_OFFSET - 4]);
        Some(u64::from_le_bytes(len))
    }

    pub fn partition(&self, index: usize) -> PartitionEntry {
        let start = entry_start(index);
        PartitionEntry::decode(&self.sector[start..start + PARTITION_ENTRY_SIZE])
    }

    pub fn set_partition(&mut self, index: usize, entry: &PartitionEntry) {
        let start = entry_start(index);
        self.sector[start..start + PARTITION_ENTRY_SIZE].copy_from_slice(&entry.encode());
    }
}

fn entry_start(index: usize) -> usize {
    assert!(index < 4, "MBR has four partition slots");
    PARTITION_TABLE_OFFSET + index * PARTITION_ENTRY_SIZE
}
