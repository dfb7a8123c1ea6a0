//! Read-only access to the filesystems of a finished image.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use unik_config::log_reader_debug;
use unik_tfs::{FileInfo, FileKind, FileReader, Filesystem, TfsVersion};

use crate::mbr::{Mbr, PARTITION_TYPE_ESP};
use crate::{io_context, ImageError, Result, BOOTFS_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Root,
    Boot,
}

/// A decoded tfs filesystem backed by a memory-mapped image
pub struct Reader {
    path: PathBuf,
    mmap: Mmap,
    region: Range<usize>,
    fs: Filesystem,
}

impl Reader {
    /// Open the root filesystem of an image (partitioned or raw)
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_target(path.as_ref(), Target::Root)
    }

    /// Open the boot filesystem of a partitioned image
    pub fn open_boot_fs<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_target(path.as_ref(), Target::Boot)
    }

    fn open_target(path: &Path, target: Target) -> Result<Self> {
        let file = File::open(path).map_err(io_context(format!("cannot open image file {}", path.display())))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(io_context("cannot map image file"))?;

        let region = locate(&mmap, target)?;
        log_reader_debug!(
            "Filesystem located",
            target = tracing::field::debug(target),
            start = region.start,
            end = region.end
        );
        let fs = Filesystem::decode(&mmap[region.clone()])?;

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            region,
            fs,
        })
    }

    fn bytes(&self) -> &[u8] {
        &self.mmap[self.region.clone()]
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filesystem(&self) -> &Filesystem {
        &self.fs
    }

    pub fn stat(&self, path: &str) -> Result<FileInfo> {
        Ok(self.fs.stat(path)?)
    }

    pub fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        Ok(self.fs.read_dir(path)?)
    }

    pub fn read_link(&self, path: &str) -> Result<String> {
        Ok(self.fs.read_link(path)?)
    }

    /// Reader over the file's contents, following symlinks
    pub fn read_file(&self, path: &str) -> Result<FileReader<'_>> {
        Ok(self.fs.open(self.bytes(), path)?)
    }

    /// Copy `src` out of the image to `dest` on the host.
    ///
    /// Without `dereference` a symlink is recreated as a symlink.
    pub fn copy_file(&self, src: &str, dest: &Path, dereference: bool) -> Result<()> {
        if !dereference && self.fs.stat(src)?.kind == FileKind::Symlink {
            let target = self.fs.read_link(src)?;
            match fs::remove_file(dest) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    return Err(io_context(format!("cannot replace {}", dest.display()))(e))
                }
                _ => {}
            }
            std::os::unix::fs::symlink(&target, dest).map_err(io_context("cannot create symbolic link"))?;
            return Ok(());
        }

        let mut src_reader = self.read_file(src)?;
        let mut dest_file = File::create(dest).map_err(io_context(format!(
            "cannot create destination file {}",
            dest.display()
        )))?;
        io::copy(&mut src_reader, &mut dest_file).map_err(io_context(format!("cannot copy {}", src)))?;
        Ok(())
    }

    /// Environment variables stored in the image
    pub fn list_env(&self) -> BTreeMap<String, String> {
        self.fs.environment()
    }

    pub fn arguments(&self) -> Vec<String> {
        self.fs.arguments()
    }

    pub fn program(&self) -> Option<&str> {
        self.fs.root_string("program")
    }

    pub fn uuid(&self) -> String {
        self.fs.uuid()
    }

    pub fn label(&self) -> &str {
        self.fs.label()
    }

    pub fn version(&self) -> TfsVersion {
        self.fs.version()
    }
}

/// Byte range of the requested filesystem inside `image`
fn locate(image: &[u8], target: Target) -> Result<Range<usize>> {
    let whole = 0..image.len();
    let mbr = match Mbr::from_bytes(image) {
        Ok(mbr) if mbr.has_signature() => mbr,
        _ => {
            return match target {
                Target::Root => Ok(whole),
                Target::Boot => Err(ImageError::BootFsNotFound),
            }
        }
    };

    let esp = mbr.partition(0).partition_type == PARTITION_TYPE_ESP;
    let slot = match (target, esp) {
        (Target::Root, true) => 2,
        (Target::Root, false) => 1,
        (Target::Boot, true) => 1,
        (Target::Boot, false) => 0,
    };
    let entry = mbr.partition(slot);
    if entry.is_empty() {
        return match target {
            Target::Root => Ok(whole),
            Target::Boot => Err(ImageError::BootFsNotFound),
        };
    }

    let size = match target {
        Target::Root => entry.size(),
        Target::Boot => BOOTFS_SIZE,
    };
    let start = entry.offset();
    let end = start + size;
    if end > image.len() as u64 {
        return Err(ImageError::InvalidMbr(format!(
            "partition {} ends at {} past the image size {}",
            slot,
            end,
            image.len()
        )));
    }
    Ok(start as usize..end as usize)
}
