//! Path-level queries over a decoded tfs filesystem.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::decoder::{decode_log, Entry, TupleGraph, TupleId};
use crate::{format_err, Result, TfsError, TfsVersion, SECTOR_SIZE, SYMLINK_HOPS_MAX};

/// Kind of a filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    Symlink,
    Regular,
    /// A tuple that is neither a directory, a link nor a file
    Irregular,
}

/// Metadata of one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub kind: FileKind,
    /// `filelength` of regular files, zero otherwise
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// A contiguous run of file data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    /// Byte offset within the file
    pub file_offset: u64,
    /// Byte offset within the filesystem region
    pub region_offset: u64,
    pub length: u64,
    /// Allocated but never written; reads as zeros
    pub uninited: bool,
}

/// Where the bytes of a file live
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileLayout {
    pub length: u64,
    /// Sorted by `file_offset`
    pub extents: Vec<Extent>,
}

impl FileLayout {
    fn extent_at(&self, pos: u64) -> Option<&Extent> {
        let idx = self.extents.partition_point(|e| e.file_offset <= pos);
        let ext = self.extents.get(idx.checked_sub(1)?)?;
        (pos < ext.file_offset + ext.length).then_some(ext)
    }

    fn next_extent_start(&self, pos: u64) -> Option<u64> {
        let idx = self.extents.partition_point(|e| e.file_offset <= pos);
        self.extents.get(idx).map(|e| e.file_offset)
    }
}

/// Read-only view of a decoded filesystem
#[derive(Debug)]
pub struct Filesystem {
    graph: TupleGraph,
    root: TupleId,
    uuid: [u8; 16],
    label: String,
    version: TfsVersion,
}

/// Directory stack from the root down to a looked-up entry
type Located = Vec<TupleId>;

impl Filesystem {
    /// Decode the filesystem stored at the start of `region`
    pub fn decode(region: &[u8]) -> Result<Self> {
        let log = decode_log(region)?;
        Ok(Self {
            graph: log.graph,
            root: log.root,
            uuid: log.uuid,
            label: log.label,
            version: log.version,
        })
    }

    pub fn uuid_bytes(&self) -> [u8; 16] {
        self.uuid
    }

    /// UUID formatted as 8-4-4-4-12 lowercase hex
    pub fn uuid(&self) -> String {
        uuid::Uuid::from_bytes(self.uuid).hyphenated().to_string()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn version(&self) -> TfsVersion {
        self.version
    }

    // === Tuple helpers ===

    fn get(&self, tuple: TupleId, key: &str) -> Option<&Entry> {
        self.graph.tuple(tuple).get(key)
    }

    fn get_str(&self, tuple: TupleId, key: &str) -> Option<&str> {
        match self.get(tuple, key)? {
            Entry::Str(s) => Some(s),
            _ => None,
        }
    }

    fn get_tuple(&self, tuple: TupleId, key: &str) -> Option<TupleId> {
        match self.get(tuple, key)? {
            Entry::Tuple(id) => Some(*id),
            _ => None,
        }
    }

    fn child(&self, dir: TupleId, name: &str) -> Option<TupleId> {
        let children = self.get_tuple(dir, "children")?;
        self.get_tuple(children, name)
    }

    fn is_dir(&self, tuple: TupleId) -> bool {
        self.get_tuple(tuple, "children").is_some()
    }

    fn link_target(&self, tuple: TupleId) -> Option<&str> {
        self.get_str(tuple, "linktarget").filter(|t| !t.is_empty())
    }

    fn kind(&self, tuple: TupleId) -> FileKind {
        if self.is_dir(tuple) {
            FileKind::Directory
        } else if self.link_target(tuple).is_some() {
            FileKind::Symlink
        } else if self.get_tuple(tuple, "extents").is_some() {
            FileKind::Regular
        } else {
            FileKind::Irregular
        }
    }

    fn info(&self, name: &str, tuple: TupleId) -> FileInfo {
        let size = self
            .get_str(tuple, "filelength")
            .and_then(|l| l.parse().ok())
            .unwrap_or(0);
        let mtime = self
            .get_str(tuple, "mtime")
            .and_then(|m| m.parse::<u64>().ok())
            .map(fixed_point_time);
        FileInfo {
            name: name.to_string(),
            kind: self.kind(tuple),
            size,
            mtime,
        }
    }

    // === Lookup ===

    /// Resolve `path` starting from the directory stack `cwd`.
    ///
    /// Absolute paths start at the root. `.` and `..` are resolved against the
    /// stack; `..` at the root stays at the root.
    fn lookup_from(&self, cwd: &[TupleId], path: &str) -> Result<Located> {
        let mut stack: Located = if path.starts_with('/') || cwd.is_empty() {
            vec![self.root]
        } else {
            cwd.to_vec()
        };

        for part in path.split('/').filter(|p| !p.is_empty()) {
            let current = *stack.last().unwrap_or(&self.root);
            if !self.is_dir(current) {
                return Err(TfsError::NotFound(path.to_string()));
            }
            match part {
                "." => {}
                ".." => {
                    if stack.len() > 1 {
                        stack.pop();
                    }
                }
                name => {
                    let child = self
                        .child(current, name)
                        .ok_or_else(|| TfsError::NotFound(path.to_string()))?;
                    stack.push(child);
                }
            }
        }

        let target = *stack.last().unwrap_or(&self.root);
        if !self.is_dir(target) && path.ends_with('/') {
            return Err(TfsError::NotADirectory(path.to_string()));
        }
        Ok(stack)
    }

    fn lookup(&self, path: &str) -> Result<TupleId> {
        let stack = self.lookup_from(&[], path)?;
        Ok(*stack.last().unwrap_or(&self.root))
    }

    pub fn stat(&self, path: &str) -> Result<FileInfo> {
        let tuple = self.lookup(path)?;
        let name = if tuple == self.root {
            "/"
        } else {
            path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
        };
        Ok(self.info(name, tuple))
    }

    /// Entries of the directory at `path`, sorted by name
    pub fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let dir = self.lookup(path)?;
        let children = self
            .get_tuple(dir, "children")
            .ok_or_else(|| TfsError::NotADirectory(path.to_string()))?;
        Ok(self
            .graph
            .tuple(children)
            .iter()
            .filter_map(|(name, entry)| match entry {
                Entry::Tuple(id) => Some(self.info(name, *id)),
                _ => None,
            })
            .collect())
    }

    pub fn read_link(&self, path: &str) -> Result<String> {
        let tuple = self.lookup(path)?;
        self.link_target(tuple)
            .map(str::to_string)
            .ok_or_else(|| TfsError::NotALink(path.to_string()))
    }

    /// Extent layout of the file at `path`, following up to
    /// [`SYMLINK_HOPS_MAX`] symbolic links
    pub fn file_layout(&self, path: &str) -> Result<FileLayout> {
        let mut cwd: Located = vec![self.root];
        let mut current = path.to_string();
        let mut hops = 0;

        let file = loop {
            let mut stack = self.lookup_from(&cwd, &current)?;
            let tuple = *stack.last().unwrap_or(&self.root);
            let Some(target) = self.link_target(tuple) else {
                break tuple;
            };
            if hops == SYMLINK_HOPS_MAX {
                return Err(TfsError::TooManyLinks(current));
            }
            hops += 1;
            stack.pop();
            cwd = stack;
            current = target.to_string();
        };

        let extents = self
            .get_tuple(file, "extents")
            .ok_or_else(|| TfsError::NotAFile(current.clone()))?;
        let length = match self.get_str(file, "filelength") {
            Some(l) => parse_number(l, "file length", &current)?,
            None => 0,
        };

        let mut layout = FileLayout {
            length,
            extents: Vec::new(),
        };
        for (start, entry) in self.graph.tuple(extents) {
            let Entry::Tuple(ext) = entry else {
                return Err(format_err(format!("malformed extent {} of '{}'", start, current)));
            };
            let offset = self.get_str(*ext, "offset").unwrap_or_default();
            let sectors = self.get_str(*ext, "length").unwrap_or_default();
            layout.extents.push(Extent {
                file_offset: parse_number(start, "extent offset", &current)? * SECTOR_SIZE,
                region_offset: parse_number(offset, "extent offset", &current)? * SECTOR_SIZE,
                length: parse_number(sectors, "extent length", &current)? * SECTOR_SIZE,
                uninited: self.get(*ext, "uninited").is_some(),
            });
        }
        layout.extents.sort_by_key(|e| e.file_offset);
        Ok(layout)
    }

    /// Reader over the file at `path`; `region` must be the bytes this
    /// filesystem was decoded from
    pub fn open<'a>(&self, region: &'a [u8], path: &str) -> Result<FileReader<'a>> {
        Ok(FileReader::new(region, self.file_layout(path)?))
    }

    // === Root attributes ===

    /// String attribute of the root tuple
    pub fn root_string(&self, key: &str) -> Option<&str> {
        self.get_str(self.root, key)
    }

    /// String values of the `environment` tuple
    pub fn environment(&self) -> BTreeMap<String, String> {
        let Some(env) = self.get_tuple(self.root, "environment") else {
            return BTreeMap::new();
        };
        self.graph
            .tuple(env)
            .iter()
            .filter_map(|(k, v)| match v {
                Entry::Str(s) => Some((k.clone(), s.clone())),
                _ => None,
            })
            .collect()
    }

    /// Program arguments, stored as a vector or as a tuple keyed "0", "1", ...
    pub fn arguments(&self) -> Vec<String> {
        let as_str = |e: &Entry| match e {
            Entry::Str(s) => Some(s.clone()),
            _ => None,
        };
        match self.get(self.root, "arguments") {
            Some(Entry::Vector(id)) => self.graph.vector(*id).iter().filter_map(as_str).collect(),
            Some(Entry::Tuple(id)) => {
                let mut indexed: Vec<(u64, String)> = self
                    .graph
                    .tuple(*id)
                    .iter()
                    .filter_map(|(k, v)| Some((k.parse().ok()?, as_str(v)?)))
                    .collect();
                indexed.sort_by_key(|(i, _)| *i);
                indexed.into_iter().map(|(_, s)| s).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn parse_number(value: &str, what: &str, path: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|e| format_err(format!("cannot parse {} for '{}': {}", what, path, e)))
}

/// Convert 32.32 fixed-point seconds since the epoch
fn fixed_point_time(raw: u64) -> SystemTime {
    let secs = raw >> 32;
    let nanos = ((raw & 0xffff_ffff) * 1_000_000_000) >> 32;
    UNIX_EPOCH + Duration::new(secs, nanos as u32)
}

/// Sequential reader over one file; holes and uninitialised extents read as zeros
pub struct FileReader<'a> {
    region: &'a [u8],
    layout: FileLayout,
    offset: u64,
}

impl<'a> FileReader<'a> {
    pub fn new(region: &'a [u8], layout: FileLayout) -> Self {
        Self {
            region,
            layout,
            offset: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.layout.length
    }

    pub fn is_empty(&self) -> bool {
        self.layout.length == 0
    }
}

impl Read for FileReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;
        while n < buf.len() && self.offset < self.layout.length {
            let pos = self.offset;
            let want = ((buf.len() - n) as u64).min(self.layout.length - pos);

            // (bytes to produce, region offset to copy from; None reads zeros)
            let (count, source) = match self.layout.extent_at(pos) {
                Some(ext) if !ext.uninited => {
                    let within = pos - ext.file_offset;
                    let count = want.min(ext.length - within) as usize;
                    (count, Some((ext.region_offset + within) as usize))
                }
                Some(ext) => (want.min(ext.file_offset + ext.length - pos) as usize, None),
                None => {
                    let hole_end = self.layout.next_extent_start(pos).unwrap_or(self.layout.length);
                    (want.min(hole_end - pos) as usize, None)
                }
            };

            match source {
                Some(start) => {
                    let src = self.region.get(start..start + count).ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "file extent beyond end of filesystem",
                        )
                    })?;
                    buf[n..n + count].copy_from_slice(src);
                }
                None => buf[n..n + count].fill(0),
            }
            n += count;
            self.offset += count as u64;
        }
        Ok(n)
    }
}
