//! tfs encoder.
//!
//! The whole tree is serialized into a staging buffer first; file contents
//! go straight to freshly allocated extents as they are met. The staged
//! tuple stream is then written once, split over as many chained log
//! extensions as it needs.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::mem;
use std::path::Path;

use unik_config::{log_tfs_debug, log_tfs_trace};
use unik_manifest::{Attributes, Directory, Node, Value};

use crate::header::{
    append_varint, push_header, ENTRY_IMMEDIATE, ENTRY_REFERENCE, TYPE_BUFFER, TYPE_STRING,
    TYPE_TUPLE, TYPE_VECTOR,
};
use crate::{
    record, Result, TfsError, TfsVersion, EXT_LINK_BYTES, LOG_EXTENSION_SIZE, SECTOR_SIZE,
    TFS_MAGIC, TUPLE_AVAILABLE_HEADER_SIZE, TUPLE_AVAILABLE_MIN_SIZE,
};

/// One log extension being filled in memory
struct LogExtension {
    /// Offset from the start of the filesystem
    offset: u64,
    capacity: usize,
    buffer: Vec<u8>,
}

impl LogExtension {
    fn available(&self) -> usize {
        self.capacity - self.buffer.len()
    }

    fn link_to(&mut self, next_offset: u64) {
        self.buffer.push(record::LOG_EXTENSION_LINK);
        append_varint(&mut self.buffer, next_offset / SECTOR_SIZE);
        append_varint(&mut self.buffer, LOG_EXTENSION_SIZE / SECTOR_SIZE);
    }

    /// Write the extension zero-padded to its full capacity
    fn write_to(mut self, file: &mut File, img_offset: u64) -> io::Result<()> {
        self.buffer.resize(self.capacity, 0);
        file.seek(SeekFrom::Start(img_offset + self.offset))?;
        file.write_all(&self.buffer)
    }
}

/// Result of a successful encode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFs {
    pub uuid: [u8; 16],
    /// Bytes of the region in use, log and extents
    pub allocated: u64,
}

impl WrittenFs {
    /// UUID formatted as 8-4-4-4-12 lowercase hex
    pub fn uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.uuid).hyphenated().to_string()
    }
}

/// Encode session for one filesystem region of an image file
pub struct Encoder<'f> {
    file: &'f mut File,
    img_offset: u64,
    /// Region size; zero grows as needed
    size: u64,
    allocated: u64,
    uuid: [u8; 16],
    version: TfsVersion,
    current: LogExtension,
    sym_dict: HashMap<String, u64>,
    non_sym_count: u64,
    staging: Vec<u8>,
}

impl<'f> Encoder<'f> {
    /// Prepare to write a filesystem at `img_offset` of `file`
    pub fn new(
        file: &'f mut File,
        img_offset: u64,
        size: u64,
        label: &str,
        version: TfsVersion,
    ) -> Result<Self> {
        let uuid = *uuid::Uuid::new_v4().as_bytes();

        let mut initial = Self::new_extension(0, SECTOR_SIZE, version);
        initial.buffer.extend_from_slice(&uuid);
        initial.buffer.extend_from_slice(label.as_bytes());
        initial.buffer.push(0);
        if initial.buffer.len() + EXT_LINK_BYTES > initial.capacity {
            return Err(TfsError::LabelTooLong(label.len()));
        }

        Ok(Self {
            file,
            img_offset,
            size,
            allocated: 0,
            uuid,
            version,
            current: initial,
            sym_dict: HashMap::new(),
            non_sym_count: 0,
            staging: Vec::new(),
        })
    }

    fn new_extension(offset: u64, size: u64, version: TfsVersion) -> LogExtension {
        let capacity = size as usize;
        let mut buffer = Vec::with_capacity(capacity);
        buffer.extend_from_slice(TFS_MAGIC);
        append_varint(&mut buffer, version.number());
        append_varint(&mut buffer, size / SECTOR_SIZE);
        LogExtension {
            offset,
            capacity,
            buffer,
        }
    }

    /// Encode `children` and `attributes` as the root tuple and write it all out
    pub fn write(mut self, children: &Directory, attributes: &Attributes) -> Result<WrittenFs> {
        self.log_init()?;

        self.encode_tuple_header(attributes.len() as u64 + 1);
        self.write_dir_entries(children)?;
        for (name, value) in attributes {
            self.encode_metadata(name, value)?;
        }
        self.flush()?;

        log_tfs_debug!(
            "Filesystem written",
            offset = self.img_offset,
            allocated = self.allocated,
            symbols = self.sym_dict.len(),
        );
        Ok(WrittenFs {
            uuid: self.uuid,
            allocated: self.allocated,
        })
    }

    fn check_space(&self, required: u64) -> Result<()> {
        if self.size != 0 && self.allocated + required > self.size {
            return Err(TfsError::NoSpace {
                available: self.size.saturating_sub(self.allocated),
                required,
            });
        }
        Ok(())
    }

    fn log_init(&mut self) -> Result<()> {
        self.check_space(SECTOR_SIZE)?;
        self.allocated += SECTOR_SIZE;
        self.log_extend()
    }

    /// Chain a new extension after the current one and write the current one out
    fn log_extend(&mut self) -> Result<()> {
        self.check_space(LOG_EXTENSION_SIZE)?;
        let next = Self::new_extension(self.allocated, LOG_EXTENSION_SIZE, self.version);
        self.current.link_to(next.offset);
        self.allocated += LOG_EXTENSION_SIZE;

        let previous = mem::replace(&mut self.current, next);
        log_tfs_trace!("Log extension chained", offset = self.current.offset);
        previous.write_to(self.file, self.img_offset)?;
        Ok(())
    }

    // === Tuple stream ===

    fn push_header(&mut self, entry: u8, data_type: u8, length: u64) {
        push_header(&mut self.staging, entry, data_type, length, self.version);
    }

    fn encode_tuple_header(&mut self, entries: u64) {
        self.push_header(ENTRY_IMMEDIATE, TYPE_TUPLE, entries);
        self.non_sym_count += 1;
    }

    fn encode_string(&mut self, s: &str, data_type: u8) {
        self.push_header(ENTRY_IMMEDIATE, data_type, s.len() as u64);
        self.staging.extend_from_slice(s.as_bytes());
    }

    fn encode_symbol(&mut self, name: &str) {
        match self.sym_dict.get(name) {
            Some(&index) => self.push_header(ENTRY_REFERENCE, TYPE_BUFFER, index),
            None => {
                self.encode_string(name, TYPE_BUFFER);
                let index = 1 + self.sym_dict.len() as u64 + self.non_sym_count;
                self.sym_dict.insert(name.to_string(), index);
            }
        }
    }

    fn encode_metadata(&mut self, name: &str, value: &Value) -> Result<()> {
        self.encode_symbol(name);
        self.encode_value(value)
    }

    fn encode_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::String(s) => {
                let data_type = match self.version {
                    TfsVersion::V4 => TYPE_BUFFER,
                    TfsVersion::V5 => TYPE_STRING,
                };
                self.encode_string(s, data_type);
            }
            Value::List(items) => match self.version {
                TfsVersion::V4 => {
                    self.encode_tuple_header(items.len() as u64);
                    for (i, item) in items.iter().enumerate() {
                        self.encode_metadata(&i.to_string(), item)?;
                    }
                }
                TfsVersion::V5 => {
                    self.push_header(ENTRY_IMMEDIATE, TYPE_VECTOR, items.len() as u64);
                    self.non_sym_count += 1;
                    for item in items {
                        self.encode_value(item)?;
                    }
                }
            },
            Value::Tuple(tuple) => {
                self.encode_tuple_header(tuple.len() as u64);
                for (name, item) in tuple {
                    self.encode_metadata(name, item)?;
                }
            }
        }
        Ok(())
    }

    // === Tree ===

    fn write_dir_entries(&mut self, dir: &Directory) -> Result<()> {
        self.encode_symbol("children");
        self.encode_tuple_header(dir.len() as u64);
        for (name, node) in dir {
            match node {
                Node::Directory(child) => {
                    self.encode_symbol(name);
                    self.encode_tuple_header(1);
                    self.write_dir_entries(child)?;
                }
                Node::File(host_path) => self.write_file(name, host_path)?,
                Node::Link(target) => {
                    let tuple = Attributes::from([("linktarget".to_string(), Value::from(target.as_str()))]);
                    self.encode_metadata(name, &Value::Tuple(tuple))?;
                }
            }
        }
        Ok(())
    }

    /// Copy a host file into a new extent and encode its file tuple
    fn write_file(&mut self, name: &str, host_path: &Path) -> Result<()> {
        let host_err = |source| TfsError::HostFile {
            path: host_path.to_path_buf(),
            source,
        };
        let mut host = File::open(host_path).map_err(host_err)?;
        let length = host.metadata().map_err(host_err)?.len();

        let mut extents = Attributes::new();
        if length > 0 {
            let sectors = length.div_ceil(SECTOR_SIZE);
            let padded = sectors * SECTOR_SIZE;
            self.check_space(padded)?;

            self.file
                .seek(SeekFrom::Start(self.img_offset + self.allocated))?;
            io::copy(&mut (&mut host).take(length), &mut *self.file).map_err(host_err)?;

            let sectors = sectors.to_string();
            let extent = Attributes::from([
                ("length".to_string(), Value::from(sectors.as_str())),
                ("offset".to_string(), Value::from((self.allocated / SECTOR_SIZE).to_string())),
                ("allocated".to_string(), Value::from(sectors)),
            ]);
            self.allocated += padded;
            extents.insert("0".to_string(), Value::Tuple(extent));
        }
        log_tfs_trace!(
            "File extent allocated",
            name = name,
            length = length,
            allocated = self.allocated,
        );

        let tuple = Attributes::from([
            ("filelength".to_string(), Value::from(length.to_string())),
            ("extents".to_string(), Value::Tuple(extents)),
        ]);
        self.encode_metadata(name, &Value::Tuple(tuple))
    }

    // === Log output ===

    /// Write the staged tuple stream into the log and terminate it
    fn flush(&mut self) -> Result<()> {
        let staging = mem::take(&mut self.staging);
        let total = staging.len() as u64;
        let mut remaining = staging.as_slice();
        let mut first = true;

        while !remaining.is_empty() {
            if self.current.available() < TUPLE_AVAILABLE_MIN_SIZE + EXT_LINK_BYTES {
                self.log_extend()?;
            }
            let available = self.current.available();
            let length = (available - EXT_LINK_BYTES - TUPLE_AVAILABLE_HEADER_SIZE).min(remaining.len());

            let buffer = &mut self.current.buffer;
            if first {
                buffer.push(record::TUPLE_AVAILABLE);
                append_varint(buffer, total);
            } else {
                buffer.push(record::TUPLE_EXTENDED);
            }
            append_varint(buffer, length as u64);
            buffer.extend_from_slice(&remaining[..length]);
            remaining = &remaining[length..];
            first = false;
        }
        self.current.buffer.push(record::END_OF_LOG);

        let last = mem::replace(
            &mut self.current,
            Self::new_extension(self.allocated, SECTOR_SIZE, self.version),
        );
        last.write_to(self.file, self.img_offset)?;

        let min_len = self.img_offset + if self.size != 0 { self.size } else { self.allocated };
        if self.file.metadata()?.len() < min_len {
            self.file.set_len(min_len)?;
        }
        Ok(())
    }
}
