//! tfs log decoder.
//!
//! Walks the chain of log extensions and rebuilds the tuple graph. Tuples and
//! vectors live in arenas and refer to each other by index, so a tuple that
//! is extended by a later reference record is updated in place.

use std::collections::BTreeMap;

use unik_config::log_tfs_trace;

use crate::header::{
    read_header, read_varint, Header, TYPE_BUFFER, TYPE_INTEGER, TYPE_STRING, TYPE_TUPLE,
    TYPE_VECTOR,
};
use crate::{format_err, record, Result, TfsError, TfsVersion, LOG_EXTENSION_SIZE, SECTOR_SIZE, TFS_MAGIC};

/// Index of a tuple in [`TupleGraph`]
pub type TupleId = usize;

/// Index of a vector in [`TupleGraph`]
pub type VectorId = usize;

/// A decoded value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Str(String),
    Tuple(TupleId),
    Vector(VectorId),
}

/// Arena of every tuple and vector found in the log
#[derive(Debug, Default)]
pub struct TupleGraph {
    pub(crate) tuples: Vec<BTreeMap<String, Entry>>,
    pub(crate) vectors: Vec<Vec<Entry>>,
}

impl TupleGraph {
    pub fn tuple(&self, id: TupleId) -> &BTreeMap<String, Entry> {
        &self.tuples[id]
    }

    pub fn vector(&self, id: VectorId) -> &[Entry] {
        &self.vectors[id]
    }
}

/// Dictionary slot; indices are 1-based in the stream
#[derive(Debug)]
enum DictEntry {
    Symbol(String),
    Tuple(TupleId),
    Vector(VectorId),
}

/// Everything recovered from a filesystem log
#[derive(Debug)]
pub struct DecodedLog {
    pub graph: TupleGraph,
    pub root: TupleId,
    pub uuid: [u8; 16],
    pub label: String,
    pub version: TfsVersion,
}

struct LogReader<'a> {
    region: &'a [u8],
    graph: TupleGraph,
    dict: Vec<DictEntry>,
    staging: Vec<u8>,
    tuple_remain: u64,
    uuid: [u8; 16],
    label: String,
    version: TfsVersion,
}

/// Decode the log of the filesystem starting at the beginning of `region`
pub fn decode_log(region: &[u8]) -> Result<DecodedLog> {
    let mut reader = LogReader {
        region,
        graph: TupleGraph::default(),
        dict: Vec::new(),
        staging: Vec::new(),
        tuple_remain: 0,
        uuid: [0; 16],
        label: String::new(),
        version: TfsVersion::default(),
    };

    let mut next = reader
        .read_extension(0, SECTOR_SIZE)
        .map_err(|e| format_err(format!("cannot read filesystem at first log extension: {}", e)))?;
    while let Some(offset) = next {
        log_tfs_trace!("Following log extension", offset = offset);
        next = reader.read_extension(offset, LOG_EXTENSION_SIZE)?;
        if let Some(following) = next {
            if following <= offset {
                return Err(format_err(format!("log extension link at {} points backwards", offset)));
            }
        }
    }

    let root = reader.dict_tuple(1)?;
    Ok(DecodedLog {
        graph: reader.graph,
        root,
        uuid: reader.uuid,
        label: reader.label,
        version: reader.version,
    })
}

impl<'a> LogReader<'a> {
    /// Read one extension; returns the offset of the next one, if linked
    fn read_extension(&mut self, offset: u64, size: u64) -> Result<Option<u64>> {
        let region = self.region;
        let start = offset as usize;
        let buf = region
            .get(start..start + size as usize)
            .ok_or_else(|| format_err(format!("log extension at {} beyond end of image", offset)))?;

        if !buf.starts_with(TFS_MAGIC) {
            return Err(format_err("TFS magic number not found"));
        }
        let mut pos = TFS_MAGIC.len();
        let number = read_varint(buf, &mut pos)?;
        self.version = TfsVersion::from_number(number).ok_or(TfsError::VersionMismatch(number))?;
        let sectors = read_varint(buf, &mut pos)?;
        if sectors != size / SECTOR_SIZE {
            return Err(format_err(format!(
                "unexpected TFS log extension size {}, expected {}",
                sectors,
                size / SECTOR_SIZE
            )));
        }

        if sectors == 1 {
            let uuid = buf
                .get(pos..pos + 16)
                .ok_or_else(|| format_err("truncated filesystem uuid"))?;
            self.uuid.copy_from_slice(uuid);
            pos += 16;
            let label_len = buf[pos..].iter().position(|b| *b == 0).unwrap_or(buf.len() - pos);
            self.label = String::from_utf8_lossy(&buf[pos..pos + label_len]).into_owned();
            pos += label_len + 1;
        }

        loop {
            let rec = *buf
                .get(pos)
                .ok_or_else(|| format_err(format!("log extension at {} not terminated", offset)))?;
            pos += 1;
            match rec {
                record::END_OF_LOG => return Ok(None),
                record::TUPLE_AVAILABLE => {
                    if self.tuple_remain > 0 {
                        return Err(format_err(format!(
                            "unexpected tupleAvailable record (tupleRemain: {})",
                            self.tuple_remain
                        )));
                    }
                    let total = read_varint(buf, &mut pos)?;
                    let length = read_varint(buf, &mut pos)?;
                    if length > total {
                        return Err(format_err(format!(
                            "invalid tupleAvailable record (length: {}, total length: {}, offset: {})",
                            length, total, pos
                        )));
                    }
                    let bytes = segment(buf, pos, length)?;
                    if length == total {
                        self.decode_value(bytes, &mut 0)?;
                    } else {
                        self.staging = bytes.to_vec();
                        self.tuple_remain = total - length;
                    }
                    pos += length as usize;
                }
                record::TUPLE_EXTENDED => {
                    let length = read_varint(buf, &mut pos)?;
                    if length > self.tuple_remain {
                        return Err(format_err(format!(
                            "invalid tupleExtended record (length: {}, tupleRemain: {})",
                            length, self.tuple_remain
                        )));
                    }
                    self.staging.extend_from_slice(segment(buf, pos, length)?);
                    self.tuple_remain -= length;
                    if self.tuple_remain == 0 {
                        let staged = std::mem::take(&mut self.staging);
                        self.decode_value(&staged, &mut 0)?;
                    }
                    pos += length as usize;
                }
                record::END_OF_SEGMENT => continue,
                record::LOG_EXTENSION_LINK => {
                    let sector = read_varint(buf, &mut pos)?;
                    let length = read_varint(buf, &mut pos)?;
                    if length * SECTOR_SIZE != LOG_EXTENSION_SIZE {
                        return Err(format_err(format!(
                            "logExtensionLink record with unexpected length {}",
                            length
                        )));
                    }
                    return Ok(Some(sector * SECTOR_SIZE));
                }
                other => {
                    return Err(format_err(format!("unknown record {} (offset {})", other, pos)));
                }
            }
        }
    }

    fn decode_value(&mut self, buf: &[u8], pos: &mut usize) -> Result<Entry> {
        let header = read_header(buf, pos, self.version)?;
        match header.data_type {
            TYPE_TUPLE => self.decode_tuple(buf, pos, header),
            TYPE_BUFFER | TYPE_STRING => self.decode_buf(buf, pos, header).map(Entry::Str),
            TYPE_VECTOR => self.decode_vector(buf, pos, header),
            TYPE_INTEGER => Ok(Entry::Str(read_varint(buf, pos)?.to_string())),
            other => Err(format_err(format!("unknown data type {} (offset {})", other, pos))),
        }
    }

    fn decode_tuple(&mut self, buf: &[u8], pos: &mut usize, header: Header) -> Result<Entry> {
        let id = if header.is_immediate() {
            let id = self.graph.tuples.len();
            self.graph.tuples.push(BTreeMap::new());
            self.dict.push(DictEntry::Tuple(id));
            id
        } else {
            let reference = read_varint(buf, pos)?;
            self.dict_tuple(reference)?
        };

        for _ in 0..header.length {
            let name = read_header(buf, pos, self.version)?;
            if name.data_type != TYPE_BUFFER {
                return Err(format_err("unexpected name type for symbol"));
            }
            let symbol = self.decode_symbol(buf, pos, name)?;
            let value = self.decode_value(buf, pos)?;
            if symbol.is_empty() {
                continue;
            }
            let tuple = &mut self.graph.tuples[id];
            match value {
                Entry::Str(s) if s.is_empty() => {
                    tuple.remove(&symbol);
                }
                value => {
                    tuple.insert(symbol, value);
                }
            }
        }
        Ok(Entry::Tuple(id))
    }

    fn decode_vector(&mut self, buf: &[u8], pos: &mut usize, header: Header) -> Result<Entry> {
        let id = if header.is_immediate() {
            let id = self.graph.vectors.len();
            self.graph.vectors.push(Vec::new());
            self.dict.push(DictEntry::Vector(id));
            id
        } else {
            let reference = read_varint(buf, pos)?;
            self.dict_vector(reference)?
        };

        for i in 0..header.length as usize {
            let value = self.decode_value(buf, pos)?;
            let vector = &mut self.graph.vectors[id];
            if i < vector.len() {
                vector[i] = value;
            } else {
                vector.push(value);
            }
        }
        Ok(Entry::Vector(id))
    }

    fn decode_symbol(&mut self, buf: &[u8], pos: &mut usize, header: Header) -> Result<String> {
        if header.is_immediate() {
            let sym = String::from_utf8_lossy(segment(buf, *pos, header.length)?).into_owned();
            *pos += header.length as usize;
            self.dict.push(DictEntry::Symbol(sym.clone()));
            return Ok(sym);
        }
        self.dict_string(header.length)
    }

    fn decode_buf(&mut self, buf: &[u8], pos: &mut usize, header: Header) -> Result<String> {
        if header.length == 0 {
            return Ok(String::new());
        }
        if header.is_immediate() {
            let s = String::from_utf8_lossy(segment(buf, *pos, header.length)?).into_owned();
            *pos += header.length as usize;
            return Ok(s);
        }
        self.dict_string(header.length)
    }

    fn dict_entry(&self, index: u64) -> Option<&DictEntry> {
        let slot = usize::try_from(index).ok()?.checked_sub(1)?;
        self.dict.get(slot)
    }

    fn dict_tuple(&self, index: u64) -> Result<TupleId> {
        match self.dict_entry(index) {
            Some(DictEntry::Tuple(id)) => Ok(*id),
            Some(_) => Err(format_err(format!("invalid indirect tuple {}", index))),
            None => Err(format_err(format!("indirect tuple {} not found", index))),
        }
    }

    fn dict_vector(&self, index: u64) -> Result<VectorId> {
        match self.dict_entry(index) {
            Some(DictEntry::Vector(id)) => Ok(*id),
            Some(_) => Err(format_err(format!("invalid indirect vector {}", index))),
            None => Err(format_err(format!("indirect vector {} not found", index))),
        }
    }

    fn dict_string(&self, index: u64) -> Result<String> {
        match self.dict_entry(index) {
            Some(DictEntry::Symbol(s)) => Ok(s.clone()),
            Some(_) => Err(format_err(format!("invalid indirect string {}", index))),
            None => Err(format_err(format!("indirect string {} not found", index))),
        }
    }
}

fn segment(buf: &[u8], pos: usize, length: u64) -> Result<&[u8]> {
    usize::try_from(length)
        .ok()
        .and_then(|len| buf.get(pos..pos.checked_add(len)?))
        .ok_or_else(|| format_err(format!("segment of {} bytes at {} exceeds buffer", length, pos)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{append_varint, push_header, ENTRY_IMMEDIATE, ENTRY_REFERENCE};

    fn decoder(version: TfsVersion) -> LogReader<'static> {
        LogReader {
            region: &[],
            graph: TupleGraph::default(),
            dict: Vec::new(),
            staging: Vec::new(),
            tuple_remain: 0,
            uuid: [0; 16],
            label: String::new(),
            version,
        }
    }

    fn sym(buf: &mut Vec<u8>, s: &str) {
        push_header(buf, ENTRY_IMMEDIATE, TYPE_BUFFER, s.len() as u64, TfsVersion::V4);
        buf.extend_from_slice(s.as_bytes());
    }

    #[test]
    fn test_decode_tuple_with_reference_symbol() {
        // {a: "x", b: {a: "y"}}
        let v4 = TfsVersion::V4;
        let mut buf = Vec::new();
        push_header(&mut buf, ENTRY_IMMEDIATE, TYPE_TUPLE, 2, v4);
        sym(&mut buf, "a");
        sym(&mut buf, "x");
        sym(&mut buf, "b");
        push_header(&mut buf, ENTRY_IMMEDIATE, TYPE_TUPLE, 1, v4);
        push_header(&mut buf, ENTRY_REFERENCE, TYPE_BUFFER, 2, v4);
        sym(&mut buf, "y");

        let mut dec = decoder(v4);
        let root = dec.decode_value(&buf, &mut 0).unwrap();
        assert_eq!(root, Entry::Tuple(0));
        let t = dec.graph.tuple(0);
        assert_eq!(t["a"], Entry::Str("x".into()));
        assert_eq!(dec.graph.tuple(1)["a"], Entry::Str("y".into()));
    }

    #[test]
    fn test_reference_tuple_extends_and_deletes() {
        let v4 = TfsVersion::V4;
        let mut buf = Vec::new();
        push_header(&mut buf, ENTRY_IMMEDIATE, TYPE_TUPLE, 2, v4);
        sym(&mut buf, "k");
        sym(&mut buf, "v");
        sym(&mut buf, "gone");
        sym(&mut buf, "soon");

        let mut dec = decoder(v4);
        dec.decode_value(&buf, &mut 0).unwrap();

        // reference to tuple 1: add "n", delete "gone" with an empty buffer
        let mut update = Vec::new();
        push_header(&mut update, ENTRY_REFERENCE, TYPE_TUPLE, 2, v4);
        append_varint(&mut update, 1);
        sym(&mut update, "n");
        sym(&mut update, "w");
        push_header(&mut update, ENTRY_REFERENCE, TYPE_BUFFER, 3, v4);
        push_header(&mut update, ENTRY_IMMEDIATE, TYPE_BUFFER, 0, v4);
        dec.decode_value(&update, &mut 0).unwrap();

        let t = dec.graph.tuple(0);
        assert_eq!(t.len(), 2);
        assert_eq!(t["k"], Entry::Str("v".into()));
        assert_eq!(t["n"], Entry::Str("w".into()));
    }

    #[test]
    fn test_v5_vector_and_integer() {
        let v5 = TfsVersion::V5;
        let mut buf = Vec::new();
        push_header(&mut buf, ENTRY_IMMEDIATE, TYPE_TUPLE, 2, v5);
        push_header(&mut buf, ENTRY_IMMEDIATE, TYPE_BUFFER, 4, v5);
        buf.extend_from_slice(b"args");
        push_header(&mut buf, ENTRY_IMMEDIATE, TYPE_VECTOR, 2, v5);
        push_header(&mut buf, ENTRY_IMMEDIATE, TYPE_STRING, 2, v5);
        buf.extend_from_slice(b"-v");
        push_header(&mut buf, ENTRY_IMMEDIATE, TYPE_STRING, 1, v5);
        buf.extend_from_slice(b"x");
        push_header(&mut buf, ENTRY_IMMEDIATE, TYPE_BUFFER, 1, v5);
        buf.extend_from_slice(b"n");
        push_header(&mut buf, ENTRY_IMMEDIATE, TYPE_INTEGER, 0, v5);
        append_varint(&mut buf, 300);

        let mut dec = decoder(v5);
        dec.decode_value(&buf, &mut 0).unwrap();
        let t = dec.graph.tuple(0);
        assert_eq!(t["args"], Entry::Vector(0));
        assert_eq!(
            dec.graph.vector(0),
            [Entry::Str("-v".into()), Entry::Str("x".into())]
        );
        assert_eq!(t["n"], Entry::Str("300".into()));
    }

    #[test]
    fn test_bad_references() {
        let v4 = TfsVersion::V4;
        let mut buf = Vec::new();
        push_header(&mut buf, ENTRY_IMMEDIATE, TYPE_TUPLE, 1, v4);
        push_header(&mut buf, ENTRY_REFERENCE, TYPE_BUFFER, 9, v4);
        let err = decoder(v4).decode_value(&buf, &mut 0).unwrap_err();
        assert!(err.to_string().contains("indirect string 9 not found"));

        let mut buf = Vec::new();
        push_header(&mut buf, ENTRY_IMMEDIATE, TYPE_TUPLE, 1, v4);
        push_header(&mut buf, ENTRY_IMMEDIATE, TYPE_TUPLE, 0, v4);
        let err = decoder(v4).decode_value(&buf, &mut 0).unwrap_err();
        assert!(err.to_string().contains("unexpected name type"));
    }

    #[test]
    fn test_missing_magic() {
        let region = vec![0u8; 512];
        let err = decode_log(&region).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_truncated_region() {
        let err = decode_log(b"NVMTFS").unwrap_err();
        assert!(err.to_string().contains("beyond end of image"));
    }
}
