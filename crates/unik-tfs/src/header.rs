//! Varints and tuple stream header bytes.
//!
//! A header byte packs, from the top bit down: the entry kind, the data type,
//! a "more bytes" flag and the high bits of the length. Lengths that do not
//! fit spill into continuation bytes of 7 bits each, most significant first,
//! with bit 7 set on all but the last.

use crate::{format_err, Result, TfsVersion};

pub const ENTRY_REFERENCE: u8 = 0;
pub const ENTRY_IMMEDIATE: u8 = 1;

pub const TYPE_BUFFER: u8 = 0;
pub const TYPE_TUPLE: u8 = 1;
pub const TYPE_VECTOR: u8 = 2;
pub const TYPE_INTEGER: u8 = 3;
pub const TYPE_STRING: u8 = 4;

/// Decoded header byte(s)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub entry: u8,
    pub data_type: u8,
    pub length: u64,
}

impl Header {
    pub fn is_immediate(&self) -> bool {
        self.entry == ENTRY_IMMEDIATE
    }
}

pub fn push_header(buf: &mut Vec<u8>, entry: u8, data_type: u8, length: u64, version: TfsVersion) {
    let imm_bits = version.inline_bits();
    let bit_count = u64::BITS - length.leading_zeros();
    let words = if bit_count > imm_bits {
        (bit_count - imm_bits).div_ceil(7)
    } else {
        0
    };

    let mut first = (entry << 7) | (data_type << (imm_bits + 1)) | (length >> (words * 7)) as u8;
    if words != 0 {
        first |= 1 << imm_bits;
    }
    buf.push(first);

    for i in (0..words).rev() {
        let mut byte = ((length >> (i * 7)) & 0x7f) as u8;
        if i != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
    }
}

pub fn read_header(buf: &[u8], offset: &mut usize, version: TfsVersion) -> Result<Header> {
    let imm_bits = version.inline_bits();
    let b = next_byte(buf, offset, "header")?;

    let entry = b >> 7;
    let data_type = (b >> (imm_bits + 1)) & ((1 << (6 - imm_bits)) - 1);
    let mut length = u64::from(b & ((1 << imm_bits) - 1));
    if b & (1 << imm_bits) != 0 {
        loop {
            let b = next_byte(buf, offset, "header")?;
            length = (length << 7) | u64::from(b & 0x7f);
            if b & 0x80 == 0 {
                break;
            }
        }
    }
    Ok(Header {
        entry,
        data_type,
        length,
    })
}

pub fn append_varint(buf: &mut Vec<u8>, mut x: u64) {
    let mut tmp = [0u8; crate::MAX_VARINT_SIZE];
    let mut last = 0;
    tmp[0] = (x & 0x7f) as u8;
    x >>= 7;
    while x != 0 {
        last += 1;
        tmp[last] = 0x80 | (x & 0x7f) as u8;
        x >>= 7;
    }
    buf.extend(tmp[..=last].iter().rev());
}

pub fn read_varint(buf: &[u8], offset: &mut usize) -> Result<u64> {
    let mut result = 0u64;
    loop {
        let b = next_byte(buf, offset, "varint")?;
        result = (result << 7) | u64::from(b & 0x7f);
        if b & 0x80 == 0 {
            return Ok(result);
        }
    }
}

fn next_byte(buf: &[u8], offset: &mut usize, what: &str) -> Result<u8> {
    let b = *buf
        .get(*offset)
        .ok_or_else(|| format_err(format!("{}: buffer length {} exhausted", what, buf.len())))?;
    *offset += 1;
    Ok(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(entry: u8, data_type: u8, length: u64, version: TfsVersion) -> Vec<u8> {
        let mut buf = Vec::new();
        push_header(&mut buf, entry, data_type, length, version);
        buf
    }

    #[test]
    fn test_v4_inline_lengths() {
        let v4 = TfsVersion::V4;
        assert_eq!(header_bytes(ENTRY_IMMEDIATE, TYPE_BUFFER, 5, v4), [0x85]);
        assert_eq!(header_bytes(ENTRY_IMMEDIATE, TYPE_BUFFER, 31, v4), [0x9F]);
        assert_eq!(header_bytes(ENTRY_IMMEDIATE, TYPE_TUPLE, 3, v4), [0xC3]);
        assert_eq!(header_bytes(ENTRY_REFERENCE, TYPE_BUFFER, 7, v4), [0x07]);
    }

    #[test]
    fn test_v4_continuation() {
        let v4 = TfsVersion::V4;
        assert_eq!(header_bytes(ENTRY_IMMEDIATE, TYPE_BUFFER, 32, v4), [0xA0, 0x20]);
        assert_eq!(
            header_bytes(ENTRY_IMMEDIATE, TYPE_BUFFER, 1 << 36, v4),
            [0xA2, 0x80, 0x80, 0x80, 0x80, 0x00]
        );
    }

    #[test]
    fn test_v5_header() {
        let v5 = TfsVersion::V5;
        assert_eq!(header_bytes(ENTRY_IMMEDIATE, TYPE_STRING, 7, v5), [0xC7]);
        assert_eq!(header_bytes(ENTRY_IMMEDIATE, TYPE_VECTOR, 2, v5), [0xA2]);
        assert_eq!(header_bytes(ENTRY_IMMEDIATE, TYPE_TUPLE, 8, v5), [0x98, 0x08]);
    }

    #[test]
    fn test_read_header_known_bytes() {
        let mut offset = 0;
        let bytes = [0xA2, 0x80, 0x80, 0x80, 0x80, 0x00, 0xC3];
        let h = read_header(&bytes, &mut offset, TfsVersion::V4).unwrap();
        assert_eq!(
            h,
            Header {
                entry: ENTRY_IMMEDIATE,
                data_type: TYPE_BUFFER,
                length: 1 << 36
            }
        );
        assert_eq!(offset, 6);

        let h = read_header(&bytes, &mut offset, TfsVersion::V4).unwrap();
        assert_eq!(h.data_type, TYPE_TUPLE);
        assert_eq!(h.length, 3);
        assert!(h.is_immediate());
    }

    #[test]
    fn test_read_header_truncated() {
        let mut offset = 0;
        assert!(read_header(&[0xA0], &mut offset, TfsVersion::V4).is_err());
    }

    #[test]
    fn test_varint() {
        let mut buf = Vec::new();
        append_varint(&mut buf, 300);
        assert_eq!(buf, [0x82, 0x2C]);

        buf.clear();
        append_varint(&mut buf, 0);
        append_varint(&mut buf, 1024);
        assert_eq!(buf, [0x00, 0x88, 0x00]);

        let mut offset = 1;
        assert_eq!(read_varint(&buf, &mut offset).unwrap(), 1024);
        assert_eq!(offset, 3);
        assert!(read_varint(&[0x80], &mut 0).is_err());
    }
}
