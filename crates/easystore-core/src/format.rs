//! DES v1 Container Format
//!
//! Byte-exact encoders and decoders for the four fixed structures of a
//! container: the 16-byte header, the 80-byte footer, the variable-width
//! index entry, and the flag bits. All integers are little-endian; all
//! offsets are absolute from the start of the stream.
//!
//! ## Header (16 bytes)
//!
//! ```text
//! offset  size  field
//! 0       8     magic "DESHEAD1"
//! 8       2     version (u16, = 1)
//! 10      6     reserved, zero
//! ```
//!
//! ## Footer (80 bytes, ends the stream)
//!
//! ```text
//! offset  size  field
//! 0       8     data_start
//! 8       8     data_length
//! 16      8     meta_start
//! 24      8     meta_length
//! 32      8     index_start
//! 40      8     index_length
//! 48      8     file_count
//! 56      2     version (u16, = 1)
//! 58      14    reserved, zero
//! 72      8     magic "DESFOOT1"
//! ```
//!
//! Reading the last 80 bytes of an object is always enough to locate the
//! index. The trailing 8 bytes MUST equal `DESFOOT1` or the stream is
//! refused.
//!
//! ## Index entry (40 fixed bytes + name)
//!
//! ```text
//! name_length   u16
//! name          UTF-8, NUL-free
//! data_offset   u64   absolute (0 for external entries)
//! data_length   u64   (0 for external entries)
//! meta_offset   u64   absolute
//! meta_length   u32
//! flags         u32   bit 0 = external; other bits reserved
//! reserved      8 bytes, zero
//! ```
//!
//! Entries are variable length, so the index region is decoded sequentially.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Magic bytes opening every container: `DESHEAD1`.
pub const HEADER_MAGIC: [u8; 8] = *b"DESHEAD1";

/// Magic bytes closing every container: `DESFOOT1`.
pub const FOOTER_MAGIC: [u8; 8] = *b"DESFOOT1";

/// Container format version written by this crate.
pub const VERSION: u16 = 1;

/// Header size; DATA always starts here.
pub const HEADER_SIZE: usize = 16;

/// Footer size; the footer always occupies the trailing 80 bytes.
pub const FOOTER_SIZE: usize = 80;

/// Fixed portion of an index entry, excluding the length-prefixed name.
pub const ENTRY_FIXED_SIZE: usize = 40;

/// Smallest possible well-formed container (header + footer, zero files).
pub const MIN_CONTAINER_SIZE: u64 = (HEADER_SIZE + FOOTER_SIZE) as u64;

/// Entry flag: file bytes live in the external sidecar, not in DATA.
pub const FLAG_EXTERNAL: u32 = 1 << 0;

/// Reserved flag: compressed payload (not produced by v1).
pub const FLAG_COMPRESSED: u32 = 1 << 1;

/// Reserved flag: encrypted payload (not produced by v1).
pub const FLAG_ENCRYPTED: u32 = 1 << 2;

/// Default threshold above which a payload is diverted to the sidecar.
pub const DEFAULT_BIG_FILE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Default gap budget for batched range reads.
pub const DEFAULT_MAX_GAP: u64 = 1024 * 1024;

/// One file's entry in the container index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// File name, unique within the container.
    pub name: String,

    /// Absolute offset of the file bytes in DATA (0 for external entries).
    pub data_offset: u64,

    /// Length of the file bytes in DATA (0 for external entries).
    pub data_length: u64,

    /// Absolute offset of the file's JSON metadata blob in META.
    pub meta_offset: u64,

    /// Length of the metadata blob.
    pub meta_length: u32,

    /// Flag bits; see [`FLAG_EXTERNAL`].
    pub flags: u32,
}

impl IndexEntry {
    /// Whether the file bytes live in the external sidecar.
    pub fn is_external(&self) -> bool {
        self.flags & FLAG_EXTERNAL != 0
    }

    /// Encoded size of this entry in the INDEX region.
    pub fn encoded_len(&self) -> usize {
        2 + self.name.len() + ENTRY_FIXED_SIZE
    }
}

/// Parsed container footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub data_start: u64,
    pub data_length: u64,
    pub meta_start: u64,
    pub meta_length: u64,
    pub index_start: u64,
    pub index_length: u64,
    pub file_count: u64,
    pub version: u16,
}

impl Footer {
    /// Offset of the footer itself (== end of the INDEX region).
    pub fn footer_start(&self) -> u64 {
        self.index_start + self.index_length
    }

    /// Encode into the 80-byte on-disk form.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.data_start);
        buf.put_u64_le(self.data_length);
        buf.put_u64_le(self.meta_start);
        buf.put_u64_le(self.meta_length);
        buf.put_u64_le(self.index_start);
        buf.put_u64_le(self.index_length);
        buf.put_u64_le(self.file_count);
        buf.put_u16_le(self.version);
        buf.put_bytes(0, 14);
        buf.put_slice(&FOOTER_MAGIC);
    }

    /// Decode the trailing 80 bytes of a container.
    ///
    /// The trailing magic is checked first: any stream whose final 8 bytes
    /// are not `DESFOOT1` is refused outright.
    pub fn decode(buf: &[u8]) -> Result<Footer> {
        if buf.len() != FOOTER_SIZE {
            return Err(CoreError::CorruptContainer(format!(
                "footer must be {} bytes, got {}",
                FOOTER_SIZE,
                buf.len()
            )));
        }
        if buf[FOOTER_SIZE - 8..] != FOOTER_MAGIC {
            return Err(CoreError::CorruptContainer(
                "bad footer magic".to_string(),
            ));
        }

        let mut cur = buf;
        let footer = Footer {
            data_start: cur.get_u64_le(),
            data_length: cur.get_u64_le(),
            meta_start: cur.get_u64_le(),
            meta_length: cur.get_u64_le(),
            index_start: cur.get_u64_le(),
            index_length: cur.get_u64_le(),
            file_count: cur.get_u64_le(),
            version: cur.get_u16_le(),
        };

        if footer.version != VERSION {
            return Err(CoreError::CorruptContainer(format!(
                "unknown footer version {}",
                footer.version
            )));
        }

        Ok(footer)
    }

    /// Check the region-chaining invariants against the total object size.
    ///
    /// A well-formed container satisfies:
    /// `data_start == 16`,
    /// `meta_start == data_start + data_length`,
    /// `index_start == meta_start + meta_length`,
    /// `footer_start + 80 == object_size`.
    pub fn validate(&self, object_size: u64) -> Result<()> {
        if self.data_start != HEADER_SIZE as u64 {
            return Err(CoreError::CorruptContainer(format!(
                "data_start {} != {}",
                self.data_start, HEADER_SIZE
            )));
        }
        if self.meta_start != self.data_start + self.data_length {
            return Err(CoreError::CorruptContainer(
                "meta_start does not follow DATA".to_string(),
            ));
        }
        if self.index_start != self.meta_start + self.meta_length {
            return Err(CoreError::CorruptContainer(
                "index_start does not follow META".to_string(),
            ));
        }
        if self.footer_start() + FOOTER_SIZE as u64 != object_size {
            return Err(CoreError::CorruptContainer(format!(
                "footer_start {} + {} != object size {}",
                self.footer_start(),
                FOOTER_SIZE,
                object_size
            )));
        }
        Ok(())
    }
}

/// Encode the 16-byte container header.
pub fn encode_header(buf: &mut BytesMut) {
    buf.put_slice(&HEADER_MAGIC);
    buf.put_u16_le(VERSION);
    buf.put_bytes(0, HEADER_SIZE - 10);
}

/// Decode and validate the container header, returning the version.
///
/// Consumers must refuse containers whose header version is newer than
/// [`VERSION`].
pub fn decode_header(buf: &[u8]) -> Result<u16> {
    if buf.len() < HEADER_SIZE {
        return Err(CoreError::CorruptContainer(format!(
            "header must be {} bytes, got {}",
            HEADER_SIZE,
            buf.len()
        )));
    }
    if buf[..8] != HEADER_MAGIC {
        return Err(CoreError::CorruptContainer("bad header magic".to_string()));
    }
    let version = u16::from_le_bytes([buf[8], buf[9]]);
    if version == 0 {
        return Err(CoreError::CorruptContainer(
            "header version 0".to_string(),
        ));
    }
    if version > VERSION {
        return Err(CoreError::UnsupportedVersion(version));
    }
    Ok(version)
}

/// Encode one index entry.
pub fn encode_entry(entry: &IndexEntry, buf: &mut BytesMut) -> Result<()> {
    let name_bytes = entry.name.as_bytes();
    if name_bytes.is_empty() || name_bytes.len() > u16::MAX as usize {
        return Err(CoreError::InvalidName {
            name: entry.name.clone(),
            reason: "name length out of range for index entry",
        });
    }
    buf.put_u16_le(name_bytes.len() as u16);
    buf.put_slice(name_bytes);
    buf.put_u64_le(entry.data_offset);
    buf.put_u64_le(entry.data_length);
    buf.put_u64_le(entry.meta_offset);
    buf.put_u32_le(entry.meta_length);
    buf.put_u32_le(entry.flags);
    buf.put_bytes(0, 8);
    Ok(())
}

/// Decode the whole INDEX region sequentially.
///
/// `expected_count` is the footer's `file_count`; a mismatch means the
/// container is corrupt.
pub fn decode_entries(raw: &[u8], expected_count: u64) -> Result<Vec<IndexEntry>> {
    let mut entries = Vec::new();
    let mut p = 0usize;

    while p < raw.len() {
        if p + 2 > raw.len() {
            return Err(CoreError::CorruptContainer(
                "index truncated in name length".to_string(),
            ));
        }
        let name_len = u16::from_le_bytes([raw[p], raw[p + 1]]) as usize;
        p += 2;

        if p + name_len > raw.len() {
            return Err(CoreError::CorruptContainer(
                "index truncated in name".to_string(),
            ));
        }
        let name = std::str::from_utf8(&raw[p..p + name_len])
            .map_err(|_| CoreError::CorruptContainer("index name is not UTF-8".to_string()))?
            .to_string();
        p += name_len;

        if p + ENTRY_FIXED_SIZE > raw.len() {
            return Err(CoreError::CorruptContainer(
                "index truncated in entry fields".to_string(),
            ));
        }
        let mut cur = &raw[p..p + ENTRY_FIXED_SIZE];
        p += ENTRY_FIXED_SIZE;

        entries.push(IndexEntry {
            name,
            data_offset: cur.get_u64_le(),
            data_length: cur.get_u64_le(),
            meta_offset: cur.get_u64_le(),
            meta_length: cur.get_u32_le(),
            flags: {
                let flags = cur.get_u32_le();
                cur.advance(8); // reserved
                flags
            },
        });
    }

    if entries.len() as u64 != expected_count {
        return Err(CoreError::CorruptContainer(format!(
            "index holds {} entries, footer declares {}",
            entries.len(),
            expected_count
        )));
    }

    Ok(entries)
}

/// Summary of a finalized or opened container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// Number of index entries.
    pub file_count: u64,
    /// Entries whose bytes live in DATA.
    pub internal_files: u64,
    /// Entries diverted to the external sidecar.
    pub external_files: u64,
    /// Length of the DATA region.
    pub data_length: u64,
    /// Length of the META region.
    pub meta_length: u64,
    /// Length of the INDEX region.
    pub index_length: u64,
    /// Total container size, header through footer.
    pub byte_size: u64,
}
