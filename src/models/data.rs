//! Represents a physical data chunk and its content fingerprints.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Reserved identifier of the canonical empty chunk. It is never written to
/// the data store.
pub const EMPTY_DATA_ID: i64 = 4_708_888_888_888;

/// Number of leading bytes covered by the header checksum.
pub const HDR_CRC_LEN: usize = 4096;

/// Metadata of one data chunk.
///
/// `slices == 0` means single, non-split content stored at `sn = -1`;
/// otherwise the bytes live in slices `0..slices`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, Default, PartialEq, Eq)]
pub struct DataInfo {
    /// Chunk id; 0 means unassigned.
    #[serde(default)]
    pub id: i64,

    /// Declared length in bytes.
    #[serde(default)]
    pub size: i64,

    /// CRC32 of the first `HDR_CRC_LEN` bytes, used by the pre-check.
    #[serde(default)]
    pub hdr_crc32: u32,

    /// CRC32 of the full content.
    #[serde(default)]
    pub crc32: u32,

    /// Lowercase hex MD5 of the full content; empty when not supplied.
    #[serde(default)]
    pub md5: String,

    #[serde(default)]
    pub slices: i32,
}

impl DataInfo {
    /// Fingerprint a buffer the same way the store compares content.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let hdr = &buf[..buf.len().min(HDR_CRC_LEN)];
        Self {
            id: 0,
            size: buf.len() as i64,
            hdr_crc32: crc32fast::hash(hdr),
            crc32: crc32fast::hash(buf),
            md5: format!("{:x}", md5::compute(buf)),
            slices: 0,
        }
    }

    /// Drop the authoritative fingerprints, leaving only what a pre-check sends.
    pub fn to_pre_check(&self) -> Self {
        Self {
            id: self.id,
            size: self.size,
            hdr_crc32: self.hdr_crc32,
            crc32: 0,
            md5: String::new(),
            slices: self.slices,
        }
    }

    /// True when the descriptor carries the full CRC32 + MD5 pair.
    pub fn is_full_check(&self) -> bool {
        !self.md5.is_empty()
    }
}
