//! Framing for every on-disk file.
//!
//! Each file starts with a header naming what it holds, followed by framed
//! records:
//!
//! ```text
//! header: [MAGIC: 4 bytes]["W" | "S" | "B": 1 byte][VERSION: 1 byte]
//! record: [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
//! ```

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

const CODEC_VERSION: u8 = 1;

/// Identifies kyro-resolve files.
pub(crate) const MAGIC: [u8; 4] = *b"KRSV";

/// Records larger than this are treated as corruption.
const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

/// Header length in bytes.
pub(crate) const HEADER_LEN: u64 = 6;

/// What a file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileKind {
    Wal,
    Snapshot,
    Bloom,
}

impl FileKind {
    const fn tag(self) -> u8 {
        match self {
            Self::Wal => b'W',
            Self::Snapshot => b'S',
            Self::Bloom => b'B',
        }
    }
}

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

/// Serializes one record with its checksum.
pub(crate) fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value).map_err(|e| invalid(format!("serialization failed: {e}")))?;
    if data.len() > MAX_RECORD_SIZE {
        return Err(invalid(format!(
            "record size {} exceeds maximum {MAX_RECORD_SIZE}",
            data.len()
        )));
    }

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    #[allow(clippy::cast_possible_truncation)]
    let len = data.len() as u32;

    let mut out = Vec::with_capacity(1 + 4 + data.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Reads one record, verifying its checksum.
///
/// A clean end of input before the first byte, or a record cut short,
/// surfaces as `UnexpectedEof`; anything else malformed is `InvalidData`.
pub(crate) fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported codec version: {} (expected {CODEC_VERSION})",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(invalid(format!(
            "record size {len} exceeds maximum {MAX_RECORD_SIZE}"
        )));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored = u32::from_le_bytes(crc_bytes);

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored:08x}, computed={computed:08x} (data corrupted)"
        )));
    }

    serde_json::from_slice(&data).map_err(|e| invalid(format!("deserialization failed: {e}")))
}

pub(crate) fn write_header(writer: &mut impl Write, kind: FileKind) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[kind.tag(), CODEC_VERSION])?;
    Ok(())
}

/// Reads and checks a header written by [`write_header`] for `kind`.
pub(crate) fn read_header(reader: &mut impl Read, kind: FileKind) -> IoResult<()> {
    let mut header = [0u8; 6];
    reader.read_exact(&mut header)?;

    if header[..4] != MAGIC {
        return Err(invalid(format!(
            "invalid magic bytes: expected {MAGIC:?}, got {:?}",
            &header[..4]
        )));
    }
    if header[4] != kind.tag() {
        return Err(invalid(format!(
            "wrong file kind: expected {kind:?}, got tag {:?}",
            char::from(header[4])
        )));
    }
    if header[5] != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported file version: {} (expected {CODEC_VERSION})",
            header[5]
        )));
    }
    Ok(())
}
