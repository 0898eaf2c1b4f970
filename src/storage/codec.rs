//! Binary framing for persisted records.
//!
//! WAL entries, segment sections and backup files all use one frame:
//!
//! ```text
//! [version: 1 byte][len: u32 LE][payload: len bytes JSON][crc32: u32 LE]
//! ```
//!
//! Files start with [`MAGIC`] plus the version byte so a foreign or newer
//! file is rejected before any frame is read.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current frame version.
const CODEC_VERSION: u8 = 1;

/// Upper bound on a single payload (100 MB).
const MAX_PAYLOAD: usize = 100 * 1024 * 1024;

/// Version byte, length prefix and trailing checksum.
const FRAME_OVERHEAD: usize = 1 + 4 + 4;

/// Magic bytes identifying files written by this crate.
pub const MAGIC: [u8; 4] = *b"TDLK";

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

fn check_len(len: usize) -> IoResult<()> {
    if len > MAX_PAYLOAD {
        return Err(invalid(format!("payload of {len} bytes exceeds maximum {MAX_PAYLOAD}")));
    }
    Ok(())
}

/// Serializes `value` into one frame.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let payload =
        serde_json::to_vec(value).map_err(|e| invalid(format!("serialization failed: {e}")))?;
    check_len(payload.len())?;

    #[allow(clippy::cast_possible_truncation)]
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.push(CODEC_VERSION);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&checksum(&payload).to_le_bytes());
    Ok(frame)
}

/// Reads one frame and returns its verified payload.
///
/// A frame cut short yields `UnexpectedEof`; every other defect
/// (version, size, checksum) yields `InvalidData`.
fn read_frame(reader: &mut impl Read) -> IoResult<Vec<u8>> {
    let mut head = [0u8; 5];
    reader.read_exact(&mut head)?;
    if head[0] != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported frame version {} (expected {CODEC_VERSION})",
            head[0]
        )));
    }
    let len = u32::from_le_bytes([head[1], head[2], head[3], head[4]]) as usize;
    check_len(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let mut tail = [0u8; 4];
    reader.read_exact(&mut tail)?;

    let stored = u32::from_le_bytes(tail);
    let computed = checksum(&payload);
    if stored != computed {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored:08x}, computed={computed:08x} (data corrupted)"
        )));
    }
    Ok(payload)
}

/// Reads one frame and deserializes its payload.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let payload = read_frame(reader)?;
    serde_json::from_slice(&payload).map_err(|e| invalid(format!("deserialization failed: {e}")))
}

/// Writes the file header.
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    let mut header = [0u8; 5];
    header[..4].copy_from_slice(&MAGIC);
    header[4] = CODEC_VERSION;
    writer.write_all(&header)
}

/// Reads and validates the file header, returning its version.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    if header[..4] != MAGIC {
        return Err(invalid(format!(
            "not a tdl file: expected magic {MAGIC:?}, found {:?}",
            &header[..4]
        )));
    }
    if header[4] != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported file version {} (expected {CODEC_VERSION})",
            header[4]
        )));
    }
    Ok(header[4])
}
