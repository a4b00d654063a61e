//! On-disk layout of a stored experiment record.
//!
//! ```text
//! [magic: "SIMX"][codec version: 1 byte][schema version: 4 bytes LE]
//! [length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
//! ```
//!
//! The schema version sits in the header so a reader can reject a record
//! written by another release without parsing its payload. The checksum
//! covers the schema version and the payload.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult};

use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Current codec version.
pub const CODEC_VERSION: u8 = 2;

/// Magic bytes identifying simopt record files.
pub const MAGIC: [u8; 4] = *b"SIMX";

/// Payloads larger than this are rejected before allocation.
const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

/// Fixed-size prefix of a record file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Layout version of the file.
    pub codec_version: u8,
    /// Schema version of the record in the payload.
    pub schema_version: u32,
}

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

fn checksum(schema_version: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&schema_version.to_le_bytes());
    hasher.update(data);
    hasher.finalize()
}

/// Serializes `value` as a complete record file tagged with `schema_version`.
pub fn encode<T: Serialize>(schema_version: u32, value: &T) -> IoResult<Vec<u8>> {
    let data =
        serde_json::to_vec(value).map_err(|e| invalid(format!("serialization failed: {e}")))?;
    let len = u32::try_from(data.len())
        .map_err(|_| invalid(format!("record of {} bytes is too large", data.len())))?;

    let mut out = Vec::with_capacity(MAGIC.len() + 1 + 4 + 4 + data.len() + 4);
    out.extend_from_slice(&MAGIC);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&schema_version.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&checksum(schema_version, &data).to_le_bytes());
    Ok(out)
}

/// Reads and validates the header. The payload is left unread.
pub fn read_header(reader: &mut impl Read) -> IoResult<Header> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(invalid(format!(
            "invalid magic bytes: expected {MAGIC:?}, got {magic:?}"
        )));
    }
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported codec version: {} (expected {CODEC_VERSION})",
            version[0]
        )));
    }
    let mut schema = [0u8; 4];
    reader.read_exact(&mut schema)?;
    Ok(Header {
        codec_version: version[0],
        schema_version: u32::from_le_bytes(schema),
    })
}

/// Reads the payload following `header`, verifying the checksum.
pub fn read_payload<T: DeserializeOwned>(reader: &mut impl Read, header: &Header) -> IoResult<T> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(invalid(format!("payload size {len} exceeds maximum {MAX_PAYLOAD_SIZE}")));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored_crc = u32::from_le_bytes(crc_bytes);
    let computed_crc = checksum(header.schema_version, &data);
    if stored_crc != computed_crc {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored_crc:08x}, computed={computed_crc:08x} (data corrupted)"
        )));
    }

    serde_json::from_slice(&data).map_err(|e| invalid(format!("deserialization failed: {e}")))
}

/// Reads a complete record file.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<(Header, T)> {
    let header = read_header(reader)?;
    let value = read_payload(reader, &header)?;
    Ok((header, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::experiment::result::{
        ExperimentResult, MacrorepOutcome, MacrorepRecord, Recommendation, RESULT_SCHEMA_VERSION,
    };
    use crate::rng::StreamIndex;

    const HEADER_LEN: usize = 4 + 1 + 4;

    #[test]
    fn detects_corrupted_payload() {
        let mut encoded = encode(3, &"test data".to_string()).unwrap();
        encoded[HEADER_LEN + 6] ^= 0xFF;
        let err = decode::<String>(&mut Cursor::new(encoded)).unwrap_err().to_string();
        assert!(err.contains("CRC") || err.contains("deserialization"));
    }

    #[test]
    fn schema_version_is_covered_by_the_checksum() {
        let mut encoded = encode(3, &vec![1_u32, 2]).unwrap();
        encoded[5] = 4;
        let mut reader = Cursor::new(encoded);
        let header = read_header(&mut reader).unwrap();
        assert_eq!(header.schema_version, 4);
        let err = read_payload::<Vec<u32>>(&mut reader, &header).unwrap_err();
        assert!(err.to_string().contains("CRC"));
    }

    #[test]
    fn rejects_truncated_record() {
        let encoded = encode(1, &vec![1.0_f64, 2.0, 3.0]).unwrap();
        let truncated = encoded[..encoded.len() - 2].to_vec();
        let result = decode::<Vec<f64>>(&mut Cursor::new(truncated));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut bad = encode(1, &"x").unwrap()[..HEADER_LEN].to_vec();
        bad.extend_from_slice(&u32::MAX.to_le_bytes());
        let result = decode::<String>(&mut Cursor::new(bad));
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn header_validation() {
        let encoded = encode(7, &0_u8).unwrap();
        let header = read_header(&mut Cursor::new(&encoded)).unwrap();
        assert_eq!(header, Header { codec_version: CODEC_VERSION, schema_version: 7 });

        assert!(read_header(&mut Cursor::new(b"JUNK\x02\x07\0\0\0".to_vec())).is_err());
        let mut old = encoded;
        old[4] = 1;
        let err = read_header(&mut Cursor::new(old)).unwrap_err();
        assert!(err.to_string().contains("codec version"));
    }

    #[test]
    fn result_floats_survive_exactly() {
        let mut result = ExperimentResult::new(1000);
        result.macroreps.push(MacrorepOutcome::Completed(MacrorepRecord {
            macrorep: 0,
            recommendations: vec![Recommendation {
                budget: 1000,
                x: vec![0.1 + 0.2, 1.0 / 3.0, -7.0e-300],
            }],
            streams: vec![StreamIndex::new(2, 16, 0)],
        }));
        let encoded = encode(RESULT_SCHEMA_VERSION, &result).unwrap();
        let (header, decoded): (Header, ExperimentResult) = decode(&mut Cursor::new(encoded)).unwrap();
        assert_eq!(header.schema_version, RESULT_SCHEMA_VERSION);
        assert_eq!(decoded, result);
    }
}
