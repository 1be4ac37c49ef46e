//! Binary format for the per-shard record log.
//!
//! A shard log starts with a fixed header and is followed by framed,
//! CRC-protected records. Every mutation appends one record; replaying
//! the records in order reconstructs the shard's entry table.
//!
//! ## Log Header (16 bytes)
//!
//! ```text
//! [MAGIC "SCLG": 4][VERSION: 1][GENERATION: 8][PAD: 3]
//! ```
//!
//! The generation counter changes whenever the log is rewritten in place
//! (compaction, clear). A process that cached state for an older
//! generation discards it and replays from the start.
//!
//! ## Record framing
//!
//! ```text
//! [MAGIC "SCRC": 4][CRC32: 4][LEN: 4][PAYLOAD: LEN]
//! ```
//!
//! Payload structure:
//!
//! ```text
//! [VERSION: 1][OP: 1][op-specific fields]
//! ```
//!
//! `Put` fields: key (u16 len + bytes), expire flag + unix millis,
//! tag flag + tag (u16 len + bytes), value kind + value.
//! `Delete` fields: key (u16 len + bytes).
//! `TagIndexOn` / `TagIndexOff` carry no fields.

use crate::entry::Stored;
use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Magic bytes at the start of every shard log: "SCLG"
pub(crate) const LOG_MAGIC: &[u8; 4] = b"SCLG";

/// Magic bytes at the start of every record: "SCRC"
pub(crate) const REC_MAGIC: &[u8; 4] = b"SCRC";

/// Current on-disk format version
pub(crate) const VERSION: u8 = 0x01;

/// Size of the log header
pub(crate) const LOG_HEADER_SIZE: u64 = 16;

/// Size of the record frame (MAGIC + CRC + LEN)
pub(crate) const REC_HEADER_SIZE: usize = 4 + 4 + 4;

const OP_PUT: u8 = 0x01;
const OP_DELETE: u8 = 0x02;
const OP_TAG_INDEX_ON: u8 = 0x03;
const OP_TAG_INDEX_OFF: u8 = 0x04;

const VAL_INT: u8 = 0x00;
const VAL_BYTES: u8 = 0x01;
const VAL_BLOB: u8 = 0x02;

/// One logical mutation in a shard log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Record {
  Put {
    key: String,
    value: Stored,
    /// Absolute expiration in unix milliseconds; `None` = no expiry.
    expire_at: Option<u64>,
    tag: Option<String>,
  },
  Delete {
    key: String,
  },
  TagIndexOn,
  TagIndexOff,
}

/// Writes the log header for the given generation.
pub(crate) fn write_log_header<W: Write>(writer: &mut W, generation: u64) -> Result<()> {
  writer.write_all(LOG_MAGIC)?;
  writer.write_u8(VERSION)?;
  writer.write_u64::<LittleEndian>(generation)?;
  writer.write_all(&[0u8; 3])?; // Padding
  Ok(())
}

/// Reads and validates the log header, returning the generation.
pub(crate) fn read_log_header<R: Read>(reader: &mut R) -> Result<u64> {
  let mut magic = [0u8; 4];
  reader.read_exact(&mut magic)?;
  if &magic != LOG_MAGIC {
    return Err(Error::Corruption(format!(
      "invalid log magic: {:02x?}",
      magic
    )));
  }

  let version = reader.read_u8()?;
  if version != VERSION {
    return Err(Error::Corruption(format!(
      "unsupported log version: {}",
      version
    )));
  }

  let generation = reader.read_u64::<LittleEndian>()?;

  let mut pad = [0u8; 3];
  reader.read_exact(&mut pad)?;

  Ok(generation)
}

impl Record {
  /// Serializes the record with framing (magic, CRC, length prefix).
  pub(crate) fn encode(&self) -> Result<Vec<u8>> {
    let payload = self.encode_payload()?;
    let crc = crc32fast::hash(&payload);

    let mut buf = Vec::with_capacity(REC_HEADER_SIZE + payload.len());
    buf.write_all(REC_MAGIC)?;
    buf.write_u32::<LittleEndian>(crc)?;
    buf.write_u32::<LittleEndian>(payload.len() as u32)?;
    buf.write_all(&payload)?;

    Ok(buf)
  }

  /// Deserializes one record from `reader`, which must be positioned at
  /// a record boundary.
  ///
  /// `offset` is the byte position of the record in the log (used for
  /// error reporting); `remaining` bounds how many bytes the record may
  /// occupy, so a torn length field cannot trigger a huge allocation.
  ///
  /// Returns the record and the offset immediately after it.
  pub(crate) fn decode<R: Read>(
    reader: &mut R,
    offset: u64,
    remaining: u64,
  ) -> Result<(Self, u64)> {
    let mut magic = [0u8; 4];
    reader
      .read_exact(&mut magic)
      .map_err(|e| Error::Corruption(format!("offset {}: failed to read magic: {}", offset, e)))?;

    if &magic != REC_MAGIC {
      return Err(Error::Corruption(format!(
        "offset {}: invalid record magic: {:02x?}",
        offset, magic
      )));
    }

    let stored_crc = reader
      .read_u32::<LittleEndian>()
      .map_err(|e| Error::Corruption(format!("offset {}: failed to read CRC: {}", offset, e)))?;

    let payload_len = reader
      .read_u32::<LittleEndian>()
      .map_err(|e| Error::Corruption(format!("offset {}: failed to read length: {}", offset, e)))?
      as u64;

    if REC_HEADER_SIZE as u64 + payload_len > remaining {
      return Err(Error::Corruption(format!(
        "offset {}: record extends past end of log ({} payload bytes, {} remaining)",
        offset, payload_len, remaining
      )));
    }

    let mut payload = vec![0u8; payload_len as usize];
    reader
      .read_exact(&mut payload)
      .map_err(|e| Error::Corruption(format!("offset {}: incomplete payload: {}", offset, e)))?;

    let computed_crc = crc32fast::hash(&payload);
    if computed_crc != stored_crc {
      return Err(Error::Corruption(format!(
        "offset {}: CRC mismatch: expected {:#x}, got {:#x}",
        offset, stored_crc, computed_crc
      )));
    }

    let record = Self::decode_payload(&payload, offset)?;
    let next_offset = offset + REC_HEADER_SIZE as u64 + payload_len;

    Ok((record, next_offset))
  }

  // --- Private helpers ---

  fn encode_payload(&self) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u8(VERSION)?;

    match self {
      Record::Put {
        key,
        value,
        expire_at,
        tag,
      } => {
        buf.write_u8(OP_PUT)?;
        write_str(&mut buf, key)?;

        match expire_at {
          Some(t) => {
            buf.write_u8(1)?;
            buf.write_u64::<LittleEndian>(*t)?;
          }
          None => buf.write_u8(0)?,
        }

        match tag {
          Some(t) => {
            buf.write_u8(1)?;
            write_str(&mut buf, t)?;
          }
          None => buf.write_u8(0)?,
        }

        match value {
          Stored::Int(i) => {
            buf.write_u8(VAL_INT)?;
            buf.write_i64::<LittleEndian>(*i)?;
          }
          Stored::Bytes(b) => {
            buf.write_u8(VAL_BYTES)?;
            buf.write_u32::<LittleEndian>(b.len() as u32)?;
            buf.write_all(b)?;
          }
          Stored::Blob { file, size } => {
            buf.write_u8(VAL_BLOB)?;
            write_str(&mut buf, file)?;
            buf.write_u64::<LittleEndian>(*size)?;
          }
        }
      }
      Record::Delete { key } => {
        buf.write_u8(OP_DELETE)?;
        write_str(&mut buf, key)?;
      }
      Record::TagIndexOn => buf.write_u8(OP_TAG_INDEX_ON)?,
      Record::TagIndexOff => buf.write_u8(OP_TAG_INDEX_OFF)?,
    }

    Ok(buf)
  }

  fn decode_payload(payload: &[u8], offset: u64) -> Result<Self> {
    let mut cursor = Cursor::new(payload);

    let version = cursor
      .read_u8()
      .map_err(|_| truncated(offset, "VERSION"))?;
    if version != VERSION {
      return Err(Error::Corruption(format!(
        "offset {}: unsupported record version: {}",
        offset, version
      )));
    }

    let op = cursor.read_u8().map_err(|_| truncated(offset, "OP"))?;

    match op {
      OP_PUT => {
        let key = read_str(&mut cursor, offset, "KEY")?;

        let expire_at = match cursor
          .read_u8()
          .map_err(|_| truncated(offset, "EXPIRE_FLAG"))?
        {
          0 => None,
          _ => Some(
            cursor
              .read_u64::<LittleEndian>()
              .map_err(|_| truncated(offset, "EXPIRE_AT"))?,
          ),
        };

        let tag = match cursor
          .read_u8()
          .map_err(|_| truncated(offset, "TAG_FLAG"))?
        {
          0 => None,
          _ => Some(read_str(&mut cursor, offset, "TAG")?),
        };

        let kind = cursor
          .read_u8()
          .map_err(|_| truncated(offset, "VALUE_KIND"))?;
        let value = match kind {
          VAL_INT => Stored::Int(
            cursor
              .read_i64::<LittleEndian>()
              .map_err(|_| truncated(offset, "INT_VALUE"))?,
          ),
          VAL_BYTES => {
            let len = cursor
              .read_u32::<LittleEndian>()
              .map_err(|_| truncated(offset, "BYTES_LEN"))? as usize;
            let mut bytes = vec![0u8; len];
            cursor
              .read_exact(&mut bytes)
              .map_err(|_| truncated(offset, "BYTES_VALUE"))?;
            Stored::Bytes(bytes)
          }
          VAL_BLOB => {
            let file = read_str(&mut cursor, offset, "BLOB_FILE")?;
            let size = cursor
              .read_u64::<LittleEndian>()
              .map_err(|_| truncated(offset, "BLOB_SIZE"))?;
            Stored::Blob { file, size }
          }
          other => {
            return Err(Error::Corruption(format!(
              "offset {}: unknown value kind: {}",
              offset, other
            )))
          }
        };

        Ok(Record::Put {
          key,
          value,
          expire_at,
          tag,
        })
      }
      OP_DELETE => {
        let key = read_str(&mut cursor, offset, "KEY")?;
        Ok(Record::Delete { key })
      }
      OP_TAG_INDEX_ON => Ok(Record::TagIndexOn),
      OP_TAG_INDEX_OFF => Ok(Record::TagIndexOff),
      other => Err(Error::Corruption(format!(
        "offset {}: unknown record op: {}",
        offset, other
      ))),
    }
  }
}

fn write_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
  if s.len() > u16::MAX as usize {
    return Err(Error::Config(format!(
      "string too long for record: {} bytes (max: {})",
      s.len(),
      u16::MAX
    )));
  }
  buf.write_u16::<LittleEndian>(s.len() as u16)?;
  buf.write_all(s.as_bytes())?;
  Ok(())
}

fn read_str(cursor: &mut Cursor<&[u8]>, offset: u64, field: &str) -> Result<String> {
  let len = cursor
    .read_u16::<LittleEndian>()
    .map_err(|_| truncated(offset, field))? as usize;
  let mut bytes = vec![0u8; len];
  cursor
    .read_exact(&mut bytes)
    .map_err(|_| truncated(offset, field))?;
  String::from_utf8(bytes)
    .map_err(|_| Error::Corruption(format!("offset {}: {} is not valid UTF-8", offset, field)))
}

fn truncated(offset: u64, field: &str) -> Error {
  Error::Corruption(format!("offset {}: truncated payload: missing {}", offset, field))
}
