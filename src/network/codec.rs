//! Wire framing for state transfer messages.
//!
//! # Frame Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ MAGIC: [u8; 4] = "GSTF"                         │
//! ├─────────────────────────────────────────────────┤
//! │ VERSION: u16 = 1                                │
//! ├─────────────────────────────────────────────────┤
//! │ FLAGS: u16                                      │
//! │   bit 0: payload compressed (LZ4)               │
//! │   bits 1-15: reserved                           │
//! ├─────────────────────────────────────────────────┤
//! │ PAYLOAD_LEN: u32                                │
//! ├─────────────────────────────────────────────────┤
//! │ PAYLOAD: bincode(Message), possibly compressed  │
//! ├─────────────────────────────────────────────────┤
//! │ CRC32: u32 (iSCSI) over header and payload      │
//! └─────────────────────────────────────────────────┘
//! ```

use crate::error::{NetworkError, Result};
use crate::network::rpc::{decode_message, encode_message, Message};
use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};

/// Frame magic: "GSTF".
pub const MAGIC: [u8; 4] = *b"GSTF";

/// Current frame version.
pub const VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 12;

/// Trailer size in bytes.
pub const TRAILER_SIZE: usize = 4;

/// Flag: payload is LZ4 compressed.
pub const FLAG_COMPRESSED: u16 = 1 << 0;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Encode a message into a checksummed frame.
///
/// Payloads larger than `compress_threshold` bytes are LZ4-compressed.
pub fn encode_frame(msg: &Message, compress_threshold: usize) -> Result<Bytes> {
    let raw = encode_message(msg)?;
    let (flags, payload) = if raw.len() > compress_threshold {
        (FLAG_COMPRESSED, lz4_flex::compress_prepend_size(&raw))
    } else {
        (0, raw)
    };

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
    buf.put_slice(&MAGIC);
    buf.put_u16_le(VERSION);
    buf.put_u16_le(flags);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);

    let crc = CRC32.checksum(&buf);
    buf.put_u32_le(crc);

    Ok(buf.freeze())
}

/// Decode a frame produced by [`encode_frame`].
pub fn decode_frame(data: &[u8]) -> Result<Message> {
    if data.len() < HEADER_SIZE + TRAILER_SIZE {
        return Err(NetworkError::Deserialization("frame too short".into()).into());
    }
    if data[0..4] != MAGIC {
        return Err(NetworkError::Deserialization("invalid frame magic".into()).into());
    }

    let version = u16::from_le_bytes([data[4], data[5]]);
    if version > VERSION {
        return Err(
            NetworkError::Deserialization(format!("unsupported frame version {}", version)).into(),
        );
    }
    let flags = u16::from_le_bytes([data[6], data[7]]);
    let len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
    if data.len() != HEADER_SIZE + len + TRAILER_SIZE {
        return Err(NetworkError::Deserialization(format!(
            "frame length mismatch: header says {}, frame carries {}",
            len,
            data.len().saturating_sub(HEADER_SIZE + TRAILER_SIZE)
        ))
        .into());
    }

    let crc_offset = HEADER_SIZE + len;
    let stored = u32::from_le_bytes([
        data[crc_offset],
        data[crc_offset + 1],
        data[crc_offset + 2],
        data[crc_offset + 3],
    ]);
    let computed = CRC32.checksum(&data[..crc_offset]);
    if stored != computed {
        return Err(NetworkError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        }
        .into());
    }

    let payload = &data[HEADER_SIZE..crc_offset];
    let msg = if flags & FLAG_COMPRESSED != 0 {
        let raw = lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| NetworkError::Deserialization(e.to_string()))?;
        decode_message(&raw)
    } else {
        decode_message(payload)
    };
    msg.map_err(|e| NetworkError::Deserialization(e.to_string()).into())
}
