//! On-disk frame format with varint length prefix and CRC32C checksumming.
//!
//! Frame layout:
//! - len: varint (payload length in bytes)
//! - payload: bytes[len]
//! - crc32c: u32 (little-endian, computed over len + payload)
//!
//! Every durable artifact in this crate (log segments, the hard state file,
//! snapshot files) is a sequence of one or more frames, so a single decoder
//! covers torn-write and bit-rot detection everywhere.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("Incomplete frame")]
    Incomplete,
}

/// Encodes a payload into a checksummed frame.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 16);
    encode_varint(&mut buf, payload.len() as u64);
    buf.put_slice(payload);

    let crc = crc32c::crc32c(&buf);
    buf.put_u32_le(crc);

    buf.freeze()
}

/// Decodes one frame from the front of `data`, validating the checksum.
///
/// Returns the payload and the total number of bytes consumed.
/// `Incomplete` means the buffer ends mid-frame, which is expected at the
/// tail of a file that was being written when the process died.
pub fn decode_frame(data: &[u8]) -> Result<(Bytes, usize), RecordError> {
    let mut cursor = data;
    let len = decode_varint(&mut cursor)? as usize;

    if cursor.len() < len + 4 {
        return Err(RecordError::Incomplete);
    }

    let payload = Bytes::copy_from_slice(&cursor[..len]);
    cursor.advance(len);

    let stored_crc = cursor.get_u32_le();
    let consumed = data.len() - cursor.len();
    let calculated_crc = crc32c::crc32c(&data[..consumed - 4]);

    if stored_crc != calculated_crc {
        return Err(RecordError::CrcMismatch {
            expected: stored_crc,
            actual: calculated_crc,
        });
    }

    Ok((payload, consumed))
}

/// Encodes a u64 as a varint (LEB128).
fn encode_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes a varint (LEB128) from bytes.
fn decode_varint(data: &mut &[u8]) -> Result<u64, RecordError> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        if data.is_empty() {
            return Err(RecordError::Incomplete);
        }

        let byte = data[0];
        data.advance(1);

        if shift >= 64 {
            return Err(io::Error::new(ErrorKind::InvalidData, "varint overflow").into());
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            break;
        }

        shift += 7;
    }

    Ok(result)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_frame_roundtrip(payload in prop::collection::vec(any::<u8>(), 0..2048)) {
            let encoded = encode_frame(&payload);
            let (decoded, size) = decode_frame(&encoded).unwrap();

            prop_assert_eq!(&decoded[..], &payload[..]);
            prop_assert_eq!(size, encoded.len());
        }

        #[test]
        fn prop_corruption_detected(
            payload in prop::collection::vec(any::<u8>(), 1..256),
            corrupt_index in 0usize..64,
        ) {
            let encoded = encode_frame(&payload);

            if corrupt_index < encoded.len() {
                let mut corrupted = encoded.to_vec();
                corrupted[corrupt_index] ^= 0xFF;

                // Any single-byte flip must fail to decode cleanly as the
                // original payload.
                match decode_frame(&corrupted) {
                    Ok((decoded, _)) => prop_assert_ne!(&decoded[..], &payload[..]),
                    Err(_) => {}
                }
            }
        }
    }
}
