// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Frame encoding for segment files.
//!
//! ## On-Disk Frame Format
//!
//! ```text
//! ┌─────────────────┬──────────────────────────────────────┬─────────────────┐
//! │  Length (4B)    │   Payload (variable)                 │   CRC32 (4B)    │
//! │  little-endian  │   sequence (8B LE) + event bytes     │   little-endian │
//! └─────────────────┴──────────────────────────────────────┴─────────────────┘
//! ```
//!
//! The CRC covers the length prefix and the payload, so a torn length field
//! is caught the same way as a torn payload. The sequence number travels
//! inside the payload so recovery can rebuild ordering from the segments
//! alone.

use bytes::{BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use snafu::ensure;

use crate::{Result, error::FrameTooLargeSnafu};

/// Size of the length prefix in bytes.
pub const FRAME_LENGTH_SIZE: usize = 4;

/// Size of the trailing CRC32 in bytes.
pub const FRAME_CRC_SIZE: usize = 4;

/// Size of the sequence number stored at the start of each payload.
pub const FRAME_SEQUENCE_SIZE: usize = 8;

/// Largest event accepted into a single frame.
pub const MAX_EVENT_SIZE: usize = u32::MAX as usize - FRAME_SEQUENCE_SIZE;

#[inline]
fn frame_crc(length: u32, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Total on-disk size of a frame holding `event_len` bytes of event data.
#[inline]
#[must_use]
pub const fn frame_disk_size(event_len: usize) -> u64 {
    (FRAME_LENGTH_SIZE + FRAME_SEQUENCE_SIZE + event_len + FRAME_CRC_SIZE) as u64
}

/// Encodes one event into its complete on-disk frame.
pub fn encode_frame(sequence: u64, event: &[u8]) -> Result<Bytes> {
    ensure!(
        event.len() <= MAX_EVENT_SIZE,
        FrameTooLargeSnafu { len: event.len() }
    );

    #[allow(clippy::cast_possible_truncation)]
    let length = (FRAME_SEQUENCE_SIZE + event.len()) as u32;
    #[allow(clippy::cast_possible_truncation)]
    let mut buf = BytesMut::with_capacity(frame_disk_size(event.len()) as usize);
    buf.put_u32_le(length);
    buf.put_u64_le(sequence);
    buf.put_slice(event);
    let crc = frame_crc(length, &buf[FRAME_LENGTH_SIZE..]);
    buf.put_u32_le(crc);
    Ok(buf.freeze())
}

/// A frame decoded from a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub sequence: u64,
    pub event:    Bytes,
    /// Bytes the frame occupies on disk, header and trailer included.
    pub disk_len: u64,
}

/// Outcome of decoding the bytes at one position of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRead {
    Frame(DecodedFrame),
    /// No bytes left: a clean end of segment.
    End,
    /// The remaining bytes are shorter than the frame they announce.
    Incomplete { available: u64 },
    /// Length or checksum does not validate.
    Corrupt { reason: String },
}

/// Decodes the frame starting at the beginning of `data`.
///
/// `data` is the remainder of a segment from the frame's offset onward.
#[must_use]
pub fn decode_frame(data: &[u8]) -> FrameRead {
    if data.is_empty() {
        return FrameRead::End;
    }
    if data.len() < FRAME_LENGTH_SIZE {
        return FrameRead::Incomplete {
            available: data.len() as u64,
        };
    }

    let mut length_buf = [0u8; FRAME_LENGTH_SIZE];
    length_buf.copy_from_slice(&data[..FRAME_LENGTH_SIZE]);
    let length = u32::from_le_bytes(length_buf);
    let length_usize = length as usize;

    if length_usize < FRAME_SEQUENCE_SIZE {
        return FrameRead::Corrupt {
            reason: format!("frame length {length} is shorter than the sequence header"),
        };
    }

    let total = FRAME_LENGTH_SIZE + length_usize + FRAME_CRC_SIZE;
    if data.len() < total {
        return FrameRead::Incomplete {
            available: data.len() as u64,
        };
    }

    let payload = &data[FRAME_LENGTH_SIZE..FRAME_LENGTH_SIZE + length_usize];
    let mut crc_buf = [0u8; FRAME_CRC_SIZE];
    crc_buf.copy_from_slice(&data[FRAME_LENGTH_SIZE + length_usize..total]);
    let stored = u32::from_le_bytes(crc_buf);
    let computed = frame_crc(length, payload);
    if stored != computed {
        return FrameRead::Corrupt {
            reason: format!("checksum mismatch: stored={stored:#x}, computed={computed:#x}"),
        };
    }

    let mut seq_buf = [0u8; FRAME_SEQUENCE_SIZE];
    seq_buf.copy_from_slice(&payload[..FRAME_SEQUENCE_SIZE]);

    FrameRead::Frame(DecodedFrame {
        sequence: u64::from_le_bytes(seq_buf),
        event:    Bytes::copy_from_slice(&payload[FRAME_SEQUENCE_SIZE..]),
        disk_len: total as u64,
    })
}
