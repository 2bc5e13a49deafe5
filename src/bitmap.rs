//! Presence bitmap: one bit per counted regular file, MSB-first.
//!
//! Bit `i` lives at `bytes[i / 8] >> (7 - i % 8)`. A set bit means the client
//! lacks that file and wants it from the server. At least one byte is always
//! produced, and an incomplete final byte is flushed with zero padding.

use crate::error::{DiffError, DiffResult};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Incrementally packs booleans in counter order.
#[derive(Debug, Default)]
pub struct BitmapBuilder {
    bytes: Vec<u8>,
    current: u8,
    bits: u64,
}

impl BitmapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the bit for the next counter value.
    pub fn push(&mut self, missing: bool) {
        let bit_index = 7 - (self.bits % 8) as u8;
        if missing {
            self.current |= 1 << bit_index;
        }
        self.bits += 1;
        if bit_index == 0 {
            self.bytes.push(self.current);
            self.current = 0;
        }
    }

    pub fn finish(mut self) -> PresenceBitmap {
        if self.bits % 8 != 0 || self.bytes.is_empty() {
            self.bytes.push(self.current);
        }
        PresenceBitmap { bytes: self.bytes }
    }
}

/// Packed presence bits as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceBitmap {
    bytes: Vec<u8>,
}

impl PresenceBitmap {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Byte length of the packed form.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read the bit for counter value `counter`.
    ///
    /// A byte index at or beyond the bitmap length is an error, never a
    /// silent zero.
    pub fn get(&self, counter: u64) -> DiffResult<bool> {
        let byte_index = counter / 8;
        let bit_index = 7 - (counter % 8) as u32;
        let byte = usize::try_from(byte_index)
            .ok()
            .and_then(|i| self.bytes.get(i))
            .ok_or(DiffError::BitmapOutOfBounds {
                counter,
                byte_index,
                len: self.bytes.len(),
            })?;
        Ok((byte >> bit_index) & 1 == 1)
    }

    /// Number of set bits, i.e. files the client will request.
    pub fn count_set(&self) -> u64 {
        self.bytes.iter().map(|b| u64::from(b.count_ones())).sum()
    }

    pub fn any_set(&self) -> bool {
        self.bytes.iter().any(|b| *b != 0)
    }

    /// gzip-compress for a request body.
    pub fn encode_gz(&self) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&self.bytes)?;
        encoder.finish()
    }

    /// Decode a gzip-compressed request body.
    pub fn decode_gz<R: Read>(reader: R) -> DiffResult<Self> {
        let mut bytes = Vec::new();
        MultiGzDecoder::new(reader)
            .read_to_end(&mut bytes)
            .map_err(|e| DiffError::MalformedBitmap(e.to_string()))?;
        Ok(Self { bytes })
    }
}

/// Pack a full sequence in one call.
pub fn pack(bits: &[bool]) -> PresenceBitmap {
    let mut builder = BitmapBuilder::new();
    for &bit in bits {
        builder.push(bit);
    }
    builder.finish()
}
