//! Volume container format.
//!
//! A volume is a sequence of block-aligned entries followed by a single
//! trailer block:
//!
//! ```text
//! entry   := header | key | pad(BLOCK_SIZE) | zstd payload | pad(BLOCK_SIZE)
//! header  := "CAE1" key_len:u16 original_size:u64 compressed_size:u64 checksum:u64
//! trailer := "CAVT" version:u16 volume_index:u64 entry_count:u64
//!            total_original:u64 total_compressed:u64 xxh3(trailer fields):u64
//!            pad(BLOCK_SIZE)
//! ```
//!
//! All integers are little-endian. `checksum` is XXH3-64 of the original
//! (uncompressed) object bytes. The trailer carries enough metadata to list a
//! volume without decompressing it.

mod builder;
mod reader;

pub use builder::{ManifestEntry, VolumeBuilder, VolumeManifest};
pub use reader::{VolumeEntry, VolumeReader};

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// Alignment unit of every entry section and of the trailer.
pub const BLOCK_SIZE: u64 = 512;

pub const ENTRY_MAGIC: [u8; 4] = *b"CAE1";
pub const TRAILER_MAGIC: [u8; 4] = *b"CAVT";
pub const FORMAT_VERSION: u16 = 1;

/// Keys longer than this cannot be stored in an entry header.
pub const MAX_KEY_LEN: usize = 1024;

/// Fixed part of an entry header, before the key bytes.
pub const ENTRY_HEADER_FIXED_LEN: usize = 4 + 2 + 8 + 8 + 8;

const TRAILER_FIELDS_LEN: usize = 4 + 2 + 8 + 8 + 8 + 8;

/// Size of the trailer on disk.
pub const TRAILER_LEN: u64 = BLOCK_SIZE;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("key `{0}` exceeds {MAX_KEY_LEN} bytes")]
    KeyTooLong(String),
    #[error("bad magic at offset {offset}")]
    BadMagic { offset: u64 },
    #[error("unsupported container version {0}")]
    UnsupportedVersion(u16),
    #[error("key at offset {offset} is not valid UTF-8")]
    InvalidKey { offset: u64 },
    #[error("volume ended before the trailer at offset {offset}")]
    Truncated { offset: u64 },
    #[error("trailer checksum mismatch")]
    TrailerChecksum,
    #[error("trailer disagrees with entries: {0}")]
    TrailerMismatch(String),
    #[error("entry `{key}` is corrupt: {reason}")]
    CorruptEntry { key: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Round `n` up to the next multiple of [`BLOCK_SIZE`].
pub fn align_up(n: u64) -> u64 {
    n.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// Bytes an entry occupies in a volume, padding included.
pub fn encoded_entry_len(key_len: usize, compressed_len: u64) -> u64 {
    align_up((ENTRY_HEADER_FIXED_LEN + key_len) as u64) + align_up(compressed_len)
}

/// Fixed-format header written ahead of every entry payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub key: String,
    pub original_size: u64,
    pub compressed_size: u64,
    pub checksum: u64,
}

impl EntryHeader {
    /// Length of the header section including its padding.
    pub fn padded_len(&self) -> u64 {
        align_up((ENTRY_HEADER_FIXED_LEN + self.key.len()) as u64)
    }

    /// Append the padded header to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ContainerError> {
        if self.key.len() > MAX_KEY_LEN {
            return Err(ContainerError::KeyTooLong(self.key.clone()));
        }
        let start = buf.len();
        buf.put_slice(&ENTRY_MAGIC);
        buf.put_u16_le(self.key.len() as u16);
        buf.put_u64_le(self.original_size);
        buf.put_u64_le(self.compressed_size);
        buf.put_u64_le(self.checksum);
        buf.put_slice(self.key.as_bytes());
        let written = buf.len() - start;
        pad_to_block(buf, written);
        Ok(())
    }

    /// Decode the fixed header fields from the first block of an entry.
    /// Returns the header minus the key, plus the key length.
    pub(crate) fn decode_fixed(
        block: &[u8],
        offset: u64,
    ) -> Result<(u16, u64, u64, u64), ContainerError> {
        if block.len() < ENTRY_HEADER_FIXED_LEN || block[..4] != ENTRY_MAGIC {
            return Err(ContainerError::BadMagic { offset });
        }
        let key_len = u16::from_le_bytes([block[4], block[5]]);
        let original_size = read_u64(block, 6);
        let compressed_size = read_u64(block, 14);
        let checksum = read_u64(block, 22);
        Ok((key_len, original_size, compressed_size, checksum))
    }
}

/// End-of-volume summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    pub volume_index: u64,
    pub entry_count: u64,
    pub total_original: u64,
    pub total_compressed: u64,
}

impl Trailer {
    pub fn encode(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_slice(&TRAILER_MAGIC);
        buf.put_u16_le(FORMAT_VERSION);
        buf.put_u64_le(self.volume_index);
        buf.put_u64_le(self.entry_count);
        buf.put_u64_le(self.total_original);
        buf.put_u64_le(self.total_compressed);
        let digest = xxh3_64(&buf[start..start + TRAILER_FIELDS_LEN]);
        buf.put_u64_le(digest);
        let written = buf.len() - start;
        pad_to_block(buf, written);
    }

    pub fn decode(block: &[u8], offset: u64) -> Result<Self, ContainerError> {
        if block.len() < TRAILER_FIELDS_LEN + 8 || block[..4] != TRAILER_MAGIC {
            return Err(ContainerError::BadMagic { offset });
        }
        let version = u16::from_le_bytes([block[4], block[5]]);
        if version != FORMAT_VERSION {
            return Err(ContainerError::UnsupportedVersion(version));
        }
        if xxh3_64(&block[..TRAILER_FIELDS_LEN]) != read_u64(block, TRAILER_FIELDS_LEN) {
            return Err(ContainerError::TrailerChecksum);
        }
        Ok(Self {
            volume_index: read_u64(block, 6),
            entry_count: read_u64(block, 14),
            total_original: read_u64(block, 22),
            total_compressed: read_u64(block, 30),
        })
    }
}

fn pad_to_block(buf: &mut BytesMut, written: usize) {
    let padding = align_up(written as u64) as usize - written;
    buf.put_bytes(0, padding);
}

fn read_u64(block: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&block[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_rounds_to_blocks() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), BLOCK_SIZE);
        assert_eq!(align_up(BLOCK_SIZE), BLOCK_SIZE);
        assert_eq!(align_up(BLOCK_SIZE + 1), 2 * BLOCK_SIZE);
        assert_eq!(encoded_entry_len(10, 1000), BLOCK_SIZE + 2 * BLOCK_SIZE);
    }

    #[test]
    fn header_is_padded_and_decodes() {
        let header = EntryHeader {
            key: "photos/2025/img.jpg".into(),
            original_size: 4096,
            compressed_size: 900,
            checksum: 0xdead_beef,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, header.padded_len());
        assert_eq!(buf.len() as u64 % BLOCK_SIZE, 0);

        let (key_len, original, compressed, checksum) =
            EntryHeader::decode_fixed(&buf, 0).unwrap();
        assert_eq!(key_len as usize, header.key.len());
        assert_eq!((original, compressed, checksum), (4096, 900, 0xdead_beef));
        let key = &buf[ENTRY_HEADER_FIXED_LEN..ENTRY_HEADER_FIXED_LEN + key_len as usize];
        assert_eq!(key, header.key.as_bytes());
    }

    #[test]
    fn oversized_key_is_rejected() {
        let header = EntryHeader {
            key: "k".repeat(MAX_KEY_LEN + 1),
            original_size: 0,
            compressed_size: 0,
            checksum: 0,
        };
        let mut buf = BytesMut::new();
        assert!(matches!(
            header.encode(&mut buf),
            Err(ContainerError::KeyTooLong(_))
        ));
    }

    #[test]
    fn trailer_detects_tampering() {
        let trailer = Trailer {
            volume_index: 3,
            entry_count: 12,
            total_original: 12_000_000,
            total_compressed: 4_000_000,
        };
        let mut buf = BytesMut::new();
        trailer.encode(&mut buf);
        assert_eq!(buf.len() as u64, TRAILER_LEN);
        assert_eq!(Trailer::decode(&buf, 0).unwrap(), trailer);

        buf[14] ^= 0xff;
        assert!(matches!(
            Trailer::decode(&buf, 0),
            Err(ContainerError::TrailerChecksum)
        ));
    }
}
