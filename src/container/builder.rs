//! Incremental volume serialization.

use bytes::{Bytes, BytesMut};
use serde::Serialize;

use super::{ContainerError, EntryHeader, TRAILER_LEN, Trailer, align_up, encoded_entry_len};
use crate::models::archive::{CompressedEntry, ObjectKey};

/// Where one entry landed in a volume.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub sequence: u64,
    pub key: ObjectKey,
    pub offset: u64,
    pub original_size: u64,
    pub compressed_size: u64,
    pub checksum: u64,
}

/// Everything needed to commit a closed volume, or to rebuild it byte for
/// byte from the source.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VolumeManifest {
    pub index: u64,
    pub first_sequence: u64,
    pub entries: Vec<ManifestEntry>,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
    pub container_bytes: u64,
}

/// Serializes entries into a volume and cuts the output into upload parts
/// as soon as `part_size` bytes are buffered.
///
/// The builder never holds more than one part plus one entry in memory.
#[derive(Debug)]
pub struct VolumeBuilder {
    index: u64,
    first_sequence: u64,
    max_size: u64,
    part_size: usize,
    buf: BytesMut,
    written: u64,
    entries: Vec<ManifestEntry>,
    uncompressed_bytes: u64,
    compressed_bytes: u64,
}

impl VolumeBuilder {
    pub fn new(index: u64, first_sequence: u64, max_size: u64, part_size: u64) -> Self {
        let part_size = usize::try_from(part_size).unwrap_or(usize::MAX).max(1);
        Self {
            index,
            first_sequence,
            max_size,
            part_size,
            buf: BytesMut::new(),
            written: 0,
            entries: Vec::new(),
            uncompressed_bytes: 0,
            compressed_bytes: 0,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Sequence number the next appended entry must carry.
    pub fn next_sequence(&self) -> u64 {
        self.first_sequence + self.entries.len() as u64
    }

    /// Whether `entry` can be appended and the volume still closed within
    /// the maximum size.
    pub fn fits(&self, entry: &CompressedEntry) -> bool {
        let needed = encoded_entry_len(entry.key.name.len(), entry.compressed_size);
        self.written
            .checked_add(needed)
            .and_then(|n| n.checked_add(TRAILER_LEN))
            .is_some_and(|total| total <= self.max_size)
    }

    /// Append an entry and return any upload parts that are now complete.
    ///
    /// Size limits are the caller's call: an empty volume accepts an entry
    /// that alone exceeds the maximum.
    pub fn append(&mut self, entry: &CompressedEntry) -> Result<Vec<Bytes>, ContainerError> {
        let header = EntryHeader {
            key: entry.key.name.clone(),
            original_size: entry.original_size,
            compressed_size: entry.compressed_size,
            checksum: entry.checksum,
        };
        let offset = self.written;
        let sequence = self.next_sequence();
        let before = self.buf.len();
        header.encode(&mut self.buf)?;
        self.buf.extend_from_slice(&entry.payload);
        let payload_len = entry.payload.len() as u64;
        self.buf
            .resize(self.buf.len() + (align_up(payload_len) - payload_len) as usize, 0);
        self.written += (self.buf.len() - before) as u64;

        self.entries.push(ManifestEntry {
            sequence,
            key: entry.key.clone(),
            offset,
            original_size: entry.original_size,
            compressed_size: entry.compressed_size,
            checksum: entry.checksum,
        });
        self.uncompressed_bytes += entry.original_size;
        self.compressed_bytes += entry.compressed_size;

        Ok(self.take_full_parts())
    }

    /// Write the trailer and return the remaining bytes as the final part.
    pub fn finish(mut self) -> (Vec<Bytes>, VolumeManifest) {
        let trailer = Trailer {
            volume_index: self.index,
            entry_count: self.entries.len() as u64,
            total_original: self.uncompressed_bytes,
            total_compressed: self.compressed_bytes,
        };
        trailer.encode(&mut self.buf);
        self.written += TRAILER_LEN;

        let mut parts = self.take_full_parts();
        if !self.buf.is_empty() {
            parts.push(self.buf.split().freeze());
        }

        let manifest = VolumeManifest {
            index: self.index,
            first_sequence: self.first_sequence,
            entries: self.entries,
            uncompressed_bytes: self.uncompressed_bytes,
            compressed_bytes: self.compressed_bytes,
            container_bytes: self.written,
        };
        (parts, manifest)
    }

    fn take_full_parts(&mut self) -> Vec<Bytes> {
        let mut parts = Vec::new();
        while self.buf.len() >= self.part_size {
            parts.push(self.buf.split_to(self.part_size).freeze());
        }
        parts
    }
}
