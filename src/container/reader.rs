//! Sequential volume reader.

use std::io::{self, Read};
use xxhash_rust::xxh3::xxh3_64;

use super::{
    BLOCK_SIZE, ContainerError, ENTRY_HEADER_FIXED_LEN, ENTRY_MAGIC, EntryHeader, TRAILER_MAGIC,
    Trailer, align_up,
};

/// One entry as stored in a volume.
#[derive(Debug, Clone)]
pub struct VolumeEntry {
    pub header: EntryHeader,
    pub offset: u64,
    pub payload: Vec<u8>,
}

impl VolumeEntry {
    /// Decompress the payload and check it against the recorded size and
    /// checksum.
    pub fn decompress(&self) -> Result<Vec<u8>, ContainerError> {
        let data = zstd::stream::decode_all(&self.payload[..]).map_err(|err| {
            ContainerError::CorruptEntry {
                key: self.header.key.clone(),
                reason: format!("zstd: {err}"),
            }
        })?;
        if data.len() as u64 != self.header.original_size {
            return Err(ContainerError::CorruptEntry {
                key: self.header.key.clone(),
                reason: format!(
                    "expected {} bytes, decompressed {}",
                    self.header.original_size,
                    data.len()
                ),
            });
        }
        if xxh3_64(&data) != self.header.checksum {
            return Err(ContainerError::CorruptEntry {
                key: self.header.key.clone(),
                reason: "checksum mismatch".into(),
            });
        }
        Ok(data)
    }
}

/// Walks a volume entry by entry without loading it whole.
///
/// Once the trailer is reached, its entry count and totals are checked
/// against what was read and [`next_entry`](Self::next_entry) returns `None`.
pub struct VolumeReader<R: Read> {
    inner: R,
    offset: u64,
    entries_read: u64,
    total_original: u64,
    total_compressed: u64,
    trailer: Option<Trailer>,
}

impl<R: Read> VolumeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            entries_read: 0,
            total_original: 0,
            total_compressed: 0,
            trailer: None,
        }
    }

    /// The trailer, once reached.
    pub fn trailer(&self) -> Option<&Trailer> {
        self.trailer.as_ref()
    }

    pub fn next_entry(&mut self) -> Result<Option<VolumeEntry>, ContainerError> {
        if self.trailer.is_some() {
            return Ok(None);
        }

        let entry_offset = self.offset;
        let mut block = vec![0u8; BLOCK_SIZE as usize];
        self.read_exact(&mut block)?;

        if block[..4] == TRAILER_MAGIC {
            let trailer = Trailer::decode(&block, entry_offset)?;
            self.check_trailer(&trailer)?;
            self.ensure_eof()?;
            self.trailer = Some(trailer);
            return Ok(None);
        }
        if block[..4] != ENTRY_MAGIC {
            return Err(ContainerError::BadMagic {
                offset: entry_offset,
            });
        }

        let (key_len, original_size, compressed_size, checksum) =
            EntryHeader::decode_fixed(&block, entry_offset)?;
        let header_len = align_up((ENTRY_HEADER_FIXED_LEN + key_len as usize) as u64) as usize;
        if header_len > block.len() {
            let mut rest = vec![0u8; header_len - block.len()];
            self.read_exact(&mut rest)?;
            block.extend_from_slice(&rest);
        }
        let key_bytes = &block[ENTRY_HEADER_FIXED_LEN..ENTRY_HEADER_FIXED_LEN + key_len as usize];
        let key = String::from_utf8(key_bytes.to_vec()).map_err(|_| {
            ContainerError::InvalidKey {
                offset: entry_offset,
            }
        })?;

        let mut payload = Vec::new();
        let read = (&mut self.inner)
            .take(compressed_size)
            .read_to_end(&mut payload)?;
        self.offset += read as u64;
        if (read as u64) < compressed_size {
            return Err(ContainerError::Truncated {
                offset: self.offset,
            });
        }
        let padding = align_up(compressed_size) - compressed_size;
        let mut pad = vec![0u8; padding as usize];
        self.read_exact(&mut pad)?;

        self.entries_read += 1;
        self.total_original += original_size;
        self.total_compressed += compressed_size;

        Ok(Some(VolumeEntry {
            header: EntryHeader {
                key,
                original_size,
                compressed_size,
                checksum,
            },
            offset: entry_offset,
            payload,
        }))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ContainerError> {
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.offset += buf.len() as u64;
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Err(ContainerError::Truncated {
                    offset: self.offset,
                })
            }
            Err(err) => Err(ContainerError::Io(err)),
        }
    }

    fn check_trailer(&self, trailer: &Trailer) -> Result<(), ContainerError> {
        if trailer.entry_count != self.entries_read {
            return Err(ContainerError::TrailerMismatch(format!(
                "trailer counts {} entries, read {}",
                trailer.entry_count, self.entries_read
            )));
        }
        if trailer.total_original != self.total_original
            || trailer.total_compressed != self.total_compressed
        {
            return Err(ContainerError::TrailerMismatch(format!(
                "trailer totals {}/{} bytes, read {}/{}",
                trailer.total_original,
                trailer.total_compressed,
                self.total_original,
                self.total_compressed
            )));
        }
        Ok(())
    }

    fn ensure_eof(&mut self) -> Result<(), ContainerError> {
        let mut trailing = [0u8; 1];
        match self.inner.read(&mut trailing)? {
            0 => Ok(()),
            _ => Err(ContainerError::TrailerMismatch(
                "data found after the trailer".into(),
            )),
        }
    }
}
