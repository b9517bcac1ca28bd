//! Binary persistence for the vector index.
//!
//! Blob format: index.bin
//!
//! Header (53 bytes):
//! - magic: [u8; 4] (b"VMIX")
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 of tier + model name)
//! - dimensions: u32 (little-endian)
//! - row_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of the header fields before it)
//!
//! Rows (repeated `row_count` times):
//! - id_len: u16 (little-endian)
//! - item_id: [u8; id_len] (UTF-8)
//! - embedding: [f32; dimensions] (little-endian, unit-normalized)
//!
//! Trailer:
//! - checksum: u32 (CRC32 of the row section)

use std::sync::Arc;

use crate::similarity::index::VectorIndex;
use crate::storage::BlobStore;

/// Blob key the index is stored under
pub const INDEX_KEY: &str = "index.bin";

const MAGIC: &[u8; 4] = b"VMIX";

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// magic(4) + version(1) + model_id(32) + dimensions(4) + row_count(8) + checksum(4)
const HEADER_SIZE: usize = 53;

/// Errors that can occur while loading or saving the index.
#[derive(Debug, thiserror::Error)]
pub enum IndexStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid index format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: blob version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: index was built with a different model")]
    ModelMismatch,

    #[error("Checksum mismatch: index blob may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, index has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Loads and saves a [`VectorIndex`] through a [`BlobStore`].
#[derive(Clone)]
pub struct IndexStorage {
    store: Arc<dyn BlobStore>,
    key: String,
}

impl IndexStorage {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            key: INDEX_KEY.to_string(),
        }
    }

    /// Load the persisted index.
    ///
    /// Returns `Ok(None)` when nothing has been persisted yet.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<Option<VectorIndex>, IndexStorageError> {
        match self.store.read(&self.key)? {
            Some(bytes) => decode(&bytes, expected_model_id, expected_dimensions).map(Some),
            None => Ok(None),
        }
    }

    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), IndexStorageError> {
        let bytes = encode(index, model_id)?;
        self.store.write(&self.key, &bytes)?;
        Ok(())
    }
}

/// Serialize an index into the blob format.
pub fn encode(index: &VectorIndex, model_id: &[u8; 32]) -> Result<Vec<u8>, IndexStorageError> {
    let dimensions = u32::try_from(index.dimensions())
        .map_err(|_| IndexStorageError::InvalidFormat("dimension does not fit in u32".into()))?;

    let mut out = Vec::with_capacity(HEADER_SIZE + index.len() * (index.dimensions() * 4 + 32) + 4);

    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(model_id);
    out.extend_from_slice(&dimensions.to_le_bytes());
    out.extend_from_slice(&(index.len() as u64).to_le_bytes());
    let header_checksum = crc32fast::hash(&out);
    out.extend_from_slice(&header_checksum.to_le_bytes());

    let rows_start = out.len();
    for (item_id, vector) in index.rows() {
        let id_len = u16::try_from(item_id.len()).map_err(|_| {
            IndexStorageError::InvalidFormat(format!("item id too long: {} bytes", item_id.len()))
        })?;
        out.extend_from_slice(&id_len.to_le_bytes());
        out.extend_from_slice(item_id.as_bytes());
        for value in vector {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    let rows_checksum = crc32fast::hash(&out[rows_start..]);
    out.extend_from_slice(&rows_checksum.to_le_bytes());

    Ok(out)
}

/// Parse a blob produced by [`encode`].
pub fn decode(
    bytes: &[u8],
    expected_model_id: &[u8; 32],
    expected_dimensions: usize,
) -> Result<VectorIndex, IndexStorageError> {
    let mut reader = Reader::new(bytes);

    let header = reader.take(HEADER_SIZE)?;
    if &header[0..4] != MAGIC {
        return Err(IndexStorageError::InvalidFormat("bad magic".into()));
    }

    let version = header[4];
    if version != FORMAT_VERSION {
        return Err(IndexStorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes(array(&header[49..53]));
    if crc32fast::hash(&header[0..49]) != stored_checksum {
        return Err(IndexStorageError::ChecksumMismatch);
    }

    if header[5..37] != expected_model_id[..] {
        return Err(IndexStorageError::ModelMismatch);
    }

    let dimensions = u32::from_le_bytes(array(&header[37..41])) as usize;
    if dimensions != expected_dimensions {
        return Err(IndexStorageError::DimensionMismatch {
            expected: expected_dimensions,
            got: dimensions,
        });
    }

    let row_count = u64::from_le_bytes(array(&header[41..49]));
    let row_count = usize::try_from(row_count)
        .map_err(|_| IndexStorageError::InvalidFormat("row count overflow".into()))?;

    let rows_start = reader.position();
    // every row needs at least the id length and the vector
    let min_row_size = 2 + dimensions * 4;
    if reader.remaining() < row_count.saturating_mul(min_row_size) {
        return Err(IndexStorageError::InvalidFormat(format!(
            "blob too short for {row_count} rows"
        )));
    }

    let mut index = VectorIndex::with_capacity(dimensions, row_count);
    let mut vector = Vec::with_capacity(dimensions);
    for _ in 0..row_count {
        let id_len = u16::from_le_bytes(array(reader.take(2)?)) as usize;
        let item_id = std::str::from_utf8(reader.take(id_len)?)
            .map_err(|e| IndexStorageError::InvalidFormat(format!("item id is not UTF-8: {e}")))?
            .to_string();

        vector.clear();
        for chunk in reader.take(dimensions * 4)?.chunks_exact(4) {
            vector.push(f32::from_le_bytes(array(chunk)));
        }

        index
            .push_normalized(item_id, &vector)
            .map_err(|e| IndexStorageError::InvalidFormat(e.to_string()))?;
    }
    let rows_end = reader.position();

    let stored_rows_checksum = u32::from_le_bytes(array(reader.take(4)?));
    if crc32fast::hash(&bytes[rows_start..rows_end]) != stored_rows_checksum {
        return Err(IndexStorageError::ChecksumMismatch);
    }

    if reader.remaining() != 0 {
        return Err(IndexStorageError::InvalidFormat("trailing bytes".into()));
    }

    Ok(index)
}

fn array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

/// Bounds-checked cursor over a byte slice.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], IndexStorageError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| IndexStorageError::InvalidFormat("unexpected end of blob".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}
