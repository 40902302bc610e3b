//! Binary index stored next to every chunk's data file.
//!
//! Layout (big-endian):
//!
//! ```text
//! magic u32 | version u32 | start_offset u64 | end_offset u64 | entry_count u32
//! entry_count x [ byte_offset u64 | byte_length u64 | first_record_offset u64 | num_records u32 ]
//! ```
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ArchiverError, ArchiverResult};

static MAGIC_NUMBER: u32 = 0x4348_4b31;
static V1_VERSION_NUMBER: u32 = 1;

/// Location and offset range of one gzip member inside a chunk's data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndexEntry {
    /// Byte position of the member within the data file.
    pub byte_offset: u64,
    /// Compressed length of the member.
    pub byte_length: u64,
    /// Offset of the first record stored in the member.
    pub first_record_offset: u64,
    /// Number of records stored in the member.
    pub num_records: u32,
}

impl BlockIndexEntry {
    /// Size of one encoded entry.
    #[inline]
    pub const fn packed_size() -> usize {
        3 * std::mem::size_of::<u64>() + std::mem::size_of::<u32>()
    }

    /// Appends the encoded entry to `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u64(self.byte_offset);
        buf.put_u64(self.byte_length);
        buf.put_u64(self.first_record_offset);
        buf.put_u32(self.num_records);
    }
}

impl TryFrom<&[u8]> for BlockIndexEntry {
    type Error = ArchiverError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < Self::packed_size() {
            return Err(ArchiverError::UnableToParseIndex(format!(
                "block entry needs {} bytes, got {}",
                Self::packed_size(),
                value.len()
            )));
        }

        Ok(Self {
            byte_offset: u64::from_be_bytes(value[0..8].try_into()?),
            byte_length: u64::from_be_bytes(value[8..16].try_into()?),
            first_record_offset: u64::from_be_bytes(value[16..24].try_into()?),
            num_records: u32::from_be_bytes(value[24..28].try_into()?),
        })
    }
}

/// The decoded index of a single chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkIndex {
    /// Offset the chunk starts at.
    pub start_offset: u64,
    /// First offset *not* contained in the chunk.
    pub end_offset: u64,
    /// The chunk's gzip members, in file order.
    pub blocks: Vec<BlockIndexEntry>,
}

impl ChunkIndex {
    /// Size of the fixed header preceding the entries.
    pub const fn header_size() -> usize {
        2 * std::mem::size_of::<u32>() + 2 * std::mem::size_of::<u64>() + std::mem::size_of::<u32>()
    }

    /// Total number of records across all blocks.
    pub fn record_count(&self) -> u64 {
        self.blocks.iter().map(|b| u64::from(b.num_records)).sum()
    }

    /// Encodes the index.
    pub fn to_bytes(&self) -> ArchiverResult<Bytes> {
        let mut buf = BytesMut::with_capacity(
            Self::header_size() + self.blocks.len() * BlockIndexEntry::packed_size(),
        );

        buf.put_u32(MAGIC_NUMBER);
        buf.put_u32(V1_VERSION_NUMBER);
        buf.put_u64(self.start_offset);
        buf.put_u64(self.end_offset);
        buf.put_u32(self.blocks.len().try_into()?);

        for block in &self.blocks {
            block.write(&mut buf);
        }

        Ok(buf.freeze())
    }
}

fn truncated(err: impl std::fmt::Debug) -> ArchiverError {
    ArchiverError::UnableToParseIndex(format!("Failed to read index header: {:#?}", err))
}

impl TryFrom<Bytes> for ChunkIndex {
    type Error = ArchiverError;

    fn try_from(mut value: Bytes) -> Result<Self, Self::Error> {
        let magic_number = value.try_get_u32().map_err(truncated)?;

        if magic_number != MAGIC_NUMBER {
            return Err(ArchiverError::InvalidMagicNumber(magic_number));
        }

        let version = value.try_get_u32().map_err(truncated)?;

        if version != V1_VERSION_NUMBER {
            return Err(ArchiverError::InvalidIndexVersion(version));
        }

        let start_offset = value.try_get_u64().map_err(truncated)?;
        let end_offset = value.try_get_u64().map_err(truncated)?;
        let entry_count: usize = value.try_get_u32().map_err(truncated)?.try_into()?;

        if value.len() != entry_count * BlockIndexEntry::packed_size() {
            return Err(ArchiverError::UnableToParseIndex(format!(
                "expected {} block entries, found {} trailing bytes",
                entry_count,
                value.len()
            )));
        }

        let blocks = value
            .chunks_exact(BlockIndexEntry::packed_size())
            .map(BlockIndexEntry::try_from)
            .collect::<ArchiverResult<Vec<_>>>()?;

        if end_offset < start_offset {
            return Err(ArchiverError::UnableToParseIndex(format!(
                "end offset {} precedes start offset {}",
                end_offset, start_offset
            )));
        }

        Ok(Self {
            start_offset,
            end_offset,
            blocks,
        })
    }
}
