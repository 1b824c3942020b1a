//! Decoded contribution archives.
//!
//! Schema detection happens once, at decode time: archives carrying a `key`
//! stream are the current keyed format, archives without one are the legacy
//! format. Downstream merge code matches on the variant instead of poking
//! at raw stream presence.

use std::path::Path;

use thiserror::Error;

use super::{cell_offset, chunk_corner_cell, REGION_BYTES};
use crate::archive::{self, ArchiveError};
use crate::key::{KeyError, KeyTable, EMPTY_MATERIAL};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("data stream is {0} bytes, expected {expected}", expected = REGION_BYTES)]
    DataLength(usize),
}

/// One contribution's decoded region archive.
pub enum RegionSource {
    /// Current schema: cell data plus the local key table.
    Keyed { data: Vec<u8>, keys: KeyTable },
    /// Old key-less schema. Structurally incompatible with keyed merging;
    /// kept decodable so callers can report it.
    Legacy { data: Vec<u8> },
}

impl RegionSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let (data, key) = archive::read_streams(path)?;
        if data.len() != REGION_BYTES {
            return Err(SourceError::DataLength(data.len()));
        }
        Ok(match key {
            Some(bytes) => RegionSource::Keyed {
                data,
                keys: KeyTable::parse(&bytes)?,
            },
            None => RegionSource::Legacy { data },
        })
    }

    pub fn data(&self) -> &[u8] {
        match self {
            RegionSource::Keyed { data, .. } | RegionSource::Legacy { data } => data,
        }
    }

    pub fn keys(&self) -> Option<&KeyTable> {
        match self {
            RegionSource::Keyed { keys, .. } => Some(keys),
            RegionSource::Legacy { .. } => None,
        }
    }

    /// Whether this source records no data for a chunk.
    ///
    /// Only the chunk's northwest corner cell is inspected: height 0 and,
    /// for keyed sources, a key id resolving to the no-material label. A
    /// nonuniform chunk whose corner happens to read empty is misclassified;
    /// that is the long-standing trade-off of the single-cell probe and is
    /// kept as-is.
    pub fn is_chunk_empty(&self, chunk_index: usize) -> bool {
        let off = cell_offset(chunk_corner_cell(chunk_index));
        let data = self.data();
        if data[off] != 0 {
            return false;
        }
        match self {
            RegionSource::Keyed { keys, .. } => {
                let id = u16::from_be_bytes([data[off + 1], data[off + 2]]);
                keys.label(id) == Some(EMPTY_MATERIAL)
            }
            // Legacy data has no key table to resolve against; a zero
            // height alone counts as empty.
            RegionSource::Legacy { .. } => true,
        }
    }
}
