//! Directory index decoding
//!
//! Directory entries live in the resident $INDEX_ROOT value and in 4096-byte
//! INDX blocks of $INDEX_ALLOCATION. Both start with the same node header
//! followed by a packed list of entries whose keys are $FILE_NAME values.
//!
//! Allocation data is walked block by block at 4096-byte boundaries rather
//! than by descending the B-tree: after damage there is no trustworthy root
//! to descend from.

use crate::error::{Result, SalvageError};
use crate::ntfs::fixup::apply_fixup;
use crate::ntfs::structs::*;
use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Fixed part of an index entry before its key
const ENTRY_HEADER_LEN: usize = 16;

/// One directory entry (the child's reference plus a copy of its $FILE_NAME)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub file_ref: FileReference,
    /// Parent reference stored in the entry's $FILE_NAME key
    pub parent_ref: FileReference,
    pub name: String,
    pub namespace: FilenameNamespace,
    pub flags: u16,
    /// Child block VCN for entries of interior nodes
    pub vcn: Option<u64>,
    pub is_directory: bool,
    pub data_size: u64,
}

impl DirectoryEntry {
    pub fn has_subnode(&self) -> bool {
        (self.flags & INDEX_ENTRY_HAS_SUBNODE) != 0
    }
}

/// Decoded INDX block
#[derive(Debug, Clone)]
pub struct IndexBlock {
    pub vcn: u64,
    pub entries: Vec<DirectoryEntry>,
    pub torn_sectors: usize,
}

impl IndexBlock {
    /// Fix up and decode a raw 4096-byte INDX block in place
    pub fn decode(data: &mut [u8]) -> Result<Self> {
        if data.len() < INDEX_BLOCK_SIZE {
            return Err(SalvageError::malformed(0, "index block shorter than 4096 bytes"));
        }
        let data = &mut data[..INDEX_BLOCK_SIZE];

        let header = IndexBlockHeader::from_bytes(data)
            .ok_or_else(|| SalvageError::malformed(0, "index block header truncated"))?;
        if !header.is_valid() {
            return Err(SalvageError::malformed(0, "missing INDX signature"));
        }

        let torn_sectors = apply_fixup(data, MAX_INDX_USA_COUNT)?;
        let entries = walk_entries(&data[INDX_HEADER_OFFSET..])
            .map_err(|e| shift_offset(e, INDX_HEADER_OFFSET))?;

        Ok(Self {
            vcn: header.vcn,
            entries,
            torn_sectors,
        })
    }
}

/// Decode the entries of a resident $INDEX_ROOT value
pub fn parse_index_root(value: &[u8]) -> Result<Vec<DirectoryEntry>> {
    if value.len() < INDEX_ROOT_HEADER_OFFSET + 16 {
        return Err(SalvageError::malformed(0, "index root value truncated"));
    }
    walk_entries(&value[INDEX_ROOT_HEADER_OFFSET..])
        .map_err(|e| shift_offset(e, INDEX_ROOT_HEADER_OFFSET))
}

/// Result of a sequential scan over $INDEX_ALLOCATION data
#[derive(Debug, Default)]
pub struct AllocationScan {
    pub entries: Vec<DirectoryEntry>,
    pub blocks: usize,
    pub bad_blocks: usize,
}

/// Walk raw $INDEX_ALLOCATION data block by block.
///
/// Blocks without the INDX signature (never used, or overwritten) and blocks
/// that fail to decode are counted and skipped; the scan always resumes at
/// the next 4096-byte boundary.
pub fn parse_index_allocation(data: &mut [u8]) -> AllocationScan {
    let mut scan = AllocationScan::default();
    let mut offset = 0;

    while offset + INDEX_BLOCK_SIZE <= data.len() {
        let block = &mut data[offset..offset + INDEX_BLOCK_SIZE];
        if &block[0..4] == INDX_SIGNATURE {
            scan.blocks += 1;
            match IndexBlock::decode(block) {
                Ok(decoded) => scan.entries.extend(decoded.entries),
                Err(_) => scan.bad_blocks += 1,
            }
        }
        offset = (offset + 1).div_ceil(INDEX_BLOCK_SIZE) * INDEX_BLOCK_SIZE;
    }

    scan
}

/// Walk the entries following an index node header.
///
/// `node` starts at the header; all header offsets are relative to it.
fn walk_entries(node: &[u8]) -> Result<Vec<DirectoryEntry>> {
    let header = IndexNodeHeader::from_bytes(node)
        .ok_or_else(|| SalvageError::malformed(0, "index node header truncated"))?;

    let start = header.entries_offset as usize;
    let end = (header.index_length as usize).min(node.len());
    if start < 16 || start > end {
        return Err(SalvageError::malformed(
            0,
            format!("index entries at {} outside node of {} bytes", start, end),
        ));
    }

    let mut entries = Vec::new();
    let mut cursor = start;

    while cursor + ENTRY_HEADER_LEN <= end {
        let mut reader = Cursor::new(&node[cursor..cursor + ENTRY_HEADER_LEN]);
        let file_ref = FileReference::from_raw(reader.read_u64::<LittleEndian>()?);
        let length = reader.read_u16::<LittleEndian>()? as usize;
        let key_length = reader.read_u16::<LittleEndian>()? as usize;
        let flags = reader.read_u16::<LittleEndian>()?;

        if length < ENTRY_HEADER_LEN || cursor + length > end {
            return Err(SalvageError::malformed(
                cursor as u64,
                format!("index entry length {} overruns node", length),
            ));
        }

        if (flags & INDEX_ENTRY_LAST) != 0 {
            break;
        }

        let key_end = cursor + ENTRY_HEADER_LEN + key_length;
        if key_length < FILE_NAME_HEADER_LEN || key_end > cursor + length {
            return Err(SalvageError::malformed(
                cursor as u64,
                format!("index key length {} invalid", key_length),
            ));
        }

        let key = FileNameAttribute::from_bytes(&node[cursor + ENTRY_HEADER_LEN..key_end])
            .ok_or_else(|| SalvageError::malformed(cursor as u64, "undecodable index key"))?;

        let vcn = if (flags & INDEX_ENTRY_HAS_SUBNODE) != 0 && length >= ENTRY_HEADER_LEN + 8 {
            let at = cursor + length - 8;
            Some(u64::from_le_bytes(node[at..at + 8].try_into().unwrap_or_default()))
        } else {
            None
        };

        entries.push(DirectoryEntry {
            file_ref,
            parent_ref: key.parent_reference,
            is_directory: key.is_directory(),
            data_size: key.data_size,
            name: key.name,
            namespace: key.namespace,
            flags,
            vcn,
        });

        cursor += length;
    }

    Ok(entries)
}

fn shift_offset(err: SalvageError, by: usize) -> SalvageError {
    match err {
        SalvageError::MalformedRecord { position, reason } => SalvageError::MalformedRecord {
            position: position + by as u64,
            reason,
        },
        other => other,
    }
}
