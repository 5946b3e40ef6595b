//! Pipeline working records
//!
//! A scan produces signature hits; `fill` turns hits into File and Index
//! states; `fix-mft` adds MFT states and resolves references; `complete`
//! fixes names and parents. Each stage writes a new store, records are never
//! edited in place.

use crate::ntfs::index::{DirectoryEntry, IndexBlock};
use crate::ntfs::physical::mft_slot_position;
use crate::ntfs::record::{self, Attribute, FileRecord};
use crate::ntfs::runlist::RunList;
use crate::ntfs::structs::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the record describing the master file table itself
pub const MFT_FILE_NAME: &str = "$MFT";

// ============================================================================
// Signatures
// ============================================================================

/// Record types the scanner looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Signature {
    File,
    Indx,
}

impl Signature {
    pub const ALL: [Signature; 2] = [Signature::File, Signature::Indx];

    pub fn bytes(self) -> &'static [u8; 4] {
        match self {
            Signature::File => FILE_SIGNATURE,
            Signature::Indx => INDX_SIGNATURE,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.bytes().as_slice() == bytes)
    }

    /// Size of the structure a hit points at
    pub fn record_size(self) -> usize {
        match self {
            Signature::File => FILE_RECORD_SIZE,
            Signature::Indx => INDEX_BLOCK_SIZE,
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Signature::File => "FILE",
            Signature::Indx => "INDX",
        })
    }
}

/// One signature match on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignatureHit {
    pub signature: Signature,
    pub position: u64,
}

// ============================================================================
// MFT State
// ============================================================================

/// A located $MFT record accepted as the table of one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MftState {
    pub id: u32,
    pub position: u64,
    pub run_list: RunList,
    /// Device offset of cluster 0 of the partition
    pub partition_origin: u64,
}

impl MftState {
    /// Device position of MFT slot `index`
    pub fn slot_position(&self, index: u64) -> Option<u64> {
        mft_slot_position(self.partition_origin, &self.run_list, index)
    }

    /// Number of slots the table's runs can hold; `None` if the run
    /// counts overflow
    pub fn slot_count(&self) -> Option<u64> {
        self.run_list.byte_len().map(|bytes| bytes / FILE_RECORD_SIZE as u64)
    }
}

// ============================================================================
// File State
// ============================================================================

/// A located FILE record plus what the stages learned about it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub position: u64,
    /// Owning table, once `fix-mft` placed the record
    pub mft_id: Option<u32>,
    /// Null until the record's slot index is known
    pub reference: FileReference,
    pub parent_ref: FileReference,
    pub name: String,
    pub names: Vec<FileNameAttribute>,
    pub attributes: Vec<Attribute>,
    pub is_directory: bool,
    /// Header sequence number of the slot
    pub sequence: u16,
    pub in_use: bool,
    /// Slot number stored in the header (zero on old volumes)
    pub record_number: u32,
}

impl FileState {
    /// Build the initial state of a record decoded at `position`
    pub fn from_record(position: u64, rec: FileRecord) -> Self {
        let names: Vec<FileNameAttribute> = record::file_names(&rec.attributes).cloned().collect();
        let primary = record::primary_file_name(&rec.attributes);

        let (name, parent_ref) = primary
            .map(|f| (f.name.clone(), f.parent_reference))
            .unwrap_or_default();
        let is_directory = rec.header.is_directory() || primary.is_some_and(|f| f.is_directory());

        Self {
            position,
            mft_id: None,
            reference: FileReference::NULL,
            parent_ref,
            name,
            names,
            is_directory,
            sequence: rec.header.sequence_number,
            in_use: rec.header.is_in_use(),
            record_number: rec.header.record_number,
            attributes: rec.attributes,
        }
    }

    pub fn is_mft_candidate(&self) -> bool {
        self.name == MFT_FILE_NAME
    }

    pub fn is_resolved(&self) -> bool {
        self.mft_id.is_some() && !self.reference.is_null()
    }

    /// Run list of the unnamed $DATA stream, when non-resident
    pub fn data_runs(&self) -> Option<&RunList> {
        record::unnamed_data(&self.attributes).and_then(|a| a.run_list())
    }

    /// Resident bytes of the unnamed $DATA stream
    pub fn resident_data(&self) -> Option<&[u8]> {
        match record::unnamed_data(&self.attributes).map(|a| &a.body) {
            Some(record::AttributeBody::Resident(record::AttributeValue::Data(bytes))) => Some(bytes),
            _ => None,
        }
    }

    /// Logical size of the unnamed $DATA stream
    pub fn size(&self) -> u64 {
        record::unnamed_data(&self.attributes)
            .map(|a| a.data_size())
            .unwrap_or(0)
    }

    /// Runs of the $I30 $INDEX_ALLOCATION
    pub fn index_allocation_runs(&self) -> Option<&RunList> {
        record::index_allocation(&self.attributes).and_then(|a| a.run_list())
    }

    pub fn index_root_entries(&self) -> &[DirectoryEntry] {
        record::index_root_entries(&self.attributes)
    }

    /// Last modification time from $STANDARD_INFORMATION, else from the name
    pub fn modification_time(&self) -> u64 {
        record::standard_information(&self.attributes)
            .map(|si| si.modification_time)
            .or_else(|| self.names.first().map(|n| n.modification_time))
            .unwrap_or(0)
    }

    /// Slot index once resolved
    pub fn index(&self) -> Option<u64> {
        (!self.reference.is_null()).then(|| self.reference.index())
    }
}

// ============================================================================
// Index State
// ============================================================================

/// A located INDX block and its entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub position: u64,
    pub mft_id: Option<u32>,
    /// Owning directory, once matched
    pub reference: FileReference,
    /// Directory the entries claim as their parent
    pub parent_ref: FileReference,
    pub vcn: u64,
    pub entries: Vec<DirectoryEntry>,
}

impl IndexState {
    pub fn from_block(position: u64, block: IndexBlock) -> Self {
        let parent_ref = block
            .entries
            .first()
            .map(|e| e.parent_ref)
            .unwrap_or(FileReference::NULL);

        Self {
            position,
            mft_id: None,
            reference: FileReference::NULL,
            parent_ref,
            vcn: block.vcn,
            entries: block.entries,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.mft_id.is_some() && !self.reference.is_null()
    }
}
