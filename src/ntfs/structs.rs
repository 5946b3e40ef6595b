//! NTFS on-disk structures and constants

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

// ============================================================================
// NTFS Constants
// ============================================================================

/// MFT record signature "FILE"
pub const FILE_SIGNATURE: &[u8; 4] = b"FILE";

/// Index block signature "INDX"
pub const INDX_SIGNATURE: &[u8; 4] = b"INDX";

/// End of attributes marker
pub const ATTRIBUTE_END_MARKER: u32 = 0xFFFFFFFF;

/// MFT record size (fixed, not read from the boot sector)
pub const FILE_RECORD_SIZE: usize = 1024;

/// Index allocation block size
pub const INDEX_BLOCK_SIZE: usize = 4096;

/// Sector size
pub const SECTOR_SIZE: usize = 512;

/// Cluster size
pub const CLUSTER_SIZE: u64 = 4096;

/// MFT records per cluster
pub const RECORDS_PER_CLUSTER: u64 = CLUSTER_SIZE / FILE_RECORD_SIZE as u64;

/// Record index of the root directory
pub const ROOT_RECORD_INDEX: u64 = 5;

/// Largest update sequence array (check value + one slot per sector) for a FILE record
pub const MAX_FILE_USA_COUNT: usize = FILE_RECORD_SIZE / SECTOR_SIZE + 1;

/// Largest update sequence array for an INDX block
pub const MAX_INDX_USA_COUNT: usize = INDEX_BLOCK_SIZE / SECTOR_SIZE + 1;

/// Offset of the index header inside an INDX block
pub const INDX_HEADER_OFFSET: usize = 0x18;

/// Offset of the index header inside an $INDEX_ROOT value
pub const INDEX_ROOT_HEADER_OFFSET: usize = 0x10;

/// Name of the directory index attribute
pub const I30_NAME: &str = "$I30";

// MFT Record Flags
pub const MFT_RECORD_IN_USE: u16 = 0x0001;
pub const MFT_RECORD_IS_DIRECTORY: u16 = 0x0002;

// Index entry flags
pub const INDEX_ENTRY_HAS_SUBNODE: u16 = 0x0001;
pub const INDEX_ENTRY_LAST: u16 = 0x0002;

// ============================================================================
// Attribute Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum AttributeType {
    StandardInformation = 0x10,
    AttributeList = 0x20,
    FileName = 0x30,
    ObjectId = 0x40,
    SecurityDescriptor = 0x50,
    VolumeName = 0x60,
    VolumeInformation = 0x70,
    Data = 0x80,
    IndexRoot = 0x90,
    IndexAllocation = 0xA0,
    Bitmap = 0xB0,
    ReparsePoint = 0xC0,
    EaInformation = 0xD0,
    Ea = 0xE0,
    LoggedUtilityStream = 0x100,
}

impl AttributeType {
    /// Map a type code to a known attribute type. The end marker and
    /// unknown codes yield `None`.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x10 => Some(Self::StandardInformation),
            0x20 => Some(Self::AttributeList),
            0x30 => Some(Self::FileName),
            0x40 => Some(Self::ObjectId),
            0x50 => Some(Self::SecurityDescriptor),
            0x60 => Some(Self::VolumeName),
            0x70 => Some(Self::VolumeInformation),
            0x80 => Some(Self::Data),
            0x90 => Some(Self::IndexRoot),
            0xA0 => Some(Self::IndexAllocation),
            0xB0 => Some(Self::Bitmap),
            0xC0 => Some(Self::ReparsePoint),
            0xD0 => Some(Self::EaInformation),
            0xE0 => Some(Self::Ea),
            0x100 => Some(Self::LoggedUtilityStream),
            _ => None,
        }
    }
}

// ============================================================================
// File Reference Number
// ============================================================================

/// 48-bit MFT record index plus 16-bit sequence number
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileReference(u64);

impl FileReference {
    pub const NULL: FileReference = FileReference(0);

    const INDEX_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

    /// Pack a sequence number and a record index. Index bits above 48 are discarded.
    pub const fn new(sequence: u16, index: u64) -> Self {
        Self(((sequence as u64) << 48) | (index & Self::INDEX_MASK))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// MFT record index (lower 48 bits)
    pub const fn index(self) -> u64 {
        self.0 & Self::INDEX_MASK
    }

    /// Sequence number (upper 16 bits)
    pub const fn sequence(self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileReference({}#{})", self.index(), self.sequence())
    }
}

impl fmt::Display for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index(), self.sequence())
    }
}

// ============================================================================
// FILE Record Header
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct FileRecordHeader {
    pub signature: [u8; 4],
    pub update_sequence_offset: u16,
    pub update_sequence_count: u16,
    pub log_sequence_number: u64,
    pub sequence_number: u16,
    pub hard_link_count: u16,
    pub first_attribute_offset: u16,
    pub flags: u16,
    pub used_size: u32,
    pub allocated_size: u32,
    pub base_record_reference: u64,
    pub next_attribute_id: u16,
    /// Record number stored by NTFS 3.1+ (0x2C); zero on older volumes
    pub record_number: u32,
}

impl FileRecordHeader {
    /// Parse FILE record header from raw bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 48 {
            return None;
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);

        let mut cursor = Cursor::new(&data[4..]);

        Some(Self {
            signature,
            update_sequence_offset: cursor.read_u16::<LittleEndian>().ok()?,
            update_sequence_count: cursor.read_u16::<LittleEndian>().ok()?,
            log_sequence_number: cursor.read_u64::<LittleEndian>().ok()?,
            sequence_number: cursor.read_u16::<LittleEndian>().ok()?,
            hard_link_count: cursor.read_u16::<LittleEndian>().ok()?,
            first_attribute_offset: cursor.read_u16::<LittleEndian>().ok()?,
            flags: cursor.read_u16::<LittleEndian>().ok()?,
            used_size: cursor.read_u32::<LittleEndian>().ok()?,
            allocated_size: cursor.read_u32::<LittleEndian>().ok()?,
            base_record_reference: cursor.read_u64::<LittleEndian>().ok()?,
            next_attribute_id: cursor.read_u16::<LittleEndian>().ok()?,
            record_number: {
                let _align = cursor.read_u16::<LittleEndian>().ok()?;
                cursor.read_u32::<LittleEndian>().ok()?
            },
        })
    }

    pub fn is_valid(&self) -> bool {
        &self.signature == FILE_SIGNATURE
    }

    pub fn is_in_use(&self) -> bool {
        (self.flags & MFT_RECORD_IN_USE) != 0
    }

    pub fn is_directory(&self) -> bool {
        (self.flags & MFT_RECORD_IS_DIRECTORY) != 0
    }
}

// ============================================================================
// INDX Block Header
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct IndexBlockHeader {
    pub signature: [u8; 4],
    pub update_sequence_offset: u16,
    pub update_sequence_count: u16,
    pub log_sequence_number: u64,
    /// VCN of this block inside the directory's $INDEX_ALLOCATION
    pub vcn: u64,
}

impl IndexBlockHeader {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < INDX_HEADER_OFFSET {
            return None;
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);

        let mut cursor = Cursor::new(&data[4..]);

        Some(Self {
            signature,
            update_sequence_offset: cursor.read_u16::<LittleEndian>().ok()?,
            update_sequence_count: cursor.read_u16::<LittleEndian>().ok()?,
            log_sequence_number: cursor.read_u64::<LittleEndian>().ok()?,
            vcn: cursor.read_u64::<LittleEndian>().ok()?,
        })
    }

    pub fn is_valid(&self) -> bool {
        &self.signature == INDX_SIGNATURE
    }
}

/// Header shared by $INDEX_ROOT values and INDX blocks
#[derive(Debug, Clone, Default)]
pub struct IndexNodeHeader {
    /// Offset of the first entry, relative to this header
    pub entries_offset: u32,
    /// Bytes in use, relative to this header
    pub index_length: u32,
    pub allocated_size: u32,
    pub flags: u8,
}

impl IndexNodeHeader {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 16 {
            return None;
        }

        let mut cursor = Cursor::new(data);

        Some(Self {
            entries_offset: cursor.read_u32::<LittleEndian>().ok()?,
            index_length: cursor.read_u32::<LittleEndian>().ok()?,
            allocated_size: cursor.read_u32::<LittleEndian>().ok()?,
            flags: cursor.read_u8().ok()?,
        })
    }
}

// ============================================================================
// Attribute Header
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct AttributeHeader {
    pub attribute_type: u32,
    pub length: u32,
    pub non_resident: bool,
    pub name_length: u8,
    pub name_offset: u16,
    pub flags: u16,
    pub attribute_id: u16,
}

#[derive(Debug, Clone)]
pub struct ResidentAttributeHeader {
    pub base: AttributeHeader,
    pub value_length: u32,
    pub value_offset: u16,
    pub indexed_flag: u8,
}

#[derive(Debug, Clone)]
pub struct NonResidentAttributeHeader {
    pub base: AttributeHeader,
    pub lowest_vcn: u64,
    pub highest_vcn: u64,
    pub data_runs_offset: u16,
    pub compression_unit: u16,
    pub allocated_size: u64,
    pub data_size: u64,
    pub initialized_size: u64,
}

impl AttributeHeader {
    /// Parse attribute header from raw bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 16 {
            return None;
        }

        let mut cursor = Cursor::new(data);

        Some(Self {
            attribute_type: cursor.read_u32::<LittleEndian>().ok()?,
            length: cursor.read_u32::<LittleEndian>().ok()?,
            non_resident: cursor.read_u8().ok()? != 0,
            name_length: cursor.read_u8().ok()?,
            name_offset: cursor.read_u16::<LittleEndian>().ok()?,
            flags: cursor.read_u16::<LittleEndian>().ok()?,
            attribute_id: cursor.read_u16::<LittleEndian>().ok()?,
        })
    }

    /// Attribute stream name (UTF-16LE inside the attribute), if any
    pub fn stream_name(&self, attr_data: &[u8]) -> Option<String> {
        if self.name_length == 0 {
            return None;
        }
        let start = self.name_offset as usize;
        let end = start + self.name_length as usize * 2;
        if end > attr_data.len() {
            return None;
        }
        Some(decode_utf16le(&attr_data[start..end]))
    }
}

impl ResidentAttributeHeader {
    /// Parse resident attribute header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let base = AttributeHeader::from_bytes(data)?;
        if base.non_resident || data.len() < 24 {
            return None;
        }

        let mut cursor = Cursor::new(&data[16..]);

        Some(Self {
            base,
            value_length: cursor.read_u32::<LittleEndian>().ok()?,
            value_offset: cursor.read_u16::<LittleEndian>().ok()?,
            indexed_flag: cursor.read_u8().ok()?,
        })
    }
}

impl NonResidentAttributeHeader {
    /// Parse non-resident attribute header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let base = AttributeHeader::from_bytes(data)?;
        if !base.non_resident || data.len() < 64 {
            return None;
        }

        let mut cursor = Cursor::new(&data[16..]);

        let lowest_vcn = cursor.read_u64::<LittleEndian>().ok()?;
        let highest_vcn = cursor.read_u64::<LittleEndian>().ok()?;
        let data_runs_offset = cursor.read_u16::<LittleEndian>().ok()?;
        let compression_unit = cursor.read_u16::<LittleEndian>().ok()?;
        let _padding = cursor.read_u32::<LittleEndian>().ok()?;
        let allocated_size = cursor.read_u64::<LittleEndian>().ok()?;
        let data_size = cursor.read_u64::<LittleEndian>().ok()?;
        let initialized_size = cursor.read_u64::<LittleEndian>().ok()?;

        Some(Self {
            base,
            lowest_vcn,
            highest_vcn,
            data_runs_offset,
            compression_unit,
            allocated_size,
            data_size,
            initialized_size,
        })
    }
}

// ============================================================================
// Standard Information Attribute
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardInformation {
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_modification_time: u64,
    pub access_time: u64,
    pub file_attributes: u32,
}

impl StandardInformation {
    /// Parse from resident attribute content
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 48 {
            return None;
        }

        let mut cursor = Cursor::new(data);

        Some(Self {
            creation_time: cursor.read_u64::<LittleEndian>().ok()?,
            modification_time: cursor.read_u64::<LittleEndian>().ok()?,
            mft_modification_time: cursor.read_u64::<LittleEndian>().ok()?,
            access_time: cursor.read_u64::<LittleEndian>().ok()?,
            file_attributes: cursor.read_u32::<LittleEndian>().ok()?,
        })
    }
}

// ============================================================================
// File Name Attribute
// ============================================================================

/// Filename namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilenameNamespace {
    Posix = 0,
    Win32 = 1,
    Dos = 2,
    Win32AndDos = 3,
}

impl FilenameNamespace {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Posix),
            1 => Some(Self::Win32),
            2 => Some(Self::Dos),
            3 => Some(Self::Win32AndDos),
            _ => None,
        }
    }

    /// Everything except the 8.3 DOS namespace carries the long name
    pub fn is_long_name(self) -> bool {
        self != FilenameNamespace::Dos
    }
}

/// Fixed part of a $FILE_NAME value, before the name itself
pub const FILE_NAME_HEADER_LEN: usize = 66;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNameAttribute {
    pub parent_reference: FileReference,
    pub creation_time: u64,
    pub modification_time: u64,
    pub allocated_size: u64,
    pub data_size: u64,
    pub file_attributes: u32,
    pub namespace: FilenameNamespace,
    pub name: String,
}

impl FileNameAttribute {
    /// Parse from resident attribute content (also the key of a directory index entry)
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < FILE_NAME_HEADER_LEN {
            return None;
        }

        let mut cursor = Cursor::new(data);

        let parent_reference = FileReference::from_raw(cursor.read_u64::<LittleEndian>().ok()?);
        let creation_time = cursor.read_u64::<LittleEndian>().ok()?;
        let modification_time = cursor.read_u64::<LittleEndian>().ok()?;
        let _mft_modification_time = cursor.read_u64::<LittleEndian>().ok()?;
        let _access_time = cursor.read_u64::<LittleEndian>().ok()?;
        let allocated_size = cursor.read_u64::<LittleEndian>().ok()?;
        let data_size = cursor.read_u64::<LittleEndian>().ok()?;
        let file_attributes = cursor.read_u32::<LittleEndian>().ok()?;
        let _reparse_value = cursor.read_u32::<LittleEndian>().ok()?;
        let name_length = cursor.read_u8().ok()?;
        let namespace = FilenameNamespace::from_u8(cursor.read_u8().ok()?)?;

        let name_end = FILE_NAME_HEADER_LEN + name_length as usize * 2;
        if data.len() < name_end {
            return None;
        }

        Some(Self {
            parent_reference,
            creation_time,
            modification_time,
            allocated_size,
            data_size,
            file_attributes,
            namespace,
            name: decode_utf16le(&data[FILE_NAME_HEADER_LEN..name_end]),
        })
    }

    pub fn is_directory(&self) -> bool {
        (self.file_attributes & (file_attributes::DIRECTORY | file_attributes::INDEX_PRESENT)) != 0
    }
}

/// Decode a UTF-16LE byte slice, replacing invalid sequences
pub fn decode_utf16le(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

// ============================================================================
// FILETIME conversion utilities
// ============================================================================

/// Convert Windows FILETIME (100-nanosecond intervals since 1601) to Unix timestamp
pub fn filetime_to_unix(filetime: u64) -> i64 {
    // Difference between 1601 and 1970 in 100-nanosecond intervals
    const EPOCH_DIFF: u64 = 116444736000000000;

    if filetime < EPOCH_DIFF {
        return 0;
    }

    ((filetime - EPOCH_DIFF) / 10_000_000) as i64
}

/// Convert Windows FILETIME to chrono DateTime
pub fn filetime_to_datetime(filetime: u64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(filetime_to_unix(filetime), 0).unwrap_or_default()
}

// ============================================================================
// File Attributes
// ============================================================================

pub mod file_attributes {
    pub const DIRECTORY: u32 = 0x00000010;
    /// Set in $FILE_NAME values of directories (the record carries an $I30 index)
    pub const INDEX_PRESENT: u32 = 0x10000000;
}
