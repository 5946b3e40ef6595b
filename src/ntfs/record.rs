//! FILE record decoding
//!
//! Turns a raw 1024-byte MFT slot into a header plus a closed set of typed
//! attributes. Anything structurally wrong (bad update sequence, attribute
//! running past the record, unknown attribute type, broken run list) makes the
//! whole record malformed.

use crate::error::{Result, SalvageError};
use crate::ntfs::fixup::apply_fixup;
use crate::ntfs::index::{parse_index_root, DirectoryEntry};
use crate::ntfs::runlist::RunList;
use crate::ntfs::structs::*;
use serde::{Deserialize, Serialize};

/// One decoded attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub kind: AttributeType,
    /// Stream name (`$I30` for directory indexes, ADS names for $DATA)
    pub name: Option<String>,
    pub body: AttributeBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeBody {
    Resident(AttributeValue),
    NonResident {
        run_list: RunList,
        lowest_vcn: u64,
        allocated_size: u64,
        data_size: u64,
        initialized_size: u64,
    },
}

/// Decoded value of a resident attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    StandardInformation(StandardInformation),
    FileName(FileNameAttribute),
    IndexRoot(Vec<DirectoryEntry>),
    Data(Vec<u8>),
    /// Value kept only by size (security descriptors, object ids, ...)
    Opaque { length: u32 },
}

impl Attribute {
    pub fn is_resident(&self) -> bool {
        matches!(self.body, AttributeBody::Resident(_))
    }

    pub fn run_list(&self) -> Option<&RunList> {
        match &self.body {
            AttributeBody::NonResident { run_list, .. } => Some(run_list),
            AttributeBody::Resident(_) => None,
        }
    }

    /// Logical size of the attribute value
    pub fn data_size(&self) -> u64 {
        match &self.body {
            AttributeBody::NonResident { data_size, .. } => *data_size,
            AttributeBody::Resident(AttributeValue::Data(bytes)) => bytes.len() as u64,
            AttributeBody::Resident(AttributeValue::Opaque { length }) => *length as u64,
            AttributeBody::Resident(_) => 0,
        }
    }
}

/// Decoded FILE record
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub header: FileRecordHeader,
    pub attributes: Vec<Attribute>,
    pub torn_sectors: usize,
}

impl FileRecord {
    /// Apply the fixup to a raw record in place, then decode it
    pub fn decode(data: &mut [u8]) -> Result<Self> {
        if data.len() < FILE_RECORD_SIZE {
            return Err(SalvageError::malformed(0, "record shorter than 1024 bytes"));
        }
        let data = &mut data[..FILE_RECORD_SIZE];

        if &data[0..4] != FILE_SIGNATURE {
            return Err(SalvageError::malformed(0, "missing FILE signature"));
        }

        let torn_sectors = apply_fixup(data, MAX_FILE_USA_COUNT)?;
        let mut record = Self::parse(data)?;
        record.torn_sectors = torn_sectors;
        Ok(record)
    }

    /// Decode a record whose fixup has already been applied
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = FileRecordHeader::from_bytes(data)
            .ok_or_else(|| SalvageError::malformed(0, "record header truncated"))?;

        if !header.is_valid() {
            return Err(SalvageError::malformed(0, "missing FILE signature"));
        }

        let capacity = data.len().min(FILE_RECORD_SIZE);
        if header.allocated_size as usize > FILE_RECORD_SIZE
            || header.used_size > header.allocated_size
            || header.used_size as usize > capacity
        {
            return Err(SalvageError::malformed(
                0,
                format!(
                    "record sizes used={} allocated={} exceed capacity {}",
                    header.used_size, header.allocated_size, FILE_RECORD_SIZE
                ),
            ));
        }

        let attributes = walk_attributes(&data[..capacity], header.first_attribute_offset as usize)?;

        Ok(Self {
            header,
            attributes,
            torn_sectors: 0,
        })
    }
}

fn walk_attributes(data: &[u8], first_offset: usize) -> Result<Vec<Attribute>> {
    let mut attributes = Vec::new();
    let mut offset = first_offset;

    if offset < 0x18 {
        return Err(SalvageError::malformed(0, format!("first attribute offset {} inside header", offset)));
    }

    loop {
        if offset + 4 > data.len() {
            return Err(SalvageError::malformed(offset as u64, "attribute list not terminated"));
        }

        let type_code = u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]);
        if type_code == ATTRIBUTE_END_MARKER {
            break;
        }

        let header = AttributeHeader::from_bytes(&data[offset..])
            .ok_or_else(|| SalvageError::malformed(offset as u64, "attribute header past end of record"))?;

        let length = header.length as usize;
        if length < 16 || offset + length > data.len() {
            return Err(SalvageError::malformed(
                offset as u64,
                format!("attribute length {} overruns record", length),
            ));
        }

        let kind = AttributeType::from_u32(type_code).ok_or_else(|| {
            SalvageError::malformed(offset as u64, format!("unknown attribute type 0x{:X}", type_code))
        })?;

        let attr_data = &data[offset..offset + length];
        let attribute = decode_attribute(kind, &header, attr_data)
            .map_err(|e| e.at_position(offset as u64))?;
        attributes.push(attribute);

        offset += length;
    }

    Ok(attributes)
}

fn decode_attribute(kind: AttributeType, header: &AttributeHeader, attr_data: &[u8]) -> Result<Attribute> {
    let name = header.stream_name(attr_data);

    let body = if header.non_resident {
        let nr = NonResidentAttributeHeader::from_bytes(attr_data)
            .ok_or_else(|| SalvageError::malformed(0, "non-resident header truncated"))?;

        let runs_offset = nr.data_runs_offset as usize;
        if runs_offset > attr_data.len() {
            return Err(SalvageError::malformed(0, "run list offset past attribute"));
        }

        AttributeBody::NonResident {
            run_list: RunList::decode(&attr_data[runs_offset..])?,
            lowest_vcn: nr.lowest_vcn,
            allocated_size: nr.allocated_size,
            data_size: nr.data_size,
            initialized_size: nr.initialized_size,
        }
    } else {
        let resident = ResidentAttributeHeader::from_bytes(attr_data)
            .ok_or_else(|| SalvageError::malformed(0, "resident header truncated"))?;

        let start = resident.value_offset as usize;
        let end = start + resident.value_length as usize;
        if end > attr_data.len() {
            return Err(SalvageError::malformed(0, "resident value past attribute"));
        }
        let value = &attr_data[start..end];

        AttributeBody::Resident(match kind {
            AttributeType::StandardInformation => AttributeValue::StandardInformation(
                StandardInformation::from_bytes(value)
                    .ok_or_else(|| SalvageError::malformed(0, "$STANDARD_INFORMATION truncated"))?,
            ),
            AttributeType::FileName => AttributeValue::FileName(
                FileNameAttribute::from_bytes(value)
                    .ok_or_else(|| SalvageError::malformed(0, "$FILE_NAME undecodable"))?,
            ),
            AttributeType::IndexRoot => AttributeValue::IndexRoot(parse_index_root(value)?),
            AttributeType::Data => AttributeValue::Data(value.to_vec()),
            _ => AttributeValue::Opaque {
                length: resident.value_length,
            },
        })
    };

    Ok(Attribute { kind, name, body })
}

// ============================================================================
// Attribute lookups
// ============================================================================

/// All $FILE_NAME values, in record order
pub fn file_names(attributes: &[Attribute]) -> impl Iterator<Item = &FileNameAttribute> {
    attributes.iter().filter_map(|a| match &a.body {
        AttributeBody::Resident(AttributeValue::FileName(f)) => Some(f),
        _ => None,
    })
}

/// The authoritative (name, parent) pair: the first long name, else the first name
pub fn primary_file_name(attributes: &[Attribute]) -> Option<&FileNameAttribute> {
    file_names(attributes)
        .find(|f| f.namespace.is_long_name())
        .or_else(|| file_names(attributes).next())
}

/// The unnamed $DATA stream
pub fn unnamed_data(attributes: &[Attribute]) -> Option<&Attribute> {
    attributes
        .iter()
        .find(|a| a.kind == AttributeType::Data && a.name.is_none())
}

/// The directory's $I30 allocation
pub fn index_allocation(attributes: &[Attribute]) -> Option<&Attribute> {
    attributes.iter().find(|a| {
        a.kind == AttributeType::IndexAllocation && a.name.as_deref().map_or(true, |n| n == I30_NAME)
    })
}

/// Entries of the resident $INDEX_ROOT
pub fn index_root_entries(attributes: &[Attribute]) -> &[DirectoryEntry] {
    attributes
        .iter()
        .find_map(|a| match &a.body {
            AttributeBody::Resident(AttributeValue::IndexRoot(entries)) => Some(entries.as_slice()),
            _ => None,
        })
        .unwrap_or(&[])
}

pub fn standard_information(attributes: &[Attribute]) -> Option<&StandardInformation> {
    attributes.iter().find_map(|a| match &a.body {
        AttributeBody::Resident(AttributeValue::StandardInformation(si)) => Some(si),
        _ => None,
    })
}
