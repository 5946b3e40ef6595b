//! Update Sequence Array handling
//!
//! NTFS stores the last 2 bytes of each sector of a multi-sector record in the
//! update sequence array and replaces them with a check value. Before a FILE
//! record or INDX block can be interpreted the original bytes must be put back.

use crate::error::{Result, SalvageError};
use crate::ntfs::structs::SECTOR_SIZE;

/// Location of the update sequence array, read from the record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateSequence {
    pub offset: usize,
    /// Number of u16 slots including the leading check value
    pub count: usize,
}

impl UpdateSequence {
    /// Read and validate the USA location of a record.
    ///
    /// `max_count` is 3 for FILE records and 9 for INDX blocks.
    pub fn locate(data: &[u8], max_count: usize) -> Result<Self> {
        if data.len() < 8 {
            return Err(SalvageError::malformed(0, "record shorter than its header"));
        }

        let offset = u16::from_le_bytes([data[4], data[5]]) as usize;
        let count = u16::from_le_bytes([data[6], data[7]]) as usize;

        if count == 0 || count > max_count {
            return Err(SalvageError::malformed(
                0,
                format!("update sequence count {} outside 1..={}", count, max_count),
            ));
        }

        if offset < 8 || offset + count * 2 > data.len() {
            return Err(SalvageError::malformed(
                0,
                format!("update sequence array at {} (+{}) outside record", offset, count * 2),
            ));
        }

        if (count - 1) * SECTOR_SIZE > data.len() {
            return Err(SalvageError::malformed(
                0,
                format!("update sequence covers {} sectors of a {} byte buffer", count - 1, data.len()),
            ));
        }

        Ok(Self { offset, count })
    }

    /// Number of sectors protected by this array
    pub fn sectors(&self) -> usize {
        self.count - 1
    }
}

/// Revert the update sequence fixup in place.
///
/// Returns the number of torn sectors: sectors whose trailer did not hold the
/// check value. Those are still restored; the caller decides whether to trust
/// the record.
pub fn apply_fixup(data: &mut [u8], max_count: usize) -> Result<usize> {
    let usa = UpdateSequence::locate(data, max_count)?;
    let check = [data[usa.offset], data[usa.offset + 1]];
    let mut torn = 0;

    for i in 1..usa.count {
        let sector_end = i * SECTOR_SIZE - 2;
        let slot = usa.offset + i * 2;

        if data[sector_end..sector_end + 2] != check {
            torn += 1;
        }

        data[sector_end] = data[slot];
        data[sector_end + 1] = data[slot + 1];
    }

    Ok(torn)
}

/// Apply the on-disk protection: save each sector trailer into the array and
/// stamp `check` over it. Inverse of [`apply_fixup`].
pub fn protect(data: &mut [u8], usa: UpdateSequence, check: u16) -> Result<()> {
    if usa.offset + usa.count * 2 > data.len() || usa.sectors() * SECTOR_SIZE > data.len() {
        return Err(SalvageError::malformed(0, "update sequence does not fit the buffer"));
    }

    let check = check.to_le_bytes();
    data[4..6].copy_from_slice(&(usa.offset as u16).to_le_bytes());
    data[6..8].copy_from_slice(&(usa.count as u16).to_le_bytes());
    data[usa.offset..usa.offset + 2].copy_from_slice(&check);

    for i in 1..usa.count {
        let sector_end = i * SECTOR_SIZE - 2;
        let slot = usa.offset + i * 2;
        data[slot] = data[sector_end];
        data[slot + 1] = data[sector_end + 1];
        data[sector_end..sector_end + 2].copy_from_slice(&check);
    }

    Ok(())
}
