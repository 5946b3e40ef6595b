//! Raw device access
//!
//! Reads a block device or image file read-only at absolute byte offsets and
//! hands back fixed-up, decoded records. Sector and cluster sizes are the
//! fixed 512 / 4096 bytes; nothing is taken from the boot sector.

use crate::error::{Result, SalvageError};
use crate::logging;
use crate::ntfs::index::{parse_index_allocation, AllocationScan, IndexBlock};
use crate::ntfs::record::FileRecord;
use crate::ntfs::runlist::{ClusterRun, RunList};
use crate::ntfs::structs::*;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Largest $INDEX_ALLOCATION read in one go when rebuilding a directory from disk
const MAX_INDEX_ALLOCATION_BYTES: u64 = 64 * 1024 * 1024;

/// Read-only handle on the device being recovered.
///
/// The file handle sits behind a mutex: seek + read on a shared handle is not
/// atomic, and the reader is shared between the stage and its helpers.
pub struct DiskReader {
    file: Mutex<File>,
    path: PathBuf,
    len: u64,
}

impl DiskReader {
    /// Open a device or image file read-only
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        // Block devices report a zero metadata length; seeking to the end works for both
        let len = file.seek(SeekFrom::End(0))?;

        logging::info(
            "DISK",
            &format!("Opened {} ({} bytes)", path.display(), len),
        );

        Ok(Self {
            file: Mutex::new(file),
            path,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Device size in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fill `buffer` from the absolute byte offset. Short reads are errors.
    pub fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buffer))
            .map_err(|source| SalvageError::DeviceRead {
                offset,
                len: buffer.len(),
                source,
            })
    }

    /// Read whole sectors
    pub fn read_sectors(&self, sector: u64, count: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; count * SECTOR_SIZE];
        self.read_at(sector * SECTOR_SIZE as u64, &mut buffer)?;
        Ok(buffer)
    }

    /// Read whole clusters of the partition starting at `partition_origin`
    pub fn read_clusters(&self, partition_origin: u64, lcn: i64, count: usize) -> Result<Vec<u8>> {
        let offset = cluster_offset(partition_origin, lcn)
            .ok_or_else(|| SalvageError::InvalidArgument(format!("negative LCN {}", lcn)))?;
        let mut buffer = vec![0u8; count * CLUSTER_SIZE as usize];
        self.read_at(offset, &mut buffer)?;
        Ok(buffer)
    }

    /// Read and decode the FILE record at an absolute position
    pub fn read_file_record(&self, position: u64) -> Result<FileRecord> {
        let mut buffer = vec![0u8; FILE_RECORD_SIZE];
        self.read_at(position, &mut buffer)?;
        FileRecord::decode(&mut buffer).map_err(|e| e.at_position(position))
    }

    /// Read and decode the INDX block at an absolute position
    pub fn read_index_block(&self, position: u64) -> Result<IndexBlock> {
        let mut buffer = vec![0u8; INDEX_BLOCK_SIZE];
        self.read_at(position, &mut buffer)?;
        IndexBlock::decode(&mut buffer).map_err(|e| e.at_position(position))
    }

    /// Read the MFT slot `index` of a table, following the table's own run list.
    ///
    /// Returns the slot's absolute position with the decoded record.
    pub fn read_mft_record(
        &self,
        partition_origin: u64,
        mft_runs: &RunList,
        index: u64,
    ) -> Result<(u64, FileRecord)> {
        let position = mft_slot_position(partition_origin, mft_runs, index).ok_or_else(|| {
            SalvageError::unresolvable(0, format!("MFT slot {} is not mapped by the table", index))
        })?;
        if position + FILE_RECORD_SIZE as u64 > self.len {
            return Err(SalvageError::unresolvable(
                position,
                format!("MFT slot {} lies past the device end", index),
            ));
        }
        Ok((position, self.read_file_record(position)?))
    }

    /// Read a directory's $INDEX_ALLOCATION straight from its runs and scan its blocks
    pub fn read_index_allocation(&self, partition_origin: u64, runs: &RunList) -> Result<AllocationScan> {
        let total_bytes = (runs.total_clusters().max(0) as u64).saturating_mul(CLUSTER_SIZE);
        if total_bytes > MAX_INDEX_ALLOCATION_BYTES {
            return Err(SalvageError::unresolvable(
                0,
                format!("index allocation of {} bytes is implausible", total_bytes),
            ));
        }

        let mut data = vec![0u8; total_bytes as usize];
        for (vcn, run) in runs.with_vcns() {
            if run.is_sparse {
                continue;
            }
            let (offset, offset_end) = run_extent(partition_origin, run).ok_or_else(|| {
                SalvageError::malformed(
                    0,
                    format!("index run of {} clusters at LCN {} overflows", run.count, run.start),
                )
            })?;
            if offset_end > self.len {
                return Err(SalvageError::unresolvable(
                    0,
                    format!("index run at LCN {} lies outside the device", run.start),
                ));
            }
            let start = vcn as usize * CLUSTER_SIZE as usize;
            let end = start + (offset_end - offset) as usize;
            self.read_at(offset, &mut data[start..end])?;
        }

        Ok(parse_index_allocation(&mut data))
    }
}

/// Absolute byte offset of a cluster of the partition starting at `partition_origin`
pub fn cluster_offset(partition_origin: u64, lcn: i64) -> Option<u64> {
    u64::try_from(lcn)
        .ok()
        .and_then(|lcn| lcn.checked_mul(CLUSTER_SIZE))
        .and_then(|bytes| bytes.checked_add(partition_origin))
}

/// Device byte range `[start, end)` of a non-sparse run; `None` for sparse
/// runs and for counts or LCNs that overflow the device address space
pub fn run_extent(partition_origin: u64, run: &ClusterRun) -> Option<(u64, u64)> {
    if run.is_sparse {
        return None;
    }
    let start = cluster_offset(partition_origin, run.start)?;
    Some((start, start.checked_add(run.byte_len()?)?))
}

/// Absolute byte offset of MFT slot `index`, or `None` if the table does not map it
pub fn mft_slot_position(partition_origin: u64, mft_runs: &RunList, index: u64) -> Option<u64> {
    let vcn = index / RECORDS_PER_CLUSTER;
    let within = (index % RECORDS_PER_CLUSTER) * FILE_RECORD_SIZE as u64;
    let lcn = mft_runs.lcn_of_vcn(i64::try_from(vcn).ok()?)?;
    cluster_offset(partition_origin, lcn)?.checked_add(within)
}
