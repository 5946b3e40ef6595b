//! MFT association stage ("fix-mft")
//!
//! Finds the $MFT records that describe a whole table, works out where each
//! table's partition starts, and places every other FILE record into a slot
//! of a table. Directories' index allocations are mapped back to their owner
//! so INDX blocks found by the scanner can be attributed.
//!
//! Three passes over the input: tables, then files, then index blocks.

use super::{open_input, progress_bar, stream, ExtentMap, PipelineConfig};
use crate::error::{Result, SalvageError};
use crate::logging;
use crate::ntfs::physical::{cluster_offset, run_extent};
use crate::ntfs::structs::*;
use crate::state::{FileState, IndexState, MftState};
use crate::store::{Record, RecordStore, RecordWriter, StoreKind};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

const MODULE: &str = "FIX-MFT";

/// Counters of one `fix-mft` run
#[derive(Debug, Clone, Default)]
pub struct FixMftStats {
    pub files_in: u64,
    pub indexes_in: u64,
    pub mft_candidates: u64,
    pub mfts_accepted: u64,
    pub mfts_rejected: u64,
    /// Bytes of table runs already claimed by an earlier table
    pub overlapping_bytes: u64,
    pub files_resolved: u64,
    pub files_unresolved: u64,
    pub files_misaligned: u64,
    pub indexes_matched: u64,
    pub indexes_rejected: u64,
    pub indexes_unmatched: u64,
}

/// One run of a table, as registered in the position map
#[derive(Debug, Clone, Copy)]
struct TableRun {
    mft_id: u32,
    origin: u64,
    run_lcn: i64,
    vcn_base: i64,
}

/// Owner of a directory index byte range
#[derive(Debug, Clone, Copy)]
struct IndexOwner {
    mft_id: u32,
    reference: FileReference,
}

/// Accept a `$MFT` file state as table `id`.
///
/// The partition origin is derived from the record's own position and the
/// first run of its $DATA; it must be non-negative and sector aligned.
pub fn accept_mft(file: &FileState, id: u32) -> Result<MftState> {
    let runs = file
        .data_runs()
        .ok_or_else(|| SalvageError::unresolvable(file.position, "$MFT has no non-resident $DATA"))?;
    let first = runs
        .first()
        .ok_or_else(|| SalvageError::unresolvable(file.position, "$MFT run list is empty"))?;
    if first.is_sparse {
        return Err(SalvageError::unresolvable(file.position, "$MFT starts with a sparse run"));
    }

    let first_offset = (first.start as i128) * CLUSTER_SIZE as i128;
    let origin = file.position as i128 - first_offset;
    if origin < 0 {
        return Err(SalvageError::unresolvable(
            file.position,
            format!("first run at LCN {} puts the partition before the device start", first.start),
        ));
    }
    if origin % SECTOR_SIZE as i128 != 0 {
        return Err(SalvageError::unresolvable(
            file.position,
            format!("partition origin {} is not sector aligned", origin),
        ));
    }
    let origin = origin as u64;
    if cluster_offset(origin, first.start) != Some(file.position) {
        return Err(SalvageError::unresolvable(file.position, "$MFT is not the first slot of its own table"));
    }
    if runs.byte_len().is_none() {
        return Err(SalvageError::malformed(file.position, "$MFT run counts overflow"));
    }
    if let Some(run) = runs
        .runs()
        .iter()
        .find(|run| !run.is_sparse && run_extent(origin, run).is_none())
    {
        return Err(SalvageError::malformed(
            file.position,
            format!("$MFT run of {} clusters at LCN {} lies past the address space", run.count, run.start),
        ));
    }

    Ok(MftState {
        id,
        position: file.position,
        run_list: runs.clone(),
        partition_origin: origin,
    })
}

/// Place raw File and Index states into their tables
pub fn run_fix_mft(input: &Path, output: &Path, config: &PipelineConfig) -> Result<FixMftStats> {
    logging::separator("FIX-MFT");
    let store = open_input(input, StoreKind::Filled)?;
    let mut writer = RecordWriter::create(output, StoreKind::Associated)?;
    let mut stats = FixMftStats::default();

    // Pass 1: tables
    let tables = find_tables(&store, config, &mut stats)?;
    let mut positions: ExtentMap<TableRun> = ExtentMap::new();
    for mft in &tables {
        register_table(mft, &mut positions, &mut stats);
        writer.append(&Record::Mft(mft.clone()))?;
    }
    let table_positions: HashSet<u64> = tables.iter().map(|t| t.position).collect();

    // Pass 2: files
    let mut owners: ExtentMap<IndexOwner> = ExtentMap::new();
    let mut known_names: HashMap<(u32, FileReference), HashSet<String>> = HashMap::new();

    let pb = progress_bar(config, store.len(), "Placing files");
    for item in stream(&store, config) {
        let item = item?;
        pb.inc(1);
        let Record::File(mut file) = item.record else {
            continue;
        };
        stats.files_in += 1;
        if table_positions.contains(&file.position) {
            continue;
        }

        match positions.get(file.position).copied() {
            None => {
                stats.files_unresolved += 1;
                logging::debug(MODULE, &format!("File at {} is outside every table", file.position));
            }
            Some(run) => match slot_index(file.position, &run) {
                Some(index) => {
                    file.mft_id = Some(run.mft_id);
                    file.reference = FileReference::new(file.sequence, index);
                    stats.files_resolved += 1;

                    if file.record_number != 0 && file.record_number as u64 != index {
                        logging::debug(
                            MODULE,
                            &format!(
                                "File at {} claims slot {} but sits in slot {}",
                                file.position, file.record_number, index
                            ),
                        );
                    }

                    for name in &file.names {
                        known_names
                            .entry((run.mft_id, name.parent_reference))
                            .or_default()
                            .insert(name.name.clone());
                    }

                    if file.is_directory {
                        register_index_owner(&file, run.mft_id, run.origin, &mut owners);
                    }
                }
                None => {
                    stats.files_misaligned += 1;
                    logging::warn(
                        MODULE,
                        &format!(
                            "File at {} is not on a record boundary of table {}, dropped",
                            file.position, run.mft_id
                        ),
                    );
                    continue;
                }
            },
        }

        writer.append(&Record::File(file))?;
    }
    pb.finish_and_clear();

    // Pass 3: index blocks
    let pb = progress_bar(config, store.len(), "Matching index blocks");
    for item in stream(&store, config) {
        let item = item?;
        pb.inc(1);
        let Record::Index(mut index) = item.record else {
            continue;
        };
        stats.indexes_in += 1;

        match owners.get(index.position).copied() {
            None => {
                stats.indexes_unmatched += 1;
            }
            Some(owner) => {
                let names = known_names.get(&(owner.mft_id, owner.reference));
                if index_belongs_to(&index, owner.reference, names) {
                    index.mft_id = Some(owner.mft_id);
                    index.reference = owner.reference;
                    stats.indexes_matched += 1;
                } else {
                    stats.indexes_rejected += 1;
                    logging::warn(
                        MODULE,
                        &format!(
                            "Index block at {} lies in directory {} but its entries disagree",
                            index.position, owner.reference
                        ),
                    );
                }
            }
        }

        writer.append(&Record::Index(index))?;
    }
    pb.finish_and_clear();

    writer.close()?;

    logging::info(
        MODULE,
        &format!(
            "Association complete: tables={}/{} files={} resolved={} unresolved={} misaligned={} indexes={} matched={} rejected={} unmatched={} overlap_bytes={}",
            stats.mfts_accepted,
            stats.mft_candidates,
            stats.files_in,
            stats.files_resolved,
            stats.files_unresolved,
            stats.files_misaligned,
            stats.indexes_in,
            stats.indexes_matched,
            stats.indexes_rejected,
            stats.indexes_unmatched,
            stats.overlapping_bytes
        ),
    );
    logging::flush();
    Ok(stats)
}

fn find_tables(store: &Arc<RecordStore>, config: &PipelineConfig, stats: &mut FixMftStats) -> Result<Vec<MftState>> {
    let mut tables = Vec::new();
    let pb = progress_bar(config, store.len(), "Looking for $MFT records");

    for item in stream(store, config) {
        let item = item?;
        pb.inc(1);
        let Record::File(file) = item.record else {
            continue;
        };
        if !file.is_mft_candidate() {
            continue;
        }

        stats.mft_candidates += 1;
        match accept_mft(&file, tables.len() as u32) {
            Ok(mft) => {
                logging::info(
                    MODULE,
                    &format!(
                        "Table {}: $MFT at {}, partition origin {}, {} slots",
                        mft.id,
                        mft.position,
                        mft.partition_origin,
                        mft.slot_count().unwrap_or_default()
                    ),
                );
                tables.push(mft);
            }
            Err(e) => {
                stats.mfts_rejected += 1;
                logging::warn(MODULE, &e.to_string());
            }
        }
    }

    pb.finish_and_clear();
    stats.mfts_accepted = tables.len() as u64;
    Ok(tables)
}

fn register_table(mft: &MftState, positions: &mut ExtentMap<TableRun>, stats: &mut FixMftStats) {
    for (vcn_base, run) in mft.run_list.with_vcns() {
        if run.is_sparse {
            continue;
        }
        let Some((start, end)) = run_extent(mft.partition_origin, run) else {
            logging::warn(
                MODULE,
                &format!("Table {} run of {} clusters at LCN {} overflows, skipped", mft.id, run.count, run.start),
            );
            continue;
        };

        let overlap = positions.insert(
            start,
            end,
            TableRun {
                mft_id: mft.id,
                origin: mft.partition_origin,
                run_lcn: run.start,
                vcn_base,
            },
        );
        if overlap > 0 {
            stats.overlapping_bytes += overlap;
            logging::warn(
                MODULE,
                &format!(
                    "Table {} run at LCN {} overlaps an earlier table by {} bytes",
                    mft.id, run.start, overlap
                ),
            );
        }
    }
}

fn register_index_owner(dir: &FileState, mft_id: u32, origin: u64, owners: &mut ExtentMap<IndexOwner>) {
    let Some(runs) = dir.index_allocation_runs() else {
        return;
    };
    let owner = IndexOwner {
        mft_id,
        reference: dir.reference,
    };

    for run in runs.runs() {
        if run.is_sparse {
            continue;
        }
        let Some((start, end)) = run_extent(origin, run) else {
            logging::warn(
                MODULE,
                &format!(
                    "Index allocation of {} has a run of {} clusters at LCN {} that overflows, skipped",
                    dir.reference, run.count, run.start
                ),
            );
            continue;
        };
        let overlap = owners.insert(start, end, owner);
        if overlap > 0 {
            logging::debug(
                MODULE,
                &format!("Index allocation of {} overlaps another directory by {} bytes", dir.reference, overlap),
            );
        }
    }
}

/// Slot index of the record at `position` within a table run, or `None`
/// when the position is not on a 1024-byte record boundary.
fn slot_index(position: u64, run: &TableRun) -> Option<u64> {
    let relative = position.checked_sub(run.origin)?;
    let lcn = (relative / CLUSTER_SIZE) as i64;
    let within = relative % CLUSTER_SIZE;
    if within % FILE_RECORD_SIZE as u64 != 0 {
        return None;
    }
    let vcn = lcn - run.run_lcn + run.vcn_base;
    u64::try_from(vcn)
        .ok()
        .map(|vcn| vcn * RECORDS_PER_CLUSTER + within / FILE_RECORD_SIZE as u64)
}

/// Every entry must name the owner as its parent, and every entry name must
/// be one of the names known to point at the owner (no known names: any).
fn index_belongs_to(index: &IndexState, owner: FileReference, known: Option<&HashSet<String>>) -> bool {
    if index.entries.iter().any(|e| e.parent_ref != owner) {
        return false;
    }
    match known {
        Some(names) if !names.is_empty() => index.entries.iter().all(|e| names.contains(&e.name)),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::index::DirectoryEntry;
    use crate::ntfs::record::{Attribute, AttributeBody};
    use crate::ntfs::runlist::{ClusterRun, RunList};

    fn mft_file(position: u64, runs: Vec<ClusterRun>) -> FileState {
        FileState {
            position,
            mft_id: None,
            reference: FileReference::NULL,
            parent_ref: FileReference::new(5, 5),
            name: "$MFT".into(),
            names: Vec::new(),
            attributes: vec![Attribute {
                kind: AttributeType::Data,
                name: None,
                body: AttributeBody::NonResident {
                    run_list: RunList::new(runs),
                    lowest_vcn: 0,
                    allocated_size: 0,
                    data_size: 0,
                    initialized_size: 0,
                },
            }],
            is_directory: false,
            sequence: 1,
            in_use: true,
            record_number: 0,
        }
    }

    fn entry(parent: FileReference, name: &str) -> DirectoryEntry {
        DirectoryEntry {
            file_ref: FileReference::new(1, 40),
            parent_ref: parent,
            name: name.into(),
            namespace: FilenameNamespace::Win32,
            flags: 0,
            vcn: None,
            is_directory: false,
            data_size: 0,
        }
    }

    #[test]
    fn test_accept_mft_origin() {
        let origin = 1024 * 1024;
        let mft = accept_mft(&mft_file(origin + 16 * 4096, vec![ClusterRun::new(16, 8)]), 3).unwrap();
        assert_eq!(mft.partition_origin, origin);
        assert_eq!(mft.id, 3);
    }

    #[test]
    fn test_reject_impossible_tables() {
        // Origin would be negative
        assert!(accept_mft(&mft_file(4096, vec![ClusterRun::new(16, 8)]), 0).is_err());
        // Origin not sector aligned
        assert!(accept_mft(&mft_file(16 * 4096 + 100, vec![ClusterRun::new(16, 8)]), 0).is_err());
        // Sparse first run
        assert!(accept_mft(&mft_file(16 * 4096, vec![ClusterRun::sparse(8)]), 0).is_err());
    }

    #[test]
    fn test_reject_table_with_overflowing_runs() {
        let origin = 1024 * 1024;
        let huge = RunList::decode(&RunList::new(vec![ClusterRun::new(16, i64::MAX)]).encode()).unwrap();
        let err = accept_mft(&mft_file(origin + 16 * 4096, huge.runs().to_vec()), 0).unwrap_err();
        assert!(matches!(err, SalvageError::MalformedRecord { .. }));
        assert!(err.is_recoverable());

        // Each run fits, their sum does not
        let split = vec![ClusterRun::new(16, 1 << 51), ClusterRun::new(32, 1 << 51)];
        assert!(accept_mft(&mft_file(origin + 16 * 4096, split), 0).is_err());
    }

    #[test]
    fn test_register_table_skips_overflowing_run() {
        let mft = MftState {
            id: 0,
            position: 16 * 4096,
            run_list: RunList::new(vec![ClusterRun::new(16, 2), ClusterRun::new(64, i64::MAX)]),
            partition_origin: 0,
        };
        let mut positions = ExtentMap::new();
        let mut stats = FixMftStats::default();
        register_table(&mft, &mut positions, &mut stats);

        assert_eq!(positions.len(), 1);
        assert!(positions.get(17 * 4096).is_some());
        assert!(positions.get(64 * 4096).is_none());
        assert_eq!(stats.overlapping_bytes, 0);
    }

    #[test]
    fn test_register_index_owner_skips_overflowing_run() {
        let mut dir = mft_file(40 * 1024, vec![ClusterRun::new(16, 1 << 60), ClusterRun::new(90, 1)]);
        dir.name = "docs".into();
        dir.is_directory = true;
        dir.reference = FileReference::new(2, 40);
        dir.attributes[0].kind = AttributeType::IndexAllocation;
        dir.attributes[0].name = Some(I30_NAME.into());

        let mut owners = ExtentMap::new();
        register_index_owner(&dir, 0, 0, &mut owners);

        assert_eq!(owners.len(), 1);
        assert_eq!(owners.get(90 * 4096).map(|o| o.reference), Some(dir.reference));
        assert!(owners.get(16 * 4096).is_none());
    }

    #[test]
    fn test_slot_index_arithmetic() {
        let run = TableRun {
            mft_id: 0,
            origin: 512,
            run_lcn: 100,
            vcn_base: 8,
        };
        let at = |lcn: u64, within: u64| 512 + lcn * 4096 + within;
        assert_eq!(slot_index(at(100, 0), &run), Some(32));
        assert_eq!(slot_index(at(101, 3072), &run), Some(39));
        assert_eq!(slot_index(at(101, 512), &run), None);
    }

    #[test]
    fn test_index_validation() {
        let owner = FileReference::new(2, 64);
        let block = IndexState {
            position: 0,
            mft_id: None,
            reference: FileReference::NULL,
            parent_ref: owner,
            vcn: 0,
            entries: vec![entry(owner, "a.txt"), entry(owner, "b.txt")],
        };

        assert!(index_belongs_to(&block, owner, None));
        assert!(index_belongs_to(&block, owner, Some(&HashSet::new())));

        let names: HashSet<String> = ["a.txt", "b.txt", "c.txt"].iter().map(|s| s.to_string()).collect();
        assert!(index_belongs_to(&block, owner, Some(&names)));

        let partial: HashSet<String> = ["a.txt"].iter().map(|s| s.to_string()).collect();
        assert!(!index_belongs_to(&block, owner, Some(&partial)));

        // Stale owner sequence
        assert!(!index_belongs_to(&block, FileReference::new(3, 64), None));
    }
}
