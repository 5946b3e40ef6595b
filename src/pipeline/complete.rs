//! Completion stage ("complete")
//!
//! Gives every placed file its final name and parent. The $FILE_NAME pair
//! stored in the record is authoritative; directory index entries are the
//! fallback, and the referee when the stored parent's sequence number shows
//! that the parent slot has been reused since.

use super::{open_input, progress_bar, stream, PipelineConfig};
use crate::error::Result;
use crate::logging;
use crate::ntfs::index::DirectoryEntry;
use crate::ntfs::physical::DiskReader;
use crate::ntfs::structs::{FileReference, ROOT_RECORD_INDEX};
use crate::state::{FileState, MftState};
use crate::store::{Record, RecordWriter, StoreKind};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

const MODULE: &str = "COMPLETE";

/// Counters of one `complete` run
#[derive(Debug, Clone, Default)]
pub struct CompleteStats {
    pub tables: u64,
    pub files_in: u64,
    pub emitted: u64,
    /// Dropped: no accepted table to place them in
    pub without_mft: u64,
    pub unnamed: u64,
    /// Excluded because stored parent and directory entries disagree
    pub ambiguous: u64,
    /// Stale stored parent replaced by a directory entry
    pub stale_parent_fallbacks: u64,
    pub empty_directories_removed: u64,
    pub roots_found: u64,
    pub roots_read: u64,
    pub roots_missing: u64,
    pub directory_entries: u64,
    pub allocation_reads: u64,
    pub index_states_consumed: u64,
}

/// What a directory's index says about one child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Child reference as stored in the entry
    pub entry_ref: FileReference,
    pub name: String,
    /// Directory holding the entry
    pub owner: FileReference,
    pub long_name: bool,
}

/// Directory entries of one table, keyed by child record index
pub type EntryMap = HashMap<u64, EntryInfo>;

/// Outcome of resolving one file's (name, parent)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Stored $FILE_NAME pair
    Stored { name: String, parent: FileReference },
    /// Directory entry pair
    FromEntry { name: String, parent: FileReference },
    /// Parent and entries contradict each other
    Ambiguous,
    /// No name from anywhere
    Unnamed,
}

/// Per-table state built in the first pass
#[derive(Default)]
struct Table {
    mft: Option<MftState>,
    /// Directories keyed by record index
    directories: BTreeMap<u64, FileState>,
    /// Entries of matched Index States, keyed by owner
    owned_entries: HashMap<FileReference, Vec<DirectoryEntry>>,
    entries: EntryMap,
    /// Directories removed for having no entries
    removed: HashSet<FileReference>,
    /// Root read from the device, emitted ahead of the files
    read_root: Option<FileState>,
}

/// Resolve the (name, parent) of a placed file.
///
/// `directories` holds the table's directories by record index, `entries`
/// the table's directory entries by child record index.
pub fn resolve_file(file: &FileState, directories: &BTreeMap<u64, FileState>, entries: &EntryMap) -> Resolution {
    let entry = file.index().and_then(|i| entries.get(&i));

    if !file.name.is_empty() {
        let parent = file.parent_ref;
        return match directories.get(&parent.index()) {
            Some(dir) if dir.reference.sequence() != parent.sequence() => match entry {
                // The current occupant of the parent slot lists this file: kept
                Some(e) if e.owner == dir.reference => Resolution::FromEntry {
                    name: e.name.clone(),
                    parent: e.owner,
                },
                Some(e) if e.entry_ref.sequence() == file.sequence => Resolution::FromEntry {
                    name: e.name.clone(),
                    parent: e.owner,
                },
                _ => Resolution::Ambiguous,
            },
            _ => Resolution::Stored {
                name: file.name.clone(),
                parent,
            },
        };
    }

    match entry {
        Some(e) if e.entry_ref.sequence() == file.sequence => Resolution::FromEntry {
            name: e.name.clone(),
            parent: e.owner,
        },
        Some(_) => Resolution::Ambiguous,
        None => Resolution::Unnamed,
    }
}

/// Name every placed file and drop what cannot be placed
pub fn run_complete(disk: &DiskReader, input: &Path, output: &Path, config: &PipelineConfig) -> Result<CompleteStats> {
    logging::separator("COMPLETE");
    let store = open_input(input, StoreKind::Associated)?;
    let mut stats = CompleteStats::default();
    let mut tables: BTreeMap<u32, Table> = BTreeMap::new();

    // Pass 1: tables, directories and owned index entries
    let pb = progress_bar(config, store.len(), "Collecting directories");
    for item in stream(&store, config) {
        let item = item?;
        pb.inc(1);
        match item.record {
            Record::Mft(mft) => {
                let id = mft.id;
                tables.entry(id).or_default().mft = Some(mft);
            }
            Record::File(file) => {
                if let (Some(mft_id), Some(index), true) = (file.mft_id, file.index(), file.is_directory) {
                    tables.entry(mft_id).or_default().directories.insert(index, file);
                }
            }
            Record::Index(index) => {
                stats.index_states_consumed += 1;
                if let (Some(mft_id), true) = (index.mft_id, index.is_resolved()) {
                    tables
                        .entry(mft_id)
                        .or_default()
                        .owned_entries
                        .entry(index.reference)
                        .or_default()
                        .extend(index.entries);
                }
            }
            other => {
                logging::warn(MODULE, &format!("Skipping {} record", other.kind_name()));
            }
        }
    }
    pb.finish_and_clear();

    for (&id, table) in tables.iter_mut() {
        let Some(mft) = table.mft.clone() else {
            logging::warn(MODULE, &format!("Records reference unknown table {}", id));
            continue;
        };
        stats.tables += 1;
        resolve_root(disk, &mft, table, &mut stats)?;
        build_entries(disk, &mft, table, &mut stats)?;
    }

    // Pass 2: resolve and emit
    let mut writer = RecordWriter::create(output, StoreKind::Completed)?;
    for table in tables.values() {
        if let Some(mft) = &table.mft {
            writer.append(&Record::Mft(mft.clone()))?;
        }
    }
    for table in tables.values() {
        if let Some(root) = &table.read_root {
            writer.append(&Record::File(root.clone()))?;
            stats.emitted += 1;
        }
    }

    let pb = progress_bar(config, store.len(), "Resolving names");
    for item in stream(&store, config) {
        let item = item?;
        pb.inc(1);
        let Record::File(mut file) = item.record else {
            continue;
        };
        stats.files_in += 1;

        let Some(table) = file.mft_id.and_then(|id| tables.get(&id)).filter(|t| t.mft.is_some()) else {
            stats.without_mft += 1;
            logging::warn(MODULE, &format!("File at {} has no table, dropped", file.position));
            continue;
        };

        if table.removed.contains(&file.reference) {
            continue;
        }

        match resolve_file(&file, &table.directories, &table.entries) {
            Resolution::Stored { name, parent } => {
                file.name = name;
                file.parent_ref = parent;
            }
            Resolution::FromEntry { name, parent } => {
                if !file.name.is_empty() {
                    stats.stale_parent_fallbacks += 1;
                    logging::debug(
                        MODULE,
                        &format!("{} '{}': stale parent {}, using entry in {}", file.reference, file.name, file.parent_ref, parent),
                    );
                }
                file.name = name;
                file.parent_ref = parent;
            }
            Resolution::Ambiguous => {
                stats.ambiguous += 1;
                logging::warn(
                    MODULE,
                    &format!(
                        "{} '{}' excluded: parent {} and directory entries disagree",
                        file.reference, file.name, file.parent_ref
                    ),
                );
                continue;
            }
            Resolution::Unnamed => {
                stats.unnamed += 1;
                continue;
            }
        }

        if file.name.is_empty() {
            stats.unnamed += 1;
            continue;
        }

        writer.append(&Record::File(file))?;
        stats.emitted += 1;
    }
    pb.finish_and_clear();

    writer.close()?;

    logging::info(
        MODULE,
        &format!(
            "Completion: tables={} files={} emitted={} dropped_without_table={} unnamed={} ambiguous={} fallbacks={} empty_dirs={} roots found/read/missing={}/{}/{} entries={} allocation_reads={}",
            stats.tables,
            stats.files_in,
            stats.emitted,
            stats.without_mft,
            stats.unnamed,
            stats.ambiguous,
            stats.stale_parent_fallbacks,
            stats.empty_directories_removed,
            stats.roots_found,
            stats.roots_read,
            stats.roots_missing,
            stats.directory_entries,
            stats.allocation_reads
        ),
    );
    logging::flush();
    Ok(stats)
}

/// Find record 5 of a table, reading it through the table's runs if the scan missed it
fn resolve_root(disk: &DiskReader, mft: &MftState, table: &mut Table, stats: &mut CompleteStats) -> Result<()> {
    if table.directories.contains_key(&ROOT_RECORD_INDEX) {
        stats.roots_found += 1;
        return Ok(());
    }

    match disk.read_mft_record(mft.partition_origin, &mft.run_list, ROOT_RECORD_INDEX) {
        Ok((position, rec)) => {
            let mut root = FileState::from_record(position, rec);
            root.mft_id = Some(mft.id);
            root.reference = FileReference::new(root.sequence, ROOT_RECORD_INDEX);
            if !root.is_directory {
                stats.roots_missing += 1;
                logging::warn(MODULE, &format!("Record 5 of table {} is not a directory", mft.id));
                return Ok(());
            }
            logging::info(MODULE, &format!("Read root of table {} from {}", mft.id, position));
            stats.roots_read += 1;
            table.directories.insert(ROOT_RECORD_INDEX, root.clone());
            table.read_root = Some(root);
        }
        Err(e) if e.is_recoverable() => {
            stats.roots_missing += 1;
            logging::warn(MODULE, &format!("Root of table {} unreadable: {}", mft.id, e));
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Collect the directory entries of every directory of a table
fn build_entries(disk: &DiskReader, mft: &MftState, table: &mut Table, stats: &mut CompleteStats) -> Result<()> {
    for (&index, dir) in &table.directories {
        let mut entries: Vec<DirectoryEntry> = dir.index_root_entries().to_vec();

        match table.owned_entries.get(&dir.reference) {
            Some(owned) => entries.extend(owned.iter().cloned()),
            None => {
                if let Some(runs) = dir.index_allocation_runs() {
                    stats.allocation_reads += 1;
                    match disk.read_index_allocation(mft.partition_origin, runs) {
                        Ok(scan) => entries.extend(scan.entries),
                        Err(e) if e.is_recoverable() => {
                            logging::warn(MODULE, &format!("Index of {} unreadable: {}", dir.reference, e));
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        let mut accepted = 0u64;
        for entry in entries {
            if entry.file_ref.is_null() || entry.parent_ref != dir.reference {
                continue;
            }
            accepted += 1;

            let info = EntryInfo {
                entry_ref: entry.file_ref,
                long_name: entry.namespace.is_long_name(),
                name: entry.name,
                owner: dir.reference,
            };
            table
                .entries
                .entry(entry.file_ref.index())
                .and_modify(|existing| {
                    if !existing.long_name && info.long_name {
                        *existing = info.clone();
                    }
                })
                .or_insert(info);
        }

        stats.directory_entries += accepted;
        if accepted == 0 && index != ROOT_RECORD_INDEX {
            table.removed.insert(dir.reference);
            stats.empty_directories_removed += 1;
            logging::debug(MODULE, &format!("Directory {} '{}' has no entries, removed", dir.reference, dir.name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(index: u64, sequence: u16, name: &str, parent: FileReference, is_directory: bool) -> FileState {
        FileState {
            position: index * 1024,
            mft_id: Some(0),
            reference: FileReference::new(sequence, index),
            parent_ref: parent,
            name: name.into(),
            names: Vec::new(),
            attributes: Vec::new(),
            is_directory,
            sequence,
            in_use: true,
            record_number: index as u32,
        }
    }

    fn entry(child: FileReference, name: &str, owner: FileReference) -> EntryInfo {
        EntryInfo {
            entry_ref: child,
            name: name.into(),
            owner,
            long_name: true,
        }
    }

    fn directories() -> BTreeMap<u64, FileState> {
        let root = FileReference::new(5, 5);
        [
            file(5, 5, ".", root, true),
            file(40, 2, "docs", root, true),
            file(41, 7, "music", root, true),
        ]
        .into_iter()
        .map(|d| (d.reference.index(), d))
        .collect()
    }

    #[test]
    fn test_stored_pair_wins_when_consistent() {
        let f = file(50, 1, "a.txt", FileReference::new(2, 40), false);
        let entries: EntryMap = [(50, entry(FileReference::new(1, 50), "A.TXT", FileReference::new(7, 41)))].into();
        assert_eq!(
            resolve_file(&f, &directories(), &entries),
            Resolution::Stored {
                name: "a.txt".into(),
                parent: FileReference::new(2, 40)
            }
        );
    }

    #[test]
    fn test_stale_parent_without_entry_is_ambiguous() {
        let f = file(51, 1, "old.txt", FileReference::new(1, 40), false);
        assert_eq!(resolve_file(&f, &directories(), &EntryMap::new()), Resolution::Ambiguous);
    }

    #[test]
    fn test_stale_parent_listed_by_current_directory_is_kept() {
        // Entry reference carries another sequence, but its owner is the parent slot's directory
        let f = file(52, 3, "kept.txt", FileReference::new(1, 40), false);
        let entries: EntryMap = [(52, entry(FileReference::new(9, 52), "kept.txt", FileReference::new(2, 40)))].into();
        assert_eq!(
            resolve_file(&f, &directories(), &entries),
            Resolution::FromEntry {
                name: "kept.txt".into(),
                parent: FileReference::new(2, 40)
            }
        );
    }

    #[test]
    fn test_stale_parent_falls_back_on_matching_entry_sequence() {
        let f = file(53, 4, "moved.txt", FileReference::new(1, 40), false);
        let entries: EntryMap = [(53, entry(FileReference::new(4, 53), "moved.txt", FileReference::new(7, 41)))].into();
        assert_eq!(
            resolve_file(&f, &directories(), &entries),
            Resolution::FromEntry {
                name: "moved.txt".into(),
                parent: FileReference::new(7, 41)
            }
        );

        let mismatched: EntryMap = [(53, entry(FileReference::new(5, 53), "moved.txt", FileReference::new(7, 41)))].into();
        assert_eq!(resolve_file(&f, &directories(), &mismatched), Resolution::Ambiguous);
    }

    #[test]
    fn test_unnamed_file_uses_entry() {
        let f = file(54, 2, "", FileReference::NULL, false);
        let entries: EntryMap = [(54, entry(FileReference::new(2, 54), "found.bin", FileReference::new(7, 41)))].into();
        assert_eq!(
            resolve_file(&f, &directories(), &entries),
            Resolution::FromEntry {
                name: "found.bin".into(),
                parent: FileReference::new(7, 41)
            }
        );

        let stale: EntryMap = [(54, entry(FileReference::new(3, 54), "found.bin", FileReference::new(7, 41)))].into();
        assert_eq!(resolve_file(&f, &directories(), &stale), Resolution::Ambiguous);
        assert_eq!(resolve_file(&f, &directories(), &EntryMap::new()), Resolution::Unnamed);
    }

    #[test]
    fn test_parent_outside_directory_map_is_trusted() {
        let f = file(55, 1, "orphan.txt", FileReference::new(3, 999), false);
        assert!(matches!(
            resolve_file(&f, &directories(), &EntryMap::new()),
            Resolution::Stored { .. }
        ));
    }
}
