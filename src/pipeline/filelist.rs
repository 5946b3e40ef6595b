//! Tree-build stage ("make-filelist")

use super::{open_input, progress_bar, stream, PipelineConfig};
use crate::error::Result;
use crate::file_tree::{order_topologically, Extent, FileNode, NodeKind, LOST_FOUND_NAME};
use crate::logging;
use crate::ntfs::physical::run_extent;
use crate::ntfs::structs::{FileReference, ROOT_RECORD_INDEX};
use crate::state::{FileState, MftState};
use crate::store::{Record, RecordWriter, StoreKind};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

const MODULE: &str = "FILELIST";

/// Sequence given to a root nobody refers to
const DEFAULT_ROOT_SEQUENCE: u16 = 1;

/// Counters of one `make-filelist` run
#[derive(Debug, Clone, Default)]
pub struct FileListStats {
    pub files: u64,
    pub tables: u64,
    pub nodes: u64,
    /// Files whose parent is not in their table
    pub orphans: u64,
    /// Nodes moved to Lost+Found because no root reaches them
    pub reparented: u64,
    pub synthesized_roots: u64,
    pub duplicate_references: u64,
    /// Extra index-5 records of a table, dropped after the first
    pub duplicate_roots: u64,
    pub without_table: u64,
}

/// Build the nodes of one table: root, Lost+Found, then every file.
///
/// `ids` hands out node ids, unique across the whole list.
pub fn build_table_nodes(
    mft: &MftState,
    files: Vec<FileState>,
    ids: &mut impl FnMut() -> u64,
    stats: &mut FileListStats,
) -> Vec<FileNode> {
    let (roots, files): (Vec<FileState>, Vec<FileState>) = files
        .into_iter()
        .partition(|f| f.reference.index() == ROOT_RECORD_INDEX);

    let root_name = format!("mft{}", mft.id);
    let mut roots = roots.into_iter();
    let first_root = roots.next();
    for extra in roots {
        stats.duplicate_roots += 1;
        logging::warn(
            MODULE,
            &format!("Table {} has another root record {} at {}, dropped", mft.id, extra.reference, extra.position),
        );
    }
    let root = match first_root {
        Some(state) => {
            let mut node = file_node(ids(), mft, &state);
            node.kind = NodeKind::Root;
            node.name = root_name;
            node.is_directory = true;
            node
        }
        None => {
            let sequence = files
                .iter()
                .map(|f| f.parent_ref)
                .find(|p| p.index() == ROOT_RECORD_INDEX)
                .map_or(DEFAULT_ROOT_SEQUENCE, |p| p.sequence());
            stats.synthesized_roots += 1;
            logging::warn(MODULE, &format!("Table {} has no root record, synthesized", mft.id));
            synthetic_directory(
                ids(),
                None,
                mft.id,
                FileReference::new(sequence, ROOT_RECORD_INDEX),
                &root_name,
                NodeKind::Root,
            )
        }
    };

    let mut lost_found = synthetic_directory(
        ids(),
        Some(root.id),
        mft.id,
        FileReference::NULL,
        LOST_FOUND_NAME,
        NodeKind::LostFound,
    );
    lost_found.parent_ref = root.reference;

    let mut by_reference: HashMap<FileReference, u64> = HashMap::new();
    by_reference.insert(root.reference, root.id);

    let mut nodes: Vec<FileNode> = Vec::with_capacity(files.len() + 2);
    for file in &files {
        let node = file_node(ids(), mft, file);
        match by_reference.entry(file.reference) {
            Entry::Vacant(slot) => {
                slot.insert(node.id);
            }
            Entry::Occupied(_) => {
                stats.duplicate_references += 1;
                logging::warn(MODULE, &format!("Reference {} appears twice in table {}", file.reference, mft.id));
            }
        }
        nodes.push(node);
    }

    for node in &mut nodes {
        match by_reference.get(&node.parent_ref) {
            Some(&parent) if parent != node.id => node.parent_id = Some(parent),
            _ => {
                stats.orphans += 1;
                logging::debug(
                    MODULE,
                    &format!("'{}' {}: parent {} not found, placed in {}", node.name, node.reference, node.parent_ref, LOST_FOUND_NAME),
                );
                node.parent_id = Some(lost_found.id);
            }
        }
    }

    let mut out = Vec::with_capacity(nodes.len() + 2);
    out.push(root);
    out.push(lost_found);
    out.extend(nodes);
    out
}

/// Node for a placed file, data runs translated to device offsets
fn file_node(id: u64, mft: &MftState, file: &FileState) -> FileNode {
    let extents = if file.is_directory {
        Vec::new()
    } else {
        file.data_runs()
            .map(|runs| {
                runs.runs()
                    .iter()
                    .map(|run| {
                        let offset = run_extent(mft.partition_origin, run).map(|(start, _)| start);
                        if offset.is_none() && !run.is_sparse {
                            logging::warn(
                                MODULE,
                                &format!(
                                    "'{}' {}: run of {} clusters at LCN {} is unmappable, zero filled",
                                    file.name, file.reference, run.count, run.start
                                ),
                            );
                        }
                        Extent {
                            offset: offset.unwrap_or(0),
                            clusters: run.count.max(0) as u64,
                            sparse: offset.is_none(),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    FileNode {
        id,
        parent_id: None,
        mft_id: mft.id,
        reference: file.reference,
        parent_ref: file.parent_ref,
        name: file.name.clone(),
        size: if file.is_directory { 0 } else { file.size() },
        extents,
        resident_data: file.resident_data().map(<[u8]>::to_vec),
        is_directory: file.is_directory,
        kind: NodeKind::Regular,
        modified: file.modification_time(),
        tree_index: 0,
        parent_index: None,
    }
}

fn synthetic_directory(
    id: u64,
    parent_id: Option<u64>,
    mft_id: u32,
    reference: FileReference,
    name: &str,
    kind: NodeKind,
) -> FileNode {
    FileNode {
        id,
        parent_id,
        mft_id,
        reference,
        parent_ref: reference,
        name: name.to_string(),
        size: 0,
        extents: Vec::new(),
        resident_data: None,
        is_directory: true,
        kind,
        modified: 0,
        tree_index: 0,
        parent_index: None,
    }
}

/// Turn a completed store into the ordered file list
pub fn run_make_filelist(input: &Path, output: &Path, config: &PipelineConfig) -> Result<FileListStats> {
    logging::separator("MAKE-FILELIST");
    let store = open_input(input, StoreKind::Completed)?;
    let mut stats = FileListStats::default();

    let mut tables: BTreeMap<u32, MftState> = BTreeMap::new();
    let mut files: BTreeMap<u32, Vec<FileState>> = BTreeMap::new();

    let pb = progress_bar(config, store.len(), "Loading files");
    for item in stream(&store, config) {
        let item = item?;
        pb.inc(1);
        match item.record {
            Record::Mft(mft) => {
                tables.insert(mft.id, mft);
            }
            Record::File(file) => {
                stats.files += 1;
                match file.mft_id {
                    Some(id) => files.entry(id).or_default().push(file),
                    None => stats.without_table += 1,
                }
            }
            other => logging::warn(MODULE, &format!("Skipping {} record", other.kind_name())),
        }
    }
    pb.finish_and_clear();

    let mut last_id = 0u64;
    let mut next_id = || {
        last_id += 1;
        last_id
    };
    let mut nodes = Vec::new();
    for (id, mft) in &tables {
        stats.tables += 1;
        let table_files = files.remove(id).unwrap_or_default();
        nodes.extend(build_table_nodes(mft, table_files, &mut next_id, &mut stats));
    }
    for (id, dropped) in &files {
        stats.without_table += dropped.len() as u64;
        logging::warn(MODULE, &format!("{} files of unknown table {} dropped", dropped.len(), id));
    }

    let (ordered, reparented) = order_topologically(nodes);
    stats.reparented = reparented as u64;

    let mut writer = RecordWriter::create(output, StoreKind::FileList)?;
    for node in ordered {
        writer.append(&Record::Node(node))?;
    }
    stats.nodes = writer.close()? as u64;

    logging::info(
        MODULE,
        &format!(
            "File list: tables={} files={} nodes={} orphans={} reparented={} synthesized_roots={} duplicates={} duplicate_roots={} dropped_without_table={}",
            stats.tables,
            stats.files,
            stats.nodes,
            stats.orphans,
            stats.reparented,
            stats.synthesized_roots,
            stats.duplicate_references,
            stats.duplicate_roots,
            stats.without_table
        ),
    );
    logging::flush();
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::runlist::{ClusterRun, RunList};

    fn mft() -> MftState {
        MftState {
            id: 0,
            position: 4096 * 16 + 1_048_576,
            run_list: RunList::new(vec![ClusterRun::new(16, 4)]),
            partition_origin: 1_048_576,
        }
    }

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

    fn build(files: Vec<FileState>) -> (Vec<FileNode>, FileListStats) {
        let mut stats = FileListStats::default();
        let mut counter = 0;
        let mut ids = || {
            counter += 1;
            counter
        };
        let nodes = build_table_nodes(&mft(), files, &mut ids, &mut stats);
        (nodes, stats)
    }

    #[test]
    fn test_root_and_lost_found_come_first() {
        let root = FileReference::new(5, 5);
        let (nodes, stats) = build(vec![
            file(30, 1, "a.txt", root, false),
            file(5, 5, ".", root, true),
        ]);
        assert_eq!(stats.synthesized_roots, 0);
        assert_eq!(nodes[0].kind, NodeKind::Root);
        assert_eq!(nodes[0].name, "mft0");
        assert_eq!(nodes[0].parent_id, None);
        assert_eq!(nodes[1].kind, NodeKind::LostFound);
        assert_eq!(nodes[1].parent_id, Some(nodes[0].id));
        assert_eq!(nodes[2].parent_id, Some(nodes[0].id));
    }

    #[test]
    fn test_missing_root_takes_child_sequence() {
        let (nodes, stats) = build(vec![file(30, 1, "a.txt", FileReference::new(9, 5), false)]);
        assert_eq!(stats.synthesized_roots, 1);
        assert_eq!(nodes[0].reference, FileReference::new(9, 5));
        assert_eq!(nodes[2].parent_id, Some(nodes[0].id));
        assert_eq!(stats.orphans, 0);

        let (nodes, _) = build(vec![file(30, 1, "b.txt", FileReference::new(2, 77), false)]);
        assert_eq!(nodes[0].reference, FileReference::new(1, 5));
    }

    #[test]
    fn test_orphans_go_to_lost_found() {
        let root = FileReference::new(5, 5);
        let (nodes, stats) = build(vec![
            file(5, 5, ".", root, true),
            file(31, 1, "lost.txt", FileReference::new(4, 88), false),
            // Matching index but stale sequence
            file(32, 1, "stale.txt", FileReference::new(2, 40), false),
            file(40, 3, "docs", root, true),
        ]);
        assert_eq!(stats.orphans, 2);
        let lost_found = nodes[1].id;
        for name in ["lost.txt", "stale.txt"] {
            let n = nodes.iter().find(|n| n.name == name).unwrap();
            assert_eq!(n.parent_id, Some(lost_found));
        }
    }

    #[test]
    fn test_extra_roots_are_counted() {
        let root = FileReference::new(5, 5);
        let (nodes, stats) = build(vec![
            file(5, 5, ".", root, true),
            file(30, 1, "a.txt", root, false),
            file(5, 4, ".", root, true),
        ]);
        assert_eq!(stats.duplicate_roots, 1);
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].reference, root);
        assert_eq!(nodes[2].parent_id, Some(nodes[0].id));
    }

    #[test]
    fn test_first_duplicate_reference_wins() {
        let root = FileReference::new(5, 5);
        let docs = FileReference::new(2, 40);
        let (nodes, stats) = build(vec![
            file(5, 5, ".", root, true),
            file(40, 2, "docs", root, true),
            file(40, 2, "docs-copy", root, true),
            file(41, 1, "a.txt", docs, false),
        ]);
        assert_eq!(stats.duplicate_references, 1);

        let first = nodes.iter().find(|n| n.name == "docs").unwrap().id;
        let child = nodes.iter().find(|n| n.name == "a.txt").unwrap();
        assert_eq!(child.parent_id, Some(first));
        // The duplicate still gets a node
        assert!(nodes.iter().any(|n| n.name == "docs-copy"));
    }

    #[test]
    fn test_overflowing_data_run_becomes_sparse() {
        use crate::ntfs::record::{Attribute, AttributeBody};
        use crate::ntfs::structs::AttributeType;

        let mut f = file(30, 1, "broken.bin", FileReference::new(5, 5), false);
        f.attributes.push(Attribute {
            kind: AttributeType::Data,
            name: None,
            body: AttributeBody::NonResident {
                run_list: RunList::new(vec![ClusterRun::new(100, 1), ClusterRun::new(200, i64::MAX)]),
                lowest_vcn: 0,
                allocated_size: 8192,
                data_size: 8192,
                initialized_size: 8192,
            },
        });

        let (nodes, _) = build(vec![f]);
        let extents = &nodes[2].extents;
        assert_eq!(extents[0], Extent { offset: 1_048_576 + 100 * 4096, clusters: 1, sparse: false });
        assert!(extents[1].sparse);
        assert_eq!(extents[1].len(), u64::MAX);
    }

    #[test]
    fn test_extents_are_absolute() {
        use crate::ntfs::record::{Attribute, AttributeBody};
        use crate::ntfs::structs::AttributeType;

        let mut f = file(30, 1, "data.bin", FileReference::new(5, 5), false);
        f.attributes.push(Attribute {
            kind: AttributeType::Data,
            name: None,
            body: AttributeBody::NonResident {
                run_list: RunList::new(vec![ClusterRun::new(100, 2), ClusterRun::sparse(3)]),
                lowest_vcn: 0,
                allocated_size: 5 * 4096,
                data_size: 5 * 4096 - 10,
                initialized_size: 5 * 4096 - 10,
            },
        });

        let (nodes, _) = build(vec![f]);
        let node = &nodes[2];
        assert_eq!(node.size, 5 * 4096 - 10);
        assert_eq!(
            node.extents,
            vec![
                Extent { offset: 1_048_576 + 100 * 4096, clusters: 2, sparse: false },
                Extent { offset: 0, clusters: 3, sparse: true },
            ]
        );
    }
}
