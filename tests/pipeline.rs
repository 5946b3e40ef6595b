mod common;

use common::*;
use ntfs_salvage::ntfs::{ClusterRun, FileReference, RunList};
use ntfs_salvage::{Extent, NodeKind, Record, RecordStore, StoreKind};

const DOCS_SLOT: u64 = 6;
const INDEX_LCN: u64 = 30;
const NOTES_LCN: u64 = 35;
const DATA_LCN: u64 = 40;

fn docs() -> FileReference {
    FileReference::new(1, DOCS_SLOT)
}

/// $MFT, root (5), "docs" (6) indexed through an INDX block, "notes.txt" (7)
/// with one cluster of non-resident data
fn basic_image() -> ImageBuilder {
    let mut image = ImageBuilder::new(64);
    let notes = FileReference::new(1, 7);
    let notes_data = Data::NonResident {
        runs: RunList::new(vec![ClusterRun::new(NOTES_LCN as i64, 1)]),
        size: 11,
    };

    image
        .put_record(&RecordDef::directory(5, 5, ".", ROOT).with_entry(docs(), "docs", true))
        .put_record(
            &RecordDef::directory(DOCS_SLOT, 1, "docs", ROOT)
                .with_allocation(RunList::new(vec![ClusterRun::new(INDEX_LCN as i64, 1)])),
        )
        .put_record(&RecordDef::file(7, 1, "notes.txt", docs(), notes_data))
        .put_clusters(NOTES_LCN, b"hello world")
        .put_index_block(INDEX_LCN, docs(), &[(notes, "notes.txt", false)]);
    image
}

/// Names of every file `complete` wrote; none may be empty
fn completed_names(run: &PipelineRun) -> Vec<String> {
    let store = RecordStore::open_kind(run.path("done.db"), StoreKind::Completed).unwrap();
    let names: Vec<String> = store
        .stream_from(0)
        .filter_map(|item| match item.unwrap().record {
            Record::File(file) => Some(file.name),
            _ => None,
        })
        .collect();
    assert!(names.iter().all(|n| !n.is_empty()), "unnamed file in {:?}", names);
    names
}

#[test]
fn test_minimal_volume_yields_four_nodes() {
    let run = PipelineRun::new(&basic_image());

    run.scan();
    let fill = run.fill();
    assert_eq!(fill.files, 4);
    assert_eq!(fill.indexes, 1);
    assert_eq!(fill.malformed, 0);

    let fix = run.fix_mft();
    assert_eq!(fix.mfts_accepted, 1);
    assert_eq!(fix.files_resolved, 3);
    assert_eq!(fix.indexes_matched, 1);

    let complete = run.complete();
    assert_eq!(complete.emitted, 3);
    assert_eq!(complete.roots_found, 1);
    assert_eq!(complete.ambiguous, 0);
    assert_eq!(complete.empty_directories_removed, 0);
    let mut names = completed_names(&run);
    names.sort();
    assert_eq!(names, vec![".", "docs", "notes.txt"]);

    let filelist = run.make_filelist();
    assert_eq!(filelist.nodes, 4);
    assert_eq!(filelist.orphans, 0);
    assert_eq!(filelist.synthesized_roots, 0);

    let tree = run.tree();
    assert_eq!(tree.len(), 4);
    let notes = tree.resolve("/mft0/docs/notes.txt").unwrap().unwrap();
    let parent = tree.node(notes).parent_index.unwrap();
    assert_eq!(tree.node(parent).name, "docs");
    assert_eq!(tree.node(notes).size, 11);
    assert!(tree.node(notes).resident_data.is_none());
    assert_eq!(
        tree.node(notes).extents,
        vec![Extent { offset: ORIGIN + NOTES_LCN * CLUSTER, clusters: 1, sparse: false }]
    );
    assert!(tree.resolve("/mft0/Lost+Found").unwrap().is_some());

    let dest = tempfile::TempDir::new().unwrap();
    tree.copy_out(&run.disk(), "/mft0/docs/notes.txt", dest.path()).unwrap();
    assert_eq!(std::fs::read(dest.path().join("notes.txt")).unwrap(), b"hello world");
}

#[test]
fn test_record_outside_every_table_stays_unresolved() {
    let mut image = basic_image();
    // Partition cluster 50 is not mapped by the $MFT
    image.put_record_at(50 * CLUSTER, &RecordDef::file(9, 1, "stray.txt", ROOT, Data::None));

    let run = PipelineRun::new(&image);
    run.scan();
    assert_eq!(run.fill().files, 5);
    let fix = run.fix_mft();
    assert_eq!(fix.files_resolved, 3);
    assert_eq!(fix.files_unresolved, 1);

    let associated = RecordStore::open_kind(run.path("assoc.db"), StoreKind::Associated).unwrap();
    let stray = associated
        .stream_from(0)
        .find_map(|item| match item.unwrap().record {
            Record::File(file) if file.name == "stray.txt" => Some(file),
            _ => None,
        })
        .unwrap();
    assert_eq!(stray.mft_id, None);
    assert!(stray.reference.is_null());
    assert_eq!(stray.position, ORIGIN + 50 * CLUSTER);

    let complete = run.complete();
    assert_eq!(complete.without_mft, 1);
    assert!(!completed_names(&run).contains(&"stray.txt".to_string()));
}

#[test]
fn test_overlapping_tables_first_claimant_wins() {
    let mut image = basic_image();
    // Second partition 8 clusters further in. Its $MFT sits at its LCN 12
    // (partition cluster 20) and its second run covers all of table 0.
    let second_origin = 8 * CLUSTER;
    let runs = RunList::new(vec![ClusterRun::new(12, 2), ClusterRun::new(8, 4)]);
    image.put_record_at(
        second_origin + 12 * CLUSTER,
        &RecordDef::file(0, 1, "$MFT", ROOT, Data::NonResident { runs, size: 6 * CLUSTER }),
    );

    let run = PipelineRun::new(&image);
    run.scan();
    run.fill();
    let fix = run.fix_mft();
    assert_eq!(fix.mfts_accepted, 2);
    assert_eq!(fix.overlapping_bytes, 4 * CLUSTER);
    // Records in the shared clusters stay with table 0
    assert_eq!(fix.files_resolved, 3);

    let complete = run.complete();
    assert_eq!(complete.tables, 2);
    run.make_filelist();

    let tree = run.tree();
    let notes = tree.resolve("/mft0/docs/notes.txt").unwrap().unwrap();
    assert_eq!(tree.node(notes).mft_id, 0);
    let second_root = tree.resolve("/mft1").unwrap().unwrap();
    assert!(tree.children(Some(second_root)).iter().all(|&c| tree.node(c).kind == NodeKind::LostFound));
}

#[test]
fn test_tree_is_ordered_ancestors_first() {
    let run = PipelineRun::new(&basic_image());
    run.run_to_complete();
    run.make_filelist();

    let tree = run.tree();
    for node in tree.nodes() {
        match node.parent_index {
            Some(p) => assert!(p < node.tree_index, "{} listed before its parent", node.name),
            None => assert_eq!(node.kind, NodeKind::Root),
        }
    }
}

#[test]
fn test_stale_parent_sequence_is_excluded() {
    let mut image = basic_image();
    // Parent slot 6 once held a directory with sequence 3; nothing lists this file now
    image.put_record(&RecordDef::file(8, 1, "old.txt", FileReference::new(3, DOCS_SLOT), Data::None));

    let run = PipelineRun::new(&image);
    let stats = run.run_to_complete();

    assert_eq!(stats.ambiguous, 1);
    let names = completed_names(&run);
    assert!(names.contains(&"notes.txt".to_string()));
    assert!(!names.contains(&"old.txt".to_string()));
}

#[test]
fn test_stale_parent_listed_by_directory_is_kept() {
    let mut image = ImageBuilder::new(64);
    let moved = FileReference::new(2, 9);
    image
        .put_record(&RecordDef::directory(5, 5, ".", ROOT).with_entry(docs(), "docs", true))
        .put_record(&RecordDef::directory(DOCS_SLOT, 1, "docs", ROOT).with_entry(moved, "moved.txt", false))
        .put_record(&RecordDef::file(9, 2, "moved.txt", FileReference::new(4, DOCS_SLOT), Data::None));

    let run = PipelineRun::new(&image);
    let stats = run.run_to_complete();
    assert_eq!(stats.ambiguous, 0);
    assert_eq!(stats.stale_parent_fallbacks, 1);

    run.make_filelist();
    let tree = run.tree();
    assert!(tree.resolve("/mft0/docs/moved.txt").unwrap().is_some());
}

#[test]
fn test_orphan_goes_to_lost_found() {
    let mut image = basic_image();
    // Slot 12 was never written
    image.put_record(&RecordDef::file(10, 1, "lonely.bin", FileReference::new(1, 12), Data::None));

    let run = PipelineRun::new(&image);
    run.run_to_complete();
    let stats = run.make_filelist();
    assert_eq!(stats.orphans, 1);

    let tree = run.tree();
    let lonely = tree.resolve("/mft0/Lost+Found/lonely.bin").unwrap().unwrap();
    let parent = tree.node(lonely).parent_index.unwrap();
    assert_eq!(tree.node(parent).kind, NodeKind::LostFound);
}

#[test]
fn test_empty_directory_is_removed() {
    let mut image = basic_image();
    image.put_record(&RecordDef::directory(11, 1, "empty", ROOT));

    let run = PipelineRun::new(&image);
    let stats = run.run_to_complete();
    assert_eq!(stats.empty_directories_removed, 1);
    assert!(!completed_names(&run).contains(&"empty".to_string()));
}

#[test]
fn test_missing_root_is_read_from_disk() {
    let mut image = basic_image();
    image.put_record(&RecordDef::file(12, 1, "extra.txt", ROOT, Data::None));
    let run = PipelineRun::new(&image);

    run.scan();
    run.fill();
    // The root stays on disk but is missing from the filled store
    let filled = RecordStore::open_kind(run.path("filled.db"), StoreKind::Filled).unwrap();
    let mut writer = ntfs_salvage::RecordWriter::create(run.path("filled2.db"), StoreKind::Filled).unwrap();
    for item in filled.stream_from(0) {
        let record = item.unwrap().record;
        if let Record::File(file) = &record {
            if file.name == "." {
                continue;
            }
        }
        writer.append(&record).unwrap();
    }
    writer.close().unwrap();
    drop(filled);
    std::fs::rename(run.path("filled2.db"), run.path("filled.db")).unwrap();

    run.fix_mft();
    let stats = run.complete();
    assert_eq!(stats.roots_found, 0);
    assert_eq!(stats.roots_read, 1);

    let filelist = run.make_filelist();
    assert_eq!(filelist.synthesized_roots, 0);
    let tree = run.tree();
    assert!(tree.resolve("/mft0/docs/notes.txt").unwrap().is_some());
    assert!(tree.resolve("/mft0/extra.txt").unwrap().is_some());
}

#[test]
fn test_copy_out_honours_sparse_runs_and_size() {
    let mut image = basic_image();
    let pattern: Vec<u8> = (0..2 * CLUSTER as usize).map(|i| (i % 251) as u8).collect();
    let runs = RunList::new(vec![ClusterRun::new(DATA_LCN as i64, 2), ClusterRun::sparse(1)]);
    image
        .put_clusters(DATA_LCN, &pattern)
        .put_record(&RecordDef::file(13, 1, "big.bin", ROOT, Data::NonResident { runs, size: 9000 }));

    let run = PipelineRun::new(&image);
    run.run_to_complete();
    run.make_filelist();

    let tree = run.tree();
    let dest = tempfile::TempDir::new().unwrap();
    let stats = tree.copy_out(&run.disk(), "/mft0/big.bin", dest.path()).unwrap();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.bytes, 9000);
    assert_eq!(stats.sparse_bytes, 9000 - 8192);

    let copied = std::fs::read(dest.path().join("big.bin")).unwrap();
    assert_eq!(copied.len(), 9000);
    assert_eq!(&copied[..8192], &pattern[..]);
    assert!(copied[8192..].iter().all(|&b| b == 0));

    let stats = tree.copy_out(&run.disk(), "/mft0/docs", dest.path()).unwrap();
    assert_eq!(stats.directories, 1);
    assert_eq!(std::fs::read(dest.path().join("docs").join("notes.txt")).unwrap(), b"hello world");
}

#[test]
fn test_edits_survive_save_and_load() {
    let run = PipelineRun::new(&basic_image());
    run.run_to_complete();
    run.make_filelist();

    let mut tree = run.tree();
    tree.make_directory("/mft0/keep").unwrap();
    tree.move_node("/mft0/docs/notes.txt", "/mft0/keep").unwrap();
    tree.remove("/mft0/docs").unwrap();
    tree.save(run.path("files.db")).unwrap();

    let tree = run.tree();
    assert!(tree.resolve("/mft0/docs").is_err());
    let notes = tree.resolve("/mft0/keep/notes.txt").unwrap().unwrap();
    assert!(tree.node(notes).parent_index.unwrap() < notes);
}
