//! Synthetic NTFS images for the integration tests
//!
//! Builds just enough of a volume for the pipeline: protected FILE records
//! at their MFT slots, INDX blocks and raw data clusters, all placed
//! relative to a partition origin inside the image.

#![allow(dead_code)]

use ntfs_salvage::ntfs::fixup::{protect, UpdateSequence};
use ntfs_salvage::ntfs::structs::{
    file_attributes, ATTRIBUTE_END_MARKER, FILE_NAME_HEADER_LEN, FILE_RECORD_SIZE, INDEX_BLOCK_SIZE,
    INDEX_ENTRY_LAST, INDX_HEADER_OFFSET, MFT_RECORD_IN_USE, MFT_RECORD_IS_DIRECTORY,
};
use ntfs_salvage::ntfs::{ClusterRun, FileReference, RunList};
use ntfs_salvage::pipeline::{self, PipelineConfig};
use ntfs_salvage::scanner::{self, ScanConfig};
use ntfs_salvage::{DiskReader, FileTree};
use std::io::Write;
use std::path::PathBuf;
use tempfile::{NamedTempFile, TempDir};

pub const CLUSTER: u64 = 4096;
pub const ORIGIN: u64 = 1024 * 1024;
pub const MFT_LCN: i64 = 16;
pub const MFT_CLUSTERS: i64 = 4;

/// Reference of the root directory used by the images
pub const ROOT: FileReference = FileReference::new(5, 5);

/// Contents of the unnamed $DATA stream
pub enum Data {
    None,
    Resident(Vec<u8>),
    NonResident { runs: RunList, size: u64 },
}

/// One FILE record to place in the MFT
pub struct RecordDef {
    pub slot: u64,
    pub sequence: u16,
    pub directory: bool,
    pub name: String,
    pub parent: FileReference,
    pub data: Data,
    /// Resident $INDEX_ROOT entries: (child, name, child is directory)
    pub index_entries: Vec<(FileReference, String, bool)>,
    /// Runs of $INDEX_ALLOCATION
    pub index_allocation: Option<RunList>,
}

impl RecordDef {
    pub fn file(slot: u64, sequence: u16, name: &str, parent: FileReference, data: Data) -> Self {
        Self {
            slot,
            sequence,
            directory: false,
            name: name.to_string(),
            parent,
            data,
            index_entries: Vec::new(),
            index_allocation: None,
        }
    }

    pub fn directory(slot: u64, sequence: u16, name: &str, parent: FileReference) -> Self {
        Self {
            directory: true,
            ..Self::file(slot, sequence, name, parent, Data::None)
        }
    }

    pub fn with_entry(mut self, child: FileReference, name: &str, directory: bool) -> Self {
        self.index_entries.push((child, name.to_string(), directory));
        self
    }

    pub fn with_allocation(mut self, runs: RunList) -> Self {
        self.index_allocation = Some(runs);
        self
    }

    pub fn reference(&self) -> FileReference {
        FileReference::new(self.sequence, self.slot)
    }
}

/// An image under construction
pub struct ImageBuilder {
    data: Vec<u8>,
}

impl ImageBuilder {
    /// Empty image of `clusters` clusters after the partition origin, with a
    /// $MFT record at slot 0 mapping `MFT_CLUSTERS` clusters at `MFT_LCN`.
    pub fn new(clusters: u64) -> Self {
        let mut builder = Self {
            data: vec![0u8; (ORIGIN + clusters * CLUSTER) as usize],
        };
        let runs = RunList::new(vec![ClusterRun::new(MFT_LCN, MFT_CLUSTERS)]);
        let size = MFT_CLUSTERS as u64 * CLUSTER;
        builder.put_record(&RecordDef::file(0, 1, "$MFT", ROOT, Data::NonResident { runs, size }));
        builder
    }

    pub fn slot_position(slot: u64) -> u64 {
        ORIGIN + MFT_LCN as u64 * CLUSTER + slot * FILE_RECORD_SIZE as u64
    }

    pub fn put_record(&mut self, def: &RecordDef) -> &mut Self {
        let record = file_record(def);
        let at = Self::slot_position(def.slot) as usize;
        self.data[at..at + FILE_RECORD_SIZE].copy_from_slice(&record);
        self
    }

    /// FILE record at an arbitrary partition-relative byte offset, outside any slot
    pub fn put_record_at(&mut self, offset: u64, def: &RecordDef) -> &mut Self {
        let record = file_record(def);
        let at = (ORIGIN + offset) as usize;
        self.data[at..at + FILE_RECORD_SIZE].copy_from_slice(&record);
        self
    }

    /// INDX block at `lcn` listing `entries` under `owner`
    pub fn put_index_block(&mut self, lcn: u64, owner: FileReference, entries: &[(FileReference, &str, bool)]) -> &mut Self {
        let block = indx_block(owner, entries);
        let at = (ORIGIN + lcn * CLUSTER) as usize;
        self.data[at..at + INDEX_BLOCK_SIZE].copy_from_slice(&block);
        self
    }

    /// Raw bytes at `lcn`
    pub fn put_clusters(&mut self, lcn: u64, bytes: &[u8]) -> &mut Self {
        let at = (ORIGIN + lcn * CLUSTER) as usize;
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
        self
    }

    pub fn write(&self) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&self.data).unwrap();
        file.flush().unwrap();
        file
    }
}

/// Store paths of one pipeline run
pub struct PipelineRun {
    pub dir: TempDir,
    pub image: NamedTempFile,
}

impl PipelineRun {
    pub fn new(builder: &ImageBuilder) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            image: builder.write(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn disk(&self) -> DiskReader {
        DiskReader::open(self.image.path()).unwrap()
    }

    pub fn scan(&self) {
        let config = ScanConfig {
            window_size: 64 * 1024,
            show_progress: false,
            ..Default::default()
        };
        scanner::scan_to_store(self.image.path(), &self.path("scan.db"), &config).unwrap();
    }

    pub fn fill(&self) -> pipeline::FillStats {
        pipeline::run_fill(&self.disk(), &self.path("scan.db"), &self.path("filled.db"), &quiet()).unwrap()
    }

    pub fn fix_mft(&self) -> pipeline::FixMftStats {
        pipeline::run_fix_mft(&self.path("filled.db"), &self.path("assoc.db"), &quiet()).unwrap()
    }

    pub fn complete(&self) -> pipeline::CompleteStats {
        pipeline::run_complete(&self.disk(), &self.path("assoc.db"), &self.path("done.db"), &quiet()).unwrap()
    }

    pub fn make_filelist(&self) -> pipeline::FileListStats {
        pipeline::run_make_filelist(&self.path("done.db"), &self.path("files.db"), &quiet()).unwrap()
    }

    /// Every stage up to `complete`
    pub fn run_to_complete(&self) -> pipeline::CompleteStats {
        self.scan();
        self.fill();
        self.fix_mft();
        self.complete()
    }

    pub fn tree(&self) -> FileTree {
        FileTree::load(self.path("files.db")).unwrap()
    }
}

pub fn quiet() -> PipelineConfig {
    PipelineConfig {
        show_progress: false,
        ..Default::default()
    }
}

// ============================================================================
// Encoders
// ============================================================================

fn utf16(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

fn file_name_value(parent: FileReference, name: &str, directory: bool) -> Vec<u8> {
    let mut v = vec![0u8; FILE_NAME_HEADER_LEN];
    v[0..8].copy_from_slice(&parent.raw().to_le_bytes());
    // Modification time
    v[0x10..0x18].copy_from_slice(&132_000_000_000_000_000u64.to_le_bytes());
    if directory {
        v[0x38..0x3C].copy_from_slice(&file_attributes::DIRECTORY.to_le_bytes());
    }
    v[0x40] = name.encode_utf16().count() as u8;
    // Win32 namespace
    v[0x41] = 1;
    v.extend(utf16(name));
    v
}

fn resident_attr(kind: u32, value: &[u8]) -> Vec<u8> {
    let len = (24 + value.len() + 7) & !7;
    let mut a = vec![0u8; len];
    a[0..4].copy_from_slice(&kind.to_le_bytes());
    a[4..8].copy_from_slice(&(len as u32).to_le_bytes());
    a[16..20].copy_from_slice(&(value.len() as u32).to_le_bytes());
    a[20..22].copy_from_slice(&24u16.to_le_bytes());
    a[24..24 + value.len()].copy_from_slice(value);
    a
}

fn non_resident_attr(kind: u32, runs: &RunList, size: u64) -> Vec<u8> {
    let encoded = runs.encode();
    let len = (64 + encoded.len() + 7) & !7;
    let mut a = vec![0u8; len];
    a[0..4].copy_from_slice(&kind.to_le_bytes());
    a[4..8].copy_from_slice(&(len as u32).to_le_bytes());
    a[8] = 1;
    a[0x18..0x20].copy_from_slice(&((runs.total_clusters() - 1).max(0) as u64).to_le_bytes());
    a[0x20..0x22].copy_from_slice(&64u16.to_le_bytes());
    a[0x28..0x30].copy_from_slice(&(runs.total_clusters() as u64 * CLUSTER).to_le_bytes());
    a[0x30..0x38].copy_from_slice(&size.to_le_bytes());
    a[0x38..0x40].copy_from_slice(&size.to_le_bytes());
    a[64..64 + encoded.len()].copy_from_slice(&encoded);
    a
}

fn index_entry(child: FileReference, parent: FileReference, name: &str, directory: bool) -> Vec<u8> {
    let key = file_name_value(parent, name, directory);
    let len = (16 + key.len() + 7) & !7;
    let mut e = vec![0u8; len];
    e[0..8].copy_from_slice(&child.raw().to_le_bytes());
    e[8..10].copy_from_slice(&(len as u16).to_le_bytes());
    e[10..12].copy_from_slice(&(key.len() as u16).to_le_bytes());
    e[16..16 + key.len()].copy_from_slice(&key);
    e
}

fn last_entry() -> Vec<u8> {
    let mut e = vec![0u8; 16];
    e[8..10].copy_from_slice(&16u16.to_le_bytes());
    e[12..14].copy_from_slice(&INDEX_ENTRY_LAST.to_le_bytes());
    e
}

fn entry_list(owner: FileReference, entries: &[(FileReference, &str, bool)]) -> Vec<u8> {
    entries
        .iter()
        .flat_map(|&(child, name, directory)| index_entry(child, owner, name, directory))
        .chain(last_entry())
        .collect()
}

fn index_root_value(owner: FileReference, entries: &[(FileReference, &str, bool)]) -> Vec<u8> {
    let body = entry_list(owner, entries);
    let mut v = vec![0u8; 32];
    // Indexed attribute type ($FILE_NAME), collation, block size
    v[0..4].copy_from_slice(&0x30u32.to_le_bytes());
    v[4..8].copy_from_slice(&1u32.to_le_bytes());
    v[8..12].copy_from_slice(&(INDEX_BLOCK_SIZE as u32).to_le_bytes());
    v[12] = 1;
    // Node header
    v[16..20].copy_from_slice(&16u32.to_le_bytes());
    v[20..24].copy_from_slice(&((16 + body.len()) as u32).to_le_bytes());
    v[24..28].copy_from_slice(&((16 + body.len()) as u32).to_le_bytes());
    v.extend(body);
    v
}

fn indx_block(owner: FileReference, entries: &[(FileReference, &str, bool)]) -> Vec<u8> {
    let body = entry_list(owner, entries);
    let mut block = vec![0u8; INDEX_BLOCK_SIZE];
    block[0..4].copy_from_slice(b"INDX");
    // Entries start after the update sequence array (0x28 + 18 bytes)
    let first = 0x40 - INDX_HEADER_OFFSET;
    let node = &mut block[INDX_HEADER_OFFSET..];
    node[0..4].copy_from_slice(&(first as u32).to_le_bytes());
    node[4..8].copy_from_slice(&((first + body.len()) as u32).to_le_bytes());
    node[8..12].copy_from_slice(&((INDEX_BLOCK_SIZE - INDX_HEADER_OFFSET) as u32).to_le_bytes());
    block[0x40..0x40 + body.len()].copy_from_slice(&body);
    protect(&mut block, UpdateSequence { offset: 0x28, count: 9 }, 0x4242).unwrap();
    block
}

fn file_record(def: &RecordDef) -> Vec<u8> {
    let reference = def.reference();
    let mut attrs: Vec<Vec<u8>> = vec![resident_attr(0x30, &file_name_value(def.parent, &def.name, def.directory))];

    match &def.data {
        Data::None => {}
        Data::Resident(bytes) => attrs.push(resident_attr(0x80, bytes)),
        Data::NonResident { runs, size } => attrs.push(non_resident_attr(0x80, runs, *size)),
    }

    if def.directory {
        let entries: Vec<(FileReference, &str, bool)> = def
            .index_entries
            .iter()
            .map(|(child, name, directory)| (*child, name.as_str(), *directory))
            .collect();
        attrs.push(resident_attr(0x90, &index_root_value(reference, &entries)));
        if let Some(runs) = &def.index_allocation {
            attrs.push(non_resident_attr(0xA0, runs, runs.total_clusters() as u64 * CLUSTER));
        }
    }

    let mut r = vec![0u8; FILE_RECORD_SIZE];
    r[0..4].copy_from_slice(b"FILE");
    r[0x10..0x12].copy_from_slice(&def.sequence.to_le_bytes());
    r[0x12..0x14].copy_from_slice(&1u16.to_le_bytes());
    r[0x14..0x16].copy_from_slice(&0x38u16.to_le_bytes());
    let mut flags = MFT_RECORD_IN_USE;
    if def.directory {
        flags |= MFT_RECORD_IS_DIRECTORY;
    }
    r[0x16..0x18].copy_from_slice(&flags.to_le_bytes());
    r[0x2C..0x30].copy_from_slice(&(def.slot as u32).to_le_bytes());

    let mut offset = 0x38;
    for a in &attrs {
        r[offset..offset + a.len()].copy_from_slice(a);
        offset += a.len();
    }
    r[offset..offset + 4].copy_from_slice(&ATTRIBUTE_END_MARKER.to_le_bytes());
    r[0x18..0x1C].copy_from_slice(&((offset + 8) as u32).to_le_bytes());
    r[0x1C..0x20].copy_from_slice(&(FILE_RECORD_SIZE as u32).to_le_bytes());
    protect(&mut r, UpdateSequence { offset: 0x30, count: 3 }, 0x0101).unwrap();
    r
}
