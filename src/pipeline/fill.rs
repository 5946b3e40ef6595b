//! Fill stage: decode the record behind every scanner hit

use super::{open_input, progress_bar, stream, PipelineConfig};
use crate::error::Result;
use crate::logging;
use crate::ntfs::physical::DiskReader;
use crate::ntfs::structs::SECTOR_SIZE;
use crate::state::{FileState, IndexState, Signature};
use crate::store::{Record, RecordWriter, StoreKind};
use std::collections::HashSet;
use std::path::Path;

const MODULE: &str = "FILL";

/// Counters of one `fill` run
#[derive(Debug, Clone, Default)]
pub struct FillStats {
    pub hits: u64,
    pub files: u64,
    pub indexes: u64,
    pub unaligned: u64,
    pub duplicates: u64,
    pub truncated: u64,
    pub malformed: u64,
    pub torn_sectors: u64,
}

/// Read the FILE record or INDX block at every hit of a scan store
pub fn run_fill(disk: &DiskReader, input: &Path, output: &Path, config: &PipelineConfig) -> Result<FillStats> {
    logging::separator("FILL");
    let store = open_input(input, StoreKind::Scan)?;
    let mut writer = RecordWriter::create(output, StoreKind::Filled)?;
    let mut stats = FillStats::default();
    let mut seen: HashSet<(Signature, u64)> = HashSet::new();

    let pb = progress_bar(config, store.len(), "Decoding records");

    for item in stream(&store, config) {
        let item = item?;
        pb.inc(1);

        let hit = match item.record {
            Record::Hit(hit) => hit,
            other => {
                logging::warn(MODULE, &format!("Skipping {} record in scan store", other.kind_name()));
                continue;
            }
        };
        stats.hits += 1;

        if !config.allow_unaligned && hit.position % SECTOR_SIZE as u64 != 0 {
            stats.unaligned += 1;
            continue;
        }
        if !seen.insert((hit.signature, hit.position)) {
            stats.duplicates += 1;
            continue;
        }
        if hit.position + hit.signature.record_size() as u64 > disk.len() {
            stats.truncated += 1;
            logging::warn(MODULE, &format!("{} at {} runs past the device end", hit.signature, hit.position));
            continue;
        }

        let decoded = match hit.signature {
            Signature::File => disk.read_file_record(hit.position).map(|rec| {
                stats.torn_sectors += rec.torn_sectors as u64;
                Record::File(FileState::from_record(hit.position, rec))
            }),
            Signature::Indx => disk.read_index_block(hit.position).map(|block| {
                stats.torn_sectors += block.torn_sectors as u64;
                Record::Index(IndexState::from_block(hit.position, block))
            }),
        };

        match decoded {
            Ok(record) => {
                match &record {
                    Record::File(_) => stats.files += 1,
                    _ => stats.indexes += 1,
                }
                writer.append(&record)?;
            }
            Err(e) if e.is_recoverable() => {
                stats.malformed += 1;
                logging::warn(MODULE, &e.to_string());
            }
            Err(e) => return Err(e),
        }

        if stats.hits % 4096 == 0 {
            pb.set_message(format!("{} files, {} indexes", stats.files, stats.indexes));
        }
    }

    writer.close()?;
    pb.finish_with_message(format!("{} files, {} indexes", stats.files, stats.indexes));

    logging::info(
        MODULE,
        &format!(
            "Fill complete: hits={} files={} indexes={} unaligned={} duplicates={} truncated={} malformed={} torn_sectors={}",
            stats.hits,
            stats.files,
            stats.indexes,
            stats.unaligned,
            stats.duplicates,
            stats.truncated,
            stats.malformed,
            stats.torn_sectors
        ),
    );
    logging::flush();
    Ok(stats)
}
