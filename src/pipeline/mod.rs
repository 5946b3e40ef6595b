//! Recovery pipeline stages
//!
//! `fill` -> `fix-mft` -> `complete` -> `make-filelist`. Every stage reads
//! one record store through the background queue and writes the next one.
//! Stages are best-effort: structurally broken records are counted and
//! skipped, device and store failures abort the stage.

pub mod complete;
pub mod filelist;
pub mod fill;
pub mod fix_mft;

pub use complete::{run_complete, CompleteStats};
pub use filelist::{run_make_filelist, FileListStats};
pub use fill::{run_fill, FillStats};
pub use fix_mft::{run_fix_mft, FixMftStats};

use crate::error::Result;
use crate::queue::{Subscriber, DEFAULT_QUEUE_CAPACITY};
use crate::store::{self, RecordStore, StoreKind, StoredRecord};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

// ============================================================================
// Pipeline Configuration
// ============================================================================

/// Settings shared by the stages
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Show progress bars
    pub show_progress: bool,
    /// Records in flight between the store decoder and the stage
    pub queue_capacity: usize,
    /// `fill`: also decode hits that are not sector aligned
    pub allow_unaligned: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            show_progress: true,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            allow_unaligned: false,
        }
    }
}

/// Open a stage input, insisting on the producing stage
pub(crate) fn open_input(path: &Path, kind: StoreKind) -> Result<Arc<RecordStore>> {
    Ok(Arc::new(RecordStore::open_kind(path, kind)?))
}

/// Stream a whole store through the background queue
pub(crate) fn stream(input: &Arc<RecordStore>, config: &PipelineConfig) -> Subscriber<Result<StoredRecord>> {
    store::subscribe(input.clone(), 0, config.queue_capacity)
}

/// Record-count progress bar for one pass
pub(crate) fn progress_bar(config: &PipelineConfig, len: usize, message: &str) -> ProgressBar {
    if !config.show_progress {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    pb
}

// ============================================================================
// Extent Map
// ============================================================================

/// Non-overlapping byte ranges of the device, each tagged with a value.
///
/// Ranges are inserted first-claimant-wins: the part of a new range that is
/// already covered is not inserted, and its size is reported back.
#[derive(Debug, Clone)]
pub struct ExtentMap<V> {
    ranges: BTreeMap<u64, (u64, V)>,
}

impl<V: Clone> ExtentMap<V> {
    pub fn new() -> Self {
        Self {
            ranges: BTreeMap::new(),
        }
    }

    /// Claim `[start, end)`. Returns the number of bytes that were already claimed.
    pub fn insert(&mut self, start: u64, end: u64, value: V) -> u64 {
        if start >= end {
            return 0;
        }

        // Existing ranges touching [start, end), in order
        let mut covered: Vec<(u64, u64)> = Vec::new();
        if let Some((&s, &(e, _))) = self.ranges.range(..start).next_back() {
            if e > start {
                covered.push((s, e));
            }
        }
        covered.extend(
            self.ranges
                .range(start..end)
                .map(|(&s, &(e, _))| (s, e)),
        );

        let mut overlap = 0;
        let mut cursor = start;
        for (s, e) in covered {
            let (s, e) = (s.max(start), e.min(end));
            if s > cursor {
                self.ranges.insert(cursor, (s, value.clone()));
            }
            overlap += e - s;
            cursor = cursor.max(e);
        }
        if cursor < end {
            self.ranges.insert(cursor, (end, value));
        }

        overlap
    }

    /// Value of the range containing `position`
    pub fn get(&self, position: u64) -> Option<&V> {
        self.ranges
            .range(..=position)
            .next_back()
            .filter(|(_, (end, _))| position < *end)
            .map(|(_, (_, value))| value)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl<V: Clone> Default for ExtentMap<V> {
    fn default() -> Self {
        Self::new()
    }
}
