//! Partition Scanner
//!
//! Streams a raw device in fixed windows and reports every offset where a
//! record signature starts. The last `max signature length - 1` bytes of
//! each window are carried into the next one, so a signature split across
//! a window boundary is seen whole exactly once. Memory use is one window.

use crate::error::{Result, SalvageError};
use crate::logging;
use crate::state::{Signature, SignatureHit};
use crate::store::{Record, RecordWriter, StoreKind};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use regex::bytes::Regex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{Duration, Instant};

/// Default window: 100 MiB
pub const DEFAULT_WINDOW_SIZE: usize = 100 * 1024 * 1024;

// ============================================================================
// Scanner Configuration
// ============================================================================

/// Configuration for the scanner
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Signatures to look for
    pub signatures: Vec<Signature>,
    /// Bytes read per window (not counting the carried tail)
    pub window_size: usize,
    /// Show progress during scan
    pub show_progress: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            signatures: Signature::ALL.to_vec(),
            window_size: DEFAULT_WINDOW_SIZE,
            show_progress: true,
        }
    }
}

// ============================================================================
// Scan Result
// ============================================================================

/// Offsets found per signature, ascending
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub hits: BTreeMap<Signature, Vec<u64>>,
    pub bytes_scanned: u64,
    pub windows: u64,
    pub elapsed: Duration,
}

impl ScanResult {
    pub fn total_hits(&self) -> usize {
        self.hits.values().map(Vec::len).sum()
    }

    pub fn count(&self, signature: Signature) -> usize {
        self.hits.get(&signature).map_or(0, Vec::len)
    }

    /// All hits ordered by device position
    pub fn ordered_hits(&self) -> Vec<SignatureHit> {
        let mut hits: Vec<SignatureHit> = self
            .hits
            .iter()
            .flat_map(|(&signature, positions)| {
                positions
                    .iter()
                    .map(move |&position| SignatureHit { signature, position })
            })
            .collect();
        hits.sort_by_key(|h| (h.position, h.signature));
        hits
    }
}

// ============================================================================
// Partition Scanner
// ============================================================================

struct Matcher {
    signature: Signature,
    pattern: Regex,
    len: usize,
}

/// Windowed signature scanner over a device or any byte stream
pub struct PartitionScanner {
    config: ScanConfig,
    matchers: Vec<Matcher>,
}

impl PartitionScanner {
    pub fn new(config: ScanConfig) -> Result<Self> {
        if config.signatures.is_empty() {
            return Err(SalvageError::InvalidArgument("no signatures to scan for".into()));
        }

        let matchers = config
            .signatures
            .iter()
            .map(|&signature| {
                let pattern = byte_literal_pattern(signature.bytes())?;
                Ok(Matcher {
                    signature,
                    pattern,
                    len: signature.bytes().len(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let max_len = matchers.iter().map(|m| m.len).max().unwrap_or(1);
        if config.window_size < max_len {
            return Err(SalvageError::InvalidArgument(format!(
                "window of {} bytes is smaller than a signature",
                config.window_size
            )));
        }

        Ok(Self { config, matchers })
    }

    /// Scan a device or image file
    pub fn scan_path(&self, path: impl AsRef<Path>) -> Result<ScanResult> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        logging::separator(&format!("SCAN START: {}", path.display()));
        logging::info(
            "SCANNER",
            &format!(
                "Config: window={} bytes, signatures={:?}, device={} bytes",
                self.config.window_size, self.config.signatures, len
            ),
        );

        self.scan_reader(file, Some(len))
    }

    /// Scan any byte stream. `total_len` only sizes the progress bar.
    pub fn scan_reader<R: Read>(&self, mut reader: R, total_len: Option<u64>) -> Result<ScanResult> {
        let start_time = Instant::now();
        let carry = self.matchers.iter().map(|m| m.len).max().unwrap_or(1) - 1;
        let window = self.config.window_size;

        let pb = self.progress_bar(total_len);

        let mut hits: BTreeMap<Signature, Vec<u64>> =
            self.matchers.iter().map(|m| (m.signature, Vec::new())).collect();
        let mut buffer = vec![0u8; carry + window];
        // Bytes at the front of `buffer` carried over from the previous window
        let mut carried = 0usize;
        // Device offset of buffer[0]
        let mut base = 0u64;
        let mut windows = 0u64;

        loop {
            let read = fill_window(&mut reader, &mut buffer[carried..carried + window], base + carried as u64)?;
            if read == 0 {
                break;
            }
            windows += 1;

            let filled = &buffer[..carried + read];
            let found: Vec<(Signature, Vec<u64>)> = self
                .matchers
                .par_iter()
                .map(|m| {
                    let positions = m
                        .pattern
                        .find_iter(filled)
                        // Entirely inside the carried tail: reported by the previous window
                        .filter(|hit| hit.start() + m.len > carried)
                        .map(|hit| base + hit.start() as u64)
                        .collect();
                    (m.signature, positions)
                })
                .collect();

            for (signature, positions) in found {
                hits.entry(signature).or_default().extend(positions);
            }

            let end = base + filled.len() as u64;
            pb.set_position(end);
            pb.set_message(hit_summary(&hits));

            let keep = carry.min(filled.len());
            let tail_start = filled.len() - keep;
            buffer.copy_within(tail_start..tail_start + keep, 0);
            base = end - keep as u64;
            carried = keep;

            if read < window {
                break;
            }
        }

        for positions in hits.values_mut() {
            positions.sort_unstable();
            positions.dedup();
        }

        let result = ScanResult {
            bytes_scanned: base + carried as u64,
            windows,
            elapsed: start_time.elapsed(),
            hits,
        };

        logging::info(
            "SCANNER",
            &format!(
                "Scan complete: {} bytes, {} windows, {} ({:.2}s)",
                result.bytes_scanned,
                result.windows,
                hit_summary(&result.hits),
                result.elapsed.as_secs_f64()
            ),
        );
        pb.finish_with_message(format!("Complete: {}", hit_summary(&result.hits)));
        logging::flush();

        Ok(result)
    }

    fn progress_bar(&self, total_len: Option<u64>) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(total_len.unwrap_or(0));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    }
}

/// Scan a device for the given signatures with default settings
pub fn scan(path: impl AsRef<Path>, signatures: &[Signature]) -> Result<BTreeMap<Signature, Vec<u64>>> {
    let scanner = PartitionScanner::new(ScanConfig {
        signatures: signatures.to_vec(),
        ..Default::default()
    })?;
    Ok(scanner.scan_path(path)?.hits)
}

/// Scan a device and write every hit, in device order, to a scan store
pub fn scan_to_store(device: impl AsRef<Path>, output: &Path, config: &ScanConfig) -> Result<ScanResult> {
    let scanner = PartitionScanner::new(config.clone())?;
    let result = scanner.scan_path(device)?;

    let mut writer = RecordWriter::create(output, StoreKind::Scan)?;
    for hit in result.ordered_hits() {
        writer.append(&Record::Hit(hit))?;
    }
    let written = writer.close()?;
    logging::info("SCANNER", &format!("Wrote {} hits to {}", written, output.display()));

    Ok(result)
}

/// Regex matching exactly the given bytes, with Unicode off
fn byte_literal_pattern(bytes: &[u8]) -> Result<Regex> {
    let mut pattern = String::from("(?-u)");
    for byte in bytes {
        pattern.push_str(&format!("\\x{:02X}", byte));
    }
    Regex::new(&pattern).map_err(|e| SalvageError::InvalidArgument(format!("signature pattern: {}", e)))
}

/// Read until the slice is full or the stream ends
fn fill_window<R: Read>(reader: &mut R, buffer: &mut [u8], offset: u64) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(SalvageError::DeviceRead {
                    offset: offset + filled as u64,
                    len: buffer.len() - filled,
                    source,
                })
            }
        }
    }
    Ok(filled)
}

fn hit_summary(hits: &BTreeMap<Signature, Vec<u64>>) -> String {
    hits.iter()
        .map(|(signature, positions)| format!("{} {}", positions.len(), signature))
        .collect::<Vec<_>>()
        .join(", ")
}
