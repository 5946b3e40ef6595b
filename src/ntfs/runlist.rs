//! Cluster run lists of non-resident attributes
//!
//! Each run starts with a header byte: the low nibble is the width of the
//! cluster count, the high nibble the width of the signed LCN delta. Both
//! widths change from run to run. A zero-width delta marks a sparse run.

use crate::error::{Result, SalvageError};
use crate::ntfs::structs::CLUSTER_SIZE;
use serde::{Deserialize, Serialize};

/// One contiguous (or sparse) allocation range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRun {
    /// Logical cluster number of the first cluster (0 for sparse runs)
    pub start: i64,
    /// Length in clusters
    pub count: i64,
    pub is_sparse: bool,
}

impl ClusterRun {
    pub fn new(start: i64, count: i64) -> Self {
        Self { start, count, is_sparse: false }
    }

    pub fn sparse(count: i64) -> Self {
        Self { start: 0, count, is_sparse: true }
    }

    /// Length in bytes; `None` when a damaged count does not fit in 64 bits
    pub fn byte_len(&self) -> Option<u64> {
        u64::try_from(self.count).ok()?.checked_mul(CLUSTER_SIZE)
    }

    /// Does this run map the given LCN?
    pub fn contains_lcn(&self, lcn: i64) -> bool {
        !self.is_sparse && lcn >= self.start && lcn - self.start < self.count
    }
}

/// Ordered runs of one attribute
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunList {
    runs: Vec<ClusterRun>,
}

impl RunList {
    pub fn new(runs: Vec<ClusterRun>) -> Self {
        Self { runs }
    }

    /// Decode a run list. Stops at the zero header byte or at the end of `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut runs = Vec::new();
        let mut pos = 0;
        let mut current_lcn: i64 = 0;

        while pos < data.len() {
            let header = data[pos];
            if header == 0 {
                break;
            }

            let count_width = (header & 0x0F) as usize;
            let offset_width = (header >> 4) as usize;

            if count_width == 0 || count_width > 8 || offset_width > 8 {
                return Err(SalvageError::malformed(
                    pos as u64,
                    format!("invalid run header 0x{:02X}", header),
                ));
            }

            pos += 1;
            if pos + count_width + offset_width > data.len() {
                return Err(SalvageError::malformed(pos as u64, "run extends past attribute"));
            }

            let count = read_unsigned(&data[pos..pos + count_width]);
            if count == 0 || count > i64::MAX as u64 {
                return Err(SalvageError::malformed(
                    pos as u64,
                    format!("invalid run length {}", count),
                ));
            }
            pos += count_width;

            if offset_width == 0 {
                runs.push(ClusterRun::sparse(count as i64));
                continue;
            }

            let delta = read_signed(&data[pos..pos + offset_width]);
            pos += offset_width;

            current_lcn = current_lcn
                .checked_add(delta)
                .filter(|lcn| *lcn >= 0)
                .ok_or_else(|| {
                    SalvageError::malformed(pos as u64, format!("run LCN delta {} out of range", delta))
                })?;

            runs.push(ClusterRun::new(current_lcn, count as i64));
        }

        Ok(Self { runs })
    }

    /// Encode with minimal widths, terminated by a zero byte
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut previous_lcn: i64 = 0;

        for run in &self.runs {
            let count = run.count as u64;
            let count_width = unsigned_width(count);

            if run.is_sparse {
                out.push(count_width as u8);
                out.extend_from_slice(&count.to_le_bytes()[..count_width]);
                continue;
            }

            let delta = run.start - previous_lcn;
            let offset_width = signed_width(delta);
            out.push(((offset_width as u8) << 4) | count_width as u8);
            out.extend_from_slice(&count.to_le_bytes()[..count_width]);
            out.extend_from_slice(&delta.to_le_bytes()[..offset_width]);
            previous_lcn = run.start;
        }

        out.push(0);
        out
    }

    pub fn runs(&self) -> &[ClusterRun] {
        &self.runs
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn first(&self) -> Option<&ClusterRun> {
        self.runs.first()
    }

    /// Total virtual clusters, sparse runs included
    pub fn total_clusters(&self) -> i64 {
        self.runs.iter().fold(0i64, |total, r| total.saturating_add(r.count))
    }

    /// Total length in bytes, sparse runs included; `None` on overflow
    pub fn byte_len(&self) -> Option<u64> {
        self.runs
            .iter()
            .try_fold(0u64, |total, run| total.checked_add(run.byte_len()?))
    }

    /// Runs paired with the VCN each one starts at
    pub fn with_vcns(&self) -> impl Iterator<Item = (i64, &ClusterRun)> + '_ {
        let mut vcn = 0i64;
        self.runs.iter().map(move |run| {
            let base = vcn;
            vcn = vcn.saturating_add(run.count);
            (base, run)
        })
    }

    /// VCN at which the given LCN is mapped, if any run covers it
    pub fn vcn_of_lcn(&self, lcn: i64) -> Option<i64> {
        self.with_vcns()
            .find(|(_, run)| run.contains_lcn(lcn))
            .map(|(base, run)| base + (lcn - run.start))
    }

    /// LCN backing the given VCN; `None` for sparse ranges or past the end
    pub fn lcn_of_vcn(&self, vcn: i64) -> Option<i64> {
        self.with_vcns()
            .find(|(base, run)| vcn >= *base && vcn - base < run.count)
            .and_then(|(base, run)| (!run.is_sparse).then(|| run.start + (vcn - base)))
    }
}

/// Read little-endian bytes as unsigned integer
fn read_unsigned(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= (byte as u64) << (i * 8);
    }
    value
}

/// Read little-endian bytes as sign-extended integer
fn read_signed(bytes: &[u8]) -> i64 {
    let value = read_unsigned(bytes) as i64;
    let bits = bytes.len() * 8;
    if bits < 64 && (value & (1 << (bits - 1))) != 0 {
        value | !((1i64 << bits) - 1)
    } else {
        value
    }
}

fn unsigned_width(value: u64) -> usize {
    (1..=8).find(|&w| w == 8 || value < (1u64 << (w * 8))).unwrap_or(8)
}

fn signed_width(value: i64) -> usize {
    (1..=8)
        .find(|&w| {
            if w == 8 {
                return true;
            }
            let bits = w * 8;
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            value >= min && value <= max
        })
        .unwrap_or(8)
}
