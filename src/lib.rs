//! ntfs-salvage - recover files from damaged NTFS volumes
//!
//! Works without a usable boot sector or $MFT: the raw device is scanned for
//! FILE and INDX signatures, every hit is decoded, records are tied back to
//! the MFT they belong to, and the survivors are assembled into a browsable
//! file tree whose data can be copied off the device.
//!
//! # Pipeline
//!
//! ```text
//! scan -> fill -> fix-mft -> complete -> make-filelist -> {ls, cp, mv, mkdir, rm}
//! ```
//!
//! Each stage reads one record store and writes the next (see [`store`]).
//!
//! # Example
//!
//! ```no_run
//! use ntfs_salvage::pipeline::{self, PipelineConfig};
//! use ntfs_salvage::{DiskReader, FileTree};
//! use std::path::Path;
//!
//! fn main() -> ntfs_salvage::Result<()> {
//!     let config = PipelineConfig::default();
//!     let disk = DiskReader::open("/dev/sdb")?;
//!
//!     ntfs_salvage::scanner::scan_to_store("/dev/sdb", Path::new("scan.db"), &Default::default())?;
//!     pipeline::run_fill(&disk, Path::new("scan.db"), Path::new("filled.db"), &config)?;
//!     pipeline::run_fix_mft(Path::new("filled.db"), Path::new("assoc.db"), &config)?;
//!     pipeline::run_complete(&disk, Path::new("assoc.db"), Path::new("done.db"), &config)?;
//!     pipeline::run_make_filelist(Path::new("done.db"), Path::new("files.db"), &config)?;
//!
//!     let tree = FileTree::load("files.db")?;
//!     tree.copy_out(&disk, "/mft0/Users", Path::new("recovered"))?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod file_tree;
pub mod logging;
pub mod ntfs;
pub mod pipeline;
pub mod queue;
pub mod scanner;
pub mod state;
pub mod store;

// Re-export main types
pub use error::{Result, SalvageError};
pub use file_tree::{CopyStats, Extent, FileNode, FileTree, NodeKind, TreeStats};
pub use ntfs::DiskReader;
pub use pipeline::PipelineConfig;
pub use scanner::{PartitionScanner, ScanConfig, ScanResult};
pub use state::{FileState, IndexState, MftState, Signature, SignatureHit};
pub use store::{Record, RecordStore, RecordWriter, StoreKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Format bytes as human-readable string
pub fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Format a Windows FILETIME as a human-readable date string
pub fn format_filetime(filetime: u64) -> String {
    if filetime == 0 {
        return "-".to_string();
    }
    use ntfs::structs::filetime_to_datetime;
    filetime_to_datetime(filetime).format("%Y-%m-%d %H:%M:%S").to_string()
}
