//! NTFS structure decoding
//!
//! - On-disk headers and constants (`structs`)
//! - Update sequence fixup (`fixup`)
//! - Cluster run lists (`runlist`)
//! - FILE records and their attributes (`record`)
//! - Directory indexes (`index`)
//! - Raw device reads (`physical`)

pub mod fixup;
pub mod index;
pub mod physical;
pub mod record;
pub mod runlist;
pub mod structs;

// Re-export commonly used types
pub use index::{DirectoryEntry, IndexBlock};
pub use physical::DiskReader;
pub use record::{Attribute, AttributeBody, AttributeValue, FileRecord};
pub use runlist::{ClusterRun, RunList};
pub use structs::{AttributeType, FileNameAttribute, FileReference, FilenameNamespace};
