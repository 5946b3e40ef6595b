//! Error types for ntfs-salvage
//!
//! One error enum for the whole pipeline. Decode-level failures are
//! recoverable (a stage counts them and moves on), I/O and store format
//! failures abort the current operation.

use thiserror::Error;

/// Main error type for salvage operations
#[derive(Error, Debug)]
pub enum SalvageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read {len} bytes at device offset {offset}: {source}")]
    DeviceRead {
        offset: u64,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed record at offset {position}: {reason}")]
    MalformedRecord { position: u64, reason: String },

    #[error("Unresolvable reference for record at offset {position}: {reason}")]
    UnresolvableReference { position: u64, reason: String },

    #[error("Record store format mismatch: {0}")]
    FormatMismatch(String),

    #[error("Record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Path not found in file list: {0}")]
    PathNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type alias for salvage operations
pub type Result<T> = std::result::Result<T, SalvageError>;

impl SalvageError {
    /// Shorthand for a structural decode failure
    pub fn malformed(position: u64, reason: impl Into<String>) -> Self {
        SalvageError::MalformedRecord {
            position,
            reason: reason.into(),
        }
    }

    /// Shorthand for a failed record-to-MFT or record-to-parent relation
    pub fn unresolvable(position: u64, reason: impl Into<String>) -> Self {
        SalvageError::UnresolvableReference {
            position,
            reason: reason.into(),
        }
    }

    /// Check if this error is recoverable (the stage can skip the record and continue)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SalvageError::MalformedRecord { .. } | SalvageError::UnresolvableReference { .. }
        )
    }

    /// Re-tag a decode error with the absolute position of the record it came from.
    ///
    /// The structure decoder works on detached buffers and reports buffer-relative
    /// offsets; stages know where the buffer was read from.
    pub fn at_position(self, position: u64) -> Self {
        match self {
            SalvageError::MalformedRecord { reason, .. } => {
                SalvageError::MalformedRecord { position, reason }
            }
            SalvageError::UnresolvableReference { reason, .. } => {
                SalvageError::UnresolvableReference { position, reason }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(SalvageError::malformed(0, "bad").is_recoverable());
        assert!(SalvageError::unresolvable(0, "bad").is_recoverable());
        assert!(!SalvageError::FormatMismatch("x".into()).is_recoverable());
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(!SalvageError::from(io).is_recoverable());
    }

    #[test]
    fn test_at_position_retags() {
        let err = SalvageError::malformed(12, "attribute past end").at_position(4096);
        match err {
            SalvageError::MalformedRecord { position, reason } => {
                assert_eq!(position, 4096);
                assert_eq!(reason, "attribute past end");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
